//! Play history: what played, from which source, when.
//!
//! Recording applies a duplicate-suppression window: the same
//! (source, title, artist) within 30 seconds is a `Conflict`, which
//! keeps retried identifications and rapid pause/play cycles from
//! spamming the log.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::SqlitePool;

use crate::error::{Error, Result};

/// Repeated plays of the same track within this window are suppressed.
pub const DUPLICATE_WINDOW_SECONDS: i64 = 30;

/// Which sources history entries can come from. `spotify` is accepted as
/// an alias for the streaming service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum HistorySource {
    Vinyl,
    Radio,
    File,
    Streaming,
}

impl HistorySource {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vinyl" => Ok(Self::Vinyl),
            "radio" => Ok(Self::Radio),
            "file" => Ok(Self::File),
            "streaming" | "spotify" => Ok(Self::Streaming),
            other => Err(Error::invalid_argument(format!(
                "unknown history source: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vinyl => "Vinyl",
            Self::Radio => "Radio",
            Self::File => "File",
            Self::Streaming => "Streaming",
        }
    }
}

/// A stored history entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub source: String,
    pub metadata_source: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_seconds: Option<f64>,
    pub played_at: DateTime<Utc>,
}

/// A record request.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub source: HistorySource,
    pub metadata_source: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// Aggregate statistics for the control surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryStatistics {
    pub total_entries: i64,
    pub entries_today: i64,
    pub distinct_artists: i64,
    pub by_source: Vec<(String, i64)>,
}

type Row = (
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<f64>,
    String,
);

fn entry_from_row(row: Row) -> HistoryEntry {
    let (id, source, metadata_source, title, artist, album, duration_seconds, played_at) = row;
    HistoryEntry {
        id,
        source,
        metadata_source,
        title,
        artist,
        album,
        duration_seconds,
        played_at: DateTime::parse_from_rfc3339(&played_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    }
}

const SELECT: &str = "SELECT id, source, metadata_source, title, artist, album, duration_seconds, played_at FROM play_history";

/// Record a play. Fails with `Conflict` when the same source/title/artist
/// was recorded within the suppression window.
pub async fn record(pool: &SqlitePool, record: &HistoryRecord) -> Result<HistoryEntry> {
    let now = Utc::now();
    let window_start = now - ChronoDuration::seconds(DUPLICATE_WINDOW_SECONDS);

    let duplicate: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM play_history
         WHERE source = ? AND title IS ? AND artist IS ? AND played_at >= ?
         ORDER BY played_at DESC LIMIT 1",
    )
    .bind(record.source.as_str())
    .bind(&record.title)
    .bind(&record.artist)
    .bind(window_start.to_rfc3339())
    .fetch_optional(pool)
    .await
    .map_err(Error::from)?;

    if duplicate.is_some() {
        return Err(Error::conflict(format!(
            "same track recorded within the last {DUPLICATE_WINDOW_SECONDS}s"
        )));
    }

    let result = sqlx::query(
        "INSERT INTO play_history (source, metadata_source, title, artist, album, duration_seconds, played_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.source.as_str())
    .bind(&record.metadata_source)
    .bind(&record.title)
    .bind(&record.artist)
    .bind(&record.album)
    .bind(record.duration_seconds)
    .bind(now.to_rfc3339())
    .execute(pool)
    .await
    .map_err(Error::from)?;

    Ok(HistoryEntry {
        id: result.last_insert_rowid(),
        source: record.source.as_str().to_string(),
        metadata_source: record.metadata_source.clone(),
        title: record.title.clone(),
        artist: record.artist.clone(),
        album: record.album.clone(),
        duration_seconds: record.duration_seconds,
        played_at: now,
    })
}

/// Most recent entries, newest first.
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<HistoryEntry>> {
    let rows: Vec<Row> = sqlx::query_as(&format!("{SELECT} ORDER BY played_at DESC LIMIT ?"))
        .bind(limit.clamp(1, 1000))
        .fetch_all(pool)
        .await
        .map_err(Error::from)?;
    Ok(rows.into_iter().map(entry_from_row).collect())
}

/// Entries since local midnight (UTC day).
pub async fn list_today(pool: &SqlitePool) -> Result<Vec<HistoryEntry>> {
    let midnight = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    list_range(pool, midnight, Utc::now()).await
}

/// Entries in [from, to], newest first.
pub async fn list_range(
    pool: &SqlitePool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<HistoryEntry>> {
    if from > to {
        return Err(Error::invalid_argument("range start is after range end"));
    }
    let rows: Vec<Row> = sqlx::query_as(&format!(
        "{SELECT} WHERE played_at >= ? AND played_at <= ? ORDER BY played_at DESC"
    ))
    .bind(from.to_rfc3339())
    .bind(to.to_rfc3339())
    .fetch_all(pool)
    .await
    .map_err(Error::from)?;
    Ok(rows.into_iter().map(entry_from_row).collect())
}

/// Entries from one source, newest first.
pub async fn list_by_source(pool: &SqlitePool, source: HistorySource) -> Result<Vec<HistoryEntry>> {
    let rows: Vec<Row> = sqlx::query_as(&format!(
        "{SELECT} WHERE source = ? ORDER BY played_at DESC LIMIT 500"
    ))
    .bind(source.as_str())
    .fetch_all(pool)
    .await
    .map_err(Error::from)?;
    Ok(rows.into_iter().map(entry_from_row).collect())
}

/// Aggregate statistics.
pub async fn statistics(pool: &SqlitePool) -> Result<HistoryStatistics> {
    let (total_entries,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM play_history")
        .fetch_one(pool)
        .await
        .map_err(Error::from)?;

    let midnight = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    let (entries_today,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM play_history WHERE played_at >= ?")
            .bind(midnight.to_rfc3339())
            .fetch_one(pool)
            .await
            .map_err(Error::from)?;

    let (distinct_artists,): (i64,) = sqlx::query_as(
        "SELECT COUNT(DISTINCT artist) FROM play_history WHERE artist IS NOT NULL",
    )
    .fetch_one(pool)
    .await
    .map_err(Error::from)?;

    let by_source: Vec<(String, i64)> =
        sqlx::query_as("SELECT source, COUNT(*) FROM play_history GROUP BY source")
            .fetch_all(pool)
            .await
            .map_err(Error::from)?;

    Ok(HistoryStatistics {
        total_entries,
        entries_today,
        distinct_artists,
        by_source,
    })
}

/// Delete one entry by id.
pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM play_history WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(Error::from)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("history entry {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::temp_db;

    fn vinyl_track(title: &str) -> HistoryRecord {
        HistoryRecord {
            source: HistorySource::Vinyl,
            metadata_source: Some("Fingerprinting".to_string()),
            title: Some(title.to_string()),
            artist: Some("Artist".to_string()),
            album: None,
            duration_seconds: Some(214.0),
        }
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let (pool, _dir) = temp_db().await;
        record(&pool, &vinyl_track("Side A")).await.unwrap();

        let recent = list_recent(&pool, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].title.as_deref(), Some("Side A"));
        assert_eq!(recent[0].source, "Vinyl");

        let today = list_today(&pool).await.unwrap();
        assert_eq!(today.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_suppression_window() {
        let (pool, _dir) = temp_db().await;
        record(&pool, &vinyl_track("Same Song")).await.unwrap();

        let err = record(&pool, &vinyl_track("Same Song")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // A different track is fine immediately
        record(&pool, &vinyl_track("Other Song")).await.unwrap();
    }

    #[tokio::test]
    async fn test_filter_by_source() {
        let (pool, _dir) = temp_db().await;
        record(&pool, &vinyl_track("A")).await.unwrap();
        record(
            &pool,
            &HistoryRecord {
                source: HistorySource::Radio,
                metadata_source: None,
                title: Some("B".to_string()),
                artist: None,
                album: None,
                duration_seconds: None,
            },
        )
        .await
        .unwrap();

        let vinyl = list_by_source(&pool, HistorySource::Vinyl).await.unwrap();
        assert_eq!(vinyl.len(), 1);
        let radio = list_by_source(&pool, HistorySource::Radio).await.unwrap();
        assert_eq!(radio.len(), 1);
    }

    #[tokio::test]
    async fn test_statistics_and_delete() {
        let (pool, _dir) = temp_db().await;
        let entry = record(&pool, &vinyl_track("A")).await.unwrap();
        record(&pool, &vinyl_track("B")).await.unwrap();

        let stats = statistics(&pool).await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.entries_today, 2);
        assert_eq!(stats.distinct_artists, 1);
        assert_eq!(stats.by_source, vec![("Vinyl".to_string(), 2)]);

        delete(&pool, entry.id).await.unwrap();
        assert_eq!(statistics(&pool).await.unwrap().total_entries, 1);
        assert_eq!(delete(&pool, entry.id).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_source_parsing() {
        assert_eq!(HistorySource::parse("spotify").unwrap(), HistorySource::Streaming);
        assert_eq!(
            HistorySource::parse("tape").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}
