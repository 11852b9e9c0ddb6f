//! Persisted radio presets.
//!
//! A preset is addressed by (band, frequency): creating a second preset
//! on the same station is a `Conflict` regardless of name.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

use crate::error::{Error, Result};
use crate::source::radio::{Band, format_frequency};

/// A stored preset.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RadioPreset {
    pub id: String,
    pub name: String,
    pub band: Band,
    pub frequency_hz: u64,
    pub created_at: DateTime<Utc>,
}

type Row = (String, String, String, i64, String);

fn preset_from_row(row: Row) -> Result<RadioPreset> {
    let (id, name, band, frequency, created_at) = row;
    Ok(RadioPreset {
        id,
        name,
        band: Band::parse(&band)?,
        frequency_hz: frequency.max(0) as u64,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Create a preset. The default name is "<band> - <frequency>".
pub async fn create(
    pool: &SqlitePool,
    name: Option<String>,
    band: Band,
    frequency_hz: u64,
) -> Result<RadioPreset> {
    if frequency_hz == 0 {
        return Err(Error::invalid_argument("frequency must be > 0"));
    }

    let preset = RadioPreset {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| {
            format!("{} - {}", band.as_str(), format_frequency(frequency_hz, band))
        }),
        band,
        frequency_hz,
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO radio_presets (id, name, band, frequency, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&preset.id)
    .bind(&preset.name)
    .bind(preset.band.as_str())
    .bind(preset.frequency_hz as i64)
    .bind(preset.created_at.to_rfc3339())
    .execute(pool)
    .await
    .map_err(|e| match Error::from(e) {
        Error::Conflict(_) => Error::conflict(format!(
            "a preset for {} {} already exists",
            band.as_str(),
            format_frequency(frequency_hz, band)
        )),
        other => other,
    })?;

    Ok(preset)
}

/// All presets, ordered by band then frequency.
pub async fn list(pool: &SqlitePool) -> Result<Vec<RadioPreset>> {
    let rows: Vec<Row> = sqlx::query_as(
        "SELECT id, name, band, frequency, created_at FROM radio_presets ORDER BY band, frequency",
    )
    .fetch_all(pool)
    .await
    .map_err(Error::from)?;
    rows.into_iter().map(preset_from_row).collect()
}

/// Delete a preset by id.
pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM radio_presets WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(Error::from)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("preset {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::temp_db;

    #[tokio::test]
    async fn test_create_conflict_delete_create() {
        let (pool, _dir) = temp_db().await;

        let first = create(&pool, None, Band::Fm, 101_500_000).await.unwrap();
        assert_eq!(first.name, "FM - 101.5 MHz");

        // Same (band, frequency): conflict, regardless of name
        let err = create(&pool, Some("Duplicate".to_string()), Band::Fm, 101_500_000)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // Same frequency on another band is a different station
        create(&pool, None, Band::Vhf, 101_500_000).await.unwrap();

        delete(&pool, &first.id).await.unwrap();
        create(&pool, None, Band::Fm, 101_500_000).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_frequency_rejected() {
        let (pool, _dir) = temp_db().await;
        let err = create(&pool, None, Band::Am, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_list_round_trips() {
        let (pool, _dir) = temp_db().await;
        create(&pool, Some("Jazz FM".to_string()), Band::Fm, 89_100_000)
            .await
            .unwrap();
        create(&pool, None, Band::Am, 1_000_000).await.unwrap();

        let presets = list(&pool).await.unwrap();
        assert_eq!(presets.len(), 2);
        assert_eq!(presets[0].band, Band::Am);
        assert_eq!(presets[1].name, "Jazz FM");
        assert_eq!(presets[1].frequency_hz, 89_100_000);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (pool, _dir) = temp_db().await;
        let err = delete(&pool, "nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
