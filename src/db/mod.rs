//! Persistence: SQLite via SQLx.
//!
//! Three concerns live here: per-source playback preferences (restored
//! on the next initialize), radio presets and the play history. All of
//! it is embedded, migrated at startup and safe to delete (the appliance
//! regenerates an empty database).

pub mod history;
pub mod presets;

use std::collections::HashMap;

use chrono::Utc;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::source::queue::RepeatMode;

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "auricle.db";

/// Build a SQLite database URL from an optional path.
pub fn db_url(path: Option<&std::path::Path>) -> String {
    match path {
        Some(p) => format!("sqlite:{}", p.display()),
        None => format!("sqlite:{}", DEFAULT_DB_NAME),
    }
}

/// Initialize the database connection pool and run migrations.
///
/// Creates the database file if it doesn't exist, establishes a
/// connection pool with up to 5 connections, and runs all pending
/// migrations.
pub async fn init_db(db_url: &str) -> Result<SqlitePool, sqlx::Error> {
    if !sqlx::Sqlite::database_exists(db_url).await.unwrap_or(false) {
        sqlx::Sqlite::create_database(db_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Persisted per-source playback preferences.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePrefs {
    pub source_id: String,
    /// Relative path / identifier of the last played item
    pub last_played: Option<String>,
    pub position_ms: u64,
    pub shuffle: bool,
    pub repeat: RepeatMode,
}

/// Load every stored preference row, keyed by source id.
pub async fn load_source_prefs(
    pool: &SqlitePool,
) -> Result<HashMap<String, SourcePrefs>, sqlx::Error> {
    let rows: Vec<(String, Option<String>, i64, i64, String)> = sqlx::query_as(
        "SELECT source_id, last_played, position_ms, shuffle, repeat FROM source_prefs",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(source_id, last_played, position_ms, shuffle, repeat)| {
            let prefs = SourcePrefs {
                source_id: source_id.clone(),
                last_played,
                position_ms: position_ms.max(0) as u64,
                shuffle: shuffle != 0,
                repeat: RepeatMode::parse(&repeat).unwrap_or_default(),
            };
            (source_id, prefs)
        })
        .collect())
}

/// Upsert one preference row.
pub async fn save_source_prefs(pool: &SqlitePool, prefs: &SourcePrefs) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO source_prefs (source_id, last_played, position_ms, shuffle, repeat, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(source_id) DO UPDATE SET
           last_played = excluded.last_played,
           position_ms = excluded.position_ms,
           shuffle = excluded.shuffle,
           repeat = excluded.repeat,
           updated_at = excluded.updated_at",
    )
    .bind(&prefs.source_id)
    .bind(&prefs.last_played)
    .bind(prefs.position_ms as i64)
    .bind(prefs.shuffle as i64)
    .bind(prefs.repeat.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_db;

    #[tokio::test]
    async fn test_prefs_round_trip() {
        let (pool, _dir) = temp_db().await;

        let prefs = SourcePrefs {
            source_id: "file-primary".to_string(),
            last_played: Some("albums/x/01.flac".to_string()),
            position_ms: 93_500,
            shuffle: true,
            repeat: RepeatMode::All,
        };
        save_source_prefs(&pool, &prefs).await.unwrap();

        let loaded = load_source_prefs(&pool).await.unwrap();
        assert_eq!(loaded.get("file-primary"), Some(&prefs));
    }

    #[tokio::test]
    async fn test_prefs_upsert_replaces() {
        let (pool, _dir) = temp_db().await;

        let mut prefs = SourcePrefs {
            source_id: "file-primary".to_string(),
            last_played: None,
            position_ms: 0,
            shuffle: false,
            repeat: RepeatMode::Off,
        };
        save_source_prefs(&pool, &prefs).await.unwrap();

        prefs.position_ms = 1234;
        prefs.repeat = RepeatMode::One;
        save_source_prefs(&pool, &prefs).await.unwrap();

        let loaded = load_source_prefs(&pool).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["file-primary"].position_ms, 1234);
        assert_eq!(loaded["file-primary"].repeat, RepeatMode::One);
    }
}
