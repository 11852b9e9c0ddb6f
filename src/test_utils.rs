//! Test utilities and fixtures.
//!
//! Common helpers to reduce boilerplate in tests: a temporary database,
//! tiny generated WAV files and silent clip producers.

use std::path::{Path, PathBuf};

use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;

/// Creates a temporary database for testing.
///
/// The database is created in a temporary directory that is cleaned up
/// when the returned `TempDir` is dropped. Migrations run automatically.
pub async fn temp_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let db_path = dir.path().join("test.db");
    let db_url = format!("sqlite:{}", db_path.display());

    let pool = crate::db::init_db(&db_url)
        .await
        .expect("Failed to initialize test database");

    (pool, dir)
}

/// Write a minimal valid 16-bit mono 48 kHz WAV of silence.
pub fn write_test_wav(dir: &Path, name: &str, frames: u32) -> PathBuf {
    let path = dir.join(name);
    let data_len = frames * 2;
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&48_000u32.to_le_bytes());
    bytes.extend_from_slice(&(48_000u32 * 2).to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    bytes.extend(std::iter::repeat_n(0u8, data_len as usize));
    std::fs::write(&path, bytes).expect("Failed to write test wav");
    path
}
