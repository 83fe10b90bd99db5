//! Catalog connection handling.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// Open (or create) the catalog database at `path`.
///
/// WAL mode gives single-writer/multi-reader snapshot semantics: readers see
/// either the pre-commit or post-commit state of a rebuild, never a mix.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Probe whether the connected SQLite exposes the native vector functions
/// (`vec_f32`, `vec_distance_cosine`). When absent, vector search decodes
/// stored JSON vectors and ranks in-process; both paths produce identical
/// orderings.
pub async fn has_vec_functions(pool: &SqlitePool) -> bool {
    sqlx::query("SELECT vec_f32('[0.0, 1.0]')")
        .fetch_one(pool)
        .await
        .is_ok()
}
