//! Source registry.
//!
//! A source is a named handle bound to a connection string, plus the schema
//! include list and skip patterns applied during introspection. Sources own
//! all derived rows; deleting one cascades through the catalog.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::dsn::{dsn_without_password, enforce_readonly_dsn};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct SourceRecord {
    pub id: i64,
    pub name: String,
    pub dsn: String,
    pub include_schemas: Vec<String>,
    pub skip_patterns: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_indexed_at: Option<String>,
    pub last_error: Option<String>,
}

fn decode_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

fn row_to_source(row: &sqlx::sqlite::SqliteRow) -> SourceRecord {
    SourceRecord {
        id: row.get("id"),
        name: row.get("name"),
        dsn: row.get("dsn"),
        include_schemas: decode_list(row.get("include_schemas_json")),
        skip_patterns: decode_list(row.get("skip_patterns_json")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_indexed_at: row.get("last_indexed_at"),
        last_error: row.get("last_error"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Register a new source.
///
/// The stored DSN is normalized: read-only options merged in, any embedded
/// password stripped.
pub async fn add_source(
    pool: &SqlitePool,
    name: &str,
    dsn: &str,
    include_schemas: &[String],
    skip_patterns: &[String],
) -> Result<SourceRecord> {
    let normalized = enforce_readonly_dsn(&dsn_without_password(dsn));

    let mut include: Vec<String> = include_schemas
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    include.sort();
    include.dedup();
    let mut skip: Vec<String> = skip_patterns
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    skip.sort();
    skip.dedup();

    sqlx::query(
        r#"
        INSERT INTO sources(name, dsn, include_schemas_json, skip_patterns_json, updated_at)
        VALUES(?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#,
    )
    .bind(name)
    .bind(&normalized)
    .bind(serde_json::to_string(&include)?)
    .bind(serde_json::to_string(&skip)?)
    .execute(pool)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            Error::SourceExists(name.to_string())
        } else {
            err.into()
        }
    })?;

    get_source(pool, name).await
}

pub async fn list_sources(pool: &SqlitePool) -> Result<Vec<SourceRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, dsn, include_schemas_json, skip_patterns_json,
               created_at, updated_at, last_indexed_at, last_error
        FROM sources
        ORDER BY name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_source).collect())
}

pub async fn get_source(pool: &SqlitePool, name: &str) -> Result<SourceRecord> {
    let row = sqlx::query(
        r#"
        SELECT id, name, dsn, include_schemas_json, skip_patterns_json,
               created_at, updated_at, last_indexed_at, last_error
        FROM sources WHERE name = ?
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;
    row.map(|row| row_to_source(&row))
        .ok_or_else(|| Error::SourceNotFound(name.to_string()))
}

/// Delete a source and everything derived from it, including its contexts.
pub async fn delete_source(pool: &SqlitePool, name: &str) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM contexts
        WHERE target_uri = ?
           OR target_uri LIKE ?
           OR target_uri LIKE ?
        "#,
    )
    .bind(format!("qpg://{name}"))
    .bind(format!("qpg://{name}/%"))
    .bind(format!("qpg://{name}#%"))
    .execute(pool)
    .await?;

    let result = sqlx::query("DELETE FROM sources WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::SourceNotFound(name.to_string()));
    }
    Ok(())
}

pub async fn rename_source(
    pool: &SqlitePool,
    old_name: &str,
    new_name: &str,
) -> Result<SourceRecord> {
    let result = sqlx::query(
        r#"
        UPDATE sources
        SET name = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        WHERE name = ?
        "#,
    )
    .bind(new_name)
    .bind(old_name)
    .execute(pool)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            Error::SourceExists(new_name.to_string())
        } else {
            err.into()
        }
    })?;

    if result.rows_affected() == 0 {
        return Err(Error::SourceNotFound(old_name.to_string()));
    }
    get_source(pool, new_name).await
}

pub async fn mark_source_indexed(pool: &SqlitePool, source_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sources
        SET last_indexed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
            last_error = NULL,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        WHERE id = ?
        "#,
    )
    .bind(source_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_source_error(pool: &SqlitePool, source_id: i64, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sources
        SET last_error = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        WHERE id = ?
        "#,
    )
    .bind(error)
    .bind(source_id)
    .execute(pool)
    .await?;
    Ok(())
}
