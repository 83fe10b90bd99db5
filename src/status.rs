//! Index status summary.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::dsn::redact_dsn;
use crate::error::Result;
use crate::sources::list_sources;

#[derive(Debug, Clone, Serialize)]
pub struct KindCount {
    pub kind: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub dsn: String,
    pub include_schemas: Vec<String>,
    pub skip_patterns: Vec<String>,
    pub objects: i64,
    pub last_indexed_at: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub source_count: i64,
    pub object_count: i64,
    pub sources: Vec<SourceStatus>,
    pub by_kind: Vec<KindCount>,
}

/// Collect object counts overall, per source, and per kind.
pub async fn status_payload(pool: &SqlitePool) -> Result<StatusPayload> {
    let sources = list_sources(pool).await?;
    let object_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM db_objects")
        .fetch_one(pool)
        .await?;

    let by_kind = sqlx::query(
        r#"
        SELECT object_type, COUNT(*) AS count
        FROM db_objects
        GROUP BY object_type
        ORDER BY count DESC, object_type ASC
        "#,
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| KindCount {
        kind: row.get("object_type"),
        count: row.get("count"),
    })
    .collect();

    let mut source_rows = Vec::with_capacity(sources.len());
    for source in &sources {
        let objects: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM db_objects WHERE source_id = ?")
                .bind(source.id)
                .fetch_one(pool)
                .await?;
        source_rows.push(SourceStatus {
            name: source.name.clone(),
            dsn: redact_dsn(&source.dsn),
            include_schemas: source.include_schemas.clone(),
            skip_patterns: source.skip_patterns.clone(),
            objects,
            last_indexed_at: source.last_indexed_at.clone(),
            last_error: source.last_error.clone(),
        });
    }

    Ok(StatusPayload {
        source_count: sources.len() as i64,
        object_count,
        sources: source_rows,
        by_kind,
    })
}
