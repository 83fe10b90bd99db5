//! Vector index over per-object dense embeddings.
//!
//! Stored vectors are JSON float arrays. When the connected SQLite exposes
//! the native vector functions (`vec_f32`, `vec_distance_cosine`) the
//! similarity ranking runs in SQL; otherwise vectors are decoded and ranked
//! in-process. Both paths order by `(score DESC, object_id ASC)` and are
//! indistinguishable to callers.

use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::db;
use crate::embedding::{cosine_similarity, decode_json_vector, to_json_vector, Embedder};
use crate::error::Result;
use crate::query::{SearchFilters, SearchHit};

/// Ranked cosine-similarity search, presented as `1 - cosine_distance`.
pub async fn vector_search(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    text: &str,
    filters: &SearchFilters,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let query_vec = embedder.embed(text)?;

    let mut hits = if db::has_vec_functions(pool).await {
        native_search(pool, &query_vec, filters, limit).await?
    } else {
        fallback_search(pool, &query_vec, filters, limit).await?
    };

    if let Some(min_score) = filters.min_score {
        hits.retain(|row| row.score >= min_score);
    }
    Ok(hits)
}

async fn native_search(
    pool: &SqlitePool,
    query_vec: &[f32],
    filters: &SearchFilters,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        r#"
        SELECT o.id AS object_id,
               o.fqname,
               o.object_type,
               s.name AS source_name,
               (1.0 - vec_distance_cosine(ov.embedding, vec_f32("#,
    );
    builder.push_bind(to_json_vector(query_vec));
    builder.push(
        r#"))) AS score
        FROM object_vectors ov
        JOIN db_objects o ON o.id = ov.object_id
        JOIN sources s ON s.id = o.source_id
        WHERE 1 = 1"#,
    );
    push_domain_filters(&mut builder, filters);
    builder.push(" ORDER BY score DESC, o.id ASC LIMIT ");
    builder.push_bind(limit);

    let rows = builder.build().fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| SearchHit {
            object_id: row.get("object_id"),
            fqname: row.get("fqname"),
            kind: row.get("object_type"),
            source: row.get("source_name"),
            score: row.get("score"),
            snippet: None,
        })
        .collect())
}

async fn fallback_search(
    pool: &SqlitePool,
    query_vec: &[f32],
    filters: &SearchFilters,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        r#"
        SELECT o.id AS object_id,
               o.fqname,
               o.object_type,
               s.name AS source_name,
               ov.embedding AS embedding
        FROM object_vectors ov
        JOIN db_objects o ON o.id = ov.object_id
        JOIN sources s ON s.id = o.source_id
        WHERE 1 = 1"#,
    );
    push_domain_filters(&mut builder, filters);

    let rows = builder.build().fetch_all(pool).await?;
    let mut scored: Vec<SearchHit> = Vec::with_capacity(rows.len());
    for row in rows {
        let blob: Vec<u8> = row.get("embedding");
        let Some(vector) = decode_json_vector(&blob) else {
            continue;
        };
        scored.push(SearchHit {
            object_id: row.get("object_id"),
            fqname: row.get("fqname"),
            kind: row.get("object_type"),
            source: row.get("source_name"),
            score: cosine_similarity(query_vec, &vector) as f64,
            snippet: None,
        });
    }

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.object_id.cmp(&b.object_id))
    });
    scored.truncate(limit.max(0) as usize);
    Ok(scored)
}

fn push_domain_filters(builder: &mut QueryBuilder<'_, Sqlite>, filters: &SearchFilters) {
    if let Some(source) = &filters.source {
        builder.push(" AND s.name = ").push_bind(source.clone());
    }
    if let Some(schema) = &filters.schema {
        builder.push(" AND o.schema_name = ").push_bind(schema.clone());
    }
    if let Some(kind) = &filters.kind {
        builder.push(" AND o.object_type = ").push_bind(kind.clone());
    }
}
