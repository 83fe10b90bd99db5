//! Lexical index over the four-field object documents.
//!
//! `objects_fts` is an FTS5 table with unicode61 tokenization holding
//! `name_col`, `comment_col`, `defs_col`, and `context_col` per object.
//! BM25 weights boost `context_col` 1.5x relative to the other three; the
//! leading UNINDEXED identity columns get zero weight. Raw BM25 is
//! converted to `1/(1 + bm25)` for presentation only — fusion works on
//! ranks, never magnitudes.

use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::error::Result;
use crate::query::{SearchFilters, SearchHit};

/// Column weights: object_id, source_name, schema_name, kind (unindexed),
/// then name_col, comment_col, defs_col, context_col.
const BM25_WEIGHTS: &str = "bm25(objects_fts, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.5)";

/// Build an FTS5 MATCH expression from free-form text: identifier-ish
/// tokens, quoted, OR-joined. FTS operators in user input are neutralized
/// by the quoting.
pub fn make_match_query(text: &str) -> String {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch);
        } else if !current.is_empty() {
            if !tokens.contains(&current) {
                tokens.push(current.clone());
            }
            current.clear();
        }
    }
    if !current.is_empty() && !tokens.contains(&current) {
        tokens.push(current);
    }

    if tokens.is_empty() {
        return "\"\"".to_string();
    }
    tokens
        .iter()
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// BM25 presentation score: monotonic decreasing over raw BM25, where a
/// lower raw score is more relevant.
fn relevance(bm25: f64) -> f64 {
    1.0 / (1.0 + bm25.max(0.0))
}

/// Ranked lexical search. Domain filters (source, schema, kind) constrain
/// the candidate set; `min_score` here filters after scoring.
pub async fn search_fts(
    pool: &SqlitePool,
    text: &str,
    filters: &SearchFilters,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let match_query = make_match_query(text);

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        r#"
        SELECT o.id AS object_id,
               o.fqname,
               o.object_type,
               s.name AS source_name,
               {BM25_WEIGHTS} AS bm25_score,
               snippet(objects_fts, 7, '[', ']', '...', 12) AS context_snippet
        FROM objects_fts
        JOIN db_objects o ON o.id = objects_fts.object_id
        JOIN sources s ON s.id = o.source_id
        WHERE objects_fts MATCH "#
    ));
    builder.push_bind(match_query);
    if let Some(source) = &filters.source {
        builder.push(" AND s.name = ").push_bind(source);
    }
    if let Some(schema) = &filters.schema {
        builder.push(" AND o.schema_name = ").push_bind(schema);
    }
    if let Some(kind) = &filters.kind {
        builder.push(" AND o.object_type = ").push_bind(kind);
    }
    builder.push(" ORDER BY bm25_score ASC, o.id ASC LIMIT ");
    builder.push_bind(limit);

    let rows = builder.build().fetch_all(pool).await?;
    let mut hits = Vec::with_capacity(rows.len());
    for row in rows {
        let bm25: f64 = row.get("bm25_score");
        let score = relevance(bm25);
        if let Some(min_score) = filters.min_score {
            if score < min_score {
                continue;
            }
        }
        let snippet: Option<String> = row.get("context_snippet");
        hits.push(SearchHit {
            object_id: row.get("object_id"),
            fqname: row.get("fqname"),
            kind: row.get("object_type"),
            source: row.get("source_name"),
            score,
            snippet: snippet.filter(|s| !s.is_empty()),
        });
    }
    Ok(hits)
}

/// Rebuild every FTS row from `lexical_docs`. Used by `qpg repair`;
/// per-source rebuilds write their rows inside the build transaction.
pub async fn rebuild_fts(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM objects_fts").execute(pool).await?;
    sqlx::query(
        r#"
        INSERT INTO objects_fts(
            object_id, source_name, schema_name, kind,
            name_col, comment_col, defs_col, context_col
        )
        SELECT ld.object_id,
               s.name,
               o.schema_name,
               o.object_type,
               ld.name_col,
               ld.comment_col,
               ld.defs_col,
               ld.context_col
        FROM lexical_docs ld
        JOIN db_objects o ON o.id = ld.object_id
        JOIN sources s ON s.id = ld.source_id
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_query_quotes_and_ors_tokens() {
        assert_eq!(make_match_query("refund flow"), "\"refund\" OR \"flow\"");
        assert_eq!(make_match_query("user_id"), "\"user_id\"");
    }

    #[test]
    fn match_query_neutralizes_fts_operators() {
        let q = make_match_query("a NEAR(b) OR c*");
        assert_eq!(q, "\"a\" OR \"NEAR\" OR \"b\" OR \"OR\" OR \"c\"");
    }

    #[test]
    fn match_query_deduplicates_tokens() {
        assert_eq!(make_match_query("orders orders orders"), "\"orders\"");
    }

    #[test]
    fn empty_input_matches_nothing() {
        assert_eq!(make_match_query(""), "\"\"");
        assert_eq!(make_match_query("!!"), "\"\"");
    }

    #[test]
    fn relevance_is_monotonic_decreasing() {
        assert!(relevance(0.0) > relevance(1.0));
        assert!(relevance(1.0) > relevance(5.0));
        assert_eq!(relevance(0.0), 1.0);
        // Negative raw scores clamp to the best relevance.
        assert_eq!(relevance(-3.0), 1.0);
    }
}
