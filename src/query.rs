//! The hybrid query planner.
//!
//! `search` is lexical-only, `vsearch` vector-only, and `query` runs the
//! hybrid plan: deterministic expansion, parallel lexical + vector
//! retrieval, reciprocal rank fusion, and the optional advisory rerank
//! hook. For a fixed catalog snapshot and query string the output is
//! byte-identical across runs and machines.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::warn;

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::expand::expand_query;
use crate::fts;
use crate::rerank;
use crate::rrf::{reciprocal_rank_fusion, RRF_K};
use crate::vec;

/// Per-retriever candidate list size for the hybrid plan.
pub const CANDIDATE_LIMIT: i64 = 50;

/// One ranked retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub object_id: String,
    pub fqname: String,
    pub kind: String,
    pub source: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Domain filters applied inside retrieval; `min_score` applies after
/// fusion (or after scoring, for the single-index commands).
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub source: Option<String>,
    pub schema: Option<String>,
    pub kind: Option<String>,
    pub min_score: Option<f64>,
}

/// Hybrid plan output. A misbehaving rerank hook never alters the hits,
/// only attaches a diagnostic.
#[derive(Debug)]
pub struct HybridOutcome {
    pub hits: Vec<SearchHit>,
    pub hook_diagnostic: Option<String>,
}

/// Run the hybrid retrieval plan.
pub async fn hybrid_query(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    text: &str,
    filters: &SearchFilters,
    limit: i64,
    use_rerank: bool,
) -> Result<HybridOutcome> {
    let candidate_limit = CANDIDATE_LIMIT.max(limit);
    let expansions = expand_query(text);
    let lexical_text = expansions.join(" ");

    let domain_filters = SearchFilters {
        min_score: None,
        ..filters.clone()
    };
    let lexical = fts::search_fts(pool, &lexical_text, &domain_filters, candidate_limit).await?;
    let vector = vec::vector_search(pool, embedder, text, &domain_filters, candidate_limit).await?;

    let mut fused = reciprocal_rank_fusion(&[lexical, vector], RRF_K);

    if let Some(min_score) = filters.min_score {
        fused.retain(|row| row.score >= min_score);
    }

    let mut hook_diagnostic = None;
    if use_rerank {
        match rerank::rerank_with_hook(text, &fused).await {
            Ok(Some(reordered)) => fused = reordered,
            Ok(None) => {}
            Err(err) => {
                warn!("rerank hook rejected: {err}");
                hook_diagnostic = Some(err.to_string());
            }
        }
    }

    fused.truncate(limit.max(0) as usize);
    Ok(HybridOutcome {
        hits: fused,
        hook_diagnostic,
    })
}

/// Lexical-only retrieval with post-scoring `min_score`.
pub async fn lexical_search(
    pool: &SqlitePool,
    text: &str,
    filters: &SearchFilters,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let mut hits = fts::search_fts(pool, text, filters, limit).await?;
    if let Some(min_score) = filters.min_score {
        hits.retain(|row| row.score >= min_score);
    }
    Ok(hits)
}

/// Vector-only retrieval with post-scoring `min_score`.
pub async fn vector_only_search(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    text: &str,
    filters: &SearchFilters,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let mut hits = vec::vector_search(pool, embedder, text, filters, limit).await?;
    if let Some(min_score) = filters.min_score {
        hits.retain(|row| row.score >= min_score);
    }
    Ok(hits)
}

/// Guard against nonsense limits from the tool surface.
pub fn clamp_limit(limit: i64) -> Result<i64> {
    if limit < 1 {
        return Err(Error::Config(format!("limit must be >= 1, got {limit}")));
    }
    Ok(limit.min(10_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(10).unwrap(), 10);
        assert_eq!(clamp_limit(1_000_000).unwrap(), 10_000);
        assert!(clamp_limit(0).is_err());
        assert!(clamp_limit(-5).is_err());
    }
}
