//! Reciprocal rank fusion.
//!
//! Fuses ranked candidate lists from heterogeneous retrievers using ranks
//! only; BM25 and cosine magnitudes are never compared. The constant `k`
//! is pinned at 60, candidates at rank 1 in any list receive an additional
//! `1/k` bonus, and ties are broken by `object_id` so output is fully
//! deterministic.

use std::collections::HashMap;

use crate::query::SearchHit;

/// Pinned RRF constant.
pub const RRF_K: usize = 60;

/// Fuse ranked lists into a single ordering.
///
/// `score(o) = Σ 1/(k + rank_i(o))` over lists containing `o`, plus `1/k`
/// when `o` leads any list. Row metadata is taken from the first list that
/// produced the candidate.
pub fn reciprocal_rank_fusion(lists: &[Vec<SearchHit>], k: usize) -> Vec<SearchHit> {
    let bonus = 1.0 / k as f64;
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut first_seen: HashMap<String, SearchHit> = HashMap::new();

    for list in lists {
        for (index, row) in list.iter().enumerate() {
            let rank = index + 1;
            let entry = scores.entry(row.object_id.clone()).or_insert(0.0);
            *entry += 1.0 / (k + rank) as f64;
            if rank == 1 {
                *entry += bonus;
            }
            first_seen
                .entry(row.object_id.clone())
                .or_insert_with(|| row.clone());
        }
    }

    let mut fused: Vec<SearchHit> = first_seen
        .into_values()
        .map(|mut row| {
            row.score = scores[&row.object_id];
            row
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.object_id.cmp(&b.object_id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(object_id: &str) -> SearchHit {
        SearchHit {
            object_id: object_id.to_string(),
            fqname: format!("public.{object_id}"),
            kind: "table".to_string(),
            source: "work".to_string(),
            score: 0.0,
            snippet: None,
        }
    }

    #[test]
    fn candidate_in_both_lists_wins() {
        let lex = vec![hit("aaa"), hit("bbb"), hit("ccc")];
        let vec_list = vec![hit("ddd"), hit("bbb")];
        let fused = reciprocal_rank_fusion(&[lex, vec_list], RRF_K);
        assert_eq!(fused[0].object_id, "bbb");
    }

    #[test]
    fn top_rank_bonus_is_one_over_k() {
        let fused = reciprocal_rank_fusion(&[vec![hit("aaa")]], RRF_K);
        let expected = 1.0 / 61.0 + 1.0 / 60.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
    }

    #[test]
    fn rank_one_vector_hit_beats_rank_three_lexical_hit() {
        // "refund flow": lexical has refunds at rank 3, vector has
        // refund_events at rank 1.
        let lex = vec![hit("orders"), hit("invoices"), hit("refunds")];
        let vec_list = vec![hit("refund_events"), hit("orders")];
        let fused = reciprocal_rank_fusion(&[lex, vec_list], RRF_K);
        assert_eq!(fused[0].object_id, "refund_events");
    }

    #[test]
    fn ties_break_on_object_id() {
        // Two candidates with mirrored ranks score identically.
        let lex = vec![hit("zzz"), hit("aaa")];
        let vec_list = vec![hit("aaa"), hit("zzz")];
        let fused = reciprocal_rank_fusion(&[lex, vec_list], RRF_K);
        assert_eq!(fused[0].object_id, "aaa");
        assert_eq!(fused[1].object_id, "zzz");
        assert!((fused[0].score - fused[1].score).abs() < 1e-12);
    }

    #[test]
    fn flipping_one_rank_flips_the_tie_break() {
        let lex = vec![hit("zzz"), hit("aaa"), hit("mmm")];
        let vec_list = vec![hit("aaa"), hit("zzz"), hit("mmm")];
        let fused = reciprocal_rank_fusion(&[lex.clone(), vec_list], RRF_K);
        assert_eq!(fused[0].object_id, "aaa");

        // Demote "aaa" by one position in the vector list; "zzz" now leads
        // both by score, no tie-break needed.
        let vec_list = vec![hit("zzz"), hit("aaa"), hit("mmm")];
        let fused = reciprocal_rank_fusion(&[lex, vec_list], RRF_K);
        assert_eq!(fused[0].object_id, "zzz");
    }

    #[test]
    fn absent_list_contributes_nothing() {
        let lex = vec![hit("aaa"), hit("bbb")];
        let fused = reciprocal_rank_fusion(&[lex, Vec::new()], RRF_K);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].object_id, "aaa");
    }
}
