//! Advisory external rerank hook.
//!
//! When `QPG_RERANK_HOOK` names a command, the fused candidate list is
//! piped to it as JSON and the command answers with a JSON array of object
//! ids in the desired order. The hook may only permute the candidates: a
//! non-zero exit, unparseable output, an unknown id, a missing id, or a
//! timeout rejects the hook and the fused order stands.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::query::SearchHit;

pub const RERANK_HOOK_ENV: &str = "QPG_RERANK_HOOK";
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the configured rerank hook over the fused candidates.
///
/// Returns `Ok(None)` when no hook is configured, `Ok(Some(reordered))` on
/// success, and `Err(Hook)` for every failure mode.
pub async fn rerank_with_hook(
    query: &str,
    rows: &[SearchHit],
) -> Result<Option<Vec<SearchHit>>> {
    let hook = match std::env::var(RERANK_HOOK_ENV) {
        Ok(hook) if !hook.trim().is_empty() => hook,
        _ => return Ok(None),
    };

    let payload = serde_json::json!({
        "query": query,
        "results": rows
            .iter()
            .map(|row| serde_json::json!({
                "object_id": row.object_id,
                "score": row.score,
            }))
            .collect::<Vec<_>>(),
    });
    let input = serde_json::to_vec(&payload)?;

    let mut child = Command::new(&hook)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Hook(format!("cannot spawn '{hook}': {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&input)
            .await
            .map_err(|e| Error::Hook(format!("cannot write to hook stdin: {e}")))?;
    }

    let output = tokio::time::timeout(HOOK_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| Error::Hook(format!("timed out after {}s", HOOK_TIMEOUT.as_secs())))?
        .map_err(|e| Error::Hook(format!("hook io error: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Hook(format!(
            "exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let ids: Vec<String> = serde_json::from_slice(&output.stdout)
        .map_err(|_| Error::Hook("returned invalid JSON (expected an array of object ids)".into()))?;

    Ok(Some(reorder_rows(rows, &ids)?))
}

/// Apply the hook's ordering. The id list must be an exact permutation of
/// the candidate set; the hook never alters the candidates themselves.
fn reorder_rows(rows: &[SearchHit], ids: &[String]) -> Result<Vec<SearchHit>> {
    if ids.len() != rows.len() {
        return Err(Error::Hook(format!(
            "returned {} ids for {} candidates",
            ids.len(),
            rows.len()
        )));
    }

    let known: HashSet<&str> = rows.iter().map(|row| row.object_id.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    for id in ids {
        if !known.contains(id.as_str()) {
            return Err(Error::Hook(format!("returned unknown object id '{id}'")));
        }
        if !seen.insert(id.as_str()) {
            return Err(Error::Hook(format!("returned duplicate object id '{id}'")));
        }
    }

    let mut by_id: std::collections::HashMap<&str, &SearchHit> =
        rows.iter().map(|row| (row.object_id.as_str(), row)).collect();
    Ok(ids
        .iter()
        .filter_map(|id| by_id.remove(id.as_str()).cloned())
        .collect())
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
            score: 0.5,
            snippet: None,
        }
    }

    #[test]
    fn exact_permutation_is_applied() {
        let rows = vec![hit("a"), hit("b"), hit("c")];
        let ids = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        let reordered = reorder_rows(&rows, &ids).unwrap();
        let order: Vec<&str> = reordered.iter().map(|r| r.object_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn unknown_id_rejects_the_hook() {
        let rows = vec![hit("a"), hit("b")];
        let ids = vec!["a".to_string(), "zzz".to_string()];
        let err = reorder_rows(&rows, &ids).unwrap_err();
        assert!(matches!(err, Error::Hook(_)));
        assert!(err.to_string().contains("zzz"));
    }

    #[test]
    fn missing_id_rejects_the_hook() {
        let rows = vec![hit("a"), hit("b"), hit("c")];
        let ids = vec!["a".to_string(), "b".to_string()];
        assert!(reorder_rows(&rows, &ids).is_err());
    }

    #[test]
    fn duplicate_id_rejects_the_hook() {
        let rows = vec![hit("a"), hit("b")];
        let ids = vec!["a".to_string(), "a".to_string()];
        let err = reorder_rows(&rows, &ids).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn empty_candidate_set_round_trips() {
        assert!(reorder_rows(&[], &[]).unwrap().is_empty());
    }
}
