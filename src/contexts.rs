//! Operator-authored context notes.
//!
//! A context targets one of three levels — a source, a schema, or one
//! object — via `qpg://` URIs. At index time each object's effective
//! context is materialized as the deduplicated concatenation of applicable
//! notes walking source -> schema -> owning table -> object. Inheritance is
//! a pull-at-materialization operation; nothing is resolved at query time.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct ContextRecord {
    pub id: i64,
    pub target_uri: String,
    pub body: String,
    pub created_at: String,
}

/// Parsed context target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextScope {
    pub source: String,
    pub schema: Option<String>,
    pub object_name: Option<String>,
    pub object_id: Option<String>,
}

/// The identity of an indexed object, as seen by the resolver.
#[derive(Debug, Clone)]
pub struct ObjectRef<'a> {
    pub source: &'a str,
    pub schema: Option<&'a str>,
    pub object_name: &'a str,
    pub object_id: &'a str,
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parse a `qpg://<source>[/<schema>[.<object> | /<object>]][#<object_id>]`
/// target URI.
pub fn parse_context_target(target_uri: &str) -> Result<ContextScope> {
    let url = Url::parse(target_uri)
        .map_err(|_| Error::InvalidContextTarget(format!("cannot parse '{target_uri}'")))?;
    if url.scheme() != "qpg" {
        return Err(Error::InvalidContextTarget(
            "context target must begin with qpg://".to_string(),
        ));
    }
    let source = url
        .host_str()
        .and_then(non_empty)
        .ok_or_else(|| {
            Error::InvalidContextTarget("context target must include a source name".to_string())
        })?;

    if let Some(fragment) = url.fragment().and_then(non_empty) {
        return Ok(ContextScope {
            source,
            schema: None,
            object_name: None,
            object_id: Some(fragment),
        });
    }

    let path = url.path().trim_matches('/');
    if path.is_empty() {
        return Ok(ContextScope {
            source,
            schema: None,
            object_name: None,
            object_id: None,
        });
    }

    if let Some((schema, object)) = path.split_once('/') {
        if let Some(object) = non_empty(object) {
            return Ok(ContextScope {
                source,
                schema: non_empty(schema),
                object_name: Some(object),
                object_id: None,
            });
        }
    }

    if let Some((schema, object)) = path.split_once('.') {
        return Ok(ContextScope {
            source,
            schema: non_empty(schema),
            object_name: non_empty(object),
            object_id: None,
        });
    }

    Ok(ContextScope {
        source,
        schema: Some(path.to_string()),
        object_name: None,
        object_id: None,
    })
}

/// Add a context note. The target must parse, its source must exist, and an
/// identical `(target, text)` pair is rejected.
pub async fn add_context(
    pool: &SqlitePool,
    target_uri: &str,
    body: &str,
) -> Result<ContextRecord> {
    let scope = parse_context_target(target_uri)?;
    let source_exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sources WHERE name = ?")
        .bind(&scope.source)
        .fetch_one(pool)
        .await?;
    if !source_exists {
        return Err(Error::SourceNotFound(scope.source));
    }

    let result = sqlx::query("INSERT INTO contexts(target_uri, body) VALUES(?, ?)")
        .bind(target_uri)
        .bind(body)
        .execute(pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::Config(format!(
                "identical context already exists for '{target_uri}'"
            )),
            _ => Error::from(err),
        })?;

    let row = sqlx::query("SELECT id, target_uri, body, created_at FROM contexts WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(pool)
        .await?;
    Ok(ContextRecord {
        id: row.get("id"),
        target_uri: row.get("target_uri"),
        body: row.get("body"),
        created_at: row.get("created_at"),
    })
}

pub async fn list_contexts(pool: &SqlitePool) -> Result<Vec<ContextRecord>> {
    let rows =
        sqlx::query("SELECT id, target_uri, body, created_at FROM contexts ORDER BY id ASC")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .iter()
        .map(|row| ContextRecord {
            id: row.get("id"),
            target_uri: row.get("target_uri"),
            body: row.get("body"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Remove contexts by numeric id or by target URI. Returns the count removed.
pub async fn remove_context(pool: &SqlitePool, key: &str) -> Result<u64> {
    let result = if key.chars().all(|c| c.is_ascii_digit()) && !key.is_empty() {
        sqlx::query("DELETE FROM contexts WHERE id = ?")
            .bind(key.parse::<i64>().unwrap_or(-1))
            .execute(pool)
            .await?
    } else {
        sqlx::query("DELETE FROM contexts WHERE target_uri = ?")
            .bind(key)
            .execute(pool)
            .await?
    };
    Ok(result.rows_affected())
}

fn context_applies(scope: &ContextScope, obj: &ObjectRef<'_>) -> bool {
    if scope.source != obj.source {
        return false;
    }
    if let Some(object_id) = &scope.object_id {
        return object_id == obj.object_id;
    }
    if let Some(schema) = &scope.schema {
        if schema != obj.schema.unwrap_or("") {
            return false;
        }
    }
    if let Some(object_name) = &scope.object_name {
        // Child object names are "<parent>.<child>"; a parent's context is
        // inherited by its children.
        return object_name == obj.object_name
            || obj.object_name.starts_with(&format!("{object_name}."));
    }
    true
}

/// Specificity level driving concatenation order:
/// source (0) -> schema (1) -> owning table (2) -> object (3).
fn scope_level(scope: &ContextScope, obj: &ObjectRef<'_>) -> usize {
    if scope.object_id.is_some() {
        return 3;
    }
    match &scope.object_name {
        Some(object_name) if object_name == obj.object_name => 3,
        Some(_) => 2,
        None if scope.schema.is_some() => 1,
        None => 0,
    }
}

/// Materialize the effective context text for one object: applicable notes
/// ordered by level, deduplicated, newline-joined.
pub fn resolve_effective_context(contexts: &[ContextRecord], obj: &ObjectRef<'_>) -> String {
    let mut buckets: [Vec<String>; 4] = [Vec::new(), Vec::new(), Vec::new(), Vec::new()];
    for ctx in contexts {
        let scope = match parse_context_target(&ctx.target_uri) {
            Ok(scope) => scope,
            Err(_) => continue,
        };
        if !context_applies(&scope, obj) {
            continue;
        }
        let body = ctx.body.trim();
        if body.is_empty() {
            continue;
        }
        buckets[scope_level(&scope, obj)].push(body.to_string());
    }

    let mut lines: Vec<String> = Vec::new();
    for bucket in buckets {
        for body in bucket {
            if !lines.contains(&body) {
                lines.push(body);
            }
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, target: &str, body: &str) -> ContextRecord {
        ContextRecord {
            id,
            target_uri: target.to_string(),
            body: body.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn orders_ref<'a>() -> ObjectRef<'a> {
        ObjectRef {
            source: "work",
            schema: Some("sales"),
            object_name: "orders",
            object_id: "abc123def456",
        }
    }

    #[test]
    fn parse_source_level() {
        let scope = parse_context_target("qpg://work").unwrap();
        assert_eq!(scope.source, "work");
        assert!(scope.schema.is_none() && scope.object_name.is_none());
    }

    #[test]
    fn parse_schema_level() {
        let scope = parse_context_target("qpg://work/sales").unwrap();
        assert_eq!(scope.schema.as_deref(), Some("sales"));
        assert!(scope.object_name.is_none());
    }

    #[test]
    fn parse_object_level_dot_and_slash() {
        let scope = parse_context_target("qpg://work/sales.orders").unwrap();
        assert_eq!(scope.schema.as_deref(), Some("sales"));
        assert_eq!(scope.object_name.as_deref(), Some("orders"));

        let scope = parse_context_target("qpg://work/sales/orders").unwrap();
        assert_eq!(scope.schema.as_deref(), Some("sales"));
        assert_eq!(scope.object_name.as_deref(), Some("orders"));
    }

    #[test]
    fn parse_object_id_fragment() {
        let scope = parse_context_target("qpg://work#abc123def456").unwrap();
        assert_eq!(scope.object_id.as_deref(), Some("abc123def456"));
    }

    #[test]
    fn parse_rejects_bad_targets() {
        assert!(parse_context_target("http://work").is_err());
        assert!(parse_context_target("qpg://").is_err());
        assert!(parse_context_target("not a uri").is_err());
    }

    #[test]
    fn effective_context_walks_levels_in_order() {
        let contexts = vec![
            record(1, "qpg://work/sales.orders", "Orders table note."),
            record(2, "qpg://work", "Source note."),
            record(3, "qpg://work/sales", "Sales schema note."),
        ];
        let text = resolve_effective_context(&contexts, &orders_ref());
        assert_eq!(
            text,
            "Source note.\nSales schema note.\nOrders table note."
        );
    }

    #[test]
    fn owning_table_context_applies_to_children() {
        let contexts = vec![record(1, "qpg://work/sales.orders", "Orders table note.")];
        let child = ObjectRef {
            source: "work",
            schema: Some("sales"),
            object_name: "orders.total_cents",
            object_id: "fffabc123456",
        };
        assert_eq!(
            resolve_effective_context(&contexts, &child),
            "Orders table note."
        );
    }

    #[test]
    fn other_source_and_schema_do_not_apply() {
        let contexts = vec![
            record(1, "qpg://other", "Other source."),
            record(2, "qpg://work/billing", "Billing schema."),
            record(3, "qpg://work/sales.refunds", "Refunds table."),
        ];
        assert_eq!(resolve_effective_context(&contexts, &orders_ref()), "");
    }

    #[test]
    fn duplicate_bodies_are_deduplicated() {
        let contexts = vec![
            record(1, "qpg://work", "Same note."),
            record(2, "qpg://work/sales", "Same note."),
        ];
        assert_eq!(resolve_effective_context(&contexts, &orders_ref()), "Same note.");
    }

    #[test]
    fn object_id_scope_targets_exactly_one_object() {
        let contexts = vec![record(1, "qpg://work#abc123def456", "Pinned note.")];
        assert_eq!(
            resolve_effective_context(&contexts, &orders_ref()),
            "Pinned note."
        );
        let other = ObjectRef {
            object_id: "000000000000",
            ..orders_ref()
        };
        assert_eq!(resolve_effective_context(&contexts, &other), "");
    }
}
