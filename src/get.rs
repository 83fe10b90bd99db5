//! Object hydration.
//!
//! Resolves an object by `schema.object` fqname or by `#<id-fragment>` and
//! assembles the full view: the object record plus columns, constraints,
//! indexes, both dependency directions, and the effective context text.
//! Used by `qpg get`, `qpg schema`, and the `qpg_get` tool.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub ordinal: i64,
    pub default: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConstraintInfo {
    pub name: String,
    pub kind: String,
    pub definition: String,
    pub columns: Vec<String>,
    pub ref_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
    pub is_unique: bool,
    pub is_primary: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyInfo {
    pub kind: String,
    pub object_id: String,
    pub fqname: String,
}

/// Full hydrated view of one indexed object.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectPayload {
    pub object_id: String,
    pub source: String,
    pub fqname: String,
    pub schema: Option<String>,
    pub name: String,
    pub kind: String,
    pub definition: String,
    pub comment: String,
    pub signature: Option<String>,
    pub owner: Option<String>,
    pub columns: Vec<ColumnInfo>,
    pub constraints: Vec<ConstraintInfo>,
    pub indexes: Vec<IndexInfo>,
    pub dependencies_out: Vec<DependencyInfo>,
    pub dependencies_in: Vec<DependencyInfo>,
    pub context: String,
}

fn decode_json_list(value: Option<String>) -> Vec<String> {
    value
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

async fn resolve_object_row(
    pool: &SqlitePool,
    object_ref: &str,
    source: Option<&str>,
) -> Result<sqlx::sqlite::SqliteRow> {
    let mut sql = String::from(
        r#"
        SELECT o.id, o.fqname, o.schema_name, o.object_name, o.object_type,
               o.definition, o.comment, o.signature, o.owner,
               s.name AS source_name
        FROM db_objects o
        JOIN sources s ON s.id = o.source_id
        WHERE "#,
    );
    let id_pattern;
    let mut binds: Vec<&str> = Vec::new();
    if let Some(fragment) = object_ref.strip_prefix('#') {
        sql.push_str("o.id LIKE ?");
        id_pattern = format!("{fragment}%");
        binds.push(&id_pattern);
    } else {
        sql.push_str("o.fqname = ?");
        binds.push(object_ref);
    }
    if let Some(source) = source {
        sql.push_str(" AND s.name = ?");
        binds.push(source);
    }
    sql.push_str(" ORDER BY o.fqname ASC LIMIT 1");

    let mut query = sqlx::query(&sql);
    for bind in binds {
        query = query.bind(bind.to_string());
    }
    query
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("object '{object_ref}'")))
}

/// Hydrate the full view for one object.
pub async fn get_object(
    pool: &SqlitePool,
    object_ref: &str,
    source: Option<&str>,
) -> Result<ObjectPayload> {
    let row = resolve_object_row(pool, object_ref, source).await?;
    let object_id: String = row.get("id");

    let columns = sqlx::query(
        r#"
        SELECT column_name, data_type, is_nullable, ordinal_position, default_expr, comment
        FROM columns
        WHERE object_id = ?
        ORDER BY ordinal_position ASC
        "#,
    )
    .bind(&object_id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|col| ColumnInfo {
        name: col.get("column_name"),
        data_type: col.get("data_type"),
        nullable: col.get("is_nullable"),
        ordinal: col.get("ordinal_position"),
        default: col.get("default_expr"),
        comment: col.get("comment"),
    })
    .collect();

    let constraints = sqlx::query(
        r#"
        SELECT constraint_name, constraint_type, definition, columns_json, ref_columns_json
        FROM constraints
        WHERE object_id = ?
        ORDER BY constraint_name ASC
        "#,
    )
    .bind(&object_id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|con| ConstraintInfo {
        name: con.get("constraint_name"),
        kind: con.get("constraint_type"),
        definition: con.get::<Option<String>, _>("definition").unwrap_or_default(),
        columns: decode_json_list(con.get("columns_json")),
        ref_columns: decode_json_list(con.get("ref_columns_json")),
    })
    .collect();

    let indexes = sqlx::query(
        r#"
        SELECT index_name, definition, is_unique, is_primary, columns_json
        FROM indexes
        WHERE object_id = ?
        ORDER BY index_name ASC
        "#,
    )
    .bind(&object_id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|idx| IndexInfo {
        name: idx.get("index_name"),
        definition: idx.get::<Option<String>, _>("definition").unwrap_or_default(),
        is_unique: idx.get("is_unique"),
        is_primary: idx.get("is_primary"),
        columns: decode_json_list(idx.get("columns_json")),
    })
    .collect();

    let dependencies_out = sqlx::query(
        r#"
        SELECT d.kind, d.to_object_id AS other_id, o.fqname AS other_fqname
        FROM dependencies d
        JOIN db_objects o ON o.id = d.to_object_id
        WHERE d.from_object_id = ?
        ORDER BY d.id ASC
        "#,
    )
    .bind(&object_id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|dep| DependencyInfo {
        kind: dep.get("kind"),
        object_id: dep.get("other_id"),
        fqname: dep.get("other_fqname"),
    })
    .collect();

    let dependencies_in = sqlx::query(
        r#"
        SELECT d.kind, d.from_object_id AS other_id, o.fqname AS other_fqname
        FROM dependencies d
        JOIN db_objects o ON o.id = d.from_object_id
        WHERE d.to_object_id = ?
        ORDER BY d.id ASC
        "#,
    )
    .bind(&object_id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|dep| DependencyInfo {
        kind: dep.get("kind"),
        object_id: dep.get("other_id"),
        fqname: dep.get("other_fqname"),
    })
    .collect();

    let context: Option<String> = sqlx::query_scalar(
        "SELECT context_text FROM object_context_effective WHERE object_id = ?",
    )
    .bind(&object_id)
    .fetch_optional(pool)
    .await?;

    Ok(ObjectPayload {
        object_id,
        source: row.get("source_name"),
        fqname: row.get("fqname"),
        schema: row.get("schema_name"),
        name: row.get("object_name"),
        kind: row.get("object_type"),
        definition: row.get::<Option<String>, _>("definition").unwrap_or_default(),
        comment: row.get::<Option<String>, _>("comment").unwrap_or_default(),
        signature: row.get("signature"),
        owner: row.get("owner"),
        columns,
        constraints,
        indexes,
        dependencies_out,
        dependencies_in,
        context: context.unwrap_or_default(),
    })
}

/// One-line description for listings: comment, first context line, or a
/// generic kind label.
pub fn short_description(payload: &ObjectPayload) -> String {
    if !payload.comment.trim().is_empty() {
        return payload.comment.trim().to_string();
    }
    if let Some(line) = payload.context.lines().next() {
        if !line.trim().is_empty() {
            return line.trim().to_string();
        }
    }
    format!("{} schema object", payload.kind)
}

/// DDL text for display: the stored definition, a synthesized
/// `CREATE TABLE` for tables without one, or a placeholder comment.
pub fn definition_text(payload: &ObjectPayload) -> String {
    let definition = payload.definition.trim();
    if !definition.is_empty() {
        return definition.to_string();
    }
    if payload.kind == "table" {
        return synthesized_table_ddl(payload);
    }
    format!("-- No definition available for {}", payload.fqname)
}

fn synthesized_table_ddl(payload: &ObjectPayload) -> String {
    if payload.columns.is_empty() {
        return format!("CREATE TABLE {} ();", payload.fqname);
    }
    let lines: Vec<String> = payload
        .columns
        .iter()
        .map(|col| {
            let mut parts = vec![format!("{} {}", col.name, col.data_type)];
            if !col.nullable {
                parts.push("NOT NULL".to_string());
            }
            if let Some(default) = &col.default {
                parts.push(format!("DEFAULT {default}"));
            }
            format!("  {}", parts.join(" "))
        })
        .collect();
    format!("CREATE TABLE {} (\n{}\n);", payload.fqname, lines.join(",\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> ObjectPayload {
        ObjectPayload {
            object_id: "abc123def456".to_string(),
            source: "work".to_string(),
            fqname: "sales.orders".to_string(),
            schema: Some("sales".to_string()),
            name: "orders".to_string(),
            kind: "table".to_string(),
            definition: String::new(),
            comment: String::new(),
            signature: None,
            owner: None,
            columns: vec![
                ColumnInfo {
                    name: "id".to_string(),
                    data_type: "bigint".to_string(),
                    nullable: false,
                    ordinal: 1,
                    default: None,
                    comment: None,
                },
                ColumnInfo {
                    name: "note".to_string(),
                    data_type: "text".to_string(),
                    nullable: true,
                    ordinal: 2,
                    default: Some("''".to_string()),
                    comment: None,
                },
            ],
            constraints: Vec::new(),
            indexes: Vec::new(),
            dependencies_out: Vec::new(),
            dependencies_in: Vec::new(),
            context: String::new(),
        }
    }

    #[test]
    fn table_ddl_is_synthesized_from_columns() {
        let ddl = definition_text(&payload());
        assert!(ddl.starts_with("CREATE TABLE sales.orders ("));
        assert!(ddl.contains("id bigint NOT NULL"));
        assert!(ddl.contains("note text DEFAULT ''"));
    }

    #[test]
    fn stored_definition_wins() {
        let mut p = payload();
        p.definition = "CREATE VIEW v AS SELECT 1;".to_string();
        assert_eq!(definition_text(&p), "CREATE VIEW v AS SELECT 1;");
    }

    #[test]
    fn description_prefers_comment_then_context() {
        let mut p = payload();
        assert_eq!(short_description(&p), "table schema object");
        p.context = "First context line.\nSecond.".to_string();
        assert_eq!(short_description(&p), "First context line.");
        p.comment = "Order headers.".to_string();
        assert_eq!(short_description(&p), "Order headers.");
    }
}
