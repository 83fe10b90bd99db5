//! Per-source index builds.
//!
//! A rebuild stages every derived row in memory first — objects, child
//! records, dependency edges, effective contexts, lexical documents, and
//! embeddings — then replaces the source's prior rows inside a single
//! transaction. A failed build rolls back completely and leaves the
//! previous catalog state visible; rows belonging to other sources are
//! never touched.

use std::collections::{HashMap, HashSet};

use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::contexts::{resolve_effective_context, ContextRecord, ObjectRef};
use crate::db;
use crate::embedding::{source_text_hash, to_json_vector, Embedder};
use crate::error::{Error, Result};
use crate::introspect::IntrospectionBundle;
use crate::normalize::{normalize_object, normalize_signature, NormalizedObject, ObjectKind};
use crate::sources::SourceRecord;

/// Row counts for one completed rebuild.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateStats {
    pub objects: i64,
    pub columns: i64,
    pub constraints: i64,
    pub indexes: i64,
    pub dependencies: i64,
    pub vectors: i64,
    pub vectors_reused: i64,
}

#[derive(Debug)]
struct StagedObject {
    normalized: NormalizedObject,
    defs: Vec<String>,
}

#[derive(Debug)]
struct ColumnRow {
    object_id: String,
    column_name: String,
    data_type: String,
    is_nullable: bool,
    ordinal_position: i32,
    default_expr: Option<String>,
    comment: Option<String>,
}

#[derive(Debug)]
struct ConstraintRow {
    object_id: String,
    constraint_name: String,
    constraint_type: String,
    definition: String,
    columns_json: String,
    ref_columns_json: String,
}

#[derive(Debug)]
struct IndexRow {
    object_id: String,
    index_name: String,
    definition: String,
    is_unique: bool,
    is_primary: bool,
    columns_json: String,
}

#[derive(Debug)]
struct DependencyRow {
    from_object_id: String,
    to_object_id: String,
    kind: String,
}

struct VectorRow {
    object_id: String,
    payload: String,
    model: String,
    hash: String,
    reused: bool,
}

struct LexicalDoc {
    object_id: String,
    schema_name: Option<String>,
    kind: String,
    name_col: String,
    comment_col: String,
    defs_col: String,
    context_col: String,
}

#[derive(Default, Debug)]
struct SourceBatch {
    objects: Vec<StagedObject>,
    by_fqname: HashMap<String, usize>,
    columns: Vec<ColumnRow>,
    constraints: Vec<ConstraintRow>,
    indexes: Vec<IndexRow>,
    dependencies: Vec<DependencyRow>,
}

impl SourceBatch {
    fn stage(&mut self, normalized: NormalizedObject, seen: &mut HashSet<(ObjectKind, String)>) -> Result<usize> {
        let identity = (normalized.kind, normalized.fqname.clone());
        if !seen.insert(identity) {
            return Err(Error::SchemaConflict(format!(
                "duplicate canonical identity ({}, {})",
                normalized.kind, normalized.fqname
            )));
        }
        let index = self.objects.len();
        if matches!(
            normalized.kind,
            ObjectKind::Schema
                | ObjectKind::Table
                | ObjectKind::View
                | ObjectKind::Function
                | ObjectKind::Extension
        ) {
            self.by_fqname.insert(normalized.fqname.clone(), index);
        }
        let defs = if normalized.definition.is_empty() {
            Vec::new()
        } else {
            vec![normalized.definition.clone()]
        };
        self.objects.push(StagedObject { normalized, defs });
        Ok(index)
    }

    fn parent(&self, fqname: &str) -> Option<(String, Option<String>, String)> {
        self.by_fqname.get(fqname).map(|&index| {
            let obj = &self.objects[index].normalized;
            (
                obj.object_id.clone(),
                obj.schema_name.clone(),
                obj.object_name.clone(),
            )
        })
    }
}

fn stage_bundle(
    source: &SourceRecord,
    bundle: &IntrospectionBundle,
) -> Result<SourceBatch> {
    let mut batch = SourceBatch::default();
    let mut seen: HashSet<(ObjectKind, String)> = HashSet::new();

    for obj in &bundle.objects {
        let normalized = normalize_object(
            &source.name,
            obj.schema_name.as_deref(),
            &obj.object_name,
            obj.kind,
            obj.definition.as_deref(),
            obj.comment.as_deref(),
            obj.signature.as_deref(),
            obj.owner.as_deref(),
            None,
        );
        batch.stage(normalized, &mut seen)?;
    }

    // Columns: child rows, synthesized def lines, child objects, and the
    // owning table's column-list signature.
    let mut signature_parts: HashMap<String, Vec<String>> = HashMap::new();
    for column in &bundle.columns {
        let Some((parent_id, parent_schema, parent_name)) = batch.parent(&column.parent_fqname)
        else {
            continue;
        };

        batch.columns.push(ColumnRow {
            object_id: parent_id.clone(),
            column_name: column.column_name.clone(),
            data_type: column.data_type.clone(),
            is_nullable: column.is_nullable,
            ordinal_position: column.ordinal_position,
            default_expr: column.default_expr.clone(),
            comment: column.comment.clone(),
        });

        let default_part = column
            .default_expr
            .as_deref()
            .map(|d| format!(" default={d}"))
            .unwrap_or_default();
        let def_line = format!(
            "column {} {}{default_part}",
            column.column_name, column.data_type
        );
        signature_parts
            .entry(column.parent_fqname.clone())
            .or_default()
            .push(format!("{} {}", column.column_name, column.data_type));

        let parent_index = batch.by_fqname[&column.parent_fqname];
        batch.objects[parent_index].defs.push(def_line);

        let child = normalize_object(
            &source.name,
            parent_schema.as_deref(),
            &format!("{parent_name}.{}", column.column_name),
            ObjectKind::Column,
            Some(&format!("{}{default_part}", column.data_type)),
            column.comment.as_deref(),
            Some(&format!("in {}", column.parent_fqname)),
            None,
            Some(&parent_id),
        );
        batch.stage(child, &mut seen)?;
    }

    for (parent_fqname, parts) in signature_parts {
        let index = batch.by_fqname[&parent_fqname];
        let staged = &mut batch.objects[index].normalized;
        if staged.signature.is_none() {
            staged.signature = Some(normalize_signature(&format!("({})", parts.join(", "))));
        }
    }

    for constraint in &bundle.constraints {
        let Some((parent_id, parent_schema, parent_name)) = batch.parent(&constraint.parent_fqname)
        else {
            continue;
        };

        batch.constraints.push(ConstraintRow {
            object_id: parent_id.clone(),
            constraint_name: constraint.constraint_name.clone(),
            constraint_type: constraint.kind.clone(),
            definition: constraint.definition.clone(),
            columns_json: serde_json::to_string(&constraint.columns)?,
            ref_columns_json: serde_json::to_string(&constraint.ref_columns)?,
        });

        let parent_index = batch.by_fqname[&constraint.parent_fqname];
        batch.objects[parent_index].defs.push(format!(
            "constraint {} {}",
            constraint.constraint_name, constraint.definition
        ));

        let child = normalize_object(
            &source.name,
            parent_schema.as_deref(),
            &format!("{parent_name}.{}", constraint.constraint_name),
            ObjectKind::Constraint,
            Some(&constraint.definition),
            None,
            Some(&format!("({})", constraint.columns.join(", "))),
            None,
            Some(&parent_id),
        );
        batch.stage(child, &mut seen)?;
    }

    for index_meta in &bundle.indexes {
        let Some((parent_id, parent_schema, parent_name)) = batch.parent(&index_meta.parent_fqname)
        else {
            continue;
        };

        batch.indexes.push(IndexRow {
            object_id: parent_id.clone(),
            index_name: index_meta.index_name.clone(),
            definition: index_meta.definition.clone(),
            is_unique: index_meta.is_unique,
            is_primary: index_meta.is_primary,
            columns_json: serde_json::to_string(&index_meta.columns)?,
        });

        let parent_index = batch.by_fqname[&index_meta.parent_fqname];
        batch.objects[parent_index].defs.push(format!(
            "index {} {}",
            index_meta.index_name, index_meta.definition
        ));

        let child = normalize_object(
            &source.name,
            parent_schema.as_deref(),
            &format!("{parent_name}.{}", index_meta.index_name),
            ObjectKind::Index,
            Some(&index_meta.definition),
            None,
            Some(&format!("({})", index_meta.columns.join(", "))),
            None,
            Some(&parent_id),
        );
        let child_index = batch.stage(child, &mut seen)?;
        let child_id = batch.objects[child_index].normalized.object_id.clone();

        // index_on edge: index -> indexed relation.
        batch.dependencies.push(DependencyRow {
            from_object_id: child_id,
            to_object_id: parent_id,
            kind: "index_on".to_string(),
        });
    }

    for dep in &bundle.dependencies {
        let from = batch.parent(&dep.from_fqname);
        let to = batch.parent(&dep.to_fqname);
        if let (Some((from_id, _, _)), Some((to_id, _, _))) = (from, to) {
            batch.dependencies.push(DependencyRow {
                from_object_id: from_id,
                to_object_id: to_id,
                kind: dep.kind.clone(),
            });
        }
    }

    Ok(batch)
}

fn assemble_docs(
    batch: &SourceBatch,
    contexts: &[ContextRecord],
    source_name: &str,
) -> Vec<LexicalDoc> {
    batch
        .objects
        .iter()
        .map(|staged| {
            let normalized = &staged.normalized;
            let obj_ref = ObjectRef {
                source: source_name,
                schema: normalized.schema_name.as_deref(),
                object_name: &normalized.object_name,
                object_id: &normalized.object_id,
            };
            let context_col = resolve_effective_context(contexts, &obj_ref);

            let name_col = if normalized.fqname == normalized.object_name {
                normalized.fqname.clone()
            } else {
                format!("{}\n{}", normalized.fqname, normalized.object_name)
            };

            let mut defs_parts: Vec<&str> = Vec::new();
            if let Some(signature) = normalized.signature.as_deref() {
                if !signature.is_empty() {
                    defs_parts.push(signature);
                }
            }
            defs_parts.extend(staged.defs.iter().map(String::as_str).filter(|s| !s.is_empty()));
            let defs_col = defs_parts.join("\n");

            LexicalDoc {
                object_id: normalized.object_id.clone(),
                schema_name: normalized.schema_name.clone(),
                kind: normalized.kind.as_str().to_string(),
                name_col,
                comment_col: normalized.comment.clone(),
                defs_col,
                context_col,
            }
        })
        .collect()
}

fn dense_source_text(doc: &LexicalDoc) -> String {
    [
        doc.name_col.as_str(),
        doc.comment_col.as_str(),
        doc.defs_col.as_str(),
        doc.context_col.as_str(),
    ]
    .iter()
    .filter(|part| !part.is_empty())
    .copied()
    .collect::<Vec<_>>()
    .join("\n")
}

async fn prior_vectors(
    pool: &SqlitePool,
    source_id: i64,
) -> Result<HashMap<String, (String, String, String)>> {
    let rows = sqlx::query(
        r#"
        SELECT ov.object_id, ov.embedding, ov.model, ov.source_text_hash
        FROM object_vectors ov
        JOIN db_objects o ON o.id = ov.object_id
        WHERE o.source_id = ?
        "#,
    )
    .bind(source_id)
    .fetch_all(pool)
    .await?;

    let mut map = HashMap::new();
    for row in rows {
        let blob: Vec<u8> = row.get("embedding");
        let Ok(payload) = String::from_utf8(blob) else {
            continue;
        };
        let model: String = row.get("model");
        let hash: String = row.get("source_text_hash");
        let object_id: String = row.get("object_id");
        map.insert(object_id, (payload, model, hash));
    }
    Ok(map)
}

/// Rebuild the catalog rows for one source atomically.
pub async fn rebuild_source_index(
    pool: &SqlitePool,
    source: &SourceRecord,
    bundle: &IntrospectionBundle,
    contexts: &[ContextRecord],
    embedder: &dyn Embedder,
) -> Result<UpdateStats> {
    let batch = stage_bundle(source, bundle)?;
    let docs = assemble_docs(&batch, contexts, &source.name);
    let previous = prior_vectors(pool, source.id).await?;

    // Embed before opening the write transaction; embedding is CPU-bound
    // and must not hold the writer slot.
    let mut vectors: Vec<VectorRow> = Vec::with_capacity(docs.len());
    for doc in &docs {
        let text = dense_source_text(doc);
        let hash = source_text_hash(&text);
        let reusable = previous.get(&doc.object_id).and_then(|(payload, model, old_hash)| {
            (model == embedder.model_id() && *old_hash == hash).then(|| payload.clone())
        });
        let (payload, reused) = match reusable {
            Some(payload) => (payload, true),
            None => {
                let vector = embedder
                    .embed(&text)
                    .map_err(|e| Error::IndexBuild(format!("embedding {}: {e}", doc.object_id)))?;
                (to_json_vector(&vector), false)
            }
        };
        vectors.push(VectorRow {
            object_id: doc.object_id.clone(),
            payload,
            model: embedder.model_id().to_string(),
            hash,
            reused,
        });
    }

    let vec_native = db::has_vec_functions(pool).await;
    let mut tx = pool.begin().await?;

    // FTS rows are not covered by foreign keys; clear them while the
    // lexical_docs rows still identify this source's documents.
    sqlx::query(
        "DELETE FROM objects_fts WHERE object_id IN (SELECT object_id FROM lexical_docs WHERE source_id = ?)",
    )
    .bind(source.id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM db_objects WHERE source_id = ?")
        .bind(source.id)
        .execute(&mut *tx)
        .await?;

    for staged in &batch.objects {
        let normalized = &staged.normalized;
        sqlx::query(
            r#"
            INSERT INTO db_objects(
                id, source_id, schema_name, object_name, object_type, fqname,
                parent_object_id, definition, comment, signature, owner, updated_at
            ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            "#,
        )
        .bind(&normalized.object_id)
        .bind(source.id)
        .bind(&normalized.schema_name)
        .bind(&normalized.object_name)
        .bind(normalized.kind.as_str())
        .bind(&normalized.fqname)
        .bind(&normalized.parent_object_id)
        .bind(&normalized.definition)
        .bind(&normalized.comment)
        .bind(&normalized.signature)
        .bind(&normalized.owner)
        .execute(&mut *tx)
        .await?;
    }

    for column in &batch.columns {
        sqlx::query(
            r#"
            INSERT INTO columns(
                object_id, column_name, data_type, is_nullable,
                ordinal_position, default_expr, comment
            ) VALUES(?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&column.object_id)
        .bind(&column.column_name)
        .bind(&column.data_type)
        .bind(column.is_nullable)
        .bind(column.ordinal_position)
        .bind(&column.default_expr)
        .bind(&column.comment)
        .execute(&mut *tx)
        .await?;
    }

    for constraint in &batch.constraints {
        sqlx::query(
            r#"
            INSERT INTO constraints(
                object_id, constraint_name, constraint_type,
                definition, columns_json, ref_columns_json
            ) VALUES(?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&constraint.object_id)
        .bind(&constraint.constraint_name)
        .bind(&constraint.constraint_type)
        .bind(&constraint.definition)
        .bind(&constraint.columns_json)
        .bind(&constraint.ref_columns_json)
        .execute(&mut *tx)
        .await?;
    }

    for index_row in &batch.indexes {
        sqlx::query(
            r#"
            INSERT INTO indexes(
                object_id, index_name, definition, is_unique, is_primary, columns_json
            ) VALUES(?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&index_row.object_id)
        .bind(&index_row.index_name)
        .bind(&index_row.definition)
        .bind(index_row.is_unique)
        .bind(index_row.is_primary)
        .bind(&index_row.columns_json)
        .execute(&mut *tx)
        .await?;
    }

    for dep in &batch.dependencies {
        sqlx::query(
            "INSERT INTO dependencies(from_object_id, to_object_id, kind) VALUES(?, ?, ?)",
        )
        .bind(&dep.from_object_id)
        .bind(&dep.to_object_id)
        .bind(&dep.kind)
        .execute(&mut *tx)
        .await?;
    }

    for doc in &docs {
        if !doc.context_col.is_empty() {
            sqlx::query(
                "INSERT INTO object_context_effective(object_id, context_text) VALUES(?, ?)",
            )
            .bind(&doc.object_id)
            .bind(&doc.context_col)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO lexical_docs(
                object_id, source_id, name_col, comment_col, defs_col, context_col
            ) VALUES(?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.object_id)
        .bind(source.id)
        .bind(&doc.name_col)
        .bind(&doc.comment_col)
        .bind(&doc.defs_col)
        .bind(&doc.context_col)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO objects_fts(
                object_id, source_name, schema_name, kind,
                name_col, comment_col, defs_col, context_col
            ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.object_id)
        .bind(&source.name)
        .bind(&doc.schema_name)
        .bind(&doc.kind)
        .bind(&doc.name_col)
        .bind(&doc.comment_col)
        .bind(&doc.defs_col)
        .bind(&doc.context_col)
        .execute(&mut *tx)
        .await?;
    }

    let mut vectors_reused = 0i64;
    for vector in &vectors {
        if vector.reused {
            vectors_reused += 1;
        }
        if vec_native {
            sqlx::query(
                r#"
                INSERT INTO object_vectors(object_id, embedding, model, source_text_hash)
                VALUES(?, vec_f32(?), ?, ?)
                "#,
            )
            .bind(&vector.object_id)
            .bind(&vector.payload)
            .bind(&vector.model)
            .bind(&vector.hash)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO object_vectors(object_id, embedding, model, source_text_hash)
                VALUES(?, ?, ?, ?)
                "#,
            )
            .bind(&vector.object_id)
            .bind(vector.payload.as_bytes())
            .bind(&vector.model)
            .bind(&vector.hash)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    debug!(
        source = %source.name,
        objects = batch.objects.len(),
        "source rebuild committed"
    );

    Ok(UpdateStats {
        objects: batch.objects.len() as i64,
        columns: batch.columns.len() as i64,
        constraints: batch.constraints.len() as i64,
        indexes: batch.indexes.len() as i64,
        dependencies: batch.dependencies.len() as i64,
        vectors: vectors.len() as i64,
        vectors_reused,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::{ColumnMeta, IntrospectedObject};

    fn source() -> SourceRecord {
        SourceRecord {
            id: 1,
            name: "work".to_string(),
            dsn: "postgresql://ro@h/db".to_string(),
            include_schemas: Vec::new(),
            skip_patterns: Vec::new(),
            created_at: String::new(),
            updated_at: String::new(),
            last_indexed_at: None,
            last_error: None,
        }
    }

    fn table(schema: &str, name: &str) -> IntrospectedObject {
        IntrospectedObject {
            schema_name: Some(schema.to_string()),
            object_name: name.to_string(),
            kind: ObjectKind::Table,
            definition: None,
            comment: Some(format!("{name} table")),
            signature: None,
            owner: None,
        }
    }

    #[test]
    fn duplicate_identity_is_a_schema_conflict() {
        let bundle = IntrospectionBundle {
            objects: vec![table("sales", "orders"), table("sales", "orders")],
            ..Default::default()
        };
        let err = stage_bundle(&source(), &bundle).unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(_)));
    }

    #[test]
    fn columns_become_child_objects_with_parent_ids() {
        let bundle = IntrospectionBundle {
            objects: vec![table("sales", "orders")],
            columns: vec![ColumnMeta {
                parent_fqname: "sales.orders".to_string(),
                column_name: "id".to_string(),
                data_type: "BIGINT".to_string(),
                is_nullable: false,
                ordinal_position: 1,
                default_expr: None,
                comment: None,
            }],
            ..Default::default()
        };
        let batch = stage_bundle(&source(), &bundle).unwrap();
        assert_eq!(batch.objects.len(), 2);

        let parent = &batch.objects[0].normalized;
        let child = &batch.objects[1].normalized;
        assert_eq!(child.kind, ObjectKind::Column);
        assert_eq!(child.fqname, "sales.orders.id");
        assert_eq!(child.parent_object_id.as_deref(), Some(parent.object_id.as_str()));
        // Table signature synthesized from the declared column list.
        assert_eq!(parent.signature.as_deref(), Some("(id bigint)"));
    }

    #[test]
    fn lexical_docs_carry_all_four_fields() {
        let bundle = IntrospectionBundle {
            objects: vec![table("sales", "orders")],
            columns: vec![ColumnMeta {
                parent_fqname: "sales.orders".to_string(),
                column_name: "total_cents".to_string(),
                data_type: "bigint".to_string(),
                is_nullable: false,
                ordinal_position: 1,
                default_expr: Some("0".to_string()),
                comment: None,
            }],
            ..Default::default()
        };
        let batch = stage_bundle(&source(), &bundle).unwrap();
        let contexts = vec![ContextRecord {
            id: 1,
            target_uri: "qpg://work/sales.orders".to_string(),
            body: "Customer orders.".to_string(),
            created_at: String::new(),
        }];
        let docs = assemble_docs(&batch, &contexts, "work");

        let orders = &docs[0];
        assert!(orders.name_col.contains("sales.orders"));
        assert!(orders.name_col.contains("orders"));
        assert_eq!(orders.comment_col, "orders table");
        assert!(orders.defs_col.contains("column total_cents bigint default=0"));
        assert_eq!(orders.context_col, "Customer orders.");

        // The child column inherits the owning table's context.
        let column_doc = &docs[1];
        assert_eq!(column_doc.context_col, "Customer orders.");
        assert!(column_doc.defs_col.contains("in sales.orders"));
    }

    #[test]
    fn dense_text_skips_empty_parts() {
        let doc = LexicalDoc {
            object_id: "x".to_string(),
            schema_name: None,
            kind: "schema".to_string(),
            name_col: "public".to_string(),
            comment_col: String::new(),
            defs_col: String::new(),
            context_col: "Note.".to_string(),
        };
        assert_eq!(dense_source_text(&doc), "public\nNote.");
    }
}
