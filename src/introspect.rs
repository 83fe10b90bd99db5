//! Source database introspection.
//!
//! Issues a fixed set of read-only queries against the PostgreSQL system
//! catalogs and collects the results into an [`IntrospectionBundle`]. Each
//! section is fetched independently; a failing section becomes a warning
//! rather than aborting the whole run. Filtering by `include_schemas` and
//! `skip_patterns` happens after collection so child rows and dependency
//! edges stay consistent with the surviving objects.

use globset::{Glob, GlobSet, GlobSetBuilder};
use sqlx::{PgPool, Row};

use crate::error::{Error, Result};
use crate::normalize::{make_fqname, ObjectKind};

#[derive(Debug, Clone)]
pub struct IntrospectedObject {
    pub schema_name: Option<String>,
    pub object_name: String,
    pub kind: ObjectKind,
    pub definition: Option<String>,
    pub comment: Option<String>,
    pub signature: Option<String>,
    pub owner: Option<String>,
}

impl IntrospectedObject {
    pub fn fqname(&self) -> String {
        make_fqname(self.schema_name.as_deref(), &self.object_name)
    }
}

#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub parent_fqname: String,
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub ordinal_position: i32,
    pub default_expr: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConstraintMeta {
    pub parent_fqname: String,
    pub constraint_name: String,
    /// One of `pk | fk | unique | check`.
    pub kind: String,
    pub definition: String,
    pub columns: Vec<String>,
    /// Target columns, populated for `fk` constraints.
    pub ref_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IndexMeta {
    pub parent_fqname: String,
    pub index_name: String,
    pub definition: String,
    pub is_unique: bool,
    pub is_primary: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DependencyMeta {
    pub from_fqname: String,
    pub to_fqname: String,
    /// One of `fk | view_ref | function_uses` (plus synthesized `index_on`
    /// edges added at build time).
    pub kind: String,
}

#[derive(Debug, Clone, Default)]
pub struct IntrospectionBundle {
    pub objects: Vec<IntrospectedObject>,
    pub columns: Vec<ColumnMeta>,
    pub constraints: Vec<ConstraintMeta>,
    pub indexes: Vec<IndexMeta>,
    pub dependencies: Vec<DependencyMeta>,
    pub warnings: Vec<String>,
}

const SCHEMA_SQL: &str = r#"
SELECT n.nspname::text AS schema_name,
       n.nspname::text AS object_name,
       NULL::text AS definition,
       obj_description(n.oid, 'pg_namespace') AS comment,
       pg_get_userbyid(n.nspowner)::text AS owner
FROM pg_namespace n
WHERE n.nspname !~ '^pg_'
  AND n.nspname <> 'information_schema'
ORDER BY n.nspname
"#;

const RELATION_SQL: &str = r#"
SELECT n.nspname::text AS schema_name,
       c.relname::text AS object_name,
       (c.relkind IN ('v', 'm'))::bool AS is_view,
       CASE
            WHEN c.relkind IN ('v', 'm') THEN pg_get_viewdef(c.oid, true)
            ELSE NULL
       END AS definition,
       obj_description(c.oid, 'pg_class') AS comment,
       pg_get_userbyid(c.relowner)::text AS owner
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE c.relkind IN ('r', 'p', 'v', 'm', 'f')
  AND n.nspname !~ '^pg_'
  AND n.nspname <> 'information_schema'
ORDER BY n.nspname, c.relname
"#;

const EXTENSION_SQL: &str = r#"
SELECT n.nspname::text AS schema_name,
       e.extname::text AS object_name,
       ('version=' || e.extversion)::text AS definition,
       obj_description(e.oid, 'pg_extension') AS comment
FROM pg_extension e
JOIN pg_namespace n ON n.oid = e.extnamespace
ORDER BY e.extname
"#;

const FUNCTION_SQL: &str = r#"
SELECT n.nspname::text AS schema_name,
       (p.proname || '(' || pg_get_function_identity_arguments(p.oid) || ')')::text AS object_name,
       pg_get_functiondef(p.oid) AS definition,
       obj_description(p.oid, 'pg_proc') AS comment,
       pg_get_function_identity_arguments(p.oid)::text AS signature,
       pg_get_userbyid(p.proowner)::text AS owner
FROM pg_proc p
JOIN pg_namespace n ON n.oid = p.pronamespace
WHERE n.nspname !~ '^pg_'
  AND n.nspname <> 'information_schema'
  AND p.prokind IN ('f', 'p')
ORDER BY n.nspname, p.proname, pg_get_function_identity_arguments(p.oid)
"#;

const COLUMN_SQL: &str = r#"
SELECT n.nspname::text AS schema_name,
       c.relname::text AS table_name,
       a.attname::text AS column_name,
       format_type(a.atttypid, a.atttypmod)::text AS data_type,
       (NOT a.attnotnull)::bool AS is_nullable,
       a.attnum::int AS ordinal_position,
       pg_get_expr(ad.adbin, ad.adrelid) AS default_expr,
       col_description(a.attrelid, a.attnum) AS comment
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_attrdef ad ON ad.adrelid = a.attrelid AND ad.adnum = a.attnum
WHERE c.relkind IN ('r', 'p', 'v', 'm', 'f')
  AND a.attnum > 0
  AND NOT a.attisdropped
  AND n.nspname !~ '^pg_'
  AND n.nspname <> 'information_schema'
ORDER BY n.nspname, c.relname, a.attnum
"#;

const CONSTRAINT_SQL: &str = r#"
SELECT n.nspname::text AS schema_name,
       c.relname::text AS table_name,
       con.conname::text AS constraint_name,
       CASE con.contype
            WHEN 'p' THEN 'pk'
            WHEN 'f' THEN 'fk'
            WHEN 'u' THEN 'unique'
            ELSE 'check'
       END::text AS constraint_type,
       pg_get_constraintdef(con.oid, true)::text AS definition,
       COALESCE(
         ARRAY(
            SELECT att.attname::text
            FROM unnest(con.conkey) WITH ORDINALITY AS keys(attnum, ord)
            JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = keys.attnum
            ORDER BY keys.ord
         ),
         ARRAY[]::text[]
       ) AS columns,
       COALESCE(
         ARRAY(
            SELECT att.attname::text
            FROM unnest(con.confkey) WITH ORDINALITY AS keys(attnum, ord)
            JOIN pg_attribute att ON att.attrelid = con.confrelid AND att.attnum = keys.attnum
            ORDER BY keys.ord
         ),
         ARRAY[]::text[]
       ) AS ref_columns
FROM pg_constraint con
JOIN pg_class c ON c.oid = con.conrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname !~ '^pg_'
  AND n.nspname <> 'information_schema'
ORDER BY n.nspname, c.relname, con.conname
"#;

const INDEX_SQL: &str = r#"
SELECT n.nspname::text AS schema_name,
       t.relname::text AS table_name,
       i.relname::text AS index_name,
       pg_get_indexdef(i.oid)::text AS definition,
       ix.indisunique AS is_unique,
       ix.indisprimary AS is_primary,
       COALESCE(
         ARRAY(
            SELECT att.attname::text
            FROM unnest(ix.indkey) WITH ORDINALITY AS keys(attnum, ord)
            JOIN pg_attribute att ON att.attrelid = t.oid AND att.attnum = keys.attnum
            WHERE keys.attnum > 0
            ORDER BY keys.ord
         ),
         ARRAY[]::text[]
       ) AS columns
FROM pg_index ix
JOIN pg_class t ON t.oid = ix.indrelid
JOIN pg_class i ON i.oid = ix.indexrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
WHERE n.nspname !~ '^pg_'
  AND n.nspname <> 'information_schema'
ORDER BY n.nspname, t.relname, i.relname
"#;

const FK_DEPENDENCY_SQL: &str = r#"
SELECT (src_ns.nspname || '.' || src.relname)::text AS from_fqname,
       (dst_ns.nspname || '.' || dst.relname)::text AS to_fqname
FROM pg_constraint con
JOIN pg_class src ON src.oid = con.conrelid
JOIN pg_namespace src_ns ON src_ns.oid = src.relnamespace
JOIN pg_class dst ON dst.oid = con.confrelid
JOIN pg_namespace dst_ns ON dst_ns.oid = dst.relnamespace
WHERE con.contype = 'f'
  AND src_ns.nspname !~ '^pg_'
  AND src_ns.nspname <> 'information_schema'
ORDER BY from_fqname, to_fqname
"#;

const VIEW_DEPENDENCY_SQL: &str = r#"
SELECT DISTINCT (vn.nspname || '.' || v.relname)::text AS from_fqname,
       (tn.nspname || '.' || t.relname)::text AS to_fqname
FROM pg_depend d
JOIN pg_rewrite r ON r.oid = d.objid
JOIN pg_class v ON v.oid = r.ev_class
JOIN pg_namespace vn ON vn.oid = v.relnamespace
JOIN pg_class t ON t.oid = d.refobjid
JOIN pg_namespace tn ON tn.oid = t.relnamespace
WHERE d.classid = 'pg_rewrite'::regclass
  AND d.refclassid = 'pg_class'::regclass
  AND v.relkind IN ('v', 'm')
  AND v.oid <> t.oid
  AND vn.nspname !~ '^pg_'
  AND vn.nspname <> 'information_schema'
  AND tn.nspname !~ '^pg_'
  AND tn.nspname <> 'information_schema'
ORDER BY from_fqname, to_fqname
"#;

const FUNCTION_DEPENDENCY_SQL: &str = r#"
SELECT DISTINCT (pn.nspname || '.' || p.proname || '('
           || pg_get_function_identity_arguments(p.oid) || ')')::text AS from_fqname,
       (tn.nspname || '.' || t.relname)::text AS to_fqname
FROM pg_depend d
JOIN pg_proc p ON p.oid = d.objid
JOIN pg_namespace pn ON pn.oid = p.pronamespace
JOIN pg_class t ON t.oid = d.refobjid
JOIN pg_namespace tn ON tn.oid = t.relnamespace
WHERE d.classid = 'pg_proc'::regclass
  AND d.refclassid = 'pg_class'::regclass
  AND pn.nspname !~ '^pg_'
  AND pn.nspname <> 'information_schema'
  AND tn.nspname !~ '^pg_'
  AND tn.nspname <> 'information_schema'
ORDER BY from_fqname, to_fqname
"#;

/// Enumerate all DDL-level objects visible to the connected role.
pub async fn introspect_schema(pool: &PgPool, include_functions: bool) -> IntrospectionBundle {
    let mut bundle = IntrospectionBundle::default();

    match sqlx::query(SCHEMA_SQL).fetch_all(pool).await {
        Ok(rows) => {
            for row in rows {
                bundle.objects.push(IntrospectedObject {
                    schema_name: row.get("schema_name"),
                    object_name: row.get("object_name"),
                    kind: ObjectKind::Schema,
                    definition: row.get("definition"),
                    comment: row.get("comment"),
                    signature: None,
                    owner: row.get("owner"),
                });
            }
        }
        Err(e) => bundle.warnings.push(format!("schemas: {e}")),
    }

    match sqlx::query(RELATION_SQL).fetch_all(pool).await {
        Ok(rows) => {
            for row in rows {
                let is_view: bool = row.get("is_view");
                bundle.objects.push(IntrospectedObject {
                    schema_name: row.get("schema_name"),
                    object_name: row.get("object_name"),
                    kind: if is_view {
                        ObjectKind::View
                    } else {
                        ObjectKind::Table
                    },
                    definition: row.get("definition"),
                    comment: row.get("comment"),
                    signature: None,
                    owner: row.get("owner"),
                });
            }
        }
        Err(e) => bundle.warnings.push(format!("relations: {e}")),
    }

    match sqlx::query(EXTENSION_SQL).fetch_all(pool).await {
        Ok(rows) => {
            for row in rows {
                bundle.objects.push(IntrospectedObject {
                    schema_name: row.get("schema_name"),
                    object_name: row.get("object_name"),
                    kind: ObjectKind::Extension,
                    definition: row.get("definition"),
                    comment: row.get("comment"),
                    signature: None,
                    owner: None,
                });
            }
        }
        Err(e) => bundle.warnings.push(format!("extensions: {e}")),
    }

    if include_functions {
        match sqlx::query(FUNCTION_SQL).fetch_all(pool).await {
            Ok(rows) => {
                for row in rows {
                    bundle.objects.push(IntrospectedObject {
                        schema_name: row.get("schema_name"),
                        object_name: row.get("object_name"),
                        kind: ObjectKind::Function,
                        definition: row.get("definition"),
                        comment: row.get("comment"),
                        signature: row.get("signature"),
                        owner: row.get("owner"),
                    });
                }
            }
            Err(e) => bundle.warnings.push(format!("functions: {e}")),
        }
    }

    match sqlx::query(COLUMN_SQL).fetch_all(pool).await {
        Ok(rows) => {
            for row in rows {
                let schema: String = row.get("schema_name");
                let table: String = row.get("table_name");
                bundle.columns.push(ColumnMeta {
                    parent_fqname: format!("{schema}.{table}"),
                    column_name: row.get("column_name"),
                    data_type: row.get("data_type"),
                    is_nullable: row.get("is_nullable"),
                    ordinal_position: row.get("ordinal_position"),
                    default_expr: row.get("default_expr"),
                    comment: row.get("comment"),
                });
            }
        }
        Err(e) => bundle.warnings.push(format!("columns: {e}")),
    }

    match sqlx::query(CONSTRAINT_SQL).fetch_all(pool).await {
        Ok(rows) => {
            for row in rows {
                let schema: String = row.get("schema_name");
                let table: String = row.get("table_name");
                let kind: String = row.get("constraint_type");
                let ref_columns: Vec<String> = if kind == "fk" {
                    row.get("ref_columns")
                } else {
                    Vec::new()
                };
                bundle.constraints.push(ConstraintMeta {
                    parent_fqname: format!("{schema}.{table}"),
                    constraint_name: row.get("constraint_name"),
                    kind,
                    definition: row.get("definition"),
                    columns: row.get("columns"),
                    ref_columns,
                });
            }
        }
        Err(e) => bundle.warnings.push(format!("constraints: {e}")),
    }

    match sqlx::query(INDEX_SQL).fetch_all(pool).await {
        Ok(rows) => {
            for row in rows {
                let schema: String = row.get("schema_name");
                let table: String = row.get("table_name");
                bundle.indexes.push(IndexMeta {
                    parent_fqname: format!("{schema}.{table}"),
                    index_name: row.get("index_name"),
                    definition: row.get("definition"),
                    is_unique: row.get("is_unique"),
                    is_primary: row.get("is_primary"),
                    columns: row.get("columns"),
                });
            }
        }
        Err(e) => bundle.warnings.push(format!("indexes: {e}")),
    }

    for (section, sql, kind) in [
        ("fk dependencies", FK_DEPENDENCY_SQL, "fk"),
        ("view dependencies", VIEW_DEPENDENCY_SQL, "view_ref"),
        (
            "function dependencies",
            FUNCTION_DEPENDENCY_SQL,
            "function_uses",
        ),
    ] {
        match sqlx::query(sql).fetch_all(pool).await {
            Ok(rows) => {
                for row in rows {
                    bundle.dependencies.push(DependencyMeta {
                        from_fqname: row.get("from_fqname"),
                        to_fqname: row.get("to_fqname"),
                        kind: kind.to_string(),
                    });
                }
            }
            Err(e) => bundle.warnings.push(format!("{section}: {e}")),
        }
    }

    bundle
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    let patterns: Vec<&String> = patterns.iter().filter(|p| !p.trim().is_empty()).collect();
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern.trim())
            .map_err(|e| Error::Config(format!("invalid skip pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| Error::Config(format!("invalid skip patterns: {e}")))?;
    Ok(Some(set))
}

/// Apply a source's `include_schemas` and `skip_patterns` to the bundle.
///
/// Child rows and dependency edges are dropped along with their parents;
/// dependencies survive only when both endpoints survive.
pub fn apply_filters(
    bundle: IntrospectionBundle,
    include_schemas: &[String],
    skip_patterns: &[String],
) -> Result<IntrospectionBundle> {
    let schemas: std::collections::HashSet<&str> = include_schemas
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let globs = build_globset(skip_patterns)?;

    if schemas.is_empty() && globs.is_none() {
        return Ok(bundle);
    }

    let allowed = |obj: &IntrospectedObject| -> bool {
        if !schemas.is_empty() {
            match obj.schema_name.as_deref() {
                Some(schema) if schemas.contains(schema) => {}
                _ => return false,
            }
        }
        if let Some(globs) = &globs {
            if globs.is_match(obj.fqname()) || globs.is_match(&obj.object_name) {
                return false;
            }
        }
        true
    };

    let mut filtered = IntrospectionBundle {
        warnings: bundle.warnings.clone(),
        ..Default::default()
    };
    filtered.objects = bundle.objects.into_iter().filter(|o| allowed(o)).collect();

    let surviving: std::collections::HashSet<String> =
        filtered.objects.iter().map(|o| o.fqname()).collect();

    filtered.columns = bundle
        .columns
        .into_iter()
        .filter(|c| surviving.contains(&c.parent_fqname))
        .collect();
    filtered.constraints = bundle
        .constraints
        .into_iter()
        .filter(|c| surviving.contains(&c.parent_fqname))
        .collect();
    filtered.indexes = bundle
        .indexes
        .into_iter()
        .filter(|i| surviving.contains(&i.parent_fqname))
        .collect();
    filtered.dependencies = bundle
        .dependencies
        .into_iter()
        .filter(|d| surviving.contains(&d.from_fqname) && surviving.contains(&d.to_fqname))
        .collect();

    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(schema: &str, name: &str, kind: ObjectKind) -> IntrospectedObject {
        IntrospectedObject {
            schema_name: Some(schema.to_string()),
            object_name: name.to_string(),
            kind,
            definition: None,
            comment: None,
            signature: None,
            owner: None,
        }
    }

    fn sample_bundle() -> IntrospectionBundle {
        IntrospectionBundle {
            objects: vec![
                object("sales", "orders", ObjectKind::Table),
                object("sales", "orders_audit", ObjectKind::Table),
                object("internal", "secrets", ObjectKind::Table),
            ],
            columns: vec![ColumnMeta {
                parent_fqname: "sales.orders".to_string(),
                column_name: "id".to_string(),
                data_type: "bigint".to_string(),
                is_nullable: false,
                ordinal_position: 1,
                default_expr: None,
                comment: None,
            }],
            dependencies: vec![DependencyMeta {
                from_fqname: "sales.orders_audit".to_string(),
                to_fqname: "sales.orders".to_string(),
                kind: "fk".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn no_filters_is_identity() {
        let bundle = apply_filters(sample_bundle(), &[], &[]).unwrap();
        assert_eq!(bundle.objects.len(), 3);
        assert_eq!(bundle.dependencies.len(), 1);
    }

    #[test]
    fn include_schemas_drops_other_schemas() {
        let bundle =
            apply_filters(sample_bundle(), &["sales".to_string()], &[]).unwrap();
        assert_eq!(bundle.objects.len(), 2);
        assert!(bundle.objects.iter().all(|o| o.schema_name.as_deref() == Some("sales")));
    }

    #[test]
    fn skip_patterns_match_fqname_and_bare_name() {
        let bundle =
            apply_filters(sample_bundle(), &[], &["*_audit".to_string()]).unwrap();
        assert!(!bundle.objects.iter().any(|o| o.object_name == "orders_audit"));
        // The fk edge lost an endpoint.
        assert!(bundle.dependencies.is_empty());

        let bundle =
            apply_filters(sample_bundle(), &[], &["sales.orders".to_string()]).unwrap();
        assert!(!bundle.objects.iter().any(|o| o.fqname() == "sales.orders"));
        // Child columns follow their parent out.
        assert!(bundle.columns.is_empty());
    }

    #[test]
    fn invalid_glob_is_a_config_error() {
        let err = apply_filters(sample_bundle(), &[], &["[bad".to_string()]).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn warnings_survive_filtering() {
        let mut bundle = sample_bundle();
        bundle.warnings.push("functions: permission denied".to_string());
        let filtered = apply_filters(bundle, &["sales".to_string()], &[]).unwrap();
        assert_eq!(filtered.warnings.len(), 1);
    }
}
