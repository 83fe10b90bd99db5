//! Catalog schema migrations.
//!
//! Creates all required tables and ensures idempotent execution. The table
//! set is stable and versioned via `PRAGMA user_version`; a catalog written
//! by a newer qpg is refused rather than silently reinterpreted.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `sources` | Registered PostgreSQL sources and bookkeeping |
//! | `db_objects` | Canonical records of indexed schema objects |
//! | `columns` / `constraints` / `indexes` | Child records keyed by owner |
//! | `dependencies` | Directed edges (`fk`, `view_ref`, `function_uses`, `index_on`) |
//! | `contexts` | Operator-authored semantic notes |
//! | `object_context_effective` | Materialized inherited context per object |
//! | `lexical_docs` | Four-field lexical documents per object |
//! | `objects_fts` | FTS5 view over the lexical documents (BM25) |
//! | `object_vectors` | Dense embeddings with staleness hashes |
//! | `llm_cache` | Response cache for the optional LLM collaborator |

use sqlx::SqlitePool;

use crate::error::{Error, Result};

/// Current catalog schema version. Bump on any DDL change.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all catalog migrations. Safe to call multiple times.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    if version > SCHEMA_VERSION {
        return Err(Error::Other(format!(
            "catalog schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    let ddl = [
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            dsn TEXT NOT NULL,
            include_schemas_json TEXT,
            skip_patterns_json TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            last_indexed_at TEXT,
            last_error TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS db_objects (
            id TEXT PRIMARY KEY,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            schema_name TEXT,
            object_name TEXT NOT NULL,
            object_type TEXT NOT NULL,
            fqname TEXT NOT NULL,
            parent_object_id TEXT REFERENCES db_objects(id) ON DELETE CASCADE,
            definition TEXT,
            comment TEXT,
            signature TEXT,
            owner TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE(source_id, object_type, fqname)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_db_objects_source_type ON db_objects(source_id, object_type)",
        "CREATE INDEX IF NOT EXISTS idx_db_objects_fqname ON db_objects(fqname)",
        "CREATE INDEX IF NOT EXISTS idx_db_objects_parent ON db_objects(parent_object_id)",
        r#"
        CREATE TABLE IF NOT EXISTS columns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            object_id TEXT NOT NULL REFERENCES db_objects(id) ON DELETE CASCADE,
            column_name TEXT NOT NULL,
            data_type TEXT NOT NULL,
            is_nullable INTEGER NOT NULL,
            ordinal_position INTEGER NOT NULL,
            default_expr TEXT,
            comment TEXT,
            UNIQUE(object_id, column_name)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_columns_object_id ON columns(object_id)",
        r#"
        CREATE TABLE IF NOT EXISTS constraints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            object_id TEXT NOT NULL REFERENCES db_objects(id) ON DELETE CASCADE,
            constraint_name TEXT NOT NULL,
            constraint_type TEXT NOT NULL,
            definition TEXT,
            columns_json TEXT,
            ref_columns_json TEXT,
            UNIQUE(object_id, constraint_name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS indexes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            object_id TEXT NOT NULL REFERENCES db_objects(id) ON DELETE CASCADE,
            index_name TEXT NOT NULL,
            definition TEXT,
            is_unique INTEGER NOT NULL DEFAULT 0,
            is_primary INTEGER NOT NULL DEFAULT 0,
            columns_json TEXT,
            UNIQUE(object_id, index_name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS dependencies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_object_id TEXT NOT NULL REFERENCES db_objects(id) ON DELETE CASCADE,
            to_object_id TEXT NOT NULL REFERENCES db_objects(id) ON DELETE CASCADE,
            kind TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_dependencies_from ON dependencies(from_object_id)",
        "CREATE INDEX IF NOT EXISTS idx_dependencies_to ON dependencies(to_object_id)",
        r#"
        CREATE TABLE IF NOT EXISTS contexts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_uri TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE(target_uri, body)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS object_context_effective (
            object_id TEXT PRIMARY KEY REFERENCES db_objects(id) ON DELETE CASCADE,
            context_text TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS lexical_docs (
            object_id TEXT PRIMARY KEY REFERENCES db_objects(id) ON DELETE CASCADE,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            name_col TEXT NOT NULL,
            comment_col TEXT NOT NULL,
            defs_col TEXT NOT NULL,
            context_col TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS object_vectors (
            object_id TEXT PRIMARY KEY REFERENCES db_objects(id) ON DELETE CASCADE,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL DEFAULT 'codebert-base-v1',
            source_text_hash TEXT NOT NULL DEFAULT ''
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_object_vectors_model ON object_vectors(model)",
        r#"
        CREATE TABLE IF NOT EXISTS llm_cache (
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            expires_at TEXT
        )
        "#,
    ];

    for statement in ddl {
        sqlx::query(statement).execute(pool).await?;
    }

    // FTS5 virtual tables cannot use IF NOT EXISTS on older SQLite builds.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='objects_fts'",
    )
    .fetch_one(pool)
    .await?;
    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE objects_fts USING fts5(
                object_id UNINDEXED,
                source_name UNINDEXED,
                schema_name UNINDEXED,
                kind UNINDEXED,
                name_col,
                comment_col,
                defs_col,
                context_col,
                tokenize = 'unicode61 remove_diacritics 2'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(pool)
        .await?;

    Ok(())
}
