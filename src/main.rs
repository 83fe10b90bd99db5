//! # qpg CLI
//!
//! The `qpg` binary indexes PostgreSQL schema metadata into a local catalog
//! and answers relevance-ranked queries against it.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qpg init` | Download the local embedding model assets |
//! | `qpg source add <dsn> --name N` | Register a source database |
//! | `qpg auth check` | Verify the connected role is effectively read-only |
//! | `qpg update` | Introspect sources and rebuild the local index |
//! | `qpg search "text"` | Lexical (BM25) search |
//! | `qpg vsearch "text"` | Vector (cosine) search |
//! | `qpg query "text"` | Hybrid search with RRF fusion |
//! | `qpg get <ref>` | Full object view by fqname or `#id` |
//! | `qpg context add/list/rm/generate` | Manage semantic context notes |
//! | `qpg schema` | Dump indexed objects as annotated DDL |
//! | `qpg status` | Index status and object counts |
//! | `qpg mcp [--http]` | Serve the retrieval tool surface |
//!
//! Exit codes: `0` success, `1` user error, `2` privilege-check failure,
//! `3` connection/guard violation, `4` internal.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing_subscriber::EnvFilter;

use qpg::build::{rebuild_source_index, UpdateStats};
use qpg::config::resolve_openai_settings;
use qpg::contexts::{self, ContextRecord};
use qpg::db;
use qpg::dsn::{dsn_has_password, redact_dsn};
use qpg::embedding::{self, CodebertEmbedder, Embedder};
use qpg::error::{Error, Result};
use qpg::fts;
use qpg::get;
use qpg::introspect;
use qpg::llm;
use qpg::lock::SourceLock;
use qpg::mcp::{self, McpState};
use qpg::migrate;
use qpg::normalize::ObjectKind;
use qpg::paths::{self, config_yaml_path, Paths};
use qpg::pg;
use qpg::privileges::{check_privileges, format_privilege_report};
use qpg::query::{self, SearchFilters, SearchHit};
use qpg::sources::{self, SourceRecord};
use qpg::status::status_payload;

/// qpg — query PostgreSQL schema metadata.
#[derive(Parser)]
#[command(
    name = "qpg",
    about = "Index PostgreSQL schema metadata into a local catalog and query it",
    version,
    long_about = "qpg introspects DDL-level objects from PostgreSQL through a hard \
    read-only connection guard, stores them in a local SQLite catalog, and answers \
    relevance-ranked queries with hybrid lexical + vector retrieval. It never reads \
    row data and never executes user-supplied SQL."
)]
struct Cli {
    /// Verbose logging (sets qpg=debug unless RUST_LOG is set).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and initialize local vector model assets.
    Init {
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration (secrets redacted).
    Config {
        #[arg(long)]
        json: bool,
    },

    /// Manage PostgreSQL sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Manage semantic context notes.
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// Authentication and privilege checks.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },

    /// Introspect sources and refresh the local index.
    Update {
        /// Limit the update to one source.
        #[arg(long)]
        source: Option<String>,

        /// Skip function introspection.
        #[arg(long)]
        skip_functions: bool,

        /// Rebuild sources concurrently (each still holds its own writer lock).
        #[arg(long)]
        parallel: bool,

        /// Read the PostgreSQL password from stdin (first line).
        #[arg(long)]
        password: bool,
    },

    /// Show index status and object counts.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Purge expired LLM cache entries and vacuum the catalog.
    Cleanup,

    /// Run an integrity check and rebuild the full-text index.
    Repair,

    /// Lexical (BM25) search over the index.
    Search(SearchOpts),

    /// Vector (cosine) search over the index.
    Vsearch(SearchOpts),

    /// Hybrid search: expansion, lexical + vector retrieval, RRF fusion,
    /// optional rerank hook.
    Query(SearchOpts),

    /// Get object details by `schema.object` name or `#<id>` fragment.
    Get {
        /// Object reference: fqname or `#<object_id_fragment>`.
        #[arg(value_name = "REF")]
        object_ref: String,

        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Print indexed schema objects and their definitions.
    Schema {
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Run the retrieval tool server (line-delimited JSON-RPC on stdio by
    /// default, HTTP with --http).
    Mcp {
        #[arg(long)]
        http: bool,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8765)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register a source database.
    Add {
        /// PostgreSQL DSN, e.g. `postgresql://ro@host:5432/db`.
        dsn: String,

        /// Unique name for this source.
        #[arg(long)]
        name: String,

        /// Read the password from stdin instead of embedding it in the DSN.
        /// The stored DSN never contains the password either way.
        #[arg(long)]
        password: bool,

        /// Include only this schema (repeatable; default: all non-system).
        #[arg(long = "schema")]
        schemas: Vec<String>,

        /// Skip objects matching this glob (repeatable; matched against
        /// fqname and bare object name).
        #[arg(long = "skip-pattern")]
        skip_patterns: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// List registered sources.
    List {
        #[arg(long)]
        json: bool,
    },

    /// Remove a source and everything derived from it.
    Rm { name: String },

    /// Rename a source.
    Rename { old_name: String, new_name: String },
}

#[derive(Subcommand)]
enum ContextAction {
    /// Add a context note for a `qpg://` target.
    Add {
        /// Target: `qpg://<source>`, `qpg://<source>/<schema>`, or
        /// `qpg://<source>/<schema.object>`.
        target: String,

        /// The note text.
        body: String,

        #[arg(long)]
        json: bool,
    },

    /// List context notes.
    List {
        #[arg(long)]
        json: bool,
    },

    /// Remove contexts by numeric id or target URI.
    Rm { key: String },

    /// Draft table contexts with an OpenAI-compatible model.
    Generate {
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        schema: Option<String>,

        /// Maximum number of tables to process.
        #[arg(long)]
        limit: Option<i64>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        api_key: Option<String>,

        #[arg(long)]
        base_url: Option<String>,

        /// Regenerate tables that already have a context.
        #[arg(long)]
        overwrite: bool,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// Check that the connected role holds no prohibited privileges.
    Check {
        #[arg(long)]
        source: Option<String>,

        /// Treat violations as warnings instead of failures.
        #[arg(long)]
        allow_extra_privileges: bool,

        /// Do not treat FUNCTION EXECUTE as prohibited.
        #[arg(long)]
        allow_execute: bool,

        /// Read the PostgreSQL password from stdin (first line).
        #[arg(long)]
        password: bool,

        #[arg(long)]
        json: bool,
    },
}

/// Flags shared by `search`, `vsearch`, and `query`.
#[derive(Args)]
struct SearchOpts {
    /// The query text.
    text: String,

    #[arg(long)]
    json: bool,

    /// Print matching fqnames only.
    #[arg(long)]
    files: bool,

    /// Maximum number of results.
    #[arg(short = 'n', default_value_t = 10)]
    n: i64,

    /// Return all results.
    #[arg(long)]
    all: bool,

    /// Drop results below this score (applied after fusion for `query`).
    #[arg(long)]
    min_score: Option<f64>,

    #[arg(long)]
    schema: Option<String>,

    /// Restrict to one object kind.
    #[arg(long)]
    kind: Option<String>,

    #[arg(long)]
    source: Option<String>,
}

impl SearchOpts {
    fn filters(&self) -> Result<SearchFilters> {
        if let Some(kind) = &self.kind {
            ObjectKind::parse(kind)?;
        }
        Ok(SearchFilters {
            source: self.source.clone(),
            schema: self.schema.clone(),
            kind: self.kind.clone(),
            min_score: self.min_score,
        })
    }

    fn limit(&self) -> i64 {
        if self.all {
            10_000
        } else {
            self.n.max(1)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_stdin_line() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(Error::from)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn resolve_password(from_stdin: bool) -> Result<Option<String>> {
    if from_stdin {
        let password = read_stdin_line()?;
        if password.is_empty() {
            return Err(Error::Config(
                "missing password on stdin for --password".to_string(),
            ));
        }
        return Ok(Some(password));
    }
    Ok(std::env::var("PGPASSWORD").ok().filter(|p| !p.is_empty()))
}

async fn open_catalog(paths: &Paths) -> Result<SqlitePool> {
    let pool = db::connect(&paths.index_db).await?;
    migrate::ensure_schema(&pool).await?;
    Ok(pool)
}

fn load_embedder(paths: &Paths) -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(CodebertEmbedder::new(paths)?))
}

async fn collect_sources(
    pool: &SqlitePool,
    source_name: Option<&str>,
) -> Result<Vec<SourceRecord>> {
    let selected = match source_name {
        Some(name) => vec![sources::get_source(pool, name).await?],
        None => sources::list_sources(pool).await?,
    };
    if selected.is_empty() {
        return Err(Error::Config("no sources configured".to_string()));
    }
    Ok(selected)
}

fn print_hit_rows(rows: &[SearchHit], files: bool) {
    for row in rows {
        if files {
            println!("{}", row.fqname);
        } else {
            println!(
                "{}\t{}\t{}\t{}\t{:.4}",
                row.object_id, row.fqname, row.kind, row.source, row.score
            );
        }
    }
}

async fn print_hits_detailed(pool: &SqlitePool, rows: &[SearchHit]) -> Result<()> {
    if rows.is_empty() {
        println!("no matching objects found");
        return Ok(());
    }
    for row in rows {
        let payload = get::get_object(pool, &row.fqname, Some(&row.source)).await?;
        println!(
            "{} ({}) [{}] score={:.4}",
            payload.fqname, payload.kind, payload.source, row.score
        );
        println!("description: {}", get::short_description(&payload));
        println!("definition:");
        println!("{}", get::definition_text(&payload));
        println!();
    }
    Ok(())
}

async fn cmd_init(paths: &Paths, json: bool) -> Result<()> {
    let paths_clone = paths.clone();
    let model_dir = tokio::task::spawn_blocking(move || embedding::init_model(&paths_clone))
        .await
        .map_err(|e| Error::Other(format!("init task failed: {e}")))??;

    if json {
        print_json(&serde_json::json!({
            "models_dir": paths.models_dir,
            "model_path": model_dir,
        }))?;
    } else {
        println!("initialized model: {}", model_dir.display());
    }
    Ok(())
}

fn cmd_config(json: bool) -> Result<()> {
    let settings = resolve_openai_settings(None, None, None);
    let yaml_path = config_yaml_path();
    if json {
        print_json(&serde_json::json!({
            "config_yaml_path": yaml_path,
            "config_yaml_exists": yaml_path.exists(),
            "openai": {
                "api_key_configured": settings.api_key.is_some(),
                "api_key_redacted": settings.api_key_redacted(),
                "model": settings.model,
                "base_url": settings.base_url,
            },
        }))?;
    } else {
        println!("config_yaml: {}", yaml_path.display());
        println!("config_yaml_exists: {}", yaml_path.exists());
        match settings.api_key_redacted() {
            Some(redacted) => println!("openai_api_key: set ({redacted})"),
            None => println!("openai_api_key: unset"),
        }
        println!("openai_model: {}", settings.model);
        println!("openai_base_url: {}", settings.base_url);
    }
    Ok(())
}

async fn cmd_source(pool: &SqlitePool, action: SourceAction) -> Result<()> {
    match action {
        SourceAction::Add {
            dsn,
            name,
            password,
            schemas,
            skip_patterns,
            json,
        } => {
            if password {
                if dsn_has_password(&dsn) {
                    return Err(Error::Config(
                        "do not use --password when the DSN already contains a password"
                            .to_string(),
                    ));
                }
                // Read and discard the line: the password is accepted for
                // validation but never stored with the source.
                let _ = resolve_password(true)?;
            }
            let source = sources::add_source(pool, &name, &dsn, &schemas, &skip_patterns).await?;
            if json {
                print_json(&serde_json::json!({
                    "name": source.name,
                    "dsn": redact_dsn(&source.dsn),
                    "include_schemas": source.include_schemas,
                    "skip_patterns": source.skip_patterns,
                }))?;
            } else {
                println!("added source '{}'", source.name);
            }
        }
        SourceAction::List { json } => {
            let rows = sources::list_sources(pool).await?;
            if json {
                let payload: Vec<_> = rows
                    .iter()
                    .map(|row| {
                        serde_json::json!({
                            "name": row.name,
                            "dsn": redact_dsn(&row.dsn),
                            "include_schemas": row.include_schemas,
                            "skip_patterns": row.skip_patterns,
                            "last_indexed_at": row.last_indexed_at,
                            "last_error": row.last_error,
                        })
                    })
                    .collect();
                print_json(&payload)?;
            } else {
                for row in rows {
                    println!(
                        "{}\t{}\tinclude_schemas={}\tskip_patterns={}\tlast_indexed={}\tlast_error={}",
                        row.name,
                        redact_dsn(&row.dsn),
                        if row.include_schemas.is_empty() {
                            "-".to_string()
                        } else {
                            row.include_schemas.join(",")
                        },
                        if row.skip_patterns.is_empty() {
                            "-".to_string()
                        } else {
                            row.skip_patterns.join(",")
                        },
                        row.last_indexed_at.as_deref().unwrap_or("-"),
                        row.last_error.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
        SourceAction::Rm { name } => {
            sources::delete_source(pool, &name).await?;
            println!("removed source '{name}'");
        }
        SourceAction::Rename { old_name, new_name } => {
            let source = sources::rename_source(pool, &old_name, &new_name).await?;
            println!("renamed source to '{}'", source.name);
        }
    }
    Ok(())
}

async fn cmd_context(pool: &SqlitePool, action: ContextAction) -> Result<()> {
    match action {
        ContextAction::Add { target, body, json } => {
            let context = contexts::add_context(pool, &target, &body).await?;
            if json {
                print_json(&context)?;
            } else {
                println!("added context {}", context.id);
            }
        }
        ContextAction::List { json } => {
            let rows = contexts::list_contexts(pool).await?;
            if json {
                print_json(&rows)?;
            } else {
                for row in rows {
                    println!("{}\t{}\t{}", row.id, row.target_uri, row.body);
                }
            }
        }
        ContextAction::Rm { key } => {
            let removed = contexts::remove_context(pool, &key).await?;
            if removed == 0 {
                return Err(Error::NotFound(format!("no contexts matched '{key}'")));
            }
            println!("removed {removed} context(s)");
        }
        ContextAction::Generate {
            source,
            schema,
            limit,
            model,
            api_key,
            base_url,
            overwrite,
            dry_run,
            json,
        } => {
            cmd_context_generate(
                pool, source, schema, limit, model, api_key, base_url, overwrite, dry_run, json,
            )
            .await?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_context_generate(
    pool: &SqlitePool,
    source: Option<String>,
    schema: Option<String>,
    limit: Option<i64>,
    model: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    overwrite: bool,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let settings = resolve_openai_settings(api_key, base_url, model);
    if settings.api_key.is_none() {
        return Err(Error::Config(
            "missing OpenAI API key (set QPG_OPENAI_API_KEY/OPENAI_API_KEY or pass --api-key)"
                .to_string(),
        ));
    }
    if let Some(limit) = limit {
        if limit <= 0 {
            return Err(Error::Config("--limit must be a positive integer".to_string()));
        }
    }

    let candidates =
        llm::list_table_context_candidates(pool, source.as_deref(), schema.as_deref(), limit)
            .await?;
    if candidates.is_empty() {
        if json {
            print_json(&serde_json::json!({
                "model": settings.model,
                "generated": 0,
                "skipped_existing": 0,
                "skipped_inference": 0,
                "dry_run": dry_run,
                "results": [],
            }))?;
        } else {
            println!("no table objects found");
        }
        return Ok(());
    }

    let mut generated = 0u64;
    let mut skipped_existing = 0u64;
    let mut skipped_inference = 0u64;
    let mut results: Vec<serde_json::Value> = Vec::new();

    for candidate in &candidates {
        let target_uri = candidate.target_uri();
        if candidate.has_existing_context && !overwrite {
            skipped_existing += 1;
            results.push(serde_json::json!({
                "target_uri": target_uri,
                "status": "skipped_existing",
            }));
            if !json {
                println!("skipped existing context: {target_uri}");
            }
            continue;
        }

        let outcome = llm::generate_table_context(pool, candidate, &settings).await?;
        if !dry_run && overwrite {
            sqlx::query("DELETE FROM contexts WHERE target_uri = ?")
                .bind(&target_uri)
                .execute(pool)
                .await?;
        }

        match outcome {
            llm::GenerationOutcome::Generated(context_text) => {
                if !dry_run {
                    contexts::add_context(pool, &target_uri, &context_text).await?;
                }
                generated += 1;
                results.push(serde_json::json!({
                    "target_uri": target_uri,
                    "status": "generated",
                    "body": context_text,
                }));
                if !json {
                    if dry_run {
                        println!("generated (dry-run): {target_uri}");
                    } else {
                        println!("generated context: {target_uri}");
                    }
                }
            }
            llm::GenerationOutcome::Skipped(reason) => {
                skipped_inference += 1;
                results.push(serde_json::json!({
                    "target_uri": target_uri,
                    "status": "skipped_inference",
                    "reason": reason,
                }));
                if !json {
                    println!("skipped inference: {target_uri} ({reason})");
                }
            }
        }
    }

    if json {
        print_json(&serde_json::json!({
            "model": settings.model,
            "generated": generated,
            "skipped_existing": skipped_existing,
            "skipped_inference": skipped_inference,
            "dry_run": dry_run,
            "results": results,
        }))?;
    } else {
        println!(
            "done: generated={generated} skipped_existing={skipped_existing} \
             skipped_inference={skipped_inference} dry_run={dry_run}"
        );
    }
    Ok(())
}

async fn cmd_auth_check(
    pool: &SqlitePool,
    source: Option<String>,
    allow_extra_privileges: bool,
    allow_execute: bool,
    password: bool,
    json: bool,
) -> Result<()> {
    let selected = collect_sources(pool, source.as_deref()).await?;
    let password = resolve_password(password)?;

    let mut worst: Option<Error> = None;
    for source in &selected {
        println!("== auth check: {} ==", source.name);
        let pg_pool = match pg::connect_source(&source.dsn, password.as_deref()).await {
            Ok(pool) => pool,
            Err(err) => {
                eprintln!("connection failed for '{}': {err}", source.name);
                if worst.as_ref().map(|w| w.exit_code()).unwrap_or(0) < err.exit_code() {
                    worst = Some(err);
                }
                continue;
            }
        };

        let report = check_privileges(&pg_pool, allow_execute, allow_extra_privileges).await?;
        pg_pool.close().await;

        if json {
            print_json(&report)?;
        } else {
            println!("{}", format_privilege_report(&report));
        }

        if !report.passed() && !allow_extra_privileges {
            let err = report.to_failure();
            if worst.as_ref().map(|w| w.exit_code()).unwrap_or(0) < err.exit_code() {
                worst = Some(err);
            }
        }
    }

    match worst {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn update_one_source(
    pool: SqlitePool,
    cache_dir: PathBuf,
    source: SourceRecord,
    contexts: Vec<ContextRecord>,
    embedder: Arc<dyn Embedder>,
    skip_functions: bool,
    password: Option<String>,
) -> Result<UpdateStats> {
    let _lock = SourceLock::acquire(&cache_dir, &source.name)
        .map_err(|e| Error::IndexBuild(e.to_string()))?;

    let pg_pool = pg::connect_source(&source.dsn, password.as_deref()).await?;
    let bundle = introspect::introspect_schema(&pg_pool, !skip_functions).await;
    pg_pool.close().await;

    for warning in &bundle.warnings {
        eprintln!("warning: {warning}");
    }
    let bundle =
        introspect::apply_filters(bundle, &source.include_schemas, &source.skip_patterns)?;

    rebuild_source_index(&pool, &source, &bundle, &contexts, embedder.as_ref()).await
}

async fn cmd_update(
    pool: &SqlitePool,
    paths: &Paths,
    source: Option<String>,
    skip_functions: bool,
    parallel: bool,
    password: bool,
) -> Result<()> {
    let selected = collect_sources(pool, source.as_deref()).await?;
    let embedder = load_embedder(paths)?;
    let password = resolve_password(password)?;
    let context_rows = contexts::list_contexts(pool).await?;

    let mut outcomes: Vec<(SourceRecord, Result<UpdateStats>)> = Vec::new();
    if parallel && selected.len() > 1 {
        let mut tasks = Vec::with_capacity(selected.len());
        for source in selected {
            let task = tokio::spawn(update_one_source(
                pool.clone(),
                paths.cache_dir.clone(),
                source.clone(),
                context_rows.clone(),
                Arc::clone(&embedder),
                skip_functions,
                password.clone(),
            ));
            tasks.push((source, task));
        }
        for (source, task) in tasks {
            let outcome = task
                .await
                .unwrap_or_else(|e| Err(Error::IndexBuild(format!("update task failed: {e}"))));
            outcomes.push((source, outcome));
        }
    } else {
        for source in selected {
            println!("== update: {} ==", source.name);
            let outcome = update_one_source(
                pool.clone(),
                paths.cache_dir.clone(),
                source.clone(),
                context_rows.clone(),
                Arc::clone(&embedder),
                skip_functions,
                password.clone(),
            )
            .await;
            outcomes.push((source, outcome));
        }
    }

    let mut worst: Option<Error> = None;
    for (source, outcome) in outcomes {
        match outcome {
            Ok(stats) => {
                sources::mark_source_indexed(pool, source.id).await?;
                println!(
                    "indexed {}: objects={} columns={} constraints={} indexes={} \
                     dependencies={} vectors={} (reused {})",
                    source.name,
                    stats.objects,
                    stats.columns,
                    stats.constraints,
                    stats.indexes,
                    stats.dependencies,
                    stats.vectors,
                    stats.vectors_reused,
                );
            }
            Err(err) => {
                sources::mark_source_error(pool, source.id, &err.to_string()).await?;
                eprintln!("failed updating '{}': {err}", source.name);
                if worst.as_ref().map(|w| w.exit_code()).unwrap_or(0) < err.exit_code() {
                    worst = Some(err);
                }
            }
        }
    }

    match worst {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn cmd_status(pool: &SqlitePool, json: bool) -> Result<()> {
    let payload = status_payload(pool).await?;
    if json {
        print_json(&payload)?;
        return Ok(());
    }
    println!(
        "sources={} objects={}",
        payload.source_count, payload.object_count
    );
    for source in &payload.sources {
        println!(
            "{}\tobjects={}\tlast_indexed={}\tlast_error={}",
            source.name,
            source.objects,
            source.last_indexed_at.as_deref().unwrap_or("-"),
            source.last_error.as_deref().unwrap_or("-"),
        );
    }
    for kind in &payload.by_kind {
        println!("kind {}: {}", kind.kind, kind.count);
    }
    Ok(())
}

async fn cmd_cleanup(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM llm_cache
        WHERE expires_at IS NOT NULL AND expires_at <= strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("VACUUM").execute(pool).await?;
    println!("cleanup complete");
    Ok(())
}

async fn cmd_repair(pool: &SqlitePool) -> Result<()> {
    let check: String = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_one(pool)
        .await?;
    if check != "ok" {
        return Err(Error::Other(format!(
            "catalog integrity check failed: {check}"
        )));
    }
    fts::rebuild_fts(pool).await?;
    println!("repair complete");
    Ok(())
}

async fn cmd_search(pool: &SqlitePool, opts: SearchOpts) -> Result<()> {
    let filters = opts.filters()?;
    let hits = query::lexical_search(pool, &opts.text, &filters, opts.limit()).await?;
    if opts.json {
        print_json(&hits)?;
    } else if opts.files {
        print_hit_rows(&hits, true);
    } else {
        print_hits_detailed(pool, &hits).await?;
    }
    Ok(())
}

async fn cmd_vsearch(pool: &SqlitePool, paths: &Paths, opts: SearchOpts) -> Result<()> {
    let embedder = load_embedder(paths)?;
    let filters = opts.filters()?;
    let hits =
        query::vector_only_search(pool, embedder.as_ref(), &opts.text, &filters, opts.limit())
            .await?;
    if opts.json {
        print_json(&hits)?;
    } else {
        print_hit_rows(&hits, opts.files);
    }
    Ok(())
}

async fn cmd_query(pool: &SqlitePool, paths: &Paths, opts: SearchOpts) -> Result<()> {
    let embedder = load_embedder(paths)?;
    let filters = opts.filters()?;
    let outcome = query::hybrid_query(
        pool,
        embedder.as_ref(),
        &opts.text,
        &filters,
        opts.limit(),
        true,
    )
    .await?;

    if let Some(diagnostic) = &outcome.hook_diagnostic {
        eprintln!("rerank hook failed: {diagnostic}");
    }

    if opts.json {
        print_json(&outcome.hits)?;
    } else {
        print_hit_rows(&outcome.hits, opts.files);
    }
    Ok(())
}

async fn cmd_get(
    pool: &SqlitePool,
    object_ref: String,
    source: Option<String>,
    json: bool,
) -> Result<()> {
    let payload = get::get_object(pool, &object_ref, source.as_deref()).await?;
    if json {
        print_json(&payload)?;
        return Ok(());
    }

    println!("id: {}", payload.object_id);
    println!("source: {}", payload.source);
    println!("kind: {}", payload.kind);
    println!("name: {}", payload.fqname);
    if !payload.comment.is_empty() {
        println!("comment: {}", payload.comment);
    }
    if !payload.context.is_empty() {
        println!("context: {}", payload.context);
    }
    if !payload.columns.is_empty() {
        println!("columns:");
        for column in &payload.columns {
            let nullable = if column.nullable { "NULL" } else { "NOT NULL" };
            println!(
                "- {}: {} {} {}",
                column.ordinal, column.name, column.data_type, nullable
            );
        }
    }
    if !payload.constraints.is_empty() {
        println!("constraints:");
        for constraint in &payload.constraints {
            println!(
                "- {} ({}): {}",
                constraint.name, constraint.kind, constraint.definition
            );
        }
    }
    if !payload.indexes.is_empty() {
        println!("indexes:");
        for index in &payload.indexes {
            println!("- {}: {}", index.name, index.definition);
        }
    }
    if !payload.dependencies_out.is_empty() {
        println!("depends on:");
        for dep in &payload.dependencies_out {
            println!("- {} ({})", dep.fqname, dep.kind);
        }
    }
    if !payload.dependencies_in.is_empty() {
        println!("depended on by:");
        for dep in &payload.dependencies_in {
            println!("- {} ({})", dep.fqname, dep.kind);
        }
    }
    Ok(())
}

async fn cmd_schema(pool: &SqlitePool, source: Option<String>, json: bool) -> Result<()> {
    if let Some(name) = &source {
        sources::get_source(pool, name).await?;
    }

    let mut sql = String::from(
        r#"
        SELECT o.fqname, s.name AS source_name
        FROM db_objects o
        JOIN sources s ON s.id = o.source_id
        WHERE o.object_type IN ('schema', 'table', 'view', 'function', 'extension')
        "#,
    );
    if source.is_some() {
        sql.push_str(" AND s.name = ?");
    }
    sql.push_str(" ORDER BY s.name, o.schema_name, o.object_type, o.object_name");

    let mut query = sqlx::query_as::<_, (String, String)>(&sql);
    if let Some(name) = &source {
        query = query.bind(name.clone());
    }
    let rows = query.fetch_all(pool).await?;

    if json {
        let mut payload = Vec::with_capacity(rows.len());
        for (fqname, source_name) in &rows {
            let object = get::get_object(pool, fqname, Some(source_name)).await?;
            let definition = get::definition_text(&object);
            let description = get::short_description(&object);
            let mut item = serde_json::to_value(object)?;
            item["definition"] = serde_json::Value::String(definition);
            item["description"] = serde_json::Value::String(description);
            payload.push(item);
        }
        return print_json(&payload);
    }

    if rows.is_empty() {
        println!("no schema objects indexed");
        return Ok(());
    }

    let mut current_source: Option<String> = None;
    for (fqname, source_name) in &rows {
        if current_source.as_deref() != Some(source_name) {
            if current_source.is_some() {
                println!();
            }
            println!("== source: {source_name} ==");
            current_source = Some(source_name.clone());
        }
        let payload = get::get_object(pool, fqname, Some(source_name)).await?;
        println!("\n-- {} ({})", payload.fqname, payload.kind);
        println!("-- {}", get::short_description(&payload));
        println!("{}", get::definition_text(&payload));
    }
    Ok(())
}

async fn cmd_mcp(pool: SqlitePool, paths: &Paths, http: bool, host: String, port: u16) -> Result<()> {
    let embedder = load_embedder(paths).ok();
    let state = McpState { pool, embedder };

    if http {
        println!("qpg MCP HTTP server listening on http://{host}:{port}");
        println!("health endpoint: GET /health, rpc endpoint: POST /mcp");
        mcp::http::serve_http(state, &host, port).await
    } else {
        eprintln!("qpg MCP stdio server started");
        mcp::stdio::serve_stdio(state).await
    }
}

async fn run(cli: Cli) -> Result<()> {
    let paths = paths::ensure_dirs()?;

    match cli.command {
        Commands::Init { json } => cmd_init(&paths, json).await,
        Commands::Config { json } => cmd_config(json),
        Commands::Source { action } => {
            let pool = open_catalog(&paths).await?;
            cmd_source(&pool, action).await
        }
        Commands::Context { action } => {
            let pool = open_catalog(&paths).await?;
            cmd_context(&pool, action).await
        }
        Commands::Auth {
            action:
                AuthAction::Check {
                    source,
                    allow_extra_privileges,
                    allow_execute,
                    password,
                    json,
                },
        } => {
            let pool = open_catalog(&paths).await?;
            cmd_auth_check(
                &pool,
                source,
                allow_extra_privileges,
                allow_execute,
                password,
                json,
            )
            .await
        }
        Commands::Update {
            source,
            skip_functions,
            parallel,
            password,
        } => {
            let pool = open_catalog(&paths).await?;
            cmd_update(&pool, &paths, source, skip_functions, parallel, password).await
        }
        Commands::Status { json } => {
            let pool = open_catalog(&paths).await?;
            cmd_status(&pool, json).await
        }
        Commands::Cleanup => {
            let pool = open_catalog(&paths).await?;
            cmd_cleanup(&pool).await
        }
        Commands::Repair => {
            let pool = open_catalog(&paths).await?;
            cmd_repair(&pool).await
        }
        Commands::Search(opts) => {
            let pool = open_catalog(&paths).await?;
            cmd_search(&pool, opts).await
        }
        Commands::Vsearch(opts) => {
            let pool = open_catalog(&paths).await?;
            cmd_vsearch(&pool, &paths, opts).await
        }
        Commands::Query(opts) => {
            let pool = open_catalog(&paths).await?;
            cmd_query(&pool, &paths, opts).await
        }
        Commands::Get {
            object_ref,
            source,
            json,
        } => {
            let pool = open_catalog(&paths).await?;
            cmd_get(&pool, object_ref, source, json).await
        }
        Commands::Schema { source, json } => {
            let pool = open_catalog(&paths).await?;
            cmd_schema(&pool, source, json).await
        }
        Commands::Mcp { http, host, port } => {
            let pool = open_catalog(&paths).await?;
            cmd_mcp(pool, &paths, http, host, port).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "qpg=debug" } else { "qpg=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        std::process::exit(err.exit_code());
    }
}
