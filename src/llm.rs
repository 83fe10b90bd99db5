//! Optional LLM-assisted context drafting.
//!
//! `qpg context generate` asks an OpenAI-compatible endpoint to draft a
//! short semantic note per table, caching responses in `llm_cache`. The
//! model is asked to skip when the table carries too little signal to
//! infer intent; the core only ever consumes the accepted notes through
//! `contexts::add_context`.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::config::OpenAiSettings;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ColumnSummary {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default_expr: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TableContextCandidate {
    pub source_name: String,
    pub object_id: String,
    pub fqname: String,
    pub definition: Option<String>,
    pub comment: Option<String>,
    pub columns: Vec<ColumnSummary>,
    pub has_existing_context: bool,
}

impl TableContextCandidate {
    pub fn target_uri(&self) -> String {
        format!("qpg://{}/{}", self.source_name, self.fqname)
    }
}

/// What the generation step decided for one table.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Generated(String),
    Skipped(String),
}

/// List indexed tables eligible for context generation.
pub async fn list_table_context_candidates(
    pool: &SqlitePool,
    source: Option<&str>,
    schema: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<TableContextCandidate>> {
    let mut sql = String::from(
        r#"
        SELECT s.name AS source_name,
               o.id AS object_id,
               o.fqname,
               o.definition,
               o.comment
        FROM db_objects o
        JOIN sources s ON s.id = o.source_id
        WHERE o.object_type = 'table'
        "#,
    );
    if source.is_some() {
        sql.push_str(" AND s.name = ?");
    }
    if schema.is_some() {
        sql.push_str(" AND o.schema_name = ?");
    }
    sql.push_str(" ORDER BY s.name, o.schema_name, o.object_name");
    if limit.is_some() {
        sql.push_str(" LIMIT ?");
    }

    let mut query = sqlx::query(&sql);
    if let Some(source) = source {
        query = query.bind(source.to_string());
    }
    if let Some(schema) = schema {
        query = query.bind(schema.to_string());
    }
    if let Some(limit) = limit {
        query = query.bind(limit);
    }
    let rows = query.fetch_all(pool).await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        let source_name: String = row.get("source_name");
        let object_id: String = row.get("object_id");
        let fqname: String = row.get("fqname");
        let target_uri = format!("qpg://{source_name}/{fqname}");

        let has_existing_context: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM contexts WHERE target_uri = ?")
                .bind(&target_uri)
                .fetch_one(pool)
                .await?;

        let columns = sqlx::query(
            r#"
            SELECT column_name, data_type, is_nullable, default_expr, comment
            FROM columns
            WHERE object_id = ?
            ORDER BY ordinal_position ASC
            "#,
        )
        .bind(&object_id)
        .fetch_all(pool)
        .await?
        .iter()
        .map(|col| ColumnSummary {
            name: col.get("column_name"),
            data_type: col.get("data_type"),
            nullable: col.get("is_nullable"),
            default_expr: col.get("default_expr"),
            comment: col.get("comment"),
        })
        .collect();

        candidates.push(TableContextCandidate {
            source_name,
            object_id,
            fqname,
            definition: row.get("definition"),
            comment: row.get("comment"),
            columns,
            has_existing_context,
        });
    }
    Ok(candidates)
}

fn clip(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        value.to_string()
    } else {
        format!("{}...", &value[..limit.saturating_sub(3)])
    }
}

fn build_prompt(candidate: &TableContextCandidate) -> String {
    let mut lines = vec![
        "You are generating conservative semantic context for PostgreSQL schema retrieval.".to_string(),
        "Decide whether this table has enough signal to infer high-level intent.".to_string(),
        "If not enough signal exists, skip instead of guessing.".to_string(),
        "Return ONLY a JSON object with keys: decision, reason, context.".to_string(),
        "decision must be either \"generate\" or \"skip\".".to_string(),
        "If decision is \"generate\", context must be 2-4 concise sentences with grounded inferences only.".to_string(),
        "Do not output SQL and do not use markdown.".to_string(),
        String::new(),
        format!("Table: {}", candidate.fqname),
    ];
    if let Some(comment) = candidate.comment.as_deref().filter(|c| !c.trim().is_empty()) {
        lines.push(format!("Table comment: {comment}"));
    }
    if let Some(definition) = candidate.definition.as_deref().filter(|d| !d.trim().is_empty()) {
        lines.push(format!("Definition excerpt: {}", clip(definition, 1500)));
    }
    if candidate.columns.is_empty() {
        lines.push("Columns: none discovered".to_string());
    } else {
        lines.push("Columns:".to_string());
        for col in &candidate.columns {
            let mut parts = vec![format!("- {}: {}", col.name, col.data_type)];
            parts.push(if col.nullable { "nullable" } else { "not null" }.to_string());
            if let Some(default) = &col.default_expr {
                parts.push(format!("default={}", clip(default, 100)));
            }
            if let Some(comment) = &col.comment {
                parts.push(format!("comment={}", clip(comment, 180)));
            }
            lines.push(parts.join(", "));
        }
    }
    lines.join("\n")
}

const BOILERPLATE_COLUMNS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "deleted_at",
    "inserted_at",
    "modified_at",
];

fn has_reasonable_signal(candidate: &TableContextCandidate) -> (bool, &'static str) {
    if candidate.comment.as_deref().is_some_and(|c| !c.trim().is_empty()) {
        return (true, "table comment present");
    }
    if candidate.definition.as_deref().is_some_and(|d| !d.trim().is_empty()) {
        return (true, "table definition present");
    }
    let informative = candidate
        .columns
        .iter()
        .any(|col| !BOILERPLATE_COLUMNS.contains(&col.name.to_lowercase().as_str()));
    if informative {
        (true, "non-boilerplate columns present")
    } else {
        (false, "only boilerplate fields available")
    }
}

fn cache_key(model: &str, prompt: &str) -> String {
    let digest = Sha256::digest(format!("{model}\n{prompt}").as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("context-gen:{hex}")
}

#[derive(Deserialize)]
struct GenerationPayload {
    decision: Option<String>,
    reason: Option<String>,
    context: Option<String>,
}

fn parse_generation_output(text: &str) -> GenerationOutcome {
    let mut raw = text.trim();
    // Tolerate fenced output from chatty models.
    if raw.starts_with("```") {
        let lines: Vec<&str> = raw.lines().collect();
        if lines.len() >= 3 {
            raw = &text[text.find('\n').map(|i| i + 1).unwrap_or(0)..];
            raw = raw.trim_end().trim_end_matches("```").trim();
        }
    }

    let payload: GenerationPayload = match serde_json::from_str(raw) {
        Ok(payload) => payload,
        Err(_) => {
            return if raw.is_empty() {
                GenerationOutcome::Skipped("empty model output".to_string())
            } else {
                GenerationOutcome::Generated(raw.to_string())
            };
        }
    };

    let decision = payload.decision.unwrap_or_default().to_lowercase();
    let context = payload.context.unwrap_or_default().trim().to_string();
    let reason = payload.reason.unwrap_or_default().trim().to_string();

    if decision == "skip" || context.is_empty() {
        let reason = if reason.is_empty() {
            "insufficient inference signal".to_string()
        } else {
            reason
        };
        GenerationOutcome::Skipped(reason)
    } else {
        GenerationOutcome::Generated(context)
    }
}

async fn cache_lookup(pool: &SqlitePool, key: &str) -> Result<Option<GenerationOutcome>> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT value_json FROM llm_cache WHERE key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    let Some(value) = value else {
        return Ok(None);
    };
    Ok(serde_json::from_str::<GenerationPayload>(&value)
        .ok()
        .map(|payload| {
            let context = payload.context.unwrap_or_default();
            if context.is_empty() {
                GenerationOutcome::Skipped(
                    payload.reason.unwrap_or_else(|| "cached skip".to_string()),
                )
            } else {
                GenerationOutcome::Generated(context)
            }
        }))
}

async fn cache_store(pool: &SqlitePool, key: &str, outcome: &GenerationOutcome) -> Result<()> {
    let value = match outcome {
        GenerationOutcome::Generated(context) => serde_json::json!({
            "decision": "generate",
            "context": context,
        }),
        GenerationOutcome::Skipped(reason) => serde_json::json!({
            "decision": "skip",
            "context": "",
            "reason": reason,
        }),
    };
    sqlx::query(
        r#"
        INSERT INTO llm_cache(key, value_json)
        VALUES(?, ?)
        ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json
        "#,
    )
    .bind(key)
    .bind(serde_json::to_string(&value)?)
    .execute(pool)
    .await?;
    Ok(())
}

async fn call_openai_chat(settings: &OpenAiSettings, prompt: &str) -> Result<String> {
    let api_key = settings
        .api_key
        .as_deref()
        .ok_or_else(|| Error::Config("missing OpenAI API key".to_string()))?;
    let endpoint = format!("{}/chat/completions", settings.base_url.trim_end_matches('/'));

    let body = serde_json::json!({
        "model": settings.model,
        "temperature": 0.2,
        "messages": [
            {
                "role": "system",
                "content": "You generate concise semantic context for PostgreSQL schema objects.",
            },
            {"role": "user", "content": prompt},
        ],
    });

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let response = client
        .post(&endpoint)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        return Err(Error::Other(format!(
            "OpenAI API error ({status}): {}",
            detail.trim()
        )));
    }

    let json: serde_json::Value = response.json().await?;
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Other("OpenAI response did not include text content".to_string()))?;
    Ok(content.to_string())
}

/// Draft (or skip) a context note for one table, consulting the cache.
pub async fn generate_table_context(
    pool: &SqlitePool,
    candidate: &TableContextCandidate,
    settings: &OpenAiSettings,
) -> Result<GenerationOutcome> {
    let prompt = build_prompt(candidate);
    let key = cache_key(&settings.model, &prompt);
    if let Some(cached) = cache_lookup(pool, &key).await? {
        return Ok(cached);
    }

    let (has_signal, signal_reason) = has_reasonable_signal(candidate);
    let outcome = if has_signal {
        let text = call_openai_chat(settings, &prompt).await?;
        parse_generation_output(&text)
    } else {
        GenerationOutcome::Skipped(format!("skipped: {signal_reason}"))
    };
    cache_store(pool, &key, &outcome).await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(comment: Option<&str>, columns: &[&str]) -> TableContextCandidate {
        TableContextCandidate {
            source_name: "work".to_string(),
            object_id: "abc".to_string(),
            fqname: "sales.orders".to_string(),
            definition: None,
            comment: comment.map(str::to_string),
            columns: columns
                .iter()
                .map(|name| ColumnSummary {
                    name: name.to_string(),
                    data_type: "text".to_string(),
                    nullable: true,
                    default_expr: None,
                    comment: None,
                })
                .collect(),
            has_existing_context: false,
        }
    }

    #[test]
    fn boilerplate_only_tables_have_no_signal() {
        let (ok, _) = has_reasonable_signal(&candidate(None, &["id", "created_at"]));
        assert!(!ok);
        let (ok, _) = has_reasonable_signal(&candidate(None, &["id", "refund_amount"]));
        assert!(ok);
        let (ok, _) = has_reasonable_signal(&candidate(Some("Orders."), &["id"]));
        assert!(ok);
    }

    #[test]
    fn generation_output_parses_decisions() {
        let out = parse_generation_output(r#"{"decision":"generate","context":"Orders."}"#);
        assert!(matches!(out, GenerationOutcome::Generated(ref c) if c == "Orders."));

        let out = parse_generation_output(r#"{"decision":"skip","reason":"no signal","context":""}"#);
        assert!(matches!(out, GenerationOutcome::Skipped(ref r) if r == "no signal"));
    }

    #[test]
    fn non_json_output_falls_back_to_raw_text() {
        let out = parse_generation_output("Plain prose answer.");
        assert!(matches!(out, GenerationOutcome::Generated(ref c) if c == "Plain prose answer."));
    }

    #[test]
    fn prompt_includes_columns_and_target_uri_is_stable() {
        let c = candidate(Some("Orders."), &["total_cents"]);
        let prompt = build_prompt(&c);
        assert!(prompt.contains("Table: sales.orders"));
        assert!(prompt.contains("- total_cents: text"));
        assert_eq!(c.target_uri(), "qpg://work/sales.orders");
    }

    #[test]
    fn cache_key_depends_on_model_and_prompt() {
        let a = cache_key("m1", "p");
        assert_eq!(a, cache_key("m1", "p"));
        assert_ne!(a, cache_key("m2", "p"));
        assert!(a.starts_with("context-gen:"));
    }
}
