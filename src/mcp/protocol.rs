//! JSON-RPC protocol handling and tool dispatch.
//!
//! Speaks MCP-shaped JSON-RPC 2.0 (`initialize`, `tools/list`, `tools/call`)
//! and, for older integrations, a legacy `{"tool": ..., "args": ...}`
//! envelope. Every tool result is wrapped as `{ ok, data | error }` with a
//! stable error code.

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::dsn::redact_dsn;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::get::get_object;
use crate::query::{self, SearchFilters};
use crate::sources::list_sources;
use crate::status::status_payload;

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[
    "2025-11-25",
    "2025-06-18",
    "2025-03-26",
    "2024-11-05",
];

const DEFAULT_TOOL_LIMIT: i64 = 10;

/// Shared state for both transports.
#[derive(Clone)]
pub struct McpState {
    pub pool: SqlitePool,
    /// Absent until `qpg init` has downloaded the model; `qpg_deep_search`
    /// reports `model_not_initialized` in that case.
    pub embedder: Option<Arc<dyn Embedder>>,
}

/// Tool declarations for `tools/list`.
pub fn tool_schemas() -> Value {
    json!([
        {
            "name": "qpg_search",
            "description": "Run lexical search over indexed PostgreSQL schema metadata.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 200, "default": DEFAULT_TOOL_LIMIT},
                    "source": {"type": "string"},
                    "schema": {"type": "string"},
                    "kind": {"type": "string"},
                },
                "required": ["query"],
                "additionalProperties": false,
            },
        },
        {
            "name": "qpg_deep_search",
            "description": "Run blended lexical+vector schema search with deterministic RRF fusion and the rerank hook enabled.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 200, "default": DEFAULT_TOOL_LIMIT},
                },
                "required": ["query"],
                "additionalProperties": false,
            },
        },
        {
            "name": "qpg_get",
            "description": "Get a detailed metadata payload for one schema object by fqname or id.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "ref": {"type": "string"},
                    "source": {"type": "string"},
                },
                "required": ["ref"],
                "additionalProperties": false,
            },
        },
        {
            "name": "qpg_status",
            "description": "Return index status and object counts by kind.",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "additionalProperties": false,
            },
        },
        {
            "name": "qpg_list_sources",
            "description": "List configured PostgreSQL sources in the local index.",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "additionalProperties": false,
            },
        },
    ])
}

fn jsonrpc_result(request_id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": request_id, "result": result})
}

fn jsonrpc_error(request_id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": request_id, "error": {"code": code, "message": message}})
}

fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn arg_limit(args: &Value) -> Result<i64> {
    let limit = args
        .get("limit")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_TOOL_LIMIT);
    query::clamp_limit(limit)
}

async fn handle_tool_call(state: &McpState, tool: &str, args: &Value) -> Result<Value> {
    match tool {
        "qpg_search" => {
            let text = arg_str(args, "query").unwrap_or_default();
            let filters = SearchFilters {
                source: arg_str(args, "source"),
                schema: arg_str(args, "schema"),
                kind: arg_str(args, "kind"),
                min_score: None,
            };
            let hits =
                query::lexical_search(&state.pool, &text, &filters, arg_limit(args)?).await?;
            Ok(json!({"results": hits}))
        }
        "qpg_deep_search" => {
            let embedder = state
                .embedder
                .as_deref()
                .ok_or(Error::ModelNotInitialized)?;
            let text = arg_str(args, "query").unwrap_or_default();
            let outcome = query::hybrid_query(
                &state.pool,
                embedder,
                &text,
                &SearchFilters::default(),
                arg_limit(args)?,
                true,
            )
            .await?;
            Ok(json!({
                "results": outcome.hits,
                "hook_error": outcome.hook_diagnostic,
            }))
        }
        "qpg_get" => {
            let object_ref = arg_str(args, "ref")
                .ok_or_else(|| Error::Config("qpg_get requires 'ref'".to_string()))?;
            let payload =
                get_object(&state.pool, &object_ref, arg_str(args, "source").as_deref()).await?;
            Ok(serde_json::to_value(payload)?)
        }
        "qpg_status" => Ok(serde_json::to_value(status_payload(&state.pool).await?)?),
        "qpg_list_sources" => {
            let sources = list_sources(&state.pool).await?;
            Ok(Value::Array(
                sources
                    .iter()
                    .map(|source| {
                        json!({
                            "name": source.name,
                            "dsn": redact_dsn(&source.dsn),
                            "include_schemas": source.include_schemas,
                            "skip_patterns": source.skip_patterns,
                            "last_indexed_at": source.last_indexed_at,
                            "last_error": source.last_error,
                        })
                    })
                    .collect(),
            ))
        }
        other => Err(Error::Config(format!("unknown tool: {other}"))),
    }
}

/// Run a tool and wrap the outcome in the `{ ok, data | error }` envelope.
async fn tool_envelope(state: &McpState, tool: &str, args: &Value) -> Value {
    match handle_tool_call(state, tool, args).await {
        Ok(data) => json!({"ok": true, "data": data}),
        Err(err) => json!({
            "ok": false,
            "error": {"code": err.code(), "message": err.to_string()},
        }),
    }
}

fn negotiate_protocol_version(client_version: Option<&Value>) -> String {
    match client_version.and_then(Value::as_str) {
        Some(version) if !version.is_empty() => version.to_string(),
        _ => SUPPORTED_PROTOCOL_VERSIONS[0].to_string(),
    }
}

async fn handle_mcp_request(state: &McpState, payload: &Value) -> Option<Value> {
    let request_id = payload.get("id").cloned().unwrap_or(Value::Null);
    let method = match payload.get("method").and_then(Value::as_str) {
        Some(method) => method,
        None => {
            return Some(jsonrpc_error(
                request_id,
                -32600,
                "Invalid Request: missing method",
            ))
        }
    };

    let params = payload.get("params").cloned().unwrap_or_else(|| json!({}));
    if !params.is_object() {
        return Some(jsonrpc_error(
            request_id,
            -32602,
            "Invalid params: expected object",
        ));
    }

    match method {
        // Notification: no response expected.
        "notifications/initialized" => None,
        "initialize" => Some(jsonrpc_result(
            request_id,
            json!({
                "protocolVersion": negotiate_protocol_version(params.get("protocolVersion")),
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {"name": "qpg", "version": env!("CARGO_PKG_VERSION")},
                "instructions": "qpg exposes PostgreSQL schema-index retrieval tools only. \
                                 It never executes arbitrary SQL or reads table row values.",
            }),
        )),
        "ping" => Some(jsonrpc_result(request_id, json!({}))),
        "tools/list" => Some(jsonrpc_result(request_id, json!({"tools": tool_schemas()}))),
        "tools/call" => {
            let tool = match params.get("name").and_then(Value::as_str) {
                Some(tool) => tool,
                None => {
                    return Some(jsonrpc_error(
                        request_id,
                        -32602,
                        "Invalid params: tools/call requires string 'name'",
                    ))
                }
            };
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            if !arguments.is_object() {
                return Some(jsonrpc_error(
                    request_id,
                    -32602,
                    "Invalid params: 'arguments' must be an object",
                ));
            }

            let envelope = tool_envelope(state, tool, &arguments).await;
            let is_error = envelope.get("ok") == Some(&Value::Bool(false));
            let text = serde_json::to_string(&envelope).unwrap_or_default();
            Some(jsonrpc_result(
                request_id,
                json!({
                    "content": [{"type": "text", "text": text}],
                    "structuredContent": envelope,
                    "isError": is_error,
                }),
            ))
        }
        other => Some(jsonrpc_error(
            request_id,
            -32601,
            &format!("Method not found: {other}"),
        )),
    }
}

async fn handle_legacy_request(state: &McpState, payload: &Value) -> Value {
    let request_id = payload.get("id").cloned().unwrap_or(Value::Null);
    let tool = match payload.get("tool").and_then(Value::as_str) {
        Some(tool) => tool,
        None => {
            return json!({
                "id": request_id,
                "error": "payload must include string field 'tool'",
            })
        }
    };
    let args = payload.get("args").cloned().unwrap_or_else(|| json!({}));
    let envelope = tool_envelope(state, tool, &args).await;
    json!({"id": request_id, "result": envelope})
}

/// Dispatch one request payload. `None` means no response is due
/// (a notification).
pub async fn handle_request(state: &McpState, payload: &Value) -> Option<Value> {
    if payload.get("method").is_some() {
        handle_mcp_request(state, payload).await
    } else {
        Some(handle_legacy_request(state, payload).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn test_state() -> (TempDir, McpState) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("index.sqlite")).await.unwrap();
        migrate::ensure_schema(&pool).await.unwrap();
        (
            tmp,
            McpState {
                pool,
                embedder: None,
            },
        )
    }

    #[tokio::test]
    async fn initialize_negotiates_protocol_version() {
        let (_tmp, state) = test_state().await;
        let response = handle_request(
            &state,
            &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                    "params": {"protocolVersion": "2025-06-18"}}),
        )
        .await
        .unwrap();
        assert_eq!(response["result"]["protocolVersion"], "2025-06-18");
        assert_eq!(response["result"]["serverInfo"]["name"], "qpg");
    }

    #[tokio::test]
    async fn tools_list_names_the_fixed_surface() {
        let (_tmp, state) = test_state().await;
        let response = handle_request(
            &state,
            &json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        )
        .await
        .unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "qpg_search",
                "qpg_deep_search",
                "qpg_get",
                "qpg_status",
                "qpg_list_sources"
            ]
        );
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let (_tmp, state) = test_state().await;
        let response = handle_request(
            &state,
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_a_jsonrpc_error() {
        let (_tmp, state) = test_state().await;
        let response = handle_request(
            &state,
            &json!({"jsonrpc": "2.0", "id": 3, "method": "tools/write"}),
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn unknown_tool_maps_into_the_envelope() {
        let (_tmp, state) = test_state().await;
        let response = handle_request(
            &state,
            &json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call",
                    "params": {"name": "qpg_drop_table", "arguments": {}}}),
        )
        .await
        .unwrap();
        assert_eq!(response["result"]["isError"], true);
        assert_eq!(
            response["result"]["structuredContent"]["ok"],
            Value::Bool(false)
        );
    }

    #[tokio::test]
    async fn get_on_empty_catalog_reports_not_found() {
        let (_tmp, state) = test_state().await;
        let response = handle_request(
            &state,
            &json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call",
                    "params": {"name": "qpg_get", "arguments": {"ref": "sales.orders"}}}),
        )
        .await
        .unwrap();
        let envelope = &response["result"]["structuredContent"];
        assert_eq!(envelope["ok"], Value::Bool(false));
        assert_eq!(envelope["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn deep_search_without_model_reports_stable_code() {
        let (_tmp, state) = test_state().await;
        let response = handle_request(
            &state,
            &json!({"jsonrpc": "2.0", "id": 6, "method": "tools/call",
                    "params": {"name": "qpg_deep_search", "arguments": {"query": "orders"}}}),
        )
        .await
        .unwrap();
        let envelope = &response["result"]["structuredContent"];
        assert_eq!(envelope["error"]["code"], "model_not_initialized");
    }

    #[tokio::test]
    async fn legacy_envelope_still_works() {
        let (_tmp, state) = test_state().await;
        let response = handle_request(&state, &json!({"id": 7, "tool": "qpg_status"}))
            .await
            .unwrap();
        assert_eq!(response["id"], 7);
        assert_eq!(response["result"]["ok"], Value::Bool(true));
        assert_eq!(response["result"]["data"]["object_count"], 0);
    }
}
