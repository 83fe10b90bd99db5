//! Line-delimited JSON-RPC transport over stdio.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::Result;

use super::protocol::{handle_request, McpState};

/// Serve requests from stdin until EOF, one JSON object per line.
pub async fn serve_stdio(state: McpState) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let payload: serde_json::Value = match serde_json::from_str(line) {
            Ok(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
            Ok(_) => {
                write_line(
                    &mut stdout,
                    &serde_json::json!({
                        "jsonrpc": "2.0", "id": null,
                        "error": {"code": -32600, "message": "Invalid Request"},
                    }),
                )
                .await?;
                continue;
            }
            Err(_) => {
                write_line(
                    &mut stdout,
                    &serde_json::json!({
                        "jsonrpc": "2.0", "id": null,
                        "error": {"code": -32700, "message": "Parse error"},
                    }),
                )
                .await?;
                continue;
            }
        };

        if let Some(response) = handle_request(&state, &payload).await {
            write_line(&mut stdout, &response).await?;
        }
    }

    Ok(())
}

async fn write_line(
    stdout: &mut tokio::io::Stdout,
    payload: &serde_json::Value,
) -> Result<()> {
    let mut bytes = serde_json::to_vec(payload)?;
    bytes.push(b'\n');
    stdout.write_all(&bytes).await?;
    stdout.flush().await?;
    Ok(())
}
