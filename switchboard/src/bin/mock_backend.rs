//! Mock MCP backend speaking newline-delimited JSON-RPC on stdio.
//!
//! Used by integration tests to exercise the adapter, registry, and
//! dispatch paths against a real child process.
//!
//! # Environment Variables
//!
//! - `MOCK_BACKEND_NAME`: server name in the `initialize` response
//!   (default: `mock-backend`)
//! - `MOCK_BACKEND_TOOLS`: comma-separated tool names to advertise
//!   (default: `echo.say`)
//! - `MOCK_BACKEND_DELAY_MS`: delay before each `tools/call` response
//! - `MOCK_BACKEND_EXIT_ON_CALL`: when set, exit(1) on `tools/call` instead
//!   of responding (crash-path testing)
//! - `MOCK_BACKEND_CRASH_ONCE_FILE`: crash on `tools/call` only if this
//!   marker file does not exist yet; the file is created before exiting, so
//!   the respawned process behaves normally

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let name =
        std::env::var("MOCK_BACKEND_NAME").unwrap_or_else(|_| "mock-backend".to_string());
    let tools: Vec<String> = std::env::var("MOCK_BACKEND_TOOLS")
        .unwrap_or_else(|_| "echo.say".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let delay_ms: u64 = std::env::var("MOCK_BACKEND_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let exit_on_call = std::env::var("MOCK_BACKEND_EXIT_ON_CALL").is_ok();
    let crash_once_file = std::env::var("MOCK_BACKEND_CRASH_ONCE_FILE").ok();

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock_backend: ignoring malformed line");
            continue;
        };
        let method = message.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let Some(id) = message.get("id").cloned() else {
            // Notification: nothing to say back.
            continue;
        };

        let result = match method {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": name, "version": "0.1.0"},
            }),
            "tools/list" => json!({
                "tools": tools.iter().map(|t| json!({
                    "name": t,
                    "description": format!("mock tool {t}"),
                    "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}},
                })).collect::<Vec<_>>(),
            }),
            "resources/list" => json!({"resources": []}),
            "resources/templates/list" => json!({"resourceTemplates": []}),
            "prompts/list" => json!({"prompts": []}),
            "ping" => json!({}),
            "tools/call" => {
                if exit_on_call {
                    std::process::exit(1);
                }
                if let Some(ref marker) = crash_once_file {
                    if !std::path::Path::new(marker).exists() {
                        let _ = std::fs::write(marker, b"crashed");
                        std::process::exit(1);
                    }
                }
                if delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
                let text = message
                    .pointer("/params/arguments/text")
                    .and_then(|t| t.as_str())
                    .unwrap_or("ok");
                json!({"content": [{"type": "text", "text": text}]})
            }
            other => {
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("method '{other}' not found")},
                });
                write_line(&mut stdout, &response).await;
                continue;
            }
        };

        let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
        write_line(&mut stdout, &response).await;
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    if stdout.write_all(line.as_bytes()).await.is_err() {
        std::process::exit(0);
    }
    let _ = stdout.flush().await;
}
