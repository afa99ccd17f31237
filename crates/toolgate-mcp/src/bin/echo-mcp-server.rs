//! Minimal MCP server over stdio.
//!
//! Reads line-delimited JSON-RPC from stdin and answers on stdout. Exposes a
//! single `echo` tool that returns its arguments as text. Used by the
//! integration tests and handy for trying out the CLI.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use toolgate_mcp::protocol::{JsonRpcError, JsonRpcResponse, PROTOCOL_VERSION};

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

fn tools() -> Value {
    json!({
        "tools": [{
            "name": "echo",
            "description": "Return the arguments unchanged",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } }
            }
        }]
    })
}

fn handle(method: &str, params: Option<&Value>) -> Result<Value, JsonRpcError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "echo-mcp-server", "version": env!("CARGO_PKG_VERSION") }
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(tools()),
        "tools/call" => {
            let name = params.and_then(|p| p.get("name")).and_then(Value::as_str);
            if name != Some("echo") {
                return Err(JsonRpcError {
                    code: INVALID_PARAMS,
                    message: format!("unknown tool: {}", name.unwrap_or("<none>")),
                    data: None,
                });
            }
            let arguments = params
                .and_then(|p| p.get("arguments"))
                .cloned()
                .unwrap_or_else(|| json!({}));
            let text = match arguments.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => arguments.to_string(),
            };
            Ok(json!({ "content": [{ "type": "text", "text": text }] }))
        }
        other => Err(JsonRpcError {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {other}"),
            data: None,
        }),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        // Notifications get no reply.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };

        let (result, error) = match handle(method, message.get("params")) {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        let response = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result,
            error,
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}
