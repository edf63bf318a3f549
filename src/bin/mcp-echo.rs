//! Minimal MCP tool server speaking line-delimited JSON-RPC on stdio
//!
//! Offers `echo` and `add` tools. Used by the integration tests as a real
//! subprocess peer, and handy for exercising a running hub by hand.

use serde_json::{json, Value};
use std::io::{BufRead, Write};

fn main() {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(frame) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        // Notifications carry no id and get no reply.
        let Some(id) = frame.get("id").cloned() else {
            continue;
        };
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        let reply = match method {
            "initialize" => ok(
                &id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {"name": "mcp-echo", "version": env!("CARGO_PKG_VERSION")},
                    "capabilities": {"tools": {}},
                }),
            ),
            "tools/list" => ok(
                &id,
                json!({
                    "tools": [
                        {
                            "name": "echo",
                            "description": "Echoes back the input message",
                            "inputSchema": {
                                "type": "object",
                                "properties": {"message": {"type": "string"}},
                            },
                        },
                        {
                            "name": "add",
                            "description": "Adds two numbers together",
                            "inputSchema": {
                                "type": "object",
                                "properties": {
                                    "a": {"type": "number"},
                                    "b": {"type": "number"},
                                },
                            },
                        },
                    ],
                }),
            ),
            "tools/call" => call_tool(&id, &params),
            _ => err(&id, -32601, &format!("method not found: {method}")),
        };

        if writeln!(out, "{reply}").is_err() {
            break;
        }
        out.flush().ok();
    }
}

fn call_tool(id: &Value, params: &Value) -> Value {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or(json!({}));

    match name {
        "echo" => {
            let message = args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            ok(
                id,
                json!({"content": [{"type": "text", "text": format!("echo: {message}")}]}),
            )
        }
        "add" => {
            let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
            let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
            ok(
                id,
                json!({"content": [{"type": "text", "text": format!("{}", a + b)}]}),
            )
        }
        other => err(id, -32602, &format!("unknown tool: {other}")),
    }
}

fn ok(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn err(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
