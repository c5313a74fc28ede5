//! Minimal line-delimited JSON-RPC tool server used by the integration
//! tests. Deliberately synchronous and dependency-light: one request is
//! read, handled, and answered per stdin line.
//!
//! Tools:
//! - `echo`: returns `text`, prefixed with `$ECHO_PREFIX` when set.
//! - `sleep_then_echo`: blocks for `delay_ms` before answering, for
//!   deadline and late-response tests.
//! - `noisy_echo`: writes one corrupt non-JSON line before the real
//!   response, for framing-robustness tests.
//! - `fail`: returns an `isError` result carrying `message`.
//! - `notify_changed`: emits `notifications/tools/list_changed` and adds an
//!   `extra` tool to later `tools/list` answers, for catalog-refresh tests.
//!
//! `ECHO_LIST_DELAY_MS` delays every `tools/list` answer, for refresh
//! deadline tests.

use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut extra_tool = false;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(id) = message.get("id").cloned() else {
            // Notifications need no answer.
            continue;
        };

        let reply = match method.as_str() {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "echo-server", "version": "0.1.0" },
                    "instructions": "Echoes things back. Use responsibly.",
                }
            }),
            "tools/list" => {
                if let Some(delay) = list_delay() {
                    thread::sleep(delay);
                }
                let mut tools = base_tools();
                if extra_tool {
                    tools.push(json!({
                        "name": "extra",
                        "description": "Appears after a catalog change"
                    }));
                }
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "tools": tools }
                })
            }
            "tools/call" => handle_call(id, message.get("params"), &mut out, &mut extra_tool),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("unknown method '{method}'") }
            }),
        };

        if writeln!(out, "{reply}").and_then(|_| out.flush()).is_err() {
            break;
        }
    }
}

fn list_delay() -> Option<Duration> {
    std::env::var("ECHO_LIST_DELAY_MS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_millis)
}

fn base_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "echo",
            "description": "Echo the given text back",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }
        }),
        json!({
            "name": "sleep_then_echo",
            "description": "Echo after a delay",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "delay_ms": { "type": "integer" }
                },
                "required": ["text"]
            }
        }),
        json!({
            "name": "noisy_echo",
            "description": "Echo preceded by a corrupt output line",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }
        }),
        json!({
            "name": "fail",
            "description": "Always reports a tool error",
            "inputSchema": {
                "type": "object",
                "properties": { "message": { "type": "string" } }
            }
        }),
        json!({
            "name": "notify_changed",
            "description": "Announce a tool-catalog change",
            "inputSchema": { "type": "object", "properties": {} }
        }),
    ]
}

fn handle_call(
    id: Value,
    params: Option<&Value>,
    out: &mut impl Write,
    extra_tool: &mut bool,
) -> Value {
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let arguments = params
        .and_then(|p| p.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));
    let text = arguments
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match name {
        "echo" => text_result(id, &with_prefix(&text)),
        "sleep_then_echo" => {
            let delay = arguments
                .get("delay_ms")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            thread::sleep(Duration::from_millis(delay));
            text_result(id, &with_prefix(&text))
        }
        "noisy_echo" => {
            let _ = writeln!(out, "%% this is not json %%");
            let _ = out.flush();
            text_result(id, &with_prefix(&text))
        }
        "notify_changed" => {
            *extra_tool = true;
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "notifications/tools/list_changed"
            });
            let _ = writeln!(out, "{notification}");
            let _ = out.flush();
            text_result(id, "catalog changed")
        }
        "fail" => {
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("tool failure");
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "isError": true,
                    "content": [{ "type": "text", "text": message }]
                }
            })
        }
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32602, "message": format!("unknown tool '{other}'") }
        }),
    }
}

fn with_prefix(text: &str) -> String {
    match std::env::var("ECHO_PREFIX") {
        Ok(prefix) if !prefix.is_empty() => format!("{prefix}:{text}"),
        _ => text.to_string(),
    }
}

fn text_result(id: Value, text: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": { "content": [{ "type": "text", "text": text }] }
    })
}
