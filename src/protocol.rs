//! Shared wire types for the line-delimited JSON-RPC tool-server protocol.
//!
//! Every message is one newline-terminated UTF-8 line holding a JSON object
//! with `jsonrpc: "2.0"`, an `id`, and either `method`+`params` or
//! `result`/`error`. The same envelope is reused in two places: talking to
//! spawned tool servers, and intercepting tool calls issued by executed code
//! on its own stdout.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Immutable description of one callable capability, as advertised by a
/// tool server's `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        rename = "inputSchema",
        alias = "input_schema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
}

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub fn response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// A `tools/call` request parsed off a child's stdout line.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallEnvelope {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: ToolCallParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Classification of one line of child stdout: either a well-formed
/// tool-call request envelope, or ordinary program output. The decode is
/// speculative by design; anything that does not match the envelope shape
/// exactly falls through to `Text`.
#[derive(Debug)]
pub enum ChildLine {
    ToolCall(ToolCallEnvelope),
    Text(String),
}

impl ChildLine {
    pub fn classify(line: &str) -> ChildLine {
        let trimmed = line.trim_start();
        if trimmed.starts_with('{') {
            if let Ok(envelope) = serde_json::from_str::<ToolCallEnvelope>(trimmed) {
                if envelope.jsonrpc == "2.0"
                    && envelope.method == "tools/call"
                    && !envelope.params.name.is_empty()
                {
                    return ChildLine::ToolCall(envelope);
                }
            }
        }
        ChildLine::Text(line.to_string())
    }
}

/// Unwrap a `tools/call` result to a plain string: a single text content
/// block becomes its text, anything else is rendered as compact JSON.
pub fn unwrap_text_content(result: &Value) -> String {
    if let Some(blocks) = result.get("content").and_then(Value::as_array) {
        if blocks.len() == 1 {
            let block = &blocks[0];
            if block
                .get("type")
                .and_then(Value::as_str)
                .map(|kind| kind.eq_ignore_ascii_case("text"))
                .unwrap_or(false)
            {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    return text.to_string();
                }
            }
        }
    }
    serde_json::to_string(result).unwrap_or_default()
}

/// Wrap a plain string back into a `tools/call` result shape.
pub fn text_content(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }] })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_tool_call_envelope() {
        let line = r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"echo","arguments":{"text":"hi"}}}"#;
        match ChildLine::classify(line) {
            ChildLine::ToolCall(envelope) => {
                assert_eq!(envelope.params.name, "echo");
                assert_eq!(envelope.id, json!(7));
            }
            ChildLine::Text(_) => panic!("expected tool call"),
        }
    }

    #[test]
    fn plain_output_stays_text() {
        for line in [
            "hello world",
            "{not json",
            r#"{"jsonrpc":"2.0","id":1,"method":"other","params":{}}"#,
            r#"{"jsonrpc":"1.0","id":1,"method":"tools/call","params":{"name":"x"}}"#,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{}}"#,
        ] {
            assert!(matches!(ChildLine::classify(line), ChildLine::Text(_)));
        }
    }

    #[test]
    fn unwraps_single_text_block() {
        let result = json!({"content": [{"type": "text", "text": "hi"}]});
        assert_eq!(unwrap_text_content(&result), "hi");
    }

    #[test]
    fn multi_block_results_render_as_json() {
        let result = json!({"content": [
            {"type": "text", "text": "a"},
            {"type": "text", "text": "b"}
        ]});
        let rendered = unwrap_text_content(&result);
        assert!(rendered.contains("\"a\""));
        assert!(rendered.contains("\"b\""));
    }
}
