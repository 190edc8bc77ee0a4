// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON-RPC 2.0 message types for the MCP framing.  Over stdio each message
//! is a single newline-delimited line of JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request (has an `id` — expects a response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A notification (no `id` — fire-and-forget).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

// ─── MCP payloads ─────────────────────────────────────────────────────────────

/// A tool definition returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<McpToolDef>,
}

/// One content item in a `tools/call` response.  Only text blocks carry
/// payload the runtime understands; other kinds are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ToolCallContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Join all text content with newlines; `(no output)` when empty.
    pub fn joined_text(&self) -> String {
        let text: Vec<&str> = self
            .content
            .iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text.as_str())
            .collect();
        if text.is_empty() {
            "(no output)".to_string()
        } else {
            text.join("\n")
        }
    }
}

/// Parameters for the `initialize` request.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {},
        "clientInfo": {
            "name": "parley",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_id_and_method() {
        let req = JsonRpcRequest::new(1, "initialize", Some(initialize_params()));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
    }

    #[test]
    fn request_without_params_omits_field() {
        let req = JsonRpcRequest::new(2, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn notification_has_no_id() {
        let notif = JsonRpcNotification::new("notifications/initialized");
        let json = serde_json::to_string(&notif).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn error_response_round_trip() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid request"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.is_error());
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, -32600);
        assert_eq!(format!("{err}"), "JSON-RPC error -32600: Invalid request");
    }

    #[test]
    fn tools_list_parses_camel_case_schema() {
        let raw = r#"{ "tools": [{
            "name": "stt_start_session",
            "description": "Start a speech-to-text session",
            "inputSchema": { "type": "object", "properties": { "source": { "type": "string" } } }
        }] }"#;
        let result: ToolsListResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.tools[0].name, "stt_start_session");
        assert!(result.tools[0].input_schema["properties"]["source"].is_object());
    }

    #[test]
    fn tools_list_defaults_missing_fields() {
        let raw = r#"{ "tools": [{ "name": "ping" }] }"#;
        let result: ToolsListResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.tools[0].description, "");
        assert_eq!(result.tools[0].input_schema["type"], "object");
    }

    #[test]
    fn tool_call_result_joins_text_blocks() {
        let raw = r#"{ "content": [
            { "type": "text", "text": "line one" },
            { "type": "image", "data": "..." },
            { "type": "text", "text": "line two" }
        ] }"#;
        let result: ToolCallResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.joined_text(), "line one\nline two");
        assert!(!result.is_error);
    }

    #[test]
    fn empty_tool_call_result_reports_no_output() {
        let result: ToolCallResult = serde_json::from_str(r#"{ "content": [] }"#).unwrap();
        assert_eq!(result.joined_text(), "(no output)");
    }

    #[test]
    fn tool_call_error_flag_parses() {
        let raw = r#"{ "content": [{ "type": "text", "text": "boom" }], "isError": true }"#;
        let result: ToolCallResult = serde_json::from_str(raw).unwrap();
        assert!(result.is_error);
    }
}
