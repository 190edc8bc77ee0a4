// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// Trait implemented by every tool the agent can dispatch — local built-ins
/// and MCP proxies alike.
///
/// `execute` returns a tagged result: the turn engine converts an `Err` into
/// an error tool_result and the turn continues; tools never abort a turn.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the input object.
    fn input_schema(&self) -> Value;

    /// Whether this tool may modify files.  Mutating tools participate in
    /// checkpoint tracking before they run.
    fn is_mutating(&self) -> bool {
        false
    }

    /// Paths this invocation is expected to touch, for mutation tracking.
    /// The default mirrors the convention that mutating tools accept a
    /// `path` input field.
    fn predict_touched_paths(&self, input: &Value) -> Vec<String> {
        match input.get("path").and_then(Value::as_str) {
            Some(p) if !p.trim().is_empty() => vec![p.to_string()],
            _ => Vec::new(),
        }
    }

    async fn execute(&self, input: &Value) -> anyhow::Result<String>;
}
