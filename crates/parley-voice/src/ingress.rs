// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use parley_tools::ToolRegistry;

const UPDATES_TOOL_SUFFIX: &str = "__stt_get_updates";
const POLL_LIMIT: u32 = 100;

/// Source of speech-to-text events.  The runtime's poll task drives this
/// repeatedly with the last seen sequence number; a streaming transport is
/// an equally valid implementation.
#[async_trait]
pub trait VoiceIngress: Send + Sync {
    /// Fetch events newer than `since_seq`.
    async fn poll(&self, session_id: &str, since_seq: u64) -> anyhow::Result<Vec<Value>>;

    /// Pause between polls.
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(200)
    }
}

/// Default ingress: polls the STT server's `get_updates` tool.
pub struct PollingIngress {
    tools: Arc<ToolRegistry>,
}

impl PollingIngress {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl VoiceIngress for PollingIngress {
    async fn poll(&self, session_id: &str, since_seq: u64) -> anyhow::Result<Vec<Value>> {
        let tool_name = self
            .tools
            .names()
            .into_iter()
            .find(|n| n.ends_with(UPDATES_TOOL_SUFFIX))
            .ok_or_else(|| anyhow::anyhow!("missing MCP tool stt_get_updates"))?;
        let tool = self
            .tools
            .get(&tool_name)
            .ok_or_else(|| anyhow::anyhow!("tool not found: {tool_name}"))?;
        let raw = tool
            .execute(&json!({
                "session_id": session_id,
                "since_seq": since_seq,
                "limit": POLL_LIMIT,
            }))
            .await?;
        let payload = parse_json_object(&raw)?;
        Ok(payload["events"].as_array().cloned().unwrap_or_default())
    }
}

/// Parse a tool reply as a JSON object, tolerating markdown code fences and
/// leading/trailing prose around the object.
pub fn parse_json_object(raw: &str) -> anyhow::Result<Value> {
    let text = raw.trim();
    if text.starts_with("```") {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() >= 3 {
            // Strip the fence lines, keep the body.
            let body = &lines[1..lines.len() - 1];
            return parse_json_object_body(&body.join("\n"));
        }
    }
    parse_json_object_body(text)
}

fn parse_json_object_body(text: &str) -> anyhow::Result<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Ok(v);
        }
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            let v: Value = serde_json::from_str(&trimmed[start..=end])?;
            if v.is_object() {
                return Ok(v);
            }
        }
    }
    anyhow::bail!("tool response was not a valid JSON object")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
