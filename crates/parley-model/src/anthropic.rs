// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::io::Write;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::retry::{with_backoff, ProviderError};
use crate::{
    ChatRequest, ContentBlock, Message, MessageContent, Provider, Role, StopReason, StreamedReply,
    ToolSchema, ToolUse,
};

pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }

    async fn attempt_stream_chat(&self, req: &ChatRequest) -> Result<StreamedReply, ProviderError> {
        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "stream": true,
            "messages": build_wire_messages(&req.messages),
        });
        if !req.system_prompt.is_empty() {
            body["system"] = json!(req.system_prompt);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools);
        }

        debug!(
            model = %req.model,
            messages = req.messages.len(),
            tools = req.tools.len(),
            "sending anthropic stream request"
        );

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward; only complete lines are parsed.
        let mut byte_stream = resp.bytes_stream();
        let mut buf = String::new();
        let mut state = StreamState::new(&req.line_prefix);
        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_string();
                buf.drain(..=pos);
                if let Some(data) = line.strip_prefix("data: ") {
                    if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                        state.apply(parse_stream_event(&v));
                    }
                }
            }
            if state.done {
                break;
            }
        }

        Ok(state.finish())
    }

    async fn attempt_create_message(
        &self,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        messages: &[Message],
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": build_wire_messages(messages),
        });
        debug!(model, messages = messages.len(), "sending anthropic create request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let v: Value = resp.json().await?;
        let text = v["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok(text)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn convert_tools(&self, tools: &[ToolSchema]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect()
    }

    async fn stream_chat(&self, req: &ChatRequest) -> anyhow::Result<StreamedReply> {
        with_backoff("anthropic stream_chat", || self.attempt_stream_chat(req)).await
    }

    async fn create_message(
        &self,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        messages: &[Message],
    ) -> anyhow::Result<String> {
        with_backoff("anthropic create_message", || {
            self.attempt_create_message(model, max_tokens, temperature, messages)
        })
        .await
    }
}

// ─── SSE event parsing ────────────────────────────────────────────────────────

/// A single parsed server-sent event from the messages stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamEvent {
    /// Start of a tool_use content block.
    BlockStart { index: u32, id: String, name: String },
    TextDelta { index: u32, text: String },
    InputJsonDelta { index: u32, partial: String },
    StopReason(String),
    Done,
    Ignore,
}

pub(crate) fn parse_stream_event(v: &Value) -> StreamEvent {
    let index = v["index"].as_u64().unwrap_or(0) as u32;
    match v["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                StreamEvent::BlockStart {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                }
            } else {
                StreamEvent::Ignore
            }
        }
        "content_block_delta" => match v["delta"]["type"].as_str().unwrap_or("") {
            "text_delta" => StreamEvent::TextDelta {
                index,
                text: v["delta"]["text"].as_str().unwrap_or("").to_string(),
            },
            "input_json_delta" => StreamEvent::InputJsonDelta {
                index,
                partial: v["delta"]["partial_json"].as_str().unwrap_or("").to_string(),
            },
            _ => StreamEvent::Ignore,
        },
        "message_delta" => match v["delta"]["stop_reason"].as_str() {
            Some(reason) => StreamEvent::StopReason(reason.to_string()),
            None => StreamEvent::Ignore,
        },
        "message_stop" => StreamEvent::Done,
        _ => StreamEvent::Ignore,
    }
}

// ─── Stream assembly ──────────────────────────────────────────────────────────

enum PartialBlock {
    Text(String),
    ToolUse { id: String, name: String, json_buf: String },
}

struct StreamState<'a> {
    blocks: BTreeMap<u32, PartialBlock>,
    stop_reason: Option<String>,
    line_prefix: &'a str,
    printed: bool,
    done: bool,
}

impl<'a> StreamState<'a> {
    fn new(line_prefix: &'a str) -> Self {
        Self {
            blocks: BTreeMap::new(),
            stop_reason: None,
            line_prefix,
            printed: false,
            done: false,
        }
    }

    fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::BlockStart { index, id, name } => {
                self.blocks.insert(
                    index,
                    PartialBlock::ToolUse { id, name, json_buf: String::new() },
                );
            }
            StreamEvent::TextDelta { index, text } if !text.is_empty() => {
                if !self.printed {
                    print!("{}", self.line_prefix);
                    self.printed = true;
                }
                print!("{text}");
                let _ = std::io::stdout().flush();
                match self
                    .blocks
                    .entry(index)
                    .or_insert_with(|| PartialBlock::Text(String::new()))
                {
                    PartialBlock::Text(t) => t.push_str(&text),
                    PartialBlock::ToolUse { .. } => {
                        warn!(index, "text delta for a tool_use block, dropping");
                    }
                }
            }
            StreamEvent::InputJsonDelta { index, partial } => {
                match self.blocks.get_mut(&index) {
                    Some(PartialBlock::ToolUse { json_buf, .. }) => json_buf.push_str(&partial),
                    _ => warn!(index, "input_json_delta without tool_use block, dropping"),
                }
            }
            StreamEvent::StopReason(reason) => self.stop_reason = Some(reason),
            StreamEvent::Done => self.done = true,
            _ => {}
        }
    }

    fn finish(self) -> StreamedReply {
        if self.printed {
            println!();
        }
        let mut content = Vec::new();
        let mut tool_uses = Vec::new();
        for (_, block) in self.blocks {
            match block {
                PartialBlock::Text(text) => {
                    if !text.is_empty() {
                        content.push(ContentBlock::Text { text });
                    }
                }
                PartialBlock::ToolUse { id, name, json_buf } => {
                    let input = parse_tool_input(&name, &json_buf);
                    tool_uses.push(ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                    content.push(ContentBlock::ToolUse { id, name, input });
                }
            }
        }
        let stop_reason = match self.stop_reason.as_deref() {
            Some(s) => StopReason::from_wire(s),
            None if !tool_uses.is_empty() => StopReason::ToolUse,
            None => StopReason::EndTurn,
        };
        StreamedReply {
            message: Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(content),
            },
            tool_uses,
            stop_reason,
        }
    }
}

/// Parse accumulated tool-call argument JSON.  Empty or unparseable input
/// degrades to `{}` so the turn can proceed; the model sees its own call
/// echoed back and can retry.
fn parse_tool_input(name: &str, raw: &str) -> Value {
    if raw.is_empty() {
        return json!({});
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(tool = name, error = %e, "invalid tool input JSON from model, substituting {{}}");
            json!({})
        }
    }
}

/// Convert the internal message list into Anthropic conversation turns.
///
/// System messages never appear here — the system prompt travels as the
/// top-level `system` field — so any stray system role is skipped.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => {
                warn!("system message in conversation history, skipping");
                continue;
            }
        };
        let content = match &m.content {
            MessageContent::Text(t) => json!(t),
            MessageContent::Blocks(blocks) => {
                serde_json::to_value(blocks).unwrap_or_else(|_| json!([]))
            }
        };
        out.push(json!({ "role": role, "content": content }));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
