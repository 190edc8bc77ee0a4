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

pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            client: reqwest::Client::new(),
        }
    }

    async fn attempt_stream_chat(&self, req: &ChatRequest) -> Result<StreamedReply, ProviderError> {
        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "stream": true,
            "messages": to_openai_messages(&req.system_prompt, &req.messages),
        });
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools);
        }

        debug!(model = %req.model, messages = req.messages.len(), "sending openai stream request");

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let mut byte_stream = resp.bytes_stream();
        let mut buf = String::new();
        let mut text = String::new();
        let mut tool_calls: BTreeMap<u64, ToolCallAcc> = BTreeMap::new();
        let mut finish_reason: Option<String> = None;
        let mut printed = false;

        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_string();
                buf.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let data = data.trim();
                if data == "[DONE]" {
                    break 'outer;
                }
                let Ok(v) = serde_json::from_str::<Value>(data) else { continue };
                let choice = &v["choices"][0];
                if let Some(reason) = choice["finish_reason"].as_str() {
                    finish_reason = Some(reason.to_string());
                }
                let delta = &choice["delta"];
                if let Some(content) = delta["content"].as_str() {
                    if !content.is_empty() {
                        if !printed {
                            print!("{}", req.line_prefix);
                            printed = true;
                        }
                        print!("{content}");
                        let _ = std::io::stdout().flush();
                        text.push_str(content);
                    }
                }
                if let Some(deltas) = delta["tool_calls"].as_array() {
                    for tc in deltas {
                        let idx = tc["index"].as_u64().unwrap_or(0);
                        let acc = tool_calls.entry(idx).or_default();
                        if let Some(id) = tc["id"].as_str() {
                            acc.id = id.to_string();
                        }
                        if let Some(name) = tc["function"]["name"].as_str() {
                            acc.name = name.to_string();
                        }
                        if let Some(args) = tc["function"]["arguments"].as_str() {
                            acc.arguments.push_str(args);
                        }
                    }
                }
            }
        }
        if printed {
            println!();
        }

        Ok(assemble_reply(text, tool_calls, finish_reason))
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
            "messages": to_openai_messages("", messages),
        });
        debug!(model, messages = messages.len(), "sending openai create request");

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let v: Value = resp.json().await?;
        Ok(v["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn convert_tools(&self, tools: &[ToolSchema]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect()
    }

    async fn stream_chat(&self, req: &ChatRequest) -> anyhow::Result<StreamedReply> {
        with_backoff("openai stream_chat", || self.attempt_stream_chat(req)).await
    }

    async fn create_message(
        &self,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        messages: &[Message],
    ) -> anyhow::Result<String> {
        with_backoff("openai create_message", || {
            self.attempt_create_message(model, max_tokens, temperature, messages)
        })
        .await
    }
}

#[derive(Default)]
struct ToolCallAcc {
    id: String,
    name: String,
    arguments: String,
}

/// Map OpenAI finish reasons to the normalised stop reasons.
fn normalise_finish_reason(reason: Option<&str>) -> StopReason {
    match reason.unwrap_or("stop") {
        "tool_calls" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

fn assemble_reply(
    text: String,
    tool_calls: BTreeMap<u64, ToolCallAcc>,
    finish_reason: Option<String>,
) -> StreamedReply {
    let mut content = Vec::new();
    let mut tool_uses = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::Text { text });
    }
    for (_, acc) in tool_calls {
        let input = if acc.arguments.is_empty() {
            json!({})
        } else {
            serde_json::from_str(&acc.arguments).unwrap_or_else(|e| {
                warn!(tool = %acc.name, error = %e, "failed to parse tool call arguments");
                json!({})
            })
        };
        tool_uses.push(ToolUse {
            id: acc.id.clone(),
            name: acc.name.clone(),
            input: input.clone(),
        });
        content.push(ContentBlock::ToolUse { id: acc.id, name: acc.name, input });
    }
    StreamedReply {
        message: Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(content),
        },
        tool_uses,
        stop_reason: normalise_finish_reason(finish_reason.as_deref()),
    }
}

/// Convert internal (Anthropic-style) messages to the OpenAI chat format.
///
/// Assistant tool_use blocks become `tool_calls`; user tool_result blocks
/// become separate role-`tool` messages keyed by `tool_call_id`.
pub(crate) fn to_openai_messages(system_prompt: &str, messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    if !system_prompt.is_empty() {
        out.push(json!({ "role": "system", "content": system_prompt }));
    }

    for msg in messages {
        match (&msg.role, &msg.content) {
            (Role::Assistant, MessageContent::Text(t)) => {
                out.push(json!({ "role": "assistant", "content": t }));
            }
            (Role::Assistant, MessageContent::Blocks(blocks)) => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => text_parts.push(text.as_str()),
                        ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            },
                        })),
                        ContentBlock::ToolResult { .. } => {}
                    }
                }
                let mut m = json!({ "role": "assistant" });
                m["content"] = if text_parts.is_empty() {
                    Value::Null
                } else {
                    json!(text_parts.join("\n"))
                };
                if !tool_calls.is_empty() {
                    m["tool_calls"] = json!(tool_calls);
                }
                out.push(m);
            }
            (Role::User, MessageContent::Text(t)) => {
                out.push(json!({ "role": "user", "content": t }));
            }
            (Role::User, MessageContent::Blocks(blocks)) => {
                let mut text_parts = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => text_parts.push(text.as_str()),
                        ContentBlock::ToolResult { tool_use_id, content, .. } => {
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                        }
                        ContentBlock::ToolUse { .. } => {}
                    }
                }
                if !text_parts.is_empty() {
                    out.push(json!({ "role": "user", "content": text_parts.join("\n") }));
                }
            }
            (Role::System, content) => {
                out.push(json!({
                    "role": "system",
                    "content": match content {
                        MessageContent::Text(t) => t.clone(),
                        MessageContent::Blocks(_) => msg.joined_text(),
                    },
                }));
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_becomes_first_message() {
        let wire = to_openai_messages("be helpful", &[Message::user("hi")]);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[0]["content"], "be helpful");
        assert_eq!(wire[1]["role"], "user");
    }

    #[test]
    fn assistant_tool_use_becomes_tool_calls() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::Text { text: "checking".into() },
            ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "read_file".into(),
                input: json!({ "path": "x" }),
            },
        ]);
        let wire = to_openai_messages("", &[msg]);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "assistant");
        assert_eq!(wire[0]["content"], "checking");
        assert_eq!(wire[0]["tool_calls"][0]["id"], "call_1");
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "read_file");
    }

    #[test]
    fn assistant_tool_only_message_has_null_content() {
        let msg = Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "call_1".into(),
            name: "t".into(),
            input: json!({}),
        }]);
        let wire = to_openai_messages("", &[msg]);
        assert!(wire[0]["content"].is_null());
    }

    #[test]
    fn tool_results_become_tool_role_messages_in_order() {
        let msg = Message::tool_results(vec![
            ContentBlock::ToolResult {
                tool_use_id: "a".into(),
                content: "one".into(),
                is_error: false,
            },
            ContentBlock::ToolResult {
                tool_use_id: "b".into(),
                content: "two".into(),
                is_error: true,
            },
        ]);
        let wire = to_openai_messages("", &[msg]);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "a");
        assert_eq!(wire[1]["tool_call_id"], "b");
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(normalise_finish_reason(Some("stop")), StopReason::EndTurn);
        assert_eq!(normalise_finish_reason(Some("tool_calls")), StopReason::ToolUse);
        assert_eq!(normalise_finish_reason(Some("length")), StopReason::MaxTokens);
        assert_eq!(normalise_finish_reason(None), StopReason::EndTurn);
    }

    #[test]
    fn assemble_reply_orders_tool_calls_by_index() {
        let mut accs = BTreeMap::new();
        accs.insert(
            1,
            ToolCallAcc { id: "b".into(), name: "second".into(), arguments: "{}".into() },
        );
        accs.insert(
            0,
            ToolCallAcc { id: "a".into(), name: "first".into(), arguments: "{}".into() },
        );
        let reply = assemble_reply(String::new(), accs, Some("tool_calls".into()));
        assert_eq!(reply.tool_uses[0].id, "a");
        assert_eq!(reply.tool_uses[1].id, "b");
        assert_eq!(reply.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn assemble_reply_tolerates_bad_arguments() {
        let mut accs = BTreeMap::new();
        accs.insert(
            0,
            ToolCallAcc { id: "a".into(), name: "t".into(), arguments: "{nope".into() },
        );
        let reply = assemble_reply(String::new(), accs, None);
        assert_eq!(reply.tool_uses[0].input, json!({}));
    }
}
