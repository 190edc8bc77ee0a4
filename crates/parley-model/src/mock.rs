// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    ChatRequest, ContentBlock, Message, MessageContent, Provider, Role, StopReason, StreamedReply,
    ToolSchema, ToolUse,
};

/// A pre-scripted provider for tests.  Each `stream_chat` call pops the next
/// reply from the front of the queue; `create_message` pops from a separate
/// summary queue.  All requests are recorded so tests can inspect exactly
/// what was sent.
#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<StreamedReply>>,
    summaries: Mutex<VecDeque<Result<String, String>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub create_calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<StreamedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    /// Queue a summary string for the next `create_message` call.
    pub fn with_summary(self, summary: impl Into<String>) -> Self {
        self.summaries.lock().unwrap().push_back(Ok(summary.into()));
        self
    }

    /// Queue a `create_message` failure.
    pub fn with_summary_error(self, message: impl Into<String>) -> Self {
        self.summaries.lock().unwrap().push_back(Err(message.into()));
        self
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
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
        self.requests.lock().unwrap().push(req.clone());
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| reply_text("")))
    }

    async fn create_message(
        &self,
        _model: &str,
        _max_tokens: u32,
        _temperature: f32,
        messages: &[Message],
    ) -> anyhow::Result<String> {
        self.create_calls.lock().unwrap().push(messages.to_vec());
        match self.summaries.lock().unwrap().pop_front() {
            Some(Ok(s)) => Ok(s),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(String::new()),
        }
    }
}

/// A plain text reply ending the turn.
pub fn reply_text(text: impl Into<String>) -> StreamedReply {
    let text = text.into();
    let blocks = if text.is_empty() {
        Vec::new()
    } else {
        vec![ContentBlock::Text { text }]
    };
    StreamedReply {
        message: Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        },
        tool_uses: Vec::new(),
        stop_reason: StopReason::EndTurn,
    }
}

/// A reply truncated by the output token limit.
pub fn reply_max_tokens(text: impl Into<String>) -> StreamedReply {
    let mut reply = reply_text(text);
    reply.stop_reason = StopReason::MaxTokens;
    reply
}

/// A reply requesting the given tool calls (optionally preceded by text).
pub fn reply_tool_uses(text: impl Into<String>, uses: Vec<ToolUse>) -> StreamedReply {
    let text = text.into();
    let mut blocks = Vec::new();
    if !text.is_empty() {
        blocks.push(ContentBlock::Text { text });
    }
    for u in &uses {
        blocks.push(ContentBlock::ToolUse {
            id: u.id.clone(),
            name: u.name.clone(),
            input: u.input.clone(),
        });
    }
    StreamedReply {
        message: Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        },
        tool_uses: uses,
        stop_reason: StopReason::ToolUse,
    }
}
