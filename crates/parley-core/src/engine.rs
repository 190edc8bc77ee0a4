// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use parley_memory::{CheckpointManager, EventSink, SessionManager};
use parley_model::{
    ChatRequest, ContentBlock, Message, Provider, StopReason, ToolSchema, ToolUse,
};
use parley_tools::{truncate_tool_result, ToolRegistry};

use crate::compaction::CompactionStrategy;

const MAX_TOKENS_RETRIES: u32 = 3;
const USER_PREVIEW_CHARS: usize = 120;

const CONTINUATION_PROMPT: &str = "Your response was cut off because it exceeded the token \
    limit. Please continue, but be more concise. If you were writing a file, break it into \
    smaller sections or shorten the content.";

/// Engine knobs, fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
    pub line_prefix: String,
    pub max_tool_result_chars: usize,
    pub max_conversation_messages: usize,
    /// Tool names always treated as mutating for checkpoint tracking.
    pub write_tool_names: HashSet<String>,
}

/// The durable-memory half of the engine, absent when memory is disabled.
#[derive(Clone)]
pub struct MemoryHandles {
    pub sessions: Arc<SessionManager>,
    pub checkpoints: Option<Arc<CheckpointManager>>,
    pub session_id: String,
}

/// Drives one user turn: stream the model, extract tool calls, dispatch
/// them concurrently, feed results back, repeat until the model stops
/// calling tools.
///
/// The engine exclusively owns the in-memory message list.  Callers hold it
/// inside the agent run lock for the whole of `run`, which serialises turns
/// and protects the list at once.
pub struct TurnEngine {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    compaction: Arc<dyn CompactionStrategy>,
    events: Arc<EventSink>,
    config: EngineConfig,
    converted_tools: Vec<Value>,
    memory: Option<MemoryHandles>,
    messages: Vec<Message>,
}

impl TurnEngine {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        compaction: Arc<dyn CompactionStrategy>,
        events: Arc<EventSink>,
        memory: Option<MemoryHandles>,
        config: EngineConfig,
    ) -> Self {
        let schemas: Vec<ToolSchema> = tools
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                input_schema: s.parameters,
            })
            .collect();
        let converted_tools = provider.convert_tools(&schemas);
        Self {
            provider,
            tools,
            compaction,
            events,
            config,
            converted_tools,
            memory,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn session_id(&self) -> Option<&str> {
        self.memory.as_ref().map(|m| m.session_id.as_str())
    }

    /// Switch to another session: the in-memory transcript is replaced by
    /// the given messages.  Used by `/session new|resume|fork`.
    pub fn attach_session(&mut self, session_id: String, messages: Vec<Message>) {
        match &mut self.memory {
            Some(memory) => {
                memory.session_id = session_id;
                self.messages = messages;
            }
            None => warn!("attach_session without memory enabled, ignoring"),
        }
    }

    /// Seed the in-memory transcript (startup resume path).
    pub fn load_history(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Run one user turn to completion.
    pub async fn run(&mut self, user_text: &str) -> anyhow::Result<()> {
        let user_message = Message::user(user_text);
        let user_message_id = self.persist_message(&user_message)?;
        self.messages.push(user_message);
        self.compact_and_trim().await;

        let mut turn_checkpoint: Option<String> = None;
        let mut max_tokens_attempts = 0u32;

        loop {
            let request = ChatRequest {
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                system_prompt: self.config.system_prompt.clone(),
                messages: self.messages.clone(),
                tools: self.converted_tools.clone(),
                line_prefix: self.config.line_prefix.clone(),
            };
            let reply = self.provider.stream_chat(&request).await?;

            let assistant_message_id = self.persist_message(&reply.message)?;
            self.messages.push(reply.message.clone());

            if reply.stop_reason == StopReason::MaxTokens && reply.tool_uses.is_empty() {
                max_tokens_attempts += 1;
                if max_tokens_attempts >= MAX_TOKENS_RETRIES {
                    println!(
                        "\n{}[Stopped: response exceeded max_tokens ({}) {} times in a row. \
                         Try increasing max_tokens in config.json or simplifying the request.]",
                        self.config.line_prefix, self.config.max_tokens, MAX_TOKENS_RETRIES
                    );
                    return Ok(());
                }
                let continuation = Message::user(CONTINUATION_PROMPT);
                self.persist_message(&continuation)?;
                self.messages.push(continuation);
                continue;
            }
            max_tokens_attempts = 0;

            if reply.tool_uses.is_empty() {
                return Ok(());
            }

            self.ensure_checkpoint_for_turn(
                &mut turn_checkpoint,
                user_message_id.as_deref(),
                user_text,
                &reply.tool_uses,
            );

            let results = self
                .execute_tools(
                    &reply.tool_uses,
                    assistant_message_id.as_deref(),
                    turn_checkpoint.as_deref(),
                )
                .await;
            let results_message = Message::tool_results(results);
            self.persist_message(&results_message)?;
            self.messages.push(results_message);
            self.compact_and_trim().await;
        }
    }

    /// Append to the store when memory is enabled; returns the message id.
    fn persist_message(&self, message: &Message) -> anyhow::Result<Option<String>> {
        let Some(memory) = &self.memory else {
            return Ok(None);
        };
        let (id, _seq) =
            memory
                .sessions
                .append_message(&memory.session_id, message.role, &message.content)?;
        Ok(Some(id))
    }

    async fn compact_and_trim(&mut self) {
        let messages = std::mem::take(&mut self.messages);
        self.messages = self.compaction.maybe_compact(messages).await;

        let limit = self.config.max_conversation_messages;
        if limit > 0 && self.messages.len() > limit {
            let removed = self.messages.len() - limit;
            warn!(removed, limit, "conversation history trimmed to stay within the message limit");
            self.messages.drain(..removed);
        }
    }

    /// A tool participates in checkpoint tracking when it is allowlisted, or
    /// when it advertises `is_mutating` and the write-tools-only gate is off.
    fn is_mutating_tool(&self, name: &str) -> bool {
        if self.config.write_tool_names.contains(name) {
            return true;
        }
        let Some(checkpoints) = self.memory.as_ref().and_then(|m| m.checkpoints.as_ref()) else {
            return false;
        };
        if checkpoints.write_tools_only() {
            return false;
        }
        self.tools.get(name).map(|t| t.is_mutating()).unwrap_or(false)
    }

    /// Create the turn's checkpoint on the first batch containing a mutating
    /// tool.  Fires at most once per turn; skipped entirely when memory or
    /// checkpointing is disabled.
    fn ensure_checkpoint_for_turn(
        &self,
        turn_checkpoint: &mut Option<String>,
        user_message_id: Option<&str>,
        user_text: &str,
        batch: &[ToolUse],
    ) {
        if turn_checkpoint.is_some() {
            return;
        }
        let Some(memory) = &self.memory else { return };
        let Some(checkpoints) = &memory.checkpoints else { return };
        if !checkpoints.enabled() {
            return;
        }
        let Some(user_message_id) = user_message_id else { return };
        if !batch.iter().any(|u| self.is_mutating_tool(&u.name)) {
            return;
        }

        let tool_names: Vec<&str> = batch.iter().map(|u| u.name.as_str()).collect();
        let scope = json!({
            "tools": tool_names,
            "user_preview": preview(user_text, USER_PREVIEW_CHARS),
        });
        match checkpoints.create_checkpoint(&memory.session_id, user_message_id, scope) {
            Ok(id) => *turn_checkpoint = Some(id),
            Err(e) => warn!(error = %e, "failed to create checkpoint, turn continues untracked"),
        }
    }

    /// Dispatch the batch concurrently and return tool_result blocks in the
    /// same order as the tool_use blocks, regardless of completion order.
    async fn execute_tools(
        &self,
        batch: &[ToolUse],
        assistant_message_id: Option<&str>,
        checkpoint_id: Option<&str>,
    ) -> Vec<ContentBlock> {
        let mut tasks = Vec::with_capacity(batch.len());
        for tool_use in batch.iter().cloned() {
            let tracking = checkpoint_id
                .filter(|_| self.is_mutating_tool(&tool_use.name))
                .and_then(|cp| {
                    self.memory
                        .as_ref()
                        .and_then(|m| m.checkpoints.clone())
                        .map(|manager| (manager, cp.to_string()))
                });
            tasks.push(tokio::spawn(run_one_tool(
                tool_use,
                self.tools.clone(),
                self.memory.clone(),
                tracking,
                assistant_message_id.map(str::to_string),
                self.events.clone(),
                self.config.max_tool_result_chars,
            )));
        }

        let mut blocks = Vec::with_capacity(batch.len());
        for (i, task) in tasks.into_iter().enumerate() {
            let block = match task.await {
                Ok(block) => block,
                Err(e) => ContentBlock::ToolResult {
                    tool_use_id: batch[i].id.clone(),
                    content: format!(
                        "Error executing tool \"{}\": task panicked: {e}",
                        batch[i].name
                    ),
                    is_error: true,
                },
            };
            blocks.push(block);
        }
        blocks
    }
}

async fn run_one_tool(
    tool_use: ToolUse,
    tools: Arc<ToolRegistry>,
    memory: Option<MemoryHandles>,
    tracking: Option<(Arc<CheckpointManager>, String)>,
    assistant_message_id: Option<String>,
    events: Arc<EventSink>,
    max_result_chars: usize,
) -> ContentBlock {
    let session_id = memory.as_ref().map(|m| m.session_id.clone());
    if let Some(sid) = &session_id {
        events.emit(
            sid,
            "tool.started",
            json!({ "tool_use_id": tool_use.id, "tool_name": tool_use.name }),
        );
    }

    // Snapshot the target file before the tool touches it.  Tracking
    // failures are logged and emitted; the tool call itself must proceed.
    if let Some((checkpoints, checkpoint_id)) = &tracking {
        if let Err(e) = checkpoints.maybe_track_tool_input(checkpoint_id, &tool_use.input) {
            warn!(tool = %tool_use.name, error = %e, "checkpoint tracking failed");
            if let Some(sid) = &session_id {
                events.emit(
                    sid,
                    "checkpoint.file_untracked",
                    json!({
                        "checkpoint_id": checkpoint_id,
                        "tool_name": tool_use.name,
                        "error": e.to_string(),
                    }),
                );
            }
        }
    }

    let (content, is_error) = match tools.get(&tool_use.name) {
        None => (format!("Error: unknown tool \"{}\"", tool_use.name), true),
        Some(tool) => match tool.execute(&tool_use.input).await {
            Ok(result) => (
                truncate_tool_result(result, &tool_use.name, max_result_chars),
                false,
            ),
            Err(e) => (
                format!("Error executing tool \"{}\": {e}", tool_use.name),
                true,
            ),
        },
    };

    if let Some(memory) = &memory {
        if let Err(e) = memory.sessions.record_tool_call(
            &memory.session_id,
            assistant_message_id.as_deref(),
            &tool_use.name,
            &tool_use.input,
            &content,
            is_error,
            Some(&tool_use.id),
        ) {
            warn!(error = %e, tool = %tool_use.name, "failed to record tool call");
        }
    }
    if let Some(sid) = &session_id {
        events.emit(
            sid,
            "tool.completed",
            json!({
                "tool_use_id": tool_use.id,
                "tool_name": tool_use.name,
                "is_error": is_error,
            }),
        );
    }

    ContentBlock::ToolResult {
        tool_use_id: tool_use.id,
        content,
        is_error,
    }
}

/// First `max_chars` characters, flattened to one line.
fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    flat.chars().take(max_chars).collect()
}
