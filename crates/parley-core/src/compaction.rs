// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use parley_model::{estimate_tokens, ContentBlock, Message, MessageContent, Provider, Role};

/// Pluggable transcript compaction.  Called before each model submission
/// and after each tool batch.
#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    async fn maybe_compact(&self, messages: Vec<Message>) -> Vec<Message>;
}

/// Identity strategy: history trimming in the engine is the only bound.
pub struct NoneCompaction;

#[async_trait]
impl CompactionStrategy for NoneCompaction {
    async fn maybe_compact(&self, messages: Vec<Message>) -> Vec<Message> {
        messages
    }
}

const SUMMARIZE_PROMPT: &str = "\
Summarize the following conversation history between a user and an AI assistant.
Preserve these details precisely:
- The original user request and any specific criteria or instructions
- All decisions made and their reasoning
- Key data points, URLs, file paths, and identifiers that may be needed later
- Any scores, rankings, or evaluations produced
- Current task status and next steps

Do NOT include raw tool output data (job descriptions, email bodies, etc.) --
just note what was retrieved and key findings.

Format as a concise narrative summary.

---
CONVERSATION HISTORY:

";

const SUMMARY_MAX_TOKENS: u32 = 4096;
const TOOL_ARGS_PREVIEW_CHARS: usize = 200;
const FORMATTED_INPUT_CAP_CHARS: usize = 100_000;
const ACK_TEXT: &str = "Understood. Continuing with the current task.";

/// Summarises the middle of the transcript through the provider's
/// non-streaming endpoint once the estimated token count crosses the
/// threshold.  The seed user message and a protected tail are preserved;
/// any summarisation failure is fail-open (the input is returned unchanged
/// and trimming still bounds growth).
pub struct SummarizeCompaction {
    provider: Arc<dyn Provider>,
    model: String,
    threshold_tokens: usize,
    protected_tail_messages: usize,
}

impl SummarizeCompaction {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        threshold_tokens: usize,
        protected_tail_messages: usize,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            threshold_tokens,
            protected_tail_messages,
        }
    }

    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<String> {
        let mut formatted = format_for_summarization(messages);
        if formatted.len() > FORMATTED_INPUT_CAP_CHARS {
            let half = FORMATTED_INPUT_CAP_CHARS / 2;
            let head_end = floor_char_boundary(&formatted, half);
            let tail_start = floor_char_boundary(&formatted, formatted.len() - half);
            formatted = format!(
                "{}\n\n[...middle of conversation omitted for brevity...]\n\n{}",
                &formatted[..head_end],
                &formatted[tail_start..],
            );
        }
        debug!(input_chars = formatted.len(), "compaction summary request");
        self.provider
            .create_message(
                &self.model,
                SUMMARY_MAX_TOKENS,
                0.0,
                &[Message::user(format!("{SUMMARIZE_PROMPT}{formatted}"))],
            )
            .await
    }
}

#[async_trait]
impl CompactionStrategy for SummarizeCompaction {
    async fn maybe_compact(&self, messages: Vec<Message>) -> Vec<Message> {
        let estimated = estimate_tokens(&messages);
        if estimated < self.threshold_tokens || messages.len() < 2 {
            return messages;
        }

        let compact_start = 1;
        let mut compact_end = messages.len().saturating_sub(self.protected_tail_messages);
        if compact_end <= compact_start {
            return messages;
        }
        compact_end = adjust_boundary(&messages, compact_start, compact_end);
        if compact_end <= compact_start {
            return messages;
        }

        let compactable = &messages[compact_start..compact_end];
        info!(
            estimated,
            threshold = self.threshold_tokens,
            count = compactable.len(),
            "compacting transcript"
        );

        let summary = match self.summarize(compactable).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "compaction failed, falling back to history trimming");
                return messages;
            }
        };

        let result = rebuild_messages(&messages, compact_end, &summary);
        info!(
            freed = estimated.saturating_sub(estimate_tokens(&result)),
            "compaction complete"
        );
        result
    }
}

/// Pull the boundary back so an assistant message containing tool_use is
/// never separated from the tool_result message that follows it.
fn adjust_boundary(messages: &[Message], start: usize, end: usize) -> usize {
    let mut end = end;
    while end > start + 1 {
        let boundary = &messages[end - 1];
        if boundary.role != Role::Assistant || !boundary.has_tool_use() {
            break;
        }
        // Its tool_result sits at messages[end], inside the protected tail.
        end -= 1;
    }
    end
}

/// Merge the seed message with the summary block, re-establish strict
/// user/assistant alternation, and append the unchanged tail.
fn rebuild_messages(messages: &[Message], compact_end: usize, summary: &str) -> Vec<Message> {
    let original = messages[0].joined_text();
    let merged = format!("{original}\n\n[CONTEXT SUMMARY]\n{summary}\n[END CONTEXT SUMMARY]");

    let tail = &messages[compact_end..];
    let mut result = Vec::with_capacity(tail.len() + 2);
    result.push(Message::user(merged));
    if tail.first().map(|m| m.role) == Some(Role::User) {
        result.push(Message::assistant(ACK_TEXT));
    }
    result.extend_from_slice(tail);
    result
}

/// Render the compactable slice as a role-headed plain-text transcript with
/// previewed tool calls and results.
fn format_for_summarization(messages: &[Message]) -> String {
    let mut parts = Vec::with_capacity(messages.len());
    for msg in messages {
        let role = msg.role.as_str();
        let body = match &msg.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => {
                let mut lines = Vec::with_capacity(blocks.len());
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => lines.push(text.clone()),
                        ContentBlock::ToolUse { name, input, .. } => {
                            let mut args = input.to_string();
                            if args.len() > TOOL_ARGS_PREVIEW_CHARS {
                                let cut = floor_char_boundary(&args, TOOL_ARGS_PREVIEW_CHARS);
                                args = format!("{}...", &args[..cut]);
                            }
                            lines.push(format!("[Tool call: {name}({args})]"));
                        }
                        ContentBlock::ToolResult { tool_use_id, content, .. } => {
                            lines.push(format!(
                                "[Tool result ({tool_use_id})]: {}",
                                preview_text(content)
                            ));
                        }
                    }
                }
                lines.join("\n")
            }
        };
        parts.push(format!("[{role}]: {body}"));
    }
    parts.join("\n\n")
}

/// Leading 500 + trailing 200 characters with an elision marker.
fn preview_text(text: &str) -> String {
    if text.len() <= 700 {
        return text.to_string();
    }
    let head = floor_char_boundary(text, 500);
    let tail = floor_char_boundary(text, text.len() - 200);
    format!(
        "{}\n[...truncated...]\n{}",
        &text[..head],
        &text[tail..]
    )
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_model::ScriptedProvider;
    use serde_json::json;

    fn tool_use_msg(id: &str) -> Message {
        Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: id.into(),
            name: "read_file".into(),
            input: json!({ "path": "x" }),
        }])
    }

    fn tool_result_msg(id: &str) -> Message {
        Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: id.into(),
            content: "file contents".into(),
            is_error: false,
        }])
    }

    #[tokio::test]
    async fn none_strategy_is_identity() {
        let messages = vec![Message::user("a"), Message::assistant("b")];
        let out = NoneCompaction.maybe_compact(messages.clone()).await;
        assert_eq!(out, messages);
    }

    #[tokio::test]
    async fn below_threshold_is_unchanged() {
        let provider = Arc::new(ScriptedProvider::new(vec![]).with_summary("should not be used"));
        let strategy = SummarizeCompaction::new(provider.clone(), "m", 1_000_000, 2);
        let messages = vec![Message::user("short"), Message::assistant("reply")];
        let out = strategy.maybe_compact(messages.clone()).await;
        assert_eq!(out, messages);
        assert!(provider.create_calls.lock().unwrap().is_empty());
    }

    fn long_conversation() -> Vec<Message> {
        // Each message is 400 chars -> 100 tokens; ten messages ~ 1000 tokens.
        let filler = "x".repeat(400);
        let mut messages = vec![Message::user(format!("seed request: {filler}"))];
        for i in 0..9 {
            if i % 2 == 0 {
                messages.push(Message::assistant(filler.clone()));
            } else {
                messages.push(Message::user(filler.clone()));
            }
        }
        messages
    }

    #[tokio::test]
    async fn summary_replaces_middle_and_keeps_alternation() {
        let provider = Arc::new(ScriptedProvider::new(vec![]).with_summary("the summary"));
        let strategy = SummarizeCompaction::new(provider.clone(), "m", 100, 3);
        let messages = long_conversation();
        let out = strategy.maybe_compact(messages.clone()).await;

        assert!(out.len() < messages.len());
        // Seed text and delimited summary block merged into the first message.
        let first = out[0].joined_text();
        assert!(first.contains("seed request:"));
        assert!(first.contains("[CONTEXT SUMMARY]\nthe summary\n[END CONTEXT SUMMARY]"));
        assert_eq!(out[0].role, Role::User);
        // Strict user/assistant alternation starting with user.
        for (i, msg) in out.iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            assert_eq!(msg.role, expected, "alternation broken at {i}");
        }
        // The protected tail is untouched.
        let tail = &messages[messages.len() - 3..];
        assert_eq!(&out[out.len() - 3..], tail);
        // The summariser was actually called once.
        assert_eq!(provider.create_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ack_is_inserted_when_tail_starts_with_user() {
        let provider = Arc::new(ScriptedProvider::new(vec![]).with_summary("s"));
        let strategy = SummarizeCompaction::new(provider, "m", 100, 3);
        let mut messages = long_conversation();
        // Force the first tail message to be a user message.
        let n = messages.len();
        messages[n - 3] = Message::user("tail starts with user".repeat(20));
        let out = strategy.maybe_compact(messages).await;
        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[1].role, Role::Assistant);
        assert_eq!(out[1].joined_text(), ACK_TEXT);
    }

    #[tokio::test]
    async fn boundary_never_severs_tool_use_from_result() {
        let provider = Arc::new(ScriptedProvider::new(vec![]).with_summary("s"));
        let strategy = SummarizeCompaction::new(provider, "m", 10, 2);
        let filler = "y".repeat(400);
        let messages = vec![
            Message::user(format!("seed {filler}")),
            Message::assistant(filler.clone()),
            Message::user(filler.clone()),
            tool_use_msg("tu_1"),     // would sit at the compaction boundary
            tool_result_msg("tu_1"),  // protected tail starts here
            Message::assistant(filler.clone()),
        ];
        let out = strategy.maybe_compact(messages).await;

        // Both halves of the pair must survive, adjacent and in order.
        let tu_pos = out
            .iter()
            .position(|m| m.has_tool_use())
            .expect("tool_use preserved");
        match &out[tu_pos + 1].content {
            MessageContent::Blocks(blocks) => {
                assert!(matches!(
                    &blocks[0],
                    ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "tu_1"
                ));
            }
            _ => panic!("expected tool_result after tool_use"),
        }
    }

    #[tokio::test]
    async fn summarisation_error_is_fail_open() {
        let provider =
            Arc::new(ScriptedProvider::new(vec![]).with_summary_error("rate limited"));
        let strategy = SummarizeCompaction::new(provider, "m", 100, 3);
        let messages = long_conversation();
        let out = strategy.maybe_compact(messages.clone()).await;
        assert_eq!(out, messages, "failure must return the input unchanged");
    }

    #[test]
    fn adjust_boundary_retreats_over_tool_use_run() {
        let messages = vec![
            Message::user("seed"),
            Message::user("a"),
            tool_use_msg("1"),
            tool_result_msg("1"),
            Message::assistant("done"),
        ];
        // end=3 points just past the tool_use message: retreat to 2.
        assert_eq!(adjust_boundary(&messages, 1, 3), 2);
        // A plain-text boundary is untouched.
        assert_eq!(adjust_boundary(&messages, 1, 5), 5);
    }

    #[test]
    fn formatted_transcript_previews_tools() {
        let big_args = json!({ "content": "z".repeat(400) });
        let messages = vec![
            Message::user("do the thing"),
            Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "write_file".into(),
                input: big_args,
            }]),
            Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: "r".repeat(1000),
                is_error: false,
            }]),
        ];
        let text = format_for_summarization(&messages);
        assert!(text.contains("[user]: do the thing"));
        assert!(text.contains("[Tool call: write_file("));
        assert!(text.contains("...)]"), "long args are elided: {text}");
        assert!(text.contains("[Tool result (t1)]:"));
        assert!(text.contains("[...truncated...]"));
    }

    #[test]
    fn preview_text_keeps_short_input() {
        assert_eq!(preview_text("short"), "short");
        let long = "a".repeat(1000);
        let p = preview_text(&long);
        assert!(p.starts_with(&"a".repeat(500)));
        assert!(p.contains("[...truncated...]"));
        assert!(p.ends_with(&"a".repeat(200)));
    }
}
