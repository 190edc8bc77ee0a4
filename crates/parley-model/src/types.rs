use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A single typed content block inside a message.
///
/// The serialized form is the same shape that is stored in `content_json`
/// and sent over the Anthropic wire:
/// `{"type":"text",...}`, `{"type":"tool_use",...}`, `{"type":"tool_result",...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
    },
}

/// Message content — either a plain string or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Build the user message that carries a batch of tool results back to
    /// the model.
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// The plain text of this message when the content is a single string.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(_) => None,
        }
    }

    /// All text content, joining text blocks with newlines.  Used for
    /// previews and for merging during compaction.
    pub fn joined_text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Extract every tool_use block as an owned [`ToolUse`].
    pub fn tool_uses(&self) -> Vec<ToolUse> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    }),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn has_tool_use(&self) -> bool {
        matches!(&self.content, MessageContent::Blocks(blocks)
            if blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })))
    }

    /// Character count used by [`estimate_tokens`]: string content, text
    /// blocks, tool_use name + serialized input, tool_result content.
    pub fn content_chars(&self) -> usize {
        match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        name.len() + input.to_string().len()
                    }
                    ContentBlock::ToolResult { content, .. } => content.len(),
                })
                .sum(),
        }
    }
}

/// Coarse token estimate over a message list: total content characters
/// divided by four.  Deliberately cheap; the compaction threshold is
/// calibrated against this formula.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::content_chars).sum::<usize>() / 4
}

// ─── Tool call plumbing ───────────────────────────────────────────────────────

/// A tool invocation requested by the model, extracted from a tool_use block.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Generic tool schema handed to `Provider::convert_tools`.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub input_schema: Value,
}

// ─── Provider request / reply ─────────────────────────────────────────────────

/// Normalised reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
        }
    }

    /// Normalise a provider-reported stop reason.  Unknown values map to
    /// `EndTurn` so the turn ends cleanly instead of looping.
    pub fn from_wire(s: &str) -> StopReason {
        match s {
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        }
    }
}

/// One streaming chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    /// Provider-native tool schemas, produced by `Provider::convert_tools`.
    pub tools: Vec<Value>,
    /// Prefix printed before the first streamed text line.
    pub line_prefix: String,
}

/// The assembled result of one streamed model turn.
#[derive(Debug, Clone)]
pub struct StreamedReply {
    pub message: Message,
    pub tool_uses: Vec<ToolUse>,
    pub stop_reason: StopReason,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
