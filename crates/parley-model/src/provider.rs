// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

use crate::{ChatRequest, Message, StreamedReply, ToolSchema};

/// Uniform contract over LLM providers.
///
/// Implementations stream text deltas to stdout (prefixed with
/// `ChatRequest::line_prefix`) as they arrive and return the fully
/// assembled assistant message with its tool_use blocks and a normalised
/// stop reason.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identifier for status display and logging.
    fn name(&self) -> &str;

    /// Translate generic tool schemas into the provider's native shape.
    fn convert_tools(&self, tools: &[ToolSchema]) -> Vec<Value>;

    /// Stream one chat completion.
    async fn stream_chat(&self, req: &ChatRequest) -> anyhow::Result<StreamedReply>;

    /// Blocking (non-streaming) completion returning plain text.  Used for
    /// compaction summaries.
    async fn create_message(
        &self,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        messages: &[Message],
    ) -> anyhow::Result<String>;
}
