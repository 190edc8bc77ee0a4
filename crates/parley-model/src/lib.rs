// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod anthropic;
mod mock;
mod openai;
mod provider;
mod retry;
mod types;

pub use anthropic::AnthropicProvider;
pub use mock::{reply_max_tokens, reply_text, reply_tool_uses, ScriptedProvider};
pub use openai::OpenAiProvider;
pub use provider::Provider;
pub use retry::ProviderError;
pub use types::*;

use std::sync::Arc;

use anyhow::bail;

/// Construct a provider by name.
///
/// The API key comes from the environment: `ANTHROPIC_API_KEY` for the
/// Anthropic driver, `OPENAI_API_KEY` for the OpenAI driver.
pub fn create_provider(
    name: &str,
    api_key: Option<String>,
    base_url: Option<String>,
) -> anyhow::Result<Arc<dyn Provider>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "anthropic" => {
            let key = api_key
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
                .unwrap_or_default();
            if key.is_empty() {
                bail!("ANTHROPIC_API_KEY is not set");
            }
            Ok(Arc::new(AnthropicProvider::new(key, base_url)))
        }
        "openai" => {
            let key = api_key
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .unwrap_or_default();
            if key.is_empty() {
                bail!("OPENAI_API_KEY is not set");
            }
            Ok(Arc::new(OpenAiProvider::new(key, base_url)))
        }
        other => bail!("unknown provider: {other:?} (supported: anthropic, openai)"),
    }
}
