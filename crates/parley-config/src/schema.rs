// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be on unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_provider() -> String {
    "anthropic".into()
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".into()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    1.0
}

fn default_max_tool_result_chars() -> usize {
    40_000
}

fn default_max_conversation_messages() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider identifier: "anthropic" | "openai".
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub model: String,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Tool results longer than this are truncated before being handed back
    /// to the model.  0 disables truncation.
    pub max_tool_result_chars: usize,
    /// Hard cap on the in-memory conversation length; the oldest messages
    /// are dropped once the list grows past it.  0 disables trimming.
    pub max_conversation_messages: usize,
    /// Working directory for checkpoint path resolution.  Defaults to the
    /// process working directory.
    pub working_directory: Option<PathBuf>,
    /// Custom system prompt.  When unset a small built-in prompt is used.
    pub system_prompt: Option<String>,
    pub compaction: CompactionConfig,
    pub memory: MemoryConfig,
    pub checkpoints: CheckpointConfig,
    pub session: SessionConfig,
    /// MCP servers to connect at startup, keyed by server name.
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_tool_result_chars: default_max_tool_result_chars(),
            max_conversation_messages: default_max_conversation_messages(),
            working_directory: None,
            system_prompt: None,
            compaction: CompactionConfig::default(),
            memory: MemoryConfig::default(),
            checkpoints: CheckpointConfig::default(),
            session: SessionConfig::default(),
            mcp_servers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategyName {
    #[default]
    None,
    Summarize,
}

fn default_compaction_threshold() -> usize {
    80_000
}

fn default_protected_tail() -> usize {
    6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub strategy: CompactionStrategyName,
    /// Estimated-token threshold above which the summarize strategy fires.
    pub threshold_tokens: usize,
    /// Number of trailing messages never included in a summary.
    pub protected_tail_messages: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: CompactionStrategyName::None,
            threshold_tokens: default_compaction_threshold(),
            protected_tail_messages: default_protected_tail(),
        }
    }
}

fn default_db_path() -> String {
    ".parley/memory.db".into()
}

fn default_max_sessions() -> usize {
    200
}

fn default_max_messages_per_session() -> usize {
    5000
}

fn default_retention_days() -> i64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Path of the embedded database file.  `~` is expanded.
    pub db_path: String,
    pub max_sessions: usize,
    pub max_messages_per_session: usize,
    pub retention_days: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: default_db_path(),
            max_sessions: default_max_sessions(),
            max_messages_per_session: default_max_messages_per_session(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_write_tool_names() -> Vec<String> {
    vec!["write_file".into(), "append_file".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// When true, only tools named in `write_tool_names` participate in
    /// mutation tracking, even if a tool advertises itself as mutating.
    pub write_tools_only: bool,
    /// Allowlist of tool names that are always treated as mutating.
    pub write_tool_names: Vec<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            write_tools_only: default_true(),
            write_tool_names: default_write_tool_names(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Resume this session id (or title) instead of starting a new one.
    pub resume_session_id: Option<String>,
    /// Continue the configured session (creating it on first use).
    pub continue_conversation: bool,
    /// Fixed session id used together with `continue_conversation`.
    pub session_id: Option<String>,
    /// Fork the selected session before attaching to it.
    pub fork_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    pub transport: McpTransportKind,
    /// Executable to spawn (stdio transport).
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment variables for the child process.  The parent
    /// process environment is inherited and these are layered on top.
    pub env: HashMap<String, String>,
    /// Endpoint URL (http transport).
    pub url: Option<String>,
}
