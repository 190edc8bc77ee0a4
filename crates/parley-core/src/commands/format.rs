// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use parley_memory::{CheckpointRecord, RewindOutcome, SessionRecord, SessionSummary};

const SHORT_ID_LEN: usize = 8;

/// Leading characters of an id for compact display.
pub fn short_id(value: &str) -> String {
    value.chars().take(SHORT_ID_LEN).collect()
}

pub fn format_session_list_entry(
    prefix: &str,
    session: &SessionRecord,
    active_session_id: Option<&str>,
) -> String {
    let marker = if Some(session.id.as_str()) == active_session_id { "*" } else { " " };
    let parent = session.parent_session_id.as_deref().unwrap_or("-");
    format!(
        "{prefix}{marker} {} [{}] (id={}) (status={}, created={}, updated={}, parent={})",
        session.title(),
        short_id(&session.id),
        session.id,
        session.status,
        session.created_at,
        session.updated_at,
        parent,
    )
}

pub fn format_session_summary_lines(prefix: &str, summary: &SessionSummary) -> Vec<String> {
    let mut lines = vec![
        format!("{prefix}Session summary:"),
        format!(
            "{prefix}- Created: {} | Updated: {}",
            summary.created_at, summary.updated_at
        ),
        format!(
            "{prefix}- Messages: {} (user={}, assistant={})",
            summary.message_count, summary.user_message_count, summary.assistant_message_count
        ),
        format!("{prefix}- Checkpoints: {}", summary.checkpoint_count),
    ];
    if !summary.last_user_preview.is_empty() {
        lines.push(format!("{prefix}- Last user: {}", summary.last_user_preview));
    }
    if !summary.last_assistant_preview.is_empty() {
        lines.push(format!(
            "{prefix}- Last assistant: {}",
            summary.last_assistant_preview
        ));
    }
    lines
}

pub fn format_checkpoint_list_entry(prefix: &str, checkpoint: &CheckpointRecord) -> String {
    let tools = checkpoint.tools();
    let tool_text = if tools.is_empty() { "n/a".to_string() } else { tools.join(", ") };
    let preview = checkpoint.user_preview();
    let preview_text = if preview.is_empty() {
        String::new()
    } else {
        format!(", prompt=\"{preview}\"")
    };
    format!(
        "{prefix}- [{}] (id={}, created={}, tools={tool_text}{preview_text})",
        short_id(&checkpoint.id),
        checkpoint.id,
        checkpoint.created_at,
    )
}

pub fn format_rewind_outcome_lines(
    prefix: &str,
    checkpoint_id: &str,
    outcomes: &[RewindOutcome],
) -> Vec<String> {
    let mut lines = vec![format!("{prefix}Rewind {checkpoint_id} results:")];
    for outcome in outcomes {
        let suffix = if outcome.detail.is_empty() {
            String::new()
        } else {
            format!(" ({})", outcome.detail)
        };
        lines.push(format!(
            "{prefix}- {}: {}{suffix}",
            outcome.path,
            outcome.status.as_str()
        ));
    }
    lines
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
