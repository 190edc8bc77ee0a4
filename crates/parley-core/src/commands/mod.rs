// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod format;
mod router;
mod voice;

pub use format::{
    format_checkpoint_list_entry, format_rewind_outcome_lines, format_session_list_entry,
    format_session_summary_lines, short_id,
};
pub use router::{parse_command, CheckpointCommand, Command, SessionCommand, VoiceCommand};
pub use voice::parse_voice_start_options;
