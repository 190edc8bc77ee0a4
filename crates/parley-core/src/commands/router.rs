// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use parley_voice::VoiceStartOptions;

use crate::commands::voice::parse_voice_start_options;

const DEFAULT_LIST_LIMIT: usize = 10;
const DEFAULT_EVENTS_LIMIT: usize = 50;

/// A parsed slash command.  Non-slash input returns `None` from
/// [`parse_command`] and is forwarded to the turn engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Rewind { checkpoint_id: Option<String> },
    Checkpoint(CheckpointCommand),
    Session(SessionCommand),
    Voice(VoiceCommand),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointCommand {
    List { limit: usize },
    Rewind { checkpoint_id: String },
    Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    New { title: Option<String> },
    List { limit: usize },
    Name { title: String },
    Resume { identifier: String },
    Fork,
    Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoiceCommand {
    Start(VoiceStartOptions),
    Status,
    Devices,
    Events { limit: usize },
    Stop,
    Usage(String),
}

/// Tokenise a slash command.  Commands are single-line and
/// whitespace-tokenised.
pub fn parse_command(input: &str) -> Option<Command> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    let command = match tokens[0] {
        "/help" => Command::Help,
        "/rewind" => Command::Rewind {
            checkpoint_id: tokens.get(1).map(|s| s.to_string()),
        },
        "/checkpoint" => Command::Checkpoint(parse_checkpoint(&tokens[1..])),
        "/session" => Command::Session(parse_session(&tokens[1..])),
        "/voice" => Command::Voice(parse_voice(&tokens[1..])),
        other => Command::Unknown(other.to_string()),
    };
    Some(command)
}

fn parse_limit(token: Option<&&str>, default: usize) -> usize {
    token
        .and_then(|t| t.parse::<usize>().ok())
        .unwrap_or(default)
        .max(1)
}

fn parse_checkpoint(rest: &[&str]) -> CheckpointCommand {
    match rest.first().copied() {
        Some("list") => CheckpointCommand::List {
            limit: parse_limit(rest.get(1), DEFAULT_LIST_LIMIT),
        },
        Some("rewind") => match rest.get(1) {
            Some(id) => CheckpointCommand::Rewind {
                checkpoint_id: id.to_string(),
            },
            None => CheckpointCommand::Usage,
        },
        _ => CheckpointCommand::Usage,
    }
}

fn parse_session(rest: &[&str]) -> SessionCommand {
    match rest.first().copied() {
        Some("new") => SessionCommand::New {
            title: join_nonempty(&rest[1..]),
        },
        Some("list") => SessionCommand::List {
            limit: parse_limit(rest.get(1), DEFAULT_LIST_LIMIT),
        },
        Some("name") => match join_nonempty(&rest[1..]) {
            Some(title) => SessionCommand::Name { title },
            None => SessionCommand::Usage,
        },
        Some("resume") => match rest.get(1) {
            Some(_) => SessionCommand::Resume {
                identifier: rest[1..].join(" "),
            },
            None => SessionCommand::Usage,
        },
        Some("fork") => SessionCommand::Fork,
        _ => SessionCommand::Usage,
    }
}

fn parse_voice(rest: &[&str]) -> VoiceCommand {
    match rest.first().copied() {
        Some("start") => match parse_voice_start_options(&rest[1..]) {
            Ok(opts) => VoiceCommand::Start(opts),
            Err(usage) => VoiceCommand::Usage(usage),
        },
        Some("status") => VoiceCommand::Status,
        Some("devices") => VoiceCommand::Devices,
        Some("events") => VoiceCommand::Events {
            limit: parse_limit(rest.get(1), DEFAULT_EVENTS_LIMIT),
        },
        Some("stop") => VoiceCommand::Stop,
        _ => VoiceCommand::Usage(
            "Usage: /voice [start [source] [flags...] | status | devices | events [n] | stop]"
                .into(),
        ),
    }
}

fn join_nonempty(tokens: &[&str]) -> Option<String> {
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command("  what about /voice mid-sentence"), None);
    }

    #[test]
    fn help_parses() {
        assert_eq!(parse_command("/help"), Some(Command::Help));
    }

    #[test]
    fn rewind_with_and_without_id() {
        assert_eq!(
            parse_command("/rewind abc123"),
            Some(Command::Rewind { checkpoint_id: Some("abc123".into()) })
        );
        assert_eq!(
            parse_command("/rewind"),
            Some(Command::Rewind { checkpoint_id: None })
        );
    }

    #[test]
    fn checkpoint_subcommands() {
        assert_eq!(
            parse_command("/checkpoint list"),
            Some(Command::Checkpoint(CheckpointCommand::List { limit: 10 }))
        );
        assert_eq!(
            parse_command("/checkpoint list 25"),
            Some(Command::Checkpoint(CheckpointCommand::List { limit: 25 }))
        );
        assert_eq!(
            parse_command("/checkpoint rewind cp-1"),
            Some(Command::Checkpoint(CheckpointCommand::Rewind {
                checkpoint_id: "cp-1".into()
            }))
        );
        assert_eq!(
            parse_command("/checkpoint rewind"),
            Some(Command::Checkpoint(CheckpointCommand::Usage))
        );
        assert_eq!(
            parse_command("/checkpoint"),
            Some(Command::Checkpoint(CheckpointCommand::Usage))
        );
    }

    #[test]
    fn session_subcommands() {
        assert_eq!(
            parse_command("/session new"),
            Some(Command::Session(SessionCommand::New { title: None }))
        );
        assert_eq!(
            parse_command("/session new my research task"),
            Some(Command::Session(SessionCommand::New {
                title: Some("my research task".into())
            }))
        );
        assert_eq!(
            parse_command("/session list 5"),
            Some(Command::Session(SessionCommand::List { limit: 5 }))
        );
        assert_eq!(
            parse_command("/session name better title"),
            Some(Command::Session(SessionCommand::Name {
                title: "better title".into()
            }))
        );
        assert_eq!(
            parse_command("/session resume my task"),
            Some(Command::Session(SessionCommand::Resume {
                identifier: "my task".into()
            }))
        );
        assert_eq!(
            parse_command("/session fork"),
            Some(Command::Session(SessionCommand::Fork))
        );
        assert_eq!(
            parse_command("/session bogus"),
            Some(Command::Session(SessionCommand::Usage))
        );
    }

    #[test]
    fn voice_subcommands() {
        assert!(matches!(
            parse_command("/voice status"),
            Some(Command::Voice(VoiceCommand::Status))
        ));
        assert!(matches!(
            parse_command("/voice events 100"),
            Some(Command::Voice(VoiceCommand::Events { limit: 100 }))
        ));
        assert!(matches!(
            parse_command("/voice stop"),
            Some(Command::Voice(VoiceCommand::Stop))
        ));
        assert!(matches!(
            parse_command("/voice"),
            Some(Command::Voice(VoiceCommand::Usage(_)))
        ));
    }

    #[test]
    fn unknown_slash_command_is_reported() {
        assert_eq!(
            parse_command("/frobnicate now"),
            Some(Command::Unknown("/frobnicate".into()))
        );
    }

    #[test]
    fn limits_never_drop_below_one() {
        assert_eq!(
            parse_command("/session list 0"),
            Some(Command::Session(SessionCommand::List { limit: 1 }))
        );
    }
}
