// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;
use tokio::sync::Mutex;

use parley_memory::{CheckpointManager, MemoryError, SessionManager};
use parley_voice::VoiceRuntime;

use crate::commands::{
    format_checkpoint_list_entry, format_rewind_outcome_lines, format_session_list_entry,
    format_session_summary_lines, parse_command, CheckpointCommand, Command, SessionCommand,
    VoiceCommand,
};
use crate::engine::TurnEngine;

/// Memory handles the command layer needs outside a turn.
#[derive(Clone)]
pub struct AgentMemory {
    pub sessions: Arc<SessionManager>,
    pub checkpoints: Option<Arc<CheckpointManager>>,
}

/// The agent: a turn engine behind the run lock, plus the slash-command
/// surface for session, checkpoint and voice administration.
///
/// The run lock is load-bearing: it serialises turns (keyboard and voice)
/// AND protects the engine's message list, so it is held across the whole
/// of `run` — never per-operation.
pub struct Agent {
    engine: Arc<Mutex<TurnEngine>>,
    memory: Option<AgentMemory>,
    voice: StdMutex<Option<Arc<VoiceRuntime>>>,
    line_prefix: String,
}

impl Agent {
    pub fn new(
        engine: TurnEngine,
        memory: Option<AgentMemory>,
        line_prefix: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::new(Mutex::new(engine)),
            memory,
            voice: StdMutex::new(None),
            line_prefix: line_prefix.into(),
        })
    }

    /// Shared engine handle, used to wire the voice `on_utterance` callback.
    pub fn engine(&self) -> Arc<Mutex<TurnEngine>> {
        self.engine.clone()
    }

    pub fn set_voice(&self, voice: Arc<VoiceRuntime>) {
        *self.voice.lock().unwrap() = Some(voice);
    }

    /// Route one line of user input: slash commands are handled locally,
    /// everything else becomes a turn.
    pub async fn handle_input(&self, line: &str) -> anyhow::Result<()> {
        match parse_command(line) {
            None => self.submit(line).await,
            Some(command) => self.dispatch(command).await,
        }
    }

    /// Run one turn under the run lock.
    pub async fn submit(&self, text: &str) -> anyhow::Result<()> {
        let mut engine = self.engine.lock().await;
        engine.run(text).await
    }

    async fn dispatch(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Help => self.print_help(),
            Command::Rewind { checkpoint_id: Some(id) } => self.rewind(&id).await,
            Command::Rewind { checkpoint_id: None } => {
                println!("{}Usage: /rewind <checkpoint-id>", self.line_prefix);
            }
            Command::Checkpoint(cmd) => self.handle_checkpoint(cmd).await,
            Command::Session(cmd) => self.handle_session(cmd).await,
            Command::Voice(cmd) => self.handle_voice(cmd).await,
            Command::Unknown(cmd) => {
                println!(
                    "{}Unknown command: {cmd}. Type /help for available commands.",
                    self.line_prefix
                );
            }
        }
        Ok(())
    }

    fn print_help(&self) {
        let p = &self.line_prefix;
        println!("{p}Commands:");
        println!("{p}  /help                                  show this help");
        println!("{p}  /rewind <id>                           undo file changes from a checkpoint");
        println!("{p}  /checkpoint list [n]                   list recent checkpoints");
        println!("{p}  /checkpoint rewind <id>                same as /rewind");
        println!("{p}  /session new [title]                   start a fresh session");
        println!("{p}  /session list [n]                      list recent sessions");
        println!("{p}  /session name <title>                  rename the current session");
        println!("{p}  /session resume <id-or-name>           switch to another session");
        println!("{p}  /session fork                          fork the current session");
        println!("{p}  /voice start [source] [flags...]       start voice input");
        println!("{p}  /voice status | devices | events [n]   inspect the voice session");
        println!("{p}  /voice stop                            stop voice input");
    }

    async fn rewind(&self, checkpoint_id: &str) {
        let p = &self.line_prefix;
        let Some(checkpoints) = self.memory.as_ref().and_then(|m| m.checkpoints.clone()) else {
            println!("{p}Checkpointing is disabled.");
            return;
        };
        match checkpoints.rewind_files(checkpoint_id) {
            Ok((_, outcomes)) => {
                for line in format_rewind_outcome_lines(p, checkpoint_id, &outcomes) {
                    println!("{line}");
                }
            }
            Err(MemoryError::NotFound(_)) => {
                println!("{p}Checkpoint not found: {checkpoint_id}");
            }
            Err(e) => println!("{p}Rewind failed: {e}"),
        }
    }

    async fn handle_checkpoint(&self, command: CheckpointCommand) {
        let p = &self.line_prefix;
        match command {
            CheckpointCommand::Rewind { checkpoint_id } => self.rewind(&checkpoint_id).await,
            CheckpointCommand::List { limit } => {
                let Some(checkpoints) = self.memory.as_ref().and_then(|m| m.checkpoints.clone())
                else {
                    println!("{p}Checkpointing is disabled.");
                    return;
                };
                let Some(session_id) = self.active_session_id().await else {
                    println!("{p}No active session.");
                    return;
                };
                match checkpoints.list_checkpoints(&session_id, limit) {
                    Ok(list) if list.is_empty() => println!("{p}No checkpoints in this session."),
                    Ok(list) => {
                        println!("{p}Checkpoints:");
                        for cp in &list {
                            println!("{}", format_checkpoint_list_entry(p, cp));
                        }
                    }
                    Err(e) => println!("{p}Failed to list checkpoints: {e}"),
                }
            }
            CheckpointCommand::Usage => {
                println!("{p}Usage: /checkpoint [list [n] | rewind <id>]");
            }
        }
    }

    async fn handle_session(&self, command: SessionCommand) {
        let p = &self.line_prefix;
        let Some(memory) = &self.memory else {
            println!("{p}Memory is disabled; session commands are unavailable.");
            return;
        };
        match command {
            SessionCommand::New { title } => {
                let metadata = title.map(|t| json!({ "title": t }));
                match memory.sessions.create_session(None, None, metadata) {
                    Ok(id) => {
                        let mut engine = self.engine.lock().await;
                        engine.attach_session(id.clone(), Vec::new());
                        println!("{p}Started session {id}");
                    }
                    Err(e) => println!("{p}Failed to create session: {e}"),
                }
            }
            SessionCommand::List { limit } => match memory.sessions.list_sessions(limit) {
                Ok(sessions) if sessions.is_empty() => println!("{p}No sessions."),
                Ok(sessions) => {
                    let active = self.active_session_id().await;
                    for session in &sessions {
                        println!(
                            "{}",
                            format_session_list_entry(p, session, active.as_deref())
                        );
                    }
                }
                Err(e) => println!("{p}Failed to list sessions: {e}"),
            },
            SessionCommand::Name { title } => {
                let Some(session_id) = self.active_session_id().await else {
                    println!("{p}No active session.");
                    return;
                };
                match memory.sessions.set_session_title(&session_id, &title) {
                    Ok(()) => println!("{p}Session renamed to \"{title}\""),
                    Err(e) => println!("{p}Failed to rename session: {e}"),
                }
            }
            SessionCommand::Resume { identifier } => {
                match memory.sessions.resolve_session_identifier(&identifier) {
                    Ok(Some(session)) => self.switch_to(memory, &session.id).await,
                    Ok(None) => println!("{p}No session matches \"{identifier}\""),
                    Err(MemoryError::Ambiguous(_)) => {
                        println!(
                            "{p}\"{identifier}\" matches more than one session; \
                             use the session id instead."
                        );
                    }
                    Err(e) => println!("{p}Failed to resolve session: {e}"),
                }
            }
            SessionCommand::Fork => {
                let Some(session_id) = self.active_session_id().await else {
                    println!("{p}No active session.");
                    return;
                };
                match memory.sessions.fork_session(&session_id, None) {
                    Ok(fork_id) => {
                        println!("{p}Forked session {session_id} -> {fork_id}");
                        self.switch_to(memory, &fork_id).await;
                    }
                    Err(e) => println!("{p}Failed to fork session: {e}"),
                }
            }
            SessionCommand::Usage => {
                println!(
                    "{p}Usage: /session [new [title] | list [n] | name <title> | \
                     resume <id-or-name> | fork]"
                );
            }
        }
    }

    async fn switch_to(&self, memory: &AgentMemory, session_id: &str) {
        let p = &self.line_prefix;
        let messages = match memory.sessions.load_messages(session_id) {
            Ok(m) => m,
            Err(e) => {
                println!("{p}Failed to load session messages: {e}");
                return;
            }
        };
        {
            let mut engine = self.engine.lock().await;
            engine.attach_session(session_id.to_string(), messages);
        }
        println!("{p}Resumed session {session_id}");
        if let Ok(summary) = memory.sessions.build_session_summary(session_id) {
            for line in format_session_summary_lines(p, &summary) {
                println!("{line}");
            }
        }
    }

    async fn handle_voice(&self, command: VoiceCommand) {
        let p = &self.line_prefix;
        let voice = self.voice.lock().unwrap().clone();
        let Some(voice) = voice else {
            println!("{p}Voice is not configured.");
            return;
        };
        let output = match command {
            VoiceCommand::Start(opts) => voice.start(opts).await,
            VoiceCommand::Status => voice.status().await,
            VoiceCommand::Devices => voice.devices().await,
            VoiceCommand::Events { limit } => voice.events(limit).await,
            VoiceCommand::Stop => voice.stop().await,
            VoiceCommand::Usage(usage) => format!("{p}{usage}"),
        };
        println!("{output}");
    }

    async fn active_session_id(&self) -> Option<String> {
        let engine = self.engine.lock().await;
        engine.session_id().map(str::to_string)
    }
}
