// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::filter::EnvFilter;

use parley_config::{CompactionStrategyName, Config};
use parley_core::{
    Agent, AgentMemory, CompactionStrategy, EngineConfig, MemoryHandles, NoneCompaction,
    SummarizeCompaction, TurnEngine,
};
use parley_memory::{
    prune_memory, CheckpointManager, EventSink, MemoryStore, SessionManager,
};
use parley_model::{create_provider, Message};
use parley_tools::ToolRegistry;
use parley_voice::{PollingIngress, UtteranceHandler, VoiceRuntime};

const LINE_PREFIX: &str = "assistant> ";
const PROMPT: &str = "you> ";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    init_logging(cli.verbose);

    let mut config = parley_config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);

    let working_directory = match &config.working_directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine working directory")?,
    };

    let provider = create_provider(&config.provider, None, None)?;

    // External tool servers feed the registry; startup failures only cost
    // the affected server's tools.
    let (mcp, proxies) = parley_mcp::McpManager::connect_all(&config.mcp_servers).await;
    let mut registry = ToolRegistry::new();
    for tool in proxies {
        registry.register_arc(tool);
    }
    let registry = Arc::new(registry);
    tracing::info!(
        servers = mcp.server_count(),
        tools = registry.len(),
        "tool registry ready"
    );

    let memory = if config.memory.enabled {
        Some(bootstrap_memory(&config, &working_directory)?)
    } else {
        None
    };

    let compaction: Arc<dyn CompactionStrategy> = match config.compaction.strategy {
        CompactionStrategyName::None => Arc::new(NoneCompaction),
        CompactionStrategyName::Summarize => Arc::new(SummarizeCompaction::new(
            provider.clone(),
            config.model.clone(),
            config.compaction.threshold_tokens,
            config.compaction.protected_tail_messages,
        )),
    };

    let system_prompt = config
        .system_prompt
        .clone()
        .unwrap_or_else(|| default_system_prompt(&working_directory));

    let events = memory
        .as_ref()
        .map(|m| m.events.clone())
        .unwrap_or_else(EventSink::disabled);
    let engine_memory = memory.as_ref().map(|m| MemoryHandles {
        sessions: m.sessions.clone(),
        checkpoints: m.checkpoints.clone(),
        session_id: m.session_id.clone(),
    });

    let mut engine = TurnEngine::new(
        provider.clone(),
        registry.clone(),
        compaction,
        events,
        engine_memory,
        EngineConfig {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system_prompt,
            line_prefix: LINE_PREFIX.to_string(),
            max_tool_result_chars: config.max_tool_result_chars,
            max_conversation_messages: config.max_conversation_messages,
            write_tool_names: config
                .checkpoints
                .write_tool_names
                .iter()
                .cloned()
                .collect::<HashSet<_>>(),
        },
    );
    if let Some(memory) = &memory {
        if !memory.initial_messages.is_empty() {
            println!(
                "{LINE_PREFIX}Resumed session {} ({} messages)",
                memory.session_id,
                memory.initial_messages.len()
            );
        }
        engine.load_history(memory.initial_messages.clone());
    }

    let agent = Agent::new(
        engine,
        memory.as_ref().map(|m| AgentMemory {
            sessions: m.sessions.clone(),
            checkpoints: m.checkpoints.clone(),
        }),
        LINE_PREFIX,
    );

    // Voice utterances go through the same run lock as keyboard turns.
    let engine_handle = agent.engine();
    let on_utterance: UtteranceHandler = Arc::new(move |text: String| {
        let engine = engine_handle.clone();
        Box::pin(async move {
            let mut engine = engine.lock().await;
            if let Err(e) = engine.run(&text).await {
                tracing::error!(error = %e, "voice turn failed");
            }
        }) as futures::future::BoxFuture<'static, ()>
    });
    let ingress = Arc::new(PollingIngress::new(registry.clone()));
    let voice = Arc::new(VoiceRuntime::new(
        LINE_PREFIX,
        registry.clone(),
        ingress,
        on_utterance,
    ));
    agent.set_voice(voice.clone());

    run_repl(&agent).await?;

    voice.shutdown().await;
    mcp.shutdown().await;
    if let Some(memory) = &memory {
        memory.events.close().await;
    }
    Ok(())
}

struct MemoryParts {
    sessions: Arc<SessionManager>,
    checkpoints: Option<Arc<CheckpointManager>>,
    events: Arc<EventSink>,
    session_id: String,
    initial_messages: Vec<Message>,
}

/// Open the store, prune, start the event sink and select the session per
/// config: resume by id/title, continue the configured session, or start
/// fresh — optionally forking the selection.
fn bootstrap_memory(config: &Config, working_directory: &Path) -> anyhow::Result<MemoryParts> {
    let store = Arc::new(MemoryStore::open(Path::new(&config.memory.db_path))?);
    prune_memory(
        &store,
        config.memory.max_sessions,
        config.memory.max_messages_per_session,
        config.memory.retention_days,
    )?;
    let events = EventSink::start(store.clone());
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        config.model.clone(),
        events.clone(),
    ));

    let mut session_id = if let Some(identifier) = &config.session.resume_session_id {
        sessions
            .resolve_session_identifier(identifier)?
            .map(|s| s.id)
            .with_context(|| format!("no session matches {identifier:?}"))?
    } else if config.session.continue_conversation {
        let configured = config
            .session
            .session_id
            .clone()
            .unwrap_or_else(|| "default".to_string());
        sessions.load_or_create(&configured)?
    } else {
        sessions.create_session(None, None, None)?
    };

    if config.session.fork_session {
        session_id = sessions.fork_session(&session_id, None)?;
    }

    let initial_messages = sessions.load_messages(&session_id)?;

    let checkpoints = if config.checkpoints.enabled {
        Some(Arc::new(CheckpointManager::new(
            store.clone(),
            events.clone(),
            Some(working_directory.to_path_buf()),
            true,
            config.checkpoints.write_tools_only,
        )?))
    } else {
        None
    };

    Ok(MemoryParts {
        sessions,
        checkpoints,
        events,
        session_id,
        initial_messages,
    })
}

async fn run_repl(agent: &Agent) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_prompt();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            print_prompt();
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        if let Err(e) = agent.handle_input(line).await {
            println!("{LINE_PREFIX}Error: {e:#}");
        }
        print_prompt();
    }
    Ok(())
}

fn print_prompt() {
    print!("{PROMPT}");
    let _ = std::io::stdout().flush();
}

fn default_system_prompt(working_directory: &Path) -> String {
    format!(
        "You are Parley, a capable assistant that can call tools to get things done.\n\
         Use the available tools when they help; answer directly when they do not.\n\
         Working directory: {}\n\
         Keep responses concise. When a tool fails, explain the failure and continue \
         if possible.",
        working_directory.display()
    )
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
