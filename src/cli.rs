// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

use parley_config::Config;

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "A voice-capable, tool-using conversational agent")]
pub struct Cli {
    /// Path to config.json (defaults to ./config.json when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Resume a session by id or title
    #[arg(long)]
    pub resume: Option<String>,

    /// Continue the configured session, creating it on first use
    #[arg(long = "continue")]
    pub continue_conversation: bool,

    /// Fork the selected session before attaching to it
    #[arg(long)]
    pub fork: bool,

    /// Model override
    #[arg(long)]
    pub model: Option<String>,

    /// Verbose logging to stderr
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Command-line flags win over config-file values.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(resume) = &self.resume {
            config.session.resume_session_id = Some(resume.clone());
        }
        if self.continue_conversation {
            config.session.continue_conversation = true;
        }
        if self.fork {
            config.session.fork_session = true;
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_config() {
        let cli = Cli::parse_from([
            "parley",
            "--resume",
            "my-session",
            "--fork",
            "--model",
            "claude-opus-4-5",
        ]);
        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.session.resume_session_id.as_deref(), Some("my-session"));
        assert!(config.session.fork_session);
        assert_eq!(config.model, "claude-opus-4-5");
        assert!(!config.session.continue_conversation);
    }

    #[test]
    fn continue_flag_parses() {
        let cli = Cli::parse_from(["parley", "--continue"]);
        assert!(cli.continue_conversation);
    }
}
