// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::schema::Config;

const CONFIG_FILE: &str = "config.json";

/// Load the configuration.
///
/// When `explicit` is given the file must exist and parse.  Otherwise
/// `config.json` in the current directory is used when present, and the
/// built-in defaults apply when it is not.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let candidate = PathBuf::from(CONFIG_FILE);
            if !candidate.exists() {
                debug!("no config.json found, using defaults");
                return Ok(Config::default());
            }
            candidate
        }
    };

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.memory.db_path = expand_path(&config.memory.db_path);
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Expand `~` and `$VAR` in a configured path.
fn expand_path(raw: &str) -> String {
    shellexpand::full(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}
