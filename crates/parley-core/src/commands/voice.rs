// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use parley_voice::VoiceStartOptions;

const START_USAGE: &str = "Usage: /voice start [microphone|loopback] \
    [--mic-device-id <id>] [--mic-device-name <name>] \
    [--chunk-seconds <n>] [--endpointing-ms <n>] [--utterance-end-ms <n>]";

/// Parse the tokens after `/voice start`.
///
/// `--mic-device-name` accepts multiple tokens up to the next `--` flag so
/// device names with spaces need no quoting.
pub fn parse_voice_start_options(parts: &[&str]) -> Result<VoiceStartOptions, String> {
    let mut opts = VoiceStartOptions::default();
    let mut idx = 0;
    if let Some(first) = parts.first() {
        if !first.starts_with("--") {
            opts.source = first.to_lowercase();
            idx = 1;
        }
    }

    while idx < parts.len() {
        match parts[idx] {
            "--mic-device-id" => {
                let Some(value) = parts.get(idx + 1) else {
                    return Err("Usage: /voice start ... --mic-device-id <id>".into());
                };
                opts.mic_device_id = Some(value.to_string());
                idx += 2;
            }
            "--mic-device-name" => {
                let mut name_tokens = Vec::new();
                let mut j = idx + 1;
                while j < parts.len() && !parts[j].starts_with("--") {
                    name_tokens.push(parts[j]);
                    j += 1;
                }
                if name_tokens.is_empty() {
                    return Err("Usage: /voice start ... --mic-device-name <name>".into());
                }
                let joined = name_tokens.join(" ");
                opts.mic_device_name =
                    Some(joined.trim().trim_matches(|c| c == '"' || c == '\'').to_string());
                idx = j;
            }
            "--chunk-seconds" => {
                opts.chunk_seconds = Some(parse_int(parts.get(idx + 1), "chunk-seconds")?);
                idx += 2;
            }
            "--endpointing-ms" => {
                opts.endpointing_ms = Some(parse_int(parts.get(idx + 1), "endpointing-ms")?);
                idx += 2;
            }
            "--utterance-end-ms" => {
                opts.utterance_end_ms = Some(parse_int(parts.get(idx + 1), "utterance-end-ms")?);
                idx += 2;
            }
            _ => return Err(START_USAGE.into()),
        }
    }
    Ok(opts)
}

fn parse_int(token: Option<&&str>, flag: &str) -> Result<u32, String> {
    let Some(token) = token else {
        return Err(format!("Usage: /voice start ... --{flag} <n>"));
    };
    token
        .parse::<u32>()
        .map_err(|_| format!("{flag} must be an integer"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
