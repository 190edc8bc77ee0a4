// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod checkpoint;
mod error;
mod event_sink;
mod pruning;
mod session;
mod store;

pub use checkpoint::{CheckpointManager, CheckpointRecord, RewindOutcome, RewindStatus};
pub use error::{MemoryError, Result};
pub use event_sink::EventSink;
pub use pruning::prune_memory;
pub use session::{SessionManager, SessionRecord, SessionSummary};
pub use store::MemoryStore;

/// UTC timestamp at seconds precision, e.g. `2026-08-01T12:34:56Z`.
/// Lexicographic order matches chronological order, which the recency
/// queries rely on.
pub fn utc_now() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
