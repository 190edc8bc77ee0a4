// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::{MemoryError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    parent_session_id TEXT NULL REFERENCES sessions(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('active', 'archived', 'deleted')),
    model TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    token_estimate INTEGER NOT NULL DEFAULT 0,
    UNIQUE(session_id, seq)
);

CREATE TABLE IF NOT EXISTS tool_calls (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    message_id TEXT NULL REFERENCES messages(id) ON DELETE SET NULL,
    tool_name TEXT NOT NULL,
    input_json TEXT NOT NULL,
    result_text TEXT NOT NULL,
    is_error INTEGER NOT NULL CHECK (is_error IN (0, 1)),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    user_message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    scope_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoint_files (
    checkpoint_id TEXT NOT NULL REFERENCES checkpoints(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    existed_before INTEGER NOT NULL CHECK (existed_before IN (0, 1)),
    backup_blob BLOB NULL,
    PRIMARY KEY (checkpoint_id, path)
);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session_seq
    ON messages(session_id, seq);
CREATE INDEX IF NOT EXISTS idx_messages_session_created
    ON messages(session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_tool_calls_session_created
    ON tool_calls(session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_checkpoints_session_created
    ON checkpoints(session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_events_session_created
    ON events(session_id, created_at);
";

/// Durable, transactional persistence for sessions, messages, tool calls,
/// checkpoints and events.
///
/// The store exclusively owns the database connection.  All access goes
/// through one mutex: a single logical writer, with reads serialised under
/// the same lock (SQLite without MVCC).
pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open (creating parent directories and applying the schema as needed).
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::Storage(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(db_path)
            .map_err(|e| MemoryError::Storage(format!("open {}: {e}", db_path.display())))?;
        Self::initialize(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| MemoryError::Storage(format!("schema init: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run `f` with the connection.  Prefer [`MemoryStore::transaction`] for
    /// multi-statement writes.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("memory store mutex poisoned");
        f(&conn).map_err(MemoryError::from)
    }

    /// Run `f` inside a write transaction: committed when `f` returns `Ok`,
    /// rolled back on `Err` (and on panic, via drop).
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().expect("memory store mutex poisoned");
        let tx = conn.transaction().map_err(MemoryError::from)?;
        let out = f(&tx).map_err(MemoryError::from)?;
        tx.commit().map_err(MemoryError::from)?;
        Ok(out)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
