// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use parley_model::{estimate_tokens, Message, MessageContent, Role};

use crate::{utc_now, EventSink, MemoryError, MemoryStore, Result};

/// A row from the sessions table.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub parent_session_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub status: String,
    pub model: String,
    pub metadata: Value,
}

impl SessionRecord {
    /// Human title: `metadata.title`, falling back to a derived default.
    pub fn title(&self) -> String {
        self.metadata["title"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| derived_title(&self.id))
    }
}

fn derived_title(session_id: &str) -> String {
    let short: String = session_id.chars().take(8).collect();
    format!("session-{short}")
}

/// Counts and previews shown when a session is resumed.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub created_at: String,
    pub updated_at: String,
    pub message_count: i64,
    pub user_message_count: i64,
    pub assistant_message_count: i64,
    pub checkpoint_count: i64,
    pub last_user_preview: String,
    pub last_assistant_preview: String,
}

const PREVIEW_CHARS: usize = 80;

/// CRUD over sessions, their append-only ordered messages, and tool-call
/// records.
pub struct SessionManager {
    store: Arc<MemoryStore>,
    model: String,
    events: Arc<EventSink>,
}

impl SessionManager {
    pub fn new(store: Arc<MemoryStore>, model: impl Into<String>, events: Arc<EventSink>) -> Self {
        Self {
            store,
            model: model.into(),
            events,
        }
    }

    pub fn create_session(
        &self,
        session_id: Option<&str>,
        parent_session_id: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<String> {
        let sid = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = utc_now();
        let mut metadata = match metadata {
            Some(Value::Object(map)) => Value::Object(map),
            _ => json!({}),
        };
        if metadata["title"].as_str().map_or(true, str::is_empty) {
            metadata["title"] = json!(derived_title(&sid));
        }
        self.store.with_conn(|c| {
            c.execute(
                "INSERT INTO sessions (id, parent_session_id, created_at, updated_at, status, model, metadata_json)
                 VALUES (?1, ?2, ?3, ?3, 'active', ?4, ?5)",
                params![sid, parent_session_id, now, self.model, metadata.to_string()],
            )
        })?;
        self.events.emit(
            &sid,
            "session.started",
            json!({ "session_id": sid, "parent_session_id": parent_session_id }),
        );
        Ok(sid)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.store.with_conn(|c| {
            c.query_row(
                "SELECT id, parent_session_id, created_at, updated_at, status, model, metadata_json
                 FROM sessions WHERE id = ?1 LIMIT 1",
                [session_id],
                row_to_session,
            )
            .optional()
        })
    }

    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        self.store.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id, parent_session_id, created_at, updated_at, status, model, metadata_json
                 FROM sessions
                 ORDER BY updated_at DESC, created_at DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit.max(1) as i64], row_to_session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Idempotent: returns the id whether the session existed or was created.
    pub fn load_or_create(&self, session_id: &str) -> Result<String> {
        if self.get_session(session_id)?.is_some() {
            return Ok(session_id.to_string());
        }
        self.create_session(Some(session_id), None, None)
    }

    pub fn set_session_title(&self, session_id: &str, title: &str) -> Result<()> {
        let session = self
            .get_session(session_id)?
            .ok_or_else(|| MemoryError::NotFound(format!("session {session_id}")))?;
        let mut metadata = session.metadata;
        metadata["title"] = json!(title);
        let now = utc_now();
        self.store.with_conn(|c| {
            c.execute(
                "UPDATE sessions SET metadata_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![metadata.to_string(), now, session_id],
            )
        })?;
        self.events.emit(
            session_id,
            "session.renamed",
            json!({ "session_id": session_id, "title": title }),
        );
        Ok(())
    }

    /// Append one message, assigning the next per-session sequence number.
    /// Returns `(message_id, seq)`.
    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &MessageContent,
    ) -> Result<(String, i64)> {
        let message_id = Uuid::new_v4().to_string();
        let now = utc_now();
        let content_json = serde_json::to_string(content)?;
        let token_estimate = estimate_tokens(&[Message {
            role,
            content: content.clone(),
        }]) as i64;

        let seq = self.store.transaction(|tx| {
            let next_seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?1",
                [session_id],
                |r| r.get(0),
            )?;
            tx.execute(
                "INSERT INTO messages (id, session_id, seq, role, content_json, created_at, token_estimate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![message_id, session_id, next_seq, role.as_str(), content_json, now, token_estimate],
            )?;
            tx.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![now, session_id],
            )?;
            Ok(next_seq)
        })?;

        self.events.emit(
            session_id,
            "message.appended",
            json!({
                "session_id": session_id,
                "message_id": message_id,
                "seq": seq,
                "role": role.as_str(),
            }),
        );
        Ok((message_id, seq))
    }

    /// All messages of a session in seq order.
    pub fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows: Vec<(String, String)> = self.store.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT role, content_json FROM messages WHERE session_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map([session_id], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut messages = Vec::with_capacity(rows.len());
        for (role, content_json) in rows {
            let role = Role::parse(&role)
                .ok_or_else(|| MemoryError::Storage(format!("unknown role {role:?}")))?;
            let content: MessageContent = serde_json::from_str(&content_json)?;
            messages.push(Message { role, content });
        }
        Ok(messages)
    }

    /// One row per invoked tool use, written after the tool returned.
    #[allow(clippy::too_many_arguments)]
    pub fn record_tool_call(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        tool_name: &str,
        tool_input: &Value,
        result_text: &str,
        is_error: bool,
        tool_call_id: Option<&str>,
    ) -> Result<String> {
        let call_id = tool_call_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = utc_now();
        self.store.transaction(|tx| {
            tx.execute(
                "INSERT INTO tool_calls (id, session_id, message_id, tool_name, input_json, result_text, is_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    call_id,
                    session_id,
                    message_id,
                    tool_name,
                    tool_input.to_string(),
                    result_text,
                    is_error as i64,
                    now,
                ],
            )?;
            tx.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![now, session_id],
            )?;
            Ok(())
        })?;
        Ok(call_id)
    }

    pub fn build_session_summary(&self, session_id: &str) -> Result<SessionSummary> {
        let session = self
            .get_session(session_id)?
            .ok_or_else(|| MemoryError::NotFound(format!("session {session_id}")))?;

        let (message_count, user_count, assistant_count, checkpoint_count) =
            self.store.with_conn(|c| {
                let total: i64 = c.query_row(
                    "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                    [session_id],
                    |r| r.get(0),
                )?;
                let users: i64 = c.query_row(
                    "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND role = 'user'",
                    [session_id],
                    |r| r.get(0),
                )?;
                let assistants: i64 = c.query_row(
                    "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND role = 'assistant'",
                    [session_id],
                    |r| r.get(0),
                )?;
                let checkpoints: i64 = c.query_row(
                    "SELECT COUNT(*) FROM checkpoints WHERE session_id = ?1",
                    [session_id],
                    |r| r.get(0),
                )?;
                Ok((total, users, assistants, checkpoints))
            })?;

        Ok(SessionSummary {
            created_at: session.created_at,
            updated_at: session.updated_at,
            message_count,
            user_message_count: user_count,
            assistant_message_count: assistant_count,
            checkpoint_count,
            last_user_preview: self.last_message_preview(session_id, Role::User)?,
            last_assistant_preview: self.last_message_preview(session_id, Role::Assistant)?,
        })
    }

    fn last_message_preview(&self, session_id: &str, role: Role) -> Result<String> {
        let content_json: Option<String> = self.store.with_conn(|c| {
            c.query_row(
                "SELECT content_json FROM messages
                 WHERE session_id = ?1 AND role = ?2
                 ORDER BY seq DESC LIMIT 1",
                params![session_id, role.as_str()],
                |r| r.get(0),
            )
            .optional()
        })?;
        let Some(content_json) = content_json else {
            return Ok(String::new());
        };
        let content: MessageContent = serde_json::from_str(&content_json)?;
        let text = Message { role, content }.joined_text();
        Ok(preview(&text, PREVIEW_CHARS))
    }

    /// Copy a session verbatim into a new one with the parent pointer set.
    /// Message seq, role, content, token_estimate and created_at are
    /// preserved; rows get fresh ids.
    pub fn fork_session(&self, source_id: &str, new_id: Option<&str>) -> Result<String> {
        if self.get_session(source_id)?.is_none() {
            return Err(MemoryError::NotFound(format!("session {source_id}")));
        }
        let fork_id = self.create_session(
            new_id,
            Some(source_id),
            Some(json!({ "forked_from": source_id })),
        )?;
        self.store.transaction(|tx| {
            let mut select = tx.prepare(
                "SELECT seq, role, content_json, created_at, token_estimate
                 FROM messages WHERE session_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = select
                .query_map([source_id], |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut insert = tx.prepare(
                "INSERT INTO messages (id, session_id, seq, role, content_json, created_at, token_estimate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (seq, role, content_json, created_at, token_estimate) in rows {
                insert.execute(params![
                    Uuid::new_v4().to_string(),
                    fork_id,
                    seq,
                    role,
                    content_json,
                    created_at,
                    token_estimate,
                ])?;
            }
            Ok(())
        })?;
        Ok(fork_id)
    }

    /// Resolve a user-supplied identifier: exact id first, then
    /// case-insensitive title match.  More than one title match is an error
    /// the user must disambiguate.
    pub fn resolve_session_identifier(&self, identifier: &str) -> Result<Option<SessionRecord>> {
        if let Some(session) = self.get_session(identifier)? {
            return Ok(Some(session));
        }
        let all = self.list_sessions(usize::MAX >> 1)?;
        let mut matches: Vec<SessionRecord> = all
            .into_iter()
            .filter(|s| s.title().eq_ignore_ascii_case(identifier))
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0))),
            _ => Err(MemoryError::Ambiguous(identifier.to_string())),
        }
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let metadata_json: String = row.get(6)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        parent_session_id: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        status: row.get(4)?,
        model: row.get(5)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_else(|_| json!({})),
    })
}

/// First `max_chars` characters with an ellipsis when cut.
fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{cut}...")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_model::ContentBlock;

    fn manager() -> SessionManager {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        SessionManager::new(store, "test-model", EventSink::disabled())
    }

    #[test]
    fn create_and_get_session() {
        let m = manager();
        let id = m.create_session(None, None, None).unwrap();
        let s = m.get_session(&id).unwrap().unwrap();
        assert_eq!(s.id, id);
        assert_eq!(s.status, "active");
        assert_eq!(s.model, "test-model");
        assert!(s.parent_session_id.is_none());
    }

    #[test]
    fn create_session_derives_title_when_missing() {
        let m = manager();
        let id = m.create_session(Some("abcdef1234"), None, None).unwrap();
        let s = m.get_session(&id).unwrap().unwrap();
        assert_eq!(s.title(), "session-abcdef12");
    }

    #[test]
    fn create_session_keeps_explicit_title() {
        let m = manager();
        let id = m
            .create_session(None, None, Some(json!({ "title": "my task" })))
            .unwrap();
        assert_eq!(m.get_session(&id).unwrap().unwrap().title(), "my task");
    }

    #[test]
    fn load_or_create_is_idempotent() {
        let m = manager();
        let a = m.load_or_create("fixed-id").unwrap();
        let b = m.load_or_create("fixed-id").unwrap();
        assert_eq!(a, b);
        assert_eq!(m.list_sessions(10).unwrap().len(), 1);
    }

    #[test]
    fn append_message_assigns_gapless_monotone_seq() {
        let m = manager();
        let sid = m.create_session(None, None, None).unwrap();
        let mut seqs = Vec::new();
        for i in 0..5 {
            let (_, seq) = m
                .append_message(&sid, Role::User, &MessageContent::Text(format!("m{i}")))
                .unwrap();
            seqs.push(seq);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn load_messages_round_trips_blocks() {
        let m = manager();
        let sid = m.create_session(None, None, None).unwrap();
        m.append_message(&sid, Role::User, &MessageContent::Text("hi".into()))
            .unwrap();
        let blocks = MessageContent::Blocks(vec![ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "read_file".into(),
            input: json!({ "path": "x" }),
        }]);
        m.append_message(&sid, Role::Assistant, &blocks).unwrap();

        let messages = m.load_messages(&sid).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].as_text(), Some("hi"));
        assert_eq!(messages[1].content, blocks);
    }

    #[test]
    fn append_to_unknown_session_is_integrity_error() {
        let m = manager();
        let err = m
            .append_message("missing", Role::User, &MessageContent::Text("x".into()))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Integrity(_)), "got {err:?}");
    }

    #[test]
    fn fork_copies_transcript_verbatim() {
        let m = manager();
        let sid = m.create_session(None, None, None).unwrap();
        for i in 0..4 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            m.append_message(&sid, role, &MessageContent::Text(format!("turn {i}")))
                .unwrap();
        }
        let fork_id = m.fork_session(&sid, None).unwrap();
        assert_ne!(fork_id, sid);

        let fork = m.get_session(&fork_id).unwrap().unwrap();
        assert_eq!(fork.parent_session_id.as_deref(), Some(sid.as_str()));
        assert_eq!(fork.metadata["forked_from"], json!(sid));

        let original = m.load_messages(&sid).unwrap();
        let copied = m.load_messages(&fork_id).unwrap();
        assert_eq!(original, copied);
    }

    #[test]
    fn fork_of_missing_session_is_not_found() {
        let m = manager();
        let err = m.fork_session("missing", None).unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[test]
    fn list_sessions_orders_by_recency() {
        let m = manager();
        let stale = m.create_session(Some("stale"), None, None).unwrap();
        let fresh = m.create_session(Some("fresh"), None, None).unwrap();
        // Timestamps are second-granular, so backdate explicitly.
        m.store
            .with_conn(|c| {
                c.execute(
                    "UPDATE sessions SET updated_at = '2020-01-01T00:00:00Z' WHERE id = ?1",
                    [stale.as_str()],
                )
            })
            .unwrap();
        let ids: Vec<String> = m.list_sessions(10).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![fresh, stale]);
    }

    #[test]
    fn resolve_prefers_exact_id() {
        let m = manager();
        let id = m
            .create_session(None, None, Some(json!({ "title": "research" })))
            .unwrap();
        let hit = m.resolve_session_identifier(&id).unwrap().unwrap();
        assert_eq!(hit.id, id);
    }

    #[test]
    fn resolve_matches_title_case_insensitively() {
        let m = manager();
        let id = m
            .create_session(None, None, Some(json!({ "title": "Research Notes" })))
            .unwrap();
        let hit = m.resolve_session_identifier("research notes").unwrap().unwrap();
        assert_eq!(hit.id, id);
    }

    #[test]
    fn resolve_returns_none_for_no_match() {
        let m = manager();
        m.create_session(None, None, None).unwrap();
        assert!(m.resolve_session_identifier("nope").unwrap().is_none());
    }

    #[test]
    fn resolve_fails_ambiguous_for_duplicate_titles() {
        let m = manager();
        m.create_session(None, None, Some(json!({ "title": "dup" }))).unwrap();
        m.create_session(None, None, Some(json!({ "title": "DUP" }))).unwrap();
        let err = m.resolve_session_identifier("dup").unwrap_err();
        assert!(matches!(err, MemoryError::Ambiguous(_)), "got {err:?}");
    }

    #[test]
    fn set_session_title_updates_metadata() {
        let m = manager();
        let id = m.create_session(None, None, None).unwrap();
        m.set_session_title(&id, "renamed").unwrap();
        assert_eq!(m.get_session(&id).unwrap().unwrap().title(), "renamed");
    }

    #[test]
    fn summary_counts_roles_and_previews() {
        let m = manager();
        let sid = m.create_session(None, None, None).unwrap();
        m.append_message(&sid, Role::User, &MessageContent::Text("find my notes".into()))
            .unwrap();
        m.append_message(&sid, Role::Assistant, &MessageContent::Text("on it".into()))
            .unwrap();
        m.append_message(&sid, Role::User, &MessageContent::Text("thanks".into()))
            .unwrap();

        let summary = m.build_session_summary(&sid).unwrap();
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.user_message_count, 2);
        assert_eq!(summary.assistant_message_count, 1);
        assert_eq!(summary.checkpoint_count, 0);
        assert_eq!(summary.last_user_preview, "thanks");
        assert_eq!(summary.last_assistant_preview, "on it");
    }

    #[test]
    fn preview_truncates_long_text() {
        let long = "x".repeat(200);
        let p = preview(&long, 80);
        assert!(p.ends_with("..."));
        assert!(p.chars().count() <= 80);
    }

    #[test]
    fn token_estimate_is_recorded() {
        let m = manager();
        let sid = m.create_session(None, None, None).unwrap();
        m.append_message(&sid, Role::User, &MessageContent::Text("12345678".into()))
            .unwrap();
        let estimate: i64 = m
            .store
            .with_conn(|c| {
                c.query_row(
                    "SELECT token_estimate FROM messages WHERE session_id = ?1",
                    [sid.as_str()],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert_eq!(estimate, 2);
    }
}
