// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{Duration, Utc};
use rusqlite::params;
use tracing::debug;

use crate::{MemoryStore, Result};

/// Bound the size of the store: drop sessions idle past the retention
/// window, trim each session to its newest messages, and cap the total
/// session count by recency.  Run once at startup.
pub fn prune_memory(
    store: &MemoryStore,
    max_sessions: usize,
    max_messages_per_session: usize,
    retention_days: i64,
) -> Result<()> {
    let cutoff = (Utc::now() - Duration::days(retention_days.max(1)))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let expired = store.with_conn(|c| {
        c.execute("DELETE FROM sessions WHERE updated_at < ?1", [cutoff.as_str()])
    })?;
    if expired > 0 {
        debug!(expired, "pruned sessions past retention window");
    }

    if max_messages_per_session > 0 {
        store.transaction(|tx| {
            let session_ids: Vec<String> = {
                let mut stmt = tx.prepare("SELECT id FROM sessions")?;
                let ids = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            for session_id in session_ids {
                tx.execute(
                    "DELETE FROM messages WHERE id IN (
                         SELECT id FROM messages
                         WHERE session_id = ?1
                         ORDER BY seq DESC
                         LIMIT -1 OFFSET ?2
                     )",
                    params![session_id, max_messages_per_session as i64],
                )?;
            }
            Ok(())
        })?;
    }

    if max_sessions > 0 {
        store.with_conn(|c| {
            c.execute(
                "DELETE FROM sessions WHERE id IN (
                     SELECT id FROM sessions
                     ORDER BY updated_at DESC
                     LIMIT -1 OFFSET ?1
                 )",
                [max_sessions as i64],
            )
        })?;
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{EventSink, SessionManager};
    use parley_model::{MessageContent, Role};

    fn setup() -> (Arc<MemoryStore>, SessionManager) {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let sessions = SessionManager::new(store.clone(), "m", EventSink::disabled());
        (store, sessions)
    }

    fn message_count(store: &MemoryStore, session_id: &str) -> i64 {
        store
            .with_conn(|c| {
                c.query_row(
                    "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                    [session_id],
                    |r| r.get(0),
                )
            })
            .unwrap()
    }

    #[test]
    fn trims_each_session_to_newest_messages() {
        let (store, sessions) = setup();
        let sid = sessions.create_session(None, None, None).unwrap();
        for i in 0..10 {
            sessions
                .append_message(&sid, Role::User, &MessageContent::Text(format!("m{i}")))
                .unwrap();
        }
        prune_memory(&store, 0, 4, 30).unwrap();
        assert_eq!(message_count(&store, &sid), 4);
        // The newest messages survive.
        let kept = sessions.load_messages(&sid).unwrap();
        assert_eq!(kept.last().unwrap().as_text(), Some("m9"));
        assert_eq!(kept.first().unwrap().as_text(), Some("m6"));
    }

    #[test]
    fn caps_total_session_count_by_recency() {
        let (store, sessions) = setup();
        for i in 0..5 {
            sessions.create_session(Some(&format!("s{i}")), None, None).unwrap();
            // Timestamps are second-granular; spread them out explicitly so
            // the recency order is deterministic (s4 newest).
            store
                .with_conn(|c| {
                    c.execute(
                        "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                        rusqlite::params![format!("2026-01-0{}T00:00:00Z", i + 1), format!("s{i}")],
                    )
                })
                .unwrap();
        }
        // Huge retention window: only the session-count cap applies.
        prune_memory(&store, 2, 0, 36_500).unwrap();
        let mut remaining: Vec<String> = sessions
            .list_sessions(10)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["s3".to_string(), "s4".to_string()]);
    }

    #[test]
    fn stale_sessions_are_deleted_with_cascade() {
        let (store, sessions) = setup();
        let sid = sessions.create_session(None, None, None).unwrap();
        sessions
            .append_message(&sid, Role::User, &MessageContent::Text("old".into()))
            .unwrap();
        // Backdate the session beyond the retention window.
        store
            .with_conn(|c| {
                c.execute(
                    "UPDATE sessions SET updated_at = '2000-01-01T00:00:00Z' WHERE id = ?1",
                    [sid.as_str()],
                )
            })
            .unwrap();
        prune_memory(&store, 0, 0, 30).unwrap();
        assert!(sessions.get_session(&sid).unwrap().is_none());
        assert_eq!(message_count(&store, &sid), 0, "messages cascade-deleted");
    }

    #[test]
    fn zero_limits_disable_the_respective_pass() {
        let (store, sessions) = setup();
        let sid = sessions.create_session(None, None, None).unwrap();
        for i in 0..3 {
            sessions
                .append_message(&sid, Role::User, &MessageContent::Text(format!("m{i}")))
                .unwrap();
        }
        prune_memory(&store, 0, 0, 30).unwrap();
        assert_eq!(message_count(&store, &sid), 3);
    }
}
