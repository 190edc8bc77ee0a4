// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{utc_now, EventSink, MemoryError, MemoryStore, Result};

/// A row from the checkpoints table.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub id: String,
    pub session_id: String,
    pub user_message_id: String,
    pub created_at: String,
    pub scope: Value,
}

impl CheckpointRecord {
    pub fn tools(&self) -> Vec<String> {
        self.scope["tools"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn user_preview(&self) -> String {
        self.scope["user_preview"].as_str().unwrap_or("").to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindStatus {
    Restored,
    Removed,
    Skipped,
    Failed,
}

impl RewindStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewindStatus::Restored => "restored",
            RewindStatus::Removed => "removed",
            RewindStatus::Skipped => "skipped",
            RewindStatus::Failed => "failed",
        }
    }
}

/// Per-file result of a rewind.
#[derive(Debug, Clone)]
pub struct RewindOutcome {
    pub path: String,
    pub status: RewindStatus,
    pub detail: String,
}

/// Tracks "before" state for files mutated during a turn so the user can
/// undo exactly those mutations.
pub struct CheckpointManager {
    store: Arc<MemoryStore>,
    events: Arc<EventSink>,
    working_directory: PathBuf,
    enabled: bool,
    write_tools_only: bool,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<MemoryStore>,
        events: Arc<EventSink>,
        working_directory: Option<PathBuf>,
        enabled: bool,
        write_tools_only: bool,
    ) -> Result<Self> {
        let dir = match working_directory {
            Some(d) => d,
            None => std::env::current_dir()
                .map_err(|e| MemoryError::Storage(format!("current dir: {e}")))?,
        };
        let working_directory = std::fs::canonicalize(&dir)
            .map_err(|e| MemoryError::Storage(format!("canonicalize {}: {e}", dir.display())))?;
        Ok(Self {
            store,
            events,
            working_directory,
            enabled,
            write_tools_only,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn write_tools_only(&self) -> bool {
        self.write_tools_only
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Create the per-turn checkpoint row.  Called at most once per turn.
    pub fn create_checkpoint(
        &self,
        session_id: &str,
        user_message_id: &str,
        scope: Value,
    ) -> Result<String> {
        let checkpoint_id = Uuid::new_v4().to_string();
        let now = utc_now();
        self.store.with_conn(|c| {
            c.execute(
                "INSERT INTO checkpoints (id, session_id, user_message_id, created_at, scope_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![checkpoint_id, session_id, user_message_id, now, scope.to_string()],
            )
        })?;
        self.events.emit(
            session_id,
            "checkpoint.created",
            json!({ "session_id": session_id, "checkpoint_id": checkpoint_id }),
        );
        Ok(checkpoint_id)
    }

    /// Snapshot the file named by `tool_input.path`, if any, before the tool
    /// mutates it.  No-op for inputs without a usable path and for paths
    /// already tracked under this checkpoint (first mutation wins).
    ///
    /// Returns the resolved paths that were considered.  Failures must not
    /// block the tool call: the caller logs them and emits
    /// `checkpoint.file_untracked`.
    pub fn maybe_track_tool_input(
        &self,
        checkpoint_id: &str,
        tool_input: &Value,
    ) -> Result<Vec<PathBuf>> {
        let Some(raw) = tool_input.get("path").and_then(Value::as_str) else {
            return Ok(Vec::new());
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let resolved = self.resolve_path(raw)?;
        self.snapshot_file(checkpoint_id, &resolved)?;
        Ok(vec![resolved])
    }

    /// Restore or delete every file tracked by the checkpoint, in path
    /// order.  Per-file failures are recorded and the rewind continues.
    pub fn rewind_files(&self, checkpoint_id: &str) -> Result<(String, Vec<RewindOutcome>)> {
        let session_id = self.checkpoint_session(checkpoint_id)?;
        self.events.emit(
            &session_id,
            "rewind.started",
            json!({ "checkpoint_id": checkpoint_id }),
        );

        let files: Vec<(String, bool, Option<Vec<u8>>)> = self.store.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT path, existed_before, backup_blob
                 FROM checkpoint_files
                 WHERE checkpoint_id = ?1
                 ORDER BY path ASC",
            )?;
            let rows = stmt
                .query_map([checkpoint_id], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, bool>(1)?, r.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut outcomes = Vec::with_capacity(files.len());
        for (path, existed_before, backup_blob) in files {
            let (status, detail) = restore_one(Path::new(&path), existed_before, backup_blob);
            self.events.emit(
                &session_id,
                "rewind.file_restored",
                json!({
                    "checkpoint_id": checkpoint_id,
                    "path": path,
                    "status": status.as_str(),
                    "detail": detail,
                }),
            );
            outcomes.push(RewindOutcome { path, status, detail });
        }

        self.events.emit(
            &session_id,
            "rewind.completed",
            json!({ "checkpoint_id": checkpoint_id, "results_count": outcomes.len() }),
        );
        Ok((session_id, outcomes))
    }

    /// Checkpoints of a session, most recent first.
    pub fn list_checkpoints(&self, session_id: &str, limit: usize) -> Result<Vec<CheckpointRecord>> {
        self.store.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id, session_id, user_message_id, created_at, scope_json
                 FROM checkpoints
                 WHERE session_id = ?1
                 ORDER BY created_at DESC, id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![session_id, limit.max(1) as i64], |r| {
                    let scope_json: String = r.get(4)?;
                    Ok(CheckpointRecord {
                        id: r.get(0)?,
                        session_id: r.get(1)?,
                        user_message_id: r.get(2)?,
                        created_at: r.get(3)?,
                        scope: serde_json::from_str(&scope_json).unwrap_or_else(|_| json!({})),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn checkpoint_session(&self, checkpoint_id: &str) -> Result<String> {
        self.store
            .with_conn(|c| {
                c.query_row(
                    "SELECT session_id FROM checkpoints WHERE id = ?1 LIMIT 1",
                    [checkpoint_id],
                    |r| r.get::<_, String>(0),
                )
                .optional()
            })?
            .ok_or_else(|| MemoryError::NotFound(format!("checkpoint {checkpoint_id}")))
    }

    fn snapshot_file(&self, checkpoint_id: &str, path: &Path) -> Result<()> {
        let session_id = self.checkpoint_session(checkpoint_id)?;
        let path_text = path.to_string_lossy().to_string();

        let already_tracked: bool = self.store.with_conn(|c| {
            c.query_row(
                "SELECT 1 FROM checkpoint_files WHERE checkpoint_id = ?1 AND path = ?2 LIMIT 1",
                params![checkpoint_id, path_text],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
        })?;
        if already_tracked {
            return Ok(());
        }

        let existed_before = path.exists();
        let backup_blob = if existed_before {
            Some(std::fs::read(path).map_err(|e| {
                MemoryError::Storage(format!("read {}: {e}", path.display()))
            })?)
        } else {
            None
        };
        self.store.with_conn(|c| {
            c.execute(
                "INSERT INTO checkpoint_files (checkpoint_id, path, existed_before, backup_blob)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    checkpoint_id,
                    path_text,
                    existed_before as i64,
                    backup_blob,
                ],
            )
        })?;
        self.events.emit(
            &session_id,
            "checkpoint.file_tracked",
            json!({
                "checkpoint_id": checkpoint_id,
                "path": path_text,
                "existed_before": existed_before,
            }),
        );
        Ok(())
    }

    /// Resolve a tool-supplied path against the working directory and reject
    /// anything that escapes it.  Normalisation is lexical because tracked
    /// paths may not exist yet.
    fn resolve_path(&self, raw: &str) -> Result<PathBuf> {
        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.working_directory.join(candidate)
        };
        let normalized = normalize_lexically(&joined);
        if !normalized.starts_with(&self.working_directory) {
            return Err(MemoryError::PathOutsideWorkspace(normalized));
        }
        Ok(normalized)
    }
}

fn restore_one(
    path: &Path,
    existed_before: bool,
    backup_blob: Option<Vec<u8>>,
) -> (RewindStatus, String) {
    if existed_before {
        let Some(bytes) = backup_blob else {
            return (RewindStatus::Failed, "missing backup blob".into());
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return (RewindStatus::Failed, e.to_string());
            }
        }
        match std::fs::write(path, bytes) {
            Ok(()) => (RewindStatus::Restored, String::new()),
            Err(e) => (RewindStatus::Failed, e.to_string()),
        }
    } else if path.exists() {
        match std::fs::remove_file(path) {
            Ok(()) => (RewindStatus::Removed, String::new()),
            Err(e) => (RewindStatus::Failed, e.to_string()),
        }
    } else {
        (RewindStatus::Skipped, String::new())
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionManager;
    use parley_model::{MessageContent, Role};

    struct Fixture {
        _dir: tempfile::TempDir,
        workspace: PathBuf,
        manager: CheckpointManager,
        session_id: String,
        user_message_id: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workspace = std::fs::canonicalize(dir.path()).unwrap();
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let sessions = SessionManager::new(store.clone(), "m", EventSink::disabled());
        let session_id = sessions.create_session(None, None, None).unwrap();
        let (user_message_id, _) = sessions
            .append_message(&session_id, Role::User, &MessageContent::Text("go".into()))
            .unwrap();
        let manager = CheckpointManager::new(
            store,
            EventSink::disabled(),
            Some(workspace.clone()),
            true,
            true,
        )
        .unwrap();
        Fixture { _dir: dir, workspace, manager, session_id, user_message_id }
    }

    fn create(f: &Fixture) -> String {
        f.manager
            .create_checkpoint(&f.session_id, &f.user_message_id, json!({ "tools": ["write_file"] }))
            .unwrap()
    }

    #[test]
    fn restore_returns_original_bytes() {
        let f = fixture();
        let file = f.workspace.join("notes.txt");
        std::fs::write(&file, b"before").unwrap();

        let cp = create(&f);
        f.manager
            .maybe_track_tool_input(&cp, &json!({ "path": "notes.txt" }))
            .unwrap();
        std::fs::write(&file, b"after").unwrap();

        let (sid, outcomes) = f.manager.rewind_files(&cp).unwrap();
        assert_eq!(sid, f.session_id);
        assert_eq!(std::fs::read(&file).unwrap(), b"before");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, RewindStatus::Restored);
        assert_eq!(outcomes[0].detail, "");
        assert!(outcomes[0].path.ends_with("notes.txt"));
    }

    #[test]
    fn rewind_removes_files_created_after_tracking() {
        let f = fixture();
        let file = f.workspace.join("new.txt");
        assert!(!file.exists());

        let cp = create(&f);
        f.manager
            .maybe_track_tool_input(&cp, &json!({ "path": "new.txt" }))
            .unwrap();
        std::fs::write(&file, b"new file").unwrap();

        let (_, outcomes) = f.manager.rewind_files(&cp).unwrap();
        assert!(!file.exists());
        assert_eq!(outcomes[0].status, RewindStatus::Removed);
    }

    #[test]
    fn rewind_skips_never_created_files() {
        let f = fixture();
        let cp = create(&f);
        f.manager
            .maybe_track_tool_input(&cp, &json!({ "path": "phantom.txt" }))
            .unwrap();
        let (_, outcomes) = f.manager.rewind_files(&cp).unwrap();
        assert_eq!(outcomes[0].status, RewindStatus::Skipped);
    }

    #[test]
    fn first_mutation_wins() {
        let f = fixture();
        let file = f.workspace.join("a.txt");
        std::fs::write(&file, b"v1").unwrap();

        let cp = create(&f);
        f.manager
            .maybe_track_tool_input(&cp, &json!({ "path": "a.txt" }))
            .unwrap();
        std::fs::write(&file, b"v2").unwrap();
        // Second mutation of the same path must not overwrite the backup.
        f.manager
            .maybe_track_tool_input(&cp, &json!({ "path": "a.txt" }))
            .unwrap();
        std::fs::write(&file, b"v3").unwrap();

        f.manager.rewind_files(&cp).unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"v1");
    }

    #[test]
    fn paths_outside_workspace_are_rejected() {
        let f = fixture();
        let cp = create(&f);

        let err = f
            .manager
            .maybe_track_tool_input(&cp, &json!({ "path": "/etc/passwd" }))
            .unwrap_err();
        assert!(matches!(err, MemoryError::PathOutsideWorkspace(_)), "got {err:?}");

        let err = f
            .manager
            .maybe_track_tool_input(&cp, &json!({ "path": "../escape.txt" }))
            .unwrap_err();
        assert!(matches!(err, MemoryError::PathOutsideWorkspace(_)));
    }

    #[test]
    fn dotdot_inside_workspace_is_allowed() {
        let f = fixture();
        std::fs::create_dir_all(f.workspace.join("sub")).unwrap();
        let cp = create(&f);
        let tracked = f
            .manager
            .maybe_track_tool_input(&cp, &json!({ "path": "sub/../ok.txt" }))
            .unwrap();
        assert_eq!(tracked, vec![f.workspace.join("ok.txt")]);
    }

    #[test]
    fn inputs_without_path_are_noops() {
        let f = fixture();
        let cp = create(&f);
        assert!(f.manager.maybe_track_tool_input(&cp, &json!({})).unwrap().is_empty());
        assert!(f
            .manager
            .maybe_track_tool_input(&cp, &json!({ "path": "  " }))
            .unwrap()
            .is_empty());
        assert!(f
            .manager
            .maybe_track_tool_input(&cp, &json!({ "path": 7 }))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn rewind_unknown_checkpoint_is_not_found() {
        let f = fixture();
        let err = f.manager.rewind_files("no-such-checkpoint").unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[test]
    fn rewind_processes_files_in_path_order() {
        let f = fixture();
        let cp = create(&f);
        for name in ["zeta.txt", "alpha.txt", "mid.txt"] {
            std::fs::write(f.workspace.join(name), b"x").unwrap();
            f.manager
                .maybe_track_tool_input(&cp, &json!({ "path": name }))
                .unwrap();
        }
        let (_, outcomes) = f.manager.rewind_files(&cp).unwrap();
        let paths: Vec<&str> = outcomes.iter().map(|o| o.path.as_str()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn restore_recreates_missing_parent_directories() {
        let f = fixture();
        let nested = f.workspace.join("deep/dir/file.txt");
        std::fs::create_dir_all(nested.parent().unwrap()).unwrap();
        std::fs::write(&nested, b"keep me").unwrap();

        let cp = create(&f);
        f.manager
            .maybe_track_tool_input(&cp, &json!({ "path": "deep/dir/file.txt" }))
            .unwrap();
        std::fs::remove_file(&nested).unwrap();
        std::fs::remove_dir_all(f.workspace.join("deep")).unwrap();

        let (_, outcomes) = f.manager.rewind_files(&cp).unwrap();
        assert_eq!(outcomes[0].status, RewindStatus::Restored);
        assert_eq!(std::fs::read(&nested).unwrap(), b"keep me");
    }

    #[test]
    fn list_checkpoints_returns_scope() {
        let f = fixture();
        let cp = f
            .manager
            .create_checkpoint(
                &f.session_id,
                &f.user_message_id,
                json!({ "tools": ["write_file"], "user_preview": "go" }),
            )
            .unwrap();
        let listed = f.manager.list_checkpoints(&f.session_id, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, cp);
        assert_eq!(listed[0].tools(), vec!["write_file"]);
        assert_eq!(listed[0].user_preview(), "go");
    }
}
