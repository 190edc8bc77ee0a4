// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

/// Failure kinds of the durable memory layer.
///
/// `Integrity` signals a violated foreign-key or uniqueness constraint —
/// a logic bug; callers must never catch it and continue.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("identifier {0:?} matches more than one session")]
    Ambiguous(String),

    #[error("path is outside the working directory: {}", .0.display())]
    PathOutsideWorkspace(PathBuf),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                MemoryError::Integrity(e.to_string())
            }
            _ => MemoryError::Storage(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
