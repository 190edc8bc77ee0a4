// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Error raised by a provider driver for a single request attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("stream error: {0}")]
    Stream(String),
}

impl ProviderError {
    /// Transient failures are retried with backoff; everything else
    /// (auth, bad request, malformed stream) propagates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Stream(_) => false,
        }
    }
}

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_SECS: u64 = 10;
const BACKOFF_CAP_SECS: u64 = 320;

/// Delay before retry number `attempt` (1-based): 10 s, 20 s, 40 s, 80 s …
/// capped at 320 s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    Duration::from_secs((BACKOFF_BASE_SECS << exp).min(BACKOFF_CAP_SECS))
}

/// Run `op` with up to five attempts, sleeping between transient failures.
pub(crate) async fn with_backoff<T, F, Fut>(what: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                warn!(
                    error = %e,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "{what} failed transiently, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(2), Duration::from_secs(20));
        assert_eq!(backoff_delay(3), Duration::from_secs(40));
        assert_eq!(backoff_delay(4), Duration::from_secs(80));
        assert_eq!(backoff_delay(7), Duration::from_secs(320));
        assert_eq!(backoff_delay(30), Duration::from_secs(320));
    }

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        assert!(ProviderError::Api { status: 429, body: String::new() }.is_transient());
        assert!(ProviderError::Api { status: 503, body: String::new() }.is_transient());
        assert!(!ProviderError::Api { status: 401, body: String::new() }.is_transient());
        assert!(!ProviderError::Api { status: 400, body: String::new() }.is_transient());
        assert!(!ProviderError::Stream("eof".into()).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn with_backoff_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out: anyhow::Result<u32> = with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Api { status: 500, body: "boom".into() })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn with_backoff_propagates_terminal_immediately() {
        let calls = AtomicU32::new(0);
        let out: anyhow::Result<u32> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Api { status: 401, body: "no".into() }) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_backoff_gives_up_after_five_attempts() {
        let calls = AtomicU32::new(0);
        let out: anyhow::Result<u32> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Api { status: 429, body: "slow down".into() }) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
