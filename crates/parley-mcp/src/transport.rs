// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use parley_config::McpServerConfig;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Per-request ceiling; a server that does not answer within this window is
/// treated as failed for that call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Graceful-exit window during shutdown before the child is killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of non-JSON stdout lines tolerated before the server is
/// declared broken (protects against servers that log to stdout).
const MAX_SKIP_LINES: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("malformed server response: {0}")]
    Malformed(String),
}

/// One live MCP session.  The transport object *is* the held-open session:
/// it stays connected from the handshake until `shutdown`.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for the matching response.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a fire-and-forget notification.
    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    /// Graceful shutdown, bounded at [`SHUTDOWN_TIMEOUT`].
    async fn shutdown(&self);
}

// ─── Stdio transport ──────────────────────────────────────────────────────────

/// Child process speaking newline-delimited JSON-RPC on stdin/stdout.
///
/// `request_lock` serialises entire request/response cycles so concurrent
/// callers cannot read each other's responses.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioTransport {
    /// Spawn the configured command.  The parent environment is inherited
    /// and per-server `env` entries are layered on top.
    pub fn spawn(config: &McpServerConfig) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read the next JSON line, skipping empty and non-JSON output.
    async fn read_line(&self) -> Result<String, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let n = stdout.read_line(&mut line).await?;
            if n == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::Malformed(
                    "too many non-JSON lines on stdout".into(),
                ));
            }
            debug!(line = %trimmed, "skipping non-JSON line from MCP server stdout");
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let _guard = self.request_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let json = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        debug!(id, method, "sending MCP request");
        self.write_line(&json).await?;

        // Servers may interleave notifications; skip anything that is not
        // the response to this id.
        let result = tokio::time::timeout(REQUEST_TIMEOUT, async {
            loop {
                let line = self.read_line().await?;
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                }
                debug!(line = %line, "skipping non-matching message from MCP server");
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let json = serde_json::to_string(&JsonRpcNotification::new(method))?;
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                debug!(error = %e, "error closing MCP server stdin");
            }
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "MCP server process exited"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for MCP server process"),
            Err(_) => {
                warn!("MCP server did not exit within timeout, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill MCP server process");
                }
            }
        }
    }
}

// ─── Streamable HTTP transport ────────────────────────────────────────────────

/// MCP streamable-HTTP client: each request is a POST; the response body is
/// either a plain JSON-RPC response or an SSE stream carrying it.  The
/// `Mcp-Session-Id` issued at initialize time is echoed on later requests.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    session_id: StdMutex<Option<String>>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn connect(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            session_id: StdMutex::new(None),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        }
    }

    fn request_builder(&self) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream");
        if let Some(sid) = self.session_id.lock().unwrap().clone() {
            builder = builder.header("Mcp-Session-Id", sid);
        }
        builder
    }

    fn remember_session(&self, resp: &reqwest::Response) {
        if let Some(sid) = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap() = Some(sid.to_string());
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let send = async {
            let resp = self.request_builder().json(&req).send().await?;
            self.remember_session(&resp);
            let resp = resp.error_for_status()?;
            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = resp.text().await?;
            if content_type.starts_with("text/event-stream") {
                parse_sse_response(&body, id)
            } else {
                serde_json::from_str::<JsonRpcResponse>(&body)
                    .map_err(|e| TransportError::Malformed(e.to_string()))
            }
        };

        match tokio::time::timeout(REQUEST_TIMEOUT, send).await {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        let resp = self.request_builder().json(&notif).send().await?;
        self.remember_session(&resp);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Find the JSON-RPC response with the expected id inside an SSE body.
fn parse_sse_response(body: &str, expected_id: u64) -> Result<JsonRpcResponse, TransportError> {
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(data.trim()) {
            if resp.id == expected_id {
                return Ok(resp);
            }
        }
    }
    Err(TransportError::Malformed(format!(
        "no response for request id {expected_id} in event stream"
    )))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_body_yields_matching_response() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n\n";
        let resp = parse_sse_response(body, 3).unwrap();
        assert_eq!(resp.id, 3);
        assert_eq!(resp.into_result().unwrap()["ok"], true);
    }

    #[test]
    fn sse_body_skips_other_ids_and_notifications() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"hit\":1}}\n";
        let resp = parse_sse_response(body, 2).unwrap();
        assert_eq!(resp.id, 2);
    }

    #[test]
    fn sse_body_without_response_is_malformed() {
        let err = parse_sse_response("data: not json\n", 1).unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn stdio_round_trip_with_cat_like_server() {
        // A tiny shell server that answers every request line with a canned
        // initialize/list/call response keyed by the request id.
        let config = McpServerConfig {
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"while read -r line; do
                       id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
                       printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":true}}\n' "$id"
                   done"#
                    .into(),
            ],
            ..Default::default()
        };
        let transport = match StdioTransport::spawn(&config) {
            Ok(t) => t,
            // Sandboxed CI without /bin/sh: nothing to test.
            Err(_) => return,
        };
        let resp = transport
            .send_request("tools/list", None)
            .await
            .expect("echo server responds");
        assert_eq!(resp.into_result().unwrap()["echo"], true);
        transport.shutdown().await;
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn stdio_spawn_failure_is_io_error() {
        let config = McpServerConfig {
            command: "/definitely/not/a/real/binary".into(),
            ..Default::default()
        };
        assert!(matches!(
            StdioTransport::spawn(&config),
            Err(TransportError::Io(_))
        ));
    }
}
