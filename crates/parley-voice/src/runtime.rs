// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use parley_tools::ToolRegistry;

use crate::ingress::parse_json_object;
use crate::VoiceIngress;

const MIN_CHUNK_SECONDS: u32 = 1;
const DEFAULT_CHUNK_SECONDS: u32 = 3;
const DEFAULT_ENDPOINTING_MS: u32 = 500;
const DEFAULT_UTTERANCE_END_MS: u32 = 1500;
const TRANSCRIPT_PREVIEW_CHARS: usize = 60;

/// STT control tools are resolved from the registry by name suffix, so any
/// MCP server exposing this tool family works regardless of its namespace.
const REQUIRED_TOOLS: [(&str, &str); 5] = [
    ("start", "__stt_start_session"),
    ("updates", "__stt_get_updates"),
    ("stop", "__stt_stop_session"),
    ("status", "__stt_get_session"),
    ("devices", "__stt_list_devices"),
];

/// Options for `/voice start`.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceStartOptions {
    pub source: String,
    pub mic_device_id: Option<String>,
    pub mic_device_name: Option<String>,
    pub chunk_seconds: Option<u32>,
    pub endpointing_ms: Option<u32>,
    pub utterance_end_ms: Option<u32>,
}

impl Default for VoiceStartOptions {
    fn default() -> Self {
        Self {
            source: "microphone".into(),
            mic_device_id: None,
            mic_device_name: None,
            chunk_seconds: None,
            endpointing_ms: None,
            utterance_end_ms: None,
        }
    }
}

/// Per-session ingestion counters and running latency averages.
#[derive(Debug, Clone, Default)]
pub struct VoiceMetrics {
    pub queued_count: u64,
    pub processed_count: u64,
    pub avg_queue_wait_ms: f64,
    pub avg_process_ms: f64,
    pub last_process_ms: f64,
}

/// Callback invoked for each final utterance.  Routes into the turn engine
/// under the agent run lock, so utterances serialise with keyboard turns.
pub type UtteranceHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Drives an external speech-to-text session and feeds recognised
/// utterances into the agent.
///
/// Two cooperating tasks run while a session is active: the poll task reads
/// ingress events (bookmarked by `last_seq`) and enqueues final utterances;
/// the consumer task dequeues strictly one at a time and invokes the
/// handler.  The in-process queue is unbounded FIFO, matching the reference
/// behaviour of never dropping a recognised utterance.
pub struct VoiceRuntime {
    line_prefix: String,
    tools: Arc<ToolRegistry>,
    ingress: Arc<dyn VoiceIngress>,
    on_utterance: UtteranceHandler,
    session_id: Arc<StdMutex<Option<String>>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<StdMutex<VoiceMetrics>>,
    queue_depth: Arc<AtomicUsize>,
}

impl VoiceRuntime {
    pub fn new(
        line_prefix: impl Into<String>,
        tools: Arc<ToolRegistry>,
        ingress: Arc<dyn VoiceIngress>,
        on_utterance: UtteranceHandler,
    ) -> Self {
        Self {
            line_prefix: line_prefix.into(),
            tools,
            ingress,
            on_utterance,
            session_id: Arc::new(StdMutex::new(None)),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            metrics: Arc::new(StdMutex::new(VoiceMetrics::default())),
            queue_depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.session_id.lock().unwrap().is_some()
    }

    pub fn metrics(&self) -> VoiceMetrics {
        self.metrics.lock().unwrap().clone()
    }

    pub async fn start(&self, opts: VoiceStartOptions) -> String {
        let prefix = &self.line_prefix;
        let resolved = self.resolve_tool_names();
        let missing: Vec<String> = REQUIRED_TOOLS
            .iter()
            .filter(|(key, _)| !resolved.iter().any(|(k, _)| k == key))
            .map(|(key, _)| format!("stt_{key}"))
            .collect();
        if !missing.is_empty() {
            return format!(
                "{prefix}Voice unavailable: missing MCP tools {}",
                missing.join(", ")
            );
        }

        if opts.source != "microphone" && opts.source != "loopback" {
            return format!("{prefix}Voice source must be microphone or loopback");
        }

        if let Some(existing) = self.session_id.lock().unwrap().as_deref() {
            return format!("{prefix}Voice is already running (session={existing})");
        }

        let chunk_seconds = opts
            .chunk_seconds
            .unwrap_or(DEFAULT_CHUNK_SECONDS)
            .max(MIN_CHUNK_SECONDS);
        let endpointing_ms = opts.endpointing_ms.unwrap_or(DEFAULT_ENDPOINTING_MS);
        let utterance_end_ms = opts.utterance_end_ms.unwrap_or(DEFAULT_UTTERANCE_END_MS);
        let mut start_input = json!({
            "source": opts.source,
            "chunk_seconds": chunk_seconds,
            "endpointing_ms": endpointing_ms,
            "utterance_end_ms": utterance_end_ms,
        });
        if opts.source == "microphone" {
            if let Some(id) = &opts.mic_device_id {
                start_input["mic_device_id"] = json!(id);
            }
            if let Some(name) = &opts.mic_device_name {
                start_input["mic_device_name"] = json!(name);
            }
        }

        let start_tool = self.tool_for("start").expect("checked above");
        let payload = match self.call_json_tool(&start_tool, start_input).await {
            Ok(p) => p,
            Err(e) => return format!("{prefix}Voice failed: {e}"),
        };
        let session_id = payload["session_id"].as_str().unwrap_or("").trim().to_string();
        if session_id.is_empty() {
            return format!("{prefix}Voice failed: start response missing session_id");
        }

        *self.session_id.lock().unwrap() = Some(session_id.clone());
        *self.metrics.lock().unwrap() = VoiceMetrics::default();
        self.queue_depth.store(0, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel::<(String, Instant)>();
        let poll_task = tokio::spawn(poll_loop(
            self.ingress.clone(),
            self.session_id.clone(),
            session_id.clone(),
            tx,
            self.metrics.clone(),
            self.queue_depth.clone(),
            self.line_prefix.clone(),
        ));
        let consumer_task = tokio::spawn(consumer_loop(
            rx,
            self.on_utterance.clone(),
            self.metrics.clone(),
            self.queue_depth.clone(),
            self.line_prefix.clone(),
        ));
        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(poll_task);
            tasks.push(consumer_task);
        }

        let mut details = format!(
            "chunk={chunk_seconds} endpointing_ms={endpointing_ms} utterance_end_ms={utterance_end_ms}"
        );
        if opts.source == "microphone" {
            if let Some(name) = &opts.mic_device_name {
                details.push_str(&format!(" mic_device_name={name:?}"));
            }
            if let Some(id) = &opts.mic_device_id {
                details.push_str(&format!(" mic_device_id={id}"));
            }
        }
        format!(
            "{prefix}Voice started ({}) session={session_id} [{details}]",
            opts.source
        )
    }

    pub async fn status(&self) -> String {
        let prefix = &self.line_prefix;
        let Some(session_id) = self.session_id.lock().unwrap().clone() else {
            return format!("{prefix}Voice is stopped");
        };
        let Some(status_tool) = self.tool_for("status") else {
            return format!("{prefix}Voice running (session={session_id})");
        };
        match self
            .call_json_tool(&status_tool, json!({ "session_id": session_id }))
            .await
        {
            Ok(payload) => {
                let metrics = self.metrics();
                let mut latest = payload["latest_transcript"].as_str().unwrap_or("").trim().to_string();
                if latest.chars().count() > TRANSCRIPT_PREVIEW_CHARS {
                    latest = latest
                        .chars()
                        .take(TRANSCRIPT_PREVIEW_CHARS - 3)
                        .collect::<String>()
                        + "...";
                }
                format!(
                    "{prefix}Voice session={session_id} status={} queue={} next_seq={} \
                     errors={} queued={} processed={} avg_wait_ms={:.0} avg_process_ms={:.0} latest='{latest}'",
                    payload["status"].as_str().unwrap_or("unknown"),
                    self.queue_depth.load(Ordering::SeqCst),
                    payload["next_seq"].as_u64().unwrap_or(0),
                    payload["error_count"].as_u64().unwrap_or(0),
                    metrics.queued_count,
                    metrics.processed_count,
                    metrics.avg_queue_wait_ms,
                    metrics.avg_process_ms,
                )
            }
            Err(e) => format!("{prefix}Voice status check failed: {e}"),
        }
    }

    /// Cancel both tasks, await their exit, then tell the STT server to
    /// stop (best effort).  Idempotent.
    pub async fn stop(&self) -> String {
        let prefix = &self.line_prefix;
        let Some(session_id) = self.session_id.lock().unwrap().take() else {
            return format!("{prefix}Voice is already stopped");
        };

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        drop(tasks);

        if let Some(stop_tool) = self.tool_for("stop") {
            if let Err(e) = self
                .call_json_tool(&stop_tool, json!({ "session_id": session_id }))
                .await
            {
                warn!(error = %e, "STT stop tool failed");
            }
        }
        format!("{prefix}Voice stopped (session={session_id})")
    }

    pub async fn events(&self, limit: usize) -> String {
        let prefix = &self.line_prefix;
        let Some(session_id) = self.session_id.lock().unwrap().clone() else {
            return format!("{prefix}Voice is stopped");
        };
        let Some(updates_tool) = self.tool_for("updates") else {
            return format!("{prefix}Voice unavailable: missing MCP tool stt_get_updates");
        };
        let bounded = limit.clamp(1, 500);
        match self
            .call_json_tool(
                &updates_tool,
                json!({ "session_id": session_id, "since_seq": 0, "limit": bounded }),
            )
            .await
        {
            Ok(payload) => serde_json::to_string_pretty(&payload).unwrap_or_default(),
            Err(e) => format!("{prefix}Voice events failed: {e}"),
        }
    }

    pub async fn devices(&self) -> String {
        let prefix = &self.line_prefix;
        let Some(devices_tool) = self.tool_for("devices") else {
            return format!("{prefix}Voice unavailable: missing MCP tool stt_list_devices");
        };
        match self.call_json_tool(&devices_tool, json!({})).await {
            Ok(payload) => serde_json::to_string_pretty(&payload).unwrap_or_default(),
            Err(e) => format!("{prefix}Voice devices failed: {e}"),
        }
    }

    pub async fn shutdown(&self) {
        if self.is_running() {
            self.stop().await;
        }
    }

    fn resolve_tool_names(&self) -> Vec<(&'static str, String)> {
        let names = self.tools.names();
        REQUIRED_TOOLS
            .iter()
            .filter_map(|(key, suffix)| {
                names
                    .iter()
                    .find(|n| n.ends_with(suffix))
                    .map(|n| (*key, n.clone()))
            })
            .collect()
    }

    fn tool_for(&self, key: &str) -> Option<String> {
        self.resolve_tool_names()
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, name)| name)
    }

    async fn call_json_tool(&self, tool_name: &str, input: Value) -> anyhow::Result<Value> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| anyhow::anyhow!("tool not found: {tool_name}"))?;
        let raw = tool.execute(&input).await?;
        parse_json_object(&raw)
    }
}

async fn poll_loop(
    ingress: Arc<dyn VoiceIngress>,
    liveness: Arc<StdMutex<Option<String>>>,
    session_id: String,
    tx: mpsc::UnboundedSender<(String, Instant)>,
    metrics: Arc<StdMutex<VoiceMetrics>>,
    queue_depth: Arc<AtomicUsize>,
    line_prefix: String,
) {
    let mut last_seq: u64 = 0;
    loop {
        if liveness.lock().unwrap().as_deref() != Some(session_id.as_str()) {
            return;
        }
        match ingress.poll(&session_id, last_seq).await {
            Ok(events) => {
                for event in events {
                    let seq = event["seq"].as_u64().unwrap_or(0);
                    if seq > last_seq {
                        last_seq = seq;
                    }
                    if event["type"].as_str() == Some("utterance_final") {
                        let text = event["text"].as_str().unwrap_or("").trim().to_string();
                        if !text.is_empty() {
                            metrics.lock().unwrap().queued_count += 1;
                            queue_depth.fetch_add(1, Ordering::SeqCst);
                            println!("{line_prefix}[voice] queued: {text}");
                            if tx.send((text, Instant::now())).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                println!("{line_prefix}Voice polling failed: {e}");
                liveness.lock().unwrap().take();
                return;
            }
        }
        tokio::time::sleep(ingress.poll_interval()).await;
    }
}

async fn consumer_loop(
    mut rx: mpsc::UnboundedReceiver<(String, Instant)>,
    on_utterance: UtteranceHandler,
    metrics: Arc<StdMutex<VoiceMetrics>>,
    queue_depth: Arc<AtomicUsize>,
    line_prefix: String,
) {
    // One utterance at a time: the next dequeue waits for the handler.
    while let Some((text, queued_at)) = rx.recv().await {
        queue_depth.fetch_sub(1, Ordering::SeqCst);
        println!("{line_prefix}[voice] processing");
        let wait_ms = queued_at.elapsed().as_secs_f64() * 1000.0;
        let started = Instant::now();
        (on_utterance)(text).await;
        let process_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut m = metrics.lock().unwrap();
        m.processed_count += 1;
        let n = m.processed_count as f64;
        m.avg_queue_wait_ms = (m.avg_queue_wait_ms * (n - 1.0) + wait_ms) / n;
        m.avg_process_ms = (m.avg_process_ms * (n - 1.0) + process_ms) / n;
        m.last_process_ms = process_ms;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
