// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::params;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::{utc_now, MemoryStore};

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const QUEUE_CAPACITY: usize = 1024;

struct PendingEvent {
    session_id: String,
    event_type: String,
    payload: Value,
}

/// Asynchronous batched event writer.
///
/// `emit` never blocks and never fails visibly: once the sink is closed (or
/// the queue is full) emissions are dropped with a log line.  The background
/// task flushes the queue to the store in one transaction when it collects a
/// full batch or on the flush interval.  Per-session order is preserved —
/// one FIFO, one consumer, batches are written in dequeue order.
pub struct EventSink {
    tx: Mutex<Option<mpsc::Sender<PendingEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventSink {
    pub fn start(store: Arc<MemoryStore>) -> Arc<Self> {
        Self::with_options(store, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn with_options(
        store: Arc<MemoryStore>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = tokio::spawn(flush_loop(store, rx, batch_size.max(1), flush_interval));
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// A sink that drops everything.  Used when memory is disabled.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            tx: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Fire-and-forget event emission.
    pub fn emit(&self, session_id: &str, event_type: &str, payload: Value) {
        let guard = self.tx.lock().expect("event sink mutex poisoned");
        let Some(tx) = guard.as_ref() else {
            return;
        };
        let event = PendingEvent {
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            payload,
        };
        if tx.try_send(event).is_err() {
            warn!(event_type, "event queue full or closing, dropping event");
        }
    }

    /// Stop the background task, drain the queue completely and return once
    /// the final flush has committed.  Subsequent `emit` calls are dropped
    /// silently.
    pub async fn close(&self) {
        let tx = self.tx.lock().expect("event sink mutex poisoned").take();
        drop(tx); // closes the channel; the worker drains and exits
        let worker = self.worker.lock().expect("event sink mutex poisoned").take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
    }
}

async fn flush_loop(
    store: Arc<MemoryStore>,
    mut rx: mpsc::Receiver<PendingEvent>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buf: Vec<PendingEvent> = Vec::with_capacity(batch_size);
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => {
                    buf.push(event);
                    while buf.len() < batch_size {
                        match rx.try_recv() {
                            Ok(event) => buf.push(event),
                            Err(_) => break,
                        }
                    }
                    if buf.len() >= batch_size {
                        flush(&store, &mut buf);
                    }
                }
                None => {
                    // Channel closed: drain whatever is left, flush, exit.
                    while let Ok(event) = rx.try_recv() {
                        buf.push(event);
                    }
                    flush(&store, &mut buf);
                    return;
                }
            },
            _ = tokio::time::sleep(flush_interval) => {
                flush(&store, &mut buf);
            }
        }
    }
}

fn flush(store: &MemoryStore, buf: &mut Vec<PendingEvent>) {
    if buf.is_empty() {
        return;
    }
    let now = utc_now();
    let result = store.transaction(|tx| {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO events (id, session_id, type, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for event in buf.iter() {
            stmt.execute(params![
                Uuid::new_v4().to_string(),
                event.session_id,
                event.event_type,
                event.payload.to_string(),
                now,
            ])?;
        }
        Ok(())
    });
    if let Err(e) = result {
        warn!(error = %e, count = buf.len(), "event flush failed, dropping batch");
    }
    buf.clear();
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
