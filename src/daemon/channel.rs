//! Run event stream and connection registry
//!
//! Every admitted run owns one streaming connection. The registry tracks
//! all open connections so the shutdown path can notify and close every
//! peer in one sweep; writes to a peer that already went away are silently
//! reported as failed and never propagated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Origin of a forwarded output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    Daemon,
}

/// One streamed run event, serialized as the SSE data payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run was admitted; carries the resolved selection description
    Start { description: String, invert: bool },
    /// One intercepted output line
    Log { line: String, stream: LogStream },
    /// A non-fatal error surfaced to the client
    Error { message: String },
    /// Consolidated machine-readable reporter payload
    Json { payload: serde_json::Value },
    /// Liveness signal while a run is in progress
    Heartbeat { elapsed_secs: u64 },
    /// Terminal event of a completed run
    Done { failures: i64 },
    /// The daemon is going away
    Shutdown { reason: String },
}

/// Sending half of a run's event stream
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventSink {
    /// Send one event; false means the peer is gone
    pub fn send(&self, event: RunEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Create a detached event stream (used by the one-shot CLI path and tests)
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<RunEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

/// All currently open streaming connections
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, EventSink>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, EventSink>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a new connection, returning its id, sink, and receiving half
    pub fn open(&self) -> (u64, EventSink, mpsc::UnboundedReceiver<RunEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sink, rx) = event_channel();
        self.lock().insert(id, sink.clone());
        (id, sink, rx)
    }

    /// Remove a connection; the stream ends once all sink clones drop
    pub fn close(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort shutdown notice to every open connection, then clear
    ///
    /// Write failures from already-dead peers are swallowed. Returns how
    /// many peers were notified.
    pub fn broadcast_shutdown(&self, reason: &str) -> usize {
        let drained: Vec<EventSink> = {
            let mut connections = self.lock();
            let sinks = connections.values().cloned().collect();
            connections.clear();
            sinks
        };

        let mut notified = 0;
        for sink in &drained {
            if sink.send(RunEvent::Shutdown {
                reason: reason.to_string(),
            }) {
                notified += 1;
            }
        }
        notified
    }
}
