//! Run coordination
//!
//! Sequences one admitted run end to end: resolve the effective name
//! filter, reset the registry's transient state, configure the engine,
//! intercept output, execute, sweep scratch storage, restore everything,
//! and emit the terminal events. Admission itself (the single-flight guard)
//! happens in the request handler before a run reaches this module.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

use crate::common::{Error, Result};
use crate::engine::cleanup::{self, StorageCleanup};
use crate::engine::{ReporterKind, Runner};
use crate::registry::filter::NameFilter;
use crate::registry::{walker, Registry};

use super::channel::{ConnectionRegistry, EventSink, RunEvent};
use super::relay::OutputRelay;
use super::state::DaemonState;

/// Environment toggle test commands read to rewrite their snapshots
pub const SNAPSHOT_UPDATE_ENV: &str = "TESTD_UPDATE_SNAPSHOTS";

/// One run request, built from HTTP query parameters or CLI flags
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub grep: Option<String>,
    pub file: Option<String>,
    pub invert: bool,
    pub reporter: ReporterKind,
    pub bail: bool,
    pub update_snapshots: bool,
}

/// Owns the per-run sequencing around the engine
pub struct RunCoordinator {
    state: Arc<DaemonState>,
    registry: Arc<Mutex<Registry>>,
    connections: Arc<ConnectionRegistry>,
    runner: AsyncMutex<Box<dyn Runner>>,
    cleanup: Arc<dyn StorageCleanup>,
    relay: Arc<OutputRelay>,
    heartbeat: Duration,
}

impl RunCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<DaemonState>,
        registry: Arc<Mutex<Registry>>,
        connections: Arc<ConnectionRegistry>,
        runner: Box<dyn Runner>,
        cleanup: Arc<dyn StorageCleanup>,
        relay: Arc<OutputRelay>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            state,
            registry,
            connections,
            runner: AsyncMutex::new(runner),
            cleanup,
            relay,
            heartbeat,
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send an event unless the peer is already known to be gone
    fn emit(&self, sink: &EventSink, event: RunEvent) {
        if self.state.peer_gone() {
            return;
        }
        if !sink.send(event) {
            self.state.mark_peer_gone();
            tracing::debug!("client disconnected; suppressing further events for this run");
        }
    }

    /// Translate the request's file/grep selection into the effective filter
    fn resolve_filter(&self, request: &RunRequest) -> Result<NameFilter> {
        let escaped = match request.file.as_deref() {
            Some(pattern) => {
                let registry = self.lock_registry();
                let titles = walker::suites_for_file(&registry, pattern);
                if titles.is_empty() {
                    return Err(Error::NoSuitesForFile(pattern.to_string()));
                }
                Some(titles)
            }
            None => None,
        };
        NameFilter::compose(
            request.grep.as_deref(),
            escaped.as_deref(),
            request.file.as_deref(),
        )
    }

    /// Execute one admitted run to completion
    ///
    /// The caller must already hold the Running admission; `connection` is
    /// the streaming connection to deregister when the run ends. Returns
    /// the reported failure count.
    pub async fn execute(&self, request: RunRequest, sink: EventSink, connection: Option<u64>) -> i64 {
        let filter = match self.resolve_filter(&request) {
            Ok(filter) => filter,
            Err(e) => {
                // Reported as a completed run with one failure; the engine
                // is never invoked.
                tracing::warn!(error = %e, "filter resolution failed");
                self.emit(&sink, RunEvent::Error { message: e.to_string() });
                self.finish(connection);
                self.emit(&sink, RunEvent::Done { failures: 1 });
                return 1;
            }
        };

        tracing::info!(
            description = %filter.description,
            invert = request.invert,
            bail = request.bail,
            reporter = ?request.reporter,
            "run started"
        );
        self.emit(
            &sink,
            RunEvent::Start {
                description: filter.description.clone(),
                invert: request.invert,
            },
        );

        let heartbeat = tokio::spawn(heartbeat_loop(sink.clone(), self.heartbeat));

        let (failures, reporter_payload) = {
            let mut runner = self.runner.lock().await;
            runner.reset_transient_state();
            runner.set_filter(filter);
            runner.set_invert(request.invert);
            runner.set_bail(request.bail);
            runner.select_reporter(request.reporter);

            let _color = ColorGuard::suppress_if(request.reporter == ReporterKind::Json);
            let _relay = self.relay.install(sink.clone());
            let _env = EnvGuard::set_if(request.update_snapshots, SNAPSHOT_UPDATE_ENV, "1");

            let failures = match runner.run().await {
                Some(count) => count,
                None => {
                    // Distinct from a test failure: the engine itself broke
                    // its contract.
                    tracing::error!(
                        "engine finished without reporting a failure count; counting one tooling failure"
                    );
                    1
                }
            };

            if let Err(e) = cleanup::sweep(self.cleanup.as_ref()).await {
                tracing::warn!(error = %e, "post-run storage sweep failed");
            }

            (failures, runner.take_reporter_output())
            // interception, color override, and the env toggle all restore
            // here, before the terminal events
        };

        heartbeat.abort();
        self.finish(connection);

        if self.state.peer_gone() {
            tracing::info!(failures, "run finished after the client disconnected");
        } else {
            if let Some(raw) = reporter_payload {
                let payload =
                    serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
                self.emit(&sink, RunEvent::Json { payload });
            }
            self.emit(&sink, RunEvent::Done { failures });
        }

        tracing::info!(failures, "run complete");
        failures
    }

    fn finish(&self, connection: Option<u64>) {
        self.state.finish_run();
        if let Some(id) = connection {
            self.connections.close(id);
        }
    }
}

async fn heartbeat_loop(sink: EventSink, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    let started = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; the start event covers it
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let elapsed_secs = started.elapsed().as_secs();
        if !sink.send(RunEvent::Heartbeat { elapsed_secs }) {
            tracing::debug!("heartbeat write failed; stopping heartbeats for this run");
            break;
        }
    }
}

/// Scoped environment override, restored to the exact prior value on drop
struct EnvGuard {
    key: &'static str,
    prior: Option<String>,
    active: bool,
}

impl EnvGuard {
    fn set_if(enabled: bool, key: &'static str, value: &str) -> Self {
        if !enabled {
            return Self {
                key,
                prior: None,
                active: false,
            };
        }
        let prior = std::env::var(key).ok();
        std::env::set_var(key, value);
        Self { key, prior, active: true }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match self.prior.take() {
            Some(value) => std::env::set_var(self.key, value),
            None => std::env::remove_var(self.key),
        }
    }
}

/// Scoped ANSI color suppression for machine-readable runs
struct ColorGuard {
    suppressed: bool,
}

impl ColorGuard {
    fn suppress_if(enabled: bool) -> Self {
        if enabled {
            colored::control::set_override(false);
        }
        Self { suppressed: enabled }
    }
}

impl Drop for ColorGuard {
    fn drop(&mut self) {
        if self.suppressed {
            colored::control::unset_override();
        }
    }
}
