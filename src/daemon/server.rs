//! HTTP surface and shutdown coordination
//!
//! Three routes: `/health` and `/files` answer immediately; `/run` opens a
//! server-sent-event stream for one run. Admission happens here, before a
//! run ever reaches the coordinator, so rejected requests cost one event
//! and a closed stream. Termination signals broadcast a shutdown notice to
//! every open stream exactly once and stop the listener; an in-flight run
//! is allowed to finish.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::common::config::Config;
use crate::common::Result;
use crate::engine::ReporterKind;
use crate::registry::{walker, Registry};

use super::channel::{event_channel, ConnectionRegistry, RunEvent};
use super::coordinator::{RunCoordinator, RunRequest};
use super::state::{Admission, DaemonState};

/// Shared state behind every request handler
pub struct AppContext {
    pub config: Config,
    pub state: Arc<DaemonState>,
    pub registry: Arc<Mutex<Registry>>,
    pub connections: Arc<ConnectionRegistry>,
    pub coordinator: Arc<RunCoordinator>,
    pub shutdown: Arc<Notify>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    suites: usize,
    running: bool,
}

/// `/run` query parameters
#[derive(Debug, Deserialize)]
pub struct RunQuery {
    pub grep: Option<String>,
    pub file: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub invert: bool,
    #[serde(default)]
    pub reporter: ReporterKind,
    #[serde(default, deserialize_with = "flag")]
    pub bail: bool,
    #[serde(default, rename = "snapshotUpdate", deserialize_with = "flag")]
    pub snapshot_update: bool,
}

impl RunQuery {
    fn into_request(self) -> RunRequest {
        RunRequest {
            grep: self.grep,
            file: self.file,
            invert: self.invert,
            reporter: self.reporter,
            bail: self.bail,
            update_snapshots: self.snapshot_update,
        }
    }
}

fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.as_str() {
        "1" | "true" | "yes" => Ok(true),
        "" | "0" | "false" | "no" => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "invalid flag value '{other}'"
        ))),
    }
}

type EventStream = Sse<BoxStream<'static, std::result::Result<Event, Infallible>>>;

/// Adapt a run's event channel into an SSE response
///
/// The stream ends right after a terminal event (`done` or `shutdown`) so
/// the connection closes even while other sink clones are still alive.
fn sse_stream(rx: UnboundedReceiver<RunEvent>) -> EventStream {
    let stream = UnboundedReceiverStream::new(rx)
        .scan(false, |terminated, event| {
            if *terminated {
                return futures_util::future::ready(None);
            }
            if matches!(event, RunEvent::Done { .. } | RunEvent::Shutdown { .. }) {
                *terminated = true;
            }
            futures_util::future::ready(Some(event))
        })
        .map(|event| {
            let sse_event = Event::default()
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().data("{}"));
            Ok(sse_event)
        })
        .boxed();
    Sse::new(stream)
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<HealthResponse> {
    let suites = ctx
        .registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .top_level_count();
    Json(HealthResponse {
        status: ctx.state.status_label(),
        suites,
        running: ctx.state.is_running(),
    })
}

async fn files(State(ctx): State<Arc<AppContext>>) -> Json<walker::FileMap> {
    let registry = ctx
        .registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Json(walker::build_file_map(&registry))
}

async fn run(State(ctx): State<Arc<AppContext>>, Query(query): Query<RunQuery>) -> EventStream {
    let request = query.into_request();
    match ctx.state.try_begin_run() {
        Admission::ShuttingDown => {
            tracing::info!("run request rejected: daemon is shutting down");
            let (sink, rx) = event_channel();
            let _ = sink.send(RunEvent::Shutdown {
                reason: "daemon is shutting down".to_string(),
            });
            sse_stream(rx)
        }
        Admission::Busy => {
            tracing::info!("run request rejected: a run is already in progress");
            let (sink, rx) = event_channel();
            let _ = sink.send(RunEvent::Error {
                message: "a test run is already in progress".to_string(),
            });
            sse_stream(rx)
        }
        Admission::Granted => {
            let (id, sink, rx) = ctx.connections.open();
            let coordinator = ctx.coordinator.clone();
            tokio::spawn(async move {
                coordinator.execute(request, sink, Some(id)).await;
            });
            sse_stream(rx)
        }
    }
}

/// Build the daemon router
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/files", get(files))
        .route("/run", get(run))
        .with_state(ctx)
}

/// Flip to shutdown, notify every open stream once, stop the listener
///
/// Safe to call more than once; only the first call has any effect.
pub fn initiate_shutdown(ctx: &AppContext, reason: &str) {
    if ctx.state.begin_shutdown() {
        let notified = ctx.connections.broadcast_shutdown(reason);
        tracing::info!(notified, reason, "shutdown initiated");
        ctx.shutdown.notify_waiters();
    }
}

fn spawn_signal_listener(ctx: Arc<AppContext>) {
    tokio::spawn(async move {
        wait_for_termination().await;
        initiate_shutdown(&ctx, "daemon received a termination signal");
    });
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT (Ctrl+C)");
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to install the SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Serve the daemon until a termination signal arrives
pub async fn serve(ctx: Arc<AppContext>, listener: tokio::net::TcpListener) -> Result<()> {
    let app = router(ctx.clone());
    spawn_signal_listener(ctx.clone());

    tracing::info!(addr = %listener.local_addr()?, "daemon listening");

    let shutdown = ctx.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
        })
        .await?;

    if ctx.state.is_running() {
        tracing::info!("waiting for the in-flight run to reach natural termination");
        ctx.state.wait_idle().await;
    }
    tracing::info!("daemon shutdown complete");
    Ok(())
}
