//! Daemon mode - long-lived test orchestration process
//!
//! The daemon loads the suite registry once at startup, then serves run
//! requests over HTTP until it receives a termination signal. Exactly one
//! run executes at a time; each run streams its progress to the requesting
//! client as server-sent events.

pub mod channel;
pub mod coordinator;
pub mod relay;
pub mod server;
pub mod state;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::common::config::Config;
use crate::common::{logging, Result};
use crate::engine::cleanup::DirStore;
use crate::engine::exec::CommandEngine;
use crate::registry::Registry;

use channel::ConnectionRegistry;
use coordinator::RunCoordinator;
use relay::OutputRelay;
use server::AppContext;
use state::DaemonState;

/// Wire the daemon's shared state around an already-loaded registry
///
/// Split out from [`run`] so tests can serve the same context on an
/// ephemeral port.
pub fn build_context(config: Config, registry: Registry, relay: Arc<OutputRelay>) -> Result<Arc<AppContext>> {
    let shell = config.engine.resolve_shell()?;
    let store = DirStore::new(config.storage.effective_data_dir()?);
    store.ensure()?;

    let state = Arc::new(DaemonState::new());
    let registry = Arc::new(Mutex::new(registry));
    let connections = Arc::new(ConnectionRegistry::new());
    let engine = CommandEngine::new(registry.clone(), relay.clone(), shell);
    let coordinator = Arc::new(RunCoordinator::new(
        state.clone(),
        registry.clone(),
        connections.clone(),
        Box::new(engine),
        Arc::new(store),
        relay,
        Duration::from_secs(config.server.heartbeat_secs),
    ));

    Ok(Arc::new(AppContext {
        config,
        state,
        registry,
        connections,
        coordinator,
        shutdown: Arc::new(Notify::new()),
    }))
}

/// Run in daemon mode
///
/// This is the entry point when the binary is invoked with the `serve`
/// command. The daemon:
/// 1. Loads every suite manifest under the configured directory
/// 2. Binds the HTTP listener and accepts run requests
/// 3. Executes at most one run at a time, streaming events per request
/// 4. Shuts down gracefully on SIGTERM/SIGINT
pub async fn run(config: Config) -> Result<()> {
    let relay = Arc::new(OutputRelay::new());
    let (log_dir, _log_guard) = logging::init_daemon(relay.clone());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "starting test orchestration daemon"
    );
    if let Some(dir) = &log_dir {
        tracing::debug!(path = %dir.display(), "file logging enabled");
    }

    let registry = Registry::load_dir(&config.registry.manifest_dir)?;
    tracing::info!(
        suites = registry.top_level_count(),
        manifest_dir = %config.registry.manifest_dir.display(),
        "registry loaded"
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let ctx = build_context(config, registry, relay)?;
    server::serve(ctx, listener).await
}
