//! CLI command handling
//!
//! The remote commands (`trigger`, `status`, `files`) talk to a live daemon
//! over HTTP; `run` executes one run in-process with the same coordination
//! machinery the daemon uses and exits with a failure-derived status.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use colored::Colorize;
use futures_util::StreamExt;

use crate::commands::{Commands, ReporterArg, SelectionArgs};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::daemon::channel::{event_channel, ConnectionRegistry, RunEvent};
use crate::daemon::coordinator::RunCoordinator;
use crate::daemon::relay::OutputRelay;
use crate::daemon::state::{Admission, DaemonState};
use crate::engine::cleanup::DirStore;
use crate::engine::exec::CommandEngine;
use crate::registry::Registry;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { .. } => {
            // Serve is handled in main so daemon logging is set up first
            unreachable!("Serve command should be handled in main")
        }
        Commands::Run { selection, config } => run_local(selection, config).await,
        Commands::Trigger {
            selection,
            url,
            config,
        } => trigger(selection, url, config).await,
        Commands::Status { url, config } => status(url, config).await,
        Commands::Files { url, config } => files(url, config).await,
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(&path),
        None => Config::load(),
    }
}

fn base_url(url: Option<String>, config: &Config) -> String {
    url.unwrap_or_else(|| config.daemon_url())
}

/// Exit status derived from the failure count, as a one-shot test command
fn exit_code(failures: i64) -> i32 {
    failures.clamp(0, 255) as i32
}

/// Execute one run locally, without a daemon
async fn run_local(selection: SelectionArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = Registry::load_dir(&config.registry.manifest_dir)?;
    tracing::debug!(suites = registry.top_level_count(), "registry loaded");

    let relay = Arc::new(OutputRelay::new());
    let shell = config.engine.resolve_shell()?;
    let store = DirStore::new(config.storage.effective_data_dir()?);
    store.ensure()?;

    let state = Arc::new(DaemonState::new());
    let registry = Arc::new(Mutex::new(registry));
    let engine = CommandEngine::new(registry.clone(), relay.clone(), shell);
    let coordinator = RunCoordinator::new(
        state.clone(),
        registry,
        Arc::new(ConnectionRegistry::new()),
        Box::new(engine),
        Arc::new(store),
        relay,
        Duration::from_secs(config.server.heartbeat_secs),
    );

    if state.try_begin_run() != Admission::Granted {
        return Err(Error::Internal("fresh state refused the run".to_string()));
    }

    // Output lines reach the terminal through the relay passthrough; the
    // printer only surfaces the structured events.
    let (sink, mut rx) = event_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                RunEvent::Error { message } => {
                    eprintln!("{} {message}", "error:".red().bold());
                }
                RunEvent::Json { payload } => println!("{payload}"),
                _ => {}
            }
        }
    });

    let failures = coordinator.execute(selection.to_request(), sink, None).await;
    let _ = printer.await;

    if failures > 0 {
        std::process::exit(exit_code(failures));
    }
    Ok(())
}

/// Request a run from a live daemon and stream its events to the terminal
async fn trigger(
    selection: SelectionArgs,
    url: Option<String>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let base = base_url(url, &config);

    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(grep) = &selection.grep {
        query.push(("grep", grep.clone()));
    }
    if let Some(file) = &selection.file {
        query.push(("file", file.clone()));
    }
    if selection.invert {
        query.push(("invert", "1".to_string()));
    }
    if selection.bail {
        query.push(("bail", "1".to_string()));
    }
    if selection.update_snapshots {
        query.push(("snapshotUpdate", "1".to_string()));
    }
    let reporter = match selection.reporter {
        ReporterArg::Spec => "spec",
        ReporterArg::Json => "json",
    };
    query.push(("reporter", reporter.to_string()));

    let response = reqwest::Client::new()
        .get(format!("{base}/run"))
        .query(&query)
        .send()
        .await
        .map_err(|e| Error::DaemonUnreachable {
            url: base.clone(),
            error: e.to_string(),
        })?;

    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut failures: Option<i64> = None;
    let mut rejection: Option<String> = None;

    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
        while let Some(newline) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            match serde_json::from_str::<RunEvent>(data.trim()) {
                Ok(event) => {
                    if let Some(count) = print_event(event, &mut rejection) {
                        failures = Some(count);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "skipping unparseable event payload"),
            }
        }
    }

    match failures {
        Some(count) if count > 0 => std::process::exit(exit_code(count)),
        Some(_) => Ok(()),
        None => Err(Error::DaemonRejected(rejection.unwrap_or_else(|| {
            "stream ended without a terminal event".to_string()
        }))),
    }
}

/// Print one streamed event; returns the failure count on `done`
fn print_event(event: RunEvent, rejection: &mut Option<String>) -> Option<i64> {
    match event {
        RunEvent::Start {
            description,
            invert,
        } => {
            let suffix = if invert { " (inverted)" } else { "" };
            println!("{} {description}{suffix}", "Running:".blue().bold());
            None
        }
        RunEvent::Log { line, .. } => {
            println!("{line}");
            None
        }
        RunEvent::Error { message } => {
            eprintln!("{} {message}", "error:".red().bold());
            *rejection = Some(message);
            None
        }
        RunEvent::Json { payload } => {
            println!("{payload}");
            None
        }
        RunEvent::Heartbeat { elapsed_secs } => {
            tracing::debug!(elapsed_secs, "run in progress");
            None
        }
        RunEvent::Done { failures } => Some(failures),
        RunEvent::Shutdown { reason } => {
            eprintln!("{} {reason}", "daemon shutting down:".yellow().bold());
            *rejection = Some(reason);
            None
        }
    }
}

/// Show daemon health
async fn status(url: Option<String>, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let base = base_url(url, &config);

    let health: serde_json::Value = reqwest::Client::new()
        .get(format!("{base}/health"))
        .send()
        .await
        .map_err(|e| Error::DaemonUnreachable {
            url: base.clone(),
            error: e.to_string(),
        })?
        .json()
        .await?;

    let status = health["status"].as_str().unwrap_or("unknown");
    let label = match status {
        "ready" => status.green().bold(),
        _ => status.yellow().bold(),
    };
    println!("Daemon at {base}: {label}");
    println!("  suites:  {}", health["suites"]);
    println!("  running: {}", health["running"]);
    Ok(())
}

/// List source files and the suites they define
async fn files(url: Option<String>, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let base = base_url(url, &config);

    let map: std::collections::BTreeMap<String, Vec<String>> = reqwest::Client::new()
        .get(format!("{base}/files"))
        .send()
        .await
        .map_err(|e| Error::DaemonUnreachable {
            url: base.clone(),
            error: e.to_string(),
        })?
        .json()
        .await?;

    if map.is_empty() {
        println!("No suites are tagged with a source file.");
        return Ok(());
    }
    for (file, titles) in &map {
        println!("{}", file.bold());
        for title in titles {
            println!("  {title}");
        }
    }
    Ok(())
}
