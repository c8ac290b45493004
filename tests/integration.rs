//! End-to-end integration tests for the test orchestration daemon
//!
//! These tests boot the daemon router in-process on an ephemeral port and
//! drive it over real HTTP:
//! 1. Health and file-map endpoints
//! 2. Full runs with streamed events, filters, and reporters
//! 3. Single-flight rejection and shutdown behavior

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use testd::common::config::Config;
use testd::daemon::relay::OutputRelay;
use testd::daemon::{build_context, server};
use testd::registry::Registry;
use testd::RunEvent;

/// A daemon serving on an ephemeral port, plus the temp dirs backing it
struct TestDaemon {
    ctx: Arc<server::AppContext>,
    base: String,
    _manifest_dir: tempfile::TempDir,
    _scratch_dir: tempfile::TempDir,
}

async fn start_daemon(manifests: &[(&str, &str)]) -> TestDaemon {
    let manifest_dir = tempfile::tempdir().expect("manifest tempdir");
    for (name, content) in manifests {
        let path = manifest_dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("manifest subdir");
        }
        std::fs::write(&path, content).expect("write manifest");
    }
    let scratch_dir = tempfile::tempdir().expect("scratch tempdir");

    let mut config = Config::default();
    config.registry.manifest_dir = manifest_dir.path().to_path_buf();
    config.storage.data_dir = Some(scratch_dir.path().to_path_buf());
    // Keep heartbeats out of short test runs
    config.server.heartbeat_secs = 600;

    let registry = Registry::load_dir(manifest_dir.path()).expect("load registry");
    let relay = Arc::new(OutputRelay::new());
    let ctx = build_context(config, registry, relay).expect("build context");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let app = server::router(ctx.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    TestDaemon {
        ctx,
        base: format!("http://{addr}"),
        _manifest_dir: manifest_dir,
        _scratch_dir: scratch_dir,
    }
}

/// Request a run and collect the whole event stream
///
/// The server ends the stream after the terminal event, so reading the
/// body to completion is the natural synchronization point.
async fn run_events(base: &str, query: &str) -> Vec<RunEvent> {
    let url = format!("{base}/run{query}");
    let body = tokio::time::timeout(Duration::from_secs(30), async {
        reqwest::get(&url)
            .await
            .expect("run request")
            .text()
            .await
            .expect("run stream")
    })
    .await
    .expect("run stream timed out");
    parse_events(&body)
}

fn parse_events(body: &str) -> Vec<RunEvent> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("event payload parses"))
        .collect()
}

fn log_lines(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            RunEvent::Log { line, .. } => Some(line.clone()),
            _ => None,
        })
        .collect()
}

const BASIC_MANIFEST: &str = r#"
suites:
  - title: basics
    tests:
      - name: passes
        command: echo hello-from-test
      - name: fails
        command: "false"
"#;

const NESTED_MANIFEST: &str = r#"
suites:
  - title: accounts
    tests:
      - name: creates a user
        command: "true"
    children:
      - title: passwords
        tests:
          - name: rejects short ones
            command: "true"
"#;

#[tokio::test]
async fn health_reports_suite_count_and_idle_state() {
    let daemon = start_daemon(&[("a.yaml", BASIC_MANIFEST), ("b.yaml", NESTED_MANIFEST)]).await;

    let health: serde_json::Value = reqwest::get(format!("{}/health", daemon.base))
        .await
        .expect("health request")
        .json()
        .await
        .expect("health json");

    assert_eq!(health["status"], "ready");
    assert_eq!(health["suites"], 2);
    assert_eq!(health["running"], false);
}

#[tokio::test]
async fn files_maps_manifests_to_qualified_titles() {
    let daemon = start_daemon(&[("auth/accounts.yaml", NESTED_MANIFEST)]).await;

    let map: std::collections::BTreeMap<String, Vec<String>> =
        reqwest::get(format!("{}/files", daemon.base))
            .await
            .expect("files request")
            .json()
            .await
            .expect("files json");

    assert_eq!(map.len(), 1);
    assert_eq!(
        map["auth/accounts.yaml"],
        vec!["accounts".to_string(), "accounts passwords".to_string()]
    );
}

#[tokio::test]
async fn run_streams_start_logs_and_terminal_done() {
    let daemon = start_daemon(&[("a.yaml", BASIC_MANIFEST)]).await;

    let events = run_events(&daemon.base, "").await;

    assert!(
        matches!(&events[0], RunEvent::Start { description, invert: false } if description == "all tests"),
        "first event must be start, got {:?}",
        events.first()
    );
    assert!(
        matches!(events.last(), Some(RunEvent::Done { failures: 1 })),
        "done must be last, got {:?}",
        events.last()
    );
    let lines = log_lines(&events);
    assert!(
        lines.iter().any(|l| l == "hello-from-test"),
        "child stdout must stream as log events: {lines:?}"
    );
}

#[tokio::test]
async fn grep_filter_narrows_the_selection() {
    let daemon = start_daemon(&[("a.yaml", BASIC_MANIFEST)]).await;

    let events = run_events(&daemon.base, "?grep=passes").await;

    assert!(matches!(events.last(), Some(RunEvent::Done { failures: 0 })));
    assert!(
        matches!(&events[0], RunEvent::Start { description, .. } if description == "/passes/")
    );
}

#[tokio::test]
async fn file_filter_runs_only_matching_suites() {
    let daemon = start_daemon(&[("a.yaml", BASIC_MANIFEST), ("b.yaml", NESTED_MANIFEST)]).await;

    let events = run_events(&daemon.base, "?file=b.yaml").await;
    assert!(matches!(events.last(), Some(RunEvent::Done { failures: 0 })));
}

#[tokio::test]
async fn unmatched_file_pattern_is_a_fast_failure() {
    let daemon = start_daemon(&[("a.yaml", BASIC_MANIFEST)]).await;

    let events = run_events(&daemon.base, "?file=nonexistent/path.ts").await;

    assert_eq!(events.len(), 2);
    assert!(
        matches!(&events[0], RunEvent::Error { message } if message.contains("nonexistent/path.ts"))
    );
    assert!(matches!(events[1], RunEvent::Done { failures: 1 }));
}

#[tokio::test]
async fn json_reporter_sends_one_consolidated_payload() {
    let daemon = start_daemon(&[("a.yaml", BASIC_MANIFEST)]).await;

    let events = run_events(&daemon.base, "?reporter=json").await;

    let payload = events
        .iter()
        .find_map(|event| match event {
            RunEvent::Json { payload } => Some(payload.clone()),
            _ => None,
        })
        .expect("json event present");
    assert_eq!(payload["stats"]["tests"], 2);
    assert_eq!(payload["stats"]["failures"], 1);
    assert!(matches!(events.last(), Some(RunEvent::Done { failures: 1 })));
}

#[tokio::test]
async fn snapshot_toggle_is_visible_to_test_commands() {
    let manifest = r#"
suites:
  - title: snapshots
    tests:
      - name: sees the toggle
        command: test "$TESTD_UPDATE_SNAPSHOTS" = "1"
"#;
    let daemon = start_daemon(&[("a.yaml", manifest)]).await;

    let events = run_events(&daemon.base, "?snapshotUpdate=1").await;
    assert!(matches!(events.last(), Some(RunEvent::Done { failures: 0 })));

    // Restored between runs: without the flag the same test fails
    let events = run_events(&daemon.base, "").await;
    assert!(matches!(events.last(), Some(RunEvent::Done { failures: 1 })));
}

#[tokio::test]
async fn concurrent_run_is_rejected_without_disturbing_the_first() {
    let slow = r#"
suites:
  - title: slow
    tests:
      - name: takes a while
        command: sleep 2
"#;
    let daemon = start_daemon(&[("slow.yaml", slow)]).await;

    let base = daemon.base.clone();
    let first = tokio::spawn(async move { run_events(&base, "").await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = run_events(&daemon.base, "").await;
    assert_eq!(second.len(), 1);
    assert!(
        matches!(&second[0], RunEvent::Error { message } if message.contains("already in progress"))
    );

    let first = first.await.expect("first run task");
    assert!(
        matches!(first.last(), Some(RunEvent::Done { failures: 0 })),
        "the in-flight run must finish normally, got {:?}",
        first.last()
    );
}

#[tokio::test]
async fn runs_repeat_cleanly_in_one_process() {
    let daemon = start_daemon(&[("a.yaml", BASIC_MANIFEST)]).await;

    let first = run_events(&daemon.base, "").await;
    let second = run_events(&daemon.base, "").await;
    assert!(matches!(first.last(), Some(RunEvent::Done { failures: 1 })));
    assert!(matches!(second.last(), Some(RunEvent::Done { failures: 1 })));
}

#[tokio::test]
async fn shutdown_rejects_new_runs_and_notifies_streams() {
    let slow = r#"
suites:
  - title: slow
    tests:
      - name: takes a while
        command: sleep 2
"#;
    let daemon = start_daemon(&[("slow.yaml", slow)]).await;

    let base = daemon.base.clone();
    let in_flight = tokio::spawn(async move { run_events(&base, "").await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    server::initiate_shutdown(&daemon.ctx, "test shutdown");
    // Idempotent: a second signal collapses into the first
    server::initiate_shutdown(&daemon.ctx, "test shutdown again");

    // The in-flight stream was closed with a shutdown notice instead of a
    // terminal event
    let events = in_flight.await.expect("in-flight task");
    assert!(
        matches!(events.last(), Some(RunEvent::Shutdown { reason }) if reason == "test shutdown"),
        "expected a shutdown notice, got {:?}",
        events.last()
    );

    // New runs are rejected with a shutdown event
    let rejected = run_events(&daemon.base, "").await;
    assert_eq!(rejected.len(), 1);
    assert!(matches!(&rejected[0], RunEvent::Shutdown { .. }));

    // The run itself continues to natural termination
    tokio::time::timeout(Duration::from_secs(10), daemon.ctx.state.wait_idle())
        .await
        .expect("in-flight run must finish");

    let health: serde_json::Value = reqwest::get(format!("{}/health", daemon.base))
        .await
        .expect("health request")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["status"], "shutting_down");
}

#[tokio::test]
async fn scratch_collections_are_swept_between_runs() {
    let scratch_probe = r#"
suites:
  - title: scratch
    tests:
      - name: writes scratch data
        command: mkdir -p "$SCRATCH/runs" && touch "$SCRATCH/runs/entry"
"#;
    let daemon = start_daemon(&[("a.yaml", scratch_probe)]).await;
    let scratch = daemon._scratch_dir.path().to_path_buf();
    std::env::set_var("SCRATCH", &scratch);

    let events = run_events(&daemon.base, "").await;
    assert!(matches!(events.last(), Some(RunEvent::Done { failures: 0 })));

    // The post-run sweep cleared the collection but kept the directory
    let runs = scratch.join("runs");
    assert!(runs.is_dir());
    assert!(!entry_exists(&runs));
}

fn entry_exists(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
