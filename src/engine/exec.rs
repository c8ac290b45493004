//! Command-executing engine
//!
//! Runs the filtered registry one test at a time. Each test is a shell
//! command whose exit status decides the outcome; suite hooks run around
//! the tests of each suite. All child output is forwarded line-wise through
//! the output relay so a streaming client sees it as it happens.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use colored::Colorize;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::daemon::channel::LogStream;
use crate::daemon::relay::OutputRelay;
use crate::registry::filter::NameFilter;
use crate::registry::{Hooks, Registry, SuiteMarks, SuiteNode, TestMarks, TestOutcome};

use super::{ReporterKind, Runner};

/// One test selected for execution
#[derive(Debug, Clone)]
struct PlannedTest {
    test_index: usize,
    name: String,
    full_title: String,
    command: String,
    skip: bool,
}

/// One suite with at least one selected test
#[derive(Debug, Clone)]
struct PlannedSuite {
    node_path: Vec<usize>,
    full_title: String,
    hooks: Hooks,
    tests: Vec<PlannedTest>,
}

/// Outcome record carried from execution back into the registry marks
#[derive(Debug, Clone)]
struct ExecutedTest {
    suite_path: Vec<usize>,
    test_index: usize,
    full_title: String,
    outcome: TestOutcome,
    duration_ms: u64,
    exit_code: Option<i32>,
}

#[derive(Serialize)]
struct JsonStats {
    tests: usize,
    passes: usize,
    failures: usize,
    pending: usize,
    duration_ms: u64,
    bailed: bool,
}

#[derive(Serialize)]
struct JsonTest {
    title: String,
    state: TestOutcome,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

#[derive(Serialize)]
struct JsonReport {
    stats: JsonStats,
    tests: Vec<JsonTest>,
}

/// Shell-command execution engine over the suite registry
pub struct CommandEngine {
    registry: Arc<Mutex<Registry>>,
    relay: Arc<OutputRelay>,
    shell: std::path::PathBuf,
    filter: NameFilter,
    invert: bool,
    bail: bool,
    reporter: ReporterKind,
    reporter_output: Option<String>,
}

impl CommandEngine {
    pub fn new(
        registry: Arc<Mutex<Registry>>,
        relay: Arc<OutputRelay>,
        shell: std::path::PathBuf,
    ) -> Self {
        Self {
            registry,
            relay,
            shell,
            filter: NameFilter::all(),
            invert: false,
            bail: false,
            reporter: ReporterKind::Spec,
            reporter_output: None,
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flatten the registry into the ordered execution plan
    fn build_plan(&self) -> Vec<PlannedSuite> {
        let registry = self.lock_registry();
        let mut plan = Vec::new();
        for (index, root) in registry.roots().iter().enumerate() {
            self.collect(root, vec![index], "", &mut plan);
        }
        plan
    }

    fn collect(&self, node: &SuiteNode, path: Vec<usize>, prefix: &str, plan: &mut Vec<PlannedSuite>) {
        let full_title = qualify(prefix, &node.title);

        let selected: Vec<PlannedTest> = node
            .tests
            .iter()
            .enumerate()
            .filter_map(|(test_index, test)| {
                let test_title = format!("{full_title} {}", test.name);
                if self.filter.matches(&test_title) != self.invert {
                    Some(PlannedTest {
                        test_index,
                        name: test.name.clone(),
                        full_title: test_title,
                        command: test.command.clone(),
                        skip: test.skip,
                    })
                } else {
                    None
                }
            })
            .collect();

        if !selected.is_empty() {
            plan.push(PlannedSuite {
                node_path: path.clone(),
                full_title: full_title.clone(),
                hooks: node.hooks.clone(),
                tests: selected,
            });
        }

        for (index, child) in node.children.iter().enumerate() {
            let mut child_path = path.clone();
            child_path.push(index);
            self.collect(child, child_path, &full_title, plan);
        }
    }

    /// Spawn one shell command and stream its output through the relay
    ///
    /// Returns whether the command succeeded and its exit code, if any.
    async fn run_command(&self, command: &str) -> (bool, Option<i32>) {
        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.relay
                    .stderr_line(&format!("failed to spawn '{command}': {e}"));
                return (false, None);
            }
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, self.relay.clone(), LogStream::Stdout)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, self.relay.clone(), LogStream::Stderr)));

        let status = child.wait().await;

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        match status {
            Ok(status) => (status.success(), status.code()),
            Err(e) => {
                self.relay
                    .stderr_line(&format!("failed to wait for '{command}': {e}"));
                (false, None)
            }
        }
    }

    /// Run one lifecycle hook; a failure is reported as a run failure
    async fn run_hook(&self, kind: &str, suite_title: &str, command: &str) -> bool {
        let (ok, code) = self.run_command(command).await;
        if !ok {
            self.relay.stderr_line(&format!(
                "{kind} hook failed for '{suite_title}' (exit {})",
                code.map_or_else(|| "?".to_string(), |c| c.to_string())
            ));
        }
        ok
    }

    fn report_test_line(&self, test: &PlannedTest, outcome: TestOutcome, duration_ms: u64, code: Option<i32>) {
        if self.reporter != ReporterKind::Spec {
            return;
        }
        let line = match outcome {
            TestOutcome::Passed => {
                format!("  {} {} ({duration_ms}ms)", "✓".green(), test.name)
            }
            TestOutcome::Failed => format!(
                "  {} {} (exit {})",
                "✗".red(),
                test.name.red(),
                code.map_or_else(|| "?".to_string(), |c| c.to_string())
            ),
            TestOutcome::Pending => {
                format!("  {}", format!("- {} (skipped)", test.name).dimmed())
            }
        };
        self.relay.stdout_line(&line);
    }

    /// Execute one planned suite, appending outcomes and suite marks
    async fn run_suite(
        &self,
        suite: &PlannedSuite,
        results: &mut Vec<ExecutedTest>,
        suite_marks: &mut Vec<(Vec<usize>, SuiteMarks)>,
    ) -> i64 {
        let mut failures = 0i64;
        let mut marks = SuiteMarks::default();
        let runnable = suite.tests.iter().any(|t| !t.skip);

        if self.reporter == ReporterKind::Spec {
            self.relay.stdout_line(&format!("{}", suite.full_title.bold()));
        }

        if runnable {
            if let Some(command) = &suite.hooks.before_all {
                if !self.run_hook("before_all", &suite.full_title, command).await {
                    failures += 1;
                    marks.hook_failed = true;
                }
            }
        }

        if !marks.hook_failed {
            for test in &suite.tests {
                if test.skip {
                    self.report_test_line(test, TestOutcome::Pending, 0, None);
                    results.push(ExecutedTest {
                        suite_path: suite.node_path.clone(),
                        test_index: test.test_index,
                        full_title: test.full_title.clone(),
                        outcome: TestOutcome::Pending,
                        duration_ms: 0,
                        exit_code: None,
                    });
                    continue;
                }

                if let Some(command) = &suite.hooks.before_each {
                    if !self.run_hook("before_each", &suite.full_title, command).await {
                        failures += 1;
                        marks.hook_failed = true;
                        break;
                    }
                }

                let started = Instant::now();
                let (passed, code) = self.run_command(&test.command).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                let outcome = if passed {
                    TestOutcome::Passed
                } else {
                    failures += 1;
                    TestOutcome::Failed
                };
                self.report_test_line(test, outcome, duration_ms, code);
                results.push(ExecutedTest {
                    suite_path: suite.node_path.clone(),
                    test_index: test.test_index,
                    full_title: test.full_title.clone(),
                    outcome,
                    duration_ms,
                    exit_code: code,
                });

                if let Some(command) = &suite.hooks.after_each {
                    if !self.run_hook("after_each", &suite.full_title, command).await {
                        failures += 1;
                        marks.hook_failed = true;
                    }
                }

                if marks.hook_failed || (self.bail && failures > 0) {
                    break;
                }
            }
        }

        if runnable {
            if let Some(command) = &suite.hooks.after_all {
                if !self.run_hook("after_all", &suite.full_title, command).await {
                    failures += 1;
                }
            }
        }

        marks.completed = !marks.hook_failed;
        suite_marks.push((suite.node_path.clone(), marks));
        failures
    }

    /// Write per-test outcomes and suite marks back into the registry
    fn write_back(&self, results: &[ExecutedTest], suite_marks: &[(Vec<usize>, SuiteMarks)]) {
        let mut registry = self.lock_registry();
        for result in results {
            if let Some(node) = registry.node_at_mut(&result.suite_path) {
                if let Some(test) = node.tests.get_mut(result.test_index) {
                    test.marks = TestMarks {
                        outcome: Some(result.outcome),
                        attempts: if result.outcome == TestOutcome::Pending { 0 } else { 1 },
                        duration_ms: Some(result.duration_ms),
                    };
                }
            }
        }
        for (path, marks) in suite_marks {
            if let Some(node) = registry.node_at_mut(path) {
                node.marks = *marks;
            }
        }
    }
}

fn qualify(prefix: &str, title: &str) -> String {
    if prefix.is_empty() {
        title.to_string()
    } else {
        format!("{prefix} {title}")
    }
}

async fn forward_lines<R>(reader: R, relay: Arc<OutputRelay>, stream: LogStream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match stream {
            LogStream::Stdout => relay.stdout_line(&line),
            LogStream::Stderr => relay.stderr_line(&line),
            LogStream::Daemon => relay.daemon_line(&line),
        }
    }
}

#[async_trait]
impl Runner for CommandEngine {
    fn set_filter(&mut self, filter: NameFilter) {
        self.filter = filter;
    }

    fn set_invert(&mut self, invert: bool) {
        self.invert = invert;
    }

    fn set_bail(&mut self, bail: bool) {
        self.bail = bail;
    }

    fn select_reporter(&mut self, kind: ReporterKind) {
        self.reporter = kind;
        self.reporter_output = None;
    }

    fn reset_transient_state(&mut self) {
        self.lock_registry().reset_transient_state();
        self.reporter_output = None;
    }

    async fn run(&mut self) -> Option<i64> {
        let started = Instant::now();
        let plan = self.build_plan();
        tracing::debug!(suites = plan.len(), "execution plan built");

        let mut results: Vec<ExecutedTest> = Vec::new();
        let mut suite_marks: Vec<(Vec<usize>, SuiteMarks)> = Vec::new();
        let mut failures = 0i64;
        let mut bailed = false;

        for suite in &plan {
            failures += self.run_suite(suite, &mut results, &mut suite_marks).await;
            if self.bail && failures > 0 {
                bailed = true;
                break;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let passes = results.iter().filter(|r| r.outcome == TestOutcome::Passed).count();
        let pending = results.iter().filter(|r| r.outcome == TestOutcome::Pending).count();

        match self.reporter {
            ReporterKind::Spec => {
                let summary = format!(
                    "{} passing, {} failing, {} pending ({duration_ms}ms)",
                    passes, failures, pending
                );
                let summary = if failures > 0 {
                    format!("  {}", summary.red())
                } else {
                    format!("  {}", summary.green())
                };
                self.relay.stdout_line("");
                self.relay.stdout_line(&summary);
            }
            ReporterKind::Json => {
                let report = JsonReport {
                    stats: JsonStats {
                        tests: results.len(),
                        passes,
                        failures: results
                            .iter()
                            .filter(|r| r.outcome == TestOutcome::Failed)
                            .count(),
                        pending,
                        duration_ms,
                        bailed,
                    },
                    tests: results
                        .iter()
                        .map(|r| JsonTest {
                            title: r.full_title.clone(),
                            state: r.outcome,
                            duration_ms: r.duration_ms,
                            exit_code: r.exit_code,
                        })
                        .collect(),
                };
                self.reporter_output = serde_json::to_string(&report).ok();
            }
        }

        self.write_back(&results, &suite_marks);
        Some(failures)
    }

    fn take_reporter_output(&mut self) -> Option<String> {
        self.reporter_output.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::channel::{event_channel, RunEvent};
    use crate::registry::TestCase;

    fn test_case(name: &str, command: &str, skip: bool) -> TestCase {
        TestCase {
            name: name.to_string(),
            command: command.to_string(),
            skip,
            marks: TestMarks::default(),
        }
    }

    fn suite_with_tests(title: &str, tests: Vec<TestCase>) -> SuiteNode {
        SuiteNode {
            title: title.to_string(),
            source_file: Some(format!("{title}.yaml")),
            hooks: Hooks::default(),
            tests,
            children: Vec::new(),
            marks: SuiteMarks::default(),
        }
    }

    fn engine_over(roots: Vec<SuiteNode>) -> (CommandEngine, Arc<Mutex<Registry>>) {
        let registry = Arc::new(Mutex::new(Registry::new(roots)));
        let relay = Arc::new(OutputRelay::new());
        let engine = CommandEngine::new(registry.clone(), relay, "sh".into());
        (engine, registry)
    }

    #[tokio::test]
    async fn counts_failures_and_records_marks() {
        let (mut engine, registry) = engine_over(vec![suite_with_tests(
            "basics",
            vec![
                test_case("passes", "true", false),
                test_case("fails", "false", false),
                test_case("skipped", "false", true),
            ],
        )]);

        let failures = engine.run().await;
        assert_eq!(failures, Some(1));

        let registry = registry.lock().expect("lock");
        let suite = &registry.roots()[0];
        assert!(suite.marks.completed);
        assert_eq!(suite.tests[0].marks.outcome, Some(TestOutcome::Passed));
        assert_eq!(suite.tests[1].marks.outcome, Some(TestOutcome::Failed));
        assert_eq!(suite.tests[2].marks.outcome, Some(TestOutcome::Pending));
        assert_eq!(suite.tests[0].marks.attempts, 1);
        assert_eq!(suite.tests[2].marks.attempts, 0);
    }

    #[tokio::test]
    async fn bail_stops_at_the_first_failure() {
        let marker = tempfile::tempdir().expect("tempdir");
        let witness = marker.path().join("ran-after-failure");
        let (mut engine, _registry) = engine_over(vec![
            suite_with_tests("first", vec![test_case("fails", "false", false)]),
            suite_with_tests(
                "second",
                vec![test_case(
                    "would run",
                    &format!("touch {}", witness.display()),
                    false,
                )],
            ),
        ]);
        engine.set_bail(true);

        let failures = engine.run().await;
        assert_eq!(failures, Some(1));
        assert!(!witness.exists(), "bail must stop later suites from running");
    }

    #[tokio::test]
    async fn invert_selects_the_complement() {
        let marker = tempfile::tempdir().expect("tempdir");
        let matched = marker.path().join("matched");
        let other = marker.path().join("other");
        let (mut engine, _registry) = engine_over(vec![suite_with_tests(
            "suite",
            vec![
                test_case("alpha", &format!("touch {}", matched.display()), false),
                test_case("beta", &format!("touch {}", other.display()), false),
            ],
        )]);
        engine.set_filter(NameFilter::compose(Some("alpha"), None, None).expect("filter"));
        engine.set_invert(true);

        let failures = engine.run().await;
        assert_eq!(failures, Some(0));
        assert!(!matched.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn hook_failure_skips_the_suite_and_counts_once() {
        let marker = tempfile::tempdir().expect("tempdir");
        let witness = marker.path().join("test-ran");
        let mut suite = suite_with_tests(
            "hooked",
            vec![test_case("t", &format!("touch {}", witness.display()), false)],
        );
        suite.hooks.before_all = Some("false".to_string());
        let (mut engine, registry) = engine_over(vec![suite]);

        let failures = engine.run().await;
        assert_eq!(failures, Some(1));
        assert!(!witness.exists());
        let registry = registry.lock().expect("lock");
        assert!(registry.roots()[0].marks.hook_failed);
    }

    #[tokio::test]
    async fn json_reporter_buffers_a_single_payload() {
        let (mut engine, _registry) = engine_over(vec![suite_with_tests(
            "suite",
            vec![
                test_case("passes", "true", false),
                test_case("fails", "false", false),
            ],
        )]);
        engine.select_reporter(ReporterKind::Json);

        let failures = engine.run().await;
        assert_eq!(failures, Some(1));

        let payload = engine.take_reporter_output().expect("payload present");
        let report: serde_json::Value = serde_json::from_str(&payload).expect("valid json");
        assert_eq!(report["stats"]["tests"], 2);
        assert_eq!(report["stats"]["passes"], 1);
        assert_eq!(report["stats"]["failures"], 1);
        assert_eq!(report["tests"][0]["title"], "suite passes");
        assert_eq!(report["tests"][0]["state"], "passed");
        // take drains the buffer
        assert!(engine.take_reporter_output().is_none());
    }

    #[tokio::test]
    async fn child_output_streams_through_the_relay() {
        let registry = Arc::new(Mutex::new(Registry::new(vec![suite_with_tests(
            "out",
            vec![test_case("echoes", "echo hello-from-test", false)],
        )])));
        let relay = Arc::new(OutputRelay::new());
        let mut engine = CommandEngine::new(registry, relay.clone(), "sh".into());

        let (sink, mut rx) = event_channel();
        let failures = {
            let _guard = relay.install(sink);
            engine.run().await
        };
        assert_eq!(failures, Some(0));

        let mut saw_child_line = false;
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::Log { line, stream } = event {
                if line == "hello-from-test" {
                    assert_eq!(stream, LogStream::Stdout);
                    saw_child_line = true;
                }
            }
        }
        assert!(saw_child_line, "child stdout must be forwarded as log events");
    }

    #[tokio::test]
    async fn nested_suites_run_in_traversal_order() {
        let order = tempfile::tempdir().expect("tempdir");
        let log = order.path().join("order.log");
        let parent = SuiteNode {
            title: "parent".to_string(),
            source_file: Some("p.yaml".to_string()),
            hooks: Hooks::default(),
            tests: vec![test_case("one", &format!("echo parent >> {}", log.display()), false)],
            children: vec![suite_with_tests(
                "child",
                vec![test_case("two", &format!("echo child >> {}", log.display()), false)],
            )],
            marks: SuiteMarks::default(),
        };
        let (mut engine, _registry) = engine_over(vec![parent]);

        assert_eq!(engine.run().await, Some(0));
        let recorded = std::fs::read_to_string(&log).expect("order log");
        assert_eq!(recorded.lines().collect::<Vec<_>>(), vec!["parent", "child"]);
    }
}
