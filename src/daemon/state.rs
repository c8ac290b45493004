//! Process-wide run/shutdown state
//!
//! Single-flight is enforced by the admission guard here, not by a lock
//! around the run itself. The three phases only ever move Idle → Running →
//! Idle, with ShuttingDown as a one-way terminal phase reachable from
//! either. Callers go through the transition operations; the raw phase is
//! never exposed mutably.

use std::sync::Mutex;
use std::time::Duration;

/// Lifecycle phase of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    ShuttingDown,
}

/// Outcome of asking to start a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The run may proceed; the state is now Running
    Granted,
    /// Another run is in progress
    Busy,
    /// Shutdown has begun; no new runs are accepted
    ShuttingDown,
}

struct Inner {
    phase: Phase,
    /// The current run's client went away; scoped to one run
    peer_gone: bool,
}

/// Shared daemon state handle
pub struct DaemonState {
    inner: Mutex<Inner>,
}

impl DaemonState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                peer_gone: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admission guard for a run request
    ///
    /// Grants only from Idle, transitioning to Running and clearing the
    /// per-run peer flag. Busy and ShuttingDown leave the state untouched.
    pub fn try_begin_run(&self) -> Admission {
        let mut inner = self.lock();
        match inner.phase {
            Phase::ShuttingDown => Admission::ShuttingDown,
            Phase::Running => Admission::Busy,
            Phase::Idle => {
                inner.phase = Phase::Running;
                inner.peer_gone = false;
                Admission::Granted
            }
        }
    }

    /// End the current run
    ///
    /// Running → Idle; a shutdown that began mid-run stays terminal.
    pub fn finish_run(&self) {
        let mut inner = self.lock();
        if inner.phase == Phase::Running {
            inner.phase = Phase::Idle;
        }
    }

    /// Flip to ShuttingDown; returns true only for the first caller
    pub fn begin_shutdown(&self) -> bool {
        let mut inner = self.lock();
        if inner.phase == Phase::ShuttingDown {
            false
        } else {
            inner.phase = Phase::ShuttingDown;
            true
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().phase == Phase::Running
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().phase == Phase::ShuttingDown
    }

    /// Health endpoint status label
    pub fn status_label(&self) -> &'static str {
        if self.is_shutting_down() {
            "shutting_down"
        } else {
            "ready"
        }
    }

    /// Record that the current run's client disconnected
    pub fn mark_peer_gone(&self) {
        self.lock().peer_gone = true;
    }

    pub fn peer_gone(&self) -> bool {
        self.lock().peer_gone
    }

    /// Wait for an in-flight run to reach natural termination
    ///
    /// Used by the shutdown path; polling keeps this free of wakeup
    /// bookkeeping in the run path.
    pub async fn wait_idle(&self) {
        while self.is_running() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}
