//! Test execution engine
//!
//! The daemon depends on the [`Runner`] trait only; [`exec::CommandEngine`]
//! is the bundled implementation that executes registry test cases as
//! shell commands. Tests substitute their own implementations.

pub mod cleanup;
pub mod exec;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::registry::filter::NameFilter;

/// Reporter selection for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReporterKind {
    /// Human-readable lines, streamed as they are produced
    #[default]
    Spec,
    /// One consolidated machine-readable payload emitted at run end
    Json,
}

/// Contract between the run coordinator and the execution engine
///
/// `run` reports the number of failed tests; `None` means the engine could
/// not produce a count, which the coordinator treats as a tooling failure
/// distinct from a test failure.
#[async_trait]
pub trait Runner: Send {
    fn set_filter(&mut self, filter: NameFilter);
    fn set_invert(&mut self, invert: bool);
    fn set_bail(&mut self, bail: bool);
    fn select_reporter(&mut self, kind: ReporterKind);

    /// Clear transient run state so the registry can be run again cleanly
    fn reset_transient_state(&mut self);

    async fn run(&mut self) -> Option<i64>;

    /// Consolidated reporter payload, if the selected reporter buffers one
    fn take_reporter_output(&mut self) -> Option<String>;
}
