//! CLI command definitions

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::daemon::coordinator::RunRequest;
use crate::engine::ReporterKind;

/// Top-level subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the orchestration daemon in the foreground
    Serve {
        /// Path to an alternate config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,

        /// Override the configured manifest directory
        #[arg(long)]
        manifest_dir: Option<PathBuf>,
    },

    /// Execute one run locally and exit with a failure-derived status
    Run {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Path to an alternate config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Request a run from a live daemon and stream its output
    Trigger {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Daemon base URL (defaults to the configured host and port)
        #[arg(long)]
        url: Option<String>,

        /// Path to an alternate config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show daemon health
    Status {
        /// Daemon base URL (defaults to the configured host and port)
        #[arg(long)]
        url: Option<String>,

        /// Path to an alternate config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List source files and the suites they define
    Files {
        /// Daemon base URL (defaults to the configured host and port)
        #[arg(long)]
        url: Option<String>,

        /// Path to an alternate config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Test selection flags shared by `run` and `trigger`
#[derive(Debug, Clone, Args)]
pub struct SelectionArgs {
    /// Only run tests whose full title matches this pattern
    #[arg(long)]
    pub grep: Option<String>,

    /// Only run suites attributed to files matching this path pattern
    #[arg(long)]
    pub file: Option<String>,

    /// Run everything the selection does NOT match
    #[arg(long)]
    pub invert: bool,

    /// Stop at the first failure
    #[arg(long)]
    pub bail: bool,

    /// Reporter to use
    #[arg(long, value_enum, default_value = "spec")]
    pub reporter: ReporterArg,

    /// Let test commands rewrite their snapshots
    #[arg(long)]
    pub update_snapshots: bool,
}

impl SelectionArgs {
    /// Build the run request these flags describe
    pub fn to_request(&self) -> RunRequest {
        RunRequest {
            grep: self.grep.clone(),
            file: self.file.clone(),
            invert: self.invert,
            reporter: self.reporter.into(),
            bail: self.bail,
            update_snapshots: self.update_snapshots,
        }
    }
}

/// Reporter choice on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ReporterArg {
    /// Human-readable streamed lines
    #[default]
    Spec,
    /// One consolidated JSON payload
    Json,
}

impl From<ReporterArg> for ReporterKind {
    fn from(arg: ReporterArg) -> Self {
        match arg {
            ReporterArg::Spec => ReporterKind::Spec,
            ReporterArg::Json => ReporterKind::Json,
        }
    }
}
