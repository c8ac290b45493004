//! Configuration, log, and scratch-data paths
//!
//! All locations resolve through the platform directories crate so the
//! daemon behaves the same whether launched from a shell or a supervisor.

use std::path::PathBuf;

use directories::ProjectDirs;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "testd")
}

/// Path of the TOML configuration file, if a config directory exists
pub fn config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

/// Directory for daemon log files
pub fn log_dir() -> Option<PathBuf> {
    project_dirs().map(|d| d.data_local_dir().join("logs"))
}

/// Default scratch directory wiped between runs
pub fn default_data_dir() -> Option<PathBuf> {
    project_dirs().map(|d| d.data_local_dir().join("scratch"))
}
