//! Error types for the test orchestration daemon
//!
//! Error messages are written to be actionable from a terminal or a CI log,
//! with hints on how to resolve common issues.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for testd
#[derive(Error, Debug)]
pub enum Error {
    // === Daemon/Connection Errors ===
    #[error("Daemon not reachable at {url}: {error}. Start it with 'testd serve'")]
    DaemonUnreachable { url: String, error: String },

    #[error("Daemon rejected the request: {0}")]
    DaemonRejected(String),

    // === Registry Errors ===
    #[error("Manifest directory '{0}' does not exist or is not a directory")]
    ManifestDirMissing(String),

    #[error("Failed to parse manifest '{path}': {error}")]
    ManifestParse { path: String, error: String },

    #[error("No tests found for file pattern '{0}'")]
    NoSuitesForFile(String),

    // === Filter Errors ===
    #[error("Invalid name pattern '{pattern}': {error}")]
    InvalidPattern { pattern: String, error: String },

    // === Engine Errors ===
    #[error("Shell '{0}' not found. Set [engine].shell in the config file")]
    ShellNotFound(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === HTTP Client Errors ===
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a manifest parse error for a path
    pub fn manifest_parse(path: &std::path::Path, error: impl std::fmt::Display) -> Self {
        Self::ManifestParse {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// Create an invalid pattern error
    pub fn invalid_pattern(pattern: &str, error: impl std::fmt::Display) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            error: error.to_string(),
        }
    }
}
