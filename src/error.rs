//! Error types for the octo-sw library.

use thiserror::Error;

use crate::worker::WorkerState;

/// Errors that can occur while installing, activating or serving a worker.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during cache storage or config file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored cache entry or manifest could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The configuration could not be written back as TOML.
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// A URL in the configuration or a request could not be parsed.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The configuration is semantically invalid.
    #[error("Invalid config: {0}")]
    Config(String),

    /// A pre-cache asset could not be fetched, so installation was aborted.
    #[error("Pre-cache of {url} failed: {reason}")]
    Precache {
        /// URL of the asset that failed.
        url: String,
        /// Why the asset was rejected.
        reason: String,
    },

    /// The cache storage backend failed.
    #[error("Cache storage error: {0}")]
    Storage(String),

    /// A lifecycle operation was attempted from the wrong state.
    #[error("Invalid worker state: expected {expected}, found {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: WorkerState,
        /// State the worker was actually in.
        actual: WorkerState,
    },
}

/// A specialized `Result` type for octo-sw operations.
pub type Result<T> = std::result::Result<T, Error>;
