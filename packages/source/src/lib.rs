#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Source registry and download manager.
//!
//! The registry turns the embedded TOML catalog into [`DataSource`]
//! descriptors; the [`download::DownloadManager`] fetches their archives with
//! retry, checksum verification, and optional throttling.
//!
//! [`DataSource`]: taxroll_source_models::DataSource

pub mod download;
pub mod progress;
pub mod registry;
pub mod retry;

/// Errors that can occur while resolving or fetching sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// I/O error on a local file.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Downloaded bytes do not hash to the configured checksum.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// The embedded catalog or a source filter is invalid.
    #[error("registry error: {message}")]
    Registry { message: String },

    /// A blocking helper task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SourceError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
