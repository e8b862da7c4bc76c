//! Error types and exit codes for corediff

use std::process::ExitCode;
use thiserror::Error;

/// Main error type for corediff operations
#[derive(Error, Debug)]
pub enum CorediffError {
    #[error("{path} is not a CDDB database; legacy databases are no longer supported, please re-index")]
    BadMagic { path: String },

    #[error("database version {found} uses an older hash; please re-index")]
    StaleDbVersion { found: u32 },

    #[error("database version {found} is newer than supported ({supported}); please update corediff")]
    FutureDbVersion { found: u32, supported: u32 },

    #[error("database truncated? header declares {count} hashes but the file holds at most {capacity}")]
    TruncatedDb { count: u64, capacity: u64 },

    #[error("{path}: file too small for a CDDB header")]
    ShortDbFile { path: String },

    #[error("manifest error: {message}")]
    Manifest { message: String },

    #[error("composer error: {message}")]
    Composer { message: String },

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("fetching {url}: {message}")]
    Http { url: String, message: String },

    #[error("invalid package name {name:?}: must be vendor/package")]
    BadPackageName { name: String },

    #[error("{message}")]
    Usage { message: String },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CorediffError {
    /// Exit code for the CLI. All fatal errors map to 1; exit code 2 is
    /// reserved for the signal handler's flush-and-exit path.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(1)
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    pub fn composer(message: impl Into<String>) -> Self {
        Self::Composer {
            message: message.into(),
        }
    }
}

/// Result type alias for corediff operations
pub type Result<T> = std::result::Result<T, CorediffError>;
