//! Error types for the tile synchronization library

use std::path::PathBuf;

use garden_core::MirrorError;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error type for tile synchronization
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// IO errors without a known path
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Local filesystem failure at a known path
    #[error("IO error at '{path}': {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Remote mirror errors, including non-200 statuses
    #[error("Remote error: {0}")]
    Remote(#[from] MirrorError),

    /// Coordinates outside the world or the active region
    #[error("Addressing error: {0}")]
    Addressing(String),

    /// Region geometry not acceptable for a grid
    #[error("Invalid region: {0}")]
    Region(String),

    /// Manifest too short or without a recognizable header
    #[error("Unusable manifest at {url}")]
    ManifestUnusable { url: String },

    /// Malformed stamp file
    #[error("Stamp parse error at '{path}': {message}")]
    StampParse { path: PathBuf, message: String },

    /// Worker did not come up or went away
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// A mission was dispatched while another one is running
    #[error("Worker is busy with another mission")]
    WorkerBusy,

    /// Progress channel errors
    #[error("Progress reporting error: {0}")]
    Progress(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Create a new local IO error
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Create a new stamp parse error
    pub fn stamp_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::StampParse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new addressing error
    pub fn addressing(message: impl Into<String>) -> Self {
        Self::Addressing(message.into())
    }

    /// HTTP status of a remote failure, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Remote(err) => err.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}
