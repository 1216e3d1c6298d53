//! Error types for file sync

use thiserror::Error;

/// Result type alias for file sync operations
pub type Result<T> = std::result::Result<T, FileSyncError>;

/// Main error type for file sync
#[derive(Error, Debug)]
pub enum FileSyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Invalid file pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "http")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Apply error: {0}")]
    Apply(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FileSyncError {
    /// Check if the next scheduled cycle may succeed without intervention
    pub fn is_retryable(&self) -> bool {
        match self {
            FileSyncError::Transport(_) | FileSyncError::Unavailable(_) | FileSyncError::Io(_) => {
                true
            }
            #[cfg(feature = "http")]
            FileSyncError::Http(_) => true,
            _ => false,
        }
    }
}
