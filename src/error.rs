use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("storage unavailable at {}: {message}", path.display())]
    StorageUnavailable {
        path: PathBuf,
        message: String,
    },

    #[error("storage write failed: {message}")]
    StorageWrite {
        message: String,
        structural: bool,
    },

    #[error("storage read failed: {message}")]
    StorageRead {
        message: String,
    },

    #[error("malformed record at index {index}: {message}")]
    MalformedRecord {
        index: u64,
        message: String,
    },

    #[error("refresh failed: {message}")]
    RefreshFailed {
        message: String,
    },

    #[error("freshness state error at {}: {message}", path.display())]
    FreshnessState {
        path: PathBuf,
        message: String,
    },
}

impl CacheError {
    pub fn refresh_failed(message: impl Into<String>) -> Self {
        Self::RefreshFailed {
            message: message.into(),
        }
    }

    pub fn from_write(err: rusqlite::Error) -> Self {
        Self::StorageWrite {
            structural: is_structural(&err),
            message: err.to_string(),
        }
    }

    pub fn from_read(err: rusqlite::Error) -> Self {
        Self::StorageRead {
            message: err.to_string(),
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::StorageWrite {
                structural: true,
                ..
            }
        )
    }
}

fn is_structural(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            match failure.code {
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase | ErrorCode::SchemaChanged => {
                    true
                }
                // Dropped tables surface as a generic error with a message.
                _ => message
                    .as_deref()
                    .map(|m| m.contains("no such table") || m.contains("no such column"))
                    .unwrap_or(false),
            }
        }
        _ => false,
    }
}
