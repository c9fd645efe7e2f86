//! Error types shared by the sync pipeline.
//!
//! Every component boundary returns a [`SyncError`]. The orchestrator turns
//! document-level errors into [`FailureInfo`](crate::models::FailureInfo)
//! records using [`SyncError::kind`]; configuration errors never reach a
//! document and abort the run before discovery.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories recorded in the failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Extraction,
    Normalization,
    ChunkConfig,
    EmbeddingRetryable,
    EmbeddingFatal,
    IndexWrite,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Extraction => "extraction",
            ErrorKind::Normalization => "normalization",
            ErrorKind::ChunkConfig => "chunk_config",
            ErrorKind::EmbeddingRetryable => "embedding_retryable",
            ErrorKind::EmbeddingFatal => "embedding_fatal",
            ErrorKind::IndexWrite => "index_write",
            ErrorKind::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("normalization failed: {0}")]
    Normalization(String),
    #[error("invalid chunking configuration: {0}")]
    ChunkConfig(String),
    #[error("embedding failed: {message}")]
    Embedding { message: String, retryable: bool },
    #[error("index write failed: {0}")]
    IndexWrite(String),
    #[error("chunk store error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn embedding_retryable(message: impl Into<String>) -> Self {
        SyncError::Embedding {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn embedding_fatal(message: impl Into<String>) -> Self {
        SyncError::Embedding {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the failing operation may succeed if repeated unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Embedding {
                retryable: true,
                ..
            } | SyncError::IndexWrite(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Extraction(_) => ErrorKind::Extraction,
            SyncError::Normalization(_) => ErrorKind::Normalization,
            SyncError::ChunkConfig(_) => ErrorKind::ChunkConfig,
            SyncError::Embedding {
                retryable: true, ..
            } => ErrorKind::EmbeddingRetryable,
            SyncError::Embedding {
                retryable: false, ..
            } => ErrorKind::EmbeddingFatal,
            SyncError::IndexWrite(_) => ErrorKind::IndexWrite,
            SyncError::Storage(_) | SyncError::Io(_) => ErrorKind::Storage,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::IndexWrite(e.to_string())
    }
}
