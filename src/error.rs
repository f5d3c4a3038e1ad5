//! Error taxonomy for the ingestion engine.
//!
//! Errors fall into two groups. Per-file errors ([`IngestError::Io`],
//! [`IngestError::Embedding`], [`IngestError::DimensionMismatch`]) are captured
//! into a FAILED ledger record and counted in the scan summary. Everything
//! else is store-level and aborts the current scan.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate chunk id: {0}")]
    DuplicateChunk(String),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IngestError {
    /// Whether this error is confined to a single file and must not abort a scan.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            IngestError::Io(_) | IngestError::Embedding(_) | IngestError::DimensionMismatch { .. }
        )
    }
}
