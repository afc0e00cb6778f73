//! File-level error taxonomy for the ingestion pipeline.
//!
//! Cell and row failures never surface here: the decoder reports them as
//! skipped items and the file carries on. Quality rejections live in
//! `ingest::filter`. View refresh failures are logged per view.

use std::path::PathBuf;

use thiserror::Error;

use crate::ingest::decoder::DecodeError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The tag catalog could not be read. Fatal at startup.
    #[error("Tag catalog unavailable: {0}")]
    CatalogUnavailable(#[source] StorageError),

    #[error("Unsupported file format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    /// A batch transaction failed and was rolled back
    #[error("Failed to persist batch of {rows} measurements: {source}")]
    Persistence {
        rows: usize,
        #[source]
        source: StorageError,
    },


    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IngestError {
    /// Short machine-friendly label used in logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CatalogUnavailable(_) => "catalog_unavailable",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::Decode { .. } => "decode_failure",
            Self::Persistence { .. } => "persistence_failure",
            Self::Task(_) => "task",
        }
    }
}
