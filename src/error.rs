//! Failure taxonomy of an ingestion job.
//!
//! Only [`IngestError::Retrieval`], [`IngestError::Extraction`] and
//! [`IngestError::NoCandidates`] end a job early. The rest are collected into
//! the manifest; see `pipeline` for where each one lands.

use crate::classify::Role;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to retrieve {bucket}/{key}: {source}")]
    Retrieval {
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to extract archive: {0}")]
    Extraction(String),

    #[error("no *.{extension} files found among {scanned} extracted files")]
    NoCandidates { extension: String, scanned: usize },

    #[error("conversion failed for {role}: {message}")]
    Conversion { role: Role, message: String },

    #[error("upload failed for {key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: StorageError,
    },
}

impl IngestError {
    /// Fatal errors abort the job with a `failed` terminal status.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Retrieval { .. }
                | IngestError::Extraction(_)
                | IngestError::NoCandidates { .. }
        )
    }
}
