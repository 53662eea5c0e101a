use thiserror::Error;

use crate::crypto::DecryptError;
use crate::store::StoreError;

pub type PipelineResult<T> = Result<T, TranscribeError>;

/// Failure kinds of one transcription invocation, composed at the pipeline
/// boundary. Only `Validation` carries a message meant for the caller; every
/// other kind is collapsed into a generic response and logged in full.
#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("invalid request: {0}")]
    Validation(&'static str),

    #[error("object fetch failed: {0}")]
    Fetch(#[from] StoreError),

    #[error("payload decryption failed: {0}")]
    Decrypt(#[from] DecryptError),

    #[error("transcription failed: {0}")]
    Inference(anyhow::Error),

    #[error("internal failure: {0}")]
    Internal(#[from] std::io::Error),
}
