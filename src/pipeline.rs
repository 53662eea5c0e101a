use tracing::{error, info, warn};

use crate::crypto::decrypt_file_in_place;
use crate::error::{PipelineResult, TranscribeError};
use crate::inference::task::transcribe::{
    LanguageHint, Transcript, TranscribeHandler, TranscribeRequest, TranscribeResponse,
    TranscriptFailure, TranscriptSegment,
};
use crate::store::{ObjectStore, ScratchFile};

/// Whisper segment boundaries run consistently late by about half a second;
/// every segment is shifted earlier by this amount before responding.
pub const SEGMENT_TIME_ADJUSTMENT_SEC: f64 = 0.5;

/// The one validation failure reported to the caller with its own message.
pub const MISSING_FILENAME_MESSAGE: &str = "Missing filename parameter";

/// Message returned for every non-validation failure. Internal detail stays
/// in the logs.
pub const GENERIC_FAILURE_MESSAGE: &str = "An unexpected error occurred during transcription.";

/// Runs one invocation end to end: validate, fetch into scratch, decrypt when
/// key material is present, transcribe, adjust timestamps, then delete the
/// source object. The scratch file is removed on every exit path.
#[tracing::instrument(level = "info", skip_all, fields(filename = %request.filename))]
pub async fn transcribe_object(
    store: &impl ObjectStore,
    model: &mut impl TranscribeHandler,
    request: &TranscribeRequest,
) -> PipelineResult<Transcript> {
    if request.filename.is_empty() {
        return Err(TranscribeError::Validation(MISSING_FILENAME_MESSAGE));
    }
    let language = LanguageHint::from_request(&request.language);

    let scratch = ScratchFile::create()?;
    store.fetch(&request.filename, scratch.path()).await?;

    if let (Some(key), Some(iv)) = (request.decryption_key.as_deref(), request.iv.as_deref()) {
        decrypt_file_in_place(scratch.path(), key, iv).await?;
    }

    let audio = tokio::fs::read(scratch.path()).await?;
    let mut transcript = model
        .run_transcribe(audio.into_boxed_slice(), &language)
        .map_err(TranscribeError::Inference)?;
    adjust_segment_times(&mut transcript.segments);

    // Source cleanup is best-effort: the transcript is already complete.
    if let Err(err) = store.delete(&request.filename).await {
        warn!(error = %err, "failed to delete source object");
    }

    info!(
        language = %transcript.language,
        segments = transcript.segments.len(),
        "request complete"
    );
    Ok(transcript)
}

/// Shifts every segment earlier by [`SEGMENT_TIME_ADJUSTMENT_SEC`]. Starts
/// are floored at zero; ends are floored at the offset itself, so a source
/// segment shorter than the offset may come out with `end < start`.
pub fn adjust_segment_times(segments: &mut [TranscriptSegment]) {
    for segment in segments {
        segment.start = (segment.start - SEGMENT_TIME_ADJUSTMENT_SEC).max(0.0);
        segment.end = (segment.end - SEGMENT_TIME_ADJUSTMENT_SEC).max(SEGMENT_TIME_ADJUSTMENT_SEC);
    }
}

/// Collapses the pipeline outcome into the wire shape. Validation failures
/// keep their message; everything else is logged with its full chain and
/// answered with [`GENERIC_FAILURE_MESSAGE`].
pub fn respond(result: PipelineResult<Transcript>) -> TranscribeResponse {
    match result {
        Ok(transcript) => TranscribeResponse::Completed(transcript),
        Err(TranscribeError::Validation(message)) => {
            TranscribeResponse::Failed(TranscriptFailure::new(message))
        }
        Err(err) => {
            error!(error = ?err, "transcription request failed");
            TranscribeResponse::Failed(TranscriptFailure::new(GENERIC_FAILURE_MESSAGE))
        }
    }
}
