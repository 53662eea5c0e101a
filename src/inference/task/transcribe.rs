use anyhow::Error;
use serde::{Deserialize, Serialize};

/// Sentinel language hint that turns on model-side detection. Matched
/// case-sensitively; any other hint is lower-cased and forced.
pub const AUTO_LANGUAGE: &str = "auto";

fn default_language() -> String {
    AUTO_LANGUAGE.to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TranscribeRequest {
    /// Object key of the audio file to transcribe.
    pub filename: String,

    #[serde(default = "default_language")]
    pub language: String,

    /// Base64 AES key. Decryption runs only when both this and `iv` are set.
    #[serde(rename = "decryptionKey")]
    pub decryption_key: Option<String>,

    /// Base64 AES-GCM nonce.
    pub iv: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanguageHint {
    Detect,
    Forced(String),
}

impl LanguageHint {
    pub fn from_request(language: &str) -> Self {
        if language == AUTO_LANGUAGE {
            LanguageHint::Detect
        } else {
            LanguageHint::Forced(language.to_lowercase())
        }
    }
}

/// A timed span of transcribed speech, as decoded from the model's timestamp
/// tokens, along with the decoding stats of the window that produced it.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub temperature: f64,
    pub avg_logprob: f64,
    pub no_speech_prob: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub language: String,
}

/// Terminal failure shape: a caller-safe message plus the empty transcript
/// fields, so every invocation answers with exactly one of two shapes.
#[derive(Serialize, Debug)]
pub struct TranscriptFailure {
    pub error: String,
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub language: String,
}

impl TranscriptFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            text: String::new(),
            segments: Vec::new(),
            language: "unknown".to_string(),
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum TranscribeResponse {
    Completed(Transcript),
    Failed(TranscriptFailure),
}

pub trait TranscribeHandler {
    fn run_transcribe(
        &mut self,
        input: Box<[u8]>,
        language: &LanguageHint,
    ) -> Result<Transcript, Error>;
}
