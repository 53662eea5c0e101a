use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use axum::async_trait;
use base64ct::{Base64, Encoding};

use transcribe_runner::crypto::DecryptError;
use transcribe_runner::error::TranscribeError;
use transcribe_runner::inference::task::transcribe::{
    LanguageHint, Transcript, TranscribeHandler, TranscribeRequest, TranscriptSegment,
};
use transcribe_runner::pipeline::{self, GENERIC_FAILURE_MESSAGE, MISSING_FILENAME_MESSAGE};
use transcribe_runner::store::{ObjectStore, StoreError};

const KEY: [u8; 32] = [7u8; 32];
const NONCE: [u8; 12] = [3u8; 12];

enum FetchOutcome {
    Write(Vec<u8>),
    NotFound,
}

struct StubStore {
    outcome: FetchOutcome,
    fail_delete: bool,
    fetch_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    scratch_path: Mutex<Option<PathBuf>>,
}

impl StubStore {
    fn serving(bytes: Vec<u8>) -> Self {
        Self {
            outcome: FetchOutcome::Write(bytes),
            fail_delete: false,
            fetch_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            scratch_path: Mutex::new(None),
        }
    }

    fn missing() -> Self {
        Self {
            outcome: FetchOutcome::NotFound,
            ..Self::serving(Vec::new())
        }
    }

    fn scratch_path(&self) -> Option<PathBuf> {
        self.scratch_path.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for StubStore {
    async fn fetch(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        *self.scratch_path.lock().unwrap() = Some(dest.to_path_buf());
        match &self.outcome {
            FetchOutcome::Write(bytes) => {
                std::fs::write(dest, bytes)?;
                Ok(())
            }
            FetchOutcome::NotFound => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete {
            Err(StoreError::Transfer("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct StubModel {
    fail: bool,
    calls: usize,
    last_input: Option<Vec<u8>>,
    last_language: Option<LanguageHint>,
}

impl TranscribeHandler for StubModel {
    fn run_transcribe(
        &mut self,
        input: Box<[u8]>,
        language: &LanguageHint,
    ) -> anyhow::Result<Transcript> {
        self.calls += 1;
        self.last_input = Some(input.to_vec());
        self.last_language = Some(language.clone());
        if self.fail {
            anyhow::bail!("mel shape mismatch")
        }
        Ok(Transcript {
            text: "hello world".to_string(),
            segments: vec![TranscriptSegment {
                start: 1.2,
                end: 3.0,
                text: "hello world".to_string(),
                temperature: 0.0,
                avg_logprob: -0.3,
                no_speech_prob: 0.02,
            }],
            language: "en".to_string(),
        })
    }
}

fn request(filename: &str) -> TranscribeRequest {
    serde_json::from_value(serde_json::json!({ "filename": filename })).unwrap()
}

fn encrypted_request(filename: &str) -> TranscribeRequest {
    serde_json::from_value(serde_json::json!({
        "filename": filename,
        "decryptionKey": Base64::encode_string(&KEY),
        "iv": Base64::encode_string(&NONCE),
    }))
    .unwrap()
}

fn seal(plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new_from_slice(&KEY).unwrap();
    cipher.encrypt(Nonce::from_slice(&NONCE), plaintext).unwrap()
}

#[tokio::test]
async fn missing_filename_short_circuits_before_any_side_effect() {
    let store = StubStore::serving(b"audio".to_vec());
    let mut model = StubModel::default();

    let result = pipeline::transcribe_object(&store, &mut model, &request("")).await;

    assert!(matches!(result, Err(TranscribeError::Validation(_))));
    assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.delete_calls.load(Ordering::SeqCst), 0);
    assert_eq!(model.calls, 0);

    let body = serde_json::to_value(pipeline::respond(result)).unwrap();
    assert_eq!(body["error"], MISSING_FILENAME_MESSAGE);
    assert_eq!(body["segments"], serde_json::json!([]));
}

#[tokio::test]
async fn happy_path_adjusts_timestamps_and_deletes_source() {
    let store = StubStore::serving(b"plain audio bytes".to_vec());
    let mut model = StubModel::default();

    let transcript = pipeline::transcribe_object(&store, &mut model, &request("clip.webm"))
        .await
        .unwrap();

    assert_eq!(transcript.segments[0].start, 0.7);
    assert_eq!(transcript.segments[0].end, 2.5);
    assert_eq!(transcript.language, "en");
    assert_eq!(store.delete_calls.load(Ordering::SeqCst), 1);

    let scratch = store.scratch_path().unwrap();
    assert!(!scratch.exists());
}

#[tokio::test]
async fn fetch_failure_is_contained_and_scratch_removed() {
    let store = StubStore::missing();
    let mut model = StubModel::default();

    let result = pipeline::transcribe_object(&store, &mut model, &request("gone.webm")).await;

    assert!(matches!(result, Err(TranscribeError::Fetch(_))));
    assert_eq!(model.calls, 0);
    assert_eq!(store.delete_calls.load(Ordering::SeqCst), 0);
    assert!(!store.scratch_path().unwrap().exists());

    let body = serde_json::to_string(&pipeline::respond(result)).unwrap();
    assert!(body.contains(GENERIC_FAILURE_MESSAGE));
    assert!(!body.contains("gone.webm"));
    assert!(!body.contains("not found"));
}

#[tokio::test]
async fn tampered_payload_never_reaches_inference() {
    let store = StubStore::serving(b"definitely not an aes-gcm envelope".to_vec());
    let mut model = StubModel::default();

    let result =
        pipeline::transcribe_object(&store, &mut model, &encrypted_request("clip.webm")).await;

    assert!(matches!(
        result,
        Err(TranscribeError::Decrypt(DecryptError::AuthenticationFailed))
    ));
    assert_eq!(model.calls, 0);
    assert_eq!(store.delete_calls.load(Ordering::SeqCst), 0);
    assert!(!store.scratch_path().unwrap().exists());
}

#[tokio::test]
async fn encrypted_payload_is_decrypted_before_inference() {
    let store = StubStore::serving(seal(b"spoken word audio"));
    let mut model = StubModel::default();

    pipeline::transcribe_object(&store, &mut model, &encrypted_request("clip.webm"))
        .await
        .unwrap();

    assert_eq!(model.last_input.as_deref(), Some(b"spoken word audio".as_slice()));
}

#[tokio::test]
async fn absent_key_material_skips_decryption() {
    let store = StubStore::serving(b"already plaintext".to_vec());
    let mut model = StubModel::default();

    pipeline::transcribe_object(&store, &mut model, &request("clip.webm"))
        .await
        .unwrap();

    assert_eq!(model.last_input.as_deref(), Some(b"already plaintext".as_slice()));
}

#[tokio::test]
async fn inference_failure_skips_source_delete() {
    let store = StubStore::serving(b"audio".to_vec());
    let mut model = StubModel {
        fail: true,
        ..StubModel::default()
    };

    let result = pipeline::transcribe_object(&store, &mut model, &request("clip.webm")).await;

    assert!(matches!(result, Err(TranscribeError::Inference(_))));
    assert_eq!(store.delete_calls.load(Ordering::SeqCst), 0);
    assert!(!store.scratch_path().unwrap().exists());

    let body = serde_json::to_string(&pipeline::respond(result)).unwrap();
    assert!(body.contains(GENERIC_FAILURE_MESSAGE));
    assert!(!body.contains("mel shape mismatch"));
}

#[tokio::test]
async fn delete_failure_still_returns_the_transcript() {
    let store = StubStore {
        fail_delete: true,
        ..StubStore::serving(b"audio".to_vec())
    };
    let mut model = StubModel::default();

    let transcript = pipeline::transcribe_object(&store, &mut model, &request("clip.webm"))
        .await
        .unwrap();

    assert_eq!(transcript.text, "hello world");
    assert_eq!(store.delete_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn language_hint_is_normalized_before_inference() {
    let store = StubStore::serving(b"audio".to_vec());
    let mut model = StubModel::default();
    let request: TranscribeRequest = serde_json::from_value(serde_json::json!({
        "filename": "clip.webm",
        "language": "EN",
    }))
    .unwrap();

    pipeline::transcribe_object(&store, &mut model, &request)
        .await
        .unwrap();

    assert_eq!(
        model.last_language,
        Some(LanguageHint::Forced("en".to_string()))
    );
}
