//! Decrypt-then-transcribe service for audio objects.
//!
//! One invocation fetches a named object from an S3-compatible store into a
//! request-scoped scratch file, optionally opens its AES-GCM envelope, runs
//! Whisper inference over it, shifts the segment timestamps by a fixed
//! calibration offset and deletes the source object. Failures are collapsed
//! into a single in-band error shape; details stay in the logs.

pub mod config;
pub mod crypto;
pub mod error;
pub mod inference;
pub mod pipeline;
pub mod store;
pub mod telemetry;
