use anyhow::Result;
use clap_serde_derive::ClapSerde;
use serde::Deserialize;

/// Startup configuration, merged from the TOML file with CLI and environment
/// overrides. Constructed once and passed by reference; request payloads
/// never carry any of these values.
#[derive(ClapSerde, Deserialize, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[arg(short, long, env, default_value = "0.0.0.0")]
    pub address: String,

    /// The port the listener binds to
    #[arg(short, long, env, default_value = "8080")]
    pub port: u16,

    /// Base URL of the S3-compatible object store holding uploaded audio
    #[arg(long, env, default_value = "http://127.0.0.1:9000")]
    pub store_endpoint: String,

    /// Region name passed to the store client
    #[arg(long, env, default_value = "auto")]
    pub store_region: String,

    /// Bucket the audio objects are fetched from and deleted out of
    #[arg(long, env, default_value = "audio-uploads")]
    pub store_bucket: String,

    /// Access key id for the store
    #[arg(long, env, default_value = "")]
    pub store_access_key_id: String,

    /// Secret access key for the store
    #[arg(long, env, default_value = "")]
    pub store_secret_access_key: String,

    /// Whisper checkpoint to serve, resolved against the model catalog
    #[arg(short, long, env, default_value = "base")]
    pub model: String,

    /// Revision of the checkpoint repository on the hub
    #[arg(long, env, default_value = "main")]
    pub model_revision: String,

    /// Precomputed mel filter bank matching the checkpoint's bin count
    #[arg(long, env, default_value = "melfilters.bytes")]
    pub mel_filters_path: String,

    /// OTLP collector endpoint for trace and metric export; empty disables it
    #[arg(long, env, default_value = "")]
    pub otlp_endpoint: String,

    /// Keep console logging on even when an OTLP endpoint is set
    #[arg(long, env)]
    pub log_console: bool,
}

impl Config {
    pub fn otlp_endpoint(&self) -> Option<&str> {
        if self.otlp_endpoint.is_empty() {
            None
        } else {
            Some(&self.otlp_endpoint)
        }
    }

    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let config = toml::from_str(&str)?;
        Ok(config)
    }
}
