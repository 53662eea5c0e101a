use std::path::Path;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use clap_serde_derive::ClapSerde;
use hf_hub::api::sync::Api;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use transcribe_runner::config::Config;
use transcribe_runner::inference::models::whisper::WhisperModel;
use transcribe_runner::inference::task::transcribe::{TranscribeRequest, TranscribeResponse};
use transcribe_runner::pipeline;
use transcribe_runner::store::R2Store;
use transcribe_runner::telemetry::init_telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = "TranscribeRunner.toml")]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[derive(Clone)]
struct AppState {
    store: R2Store,
    model: WhisperModel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == "TranscribeRunner.toml" {
                Config::default().merge(args.opt_config)
            } else {
                return Err(err.context(format!(
                    "Failed to read configuration file {}",
                    args.config_file
                )));
            }
        }
    };
    init_telemetry(config.otlp_endpoint(), config.log_console);

    let api = Api::new().context("Failed to create hub API client")?;
    let model = WhisperModel::from_catalog(
        &api,
        &config.model,
        &config.model_revision,
        Path::new(&config.mel_filters_path),
    )?;
    let store = R2Store::new(&config);
    let state = AppState { store, model };

    let router = Router::new()
        .route("/transcribe", post(handle_transcribe_request))
        .route("/health", get(handle_health_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

/// Errors are reported in-band: the response is 200 with either the
/// transcript or the error shape as its body.
#[axum_macros::debug_handler]
async fn handle_transcribe_request(
    State(state): State<AppState>,
    Json(request): Json<TranscribeRequest>,
) -> Json<TranscribeResponse> {
    // Each invocation decodes with its own copy of the pipeline state.
    let mut model = state.model.clone();
    let result = pipeline::transcribe_object(&state.store, &mut model, &request).await;
    Json(pipeline::respond(result))
}

async fn handle_health_request() -> StatusCode {
    StatusCode::OK
}
