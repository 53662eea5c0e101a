use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Error, Result};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use rand::SeedableRng;
use tracing::info;

use crate::inference::audio_pipeline::AudioGeneratorPipeline;
use crate::inference::models::model::ModelBase;
use crate::inference::task::transcribe::{LanguageHint, Transcript, TranscribeHandler};

/// Checkpoint names accepted by the `model` configuration option, mapped to
/// their hub repositories.
const MODEL_CATALOG: [(&str, &str); 11] = [
    ("tiny", "openai/whisper-tiny"),
    ("tiny.en", "openai/whisper-tiny.en"),
    ("base", "openai/whisper-base"),
    ("base.en", "openai/whisper-base.en"),
    ("small", "openai/whisper-small"),
    ("small.en", "openai/whisper-small.en"),
    ("medium", "openai/whisper-medium"),
    ("medium.en", "openai/whisper-medium.en"),
    ("large", "openai/whisper-large-v3"),
    ("large-v2", "openai/whisper-large-v2"),
    ("large-v3", "openai/whisper-large-v3"),
];

#[derive(Clone)]
pub struct WhisperModel {
    base: ModelBase,
    generator_pipeline: AudioGeneratorPipeline,
}

impl WhisperModel {
    /// Resolves a catalog name and loads the checkpoint from the hub.
    #[tracing::instrument(level = "info", skip(api, mel_filters_path))]
    pub fn from_catalog(
        api: &Api,
        name: &str,
        revision: &str,
        mel_filters_path: &Path,
    ) -> Result<Self> {
        let Some((_, repo_id)) = MODEL_CATALOG.iter().find(|(short, _)| *short == name) else {
            bail!("Model {name} not found")
        };
        let base = ModelBase {
            name: name.to_string(),
            license: "MIT".to_string(),
            repo_id: (*repo_id).to_string(),
            repo_revision: revision.to_string(),
        };

        let repo = api.repo(Repo::with_revision(
            base.repo_id.clone(),
            RepoType::Model,
            base.repo_revision.clone(),
        ));
        let generator_pipeline = AudioGeneratorPipeline::with_safetensors_model(
            &repo,
            "config.json",
            "tokenizer.json",
            "model.safetensors",
            mel_filters_path,
            rand::rngs::StdRng::from_seed([0; 32]),
        )?;
        info!(model = name, repo_id, "whisper checkpoint loaded");

        Ok(Self {
            base,
            generator_pipeline,
        })
    }

    pub fn name(&self) -> &str {
        &self.base.name
    }
}

impl TranscribeHandler for WhisperModel {
    #[tracing::instrument(level = "info", skip(self, input, language))]
    fn run_transcribe(
        &mut self,
        input: Box<[u8]>,
        language: &LanguageHint,
    ) -> Result<Transcript, Error> {
        let started = Instant::now();
        let (segments, language) = self.generator_pipeline.transcribe(input, language)?;
        let text = segments
            .iter()
            .map(|segment| segment.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            model = %self.base.name,
            segments = segments.len(),
            elapsed_s = started.elapsed().as_secs_f64(),
            "transcription complete"
        );

        Ok(Transcript {
            text,
            segments,
            language,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_default_model() {
        assert!(MODEL_CATALOG.iter().any(|(short, _)| *short == "base"));
    }
}
