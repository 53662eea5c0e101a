#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Error, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use candle_transformers::models::whisper;
use candle_transformers::models::whisper::model::Whisper;
use candle_transformers::models::whisper::{
    audio, Config, EOT_TOKEN, HOP_LENGTH, LOGPROB_THRESHOLD, NO_SPEECH_THRESHOLD,
    NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, SAMPLE_RATE, SOT_TOKEN, TEMPERATURES,
    TRANSCRIBE_TOKEN,
};
use hf_hub::api::sync::ApiRepo;
use rand::distributions::Distribution;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, error};

use crate::inference::language::detect_language;
use crate::inference::pcm_decode::pcm_decode;
use crate::inference::task::transcribe::{LanguageHint, TranscriptSegment};

// Number of mel frequency bands per filter in the precomputed bank.
const MEL_FILTER_WIDTH: usize = 201;

// Timestamp tokens advance in steps of 20ms.
const TIMESTAMP_STEP: f32 = 0.02;

/// Windowed Whisper decoding over a full audio object. Derived from the
/// huggingface candle whisper example, reshaped to emit timed segments.
#[derive(Clone)]
pub struct AudioGeneratorPipeline {
    model: Whisper,
    tokenizer: Tokenizer,
    config: Config,
    mel_filters: Vec<f32>,
    suppress_tokens: Tensor,
    sot_token: u32,
    transcribe_token: u32,
    eot_token: u32,
    no_speech_token: u32,
    no_timestamps_token: u32,
    multilingual: bool,
    seed: rand::rngs::StdRng,
}

impl AudioGeneratorPipeline {
    pub fn with_safetensors_model(
        repo: &ApiRepo,
        config_filename: &str,
        tokenizer_filename: &str,
        weights_filename: &str,
        mel_filters_path: &Path,
        seed: rand::rngs::StdRng,
    ) -> Result<Self> {
        let config_path = repo.get(config_filename)?;
        let tokenizer_path = repo.get(tokenizer_filename)?;
        let weights_path = repo.get(weights_filename)?;

        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(Error::msg)?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], whisper::DTYPE, &Device::Cpu)?
        };
        let model = Whisper::load(&vb, config.clone())?;

        let mel_bytes = &*std::fs::read(mel_filters_path)?;
        let mut mel_filters = vec![0f32; mel_bytes.len() / 4];
        <byteorder::LittleEndian as byteorder::ByteOrder>::read_f32_into(
            mel_bytes,
            &mut mel_filters,
        );
        if mel_filters.len() != config.num_mel_bins * MEL_FILTER_WIDTH {
            bail!(
                "mel filter bank at {} does not match a {}-bin model",
                mel_filters_path.display(),
                config.num_mel_bins
            )
        }

        let no_timestamps_token = token_id(&tokenizer, NO_TIMESTAMPS_TOKEN)?;
        // Timestamp decoding is always on, so the no-timestamps marker is
        // suppressed alongside the model's own suppress list.
        let suppress_tokens: Vec<f32> = (0..model.config.vocab_size as u32)
            .map(|i| {
                if model.config.suppress_tokens.contains(&i) || i == no_timestamps_token {
                    f32::NEG_INFINITY
                } else {
                    0f32
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(suppress_tokens.as_slice(), &Device::Cpu)?;

        let sot_token = token_id(&tokenizer, SOT_TOKEN)?;
        let transcribe_token = token_id(&tokenizer, TRANSCRIBE_TOKEN)?;
        let eot_token = token_id(&tokenizer, EOT_TOKEN)?;
        let no_speech_token = NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok());
        let no_speech_token = match no_speech_token {
            None => bail!("Unable to find any non-speech token"),
            Some(n) => n,
        };
        let multilingual = tokenizer.token_to_id("<|en|>").is_some();

        Ok(Self {
            model,
            tokenizer,
            config,
            mel_filters,
            suppress_tokens,
            sot_token,
            transcribe_token,
            eot_token,
            no_speech_token,
            no_timestamps_token,
            multilingual,
            seed,
        })
    }

    /// Runs windowed decoding over the whole input and returns the timed
    /// segments plus the language that was detected or forced.
    pub fn transcribe(
        &mut self,
        input: Box<[u8]>,
        language: &LanguageHint,
    ) -> Result<(Vec<TranscriptSegment>, String)> {
        let mel = self.load_mel(input)?;
        let (_, _, content_frames) = mel.dims3()?;
        let (language_code, language_token) = self.resolve_language(language, &mel)?;

        let mut seek = 0;
        let mut segments = vec![];
        while seek < content_frames {
            let time_offset = (seek * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let segment_size = usize::min(content_frames - seek, whisper::N_FRAMES);
            let mel_segment = mel.narrow(2, seek, segment_size)?;
            let segment_duration = (segment_size * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let dr = self.decode_with_fallback(&mel_segment, language_token)?;
            seek += segment_size;
            if dr.no_speech_prob > NO_SPEECH_THRESHOLD && dr.avg_logprob < LOGPROB_THRESHOLD {
                debug!("no speech detected, skipping {seek} {dr:?}");
                continue;
            }
            self.collect_segments(&mut segments, &dr, time_offset, segment_duration)?;
        }
        Ok((segments, language_code))
    }

    fn resolve_language(
        &mut self,
        hint: &LanguageHint,
        mel: &Tensor,
    ) -> Result<(String, Option<u32>)> {
        match hint {
            LanguageHint::Detect if self.multilingual => {
                let (code, token) = detect_language(&mut self.model, &self.tokenizer, mel)?;
                Ok((code, Some(token)))
            }
            // English-only checkpoints carry no language tokens; detection
            // trivially resolves to english.
            LanguageHint::Detect => Ok(("en".to_string(), None)),
            LanguageHint::Forced(code) if self.multilingual => {
                let Ok(token) = token_id(&self.tokenizer, &format!("<|{code}|>")) else {
                    bail!("language {code} is not supported")
                };
                Ok((code.clone(), Some(token)))
            }
            LanguageHint::Forced(code) if code == "en" => Ok(("en".to_string(), None)),
            LanguageHint::Forced(code) => {
                bail!("model only transcribes english, language {code} is not supported")
            }
        }
    }

    fn collect_segments(
        &self,
        segments: &mut Vec<TranscriptSegment>,
        dr: &DecodingResult,
        time_offset: f64,
        segment_duration: f64,
    ) -> Result<()> {
        let window_start = segments.len();
        let mut tokens_to_decode = vec![];
        let mut prev_timestamp_s = 0f32;
        for &token in &dr.tokens {
            if token == self.sot_token || token == self.eot_token {
                continue;
            }
            // The no_timestamp_token is the last before the timestamp ones.
            if token > self.no_timestamps_token {
                let timestamp_s = (token - self.no_timestamps_token - 1) as f32 * TIMESTAMP_STEP;
                if !tokens_to_decode.is_empty() {
                    let text = self
                        .tokenizer
                        .decode(&tokens_to_decode, true)
                        .map_err(Error::msg)?;
                    push_segment(
                        segments,
                        dr,
                        time_offset + f64::from(prev_timestamp_s),
                        time_offset + f64::from(timestamp_s),
                        text,
                    );
                    tokens_to_decode.clear();
                }
                prev_timestamp_s = timestamp_s;
            } else {
                tokens_to_decode.push(token);
            }
        }
        // Trailing text with no closing timestamp runs to the window end.
        if !tokens_to_decode.is_empty() {
            let text = self
                .tokenizer
                .decode(&tokens_to_decode, true)
                .map_err(Error::msg)?;
            push_segment(
                segments,
                dr,
                time_offset + f64::from(prev_timestamp_s),
                time_offset + segment_duration,
                text,
            );
        }
        if segments.len() == window_start && !dr.text.trim().is_empty() {
            // No timestamp tokens decoded at all; keep the window as one span.
            push_segment(
                segments,
                dr,
                time_offset,
                time_offset + segment_duration,
                dr.text.clone(),
            );
        }
        Ok(())
    }

    fn decode_with_fallback(
        &mut self,
        segment: &Tensor,
        language_token: Option<u32>,
    ) -> Result<DecodingResult> {
        for (i, &t) in TEMPERATURES.iter().enumerate() {
            let dr: Result<DecodingResult> = self.decode(segment, t, language_token);
            if i == TEMPERATURES.len() - 1 {
                return dr;
            }
            // On errors, we try again with a different temperature.
            match dr {
                Ok(dr) => {
                    if dr.avg_logprob >= LOGPROB_THRESHOLD
                        || dr.no_speech_prob > NO_SPEECH_THRESHOLD
                    {
                        return Ok(dr);
                    }
                }
                Err(err) => {
                    error!("Error running at {t}: {err}");
                }
            }
        }
        unreachable!()
    }

    fn decode(
        &mut self,
        mel: &Tensor,
        t: f64,
        language_token: Option<u32>,
    ) -> Result<DecodingResult> {
        let model = &mut self.model;
        let audio_features = model.encoder.forward(mel, true)?;
        debug!("audio features: {:?}", audio_features.dims());

        let sample_len = model.config.max_target_positions / 2;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut tokens = vec![self.sot_token];
        if let Some(language_token) = language_token {
            tokens.push(language_token);
        }
        tokens.push(self.transcribe_token);

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), mel.device())?;

            // The model expects a batch dim but this inference loop does not handle
            // it so we add it at this point.
            let tokens_t = tokens_t.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &audio_features, i == 0)?;

            // Extract the no speech probability on the first iteration by looking at the first
            // token logits and the probability for the according token.
            if i == 0 {
                let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                no_speech_prob = f64::from(
                    softmax(&logits, 0)?
                        .i(self.no_speech_token as usize)?
                        .to_scalar::<f32>()?,
                );
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress_tokens)?;
            let next_token = if t > 0f64 {
                let prs = softmax(&(&logits / t)?, 0)?;
                let logits_v: Vec<f32> = prs.to_vec1()?;
                let distr = rand::distributions::WeightedIndex::new(&logits_v)?;
                u32::try_from(distr.sample(&mut self.seed))?
            } else {
                let logits_v: Vec<f32> = logits.to_vec1()?;
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map_or(self.eot_token, |(i, _)| i as u32)
            };
            tokens.push(next_token);
            let prob = f64::from(
                softmax(&logits, D::Minus1)?
                    .i(next_token as usize)?
                    .to_scalar::<f32>()?,
            );
            if next_token == self.eot_token || tokens.len() > model.config.max_target_positions {
                break;
            }
            sum_logprob += prob.ln();
        }
        let text = self.tokenizer.decode(&tokens, true).map_err(Error::msg)?;
        let avg_logprob = sum_logprob / tokens.len() as f64;

        Ok(DecodingResult {
            tokens,
            text,
            avg_logprob,
            no_speech_prob,
            temperature: t,
        })
    }

    fn load_mel(&self, input: Box<[u8]>) -> Result<Tensor> {
        let cursor = Cursor::new(input);
        let (pcm_data, sample_rate) = pcm_decode(cursor)?;
        if sample_rate != u32::try_from(SAMPLE_RATE)? {
            bail!("Input file must have a {} sampling rate", SAMPLE_RATE)
        }
        debug!("pcm data loaded {}", pcm_data.len());
        let mel = audio::pcm_to_mel(&self.config, &pcm_data, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(
            mel,
            (
                1,
                self.config.num_mel_bins,
                mel_len / self.config.num_mel_bins,
            ),
            &Device::Cpu,
        )?;
        debug!("loaded mel: {:?}", mel.dims());
        Ok(mel)
    }
}

fn push_segment(
    segments: &mut Vec<TranscriptSegment>,
    dr: &DecodingResult,
    start: f64,
    end: f64,
    text: String,
) {
    let text = text.trim().to_string();
    if text.is_empty() {
        return;
    }
    segments.push(TranscriptSegment {
        start,
        end,
        text,
        temperature: dr.temperature,
        avg_logprob: dr.avg_logprob,
        no_speech_prob: dr.no_speech_prob,
    });
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DecodingResult {
    tokens: Vec<u32>,
    text: String,
    avg_logprob: f64,
    no_speech_prob: f64,
    temperature: f64,
}

pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    match tokenizer.token_to_id(token) {
        None => bail!("no token-id for {token}"),
        Some(id) => Ok(id),
    }
}
