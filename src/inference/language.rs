use anyhow::{bail, Result};
use candle_core::{IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_transformers::models::whisper;
use candle_transformers::models::whisper::model::Whisper;
use candle_transformers::models::whisper::SOT_TOKEN;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::inference::audio_pipeline::token_id;

/// Language codes carrying a `<|xx|>` token in multilingual Whisper
/// tokenizers, in the model's own vocabulary order.
pub const LANGUAGE_CODES: [&str; 99] = [
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

/// Picks the most probable spoken language by scoring the language tokens
/// against the first decoder step over the opening audio window. Returns the
/// language code and its token id.
pub fn detect_language(
    model: &mut Whisper,
    tokenizer: &Tokenizer,
    mel: &Tensor,
) -> Result<(String, u32)> {
    let (_, _, content_frames) = mel.dims3()?;
    let mel = mel.narrow(2, 0, usize::min(content_frames, whisper::N_FRAMES))?;
    let device = mel.device();

    let candidates: Vec<(&str, u32)> = LANGUAGE_CODES
        .iter()
        .filter_map(|code| {
            tokenizer
                .token_to_id(&format!("<|{code}|>"))
                .map(|id| (*code, id))
        })
        .collect();
    if candidates.is_empty() {
        bail!("tokenizer has no language tokens, model cannot auto-detect")
    }

    let sot_token = token_id(tokenizer, SOT_TOKEN)?;
    let audio_features = model.encoder.forward(&mel, true)?;
    let tokens = Tensor::new(&[[sot_token]], device)?;
    let ys = model.decoder.forward(&tokens, &audio_features, true)?;
    let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;

    let token_ids: Vec<u32> = candidates.iter().map(|(_, id)| *id).collect();
    let language_logits = logits.index_select(&Tensor::new(token_ids.as_slice(), device)?, 0)?;
    let probs = softmax(&language_logits, D::Minus1)?.to_vec1::<f32>()?;

    let Some((index, prob)) = probs
        .iter()
        .enumerate()
        .max_by(|(_, u), (_, v)| u.total_cmp(v))
    else {
        bail!("no language probabilities produced")
    };
    let (code, token) = candidates[index];
    debug!(language = code, probability = prob, "language detected");
    Ok((code.to_string(), token))
}
