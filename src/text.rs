use anyhow::{Error as E, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    build_clip_transformer, clip::ClipTextTransformer, StableDiffusionConfig,
};
use tokenizers::Tokenizer;

use crate::{
    model::{ModelFile, StableDiffusionVersion},
    CaatError,
};

/// Frozen tokenizer + CLIP text encoder producing the UNet conditioning.
pub struct PromptEncoder {
    tokenizer: Tokenizer,
    pad_id: u32,
    max_len: usize,
    text_model: ClipTextTransformer,
    device: Device,
    dtype: DType,
}

impl PromptEncoder {
    pub fn new(
        tokenizer: Option<String>,
        clip_weights: Option<String>,
        sd_version: StableDiffusionVersion,
        sd_config: &StableDiffusionConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let tokenizer = ModelFile::Tokenizer.get(tokenizer, sd_version, false)?;
        let tokenizer = Tokenizer::from_file(tokenizer).map_err(E::msg)?;
        let pad_token = sd_config
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .ok_or_else(|| CaatError::MissingToken(pad_token.clone()))?;

        tracing::info!("building the clip transformer");
        let clip_weights = ModelFile::Clip.get(clip_weights, sd_version, false)?;
        let text_model = build_clip_transformer(&sd_config.clip, clip_weights, device, DType::F32)?;
        Ok(Self {
            tokenizer,
            pad_id,
            max_len: sd_config.clip.max_position_embeddings,
            text_model,
            device: device.clone(),
            dtype,
        })
    }

    pub fn tokens(&self, prompt: &str) -> Result<Vec<u32>> {
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        Ok(pad_tokens(tokens, self.pad_id, self.max_len))
    }

    /// `(n, max_len, hidden)` embeddings, one row per prompt.
    pub fn encode(&self, prompts: &[String]) -> Result<Tensor> {
        let embeddings = prompts
            .iter()
            .map(|prompt| {
                let tokens = self.tokens(prompt)?;
                let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
                Ok(self.text_model.forward(&tokens)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&embeddings, 0)?.to_dtype(self.dtype)?)
    }

    /// Unconditional then conditional embeddings, for classifier-free guidance.
    pub fn encode_guided(&self, prompt: &str, uncond_prompt: &str) -> Result<Tensor> {
        self.encode(&[uncond_prompt.to_string(), prompt.to_string()])
    }
}

/// Truncates or pads to exactly `max_len` tokens.
pub fn pad_tokens(mut tokens: Vec<u32>, pad_id: u32, max_len: usize) -> Vec<u32> {
    tokens.truncate(max_len);
    while tokens.len() < max_len {
        tokens.push(pad_id)
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_short_prompts() {
        assert_eq!(pad_tokens(vec![1, 2], 0, 4), [1, 2, 0, 0]);
    }

    #[test]
    fn truncates_long_prompts() {
        assert_eq!(pad_tokens((0..100).collect(), 7, 77).len(), 77);
    }
}
