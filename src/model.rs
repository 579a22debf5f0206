use std::path::PathBuf;

use anyhow::Result;
use candle_transformers::models::stable_diffusion::{
    unet_2d::{BlockConfig, UNet2DConditionModelConfig},
    StableDiffusionConfig,
};
use clap::ValueEnum;
use hf_hub::api::sync::Api;

use crate::noise::PredictionType;

/// Latent channels of the stable diffusion VAE.
pub const LATENT_CHANNELS: usize = 4;
/// Spatial down-scaling between pixels and latents.
pub const VAE_SCALE: usize = 8;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    V2_1,
}

impl StableDiffusionVersion {
    pub fn repo(&self) -> &'static str {
        match self {
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
            Self::V1_5 => "runwayml/stable-diffusion-v1-5",
        }
    }

    pub fn unet_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "unet/diffusion_pytorch_model.fp16.safetensors"
        } else {
            "unet/diffusion_pytorch_model.safetensors"
        }
    }

    pub fn vae_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "vae/diffusion_pytorch_model.fp16.safetensors"
        } else {
            "vae/diffusion_pytorch_model.safetensors"
        }
    }

    pub fn clip_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "text_encoder/model.fp16.safetensors"
        } else {
            "text_encoder/model.safetensors"
        }
    }

    /// 1.5 is trained to predict the noise, 2.1 (768px) the velocity.
    pub fn prediction_type(&self) -> PredictionType {
        match self {
            Self::V1_5 => PredictionType::Epsilon,
            Self::V2_1 => PredictionType::VPrediction,
        }
    }

    pub fn vae_scaling_factor(&self) -> f64 {
        0.18215
    }

    pub fn sd_config(
        &self,
        sliced_attention_size: Option<usize>,
        resolution: usize,
    ) -> StableDiffusionConfig {
        let (height, width) = (Some(resolution), Some(resolution));
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, height, width),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, height, width),
        }
    }

    /// The UNet layout, needed to build the model through a custom var-builder.
    pub fn unet_config(&self, sliced_attention_size: Option<usize>) -> UNet2DConditionModelConfig {
        let bc = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        let (blocks, cross_attention_dim, use_linear_projection) = match self {
            Self::V1_5 => (
                vec![
                    bc(320, Some(1), 8),
                    bc(640, Some(1), 8),
                    bc(1280, Some(1), 8),
                    bc(1280, None, 8),
                ],
                768,
                false,
            ),
            Self::V2_1 => (
                vec![
                    bc(320, Some(1), 5),
                    bc(640, Some(1), 10),
                    bc(1280, Some(1), 20),
                    bc(1280, None, 20),
                ],
                1024,
                true,
            ),
        };
        UNet2DConditionModelConfig {
            blocks,
            center_input_sample: false,
            cross_attention_dim,
            downsample_padding: 1,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            layers_per_block: 2,
            mid_block_scale_factor: 1.,
            norm_eps: 1e-5,
            norm_num_groups: 32,
            sliced_attention_size,
            use_linear_projection,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    Tokenizer,
    Clip,
    Unet,
    Vae,
}

impl ModelFile {
    pub fn get(
        &self,
        filename: Option<String>,
        version: StableDiffusionVersion,
        use_f16: bool,
    ) -> Result<PathBuf> {
        match filename {
            Some(filename) => Ok(PathBuf::from(filename)),
            None => {
                let (repo, path) = match self {
                    // Both versions share the vocabulary, 2.1 only differs in its padding token.
                    Self::Tokenizer => ("openai/clip-vit-base-patch32", "tokenizer.json"),
                    Self::Clip => (version.repo(), version.clip_file(use_f16)),
                    Self::Unet => (version.repo(), version.unet_file(use_f16)),
                    Self::Vae => (version.repo(), version.vae_file(use_f16)),
                };
                tracing::info!(repo, path, "fetching weights from the hub");
                let filename = Api::new()?.model(repo.to_string()).get(path)?;
                Ok(filename)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_files_skip_the_hub() {
        let path = ModelFile::Unet
            .get(Some("weights/unet.safetensors".to_string()), StableDiffusionVersion::V1_5, false)
            .unwrap();
        assert_eq!(path, PathBuf::from("weights/unet.safetensors"));
    }

    #[test]
    fn unet_layouts_match_the_released_checkpoints() {
        let v1 = StableDiffusionVersion::V1_5.unet_config(None);
        assert_eq!(v1.cross_attention_dim, 768);
        assert!(!v1.use_linear_projection);
        assert_eq!(v1.blocks.len(), 4);
        assert!(v1.blocks[3].use_cross_attn.is_none());

        let v2 = StableDiffusionVersion::V2_1.unet_config(Some(0));
        assert_eq!(v2.cross_attention_dim, 1024);
        assert!(v2.use_linear_projection);
        assert_eq!(v2.sliced_attention_size, Some(0));
        assert_eq!(
            StableDiffusionVersion::V2_1.prediction_type(),
            PredictionType::VPrediction
        );
    }

    #[test]
    fn sd_config_uses_the_training_resolution() {
        let config = StableDiffusionVersion::V1_5.sd_config(None, 256);
        assert_eq!(config.height, 256);
        assert_eq!(config.width, 256);
    }
}
