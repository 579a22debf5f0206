pub mod adapter;
pub mod checkpoint;
pub mod concepts;
pub mod dataset;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod noise;
pub mod pgd;
pub mod restore;
pub mod sample;
pub mod schedule;
pub mod text;
pub mod train;
pub mod unet;
pub mod utils;

use std::path::PathBuf;

use adapter::FreezeModel;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use model::StableDiffusionVersion;
use schedule::LrScheduleKind;
use thiserror::Error;
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::{filter::LevelFilter, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt};

const GUIDANCE_SCALE: f64 = 7.5;

#[derive(Error, Debug)]
pub enum CaatError {
    #[error("{0}")]
    String(&'static str),
    #[error("{0}")]
    Owned(String),
    #[error("no instance images found in {0}")]
    EmptyInstanceDir(PathBuf),
    #[error("token {0:?} missing from the tokenizer vocabulary")]
    MissingToken(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum MixedPrecision {
    #[default]
    No,
    Fp16,
    Bf16,
}

impl MixedPrecision {
    pub fn dtype(&self) -> candle_core::DType {
        match self {
            Self::No => candle_core::DType::F32,
            Self::Fp16 => candle_core::DType::F16,
            Self::Bf16 => candle_core::DType::BF16,
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "CAAT training script.", long_about = None)]
pub struct Args {
    /// PGD step size.
    #[arg(long, default_value_t = 5e-3)]
    pub alpha: f64,

    /// PGD L-infinity radius, in the [-1, 1] pixel range.
    #[arg(long, default_value_t = 0.1)]
    pub eps: f64,

    #[arg(long, value_enum, default_value = "v1-5")]
    pub sd_version: StableDiffusionVersion,

    /// The UNet weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    pub unet_weights: Option<String>,

    /// The CLIP weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    pub clip_weights: Option<String>,

    /// The VAE weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    pub vae_weights: Option<String>,

    #[arg(long, value_name = "FILE")]
    /// The file specifying the tokenizer to used for tokenization.
    pub tokenizer: Option<String>,

    /// A folder containing the instance images.
    #[arg(long, value_name = "DIR")]
    pub instance_data_dir: Option<PathBuf>,

    /// The prompt with identifier specifying the instance.
    #[arg(long)]
    pub instance_prompt: Option<String>,

    /// A folder containing the class images.
    #[arg(long, value_name = "DIR")]
    pub class_data_dir: Option<PathBuf>,

    /// The prompt to specify images in the same class as the instance images.
    #[arg(long)]
    pub class_prompt: Option<String>,

    /// Add the prior preservation loss.
    #[arg(long)]
    pub with_prior_preservation: bool,

    #[arg(long, default_value_t = 1.0)]
    pub prior_loss_weight: f64,

    /// Minimal class images for prior preservation, missing ones are sampled
    /// with the class prompt.
    #[arg(long, default_value_t = 200)]
    pub num_class_images: usize,

    /// Number of denoising steps when sampling class images.
    #[arg(long, default_value_t = 50)]
    pub class_sampling_steps: usize,

    /// Batch size for sampling class images.
    #[arg(long, default_value_t = 4)]
    pub sample_batch_size: usize,

    #[arg(long, value_name = "DIR", default_value = "outputs")]
    pub output_dir: PathBuf,

    /// Metrics directory, relative to the output directory.
    #[arg(long, value_name = "DIR", default_value = "logs")]
    pub logging_dir: PathBuf,

    #[arg(long, default_value_t = 1042)]
    pub seed: u64,

    /// Resolution of the training images.
    #[arg(long, default_value_t = 512)]
    pub resolution: usize,

    /// Center crop instead of random crop.
    #[arg(long)]
    pub center_crop: bool,

    #[arg(long, default_value_t = 250)]
    pub max_train_steps: usize,

    /// Save the perturbed images every X steps.
    #[arg(long, default_value_t = 250)]
    pub checkpointing_steps: usize,

    /// Max number of checkpoint directories to keep.
    #[arg(long)]
    pub checkpoints_total_limit: Option<usize>,

    #[arg(long, default_value_t = 1e-5)]
    pub learning_rate: f64,

    #[arg(long, value_enum, default_value = "crossattn-kv")]
    pub freeze_model: FreezeModel,

    #[arg(long, value_enum, default_value = "constant")]
    pub lr_scheduler: LrScheduleKind,

    #[arg(long, default_value_t = 500)]
    pub lr_warmup_steps: usize,

    /// Hard restarts for the cosine_with_restarts schedule.
    #[arg(long, default_value_t = 1)]
    pub lr_num_cycles: usize,

    /// Power factor of the polynomial schedule.
    #[arg(long, default_value_t = 1.0)]
    pub lr_power: f64,

    #[arg(long, default_value_t = 0.9)]
    pub adam_beta1: f64,

    #[arg(long, default_value_t = 0.999)]
    pub adam_beta2: f64,

    #[arg(long, default_value_t = 1e-2)]
    pub adam_weight_decay: f64,

    #[arg(long, default_value_t = 1e-8)]
    pub adam_epsilon: f64,

    #[arg(long, default_value_t = 1.0)]
    pub max_grad_norm: f64,

    #[arg(long, value_enum, default_value = "no")]
    pub mixed_precision: MixedPrecision,

    /// Path to a json list of concepts, overrides the instance/class flags.
    #[arg(long, value_name = "FILE")]
    pub concepts_list: Option<PathBuf>,

    /// Apply horizontal flip data augmentation.
    #[arg(long)]
    pub hflip: bool,

    /// Disable the resize augmentation used to build the loss masks.
    #[arg(long)]
    pub noaug: bool,

    /// Condition each image on the prompt matching its augmentation scale.
    #[arg(long)]
    pub augment_prompts: bool,

    /// A safetensors file with a `random_mask` tensor, ones mark pixels that
    /// must stay untouched.
    #[arg(long, value_name = "FILE")]
    pub input_mask: Option<PathBuf>,

    /// Probability of routing a step through the restoration network.
    #[arg(long, default_value_t = 0.5)]
    pub restore_prob: f64,

    /// Down/up sampling factor of the resampling restorer, 1 disables it.
    #[arg(long, default_value_t = 2)]
    pub restore_factor: usize,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    pub cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    pub tracing: bool,

    /// The size of the sliced attention or 0 for automatic slicing (disabled by default)
    #[arg(long)]
    pub sliced_attention_size: Option<usize>,
}

impl Args {
    pub fn check(&self) -> Result<()> {
        if !(self.eps > 0.) {
            anyhow::bail!(CaatError::Config(format!("eps should be positive, got {}", self.eps)))
        }
        if !(self.alpha > 0.) {
            anyhow::bail!(CaatError::Config(format!(
                "alpha should be positive, got {}",
                self.alpha
            )))
        }
        let rp = self.restore_prob;
        if !(0. ..=1.).contains(&rp) {
            anyhow::bail!(CaatError::Config(format!(
                "restore-prob should be between 0 and 1, got {rp}"
            )))
        }
        if self.resolution == 0 || self.resolution % 8 != 0 {
            anyhow::bail!(CaatError::Config(format!(
                "resolution should be a positive multiple of 8, got {}",
                self.resolution
            )))
        }
        if self.checkpointing_steps == 0 {
            anyhow::bail!(CaatError::String("checkpointing-steps should be positive"))
        }
        if self.restore_factor == 0 || self.resolution % self.restore_factor != 0 {
            anyhow::bail!(CaatError::Config(format!(
                "restore-factor {} should divide the resolution {}",
                self.restore_factor, self.resolution
            )))
        }

        if self.with_prior_preservation {
            if self.concepts_list.is_none() {
                if self.class_data_dir.is_none() {
                    anyhow::bail!(CaatError::String(
                        "you must specify a data directory for class images"
                    ))
                }
                if self.class_prompt.is_none() {
                    anyhow::bail!(CaatError::String("you must specify prompt for class images"))
                }
            }
        } else {
            if self.class_data_dir.is_some() {
                tracing::warn!("you need not use --class-data-dir without --with-prior-preservation");
            }
            if self.class_prompt.is_some() {
                tracing::warn!("you need not use --class-prompt without --with-prior-preservation");
            }
        }
        if self.concepts_list.is_none() {
            if self.instance_data_dir.is_none() {
                anyhow::bail!(CaatError::String("you must specify an instance data directory"))
            }
            if self.instance_prompt.is_none() {
                anyhow::bail!(CaatError::String("you must specify an instance prompt"))
            }
        }

        Ok(())
    }

    /// The learning rate doubles when the class images share the batch.
    pub fn effective_learning_rate(&self) -> f64 {
        if self.with_prior_preservation {
            self.learning_rate * 2.0
        } else {
            self.learning_rate
        }
    }
}

/// Installs the fmt subscriber, plus the chrome layer when `tracing` is set.
/// The returned guard flushes the trace file when dropped.
pub fn init_logging(tracing: bool) -> Option<FlushGuard> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let registry = tracing_subscriber::registry()
        .with(LevelFilter::INFO)
        .with(fmt_layer);
    if tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        registry.with(chrome_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from([
            "caat",
            "--instance-data-dir",
            "data/instance",
            "--instance-prompt",
            "a photo of sks person",
        ])
    }

    #[test]
    fn defaults_follow_the_training_script() {
        let args = base_args();
        assert_eq!(args.alpha, 5e-3);
        assert_eq!(args.eps, 0.1);
        assert_eq!(args.seed, 1042);
        assert_eq!(args.resolution, 512);
        assert_eq!(args.max_train_steps, 250);
        assert_eq!(args.freeze_model, FreezeModel::CrossattnKv);
        assert_eq!(args.lr_scheduler, LrScheduleKind::Constant);
        assert!(args.check().is_ok());
    }

    #[test]
    fn prior_preservation_requires_class_data() {
        let mut args = base_args();
        args.with_prior_preservation = true;
        assert!(args.check().is_err());
        args.class_data_dir = Some("data/class".into());
        assert!(args.check().is_err());
        args.class_prompt = Some("a photo of a person".to_string());
        assert!(args.check().is_ok());
        assert_eq!(args.effective_learning_rate(), 2e-5);
    }

    #[test]
    fn rejects_bad_pgd_bounds() {
        let mut args = base_args();
        args.eps = 0.;
        assert!(args.check().is_err());
        let mut args = base_args();
        args.alpha = -1.;
        assert!(args.check().is_err());
        let mut args = base_args();
        args.restore_prob = 1.5;
        assert!(args.check().is_err());
        let mut args = base_args();
        args.resolution = 500;
        assert!(args.check().is_err());
    }

    #[test]
    fn value_enums_parse_from_kebab_case() {
        let args = Args::parse_from([
            "caat",
            "--concepts-list",
            "concepts.json",
            "--freeze-model",
            "crossattn",
            "--lr-scheduler",
            "cosine-with-restarts",
            "--mixed-precision",
            "bf16",
            "--sd-version",
            "v2-1",
        ]);
        assert_eq!(args.freeze_model, FreezeModel::Crossattn);
        assert_eq!(args.lr_scheduler, LrScheduleKind::CosineWithRestarts);
        assert_eq!(args.mixed_precision.dtype(), candle_core::DType::BF16);
        assert_eq!(args.sd_version, StableDiffusionVersion::V2_1);
        assert!(args.check().is_ok());
    }
}
