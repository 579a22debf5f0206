//! The adversarial training loop.
//!
//! Each step runs a single forward/backward pass through the (optionally
//! restored) perturbed images, the frozen VAE and the UNet. The gradient is
//! then used twice: AdamW descends on the cross-attention adapters while a
//! signed step ascends on the images, projected back into the eps-ball.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    adapter::{build_unet_with_adapters, CustomDiffusionLayers},
    checkpoint::Checkpointer,
    concepts::{concepts_from_args, Concept},
    dataset::{CustomDiffusionDataset, DatasetConfig},
    loss::denoising_loss,
    metrics::{MetricsLog, StepMetrics},
    model::{ModelFile, VAE_SCALE},
    noise::{NoiseSchedule, PredictionType},
    pgd::{linf_distance, PgdConfig},
    restore::{Identity, RandomRestore, Resample, Restorer},
    sample::ClassImageSampler,
    schedule::LrSchedule,
    text::PromptEncoder,
    unet::UNet,
    utils::device,
    Args, CaatError,
};

/// Maps `[-1, 1]` images to scaled latents.
pub trait LatentEncoder {
    fn encode(&self, images: &Tensor) -> Result<Tensor>;
}

/// The frozen VAE encoder, sampling from the latent distribution.
pub struct VaeEncoder {
    vae: AutoEncoderKL,
    scale: f64,
    dtype: DType,
}

impl LatentEncoder for VaeEncoder {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let latents = self.vae.encode(&images.to_dtype(self.dtype)?)?.sample()?;
        Ok((latents * self.scale)?)
    }
}

/// Class images paired one-to-one with the instances, plus their prompt
/// embeddings.
pub struct PriorBatch {
    pub images: Tensor,
    pub embeddings: Tensor,
}

pub struct Models {
    pub encoder: Box<dyn LatentEncoder>,
    pub unet: UNet,
    pub layers: CustomDiffusionLayers,
    pub prediction_type: PredictionType,
}

/// The images under attack and their fixed conditioning.
pub struct Batch {
    /// `(n, 3, R, R)` in `[-1, 1]`.
    pub original: Tensor,
    /// `(n, 1, R/8, R/8)` loss masks.
    pub mask: Tensor,
    /// Instance conditioning, `(n, seq, hidden)`.
    pub embeddings: Tensor,
    pub prior: Option<PriorBatch>,
    pub allowed: Option<Tensor>,
    /// Source paths, used to name the checkpointed images.
    pub sources: Vec<PathBuf>,
}

pub struct Trainer {
    encoder: Box<dyn LatentEncoder>,
    unet: UNet,
    layers: CustomDiffusionLayers,
    optimizer: AdamW,
    lr_schedule: LrSchedule,
    noise: NoiseSchedule,
    prediction_type: PredictionType,
    embeddings: Tensor,
    prior: Option<PriorBatch>,
    prior_loss_weight: f64,
    perturbed: Var,
    original: Tensor,
    mask: Tensor,
    allowed: Option<Tensor>,
    pgd: PgdConfig,
    restore: RandomRestore,
    max_grad_norm: f64,
    max_train_steps: usize,
    sources: Vec<PathBuf>,
    checkpointer: Checkpointer,
    metrics: MetricsLog,
    rng: StdRng,
}

impl Trainer {
    pub fn new(args: Args) -> Result<Self> {
        args.check()?;
        let mut rng = StdRng::seed_from_u64(args.seed);
        let concepts = concepts_from_args(&args)?;
        let device = device(args.cpu)?;
        let dtype = args.mixed_precision.dtype();
        let use_f16 = dtype == DType::F16;
        let sd_config = args
            .sd_version
            .sd_config(args.sliced_attention_size, args.resolution);

        let text = PromptEncoder::new(
            args.tokenizer.clone(),
            args.clip_weights.clone(),
            args.sd_version,
            &sd_config,
            &device,
            dtype,
        )?;

        tracing::info!("building the autoencoder");
        let vae_weights = ModelFile::Vae.get(args.vae_weights.clone(), args.sd_version, use_f16)?;
        let vae = sd_config.build_vae(vae_weights, &device, dtype)?;

        tracing::info!("building the unet");
        let unet_weights =
            ModelFile::Unet.get(args.unet_weights.clone(), args.sd_version, use_f16)?;
        let (unet, layers) = build_unet_with_adapters(
            unet_weights,
            &args.sd_version.unet_config(args.sliced_attention_size),
            args.freeze_model,
            &device,
            dtype,
        )?;
        if layers.is_empty() {
            anyhow::bail!(CaatError::String(
                "no cross-attention weights found in the unet checkpoint"
            ))
        }
        let vae_scale = args.sd_version.vae_scaling_factor();

        if args.with_prior_preservation {
            let sampler = ClassImageSampler {
                n_steps: args.class_sampling_steps,
                vae_scale,
                sd_config: &sd_config,
                text: &text,
                vae: &vae,
                unet: &unet,
                device: &device,
                dtype,
            };
            generate_class_images(&sampler, &concepts, &args)?;
        }

        let dataset = CustomDiffusionDataset::new(
            &concepts,
            DatasetConfig {
                size: args.resolution,
                mask_size: args.resolution / VAE_SCALE,
                center_crop: args.center_crop,
                hflip: args.hflip,
                aug: !args.noaug,
                with_prior_preservation: args.with_prior_preservation,
                num_class_images: args.num_class_images,
            },
            &mut rng,
        )?;

        // Prepare for PGD
        let original = dataset
            .instance_batch(&mut rng)?
            .to_device(&device)?
            .to_dtype(DType::F32)?;
        let (mask, augmented_prompts) = dataset.instance_masks(&mut rng)?;
        let prompts: Vec<String> = if args.augment_prompts {
            augmented_prompts
        } else {
            dataset
                .instance_images()
                .iter()
                .map(|(_, prompt)| prompt.clone())
                .collect()
        };
        let prior = if args.with_prior_preservation {
            Some(prior_batch(&dataset, &text, &device, &mut rng)?)
        } else {
            None
        };
        let allowed = match &args.input_mask {
            Some(path) => Some(load_allowed_mask(path, &original, &device)?),
            None => None,
        };
        let batch = Batch {
            mask: mask.to_device(&device)?,
            embeddings: text.encode(&prompts)?,
            prior,
            allowed,
            sources: dataset
                .instance_images()
                .iter()
                .map(|(path, _)| path.clone())
                .collect(),
            original,
        };
        let models = Models {
            encoder: Box::new(VaeEncoder {
                vae,
                scale: vae_scale,
                dtype,
            }),
            unet,
            layers,
            prediction_type: args.sd_version.prediction_type(),
        };
        Self::from_parts(&args, models, batch, rng)
    }

    /// Sets up the optimizer, schedules and outputs around built models.
    pub fn from_parts(args: &Args, models: Models, batch: Batch, rng: StdRng) -> Result<Self> {
        let lr = args.effective_learning_rate();
        let optimizer = AdamW::new(
            models.layers.vars(),
            ParamsAdamW {
                lr,
                beta1: args.adam_beta1,
                beta2: args.adam_beta2,
                eps: args.adam_epsilon,
                weight_decay: args.adam_weight_decay,
            },
        )?;
        let lr_schedule = LrSchedule::new(
            args.lr_scheduler,
            lr,
            args.lr_warmup_steps,
            args.max_train_steps,
        )
        .with_cycles(args.lr_num_cycles)
        .with_power(args.lr_power);

        let restorer: Box<dyn Restorer> = if args.restore_factor > 1 {
            Box::new(Resample::new(args.restore_factor))
        } else {
            Box::new(Identity)
        };
        let restore = RandomRestore::new(restorer, args.restore_prob);

        std::fs::create_dir_all(&args.output_dir)
            .with_context(|| format!("creating {}", args.output_dir.display()))?;
        let metrics = MetricsLog::create(&args.output_dir.join(&args.logging_dir))?;
        let checkpointer = Checkpointer::new(
            args.output_dir.clone(),
            args.checkpointing_steps,
            args.checkpoints_total_limit,
        );

        Ok(Self {
            encoder: models.encoder,
            unet: models.unet,
            layers: models.layers,
            optimizer,
            lr_schedule,
            noise: NoiseSchedule::default(),
            prediction_type: models.prediction_type,
            embeddings: batch.embeddings,
            prior: batch.prior,
            prior_loss_weight: args.prior_loss_weight,
            perturbed: Var::from_tensor(&batch.original)?,
            original: batch.original,
            mask: batch.mask,
            allowed: batch.allowed,
            pgd: PgdConfig::new(args.alpha, args.eps),
            restore,
            max_grad_norm: args.max_grad_norm,
            max_train_steps: args.max_train_steps,
            sources: batch.sources,
            checkpointer,
            metrics,
            rng,
        })
    }

    pub fn perturbed(&self) -> &Tensor {
        self.perturbed.as_tensor()
    }

    pub async fn run(mut self) -> Result<()> {
        let n = self.original.dim(0)?;
        tracing::info!("***** Running training *****");
        tracing::info!("  Num perturbed images = {n}");
        tracing::info!("  Adapter parameters = {}", self.layers.num_parameters());
        tracing::info!("  Restorer = {}", self.restore.restorer_name());
        tracing::info!("  Total optimization steps = {}", self.max_train_steps);

        let progress = ProgressBar::new(self.max_train_steps as u64);
        progress.set_style(ProgressStyle::with_template(
            "Steps {bar:40} {pos}/{len} [{elapsed_precise}] {msg}",
        )?);
        for global_step in 1..=self.max_train_steps {
            let metrics = self.step(global_step)?;
            self.metrics.log(&metrics)?;
            progress.set_message(format!("loss={:.4} lr={:.2e}", metrics.loss, metrics.lr));
            progress.inc(1);

            if self.checkpointer.is_due(global_step, self.max_train_steps) {
                self.metrics.flush()?;
                self.checkpointer
                    .save(
                        global_step,
                        self.perturbed.as_tensor(),
                        &self.sources,
                        Some(&self.layers),
                    )
                    .await?;
            }
        }
        progress.finish();
        self.metrics.flush()?;
        Ok(())
    }

    /// One adapter update and one PGD update; `global_step` starts at 1.
    pub fn step(&mut self, global_step: usize) -> Result<StepMetrics> {
        let lr = self.lr_schedule.lr_at(global_step - 1);
        self.optimizer.set_learning_rate(lr);
        let instances = self.original.dim(0)?;

        let (images, restored) = self
            .restore
            .apply(self.perturbed.as_tensor(), &mut self.rng)?;
        let (images, embeddings) = match &self.prior {
            Some(prior) => (
                Tensor::cat(&[&images, &prior.images], 0)?,
                Tensor::cat(&[&self.embeddings, &prior.embeddings], 0)?,
            ),
            None => (images, self.embeddings.clone()),
        };

        // Convert images to latent space
        let latents = self.encoder.encode(&images)?;

        let noise = latents.randn_like(0., 1.)?;
        let bsz = latents.dim(0)?;
        let timesteps = self.noise.sample_timesteps(&mut self.rng, bsz);
        let noisy_latents = self.noise.add_noise(&latents, &noise, &timesteps)?;
        let t = Tensor::from_vec(
            timesteps.iter().map(|&t| t as f32).collect::<Vec<_>>(),
            bsz,
            latents.device(),
        )?;

        let model_pred = self.unet.forward_t(&noisy_latents, &t, &embeddings)?;
        let target = self
            .noise
            .target(self.prediction_type, &latents, &noise, &timesteps)?;

        let loss = denoising_loss(
            &model_pred,
            &target,
            &self.mask,
            instances,
            self.prior_loss_weight,
        )?;
        let mut grads = loss.backward()?;
        self.layers.clip_grad_norm(&mut grads, self.max_grad_norm)?;

        let grad = grads
            .get(self.perturbed.as_tensor())
            .ok_or(CaatError::String("no gradient reached the perturbed images"))?
            .to_dtype(DType::F32)?;
        self.pgd
            .step(&self.perturbed, &self.original, &grad, self.allowed.as_ref())?;
        self.optimizer.step(&grads)?;

        Ok(StepMetrics {
            step: global_step,
            loss: loss.to_dtype(DType::F32)?.to_scalar::<f32>()?,
            lr,
            linf: linf_distance(self.perturbed.as_tensor(), &self.original)?,
            restored,
        })
    }
}

/// Samples missing class images into every concept's class directory. Class
/// lists given as files are used as they are.
fn generate_class_images(
    sampler: &ClassImageSampler,
    concepts: &[Concept],
    args: &Args,
) -> Result<()> {
    for concept in concepts {
        let (Some(dir), Some(prompt)) = (&concept.class_data_dir, &concept.class_prompt) else {
            continue;
        };
        if dir.exists() && !dir.is_dir() {
            continue;
        }
        sampler.fill_dir(dir, prompt, args.num_class_images, args.sample_batch_size)?;
    }
    Ok(())
}

fn prior_batch(
    dataset: &CustomDiffusionDataset,
    text: &PromptEncoder,
    device: &Device,
    rng: &mut StdRng,
) -> Result<PriorBatch> {
    let n = dataset.instance_images().len();
    let mut images = Vec::with_capacity(n);
    let mut prompts = Vec::with_capacity(n);
    for index in 0..n {
        let example = dataset.class_example(index, rng)?;
        images.push(example.image);
        prompts.push(example.prompt);
    }
    Ok(PriorBatch {
        images: Tensor::stack(&images, 0)?.to_device(device)?,
        embeddings: text.encode(&prompts)?,
    })
}

/// Reads `random_mask` from a safetensors file. Ones mark pixels that must
/// keep their original value, the returned tensor is its complement.
pub fn load_allowed_mask(path: &Path, images: &Tensor, device: &Device) -> Result<Tensor> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("loading input mask {}", path.display()))?;
    let mask = tensors.get("random_mask").ok_or_else(|| {
        CaatError::Owned(format!("{} has no `random_mask` tensor", path.display()))
    })?;
    let allowed = mask.to_dtype(DType::F32)?.affine(-1., 1.)?;
    allowed.broadcast_as(images.shape()).with_context(|| {
        format!(
            "input mask {:?} does not broadcast to the images {:?}",
            allowed.shape(),
            images.shape()
        )
    })?;
    Ok(allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::{FreezeModel, ADAPTER_FILE},
        unet::tests::{tiny_config, write_tiny_unet, CONTEXT_DIM},
        utils::noise_filename,
    };
    use clap::Parser;
    use std::collections::HashMap;

    /// 8x average pooling plus a mean channel, in place of the VAE.
    struct PoolEncoder;

    impl LatentEncoder for PoolEncoder {
        fn encode(&self, images: &Tensor) -> Result<Tensor> {
            let pooled = images.avg_pool2d(8)?;
            Ok(Tensor::cat(&[&pooled, &pooled.mean_keepdim(1)?], 1)?)
        }
    }

    const N: usize = 2;
    const RES: usize = 64;

    fn tiny_trainer(dir: &Path, extra: &[&str], with_prior: bool) -> Result<Trainer> {
        let device = Device::Cpu;
        let output_dir = dir.join("out");
        let mut argv = vec![
            "caat".to_string(),
            "--output-dir".to_string(),
            output_dir.display().to_string(),
            "--learning-rate".to_string(),
            "1e-3".to_string(),
            "--eps".to_string(),
            "0.05".to_string(),
            "--alpha".to_string(),
            "0.01".to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        let args = Args::parse_from(argv);

        let weights = dir.join("unet.safetensors");
        write_tiny_unet(&weights)?;
        let (unet, layers) = build_unet_with_adapters(
            &weights,
            &tiny_config(),
            FreezeModel::CrossattnKv,
            &device,
            DType::F32,
        )?;
        let models = Models {
            encoder: Box::new(PoolEncoder),
            unet,
            layers,
            prediction_type: PredictionType::Epsilon,
        };
        let prior = if with_prior {
            Some(PriorBatch {
                images: Tensor::rand(-1f32, 1., (N, 3, RES, RES), &device)?,
                embeddings: Tensor::randn(0f32, 1., (N, 3, CONTEXT_DIM), &device)?,
            })
        } else {
            None
        };
        let batch = Batch {
            original: Tensor::rand(-0.9f32, 0.9, (N, 3, RES, RES), &device)?,
            mask: Tensor::ones((N, 1, RES / 8, RES / 8), DType::F32, &device)?,
            embeddings: Tensor::randn(0f32, 1., (N, 3, CONTEXT_DIM), &device)?,
            prior,
            allowed: None,
            sources: vec![PathBuf::from("a/01.png"), PathBuf::from("b/01.png")],
        };
        Trainer::from_parts(&args, models, batch, StdRng::seed_from_u64(7))
    }

    fn snapshot(layers: &CustomDiffusionLayers) -> Result<Vec<Vec<f32>>> {
        layers
            .vars()
            .iter()
            .map(|v| Ok(v.as_tensor().flatten_all()?.to_vec1::<f32>()?))
            .collect()
    }

    fn check_invariants(trainer: &Trainer, eps: f32) -> Result<()> {
        let linf = linf_distance(trainer.perturbed(), &trainer.original)?;
        assert!(linf <= eps + 1e-5, "linf {linf}");
        let values = trainer.perturbed().flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        Ok(())
    }

    #[test]
    fn a_step_moves_images_and_adapters() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut trainer = tiny_trainer(dir.path(), &["--restore-prob", "0"], false)?;
        let before = snapshot(&trainer.layers)?;
        for step in 1..=2 {
            let metrics = trainer.step(step)?;
            assert!(metrics.loss.is_finite());
            assert!(!metrics.restored);
            assert!(metrics.linf > 0.);
            check_invariants(&trainer, 0.05)?;
        }
        let after = snapshot(&trainer.layers)?;
        assert_eq!(before.len(), 8);
        for (b, a) in before.iter().zip(after.iter()) {
            assert!(b.iter().zip(a.iter()).any(|(x, y)| x != y), "adapter did not move");
        }
        Ok(())
    }

    #[test]
    fn prior_preservation_trains_on_the_doubled_batch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut trainer = tiny_trainer(
            dir.path(),
            &["--with-prior-preservation", "--prior-loss-weight", "0.5", "--restore-prob", "1"],
            true,
        )?;
        let class_images = trainer
            .prior
            .as_ref()
            .map(|p| p.images.flatten_all()?.to_vec1::<f32>())
            .transpose()?;
        let metrics = trainer.step(1)?;
        assert!(metrics.loss.is_finite());
        assert!(metrics.restored);
        // doubled under prior preservation
        assert!((metrics.lr - 2e-3).abs() < 1e-12);
        // only the instances are perturbed
        assert_eq!(trainer.perturbed().dims(), &[N, 3, RES, RES]);
        check_invariants(&trainer, 0.05)?;
        let after = trainer
            .prior
            .as_ref()
            .map(|p| p.images.flatten_all()?.to_vec1::<f32>())
            .transpose()?;
        assert_eq!(class_images, after);
        Ok(())
    }

    #[tokio::test]
    async fn run_writes_the_last_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let trainer = tiny_trainer(
            dir.path(),
            &["--max-train-steps", "2", "--checkpointing-steps", "5"],
            false,
        )?;
        trainer.run().await?;
        let step_dir = dir.path().join("out").join("2");
        assert!(step_dir.join(ADAPTER_FILE).is_file());
        // same stem, different source dirs
        assert!(step_dir.join(noise_filename(2, 0, Path::new("a/01.png"))).is_file());
        assert!(step_dir.join(noise_filename(2, 1, Path::new("b/01.png"))).is_file());
        let metrics = std::fs::read_to_string(dir.path().join("out/logs/metrics.jsonl"))?;
        assert_eq!(metrics.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn allowed_mask_is_the_complement() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mask.safetensors");
        let random_mask = Tensor::new(&[[1f32, 0.], [0., 1.]], &device)?;
        candle_core::safetensors::save(
            &HashMap::from([("random_mask".to_string(), random_mask)]),
            &path,
        )?;
        let images = Tensor::zeros((2, 3, 2, 2), DType::F32, &device)?;
        let allowed = load_allowed_mask(&path, &images, &device)?;
        assert_eq!(allowed.to_vec2::<f32>()?, [[0., 1.], [1., 0.]]);
        Ok(())
    }

    #[test]
    fn mismatched_mask_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mask.safetensors");
        let random_mask = Tensor::zeros((3, 3), DType::F32, &device)?;
        candle_core::safetensors::save(
            &HashMap::from([("random_mask".to_string(), random_mask)]),
            &path,
        )?;
        let images = Tensor::zeros((1, 3, 2, 2), DType::F32, &device)?;
        assert!(load_allowed_mask(&path, &images, &device).is_err());
        let other = dir.path().join("other.safetensors");
        candle_core::safetensors::save(
            &HashMap::from([("mask".to_string(), Tensor::zeros(1, DType::F32, &device)?)]),
            &other,
        )?;
        assert!(load_allowed_mask(&other, &images, &device).is_err());
        Ok(())
    }
}
