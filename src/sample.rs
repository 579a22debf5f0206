//! Class image generation for the prior preservation loss.
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::stable_diffusion::{
    schedulers::Scheduler, vae::AutoEncoderKL, StableDiffusionConfig,
};

use crate::{
    dataset::list_files,
    model::{LATENT_CHANNELS, VAE_SCALE},
    text::PromptEncoder,
    unet::UNet,
    utils::save_image,
    GUIDANCE_SCALE,
};

/// Text-to-image sampling with classifier-free guidance over the frozen
/// models.
pub struct ClassImageSampler<'a> {
    pub n_steps: usize,
    pub vae_scale: f64,
    pub sd_config: &'a StableDiffusionConfig,
    pub text: &'a PromptEncoder,
    pub vae: &'a AutoEncoderKL,
    pub unet: &'a UNet,
    pub device: &'a Device,
    pub dtype: DType,
}

impl<'a> ClassImageSampler<'a> {
    /// Fills `dir` up to `num_images` images sampled from `prompt`, in
    /// batches of `batch_size`. Returns how many were generated.
    pub fn fill_dir(
        &self,
        dir: &Path,
        prompt: &str,
        num_images: usize,
        batch_size: usize,
    ) -> Result<usize> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let existing = list_files(dir)?.len();
        if existing >= num_images {
            return Ok(0);
        }
        let missing = num_images - existing;
        tracing::info!(missing, dir = %dir.display(), "number of class images to sample");

        let batch_size = batch_size.max(1);
        let mut generated = 0;
        while generated < missing {
            let n = batch_size.min(missing - generated);
            let images = self.sample(prompt, n)?;
            for i in 0..n {
                let index = existing + generated + i;
                save_image(&images.i(i)?, dir.join(format!("{index}.jpg")))?;
            }
            generated += n;
            tracing::info!(generated, missing, "sampled class images");
        }
        Ok(generated)
    }

    /// `(n, 3, h, w)` u8 images.
    pub fn sample(&self, prompt: &str, n: usize) -> Result<Tensor> {
        let embeddings = self.text.encode_guided(prompt, "")?;
        let uncond = embeddings.i(0..1)?.repeat((n, 1, 1))?;
        let cond = embeddings.i(1..2)?.repeat((n, 1, 1))?;
        let text_embeddings = Tensor::cat(&[uncond, cond], 0)?;

        let scheduler = self.sd_config.build_scheduler(self.n_steps)?;
        let latents = Tensor::randn(
            0f32,
            1f32,
            (
                n,
                LATENT_CHANNELS,
                self.sd_config.height / VAE_SCALE,
                self.sd_config.width / VAE_SCALE,
            ),
            self.device,
        )?;
        // scale the initial noise by the standard deviation required by the scheduler
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            let start_time = std::time::Instant::now();
            latents = guided_step(
                self.unet,
                scheduler.as_ref(),
                &latents,
                timestep,
                &text_embeddings,
            )?;
            let dt = start_time.elapsed().as_secs_f32();
            tracing::debug!("step {}/{} done, {:.2}s", timestep_index + 1, self.n_steps, dt);
        }

        let images = self.vae.decode(&(&latents / self.vae_scale)?)?;
        let images = ((images / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let images = (images.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        Ok(images)
    }
}

/// One classifier-free guidance denoising step. `text_embeddings` holds the
/// unconditional half first. The unet holds adapter vars, so the returned
/// latents are detached to keep the graph from spanning the whole loop.
pub fn guided_step(
    unet: &UNet,
    scheduler: &dyn Scheduler,
    latents: &Tensor,
    timestep: usize,
    text_embeddings: &Tensor,
) -> Result<Tensor> {
    let latent_model_input = Tensor::cat(&[latents, latents], 0)?;
    let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
    let noise_pred = unet.forward(&latent_model_input, timestep as f64, text_embeddings)?;
    let noise_pred = noise_pred.chunk(2, 0)?;
    let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
    let noise_pred =
        (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * GUIDANCE_SCALE)?)?;
    Ok(scheduler.step(&noise_pred.detach(), timestep, latents)?.detach())
}
