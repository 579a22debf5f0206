//! Forward diffusion used during training.
//!
//! Unlike the sampling schedulers shipped with the stable diffusion models,
//! every sample of the batch gets its own timestep here.
use candle_core::{Device, Result, Tensor};
use rand::Rng;

pub const NUM_TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self::scaled_linear(NUM_TRAIN_TIMESTEPS, BETA_START, BETA_END)
    }
}

impl NoiseSchedule {
    /// Betas are the squares of a linear ramp between `sqrt(beta_start)` and
    /// `sqrt(beta_end)`.
    pub fn scaled_linear(steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
        let mut alphas_cumprod = Vec::with_capacity(steps);
        let mut acc = 1.0;
        for i in 0..steps {
            let frac = if steps > 1 {
                i as f64 / (steps - 1) as f64
            } else {
                0.
            };
            let beta = (start + (end - start) * frac).powi(2);
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        Self { alphas_cumprod }
    }

    pub fn num_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep.min(self.alphas_cumprod.len() - 1)]
    }

    pub fn sample_timesteps<R: Rng>(&self, rng: &mut R, batch: usize) -> Vec<usize> {
        (0..batch)
            .map(|_| rng.gen_range(0..self.num_timesteps()))
            .collect()
    }

    /// Builds a `(b, 1, 1, 1)` tensor from a per-sample coefficient.
    fn coefficients(
        &self,
        timesteps: &[usize],
        device: &Device,
        f: impl Fn(f64) -> f64,
    ) -> Result<Tensor> {
        let coeffs = timesteps
            .iter()
            .map(|&t| f(self.alpha_cumprod(t)) as f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(coeffs, (timesteps.len(), 1, 1, 1), device)
    }

    /// `sqrt(a_t) * x + sqrt(1 - a_t) * noise`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let dtype = original.dtype();
        let device = original.device();
        let sqrt_alpha = self.coefficients(timesteps, device, f64::sqrt)?.to_dtype(dtype)?;
        let sqrt_one_minus = self
            .coefficients(timesteps, device, |a| (1. - a).sqrt())?
            .to_dtype(dtype)?;
        original
            .broadcast_mul(&sqrt_alpha)?
            .add(&noise.broadcast_mul(&sqrt_one_minus)?)
    }

    /// `sqrt(a_t) * noise - sqrt(1 - a_t) * x`.
    pub fn velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let dtype = sample.dtype();
        let device = sample.device();
        let sqrt_alpha = self.coefficients(timesteps, device, f64::sqrt)?.to_dtype(dtype)?;
        let sqrt_one_minus = self
            .coefficients(timesteps, device, |a| (1. - a).sqrt())?
            .to_dtype(dtype)?;
        noise
            .broadcast_mul(&sqrt_alpha)?
            .sub(&sample.broadcast_mul(&sqrt_one_minus)?)
    }

    pub fn target(
        &self,
        prediction_type: PredictionType,
        latents: &Tensor,
        noise: &Tensor,
        timesteps: &[usize],
    ) -> Result<Tensor> {
        match prediction_type {
            PredictionType::Epsilon => Ok(noise.clone()),
            PredictionType::VPrediction => self.velocity(latents, noise, timesteps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn cumulative_alphas_decrease() {
        let schedule = NoiseSchedule::default();
        assert_eq!(schedule.num_timesteps(), NUM_TRAIN_TIMESTEPS);
        assert!((schedule.alpha_cumprod(0) - (1. - BETA_START)).abs() < 1e-12);
        assert!(schedule.alpha_cumprod(999) < schedule.alpha_cumprod(500));
        // sd 1.x final alpha_bar is about 0.0047
        assert!((schedule.alpha_cumprod(999) - 0.0047).abs() < 1e-3);
    }

    #[test]
    fn per_sample_timesteps_are_applied_independently() -> Result<()> {
        let schedule = NoiseSchedule::default();
        let device = Device::Cpu;
        let x = Tensor::ones((2, 4, 2, 2), candle_core::DType::F32, &device)?;
        let noise = Tensor::zeros((2, 4, 2, 2), candle_core::DType::F32, &device)?;
        let noisy = schedule.add_noise(&x, &noise, &[0, 999])?;
        let first = noisy.get(0)?.flatten_all()?.to_vec1::<f32>()?;
        let last = noisy.get(1)?.flatten_all()?.to_vec1::<f32>()?;
        let expected_first = schedule.alpha_cumprod(0).sqrt() as f32;
        let expected_last = schedule.alpha_cumprod(999).sqrt() as f32;
        assert!(first.iter().all(|v| (v - expected_first).abs() < 1e-6));
        assert!(last.iter().all(|v| (v - expected_last).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn velocity_recovers_the_sample() -> Result<()> {
        // x = sqrt(a) * x_t - sqrt(1 - a) * v
        let schedule = NoiseSchedule::default();
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1., (3, 4, 2, 2), &device)?;
        let noise = Tensor::randn(0f32, 1., (3, 4, 2, 2), &device)?;
        let timesteps = [10, 400, 900];
        let noisy = schedule.add_noise(&x, &noise, &timesteps)?;
        let v = schedule.velocity(&x, &noise, &timesteps)?;
        for (i, &t) in timesteps.iter().enumerate() {
            let a = schedule.alpha_cumprod(t);
            let rebuilt = ((noisy.get(i)? * a.sqrt())? - (v.get(i)? * (1. - a).sqrt())?)?;
            let max = (rebuilt - x.get(i)?)?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_scalar::<f32>()?;
            assert!(max < 1e-4, "timestep {t} off by {max}");
        }
        Ok(())
    }

    #[test]
    fn timesteps_stay_in_range() {
        let schedule = NoiseSchedule::default();
        let mut rng = StdRng::seed_from_u64(3);
        let ts = schedule.sample_timesteps(&mut rng, 64);
        assert_eq!(ts.len(), 64);
        assert!(ts.iter().all(|&t| t < NUM_TRAIN_TIMESTEPS));
    }
}
