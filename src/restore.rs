//! Restoration models the perturbation has to survive.
//!
//! Images that go through a restoration network before fine-tuning lose
//! high-frequency perturbations, so a share of the steps optimises the
//! perturbation through one. Any differentiable model fits behind
//! [`Restorer`].
use candle_core::{Result, Tensor};
use rand::Rng;

pub trait Restorer {
    /// Maps a `(b, 3, h, w)` batch in `[-1, 1]` to a batch of the same shape
    /// and range. Must stay differentiable with respect to `xs`.
    fn restore(&self, xs: &Tensor) -> Result<Tensor>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Restorer for Identity {
    fn restore(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.clone())
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

/// Average-pool down by `factor`, then upsample back: the low-pass
/// purification restoration networks apply to fine detail.
#[derive(Debug, Clone, Copy)]
pub struct Resample {
    factor: usize,
}

impl Resample {
    pub fn new(factor: usize) -> Self {
        Self {
            factor: factor.max(1),
        }
    }
}

impl Restorer for Resample {
    fn restore(&self, xs: &Tensor) -> Result<Tensor> {
        if self.factor == 1 {
            return Ok(xs.clone());
        }
        let (_, _, h, w) = xs.dims4()?;
        xs.avg_pool2d(self.factor)?
            .upsample_nearest2d(h, w)?
            .clamp(-1f64, 1f64)
    }

    fn name(&self) -> &'static str {
        "resample"
    }
}

/// Routes a step through the restorer with probability `prob`.
pub struct RandomRestore {
    restorer: Box<dyn Restorer>,
    prob: f64,
}

impl RandomRestore {
    pub fn new(restorer: Box<dyn Restorer>, prob: f64) -> Self {
        Self { restorer, prob }
    }

    /// Returns the possibly restored batch and whether the restorer ran.
    pub fn apply<R: Rng>(&self, xs: &Tensor, rng: &mut R) -> Result<(Tensor, bool)> {
        if rng.gen::<f64>() < self.prob {
            Ok((self.restorer.restore(xs)?, true))
        } else {
            Ok((xs.clone(), false))
        }
    }

    pub fn restorer_name(&self) -> &'static str {
        self.restorer.name()
    }
}
