//! Projected gradient steps on the image tensor.
use candle_core::{DType, Result, Tensor, Var};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PgdConfig {
    /// Size of the signed gradient step.
    pub alpha: f64,
    /// Radius of the L-infinity ball around the original images.
    pub eps: f64,
}

impl PgdConfig {
    pub fn new(alpha: f64, eps: f64) -> Self {
        Self { alpha, eps }
    }

    /// Ascends the loss by `alpha * sign(grad)`, then projects back into the
    /// eps-ball around `original` and into `[-1, 1]`.
    ///
    /// `allowed` is broadcast against the images; where it is zero the
    /// original pixels are restored.
    pub fn project(
        &self,
        perturbed: &Tensor,
        original: &Tensor,
        grad: &Tensor,
        allowed: Option<&Tensor>,
    ) -> Result<Tensor> {
        let adv = (perturbed + (sign(grad)? * self.alpha)?)?;
        let eta = (adv - original)?.clamp(-self.eps, self.eps)?;
        let eta = match allowed {
            Some(allowed) => eta.broadcast_mul(&allowed.to_dtype(eta.dtype())?)?,
            None => eta,
        };
        (original + eta)?.clamp(-1f64, 1f64)
    }

    /// Applies [`PgdConfig::project`] in place on the image variable.
    pub fn step(
        &self,
        perturbed: &Var,
        original: &Tensor,
        grad: &Tensor,
        allowed: Option<&Tensor>,
    ) -> Result<()> {
        let next = self.project(perturbed.as_tensor(), original, grad, allowed)?;
        perturbed.set(&next)
    }
}

/// Elementwise sign with `sign(0) == 0`.
pub fn sign(xs: &Tensor) -> Result<Tensor> {
    let zeros = xs.zeros_like()?;
    let pos = xs.gt(&zeros)?.to_dtype(DType::F32)?;
    let neg = xs.lt(&zeros)?.to_dtype(DType::F32)?;
    (pos - neg)?.to_dtype(xs.dtype())
}

/// Largest absolute difference between two tensors.
pub fn linf_distance(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()
}
