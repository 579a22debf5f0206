use candle_core::{DType, Result, Tensor};

/// Per-sample mean squared error restricted to the mask, averaged over the
/// batch. The `(b, 1, h, w)` mask is broadcast over the latent channels.
pub fn masked_mse(pred: &Tensor, target: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let pred = pred.to_dtype(DType::F32)?;
    let target = target.to_dtype(DType::F32)?;
    let se = (pred - target)?.sqr()?;
    let mask = mask.to_dtype(DType::F32)?.broadcast_as(se.shape())?;
    let num = (&se * &mask)?.sum((1, 2, 3))?;
    let den = mask.sum((1, 2, 3))?.clamp(1e-6f64, f64::INFINITY)?;
    (num / den)?.mean_all()
}

pub fn mse(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let pred = pred.to_dtype(DType::F32)?;
    let target = target.to_dtype(DType::F32)?;
    (pred - target)?.sqr()?.mean_all()
}

/// Instance loss on the first `instances` samples, plus the weighted prior
/// loss on the class samples that follow them.
pub fn denoising_loss(
    pred: &Tensor,
    target: &Tensor,
    mask: &Tensor,
    instances: usize,
    prior_loss_weight: f64,
) -> Result<Tensor> {
    let batch = pred.dim(0)?;
    if batch == instances {
        return masked_mse(pred, target, mask);
    }
    let classes = batch - instances;
    let loss = masked_mse(
        &pred.narrow(0, 0, instances)?,
        &target.narrow(0, 0, instances)?,
        mask,
    )?;
    let prior = mse(
        &pred.narrow(0, instances, classes)?,
        &target.narrow(0, instances, classes)?,
    )?;
    loss + (prior * prior_loss_weight)?
}
