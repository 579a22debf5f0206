use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Tensor;
use tokio::task::JoinSet;

use crate::{
    adapter::{CustomDiffusionLayers, ADAPTER_FILE},
    utils::{noise_filename, save_image, to_pixels},
};

/// Writes the perturbed images (and adapter weights) into
/// `{output_dir}/{step}/` directories.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    output_dir: PathBuf,
    every: usize,
    total_limit: Option<usize>,
}

impl Checkpointer {
    pub fn new(output_dir: PathBuf, every: usize, total_limit: Option<usize>) -> Self {
        Self {
            output_dir,
            every: every.max(1),
            total_limit,
        }
    }

    pub fn is_due(&self, step: usize, max_steps: usize) -> bool {
        step % self.every == 0 || step == max_steps
    }

    pub fn step_dir(&self, step: usize) -> PathBuf {
        self.output_dir.join(step.to_string())
    }

    /// Saves `images` (`(n, 3, h, w)` in `[-1, 1]`), named after `sources`.
    /// PNG encoding runs on blocking tasks.
    pub async fn save(
        &self,
        step: usize,
        images: &Tensor,
        sources: &[PathBuf],
        layers: Option<&CustomDiffusionLayers>,
    ) -> Result<PathBuf> {
        self.prune(step)?;
        let dir = self.step_dir(step);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let pixels = to_pixels(images)?;
        let mut tasks = JoinSet::new();
        for (idx, source) in sources.iter().enumerate() {
            let img = pixels.get(idx)?;
            let path = dir.join(noise_filename(step, idx, source));
            tasks.spawn_blocking(move || save_image(&img, path));
        }
        while let Some(res) = tasks.join_next().await {
            res??;
        }
        if let Some(layers) = layers {
            layers.save(dir.join(ADAPTER_FILE))?;
        }
        tracing::info!(step, dir = %dir.display(), "saved perturbed images");
        Ok(dir)
    }

    /// Removes the oldest step directories so that, once the next one is
    /// written, at most `total_limit` remain.
    fn prune(&self, step: usize) -> Result<()> {
        let Some(limit) = self.total_limit else {
            return Ok(());
        };
        let mut existing = checkpoint_steps(&self.output_dir)?;
        existing.retain(|&s| s != step);
        if existing.len() < limit {
            return Ok(());
        }
        let remove = existing.len() + 1 - limit.max(1);
        for s in existing.into_iter().take(remove) {
            let dir = self.step_dir(s);
            tracing::info!(dir = %dir.display(), "removing old checkpoint");
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("removing {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Step numbers of the checkpoint directories under `dir`, ascending.
pub fn checkpoint_steps(dir: &Path) -> Result<Vec<usize>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut steps = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(step) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            steps.push(step);
        }
    }
    steps.sort_unstable();
    Ok(steps)
}
