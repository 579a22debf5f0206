//! Custom Diffusion adapters: the cross-attention projections of the UNet
//! are the only trainable weights.
//!
//! The UNet is built through a var-builder backend that hands out `Var`s for
//! the selected weights, so the optimizer updates them in place inside the
//! model. Adapter vars are always f32, the UNet casts them to its own dtype
//! on each forward pass.
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use candle_core::{
    backprop::GradStore, safetensors::MmapedSafetensors, DType, Device, Shape, Tensor, Var,
};
use candle_nn::{var_builder::SimpleBackend, Init, VarBuilder};
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModelConfig;
use clap::ValueEnum;

use crate::unet::UNet;

pub const ADAPTER_FILE: &str = "custom_diffusion.safetensors";

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum FreezeModel {
    /// Train the key and value projections of the cross-attention layers.
    #[default]
    CrossattnKv,
    /// Train every projection of the cross-attention layers.
    Crossattn,
}

impl FreezeModel {
    pub fn is_trainable(&self, name: &str) -> bool {
        let Some((_, local)) = name.split_once(".attn2.") else {
            return false;
        };
        match self {
            Self::CrossattnKv => matches!(local, "to_k.weight" | "to_v.weight"),
            Self::Crossattn => matches!(
                local,
                "to_k.weight"
                    | "to_v.weight"
                    | "to_q.weight"
                    | "to_out.0.weight"
                    | "to_out.0.bias"
            ),
        }
    }
}

type SharedVars = Arc<Mutex<Vec<(String, Var)>>>;

/// Loads frozen tensors from the checkpoint, wrapping the trainable ones in
/// vars recorded in `trainable`.
struct AdapterBackend {
    inner: MmapedSafetensors,
    freeze_model: FreezeModel,
    trainable: SharedVars,
}

impl SimpleBackend for AdapterBackend {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _: Init,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        let tensor = self.inner.load(name, dev)?;
        if tensor.shape() != &s {
            return Err(candle_core::Error::UnexpectedShape {
                msg: format!("shape mismatch for {name}"),
                expected: s,
                got: tensor.shape().clone(),
            }
            .bt());
        }
        if !self.freeze_model.is_trainable(name) {
            return tensor.to_dtype(dtype);
        }
        let var = Var::from_tensor(&tensor.to_dtype(DType::F32)?)?;
        let out = var.as_tensor().clone();
        match self.trainable.lock() {
            Ok(mut vars) => vars.push((name.to_string(), var)),
            Err(_) => candle_core::bail!("adapter registry poisoned while loading {name}"),
        }
        Ok(out)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.inner.get(name).is_ok()
    }
}

/// The trainable adapter weights, keyed by their UNet path.
pub struct CustomDiffusionLayers {
    vars: Vec<(String, Var)>,
}

impl CustomDiffusionLayers {
    pub fn from_vars(vars: Vec<(String, Var)>) -> Self {
        Self { vars }
    }

    pub fn vars(&self) -> Vec<Var> {
        self.vars.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn num_parameters(&self) -> usize {
        self.vars.iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Rescales the adapter gradients so their global L2 norm is at most
    /// `max_norm`. Returns the norm before clipping.
    pub fn clip_grad_norm(&self, grads: &mut GradStore, max_norm: f64) -> Result<f64> {
        let mut total = 0f64;
        for (_, var) in &self.vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                total += g
                    .to_dtype(DType::F32)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar::<f32>()? as f64;
            }
        }
        let norm = total.sqrt();
        let coef = max_norm / (norm + 1e-6);
        if coef < 1.0 {
            for (_, var) in &self.vars {
                if let Some(g) = grads.remove(var.as_tensor()) {
                    grads.insert(var.as_tensor(), (g * coef)?);
                }
            }
        }
        Ok(norm)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self
            .vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }
}

/// Builds the UNet from `weights`, with the `freeze_model` selection of
/// cross-attention weights left trainable.
pub fn build_unet_with_adapters<P: AsRef<Path>>(
    weights: P,
    config: &UNet2DConditionModelConfig,
    freeze_model: FreezeModel,
    device: &Device,
    dtype: DType,
) -> Result<(UNet, CustomDiffusionLayers)> {
    let trainable: SharedVars = Arc::new(Mutex::new(Vec::new()));
    let inner = unsafe { MmapedSafetensors::new(weights)? };
    let backend = AdapterBackend {
        inner,
        freeze_model,
        trainable: trainable.clone(),
    };
    let vs = VarBuilder::from_backend(Box::new(backend), dtype, device.clone());
    let in_channels = crate::model::LATENT_CHANNELS;
    let unet = UNet::new(vs, in_channels, in_channels, config)?;
    let vars = match trainable.lock() {
        Ok(mut vars) => std::mem::take(&mut *vars),
        Err(_) => anyhow::bail!("adapter registry poisoned"),
    };
    let layers = CustomDiffusionLayers::from_vars(vars);
    tracing::info!(
        layers = layers.len(),
        parameters = layers.num_parameters(),
        mode = ?freeze_model,
        "custom diffusion adapters attached"
    );
    Ok((unet, layers))
}
