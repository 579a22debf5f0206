//! A conditional UNet that can be trained end to end.
//!
//! Loads the same checkpoints as the candle-transformers model and shares its
//! configuration type, but the timestep is given per sample and every op on
//! the path from the latents and the adapters to the output has a backward
//! pass.
mod attention;
mod blocks;

use candle_core::{Result, Tensor};
use candle_nn::{self as nn, Module};
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    unet_2d::UNet2DConditionModelConfig,
};

use blocks::{BlockLayout, CrossAttn, DownBlock, MidBlock, UpBlock};

#[derive(Debug)]
pub struct UNet {
    conv_in: nn::Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: MidBlock,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2d,
    center_input_sample: bool,
    span: tracing::Span,
}

impl UNet {
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        out_channels: usize,
        config: &UNet2DConditionModelConfig,
    ) -> Result<Self> {
        let blocks = &config.blocks;
        let n_blocks = blocks.len();
        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            candle_core::bail!("unet config without blocks")
        };
        let b_channels = first.out_channels;
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = nn::conv2d(in_channels, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;

        let layout_for = |attention_head_dim: usize| BlockLayout {
            temb_channels: time_embed_dim,
            groups: config.norm_num_groups,
            eps: config.norm_eps,
            cross_attention_dim: config.cross_attention_dim,
            // 0 selects automatic slicing
            slice_size: match config.sliced_attention_size {
                Some(0) => Some(attention_head_dim / 2),
                s => s,
            },
            use_linear_projection: config.use_linear_projection,
        };

        let vs_db = vs.pp("down_blocks");
        let down_blocks = blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let in_channels = if i == 0 {
                    b_channels
                } else {
                    blocks[i - 1].out_channels
                };
                DownBlock::new(
                    vs_db.pp(i.to_string()),
                    &layout_for(block.attention_head_dim),
                    in_channels,
                    block.out_channels,
                    config.layers_per_block,
                    block.use_cross_attn.map(|depth| CrossAttn {
                        n_heads: block.attention_head_dim,
                        depth,
                    }),
                    i < n_blocks - 1,
                    config.downsample_padding,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mid_block = MidBlock::new(
            vs.pp("mid_block"),
            // the mid block never slices
            &BlockLayout {
                slice_size: None,
                ..layout_for(last.attention_head_dim)
            },
            last.out_channels,
            CrossAttn {
                n_heads: last.attention_head_dim,
                depth: last.use_cross_attn.unwrap_or(1),
            },
            config.mid_block_scale_factor,
        )?;

        let vs_ub = vs.pp("up_blocks");
        let up_blocks = (0..n_blocks)
            .map(|i| {
                let block = blocks[n_blocks - 1 - i];
                let prev_channels = if i > 0 {
                    blocks[n_blocks - i].out_channels
                } else {
                    last.out_channels
                };
                let in_channels = blocks[(n_blocks - 1 - i).saturating_sub(1)].out_channels;
                UpBlock::new(
                    vs_ub.pp(i.to_string()),
                    &layout_for(block.attention_head_dim),
                    in_channels,
                    prev_channels,
                    block.out_channels,
                    config.layers_per_block + 1,
                    block.use_cross_attn.map(|depth| CrossAttn {
                        n_heads: block.attention_head_dim,
                        depth,
                    }),
                    i < n_blocks - 1,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let conv_norm_out = nn::group_norm(
            config.norm_num_groups,
            b_channels,
            config.norm_eps,
            vs.pp("conv_norm_out"),
        )?;
        let conv_out = nn::conv2d(b_channels, out_channels, 3, conv_cfg, vs.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            center_input_sample: config.center_input_sample,
            span: tracing::span!(tracing::Level::TRACE, "unet2d"),
        })
    }

    /// Denoises every sample at the same timestep.
    pub fn forward(&self, xs: &Tensor, timestep: f64, context: &Tensor) -> Result<Tensor> {
        let timesteps = (Tensor::ones(xs.dim(0)?, xs.dtype(), xs.device())? * timestep)?;
        self.forward_t(xs, &timesteps, context)
    }

    /// `timesteps` holds one timestep per sample of `xs`.
    pub fn forward_t(&self, xs: &Tensor, timesteps: &Tensor, context: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, _, height, width) = xs.dims4()?;
        let up_factor = 1 << (self.up_blocks.len() - 1);
        let forward_upsample_size = height % up_factor != 0 || width % up_factor != 0;
        let xs = if self.center_input_sample {
            ((xs * 2.0)? - 1.0)?
        } else {
            xs.clone()
        };

        let emb = self.time_proj.forward(&timesteps.to_dtype(xs.dtype())?)?;
        let emb = self.time_embedding.forward(&emb)?;

        let xs = self.conv_in.forward(&xs)?;
        let mut residuals = vec![xs.clone()];
        let mut xs = xs;
        for block in &self.down_blocks {
            let (out, states) = block.forward(&xs, &emb, context)?;
            residuals.extend(states);
            xs = out;
        }

        let mut xs = self.mid_block.forward(&xs, &emb, context)?;

        for (i, block) in self.up_blocks.iter().enumerate() {
            let skips = residuals.split_off(residuals.len() - block.num_residuals());
            let upsample_size = match residuals.last() {
                Some(next) if forward_upsample_size && i < self.up_blocks.len() - 1 => {
                    let (_, _, h, w) = next.dims4()?;
                    Some((h, w))
                }
                _ => None,
            };
            xs = block.forward(&xs, &skips, &emb, context, upsample_size)?;
        }

        let xs = self.conv_norm_out.forward(&xs)?;
        self.conv_out.forward(&nn::ops::silu(&xs)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;
    use candle_transformers::models::stable_diffusion::unet_2d::BlockConfig;
    use std::path::Path;

    pub(crate) const CONTEXT_DIM: usize = 16;

    /// Two blocks, 8x8 latents: four cross-attention transformers in total.
    pub(crate) fn tiny_config() -> UNet2DConditionModelConfig {
        UNet2DConditionModelConfig {
            blocks: vec![
                BlockConfig {
                    out_channels: 16,
                    use_cross_attn: Some(1),
                    attention_head_dim: 2,
                },
                BlockConfig {
                    out_channels: 32,
                    use_cross_attn: None,
                    attention_head_dim: 2,
                },
            ],
            layers_per_block: 1,
            norm_num_groups: 8,
            cross_attention_dim: CONTEXT_DIM,
            ..Default::default()
        }
    }

    /// Writes randomly initialised weights of the tiny UNet to `path`.
    pub(crate) fn write_tiny_unet(path: &Path) -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vs = nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        UNet::new(vs, 4, 4, &tiny_config())?;
        varmap.save(path)?;
        Ok(())
    }

    #[test]
    fn per_sample_timesteps_match_single_timestep_calls() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vs = nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let unet = UNet::new(vs, 4, 4, &tiny_config())?;
        let xs = Tensor::randn(0f32, 1., (2, 4, 8, 8), &device)?;
        let context = Tensor::randn(0f32, 1., (2, 3, CONTEXT_DIM), &device)?;
        let ts = Tensor::new(&[10f32, 700.], &device)?;
        let batched = unet.forward_t(&xs, &ts, &context)?;
        assert_eq!(batched.dims(), &[2, 4, 8, 8]);
        let second = unet.forward(&xs.narrow(0, 1, 1)?, 700., &context.narrow(0, 1, 1)?)?;
        let scale = second.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?.max(1.);
        let diff = (batched.narrow(0, 1, 1)? - second)?
            .abs()?
            .flatten_all()?.max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-4 * scale, "{diff}");
        Ok(())
    }

    #[test]
    fn odd_latent_sizes_are_upsampled_back() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vs = nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let unet = UNet::new(vs, 4, 4, &tiny_config())?;
        let xs = Tensor::randn(0f32, 1., (1, 4, 7, 9), &device)?;
        let context = Tensor::randn(0f32, 1., (1, 3, CONTEXT_DIM), &device)?;
        assert_eq!(unet.forward(&xs, 5., &context)?.dims(), &[1, 4, 7, 9]);
        Ok(())
    }

    #[test]
    fn input_gradient_flows_through_the_unet() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vs = nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let unet = UNet::new(vs, 4, 4, &tiny_config())?;
        let xs = Var::from_tensor(&Tensor::randn(0f32, 1., (1, 4, 8, 8), &device)?)?;
        let context = Tensor::randn(0f32, 1., (1, 3, CONTEXT_DIM), &device)?;
        let loss = unet.forward(xs.as_tensor(), 100., &context)?.sqr()?.mean_all()?;
        let grads = loss.backward()?;
        let g = grads.get(xs.as_tensor()).expect("input gradient");
        assert!(g.abs()?.sum_all()?.to_scalar::<f32>()? > 0.);
        Ok(())
    }
}
