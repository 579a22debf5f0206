//! Down, mid and up blocks of the UNet.
use candle_core::{Result, Tensor};
use candle_nn::{self as nn, Module};
use candle_transformers::models::stable_diffusion::resnet::{ResnetBlock2D, ResnetBlock2DConfig};

use super::attention::{SpatialTransformer, SpatialTransformerConfig};

/// Layout shared by the blocks of one UNet.
#[derive(Debug, Clone, Copy)]
pub struct BlockLayout {
    pub temb_channels: usize,
    pub groups: usize,
    pub eps: f64,
    pub cross_attention_dim: usize,
    pub slice_size: Option<usize>,
    pub use_linear_projection: bool,
}

impl BlockLayout {
    fn resnet(&self, out_channels: usize, output_scale_factor: f64) -> ResnetBlock2DConfig {
        ResnetBlock2DConfig {
            out_channels: Some(out_channels),
            temb_channels: Some(self.temb_channels),
            groups: self.groups,
            eps: self.eps,
            output_scale_factor,
            ..Default::default()
        }
    }

    fn transformer(&self, depth: usize) -> SpatialTransformerConfig {
        SpatialTransformerConfig {
            depth,
            num_groups: self.groups,
            context_dim: self.cross_attention_dim,
            slice_size: self.slice_size,
            use_linear_projection: self.use_linear_projection,
        }
    }

    fn attentions(
        &self,
        vs: nn::VarBuilder,
        n: usize,
        channels: usize,
        n_heads: usize,
        depth: usize,
    ) -> Result<Vec<SpatialTransformer>> {
        (0..n)
            .map(|i| {
                SpatialTransformer::new(
                    vs.pp(i.to_string()),
                    channels,
                    n_heads,
                    channels / n_heads,
                    self.transformer(depth),
                )
            })
            .collect()
    }
}

/// Transformer settings of a cross-attention block.
#[derive(Debug, Clone, Copy)]
pub struct CrossAttn {
    pub n_heads: usize,
    pub depth: usize,
}

#[derive(Debug)]
struct Downsample2D {
    conv: nn::Conv2d,
}

impl Downsample2D {
    fn new(vs: nn::VarBuilder, channels: usize, padding: usize) -> Result<Self> {
        let cfg = nn::Conv2dConfig {
            stride: 2,
            padding,
            ..Default::default()
        };
        Ok(Self {
            conv: nn::conv2d(channels, channels, 3, cfg, vs.pp("conv"))?,
        })
    }
}

impl Module for Downsample2D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)
    }
}

#[derive(Debug)]
struct Upsample2D {
    conv: nn::Conv2d,
}

impl Upsample2D {
    fn new(vs: nn::VarBuilder, channels: usize) -> Result<Self> {
        let cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: nn::conv2d(channels, channels, 3, cfg, vs.pp("conv"))?,
        })
    }

    fn forward(&self, xs: &Tensor, size: Option<(usize, usize)>) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        let (h, w) = size.unwrap_or((2 * h, 2 * w));
        self.conv.forward(&xs.upsample_nearest2d(h, w)?)
    }
}

#[derive(Debug)]
pub struct DownBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    downsampler: Option<Downsample2D>,
    span: tracing::Span,
}

impl DownBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vs: nn::VarBuilder,
        layout: &BlockLayout,
        in_channels: usize,
        out_channels: usize,
        num_layers: usize,
        cross_attn: Option<CrossAttn>,
        add_downsample: bool,
        downsample_padding: usize,
    ) -> Result<Self> {
        let vs_resnets = vs.pp("resnets");
        let resnets = (0..num_layers)
            .map(|i| {
                let in_channels = if i == 0 { in_channels } else { out_channels };
                ResnetBlock2D::new(
                    vs_resnets.pp(i.to_string()),
                    in_channels,
                    layout.resnet(out_channels, 1.),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let attentions = match cross_attn {
            Some(c) => layout.attentions(
                vs.pp("attentions"),
                num_layers,
                out_channels,
                c.n_heads,
                c.depth,
            )?,
            None => vec![],
        };
        let downsampler = if add_downsample {
            Some(Downsample2D::new(
                vs.pp("downsamplers").pp("0"),
                out_channels,
                downsample_padding,
            )?)
        } else {
            None
        };
        Ok(Self {
            resnets,
            attentions,
            downsampler,
            span: tracing::span!(tracing::Level::TRACE, "down2d"),
        })
    }

    /// Returns the block output and the residuals kept for the up path.
    pub fn forward(
        &self,
        xs: &Tensor,
        temb: &Tensor,
        context: &Tensor,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let _enter = self.span.enter();
        let mut xs = xs.clone();
        let mut states = Vec::with_capacity(self.resnets.len() + 1);
        for (i, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, Some(temb))?;
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, context)?;
            }
            states.push(xs.clone());
        }
        if let Some(downsampler) = &self.downsampler {
            xs = downsampler.forward(&xs)?;
            states.push(xs.clone());
        }
        Ok((xs, states))
    }
}

#[derive(Debug)]
pub struct MidBlock {
    resnet: ResnetBlock2D,
    attn_resnets: Vec<(SpatialTransformer, ResnetBlock2D)>,
    span: tracing::Span,
}

impl MidBlock {
    pub fn new(
        vs: nn::VarBuilder,
        layout: &BlockLayout,
        channels: usize,
        cross_attn: CrossAttn,
        output_scale_factor: f64,
    ) -> Result<Self> {
        let vs_resnets = vs.pp("resnets");
        let cfg = layout.resnet(channels, output_scale_factor);
        let resnet = ResnetBlock2D::new(vs_resnets.pp("0"), channels, cfg)?;
        let attn = layout
            .attentions(vs.pp("attentions"), 1, channels, cross_attn.n_heads, cross_attn.depth)?
            .remove(0);
        let second = ResnetBlock2D::new(vs_resnets.pp("1"), channels, cfg)?;
        Ok(Self {
            resnet,
            attn_resnets: vec![(attn, second)],
            span: tracing::span!(tracing::Level::TRACE, "xa-mid2d"),
        })
    }

    pub fn forward(&self, xs: &Tensor, temb: &Tensor, context: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = self.resnet.forward(xs, Some(temb))?;
        for (attn, resnet) in &self.attn_resnets {
            xs = resnet.forward(&attn.forward(&xs, context)?, Some(temb))?;
        }
        Ok(xs)
    }
}

#[derive(Debug)]
pub struct UpBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    upsampler: Option<Upsample2D>,
    span: tracing::Span,
}

impl UpBlock {
    /// `in_channels` is the width of the matching down block input and
    /// `prev_channels` the width of the previous up block output.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vs: nn::VarBuilder,
        layout: &BlockLayout,
        in_channels: usize,
        prev_channels: usize,
        out_channels: usize,
        num_layers: usize,
        cross_attn: Option<CrossAttn>,
        add_upsample: bool,
    ) -> Result<Self> {
        let vs_resnets = vs.pp("resnets");
        let resnets = (0..num_layers)
            .map(|i| {
                let skip = if i == num_layers - 1 {
                    in_channels
                } else {
                    out_channels
                };
                let input = if i == 0 { prev_channels } else { out_channels };
                ResnetBlock2D::new(
                    vs_resnets.pp(i.to_string()),
                    input + skip,
                    layout.resnet(out_channels, 1.),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let attentions = match cross_attn {
            Some(c) => layout.attentions(
                vs.pp("attentions"),
                num_layers,
                out_channels,
                c.n_heads,
                c.depth,
            )?,
            None => vec![],
        };
        let upsampler = if add_upsample {
            Some(Upsample2D::new(vs.pp("upsamplers").pp("0"), out_channels)?)
        } else {
            None
        };
        Ok(Self {
            resnets,
            attentions,
            upsampler,
            span: tracing::span!(tracing::Level::TRACE, "up2d"),
        })
    }

    pub fn num_residuals(&self) -> usize {
        self.resnets.len()
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        residuals: &[Tensor],
        temb: &Tensor,
        context: &Tensor,
        upsample_size: Option<(usize, usize)>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = xs.clone();
        for (i, resnet) in self.resnets.iter().enumerate() {
            let skip = &residuals[residuals.len() - i - 1];
            xs = Tensor::cat(&[&xs, skip], 1)?.contiguous()?;
            xs = resnet.forward(&xs, Some(temb))?;
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, context)?;
            }
        }
        match &self.upsampler {
            Some(upsampler) => upsampler.forward(&xs, upsample_size),
            None => Ok(xs),
        }
    }
}
