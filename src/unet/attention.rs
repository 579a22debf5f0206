//! Transformer blocks of the UNet.
//!
//! Attention probabilities go through `candle_nn::ops::softmax`, which is
//! built from differentiable ops, so gradients reach the queries and keys.
use candle_core::{DType, Result, Tensor, D};
use candle_nn::{self as nn, Module};

/// A linear layer whose weights are cast to the input dtype on every call.
/// Adapter weights stay in f32 while the frozen model runs in half precision.
#[derive(Debug)]
pub struct Projection {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Projection {
    pub fn new(vs: nn::VarBuilder, in_dim: usize, out_dim: usize, bias: bool) -> Result<Self> {
        let weight = vs.get_with_hints(
            (out_dim, in_dim),
            "weight",
            nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if bias {
            let bound = 1. / (in_dim as f64).sqrt();
            let init = nn::Init::Uniform {
                lo: -bound,
                up: bound,
            };
            Some(vs.get_with_hints(out_dim, "bias", init)?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }
}

impl Module for Projection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let w = self.weight.to_dtype(dtype)?;
        let xs = match *xs.dims() {
            [b, _, _] => xs.matmul(&w.broadcast_left(b)?.t()?)?,
            _ => xs.matmul(&w.t()?)?,
        };
        match &self.bias {
            None => Ok(xs),
            Some(bias) => xs.broadcast_add(&bias.to_dtype(dtype)?),
        }
    }
}

#[derive(Debug)]
struct GeGlu {
    proj: nn::Linear,
}

impl Module for GeGlu {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden_and_gate = self.proj.forward(xs)?.chunk(2, D::Minus1)?;
        &hidden_and_gate[0] * hidden_and_gate[1].gelu()?
    }
}

#[derive(Debug)]
struct FeedForward {
    project_in: GeGlu,
    linear: nn::Linear,
}

impl FeedForward {
    fn new(vs: nn::VarBuilder, dim: usize) -> Result<Self> {
        let inner_dim = dim * 4;
        let vs = vs.pp("net");
        let proj = nn::linear(dim, inner_dim * 2, vs.pp("0").pp("proj"))?;
        let linear = nn::linear(inner_dim, dim, vs.pp("2"))?;
        Ok(Self {
            project_in: GeGlu { proj },
            linear,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.linear.forward(&self.project_in.forward(xs)?)
    }
}

#[derive(Debug)]
pub struct CrossAttention {
    to_q: Projection,
    to_k: Projection,
    to_v: Projection,
    to_out: Projection,
    heads: usize,
    scale: f64,
    slice_size: Option<usize>,
    span: tracing::Span,
}

impl CrossAttention {
    pub fn new(
        vs: nn::VarBuilder,
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
        slice_size: Option<usize>,
    ) -> Result<Self> {
        let inner_dim = dim_head * heads;
        let context_dim = context_dim.unwrap_or(query_dim);
        Ok(Self {
            to_q: Projection::new(vs.pp("to_q"), query_dim, inner_dim, false)?,
            to_k: Projection::new(vs.pp("to_k"), context_dim, inner_dim, false)?,
            to_v: Projection::new(vs.pp("to_v"), context_dim, inner_dim, false)?,
            to_out: Projection::new(vs.pp("to_out.0"), inner_dim, query_dim, true)?,
            heads,
            scale: 1.0 / (dim_head as f64).sqrt(),
            slice_size,
            span: tracing::span!(tracing::Level::TRACE, "xa"),
        })
    }

    fn heads_to_batch(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, seq_len, dim) = xs.dims3()?;
        xs.reshape((b, seq_len, self.heads, dim / self.heads))?
            .transpose(1, 2)?
            .reshape((b * self.heads, seq_len, dim / self.heads))
    }

    fn batch_to_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (bh, seq_len, dim) = xs.dims3()?;
        xs.reshape((bh / self.heads, self.heads, seq_len, dim))?
            .transpose(1, 2)?
            .reshape((bh / self.heads, seq_len, dim * self.heads))
    }

    fn attend(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Tensor> {
        let scores = query.matmul(&(key.t()? * self.scale)?)?;
        nn::ops::softmax(&scores, D::Minus1)?.matmul(value)
    }

    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let in_dtype = xs.dtype();
        let context = context.unwrap_or(xs).contiguous()?;
        let query = self
            .heads_to_batch(&self.to_q.forward(xs)?)?
            .to_dtype(DType::F32)?;
        let key = self
            .heads_to_batch(&self.to_k.forward(&context)?)?
            .to_dtype(DType::F32)?;
        let value = self
            .heads_to_batch(&self.to_v.forward(&context)?)?
            .to_dtype(DType::F32)?;
        let bh = query.dim(0)?;
        let xs = match self.slice_size {
            Some(slice) if slice > 0 && slice < bh => {
                let mut chunks = Vec::with_capacity(bh.div_ceil(slice));
                for start in (0..bh).step_by(slice) {
                    let len = slice.min(bh - start);
                    chunks.push(self.attend(
                        &query.narrow(0, start, len)?,
                        &key.narrow(0, start, len)?,
                        &value.narrow(0, start, len)?,
                    )?);
                }
                Tensor::cat(&chunks, 0)?
            }
            _ => self.attend(&query, &key, &value)?,
        };
        let xs = self.batch_to_heads(&xs.to_dtype(in_dtype)?)?;
        self.to_out.forward(&xs)
    }
}

#[derive(Debug)]
struct BasicTransformerBlock {
    attn1: CrossAttention,
    ff: FeedForward,
    attn2: CrossAttention,
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    norm3: nn::LayerNorm,
}

impl BasicTransformerBlock {
    fn new(
        vs: nn::VarBuilder,
        dim: usize,
        n_heads: usize,
        d_head: usize,
        context_dim: usize,
        slice_size: Option<usize>,
    ) -> Result<Self> {
        Ok(Self {
            attn1: CrossAttention::new(vs.pp("attn1"), dim, None, n_heads, d_head, slice_size)?,
            ff: FeedForward::new(vs.pp("ff"), dim)?,
            attn2: CrossAttention::new(
                vs.pp("attn2"),
                dim,
                Some(context_dim),
                n_heads,
                d_head,
                slice_size,
            )?,
            norm1: nn::layer_norm(dim, 1e-5, vs.pp("norm1"))?,
            norm2: nn::layer_norm(dim, 1e-5, vs.pp("norm2"))?,
            norm3: nn::layer_norm(dim, 1e-5, vs.pp("norm3"))?,
        })
    }

    fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let xs = (self.attn1.forward(&self.norm1.forward(xs)?, None)? + xs)?;
        let xs = (self.attn2.forward(&self.norm2.forward(&xs)?, Some(context))? + xs)?;
        self.ff.forward(&self.norm3.forward(&xs)?)? + xs
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpatialTransformerConfig {
    pub depth: usize,
    pub num_groups: usize,
    pub context_dim: usize,
    pub slice_size: Option<usize>,
    pub use_linear_projection: bool,
}

#[derive(Debug)]
enum Proj {
    Conv2d(nn::Conv2d),
    Linear(nn::Linear),
}

#[derive(Debug)]
pub struct SpatialTransformer {
    norm: nn::GroupNorm,
    proj_in: Proj,
    blocks: Vec<BasicTransformerBlock>,
    proj_out: Proj,
    span: tracing::Span,
}

impl SpatialTransformer {
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        n_heads: usize,
        d_head: usize,
        config: SpatialTransformerConfig,
    ) -> Result<Self> {
        let inner_dim = n_heads * d_head;
        let norm = nn::group_norm(config.num_groups, in_channels, 1e-6, vs.pp("norm"))?;
        let (proj_in, proj_out) = if config.use_linear_projection {
            (
                Proj::Linear(nn::linear(in_channels, inner_dim, vs.pp("proj_in"))?),
                Proj::Linear(nn::linear(inner_dim, in_channels, vs.pp("proj_out"))?),
            )
        } else {
            let cfg = nn::Conv2dConfig::default();
            (
                Proj::Conv2d(nn::conv2d(in_channels, inner_dim, 1, cfg, vs.pp("proj_in"))?),
                Proj::Conv2d(nn::conv2d(inner_dim, in_channels, 1, cfg, vs.pp("proj_out"))?),
            )
        };
        let vs_tb = vs.pp("transformer_blocks");
        let blocks = (0..config.depth)
            .map(|i| {
                BasicTransformerBlock::new(
                    vs_tb.pp(i.to_string()),
                    inner_dim,
                    n_heads,
                    d_head,
                    config.context_dim,
                    config.slice_size,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            norm,
            proj_in,
            blocks,
            proj_out,
            span: tracing::span!(tracing::Level::TRACE, "spatial-transformer"),
        })
    }

    pub fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, _, h, w) = xs.dims4()?;
        let residual = xs;
        let xs = self.norm.forward(xs)?;
        // (b, c, h, w) -> (b, h * w, c)
        let to_tokens = |xs: Tensor| -> Result<Tensor> {
            let c = xs.dim(1)?;
            xs.transpose(1, 2)?.t()?.reshape((b, h * w, c))
        };
        let mut xs = match &self.proj_in {
            Proj::Conv2d(p) => to_tokens(p.forward(&xs)?)?,
            Proj::Linear(p) => p.forward(&to_tokens(xs)?)?,
        };
        for block in &self.blocks {
            xs = block.forward(&xs, context)?;
        }
        let to_image = |xs: Tensor| -> Result<Tensor> {
            let c = xs.dim(2)?;
            xs.reshape((b, h, w, c))?.t()?.transpose(1, 2)
        };
        let xs = match &self.proj_out {
            Proj::Conv2d(p) => p.forward(&to_image(xs)?)?,
            Proj::Linear(p) => to_image(p.forward(&xs)?)?,
        };
        xs + residual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn keys_and_queries_receive_gradients() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vs = nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = CrossAttention::new(vs, 8, Some(6), 2, 4, None)?;
        let xs = Var::from_tensor(&Tensor::randn(0f32, 1., (2, 5, 8), &device)?)?;
        let context = Tensor::randn(0f32, 1., (2, 3, 6), &device)?;
        let loss = attn.forward(xs.as_tensor(), Some(&context))?.sqr()?.sum_all()?;
        let grads = loss.backward()?;
        for (name, var) in varmap.data().lock().unwrap().iter() {
            let grad = grads.get(var.as_tensor()).expect(name);
            let norm = grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
            assert!(norm > 0., "{name} has a zero gradient");
        }
        assert!(grads.get(xs.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn sliced_attention_matches_the_full_one() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vs = nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let full = CrossAttention::new(vs.clone(), 8, None, 4, 2, None)?;
        let sliced = CrossAttention::new(vs, 8, None, 4, 2, Some(3))?;
        let xs = Tensor::randn(0f32, 1., (2, 5, 8), &device)?;
        let a = full.forward(&xs, None)?;
        let b = sliced.forward(&xs, None)?;
        assert_eq!(b.dims(), &[2, 5, 8]);
        let diff = (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "{diff}");
        Ok(())
    }

    #[test]
    fn f32_projection_runs_on_half_inputs() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vs = nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let proj = Projection::new(vs, 4, 3, true)?;
        let xs = Tensor::ones((2, 5, 4), DType::F16, &device)?;
        let ys = proj.forward(&xs)?;
        assert_eq!(ys.dtype(), DType::F16);
        assert_eq!(ys.dims(), &[2, 5, 3]);
        Ok(())
    }
}
