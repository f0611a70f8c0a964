use crate::core::error::CoreError;
use crate::core::kv_cache::PagedKvCache;
use crate::core::step_context::StepContext;
use candle_core::{DType, Result, Tensor};

/// Reference paged attention over a [`PagedKvCache`].
///
/// Reads each request's keys and values through its block table and applies the
/// step's causal boundary, either from the materialized masks or from the
/// history/query lengths when the policy left masking to the kernel.
pub struct PagedAttention {
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f32,
}

fn repeat_kv(xs: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(xs.clone());
    }
    let (kv_heads, len, dim) = xs.dims3()?;
    xs.unsqueeze(1)?
        .broadcast_as((kv_heads, n_rep, len, dim))?
        .contiguous()?
        .reshape((kv_heads * n_rep, len, dim))
}

impl PagedAttention {
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Result<Self> {
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(CoreError::InvalidConfig(format!(
                "num_heads {num_heads} is not a multiple of num_kv_heads {num_kv_heads}"
            ))
            .into());
        }
        Ok(Self {
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1. / (head_dim as f32).sqrt(),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Mask `[q_len, kv_len]` (1 = excluded) for request `seq_idx`.
    fn request_mask(&self, ctx: &StepContext, seq_idx: usize, kv_len: usize) -> Result<Tensor> {
        let q_len = ctx.q_seq_lens[seq_idx];
        if let Some(masks) = &ctx.attention_mask {
            return masks[seq_idx].narrow(1, 0, kv_len);
        }
        let device = ctx.positions.device();
        let cols = Tensor::arange(0u32, kv_len as u32, device)?.reshape((1, kv_len))?;
        let history = ctx.history_lens[seq_idx] as u32;
        let limits =
            Tensor::arange(history, history + q_len as u32, device)?.reshape((q_len, 1))?;
        cols.broadcast_gt(&limits)
    }

    /// `q` is `[num_tokens, num_heads, head_dim]`, `k`/`v` are the step's new
    /// `[num_tokens, num_kv_heads, head_dim]`, already written to `cache`.
    /// Returns `[num_tokens, num_heads, head_dim]`.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cache: &PagedKvCache,
        ctx: &StepContext,
    ) -> Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        let mut outputs = Vec::with_capacity(ctx.num_seqs());
        for seq_idx in 0..ctx.num_seqs() {
            let range = ctx.query_range(seq_idx);
            let q_len = range.len();
            let (keys, values) = if ctx.is_unpaged_prefill {
                (
                    k.narrow(0, range.start, q_len)?,
                    v.narrow(0, range.start, q_len)?,
                )
            } else {
                cache.read_span(&ctx.host_block_tables[seq_idx])?
            };
            let kv_len = keys.dim(0)?;

            let q_s = q
                .narrow(0, range.start, q_len)?
                .transpose(0, 1)?
                .contiguous()?
                .to_dtype(DType::F32)?;
            let keys = repeat_kv(&keys.transpose(0, 1)?.contiguous()?, n_rep)?.to_dtype(DType::F32)?;
            let values =
                repeat_kv(&values.transpose(0, 1)?.contiguous()?, n_rep)?.to_dtype(DType::F32)?;

            let scores = (q_s.matmul(&keys.t()?)? * self.scale as f64)?;
            let mask = self
                .request_mask(ctx, seq_idx, kv_len)?
                .unsqueeze(0)?
                .broadcast_as(scores.shape())?
                .contiguous()?;
            let neg_inf = Tensor::new(f32::NEG_INFINITY, scores.device())?
                .broadcast_as(scores.shape())?
                .contiguous()?;
            let scores = mask.where_cond(&neg_inf, &scores)?;
            let probs = candle_nn::ops::softmax_last_dim(&scores)?;
            let out = probs.matmul(&values)?.transpose(0, 1)?.contiguous()?.to_dtype(q.dtype())?;
            outputs.push(out);
        }
        Tensor::cat(&outputs, 0)?.contiguous()
    }
}
