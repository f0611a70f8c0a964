// src/core/step_context.rs
use crate::core::block_addressor::{batch_slot_mapping, block_tables_tensor};
use crate::core::error::CoreError;
use crate::core::sequence::{validate_batch, SequenceMeta};
use candle_core::{DType, Device, Result, Tensor};
use once_cell::unsync::OnceCell;
use std::ops::Range;

/// Length metadata in the representation a policy hands to the kernel.
///
/// Tensors live on `device`, which is the host for policies that index on the CPU
/// and the compute device otherwise.
#[derive(Debug, Clone)]
pub struct SeqLenMetadata {
    pub device: Device,
    /// Cumulative query offsets, `[batch + 1]`.
    pub cu_seqlens_q: Tensor,
    pub q_seq_lens: Tensor,
    pub kv_seq_lens: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeParams {
    pub head_dim: usize,
    pub theta: f64,
}

/// Everything the attention kernel needs for one step beyond q/k/v.
///
/// Built fresh at step start and dropped at step end. Derived values such as the
/// rotary tables are filled lazily on first use and die with the context.
pub struct StepContext {
    pub block_size: usize,
    pub history_lens: Vec<usize>,
    pub q_seq_lens: Vec<usize>,
    pub kv_seq_lens: Vec<usize>,
    /// Offset of each request's first token in the flattened batch.
    pub q_start_loc: Vec<usize>,
    pub max_q_seq_len: usize,
    pub max_kv_seq_len: usize,
    /// Block capacity span (`num_blocks * block_size`) per request.
    pub block_spans: Vec<usize>,
    /// Host copy of `kv_start_indices`.
    pub slots: Vec<i64>,
    /// Flat cache slot for every new token, `[num_tokens]` i64.
    pub kv_start_indices: Tensor,
    /// Absolute position of every new token, `[num_tokens]` i64.
    pub positions: Tensor,
    /// Zero-padded block tables, `[batch, max_blocks]` u32.
    pub block_tables: Tensor,
    /// Unpadded host copy of each request's block table.
    pub host_block_tables: Vec<Vec<u32>>,
    pub seqlens: SeqLenMetadata,
    /// One `[query_len, block_span]` u8 mask per request (1 = excluded), when the
    /// policy materializes masks.
    pub attention_mask: Option<Vec<Tensor>>,
    pub is_decoding: bool,
    pub is_unpaged_prefill: bool,
    rotary: OnceCell<(RopeParams, Tensor, Tensor)>,
}

pub(crate) enum MaskMode {
    Dense,
    Implicit,
}

/// Causal mask of one request: `(i, j)` is excluded iff `j > history_len + i`.
pub fn causal_mask_u8(history_len: usize, query_len: usize, span: usize) -> Vec<u8> {
    let mut mask = vec![0u8; query_len * span];
    for i in 0..query_len {
        let visible = (history_len + i + 1).min(span);
        for m in &mut mask[i * span + visible..(i + 1) * span] {
            *m = 1;
        }
    }
    mask
}

impl StepContext {
    pub(crate) fn assemble(
        seqs: &[SequenceMeta],
        block_size: usize,
        device: &Device,
        metadata_device: &Device,
        mask_mode: MaskMode,
    ) -> Result<Self> {
        if seqs.is_empty() {
            return Err(CoreError::InvalidConfig("empty batch".to_string()).into());
        }
        validate_batch(seqs, block_size)?;

        let history_lens: Vec<usize> = seqs.iter().map(|s| s.history_len).collect();
        let q_seq_lens: Vec<usize> = seqs.iter().map(|s| s.query_len).collect();
        let kv_seq_lens: Vec<usize> = seqs.iter().map(|s| s.kv_len()).collect();
        let block_spans: Vec<usize> = seqs
            .iter()
            .map(|s| s.block_capacity_span(block_size))
            .collect();

        let mut q_start_loc = Vec::with_capacity(seqs.len());
        let mut cu_seqlens_q = vec![0u32];
        let mut positions: Vec<i64> = Vec::new();
        for seq in seqs {
            q_start_loc.push(*cu_seqlens_q.last().unwrap_or(&0) as usize);
            cu_seqlens_q.push(cu_seqlens_q.last().unwrap_or(&0) + seq.query_len as u32);
            positions.extend(seq.history_len as i64..seq.kv_len() as i64);
        }

        let slots = batch_slot_mapping(seqs, block_size)?;
        let num_tokens = slots.len();
        let kv_start_indices = Tensor::from_vec(slots.clone(), (num_tokens,), device)?;
        let positions = Tensor::from_vec(positions, (num_tokens,), device)?;
        let block_tables = block_tables_tensor(seqs, device)?;

        let batch = seqs.len();
        let seqlens = SeqLenMetadata {
            device: metadata_device.clone(),
            cu_seqlens_q: Tensor::from_vec(cu_seqlens_q, (batch + 1,), metadata_device)?,
            q_seq_lens: Tensor::from_vec(
                q_seq_lens.iter().map(|&l| l as u32).collect::<Vec<_>>(),
                (batch,),
                metadata_device,
            )?,
            kv_seq_lens: Tensor::from_vec(
                kv_seq_lens.iter().map(|&l| l as u32).collect::<Vec<_>>(),
                (batch,),
                metadata_device,
            )?,
        };

        let attention_mask = match mask_mode {
            MaskMode::Dense => {
                use rayon::iter::{IntoParallelIterator, ParallelIterator};
                let masks = (0..batch)
                    .into_par_iter()
                    .map(|i| {
                        let data = causal_mask_u8(history_lens[i], q_seq_lens[i], block_spans[i]);
                        Tensor::from_vec(data, (q_seq_lens[i], block_spans[i]), device)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some(masks)
            }
            MaskMode::Implicit => None,
        };

        let is_decoding = seqs.iter().all(|s| s.query_len == 1 && s.history_len > 0);
        let is_unpaged_prefill = !is_decoding && seqs.iter().all(|s| s.query_len == s.kv_len());

        let ctx = Self {
            block_size,
            max_q_seq_len: q_seq_lens.iter().copied().max().unwrap_or(0),
            max_kv_seq_len: kv_seq_lens.iter().copied().max().unwrap_or(0),
            history_lens,
            q_seq_lens,
            kv_seq_lens,
            q_start_loc,
            block_spans,
            slots,
            kv_start_indices,
            positions,
            block_tables,
            host_block_tables: seqs.iter().map(|s| s.block_table.clone()).collect(),
            seqlens,
            attention_mask,
            is_decoding,
            is_unpaged_prefill,
            rotary: OnceCell::new(),
        };
        tracing::debug!(
            "step context: {} requests, {} tokens, max_q {}, max_kv {}, decoding {}, unpaged prefill {}, dense mask {}",
            batch,
            num_tokens,
            ctx.max_q_seq_len,
            ctx.max_kv_seq_len,
            ctx.is_decoding,
            ctx.is_unpaged_prefill,
            ctx.attention_mask.is_some()
        );
        Ok(ctx)
    }

    pub fn num_seqs(&self) -> usize {
        self.q_seq_lens.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.slots.len()
    }

    /// Rows of request `seq_idx` in the flattened token batch.
    pub fn query_range(&self, seq_idx: usize) -> Range<usize> {
        let start = self.q_start_loc[seq_idx];
        start..start + self.q_seq_lens[seq_idx]
    }

    /// Algebraic form of the causal boundary, identical to the dense mask.
    pub fn is_masked(&self, seq_idx: usize, i: usize, j: usize) -> bool {
        j > self.history_lens[seq_idx] + i
    }

    /// Number of cache positions query token `i` of `seq_idx` may attend to.
    pub fn visible_len(&self, seq_idx: usize, i: usize) -> usize {
        self.history_lens[seq_idx] + i + 1
    }

    /// Per-token rotary `(cos, sin)`, each `[num_tokens, head_dim / 2]` f32.
    ///
    /// Computed once per step for `max_kv_seq_len` positions.
    pub fn rotary_cos_sin(&self, rope: RopeParams) -> Result<(&Tensor, &Tensor)> {
        let (cached, cos, sin) = self.rotary.get_or_try_init(|| {
            let device = self.positions.device();
            let half = rope.head_dim / 2;
            if half == 0 {
                return Err(candle_core::Error::from(CoreError::InvalidConfig(
                    "rope head_dim must be >= 2".to_string(),
                )));
            }
            let inv_freq: Vec<f32> = (0..half)
                .map(|i| 1f32 / rope.theta.powf(2.0 * i as f64 / rope.head_dim as f64) as f32)
                .collect();
            let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
            let t = Tensor::arange(0u32, self.max_kv_seq_len as u32, device)?
                .to_dtype(DType::F32)?
                .reshape((self.max_kv_seq_len, 1))?;
            let freqs = t.matmul(&inv_freq)?;
            let cos = freqs.cos()?.index_select(&self.positions, 0)?;
            let sin = freqs.sin()?.index_select(&self.positions, 0)?;
            Ok::<_, candle_core::Error>((rope, cos, sin))
        })?;
        if *cached != rope {
            return Err(CoreError::InvalidConfig(format!(
                "rotary tables already built for {:?}, requested {:?}",
                cached, rope
            ))
            .into());
        }
        Ok((cos, sin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(seqs: &[SequenceMeta], mode: MaskMode) -> StepContext {
        StepContext::assemble(seqs, 4, &Device::Cpu, &Device::Cpu, mode).unwrap()
    }

    #[test]
    fn test_causal_mask_without_history_is_lower_triangular() {
        let mask = causal_mask_u8(0, 3, 4);
        assert_eq!(mask, vec![0, 1, 1, 1, 0, 0, 1, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn test_causal_mask_with_history() {
        let (h, q, span) = (5, 3, 12);
        let mask = causal_mask_u8(h, q, span);
        for i in 0..q {
            for j in 0..span {
                assert_eq!(mask[i * span + j] == 1, j > h + i, "i={i} j={j}");
            }
        }
    }

    #[test]
    fn test_offsets_positions_and_slots() {
        let seqs = vec![
            SequenceMeta::new(0, 3, vec![2]),
            SequenceMeta::new(6, 2, vec![1, 3]),
        ];
        let ctx = build(&seqs, MaskMode::Dense);
        assert_eq!(ctx.q_start_loc, vec![0, 3]);
        assert_eq!(ctx.query_range(1), 3..5);
        assert_eq!(ctx.kv_seq_lens, vec![3, 8]);
        assert_eq!(ctx.max_q_seq_len, 3);
        assert_eq!(ctx.max_kv_seq_len, 8);
        assert_eq!(
            ctx.positions.to_vec1::<i64>().unwrap(),
            vec![0, 1, 2, 6, 7]
        );
        assert_eq!(
            ctx.kv_start_indices.to_vec1::<i64>().unwrap(),
            vec![8, 9, 10, 14, 15]
        );
        assert_eq!(
            ctx.seqlens.cu_seqlens_q.to_vec1::<u32>().unwrap(),
            vec![0, 3, 5]
        );
        assert_eq!(ctx.block_tables.dims(), &[2, 2]);
        assert!(!ctx.is_unpaged_prefill);
        assert!(!ctx.is_decoding);

        let masks = ctx.attention_mask.as_ref().unwrap();
        assert_eq!(masks[0].dims(), &[3, 4]);
        assert_eq!(masks[1].dims(), &[2, 8]);
        let m1 = masks[1].to_vec2::<u8>().unwrap();
        for (i, row) in m1.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                assert_eq!(*v == 1, ctx.is_masked(1, i, j));
            }
        }
    }

    #[test]
    fn test_unpaged_prefill_flag() {
        let prefill = vec![
            SequenceMeta::new(0, 3, vec![0]),
            SequenceMeta::new(0, 5, vec![1, 2]),
        ];
        assert!(build(&prefill, MaskMode::Implicit).is_unpaged_prefill);

        let mixed = vec![
            SequenceMeta::new(0, 3, vec![0]),
            SequenceMeta::new(1, 1, vec![1]),
        ];
        let ctx = build(&mixed, MaskMode::Implicit);
        assert!(!ctx.is_unpaged_prefill);
        assert!(ctx.attention_mask.is_none());

        let decode = vec![
            SequenceMeta::new(4, 1, vec![0, 1]),
            SequenceMeta::new(9, 1, vec![2, 3, 4]),
        ];
        let ctx = build(&decode, MaskMode::Implicit);
        assert!(ctx.is_decoding);
        assert!(!ctx.is_unpaged_prefill);
    }

    #[test]
    fn test_inconsistent_batch_fails_fast() {
        let seqs = vec![SequenceMeta::new(7, 2, vec![0, 1])];
        let res = StepContext::assemble(&seqs, 4, &Device::Cpu, &Device::Cpu, MaskMode::Dense);
        let err = res.err().unwrap();
        assert!(err.to_string().contains("out of bounds"), "{err}");
        let empty: Vec<SequenceMeta> = vec![];
        assert!(
            StepContext::assemble(&empty, 4, &Device::Cpu, &Device::Cpu, MaskMode::Dense).is_err()
        );
    }

    #[test]
    fn test_rotary_tables_cached_per_step() {
        let seqs = vec![SequenceMeta::new(2, 2, vec![0])];
        let ctx = build(&seqs, MaskMode::Implicit);
        let rope = RopeParams {
            head_dim: 4,
            theta: 10000.0,
        };
        let (cos, sin) = ctx.rotary_cos_sin(rope).unwrap();
        assert_eq!(cos.dims(), &[2, 2]);
        let cos = cos.to_vec2::<f32>().unwrap();
        let sin = sin.to_vec2::<f32>().unwrap();
        // position 2, frequency 0 has inv_freq 1
        assert!((cos[0][0] - 2f32.cos()).abs() < 1e-6);
        assert!((sin[1][0] - 3f32.sin()).abs() < 1e-6);

        let other = RopeParams {
            head_dim: 8,
            theta: 10000.0,
        };
        assert!(ctx.rotary_cos_sin(other).is_err());
        assert!(ctx.rotary_cos_sin(rope).is_ok());
    }
}
