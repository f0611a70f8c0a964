// src/core/kv_cache.rs
use crate::core::block_addressor::slot_mapping;
use crate::core::error::CoreError;
use candle_core::{DType, Device, Result, Tensor};

/// One layer's paged key/value pool, `[num_blocks, block_size, num_kv_heads, head_dim]`.
///
/// Blocks are handed out by an external allocator; this type only writes and reads
/// the slots it is given.
pub struct PagedKvCache {
    key: Tensor,
    value: Tensor,
    num_blocks: usize,
    block_size: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl PagedKvCache {
    pub fn new(
        num_blocks: usize,
        block_size: usize,
        num_kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if num_blocks == 0 || block_size == 0 {
            return Err(CoreError::InvalidConfig(format!(
                "kv cache needs blocks (num_blocks={num_blocks}, block_size={block_size})"
            ))
            .into());
        }
        let shape = (num_blocks, block_size, num_kv_heads, head_dim);
        Ok(Self {
            key: Tensor::zeros(shape, dtype, device)?,
            value: Tensor::zeros(shape, dtype, device)?,
            num_blocks,
            block_size,
            num_kv_heads,
            head_dim,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    pub fn dtype(&self) -> DType {
        self.key.dtype()
    }

    pub fn device(&self) -> &Device {
        self.key.device()
    }

    pub fn key_blocks(&self) -> &Tensor {
        &self.key
    }

    pub fn value_blocks(&self) -> &Tensor {
        &self.value
    }

    fn check_kv(&self, name: &'static str, xs: &Tensor, num_tokens: usize) -> Result<()> {
        let expected = vec![num_tokens, self.num_kv_heads, self.head_dim];
        if xs.dims() != expected.as_slice() {
            return Err(CoreError::ShapeMismatch {
                name,
                expected,
                actual: xs.dims().to_vec(),
            }
            .into());
        }
        Ok(())
    }

    /// Stores `k`/`v` (`[num_tokens, num_kv_heads, head_dim]`) at `slots`, in place.
    ///
    /// Slots must be distinct. Everything is validated before the pool is touched,
    /// so a rejected write leaves the cache unchanged.
    pub fn write(&mut self, slots: &Tensor, k: &Tensor, v: &Tensor) -> Result<()> {
        let num_tokens = slots.dim(0)?;
        self.check_kv("key", k, num_tokens)?;
        self.check_kv("value", v, num_tokens)?;
        let num_slots = self.num_slots() as i64;
        let host_slots = slots.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        if let Some(bad) = host_slots.iter().find(|&&s| s < 0 || s >= num_slots) {
            return Err(CoreError::InvalidConfig(format!(
                "slot {bad} outside cache of {num_slots} slots"
            ))
            .into());
        }
        let mut sorted = host_slots.clone();
        sorted.sort_unstable();
        if let Some(dup) = sorted.windows(2).find(|w| w[0] == w[1]) {
            crate::log_error!("slot {} is written twice in one step", dup[0]);
            return Err(CoreError::InvalidConfig(format!(
                "slot {} written by more than one token (aliased block tables?)",
                dup[0]
            ))
            .into());
        }

        let width = self.num_kv_heads * self.head_dim;
        let runs = slot_runs(&host_slots);
        let store = |cache: &Tensor, xs: &Tensor| -> Result<()> {
            // Shares storage with the pool, so slice_set lands in the cache itself.
            let flat = cache.reshape((self.num_slots(), width))?;
            let src = xs.reshape((num_tokens, width))?.to_dtype(flat.dtype())?;
            for &(token, slot, len) in &runs {
                flat.slice_set(&src.narrow(0, token, len)?.contiguous()?, 0, slot)?;
            }
            Ok(())
        };
        store(&self.key, k)?;
        store(&self.value, v)?;
        Ok(())
    }

    /// Keys and values stored at `slots`, `[n, num_kv_heads, head_dim]` each.
    pub fn gather(&self, slots: &Tensor) -> Result<(Tensor, Tensor)> {
        let n = slots.dim(0)?;
        let width = self.num_kv_heads * self.head_dim;
        let slots = slots.to_dtype(DType::I64)?;
        let read = |cache: &Tensor| -> Result<Tensor> {
            cache
                .reshape((self.num_slots(), width))?
                .index_select(&slots, 0)?
                .reshape((n, self.num_kv_heads, self.head_dim))
        };
        Ok((read(&self.key)?, read(&self.value)?))
    }

    /// Logical positions `[0, len)` of a request, resolved through its block table.
    pub fn read_positions(&self, block_table: &[u32], len: usize) -> Result<(Tensor, Tensor)> {
        let slots = slot_mapping(0, len, self.block_size, block_table)?;
        let slots = Tensor::from_vec(slots, (len,), self.device())?;
        self.gather(&slots)
    }

    /// Every position of the request's blocks, `[num_blocks * block_size, ...]`.
    pub fn read_span(&self, block_table: &[u32]) -> Result<(Tensor, Tensor)> {
        self.read_positions(block_table, block_table.len() * self.block_size)
    }
}

/// Maximal runs of consecutive slots as `(first_token, first_slot, len)`.
fn slot_runs(slots: &[i64]) -> Vec<(usize, usize, usize)> {
    let mut runs: Vec<(usize, usize, usize)> = Vec::new();
    for (token, &slot) in slots.iter().enumerate() {
        let slot = slot as usize;
        match runs.last_mut() {
            Some((_, first, len)) if *first + *len == slot => *len += 1,
            _ => runs.push((token, slot, 1)),
        }
    }
    runs
}
