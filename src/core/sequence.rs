// src/core/sequence.rs
use crate::core::error::CoreError;

/// Per-request view of one execution step.
///
/// `block_table` is owned by the external block allocator; the core only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceMeta {
    /// Tokens already resident in the cache before this step.
    pub history_len: usize,
    /// New tokens processed in this step (1 when decoding).
    pub query_len: usize,
    /// Physical block indices, in logical order.
    pub block_table: Vec<u32>,
}

impl SequenceMeta {
    pub fn new(history_len: usize, query_len: usize, block_table: Vec<u32>) -> Self {
        Self {
            history_len,
            query_len,
            block_table,
        }
    }

    pub fn kv_len(&self) -> usize {
        self.history_len + self.query_len
    }

    pub fn num_blocks(&self) -> usize {
        self.block_table.len()
    }

    /// Blocks needed to hold `kv_len` tokens.
    pub fn num_required_blocks(&self, block_size: usize) -> usize {
        self.kv_len().div_ceil(block_size)
    }

    /// Cache positions addressable through this request's blocks.
    pub fn block_capacity_span(&self, block_size: usize) -> usize {
        self.block_table.len() * block_size
    }

    pub fn is_prefill(&self) -> bool {
        self.history_len == 0
    }

    /// Checks the allocator contract for this request; `seq_idx` is only used for reporting.
    pub fn validate(&self, seq_idx: usize, block_size: usize) -> Result<(), CoreError> {
        if block_size == 0 {
            return Err(CoreError::InvalidConfig("block_size must be > 0".to_string()));
        }
        if self.query_len == 0 {
            return Err(CoreError::InvalidConfig(format!(
                "request {seq_idx} has no new tokens in this step"
            )));
        }
        let required = self.num_required_blocks(block_size);
        if required > self.block_table.len() {
            return Err(CoreError::BlockTableOutOfBounds {
                seq_idx,
                block_idx: required - 1,
                num_blocks: self.block_table.len(),
            });
        }
        Ok(())
    }
}

/// Validates every request of a step before anything is built from it.
pub fn validate_batch(seqs: &[SequenceMeta], block_size: usize) -> Result<(), CoreError> {
    for (i, seq) in seqs.iter().enumerate() {
        seq.validate(i, block_size)?;
    }
    Ok(())
}
