// src/core/block_addressor.rs
use crate::core::error::CoreError;
use crate::core::sequence::SequenceMeta;
use candle_core::{Device, Result, Tensor};

/// Flat cache slots for the `query_len` new tokens of one request.
///
/// Logical position `p` lives in block `block_table[p / block_size]` at offset
/// `p % block_size`; the slot is `block * block_size + offset`. The block index is
/// advanced only after the token that fills a block has been emitted.
pub fn slot_mapping(
    history_len: usize,
    query_len: usize,
    block_size: usize,
    block_table: &[u32],
) -> std::result::Result<Vec<i64>, CoreError> {
    slot_mapping_for(0, history_len, query_len, block_size, block_table)
}

fn slot_mapping_for(
    seq_idx: usize,
    history_len: usize,
    query_len: usize,
    block_size: usize,
    block_table: &[u32],
) -> std::result::Result<Vec<i64>, CoreError> {
    if block_size == 0 {
        return Err(CoreError::InvalidConfig("block_size must be > 0".to_string()));
    }
    let lookup = |block_idx: usize| {
        block_table
            .get(block_idx)
            .copied()
            .ok_or(CoreError::BlockTableOutOfBounds {
                seq_idx,
                block_idx,
                num_blocks: block_table.len(),
            })
    };

    let mut slots = Vec::with_capacity(query_len);
    if query_len == 0 {
        return Ok(slots);
    }
    let mut block_idx = history_len / block_size;
    let mut token_offset = history_len % block_size;
    let mut block = lookup(block_idx)?;
    for i in 0..query_len {
        slots.push(block as i64 * block_size as i64 + token_offset as i64);
        if i == query_len - 1 {
            break;
        }
        token_offset = (token_offset + 1) % block_size;
        if token_offset == 0 {
            block_idx += 1;
        }
        block = lookup(block_idx)?;
    }
    Ok(slots)
}

/// Slots for every new token of the step, flattened in request order.
pub fn batch_slot_mapping(
    seqs: &[SequenceMeta],
    block_size: usize,
) -> std::result::Result<Vec<i64>, CoreError> {
    let total: usize = seqs.iter().map(|s| s.query_len).sum();
    let mut slots = Vec::with_capacity(total);
    for (i, seq) in seqs.iter().enumerate() {
        slots.extend(slot_mapping_for(
            i,
            seq.history_len,
            seq.query_len,
            block_size,
            &seq.block_table,
        )?);
    }
    Ok(slots)
}

/// Block tables right-padded with zeros to `[batch, max_blocks]`.
pub fn padded_block_tables(seqs: &[SequenceMeta]) -> (Vec<u32>, usize) {
    let max_len = seqs
        .iter()
        .map(|seq| seq.block_table.len())
        .max()
        .unwrap_or(0);

    let mut flat: Vec<u32> = Vec::with_capacity(seqs.len() * max_len);
    for seq in seqs {
        let bt = &seq.block_table;
        flat.extend_from_slice(bt);
        flat.extend(std::iter::repeat(0).take(max_len - bt.len()));
    }
    (flat, max_len)
}

pub fn block_tables_tensor(seqs: &[SequenceMeta], device: &Device) -> Result<Tensor> {
    let (flat, max_len) = padded_block_tables(seqs);
    Tensor::from_vec(flat, (seqs.len(), max_len), device)
}
