pub mod config;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Result};
use config::AttentionConfig;

pub fn new_device(ordinal: usize) -> Result<Device> {
    if cuda_is_available() {
        Device::new_cuda(ordinal)
    } else if metal_is_available() {
        Device::new_metal(ordinal)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Number of cache blocks that fit in `kvcache_mem_mb` for one layer's key and value pools.
pub fn get_kvcache_blocks(
    kvcache_mem_mb: usize,
    block_size: usize,
    attention: &AttentionConfig,
    dtype: DType,
) -> usize {
    const SIZE_IN_MB: usize = 1024 * 1024;
    kvcache_mem_mb * SIZE_IN_MB
        / dtype.size_in_bytes()
        / block_size
        / attention.num_key_value_heads
        / attention.head_dim
        / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kvcache_block_budget() {
        let attn = AttentionConfig {
            num_attention_heads: 8,
            num_key_value_heads: 2,
            head_dim: 64,
            rope_theta: 10000.0,
        };
        // 1 MiB / 2 bytes / 16 tokens / 2 heads / 64 dims / (k + v)
        assert_eq!(get_kvcache_blocks(1, 16, &attn, DType::F16), 128);
        assert_eq!(get_kvcache_blocks(1, 16, &attn, DType::F32), 64);
    }
}
