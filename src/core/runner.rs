// src/core/runner.rs
use crate::core::device_policy::StepContextBuilder;
use crate::core::error::CoreError;
use crate::core::kv_cache::PagedKvCache;
use crate::core::sequence::SequenceMeta;
use crate::core::step_context::StepContext;
use crate::models::layers::attention::PagedAttention;
use crate::utils::config::{AttentionConfig, CacheConfig};
use candle_core::{DType, Device, Result, Tensor};

/// Drives one attention layer through execution steps.
///
/// Per step: build the context, reject inconsistent q/k/v, commit the new keys and
/// values to the cache, then attend over the cache.
pub struct StepRunner {
    cache: PagedKvCache,
    policy: Box<dyn StepContextBuilder>,
    attention: PagedAttention,
    device: Device,
}

impl StepRunner {
    pub fn new(
        cache_config: &CacheConfig,
        attention_config: &AttentionConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let attention = PagedAttention::new(
            attention_config.num_attention_heads,
            attention_config.num_key_value_heads,
            attention_config.head_dim,
        )?;
        let cache = PagedKvCache::new(
            cache_config.num_blocks,
            cache_config.block_size,
            attention_config.num_key_value_heads,
            attention_config.head_dim,
            dtype,
            device,
        )?;
        let policy = cache_config.device_policy.builder();
        crate::log_info!(
            "step runner: {} blocks of {} tokens, policy {}",
            cache_config.num_blocks,
            cache_config.block_size,
            policy.name()
        );
        Ok(Self {
            cache,
            policy,
            attention,
            device: device.clone(),
        })
    }

    pub fn cache(&self) -> &PagedKvCache {
        &self.cache
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn build_context(&self, seqs: &[SequenceMeta]) -> Result<StepContext> {
        self.policy
            .build(seqs, self.cache.block_size(), &self.device)
    }

    fn check_inputs(&self, ctx: &StepContext, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<()> {
        let num_tokens = ctx.num_tokens();
        let head_dim = self.attention.head_dim();
        let kv_shape = vec![num_tokens, self.attention.num_kv_heads(), head_dim];
        for (name, xs, expected) in [
            (
                "query",
                q,
                vec![num_tokens, self.attention.num_heads(), head_dim],
            ),
            ("key", k, kv_shape.clone()),
            ("value", v, kv_shape),
        ] {
            if xs.dims() != expected.as_slice() {
                crate::log_error!("{} has shape {:?}, step expects {:?}", name, xs.dims(), expected);
                return Err(CoreError::ShapeMismatch {
                    name,
                    expected,
                    actual: xs.dims().to_vec(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Runs one step: `q` is `[num_tokens, num_heads, head_dim]`, `k`/`v` are
    /// `[num_tokens, num_kv_heads, head_dim]`, rows ordered as `seqs`.
    pub fn run(
        &mut self,
        seqs: &[SequenceMeta],
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<Tensor> {
        let ctx = self.build_context(seqs)?;
        self.check_inputs(&ctx, q, k, v)?;
        self.cache.write(&ctx.kv_start_indices, k, v)?;
        self.attention.forward(q, k, v, &self.cache, &ctx)
    }
}
