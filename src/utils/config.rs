// src/utils/config.rs
use crate::core::device_policy::DevicePolicyKind;
use crate::core::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_act() -> candle_nn::Activation {
    candle_nn::Activation::Silu
}

fn default_rope_theta() -> f64 {
    10000.0
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MoEConfig {
    pub hidden_size: usize,
    pub moe_intermediate_size: usize,
    #[serde(alias = "num_experts")]
    pub n_routed_experts: usize,
    pub num_experts_per_tok: usize,
    pub n_shared_experts: Option<usize>,
    #[serde(default = "default_act")]
    pub hidden_act: candle_nn::Activation,
    /// Rescale the kept top-k weights to sum to 1. Off by default: raw gate weights are used.
    #[serde(default, alias = "norm_topk_prob")]
    pub renormalize: bool,
}

impl MoEConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.hidden_size == 0 || self.moe_intermediate_size == 0 {
            return Err(CoreError::InvalidConfig(
                "hidden_size and moe_intermediate_size must be > 0".to_string(),
            ));
        }
        if self.num_experts_per_tok == 0 || self.num_experts_per_tok > self.n_routed_experts {
            return Err(CoreError::InvalidConfig(format!(
                "num_experts_per_tok {} must be in [1, {}]",
                self.num_experts_per_tok, self.n_routed_experts
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl ParallelConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.world_size == 0 {
            return Err(CoreError::InvalidConfig("world_size must be > 0".to_string()));
        }
        if self.rank >= self.world_size {
            return Err(CoreError::RankOutOfRange {
                rank: self.rank,
                world_size: self.world_size,
            });
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub block_size: usize,
    pub num_blocks: usize,
    #[serde(default)]
    pub device_policy: DevicePolicyKind,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_blocks: 64,
            device_policy: DevicePolicyKind::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.block_size == 0 || self.num_blocks == 0 {
            return Err(CoreError::InvalidConfig(format!(
                "cache needs blocks (block_size={}, num_blocks={})",
                self.block_size, self.num_blocks
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AttentionConfig {
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
}

impl AttentionConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.head_dim == 0
            || self.num_key_value_heads == 0
            || self.num_attention_heads % self.num_key_value_heads != 0
        {
            return Err(CoreError::InvalidConfig(format!(
                "bad head layout: {} heads, {} kv heads, head_dim {}",
                self.num_attention_heads, self.num_key_value_heads, self.head_dim
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    pub moe: MoEConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub attention: AttentionConfig,
    pub seed: Option<u64>,
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> candle_core::Result<Self> {
        let path = path.as_ref();
        tracing::info!("loading config {}", path.display());
        let file = std::fs::File::open(path)?;
        let cfg: EngineConfig = serde_json::from_reader(file).map_err(candle_core::Error::wrap)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.moe.validate()?;
        self.parallel.validate()?;
        self.cache.validate()?;
        self.attention.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            moe: MoEConfig {
                hidden_size: 64,
                moe_intermediate_size: 32,
                n_routed_experts: 8,
                num_experts_per_tok: 2,
                n_shared_experts: Some(1),
                hidden_act: default_act(),
                renormalize: false,
            },
            parallel: ParallelConfig::default(),
            cache: CacheConfig::default(),
            attention: AttentionConfig {
                num_attention_heads: 8,
                num_key_value_heads: 2,
                head_dim: 16,
                rope_theta: default_rope_theta(),
            },
            seed: None,
        }
    }
}
