use thiserror::Error;

/// Contract failures raised by the step/expert core.
///
/// These are never retried: they point at a misconfigured caller and abort the
/// step before anything is written to the cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error(
        "block table out of bounds: request {seq_idx} needs block {block_idx} but owns {num_blocks}"
    )]
    BlockTableOutOfBounds {
        seq_idx: usize,
        block_idx: usize,
        num_blocks: usize,
    },
    #[error("rank out of range (rank={rank}, world_size={world_size})")]
    RankOutOfRange { rank: usize, world_size: usize },
    #[error("rank {rank} owns no experts ({num_experts} experts over {world_size} ranks)")]
    EmptyExpertShard {
        rank: usize,
        num_experts: usize,
        world_size: usize,
    },
    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl From<CoreError> for candle_core::Error {
    fn from(e: CoreError) -> Self {
        candle_core::Error::wrap(e)
    }
}
