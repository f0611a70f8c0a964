// src/models/layers/expert_partition.rs
use crate::core::error::CoreError;
use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;
use std::ops::Range;

pub fn div_up(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Experts owned by `rank`: a contiguous slice of `exp_per_rank = ceil(num_experts / world_size)`,
/// clamped to `num_experts`. Trailing ranks may get a shorter or empty range.
pub fn expert_range(
    num_experts: usize,
    world_size: usize,
    rank: usize,
) -> std::result::Result<Range<usize>, CoreError> {
    if world_size == 0 {
        return Err(CoreError::InvalidConfig("world_size must be > 0".to_string()));
    }
    if rank >= world_size {
        return Err(CoreError::RankOutOfRange { rank, world_size });
    }
    let exp_per_rank = div_up(num_experts, world_size);
    let first = (rank * exp_per_rank).min(num_experts);
    let last = (first + exp_per_rank).min(num_experts);
    Ok(first..last)
}

/// Expert-parallel layout of one MoE layer, identical on every rank for a given
/// `(num_experts, world_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpertPartition {
    pub num_experts: usize,
    pub world_size: usize,
    pub rank: usize,
    pub exp_per_rank: usize,
    pub first_expert: usize,
    pub last_expert: usize,
}

impl ExpertPartition {
    pub fn new(
        num_experts: usize,
        world_size: usize,
        rank: usize,
    ) -> std::result::Result<Self, CoreError> {
        let range = expert_range(num_experts, world_size, rank)?;
        if range.is_empty() {
            return Err(CoreError::EmptyExpertShard {
                rank,
                num_experts,
                world_size,
            });
        }
        Ok(Self {
            num_experts,
            world_size,
            rank,
            exp_per_rank: div_up(num_experts, world_size),
            first_expert: range.start,
            last_expert: range.end,
        })
    }

    /// Global index of local expert 0.
    pub fn expert_offset(&self) -> usize {
        self.rank * self.exp_per_rank
    }

    pub fn num_local(&self) -> usize {
        self.last_expert - self.first_expert
    }

    pub fn local_range(&self) -> Range<usize> {
        self.first_expert..self.last_expert
    }

    pub fn contains(&self, global: usize) -> bool {
        self.local_range().contains(&global)
    }

    pub fn to_local(&self, global: usize) -> Option<usize> {
        if self.contains(global) {
            Some(global - self.expert_offset())
        } else {
            None
        }
    }

    /// `(owning_rank, local_index)` of a global expert, valid on any rank.
    pub fn owner_of(&self, global: usize) -> Option<(usize, usize)> {
        if global >= self.num_experts {
            return None;
        }
        Some((global / self.exp_per_rank, global % self.exp_per_rank))
    }
}

/// One expert's feed-forward weights in `[out, in]` layout.
pub struct ExpertWeights {
    pub gate_proj: Tensor,
    pub up_proj: Tensor,
    pub down_proj: Tensor,
}

/// Locally owned experts stacked by local index:
/// `gate_up` is `[n_local, 2 * ffn, hidden]` (gate rows first), `down` is `[n_local, hidden, ffn]`.
pub struct PackedExpertWeights {
    gate_up: Tensor,
    down: Tensor,
    ffn_dim: usize,
    hidden_dim: usize,
}

impl PackedExpertWeights {
    /// Takes ownership of the per-expert tensors; they are dropped once stacked.
    pub fn pack(experts: Vec<ExpertWeights>) -> Result<Self> {
        let Some(first) = experts.first() else {
            return Err(CoreError::InvalidConfig("no experts to pack".to_string()).into());
        };
        let (ffn_dim, hidden_dim) = first.gate_proj.dims2()?;
        let mut gate_up = Vec::with_capacity(experts.len());
        let mut down = Vec::with_capacity(experts.len());
        for (i, expert) in experts.into_iter().enumerate() {
            for (name, w, expected) in [
                ("gate_proj", &expert.gate_proj, [ffn_dim, hidden_dim]),
                ("up_proj", &expert.up_proj, [ffn_dim, hidden_dim]),
                ("down_proj", &expert.down_proj, [hidden_dim, ffn_dim]),
            ] {
                if w.dims() != expected {
                    crate::log_error!("expert {} {} has shape {:?}", i, name, w.dims());
                    return Err(CoreError::ShapeMismatch {
                        name,
                        expected: expected.to_vec(),
                        actual: w.dims().to_vec(),
                    }
                    .into());
                }
            }
            gate_up.push(Tensor::cat(&[&expert.gate_proj, &expert.up_proj], 0)?);
            down.push(expert.down_proj);
        }
        Ok(Self {
            gate_up: Tensor::stack(&gate_up, 0)?,
            down: Tensor::stack(&down, 0)?,
            ffn_dim,
            hidden_dim,
        })
    }

    /// Loads `experts.{i}.{gate_proj,up_proj,down_proj}.weight` for the local range only;
    /// other experts are never read.
    pub fn load(
        vb: &VarBuilder,
        partition: &ExpertPartition,
        hidden_size: usize,
        moe_intermediate_size: usize,
        dtype: DType,
    ) -> Result<Self> {
        let experts_vb = vb.pp("experts");
        let mut experts = Vec::with_capacity(partition.num_local());
        for i in partition.local_range() {
            let vb = experts_vb.pp(i.to_string());
            let load = |name: &str, shape: (usize, usize)| -> Result<Tensor> {
                vb.pp(name).get(shape, "weight")?.to_dtype(dtype)
            };
            experts.push(ExpertWeights {
                gate_proj: load("gate_proj", (moe_intermediate_size, hidden_size))?,
                up_proj: load("up_proj", (moe_intermediate_size, hidden_size))?,
                down_proj: load("down_proj", (hidden_size, moe_intermediate_size))?,
            });
        }
        let packed = Self::pack(experts)?;
        crate::log_info!(
            "rank {}/{} packed experts [{}, {}) ({} per rank), gate_up {:?}, down {:?}",
            partition.rank,
            partition.world_size,
            partition.first_expert,
            partition.last_expert,
            partition.exp_per_rank,
            packed.gate_up.dims(),
            packed.down.dims()
        );
        Ok(packed)
    }

    pub fn num_experts(&self) -> usize {
        self.gate_up.dims()[0]
    }

    pub fn ffn_dim(&self) -> usize {
        self.ffn_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn gate_up(&self) -> &Tensor {
        &self.gate_up
    }

    pub fn down(&self) -> &Tensor {
        &self.down
    }

    /// `(gate_up, down)` of local expert `local`.
    pub fn expert(&self, local: usize) -> Result<(Tensor, Tensor)> {
        if local >= self.num_experts() {
            candle_core::bail!(
                "local expert {} out of range ({} packed)",
                local,
                self.num_experts()
            );
        }
        Ok((self.gate_up.get(local)?, self.down.get(local)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::collections::HashMap;

    #[test]
    fn test_ranges_cover_all_experts() {
        for num_experts in 1..40usize {
            for world_size in 1..9usize {
                let per_rank = div_up(num_experts, world_size);
                let mut covered = Vec::new();
                let mut non_full = 0;
                for rank in 0..world_size {
                    let r = expert_range(num_experts, world_size, rank).unwrap();
                    if r.len() != per_rank {
                        non_full += 1;
                        // only trailing ranks may be short
                        for later in rank + 1..world_size {
                            let l = expert_range(num_experts, world_size, later).unwrap();
                            assert!(l.len() <= r.len());
                        }
                    }
                    covered.extend(r);
                }
                assert_eq!(covered, (0..num_experts).collect::<Vec<_>>());
                assert!(non_full < world_size || num_experts == 0);
            }
        }
    }

    #[test]
    fn test_eight_experts_two_ranks() {
        let p0 = ExpertPartition::new(8, 2, 0).unwrap();
        let p1 = ExpertPartition::new(8, 2, 1).unwrap();
        assert_eq!(p0.local_range(), 0..4);
        assert_eq!(p1.local_range(), 4..8);
        assert_eq!(p1.expert_offset(), 4);
        assert_eq!(p1.to_local(5), Some(1));
        assert_eq!(p1.to_local(2), None);
        assert_eq!(p0.owner_of(5), Some((1, 1)));
        assert_eq!(p1.owner_of(2), Some((0, 2)));
        assert_eq!(p0.owner_of(8), None);
    }

    #[test]
    fn test_short_last_rank_uses_full_stride() {
        // 10 experts over 4 ranks: 3, 3, 3, 1
        let p3 = ExpertPartition::new(10, 4, 3).unwrap();
        assert_eq!(p3.local_range(), 9..10);
        assert_eq!(p3.expert_offset(), 9);
        assert_eq!(p3.num_local(), 1);
        assert_eq!(p3.to_local(9), Some(0));
    }

    #[test]
    fn test_contract_violations() {
        assert_eq!(
            ExpertPartition::new(8, 2, 2),
            Err(CoreError::RankOutOfRange {
                rank: 2,
                world_size: 2
            })
        );
        // ceil(5 / 4) = 2 leaves rank 3 without experts
        assert_eq!(
            ExpertPartition::new(5, 4, 3),
            Err(CoreError::EmptyExpertShard {
                rank: 3,
                num_experts: 5,
                world_size: 4
            })
        );
        assert!(ExpertPartition::new(5, 0, 0).is_err());
    }

    #[test]
    fn test_load_packs_only_local_experts() {
        let (hidden, ffn) = (3usize, 2usize);
        let mut ts = HashMap::new();
        // rank 0 experts are deliberately absent: loading rank 1 must not touch them.
        for e in 4..8 {
            let v = e as f32;
            ts.insert(
                format!("experts.{e}.gate_proj.weight"),
                Tensor::full(v, (ffn, hidden), &Device::Cpu).unwrap(),
            );
            ts.insert(
                format!("experts.{e}.up_proj.weight"),
                Tensor::full(v + 0.5, (ffn, hidden), &Device::Cpu).unwrap(),
            );
            ts.insert(
                format!("experts.{e}.down_proj.weight"),
                Tensor::full(-v, (hidden, ffn), &Device::Cpu).unwrap(),
            );
        }
        let vb = VarBuilder::from_tensors(ts, DType::F32, &Device::Cpu);
        let p1 = ExpertPartition::new(8, 2, 1).unwrap();
        let packed = PackedExpertWeights::load(&vb, &p1, hidden, ffn, DType::F32).unwrap();
        assert_eq!(packed.num_experts(), 4);
        assert_eq!(packed.gate_up().dims(), &[4, 2 * ffn, hidden]);
        assert_eq!(packed.down().dims(), &[4, hidden, ffn]);

        let (gate_up, down) = packed.expert(1).unwrap();
        let gate_up = gate_up.to_vec2::<f32>().unwrap();
        assert_eq!(gate_up[0], vec![5.0; hidden]);
        assert_eq!(gate_up[ffn], vec![5.5; hidden]);
        assert_eq!(down.to_vec2::<f32>().unwrap()[0], vec![-5.0; ffn]);
        assert!(packed.expert(4).is_err());

        let p0 = ExpertPartition::new(8, 2, 0).unwrap();
        assert!(PackedExpertWeights::load(&vb, &p0, hidden, ffn, DType::F32).is_err());
    }

    #[test]
    fn test_pack_rejects_mismatched_shapes() {
        let dev = Device::Cpu;
        let good = ExpertWeights {
            gate_proj: Tensor::zeros((2, 3), DType::F32, &dev).unwrap(),
            up_proj: Tensor::zeros((2, 3), DType::F32, &dev).unwrap(),
            down_proj: Tensor::zeros((3, 2), DType::F32, &dev).unwrap(),
        };
        let bad = ExpertWeights {
            gate_proj: Tensor::zeros((2, 3), DType::F32, &dev).unwrap(),
            up_proj: Tensor::zeros((2, 3), DType::F32, &dev).unwrap(),
            down_proj: Tensor::zeros((2, 3), DType::F32, &dev).unwrap(),
        };
        assert!(PackedExpertWeights::pack(vec![good, bad]).is_err());
        assert!(PackedExpertWeights::pack(vec![]).is_err());
    }
}
