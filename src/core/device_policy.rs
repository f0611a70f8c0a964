// src/core/device_policy.rs
use crate::core::sequence::SequenceMeta;
use crate::core::step_context::{MaskMode, StepContext};
use candle_core::{Device, Result};
use serde::{Deserialize, Serialize};

/// Per-accelerator strategy for turning the batch state into a [`StepContext`].
pub trait StepContextBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(
        &self,
        seqs: &[SequenceMeta],
        block_size: usize,
        device: &Device,
    ) -> Result<StepContext>;
}

/// For kernels that take an explicit boolean mask and read the length metadata
/// on the host: masks are materialized per request and lengths stay on the CPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseMaskPolicy;

impl StepContextBuilder for DenseMaskPolicy {
    fn name(&self) -> &'static str {
        "dense_mask"
    }

    fn build(
        &self,
        seqs: &[SequenceMeta],
        block_size: usize,
        device: &Device,
    ) -> Result<StepContext> {
        StepContext::assemble(seqs, block_size, device, &Device::Cpu, MaskMode::Dense)
    }
}

/// For kernels that derive the causal boundary from start/length scalars: no mask
/// is built and all metadata stays device resident.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelMaskPolicy;

impl StepContextBuilder for KernelMaskPolicy {
    fn name(&self) -> &'static str {
        "kernel_mask"
    }

    fn build(
        &self,
        seqs: &[SequenceMeta],
        block_size: usize,
        device: &Device,
    ) -> Result<StepContext> {
        StepContext::assemble(seqs, block_size, device, device, MaskMode::Implicit)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DevicePolicyKind {
    DenseMask,
    #[default]
    KernelMask,
}

impl DevicePolicyKind {
    pub fn builder(self) -> Box<dyn StepContextBuilder> {
        match self {
            DevicePolicyKind::DenseMask => Box::new(DenseMaskPolicy),
            DevicePolicyKind::KernelMask => Box::new(KernelMaskPolicy),
        }
    }
}

impl std::str::FromStr for DevicePolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dense_mask" | "dense" => Ok(DevicePolicyKind::DenseMask),
            "kernel_mask" | "kernel" => Ok(DevicePolicyKind::KernelMask),
            other => Err(format!("unknown device policy `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Vec<SequenceMeta> {
        vec![
            SequenceMeta::new(0, 4, vec![3]),
            SequenceMeta::new(5, 3, vec![0, 1]),
        ]
    }

    #[test]
    fn test_policies_share_addressing() {
        let dense = DevicePolicyKind::DenseMask
            .builder()
            .build(&batch(), 4, &Device::Cpu)
            .unwrap();
        let kernel = DevicePolicyKind::KernelMask
            .builder()
            .build(&batch(), 4, &Device::Cpu)
            .unwrap();
        assert_eq!(dense.slots, kernel.slots);
        assert_eq!(dense.q_start_loc, kernel.q_start_loc);
        assert_eq!(dense.is_unpaged_prefill, kernel.is_unpaged_prefill);
        assert!(dense.attention_mask.is_some());
        assert!(kernel.attention_mask.is_none());
        assert!(dense.seqlens.device.is_cpu());
    }

    #[test]
    fn test_dense_mask_matches_algebraic_boundary() {
        let ctx = DenseMaskPolicy.build(&batch(), 4, &Device::Cpu).unwrap();
        for (s, mask) in ctx.attention_mask.as_ref().unwrap().iter().enumerate() {
            for (i, row) in mask.to_vec2::<u8>().unwrap().iter().enumerate() {
                for (j, v) in row.iter().enumerate() {
                    assert_eq!(*v == 1, ctx.is_masked(s, i, j));
                }
            }
        }
    }

    #[test]
    fn test_policy_kind_parsing() {
        assert_eq!(
            "dense_mask".parse::<DevicePolicyKind>().unwrap(),
            DevicePolicyKind::DenseMask
        );
        assert!("ascend".parse::<DevicePolicyKind>().is_err());
        let kind: DevicePolicyKind = serde_json::from_str("\"kernel_mask\"").unwrap();
        assert_eq!(kind, DevicePolicyKind::KernelMask);
        assert_eq!(DevicePolicyKind::default().builder().name(), "kernel_mask");
    }
}
