// src/models/layers/moe.rs
use crate::core::error::CoreError;
use crate::models::layers::distributed::{AllReduce, Collective};
use crate::models::layers::expert_partition::{ExpertPartition, PackedExpertWeights};
use crate::models::layers::mlp::MLP;
use crate::utils::config::MoEConfig;
use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Activation, VarBuilder};
use std::sync::Arc;

/// Per-token top-k routing in the global expert index space.
pub struct TopKRouting {
    /// `[num_tokens, top_k]` u32.
    pub topk_ids: Tensor,
    /// `[num_tokens, top_k]` gate weights, as produced by the router.
    pub topk_weights: Tensor,
}

/// Softmax router keeping the `top_k` highest-scoring experts per token.
pub struct MoeGate {
    weight: Tensor,
    top_k: usize,
}

impl MoeGate {
    pub fn new(vb: VarBuilder, hidden_size: usize, num_experts: usize, top_k: usize) -> Result<Self> {
        let weight = vb.get((num_experts, hidden_size), "weight")?;
        Self::from_weight(weight, top_k)
    }

    pub fn from_weight(weight: Tensor, top_k: usize) -> Result<Self> {
        let (num_experts, _) = weight.dims2()?;
        if top_k == 0 || top_k > num_experts {
            return Err(CoreError::InvalidConfig(format!(
                "top_k {top_k} must be in [1, {num_experts}]"
            ))
            .into());
        }
        Ok(Self {
            weight: weight.to_dtype(DType::F32)?,
            top_k,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<TopKRouting> {
        let logits = xs.to_dtype(DType::F32)?.matmul(&self.weight.t()?)?;
        let scores = candle_nn::ops::softmax_last_dim(&logits)?;
        let sorted = scores.arg_sort_last_dim(false)?;
        let topk_ids = sorted.narrow(D::Minus1, 0, self.top_k)?.contiguous()?;
        Ok(TopKRouting {
            topk_weights: scores.gather(&topk_ids, D::Minus1)?,
            topk_ids,
        })
    }
}

/// Token rows routed to one local expert, and their flat `token * top_k + k` slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertRoute {
    pub local: usize,
    pub token_rows: Vec<u32>,
    pub topk_slots: Vec<u32>,
}

/// The local share of one step's routing decisions.
///
/// Routes are ordered by local expert, and rows by token, which fixes the order in
/// which a token's contributions are accumulated on this rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPlan {
    pub routes: Vec<ExpertRoute>,
    pub num_tokens: usize,
    pub top_k: usize,
}

impl RoutingPlan {
    pub fn new(
        topk_ids: &[Vec<u32>],
        partition: &ExpertPartition,
    ) -> std::result::Result<Self, CoreError> {
        let top_k = topk_ids.first().map(|row| row.len()).unwrap_or(0);
        let mut per_local: Vec<(Vec<u32>, Vec<u32>)> = vec![(vec![], vec![]); partition.num_local()];
        for (token, row) in topk_ids.iter().enumerate() {
            if row.len() != top_k {
                return Err(CoreError::ShapeMismatch {
                    name: "topk_ids",
                    expected: vec![topk_ids.len(), top_k],
                    actual: vec![token, row.len()],
                });
            }
            for (k, &expert) in row.iter().enumerate() {
                let expert = expert as usize;
                if expert >= partition.num_experts {
                    return Err(CoreError::InvalidConfig(format!(
                        "token {token} routed to expert {expert} of {}",
                        partition.num_experts
                    )));
                }
                if let Some(local) = partition.to_local(expert) {
                    per_local[local].0.push(token as u32);
                    per_local[local].1.push((token * top_k + k) as u32);
                }
            }
        }
        let routes = per_local
            .into_iter()
            .enumerate()
            .filter(|(_, (rows, _))| !rows.is_empty())
            .map(|(local, (token_rows, topk_slots))| ExpertRoute {
                local,
                token_rows,
                topk_slots,
            })
            .collect();
        Ok(Self {
            routes,
            num_tokens: topk_ids.len(),
            top_k,
        })
    }

    pub fn num_assignments(&self) -> usize {
        self.routes.iter().map(|r| r.token_rows.len()).sum()
    }

    /// Flattened `(token_rows, topk_slots, local_experts)`, one entry per assignment,
    /// in accumulation order.
    pub fn assignments(&self) -> (Vec<u32>, Vec<u32>, Vec<u32>) {
        let n = self.num_assignments();
        let mut rows = Vec::with_capacity(n);
        let mut slots = Vec::with_capacity(n);
        let mut locals = Vec::with_capacity(n);
        for route in &self.routes {
            rows.extend_from_slice(&route.token_rows);
            slots.extend_from_slice(&route.topk_slots);
            locals.extend(std::iter::repeat(route.local as u32).take(route.token_rows.len()));
        }
        (rows, slots, locals)
    }
}

/// Expert-parallel MoE feed-forward.
///
/// Each rank runs only its own experts, the partial outputs are summed across ranks,
/// and the replicated shared expert is added afterwards on every rank.
pub struct ExpertParallelMoe {
    gate: Option<MoeGate>,
    experts: PackedExpertWeights,
    partition: ExpertPartition,
    shared_expert: Option<MLP>,
    act: Activation,
    renormalize: bool,
    all_reduce: AllReduce,
}

impl ExpertParallelMoe {
    pub fn new(
        cfg: &MoEConfig,
        vb: VarBuilder,
        comm: Arc<dyn Collective>,
        dtype: DType,
    ) -> Result<Self> {
        let partition = ExpertPartition::new(cfg.n_routed_experts, comm.world_size(), comm.rank())?;
        let gate = MoeGate::new(
            vb.pp("gate"),
            cfg.hidden_size,
            cfg.n_routed_experts,
            cfg.num_experts_per_tok,
        )?;
        let experts = PackedExpertWeights::load(
            &vb,
            &partition,
            cfg.hidden_size,
            cfg.moe_intermediate_size,
            dtype,
        )?;
        let shared_expert = match cfg.n_shared_experts {
            Some(n) if n > 0 => Some(MLP::new(
                vb.pp("shared_experts"),
                cfg.hidden_size,
                cfg.moe_intermediate_size * n,
                cfg.hidden_act,
            )?),
            _ => None,
        };
        if cfg.renormalize && cfg.num_experts_per_tok == 1 {
            crate::log_warn!("renormalize with a single routed expert sets every gate weight to 1");
        }
        Ok(Self::from_parts(
            Some(gate),
            experts,
            partition,
            shared_expert,
            cfg.hidden_act,
            cfg.renormalize,
            comm,
        ))
    }

    pub fn from_parts(
        gate: Option<MoeGate>,
        experts: PackedExpertWeights,
        partition: ExpertPartition,
        shared_expert: Option<MLP>,
        act: Activation,
        renormalize: bool,
        comm: Arc<dyn Collective>,
    ) -> Self {
        Self {
            gate,
            experts,
            partition,
            shared_expert,
            act,
            renormalize,
            all_reduce: AllReduce::new(comm),
        }
    }

    pub fn partition(&self) -> &ExpertPartition {
        &self.partition
    }

    fn check_routing(&self, xs: &Tensor, routing: &TopKRouting) -> Result<(usize, usize)> {
        let (num_tokens, hidden) = xs.dims2()?;
        if hidden != self.experts.hidden_dim() {
            return Err(CoreError::ShapeMismatch {
                name: "hidden_states",
                expected: vec![num_tokens, self.experts.hidden_dim()],
                actual: vec![num_tokens, hidden],
            }
            .into());
        }
        let (ids_tokens, top_k) = routing.topk_ids.dims2()?;
        if ids_tokens != num_tokens {
            return Err(CoreError::ShapeMismatch {
                name: "topk_ids",
                expected: vec![num_tokens, top_k],
                actual: vec![ids_tokens, top_k],
            }
            .into());
        }
        if routing.topk_weights.dims() != routing.topk_ids.dims() {
            return Err(CoreError::ShapeMismatch {
                name: "topk_weights",
                expected: routing.topk_ids.dims().to_vec(),
                actual: routing.topk_weights.dims().to_vec(),
            }
            .into());
        }
        Ok((num_tokens, top_k))
    }

    /// This rank's share of the routed output, before the cross-rank reduction.
    ///
    /// Experts owned by other ranks contribute nothing here.
    pub fn local_forward(&self, xs: &Tensor, routing: &TopKRouting) -> Result<Tensor> {
        self.check_routing(xs, routing)?;
        let device = xs.device();
        let topk_ids = routing.topk_ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let plan = RoutingPlan::new(&topk_ids, &self.partition)?;

        let topk_weights = if self.renormalize {
            let w = routing.topk_weights.to_dtype(DType::F32)?;
            let sum = w.sum_keepdim(D::Minus1)?;
            // an all-zero row stays zero instead of turning into NaN
            let denom = sum.eq(0f32)?.where_cond(&sum.ones_like()?, &sum)?;
            w.broadcast_div(&denom)?
        } else {
            routing.topk_weights.clone()
        };
        let flat_weights = topk_weights.flatten_all()?.to_dtype(xs.dtype())?;

        let mut ys = xs.zeros_like()?;
        let n = plan.num_assignments();
        if n > 0 {
            let (rows, slots, locals) = plan.assignments();
            let rows = Tensor::from_vec(rows, (n,), device)?;
            let slots = Tensor::from_vec(slots, (n,), device)?;
            let locals = Tensor::from_vec(locals, (n,), device)?;

            // One batched matmul over every local assignment.
            let ffn = self.experts.ffn_dim();
            let x = xs.index_select(&rows, 0)?.unsqueeze(1)?;
            let gate_up_w = self.experts.gate_up().index_select(&locals, 0)?;
            let gate_up = x.matmul(&gate_up_w.t()?)?;
            let gate = gate_up.narrow(D::Minus1, 0, ffn)?.apply(&self.act)?;
            let up = gate_up.narrow(D::Minus1, ffn, ffn)?;
            let down_w = self.experts.down().index_select(&locals, 0)?;
            let out = (gate * up)?.matmul(&down_w.t()?)?.squeeze(1)?;

            let w = flat_weights.index_select(&slots, 0)?.unsqueeze(D::Minus1)?;
            ys = ys.index_add(&rows, &out.broadcast_mul(&w)?, 0)?;
        }
        tracing::trace!(
            "rank {} computed {} of {} routed assignments locally",
            self.partition.rank,
            plan.num_assignments(),
            plan.num_tokens * plan.top_k
        );
        Ok(ys)
    }

    /// Full MoE output for externally supplied routing decisions.
    pub fn forward_routed(&self, xs: &Tensor, routing: &TopKRouting) -> Result<Tensor> {
        let mut ys = self.local_forward(xs, routing)?;
        if self.all_reduce.world_size() > 1 {
            ys = self.all_reduce.apply(&ys)?;
        }
        // Shared experts are replicated work; reducing them would scale by world_size.
        if let Some(shared) = &self.shared_expert {
            ys = (ys + shared.forward(xs)?)?;
        }
        Ok(ys)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let Some(gate) = &self.gate else {
            candle_core::bail!("MoE layer was built without a router, use forward_routed");
        };
        let routing = gate.forward(xs)?;
        self.forward_routed(xs, &routing)
    }
}
