use candle_core::{Result, Tensor};
use candle_nn::{linear_no_bias, Activation, Linear, Module, VarBuilder};

/// Gated feed-forward block, replicated on every rank (used for shared experts).
pub struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    activation: Activation,
}

impl MLP {
    pub fn new(
        vb: VarBuilder,
        hidden_size: usize,
        intermediate_size: usize,
        activation: Activation,
    ) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
            activation,
        })
    }

    pub fn from_weights(
        gate_proj: Tensor,
        up_proj: Tensor,
        down_proj: Tensor,
        activation: Activation,
    ) -> Self {
        Self {
            gate_proj: Linear::new(gate_proj, None),
            up_proj: Linear::new(up_proj, None),
            down_proj: Linear::new(down_proj, None),
            activation,
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(xs)?.apply(&self.activation)?;
        let up = self.up_proj.forward(xs)?;
        self.down_proj.forward(&(gate * up)?)
    }
}
