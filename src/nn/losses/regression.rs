//! Regression loss functions

use super::{utils::check_pair, Loss, LossOutput, LossParams};
use crate::error::{NodeError, NodeResult};
use crate::tensor::Tensor;

/// Mean of `|src - target|^p`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LpLoss {
    p: f32,
}

impl LpLoss {
    pub fn new(p: f32) -> NodeResult<Self> {
        if !(p.is_finite() && p > 0.0) {
            return Err(NodeError::InvalidConfig(format!("lp loss needs p > 0, got {}", p)));
        }
        Ok(Self { p })
    }

    pub fn from_params(params: &LossParams) -> NodeResult<Self> {
        Self::new(params.p.unwrap_or(2.0))
    }
}

impl Loss for LpLoss {
    fn compute(&self, src: &Tensor, target: &Tensor) -> NodeResult<LossOutput> {
        check_pair(src, target, self.name())?;
        let n = src.numel() as f32;
        let p = self.p;
        let mut value = 0.0f32;
        let mut grad = Vec::with_capacity(src.numel());
        for (&s, &t) in src.data().iter().zip(target.data()) {
            let d = s - t;
            let a = d.abs();
            value += a.powf(p);
            let slope = if a == 0.0 {
                0.0
            } else {
                p * a.powf(p - 1.0) * d.signum()
            };
            grad.push(slope / n);
        }
        let grad_src = Tensor::from_vec(src.dims(), grad)?;
        let grad_target = grad_src.scale(-1.0);
        Ok(LossOutput {
            value: value / n,
            grad_src,
            grad_target,
        })
    }

    fn name(&self) -> &'static str {
        "node_lp_loss"
    }
}

/// `mean(|src - target|^p)`, `p` defaults to 2.
pub fn node_lp_loss(src: &Tensor, target: &Tensor, params: &LossParams) -> NodeResult<LossOutput> {
    LpLoss::from_params(params)?.compute(src, target)
}
