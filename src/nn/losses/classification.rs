//! Classification loss functions

use super::utils::{channel_of, check_pair, PROB_EPS};
use super::{Loss, LossOutput, LossParams};
use crate::error::{NodeError, NodeResult};
use crate::tensor::Tensor;

/// Focal loss over channel probabilities and one-hot (or soft) targets.
///
/// Per voxel: `-sum_c alpha_c * t_c * (1 - q_c)^gamma * ln(q_c)` where `q` is
/// the source clamped to `[1e-7, 1 - 1e-7]`; the result is averaged over
/// batch and space.
#[derive(Debug, Clone, PartialEq)]
pub struct FocalLoss {
    alpha: Option<Vec<f32>>,
    gamma: f32,
}

impl FocalLoss {
    pub fn new(alpha: Option<Vec<f32>>, gamma: f32) -> NodeResult<Self> {
        if !(gamma.is_finite() && gamma >= 0.0) {
            return Err(NodeError::InvalidConfig(format!("focal loss needs gamma >= 0, got {}", gamma)));
        }
        Ok(Self { alpha, gamma })
    }

    pub fn from_params(params: &LossParams) -> NodeResult<Self> {
        Self::new(params.alpha.clone(), params.gamma.unwrap_or(2.0))
    }
}

impl Loss for FocalLoss {
    fn compute(&self, src: &Tensor, target: &Tensor) -> NodeResult<LossOutput> {
        check_pair(src, target, self.name())?;
        let (c, plane) = (src.shape().channels(), src.plane_len());
        let alpha = match &self.alpha {
            Some(a) if a.len() != c => {
                return Err(NodeError::InvalidConfig(format!(
                    "focal loss alpha has {} entries for {} channels",
                    a.len(),
                    c
                )))
            }
            Some(a) => a.clone(),
            None => vec![1.0; c],
        };
        let voxels = (src.shape().batch() * plane) as f32;
        let gamma = self.gamma;

        let mut value = 0.0f32;
        let mut grad_src = Vec::with_capacity(src.numel());
        let mut grad_target = Vec::with_capacity(src.numel());
        for (i, (&s, &t)) in src.data().iter().zip(target.data()).enumerate() {
            let a = alpha[channel_of(i, c, plane)];
            let q = s.clamp(PROB_EPS, 1.0 - PROB_EPS);
            let ln_q = q.ln();
            let focal = (1.0 - q).powf(gamma);
            value -= a * t * focal * ln_q;
            grad_target.push(-a * focal * ln_q / voxels);
            let inside = s > PROB_EPS && s < 1.0 - PROB_EPS;
            let dq = if !inside || t == 0.0 {
                0.0
            } else {
                let d_focal = if gamma == 0.0 {
                    0.0
                } else {
                    -gamma * (1.0 - q).powf(gamma - 1.0)
                };
                -a * t * (d_focal * ln_q + focal / q)
            };
            grad_src.push(dq / voxels);
        }
        Ok(LossOutput {
            value: value / voxels,
            grad_src: Tensor::from_vec(src.dims(), grad_src)?,
            grad_target: Tensor::from_vec(src.dims(), grad_target)?,
        })
    }

    fn name(&self) -> &'static str {
        "node_focal_loss"
    }

    fn requires_probabilities(&self) -> bool {
        true
    }
}

/// Focal loss; `gamma` defaults to 2 and `alpha` to one per channel.
pub fn node_focal_loss(src: &Tensor, target: &Tensor, params: &LossParams) -> NodeResult<LossOutput> {
    FocalLoss::from_params(params)?.compute(src, target)
}
