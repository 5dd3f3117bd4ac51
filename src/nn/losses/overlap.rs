//! Region-overlap losses (soft Dice and soft IoU)
//!
//! Statistics are accumulated per channel over the whole batch and all
//! spatial positions, then averaged over channels.

use super::utils::{channel_of, channel_sums, check_pair};
use super::{Loss, LossOutput, LossParams};
use crate::error::{NodeError, NodeResult};
use crate::tensor::Tensor;

const DEFAULT_SMOOTH: f32 = 1e-5;

fn smooth_from(params: &LossParams) -> NodeResult<f32> {
    let smooth = params.smooth.unwrap_or(DEFAULT_SMOOTH);
    if !(smooth.is_finite() && smooth >= 0.0) {
        return Err(NodeError::InvalidConfig(format!("smooth must be >= 0, got {}", smooth)));
    }
    Ok(smooth)
}

struct Overlap {
    intersection: Vec<f32>,
    src_sum: Vec<f32>,
    target_sum: Vec<f32>,
}

impl Overlap {
    fn new(src: &Tensor, target: &Tensor) -> Self {
        Self {
            intersection: channel_sums(src, target, |s, t| s * t),
            src_sum: channel_sums(src, target, |s, _| s),
            target_sum: channel_sums(src, target, |_, t| t),
        }
    }
}

/// `1 - mean_c (2 I_c + eps) / (S_c + T_c + eps)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiceLoss {
    smooth: f32,
}

impl DiceLoss {
    pub fn new(smooth: f32) -> Self {
        Self { smooth }
    }

    pub fn from_params(params: &LossParams) -> NodeResult<Self> {
        Ok(Self::new(smooth_from(params)?))
    }
}

impl Loss for DiceLoss {
    fn compute(&self, src: &Tensor, target: &Tensor) -> NodeResult<LossOutput> {
        check_pair(src, target, self.name())?;
        let (c, plane) = (src.shape().channels(), src.plane_len());
        let eps = self.smooth;
        let o = Overlap::new(src, target);
        let denom: Vec<f32> = (0..c).map(|k| o.src_sum[k] + o.target_sum[k] + eps).collect();
        let numer: Vec<f32> = (0..c).map(|k| 2.0 * o.intersection[k] + eps).collect();
        if denom.iter().any(|&d| d == 0.0) {
            return Err(NodeError::operation_error(
                self.name(),
                "empty channel with smooth = 0 makes the dice undefined",
            ));
        }
        let dice: f32 = (0..c).map(|k| numer[k] / denom[k]).sum::<f32>() / c as f32;

        let scale = -1.0 / c as f32;
        let mut grad_src = Vec::with_capacity(src.numel());
        let mut grad_target = Vec::with_capacity(src.numel());
        for (i, (&s, &t)) in src.data().iter().zip(target.data()).enumerate() {
            let k = channel_of(i, c, plane);
            let d2 = denom[k] * denom[k];
            grad_src.push(scale * (2.0 * t * denom[k] - numer[k]) / d2);
            grad_target.push(scale * (2.0 * s * denom[k] - numer[k]) / d2);
        }
        Ok(LossOutput {
            value: 1.0 - dice,
            grad_src: Tensor::from_vec(src.dims(), grad_src)?,
            grad_target: Tensor::from_vec(src.dims(), grad_target)?,
        })
    }

    fn name(&self) -> &'static str {
        "node_dice_loss"
    }
}

/// `1 - mean_c (I_c + eps) / (S_c + T_c - I_c + eps)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IouLoss {
    smooth: f32,
}

impl IouLoss {
    pub fn new(smooth: f32) -> Self {
        Self { smooth }
    }

    pub fn from_params(params: &LossParams) -> NodeResult<Self> {
        Ok(Self::new(smooth_from(params)?))
    }
}

impl Loss for IouLoss {
    fn compute(&self, src: &Tensor, target: &Tensor) -> NodeResult<LossOutput> {
        check_pair(src, target, self.name())?;
        let (c, plane) = (src.shape().channels(), src.plane_len());
        let eps = self.smooth;
        let o = Overlap::new(src, target);
        let numer: Vec<f32> = (0..c).map(|k| o.intersection[k] + eps).collect();
        let denom: Vec<f32> = (0..c)
            .map(|k| o.src_sum[k] + o.target_sum[k] - o.intersection[k] + eps)
            .collect();
        if denom.iter().any(|&d| d == 0.0) {
            return Err(NodeError::operation_error(
                self.name(),
                "empty channel with smooth = 0 makes the IoU undefined",
            ));
        }
        let iou: f32 = (0..c).map(|k| numer[k] / denom[k]).sum::<f32>() / c as f32;

        let scale = -1.0 / c as f32;
        let mut grad_src = Vec::with_capacity(src.numel());
        let mut grad_target = Vec::with_capacity(src.numel());
        for (i, (&s, &t)) in src.data().iter().zip(target.data()).enumerate() {
            let k = channel_of(i, c, plane);
            let d2 = denom[k] * denom[k];
            grad_src.push(scale * (t * denom[k] - numer[k] * (1.0 - t)) / d2);
            grad_target.push(scale * (s * denom[k] - numer[k] * (1.0 - s)) / d2);
        }
        Ok(LossOutput {
            value: 1.0 - iou,
            grad_src: Tensor::from_vec(src.dims(), grad_src)?,
            grad_target: Tensor::from_vec(src.dims(), grad_target)?,
        })
    }

    fn name(&self) -> &'static str {
        "node_iou_loss"
    }
}

/// Soft Dice loss; `smooth` defaults to 1e-5.
pub fn node_dice_loss(src: &Tensor, target: &Tensor, params: &LossParams) -> NodeResult<LossOutput> {
    DiceLoss::from_params(params)?.compute(src, target)
}

/// Soft IoU (Jaccard) loss; `smooth` defaults to 1e-5.
pub fn node_iou_loss(src: &Tensor, target: &Tensor, params: &LossParams) -> NodeResult<LossOutput> {
    IouLoss::from_params(params)?.compute(src, target)
}
