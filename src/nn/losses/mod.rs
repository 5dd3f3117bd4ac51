//! Node loss functions with analytic gradients
//!
//! Every loss compares two node tensors `[N, C, S...]` of the same shape and
//! returns its value together with the gradient for both operands, since
//! either side may be produced by the network.

pub mod classification;
pub mod overlap;
pub mod regression;

pub use classification::{node_focal_loss, FocalLoss};
pub use overlap::{node_dice_loss, node_iou_loss, DiceLoss, IouLoss};
pub use regression::{node_lp_loss, LpLoss};

use serde::{Deserialize, Serialize};

use crate::error::NodeResult;
use crate::tensor::Tensor;

/// Optional knobs shared by the node losses. Unused fields are ignored by
/// losses that do not read them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smooth: Option<f32>,
}

/// Loss value and its gradients with respect to `src` and `target`.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub value: f32,
    pub grad_src: Tensor,
    pub grad_target: Tensor,
}

/// Signature shared by every exported node loss.
pub type LossFn = fn(&Tensor, &Tensor, &LossParams) -> NodeResult<LossOutput>;

/// Base trait for all loss functions
pub trait Loss: Send + Sync {
    fn compute(&self, src: &Tensor, target: &Tensor) -> NodeResult<LossOutput>;

    /// Get the name of the loss function
    fn name(&self) -> &'static str;

    /// Check if the loss function requires probabilistic inputs
    fn requires_probabilities(&self) -> bool {
        false
    }
}

/// Numerical stability utilities
pub mod utils {
    use crate::error::{NodeError, NodeResult};
    use crate::tensor::Tensor;

    pub const PROB_EPS: f32 = 1e-7;

    pub fn check_pair(src: &Tensor, target: &Tensor, loss: &str) -> NodeResult<()> {
        src.expect_same_shape(target, loss)?;
        if src.shape().ndim() < 2 || src.numel() == 0 {
            return Err(NodeError::shape_error(
                "non-empty [N, C, ...]",
                &src.shape().to_string(),
                Some(&format!("{} expects batched node tensors", loss)),
            ));
        }
        Ok(())
    }

    /// Per-channel sums over batch and space of `f(src, target)`.
    pub fn channel_sums<F: Fn(f32, f32) -> f32>(src: &Tensor, target: &Tensor, f: F) -> Vec<f32> {
        let (c, plane) = (src.shape().channels(), src.plane_len());
        let mut sums = vec![0.0f32; c];
        for (i, (&s, &t)) in src.data().iter().zip(target.data()).enumerate() {
            sums[(i / plane) % c] += f(s, t);
        }
        sums
    }

    pub fn channel_of(index: usize, channels: usize, plane: usize) -> usize {
        (index / plane) % channels
    }
}
