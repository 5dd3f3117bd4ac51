//! Neural network components

pub mod layers;
pub mod losses;
pub mod models;
pub mod optimizers;

pub use layers::{Activation, ModelState, Module, NormKind, Parameter};
pub use losses::{node_dice_loss, node_focal_loss, node_iou_loss, node_lp_loss, LossFn, LossOutput, LossParams};
pub use models::{DNet, HDNet, HDNetConfig, MHDNet, MHDNetConfig, NodeId, NodeMapping};
pub use optimizers::{Adam, Optimizer, ParamGroup, Sgd};
