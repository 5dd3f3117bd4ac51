//! Training infrastructure: metrics, learning rate schedules, model state
//! files and the per-epoch train/validate loops.

pub mod checkpoints;
pub mod metrics;
pub mod report;
pub mod schedulers;
pub mod trainer;

pub use checkpoints::{load_state, save_state, CheckpointManager};
pub use metrics::{
    node_accuracy_metric, node_dice_metric, node_f1_metric, node_iou_metric, node_mse_metric, node_precision_metric,
    node_recall_metric, node_specificity_metric, Confusion, MetricFn, MetricParams, MetricResult,
};
pub use schedulers::{
    ConstantLR, CosineAnnealingLR, LRScheduler, PolynomialLR, ReduceLROnPlateau, SchedulerConfig, StepLR,
    WarmupCosineAnnealingLR,
};
pub use trainer::{train, validate, EpochSummary, LossTerm, MetricRecord, MetricTerm, TaskConfig, TermLoss};
