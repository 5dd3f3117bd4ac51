//! Node Toolkit - hypergraph networks over multi-node volumetric data
//!
//! Features:
//! - Per-node NIfTI/CSV datasets with seeded, batch-consistent augmentation
//! - Hypergraph networks (`DNet`, `HDNet`) composed into a multi-network `MHDNet`
//! - Node losses and metrics addressed by name from experiment files
//! - Epoch-level `train`/`validate` loops, schedulers and checkpoints

pub mod config;
pub mod data;
pub mod error;
pub mod nn;
pub mod pipeline;
pub mod registry;
pub mod tensor;
pub mod training;

use tracing_subscriber::EnvFilter;

pub use config::{ExperimentConfig, LoggingConfig};
pub use data::{
    DataLoader, MinMaxNormalize, NodeDataset, OneHot, OrderedSampler, RandomFlip, RandomMask, RandomRotate,
    RandomShift, RandomZoom, ZScoreNormalize,
};
pub use error::{NodeError, NodeResult};
pub use nn::{node_dice_loss, node_focal_loss, node_iou_loss, node_lp_loss, Adam, DNet, HDNet, MHDNet};
pub use pipeline::{run_experiment, TrainingLog};
pub use registry::{exported_symbols, resolve};
pub use tensor::Tensor;
pub use training::{
    node_accuracy_metric, node_dice_metric, node_f1_metric, node_iou_metric, node_mse_metric, node_precision_metric,
    node_recall_metric, node_specificity_metric, train, validate, CosineAnnealingLR, PolynomialLR, ReduceLROnPlateau,
    WarmupCosineAnnealingLR,
};

/// Initialize logging with default settings
pub fn init() -> NodeResult<()> {
    init_logging(&LoggingConfig::default())
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides the
/// configured level; a second call leaves the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> NodeResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| NodeError::InvalidConfig(format!("invalid log level '{}': {}", config.level, e)))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        tracing::info!("Node toolkit {} initialized", version());
    }
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_exported_names_resolve_at_root() {
        for symbol in exported_symbols() {
            assert!(resolve(symbol.name).is_ok(), "{}", symbol.name);
        }
    }
}
