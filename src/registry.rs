//! Name registry of the exported surface.
//!
//! Configuration files refer to losses, metrics and the train/validate
//! helpers by their exported names. The table is built on first use and is
//! read-only afterwards.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use lazy_static::lazy_static;

use crate::data::NodeLoaders;
use crate::error::{NodeError, NodeResult};
use crate::nn::losses::{node_dice_loss, node_focal_loss, node_iou_loss, node_lp_loss, LossFn};
use crate::nn::{MHDNet, Optimizer};
use crate::training::metrics::{
    node_accuracy_metric, node_dice_metric, node_f1_metric, node_iou_metric, node_mse_metric, node_precision_metric,
    node_recall_metric, node_specificity_metric, MetricFn,
};
use crate::training::trainer::{train, validate, EpochSummary, TaskConfig};

pub type TrainFn = fn(
    &mut MHDNet,
    &NodeLoaders,
    &mut dyn Optimizer,
    &BTreeMap<String, TaskConfig>,
    usize,
    usize,
) -> NodeResult<EpochSummary>;

pub type ValidateFn =
    fn(&mut MHDNet, &NodeLoaders, &BTreeMap<String, TaskConfig>, usize, usize) -> NodeResult<EpochSummary>;

/// What an exported name refers to.
#[derive(Clone, Copy)]
pub enum Item {
    /// A type: dataset, transform, model, scheduler or optimizer.
    Type,
    Loss(LossFn),
    Metric(MetricFn),
    Train(TrainFn),
    Validate(ValidateFn),
}

impl Item {
    pub fn kind(&self) -> &'static str {
        match self {
            Item::Type => "type",
            Item::Loss(_) => "loss",
            Item::Metric(_) => "metric",
            Item::Train(_) | Item::Validate(_) => "function",
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// One exported name and the module defining it.
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    pub name: &'static str,
    pub module: &'static str,
    pub item: Item,
}

fn symbol(name: &'static str, module: &'static str, item: Item) -> Symbol {
    Symbol { name, module, item }
}

struct Registry {
    exported: Vec<Symbol>,
    supplementary: Vec<Symbol>,
    index: HashMap<&'static str, Symbol>,
}

impl Registry {
    fn build() -> Self {
        use Item::*;
        let exported = vec![
            symbol("NodeDataset", "data::dataset", Type),
            symbol("MinMaxNormalize", "data::transforms", Type),
            symbol("ZScoreNormalize", "data::transforms", Type),
            symbol("RandomRotate", "data::transforms", Type),
            symbol("RandomFlip", "data::transforms", Type),
            symbol("RandomShift", "data::transforms", Type),
            symbol("RandomZoom", "data::transforms", Type),
            symbol("RandomMask", "data::transforms", Type),
            symbol("node_lp_loss", "nn::losses", Loss(node_lp_loss)),
            symbol("node_focal_loss", "nn::losses", Loss(node_focal_loss)),
            symbol("node_dice_loss", "nn::losses", Loss(node_dice_loss)),
            symbol("node_iou_loss", "nn::losses", Loss(node_iou_loss)),
            symbol("node_recall_metric", "training::metrics", Metric(node_recall_metric)),
            symbol("node_precision_metric", "training::metrics", Metric(node_precision_metric)),
            symbol("node_f1_metric", "training::metrics", Metric(node_f1_metric)),
            symbol("node_dice_metric", "training::metrics", Metric(node_dice_metric)),
            symbol("node_iou_metric", "training::metrics", Metric(node_iou_metric)),
            symbol("DNet", "nn::models", Type),
            symbol("HDNet", "nn::models", Type),
            symbol("MHDNet", "nn::models", Type),
            symbol("train", "training::trainer", Train(train)),
            symbol("validate", "training::trainer", Validate(validate)),
        ];
        let supplementary = vec![
            symbol("OneHot", "data::transforms", Type),
            symbol("OrderedSampler", "data::loader", Type),
            symbol("DataLoader", "data::loader", Type),
            symbol("node_accuracy_metric", "training::metrics", Metric(node_accuracy_metric)),
            symbol("node_specificity_metric", "training::metrics", Metric(node_specificity_metric)),
            symbol("node_mse_metric", "training::metrics", Metric(node_mse_metric)),
            symbol("WarmupCosineAnnealingLR", "training::schedulers", Type),
            symbol("CosineAnnealingLR", "training::schedulers", Type),
            symbol("PolynomialLR", "training::schedulers", Type),
            symbol("ReduceLROnPlateau", "training::schedulers", Type),
            symbol("Adam", "nn::optimizers", Type),
        ];
        let index = exported
            .iter()
            .chain(&supplementary)
            .map(|s| (s.name, *s))
            .collect();
        Self {
            exported,
            supplementary,
            index,
        }
    }
}

lazy_static! {
    static ref REGISTRY: Registry = Registry::build();
}

/// The exported symbol set, in declaration order.
pub fn exported_symbols() -> &'static [Symbol] {
    &REGISTRY.exported
}

/// Names exported alongside the core set.
pub fn supplementary_symbols() -> &'static [Symbol] {
    &REGISTRY.supplementary
}

/// Every registered name, core set first.
pub fn all_symbols() -> impl Iterator<Item = &'static Symbol> {
    REGISTRY.exported.iter().chain(REGISTRY.supplementary.iter())
}

pub fn resolve(name: &str) -> NodeResult<Symbol> {
    REGISTRY
        .index
        .get(name)
        .copied()
        .ok_or_else(|| NodeError::unknown_symbol("symbol", name))
}

pub fn resolve_loss(name: &str) -> NodeResult<LossFn> {
    match REGISTRY.index.get(name).map(|s| s.item) {
        Some(Item::Loss(f)) => Ok(f),
        _ => Err(NodeError::unknown_symbol("loss", name)),
    }
}

pub fn resolve_metric(name: &str) -> NodeResult<MetricFn> {
    match REGISTRY.index.get(name).map(|s| s.item) {
        Some(Item::Metric(f)) => Ok(f),
        _ => Err(NodeError::unknown_symbol("metric", name)),
    }
}

pub fn resolve_train(name: &str) -> NodeResult<TrainFn> {
    match REGISTRY.index.get(name).map(|s| s.item) {
        Some(Item::Train(f)) => Ok(f),
        _ => Err(NodeError::unknown_symbol("train function", name)),
    }
}

pub fn resolve_validate(name: &str) -> NodeResult<ValidateFn> {
    match REGISTRY.index.get(name).map(|s| s.item) {
        Some(Item::Validate(f)) => Ok(f),
        _ => Err(NodeError::unknown_symbol("validate function", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_are_unique() {
        let names: Vec<&str> = all_symbols().map(|s| s.name).collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len());
        assert_eq!(exported_symbols().len(), 22);
    }

    #[test]
    fn test_resolution_is_stable() {
        let a = resolve_loss("node_dice_loss").unwrap();
        let b = resolve_loss("node_dice_loss").unwrap();
        assert_eq!(a as usize, b as usize);
        assert_eq!(a as usize, node_dice_loss as LossFn as usize);
        assert_eq!(resolve("MHDNet").unwrap().module, "nn::models");
    }

    #[test]
    fn test_wrong_kind_or_unknown_name() {
        assert!(matches!(
            resolve_loss("node_dice_metric"),
            Err(NodeError::UnknownSymbol { .. })
        ));
        assert!(matches!(resolve("node_hinge_loss"), Err(NodeError::UnknownSymbol { .. })));
        assert!(resolve_metric("node_mse_metric").is_ok());
        assert!(resolve_train("train").is_ok());
        assert!(resolve_validate("train").is_err());
    }

    #[test]
    fn test_concurrent_first_access() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| exported_symbols().as_ptr() as usize))
            .collect();
        let ptrs: HashSet<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ptrs.len(), 1);
    }
}
