//! End-to-end experiment: data discovery, model construction, the epoch
//! loop with validation, checkpointing and early stopping.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ExperimentConfig;
use crate::data::{DataLoader, DataSplit, Dataset, NodeDataset, NodeLoaders, OrderedSampler};
use crate::error::{NodeError, NodeResult};
use crate::nn::{Adam, MHDNet, Module, NodeId, Optimizer, ParamGroup};
use crate::training::{
    load_state, save_state, train, validate, CheckpointManager, LRScheduler, MetricRecord,
};

pub const BEST_MODEL: &str = "model_best";
pub const SPLIT_FILE: &str = "data_split.json";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";
pub const TRAINING_LOG_FILE: &str = "training_log.json";

/// Record of one epoch. Validation fields are set on validation epochs only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochLog {
    pub epoch: usize,
    pub learning_rate: f32,
    pub train_loss: f32,
    pub train_task_losses: BTreeMap<String, f32>,
    pub train_task_metrics: BTreeMap<String, Vec<MetricRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_loss: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_task_losses: Option<BTreeMap<String, f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_task_metrics: Option<BTreeMap<String, Vec<MetricRecord>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_criterion: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingLog {
    pub epochs: Vec<EpochLog>,
    pub best_val_loss: Option<f32>,
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
}

impl TrainingLog {
    pub fn save(&self, path: &Path) -> NodeResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> NodeResult<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// Counts epochs since the validation criterion last improved. Each
/// validation without improvement adds `interval` epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    interval: usize,
    best: Option<f32>,
    stalled: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, interval: usize) -> Self {
        Self {
            patience,
            interval,
            best: None,
            stalled: 0,
        }
    }

    /// Records one validation result and reports whether it is a new best.
    pub fn observe(&mut self, criterion: f32) -> bool {
        if self.best.map_or(true, |best| criterion < best) {
            self.best = Some(criterion);
            self.stalled = 0;
            true
        } else {
            self.stalled += self.interval;
            false
        }
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }

    /// Epochs since the last improvement.
    pub fn stalled(&self) -> usize {
        self.stalled
    }

    pub fn should_stop(&self) -> bool {
        self.stalled >= self.patience
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Split {
    Train,
    Val,
}

/// Loaders of one split. Both splits honour `training.drop_last`.
fn build_loaders(config: &ExperimentConfig, split: &DataSplit, which: Split) -> NodeResult<NodeLoaders> {
    let (dir, ids, order, transforms) = match which {
        Split::Train => (
            &config.data.train_dir,
            &split.train_case_ids,
            &split.train_case_id_order,
            &config.transforms.train,
        ),
        Split::Val => (
            &config.data.val_dir,
            &split.val_case_ids,
            &split.val_case_id_order,
            &config.transforms.validate,
        ),
    };
    let drop_last = config.training.drop_last;

    let mut loaders: BTreeMap<NodeId, DataLoader> = BTreeMap::new();
    for file in &config.node_files {
        let shape = config.model.global_shape(&file.node).ok_or_else(|| {
            NodeError::InvalidConfig(format!("node {} has no shape in the model", file.node))
        })?;
        let dataset = NodeDataset::new(dir, &file.node, &file.suffix, shape, config.model.num_dimensions)?
            .with_transforms(transforms.get(&file.node).cloned().unwrap_or_default())
            .with_cases(ids, Some(order.as_slice()))?;
        let dataset: Arc<dyn Dataset> = Arc::new(dataset);
        let sampler = OrderedSampler::sequential(dataset.len());
        let loader = DataLoader::new(dataset, config.training.batch_size, sampler, drop_last)?;
        loaders.insert(file.node.clone(), loader);
    }
    NodeLoaders::new(loaders, config.seed)
}

fn load_pretrained(model: &mut MHDNet, config: &ExperimentConfig) -> NodeResult<Vec<String>> {
    let mut loaded = Vec::new();
    for (name, path) in &config.pretrained {
        if !path.is_file() {
            warn!("Pretrained weights for {} not found at {}, training from scratch", name, path.display());
            continue;
        }
        let state = load_state(path)?;
        model.load_sub_network_state(name, &state)?;
        loaded.push(name.clone());
    }
    Ok(loaded)
}

/// Runs a full experiment and returns its log. Outputs written to
/// `data.save_dir`:
///
/// - `data_split.json`, `model_config.json` and `training_log.json`
/// - `model_best.bin` whenever the validation loss improves
/// - `{name}.bin` for each sub-network listed in `save_sub_networks`
pub fn run_experiment(config: &ExperimentConfig) -> NodeResult<TrainingLog> {
    config.validate()?;
    let save_dir = config.data.save_dir.as_path();
    std::fs::create_dir_all(save_dir)?;

    let suffixes: Vec<&str> = config.node_files.iter().map(|f| f.suffix.as_str()).collect();
    let split = DataSplit::discover(
        &config.data.train_dir,
        &config.data.val_dir,
        &suffixes,
        config.data.case_policy,
        config.seed,
    )?;
    split.save(&save_dir.join(SPLIT_FILE))?;

    let mut model = MHDNet::new(config.model.clone(), config.seed)?;
    info!("Model has {} trainable parameters", model.num_parameters());
    let pretrained = load_pretrained(&mut model, config)?;

    let train_loaders = build_loaders(config, &split, Split::Train)?;
    let val_loaders = build_loaders(config, &split, Split::Val)?;

    let t = &config.training;
    let mut optimizer = Adam::with_defaults(t.learning_rate, t.weight_decay)?;
    if !pretrained.is_empty() {
        optimizer = optimizer.with_groups(vec![ParamGroup {
            prefixes: pretrained,
            lr_scale: 0.5,
            weight_decay_scale: 0.5,
        }]);
    }
    let mut scheduler: Box<dyn LRScheduler> = config.scheduler.create_scheduler(t.learning_rate, t.num_epochs)?;
    optimizer.set_lr(scheduler.get_lr());

    std::fs::write(save_dir.join(MODEL_CONFIG_FILE), serde_json::to_string_pretty(&config.model)?)?;

    let checkpoints = CheckpointManager::new(save_dir);
    let log_path = save_dir.join(TRAINING_LOG_FILE);
    let mut log = TrainingLog::default();
    let mut stopping = EarlyStopping::new(t.patience, t.validation_interval);

    for epoch in 0..t.num_epochs {
        let learning_rate = optimizer.lr();
        let train_summary = train(&mut model, &train_loaders, &mut optimizer, &config.tasks, epoch, t.num_epochs)?;
        let mut entry = EpochLog {
            epoch,
            learning_rate,
            train_loss: train_summary.avg_loss,
            train_task_losses: train_summary.task_losses,
            train_task_metrics: train_summary.task_metrics,
            val_loss: None,
            val_task_losses: None,
            val_task_metrics: None,
            save_criterion: None,
        };

        let mut stop = false;
        if (epoch + 1) % t.validation_interval == 0 {
            let val_summary = validate(&mut model, &val_loaders, &config.tasks, epoch, t.num_epochs)?;
            let criterion = val_summary.avg_loss;
            entry.val_loss = Some(criterion);
            entry.val_task_losses = Some(val_summary.task_losses);
            entry.val_task_metrics = Some(val_summary.task_metrics);
            entry.save_criterion = Some(criterion);

            if stopping.observe(criterion) {
                log.best_val_loss = Some(criterion);
                log.best_epoch = Some(epoch);
                checkpoints.save(BEST_MODEL, &model.state_dict())?;
                for name in &config.save_sub_networks {
                    let state = model.sub_network_state(name)?;
                    save_state(&state, &checkpoints.path(name))?;
                }
                info!("New best model at epoch {} with val loss {:.4}", epoch + 1, criterion);
            } else {
                info!(
                    "No improvement for {} epochs (best {:.4})",
                    stopping.stalled(),
                    stopping.best().unwrap_or(f32::NAN)
                );
                if stopping.should_stop() {
                    info!("Early stopping at epoch {}", epoch + 1);
                    stop = true;
                }
            }
        }

        scheduler.step(entry.val_loss);
        optimizer.set_lr(scheduler.get_lr());
        let validated = entry.val_loss.is_some();
        log.epochs.push(entry);
        if validated {
            log.save(&log_path)?;
        }
        if stop {
            log.stopped_early = true;
            break;
        }
    }

    log.save(&log_path)?;
    info!(
        "Training finished: best val loss {:?} at epoch {:?}",
        log.best_val_loss,
        log.best_epoch.map(|e| e + 1)
    );
    Ok(log)
}
