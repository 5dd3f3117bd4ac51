//! Experiment configuration files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::{CasePolicy, TransformConfig};
use crate::error::{NodeError, NodeResult};
use crate::nn::models::RawNodeId;
use crate::nn::{MHDNetConfig, NodeId};
use crate::training::{SchedulerConfig, TaskConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_dir: PathBuf,
    pub val_dir: PathBuf,
    pub save_dir: PathBuf,
    #[serde(default)]
    pub case_policy: CasePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub validation_interval: usize,
    pub patience: usize,
    pub drop_last: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            num_epochs: 200,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            validation_interval: 1,
            patience: 100,
            drop_last: true,
        }
    }
}

/// Subscriber settings; `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Data file suffix of a global node, written `[node, "0000"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(RawNodeId, String)", into = "(NodeId, String)")]
pub struct NodeFile {
    pub node: NodeId,
    pub suffix: String,
}

impl From<(RawNodeId, String)> for NodeFile {
    fn from((node, suffix): (RawNodeId, String)) -> Self {
        Self {
            node: node.into(),
            suffix,
        }
    }
}

impl From<NodeFile> for (NodeId, String) {
    fn from(f: NodeFile) -> Self {
        (f.node, f.suffix)
    }
}

/// Per-node transform lists of each phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformsConfig {
    #[serde(default)]
    pub train: BTreeMap<NodeId, Vec<TransformConfig>>,
    #[serde(default)]
    pub validate: BTreeMap<NodeId, Vec<TransformConfig>>,
}

/// Everything one training run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    pub data: DataConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub model: MHDNetConfig,
    pub node_files: Vec<NodeFile>,
    #[serde(default)]
    pub transforms: TransformsConfig,
    pub tasks: BTreeMap<String, TaskConfig>,
    /// Sub-network weights loaded before training.
    #[serde(default)]
    pub pretrained: BTreeMap<String, PathBuf>,
    /// Sub-networks whose weights are also written as `{name}.bin` on
    /// every improvement.
    #[serde(default)]
    pub save_sub_networks: Vec<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_seed() -> u64 {
    42
}

impl ExperimentConfig {
    pub fn from_json(text: &str) -> NodeResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> NodeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::IoError(format!("cannot read config {}: {}", path.display(), e)))?;
        let config = Self::from_json(&content)?;
        tracing::info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> NodeResult<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        tracing::info!("Configuration saved to {:?}", path.as_ref());
        Ok(())
    }

    /// Suffix of a global node's data files.
    pub fn suffix_of(&self, node: &str) -> Option<&str> {
        self.node_files
            .iter()
            .find(|f| f.node == node)
            .map(|f| f.suffix.as_str())
    }

    /// Checks values and cross references without touching the file system.
    pub fn validate(&self) -> NodeResult<()> {
        let t = &self.training;
        let invalid = |msg: String| Err(NodeError::InvalidConfig(msg));
        if t.batch_size == 0 {
            return invalid("training.batch_size must be positive".to_string());
        }
        if t.num_epochs == 0 {
            return invalid("training.num_epochs must be positive".to_string());
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            return invalid(format!("training.learning_rate must be positive, got {}", t.learning_rate));
        }
        if t.weight_decay < 0.0 {
            return invalid(format!("training.weight_decay must be >= 0, got {}", t.weight_decay));
        }
        if t.validation_interval == 0 {
            return invalid("training.validation_interval must be positive".to_string());
        }

        for file in &self.node_files {
            if self.model.global_shape(&file.node).is_none() {
                return invalid(format!("node_files lists node {} which no sub-network maps", file.node));
            }
        }
        if let Some(node) = self.model.in_nodes.iter().find(|n| self.suffix_of(n).is_none()) {
            return invalid(format!("input node {} has no entry in node_files", node));
        }
        for (phase, lists) in [("train", &self.transforms.train), ("validate", &self.transforms.validate)] {
            if let Some(node) = lists.keys().find(|n| self.suffix_of(n).is_none()) {
                return invalid(format!("{} transforms name node {} without data files", phase, node));
            }
        }
        for name in self.pretrained.keys().chain(&self.save_sub_networks) {
            if !self.model.sub_networks.contains_key(name) {
                return invalid(format!("unknown sub-network {}", name));
            }
        }
        if self.tasks.is_empty() {
            return invalid("at least one task is required".to_string());
        }
        for (name, task) in &self.tasks {
            task.validate(name, &self.model.out_nodes)?;
        }
        Ok(())
    }
}
