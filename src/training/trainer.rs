//! One epoch of training or validation over a multi-hypergraph model.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::metrics::{MetricParams, MetricResult};
use super::report;
use crate::data::NodeLoaders;
use crate::error::{NodeError, NodeResult};
use crate::nn::losses::{LossFn, LossParams};
use crate::nn::models::de_node_id;
use crate::nn::{MHDNet, Module, NodeId, Optimizer};
use crate::registry;
use crate::tensor::Tensor;

fn default_weight() -> f32 {
    1.0
}

/// A weighted loss between two output nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossTerm {
    #[serde(rename = "fn")]
    pub function: String,
    #[serde(deserialize_with = "de_node_id")]
    pub src_node: NodeId,
    #[serde(deserialize_with = "de_node_id")]
    pub target_node: NodeId,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub params: LossParams,
}

/// A metric between two output nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTerm {
    #[serde(rename = "fn")]
    pub function: String,
    #[serde(deserialize_with = "de_node_id")]
    pub src_node: NodeId,
    #[serde(deserialize_with = "de_node_id")]
    pub target_node: NodeId,
    #[serde(default)]
    pub params: MetricParams,
}

/// Losses and metrics of one task. Functions are named by their exported
/// names, e.g. `"node_dice_loss"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub loss: Vec<LossTerm>,
    #[serde(default)]
    pub metric: Vec<MetricTerm>,
}

impl TaskConfig {
    /// Checks that every function resolves and every node is a model output.
    pub fn validate(&self, task: &str, out_nodes: &[NodeId]) -> NodeResult<()> {
        if self.loss.is_empty() {
            return Err(NodeError::InvalidConfig(format!("task {} has no loss terms", task)));
        }
        let check_node = |node: &str| {
            if out_nodes.iter().any(|n| n == node) {
                Ok(())
            } else {
                Err(NodeError::InvalidConfig(format!(
                    "task {} refers to node {} which is not a model output",
                    task, node
                )))
            }
        };
        for term in &self.loss {
            registry::resolve_loss(&term.function)?;
            check_node(&term.src_node)?;
            check_node(&term.target_node)?;
        }
        for term in &self.metric {
            registry::resolve_metric(&term.function)?;
            check_node(&term.src_node)?;
            check_node(&term.target_node)?;
        }
        Ok(())
    }
}

/// Mean value of one loss term over an epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermLoss {
    #[serde(rename = "fn")]
    pub function: String,
    pub src_node: NodeId,
    pub target_node: NodeId,
    pub weight: f32,
    pub value: f32,
}

/// A metric evaluated on the predictions of a whole epoch. Every metric of a
/// task is computed on the outputs named by its first metric term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(rename = "fn")]
    pub function: String,
    pub src_node: NodeId,
    pub target_node: NodeId,
    pub result: MetricResult,
}

/// Outcome of [`train`] or [`validate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub avg_loss: f32,
    /// Per task: sum over terms of `weight * mean(term value)`.
    pub task_losses: BTreeMap<String, f32>,
    pub term_losses: BTreeMap<String, Vec<TermLoss>>,
    pub task_metrics: BTreeMap<String, Vec<MetricRecord>>,
    /// Per task: voxel count of each class of the first loss target.
    pub class_distribution: BTreeMap<String, BTreeMap<usize, u64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Train,
    Validate,
}

impl Phase {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Phase::Train => "Train",
            Phase::Validate => "Val",
        }
    }
}

fn position(out_nodes: &[NodeId], node: &str) -> NodeResult<usize> {
    out_nodes
        .iter()
        .position(|n| n == node)
        .ok_or_else(|| NodeError::InvalidConfig(format!("node {} is not a model output", node)))
}

#[derive(Default)]
struct TaskAccumulator {
    term_values: Vec<Vec<f32>>,
    // (src, target) batches of the first metric term, shared by every term
    metric_src: Vec<Tensor>,
    metric_target: Vec<Tensor>,
    classes: BTreeMap<usize, u64>,
}

fn run_epoch(
    model: &mut MHDNet,
    loaders: &NodeLoaders,
    mut optimizer: Option<&mut dyn Optimizer>,
    tasks: &BTreeMap<String, TaskConfig>,
    epoch: usize,
    num_epochs: usize,
    phase: Phase,
) -> NodeResult<EpochSummary> {
    let num_batches = loaders.num_batches();
    if num_batches == 0 {
        return Err(NodeError::InvalidData(format!(
            "{} loaders yield no batches",
            phase.label().to_lowercase()
        )));
    }
    let out_nodes = model.out_nodes().to_vec();
    let in_nodes = model.in_nodes().to_vec();
    for (name, task) in tasks {
        task.validate(name, &out_nodes)?;
    }
    let mut resolved: BTreeMap<&str, Vec<(LossFn, usize, usize)>> = BTreeMap::new();
    for (name, task) in tasks {
        let mut fns = Vec::with_capacity(task.loss.len());
        for term in &task.loss {
            fns.push((
                registry::resolve_loss(&term.function)?,
                position(&out_nodes, &term.src_node)?,
                position(&out_nodes, &term.target_node)?,
            ));
        }
        resolved.insert(name.as_str(), fns);
    }

    model.set_training(phase == Phase::Train);
    let started = Instant::now();
    let seeds = loaders.epoch_seeds(epoch);
    let mut running_loss = 0.0f64;
    let mut acc: BTreeMap<&str, TaskAccumulator> = tasks
        .iter()
        .map(|(name, task)| {
            (
                name.as_str(),
                TaskAccumulator {
                    term_values: vec![Vec::with_capacity(num_batches); task.loss.len()],
                    metric_src: Vec::with_capacity(num_batches),
                    metric_target: Vec::with_capacity(num_batches),
                    classes: BTreeMap::new(),
                },
            )
        })
        .collect();

    for (batch_idx, &seed) in seeds.iter().enumerate() {
        let batches = loaders.load(&in_nodes, batch_idx, seed)?;
        let inputs: Vec<Tensor> = batches.into_iter().map(|b| b.data).collect();
        let outputs = model.forward(&inputs)?;
        let mut grads: Vec<Option<Tensor>> = vec![None; outputs.len()];
        let mut total_loss = 0.0f32;

        for (name, task) in tasks {
            let state = acc
                .get_mut(name.as_str())
                .ok_or_else(|| NodeError::operation_error("epoch", "task accumulator missing"))?;
            if let Some(term) = task.metric.first() {
                let (src, target) = (position(&out_nodes, &term.src_node)?, position(&out_nodes, &term.target_node)?);
                state.metric_src.push(outputs[src].clone());
                state.metric_target.push(outputs[target].clone());
            }
            let first_target = position(&out_nodes, &task.loss[0].target_node)?;
            for label in outputs[first_target].argmax() {
                *state.classes.entry(label).or_insert(0) += 1;
            }

            let mut task_loss = 0.0f32;
            for (k, (term, &(loss_fn, src, target))) in task.loss.iter().zip(&resolved[name.as_str()]).enumerate() {
                let out = loss_fn(&outputs[src], &outputs[target], &term.params)?;
                task_loss += term.weight * out.value;
                state.term_values[k].push(out.value);
                if phase == Phase::Train {
                    for (idx, grad) in [(src, &out.grad_src), (target, &out.grad_target)] {
                        match &mut grads[idx] {
                            Some(g) => g.add_scaled(grad, term.weight)?,
                            slot => *slot = Some(grad.scale(term.weight)),
                        }
                    }
                }
            }
            total_loss += task_loss;
        }

        if let Some(opt) = optimizer.as_mut() {
            model.zero_grad();
            model.backward(&grads)?;
            opt.step(&mut *model)?;
        }
        debug!(
            "{} batch {}/{}: loss {:.4}",
            phase.label(),
            batch_idx + 1,
            num_batches,
            total_loss
        );
        running_loss += total_loss as f64;
    }

    let mut summary = EpochSummary {
        avg_loss: (running_loss / num_batches as f64) as f32,
        ..Default::default()
    };
    for (name, task) in tasks {
        let state = acc
            .remove(name.as_str())
            .ok_or_else(|| NodeError::operation_error("epoch", "task accumulator missing"))?;
        let terms: Vec<TermLoss> = task
            .loss
            .iter()
            .zip(&state.term_values)
            .map(|(term, values)| TermLoss {
                function: term.function.clone(),
                src_node: term.src_node.clone(),
                target_node: term.target_node.clone(),
                weight: term.weight,
                value: values.iter().sum::<f32>() / values.len().max(1) as f32,
            })
            .collect();
        summary
            .task_losses
            .insert(name.clone(), terms.iter().map(|t| t.weight * t.value).sum());
        summary.term_losses.insert(name.clone(), terms);

        let mut records = Vec::with_capacity(task.metric.len());
        if !task.metric.is_empty() {
            let src = Tensor::concat_batch(&state.metric_src)?;
            let target = Tensor::concat_batch(&state.metric_target)?;
            for term in &task.metric {
                let metric_fn = registry::resolve_metric(&term.function)?;
                let result = metric_fn(&src, &target, &term.params)?;
                records.push(MetricRecord {
                    function: term.function.clone(),
                    src_node: term.src_node.clone(),
                    target_node: term.target_node.clone(),
                    result,
                });
            }
        }
        summary.task_metrics.insert(name.clone(), records);
        summary.class_distribution.insert(name.clone(), state.classes);
    }

    info!(
        "Epoch [{}/{}], {} Total Loss: {:.4} ({:.1}s)",
        epoch + 1,
        num_epochs,
        phase.label(),
        summary.avg_loss,
        started.elapsed().as_secs_f32()
    );
    report::log_summary(phase, &summary, tasks);
    Ok(summary)
}

/// Trains `model` for one epoch and reports the epoch summary.
pub fn train(
    model: &mut MHDNet,
    loaders: &NodeLoaders,
    optimizer: &mut dyn Optimizer,
    tasks: &BTreeMap<String, TaskConfig>,
    epoch: usize,
    num_epochs: usize,
) -> NodeResult<EpochSummary> {
    run_epoch(model, loaders, Some(optimizer), tasks, epoch, num_epochs, Phase::Train)
}

/// Evaluates `model` without updating it.
pub fn validate(
    model: &mut MHDNet,
    loaders: &NodeLoaders,
    tasks: &BTreeMap<String, TaskConfig>,
    epoch: usize,
    num_epochs: usize,
) -> NodeResult<EpochSummary> {
    run_epoch(model, loaders, None, tasks, epoch, num_epochs, Phase::Validate)
}
