//! Optimizers

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::nn::layers::{Module, Parameter};

/// Parameters whose names start with one of `prefixes` get scaled
/// learning rate and weight decay, e.g. pretrained sub-networks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub prefixes: Vec<String>,
    #[serde(default = "one")]
    pub lr_scale: f32,
    #[serde(default = "one")]
    pub weight_decay_scale: f32,
}

fn one() -> f32 {
    1.0
}

fn group_scales(groups: &[ParamGroup], name: &str) -> (f32, f32) {
    groups
        .iter()
        .find(|g| g.prefixes.iter().any(|p| name == p || name.starts_with(&format!("{}.", p))))
        .map_or((1.0, 1.0), |g| (g.lr_scale, g.weight_decay_scale))
}

pub trait Optimizer {
    /// Applies one update to every trainable parameter of `model`.
    fn step(&mut self, model: &mut dyn Module) -> NodeResult<()>;
    fn lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
}

/// SGD optimizer with momentum and L2 weight decay
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    groups: Vec<ParamGroup>,
    velocity: HashMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> NodeResult<Self> {
        if lr <= 0.0 || !(0.0..1.0).contains(&momentum) || weight_decay < 0.0 {
            return Err(NodeError::InvalidConfig(format!(
                "invalid SGD settings: lr={}, momentum={}, weight_decay={}",
                lr, momentum, weight_decay
            )));
        }
        Ok(Self {
            lr,
            momentum,
            weight_decay,
            groups: Vec::new(),
            velocity: HashMap::new(),
        })
    }

    pub fn with_groups(mut self, groups: Vec<ParamGroup>) -> Self {
        self.groups = groups;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, model: &mut dyn Module) -> NodeResult<()> {
        let (lr, momentum, weight_decay) = (self.lr, self.momentum, self.weight_decay);
        let groups = &self.groups;
        let velocity = &mut self.velocity;
        model.visit_parameters("", &mut |name: &str, param: &mut Parameter| {
            if !param.trainable {
                return;
            }
            let (lr_scale, wd_scale) = group_scales(groups, name);
            let v = velocity
                .entry(name.to_string())
                .or_insert_with(|| vec![0.0; param.value.numel()]);
            let grads = param.grad.data();
            for ((p, &g), v) in param.value.data_mut().iter_mut().zip(grads).zip(v.iter_mut()) {
                let g = g + weight_decay * wd_scale * *p;
                *v = momentum * *v + g;
                *p -= lr * lr_scale * *v;
            }
        });
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[derive(Debug, Clone)]
struct AdamState {
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

/// Adam optimizer. Weight decay is added to the gradient (L2), matching
/// the classic formulation rather than decoupled AdamW.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    groups: Vec<ParamGroup>,
    state: HashMap<String, AdamState>,
}

impl Adam {
    pub fn new(lr: f32, beta1: f32, beta2: f32, eps: f32, weight_decay: f32) -> NodeResult<Self> {
        if lr <= 0.0 || !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) || eps <= 0.0 || weight_decay < 0.0 {
            return Err(NodeError::InvalidConfig(format!(
                "invalid Adam settings: lr={}, betas=({}, {}), eps={}, weight_decay={}",
                lr, beta1, beta2, eps, weight_decay
            )));
        }
        Ok(Self {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            groups: Vec::new(),
            state: HashMap::new(),
        })
    }

    /// Default betas (0.9, 0.999) and eps 1e-8.
    pub fn with_defaults(lr: f32, weight_decay: f32) -> NodeResult<Self> {
        Self::new(lr, 0.9, 0.999, 1e-8, weight_decay)
    }

    pub fn with_groups(mut self, groups: Vec<ParamGroup>) -> Self {
        self.groups = groups;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, model: &mut dyn Module) -> NodeResult<()> {
        let (lr, beta1, beta2, eps, weight_decay) = (self.lr, self.beta1, self.beta2, self.eps, self.weight_decay);
        let groups = &self.groups;
        let states = &mut self.state;
        model.visit_parameters("", &mut |name: &str, param: &mut Parameter| {
            if !param.trainable {
                return;
            }
            let (lr_scale, wd_scale) = group_scales(groups, name);
            let numel = param.value.numel();
            let state = states.entry(name.to_string()).or_insert_with(|| AdamState {
                m: vec![0.0; numel],
                v: vec![0.0; numel],
                t: 0,
            });
            state.t += 1;
            let bias1 = 1.0 - beta1.powi(state.t);
            let bias2 = 1.0 - beta2.powi(state.t);
            let step_size = lr * lr_scale / bias1;
            let grads = param.grad.data();
            let values = param.value.data_mut();
            for i in 0..numel {
                let g = grads[i] + weight_decay * wd_scale * values[i];
                state.m[i] = beta1 * state.m[i] + (1.0 - beta1) * g;
                state.v[i] = beta2 * state.v[i] + (1.0 - beta2) * g * g;
                values[i] -= step_size * state.m[i] / ((state.v[i] / bias2).sqrt() + eps);
            }
        });
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}
