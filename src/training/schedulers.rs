//! Learning rate schedulers
//!
//! Schedulers are stepped once per epoch. The learning rate they report is
//! the base rate; optimizers apply their per-group scales on top.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{NodeError, NodeResult};

/// Learning rate scheduler trait
pub trait LRScheduler: Send + Sync {
    /// Advance one epoch. `metric` is the latest validation loss; only
    /// plateau-driven schedulers read it.
    fn step(&mut self, metric: Option<f32>);
    fn get_lr(&self) -> f32;
    fn reset(&mut self);
}

/// Scheduler configuration, `{"type": "poly", "power": 0.9}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    Constant,
    WarmupCosine {
        warmup_epochs: usize,
        /// Defaults to the number of epochs.
        #[serde(default)]
        t_max: Option<usize>,
        #[serde(default)]
        eta_min: f32,
    },
    Cosine {
        #[serde(default)]
        t_max: Option<usize>,
        #[serde(default)]
        eta_min: f32,
    },
    Poly {
        #[serde(default)]
        total_iters: Option<usize>,
        #[serde(default = "default_power")]
        power: f32,
        #[serde(default)]
        eta_min: f32,
    },
    ReducePlateau {
        #[serde(default = "default_factor")]
        factor: f32,
        #[serde(default = "default_patience")]
        patience: usize,
        #[serde(default = "default_threshold")]
        threshold: f32,
        #[serde(default)]
        min_lr: f32,
    },
    Step {
        step_size: usize,
        #[serde(default = "default_gamma")]
        gamma: f32,
    },
}

fn default_power() -> f32 {
    0.9
}

fn default_factor() -> f32 {
    0.5
}

fn default_patience() -> usize {
    10
}

fn default_threshold() -> f32 {
    1e-4
}

fn default_gamma() -> f32 {
    0.1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::Constant
    }
}

impl SchedulerConfig {
    /// Whether `step` expects the validation loss.
    pub fn needs_metric(&self) -> bool {
        matches!(self, SchedulerConfig::ReducePlateau { .. })
    }

    pub fn create_scheduler(&self, base_lr: f32, num_epochs: usize) -> NodeResult<Box<dyn LRScheduler>> {
        if !(base_lr.is_finite() && base_lr > 0.0) {
            return Err(NodeError::InvalidConfig(format!("learning rate must be positive, got {}", base_lr)));
        }
        let scheduler: Box<dyn LRScheduler> = match *self {
            SchedulerConfig::Constant => Box::new(ConstantLR::new(base_lr)),
            SchedulerConfig::WarmupCosine {
                warmup_epochs,
                t_max,
                eta_min,
            } => Box::new(WarmupCosineAnnealingLR::new(
                base_lr,
                warmup_epochs,
                t_max.unwrap_or(num_epochs),
                eta_min,
            )?),
            SchedulerConfig::Cosine { t_max, eta_min } => {
                Box::new(CosineAnnealingLR::new(base_lr, t_max.unwrap_or(num_epochs), eta_min)?)
            }
            SchedulerConfig::Poly {
                total_iters,
                power,
                eta_min,
            } => Box::new(PolynomialLR::new(
                base_lr,
                total_iters.unwrap_or(num_epochs),
                power,
                eta_min,
            )?),
            SchedulerConfig::ReducePlateau {
                factor,
                patience,
                threshold,
                min_lr,
            } => Box::new(ReduceLROnPlateau::new(base_lr, factor, patience, threshold, min_lr)?),
            SchedulerConfig::Step { step_size, gamma } => Box::new(StepLR::new(base_lr, step_size, gamma)?),
        };
        Ok(scheduler)
    }
}

fn cosine(base_lr: f32, eta_min: f32, epoch: usize, t_max: usize) -> f32 {
    let progress = epoch.min(t_max) as f32 / t_max as f32;
    eta_min + (base_lr - eta_min) * (1.0 + (PI * progress).cos()) / 2.0
}

fn positive_period(name: &str, value: usize) -> NodeResult<()> {
    if value == 0 {
        return Err(NodeError::InvalidConfig(format!("{} must be positive", name)));
    }
    Ok(())
}

/// Keeps the base rate.
pub struct ConstantLR {
    lr: f32,
}

impl ConstantLR {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl LRScheduler for ConstantLR {
    fn step(&mut self, _metric: Option<f32>) {}

    fn get_lr(&self) -> f32 {
        self.lr
    }

    fn reset(&mut self) {}
}

/// Linear warmup `base * (e + 1) / w` for the first `w` epochs, then
/// cosine annealing towards `eta_min` over `t_max` epochs.
pub struct WarmupCosineAnnealingLR {
    base_lr: f32,
    warmup_epochs: usize,
    t_max: usize,
    eta_min: f32,
    epoch: usize,
}

impl WarmupCosineAnnealingLR {
    pub fn new(base_lr: f32, warmup_epochs: usize, t_max: usize, eta_min: f32) -> NodeResult<Self> {
        positive_period("t_max", t_max)?;
        Ok(Self {
            base_lr,
            warmup_epochs,
            t_max,
            eta_min,
            epoch: 0,
        })
    }
}

impl LRScheduler for WarmupCosineAnnealingLR {
    fn step(&mut self, _metric: Option<f32>) {
        self.epoch += 1;
    }

    fn get_lr(&self) -> f32 {
        if self.epoch < self.warmup_epochs {
            self.base_lr * (self.epoch + 1) as f32 / self.warmup_epochs as f32
        } else {
            cosine(self.base_lr, self.eta_min, self.epoch, self.t_max)
        }
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}

/// Cosine annealing from the base rate to `eta_min` over `t_max` epochs.
pub struct CosineAnnealingLR {
    base_lr: f32,
    t_max: usize,
    eta_min: f32,
    epoch: usize,
}

impl CosineAnnealingLR {
    pub fn new(base_lr: f32, t_max: usize, eta_min: f32) -> NodeResult<Self> {
        positive_period("t_max", t_max)?;
        Ok(Self {
            base_lr,
            t_max,
            eta_min,
            epoch: 0,
        })
    }
}

impl LRScheduler for CosineAnnealingLR {
    fn step(&mut self, _metric: Option<f32>) {
        self.epoch += 1;
    }

    fn get_lr(&self) -> f32 {
        cosine(self.base_lr, self.eta_min, self.epoch, self.t_max)
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}

/// `eta_min + (base - eta_min) * (1 - e / total_iters)^power`
pub struct PolynomialLR {
    base_lr: f32,
    total_iters: usize,
    power: f32,
    eta_min: f32,
    epoch: usize,
}

impl PolynomialLR {
    pub fn new(base_lr: f32, total_iters: usize, power: f32, eta_min: f32) -> NodeResult<Self> {
        positive_period("total_iters", total_iters)?;
        Ok(Self {
            base_lr,
            total_iters,
            power,
            eta_min,
            epoch: 0,
        })
    }
}

impl LRScheduler for PolynomialLR {
    fn step(&mut self, _metric: Option<f32>) {
        self.epoch += 1;
    }

    fn get_lr(&self) -> f32 {
        let remaining = 1.0 - self.epoch.min(self.total_iters) as f32 / self.total_iters as f32;
        self.eta_min + (self.base_lr - self.eta_min) * remaining.powf(self.power)
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}

/// Multiplies the rate by `factor` once the monitored loss has not improved
/// by a relative `threshold` for more than `patience` steps.
pub struct ReduceLROnPlateau {
    base_lr: f32,
    factor: f32,
    patience: usize,
    threshold: f32,
    min_lr: f32,
    current_lr: f32,
    best: f32,
    bad_epochs: usize,
}

impl ReduceLROnPlateau {
    pub fn new(base_lr: f32, factor: f32, patience: usize, threshold: f32, min_lr: f32) -> NodeResult<Self> {
        if !(factor > 0.0 && factor < 1.0) {
            return Err(NodeError::InvalidConfig(format!("plateau factor must be in (0, 1), got {}", factor)));
        }
        Ok(Self {
            base_lr,
            factor,
            patience,
            threshold,
            min_lr,
            current_lr: base_lr,
            best: f32::INFINITY,
            bad_epochs: 0,
        })
    }
}

impl LRScheduler for ReduceLROnPlateau {
    fn step(&mut self, metric: Option<f32>) {
        let metric = match metric {
            Some(m) => m,
            None => {
                debug!("plateau scheduler stepped without a metric");
                return;
            }
        };
        if metric < self.best * (1.0 - self.threshold) {
            self.best = metric;
            self.bad_epochs = 0;
            return;
        }
        self.bad_epochs += 1;
        if self.bad_epochs > self.patience {
            let reduced = (self.current_lr * self.factor).max(self.min_lr);
            if reduced < self.current_lr {
                info!("Reducing learning rate to {:.3e}", reduced);
            }
            self.current_lr = reduced;
            self.bad_epochs = 0;
        }
    }

    fn get_lr(&self) -> f32 {
        self.current_lr
    }

    fn reset(&mut self) {
        self.current_lr = self.base_lr;
        self.best = f32::INFINITY;
        self.bad_epochs = 0;
    }
}

/// Step LR Scheduler
pub struct StepLR {
    base_lr: f32,
    step_size: usize,
    gamma: f32,
    epoch: usize,
}

impl StepLR {
    pub fn new(base_lr: f32, step_size: usize, gamma: f32) -> NodeResult<Self> {
        positive_period("step_size", step_size)?;
        Ok(Self {
            base_lr,
            step_size,
            gamma,
            epoch: 0,
        })
    }
}

impl LRScheduler for StepLR {
    fn step(&mut self, _metric: Option<f32>) {
        self.epoch += 1;
    }

    fn get_lr(&self) -> f32 {
        self.base_lr * self.gamma.powi((self.epoch / self.step_size) as i32)
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_warmup_then_cosine() {
        let mut s = WarmupCosineAnnealingLR::new(1.0, 4, 10, 0.0).unwrap();
        let mut lrs = Vec::new();
        for _ in 0..11 {
            lrs.push(s.get_lr());
            s.step(None);
        }
        assert_relative_eq!(lrs[0], 0.25);
        assert_relative_eq!(lrs[3], 1.0);
        assert_relative_eq!(lrs[4], (1.0 + (PI * 0.4).cos()) / 2.0);
        assert_relative_eq!(lrs[10], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cosine_reaches_eta_min_and_stays() {
        let mut s = CosineAnnealingLR::new(0.1, 5, 0.01).unwrap();
        assert_relative_eq!(s.get_lr(), 0.1);
        for _ in 0..7 {
            s.step(None);
        }
        assert_relative_eq!(s.get_lr(), 0.01);
        s.reset();
        assert_relative_eq!(s.get_lr(), 0.1);
    }

    #[test]
    fn test_polynomial_decay() {
        let mut s = PolynomialLR::new(1.0, 10, 0.9, 0.0).unwrap();
        s.step(None);
        assert_relative_eq!(s.get_lr(), 0.9f32.powf(0.9));
        for _ in 0..9 {
            s.step(None);
        }
        assert_relative_eq!(s.get_lr(), 0.0);
    }

    #[test]
    fn test_plateau_reduces_after_patience() {
        let mut s = ReduceLROnPlateau::new(1.0, 0.5, 2, 1e-4, 0.3).unwrap();
        s.step(Some(1.0));
        s.step(Some(1.0));
        s.step(Some(1.0));
        assert_relative_eq!(s.get_lr(), 1.0);
        s.step(Some(1.0));
        assert_relative_eq!(s.get_lr(), 0.5);
        for _ in 0..3 {
            s.step(Some(2.0));
        }
        assert_relative_eq!(s.get_lr(), 0.3);
        s.step(None);
        assert_relative_eq!(s.get_lr(), 0.3);
    }

    #[test]
    fn test_step_lr() {
        let mut s = StepLR::new(1.0, 2, 0.1).unwrap();
        s.step(None);
        assert_relative_eq!(s.get_lr(), 1.0);
        s.step(None);
        assert_relative_eq!(s.get_lr(), 0.1);
    }

    #[test]
    fn test_config_from_json() {
        let cfg: SchedulerConfig = serde_json::from_str(r#"{"type": "warmup_cosine", "warmup_epochs": 2}"#).unwrap();
        let s = cfg.create_scheduler(0.01, 20).unwrap();
        assert_relative_eq!(s.get_lr(), 0.005);
        let cfg: SchedulerConfig = serde_json::from_str(r#"{"type": "poly"}"#).unwrap();
        assert_eq!(
            cfg,
            SchedulerConfig::Poly {
                total_iters: None,
                power: 0.9,
                eta_min: 0.0
            }
        );
        assert!(SchedulerConfig::Constant.create_scheduler(0.0, 1).is_err());
        assert!(SchedulerConfig::Cosine { t_max: Some(0), eta_min: 0.0 }
            .create_scheduler(0.1, 1)
            .is_err());
    }
}
