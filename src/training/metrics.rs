//! Node evaluation metrics
//!
//! Classification metrics compare the per-voxel labels of two node tensors
//! (argmax over channels, or a threshold for single-channel tensors) through
//! a per-class confusion count. Ratios with a zero denominator are NaN and
//! are left out of the average.

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::tensor::Tensor;

const DEFAULT_THRESHOLD: f32 = 0.5;

/// Optional metric knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricParams {
    /// Threshold turning a single channel into classes 0 and 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    /// Number of classes to report; defaults to the channel count (2 for a
    /// single channel).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_classes: Option<usize>,
}

/// Per-class values and their NaN-aware mean.
/// Undefined values are stored as `null` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    #[serde(with = "nan_as_null::vec")]
    pub per_class: Vec<f64>,
    #[serde(with = "nan_as_null")]
    pub avg: f64,
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    fn wrap(v: f64) -> Option<f64> {
        (!v.is_nan()).then_some(v)
    }

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        wrap(*v).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }

    pub mod vec {
        use super::*;

        pub fn serialize<S: Serializer>(v: &[f64], s: S) -> Result<S::Ok, S::Error> {
            s.collect_seq(v.iter().map(|x| wrap(*x)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
            let values = Vec::<Option<f64>>::deserialize(d)?;
            Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
        }
    }
}

impl MetricResult {
    pub fn from_per_class(per_class: Vec<f64>) -> Self {
        let defined: Vec<f64> = per_class.iter().copied().filter(|v| !v.is_nan()).collect();
        let avg = if defined.is_empty() {
            f64::NAN
        } else {
            defined.iter().sum::<f64>() / defined.len() as f64
        };
        Self { per_class, avg }
    }
}

/// Signature shared by every exported node metric.
pub type MetricFn = fn(&Tensor, &Tensor, &MetricParams) -> NodeResult<MetricResult>;

/// One-vs-rest confusion counts per class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Confusion {
    pub tp: Vec<u64>,
    pub fp: Vec<u64>,
    pub fn_: Vec<u64>,
    pub tn: Vec<u64>,
}

impl Confusion {
    pub fn from_tensors(src: &Tensor, target: &Tensor, params: &MetricParams) -> NodeResult<Self> {
        check_pair(src, target)?;
        let threshold = params.threshold.unwrap_or(DEFAULT_THRESHOLD);
        let channels = src.shape().channels();
        let classes = params.num_classes.unwrap_or(if channels == 1 { 2 } else { channels });
        if classes == 0 {
            return Err(NodeError::InvalidConfig("num_classes must be positive".to_string()));
        }
        let pred = src.argmax_channels(threshold);
        let truth = target.argmax_channels(threshold);
        Self::from_labels(&pred, &truth, classes)
    }

    pub fn from_labels(pred: &[usize], truth: &[usize], classes: usize) -> NodeResult<Self> {
        let mut confusion = Self {
            tp: vec![0; classes],
            fp: vec![0; classes],
            fn_: vec![0; classes],
            tn: vec![0; classes],
        };
        for (&p, &t) in pred.iter().zip(truth) {
            if p >= classes || t >= classes {
                return Err(NodeError::InvalidData(format!(
                    "label {} outside {} classes",
                    p.max(t),
                    classes
                )));
            }
            for k in 0..classes {
                match (p == k, t == k) {
                    (true, true) => confusion.tp[k] += 1,
                    (true, false) => confusion.fp[k] += 1,
                    (false, true) => confusion.fn_[k] += 1,
                    (false, false) => confusion.tn[k] += 1,
                }
            }
        }
        Ok(confusion)
    }

    pub fn classes(&self) -> usize {
        self.tp.len()
    }

    fn per_class<F: Fn(f64, f64, f64, f64) -> f64>(&self, f: F) -> Vec<f64> {
        (0..self.classes())
            .map(|k| f(self.tp[k] as f64, self.fp[k] as f64, self.fn_[k] as f64, self.tn[k] as f64))
            .collect()
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        f64::NAN
    } else {
        num / den
    }
}

fn check_pair(src: &Tensor, target: &Tensor) -> NodeResult<()> {
    src.expect_same_shape(target, "metric")?;
    if src.shape().ndim() < 2 {
        return Err(NodeError::shape_error("[N, C, ...]", &src.shape().to_string(), None));
    }
    Ok(())
}

fn classification(
    src: &Tensor,
    target: &Tensor,
    params: &MetricParams,
    f: impl Fn(f64, f64, f64, f64) -> f64,
) -> NodeResult<MetricResult> {
    let confusion = Confusion::from_tensors(src, target, params)?;
    Ok(MetricResult::from_per_class(confusion.per_class(f)))
}

/// `tp / (tp + fn)` per class.
pub fn node_recall_metric(src: &Tensor, target: &Tensor, params: &MetricParams) -> NodeResult<MetricResult> {
    classification(src, target, params, |tp, _, fn_, _| ratio(tp, tp + fn_))
}

/// `tp / (tp + fp)` per class.
pub fn node_precision_metric(src: &Tensor, target: &Tensor, params: &MetricParams) -> NodeResult<MetricResult> {
    classification(src, target, params, |tp, fp, _, _| ratio(tp, tp + fp))
}

/// Harmonic mean of precision and recall; NaN when either is undefined.
pub fn node_f1_metric(src: &Tensor, target: &Tensor, params: &MetricParams) -> NodeResult<MetricResult> {
    classification(src, target, params, |tp, fp, fn_, _| {
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        if precision.is_nan() || recall.is_nan() {
            f64::NAN
        } else if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    })
}

/// `2 tp / (2 tp + fp + fn)` per class.
pub fn node_dice_metric(src: &Tensor, target: &Tensor, params: &MetricParams) -> NodeResult<MetricResult> {
    classification(src, target, params, |tp, fp, fn_, _| ratio(2.0 * tp, 2.0 * tp + fp + fn_))
}

/// `tp / (tp + fp + fn)` per class.
pub fn node_iou_metric(src: &Tensor, target: &Tensor, params: &MetricParams) -> NodeResult<MetricResult> {
    classification(src, target, params, |tp, fp, fn_, _| ratio(tp, tp + fp + fn_))
}

/// One-vs-rest accuracy per class.
pub fn node_accuracy_metric(src: &Tensor, target: &Tensor, params: &MetricParams) -> NodeResult<MetricResult> {
    classification(src, target, params, |tp, fp, fn_, tn| ratio(tp + tn, tp + fp + fn_ + tn))
}

/// `tn / (tn + fp)` per class.
pub fn node_specificity_metric(src: &Tensor, target: &Tensor, params: &MetricParams) -> NodeResult<MetricResult> {
    classification(src, target, params, |_, fp, _, tn| ratio(tn, tn + fp))
}

/// Mean squared error per channel on the raw values.
pub fn node_mse_metric(src: &Tensor, target: &Tensor, _params: &MetricParams) -> NodeResult<MetricResult> {
    check_pair(src, target)?;
    let (c, plane) = (src.shape().channels(), src.plane_len());
    let mut sums = vec![0.0f64; c];
    let mut counts = vec![0usize; c];
    for (i, (&s, &t)) in src.data().iter().zip(target.data()).enumerate() {
        let k = (i / plane) % c;
        let d = (s - t) as f64;
        sums[k] += d * d;
        counts[k] += 1;
    }
    let per_class = sums
        .into_iter()
        .zip(counts)
        .map(|(s, n)| ratio(s, n as f64))
        .collect();
    Ok(MetricResult::from_per_class(per_class))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // Four voxels, two classes. Predicted labels [0, 0, 1, 1], truth [0, 1, 1, 1].
    fn pair() -> (Tensor, Tensor) {
        let src = Tensor::from_vec(&[1, 2, 4], vec![0.9, 0.6, 0.2, 0.1, 0.1, 0.4, 0.8, 0.9]).unwrap();
        let target = Tensor::from_vec(&[1, 2, 4], vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        (src, target)
    }

    #[test]
    fn test_undefined_values_survive_json() {
        let result = MetricResult::from_per_class(vec![0.5, f64::NAN]);
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"per_class":[0.5,null],"avg":0.5}"#);
        let back: MetricResult = serde_json::from_str(&json).unwrap();
        assert!(back.per_class[1].is_nan());
        assert_eq!(back.avg, 0.5);
    }

    #[test]
    fn test_confusion_counts() {
        let (src, target) = pair();
        let c = Confusion::from_tensors(&src, &target, &MetricParams::default()).unwrap();
        assert_eq!(c.tp, vec![1, 2]);
        assert_eq!(c.fp, vec![1, 0]);
        assert_eq!(c.fn_, vec![0, 1]);
        assert_eq!(c.tn, vec![2, 1]);
    }

    #[test]
    fn test_recall_precision_f1() {
        let (src, target) = pair();
        let p = MetricParams::default();
        let recall = node_recall_metric(&src, &target, &p).unwrap();
        assert_relative_eq!(recall.per_class[0], 1.0);
        assert_relative_eq!(recall.per_class[1], 2.0 / 3.0);
        let precision = node_precision_metric(&src, &target, &p).unwrap();
        assert_relative_eq!(precision.per_class[0], 0.5);
        assert_relative_eq!(precision.per_class[1], 1.0);
        let f1 = node_f1_metric(&src, &target, &p).unwrap();
        assert_relative_eq!(f1.per_class[0], 2.0 / 3.0);
        assert_relative_eq!(f1.per_class[1], 0.8);
        assert_relative_eq!(f1.avg, (2.0 / 3.0 + 0.8) / 2.0);
    }

    #[test]
    fn test_dice_matches_f1_and_iou_is_smaller() {
        let (src, target) = pair();
        let p = MetricParams::default();
        let dice = node_dice_metric(&src, &target, &p).unwrap();
        let f1 = node_f1_metric(&src, &target, &p).unwrap();
        let iou = node_iou_metric(&src, &target, &p).unwrap();
        for k in 0..2 {
            assert_relative_eq!(dice.per_class[k], f1.per_class[k], epsilon = 1e-12);
            assert!(iou.per_class[k] <= dice.per_class[k]);
        }
        assert_relative_eq!(iou.per_class[0], 0.5);
    }

    #[test]
    fn test_absent_class_is_nan_and_skipped_in_average() {
        let src = Tensor::from_vec(&[1, 3, 2], vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0]).unwrap();
        let recall = node_recall_metric(&src, &src, &MetricParams::default()).unwrap();
        assert_eq!(recall.per_class.len(), 3);
        assert!(recall.per_class[2].is_nan());
        assert_relative_eq!(recall.avg, 1.0);
    }

    #[test]
    fn test_single_channel_uses_threshold() {
        let src = Tensor::from_vec(&[1, 1, 4], vec![0.2, 0.7, 0.4, 0.9]).unwrap();
        let target = Tensor::from_vec(&[1, 1, 4], vec![0.0, 1.0, 1.0, 1.0]).unwrap();
        let default = node_recall_metric(&src, &target, &MetricParams::default()).unwrap();
        assert_relative_eq!(default.per_class[1], 2.0 / 3.0);
        let low = MetricParams {
            threshold: Some(0.3),
            ..Default::default()
        };
        let lowered = node_recall_metric(&src, &target, &low).unwrap();
        assert_relative_eq!(lowered.per_class[1], 1.0);
    }

    #[test]
    fn test_accuracy_specificity_mse() {
        let (src, target) = pair();
        let p = MetricParams::default();
        let acc = node_accuracy_metric(&src, &target, &p).unwrap();
        assert_relative_eq!(acc.per_class[0], 0.75);
        let spec = node_specificity_metric(&src, &target, &p).unwrap();
        assert_relative_eq!(spec.per_class[0], 2.0 / 3.0);
        assert_relative_eq!(spec.per_class[1], 1.0);
        let mse = node_mse_metric(&target, &target, &p).unwrap();
        assert_eq!(mse.per_class, vec![0.0, 0.0]);
    }

    #[test]
    fn test_all_undefined_average_is_nan() {
        let r = MetricResult::from_per_class(vec![f64::NAN, f64::NAN]);
        assert!(r.avg.is_nan());
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let a = Tensor::zeros(&[1, 2, 4]);
        let b = Tensor::zeros(&[1, 2, 3]);
        assert!(node_dice_metric(&a, &b, &MetricParams::default()).is_err());
    }
}
