//! Per-node datasets over `case_{id}_{suffix}` files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::nifti::{read_csv_values, read_nifti};
use super::transforms::{apply_all, TransformConfig};
use crate::error::{ErrorContext, NodeError, NodeResult, WithContext};
use crate::nn::NodeId;
use crate::tensor::{resize_sample, Interpolation, Tensor};

/// Extensions tried, in order, when a suffix carries none.
pub const EXTENSIONS: [&str; 3] = [".nii.gz", ".nii", ".csv"];

/// Base trait for all datasets
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample `index` as `[C, S...]`.
    fn get(&self, index: usize) -> NodeResult<Tensor>;

    /// Case ids in iteration order.
    fn case_ids(&self) -> &[String];

    /// Seed shared by every sample of the next batch.
    fn set_batch_seed(&self, seed: u64);
}

/// Seed of one sample, derived from the batch seed and the sample index.
pub fn sample_seed(batch_seed: u64, index: usize) -> u64 {
    // splitmix64 finaliser
    let mut z = batch_seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// File of `case_id` for `suffix` in `dir`, if one exists.
pub fn case_file(dir: &Path, case_id: &str, suffix: &str) -> Option<PathBuf> {
    let stem = format!("case_{}_{}", case_id, suffix);
    if has_extension(suffix) {
        let path = dir.join(stem);
        return path.is_file().then_some(path);
    }
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}{}", stem, ext)))
        .find(|p| p.is_file())
}

pub(crate) fn has_extension(suffix: &str) -> bool {
    EXTENSIONS.iter().any(|ext| suffix.ends_with(ext))
}

/// Samples of one graph node, one file per case.
pub struct NodeDataset {
    data_dir: PathBuf,
    node: NodeId,
    suffix: String,
    target_shape: Vec<usize>,
    num_dimensions: usize,
    transforms: Vec<TransformConfig>,
    case_ids: Vec<String>,
    batch_seed: RwLock<u64>,
}

impl NodeDataset {
    /// `target_shape` is `(C, S...)` with `num_dimensions` spatial dims.
    pub fn new<P: AsRef<Path>>(
        data_dir: P,
        node: &str,
        suffix: &str,
        target_shape: &[usize],
        num_dimensions: usize,
    ) -> NodeResult<Self> {
        if target_shape.len() != num_dimensions + 1 {
            return Err(NodeError::InvalidConfig(format!(
                "node {} shape {:?} does not have {} spatial dims",
                node, target_shape, num_dimensions
            )));
        }
        Ok(Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            node: node.to_string(),
            suffix: suffix.to_string(),
            target_shape: target_shape.to_vec(),
            num_dimensions,
            transforms: Vec::new(),
            case_ids: Vec::new(),
            batch_seed: RwLock::new(0),
        })
    }

    pub fn with_transforms(mut self, transforms: Vec<TransformConfig>) -> Self {
        self.transforms = transforms;
        self
    }

    /// Sets the cases and their iteration order. `order` must be a
    /// permutation of `case_ids`; without one the ids are used as given.
    pub fn with_cases(mut self, case_ids: &[String], order: Option<&[String]>) -> NodeResult<Self> {
        let ordered = match order {
            None => case_ids.to_vec(),
            Some(order) => {
                let ids: HashSet<&String> = case_ids.iter().collect();
                let seen: HashSet<&String> = order.iter().collect();
                if order.len() != case_ids.len() || seen.len() != order.len() || seen != ids {
                    return Err(NodeError::InvalidConfig(format!(
                        "case order for node {} is not a permutation of its {} case ids",
                        self.node,
                        case_ids.len()
                    )));
                }
                order.to_vec()
            }
        };
        self.case_ids = ordered;
        Ok(self)
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn target_shape(&self) -> &[usize] {
        &self.target_shape
    }

    fn target_spatial(&self) -> &[usize] {
        &self.target_shape[1..]
    }

    fn load_csv(&self, path: &Path) -> NodeResult<Tensor> {
        let values = read_csv_values(path)?;
        let spatial: usize = self.target_spatial().iter().product();
        let total: usize = self.target_shape.iter().product();
        let mut one_channel = vec![1];
        one_channel.extend_from_slice(self.target_spatial());
        if values.len() == total {
            Tensor::from_vec(&self.target_shape, values)
        } else if values.len() == spatial {
            Tensor::from_vec(&one_channel, values)
        } else if values.len() == 1 {
            Ok(Tensor::full(&one_channel, values[0]))
        } else {
            Err(NodeError::InvalidData(format!(
                "{} holds {} values, expected {}, {} or 1",
                path.display(),
                values.len(),
                total,
                spatial
            )))
        }
    }

    fn load(&self, case_id: &str) -> NodeResult<Tensor> {
        let path = match case_file(&self.data_dir, case_id, &self.suffix) {
            Some(path) => path,
            None => {
                warn!(
                    "Missing file for case {} node {} (suffix {}); using zeros",
                    case_id, self.node, self.suffix
                );
                return Ok(Tensor::zeros(&self.target_shape));
            }
        };
        let is_csv = path.extension().map_or(false, |e| e == "csv");
        let (sample, integer) = if is_csv {
            (self.load_csv(&path)?, true)
        } else {
            let volume = read_nifti(&path, self.num_dimensions)?;
            (volume.sample, volume.integer)
        };
        if &sample.dims()[1..] == self.target_spatial() {
            return Ok(sample);
        }
        let mode = if integer {
            Interpolation::Nearest
        } else {
            Interpolation::Linear
        };
        debug!(
            "Resizing case {} node {} from {} to {:?} ({:?})",
            case_id,
            self.node,
            sample.shape(),
            self.target_spatial(),
            mode
        );
        resize_sample(&sample, self.target_spatial(), mode)
    }
}

impl Dataset for NodeDataset {
    fn len(&self) -> usize {
        self.case_ids.len()
    }

    fn get(&self, index: usize) -> NodeResult<Tensor> {
        let case_id = self.case_ids.get(index).ok_or_else(|| {
            NodeError::InvalidData(format!("index {} out of range for {} cases", index, self.case_ids.len()))
        })?;
        let seed = sample_seed(*self.batch_seed.read(), index);
        let result = self.load(case_id).and_then(|sample| {
            let sample = apply_all(&self.transforms, sample, seed)?;
            if sample.dims() != self.target_shape.as_slice() {
                return Err(NodeError::shape_error(
                    &format!("{:?}", self.target_shape),
                    &sample.shape().to_string(),
                    Some("sample shape after transforms"),
                ));
            }
            Ok(sample)
        });
        result.with_context(|| {
            ErrorContext::new("load sample")
                .with_node(&self.node)
                .with_case(case_id)
        })
    }

    fn case_ids(&self) -> &[String] {
        &self.case_ids
    }

    fn set_batch_seed(&self, seed: u64) {
        *self.batch_seed.write() = seed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::nifti::write_nifti;
    use crate::data::transforms::{OneHot, RandomShift};

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_loads_and_resizes_nifti() {
        let dir = tempfile::tempdir().unwrap();
        let sample = Tensor::full(&[1, 4, 4], 2.0);
        write_nifti(&dir.path().join("case_a_0000.nii.gz"), &sample).unwrap();
        let ds = NodeDataset::new(dir.path(), "0", "0000", &[1, 2, 2], 2)
            .unwrap()
            .with_cases(&ids(&["a"]), None)
            .unwrap();
        let out = ds.get(0).unwrap();
        assert_eq!(out.dims(), &[1, 2, 2]);
        assert!(out.data().iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_explicit_extension_suffix() {
        let dir = tempfile::tempdir().unwrap();
        write_nifti(&dir.path().join("case_7_0001.nii"), &Tensor::full(&[1, 3], 1.0)).unwrap();
        assert!(case_file(dir.path(), "7", "0001.nii").is_some());
        assert!(case_file(dir.path(), "7", "0001").is_some());
        assert!(case_file(dir.path(), "7", "0001.nii.gz").is_none());
    }

    #[test]
    fn test_csv_rules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("case_a_lbl.csv"), "label\n3\n").unwrap();
        std::fs::write(dir.path().join("case_b_lbl.csv"), "1,2,3,4\n").unwrap();
        std::fs::write(dir.path().join("case_c_lbl.csv"), "1,2,3\n").unwrap();
        let ds = NodeDataset::new(dir.path(), "9", "lbl", &[1, 2, 2], 2)
            .unwrap()
            .with_cases(&ids(&["a", "b", "c"]), None)
            .unwrap();
        assert_eq!(ds.get(0).unwrap().data(), &[3.0; 4]);
        assert_eq!(ds.get(1).unwrap().data(), &[1.0, 2.0, 3.0, 4.0]);
        assert!(matches!(ds.get(2), Err(NodeError::InvalidData(_))));
    }

    #[test]
    fn test_csv_class_then_one_hot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("case_a_cls.csv"), "2\n").unwrap();
        let ds = NodeDataset::new(dir.path(), "cls", "cls", &[3, 1], 1)
            .unwrap()
            .with_transforms(vec![TransformConfig::OneHot(OneHot { num_classes: 3 })])
            .with_cases(&ids(&["a"]), None)
            .unwrap();
        assert_eq!(ds.get(0).unwrap().data(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_missing_file_is_zero_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let ds = NodeDataset::new(dir.path(), "1", "0000", &[2, 3], 1)
            .unwrap()
            .with_cases(&ids(&["gone"]), None)
            .unwrap();
        assert_eq!(ds.get(0).unwrap(), Tensor::zeros(&[2, 3]));
        assert!(ds.get(1).is_err());
    }

    #[test]
    fn test_case_order_must_be_permutation() {
        let dir = tempfile::tempdir().unwrap();
        let base = || NodeDataset::new(dir.path(), "1", "0000", &[1, 2], 1).unwrap();
        let order = ids(&["b", "a"]);
        let ds = base().with_cases(&ids(&["a", "b"]), Some(&order)).unwrap();
        assert_eq!(ds.case_ids(), order.as_slice());
        let bad = ids(&["a", "a"]);
        assert!(base().with_cases(&ids(&["a", "b"]), Some(&bad)).is_err());
    }

    #[test]
    fn test_shared_seed_gives_matching_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let sample = Tensor::from_vec(&[1, 6], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        write_nifti(&dir.path().join("case_a_img.nii"), &sample).unwrap();
        write_nifti(&dir.path().join("case_a_lbl.nii"), &sample).unwrap();
        let shift = vec![TransformConfig::RandomShift(RandomShift { max_shift: 2 })];
        let make = |suffix: &str| {
            NodeDataset::new(dir.path(), suffix, suffix, &[1, 6], 1)
                .unwrap()
                .with_transforms(shift.clone())
                .with_cases(&ids(&["a"]), None)
                .unwrap()
        };
        let (img, lbl) = (make("img"), make("lbl"));
        for seed in 0..5 {
            img.set_batch_seed(seed);
            lbl.set_batch_seed(seed);
            assert_eq!(img.get(0).unwrap(), lbl.get(0).unwrap());
        }
    }

    #[test]
    fn test_shape_mismatch_after_transforms() {
        let dir = tempfile::tempdir().unwrap();
        write_nifti(&dir.path().join("case_a_x.nii"), &Tensor::full(&[2, 3], 1.0)).unwrap();
        let ds = NodeDataset::new(dir.path(), "x", "x", &[1, 3], 1)
            .unwrap()
            .with_cases(&ids(&["a"]), None)
            .unwrap();
        assert!(matches!(ds.get(0), Err(NodeError::ShapeError(_))));
    }
}
