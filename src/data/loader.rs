//! Batching across node datasets.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use tracing::warn;

use super::dataset::Dataset;
use crate::error::{NodeError, NodeResult};
use crate::nn::NodeId;
use crate::tensor::Tensor;

/// Yields a fixed index sequence, so loaders of different nodes stay aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedSampler {
    indices: Vec<usize>,
}

impl OrderedSampler {
    pub fn new(indices: Vec<usize>) -> Self {
        Self { indices }
    }

    /// `0..len`.
    pub fn sequential(len: usize) -> Self {
        Self::new((0..len).collect())
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }
}

/// One loaded batch `[N, C, S...]` with its case ids.
#[derive(Debug, Clone)]
pub struct Batch {
    pub data: Tensor,
    pub case_ids: Vec<String>,
}

/// Groups sampler indices into batches; samples load in parallel.
#[derive(Clone)]
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    sampler: OrderedSampler,
    drop_last: bool,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn Dataset>, batch_size: usize, sampler: OrderedSampler, drop_last: bool) -> NodeResult<Self> {
        if batch_size == 0 {
            return Err(NodeError::InvalidConfig("batch size must be positive".to_string()));
        }
        if let Some(bad) = sampler.iter().find(|&i| i >= dataset.len()) {
            return Err(NodeError::InvalidConfig(format!(
                "sampler index {} out of range for {} samples",
                bad,
                dataset.len()
            )));
        }
        Ok(Self {
            dataset,
            batch_size,
            sampler,
            drop_last,
        })
    }

    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        if self.drop_last {
            self.sampler.len() / self.batch_size
        } else {
            (self.sampler.len() + self.batch_size - 1) / self.batch_size
        }
    }

    /// Loads batch `index` with every sample seeded from `seed`.
    pub fn batch(&self, index: usize, seed: u64) -> NodeResult<Batch> {
        if index >= self.num_batches() {
            return Err(NodeError::InvalidData(format!(
                "batch {} out of range for {} batches",
                index,
                self.num_batches()
            )));
        }
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.sampler.len());
        let indices: Vec<usize> = self.sampler.iter().skip(start).take(end - start).collect();
        self.dataset.set_batch_seed(seed);
        let samples = indices
            .par_iter()
            .map(|&i| self.dataset.get(i))
            .collect::<NodeResult<Vec<Tensor>>>()?;
        let case_ids = indices
            .iter()
            .map(|&i| self.dataset.case_ids()[i].clone())
            .collect();
        Ok(Batch {
            data: Tensor::stack(&samples)?,
            case_ids,
        })
    }
}

/// One loader per graph node, advanced in lock step.
#[derive(Clone)]
pub struct NodeLoaders {
    loaders: BTreeMap<NodeId, DataLoader>,
    num_batches: usize,
    seed: u64,
}

impl NodeLoaders {
    pub fn new(loaders: BTreeMap<NodeId, DataLoader>, seed: u64) -> NodeResult<Self> {
        let mut counts = loaders.iter().map(|(node, l)| (node, l.num_batches()));
        let num_batches = match counts.next() {
            Some((_, n)) => n,
            None => return Err(NodeError::InvalidConfig("no node loaders".to_string())),
        };
        if let Some((node, n)) = counts.find(|(_, n)| *n != num_batches) {
            return Err(NodeError::InvalidConfig(format!(
                "node {} has {} batches, others have {}",
                node, n, num_batches
            )));
        }
        Ok(Self {
            loaders,
            num_batches,
            seed,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }

    pub fn get(&self, node: &str) -> Option<&DataLoader> {
        self.loaders.get(node)
    }

    /// Batch seeds of an epoch, drawn from `seed + epoch`.
    pub fn epoch_seeds(&self, epoch: usize) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        (0..self.num_batches).map(|_| rng.gen()).collect()
    }

    /// Batch `index` of every node listed in `nodes`, in that order.
    pub fn load(&self, nodes: &[NodeId], index: usize, seed: u64) -> NodeResult<Vec<Batch>> {
        let batches = nodes
            .iter()
            .map(|node| {
                self.loaders
                    .get(node)
                    .ok_or_else(|| NodeError::InvalidConfig(format!("no data loader for input node {}", node)))?
                    .batch(index, seed)
            })
            .collect::<NodeResult<Vec<Batch>>>()?;
        if let Some(first) = batches.first() {
            if batches.iter().any(|b| b.case_ids != first.case_ids) {
                warn!("Batch {} case ids differ across nodes", index);
            }
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Counting {
        ids: Vec<String>,
        seeds: Mutex<Vec<u64>>,
    }

    impl Counting {
        fn new(n: usize) -> Arc<Self> {
            Arc::new(Self {
                ids: (0..n).map(|i| format!("c{}", i)).collect(),
                seeds: Mutex::new(Vec::new()),
            })
        }
    }

    impl Dataset for Counting {
        fn len(&self) -> usize {
            self.ids.len()
        }

        fn get(&self, index: usize) -> NodeResult<Tensor> {
            Tensor::from_vec(&[1, 1], vec![index as f32])
        }

        fn case_ids(&self) -> &[String] {
            &self.ids
        }

        fn set_batch_seed(&self, seed: u64) {
            self.seeds.lock().push(seed);
        }
    }

    #[test]
    fn test_batches_follow_sampler_order() {
        let ds = Counting::new(5);
        let loader = DataLoader::new(ds, 2, OrderedSampler::new(vec![4, 0, 3, 1, 2]), false).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let b = loader.batch(0, 0).unwrap();
        assert_eq!(b.data.dims(), &[2, 1, 1]);
        assert_eq!(b.data.data(), &[4.0, 0.0]);
        assert_eq!(b.case_ids, vec!["c4", "c0"]);
        assert_eq!(loader.batch(2, 0).unwrap().data.dims(), &[1, 1, 1]);
        assert!(loader.batch(3, 0).is_err());
    }

    #[test]
    fn test_drop_last() {
        let loader = DataLoader::new(Counting::new(5), 2, OrderedSampler::sequential(5), true).unwrap();
        assert_eq!(loader.num_batches(), 2);
    }

    #[test]
    fn test_rejects_bad_configuration() {
        assert!(DataLoader::new(Counting::new(2), 0, OrderedSampler::sequential(2), false).is_err());
        assert!(DataLoader::new(Counting::new(2), 1, OrderedSampler::new(vec![2]), false).is_err());
    }

    #[test]
    fn test_node_loaders_must_agree_on_batches() {
        let make = |n: usize| DataLoader::new(Counting::new(n), 2, OrderedSampler::sequential(n), false).unwrap();
        let mut loaders = BTreeMap::new();
        loaders.insert("a".to_string(), make(4));
        loaders.insert("b".to_string(), make(4));
        let ok = NodeLoaders::new(loaders.clone(), 7).unwrap();
        assert_eq!(ok.num_batches(), 2);
        loaders.insert("c".to_string(), make(6));
        assert!(NodeLoaders::new(loaders, 7).is_err());
    }

    #[test]
    fn test_epoch_seeds_are_reproducible_and_shared() {
        let a = Counting::new(4);
        let b = Counting::new(4);
        let mut loaders = BTreeMap::new();
        loaders.insert("a".to_string(), DataLoader::new(a.clone(), 2, OrderedSampler::sequential(4), false).unwrap());
        loaders.insert("b".to_string(), DataLoader::new(b.clone(), 2, OrderedSampler::sequential(4), false).unwrap());
        let nl = NodeLoaders::new(loaders, 3).unwrap();
        let seeds = nl.epoch_seeds(1);
        assert_eq!(seeds, nl.epoch_seeds(1));
        assert_ne!(seeds, nl.epoch_seeds(2));
        let nodes = vec!["b".to_string(), "a".to_string()];
        let batches = nl.load(&nodes, 1, seeds[1]).unwrap();
        assert_eq!(batches[0].case_ids, vec!["c2", "c3"]);
        assert_eq!(*a.seeds.lock(), vec![seeds[1]]);
        assert_eq!(*b.seeds.lock(), vec![seeds[1]]);
        assert!(nl.load(&["z".to_string()], 0, 0).is_err());
    }
}
