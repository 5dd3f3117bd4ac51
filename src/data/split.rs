//! Case discovery and train/validation split.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::dataset::{has_extension, EXTENSIONS};
use crate::error::{NodeError, NodeResult};

/// How cases missing some node files are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CasePolicy {
    /// Only cases with a file for every suffix.
    #[default]
    Intersection,
    /// Every case seen for any suffix; missing files load as zeros.
    Union,
}

/// Sorted unique ids of the `case_{id}_{suffix}` files in `dir`.
pub fn collect_case_ids(dir: &Path, suffix: &str) -> NodeResult<Vec<String>> {
    let endings: Vec<String> = if has_extension(suffix) {
        vec![format!("_{}", suffix)]
    } else {
        EXTENSIONS.iter().map(|ext| format!("_{}{}", suffix, ext)).collect()
    };
    let mut ids = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        let rest = match name.strip_prefix("case_") {
            Some(rest) => rest,
            None => continue,
        };
        if let Some(id) = endings.iter().find_map(|e| rest.strip_suffix(e.as_str())) {
            if !id.is_empty() {
                ids.insert(id.to_string());
            }
        }
    }
    Ok(ids.into_iter().collect())
}

/// Case ids of one directory combined over several suffixes.
pub fn resolve_cases(dir: &Path, suffixes: &[&str], policy: CasePolicy, label: &str) -> NodeResult<Vec<String>> {
    let mut per_suffix: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for &suffix in suffixes {
        per_suffix
            .entry(suffix)
            .or_insert(collect_case_ids(dir, suffix)?.into_iter().collect());
    }
    let mut sets = per_suffix.values();
    let combined: BTreeSet<String> = match sets.next() {
        None => BTreeSet::new(),
        Some(first) => sets.fold(first.clone(), |acc, s| match policy {
            CasePolicy::Intersection => acc.intersection(s).cloned().collect(),
            CasePolicy::Union => acc.union(s).cloned().collect(),
        }),
    };
    if combined.is_empty() {
        return Err(NodeError::InvalidData(format!(
            "no {} cases found in {} for suffixes {:?}",
            label,
            dir.display(),
            suffixes
        )));
    }
    for (suffix, ids) in &per_suffix {
        let differing: Vec<&String> = match policy {
            CasePolicy::Intersection => ids.difference(&combined).collect(),
            CasePolicy::Union => combined.difference(ids).collect(),
        };
        if differing.is_empty() {
            continue;
        }
        match policy {
            CasePolicy::Intersection => warn!("Incomplete {} cases for suffix {}: {:?}", label, suffix, differing),
            CasePolicy::Union => warn!("Missing {} files for suffix {}: {:?}", label, suffix, differing),
        }
    }
    Ok(combined.into_iter().collect())
}

/// Cases of both phases and their iteration orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSplit {
    pub train_case_ids: Vec<String>,
    pub val_case_ids: Vec<String>,
    pub train_case_id_order: Vec<String>,
    pub val_case_id_order: Vec<String>,
    pub train_count: usize,
    pub val_count: usize,
}

impl DataSplit {
    /// Train order is a seeded permutation, validation keeps sorted order.
    pub fn new(train_case_ids: Vec<String>, val_case_ids: Vec<String>, seed: u64) -> Self {
        let mut train_case_id_order = train_case_ids.clone();
        train_case_id_order.shuffle(&mut StdRng::seed_from_u64(seed));
        Self {
            train_count: train_case_ids.len(),
            val_count: val_case_ids.len(),
            val_case_id_order: val_case_ids.clone(),
            train_case_ids,
            val_case_ids,
            train_case_id_order,
        }
    }

    pub fn discover(
        train_dir: &Path,
        val_dir: &Path,
        suffixes: &[&str],
        policy: CasePolicy,
        seed: u64,
    ) -> NodeResult<Self> {
        let train = resolve_cases(train_dir, suffixes, policy, "train")?;
        let val = resolve_cases(val_dir, suffixes, policy, "val")?;
        info!("Found {} train and {} val cases", train.len(), val.len());
        Ok(Self::new(train, val, seed))
    }

    pub fn save(&self, path: &Path) -> NodeResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> NodeResult<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}
