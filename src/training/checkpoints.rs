//! Model state files.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{NodeError, NodeResult};
use crate::nn::ModelState;

const EXTENSION: &str = "bin";

/// Writes `state` to `path` with bincode.
pub fn save_state(state: &ModelState, path: &Path) -> NodeResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, state)?;
    debug!("Wrote {} tensors to {}", state.tensors.len(), path.display());
    Ok(())
}

pub fn load_state(path: &Path) -> NodeResult<ModelState> {
    let reader = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(reader)?)
}

/// Checkpoint manager
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
            max_checkpoints: 5,
        }
    }

    /// Number of epoch checkpoints kept by [`prune`](Self::prune); 0 keeps all.
    pub fn with_max_checkpoints(mut self, max_checkpoints: usize) -> Self {
        self.max_checkpoints = max_checkpoints;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{}.{}", name, EXTENSION))
    }

    pub fn save(&self, name: &str, state: &ModelState) -> NodeResult<PathBuf> {
        let path = self.path(name);
        save_state(state, &path)?;
        info!("Saved checkpoint {}", path.display());
        Ok(path)
    }

    pub fn load(&self, name: &str) -> NodeResult<ModelState> {
        let path = self.path(name);
        if !path.is_file() {
            return Err(NodeError::IoError(format!("checkpoint {} not found", path.display())));
        }
        load_state(&path)
    }

    /// Saves `state` as `epoch_{NNNN}` and prunes older epoch checkpoints.
    pub fn save_epoch(&self, epoch: usize, state: &ModelState) -> NodeResult<PathBuf> {
        let path = self.save(&format!("epoch_{:04}", epoch), state)?;
        self.prune()?;
        Ok(path)
    }

    /// Names of the stored checkpoints, sorted.
    pub fn list(&self) -> NodeResult<Vec<String>> {
        let mut names = Vec::new();
        if !self.checkpoint_dir.is_dir() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Deletes the oldest `epoch_*` checkpoints beyond the limit. Other
    /// files such as `model_best` are never touched.
    pub fn prune(&self) -> NodeResult<usize> {
        if self.max_checkpoints == 0 {
            return Ok(0);
        }
        let epochs: Vec<String> = self
            .list()?
            .into_iter()
            .filter(|n| n.starts_with("epoch_"))
            .collect();
        let excess = epochs.len().saturating_sub(self.max_checkpoints);
        for name in &epochs[..excess] {
            std::fs::remove_file(self.path(name))?;
            debug!("Pruned checkpoint {}", name);
        }
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn state(v: f32) -> ModelState {
        let mut s = ModelState::default();
        s.tensors.insert("e1.0.conv.weight".into(), Tensor::full(&[1, 1, 3], v));
        s
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("ckpt"));
        manager.save("model_best", &state(0.5)).unwrap();
        assert_eq!(manager.load("model_best").unwrap(), state(0.5));
        assert!(manager.load("missing").is_err());
    }

    #[test]
    fn test_prune_keeps_newest_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).with_max_checkpoints(2);
        manager.save("model_best", &state(0.0)).unwrap();
        for epoch in 1..=4 {
            manager.save_epoch(epoch, &state(epoch as f32)).unwrap();
        }
        assert_eq!(manager.list().unwrap(), vec!["epoch_0003", "epoch_0004", "model_best"]);
    }

    #[test]
    fn test_corrupt_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, b"xx").unwrap();
        assert!(matches!(load_state(&path), Err(NodeError::SerializationError(_))));
    }
}
