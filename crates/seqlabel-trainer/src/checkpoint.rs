//! Checkpoints in a run's model directory.
//!
//! Each checkpoint is `ckpt-<step>.safetensors` (weights) plus
//! `ckpt-<step>.meta.json` (global step and model metadata). `checkpoint.json`
//! points at the latest one. Only the newest `keep_max` checkpoints stay on
//! disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use seqlabel_core::{Result, TrainError};

use crate::model::ModelState;

pub const INDEX_FILE: &str = "checkpoint.json";
pub const DEFAULT_KEEP_MAX: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CheckpointIndex {
    latest: String,
    global_step: u64,
    all: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub global_step: u64,
    pub metadata: BTreeMap<String, String>,
}

/// A checkpoint on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub global_step: u64,
    pub weights: PathBuf,
    pub meta: PathBuf,
}

impl Checkpoint {
    fn in_dir(dir: &Path, prefix: &str) -> Self {
        Self {
            global_step: prefix
                .strip_prefix("ckpt-")
                .and_then(|step| step.parse().ok())
                .unwrap_or(0),
            weights: dir.join(format!("{prefix}.safetensors")),
            meta: dir.join(format!("{prefix}.meta.json")),
        }
    }
}

/// Reads and writes the checkpoints of one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    keep_max: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep_max: DEFAULT_KEEP_MAX,
        }
    }

    /// Retain at most `keep_max` checkpoints (at least the latest one).
    #[must_use]
    pub fn with_keep_max(mut self, keep_max: usize) -> Self {
        self.keep_max = keep_max.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the state for `global_step` and make it the latest checkpoint.
    pub fn save(&self, global_step: u64, state: &ModelState) -> Result<Checkpoint> {
        fs::create_dir_all(&self.dir).map_err(|source| TrainError::Directory {
            path: self.dir.clone(),
            source,
        })?;

        let prefix = format!("ckpt-{global_step}");
        let mut checkpoint = Checkpoint::in_dir(&self.dir, &prefix);
        checkpoint.global_step = global_step;

        let tmp_weights = temporary_path(&checkpoint.weights);
        candle_core::safetensors::save(&state.tensors, &tmp_weights)?;
        fs::rename(&tmp_weights, &checkpoint.weights)?;

        let meta = CheckpointMeta {
            global_step,
            metadata: state.metadata.clone(),
        };
        write_json(&checkpoint.meta, &meta)?;

        let mut index = self.read_index()?.unwrap_or_else(|| CheckpointIndex {
            latest: prefix.clone(),
            global_step,
            all: Vec::new(),
        });
        index.all.retain(|p| p != &prefix);
        index.all.push(prefix.clone());
        let excess = index.all.len().saturating_sub(self.keep_max);
        let pruned: Vec<String> = index.all.drain(..excess).collect();
        index.latest = prefix;
        index.global_step = global_step;
        write_json(&self.dir.join(INDEX_FILE), &index)?;

        for old in pruned {
            self.remove(&Checkpoint::in_dir(&self.dir, &old));
        }

        debug!(step = global_step, path = %checkpoint.weights.display(), "checkpoint saved");
        Ok(checkpoint)
    }

    /// The latest checkpoint, if any has been written.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.read_index()?.map(|index| {
            let mut checkpoint = Checkpoint::in_dir(&self.dir, &index.latest);
            checkpoint.global_step = index.global_step;
            checkpoint
        }))
    }

    pub fn load(&self, checkpoint: &Checkpoint) -> Result<(ModelState, CheckpointMeta)> {
        if !checkpoint.weights.is_file() {
            return Err(TrainError::Checkpoint(format!(
                "missing weights {}",
                checkpoint.weights.display()
            )));
        }
        let tensors = candle_core::safetensors::load(&checkpoint.weights, &Device::Cpu)?;
        let meta: CheckpointMeta = serde_json::from_str(&fs::read_to_string(&checkpoint.meta)?)?;
        let state = ModelState {
            tensors,
            metadata: meta.metadata.clone(),
        };
        Ok((state, meta))
    }

    /// Checkpoints listed in the index, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        Ok(self
            .read_index()?
            .map(|index| {
                index
                    .all
                    .iter()
                    .map(|prefix| Checkpoint::in_dir(&self.dir, prefix))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove(&self, checkpoint: &Checkpoint) {
        for path in [&checkpoint.weights, &checkpoint.meta] {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "old checkpoint pruned"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "cannot prune checkpoint"),
            }
        }
    }

    fn read_index(&self) -> Result<Option<CheckpointIndex>> {
        let path = self.dir.join(INDEX_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let index = serde_json::from_str(&fs::read_to_string(&path)?).map_err(|e| {
            TrainError::Checkpoint(format!("unreadable index {}: {e}", path.display()))
        })?;
        Ok(Some(index))
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("checkpoint");
    path.with_file_name(format!("{file_name}.tmp"))
}

/// Pretty JSON written through a temporary file and renamed into place.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = temporary_path(path);
    fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PerceptronTagger, SequenceModel};

    fn tagger() -> PerceptronTagger {
        PerceptronTagger::with_shape(vec!["O".into(), "B-PER".into()], 8, 0.1, 0.0).unwrap()
    }

    #[test]
    fn empty_dir_has_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(CheckpointStore::new(dir.path()).latest().unwrap(), None);
    }

    #[test]
    fn save_then_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("run"));
        let model = tagger();

        store.save(10, &model.state().unwrap()).unwrap();
        let second = store.save(20, &model.state().unwrap()).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest, second);
        assert_eq!(latest.global_step, 20);
        assert!(dir.path().join("run/ckpt-10.safetensors").is_file());

        let (state, meta) = store.load(&latest).unwrap();
        assert_eq!(meta.global_step, 20);
        assert_eq!(state.metadata.get("buckets").map(String::as_str), Some("8"));
        let mut restored = tagger();
        restored.load_state(state).unwrap();
    }

    #[test]
    fn old_checkpoints_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).with_keep_max(3);
        let state = tagger().state().unwrap();
        for step in 1..=6 {
            store.save(step, &state).unwrap();
        }

        let kept: Vec<PathBuf> = store.list().unwrap().into_iter().map(|c| c.weights).collect();
        assert_eq!(
            kept,
            (4..=6)
                .map(|step| dir.path().join(format!("ckpt-{step}.safetensors")))
                .collect::<Vec<_>>()
        );
        let on_disk = fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".safetensors")
            })
            .count();
        assert_eq!(on_disk, 3);
        assert!(!dir.path().join("ckpt-1.meta.json").exists());
        assert_eq!(store.latest().unwrap().unwrap().global_step, 6);
        assert_eq!(store.list().unwrap()[0].global_step, 4);
    }

    #[test]
    fn resaving_a_step_does_not_duplicate_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).with_keep_max(2);
        let state = tagger().state().unwrap();
        store.save(1, &state).unwrap();
        store.save(2, &state).unwrap();
        store.save(2, &state).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
        assert!(dir.path().join("ckpt-1.safetensors").is_file());
    }

    #[test]
    fn missing_weights_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = store.save(1, &tagger().state().unwrap()).unwrap();
        fs::remove_file(&checkpoint.weights).unwrap();
        assert!(matches!(store.load(&checkpoint), Err(TrainError::Checkpoint(_))));
    }
}
