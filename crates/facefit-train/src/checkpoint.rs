//! Training checkpoints: JSON state files plus an index with SHA-256
//! digests.

use crate::network::NetState;
use crate::optimizer::Adam;
use chrono::{DateTime, Utc};
use facefit_core::{FrameScaling, Layout};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const INDEX_FILE: &str = "checkpoint.json";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("checkpoint {file} digest mismatch: index has {expected}, file hashes to {actual}")]
    DigestMismatch {
        file: String,
        expected: String,
        actual: String,
    },
}

/// Everything needed to resume training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub step: u64,
    pub epoch: usize,
    pub layout: Layout,
    pub scaling: FrameScaling,
    pub feature_size: u32,
    pub net: NetState,
    pub optimizer: Adam,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub step: u64,
    pub file: String,
    pub sha256: String,
}

/// `checkpoint.json`: checkpoints oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub run_id: Uuid,
    pub checkpoints: Vec<CheckpointEntry>,
}

pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
    index: CheckpointIndex,
}

impl CheckpointManager {
    /// Open `dir`, reading an existing index or starting a new run.
    pub fn open(dir: impl AsRef<Path>, max_to_keep: usize) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let index: CheckpointIndex = serde_json::from_str(&fs::read_to_string(&index_path)?)?;
            tracing::info!(
                dir = %dir.display(),
                run_id = %index.run_id,
                checkpoints = index.checkpoints.len(),
                "checkpoint index loaded"
            );
            index
        } else {
            CheckpointIndex {
                run_id: Uuid::new_v4(),
                checkpoints: Vec::new(),
            }
        };
        Ok(Self {
            dir,
            max_to_keep: max_to_keep.max(1),
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index(&self) -> &CheckpointIndex {
        &self.index
    }

    /// Write `ckpt-<step>.json`, record it in the index and prune the oldest
    /// beyond `max_to_keep`.
    pub fn save(&mut self, state: &TrainState) -> Result<PathBuf, CheckpointError> {
        let file = format!("ckpt-{}.json", state.step);
        let path = self.dir.join(&file);
        let bytes = serde_json::to_vec(state)?;
        fs::write(&path, &bytes)?;

        self.index.checkpoints.retain(|e| e.file != file);
        self.index.checkpoints.push(CheckpointEntry {
            step: state.step,
            file,
            sha256: hex_digest(&bytes),
        });

        while self.index.checkpoints.len() > self.max_to_keep {
            let old = self.index.checkpoints.remove(0);
            match fs::remove_file(self.dir.join(&old.file)) {
                Ok(()) => tracing::debug!(file = %old.file, "pruned checkpoint"),
                Err(e) => tracing::warn!(file = %old.file, error = %e, "failed to prune checkpoint"),
            }
        }

        self.write_index()?;
        tracing::info!(path = %path.display(), step = state.step, "checkpoint saved");
        Ok(path)
    }

    /// Load the newest checkpoint, verifying its digest.
    pub fn restore_latest(&self) -> Result<Option<TrainState>, CheckpointError> {
        let Some(entry) = self.index.checkpoints.last() else {
            return Ok(None);
        };
        let bytes = fs::read(self.dir.join(&entry.file))?;
        let actual = hex_digest(&bytes);
        if actual != entry.sha256 {
            return Err(CheckpointError::DigestMismatch {
                file: entry.file.clone(),
                expected: entry.sha256.clone(),
                actual,
            });
        }
        let state: TrainState = serde_json::from_slice(&bytes)?;
        tracing::info!(file = %entry.file, step = state.step, "checkpoint restored");
        Ok(Some(state))
    }

    fn write_index(&self) -> Result<(), CheckpointError> {
        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(&self.index)?)?;
        fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LinearNet;

    fn state(step: u64) -> TrainState {
        TrainState {
            step,
            epoch: 0,
            layout: Layout::Compact430,
            scaling: FrameScaling::default(),
            feature_size: 4,
            net: LinearNet::new(3, 2, step).state(),
            optimizer: Adam::new(1e-3, 0.9),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::open(dir.path(), 3).unwrap();
        assert!(mgr.restore_latest().unwrap().is_none());

        mgr.save(&state(100)).unwrap();
        let s = state(200);
        mgr.save(&s).unwrap();
        assert_eq!(mgr.restore_latest().unwrap(), Some(s.clone()));

        // A fresh manager sees the same run.
        let reopened = CheckpointManager::open(dir.path(), 3).unwrap();
        assert_eq!(reopened.index().run_id, mgr.index().run_id);
        assert_eq!(reopened.restore_latest().unwrap(), Some(s));
    }

    #[test]
    fn test_digest_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::open(dir.path(), 3).unwrap();
        let path = mgr.save(&state(5)).unwrap();
        let mut text = fs::read_to_string(&path).unwrap();
        text.push(' ');
        fs::write(&path, text).unwrap();
        assert!(matches!(
            mgr.restore_latest(),
            Err(CheckpointError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_prunes_beyond_max_to_keep() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::open(dir.path(), 2).unwrap();
        for step in [1, 2, 3, 4] {
            mgr.save(&state(step)).unwrap();
        }
        let steps: Vec<u64> = mgr.index().checkpoints.iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![3, 4]);
        assert!(!dir.path().join("ckpt-1.json").exists());
        assert!(!dir.path().join("ckpt-2.json").exists());
        assert!(dir.path().join("ckpt-4.json").exists());
    }
}
