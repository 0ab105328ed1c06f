//! Checkpoint manifest for saved model records.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ForgetError;
use crate::persistence::{read_json, write_json};

/// One saved checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub epoch: usize,
    pub val_loss: f64,
    pub path: PathBuf,
    /// SHA-256 of the record file.
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Tracks saved checkpoints in a JSON manifest next to the weights.
pub struct CheckpointManager {
    manifest_path: PathBuf,
    run_id: String,
    max_checkpoints: usize,
}

/// Manifest location for a weights path.
pub fn manifest_file(weights: &Path) -> PathBuf {
    weights.with_extension("checkpoints.json")
}

fn hash_file(path: &Path) -> Result<(String, u64), ForgetError> {
    let bytes = std::fs::read(path)?;
    let hash = format!("{:x}", Sha256::digest(&bytes));
    Ok((hash, bytes.len() as u64))
}

impl CheckpointManager {
    pub fn new(weights: &Path, max_checkpoints: usize) -> Self {
        Self {
            manifest_path: manifest_file(weights),
            run_id: uuid::Uuid::new_v4().to_string(),
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// All manifest entries, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>, ForgetError> {
        Ok(read_json(&self.manifest_path)?.unwrap_or_default())
    }

    /// The checkpoint with the lowest validation loss.
    pub fn best(&self) -> Result<Option<Checkpoint>, ForgetError> {
        Ok(self
            .list()?
            .into_iter()
            .min_by(|a, b| a.val_loss.total_cmp(&b.val_loss)))
    }

    /// Add an entry for a record file that was just written.
    pub fn record(
        &self,
        epoch: usize,
        val_loss: f64,
        record: &Path,
    ) -> Result<Checkpoint, ForgetError> {
        let (hash, size_bytes) = hash_file(record)?;
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: self.run_id.clone(),
            epoch,
            val_loss,
            path: record.to_path_buf(),
            hash,
            size_bytes,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list()?;
        checkpoints.push(checkpoint.clone());
        while checkpoints.len() > self.max_checkpoints {
            checkpoints.remove(0);
        }
        write_json(&self.manifest_path, &checkpoints)?;

        tracing::info!(
            epoch,
            val_loss,
            path = %record.display(),
            hash = %checkpoint.hash,
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// Whether a record file still matches its manifest hash.
    pub fn verify(&self, checkpoint: &Checkpoint) -> Result<bool, ForgetError> {
        let (hash, _) = hash_file(&checkpoint.path)?;
        Ok(hash == checkpoint.hash)
    }
}
