use crate::batch::Batch;
use crate::error::{OrchestratorError, Result};
use crate::file::FileRecord;
use docbatch_storage::PersistedBatch;
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Plain serializable copy of the batch and its records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub version: u32,
    pub batch: Batch,
    pub files: Vec<FileRecord>,
}

impl BatchSnapshot {
    pub fn new(batch: Batch, files: Vec<FileRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            batch,
            files,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    fn check_version(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(OrchestratorError::serialization(format!(
                "unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }
        Ok(())
    }

    pub fn to_persisted(&self) -> Result<PersistedBatch> {
        Ok(PersistedBatch::new(
            self.batch.id.to_string(),
            self.batch.status.as_str(),
            serde_json::to_value(self)?,
        ))
    }

    pub fn from_persisted(persisted: &PersistedBatch) -> Result<Self> {
        let snapshot: Self = serde_json::from_value(persisted.payload.clone())?;
        snapshot.check_version()?;
        Ok(snapshot)
    }
}
