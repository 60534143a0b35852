//! Batch configuration
//!
//! `MultiFileConfig` can be built in code (`Default` + struct update) or
//! loaded from YAML. Unknown YAML keys are rejected; missing keys take their
//! defaults.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MB: u64 = 1024 * 1024;

/// Queue limits and processing switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MultiFileConfig {
    /// Maximum files per batch
    pub max_files: usize,
    /// Maximum size per file in bytes
    pub max_file_size: u64,
    /// Maximum total batch size in bytes
    pub max_batch_size: u64,
    /// Accepted MIME types; `type/*` wildcards allowed
    pub allowed_types: Vec<String>,
    /// Run several files at once (bounded by `concurrency_limit`)
    pub concurrent_processing: bool,
    pub concurrency_limit: usize,
    /// Start as soon as the batch is initialized
    pub auto_start_processing: bool,
    /// Save batch snapshots after every settled file
    pub persist_batch_state: bool,
    pub show_detailed_progress: bool,
    pub enable_bulk_download: bool,
    /// Re-enqueue failed files automatically
    pub retry_failed_files: bool,
    pub max_retry_attempts: u32,
    /// Weight overall progress by file size instead of per file
    pub size_weighted_progress: bool,
}

impl Default for MultiFileConfig {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_file_size: 50 * MB,
            max_batch_size: 500 * MB,
            allowed_types: vec!["application/pdf".to_string()],
            concurrent_processing: false,
            concurrency_limit: (num_cpus::get() * 3 / 4).clamp(1, 4), // 75% of cores
            auto_start_processing: false,
            persist_batch_state: true,
            show_detailed_progress: true,
            enable_bulk_download: true,
            retry_failed_files: true,
            max_retry_attempts: 2,
            size_weighted_progress: false,
        }
    }
}

impl MultiFileConfig {
    /// Sequential processing with everything else at defaults
    pub fn sequential() -> Self {
        Self::default()
    }

    /// Number of files allowed in flight at once
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrent_processing {
            self.concurrency_limit.max(1)
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_files == 0 {
            return Err(OrchestratorError::config("max_files must be at least 1"));
        }
        if self.max_file_size == 0 {
            return Err(OrchestratorError::config(
                "max_file_size must be greater than 0",
            ));
        }
        if self.max_batch_size < self.max_file_size {
            return Err(OrchestratorError::config(format!(
                "max_batch_size ({}) is smaller than max_file_size ({})",
                self.max_batch_size, self.max_file_size
            )));
        }
        if self.allowed_types.is_empty() {
            return Err(OrchestratorError::config(
                "allowed_types must list at least one MIME type",
            ));
        }
        if let Some(bad) = self.allowed_types.iter().find(|t| !t.contains('/')) {
            return Err(OrchestratorError::config(format!(
                "allowed type '{}' is not a MIME type",
                bad
            )));
        }
        if self.concurrent_processing && self.concurrency_limit == 0 {
            return Err(OrchestratorError::config(
                "concurrency_limit must be at least 1 when concurrent_processing is on",
            ));
        }
        Ok(())
    }

    /// Parse and validate YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
