use crate::error::{ErrorCategory, OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Pipeline step, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    Vision,
    Extraction,
    Conversion,
}

impl Stage {
    /// Every step a file goes through
    pub const ALL: [Stage; 4] = [
        Stage::Upload,
        Stage::Vision,
        Stage::Extraction,
        Stage::Conversion,
    ];

    /// Steps that can be a record's `current_stage`
    pub const PROCESSING: [Stage; 3] = [Stage::Vision, Stage::Extraction, Stage::Conversion];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Vision => "vision",
            Stage::Extraction => "extraction",
            Stage::Conversion => "conversion",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "upload" => Ok(Stage::Upload),
            "vision" => Ok(Stage::Vision),
            "extraction" => Ok(Stage::Extraction),
            "conversion" => Ok(Stage::Conversion),
            _ => Err(OrchestratorError::config(format!("Invalid stage: {}", s))),
        }
    }

    pub fn is_processing(&self) -> bool {
        !matches!(self, Stage::Upload)
    }

    pub fn index(&self) -> usize {
        match self {
            Stage::Upload => 0,
            Stage::Vision => 1,
            Stage::Extraction => 2,
            Stage::Conversion => 3,
        }
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-file status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Uploading,
    Uploaded,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Paused,
    Retrying,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Uploading => "uploading",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
            FileStatus::Cancelled => "cancelled",
            FileStatus::Paused => "paused",
            FileStatus::Retrying => "retrying",
        }
    }

    /// Holds the single-flight slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            FileStatus::Uploading | FileStatus::Processing | FileStatus::Retrying
        )
    }

    /// Terminal for batch accounting. `Failed` can still be retried explicitly.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Failed | FileStatus::Cancelled
        )
    }

    /// Legal transition table. `Paused -> active` is further restricted to the
    /// snapshotted status by the store.
    pub fn can_transition_to(&self, to: FileStatus) -> bool {
        use FileStatus::*;

        match (self, to) {
            (Pending, Uploading) | (Pending, Cancelled) => true,
            (Uploading, Uploaded | Failed | Paused | Cancelled) => true,
            (Uploaded, Processing | Cancelled) => true,
            (Processing, Completed | Failed | Paused | Cancelled) => true,
            (Failed, Retrying) => true,
            (Retrying, Uploaded | Processing | Completed | Failed | Paused | Cancelled) => true,
            (Paused, Uploading | Processing | Retrying | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Candidate file handed to `add_files`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInput {
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    /// Where the Stage Runner finds the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl FileInput {
    pub fn new(name: impl Into<String>, size_bytes: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            mime_type: mime_type.into(),
            path: None,
        }
    }

    pub fn pdf(name: impl Into<String>, size_bytes: u64) -> Self {
        Self::new(name, size_bytes, "application/pdf")
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Outcome of one stage attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "default_category")]
    pub error_category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
}

fn default_category() -> ErrorCategory {
    ErrorCategory::Transient
}

impl StageResult {
    /// A `null` payload is stored as `None` so it survives a JSON round trip
    pub fn success(stage: Stage, payload: serde_json::Value, cost: f64) -> Self {
        Self {
            stage,
            success: true,
            payload: (!payload.is_null()).then_some(payload),
            cost: Some(cost),
            error: None,
            error_category: ErrorCategory::Transient,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(stage: Stage, message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            stage,
            success: false,
            payload: None,
            cost: None,
            error: Some(message.into()),
            error_category: category,
            timestamp: Utc::now(),
        }
    }
}

/// Last stage failure on a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileError {
    pub stage: Stage,
    pub message: String,
    pub category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
}

/// Page counter reported by runners that work page by page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageProgress {
    pub current: u32,
    pub total: u32,
}

/// What a paused record resumes to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PauseSnapshot {
    pub status: FileStatus,
    pub current_stage: Option<Stage>,
    pub progress: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileTiming {
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl FileTiming {
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.start_time, self.completion_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Per-file state container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    /// Correlation id assigned by the upload stage
    pub backend_id: Option<String>,
    pub display_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub source_path: Option<PathBuf>,
    pub status: FileStatus,
    /// Only ever a processing stage; unset during upload
    pub current_stage: Option<Stage>,
    pub progress: f64,
    pub queue_position: Option<usize>,
    pub current_message: Option<String>,
    pub current_sub_step: Option<String>,
    pub page_progress: Option<PageProgress>,
    pub stage_results: BTreeMap<Stage, StageResult>,
    pub stage_progress: BTreeMap<Stage, f64>,
    pub last_error: Option<FileError>,
    pub timing: FileTiming,
    pub retry_count: u32,
    /// Failed record waiting in the queue for another attempt
    pub retry_pending: bool,
    pub paused_from: Option<PauseSnapshot>,
    /// Original submission order across the batch
    pub submitted_index: usize,
}

impl FileRecord {
    pub fn new(input: FileInput, submitted_index: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id: None,
            display_name: input.name,
            size_bytes: input.size_bytes,
            mime_type: input.mime_type,
            source_path: input.path,
            status: FileStatus::Pending,
            current_stage: None,
            progress: 0.0,
            queue_position: None,
            current_message: None,
            current_sub_step: None,
            page_progress: None,
            stage_results: BTreeMap::new(),
            stage_progress: BTreeMap::new(),
            last_error: None,
            timing: FileTiming::default(),
            retry_count: 0,
            retry_pending: false,
            paused_from: None,
            submitted_index,
        }
    }

    /// The input this record was created from
    pub fn input(&self) -> FileInput {
        FileInput {
            name: self.display_name.clone(),
            size_bytes: self.size_bytes,
            mime_type: self.mime_type.clone(),
            path: self.source_path.clone(),
        }
    }

    /// Waiting for a slot (fresh or re-enqueued for retry)
    pub fn is_queued(&self) -> bool {
        self.status == FileStatus::Pending
            || (self.status == FileStatus::Failed && self.retry_pending)
    }

    /// Done for batch accounting: terminal and not waiting for a retry
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && !self.retry_pending
    }

    pub fn stage_succeeded(&self, stage: Stage) -> bool {
        self.stage_results
            .get(&stage)
            .map(|r| r.success)
            .unwrap_or(false)
    }

    /// Steps still to run, in order; successful results are never recomputed
    pub fn remaining_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .iter()
            .copied()
            .filter(|s| !self.stage_succeeded(*s))
            .collect()
    }

    /// Step the `progress` field currently refers to
    pub fn current_step(&self) -> Stage {
        self.current_stage.unwrap_or(Stage::Upload)
    }

    pub fn total_cost(&self) -> f64 {
        self.stage_results.values().filter_map(|r| r.cost).sum()
    }

    /// No error on any stage
    pub fn is_successful(&self) -> bool {
        self.status == FileStatus::Completed
            && self.last_error.is_none()
            && self.stage_results.values().all(|r| r.success)
    }

    /// Position across all four steps, 0..=100
    pub fn overall_progress(&self) -> f64 {
        if self.status == FileStatus::Completed {
            return 100.0;
        }

        let steps = Stage::ALL.len() as f64;
        let done = Stage::ALL
            .iter()
            .filter(|s| self.stage_succeeded(**s))
            .count() as f64;

        let current = if self.stage_succeeded(self.current_step()) {
            0.0
        } else {
            self.progress
        };

        ((done * 100.0 + current) / steps).clamp(0.0, 100.0)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.timing.duration_ms()
    }

    /// Typed form of `last_error`
    pub fn error(&self) -> Option<OrchestratorError> {
        self.last_error.as_ref().map(|e| {
            OrchestratorError::stage_failed(self.display_name.clone(), e.stage, e.message.clone())
        })
    }
}
