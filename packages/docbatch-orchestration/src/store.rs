//! FileRecord store
//!
//! Single source of truth for per-file state. Every mutation goes through a
//! narrow setter that enforces the transition table and the progress
//! monotonicity rule; callers never touch `FileRecord` fields directly.

use crate::config::MultiFileConfig;
use crate::error::{OrchestratorError, Result};
use crate::file::{
    FileError, FileInput, FileRecord, FileStatus, PageProgress, PauseSnapshot, Stage, StageResult,
};
use crate::validation::{validate_against, InvalidFile};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of `add_files`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddFilesReport {
    /// Ids of the records created, in submission order
    pub accepted: Vec<Uuid>,
    pub rejected: Vec<InvalidFile>,
    pub total_size: u64,
    pub exceeds_limits: bool,
}

impl AddFilesReport {
    pub fn all_accepted(&self) -> bool {
        self.rejected.is_empty()
    }

    /// One `Validation` error per rejected file
    pub fn errors(&self) -> Vec<OrchestratorError> {
        self.rejected.iter().map(|r| r.to_error()).collect()
    }
}

/// Detailed progress fields a runner may send along with a percentage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressDetail {
    pub message: Option<String>,
    pub sub_step: Option<String>,
    pub page_progress: Option<PageProgress>,
}

/// What `update_progress` did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressChange {
    /// Progress moved (or a new stage started)
    Applied(f64),
    /// Same value as before; nothing changed
    Unchanged,
    /// Regression within a stage; kept the previous maximum
    Clamped { kept: f64, rejected: f64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStore {
    records: Vec<FileRecord>,
    next_index: usize,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records
    pub fn from_records(mut records: Vec<FileRecord>) -> Self {
        records.sort_by_key(|r| r.submitted_index);
        let next_index = records
            .iter()
            .map(|r| r.submitted_index + 1)
            .max()
            .unwrap_or(0);
        Self {
            records,
            next_index,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn get(&self, id: Uuid) -> Option<&FileRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn position(&self, id: Uuid) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    pub fn find_by_backend_id(&self, backend_id: &str) -> Option<&FileRecord> {
        self.records
            .iter()
            .find(|r| r.backend_id.as_deref() == Some(backend_id))
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size_bytes).sum()
    }

    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.status.is_active()).count()
    }

    pub fn queued(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.iter().filter(|r| r.is_queued())
    }

    pub fn all_settled(&self) -> bool {
        self.records.iter().all(|r| r.is_settled())
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut FileRecord> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| OrchestratorError::FileNotFound(id.to_string()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queue membership
    // ═══════════════════════════════════════════════════════════════════════

    /// Validate and append. Valid files are added even when others are rejected.
    pub fn add_files(&mut self, files: Vec<FileInput>, config: &MultiFileConfig) -> AddFilesReport {
        let validation = validate_against(&files, config, self.len(), self.total_bytes());

        let mut accepted = Vec::with_capacity(validation.valid_files.len());
        for input in validation.valid_files {
            let record = FileRecord::new(input, self.next_index);
            self.next_index += 1;
            accepted.push(record.id);
            self.records.push(record);
        }

        for invalid in &validation.invalid_files {
            debug!("Rejected file '{}': {}", invalid.file.name, invalid.reason);
        }

        self.recompute_queue_positions();

        AddFilesReport {
            accepted,
            rejected: validation.invalid_files,
            total_size: validation.total_size,
            exceeds_limits: validation.exceeds_limits,
        }
    }

    /// Only `pending`, `failed` and `cancelled` records can be removed
    pub fn remove_file(&mut self, id: Uuid) -> Result<FileRecord> {
        let idx = self
            .position(id)
            .ok_or_else(|| OrchestratorError::FileNotFound(id.to_string()))?;

        let status = self.records[idx].status;
        if !matches!(
            status,
            FileStatus::Pending | FileStatus::Failed | FileStatus::Cancelled
        ) {
            return Err(OrchestratorError::InvalidState(format!(
                "cannot remove file {} while it is {}",
                id, status
            )));
        }

        let removed = self.records.remove(idx);
        self.recompute_queue_positions();
        Ok(removed)
    }

    /// Drop every record; refused while any record is active
    pub fn clear_files(&mut self) -> Result<()> {
        let active = self.active_count();
        if active > 0 {
            return Err(OrchestratorError::InvalidState(format!(
                "cannot clear files while {} file(s) are active",
                active
            )));
        }
        self.records.clear();
        self.next_index = 0;
        Ok(())
    }

    /// Queued records get a contiguous 0-based rank in submission order
    pub fn recompute_queue_positions(&mut self) {
        let mut rank = 0;
        for record in self.records.iter_mut() {
            if record.is_queued() {
                record.queue_position = Some(rank);
                rank += 1;
            } else {
                record.queue_position = None;
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Status
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply a status change allowed by the transition table
    ///
    /// Entering `Paused` snapshots status, stage and progress. Leaving
    /// `Paused` (other than to `Cancelled`) must target the snapshotted status
    /// and restores stage and progress verbatim.
    pub fn update_status(&mut self, id: Uuid, new_status: FileStatus) -> Result<FileStatus> {
        let record = self.get_mut(id)?;
        let from = record.status;

        if !from.can_transition_to(new_status) {
            return Err(OrchestratorError::transition(from, new_status));
        }

        if from == FileStatus::Paused && new_status != FileStatus::Cancelled {
            let snapshot = record.paused_from.ok_or_else(|| {
                OrchestratorError::InvalidState(format!("paused file {} has no snapshot", id))
            })?;
            if snapshot.status != new_status {
                return Err(OrchestratorError::transition(from, new_status));
            }
            record.current_stage = snapshot.current_stage;
            record.progress = snapshot.progress;
            record.paused_from = None;
        }

        if new_status == FileStatus::Paused {
            record.paused_from = Some(PauseSnapshot {
                status: from,
                current_stage: record.current_stage,
                progress: record.progress,
            });
        }

        if new_status == FileStatus::Cancelled {
            record.paused_from = None;
            record.retry_pending = false;
        }

        if from == FileStatus::Pending && record.timing.start_time.is_none() {
            record.timing.start_time = Some(Utc::now());
        }

        if new_status.is_terminal() {
            record.timing.completion_time = Some(Utc::now());
        } else if from == FileStatus::Failed {
            record.timing.completion_time = None;
        }

        record.status = new_status;
        let queue_changed = from == FileStatus::Pending
            || new_status == FileStatus::Cancelled
            || from == FileStatus::Failed;
        if queue_changed {
            self.recompute_queue_positions();
        }
        Ok(from)
    }

    /// Restore a paused record to its snapshotted status
    pub fn resume_paused(&mut self, id: Uuid) -> Result<FileStatus> {
        let target = self
            .get(id)
            .and_then(|r| r.paused_from)
            .map(|s| s.status)
            .ok_or_else(|| OrchestratorError::InvalidState(format!("file {} is not paused", id)))?;
        self.update_status(id, target)?;
        Ok(target)
    }

    /// Mark a failed record as queued for another attempt
    pub fn schedule_retry(&mut self, id: Uuid) -> Result<()> {
        let record = self.get_mut(id)?;
        if record.status != FileStatus::Failed {
            return Err(OrchestratorError::InvalidState(format!(
                "file {} is {}, only failed files can be retried",
                id, record.status
            )));
        }
        record.retry_pending = true;
        self.recompute_queue_positions();
        Ok(())
    }

    /// Take a failed record back out of the retry queue
    pub fn cancel_retry(&mut self, id: Uuid) -> Result<()> {
        let record = self.get_mut(id)?;
        record.retry_pending = false;
        self.recompute_queue_positions();
        Ok(())
    }

    /// Dequeue a retry: `failed -> retrying`, error cleared, attempt counted
    pub fn begin_retry(&mut self, id: Uuid) -> Result<()> {
        self.update_status(id, FileStatus::Retrying)?;
        let record = self.get_mut(id)?;
        record.retry_pending = false;
        record.retry_count += 1;
        record.last_error = None;
        self.recompute_queue_positions();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Progress
    // ═══════════════════════════════════════════════════════════════════════

    /// Stage boundary: set the stage and reset progress to 0
    pub fn reset_stage(&mut self, id: Uuid, stage: Stage) -> Result<()> {
        let record = self.get_mut(id)?;
        record.current_stage = stage.is_processing().then_some(stage);
        record.progress = 0.0;
        record.current_message = None;
        record.current_sub_step = None;
        record.page_progress = None;
        record.stage_progress.insert(stage, 0.0);
        Ok(())
    }

    /// Monotonic progress update
    ///
    /// A lower value is accepted only when `stage` names a different stage
    /// than the current one (a stage reset). Otherwise the regression is
    /// clamped to the previous maximum and logged, and its detail dropped.
    pub fn update_progress(
        &mut self,
        id: Uuid,
        progress: f64,
        stage: Option<Stage>,
        detail: ProgressDetail,
    ) -> Result<ProgressChange> {
        if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
            return Err(OrchestratorError::InvalidState(format!(
                "progress {} for file {} is outside 0..=100",
                progress, id
            )));
        }

        let record = self.get_mut(id)?;
        let requested_stage = stage.map(|s| s.is_processing().then_some(s));
        let stage_changed = matches!(requested_stage, Some(s) if s != record.current_stage);

        if stage_changed {
            apply_detail(record, detail);
            let new_stage = requested_stage.flatten();
            record.current_stage = new_stage;
            record.progress = progress;
            record
                .stage_progress
                .insert(new_stage.unwrap_or(Stage::Upload), progress);
            return Ok(ProgressChange::Applied(progress));
        }

        let step = record.current_step();
        if progress < record.progress {
            warn!(
                "File {}: progress regression {} -> {} in {} clamped",
                id, record.progress, progress, step
            );
            return Ok(ProgressChange::Clamped {
                kept: record.progress,
                rejected: progress,
            });
        }

        if progress == record.progress {
            return Ok(if apply_detail(record, detail) {
                ProgressChange::Applied(progress)
            } else {
                ProgressChange::Unchanged
            });
        }

        apply_detail(record, detail);
        record.progress = progress;
        record.stage_progress.insert(step, progress);
        Ok(ProgressChange::Applied(progress))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Results
    // ═══════════════════════════════════════════════════════════════════════

    /// Overwrite the result for `stage`; a failure also sets `last_error`.
    /// Status is left alone.
    pub fn record_stage_result(&mut self, id: Uuid, result: StageResult) -> Result<()> {
        let record = self.get_mut(id)?;

        if !result.success {
            record.last_error = Some(FileError {
                stage: result.stage,
                message: result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} failed", result.stage)),
                category: result.error_category,
                timestamp: result.timestamp,
            });
        }

        record.stage_results.insert(result.stage, result);
        Ok(())
    }

    /// Written once, when the upload stage acknowledges receipt
    pub fn set_backend_id(&mut self, id: Uuid, backend_id: String) -> Result<()> {
        let record = self.get_mut(id)?;
        match &record.backend_id {
            Some(existing) if existing != &backend_id => Err(OrchestratorError::InvalidState(
                format!("file {} already has backend id {}", id, existing),
            )),
            _ => {
                record.backend_id = Some(backend_id);
                Ok(())
            }
        }
    }
}

/// Copy the fields a runner sent; true when any of them changed the record
fn apply_detail(record: &mut FileRecord, detail: ProgressDetail) -> bool {
    let mut changed = false;
    if let Some(message) = detail.message {
        changed |= record.current_message.as_deref() != Some(message.as_str());
        record.current_message = Some(message);
    }
    if let Some(sub_step) = detail.sub_step {
        changed |= record.current_sub_step.as_deref() != Some(sub_step.as_str());
        record.current_sub_step = Some(sub_step);
    }
    if let Some(pages) = detail.page_progress {
        changed |= record.page_progress != Some(pages);
        record.page_progress = Some(pages);
    }
    changed
}
