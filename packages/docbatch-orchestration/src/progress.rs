//! Progress Aggregator
//!
//! `aggregate` is a pure function of the batch and the store; nothing here
//! keeps state of its own.

use crate::batch::{Batch, BatchStatus};
use crate::config::MultiFileConfig;
use crate::file::{FileRecord, FileStatus, Stage};
use crate::store::FileStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Which batch commands are currently legal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueControls {
    pub is_paused: bool,
    pub can_pause: bool,
    pub can_resume: bool,
    pub can_stop: bool,
}

/// Derived batch statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: Option<Uuid>,
    pub status: BatchStatus,
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub cancelled_files: usize,
    /// Completed with no error on any stage
    pub successful_files: usize,
    /// Waiting in the queue, including failed files scheduled for retry
    pub queued_files: usize,
    pub active_files: usize,
    pub paused_files: usize,
    pub overall_progress: f64,
    pub current_file: Option<Uuid>,
    pub current_file_progress: f64,
    /// Per-stage progress of the current file
    pub stage_progress: BTreeMap<Stage, f64>,
    pub total_cost: f64,
    pub average_cost_per_file: f64,
    pub average_processing_time_ms: Option<u64>,
    /// None until at least one file has completed
    pub estimated_time_remaining_ms: Option<u64>,
    pub progress_text: String,
    pub controls: QueueControls,
    pub can_retry_failed: bool,
    pub can_download_all: bool,
}

fn current_record(store: &FileStore) -> Option<&FileRecord> {
    let files = store.files();
    files
        .iter()
        .find(|r| r.status.is_active())
        .or_else(|| files.iter().find(|r| r.status == FileStatus::Paused))
        .or_else(|| files.iter().find(|r| r.status == FileStatus::Uploaded))
}

fn weighted_progress(files: &[FileRecord], by_size: bool) -> f64 {
    if files.is_empty() {
        return 0.0;
    }

    let total_bytes: u64 = files.iter().map(|r| r.size_bytes).sum();
    if by_size && total_bytes > 0 {
        let weighted: f64 = files
            .iter()
            .map(|r| r.overall_progress() * r.size_bytes as f64)
            .sum();
        return (weighted / total_bytes as f64).clamp(0.0, 100.0);
    }

    let sum: f64 = files.iter().map(|r| r.overall_progress()).sum();
    (sum / files.len() as f64).clamp(0.0, 100.0)
}

pub fn aggregate(batch: Option<&Batch>, store: &FileStore, config: &MultiFileConfig) -> BatchProgress {
    let files = store.files();
    let status = batch.map(|b| b.status).unwrap_or(BatchStatus::Idle);

    let count = |s: FileStatus| files.iter().filter(|r| r.status == s).count();
    let total_files = files.len();
    let completed_files = count(FileStatus::Completed);
    let failed_files = count(FileStatus::Failed);
    let cancelled_files = count(FileStatus::Cancelled);
    let paused_files = count(FileStatus::Paused);
    let successful_files = files.iter().filter(|r| r.is_successful()).count();
    let queued_files = store.queued().count();
    let active_files = store.active_count();
    let settled = files.iter().filter(|r| r.is_settled()).count();

    let total_cost: f64 = files.iter().map(|r| r.total_cost()).sum();
    let average_cost_per_file = if total_files > 0 {
        total_cost / total_files as f64
    } else {
        0.0
    };

    let durations: Vec<u64> = files
        .iter()
        .filter(|r| r.status == FileStatus::Completed)
        .filter_map(|r| r.duration_ms())
        .collect();
    let average_processing_time_ms = if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<u64>() / durations.len() as u64)
    };
    let remaining = total_files - settled;
    let estimated_time_remaining_ms = average_processing_time_ms.map(|avg| avg * remaining as u64);

    let current = current_record(store);
    let overall_progress = weighted_progress(files, config.size_weighted_progress);

    let controls = QueueControls {
        is_paused: status == BatchStatus::Paused,
        can_pause: status == BatchStatus::Processing,
        can_resume: status == BatchStatus::Paused,
        can_stop: batch.is_some() && !status.is_terminal(),
    };

    let retryable = files
        .iter()
        .filter(|r| r.status == FileStatus::Failed && !r.retry_pending)
        .count();

    let progress_text = match (batch, status) {
        (None, _) => "No batch".to_string(),
        (Some(_), BatchStatus::Idle) => format!("{} files ready", total_files),
        (Some(_), BatchStatus::Processing) => match current {
            Some(record) if config.show_detailed_progress => format!(
                "Processing {} ({} of {}): {} {:.0}%",
                record.display_name,
                settled + 1,
                total_files,
                record.current_step(),
                record.progress
            ),
            Some(record) => format!(
                "Processing {} ({} of {})",
                record.display_name,
                settled + 1,
                total_files
            ),
            None => format!("Processing ({} of {} done)", settled, total_files),
        },
        (Some(_), BatchStatus::Paused) => {
            format!("Paused ({} of {} done)", settled, total_files)
        }
        (Some(_), BatchStatus::Completed) => {
            format!("Completed {} of {} files", completed_files, total_files)
        }
        (Some(_), BatchStatus::Failed) => format!(
            "Finished with {} failed of {} files",
            failed_files, total_files
        ),
        (Some(_), BatchStatus::Cancelled) => {
            format!("Stopped after {} of {} files", settled, total_files)
        }
    };

    BatchProgress {
        batch_id: batch.map(|b| b.id),
        status,
        total_files,
        completed_files,
        failed_files,
        cancelled_files,
        successful_files,
        queued_files,
        active_files,
        paused_files,
        overall_progress,
        current_file: current.map(|r| r.id),
        current_file_progress: current.map(|r| r.progress).unwrap_or(0.0),
        stage_progress: current.map(|r| r.stage_progress.clone()).unwrap_or_default(),
        total_cost,
        average_cost_per_file,
        average_processing_time_ms,
        estimated_time_remaining_ms,
        progress_text,
        controls,
        can_retry_failed: retryable > 0 && status != BatchStatus::Cancelled,
        can_download_all: config.enable_bulk_download && completed_files > 0,
    }
}
