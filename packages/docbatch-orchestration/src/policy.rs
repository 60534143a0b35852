//! Queue Policy: dequeue order and retry rules

use crate::config::MultiFileConfig;
use crate::error::ErrorCategory;
use crate::file::FileRecord;
use crate::store::FileStore;
use uuid::Uuid;

/// What to do with a record that just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue at the original position
    Requeue,
    /// `retry_failed_files` is off
    Disabled,
    /// Failure category says retrying will not help
    NotRetryable(ErrorCategory),
    /// `max_retry_attempts` used up
    Exhausted { attempts: u32 },
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Requeue)
    }
}

pub trait QueuePolicy: Send + Sync {
    /// Next queued record to activate, if any
    fn next_candidate(&self, store: &FileStore) -> Option<Uuid>;

    /// Auto-retry decision for a failed record
    fn retry_decision(&self, record: &FileRecord, config: &MultiFileConfig) -> RetryDecision;
}

/// Strict FIFO by original submission order
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoQueuePolicy;

impl QueuePolicy for FifoQueuePolicy {
    fn next_candidate(&self, store: &FileStore) -> Option<Uuid> {
        store
            .queued()
            .min_by_key(|r| r.submitted_index)
            .map(|r| r.id)
    }

    fn retry_decision(&self, record: &FileRecord, config: &MultiFileConfig) -> RetryDecision {
        if !config.retry_failed_files {
            return RetryDecision::Disabled;
        }

        if let Some(error) = &record.last_error {
            if !error.category.is_retryable() {
                return RetryDecision::NotRetryable(error.category);
            }
        }

        if record.retry_count >= config.max_retry_attempts {
            return RetryDecision::Exhausted {
                attempts: record.retry_count,
            };
        }

        RetryDecision::Requeue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{FileInput, FileStatus, Stage, StageResult};

    fn failed_record(category: ErrorCategory, retry_count: u32) -> FileRecord {
        let mut store = FileStore::new();
        let report = store.add_files(
            vec![FileInput::pdf("a.pdf", 10)],
            &MultiFileConfig::default(),
        );
        let id = report.accepted[0];
        store.update_status(id, FileStatus::Uploading).unwrap();
        store
            .record_stage_result(id, StageResult::failure(Stage::Upload, "x", category))
            .unwrap();
        store.update_status(id, FileStatus::Failed).unwrap();

        let mut record = store.get(id).unwrap().clone();
        record.retry_count = retry_count;
        record
    }

    #[test]
    fn test_fifo_picks_lowest_submission_index() {
        let mut store = FileStore::new();
        let report = store.add_files(
            vec![
                FileInput::pdf("a.pdf", 10),
                FileInput::pdf("b.pdf", 10),
                FileInput::pdf("c.pdf", 10),
            ],
            &MultiFileConfig::default(),
        );
        let policy = FifoQueuePolicy;
        assert_eq!(policy.next_candidate(&store), Some(report.accepted[0]));

        store
            .update_status(report.accepted[0], FileStatus::Uploading)
            .unwrap();
        assert_eq!(policy.next_candidate(&store), Some(report.accepted[1]));
    }

    #[test]
    fn test_fifo_empty_queue() {
        assert_eq!(FifoQueuePolicy.next_candidate(&FileStore::new()), None);
    }

    #[test]
    fn test_retry_decisions() {
        let policy = FifoQueuePolicy;
        let config = MultiFileConfig::default();

        let record = failed_record(ErrorCategory::Transient, 0);
        assert_eq!(policy.retry_decision(&record, &config), RetryDecision::Requeue);

        let record = failed_record(ErrorCategory::Permanent, 0);
        assert_eq!(
            policy.retry_decision(&record, &config),
            RetryDecision::NotRetryable(ErrorCategory::Permanent)
        );

        let record = failed_record(ErrorCategory::Transient, 2);
        assert_eq!(
            policy.retry_decision(&record, &config),
            RetryDecision::Exhausted { attempts: 2 }
        );

        let disabled = MultiFileConfig {
            retry_failed_files: false,
            ..Default::default()
        };
        let record = failed_record(ErrorCategory::Transient, 0);
        assert!(!policy.retry_decision(&record, &disabled).should_retry());
    }
}
