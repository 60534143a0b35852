use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Idle,
    Processing,
    Paused,
    Completed,
    Failed,
    /// Stopped by the user
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Idle => "idle",
            BatchStatus::Processing => "processing",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(BatchStatus::Idle),
            "processing" => Ok(BatchStatus::Processing),
            "paused" => Ok(BatchStatus::Paused),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "cancelled" => Ok(BatchStatus::Cancelled),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid batch status: {}",
                s
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One submission group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub status: BatchStatus,
    /// Index of the active record in submission order (sequential mode)
    pub current_file_index: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: BatchStatus::Idle,
            current_file_index: None,
            created_at: Utc::now(),
            start_time: None,
            completion_time: None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.start_time?;
        let end = self.completion_time.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds().max(0) as u64)
    }

    fn transition(&mut self, expected: &[BatchStatus], to: BatchStatus) -> Result<BatchStatus> {
        if !expected.contains(&self.status) {
            return Err(OrchestratorError::invalid_state(format!(
                "batch {} is {}, cannot move to {}",
                self.id, self.status, to
            )));
        }
        let from = self.status;
        self.status = to;
        Ok(from)
    }

    /// Transition: IDLE | PAUSED → PROCESSING
    pub fn start(&mut self) -> Result<BatchStatus> {
        let from = self.transition(
            &[BatchStatus::Idle, BatchStatus::Paused],
            BatchStatus::Processing,
        )?;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
        Ok(from)
    }

    /// Transition: PROCESSING → PAUSED
    pub fn pause(&mut self) -> Result<()> {
        self.transition(&[BatchStatus::Processing], BatchStatus::Paused)?;
        Ok(())
    }

    /// Transition: PAUSED → PROCESSING
    pub fn resume(&mut self) -> Result<()> {
        self.transition(&[BatchStatus::Paused], BatchStatus::Processing)?;
        Ok(())
    }

    /// Transition: PROCESSING → COMPLETED | FAILED
    pub fn finish(&mut self, any_failed: bool) -> Result<BatchStatus> {
        let to = if any_failed {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        self.transition(&[BatchStatus::Processing], to)?;
        self.current_file_index = None;
        self.completion_time = Some(Utc::now());
        Ok(to)
    }

    /// Transition: any non-terminal → CANCELLED. Returns false when already terminal.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = BatchStatus::Cancelled;
        self.current_file_index = None;
        self.completion_time = Some(Utc::now());
        true
    }

    /// Transition: FAILED → PROCESSING, for an explicit retry of failed files
    pub fn reopen_for_retry(&mut self) -> Result<()> {
        self.transition(&[BatchStatus::Failed], BatchStatus::Processing)?;
        self.completion_time = None;
        Ok(())
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_lifecycle() {
        let mut batch = Batch::new();
        assert_eq!(batch.status, BatchStatus::Idle);

        batch.start().unwrap();
        assert!(batch.start_time.is_some());

        batch.pause().unwrap();
        assert_eq!(batch.status, BatchStatus::Paused);
        batch.resume().unwrap();

        let status = batch.finish(false).unwrap();
        assert_eq!(status, BatchStatus::Completed);
        assert!(batch.completion_time.is_some());
        assert!(batch.duration_ms().is_some());
    }

    #[test]
    fn test_start_from_terminal_rejected() {
        let mut batch = Batch::new();
        batch.start().unwrap();
        batch.finish(true).unwrap();

        let err = batch.start().unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState(_)));
        assert_eq!(batch.status, BatchStatus::Failed);
    }

    #[test]
    fn test_pause_requires_processing() {
        let mut batch = Batch::new();
        assert!(batch.pause().is_err());
        assert!(batch.resume().is_err());
    }

    #[test]
    fn test_cancel_idempotent() {
        let mut batch = Batch::new();
        batch.start().unwrap();
        assert!(batch.cancel());
        assert!(!batch.cancel());
        assert_eq!(batch.status, BatchStatus::Cancelled);
    }

    #[test]
    fn test_reopen_only_from_failed() {
        let mut batch = Batch::new();
        batch.start().unwrap();
        batch.finish(false).unwrap();
        assert!(batch.reopen_for_retry().is_err());

        let mut batch = Batch::new();
        batch.start().unwrap();
        batch.finish(true).unwrap();
        batch.reopen_for_retry().unwrap();
        assert_eq!(batch.status, BatchStatus::Processing);
        assert!(batch.completion_time.is_none());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in &[
            BatchStatus::Idle,
            BatchStatus::Processing,
            BatchStatus::Paused,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Cancelled,
        ] {
            assert_eq!(BatchStatus::from_str(status.as_str()).unwrap(), *status);
        }
    }
}
