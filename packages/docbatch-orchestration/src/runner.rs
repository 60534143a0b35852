//! Stage Runner contract
//!
//! The controller invokes one `StageRunner::run_stage` call per (file, stage)
//! attempt. Runners stream progress through the supplied `ProgressReporter`
//! and resolve with a `StageOutcome`.
//!
//! Runner obligations:
//! - report progress 0 on start and 100 before returning success
//! - never report after returning
//! - once `request.cancel` fires (or a report returns `Interrupted`), stop
//!   reporting and resolve with `StageOutcome::Cancelled`
//!
//! Breaking these rules is a protocol violation: the controller logs and
//! counts it, and the batch keeps going.

use crate::error::ErrorCategory;
use crate::file::{FileInput, PageProgress, Stage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Input to one stage attempt
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub batch_id: Uuid,
    pub file_id: Uuid,
    /// Set once the upload stage has been acknowledged
    pub backend_id: Option<String>,
    pub stage: Stage,
    pub file: FileInput,
    /// 1 for the first attempt, bumped by each retry
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Result of one stage attempt
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Success {
        payload: serde_json::Value,
        cost: f64,
        /// Upload acknowledgement id, only meaningful for `Stage::Upload`
        backend_id: Option<String>,
    },
    Failure {
        message: String,
        /// Classified from the message when absent
        category: Option<ErrorCategory>,
    },
    Cancelled,
}

impl StageOutcome {
    pub fn success(payload: serde_json::Value, cost: f64) -> Self {
        StageOutcome::Success {
            payload,
            cost,
            backend_id: None,
        }
    }

    pub fn uploaded(backend_id: impl Into<String>) -> Self {
        StageOutcome::Success {
            payload: serde_json::Value::Null,
            cost: 0.0,
            backend_id: Some(backend_id.into()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        StageOutcome::Failure {
            message: message.into(),
            category: None,
        }
    }

    pub fn failure_with(message: impl Into<String>, category: ErrorCategory) -> Self {
        StageOutcome::Failure {
            message: message.into(),
            category: Some(category),
        }
    }
}

/// Executes one stage for one file
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run_stage(&self, request: StageRequest, reporter: ProgressReporter) -> StageOutcome;
}

/// Returned by `ProgressReporter::report*` once the attempt was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stage attempt interrupted")]
pub struct Interrupted;

/// Detailed progress report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub message: Option<String>,
    pub sub_step: Option<String>,
    pub page_progress: Option<PageProgress>,
}

impl ProgressUpdate {
    pub fn new(progress: f64) -> Self {
        Self {
            progress,
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_sub_step(mut self, sub_step: impl Into<String>) -> Self {
        self.sub_step = Some(sub_step.into());
        self
    }

    pub fn with_pages(mut self, current: u32, total: u32) -> Self {
        self.page_progress = Some(PageProgress { current, total });
        self
    }
}

/// Ways a runner can break its contract
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolViolation {
    ReportAfterCompletion { progress: f64 },
    ProgressOutOfRange { progress: f64 },
    MissingStartReport,
    MissingFinishReport,
    NegativeCost { cost: f64 },
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolViolation::ReportAfterCompletion { progress } => {
                write!(f, "progress {} reported after the stage returned", progress)
            }
            ProtocolViolation::ProgressOutOfRange { progress } => {
                write!(f, "progress {} is outside 0..=100", progress)
            }
            ProtocolViolation::MissingStartReport => write!(f, "no progress 0 report on start"),
            ProtocolViolation::MissingFinishReport => {
                write!(f, "success returned without a progress 100 report")
            }
            ProtocolViolation::NegativeCost { cost } => write!(f, "negative cost {}", cost),
        }
    }
}

/// Receiver side of a `ProgressReporter`
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Called before every accepted report. May wait (pause); returns
    /// `Interrupted` when the attempt must stop.
    async fn checkpoint(&self, _file_id: Uuid, _cancel: &CancellationToken) -> Result<(), Interrupted> {
        Ok(())
    }

    fn on_progress(&self, file_id: Uuid, stage: Stage, update: ProgressUpdate);

    fn on_violation(&self, file_id: Uuid, stage: Stage, violation: ProtocolViolation);
}

struct ReporterState {
    sink: Arc<dyn ProgressSink>,
    file_id: Uuid,
    stage: Stage,
    cancel: CancellationToken,
    sealed: AtomicBool,
    saw_start: AtomicBool,
    saw_finish: AtomicBool,
}

/// Progress callback handed to a runner for one stage attempt
#[derive(Clone)]
pub struct ProgressReporter {
    state: Arc<ReporterState>,
}

impl ProgressReporter {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        file_id: Uuid,
        stage: Stage,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: Arc::new(ReporterState {
                sink,
                file_id,
                stage,
                cancel,
                sealed: AtomicBool::new(false),
                saw_start: AtomicBool::new(false),
                saw_finish: AtomicBool::new(false),
            }),
        }
    }

    pub fn stage(&self) -> Stage {
        self.state.stage
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    pub async fn report(&self, progress: f64) -> Result<(), Interrupted> {
        self.report_detailed(ProgressUpdate::new(progress)).await
    }

    pub async fn report_detailed(&self, update: ProgressUpdate) -> Result<(), Interrupted> {
        let state = &self.state;

        if state.sealed.load(Ordering::Acquire) {
            state.sink.on_violation(
                state.file_id,
                state.stage,
                ProtocolViolation::ReportAfterCompletion {
                    progress: update.progress,
                },
            );
            return Ok(());
        }

        if state.cancel.is_cancelled() {
            return Err(Interrupted);
        }

        if !update.progress.is_finite() || !(0.0..=100.0).contains(&update.progress) {
            state.sink.on_violation(
                state.file_id,
                state.stage,
                ProtocolViolation::ProgressOutOfRange {
                    progress: update.progress,
                },
            );
            return Ok(());
        }

        state.sink.checkpoint(state.file_id, &state.cancel).await?;

        if update.progress == 0.0 {
            state.saw_start.store(true, Ordering::Release);
        }
        if update.progress >= 100.0 {
            state.saw_finish.store(true, Ordering::Release);
        }

        state.sink.on_progress(state.file_id, state.stage, update);
        Ok(())
    }

    /// Close the reporter once the runner has returned
    pub(crate) fn seal(&self) {
        self.state.sealed.store(true, Ordering::Release);
    }

    pub(crate) fn saw_start(&self) -> bool {
        self.state.saw_start.load(Ordering::Acquire)
    }

    pub(crate) fn saw_finish(&self) -> bool {
        self.state.saw_finish.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("file_id", &self.state.file_id)
            .field("stage", &self.state.stage)
            .field("sealed", &self.state.sealed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Sink that records everything it receives; for exercising runners in isolation
#[derive(Default)]
pub struct CollectingSink {
    updates: Mutex<Vec<(Stage, ProgressUpdate)>>,
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reporter for `stage` of a throwaway file id
    pub fn reporter(self: &Arc<Self>, stage: Stage, cancel: CancellationToken) -> ProgressReporter {
        ProgressReporter::new(self.clone(), Uuid::new_v4(), stage, cancel)
    }

    pub fn progress_values(&self) -> Vec<f64> {
        self.updates.lock().iter().map(|(_, u)| u.progress).collect()
    }

    pub fn updates(&self) -> Vec<(Stage, ProgressUpdate)> {
        self.updates.lock().clone()
    }

    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }
}

#[async_trait]
impl ProgressSink for CollectingSink {
    fn on_progress(&self, _file_id: Uuid, stage: Stage, update: ProgressUpdate) {
        self.updates.lock().push((stage, update));
    }

    fn on_violation(&self, _file_id: Uuid, _stage: Stage, violation: ProtocolViolation) {
        self.violations.lock().push(violation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reporter_forwards_progress() {
        let sink = CollectingSink::new();
        let reporter = sink.reporter(Stage::Vision, CancellationToken::new());

        reporter.report(0.0).await.unwrap();
        reporter
            .report_detailed(
                ProgressUpdate::new(50.0)
                    .with_message("page 2")
                    .with_pages(2, 4),
            )
            .await
            .unwrap();
        reporter.report(100.0).await.unwrap();

        assert_eq!(sink.progress_values(), vec![0.0, 50.0, 100.0]);
        assert!(reporter.saw_start());
        assert!(reporter.saw_finish());
        let (_, detailed) = &sink.updates()[1];
        assert_eq!(detailed.page_progress, Some(PageProgress { current: 2, total: 4 }));
    }

    #[tokio::test]
    async fn test_report_after_seal_is_violation() {
        let sink = CollectingSink::new();
        let reporter = sink.reporter(Stage::Upload, CancellationToken::new());
        reporter.seal();

        assert!(reporter.report(10.0).await.is_ok());
        assert!(sink.progress_values().is_empty());
        assert_eq!(
            sink.violations(),
            vec![ProtocolViolation::ReportAfterCompletion { progress: 10.0 }]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_dropped() {
        let sink = CollectingSink::new();
        let reporter = sink.reporter(Stage::Vision, CancellationToken::new());

        reporter.report(120.0).await.unwrap();
        assert!(sink.progress_values().is_empty());
        assert_eq!(sink.violations().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_reporter_interrupts() {
        let sink = CollectingSink::new();
        let cancel = CancellationToken::new();
        let reporter = sink.reporter(Stage::Extraction, cancel.clone());

        cancel.cancel();
        assert!(reporter.is_cancelled());
        assert_eq!(reporter.report(10.0).await, Err(Interrupted));
        assert!(sink.progress_values().is_empty());
    }

    #[test]
    fn test_outcome_helpers() {
        assert_eq!(
            StageOutcome::uploaded("be-1"),
            StageOutcome::Success {
                payload: serde_json::Value::Null,
                cost: 0.0,
                backend_id: Some("be-1".to_string()),
            }
        );
        assert!(matches!(
            StageOutcome::failure("boom"),
            StageOutcome::Failure { category: None, .. }
        ));
    }
}
