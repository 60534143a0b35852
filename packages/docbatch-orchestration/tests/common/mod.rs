//! Shared fixtures for controller integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use docbatch_orchestration::{
    BatchController, BatchStatus, ProgressReporter, Stage, StageOutcome, StageRequest, StageRunner,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Runner that stops one file inside one stage until released
///
/// Every stage reports 0 and 100. The gated stage additionally reports
/// `gate_at`, signals `reached`, waits for `release`, then reports 60
/// before finishing. Only the first attempt is gated.
pub struct GatedRunner {
    gate_file: String,
    gate_stage: Stage,
    gate_at: f64,
    gated: AtomicBool,
    pub reached: Notify,
    pub release: Notify,
}

impl GatedRunner {
    pub fn new(gate_file: &str, gate_stage: Stage, gate_at: f64) -> Self {
        Self {
            gate_file: gate_file.to_string(),
            gate_stage,
            gate_at,
            gated: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl StageRunner for GatedRunner {
    async fn run_stage(&self, request: StageRequest, reporter: ProgressReporter) -> StageOutcome {
        if reporter.report(0.0).await.is_err() {
            return StageOutcome::Cancelled;
        }

        let gate = request.file.name == self.gate_file
            && request.stage == self.gate_stage
            && !self.gated.swap(true, Ordering::SeqCst);
        if gate {
            if reporter.report(self.gate_at).await.is_err() {
                return StageOutcome::Cancelled;
            }
            self.reached.notify_one();
            tokio::select! {
                _ = self.release.notified() => {}
                _ = request.cancel.cancelled() => return StageOutcome::Cancelled,
            }
            if reporter.report(60.0).await.is_err() {
                return StageOutcome::Cancelled;
            }
        }

        if reporter.report(100.0).await.is_err() {
            return StageOutcome::Cancelled;
        }
        match request.stage {
            Stage::Upload => StageOutcome::uploaded(format!("be-{}", request.file.name)),
            stage => StageOutcome::success(json!({ "stage": stage.as_str() }), 0.01),
        }
    }
}

/// Poll until `done` holds
pub async fn wait_until(controller: &BatchController, what: &str, done: impl Fn(&BatchController) -> bool) {
    let polled = tokio::time::timeout(TIMEOUT, async {
        while !done(controller) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

pub async fn finish(controller: &BatchController) -> BatchStatus {
    let status = tokio::time::timeout(TIMEOUT, controller.wait_until_finished())
        .await
        .expect("batch did not finish in time");
    status.expect("no batch")
}

pub async fn reached(runner: &GatedRunner) {
    tokio::time::timeout(TIMEOUT, runner.reached.notified())
        .await
        .expect("gated stage never reached");
}
