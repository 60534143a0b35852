use crate::error::ErrorCategory;
use crate::file::Stage;
use crate::runner::{ProgressReporter, ProgressUpdate, StageOutcome, StageRequest, StageRunner};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Injected failure for one file name and stage
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRule {
    pub file_name: String,
    pub stage: Stage,
    /// Fail attempts `1..=n`; None fails every attempt
    pub failing_attempts: Option<u32>,
    pub message: String,
    pub category: Option<ErrorCategory>,
}

impl FailureRule {
    pub fn always(file_name: impl Into<String>, stage: Stage) -> Self {
        Self {
            file_name: file_name.into(),
            stage,
            failing_attempts: None,
            message: format!("simulated {} failure", stage),
            category: Some(ErrorCategory::Permanent),
        }
    }

    /// Fails the first `attempts` attempts, then lets the stage through
    pub fn times(file_name: impl Into<String>, stage: Stage, attempts: u32) -> Self {
        Self {
            failing_attempts: Some(attempts),
            message: format!("simulated {} timeout", stage),
            category: Some(ErrorCategory::Transient),
            ..Self::always(file_name, stage)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// None leaves classification to the controller
    pub fn with_category(mut self, category: Option<ErrorCategory>) -> Self {
        self.category = category;
        self
    }

    fn matches(&self, request: &StageRequest) -> bool {
        self.file_name == request.file.name
            && self.stage == request.stage
            && self
                .failing_attempts
                .map(|n| request.attempt <= n)
                .unwrap_or(true)
    }
}

/// One recorded `run_stage` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCall {
    pub file_name: String,
    pub stage: Stage,
    pub attempt: u32,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Deterministic stage runner
///
/// Reports `0, 100/steps, ..., 100` for every stage, sleeping `step_delay`
/// between reports, and charges a fixed cost per processing stage. Failure
/// rules make a stage fail halfway through its steps.
pub struct SimulatedStageRunner {
    steps: u32,
    step_delay: Duration,
    costs: BTreeMap<Stage, f64>,
    failures: Vec<FailureRule>,
    calls: Mutex<Vec<StageCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedStageRunner {
    pub fn new() -> Self {
        let costs = [
            (Stage::Upload, 0.0),
            (Stage::Vision, 0.02),
            (Stage::Extraction, 0.01),
            (Stage::Conversion, 0.005),
        ]
        .into_iter()
        .collect();

        Self {
            steps: 4,
            step_delay: Duration::ZERO,
            costs,
            failures: Vec::new(),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps.max(1);
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_cost(mut self, stage: Stage, cost: f64) -> Self {
        self.costs.insert(stage, cost);
        self
    }

    pub fn with_failure(mut self, rule: FailureRule) -> Self {
        self.failures.push(rule);
        self
    }

    pub fn calls(&self) -> Vec<StageCall> {
        self.calls.lock().clone()
    }

    /// Calls made for one file, in order
    pub fn calls_for(&self, file_name: &str) -> Vec<(Stage, u32)> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.file_name == file_name)
            .map(|c| (c.stage, c.attempt))
            .collect()
    }

    /// Highest number of concurrently running stages seen
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn payload(&self, request: &StageRequest) -> serde_json::Value {
        match request.stage {
            Stage::Vision => json!({ "pages": self.steps, "regions": self.steps * 3 }),
            Stage::Extraction => json!({ "blocks": self.steps * 2, "source": request.file.name }),
            Stage::Conversion => json!({ "format": "latex", "bytes": request.file.size_bytes }),
            Stage::Upload => serde_json::Value::Null,
        }
    }
}

impl Default for SimulatedStageRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageRunner for SimulatedStageRunner {
    async fn run_stage(&self, request: StageRequest, reporter: ProgressReporter) -> StageOutcome {
        self.calls.lock().push(StageCall {
            file_name: request.file.name.clone(),
            stage: request.stage,
            attempt: request.attempt,
        });
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        let failure = self.failures.iter().find(|r| r.matches(&request));
        let fail_at = self.steps / 2;
        debug!(
            "Simulating {} for {} (attempt {})",
            request.stage, request.file.name, request.attempt
        );

        for step in 0..=self.steps {
            if let Some(rule) = failure {
                if step == fail_at && step > 0 {
                    return StageOutcome::Failure {
                        message: rule.message.clone(),
                        category: rule.category,
                    };
                }
            }

            let progress = f64::from(step) * 100.0 / f64::from(self.steps);
            let mut update = ProgressUpdate::new(progress)
                .with_message(format!("{} {}", request.stage, request.file.name));
            if request.stage == Stage::Extraction {
                update = update.with_pages(step, self.steps);
            }
            if reporter.report_detailed(update).await.is_err() {
                return StageOutcome::Cancelled;
            }

            if step < self.steps && !self.step_delay.is_zero() {
                tokio::select! {
                    _ = request.cancel.cancelled() => return StageOutcome::Cancelled,
                    _ = tokio::time::sleep(self.step_delay) => {}
                }
            }
        }

        // a single step never reaches the halfway failure point above
        if let Some(rule) = failure {
            return StageOutcome::Failure {
                message: rule.message.clone(),
                category: rule.category,
            };
        }

        match request.stage {
            Stage::Upload => StageOutcome::uploaded(format!("sim-{}", request.file_id.simple())),
            stage => StageOutcome::success(
                self.payload(&request),
                self.costs.get(&stage).copied().unwrap_or(0.0),
            ),
        }
    }
}
