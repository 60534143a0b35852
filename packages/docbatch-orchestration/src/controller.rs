//! Batch Controller
//!
//! Owns the live batch and its FileRecord store, drives files through the
//! stage pipeline, and exposes the pause / resume / stop commands.
//!
//! All state sits behind one `parking_lot::Mutex`, which is never held across
//! an `.await`. Notifications are built (and sequenced) under the lock and
//! published after it is released.
//!
//! A single driver task per batch dequeues records into a `JoinSet` bounded
//! by the effective concurrency (1 in sequential mode). Each file task runs
//! its remaining stages one after another. Pausing takes effect at the next
//! checkpoint of an active file: every progress report and every stage
//! boundary.

use crate::batch::{Batch, BatchStatus};
use crate::config::MultiFileConfig;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::events::{EventBus, FileProcessingUpdate, SubscriptionId, UpdateKind, UpdateSubscriber};
use crate::file::{FileInput, FileRecord, FileStatus, Stage, StageResult};
use crate::policy::{FifoQueuePolicy, QueuePolicy, RetryDecision};
use crate::progress::{aggregate, BatchProgress};
use crate::runner::{
    Interrupted, ProgressReporter, ProgressSink, ProgressUpdate, ProtocolViolation, StageOutcome,
    StageRequest, StageRunner,
};
use crate::snapshot::BatchSnapshot;
use crate::store::{AddFilesReport, FileStore, ProgressChange, ProgressDetail};
use async_trait::async_trait;
use docbatch_storage::BatchStateStore;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type Events = Vec<FileProcessingUpdate>;

struct BatchState {
    batch: Option<Batch>,
    files: FileStore,
    /// Parent of every per-file token of the live batch
    cancel: CancellationToken,
    /// Files with a running task
    file_tokens: HashMap<Uuid, CancellationToken>,
    driver_active: bool,
    driver_epoch: u64,
    sequence: u64,
}

impl BatchState {
    fn new() -> Self {
        Self {
            batch: None,
            files: FileStore::new(),
            cancel: CancellationToken::new(),
            file_tokens: HashMap::new(),
            driver_active: false,
            driver_epoch: 0,
            sequence: 0,
        }
    }

    fn owns(&self, batch_id: Uuid) -> bool {
        self.batch.as_ref().map(|b| b.id == batch_id).unwrap_or(false)
    }

    fn status(&self) -> Option<BatchStatus> {
        self.batch.as_ref().map(|b| b.status)
    }

    fn live_batch(&mut self) -> Result<&mut Batch> {
        self.batch
            .as_mut()
            .ok_or_else(|| OrchestratorError::invalid_state("no batch has been initialized"))
    }

    fn stamp(&mut self, update: FileProcessingUpdate, config: &MultiFileConfig) -> FileProcessingUpdate {
        self.sequence += 1;
        let progress = aggregate(self.batch.as_ref(), &self.files, config);
        let mut update = update.with_progress(&progress);
        update.sequence = self.sequence;
        update
    }

    fn batch_event(&mut self, config: &MultiFileConfig) -> Option<FileProcessingUpdate> {
        let batch = self.batch.as_ref()?;
        let update = FileProcessingUpdate::batch_update(batch.id, batch.status);
        Some(self.stamp(update, config))
    }

    fn file_event(&mut self, file_id: Uuid, config: &MultiFileConfig) -> Option<FileProcessingUpdate> {
        let batch_id = self.batch.as_ref()?.id;
        let update = FileProcessingUpdate::file_update(batch_id, self.files.get(file_id)?);
        Some(self.stamp(update, config))
    }

    fn stage_event(
        &mut self,
        file_id: Uuid,
        stage: Stage,
        config: &MultiFileConfig,
    ) -> Option<FileProcessingUpdate> {
        let batch_id = self.batch.as_ref()?.id;
        let update = FileProcessingUpdate::stage_update(batch_id, self.files.get(file_id)?, stage);
        Some(self.stamp(update, config))
    }

    /// Point `current_file_index` at the first active (or paused) record
    fn sync_current_index(&mut self) {
        let index = self
            .files
            .files()
            .iter()
            .position(|r| r.status.is_active() || r.status == FileStatus::Paused);
        if let Some(batch) = self.batch.as_mut() {
            batch.current_file_index = index;
        }
    }

    /// Active or uploaded record left without a task (after restore)
    fn orphan(&self) -> Option<Uuid> {
        self.files
            .files()
            .iter()
            .filter(|r| r.status.is_active() || r.status == FileStatus::Uploaded)
            .find(|r| !self.file_tokens.contains_key(&r.id))
            .map(|r| r.id)
    }

    /// Drop the live batch and signal every running task to stop
    fn discard(&mut self) -> Option<Uuid> {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.file_tokens.clear();
        self.driver_active = false;
        self.driver_epoch += 1;
        self.files = FileStore::new();
        self.batch.take().map(|b| b.id)
    }
}

enum IdleAction {
    Wait,
    Finalized(Events),
    Exit,
}

struct Shared {
    config: MultiFileConfig,
    runner: Arc<dyn StageRunner>,
    policy: Arc<dyn QueuePolicy>,
    persistence: Option<Arc<dyn BatchStateStore>>,
    state: Mutex<BatchState>,
    events: EventBus,
    /// true while the batch is paused
    pause_tx: watch::Sender<bool>,
    status_tx: watch::Sender<Option<BatchStatus>>,
    /// Serializes snapshot saves so the newest state is written last
    persist_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    protocol_violations: AtomicU64,
}

impl Shared {
    fn publish(&self, events: Events) {
        for update in &events {
            self.events.publish(update);
        }
    }

    fn publish_status(&self) {
        let status = self.state.lock().status();
        self.status_tx.send_replace(status);
    }

    async fn persist(&self) {
        if !self.config.persist_batch_state {
            return;
        }
        if let Err(e) = self.save_snapshot().await {
            warn!("Failed to persist batch state: {}", e);
        }
    }

    async fn save_snapshot(&self) -> Result<bool> {
        let Some(store) = self.persistence.as_ref() else {
            return Ok(false);
        };

        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let state = self.state.lock();
            match state.batch.as_ref() {
                Some(batch) => BatchSnapshot::new(batch.clone(), state.files.files().to_vec()),
                None => return Ok(false),
            }
        };

        store.save(&snapshot.to_persisted()?).await?;
        debug!("Saved snapshot of batch {} ({})", snapshot.batch.id, snapshot.batch.status);
        Ok(true)
    }

    /// Publish, persist, then announce the batch status
    async fn settle(&self, events: Events) {
        self.publish(events);
        self.persist().await;
        self.publish_status();
    }

    fn record_violation(&self, file_id: Uuid, stage: Stage, violation: &ProtocolViolation) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
        let err = OrchestratorError::ProtocolViolation {
            stage,
            violation: violation.clone(),
        };
        warn!("File {}: {}", file_id, err);
    }

    fn spawn_driver(self: &Arc<Self>, state: &mut BatchState) {
        if state.driver_active {
            return;
        }
        let Some(batch_id) = state.batch.as_ref().map(|b| b.id) else {
            return;
        };

        state.driver_active = true;
        state.driver_epoch += 1;
        let epoch = state.driver_epoch;
        let cancel = state.cancel.clone();
        let shared = self.clone();

        tokio::spawn(async move {
            shared.drive(batch_id, epoch, cancel).await;
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Driver
    // ═══════════════════════════════════════════════════════════════════════

    async fn drive(self: Arc<Self>, batch_id: Uuid, epoch: u64, cancel: CancellationToken) {
        let limit = self.config.effective_concurrency();
        let mut tasks: JoinSet<Uuid> = JoinSet::new();
        debug!("Driver for batch {} started (limit {})", batch_id, limit);

        loop {
            while tasks.len() < limit {
                let Some((file_id, token)) = self.dequeue_next(batch_id) else {
                    break;
                };
                let shared = self.clone();
                tasks.spawn(async move {
                    let run = AssertUnwindSafe(shared.clone().process_file(batch_id, file_id, token))
                        .catch_unwind()
                        .await;
                    if run.is_err() {
                        error!("Stage runner panicked while processing file {}", file_id);
                        shared.fail_after_panic(batch_id, file_id);
                    }
                    file_id
                });
            }

            if tasks.is_empty() {
                match self.idle_action(batch_id, epoch) {
                    IdleAction::Exit => break,
                    IdleAction::Finalized(events) => {
                        self.settle(events).await;
                        break;
                    }
                    IdleAction::Wait => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.wake.notified() => continue,
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    // stop: in-flight runners finish on their own schedule
                    tasks.detach_all();
                    break;
                }
                _ = self.wake.notified() => {}
                joined = tasks.join_next() => match joined {
                    Some(Ok(file_id)) => self.move_to_next_file(batch_id, file_id).await,
                    Some(Err(e)) => error!("File task for batch {} aborted: {}", batch_id, e),
                    None => {}
                },
            }
        }

        debug!("Driver for batch {} exited", batch_id);
    }

    /// Pick the next record to activate: orphans first, then the policy
    fn dequeue_next(&self, batch_id: Uuid) -> Option<(Uuid, CancellationToken)> {
        let mut events = Vec::new();
        let picked = {
            let mut state = self.state.lock();
            if !state.owns(batch_id)
                || state.status() != Some(BatchStatus::Processing)
                || state.cancel.is_cancelled()
            {
                return None;
            }

            let file_id = match state.orphan() {
                Some(id) => {
                    debug!("Resuming orphaned file {}", id);
                    id
                }
                None => {
                    let id = self.policy.next_candidate(&state.files)?;
                    let status = state.files.get(id)?.status;
                    let activated = match status {
                        FileStatus::Pending => state
                            .files
                            .update_status(id, FileStatus::Uploading)
                            .map(|_| ()),
                        FileStatus::Failed => state.files.begin_retry(id),
                        other => Err(OrchestratorError::invalid_state(format!(
                            "queue policy picked file {} in status {}",
                            id, other
                        ))),
                    };
                    if let Err(e) = activated {
                        error!("Could not activate file {}: {}", id, e);
                        return None;
                    }
                    id
                }
            };

            let token = state.cancel.child_token();
            state.file_tokens.insert(file_id, token.clone());
            state.sync_current_index();

            if let Some(record) = state.files.get(file_id) {
                info!(
                    "Processing file {} ({}) attempt {}",
                    record.display_name,
                    file_id,
                    record.retry_count + 1
                );
            }
            events.extend(state.file_event(file_id, &self.config));
            (file_id, token)
        };

        self.publish(events);
        Some(picked)
    }

    fn idle_action(&self, batch_id: Uuid, epoch: u64) -> IdleAction {
        let mut state = self.state.lock();
        if state.driver_epoch != epoch || !state.owns(batch_id) {
            return IdleAction::Exit;
        }
        if state.cancel.is_cancelled() {
            state.driver_active = false;
            return IdleAction::Exit;
        }

        match state.status() {
            Some(BatchStatus::Paused) => IdleAction::Wait,
            Some(BatchStatus::Processing) => {
                let any_failed = state
                    .files
                    .files()
                    .iter()
                    .any(|r| r.status == FileStatus::Failed);
                state.driver_active = false;

                let finished = state.live_batch().and_then(|batch| batch.finish(any_failed));
                match finished {
                    Ok(status) => {
                        let progress = aggregate(state.batch.as_ref(), &state.files, &self.config);
                        info!(
                            "Batch {} {}: {} completed, {} failed of {} files",
                            batch_id,
                            status,
                            progress.completed_files,
                            progress.failed_files,
                            progress.total_files
                        );
                        IdleAction::Finalized(state.batch_event(&self.config).into_iter().collect())
                    }
                    Err(e) => {
                        error!("Could not finalize batch {}: {}", batch_id, e);
                        IdleAction::Exit
                    }
                }
            }
            _ => {
                state.driver_active = false;
                IdleAction::Exit
            }
        }
    }

    /// Bookkeeping after a file task returned; the driver loop refills
    async fn move_to_next_file(&self, batch_id: Uuid, file_id: Uuid) {
        let events = {
            let mut state = self.state.lock();
            state.file_tokens.remove(&file_id);
            if !state.owns(batch_id) {
                return;
            }
            state.files.recompute_queue_positions();
            state.sync_current_index();
            state.batch_event(&self.config).into_iter().collect::<Events>()
        };

        self.publish(events);
        self.persist().await;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Per-file task
    // ═══════════════════════════════════════════════════════════════════════

    async fn process_file(self: Arc<Self>, batch_id: Uuid, file_id: Uuid, token: CancellationToken) {
        loop {
            if self.checkpoint(file_id, &token).await.is_err() {
                return;
            }

            let Some(request) = self.begin_step(batch_id, file_id, &token) else {
                return;
            };
            let stage = request.stage;
            let sink: Arc<dyn ProgressSink> = self.clone();
            let reporter = ProgressReporter::new(sink, file_id, stage, token.clone());

            let outcome = self.runner.run_stage(request, reporter.clone()).await;
            reporter.seal();

            if !self.finish_step(batch_id, file_id, stage, outcome, &reporter, &token) {
                return;
            }
        }
    }

    /// Apply the status change for the next remaining stage and build its request
    fn begin_step(
        &self,
        batch_id: Uuid,
        file_id: Uuid,
        token: &CancellationToken,
    ) -> Option<StageRequest> {
        let mut events = Vec::new();
        let request = {
            let mut state = self.state.lock();
            if token.is_cancelled() || !state.owns(batch_id) {
                return None;
            }

            let record = state.files.get(file_id)?;
            let status = record.status;
            if !(status.is_active() || status == FileStatus::Uploaded) {
                return None;
            }

            let Some(stage) = record.remaining_stages().first().copied() else {
                // restored with every stage already done
                let done = if status == FileStatus::Uploaded {
                    state
                        .files
                        .update_status(file_id, FileStatus::Processing)
                        .and_then(|_| state.files.update_status(file_id, FileStatus::Completed))
                } else {
                    state.files.update_status(file_id, FileStatus::Completed)
                };
                if let Err(e) = done {
                    warn!("Could not complete file {}: {}", file_id, e);
                }
                events.extend(state.file_event(file_id, &self.config));
                drop(state);
                self.publish(events);
                return None;
            };

            let prepared = if stage.is_processing() {
                let mut result = Ok(());
                if status == FileStatus::Uploading {
                    result = state
                        .files
                        .update_status(file_id, FileStatus::Uploaded)
                        .map(|_| ());
                }
                let now = state.files.get(file_id)?.status;
                if result.is_ok() && now == FileStatus::Uploaded {
                    result = state
                        .files
                        .update_status(file_id, FileStatus::Processing)
                        .map(|_| ());
                }
                result.and_then(|_| state.files.reset_stage(file_id, stage))
            } else {
                state.files.reset_stage(file_id, stage)
            };

            if let Err(e) = prepared {
                error!("Could not start {} for file {}: {}", stage, file_id, e);
                return None;
            }

            let record = state.files.get(file_id)?;
            let request = StageRequest {
                batch_id,
                file_id,
                backend_id: record.backend_id.clone(),
                stage,
                file: record.input(),
                attempt: record.retry_count + 1,
                cancel: token.clone(),
            };
            debug!("File {} entering {} (attempt {})", file_id, stage, request.attempt);

            if status != state.files.get(file_id)?.status {
                events.extend(state.file_event(file_id, &self.config));
            }
            events.extend(state.stage_event(file_id, stage, &self.config));
            request
        };

        self.publish(events);
        Some(request)
    }

    /// Record a stage outcome; returns true when the file has more stages to run
    fn finish_step(
        &self,
        batch_id: Uuid,
        file_id: Uuid,
        stage: Stage,
        outcome: StageOutcome,
        reporter: &ProgressReporter,
        token: &CancellationToken,
    ) -> bool {
        let mut events = Vec::new();
        let proceed = {
            let mut state = self.state.lock();
            if token.is_cancelled() || !state.owns(batch_id) {
                debug!("Ignoring {} outcome for cancelled file {}", stage, file_id);
                return false;
            }
            let Some(status) = state.files.get(file_id).map(|r| r.status) else {
                return false;
            };
            if !status.is_active() {
                return false;
            }

            match outcome {
                StageOutcome::Success {
                    payload,
                    cost,
                    backend_id,
                } => {
                    if !reporter.saw_start() {
                        self.record_violation(file_id, stage, &ProtocolViolation::MissingStartReport);
                    }
                    if !reporter.saw_finish() {
                        self.record_violation(file_id, stage, &ProtocolViolation::MissingFinishReport);
                    }
                    let cost = if cost.is_finite() && cost >= 0.0 {
                        cost
                    } else {
                        self.record_violation(file_id, stage, &ProtocolViolation::NegativeCost { cost });
                        0.0
                    };

                    if let Err(e) =
                        state
                            .files
                            .update_progress(file_id, 100.0, Some(stage), ProgressDetail::default())
                    {
                        warn!("File {}: could not close {} at 100: {}", file_id, stage, e);
                    }
                    let recorded = state
                        .files
                        .record_stage_result(file_id, StageResult::success(stage, payload, cost));
                    if let Err(e) = recorded {
                        error!("Could not record {} result for file {}: {}", stage, file_id, e);
                        return false;
                    }

                    if stage == Stage::Upload {
                        if let Some(backend_id) = backend_id {
                            if let Err(e) = state.files.set_backend_id(file_id, backend_id) {
                                warn!("File {}: {}", file_id, e);
                            }
                        }
                        if let Err(e) = state.files.update_status(file_id, FileStatus::Uploaded) {
                            error!("File {} upload acknowledged but {}", file_id, e);
                            return false;
                        }
                        events.extend(state.file_event(file_id, &self.config));
                        true
                    } else {
                        let more = state
                            .files
                            .get(file_id)
                            .map(|r| !r.remaining_stages().is_empty())
                            .unwrap_or(false);

                        let next_status = if more {
                            (status == FileStatus::Retrying).then_some(FileStatus::Processing)
                        } else {
                            Some(FileStatus::Completed)
                        };
                        if let Some(next) = next_status {
                            if let Err(e) = state.files.update_status(file_id, next) {
                                error!("File {} finished {} but {}", file_id, stage, e);
                                return false;
                            }
                        }

                        events.extend(state.stage_event(file_id, stage, &self.config));
                        if !more {
                            if let Some(record) = state.files.get(file_id) {
                                info!(
                                    "File {} completed in {}ms (cost {:.4})",
                                    record.display_name,
                                    record.duration_ms().unwrap_or(0),
                                    record.total_cost()
                                );
                            }
                            events.extend(state.file_event(file_id, &self.config));
                        }
                        more
                    }
                }
                StageOutcome::Failure { message, category } => {
                    let category = category.unwrap_or_else(|| ErrorCategory::classify(&message));
                    let failed = state
                        .files
                        .record_stage_result(
                            file_id,
                            StageResult::failure(stage, message.clone(), category),
                        )
                        .and_then(|_| state.files.update_status(file_id, FileStatus::Failed));
                    if let Err(e) = failed {
                        error!("Could not mark file {} failed: {}", file_id, e);
                        return false;
                    }

                    let (decision, err) = match state.files.get(file_id) {
                        Some(record) => (
                            self.policy.retry_decision(record, &self.config),
                            OrchestratorError::stage_failed(record.display_name.clone(), stage, message),
                        ),
                        None => (
                            RetryDecision::Disabled,
                            OrchestratorError::stage_failed(file_id.to_string(), stage, message),
                        ),
                    };
                    if decision.should_retry() {
                        info!("{} ({}); scheduling retry", err, category);
                        if let Err(e) = state.files.schedule_retry(file_id) {
                            error!("Could not schedule retry for file {}: {}", file_id, e);
                        }
                    } else {
                        warn!("{} ({}) [{:?}]", err, category, decision);
                    }
                    events.extend(state.file_event(file_id, &self.config));
                    false
                }
                StageOutcome::Cancelled => {
                    info!("Stage runner cancelled {} for file {}", stage, file_id);
                    if let Err(e) = state.files.update_status(file_id, FileStatus::Cancelled) {
                        error!("Could not cancel file {}: {}", file_id, e);
                    }
                    events.extend(state.file_event(file_id, &self.config));
                    false
                }
            }
        };

        self.publish(events);
        proceed
    }

    fn fail_after_panic(&self, batch_id: Uuid, file_id: Uuid) {
        let events = {
            let mut state = self.state.lock();
            if !state.owns(batch_id) {
                return;
            }
            let Some(record) = state.files.get(file_id) else {
                return;
            };
            if !record.status.is_active() {
                return;
            }
            let stage = record.current_step();
            let failed = state
                .files
                .record_stage_result(
                    file_id,
                    StageResult::failure(stage, "stage runner panicked", ErrorCategory::Permanent),
                )
                .and_then(|_| state.files.update_status(file_id, FileStatus::Failed));
            if let Err(e) = failed {
                error!("Could not mark file {} failed: {}", file_id, e);
            }
            state.file_event(file_id, &self.config).into_iter().collect::<Events>()
        };
        self.publish(events);
    }

    /// Mark the file paused if the batch is paused; None when it may proceed
    fn pause_at_checkpoint(&self, file_id: Uuid) -> Option<Events> {
        let mut state = self.state.lock();
        if state.status() != Some(BatchStatus::Paused) {
            return None;
        }

        let mut events = Vec::new();
        let active = state
            .files
            .get(file_id)
            .map(|r| r.status.is_active())
            .unwrap_or(false);
        if active {
            match state.files.update_status(file_id, FileStatus::Paused) {
                Ok(_) => {
                    if let Some(record) = state.files.get(file_id) {
                        info!(
                            "File {} paused at {} {:.0}%",
                            record.display_name,
                            record.current_step(),
                            record.progress
                        );
                    }
                    state.sync_current_index();
                    events.extend(state.file_event(file_id, &self.config));
                }
                Err(e) => warn!("Could not pause file {}: {}", file_id, e),
            }
        }
        Some(events)
    }
}

async fn wait_for_resume(rx: &mut watch::Receiver<bool>) {
    loop {
        let paused = *rx.borrow_and_update();
        if !paused || rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl ProgressSink for Shared {
    async fn checkpoint(&self, file_id: Uuid, cancel: &CancellationToken) -> std::result::Result<(), Interrupted> {
        let mut rx = self.pause_tx.subscribe();
        loop {
            if cancel.is_cancelled() {
                return Err(Interrupted);
            }
            let Some(events) = self.pause_at_checkpoint(file_id) else {
                return Ok(());
            };
            let parked = !events.is_empty();
            self.publish(events);
            if parked {
                self.persist().await;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Interrupted),
                _ = wait_for_resume(&mut rx) => {}
            }
        }
    }

    fn on_progress(&self, file_id: Uuid, stage: Stage, update: ProgressUpdate) {
        let events = {
            let mut state = self.state.lock();
            let current = match state.files.get(file_id) {
                Some(record) if record.status.is_active() => record.current_step(),
                _ => return,
            };
            if current != stage {
                return;
            }

            let detail = ProgressDetail {
                message: update.message,
                sub_step: update.sub_step,
                page_progress: update.page_progress,
            };
            match state.files.update_progress(file_id, update.progress, Some(stage), detail) {
                Ok(ProgressChange::Applied(_)) => state
                    .stage_event(file_id, stage, &self.config)
                    .into_iter()
                    .collect::<Events>(),
                Ok(_) => return,
                Err(e) => {
                    warn!("Dropped progress for file {}: {}", file_id, e);
                    return;
                }
            }
        };
        self.publish(events);
    }

    fn on_violation(&self, file_id: Uuid, stage: Stage, violation: ProtocolViolation) {
        self.record_violation(file_id, stage, &violation);
    }
}

/// Builder for `BatchController`
pub struct BatchControllerBuilder {
    config: MultiFileConfig,
    runner: Arc<dyn StageRunner>,
    policy: Arc<dyn QueuePolicy>,
    persistence: Option<Arc<dyn BatchStateStore>>,
}

impl BatchControllerBuilder {
    pub fn config(mut self, config: MultiFileConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn QueuePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn persistence(mut self, store: Arc<dyn BatchStateStore>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn build(self) -> Result<BatchController> {
        self.config.validate()?;
        let (pause_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(None);

        Ok(BatchController {
            shared: Arc::new(Shared {
                config: self.config,
                runner: self.runner,
                policy: self.policy,
                persistence: self.persistence,
                state: Mutex::new(BatchState::new()),
                events: EventBus::new(),
                pause_tx,
                status_tx,
                persist_lock: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                protocol_violations: AtomicU64::new(0),
            }),
        })
    }
}

/// Handle to one batch context. Cheap to clone; clones share the batch.
#[derive(Clone)]
pub struct BatchController {
    shared: Arc<Shared>,
}

impl BatchController {
    pub fn builder(runner: Arc<dyn StageRunner>) -> BatchControllerBuilder {
        BatchControllerBuilder {
            config: MultiFileConfig::default(),
            runner,
            policy: Arc::new(FifoQueuePolicy),
            persistence: None,
        }
    }

    pub fn new(config: MultiFileConfig, runner: Arc<dyn StageRunner>) -> Result<Self> {
        Self::builder(runner).config(config).build()
    }

    pub fn config(&self) -> &MultiFileConfig {
        &self.shared.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Files
    // ═══════════════════════════════════════════════════════════════════════

    /// Validate and enqueue. A finished batch is discarded first.
    pub fn add_files(&self, files: Vec<FileInput>) -> Result<AddFilesReport> {
        let shared = &self.shared;
        let (report, events) = {
            let mut state = shared.state.lock();
            if state.status().map(|s| s.is_terminal()).unwrap_or(false) {
                if let Some(old) = state.discard() {
                    info!("Discarding finished batch {}", old);
                }
            }

            let report = state.files.add_files(files, &shared.config);
            let mut events = Vec::new();
            for id in &report.accepted {
                events.extend(state.file_event(*id, &shared.config));
            }
            (report, events)
        };

        info!(
            "Added {} files ({} bytes), rejected {}",
            report.accepted.len(),
            report.total_size,
            report.rejected.len()
        );
        shared.publish(events);
        shared.wake.notify_one();
        Ok(report)
    }

    /// Only pending, failed and cancelled records can be removed
    pub fn remove_file(&self, id: Uuid) -> Result<FileRecord> {
        let shared = &self.shared;
        let (removed, events) = {
            let mut state = shared.state.lock();
            let removed = state.files.remove_file(id)?;
            state.sync_current_index();
            (removed, state.batch_event(&shared.config))
        };
        shared.publish(events.into_iter().collect());
        Ok(removed)
    }

    /// Drop every record and the batch. Refused while any record is active;
    /// tasks parked on a paused or between-stage file are cancelled.
    pub fn clear_files(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.files.clear_files()?;
        if let Some(batch_id) = state.discard() {
            info!("Cleared batch {}", batch_id);
        }
        drop(state);

        self.shared.publish_status();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Batch commands
    // ═══════════════════════════════════════════════════════════════════════

    /// Create the idle batch over the current records
    pub async fn initialize_batch(&self) -> Result<Uuid> {
        let shared = &self.shared;
        let (batch_id, events) = {
            let mut state = shared.state.lock();
            if let Some(batch) = state.batch.as_ref() {
                return Err(OrchestratorError::invalid_state(format!(
                    "batch {} is already {}",
                    batch.id, batch.status
                )));
            }
            if state.files.is_empty() {
                return Err(OrchestratorError::invalid_state("no files to process"));
            }

            let batch = Batch::new();
            let batch_id = batch.id;
            state.batch = Some(batch);
            state.files.recompute_queue_positions();
            info!("Initialized batch {} with {} files", batch_id, state.files.len());
            (batch_id, state.batch_event(&shared.config).into_iter().collect())
        };

        shared.settle(events).await;

        if shared.config.auto_start_processing {
            self.start_processing().await?;
        }
        Ok(batch_id)
    }

    /// `add_files` followed by `initialize_batch` when no batch is live
    pub async fn submit(&self, files: Vec<FileInput>) -> Result<(Uuid, AddFilesReport)> {
        let report = self.add_files(files)?;
        let existing = self.shared.state.lock().batch.as_ref().map(|b| b.id);
        let batch_id = match existing {
            Some(id) => id,
            None => self.initialize_batch().await?,
        };
        Ok((batch_id, report))
    }

    pub async fn start_processing(&self) -> Result<()> {
        let shared = &self.shared;
        let status = shared.state.lock().status();
        match status {
            None => {
                return Err(OrchestratorError::invalid_state(
                    "no batch has been initialized",
                ))
            }
            Some(BatchStatus::Paused) => return self.resume_processing().await,
            Some(BatchStatus::Idle) => {}
            Some(other) => {
                return Err(OrchestratorError::invalid_state(format!(
                    "cannot start processing a {} batch",
                    other
                )))
            }
        }

        let events = {
            let mut state = shared.state.lock();
            let batch = state.live_batch()?;
            batch.start()?;
            let batch_id = batch.id;
            shared.pause_tx.send_replace(false);
            shared.spawn_driver(&mut state);
            info!("Started batch {} ({} files)", batch_id, state.files.len());
            state.batch_event(&shared.config).into_iter().collect()
        };

        shared.settle(events).await;
        Ok(())
    }

    /// Stop dequeuing; active files pause at their next checkpoint
    pub async fn pause_processing(&self) -> Result<()> {
        let shared = &self.shared;
        let events = {
            let mut state = shared.state.lock();
            let batch = state.live_batch()?;
            batch.pause()?;
            info!("Paused batch {}", batch.id);
            shared.pause_tx.send_replace(true);
            state.batch_event(&shared.config).into_iter().collect()
        };

        shared.settle(events).await;
        Ok(())
    }

    /// Restore paused files to their exact pre-pause state and continue
    pub async fn resume_processing(&self) -> Result<()> {
        let shared = &self.shared;
        let events = {
            let mut state = shared.state.lock();
            let batch = state.live_batch()?;
            batch.resume()?;
            let batch_id = batch.id;

            let paused: Vec<Uuid> = state
                .files
                .files()
                .iter()
                .filter(|r| r.status == FileStatus::Paused)
                .map(|r| r.id)
                .collect();

            let mut events: Events = state.batch_event(&shared.config).into_iter().collect();
            for id in paused {
                if let Err(e) = state.files.resume_paused(id) {
                    error!("Could not resume file {}: {}", id, e);
                    continue;
                }
                events.extend(state.file_event(id, &shared.config));
            }
            state.sync_current_index();

            shared.pause_tx.send_replace(false);
            shared.spawn_driver(&mut state);
            info!("Resumed batch {}", batch_id);
            events
        };

        shared.wake.notify_one();
        shared.settle(events).await;
        Ok(())
    }

    /// Cancel every non-terminal record and end the batch as `cancelled`.
    /// Repeated calls are no-ops.
    pub async fn stop_processing(&self) -> Result<()> {
        let shared = &self.shared;
        let events = {
            let mut state = shared.state.lock();
            let batch = state.live_batch()?;
            if !batch.cancel() {
                return Ok(());
            }
            let batch_id = batch.id;

            let ids: Vec<(Uuid, FileStatus, bool)> = state
                .files
                .files()
                .iter()
                .map(|r| (r.id, r.status, r.retry_pending))
                .collect();

            let mut events: Events = state.batch_event(&shared.config).into_iter().collect();
            let mut cancelled = 0;
            for (id, status, retry_pending) in ids {
                let result = if !status.is_terminal() {
                    cancelled += 1;
                    state
                        .files
                        .update_status(id, FileStatus::Cancelled)
                        .map(|_| ())
                } else if retry_pending {
                    state.files.cancel_retry(id)
                } else {
                    continue;
                };
                if let Err(e) = result {
                    error!("Could not cancel file {}: {}", id, e);
                }
                events.extend(state.file_event(id, &shared.config));
            }

            state.cancel.cancel();
            state.file_tokens.clear();
            state.driver_active = false;
            shared.pause_tx.send_replace(false);
            info!("Stopped batch {}: {} files cancelled", batch_id, cancelled);
            events
        };

        shared.settle(events).await;
        Ok(())
    }

    /// Stop if needed, then drop the batch, its records and its saved snapshot
    pub async fn reset_batch(&self) -> Result<()> {
        let shared = &self.shared;
        let old = {
            let mut state = shared.state.lock();
            shared.pause_tx.send_replace(false);
            state.discard()
        };
        shared.publish_status();

        let Some(batch_id) = old else {
            return Ok(());
        };
        info!("Reset batch {}", batch_id);

        if let Some(store) = shared.persistence.as_ref() {
            let _guard = shared.persist_lock.lock().await;
            match store.delete(&batch_id.to_string()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Re-enqueue one failed file, reopening a failed batch if needed
    pub async fn retry_file(&self, id: Uuid) -> Result<()> {
        self.retry(Some(id)).await.map(|_| ())
    }

    /// Re-enqueue every failed file; returns the ids scheduled
    pub async fn retry_failed_files(&self) -> Result<Vec<Uuid>> {
        self.retry(None).await
    }

    async fn retry(&self, only: Option<Uuid>) -> Result<Vec<Uuid>> {
        let shared = &self.shared;
        let (ids, events) = {
            let mut state = shared.state.lock();
            let status = state.live_batch()?.status;
            if matches!(status, BatchStatus::Cancelled | BatchStatus::Completed) {
                return Err(OrchestratorError::invalid_state(format!(
                    "cannot retry files of a {} batch",
                    status
                )));
            }

            let ids: Vec<Uuid> = match only {
                Some(id) => {
                    let record = state
                        .files
                        .get(id)
                        .ok_or_else(|| OrchestratorError::FileNotFound(id.to_string()))?;
                    if record.status != FileStatus::Failed || record.retry_pending {
                        return Err(OrchestratorError::invalid_state(format!(
                            "file {} is {}, only failed files can be retried",
                            id, record.status
                        )));
                    }
                    vec![id]
                }
                None => state
                    .files
                    .files()
                    .iter()
                    .filter(|r| r.status == FileStatus::Failed && !r.retry_pending)
                    .map(|r| r.id)
                    .collect(),
            };
            if ids.is_empty() {
                return Ok(ids);
            }

            let mut events = Vec::new();
            for id in &ids {
                state.files.schedule_retry(*id)?;
                events.extend(state.file_event(*id, &shared.config));
            }

            if status == BatchStatus::Failed {
                let batch = state.live_batch()?;
                batch.reopen_for_retry()?;
                info!("Reopened batch {} to retry {} files", batch.id, ids.len());
                events.extend(state.batch_event(&shared.config));
                shared.spawn_driver(&mut state);
            }
            (ids, events)
        };

        shared.wake.notify_one();
        shared.settle(events).await;
        Ok(ids)
    }

    /// Cancel a single file; the rest of the batch continues
    pub async fn cancel_file(&self, id: Uuid) -> Result<()> {
        let shared = &self.shared;
        let events = {
            let mut state = shared.state.lock();
            let record = state
                .files
                .get(id)
                .ok_or_else(|| OrchestratorError::FileNotFound(id.to_string()))?;

            if record.status == FileStatus::Failed && record.retry_pending {
                state.files.cancel_retry(id)?;
            } else if record.status.is_terminal() {
                return Err(OrchestratorError::invalid_state(format!(
                    "file {} is already {}",
                    id, record.status
                )));
            } else {
                if let Some(token) = state.file_tokens.get(&id) {
                    token.cancel();
                }
                state.files.update_status(id, FileStatus::Cancelled)?;
                state.sync_current_index();
            }
            info!("Cancelled file {}", id);
            state.file_event(id, &shared.config).into_iter().collect::<Events>()
        };

        shared.wake.notify_one();
        shared.publish(events);
        Ok(())
    }

    /// Fold an out-of-band `stage_update` into the matching record.
    /// Returns true if anything changed; re-delivery is a no-op.
    pub fn apply_stage_update(&self, update: &FileProcessingUpdate) -> Result<bool> {
        let shared = &self.shared;
        if update.kind != UpdateKind::StageUpdate {
            return Ok(false);
        }
        let (Some(stage), Some(progress)) = (update.stage, update.progress) else {
            return Ok(false);
        };

        let events = {
            let mut state = shared.state.lock();
            if !state.owns(update.batch_id) {
                return Ok(false);
            }

            let record = update
                .file_id
                .and_then(|id| state.files.get(id))
                .or_else(|| {
                    update
                        .backend_id
                        .as_deref()
                        .and_then(|b| state.files.find_by_backend_id(b))
                })
                .ok_or_else(|| {
                    OrchestratorError::FileNotFound(
                        update
                            .file_id
                            .map(|id| id.to_string())
                            .or_else(|| update.backend_id.clone())
                            .unwrap_or_default(),
                    )
                })?;

            if !record.status.is_active() || record.current_step() != stage {
                return Ok(false);
            }
            let file_id = record.id;

            let detail = ProgressDetail {
                message: update.message.clone(),
                ..Default::default()
            };
            match state.files.update_progress(file_id, progress, Some(stage), detail)? {
                ProgressChange::Applied(_) => state
                    .stage_event(file_id, stage, &shared.config)
                    .into_iter()
                    .collect::<Events>(),
                _ => return Ok(false),
            }
        };

        shared.publish(events);
        Ok(true)
    }

    /// Wait for the batch to reach a terminal status
    pub async fn wait_until_finished(&self) -> Option<BatchStatus> {
        let mut rx = self.shared.status_tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                Some(s) if s.is_terminal() => return Some(s),
                None => return None,
                _ => {}
            }
            if rx.changed().await.is_err() {
                return status;
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════════

    pub fn snapshot(&self) -> Result<BatchSnapshot> {
        let state = self.shared.state.lock();
        let batch = state
            .batch
            .clone()
            .ok_or_else(|| OrchestratorError::invalid_state("no batch to snapshot"))?;
        Ok(BatchSnapshot::new(batch, state.files.files().to_vec()))
    }

    /// Replace the (absent or finished) live batch with a snapshot.
    ///
    /// Statuses and progress are kept as saved. A restored `processing`
    /// batch continues immediately; files that were mid-stage restart that
    /// stage from 0. A restored `paused` batch waits for `resume_processing`.
    pub async fn restore(&self, snapshot: BatchSnapshot) -> Result<()> {
        let shared = &self.shared;
        let events = {
            let mut state = shared.state.lock();
            if let Some(batch) = state.batch.as_ref() {
                if !batch.status.is_terminal() {
                    return Err(OrchestratorError::invalid_state(format!(
                        "batch {} is still {}",
                        batch.id, batch.status
                    )));
                }
            }

            state.discard();
            let status = snapshot.batch.status;
            info!(
                "Restoring batch {} ({}, {} files)",
                snapshot.batch.id,
                status,
                snapshot.files.len()
            );
            state.batch = Some(snapshot.batch);
            state.files = FileStore::from_records(snapshot.files);
            shared.pause_tx.send_replace(status == BatchStatus::Paused);
            if status == BatchStatus::Processing {
                shared.spawn_driver(&mut state);
            }
            state.batch_event(&shared.config).into_iter().collect()
        };

        shared.publish(events);
        shared.publish_status();
        Ok(())
    }

    /// Save the live batch to the configured store
    pub async fn save_state(&self) -> Result<()> {
        if self.shared.persistence.is_none() {
            return Err(OrchestratorError::config("no batch state store configured"));
        }
        if !self.shared.save_snapshot().await? {
            return Err(OrchestratorError::invalid_state("no batch to save"));
        }
        Ok(())
    }

    /// Restore a saved batch (the most recent one when `batch_id` is None).
    /// Returns false if nothing was saved.
    pub async fn load_state(&self, batch_id: Option<&str>) -> Result<bool> {
        let store = self
            .shared
            .persistence
            .as_ref()
            .ok_or_else(|| OrchestratorError::config("no batch state store configured"))?;

        let persisted = match batch_id {
            Some(id) => store.load(id).await?,
            None => store.load_latest().await?,
        };
        let Some(persisted) = persisted else {
            return Ok(false);
        };

        self.restore(BatchSnapshot::from_persisted(&persisted)?).await?;
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Subscriptions
    // ═══════════════════════════════════════════════════════════════════════

    pub fn subscribe(&self, subscriber: Arc<dyn UpdateSubscriber>) -> SubscriptionId {
        self.shared.events.subscribe(subscriber)
    }

    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<FileProcessingUpdate>) {
        self.shared.events.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    pub fn batch(&self) -> Option<Batch> {
        self.shared.state.lock().batch.clone()
    }

    pub fn files(&self) -> Vec<FileRecord> {
        self.shared.state.lock().files.files().to_vec()
    }

    pub fn file(&self, id: Uuid) -> Option<FileRecord> {
        self.shared.state.lock().files.get(id).cloned()
    }

    pub fn current_file(&self) -> Option<FileRecord> {
        let state = self.shared.state.lock();
        let index = state.batch.as_ref()?.current_file_index?;
        state.files.files().get(index).cloned()
    }

    /// Records not yet settled
    pub fn remaining_files(&self) -> Vec<FileRecord> {
        self.filter_files(|r| !r.is_settled())
    }

    pub fn completed_files(&self) -> Vec<FileRecord> {
        self.filter_files(|r| r.status == FileStatus::Completed)
    }

    pub fn failed_files(&self) -> Vec<FileRecord> {
        self.filter_files(|r| r.status == FileStatus::Failed)
    }

    pub fn successful_files(&self) -> Vec<FileRecord> {
        self.filter_files(|r| r.is_successful())
    }

    fn filter_files(&self, keep: impl Fn(&FileRecord) -> bool) -> Vec<FileRecord> {
        self.shared
            .state
            .lock()
            .files
            .files()
            .iter()
            .filter(|r| keep(r))
            .cloned()
            .collect()
    }

    pub fn progress(&self) -> BatchProgress {
        let state = self.shared.state.lock();
        aggregate(state.batch.as_ref(), &state.files, &self.shared.config)
    }

    /// Stage runner contract breaches seen so far
    pub fn protocol_violations(&self) -> u64 {
        self.shared.protocol_violations.load(Ordering::Relaxed)
    }
}
