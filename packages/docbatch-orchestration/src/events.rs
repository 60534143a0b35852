//! Notification hub
//!
//! The controller publishes one `FileProcessingUpdate` per meaningful
//! transition. Subscribers are kept in subscription order and called in that
//! order; `unsubscribe` removes one explicitly.
//!
//! Delivery is at-least-once and events from concurrently running files may
//! interleave, so consumers should fold updates through an `UpdateReducer`
//! (or the equivalent rules) rather than trusting arrival order.

use crate::batch::BatchStatus;
use crate::file::{FileRecord, FileStatus, Stage};
use crate::progress::BatchProgress;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    BatchUpdate,
    FileUpdate,
    StageUpdate,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::BatchUpdate => "batch_update",
            UpdateKind::FileUpdate => "file_update",
            UpdateKind::StageUpdate => "stage_update",
        }
    }
}

/// One notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProcessingUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// Monotonic per controller
    pub sequence: u64,
    pub batch_id: Uuid,
    pub file_id: Option<Uuid>,
    pub backend_id: Option<String>,
    pub file_name: Option<String>,
    pub queue_position: Option<usize>,
    pub file_status: Option<FileStatus>,
    pub batch_status: Option<BatchStatus>,
    pub progress: Option<f64>,
    pub stage: Option<Stage>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub overall_progress: f64,
    pub completed_files: usize,
    pub total_files: usize,
    pub estimated_time_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl FileProcessingUpdate {
    fn empty(kind: UpdateKind, batch_id: Uuid) -> Self {
        Self {
            kind,
            sequence: 0,
            batch_id,
            file_id: None,
            backend_id: None,
            file_name: None,
            queue_position: None,
            file_status: None,
            batch_status: None,
            progress: None,
            stage: None,
            message: None,
            error: None,
            overall_progress: 0.0,
            completed_files: 0,
            total_files: 0,
            estimated_time_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn batch_update(batch_id: Uuid, status: BatchStatus) -> Self {
        Self {
            batch_status: Some(status),
            ..Self::empty(UpdateKind::BatchUpdate, batch_id)
        }
    }

    fn for_record(kind: UpdateKind, batch_id: Uuid, record: &FileRecord) -> Self {
        Self {
            file_id: Some(record.id),
            backend_id: record.backend_id.clone(),
            file_name: Some(record.display_name.clone()),
            queue_position: record.queue_position,
            file_status: Some(record.status),
            progress: Some(record.progress),
            message: record.current_message.clone(),
            error: record.last_error.as_ref().map(|e| e.message.clone()),
            ..Self::empty(kind, batch_id)
        }
    }

    pub fn file_update(batch_id: Uuid, record: &FileRecord) -> Self {
        Self {
            stage: record.current_stage,
            ..Self::for_record(UpdateKind::FileUpdate, batch_id, record)
        }
    }

    pub fn stage_update(batch_id: Uuid, record: &FileRecord, stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::for_record(UpdateKind::StageUpdate, batch_id, record)
        }
    }

    /// Fill batch-level fields from the aggregator
    pub fn with_progress(mut self, progress: &BatchProgress) -> Self {
        if self.batch_status.is_none() {
            self.batch_status = Some(progress.status);
        }
        self.overall_progress = progress.overall_progress;
        self.completed_files = progress.completed_files;
        self.total_files = progress.total_files;
        self.estimated_time_ms = progress.estimated_time_remaining_ms;
        self
    }
}

pub trait UpdateSubscriber: Send + Sync {
    fn on_update(&self, update: &FileProcessingUpdate);
}

impl<F> UpdateSubscriber for F
where
    F: Fn(&FileProcessingUpdate) + Send + Sync,
{
    fn on_update(&self, update: &FileProcessingUpdate) {
        self(update)
    }
}

/// Forwards updates into an unbounded channel
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<FileProcessingUpdate>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FileProcessingUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UpdateSubscriber for ChannelSubscriber {
    fn on_update(&self, update: &FileProcessingUpdate) {
        // receiver gone: nothing to deliver to
        let _ = self.tx.send(update.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Ordered subscriber list
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn UpdateSubscriber>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn UpdateSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, subscriber));
        id
    }

    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<FileProcessingUpdate>) {
        let (subscriber, rx) = ChannelSubscriber::new();
        (self.subscribe(Arc::new(subscriber)), rx)
    }

    /// Returns false if the id was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver to every subscriber, in subscription order
    pub fn publish(&self, update: &FileProcessingUpdate) {
        let subscribers: Vec<_> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();

        for subscriber in subscribers {
            subscriber.on_update(update);
        }
    }
}

/// Per-file view kept by `UpdateReducer`
#[derive(Debug, Clone, PartialEq)]
pub struct FileView {
    pub status: Option<FileStatus>,
    pub stage: Option<Stage>,
    pub progress: f64,
    status_sequence: u64,
}

/// Subscriber-side folding of possibly duplicated or reordered updates
///
/// Progress: highest value within the furthest stage seen wins. Status and
/// batch status: the update with the highest sequence wins. Re-applying an
/// update already folded in changes nothing.
#[derive(Debug, Clone, Default)]
pub struct UpdateReducer {
    files: HashMap<Uuid, FileView>,
    batch_status: Option<(u64, BatchStatus)>,
    overall_progress: f64,
}

impl UpdateReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, id: Uuid) -> Option<&FileView> {
        self.files.get(&id)
    }

    pub fn batch_status(&self) -> Option<BatchStatus> {
        self.batch_status.map(|(_, s)| s)
    }

    pub fn overall_progress(&self) -> f64 {
        self.overall_progress
    }

    /// Fold one update in; returns true if the view changed
    pub fn apply(&mut self, update: &FileProcessingUpdate) -> bool {
        let mut changed = false;

        if let Some(status) = update.batch_status {
            let newer = self
                .batch_status
                .map(|(seq, _)| update.sequence > seq)
                .unwrap_or(true);
            if newer && self.batch_status.map(|(_, s)| s) != Some(status) {
                changed = true;
            }
            if newer {
                self.batch_status = Some((update.sequence, status));
            }
        }

        if update.overall_progress > self.overall_progress {
            self.overall_progress = update.overall_progress;
            changed = true;
        }

        let Some(file_id) = update.file_id else {
            return changed;
        };

        let view = self.files.entry(file_id).or_insert_with(|| {
            changed = true;
            FileView {
                status: None,
                stage: None,
                progress: 0.0,
                status_sequence: 0,
            }
        });

        if let Some(status) = update.file_status {
            if view.status.is_none() || update.sequence > view.status_sequence {
                if view.status != Some(status) {
                    changed = true;
                }
                view.status = Some(status);
                view.status_sequence = update.sequence;
            }
        }

        if let Some(progress) = update.progress {
            let stage = update.stage;
            if stage > view.stage {
                view.stage = stage;
                view.progress = progress;
                changed = true;
            } else if stage == view.stage && progress > view.progress {
                view.progress = progress;
                changed = true;
            }
        }

        changed
    }
}
