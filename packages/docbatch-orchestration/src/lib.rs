/*
 * Docbatch Orchestration - Multi-File Document Processing Queue
 *
 * Client-side batch queue that drives files through a fixed stage pipeline.
 *
 * Architecture:
 * - FileRecord Store (single source of truth per batch)
 * - Batch Controller (start / pause / resume / stop, retry)
 * - Stage Runner port (upload, vision, extraction, conversion)
 * - Queue Policy (FIFO by default)
 * - Progress Aggregator + update notifications
 * - Snapshot persistence (docbatch-storage)
 */

// Public modules
pub mod batch;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod file;
pub mod policy;
pub mod progress;
pub mod runner;
pub mod snapshot;
pub mod stages;
pub mod store;
pub mod validation;

// Re-exports
pub use batch::{Batch, BatchStatus};
pub use config::{MultiFileConfig, MB};
pub use controller::{BatchController, BatchControllerBuilder};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use events::{
    ChannelSubscriber, EventBus, FileProcessingUpdate, FileView, SubscriptionId, UpdateKind,
    UpdateReducer, UpdateSubscriber,
};
pub use file::{
    FileError, FileInput, FileRecord, FileStatus, FileTiming, PageProgress, PauseSnapshot, Stage,
    StageResult,
};
pub use policy::{FifoQueuePolicy, QueuePolicy, RetryDecision};
pub use progress::{aggregate, BatchProgress, QueueControls};
pub use runner::{
    CollectingSink, Interrupted, ProgressReporter, ProgressSink, ProgressUpdate,
    ProtocolViolation, StageOutcome, StageRequest, StageRunner,
};
pub use snapshot::{BatchSnapshot, SNAPSHOT_VERSION};
pub use stages::{FailureRule, SimulatedStageRunner, StageCall};
pub use store::{AddFilesReport, FileStore, ProgressChange, ProgressDetail};
pub use validation::{validate_files, BatchValidationResult, InvalidFile, RejectionReason};
