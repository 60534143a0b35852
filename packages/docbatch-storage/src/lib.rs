//! Batch state persistence for docbatch
//!
//! Stores serialized batch snapshots so a batch can be restored after a
//! process restart. The orchestration crate owns the payload format; this
//! crate only keys it by batch id and keeps the latest copy.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docbatch_storage::{BatchStateStore, PersistedBatch, SqliteBatchStateStore};
//!
//! let store = SqliteBatchStateStore::open("docbatch.db")?;
//! store.save(&PersistedBatch::new(batch_id, "processing", payload)).await?;
//!
//! // after restart
//! if let Some(saved) = store.load_latest().await? {
//!     // hand saved.payload back to the controller
//! }
//! ```

pub mod domain;
pub mod error;

#[cfg(feature = "sqlite")]
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{BatchStateStore, BatchSummary, InMemoryBatchStateStore, PersistedBatch};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteBatchStateStore;
