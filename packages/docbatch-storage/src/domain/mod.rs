//! Domain layer for batch state persistence
//!
//! # Domain Models
//!
//! - `PersistedBatch`: one saved batch snapshot (opaque JSON payload plus
//!   the columns needed to find it again)
//! - `BatchSummary`: listing row without the payload
//!
//! # Port Trait
//!
//! - `BatchStateStore`: primary storage abstraction
//!
//! The payload is produced and interpreted by the orchestration crate; this
//! layer never looks inside it. Saving a batch id that already exists
//! replaces the previous snapshot (last write wins).
//!
//! # Examples
//!
//! ```rust,ignore
//! use docbatch_storage::{BatchStateStore, PersistedBatch};
//!
//! async fn example(store: impl BatchStateStore) -> Result<()> {
//!     let record = PersistedBatch::new("b-1", "processing", serde_json::json!({"version": 1}));
//!     store.save(&record).await?;
//!
//!     let latest = store.load_latest().await?;
//!     assert_eq!(latest.unwrap().batch_id, "b-1");
//!     Ok(())
//! }
//! ```

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

pub use memory::InMemoryBatchStateStore;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// Saved batch snapshot
///
/// # Examples
///
/// ```rust
/// use docbatch_storage::domain::PersistedBatch;
///
/// let record = PersistedBatch::new("b-1", "idle", serde_json::json!({}));
/// assert_eq!(record.batch_id, "b-1");
/// assert_eq!(record.status, "idle");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedBatch {
    /// Batch identifier
    pub batch_id: String,
    /// Batch status at save time (denormalized for listing)
    pub status: String,
    /// Save timestamp
    pub saved_at: DateTime<Utc>,
    /// Serialized batch + file records
    pub payload: serde_json::Value,
}

impl PersistedBatch {
    pub fn new(
        batch_id: impl Into<String>,
        status: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            status: status.into(),
            saved_at: Utc::now(),
            payload,
        }
    }

    /// Summary row for listings
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            batch_id: self.batch_id.clone(),
            status: self.status.clone(),
            saved_at: self.saved_at,
        }
    }
}

/// Listing row (no payload)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub status: String,
    pub saved_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Batch state persistence port
///
/// # Implementations
///
/// - `InMemoryBatchStateStore`: process-local, for tests and ephemeral runs
/// - `SqliteBatchStateStore`: durable, survives restarts (feature `sqlite`)
#[async_trait]
pub trait BatchStateStore: Send + Sync {
    /// Save (or replace) the snapshot for `record.batch_id`
    async fn save(&self, record: &PersistedBatch) -> Result<()>;

    /// Load the snapshot for a batch
    ///
    /// Returns `Ok(None)` when nothing was saved for this id.
    async fn load(&self, batch_id: &str) -> Result<Option<PersistedBatch>>;

    /// Load the most recently saved snapshot
    async fn load_latest(&self) -> Result<Option<PersistedBatch>>;

    /// Delete the snapshot for a batch
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::BatchNotFound` if nothing was saved for this id.
    async fn delete(&self, batch_id: &str) -> Result<()>;

    /// List saved batches, newest first
    async fn list(&self) -> Result<Vec<BatchSummary>>;
}
