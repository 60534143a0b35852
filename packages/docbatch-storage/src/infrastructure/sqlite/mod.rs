//! SQLite adapter for BatchStateStore
//!
//! One row per batch; saving the same batch id replaces the row. The payload
//! column holds the JSON snapshot as text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::domain::{BatchStateStore, BatchSummary, PersistedBatch};
use crate::{Result, StorageError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS batch_state (
    batch_id TEXT PRIMARY KEY,
    status   TEXT NOT NULL,
    saved_at TEXT NOT NULL,
    payload  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_batch_state_saved_at ON batch_state(saved_at);
";

pub struct SqliteBatchStateStore {
    conn: Mutex<Connection>,
}

impl SqliteBatchStateStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(
        batch_id: String,
        status: String,
        saved_at: DateTime<Utc>,
        payload: String,
    ) -> Result<PersistedBatch> {
        Ok(PersistedBatch {
            batch_id,
            status,
            saved_at,
            payload: serde_json::from_str(&payload)?,
        })
    }
}

#[async_trait]
impl BatchStateStore for SqliteBatchStateStore {
    async fn save(&self, record: &PersistedBatch) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO batch_state (batch_id, status, saved_at, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![record.batch_id, record.status, record.saved_at, payload],
        )?;
        Ok(())
    }

    async fn load(&self, batch_id: &str) -> Result<Option<PersistedBatch>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT batch_id, status, saved_at, payload FROM batch_state WHERE batch_id = ?1",
                params![batch_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, DateTime<Utc>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?
        };

        row.map(|(id, status, saved_at, payload)| {
            Self::row_to_record(id, status, saved_at, payload)
        })
        .transpose()
    }

    async fn load_latest(&self) -> Result<Option<PersistedBatch>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT batch_id, status, saved_at, payload FROM batch_state
                 ORDER BY saved_at DESC, rowid DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, DateTime<Utc>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?
        };

        row.map(|(id, status, saved_at, payload)| {
            Self::row_to_record(id, status, saved_at, payload)
        })
        .transpose()
    }

    async fn delete(&self, batch_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM batch_state WHERE batch_id = ?1",
            params![batch_id],
        )?;

        if deleted == 0 {
            return Err(StorageError::batch_not_found(batch_id));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BatchSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT batch_id, status, saved_at FROM batch_state
             ORDER BY saved_at DESC, rowid DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(BatchSummary {
                batch_id: row.get(0)?,
                status: row.get(1)?,
                saved_at: row.get(2)?,
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }
}
