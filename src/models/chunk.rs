//! Per-chunk bookkeeping for an upload session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `upload_chunks`, unique on `(upload_id, chunk_index)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ChunkRecord {
    pub id: i64,
    pub upload_id: String,
    pub chunk_index: i64,

    /// Lowercase sha-256 hex of the stored bytes.
    pub chunk_hash: String,
    pub chunk_size: i64,
    pub completed: bool,

    /// Bumped every time a write replaces an existing row.
    pub retry_count: i64,
    pub status: ChunkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
