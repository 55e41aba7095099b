//! A single resumable upload attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Lifecycle of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `upload_sessions`.
///
/// Everything except `status` and `updated_at` is fixed at creation time.
/// `(file_hash, file_size)` is the key used to resume an interrupted upload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    pub id: i64,

    /// Opaque identifier handed to the client (uuid v4).
    pub upload_id: String,

    pub file_name: String,

    pub file_size: i64,

    pub chunk_size: i64,

    /// `ceil(file_size / chunk_size)`.
    pub total_chunks: i64,

    /// Lowercase sha-256 hex of the whole file.
    pub file_hash: String,

    pub status: SessionStatus,

    pub user_id: Option<i64>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// Number of bytes chunk `index` must carry; the last chunk takes the remainder.
    pub fn expected_chunk_len(&self, index: i64) -> i64 {
        if index == self.total_chunks - 1 {
            self.file_size - self.chunk_size * index
        } else {
            self.chunk_size
        }
    }

    /// Byte offset a client can continue from after `uploaded` chunks.
    pub fn resume_position(&self, uploaded: usize) -> i64 {
        (uploaded as i64 * self.chunk_size).min(self.file_size)
    }

    /// Completion percentage in `0.0..=100.0`, rounded to two decimals.
    pub fn progress(&self, uploaded: usize) -> f64 {
        if self.total_chunks <= 0 {
            return 0.0;
        }
        let pct = uploaded as f64 / self.total_chunks as f64 * 100.0;
        (pct * 100.0).round() / 100.0
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// `ceil(file_size / chunk_size)` for positive inputs.
pub fn total_chunks(file_size: i64, chunk_size: i64) -> i64 {
    (file_size + chunk_size - 1) / chunk_size
}
