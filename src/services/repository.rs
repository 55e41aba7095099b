//! SQLite persistence for upload sessions, chunk records and file codes.

use crate::models::{
    chunk::{ChunkRecord, ChunkStatus},
    file_code::{FileCode, NewFileCode},
    upload_session::{SessionStatus, UploadSession},
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

const SESSION_COLUMNS: &str = "id, upload_id, file_name, file_size, chunk_size, total_chunks, \
     file_hash, status, user_id, created_at, updated_at";

const CHUNK_COLUMNS: &str = "id, upload_id, chunk_index, chunk_hash, chunk_size, completed, \
     retry_count, status, created_at, updated_at";

const FILE_CODE_COLUMNS: &str = "id, code, prefix, suffix, uuid_file_name, file_path, size, \
     file_hash, is_chunked, upload_id, expired_at, expired_count, used_count, user_id, created_at";

/// Values for a new `upload_sessions` row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub file_hash: String,
    pub user_id: Option<i64>,
}

#[derive(Clone)]
pub struct UploadRepository {
    db: Arc<SqlitePool>,
}

impl UploadRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    // --- sessions ---

    pub async fn create_session(&self, new: &NewSession) -> sqlx::Result<UploadSession> {
        let now = Utc::now();
        sqlx::query_as::<_, UploadSession>(&format!(
            "INSERT INTO upload_sessions (
                upload_id, file_name, file_size, chunk_size, total_chunks,
                file_hash, status, user_id, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(&new.upload_id)
        .bind(&new.file_name)
        .bind(new.file_size)
        .bind(new.chunk_size)
        .bind(new.total_chunks)
        .bind(&new.file_hash)
        .bind(SessionStatus::Pending)
        .bind(new.user_id)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await
    }

    pub async fn find_session(&self, upload_id: &str) -> sqlx::Result<Option<UploadSession>> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE upload_id = ?",
            SESSION_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Most recent unfinished session for the same content.
    pub async fn find_resumable(
        &self,
        file_hash: &str,
        file_size: i64,
    ) -> sqlx::Result<Option<UploadSession>> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions
             WHERE file_hash = ? AND file_size = ? AND status != ?
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            SESSION_COLUMNS
        ))
        .bind(file_hash)
        .bind(file_size)
        .bind(SessionStatus::Completed)
        .fetch_optional(&*self.db)
        .await
    }

    pub async fn set_session_status(
        &self,
        upload_id: &str,
        status: SessionStatus,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE upload_sessions SET status = ?, updated_at = ? WHERE upload_id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Remove a session together with its chunk rows. Returns whether a session existed.
    pub async fn delete_session(&self, upload_id: &str) -> sqlx::Result<bool> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed.rows_affected() > 0)
    }

    /// Forget every chunk of a session and move it to `status`.
    pub async fn reset_chunks(&self, upload_id: &str, status: SessionStatus) -> sqlx::Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE upload_sessions SET status = ?, updated_at = ? WHERE upload_id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    /// Unfinished sessions created before `cutoff`.
    pub async fn stale_sessions(&self, cutoff: DateTime<Utc>) -> sqlx::Result<Vec<UploadSession>> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE status != ? AND created_at < ?",
            SESSION_COLUMNS
        ))
        .bind(SessionStatus::Completed)
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await
    }

    // --- chunks ---

    pub async fn find_chunk(
        &self,
        upload_id: &str,
        chunk_index: i64,
    ) -> sqlx::Result<Option<ChunkRecord>> {
        sqlx::query_as::<_, ChunkRecord>(&format!(
            "SELECT {} FROM upload_chunks WHERE upload_id = ? AND chunk_index = ?",
            CHUNK_COLUMNS
        ))
        .bind(upload_id)
        .bind(chunk_index)
        .fetch_optional(&*self.db)
        .await
    }

    /// Record a stored chunk; a repeated write replaces the row and bumps `retry_count`.
    pub async fn upsert_chunk(
        &self,
        upload_id: &str,
        chunk_index: i64,
        chunk_hash: &str,
        chunk_size: i64,
    ) -> sqlx::Result<ChunkRecord> {
        let now = Utc::now();
        sqlx::query_as::<_, ChunkRecord>(&format!(
            "INSERT INTO upload_chunks (
                upload_id, chunk_index, chunk_hash, chunk_size, completed,
                retry_count, status, created_at, updated_at
             ) VALUES (?, ?, ?, ?, 1, 0, ?, ?, ?)
             ON CONFLICT(upload_id, chunk_index) DO UPDATE SET
                chunk_hash = excluded.chunk_hash,
                chunk_size = excluded.chunk_size,
                completed = 1,
                status = excluded.status,
                retry_count = upload_chunks.retry_count + 1,
                updated_at = excluded.updated_at
             RETURNING {}",
            CHUNK_COLUMNS
        ))
        .bind(upload_id)
        .bind(chunk_index)
        .bind(chunk_hash)
        .bind(chunk_size)
        .bind(ChunkStatus::Completed)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await
    }

    /// Indices of completed chunks, ascending.
    pub async fn completed_indices(&self, upload_id: &str) -> sqlx::Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT chunk_index FROM upload_chunks
             WHERE upload_id = ? AND completed = 1
             ORDER BY chunk_index",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await
    }

    pub async fn count_completed(&self, upload_id: &str) -> sqlx::Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM upload_chunks WHERE upload_id = ? AND completed = 1",
        )
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
    }

    // --- file codes ---

    pub async fn find_by_code(&self, code: &str) -> sqlx::Result<Option<FileCode>> {
        sqlx::query_as::<_, FileCode>(&format!(
            "SELECT {} FROM file_codes WHERE code = ?",
            FILE_CODE_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&*self.db)
        .await
    }

    /// A live file with identical content, if one exists.
    pub async fn find_duplicate(
        &self,
        file_hash: &str,
        size: i64,
        now: DateTime<Utc>,
    ) -> sqlx::Result<Option<FileCode>> {
        sqlx::query_as::<_, FileCode>(&format!(
            "SELECT {} FROM file_codes
             WHERE file_hash = ? AND size = ?
               AND (expired_at IS NULL OR expired_at >= ?)
               AND expired_count != 0
             ORDER BY id DESC
             LIMIT 1",
            FILE_CODE_COLUMNS
        ))
        .bind(file_hash)
        .bind(size)
        .bind(now)
        .fetch_optional(&*self.db)
        .await
    }

    pub async fn insert_file_code(&self, new: &NewFileCode) -> sqlx::Result<FileCode> {
        let mut conn = self.db.acquire().await?;
        insert_file_code(&mut conn, new).await
    }

    /// Finish an upload atomically: create its file code, mark the session
    /// completed and drop the chunk rows. Fails with `RowNotFound`, writing
    /// nothing, when the session no longer exists.
    pub async fn commit_completion(
        &self,
        upload_id: &str,
        new: &NewFileCode,
    ) -> sqlx::Result<FileCode> {
        let mut tx = self.db.begin().await?;
        let file_code = insert_file_code(&mut tx, new).await?;
        let updated =
            sqlx::query("UPDATE upload_sessions SET status = ?, updated_at = ? WHERE upload_id = ?")
                .bind(SessionStatus::Completed)
                .bind(Utc::now())
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;
        if updated.rows_affected() != 1 {
            // dropping the transaction rolls back the file code
            return Err(sqlx::Error::RowNotFound);
        }
        sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(file_code)
    }

    /// Count one download against the file's allowance.
    pub async fn record_download(&self, id: i64) -> sqlx::Result<FileCode> {
        sqlx::query_as::<_, FileCode>(&format!(
            "UPDATE file_codes SET
                used_count = used_count + 1,
                expired_count = CASE WHEN expired_count > 0 THEN expired_count - 1 ELSE expired_count END
             WHERE id = ?
             RETURNING {}",
            FILE_CODE_COLUMNS
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
    }

    /// Files whose deadline passed or whose allowance is used up.
    pub async fn expired_file_codes(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<FileCode>> {
        sqlx::query_as::<_, FileCode>(&format!(
            "SELECT {} FROM file_codes
             WHERE (expired_at IS NOT NULL AND expired_at < ?) OR expired_count = 0",
            FILE_CODE_COLUMNS
        ))
        .bind(now)
        .fetch_all(&*self.db)
        .await
    }

    pub async fn delete_file_code(&self, id: i64) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM file_codes WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

async fn insert_file_code(
    conn: &mut sqlx::SqliteConnection,
    new: &NewFileCode,
) -> sqlx::Result<FileCode> {
    sqlx::query_as::<_, FileCode>(&format!(
        "INSERT INTO file_codes (
            code, prefix, suffix, uuid_file_name, file_path, size, file_hash,
            is_chunked, upload_id, expired_at, expired_count, used_count, user_id, created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
         RETURNING {}",
        FILE_CODE_COLUMNS
    ))
    .bind(&new.code)
    .bind(&new.prefix)
    .bind(&new.suffix)
    .bind(&new.uuid_file_name)
    .bind(&new.file_path)
    .bind(new.size)
    .bind(&new.file_hash)
    .bind(new.is_chunked)
    .bind(&new.upload_id)
    .bind(new.expire.expired_at)
    .bind(new.expire.expired_count)
    .bind(new.user_id)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await
}

/// Return true if SQLx error indicates a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
