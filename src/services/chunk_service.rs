//! Resumable chunked uploads.
//!
//! Lifecycle of an upload:
//! - **init** deduplicates against live files, resumes an unfinished session
//!   for the same content, or opens a new session.
//! - **upload_chunk** stores one chunk; repeating a chunk is a no-op.
//! - **complete** merges the chunks in index order, creates the file code and
//!   removes the chunk data.
//! - **cancel** drops the session and its chunks.
//!
//! Locking through [`KeyedLocks`]: chunk writes share `upload:{id}` and are
//! serialised per `(upload_id, index)`; complete and cancel hold `upload:{id}`
//! exclusively, so neither runs while a chunk write is in flight.

use super::{
    locks::KeyedLocks,
    repository::{NewSession, UploadRepository, is_unique_violation},
};
use crate::{
    config::TransferConfig,
    models::{
        file_code::{ExpirePolicy, FileCode, InvalidExpiry, NewFileCode, generate_code, split_file_name},
        upload_session::{SessionStatus, UploadSession, total_chunks},
    },
    storage::{StorageError, service::ConcreteStorageService},
};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file size {size} exceeds the limit of {limit} bytes")]
    SizeLimitExceeded { size: i64, limit: i64 },
    #[error("chunk index {index} out of range (0..{total})")]
    InvalidChunkIndex { index: i64, total: i64 },
    #[error("chunk {index} must be {expected} bytes, got {actual}")]
    InvalidChunkSize {
        index: i64,
        expected: i64,
        actual: i64,
    },
    #[error("`{0}` is not a sha-256 hex digest")]
    InvalidHash(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("upload session `{0}` not found")]
    SessionNotFound(String),
    #[error("file `{0}` not found")]
    FileNotFound(String),
    #[error("upload incomplete: {uploaded} of {total} chunks received")]
    UploadIncomplete { uploaded: i64, total: i64 },
    #[error("upload `{0}` is already completed")]
    AlreadyCompleted(String),
    #[error(
        "merged file ({actual_size} bytes, sha-256 {actual_hash}) does not match the declared \
         {expected_size} bytes, sha-256 {expected_hash}"
    )]
    ContentMismatch {
        expected_size: i64,
        actual_size: i64,
        expected_hash: String,
        actual_hash: String,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl From<InvalidExpiry> for UploadError {
    fn from(err: InvalidExpiry) -> Self {
        UploadError::InvalidRequest(err.to_string())
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Lowercased hash, or `InvalidHash` unless it is 64 hex digits.
pub fn normalize_hash(hash: &str) -> UploadResult<String> {
    let hash = hash.trim();
    if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(hash.to_ascii_lowercase())
    } else {
        Err(UploadError::InvalidHash(hash.to_string()))
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Debug, Clone)]
pub struct InitRequest {
    pub file_name: String,
    pub file_size: i64,
    pub chunk_size: i64,
    pub file_hash: String,
    /// Largest file this caller may upload.
    pub size_limit: i64,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    /// Identical content is already shared under `code`.
    pub existed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "uploadID", skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub uploaded_chunks: Vec<i64>,
    pub resume_position: i64,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    #[serde(rename = "uploadID")]
    pub upload_id: String,
    pub file_name: String,
    pub file_size: i64,
    /// `uploading`, `completed` or `failed`.
    pub status: String,
    pub progress: f64,
    pub total_chunks: i64,
    pub uploaded_count: usize,
    pub uploaded_chunks: Vec<i64>,
    pub missing_chunks: Vec<i64>,
    pub resume_position: i64,
}

pub struct ChunkUploadService {
    repo: UploadRepository,
    storage: Arc<ConcreteStorageService>,
    transfer: TransferConfig,
    locks: KeyedLocks,
}

fn upload_key(upload_id: &str) -> String {
    format!("upload:{}", upload_id)
}

impl ChunkUploadService {
    pub fn new(
        repo: UploadRepository,
        storage: Arc<ConcreteStorageService>,
        transfer: TransferConfig,
    ) -> Self {
        Self {
            repo,
            storage,
            transfer,
            locks: KeyedLocks::new(),
        }
    }

    async fn session(&self, upload_id: &str) -> UploadResult<UploadSession> {
        self.repo
            .find_session(upload_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(upload_id.to_string()))
    }

    pub async fn init(&self, req: InitRequest) -> UploadResult<InitResponse> {
        let file_name = req.file_name.trim();
        if file_name.is_empty() {
            return Err(UploadError::InvalidRequest("file name is required".into()));
        }
        if req.file_size <= 0 {
            return Err(UploadError::InvalidRequest("file size must be positive".into()));
        }
        if req.chunk_size <= 0 || req.chunk_size > self.transfer.max_chunk_size {
            return Err(UploadError::InvalidRequest(format!(
                "chunk size must be between 1 and {} bytes",
                self.transfer.max_chunk_size
            )));
        }
        let file_hash = normalize_hash(&req.file_hash)?;
        if req.file_size > req.size_limit {
            return Err(UploadError::SizeLimitExceeded {
                size: req.file_size,
                limit: req.size_limit,
            });
        }

        // one init at a time per content, so concurrent inits share a session
        let _guard = self
            .locks
            .lock(format!("init:{}:{}", file_hash, req.file_size))
            .await;

        if let Some(existing) = self
            .repo
            .find_duplicate(&file_hash, req.file_size, Utc::now())
            .await?
        {
            info!(code = %existing.code, "upload deduplicated against existing file");
            return Ok(InitResponse {
                existed: true,
                code: Some(existing.code),
                upload_id: None,
                chunk_size: req.chunk_size,
                total_chunks: total_chunks(req.file_size, req.chunk_size),
                uploaded_chunks: Vec::new(),
                resume_position: req.file_size,
                progress: 100.0,
            });
        }

        let session = match self.repo.find_resumable(&file_hash, req.file_size).await? {
            Some(session) => {
                info!(upload_id = %session.upload_id, "resuming upload session");
                session
            }
            None => {
                let session = self
                    .repo
                    .create_session(&NewSession {
                        upload_id: Uuid::new_v4().to_string(),
                        file_name: file_name.to_string(),
                        file_size: req.file_size,
                        chunk_size: req.chunk_size,
                        total_chunks: total_chunks(req.file_size, req.chunk_size),
                        file_hash,
                        user_id: req.user_id,
                    })
                    .await?;
                info!(
                    upload_id = %session.upload_id,
                    file_size = session.file_size,
                    total_chunks = session.total_chunks,
                    "upload session created"
                );
                session
            }
        };

        let uploaded = self.repo.completed_indices(&session.upload_id).await?;
        Ok(InitResponse {
            existed: false,
            code: None,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            resume_position: session.resume_position(uploaded.len()),
            progress: session.progress(uploaded.len()),
            uploaded_chunks: uploaded,
            upload_id: Some(session.upload_id),
        })
    }

    /// Store chunk `index`, returning its sha-256. Re-sending a stored chunk
    /// returns the recorded hash without writing again.
    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        index: i64,
        data: Bytes,
    ) -> UploadResult<String> {
        let _upload = self.locks.lock_shared(upload_key(upload_id)).await;
        let session = self.session(upload_id).await?;
        if session.is_completed() {
            return Err(UploadError::AlreadyCompleted(upload_id.to_string()));
        }
        if index < 0 || index >= session.total_chunks {
            return Err(UploadError::InvalidChunkIndex {
                index,
                total: session.total_chunks,
            });
        }

        let _guard = self.locks.lock(format!("chunk:{}:{}", upload_id, index)).await;

        if let Some(existing) = self.repo.find_chunk(upload_id, index).await? {
            if existing.completed {
                return Ok(existing.chunk_hash);
            }
        }

        let expected = session.expected_chunk_len(index);
        if data.len() as i64 != expected {
            return Err(UploadError::InvalidChunkSize {
                index,
                expected,
                actual: data.len() as i64,
            });
        }

        let chunk_hash = sha256_hex(&data);
        let chunk_size = data.len() as i64;
        self.storage
            .save_chunk_with_result(upload_id, index, data, &chunk_hash)
            .await?;
        let record = self
            .repo
            .upsert_chunk(upload_id, index, &chunk_hash, chunk_size)
            .await?;
        debug!(upload_id, index, size = chunk_size, status = %record.status, "chunk stored");
        if session.status != SessionStatus::Uploading {
            self.repo
                .set_session_status(upload_id, SessionStatus::Uploading)
                .await?;
        }

        Ok(chunk_hash)
    }

    pub async fn status(&self, upload_id: &str) -> UploadResult<UploadStatus> {
        let session = self.session(upload_id).await?;

        let uploaded = if session.is_completed() {
            (0..session.total_chunks).collect()
        } else {
            self.repo.completed_indices(upload_id).await?
        };
        let missing: Vec<i64> = (0..session.total_chunks)
            .filter(|i| uploaded.binary_search(i).is_err())
            .collect();

        let status = match session.status {
            SessionStatus::Completed | SessionStatus::Failed => session.status,
            _ if missing.is_empty() => SessionStatus::Completed,
            _ => SessionStatus::Uploading,
        };

        Ok(UploadStatus {
            upload_id: session.upload_id.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            status: status.as_str().to_string(),
            progress: session.progress(uploaded.len()),
            total_chunks: session.total_chunks,
            uploaded_count: uploaded.len(),
            resume_position: session.resume_position(uploaded.len()),
            missing_chunks: missing,
            uploaded_chunks: uploaded,
        })
    }

    /// Whether chunk `index` is stored with `expected_hash`. A missing chunk is `false`.
    pub async fn verify_chunk(
        &self,
        upload_id: &str,
        index: i64,
        expected_hash: &str,
    ) -> UploadResult<bool> {
        self.session(upload_id).await?;
        Ok(match self.repo.find_chunk(upload_id, index).await? {
            Some(chunk) if chunk.completed => chunk
                .chunk_hash
                .eq_ignore_ascii_case(expected_hash.trim()),
            _ => false,
        })
    }

    /// Merge all chunks into the final file and publish it under a new code.
    pub async fn complete(
        &self,
        upload_id: &str,
        expire_value: i64,
        expire_style: &str,
        user_id: Option<i64>,
    ) -> UploadResult<FileCode> {
        let _guard = self.locks.lock(upload_key(upload_id)).await;

        let session = self.session(upload_id).await?;
        if session.is_completed() {
            return Err(UploadError::AlreadyCompleted(upload_id.to_string()));
        }
        let expire = ExpirePolicy::parse(expire_value, expire_style, Utc::now())?;

        let uploaded = self.repo.count_completed(upload_id).await?;
        if uploaded != session.total_chunks {
            return Err(UploadError::UploadIncomplete {
                uploaded,
                total: session.total_chunks,
            });
        }

        let paths = self.storage.paths();
        let blob_name = paths.content_file_name(&session.file_hash, upload_id, &session.file_name);
        let dest = paths.date_based_path(&blob_name, Utc::now());

        let merged = match self
            .storage
            .merge_chunks_with_result(upload_id, session.total_chunks, &dest)
            .await
        {
            Ok(merged) => merged,
            Err(err) => {
                warn!(upload_id, error = %err, "merging chunks failed");
                if let Err(db_err) = self
                    .repo
                    .set_session_status(upload_id, SessionStatus::Failed)
                    .await
                {
                    warn!(upload_id, error = %db_err, "could not mark session failed");
                }
                return Err(err.into());
            }
        };

        let actual_hash = merged.file_hash.unwrap_or_default();
        if merged.file_size as i64 != session.file_size || actual_hash != session.file_hash {
            warn!(
                upload_id,
                expected_size = session.file_size,
                actual_size = merged.file_size,
                expected_hash = %session.file_hash,
                actual_hash = %actual_hash,
                "merged file differs from declared content"
            );
            self.reject_merge(upload_id, &dest).await;
            return Err(UploadError::ContentMismatch {
                expected_size: session.file_size,
                actual_size: merged.file_size as i64,
                expected_hash: session.file_hash,
                actual_hash,
            });
        }

        let (prefix, suffix) = split_file_name(&session.file_name);
        let new = NewFileCode {
            code: generate_code(),
            prefix,
            suffix,
            uuid_file_name: blob_name,
            file_path: dest.clone(),
            size: merged.file_size as i64,
            file_hash: session.file_hash.clone(),
            is_chunked: true,
            upload_id: Some(upload_id.to_string()),
            expire,
            user_id: user_id.or(session.user_id),
        };

        let file_code = match self.repo.commit_completion(upload_id, &new).await {
            Ok(file_code) => file_code,
            Err(err) => {
                let removed = match self.storage.operator() {
                    Ok(op) => op.delete_blob(&dest).await,
                    Err(err) => Err(err),
                };
                if let Err(cleanup) = removed {
                    warn!(upload_id, error = %cleanup, "could not remove merged file");
                }
                return Err(if is_unique_violation(&err) {
                    UploadError::AlreadyCompleted(upload_id.to_string())
                } else if matches!(err, sqlx::Error::RowNotFound) {
                    UploadError::SessionNotFound(upload_id.to_string())
                } else {
                    err.into()
                });
            }
        };

        if let Err(err) = self.storage.clean_chunks_with_result(upload_id).await {
            warn!(upload_id, error = %err, "chunk cleanup after completion failed");
        }

        info!(
            upload_id,
            code = %file_code.code,
            size = file_code.size,
            path = %file_code.file_path,
            "upload completed"
        );
        Ok(file_code)
    }

    /// Throw away a merge whose content is not what the session declared. The
    /// session is marked failed and its chunks dropped, so a resumed upload
    /// starts from the first chunk.
    async fn reject_merge(&self, upload_id: &str, dest: &str) {
        let removed = match self.storage.operator() {
            Ok(op) => op.delete_blob(dest).await,
            Err(err) => Err(err),
        };
        if let Err(err) = removed {
            warn!(upload_id, error = %err, "could not remove rejected merge");
        }
        if let Err(err) = self.storage.clean_chunks_with_result(upload_id).await {
            warn!(upload_id, error = %err, "chunk cleanup after rejected merge failed");
        }
        if let Err(err) = self.repo.reset_chunks(upload_id, SessionStatus::Failed).await {
            warn!(upload_id, error = %err, "could not mark session failed");
        }
    }

    /// Drop the session, its chunk rows and chunk data. Unknown ids are fine.
    pub async fn cancel(&self, upload_id: &str) -> UploadResult<()> {
        let _guard = self.locks.lock(upload_key(upload_id)).await;
        let existed = self.repo.delete_session(upload_id).await?;
        if let Err(err) = self.storage.clean_chunks_with_result(upload_id).await {
            warn!(upload_id, error = %err, "chunk cleanup after cancel failed");
        }
        if existed {
            info!(upload_id, "upload cancelled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        storage::{StorageKind, StorageStrategy, local::LocalStrategy, testing::SlowWrites},
    };
    use std::{path::Path, time::Duration};

    const CHUNK: i64 = 4;

    struct Harness {
        service: ChunkUploadService,
        repo: UploadRepository,
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
    }

    async fn harness() -> Harness {
        harness_with(|local| local).await
    }

    async fn harness_with(
        wrap: impl FnOnce(Arc<dyn StorageStrategy>) -> Arc<dyn StorageStrategy>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let repo = UploadRepository::new(Arc::new(db::memory_pool().await));
        let local: Arc<dyn StorageStrategy> = Arc::new(LocalStrategy::new(&root));
        let storage = Arc::new(ConcreteStorageService::with_strategies(
            StorageKind::Local,
            vec![wrap(local)],
        ));
        Harness {
            service: ChunkUploadService::new(repo.clone(), storage, TransferConfig::default()),
            repo,
            _dir: dir,
            root,
        }
    }

    fn init_request(content: &[u8]) -> InitRequest {
        InitRequest {
            file_name: "notes.txt".into(),
            file_size: content.len() as i64,
            chunk_size: CHUNK,
            file_hash: sha256_hex(content),
            size_limit: 1024,
            user_id: None,
        }
    }

    fn chunk(content: &[u8], index: usize) -> Bytes {
        let start = index * CHUNK as usize;
        let end = (start + CHUNK as usize).min(content.len());
        Bytes::copy_from_slice(&content[start..end])
    }

    fn read(root: &Path, file_code: &FileCode) -> Vec<u8> {
        std::fs::read(root.join(&file_code.file_path)).unwrap()
    }

    #[tokio::test]
    async fn full_upload_round_trip_in_reverse_order() {
        let h = harness().await;
        let content = b"the quick brown fox";
        let init = h.service.init(init_request(content)).await.unwrap();
        assert!(!init.existed);
        assert_eq!(init.total_chunks, 5);
        let upload_id = init.upload_id.unwrap();

        for index in (0..5).rev() {
            h.service
                .upload_chunk(&upload_id, index as i64, chunk(content, index))
                .await
                .unwrap();
        }

        let fc = h.service.complete(&upload_id, 1, "day", None).await.unwrap();
        assert_eq!(fc.size, content.len() as i64);
        assert_eq!(fc.display_name(), "notes.txt");
        assert!(fc.is_chunked);
        let stored = read(&h.root, &fc);
        assert_eq!(stored, content);
        assert_eq!(sha256_hex(&stored), sha256_hex(content));
        assert!(!h.root.join("chunks").join(&upload_id).exists());
        assert_eq!(h.repo.count_completed(&upload_id).await.unwrap(), 0);

        let status = h.service.status(&upload_id).await.unwrap();
        assert_eq!(status.status, "completed");
        assert!(status.missing_chunks.is_empty());
    }

    #[tokio::test]
    async fn repeated_chunk_is_written_once() {
        let h = harness().await;
        let content = b"abcdefgh";
        let upload_id = h.service.init(init_request(content)).await.unwrap().upload_id.unwrap();

        let first = h.service.upload_chunk(&upload_id, 0, chunk(content, 0)).await.unwrap();
        let second = h.service.upload_chunk(&upload_id, 0, chunk(content, 0)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, sha256_hex(b"abcd"));

        let record = h.repo.find_chunk(&upload_id, 0).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 0);
        assert_eq!(h.repo.count_completed(&upload_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_deliveries_agree() {
        let h = Arc::new(harness().await);
        let content = b"abcdefgh";
        let upload_id = h.service.init(init_request(content)).await.unwrap().upload_id.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let (h, upload_id) = (h.clone(), upload_id.clone());
            tasks.push(tokio::spawn(async move {
                h.service
                    .upload_chunk(&upload_id, 1, Bytes::from_static(b"efgh"))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), sha256_hex(b"efgh"));
        }
        let record = h.repo.find_chunk(&upload_id, 1).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn identical_content_is_deduplicated() {
        let h = harness().await;
        let content = b"dedupe me";
        let upload_id = h.service.init(init_request(content)).await.unwrap().upload_id.unwrap();
        for index in 0..3 {
            h.service
                .upload_chunk(&upload_id, index as i64, chunk(content, index))
                .await
                .unwrap();
        }
        let fc = h.service.complete(&upload_id, 0, "forever", None).await.unwrap();

        let again = h.service.init(init_request(content)).await.unwrap();
        assert!(again.existed);
        assert_eq!(again.code.as_deref(), Some(fc.code.as_str()));
        assert!(again.upload_id.is_none());
        let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions")
            .fetch_one(h.repo.pool())
            .await
            .unwrap();
        assert_eq!(sessions, 1);
        let chunk_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_chunks")
            .fetch_one(h.repo.pool())
            .await
            .unwrap();
        assert_eq!(chunk_rows, 0);
    }

    #[tokio::test]
    async fn interrupted_upload_resumes_same_session() {
        let h = harness().await;
        let content = b"0123456789abcdef";
        let first = h.service.init(init_request(content)).await.unwrap();
        let upload_id = first.upload_id.unwrap();
        h.service.upload_chunk(&upload_id, 0, chunk(content, 0)).await.unwrap();
        h.service.upload_chunk(&upload_id, 1, chunk(content, 1)).await.unwrap();

        let resumed = h.service.init(init_request(content)).await.unwrap();
        assert_eq!(resumed.upload_id.as_deref(), Some(upload_id.as_str()));
        assert_eq!(resumed.uploaded_chunks, vec![0, 1]);
        assert_eq!(resumed.resume_position, 2 * CHUNK);
        assert_eq!(resumed.progress, 50.0);

        let status = h.service.status(&upload_id).await.unwrap();
        assert_eq!(status.status, "uploading");
        assert_eq!(status.missing_chunks, vec![2, 3]);
    }

    #[tokio::test]
    async fn completion_requires_every_chunk() {
        let h = harness().await;
        let content = b"0123456789";
        let upload_id = h.service.init(init_request(content)).await.unwrap().upload_id.unwrap();
        h.service.upload_chunk(&upload_id, 0, chunk(content, 0)).await.unwrap();

        let err = h.service.complete(&upload_id, 1, "day", None).await.unwrap_err();
        assert!(matches!(err, UploadError::UploadIncomplete { uploaded: 1, total: 3 }));
        let fc_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_codes")
            .fetch_one(h.repo.pool())
            .await
            .unwrap();
        assert_eq!(fc_rows, 0);
    }

    #[tokio::test]
    async fn second_completion_is_rejected() {
        let h = harness().await;
        let content = b"tiny";
        let upload_id = h.service.init(init_request(content)).await.unwrap().upload_id.unwrap();
        h.service.upload_chunk(&upload_id, 0, chunk(content, 0)).await.unwrap();
        h.service.complete(&upload_id, 1, "day", None).await.unwrap();

        let err = h.service.complete(&upload_id, 1, "day", None).await.unwrap_err();
        assert!(matches!(err, UploadError::AlreadyCompleted(_)));
        let err = h
            .service
            .upload_chunk(&upload_id, 0, chunk(content, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::AlreadyCompleted(_)));
    }

    #[tokio::test]
    async fn cancel_removes_everything() {
        let h = harness().await;
        let content = b"0123456789";
        let upload_id = h.service.init(init_request(content)).await.unwrap().upload_id.unwrap();
        h.service.upload_chunk(&upload_id, 0, chunk(content, 0)).await.unwrap();
        assert!(h.root.join("chunks").join(&upload_id).exists());

        h.service.cancel(&upload_id).await.unwrap();
        assert!(!h.root.join("chunks").join(&upload_id).exists());
        assert!(h.repo.find_session(&upload_id).await.unwrap().is_none());
        assert!(h.repo.find_chunk(&upload_id, 0).await.unwrap().is_none());
        assert!(matches!(
            h.service.status(&upload_id).await,
            Err(UploadError::SessionNotFound(_))
        ));

        h.service.cancel(&upload_id).await.unwrap();
        let fresh = h.service.init(init_request(content)).await.unwrap();
        assert_ne!(fresh.upload_id.as_deref(), Some(upload_id.as_str()));
    }

    #[tokio::test]
    async fn rejects_invalid_input() {
        let h = harness().await;
        let content = b"0123456789";

        let mut too_big = init_request(content);
        too_big.size_limit = 5;
        assert!(matches!(
            h.service.init(too_big).await,
            Err(UploadError::SizeLimitExceeded { size: 10, limit: 5 })
        ));

        let mut bad_hash = init_request(content);
        bad_hash.file_hash = "xyz".into();
        assert!(matches!(h.service.init(bad_hash).await, Err(UploadError::InvalidHash(_))));

        let mut huge_chunks = init_request(content);
        huge_chunks.chunk_size = TransferConfig::default().max_chunk_size + 1;
        assert!(matches!(
            h.service.init(huge_chunks).await,
            Err(UploadError::InvalidRequest(_))
        ));

        let upload_id = h.service.init(init_request(content)).await.unwrap().upload_id.unwrap();
        assert!(matches!(
            h.service.upload_chunk(&upload_id, 3, Bytes::from_static(b"x")).await,
            Err(UploadError::InvalidChunkIndex { index: 3, total: 3 })
        ));
        assert!(matches!(
            h.service.upload_chunk(&upload_id, -1, Bytes::from_static(b"x")).await,
            Err(UploadError::InvalidChunkIndex { .. })
        ));
        assert!(matches!(
            h.service.upload_chunk(&upload_id, 0, Bytes::from_static(b"abc")).await,
            Err(UploadError::InvalidChunkSize { expected: 4, actual: 3, .. })
        ));
        assert!(matches!(
            h.service.upload_chunk("nope", 0, Bytes::from_static(b"abcd")).await,
            Err(UploadError::SessionNotFound(_))
        ));
        assert!(matches!(
            h.service.complete(&upload_id, 0, "count", None).await,
            Err(UploadError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn verifies_stored_chunks() {
        let h = harness().await;
        let content = b"0123456789";
        let upload_id = h.service.init(init_request(content)).await.unwrap().upload_id.unwrap();
        h.service.upload_chunk(&upload_id, 0, chunk(content, 0)).await.unwrap();

        let good = sha256_hex(b"0123").to_uppercase();
        assert!(h.service.verify_chunk(&upload_id, 0, &good).await.unwrap());
        assert!(!h.service.verify_chunk(&upload_id, 0, "deadbeef").await.unwrap());
        assert!(!h.service.verify_chunk(&upload_id, 1, &good).await.unwrap());
    }

    #[tokio::test]
    async fn failed_merge_marks_session_failed() {
        let h = harness().await;
        let content = b"01234567";
        let upload_id = h.service.init(init_request(content)).await.unwrap().upload_id.unwrap();
        h.service.upload_chunk(&upload_id, 0, chunk(content, 0)).await.unwrap();
        h.service.upload_chunk(&upload_id, 1, chunk(content, 1)).await.unwrap();
        std::fs::remove_file(h.root.join(format!("chunks/{}/chunk_1", upload_id))).unwrap();

        assert!(matches!(
            h.service.complete(&upload_id, 1, "day", None).await,
            Err(UploadError::Storage(_))
        ));
        let session = h.repo.find_session(&upload_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(h.service.status(&upload_id).await.unwrap().status, "failed");
    }

    #[tokio::test]
    async fn merge_not_matching_declared_hash_is_rejected() {
        let h = harness().await;
        let mut req = init_request(b"AAAA");
        req.file_name = "claimed.bin".into();
        let upload_id = h.service.init(req.clone()).await.unwrap().upload_id.unwrap();
        h.service
            .upload_chunk(&upload_id, 0, Bytes::from_static(b"EVIL"))
            .await
            .unwrap();

        let err = h.service.complete(&upload_id, 1, "day", None).await.unwrap_err();
        assert!(matches!(err, UploadError::ContentMismatch { .. }));

        let file_codes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_codes")
            .fetch_one(h.repo.pool())
            .await
            .unwrap();
        assert_eq!(file_codes, 0);
        let session = h.repo.find_session(&upload_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(!h.root.join("chunks").join(&upload_id).exists());
        let leftovers: Vec<_> = std::fs::read_dir(&h.root).unwrap().collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);

        let again = h.service.init(req).await.unwrap();
        assert!(!again.existed);
        assert_eq!(again.upload_id.as_deref(), Some(upload_id.as_str()));
        assert!(again.uploaded_chunks.is_empty());
    }

    #[tokio::test]
    async fn cancel_waits_for_in_flight_chunk_write() {
        let h = Arc::new(
            harness_with(|inner| {
                let slow: Arc<dyn StorageStrategy> = Arc::new(SlowWrites {
                    inner,
                    delay: Duration::from_millis(300),
                });
                slow
            })
            .await,
        );
        let content = b"01234567";
        let upload_id = h.service.init(init_request(content)).await.unwrap().upload_id.unwrap();

        let writer = {
            let (h, upload_id) = (h.clone(), upload_id.clone());
            tokio::spawn(async move {
                h.service
                    .upload_chunk(&upload_id, 0, Bytes::from_static(b"0123"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.service.cancel(&upload_id).await.unwrap();

        assert!(writer.await.unwrap().is_ok());
        assert!(h.repo.find_session(&upload_id).await.unwrap().is_none());
        assert!(h.repo.find_chunk(&upload_id, 0).await.unwrap().is_none());
        assert!(!h.root.join("chunks").join(&upload_id).exists());
    }
}
