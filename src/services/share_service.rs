//! Single-request uploads and retrieval of shared files by code.

use super::{
    chunk_service::{UploadError, UploadResult},
    repository::UploadRepository,
};
use crate::{
    models::file_code::{ExpirePolicy, FileCode, NewFileCode, generate_code, split_file_name},
    storage::{
        ByteStream,
        service::{ConcreteStorageService, FileDownloadInfo},
    },
};
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{info, warn};
use uuid::Uuid;

/// Parameters of a whole-file upload.
#[derive(Debug, Clone)]
pub struct ShareUpload {
    pub file_name: String,
    pub expire_value: i64,
    pub expire_style: String,
    pub size_limit: i64,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SharedFile {
    pub file_code: FileCode,
    /// The content was already shared; `file_code` is the earlier entry.
    pub existed: bool,
}

/// A looked-up file and where to fetch it.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub file_code: FileCode,
    pub download: FileDownloadInfo,
}

/// Byte count and running digest of a body as it streams past.
#[derive(Default)]
struct Meter {
    size: AtomicU64,
    hasher: Mutex<Sha256>,
}

pub struct ShareService {
    repo: UploadRepository,
    storage: Arc<ConcreteStorageService>,
}

impl ShareService {
    pub fn new(repo: UploadRepository, storage: Arc<ConcreteStorageService>) -> Self {
        Self { repo, storage }
    }

    pub async fn upload_file(&self, upload: ShareUpload, source: ByteStream) -> UploadResult<SharedFile> {
        let file_name = upload.file_name.trim();
        if file_name.is_empty() {
            return Err(UploadError::InvalidRequest("file name is required".into()));
        }
        let now = Utc::now();
        let expire = ExpirePolicy::parse(upload.expire_value, &upload.expire_style, now)?;

        let paths = self.storage.paths();
        let blob_name =
            paths.content_file_name(&Uuid::new_v4().simple().to_string(), "", file_name);
        let dest = paths.date_based_path(&blob_name, now);

        let limit = upload.size_limit.max(0) as u64;
        let meter = Arc::new(Meter::default());
        let tap = meter.clone();
        let metered: ByteStream = Box::pin(source.map(move |item| {
            let chunk = item?;
            let seen = tap.size.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            if seen > limit {
                return Err(io::Error::other(format!("body exceeds {} bytes", limit)));
            }
            tap.hasher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .update(&chunk);
            Ok(chunk)
        }));

        let saved = self.storage.save_file_with_result(metered, &dest).await;
        let seen = meter.size.load(Ordering::Relaxed);
        let saved = match saved {
            Ok(saved) => saved,
            Err(_) if seen > limit => {
                self.discard(&dest).await;
                return Err(UploadError::SizeLimitExceeded {
                    size: seen as i64,
                    limit: upload.size_limit,
                });
            }
            Err(err) => return Err(err.into()),
        };
        if saved.file_size == 0 {
            self.discard(&dest).await;
            return Err(UploadError::InvalidRequest("file is empty".into()));
        }

        let file_hash = hex::encode(
            meter
                .hasher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .finalize(),
        );
        let size = saved.file_size as i64;

        if let Some(existing) = self.repo.find_duplicate(&file_hash, size, now).await? {
            self.discard(&dest).await;
            info!(code = %existing.code, "shared file deduplicated");
            return Ok(SharedFile {
                file_code: existing,
                existed: true,
            });
        }

        let (prefix, suffix) = split_file_name(file_name);
        let inserted = self
            .repo
            .insert_file_code(&NewFileCode {
                code: generate_code(),
                prefix,
                suffix,
                uuid_file_name: blob_name,
                file_path: dest.clone(),
                size,
                file_hash,
                is_chunked: false,
                upload_id: None,
                expire,
                user_id: upload.user_id,
            })
            .await;
        let file_code = match inserted {
            Ok(file_code) => file_code,
            Err(err) => {
                self.discard(&dest).await;
                return Err(err.into());
            }
        };

        info!(code = %file_code.code, size, path = %dest, "file shared");
        Ok(SharedFile {
            file_code,
            existed: false,
        })
    }

    async fn discard(&self, path: &str) {
        let removed = match self.storage.operator() {
            Ok(op) => op.delete_blob(path).await,
            Err(err) => Err(err),
        };
        if let Err(err) = removed {
            warn!(path, error = %err, "could not remove discarded upload");
        }
    }

    /// A live file by code. Expired and unknown codes are `FileNotFound`.
    async fn live(&self, code: &str) -> UploadResult<FileCode> {
        match self.repo.find_by_code(code.trim()).await? {
            Some(file_code) if !file_code.is_expired() => Ok(file_code),
            _ => Err(UploadError::FileNotFound(code.to_string())),
        }
    }

    /// Look up a file and count one download against it.
    pub async fn select(&self, code: &str) -> UploadResult<SelectedFile> {
        let file_code = self.live(code).await?;
        let file_code = self.repo.record_download(file_code.id).await?;
        let download = self.storage.download_info(&file_code).await?;
        Ok(SelectedFile {
            file_code,
            download,
        })
    }

    pub async fn download(&self, code: &str) -> UploadResult<Response> {
        let file_code = self.live(code).await?;
        Ok(self.storage.get_file_response(&file_code).await?)
    }
}
