//! Backend-agnostic file and chunk operations built on [`StorageStrategy`].

use super::{
    ByteStream, PROXY_DOWNLOAD_PATH, StorageError, StorageKind, StorageResult, StorageStrategy,
    path::PathManager,
};
use crate::models::file_code::FileCode;
use axum::response::Response;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use sha2::{Digest, Sha256};
use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::debug;

/// Size and sha-256 of an assembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedFile {
    pub size: u64,
    pub sha256: String,
}

#[derive(Clone)]
pub struct StorageOperator {
    strategy: Arc<dyn StorageStrategy>,
    paths: PathManager,
}

impl StorageOperator {
    pub fn new(strategy: Arc<dyn StorageStrategy>, paths: PathManager) -> Self {
        Self { strategy, paths }
    }

    pub fn kind(&self) -> StorageKind {
        self.strategy.kind()
    }

    pub async fn save_file(&self, source: ByteStream, path: &str) -> StorageResult<u64> {
        self.strategy.save_upload_file(source, path).await
    }

    /// Store one chunk at `chunks/{upload_id}/chunk_{index}` and return that path.
    pub async fn save_chunk(&self, upload_id: &str, index: i64, data: Bytes) -> StorageResult<String> {
        let path = self.paths.chunk_path(upload_id, index);
        self.strategy.write_file(&path, data).await?;
        Ok(path)
    }

    /// Concatenate chunks `0..total_chunks` in index order into `dest`.
    ///
    /// Chunks are read one at a time and streamed into the destination.
    pub async fn merge_chunks(
        &self,
        upload_id: &str,
        total_chunks: i64,
        dest: &str,
    ) -> StorageResult<MergedFile> {
        let chunk_paths: Vec<String> = (0..total_chunks)
            .map(|index| self.paths.chunk_path(upload_id, index))
            .collect();
        let hasher = Arc::new(Mutex::new(Sha256::new()));

        let strategy = self.strategy.clone();
        let digest = hasher.clone();
        let source: ByteStream = Box::pin(
            stream::iter(chunk_paths)
                .then(move |path| {
                    let strategy = strategy.clone();
                    async move {
                        strategy.read_file(&path).await.map_err(|err| match err {
                            StorageError::Io(io) => io,
                            other => io::Error::other(format!("reading {}: {}", path, other)),
                        })
                    }
                })
                .inspect_ok(move |chunk| {
                    digest
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .update(chunk);
                }),
        );

        let size = self.strategy.save_upload_file(source, dest).await?;
        let sha256 = hex::encode(
            hasher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .finalize(),
        );
        debug!(upload_id, dest, size, "merged chunks");
        Ok(MergedFile { size, sha256 })
    }

    pub async fn clean_chunks(&self, upload_id: &str) -> StorageResult<()> {
        self.strategy
            .delete_file(&self.paths.chunk_dir(upload_id))
            .await
    }

    pub async fn get_file_response(&self, file_code: &FileCode) -> StorageResult<Response> {
        if !self.strategy.file_exists(&file_code.file_path).await? {
            return Err(StorageError::NotFound(file_code.code.clone()));
        }
        self.strategy
            .serve_file(&file_code.file_path, &file_code.display_name())
            .await
    }

    /// Access URL for a file; the internal proxy path is qualified with its code.
    pub async fn get_file_url(&self, file_code: &FileCode) -> StorageResult<String> {
        let url = self
            .strategy
            .generate_file_url(&file_code.file_path, &file_code.display_name())
            .await?;
        if url == PROXY_DOWNLOAD_PATH {
            Ok(format!("{}?code={}", url, file_code.code))
        } else {
            Ok(url)
        }
    }

    pub async fn delete_file(&self, file_code: &FileCode) -> StorageResult<()> {
        self.delete_blob(&file_code.file_path).await
    }

    /// Remove a stored blob by path. An empty path is a no-op.
    pub async fn delete_blob(&self, path: &str) -> StorageResult<()> {
        if path.is_empty() {
            return Ok(());
        }
        self.strategy.delete_file(path).await
    }

    pub async fn test_connection(&self) -> StorageResult<()> {
        self.strategy.test_connection().await
    }
}
