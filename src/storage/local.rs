//! Local filesystem backend.
//!
//! Blobs live under `root/{relative path}`. Writes stream into a sibling
//! `.tmp-{uuid}` file which is fsynced and renamed into place, so readers never
//! observe a partially written blob.

use super::{
    ByteStream, PROXY_DOWNLOAD_PATH, StorageError, StorageKind, StorageResult, StorageStrategy,
    attachment_disposition, path::ensure_key_safe,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LocalStrategy {
    root: PathBuf,
    kind: StorageKind,
}

impl LocalStrategy {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::labelled(root, StorageKind::Local)
    }

    /// A disk-backed strategy that reports itself as `kind` (used by NFS).
    pub(crate) fn labelled(root: impl Into<PathBuf>, kind: StorageKind) -> Self {
        Self {
            root: root.into(),
            kind,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        ensure_key_safe(key)?;
        Ok(self.root.join(key))
    }

    fn map_missing(&self, err: io::Error, key: &str) -> StorageError {
        if err.kind() == ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(err)
        }
    }

    /// Remove empty directories from `start` upwards, stopping below the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Drain `source` into `file` and make it durable.
async fn copy_into(file: &mut File, mut source: ByteStream) -> io::Result<u64> {
    let mut written: u64 = 0;
    while let Some(chunk) = source.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[async_trait]
impl StorageStrategy for LocalStrategy {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    async fn write_file(&self, path: &str, data: Bytes) -> StorageResult<()> {
        let source: ByteStream = Box::pin(stream::once(async move { Ok(data) }));
        self.save_upload_file(source, path).await.map(|_| ())
    }

    async fn read_file(&self, path: &str) -> StorageResult<Bytes> {
        let target = self.resolve(path)?;
        let data = fs::read(&target)
            .await
            .map_err(|err| self.map_missing(err, path))?;
        Ok(Bytes::from(data))
    }

    async fn delete_file(&self, path: &str) -> StorageResult<()> {
        let target = self.resolve(path)?;
        let removed = match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target).await,
            Ok(_) => fs::remove_file(&target).await,
            Err(err) => Err(err),
        };
        match removed {
            Ok(_) => debug!("removed {}", target.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("{} already missing", target.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = target.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> StorageResult<bool> {
        let target = self.resolve(path)?;
        Ok(fs::try_exists(&target).await?)
    }

    async fn save_upload_file(&self, source: ByteStream, path: &str) -> StorageResult<u64> {
        let file_path = self.resolve(path)?;
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        let written = match copy_into(&mut file, source).await {
            Ok(written) => written,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        debug!(path = %file_path.display(), bytes = written, "stored blob");
        Ok(written)
    }

    async fn serve_file(&self, path: &str, display_name: &str) -> StorageResult<Response> {
        let target = self.resolve(path)?;
        let file = File::open(&target)
            .await
            .map_err(|err| self.map_missing(err, path))?;
        let len = file.metadata().await?.len();

        let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        headers.insert(
            header::CONTENT_DISPOSITION,
            attachment_disposition(display_name),
        );
        Ok(response)
    }

    async fn generate_file_url(&self, _path: &str, _display_name: &str) -> StorageResult<String> {
        Ok(PROXY_DOWNLOAD_PATH.to_string())
    }

    async fn test_connection(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root).await?;
        let probe = self
            .root
            .join(format!(".test_connection-{}", Uuid::new_v4()));
        fs::write(&probe, b"filebox").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"filebox" {
            return Err(StorageError::backend(
                self.kind,
                &probe.display().to_string(),
                "probe content mismatch",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing;

    #[tokio::test]
    async fn conforms_to_strategy_contract() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStrategy::new(dir.path());
        testing::assert_conformance(&local).await;
        local.test_connection().await.unwrap();
    }

    #[tokio::test]
    async fn streams_upload_and_prunes_on_delete() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStrategy::new(dir.path());

        let written = local
            .save_upload_file(testing::stream_of(&[b"ab", b"cd", b"e"]), "2025/01/02/f.bin")
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert_eq!(
            fs::read(dir.path().join("2025/01/02/f.bin")).await.unwrap(),
            b"abcde"
        );

        local.delete_file("2025/01/02/f.bin").await.unwrap();
        assert!(!dir.path().join("2025").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStrategy::new(dir.path());
        let source: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::other("client went away")),
        ]));

        assert!(local.save_upload_file(source, "a/b.bin").await.is_err());
        let mut entries = fs::read_dir(dir.path().join("a")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStrategy::new(dir.path());
        let err = local.read_file("../secret").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn serves_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStrategy::new(dir.path());
        local
            .write_file("x/y.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let resp = local.serve_file("x/y.txt", "notes.txt").await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "5");
        let disposition = resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.contains("filename=\"notes.txt\""));

        let missing = local.serve_file("x/nope.txt", "n").await.unwrap_err();
        assert!(matches!(missing, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_connection_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let local = LocalStrategy::new(&blocker);
        assert!(local.test_connection().await.is_err());
    }
}
