//! Pluggable blob storage.
//!
//! A [`StorageStrategy`] implements a handful of primitives for one backend
//! (local disk, S3, WebDAV, NFS). Everything above the primitives lives in
//! [`operator::StorageOperator`], which is shared by every backend, and
//! [`service::ConcreteStorageService`] picks the active backend at runtime.
//!
//! All paths handed to a strategy are relative and `/`-separated, e.g.
//! `chunks/{upload_id}/chunk_3` or `2025/03/14/{name}.bin`.

pub mod local;
pub mod nfs;
pub mod operator;
pub mod path;
pub mod s3;
pub mod service;
#[cfg(test)]
pub(crate) mod testing;
pub mod webdav;

use async_trait::async_trait;
use axum::{http::HeaderValue, response::Response};
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::{fmt, io, pin::Pin, str::FromStr};
use thiserror::Error;

/// Path the application serves proxied downloads from.
pub const PROXY_DOWNLOAD_PATH: &str = "/share/download";

/// Streamed request or file body.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    S3,
    WebDav,
    Nfs,
}

impl StorageKind {
    pub const ALL: [StorageKind; 4] = [
        StorageKind::Local,
        StorageKind::S3,
        StorageKind::WebDav,
        StorageKind::Nfs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Local => "local",
            StorageKind::S3 => "s3",
            StorageKind::WebDav => "webdav",
            StorageKind::Nfs => "nfs",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageKind::Local),
            "s3" => Ok(StorageKind::S3),
            "webdav" => Ok(StorageKind::WebDav),
            "nfs" => Ok(StorageKind::Nfs),
            other => Err(StorageError::UnsupportedType(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("invalid storage path `{0}`")]
    InvalidPath(String),
    #[error("{backend} storage failed on `{path}`: {message}")]
    Backend {
        backend: StorageKind,
        path: String,
        message: String,
    },
    #[error("storage type `{0}` is not configured")]
    NotConfigured(StorageKind),
    #[error("unsupported storage type `{0}`")]
    UnsupportedType(String),
    #[error("nfs mount error: {0}")]
    Mount(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn backend(backend: StorageKind, path: &str, message: impl fmt::Display) -> Self {
        StorageError::Backend {
            backend,
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Primitives every storage backend provides.
///
/// Implementations must be safe to share between request tasks. Deleting a
/// directory-like path removes everything beneath it; deleting something that
/// does not exist succeeds.
#[async_trait]
pub trait StorageStrategy: Send + Sync {
    fn kind(&self) -> StorageKind;

    async fn write_file(&self, path: &str, data: Bytes) -> StorageResult<()>;

    async fn read_file(&self, path: &str) -> StorageResult<Bytes>;

    async fn delete_file(&self, path: &str) -> StorageResult<()>;

    async fn file_exists(&self, path: &str) -> StorageResult<bool>;

    /// Persist a streamed body at `path`, returning the number of bytes written.
    async fn save_upload_file(&self, source: ByteStream, path: &str) -> StorageResult<u64>;

    /// Build the download response for `path`, offered as `display_name`.
    async fn serve_file(&self, path: &str, display_name: &str) -> StorageResult<Response>;

    /// URL a client can fetch `path` from.
    async fn generate_file_url(&self, path: &str, display_name: &str) -> StorageResult<String>;

    /// Round-trip a probe object to prove the backend is usable.
    async fn test_connection(&self) -> StorageResult<()>;
}

/// `Content-Disposition` header offering `name` as an attachment.
pub(crate) fn attachment_disposition(name: &str) -> HeaderValue {
    let ascii: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(name)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
