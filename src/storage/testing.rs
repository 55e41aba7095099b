//! Shared assertions for backend tests.

use super::{ByteStream, StorageKind, StorageResult, StorageStrategy};
use async_trait::async_trait;
use axum::response::Response;
use bytes::Bytes;
use futures::stream;
use std::{sync::Arc, time::Duration};

pub fn stream_of(parts: &[&'static [u8]]) -> ByteStream {
    let items: Vec<std::io::Result<Bytes>> =
        parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
    Box::pin(stream::iter(items))
}

/// write -> exists -> read -> delete -> exists, plus directory-style delete.
pub async fn assert_conformance(strategy: &dyn StorageStrategy) {
    let path = "conformance/dir/blob.bin";
    strategy
        .write_file(path, Bytes::from_static(b"payload"))
        .await
        .unwrap();
    assert!(strategy.file_exists(path).await.unwrap());
    assert_eq!(strategy.read_file(path).await.unwrap(), "payload");

    strategy.delete_file(path).await.unwrap();
    assert!(!strategy.file_exists(path).await.unwrap());

    // deleting something absent is fine
    strategy.delete_file(path).await.unwrap();

    strategy
        .write_file("conformance/chunks/chunk_0", Bytes::from_static(b"a"))
        .await
        .unwrap();
    strategy
        .write_file("conformance/chunks/chunk_1", Bytes::from_static(b"b"))
        .await
        .unwrap();
    strategy.delete_file("conformance/chunks").await.unwrap();
    assert!(!strategy.file_exists("conformance/chunks/chunk_0").await.unwrap());
    assert!(!strategy.file_exists("conformance/chunks/chunk_1").await.unwrap());

    let written = strategy
        .save_upload_file(stream_of(&[b"he", b"llo"]), "conformance/up.txt")
        .await
        .unwrap();
    assert_eq!(written, 5);
    assert_eq!(strategy.read_file("conformance/up.txt").await.unwrap(), "hello");
    strategy.delete_file("conformance/up.txt").await.unwrap();
}

/// Delegates to `inner`, pausing before every `write_file`.
pub struct SlowWrites {
    pub inner: Arc<dyn StorageStrategy>,
    pub delay: Duration,
}

#[async_trait]
impl StorageStrategy for SlowWrites {
    fn kind(&self) -> StorageKind {
        self.inner.kind()
    }

    async fn write_file(&self, path: &str, data: Bytes) -> StorageResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.write_file(path, data).await
    }

    async fn read_file(&self, path: &str) -> StorageResult<Bytes> {
        self.inner.read_file(path).await
    }

    async fn delete_file(&self, path: &str) -> StorageResult<()> {
        self.inner.delete_file(path).await
    }

    async fn file_exists(&self, path: &str) -> StorageResult<bool> {
        self.inner.file_exists(path).await
    }

    async fn save_upload_file(&self, source: ByteStream, path: &str) -> StorageResult<u64> {
        self.inner.save_upload_file(source, path).await
    }

    async fn serve_file(&self, path: &str, display_name: &str) -> StorageResult<Response> {
        self.inner.serve_file(path, display_name).await
    }

    async fn generate_file_url(&self, path: &str, display_name: &str) -> StorageResult<String> {
        self.inner.generate_file_url(path, display_name).await
    }

    async fn test_connection(&self) -> StorageResult<()> {
        self.inner.test_connection().await
    }
}
