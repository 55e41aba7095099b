//! S3-compatible object storage backend.
//!
//! Keys are `{base_path}/{relative path}`. Directory-style deletes remove
//! every object under `{key}/`. Downloads redirect to a presigned URL unless
//! `proxy` is set, in which case the object is streamed through this service.

use super::{
    ByteStream, PROXY_DOWNLOAD_PATH, StorageError, StorageKind, StorageResult, StorageStrategy,
    attachment_disposition, path::ensure_key_safe,
};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, retry::RetryConfig, timeout::TimeoutConfig};
use aws_sdk_s3::{
    Client,
    config::Credentials,
    error::DisplayErrorContext,
    operation::{get_object::GetObjectError, head_object::HeadObjectError},
    presigning::PresigningConfig,
    primitives::ByteStream as S3Body,
    types::{Delete, ObjectIdentifier},
};
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

const PRESIGN_TTL: Duration = Duration::from_secs(3600);
const PROBE_KEY: &str = ".test_connection";

pub struct S3Strategy {
    client: Client,
    bucket: String,
    base_path: String,
    proxy: bool,
}

impl S3Strategy {
    pub async fn new(config: &S3Config) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::backend(
                StorageKind::S3,
                "",
                "bucket name is required",
            ));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(Duration::from_secs(10))
                    .build(),
            );
        if !config.access_key_id.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                config.access_key_id.clone(),
                config.secret_access_key.clone(),
                config.session_token.clone(),
                None,
                "filebox-static",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            base_path: config.base_path.trim_matches('/').to_string(),
            proxy: config.proxy,
        })
    }

    fn key(&self, path: &str) -> StorageResult<String> {
        ensure_key_safe(path)?;
        if self.base_path.is_empty() {
            Ok(path.to_string())
        } else {
            Ok(format!("{}/{}", self.base_path, path))
        }
    }

    fn fail<E>(&self, op: &str, key: &str, started: Instant, err: E) -> StorageError
    where
        E: std::error::Error,
    {
        let message = DisplayErrorContext(&err).to_string();
        error!(
            error = %message,
            bucket = %self.bucket,
            key = %key,
            duration_ms = started.elapsed().as_secs_f64() * 1000.0,
            "S3 {} failed",
            op
        );
        StorageError::backend(StorageKind::S3, key, format!("{}: {}", op, message))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let started = Instant::now();
        let size = data.len();
        let checksum = general_purpose::STANDARD.encode(md5::compute(&data).0);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_md5(checksum)
            .body(S3Body::from(data))
            .send()
            .await
            .map_err(|e| self.fail("put", key, started, e))?;

        info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = started.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );
        Ok(())
    }

    async fn presign(&self, key: &str, display_name: &str) -> StorageResult<String> {
        let presigning = PresigningConfig::expires_in(PRESIGN_TTL)
            .map_err(|e| StorageError::backend(StorageKind::S3, key, e))?;
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if !display_name.is_empty() {
            if let Ok(value) = attachment_disposition(display_name).to_str() {
                request = request.response_content_disposition(value);
            }
        }
        let presigned = request
            .presigned(presigning)
            .await
            .map_err(|e| self.fail("presign", key, Instant::now(), e))?;
        Ok(presigned.uri().to_string())
    }

    /// Delete every object whose key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let started = Instant::now();
        let mut removed = 0;
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| self.fail("list", prefix, started, e))?;

            let ids = page
                .contents()
                .iter()
                .filter_map(|obj| obj.key())
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::backend(StorageKind::S3, prefix, e))?;

            if !ids.is_empty() {
                removed += ids.len();
                let batch = Delete::builder()
                    .set_objects(Some(ids))
                    .quiet(true)
                    .build()
                    .map_err(|e| StorageError::backend(StorageKind::S3, prefix, e))?;
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(batch)
                    .send()
                    .await
                    .map_err(|e| self.fail("batch delete", prefix, started, e))?;
            }

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl StorageStrategy for S3Strategy {
    fn kind(&self) -> StorageKind {
        StorageKind::S3
    }

    async fn write_file(&self, path: &str, data: Bytes) -> StorageResult<()> {
        let key = self.key(path)?;
        self.put(&key, data).await
    }

    async fn read_file(&self, path: &str) -> StorageResult<Bytes> {
        let key = self.key(path)?;
        let started = Instant::now();
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(GetObjectError::is_no_such_key)
                {
                    StorageError::NotFound(path.to_string())
                } else {
                    self.fail("get", &key, started, e)
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| self.fail("read body", &key, started, e))?;
        Ok(data.into_bytes())
    }

    async fn delete_file(&self, path: &str) -> StorageResult<()> {
        let key = self.key(path)?;
        let started = Instant::now();
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| self.fail("delete", &key, started, e))?;

        let nested = self.delete_prefix(&format!("{}/", key)).await?;
        info!(
            bucket = %self.bucket,
            key = %key,
            nested,
            duration_ms = started.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> StorageResult<bool> {
        let key = self.key(path)?;
        let started = Instant::now();
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(HeadObjectError::is_not_found) => {
                Ok(false)
            }
            Err(e) => Err(self.fail("head", &key, started, e)),
        }
    }

    async fn save_upload_file(&self, mut source: ByteStream, path: &str) -> StorageResult<u64> {
        let key = self.key(path)?;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = source.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let size = buffer.len() as u64;
        self.put(&key, buffer.freeze()).await?;
        Ok(size)
    }

    async fn serve_file(&self, path: &str, display_name: &str) -> StorageResult<Response> {
        let key = self.key(path)?;

        if !self.proxy {
            let url = self.presign(&key, display_name).await?;
            let location = HeaderValue::from_str(&url)
                .map_err(|e| StorageError::backend(StorageKind::S3, &key, e))?;
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::FOUND;
            response.headers_mut().insert(header::LOCATION, location);
            return Ok(response);
        }

        let started = Instant::now();
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(GetObjectError::is_no_such_key)
                {
                    StorageError::NotFound(path.to_string())
                } else {
                    self.fail("get", &key, started, e)
                }
            })?;

        let length = object.content_length();
        let body = Body::from_stream(ReaderStream::new(object.body.into_async_read()));
        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        if let Some(length) = length {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        }
        headers.insert(
            header::CONTENT_DISPOSITION,
            attachment_disposition(display_name),
        );
        Ok(response)
    }

    async fn generate_file_url(&self, path: &str, display_name: &str) -> StorageResult<String> {
        if self.proxy {
            return Ok(PROXY_DOWNLOAD_PATH.to_string());
        }
        let key = self.key(path)?;
        self.presign(&key, display_name).await
    }

    async fn test_connection(&self) -> StorageResult<()> {
        let started = Instant::now();
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| self.fail("head bucket", &self.bucket, started, e))?;

        self.write_file(PROBE_KEY, Bytes::from_static(b"filebox"))
            .await?;
        let read_back = self.read_file(PROBE_KEY).await;
        self.delete_file(PROBE_KEY).await?;
        if read_back? != "filebox" {
            return Err(StorageError::backend(
                StorageKind::S3,
                PROBE_KEY,
                "probe content mismatch",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> S3Config {
        S3Config {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            bucket: "filebox".into(),
            region: "us-east-1".into(),
            endpoint: Some(endpoint.into()),
            ..S3Config::default()
        }
    }

    #[tokio::test]
    async fn presigned_url_targets_prefixed_key() {
        let s3 = S3Strategy::new(&config("http://127.0.0.1:9000")).await.unwrap();
        let url = s3
            .generate_file_url("2025/01/02/abc.txt", "notes.txt")
            .await
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/filebox/filebox_storage/2025/01/02/abc.txt?"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(!url.contains("wJalrXUtnFEMI"));
    }

    #[tokio::test]
    async fn redirects_downloads_to_presigned_url() {
        let s3 = S3Strategy::new(&config("http://127.0.0.1:9000")).await.unwrap();
        let resp = s3.serve_file("a/b.bin", "b.bin").await.unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.contains("/filebox/filebox_storage/a/b.bin"));
    }

    #[tokio::test]
    async fn proxy_mode_hands_out_internal_url() {
        let mut cfg = config("http://127.0.0.1:9000");
        cfg.proxy = true;
        let s3 = S3Strategy::new(&cfg).await.unwrap();
        assert_eq!(
            s3.generate_file_url("a/b.bin", "b.bin").await.unwrap(),
            PROXY_DOWNLOAD_PATH
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_connection_test() {
        let s3 = S3Strategy::new(&config("http://127.0.0.1:1")).await.unwrap();
        let err = s3.test_connection().await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Backend {
                backend: StorageKind::S3,
                ..
            }
        ));
        assert!(!err.to_string().contains("wJalrXUtnFEMI"));
    }

    #[tokio::test]
    async fn rejects_missing_bucket_and_unsafe_keys() {
        let mut cfg = config("http://127.0.0.1:9000");
        cfg.bucket.clear();
        assert!(S3Strategy::new(&cfg).await.is_err());

        let s3 = S3Strategy::new(&config("http://127.0.0.1:9000")).await.unwrap();
        assert!(matches!(
            s3.generate_file_url("../x", "x").await,
            Err(StorageError::InvalidPath(_))
        ));
    }
}
