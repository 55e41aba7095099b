//! WebDAV backend over HTTP(S) with basic auth.
//!
//! Blobs live under `{hostname}/{root_path}/{relative path}`. Parent
//! collections are created with `MKCOL` before every write.

use super::{
    ByteStream, PROXY_DOWNLOAD_PATH, StorageError, StorageKind, StorageResult, StorageStrategy,
    attachment_disposition, path::ensure_key_safe,
};
use crate::config::WebDavConfig;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderValue, header},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use reqwest::{Method, RequestBuilder, StatusCode};
use std::{io, time::Duration};
use tracing::debug;

const PROBE_PATH: &str = ".test_connection";

pub struct WebDavStrategy {
    client: reqwest::Client,
    host: String,
    root: Vec<String>,
    username: String,
    password: String,
}

fn dav_method(name: &'static str) -> StorageResult<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| StorageError::backend(StorageKind::WebDav, "", e))
}

impl WebDavStrategy {
    pub fn new(config: &WebDavConfig) -> StorageResult<Self> {
        let hostname = config.hostname.trim().trim_end_matches('/');
        if hostname.is_empty() {
            return Err(StorageError::backend(
                StorageKind::WebDav,
                "",
                "hostname is required",
            ));
        }
        let host = if hostname.starts_with("http://") || hostname.starts_with("https://") {
            hostname.to_string()
        } else {
            format!("http://{}", hostname)
        };

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StorageError::backend(StorageKind::WebDav, "", e))?;

        Ok(Self {
            client,
            host,
            root: segments(&config.root_path),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url_for(&self, parts: &[String], collection: bool) -> String {
        let mut url = self.host.clone();
        for part in parts {
            url.push('/');
            url.push_str(&urlencoding::encode(part));
        }
        if collection || parts.is_empty() {
            url.push('/');
        }
        url
    }

    fn path_segments(&self, path: &str) -> StorageResult<Vec<String>> {
        ensure_key_safe(path)?;
        let mut parts = self.root.clone();
        parts.extend(segments(path));
        Ok(parts)
    }

    fn url(&self, path: &str) -> StorageResult<String> {
        Ok(self.url_for(&self.path_segments(path)?, false))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        if self.username.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> StorageResult<reqwest::Response> {
        builder
            .send()
            .await
            .map_err(|e| StorageError::backend(StorageKind::WebDav, path, e))
    }

    /// Map error statuses; 404 becomes `NotFound`.
    fn check(&self, response: reqwest::Response, path: &str) -> StorageResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(match status {
            StatusCode::NOT_FOUND => StorageError::NotFound(path.to_string()),
            StatusCode::UNAUTHORIZED => StorageError::backend(
                StorageKind::WebDav,
                path,
                "authentication failed, check username and password",
            ),
            StatusCode::FORBIDDEN => StorageError::backend(
                StorageKind::WebDav,
                path,
                "permission denied by server",
            ),
            other => StorageError::backend(StorageKind::WebDav, path, format!("status {}", other)),
        })
    }

    /// `MKCOL` every collection from the root down to the parent of `parts`.
    async fn ensure_collections(&self, parts: &[String], path: &str) -> StorageResult<()> {
        let mkcol = dav_method("MKCOL")?;
        for depth in 1..parts.len() {
            let url = self.url_for(&parts[..depth], true);
            let response = self.send(self.request(mkcol.clone(), &url), path).await?;
            match response.status() {
                s if s.is_success() => debug!(url = %url, "created collection"),
                StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT => {}
                _ => {
                    self.check(response, path)?;
                }
            }
        }
        Ok(())
    }

    async fn propfind(&self, url: &str, path: &str) -> StorageResult<bool> {
        let response = self
            .send(
                self.request(dav_method("PROPFIND")?, url)
                    .header("Depth", "0"),
                path,
            )
            .await?;
        match self.check(response, path) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl StorageStrategy for WebDavStrategy {
    fn kind(&self) -> StorageKind {
        StorageKind::WebDav
    }

    async fn write_file(&self, path: &str, data: Bytes) -> StorageResult<()> {
        let parts = self.path_segments(path)?;
        self.ensure_collections(&parts, path).await?;
        let url = self.url_for(&parts, false);
        let response = self
            .send(self.request(Method::PUT, &url).body(data), path)
            .await?;
        self.check(response, path)?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> StorageResult<Bytes> {
        let url = self.url(path)?;
        let response = self.send(self.request(Method::GET, &url), path).await?;
        self.check(response, path)?
            .bytes()
            .await
            .map_err(|e| StorageError::backend(StorageKind::WebDav, path, e))
    }

    async fn delete_file(&self, path: &str) -> StorageResult<()> {
        let url = self.url(path)?;
        let response = self.send(self.request(Method::DELETE, &url), path).await?;
        match self.check(response, path) {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn file_exists(&self, path: &str) -> StorageResult<bool> {
        let url = self.url(path)?;
        self.propfind(&url, path).await
    }

    async fn save_upload_file(&self, mut source: ByteStream, path: &str) -> StorageResult<u64> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = source.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let size = buffer.len() as u64;
        self.write_file(path, buffer.freeze()).await?;
        Ok(size)
    }

    async fn serve_file(&self, path: &str, display_name: &str) -> StorageResult<Response> {
        let url = self.url(path)?;
        let upstream = self.send(self.request(Method::GET, &url), path).await?;
        let upstream = self.check(upstream, path)?;
        let length = upstream.content_length();

        let stream = upstream.bytes_stream().map_err(io::Error::other);
        let mut response = Response::new(Body::from_stream(stream));
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

    async fn generate_file_url(&self, _path: &str, _display_name: &str) -> StorageResult<String> {
        Ok(PROXY_DOWNLOAD_PATH.to_string())
    }

    async fn test_connection(&self) -> StorageResult<()> {
        let probe_parts = self.path_segments(PROBE_PATH)?;
        self.ensure_collections(&probe_parts, PROBE_PATH).await?;
        let root_url = self.url_for(&self.root, true);
        if !self.propfind(&root_url, "/").await? {
            return Err(StorageError::backend(
                StorageKind::WebDav,
                "/",
                "root collection is missing",
            ));
        }

        self.write_file(PROBE_PATH, Bytes::from_static(b"filebox"))
            .await?;
        let read_back = self.read_file(PROBE_PATH).await;
        self.delete_file(PROBE_PATH).await?;
        if read_back? != "filebox" {
            return Err(StorageError::backend(
                StorageKind::WebDav,
                PROBE_PATH,
                "probe content mismatch",
            ));
        }
        Ok(())
    }
}
