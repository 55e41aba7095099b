//! ConcreteStorageService: owns every configured backend and routes
//! operations to the active one.

use super::{
    ByteStream, StorageError, StorageKind, StorageResult, StorageStrategy,
    local::LocalStrategy,
    nfs::NfsStrategy,
    operator::StorageOperator,
    path::PathManager,
    s3::S3Strategy,
    webdav::WebDavStrategy,
};
use crate::{config::StorageConfig, models::file_code::FileCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{info, warn};

/// Outcome of a whole-file operation.
#[derive(Debug, Clone, Serialize)]
pub struct FileOperationResult {
    pub file_path: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub storage_type: StorageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// Outcome of a single chunk write.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkOperationResult {
    pub upload_id: String,
    pub chunk_index: i64,
    pub chunk_hash: String,
    pub chunk_size: u64,
    pub chunk_path: String,
    pub storage_type: StorageKind,
    pub timestamp: DateTime<Utc>,
}

/// Connection report for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    pub available: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_checked: DateTime<Utc>,
    /// Backend specifics, e.g. NFS mount configuration and state.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
}

/// How a shared file can be fetched.
#[derive(Debug, Clone, Serialize)]
pub struct FileDownloadInfo {
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub content_type: String,
    pub download_url: String,
    /// True when the URL points straight at the backend (e.g. presigned S3).
    pub direct_access: bool,
}

pub struct ConcreteStorageService {
    strategies: HashMap<StorageKind, Arc<dyn StorageStrategy>>,
    nfs: Option<Arc<NfsStrategy>>,
    current: RwLock<StorageKind>,
    paths: PathManager,
}

impl ConcreteStorageService {
    /// Build every configured backend. Local storage always exists; other
    /// backends that fail to initialise are logged and left out.
    pub async fn from_config(config: &StorageConfig) -> Self {
        let mut strategies: Vec<Arc<dyn StorageStrategy>> =
            vec![Arc::new(LocalStrategy::new(&config.storage_dir))];

        if let Some(s3) = &config.s3 {
            match S3Strategy::new(s3).await {
                Ok(strategy) => strategies.push(Arc::new(strategy)),
                Err(err) => warn!(error = %err, "s3 storage unavailable"),
            }
        }
        if let Some(webdav) = &config.webdav {
            match WebDavStrategy::new(webdav) {
                Ok(strategy) => strategies.push(Arc::new(strategy)),
                Err(err) => warn!(error = %err, "webdav storage unavailable"),
            }
        }
        let mut nfs = None;
        if let Some(nfs_config) = &config.nfs {
            match NfsStrategy::new(nfs_config.clone()).await {
                Ok(strategy) => {
                    let strategy = Arc::new(strategy);
                    strategies.push(strategy.clone());
                    nfs = Some(strategy);
                }
                Err(err) => warn!(error = %err, "nfs storage unavailable"),
            }
        }

        let mut service = Self::with_strategies(StorageKind::Local, strategies);
        service.nfs = nfs;
        if let Err(err) = service.switch(config.kind) {
            warn!(error = %err, requested = %config.kind, "falling back to local storage");
        }
        info!(
            current = %service.current_kind(),
            available = ?service.available_kinds(),
            "storage initialised"
        );
        service
    }

    /// Assemble a service from ready-made strategies. `current` falls back to
    /// the first strategy when it is not among them.
    pub fn with_strategies(current: StorageKind, strategies: Vec<Arc<dyn StorageStrategy>>) -> Self {
        let fallback = strategies.first().map(|s| s.kind()).unwrap_or(current);
        let strategies: HashMap<_, _> = strategies.into_iter().map(|s| (s.kind(), s)).collect();
        let current = if strategies.contains_key(&current) {
            current
        } else {
            fallback
        };
        Self {
            strategies,
            nfs: None,
            current: RwLock::new(current),
            paths: PathManager::new(),
        }
    }

    pub fn current_kind(&self) -> StorageKind {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn available_kinds(&self) -> Vec<StorageKind> {
        StorageKind::ALL
            .into_iter()
            .filter(|kind| self.strategies.contains_key(kind))
            .collect()
    }

    /// Make `kind` the active backend for subsequent operations.
    pub fn switch(&self, kind: StorageKind) -> StorageResult<()> {
        if !self.strategies.contains_key(&kind) {
            return Err(StorageError::NotConfigured(kind));
        }
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if *current != kind {
            info!(from = %*current, to = %kind, "switching storage backend");
            *current = kind;
        }
        Ok(())
    }

    pub fn paths(&self) -> &PathManager {
        &self.paths
    }

    pub fn operator_for(&self, kind: StorageKind) -> StorageResult<StorageOperator> {
        self.strategies
            .get(&kind)
            .map(|strategy| StorageOperator::new(strategy.clone(), self.paths))
            .ok_or(StorageError::NotConfigured(kind))
    }

    /// Operator bound to the backend that is active right now.
    pub fn operator(&self) -> StorageResult<StorageOperator> {
        self.operator_for(self.current_kind())
    }

    pub async fn save_file_with_result(
        &self,
        source: ByteStream,
        path: &str,
    ) -> StorageResult<FileOperationResult> {
        let op = self.operator()?;
        let size = op.save_file(source, path).await?;
        Ok(FileOperationResult {
            file_path: path.to_string(),
            file_size: size,
            file_hash: None,
            storage_type: op.kind(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        })
    }

    pub async fn delete_file_with_result(
        &self,
        file_code: &FileCode,
    ) -> StorageResult<FileOperationResult> {
        let op = self.operator()?;
        op.delete_file(file_code).await?;
        Ok(FileOperationResult {
            file_path: file_code.file_path.clone(),
            file_size: file_code.size.max(0) as u64,
            file_hash: Some(file_code.file_hash.clone()),
            storage_type: op.kind(),
            timestamp: Utc::now(),
            metadata: BTreeMap::from([("code".to_string(), json!(file_code.code))]),
        })
    }

    pub async fn save_chunk_with_result(
        &self,
        upload_id: &str,
        chunk_index: i64,
        data: Bytes,
        chunk_hash: &str,
    ) -> StorageResult<ChunkOperationResult> {
        let op = self.operator()?;
        let chunk_size = data.len() as u64;
        let chunk_path = op.save_chunk(upload_id, chunk_index, data).await?;
        Ok(ChunkOperationResult {
            upload_id: upload_id.to_string(),
            chunk_index,
            chunk_hash: chunk_hash.to_string(),
            chunk_size,
            chunk_path,
            storage_type: op.kind(),
            timestamp: Utc::now(),
        })
    }

    pub async fn merge_chunks_with_result(
        &self,
        upload_id: &str,
        total_chunks: i64,
        dest: &str,
    ) -> StorageResult<FileOperationResult> {
        let op = self.operator()?;
        let merged = op.merge_chunks(upload_id, total_chunks, dest).await?;
        Ok(FileOperationResult {
            file_path: dest.to_string(),
            file_size: merged.size,
            file_hash: Some(merged.sha256),
            storage_type: op.kind(),
            timestamp: Utc::now(),
            metadata: BTreeMap::from([
                ("upload_id".to_string(), json!(upload_id)),
                ("total_chunks".to_string(), json!(total_chunks)),
            ]),
        })
    }

    pub async fn clean_chunks_with_result(
        &self,
        upload_id: &str,
    ) -> StorageResult<FileOperationResult> {
        let op = self.operator()?;
        op.clean_chunks(upload_id).await?;
        Ok(FileOperationResult {
            file_path: self.paths.chunk_dir(upload_id),
            file_size: 0,
            file_hash: None,
            storage_type: op.kind(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        })
    }

    /// Probe `kind`; never fails, the outcome is in the report.
    pub async fn test_connection_with_result(&self, kind: StorageKind) -> StorageInfo {
        let (available, outcome) = match self.operator_for(kind) {
            Ok(op) => (true, op.test_connection().await),
            Err(err) => (false, Err(err)),
        };
        if let Err(err) = &outcome {
            warn!(storage = %kind, error = %err, "storage connection test failed");
        }
        let details = match &self.nfs {
            Some(nfs) if kind == StorageKind::Nfs => nfs.mount_info().await,
            _ => BTreeMap::new(),
        };
        StorageInfo {
            kind,
            available,
            connected: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
            last_checked: Utc::now(),
            details,
        }
    }

    pub async fn download_info(&self, file_code: &FileCode) -> StorageResult<FileDownloadInfo> {
        let op = self.operator()?;
        let download_url = op.get_file_url(file_code).await?;
        Ok(FileDownloadInfo {
            file_path: file_code.file_path.clone(),
            file_name: file_code.display_name(),
            file_size: file_code.size,
            content_type: "application/octet-stream".to_string(),
            direct_access: !download_url.starts_with('/'),
            download_url,
        })
    }

    pub async fn get_file_response(&self, file_code: &FileCode) -> StorageResult<Response> {
        self.operator()?.get_file_response(file_code).await
    }

    /// Release backend resources (NFS unmount).
    pub async fn shutdown(&self) {
        if let Some(nfs) = &self.nfs {
            if let Err(err) = nfs.shutdown().await {
                warn!(error = %err, "nfs shutdown failed");
            }
        }
    }
}
