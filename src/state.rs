//! Shared application state handed to every handler.

use crate::{
    config::AppConfig,
    services::{
        chunk_service::ChunkUploadService, repository::UploadRepository,
        share_service::ShareService,
    },
    storage::service::ConcreteStorageService,
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<SqlitePool>,
    pub repo: UploadRepository,
    pub storage: Arc<ConcreteStorageService>,
    pub chunks: Arc<ChunkUploadService>,
    pub shares: Arc<ShareService>,
}

impl AppState {
    pub fn new(config: AppConfig, db: Arc<SqlitePool>, storage: Arc<ConcreteStorageService>) -> Self {
        let repo = UploadRepository::new(db.clone());
        let chunks = Arc::new(ChunkUploadService::new(
            repo.clone(),
            storage.clone(),
            config.transfer.clone(),
        ));
        let shares = Arc::new(ShareService::new(repo.clone(), storage.clone()));
        Self {
            config: Arc::new(config),
            db,
            repo,
            storage,
            chunks,
            shares,
        }
    }

    /// Link handed out for a share code, absolute when a public origin is configured.
    pub fn share_url(&self, code: &str) -> String {
        format!(
            "{}/share/select?code={}",
            self.config.base_url.as_deref().unwrap_or(""),
            code
        )
    }

    /// Size ceiling for the caller identified by `user_id`.
    pub fn size_limit(&self, user_id: Option<i64>) -> i64 {
        self.config.transfer.size_limit(user_id)
    }
}
