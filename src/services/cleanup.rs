//! Background housekeeping: expired shares and abandoned upload sessions.

use super::{chunk_service::ChunkUploadService, repository::UploadRepository};
use crate::{config::TransferConfig, storage::service::ConcreteStorageService};
use chrono::Utc;
use std::sync::Arc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct CleanupJob {
    repo: UploadRepository,
    storage: Arc<ConcreteStorageService>,
    chunks: Arc<ChunkUploadService>,
    transfer: TransferConfig,
}

impl CleanupJob {
    pub fn new(
        repo: UploadRepository,
        storage: Arc<ConcreteStorageService>,
        chunks: Arc<ChunkUploadService>,
        transfer: TransferConfig,
    ) -> Self {
        Self {
            repo,
            storage,
            chunks,
            transfer,
        }
    }

    /// Run both sweeps on their intervals until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut expired = tokio::time::interval(self.transfer.expired_sweep_interval);
            let mut sessions = tokio::time::interval(self.transfer.session_sweep_interval);
            expired.set_missed_tick_behavior(MissedTickBehavior::Delay);
            sessions.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("cleanup job stopped");
                        break;
                    }
                    _ = expired.tick() => {
                        if let Err(err) = self.sweep_expired_files().await {
                            warn!(error = %err, "expired file sweep failed");
                        }
                    }
                    _ = sessions.tick() => {
                        if let Err(err) = self.sweep_stale_sessions().await {
                            warn!(error = %err, "stale session sweep failed");
                        }
                    }
                }
            }
        })
    }

    /// Delete files past their deadline or download allowance. Returns how
    /// many rows were removed.
    pub async fn sweep_expired_files(&self) -> sqlx::Result<usize> {
        let expired = self.repo.expired_file_codes(Utc::now()).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        for file_code in &expired {
            if let Err(err) = self.storage.delete_file_with_result(file_code).await {
                warn!(code = %file_code.code, path = %file_code.file_path, error = %err, "could not delete expired blob");
            }
            self.repo.delete_file_code(file_code.id).await?;
            removed += 1;
        }
        info!(removed, "expired files swept");
        Ok(removed)
    }

    /// Cancel unfinished sessions older than the session TTL.
    pub async fn sweep_stale_sessions(&self) -> sqlx::Result<usize> {
        let cutoff = Utc::now() - self.transfer.session_ttl;
        let stale = self.repo.stale_sessions(cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        for session in &stale {
            match self.chunks.cancel(&session.upload_id).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(upload_id = %session.upload_id, error = %err, "could not remove stale session")
                }
            }
        }
        info!(removed, found = stale.len(), "stale upload sessions swept");
        Ok(removed)
    }
}
