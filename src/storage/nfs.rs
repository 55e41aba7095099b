//! NFS backend.
//!
//! File I/O goes through a [`LocalStrategy`] rooted at
//! `{mount_point}/{sub_path}`; this module only manages the mount itself.
//! Mount state sits behind an async mutex so that checking, mounting and
//! unmounting never interleave between request tasks.

use super::{
    ByteStream, PROXY_DOWNLOAD_PATH, StorageError, StorageKind, StorageResult, StorageStrategy,
    local::LocalStrategy,
};
use crate::config::NfsConfig;
use async_trait::async_trait;
use axum::response::Response;
use bytes::Bytes;
use serde_json::{Value, json};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{fs, process::Command, sync::Mutex};
use tracing::{info, warn};

const PROC_MOUNTS: &str = "/proc/mounts";

#[derive(Debug, Default)]
struct MountState {
    mounted: bool,
    /// Set when this process performed the mount and owns the unmount.
    mounted_here: bool,
}

pub struct NfsStrategy {
    config: NfsConfig,
    disk: LocalStrategy,
    state: Mutex<MountState>,
}

impl NfsStrategy {
    /// Validate the configuration, detect an existing mount and, with
    /// `auto_mount`, mount the export.
    pub async fn new(config: NfsConfig) -> StorageResult<Self> {
        if config.server.is_empty() {
            return Err(StorageError::Mount("nfs server is required".into()));
        }
        if config.path.is_empty() {
            return Err(StorageError::Mount("nfs export path is required".into()));
        }
        if config.mount_point.is_empty() {
            return Err(StorageError::Mount("nfs mount point is required".into()));
        }

        let strategy = Self::with_state(config, MountState::default());
        {
            let mut state = strategy.state.lock().await;
            state.mounted = strategy.listed_in_mount_table().await;
            if strategy.config.auto_mount && !state.mounted {
                strategy.mount_locked(&mut state).await?;
            }
            if state.mounted {
                fs::create_dir_all(strategy.base_path()).await?;
            }
        }
        Ok(strategy)
    }

    fn with_state(config: NfsConfig, state: MountState) -> Self {
        let base = Path::new(&config.mount_point).join(&config.sub_path);
        Self {
            disk: LocalStrategy::labelled(base, StorageKind::Nfs),
            config,
            state: Mutex::new(state),
        }
    }

    /// A strategy over an already-mounted directory, skipping mount detection.
    #[cfg(test)]
    pub(crate) fn premounted(config: NfsConfig) -> Self {
        Self::with_state(
            config,
            MountState {
                mounted: true,
                mounted_here: false,
            },
        )
    }

    pub fn base_path(&self) -> &Path {
        self.disk.root()
    }

    #[cfg(test)]
    pub async fn is_mounted(&self) -> bool {
        self.state.lock().await.mounted
    }

    fn target(&self) -> String {
        format!("{}:{}", self.config.server, self.config.path)
    }

    /// Whether `server:path` is currently mounted on the mount point.
    async fn listed_in_mount_table(&self) -> bool {
        if !fs::try_exists(&self.config.mount_point).await.unwrap_or(false) {
            return false;
        }

        let target = self.target();
        match fs::read_to_string(PROC_MOUNTS).await {
            Ok(table) => mount_table_contains(&table, &target, &self.config.mount_point),
            Err(_) => match Command::new("mount").output().await {
                Ok(output) => String::from_utf8_lossy(&output.stdout)
                    .contains(&format!("{} on {}", target, self.config.mount_point)),
                Err(err) => {
                    warn!(error = %err, "nfs: could not read mount table");
                    false
                }
            },
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<(), String> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = tokio::time::timeout(
            timeout,
            Command::new(program).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| format!("{} timed out after {}s", program, timeout.as_secs()))?
        .map_err(|err| format!("{}: {}", program, err))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    async fn mount_locked(&self, state: &mut MountState) -> StorageResult<()> {
        fs::create_dir_all(&self.config.mount_point).await?;

        let options = if self.config.version.is_empty() {
            self.config.options.clone()
        } else {
            format!("vers={},{}", self.config.version, self.config.options)
        };
        let target = self.target();
        let args = vec![
            "-t".to_string(),
            "nfs".to_string(),
            "-o".to_string(),
            options,
            target.clone(),
            self.config.mount_point.clone(),
        ];

        let attempts = self.config.retry_count.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.run("mount", &args).await {
                Ok(()) => {
                    state.mounted = true;
                    state.mounted_here = true;
                    info!(target = %target, mount_point = %self.config.mount_point, "nfs mounted");
                    fs::create_dir_all(self.base_path()).await?;
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, max_attempts = attempts, error = %err, "nfs mount failed");
                    last_error = err;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
            }
        }

        Err(StorageError::Mount(format!(
            "mount of {} failed after {} attempts: {}",
            target, attempts, last_error
        )))
    }

    async fn unmount_locked(&self, state: &mut MountState) -> StorageResult<()> {
        if !state.mounted {
            return Ok(());
        }

        let mount_point = vec![self.config.mount_point.clone()];
        if let Err(err) = self.run("umount", &mount_point).await {
            let forced = vec!["-f".to_string(), self.config.mount_point.clone()];
            if let Err(forced_err) = self.run("umount", &forced).await {
                return Err(StorageError::Mount(format!(
                    "unmount failed: {} (forced: {})",
                    err, forced_err
                )));
            }
        }

        state.mounted = false;
        state.mounted_here = false;
        info!(mount_point = %self.config.mount_point, "nfs unmounted");
        Ok(())
    }

    /// Called before every file operation; trusts a cached mount.
    async fn ensure_mounted(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if state.mounted {
            return Ok(());
        }
        self.refresh_locked(&mut state).await
    }

    /// Re-read the mount table, then mount or fail when the export is missing.
    async fn refresh_locked(&self, state: &mut MountState) -> StorageResult<()> {
        let listed = self.listed_in_mount_table().await;
        if state.mounted && !listed {
            warn!(target = %self.target(), mount_point = %self.config.mount_point, "nfs export is no longer mounted");
            state.mounted_here = false;
        }
        state.mounted = listed;
        if listed {
            return Ok(());
        }
        if self.config.auto_mount {
            return self.mount_locked(state).await;
        }
        Err(StorageError::Mount(
            "export is not mounted and auto mount is disabled".into(),
        ))
    }

    /// Unmount (best effort) and mount again.
    pub async fn remount(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if let Err(err) = self.unmount_locked(&mut state).await {
            warn!(error = %err, "nfs unmount before remount failed, mounting anyway");
            state.mounted = false;
        }
        self.mount_locked(&mut state).await
    }

    /// Configuration and mount state, for connection reports.
    pub async fn mount_info(&self) -> BTreeMap<String, Value> {
        let state = self.state.lock().await;
        BTreeMap::from([
            ("server".to_string(), json!(self.config.server)),
            ("nfs_path".to_string(), json!(self.config.path)),
            ("mount_point".to_string(), json!(self.config.mount_point)),
            ("version".to_string(), json!(self.config.version)),
            ("options".to_string(), json!(self.config.options)),
            ("timeout_secs".to_string(), json!(self.config.timeout_secs)),
            ("auto_mount".to_string(), json!(self.config.auto_mount)),
            ("retry_count".to_string(), json!(self.config.retry_count)),
            ("sub_path".to_string(), json!(self.config.sub_path)),
            ("base_path".to_string(), json!(self.base_path().display().to_string())),
            ("is_mounted".to_string(), json!(state.mounted)),
        ])
    }

    /// Unmount at shutdown if this process mounted the export itself.
    pub async fn shutdown(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if self.config.auto_mount && state.mounted_here {
            self.unmount_locked(&mut state).await?;
        }
        Ok(())
    }
}

/// Look for a `/proc/mounts` line whose device is `target` and mount point is `mount_point`.
fn mount_table_contains(table: &str, target: &str, mount_point: &str) -> bool {
    let wanted = PathBuf::from(mount_point);
    table.lines().any(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(device), Some(point)) => {
                device.trim_end_matches('/') == target.trim_end_matches('/')
                    && Path::new(point) == wanted
            }
            _ => false,
        }
    })
}

#[async_trait]
impl StorageStrategy for NfsStrategy {
    fn kind(&self) -> StorageKind {
        StorageKind::Nfs
    }

    async fn write_file(&self, path: &str, data: Bytes) -> StorageResult<()> {
        self.ensure_mounted().await?;
        self.disk.write_file(path, data).await
    }

    async fn read_file(&self, path: &str) -> StorageResult<Bytes> {
        self.ensure_mounted().await?;
        self.disk.read_file(path).await
    }

    async fn delete_file(&self, path: &str) -> StorageResult<()> {
        self.ensure_mounted().await?;
        self.disk.delete_file(path).await
    }

    async fn file_exists(&self, path: &str) -> StorageResult<bool> {
        self.ensure_mounted().await?;
        self.disk.file_exists(path).await
    }

    async fn save_upload_file(&self, source: ByteStream, path: &str) -> StorageResult<u64> {
        self.ensure_mounted().await?;
        self.disk.save_upload_file(source, path).await
    }

    async fn serve_file(&self, path: &str, display_name: &str) -> StorageResult<Response> {
        self.ensure_mounted().await?;
        self.disk.serve_file(path, display_name).await
    }

    async fn generate_file_url(&self, _path: &str, _display_name: &str) -> StorageResult<String> {
        Ok(PROXY_DOWNLOAD_PATH.to_string())
    }

    async fn test_connection(&self) -> StorageResult<()> {
        {
            let mut state = self.state.lock().await;
            self.refresh_locked(&mut state).await?;
        }
        match self.disk.test_connection().await {
            // a stale mount usually recovers after a fresh mount
            Err(err) if self.config.auto_mount => {
                warn!(error = %err, "nfs probe failed, remounting");
                self.remount().await?;
                self.disk.test_connection().await
            }
            result => result,
        }
    }
}
