//! Path computation for blobs. Pure string work, no I/O.

use super::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

const MAX_KEY_LEN: usize = 1024;
const CHUNK_ROOT: &str = "chunks";

/// Computes where chunks and assembled files live inside a backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathManager;

impl PathManager {
    pub fn new() -> Self {
        Self
    }

    /// `chunks/{upload_id}`
    pub fn chunk_dir(&self, upload_id: &str) -> String {
        format!("{}/{}", CHUNK_ROOT, upload_id)
    }

    /// `chunks/{upload_id}/chunk_{index}`
    pub fn chunk_path(&self, upload_id: &str, index: i64) -> String {
        format!("{}/{}/chunk_{}", CHUNK_ROOT, upload_id, index)
    }

    /// `{YYYY}/{MM}/{DD}`
    pub fn date_dir(&self, at: DateTime<Utc>) -> String {
        at.format("%Y/%m/%d").to_string()
    }

    /// `{YYYY}/{MM}/{DD}/{name}`
    pub fn date_based_path(&self, name: &str, at: DateTime<Utc>) -> String {
        format!("{}/{}", self.date_dir(at), name)
    }

    /// Blob name derived from content and upload identity:
    /// `hex(sha256(file_hash + salt))` plus the extension of `original_name`.
    pub fn content_file_name(&self, file_hash: &str, salt: &str, original_name: &str) -> String {
        let digest = Sha256::digest(format!("{}{}", file_hash, salt).as_bytes());
        let (_, suffix) = crate::models::file_code::split_file_name(original_name);
        format!("{}{}", hex::encode(digest), sanitize_suffix(&suffix))
    }
}

/// Keep extensions that are safe to use as part of a key.
fn sanitize_suffix(suffix: &str) -> String {
    if suffix.len() > 16
        || !suffix
            .chars()
            .skip(1)
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return String::new();
    }
    suffix.to_ascii_lowercase()
}

/// Reject keys that could escape the storage root.
///
/// Keys must be relative, free of `..` segments, backslashes and control
/// characters.
pub fn ensure_key_safe(key: &str) -> StorageResult<()> {
    let invalid = || StorageError::InvalidPath(key.to_string());
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(invalid());
    }
    if key.starts_with('/') || key.split('/').any(|seg| seg == "..") {
        return Err(invalid());
    }
    if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
        return Err(invalid());
    }
    Ok(())
}
