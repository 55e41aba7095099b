//! A shareable file, addressed by its short retrieval code.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// `expired_count` value meaning "no download limit".
pub const UNLIMITED: i64 = -1;

/// One row of `file_codes`.
///
/// `(file_hash, size)` identifies identical content for deduplication.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileCode {
    pub id: i64,

    /// Retrieval token (12 lowercase hex chars).
    pub code: String,

    /// Original file name without extension.
    pub prefix: String,

    /// Extension including the leading dot, or empty.
    pub suffix: String,

    /// Name of the blob inside the backend.
    pub uuid_file_name: String,

    /// Backend-relative path of the blob.
    pub file_path: String,

    pub size: i64,

    pub file_hash: String,

    pub is_chunked: bool,

    /// Upload session this file was assembled from, if any.
    pub upload_id: Option<String>,

    pub expired_at: Option<DateTime<Utc>>,

    /// `-1` unlimited, `0` exhausted, `>0` downloads left.
    pub expired_count: i64,

    pub used_count: i64,

    pub user_id: Option<i64>,

    pub created_at: DateTime<Utc>,
}

impl FileCode {
    /// Expired once the deadline has passed or the download allowance is used up.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if let Some(deadline) = self.expired_at {
            if deadline < now {
                return true;
            }
        }
        self.expired_count == 0
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Name presented to downloaders.
    pub fn display_name(&self) -> String {
        format!("{}{}", self.prefix, self.suffix)
    }
}

/// Row values for a new `file_codes` entry.
#[derive(Debug, Clone)]
pub struct NewFileCode {
    pub code: String,
    pub prefix: String,
    pub suffix: String,
    pub uuid_file_name: String,
    pub file_path: String,
    pub size: i64,
    pub file_hash: String,
    pub is_chunked: bool,
    pub upload_id: Option<String>,
    pub expire: ExpirePolicy,
    pub user_id: Option<i64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid expiry `{value} {style}`")]
pub struct InvalidExpiry {
    pub value: i64,
    pub style: String,
}

/// Lifetime of a shared file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirePolicy {
    pub expired_at: Option<DateTime<Utc>>,
    pub expired_count: i64,
}

impl ExpirePolicy {
    /// Interpret a `(value, style)` pair relative to `now`.
    ///
    /// Styles: `day`, `hour`, `minute` (deadline, unlimited downloads),
    /// `count` (download allowance), `forever`. Anything else means one day.
    pub fn parse(value: i64, style: &str, now: DateTime<Utc>) -> Result<Self, InvalidExpiry> {
        let invalid = || InvalidExpiry {
            value,
            style: style.to_string(),
        };
        let deadline = |d: Option<Duration>| -> Result<Self, InvalidExpiry> {
            let d = d.ok_or_else(invalid)?;
            let at = now.checked_add_signed(d).ok_or_else(invalid)?;
            Ok(Self {
                expired_at: Some(at),
                expired_count: UNLIMITED,
            })
        };

        match style {
            "day" | "hour" | "minute" if value <= 0 => Err(invalid()),
            "day" => deadline(Duration::try_days(value)),
            "hour" => deadline(Duration::try_hours(value)),
            "minute" => deadline(Duration::try_minutes(value)),
            "count" if value <= 0 => Err(invalid()),
            "count" => Ok(Self {
                expired_at: None,
                expired_count: value,
            }),
            "forever" => Ok(Self {
                expired_at: None,
                expired_count: UNLIMITED,
            }),
            _ => deadline(Duration::try_days(1)),
        }
    }
}

/// Split `report.final.pdf` into `("report.final", ".pdf")`.
pub fn split_file_name(name: &str) -> (String, String) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (name[..pos].to_string(), name[pos..].to_string()),
        _ => (name.to_string(), String::new()),
    }
}

/// Fresh 12-character hex retrieval code.
pub fn generate_code() -> String {
    let mut code = Uuid::new_v4().simple().to_string();
    code.truncate(12);
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_code(expired_at: Option<DateTime<Utc>>, expired_count: i64) -> FileCode {
        FileCode {
            id: 1,
            code: "abc".into(),
            prefix: "a".into(),
            suffix: ".txt".into(),
            uuid_file_name: "x.txt".into(),
            file_path: "2025/01/01/x.txt".into(),
            size: 1,
            file_hash: "00".into(),
            is_chunked: false,
            upload_id: None,
            expired_at,
            expired_count,
            used_count: 0,
            user_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn parses_time_based_styles() {
        let now = Utc::now();
        let p = ExpirePolicy::parse(2, "hour", now).unwrap();
        assert_eq!(p.expired_at, Some(now + Duration::hours(2)));
        assert_eq!(p.expired_count, UNLIMITED);

        let p = ExpirePolicy::parse(3, "day", now).unwrap();
        assert_eq!(p.expired_at, Some(now + Duration::days(3)));
    }

    #[test]
    fn parses_count_and_forever() {
        let now = Utc::now();
        let p = ExpirePolicy::parse(5, "count", now).unwrap();
        assert_eq!(p.expired_at, None);
        assert_eq!(p.expired_count, 5);

        let p = ExpirePolicy::parse(0, "forever", now).unwrap();
        assert_eq!(p.expired_at, None);
        assert_eq!(p.expired_count, UNLIMITED);
    }

    #[test]
    fn unknown_style_defaults_to_one_day() {
        let now = Utc::now();
        let p = ExpirePolicy::parse(9, "fortnight", now).unwrap();
        assert_eq!(p.expired_at, Some(now + Duration::days(1)));
    }

    #[test]
    fn rejects_non_positive_values() {
        let now = Utc::now();
        assert!(ExpirePolicy::parse(0, "count", now).is_err());
        assert!(ExpirePolicy::parse(-1, "day", now).is_err());
    }

    #[test]
    fn expiry_by_deadline_or_exhausted_count() {
        let now = Utc::now();
        assert!(file_code(Some(now - Duration::seconds(1)), UNLIMITED).is_expired_at(now));
        assert!(file_code(None, 0).is_expired_at(now));
        assert!(!file_code(None, UNLIMITED).is_expired_at(now));
        assert!(!file_code(Some(now + Duration::hours(1)), 3).is_expired_at(now));
    }

    #[test]
    fn splits_extension() {
        assert_eq!(split_file_name("a.tar.gz"), ("a.tar".into(), ".gz".into()));
        assert_eq!(split_file_name("README"), ("README".into(), String::new()));
        assert_eq!(split_file_name(".env"), (".env".into(), String::new()));
        assert_eq!(generate_code().len(), 12);
    }
}
