use crate::storage::StorageKind;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

const MB: i64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Public origin used to build share links, e.g. `https://files.example.com`.
    pub base_url: Option<String>,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
}

/// Backend selection and per-backend settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// Root directory of the local backend.
    pub storage_dir: String,
    pub s3: Option<S3Config>,
    pub webdav: Option<WebDavConfig>,
    pub nfs: Option<NfsConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Local,
            storage_dir: "./data/files".into(),
            s3: None,
            webdav: None,
            nfs: None,
        }
    }
}

#[derive(Clone)]
pub struct S3Config {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...).
    pub endpoint: Option<String>,
    /// Key prefix for everything this service writes.
    pub base_path: String,
    /// Stream downloads through this service instead of redirecting.
    pub proxy: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: None,
            bucket: String::new(),
            region: "us-east-1".into(),
            endpoint: None,
            base_path: "filebox_storage".into(),
            proxy: false,
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("access_key_id", &redact(&self.access_key_id))
            .field("secret_access_key", &redact(&self.secret_access_key))
            .field(
                "session_token",
                &self.session_token.as_deref().map(redact),
            )
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("base_path", &self.base_path)
            .field("proxy", &self.proxy)
            .finish()
    }
}

#[derive(Clone)]
pub struct WebDavConfig {
    /// `host[:port]` or a full `http(s)://` URL.
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub root_path: String,
    pub timeout_secs: u64,
}

impl Default for WebDavConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            root_path: "filebox_storage".into(),
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for WebDavConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebDavConfig")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("root_path", &self.root_path)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NfsConfig {
    pub server: String,
    /// Exported path on the server.
    pub path: String,
    pub mount_point: String,
    pub version: String,
    pub options: String,
    /// Per-command timeout for `mount`/`umount`.
    pub timeout_secs: u64,
    pub auto_mount: bool,
    pub retry_count: u32,
    /// Directory under the mount point that holds the blobs.
    pub sub_path: String,
}

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            path: String::new(),
            mount_point: "/mnt/filebox".into(),
            version: "4".into(),
            options: "rw,sync,hard,intr".into(),
            timeout_secs: 30,
            auto_mount: false,
            retry_count: 3,
            sub_path: "filebox_storage".into(),
        }
    }
}

/// Upload limits and housekeeping schedule.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Largest file an anonymous caller may upload, in bytes.
    pub upload_size: i64,
    /// Largest file an identified caller may upload, in bytes.
    pub user_upload_size: i64,
    /// Ceiling on the chunk size a client may pick.
    pub max_chunk_size: i64,
    /// Abandoned sessions older than this are swept.
    pub session_ttl: chrono::Duration,
    pub expired_sweep_interval: Duration,
    pub session_sweep_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_size: 10 * MB,
            user_upload_size: 50 * MB,
            max_chunk_size: 16 * MB,
            session_ttl: chrono::Duration::hours(24),
            expired_sweep_interval: Duration::from_secs(60 * 60),
            session_sweep_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl TransferConfig {
    /// Size ceiling for a caller, depending on whether they are identified.
    pub fn size_limit(&self, user_id: Option<i64>) -> i64 {
        if user_id.is_some() {
            self.user_upload_size
        } else {
            self.upload_size
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable file sharing service")]
pub struct Args {
    /// Host to bind to (overrides FILEBOX_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILEBOX_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory of the local backend (overrides FILEBOX_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FILEBOX_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Active backend: local, s3, webdav or nfs (overrides FILEBOX_STORAGE_TYPE)
    #[arg(long)]
    pub storage_type: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI arguments over values from `lookup` (the environment in production).
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);

        let storage_type = match args.storage_type {
            Some(value) => value,
            None => env.string("FILEBOX_STORAGE_TYPE", "local"),
        };
        let kind = storage_type
            .parse::<StorageKind>()
            .with_context(|| format!("parsing storage type `{}`", storage_type))?;

        let storage = StorageConfig {
            kind,
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env.string("FILEBOX_STORAGE_DIR", "./data/files")),
            s3: env.s3()?,
            webdav: env.webdav()?,
            nfs: env.nfs()?,
        };

        let defaults = TransferConfig::default();
        let transfer = TransferConfig {
            upload_size: env.parse("FILEBOX_UPLOAD_SIZE", defaults.upload_size)?,
            user_upload_size: env.parse("FILEBOX_USER_UPLOAD_SIZE", defaults.user_upload_size)?,
            max_chunk_size: env.parse("FILEBOX_MAX_CHUNK_SIZE", defaults.max_chunk_size)?,
            session_ttl: chrono::Duration::hours(env.parse("FILEBOX_SESSION_TTL_HOURS", 24)?),
            expired_sweep_interval: Duration::from_secs(
                env.parse("FILEBOX_EXPIRED_SWEEP_SECS", 60 * 60)?,
            ),
            session_sweep_interval: Duration::from_secs(
                env.parse("FILEBOX_SESSION_SWEEP_SECS", 24 * 60 * 60)?,
            ),
        };

        Ok(Self {
            host: args
                .host
                .unwrap_or_else(|| env.string("FILEBOX_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => env.parse("FILEBOX_PORT", 3000)?,
            },
            database_url: args.database_url.unwrap_or_else(|| {
                env.string("FILEBOX_DATABASE_URL", "sqlite://./data/meta/filebox.db")
            }),
            base_url: env.get("FILEBOX_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            storage,
            transfer,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", key, value)),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str) -> Result<bool> {
        match self.get(key) {
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => anyhow::bail!("parsing {} value `{}`: expected a boolean", key, value),
            },
            None => Ok(false),
        }
    }

    /// Present only when `FILEBOX_S3_BUCKET` is set.
    fn s3(&self) -> Result<Option<S3Config>> {
        let Some(bucket) = self.get("FILEBOX_S3_BUCKET") else {
            return Ok(None);
        };
        let defaults = S3Config::default();
        Ok(Some(S3Config {
            access_key_id: self.string("FILEBOX_S3_ACCESS_KEY_ID", ""),
            secret_access_key: self.string("FILEBOX_S3_SECRET_ACCESS_KEY", ""),
            session_token: self.get("FILEBOX_S3_SESSION_TOKEN"),
            bucket,
            region: self.string("FILEBOX_S3_REGION", &defaults.region),
            endpoint: self.get("FILEBOX_S3_ENDPOINT"),
            base_path: self.string("FILEBOX_S3_BASE_PATH", &defaults.base_path),
            proxy: self.flag("FILEBOX_S3_PROXY")?,
        }))
    }

    /// Present only when `FILEBOX_WEBDAV_HOSTNAME` is set.
    fn webdav(&self) -> Result<Option<WebDavConfig>> {
        let Some(hostname) = self.get("FILEBOX_WEBDAV_HOSTNAME") else {
            return Ok(None);
        };
        let defaults = WebDavConfig::default();
        Ok(Some(WebDavConfig {
            hostname,
            username: self.string("FILEBOX_WEBDAV_USERNAME", ""),
            password: self.string("FILEBOX_WEBDAV_PASSWORD", ""),
            root_path: self.string("FILEBOX_WEBDAV_ROOT_PATH", &defaults.root_path),
            timeout_secs: self.parse("FILEBOX_WEBDAV_TIMEOUT_SECS", defaults.timeout_secs)?,
        }))
    }

    /// Present only when `FILEBOX_NFS_SERVER` is set.
    fn nfs(&self) -> Result<Option<NfsConfig>> {
        let Some(server) = self.get("FILEBOX_NFS_SERVER") else {
            return Ok(None);
        };
        let defaults = NfsConfig::default();
        Ok(Some(NfsConfig {
            server,
            path: self.string("FILEBOX_NFS_PATH", ""),
            mount_point: self.string("FILEBOX_NFS_MOUNT_POINT", &defaults.mount_point),
            version: self.string("FILEBOX_NFS_VERSION", &defaults.version),
            options: self.string("FILEBOX_NFS_OPTIONS", &defaults.options),
            timeout_secs: self.parse("FILEBOX_NFS_TIMEOUT_SECS", defaults.timeout_secs)?,
            auto_mount: self.flag("FILEBOX_NFS_AUTO_MOUNT")?,
            retry_count: self.parse("FILEBOX_NFS_RETRY_COUNT", defaults.retry_count)?,
            sub_path: self.string("FILEBOX_NFS_SUB_PATH", &defaults.sub_path),
        }))
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() { "" } else { "***" }
}
