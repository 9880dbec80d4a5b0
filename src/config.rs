//! Process configuration: data directory, credentials, runtime mode, limits.
//!
//! Everything is resolved once at startup and carried through the request
//! handler chain inside `ApiContext`; no process-wide singletons.

use std::path::{Path, PathBuf};

/// Application-level constants
pub const APP_NAME: &str = "Chairside";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "DENTAL_ASSISTANT_DATA_DIR";
/// Environment variable holding the expected API key.
pub const API_KEY_ENV: &str = "APP_API_KEY";
/// Environment variable selecting the runtime mode.
pub const ENV_MODE_ENV: &str = "ENV";

/// Maximum accepted upload size (100 MiB).
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;
/// Maximum transcription text length fed to the generator.
pub const MAX_TEXT_CHARS: usize = 12_000;
/// Accepted audio extensions for `/transcribe`.
pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "ogg", "webm", "mp4"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("APP_API_KEY must be set when ENV=production")]
    MissingApiKey,
    #[error("cannot create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Runtime mode. Production refuses to start without an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Development,
    Production,
}

impl RuntimeMode {
    fn from_env() -> Self {
        match std::env::var(ENV_MODE_ENV).as_deref() {
            Ok("production") => Self::Production,
            _ => Self::Development,
        }
    }
}

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: RuntimeMode,
    pub data_dir: PathBuf,
    /// Expected value of the `X-API-Key` header. `None` only in development.
    pub api_key: Option<String>,
    /// Bind address; loopback only.
    pub bind_addr: std::net::SocketAddr,
    /// Token-bucket refill rate per endpoint group (requests per minute).
    pub rate_limit_per_minute: u32,
    /// Maximum distinct rate-limit buckets before oldest-idle eviction.
    pub rate_limit_max_buckets: usize,
    /// Waiting-list cap per scheduler queue.
    pub queue_wait_cap: usize,
    /// How long a submission may sit in a waiting list before `busy`.
    pub queue_wait_budget: std::time::Duration,
    pub max_upload_bytes: usize,
    pub max_text_chars: usize,
}

impl Config {
    /// Resolve configuration from the environment.
    ///
    /// Fails when `ENV=production` and no API key is configured, and when
    /// the data directory cannot be created.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = RuntimeMode::from_env();
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty());

        if mode == RuntimeMode::Production && api_key.is_none() {
            return Err(ConfigError::MissingApiKey);
        }

        let data_dir = resolve_data_dir();
        ensure_private_dir(&data_dir)?;
        ensure_private_dir(&data_dir.join("models"))?;
        ensure_private_dir(&data_dir.join("rag_data"))?;

        Ok(Self {
            mode,
            data_dir,
            api_key,
            bind_addr: ([127, 0, 0, 1], 8178).into(),
            rate_limit_per_minute: 30,
            rate_limit_max_buckets: 1024,
            queue_wait_cap: 16,
            queue_wait_budget: std::time::Duration::from_secs(30),
            max_upload_bytes: MAX_UPLOAD_BYTES,
            max_text_chars: MAX_TEXT_CHARS,
        })
    }

    /// A configuration rooted at an explicit directory. Used by tests.
    pub fn for_data_dir(dir: &Path) -> Result<Self, ConfigError> {
        ensure_private_dir(dir)?;
        ensure_private_dir(&dir.join("models"))?;
        ensure_private_dir(&dir.join("rag_data"))?;
        Ok(Self {
            mode: RuntimeMode::Development,
            data_dir: dir.to_path_buf(),
            api_key: Some("test-key".to_string()),
            bind_addr: ([127, 0, 0, 1], 0).into(),
            rate_limit_per_minute: 30,
            rate_limit_max_buckets: 1024,
            queue_wait_cap: 16,
            queue_wait_budget: std::time::Duration::from_secs(30),
            max_upload_bytes: MAX_UPLOAD_BYTES,
            max_text_chars: MAX_TEXT_CHARS,
        })
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn rag_data_dir(&self) -> PathBuf {
        self.data_dir.join("rag_data")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("consultations.jsonl")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("audit.jsonl")
    }

    /// Seed knowledge directory (markdown files, ingested once).
    pub fn knowledge_dir(&self) -> PathBuf {
        self.data_dir.join("knowledge")
    }
}

/// Resolve the per-user data directory.
/// `DENTAL_ASSISTANT_DATA_DIR` overrides; default is ~/Chairside
/// (user-visible, per design requirement).
fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(APP_NAME)
}

/// Create a directory with owner-only permissions if absent.
fn ensure_private_dir(path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|source| ConfigError::DataDir {
            path: path.to_path_buf(),
            source,
        })?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(path, perms).map_err(|source| ConfigError::DataDir {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> String {
    "info,chairside=debug".to_string()
}
