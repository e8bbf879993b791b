use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_CACHE_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
const DEFAULT_REFRESH_SECS: u64 = 30;
const DEFAULT_DIR_MAX_AGE_SECS: u64 = 10;
const DEFAULT_RETRY_ATTEMPTS: u64 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;
const DEFAULT_TRANSFER_WORKERS: u64 = 4;
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_WORKER_LOOP_MS: u64 = 500;
const DEFAULT_EVICTION_SECS: u64 = 60;
const DEFAULT_ROOT_ID: &str = "root";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown conflict policy: {0}")]
    UnknownPolicy(String),
    #[error("unknown read mode: {0}")]
    UnknownReadMode(String),
}

/// How a node whose local and remote sides both changed gets settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    PreferLocal,
    PreferRemote,
    KeepBoth,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::PreferLocal => "prefer-local",
            ConflictPolicy::PreferRemote => "prefer-remote",
            ConflictPolicy::KeepBoth => "keep-both",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "prefer-local" | "local" => Ok(ConflictPolicy::PreferLocal),
            "prefer-remote" | "remote" => Ok(ConflictPolicy::PreferRemote),
            "keep-both" | "keep-both-renaming-loser" => Ok(ConflictPolicy::KeepBoth),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Whether foreground reads wait for missing data or report it immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Block,
    NonBlocking,
}

impl FromStr for ReadMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" | "blocking" => Ok(ReadMode::Block),
            "nonblock" | "nonblocking" | "async" => Ok(ReadMode::NonBlocking),
            other => Err(ConfigError::UnknownReadMode(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub cache_root: PathBuf,
    pub database_url: Option<String>,
    pub root_remote_id: String,
    pub cache_max_bytes: u64,
    pub chunk_size: u64,
    pub conflict_policy: ConflictPolicy,
    pub auto_resolve: bool,
    pub refresh_interval: Duration,
    pub dir_max_age: Duration,
    pub retry_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: bool,
    pub transfer_workers: usize,
    pub read_mode: ReadMode,
    pub wait_timeout: Duration,
    pub worker_interval: Duration,
    pub eviction_interval: Duration,
}

impl EngineConfig {
    /// Defaults rooted at `cache_root`, suitable for tests and embedding.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            database_url: None,
            root_remote_id: DEFAULT_ROOT_ID.to_string(),
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            conflict_policy: ConflictPolicy::KeepBoth,
            auto_resolve: true,
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
            dir_max_age: Duration::from_secs(DEFAULT_DIR_MAX_AGE_SECS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS as u32,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            backoff_jitter: true,
            transfer_workers: DEFAULT_TRANSFER_WORKERS as usize,
            read_mode: ReadMode::Block,
            wait_timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
            worker_interval: Duration::from_millis(DEFAULT_WORKER_LOOP_MS),
            eviction_interval: Duration::from_secs(DEFAULT_EVICTION_SECS),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let cache_root = std::env::var("CLOUDFS_CACHE_DIR")
            .ok()
            .map(|value| match dirs::home_dir() {
                Some(home) => expand_with_home(&value, &home),
                None => PathBuf::from(value),
            })
            .unwrap_or_else(default_cache_root);
        let mut config = Self::new(cache_root);
        config.database_url = std::env::var("CLOUDFS_DATABASE_URL").ok();
        if let Ok(root) = std::env::var("CLOUDFS_ROOT_ID") {
            config.root_remote_id = root;
        }
        config.cache_max_bytes = read_u64_env("CLOUDFS_CACHE_MAX_BYTES", DEFAULT_CACHE_MAX_BYTES);
        config.chunk_size = read_u64_env("CLOUDFS_CHUNK_SIZE", DEFAULT_CHUNK_SIZE);
        if let Ok(policy) = std::env::var("CLOUDFS_CONFLICT_POLICY") {
            config.conflict_policy = policy.parse()?;
        }
        config.auto_resolve = read_bool_env("CLOUDFS_AUTO_RESOLVE", true);
        config.refresh_interval =
            Duration::from_secs(read_u64_env("CLOUDFS_REFRESH_SECS", DEFAULT_REFRESH_SECS));
        config.dir_max_age = Duration::from_secs(read_u64_env(
            "CLOUDFS_DIR_MAX_AGE_SECS",
            DEFAULT_DIR_MAX_AGE_SECS,
        ));
        config.retry_attempts =
            read_u64_env("CLOUDFS_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS).min(u32::MAX as u64)
                as u32;
        config.backoff_base = Duration::from_millis(read_u64_env(
            "CLOUDFS_BACKOFF_BASE_MS",
            DEFAULT_BACKOFF_BASE_MS,
        ));
        config.backoff_max = Duration::from_millis(read_u64_env(
            "CLOUDFS_BACKOFF_MAX_MS",
            DEFAULT_BACKOFF_MAX_MS,
        ));
        config.transfer_workers =
            read_u64_env("CLOUDFS_TRANSFER_WORKERS", DEFAULT_TRANSFER_WORKERS) as usize;
        if let Ok(mode) = std::env::var("CLOUDFS_READ_MODE") {
            config.read_mode = mode.parse()?;
        }
        config.wait_timeout = Duration::from_millis(read_u64_env(
            "CLOUDFS_WAIT_TIMEOUT_MS",
            DEFAULT_WAIT_TIMEOUT_MS,
        ));
        config.eviction_interval =
            Duration::from_secs(read_u64_env("CLOUDFS_EVICTION_SECS", DEFAULT_EVICTION_SECS));
        Ok(config)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.cache_root.join("objects")
    }

    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}?mode=rwc",
                self.cache_root.join("index.sqlite3").display()
            )
        })
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cloudfs")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
