use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use shm_compute_shared_memory::{PlatformUtils, WaitOptions, DEFAULT_QUEUE_NAME, MAX_QUEUE_LEN};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable pointing at a config file
pub const CONFIG_ENV: &str = "SHM_COMPUTE_CONFIG";

/// Config file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "shm-compute.toml";

/// Settings shared by the server and its clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding every segment
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    /// Well-known name of the connection queue segment
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Queue slots in use, at most 100
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound on concurrently served channels
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How often the server polls the queue, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Idle time after which a channel is treated as abandoned, in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How long a client waits for a response, in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// How long anyone waits for a shared lock, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Ceiling of a single backoff sleep, in microseconds
    #[serde(default = "default_backoff_cap_us")]
    pub backoff_cap_us: u64,

    /// Times a client retries posting to a full queue
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_store_root() -> PathBuf {
    PlatformUtils::default_store_root()
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE_NAME.to_string()
}

fn default_queue_capacity() -> usize {
    MAX_QUEUE_LEN
}

fn default_max_workers() -> usize {
    num_cpus::get() * 4
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_response_timeout_ms() -> u64 {
    5_000
}

fn default_lock_timeout_ms() -> u64 {
    1_000
}

fn default_backoff_cap_us() -> u64 {
    2_000
}

fn default_connect_retries() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            queue_name: default_queue_name(),
            queue_capacity: default_queue_capacity(),
            max_workers: default_max_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            backoff_cap_us: default_backoff_cap_us(),
            connect_retries: default_connect_retries(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read config file: {:?}", path.as_ref()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Cannot parse config file: {:?}", path.as_ref()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration as TOML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Cannot create directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).with_context(|| "Cannot serialize config")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Cannot write config file: {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Look for a config file in the usual places
    pub fn find_config_file() -> Option<PathBuf> {
        let local = Path::new(CONFIG_FILE_NAME);
        if local.exists() {
            info!("Using config file found in working directory: {}", local.display());
            return Some(local.to_path_buf());
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                info!("Using config file from {}: {}", CONFIG_ENV, path.display());
                return Some(path);
            }
        }

        None
    }

    /// Load `path` if given, else a discovered file, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(Self::find_config_file) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_QUEUE_LEN).contains(&self.queue_capacity),
            "queue_capacity must be within 1..={}, got {}",
            MAX_QUEUE_LEN,
            self.queue_capacity
        );
        ensure!(self.max_workers > 0, "max_workers must be positive");
        ensure!(!self.queue_name.is_empty(), "queue_name must not be empty");
        ensure!(self.idle_timeout_ms > 0, "idle_timeout_ms must be positive");
        ensure!(self.lock_timeout_ms > 0, "lock_timeout_ms must be positive");
        Ok(())
    }

    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            backoff_cap: Duration::from_micros(self.backoff_cap_us),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.queue_name, "srv_conn_channel");
        assert_eq!(config.queue_capacity, MAX_QUEUE_LEN);
        assert!(config.max_workers > 0);
        assert!(config.validate().is_ok());
        assert_eq!(config.wait_options().lock_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shm-compute.toml");
        std::fs::write(&path, "queue_name = \"other\"\nqueue_capacity = 8\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.queue_name, "other");
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.idle_timeout_ms, default_idle_timeout_ms());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config { queue_capacity: 16, log_level: "debug".to_string(), ..Config::default() };
        config.save_to_file(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_capacity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "queue_capacity = 500\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("explicit.toml");
        std::fs::write(&path, "max_workers = 3\n").unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().max_workers, 3);
    }
}
