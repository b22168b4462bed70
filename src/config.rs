//! Configuration types.
//!
//! Every struct has sensible defaults; `AppConfig::from_env()` overlays
//! `ACTION_FLAGS_*` environment variables on top of them.

use std::path::PathBuf;
use std::time::Duration;

use crate::bus::DEFAULT_WATCH_CAPACITY;
use crate::error::ConfigError;
use crate::flags::DEFAULT_FLAG_TTL;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// TTL applied when `set_flag` is called without one.
    pub default_ttl: Duration,
    /// How often `wait_for_completion` re-checks the store.
    pub poll_interval: Duration,
    /// Lifetime of read-cache entries.
    pub cache_ttl: Duration,
    /// Capacity of the event bus broadcast tap.
    pub event_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_FLAG_TTL,
            poll_interval: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(300), // 5 minutes
            event_buffer: DEFAULT_WATCH_CAPACITY,
        }
    }
}

/// Background expiry sweep and retention.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between expiry sweeps.
    pub sweep_interval: Duration,
    /// Delete terminal flags older than this. `None` keeps them forever.
    pub retention: Option<Duration>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            retention: None,
        }
    }
}

/// Worker runner tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Fallback poll for pending flags whose wake-up event was missed.
    pub poll_interval: Duration,
    /// Run the built-in echo worker for `test` flags (smoke testing).
    pub echo_test_flags: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            echo_test_flags: false,
        }
    }
}

/// Process-level settings for the daemon.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/action-flags.db"),
            port: 8080,
        }
    }
}

/// Everything the binary needs.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub coordinator: CoordinatorConfig,
    pub maintenance: MaintenanceConfig,
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("ACTION_FLAGS_DB_PATH") {
            config.server.db_path = PathBuf::from(path);
        }
        if let Some(port) = parse::<u16>(&lookup, "ACTION_FLAGS_PORT")? {
            config.server.port = port;
        }
        if let Some(secs) = parse::<u64>(&lookup, "ACTION_FLAGS_DEFAULT_TTL_SECS")? {
            config.coordinator.default_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "ACTION_FLAGS_POLL_INTERVAL_MS")? {
            config.coordinator.poll_interval =
                Duration::from_millis(positive(ms, "ACTION_FLAGS_POLL_INTERVAL_MS")?);
        }
        if let Some(secs) = parse::<u64>(&lookup, "ACTION_FLAGS_CACHE_TTL_SECS")? {
            config.coordinator.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "ACTION_FLAGS_SWEEP_INTERVAL_SECS")? {
            config.maintenance.sweep_interval =
                Duration::from_secs(positive(secs, "ACTION_FLAGS_SWEEP_INTERVAL_SECS")?);
        }
        if let Some(days) = parse::<u64>(&lookup, "ACTION_FLAGS_RETENTION_DAYS")? {
            let secs = days
                .checked_mul(SECS_PER_DAY)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "ACTION_FLAGS_RETENTION_DAYS".to_string(),
                    message: format!("{days} days is out of range"),
                })?;
            config.maintenance.retention = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = parse::<u64>(&lookup, "ACTION_FLAGS_WORKER_POLL_SECS")? {
            config.worker.poll_interval =
                Duration::from_secs(positive(secs, "ACTION_FLAGS_WORKER_POLL_SECS")?);
        }
        if let Some(echo) = parse::<bool>(&lookup, "ACTION_FLAGS_ECHO_WORKER")? {
            config.worker.echo_test_flags = echo;
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}

/// Intervals of zero would make `tokio::time::interval` panic.
fn positive(value: u64, key: &str) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
