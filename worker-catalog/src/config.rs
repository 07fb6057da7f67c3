use crate::error::{ConfigError, LimiterError};
use crate::limiter::ConcurrencyLimiter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// How the delay between attempts evolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay between every attempt
    #[default]
    Fixed,
    /// Delay doubles after each attempt, capped at `max_delay_ms`
    Exponential,
}

/// Bounded attempts with a delay between them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            backoff: Backoff::Fixed,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: initial.as_millis() as u64,
            backoff: Backoff::Exponential,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let ms = match self.backoff {
            Backoff::Fixed => self.delay_ms,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                self.delay_ms
                    .saturating_mul(1u64 << shift)
                    .min(self.max_delay_ms)
            }
        };
        Duration::from_millis(ms)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidAttempts {
                field: field.to_string(),
            });
        }
        Ok(())
    }
}

/// Policies used by the worker catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// How long `stop` waits for a still-starting worker to register
    pub registration_wait: RetryPolicy,
    /// How often `stop` retries a failing `Worker::stop`
    pub stop_retry: RetryPolicy,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            registration_wait: RetryPolicy::fixed(10, Duration::from_secs(1)),
            stop_retry: RetryPolicy::fixed(5, Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub capacity: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: crate::limiter::DEFAULT_CAPACITY,
        }
    }
}

impl LimiterConfig {
    /// The shared permit pool for outbound worker calls
    pub fn build(&self) -> Result<ConcurrencyLimiter, LimiterError> {
        ConcurrencyLimiter::new(self.capacity)
    }
}

/// How to launch an out-of-process analysis worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    /// `{session}` and `{name}` are replaced with the session id and name
    pub args: Vec<String>,
    /// Stdout line fragment announcing readiness. Empty means ready once spawned.
    pub ready_marker: String,
    pub startup_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub working_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "analysis-server".to_string(),
            args: vec!["--session".to_string(), "{session}".to_string()],
            ready_marker: "ready".to_string(),
            startup_timeout_secs: 30,
            stop_timeout_secs: 5,
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub catalog: CatalogConfig,
    pub limiter: LimiterConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Default location: `<config dir>/session-analyzer/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("session-analyzer").join("config.toml"))
    }

    /// Load from `path`, or from the default location when it exists, or fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => path,
                None => {
                    debug!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.catalog
            .registration_wait
            .validate("catalog.registration_wait")?;
        self.catalog.stop_retry.validate("catalog.stop_retry")?;
        if self.limiter.capacity == 0 {
            return Err(ConfigError::InvalidCapacity {
                capacity: self.limiter.capacity,
            });
        }
        if self.worker.startup_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout {
                field: "worker.startup_timeout_secs".to_string(),
            });
        }
        if self.worker.stop_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout {
                field: "worker.stop_timeout_secs".to_string(),
            });
        }
        if self.worker.command.trim().is_empty() {
            return Err(ConfigError::MissingRequiredField {
                field: "worker.command".to_string(),
            });
        }
        Ok(())
    }
}
