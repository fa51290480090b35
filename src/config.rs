use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::backoff::BackoffStrategy;
use crate::orchestration::coordinator::CoordinatorConfig;
use crate::orchestration::health::HealthConfig;
use crate::orchestration::restart::RestartPolicy;
use crate::transport::DEFAULT_MAX_FRAME_LEN;
use crate::{Error, Result};

/// Worker CLI launched when the configuration names none.
pub const DEFAULT_WORKER_COMMAND: &str = "claude";

pub const DEFAULT_MAX_WORKERS: usize = 4;

pub const DEFAULT_EVENT_BUFFER: usize = 1024;

const SOCKET_FILE: &str = "conductor.sock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_workers: usize,
    /// Defaults to `~/.conductor/conductor.sock`.
    pub socket_path: Option<String>,
    pub worker: WorkerConfig,
    pub health: HealthConfig,
    pub restart: RestartPolicy,
    pub coordinator: CoordinatorConfig,
    pub transport: TransportConfig,
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            socket_path: None,
            worker: WorkerConfig::default(),
            health: HealthConfig::default(),
            restart: RestartPolicy::default(),
            coordinator: CoordinatorConfig::default(),
            transport: TransportConfig::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: Option<String>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl WorkerConfig {
    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_WORKER_COMMAND)
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        self.working_dir.as_deref().map(expand_tilde)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_frame_len: usize,
    pub connect_attempts: u32,
    pub connect_backoff: BackoffStrategy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_attempts: 5,
            connect_backoff: BackoffStrategy::exponential(
                Duration::from_millis(100),
                2,
                Duration::from_secs(2),
            ),
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.socket_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::conductor_dir()?.join(SOCKET_FILE)),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_workers = config.max_workers,
            command = config.worker.effective_command(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(invalid("max_workers must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(invalid("event_buffer must be at least 1"));
        }
        if self.worker.effective_command().trim().is_empty() {
            return Err(invalid("worker.command must not be empty"));
        }
        if self.health.check_interval.is_zero() {
            return Err(invalid("health.check_interval_ms must be positive"));
        }
        if self.health.stale_heartbeat_after.is_zero() {
            return Err(invalid("health.stale_heartbeat_ms must be positive"));
        }
        if self.health.check_timeout.is_zero() {
            return Err(invalid("health.check_timeout_ms must be positive"));
        }
        if let Some(cpu) = self.health.limits.max_cpu_percent {
            if !(cpu > 0.0 && cpu.is_finite()) {
                return Err(invalid("health.limits.max_cpu_percent must be positive"));
            }
        }
        if self.health.limits.max_memory_mb == Some(0) {
            return Err(invalid("health.limits.max_memory_mb must be positive"));
        }
        if self.restart.window.is_zero() {
            return Err(invalid("restart.window_ms must be positive"));
        }
        if self.coordinator.deadlock_check_interval.is_zero() {
            return Err(invalid("coordinator.deadlock_check_interval_ms must be positive"));
        }
        if let (Some(stale), Some(timeout)) = (
            self.coordinator.lock_stale_after,
            self.coordinator.lock_timeout,
        ) {
            if stale > timeout {
                return Err(invalid(
                    "coordinator.lock_stale_after_ms must not exceed lock_timeout_ms",
                ));
            }
        }
        if self.transport.max_frame_len < 64 {
            return Err(invalid("transport.max_frame_len must be at least 64 bytes"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::Validation(message.to_string())
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
        assert!(config.socket_path.is_none());
        assert_eq!(config.worker.effective_command(), "claude");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/foo/bar");
        assert!(expanded.ends_with("foo/bar"));
        assert!(!expanded.to_string_lossy().contains('~'));

        let absolute = expand_tilde("/absolute/path");
        assert_eq!(absolute, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.max_workers = 8;
        config.worker.command = Some("claude --print".to_string());
        config.worker.env.insert("FOO".into(), "bar".into());
        config.restart.backoff = BackoffStrategy::linear(
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );

        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            max_workers = 2

            [health]
            check_interval_ms = 1000

            [coordinator]
            lock_timeout_ms = 120000
            "#,
        )
        .unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.health.check_interval, Duration::from_secs(1));
        assert_eq!(config.coordinator.lock_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.restart, RestartPolicy::default());
        assert_eq!(config.event_buffer, DEFAULT_EVENT_BUFFER);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.max_workers = 0;
        assert!(matches!(config.validate(), Err(Error::Validation(_))));

        let mut config = Config::default();
        config.health.check_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.health.limits.max_cpu_percent = Some(-5.0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.coordinator.lock_stale_after = Some(Duration::from_secs(100));
        config.coordinator.lock_timeout = Some(Duration::from_secs(10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_and_save_to() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("conductor.toml");
        let mut config = Config::default();
        config.socket_path = Some("/tmp/conductor-test.sock".into());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            loaded.socket_path().unwrap(),
            PathBuf::from("/tmp/conductor-test.sock")
        );
    }

    #[test]
    fn test_load_from_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        fs::write(&path, "max_workers = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
