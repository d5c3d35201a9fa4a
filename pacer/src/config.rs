//! Pacer configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::scheduler::SchedulerConfig;

/// Main Pacer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Token bucket and scheduler settings
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().context("Invalid scheduler section")?;
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .pacer.yml
        let local_config = PathBuf::from(".pacer.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/pacer/pacer.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("pacer").join("pacer.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Peek at the logging section before logging is initialized
    ///
    /// Errors are swallowed here; `load` reports them once logging is up.
    pub fn load_logging(config_path: Option<&PathBuf>) -> LoggingConfig {
        let path = match config_path {
            Some(path) => path.clone(),
            None => PathBuf::from(".pacer.yml"),
        };
        Self::load_from_file(&path).map(|c| c.logging).unwrap_or_default()
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: Option<String>,

    /// Directory for pacer.log; defaults to the platform data dir
    pub dir: Option<PathBuf>,
}

impl LoggingConfig {
    /// Directory the log file is written to
    pub fn log_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pacer")
                .join("logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert!(config.logging.level.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_explicit_path() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "scheduler:\n  max-tokens: 3\n  refill-rate-per-sec: 0.5\nlogging:\n  level: debug\n"
        )
        .expect("write config");

        let path = file.path().to_path_buf();
        let config = Config::load(Some(&path)).expect("load config");
        assert_eq!(config.scheduler.max_tokens, 3);
        assert_eq!(config.scheduler.refill_rate_per_sec, 0.5);
        assert!(config.scheduler.start_full);
        assert_eq!(config.logging.level.as_deref(), Some("debug"));

        assert_eq!(Config::load_logging(Some(&path)).level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let path = PathBuf::from("/nonexistent/pacer/config.yml");
        assert!(Config::load(Some(&path)).is_err());
        assert_eq!(Config::load_logging(Some(&path)), LoggingConfig::default());
    }

    #[test]
    fn test_validate_reports_bad_scheduler() {
        let mut config = Config::default();
        config.scheduler.refill_rate_per_sec = 0.0;
        let err = config.validate().expect_err("zero rate should be rejected");
        assert!(format!("{:#}", err).contains("refill-rate-per-sec"));
    }

    #[test]
    fn test_log_dir_override() {
        let logging = LoggingConfig {
            level: None,
            dir: Some(PathBuf::from("/tmp/pacer-logs")),
        };
        assert_eq!(logging.log_dir(), PathBuf::from("/tmp/pacer-logs"));
    }
}
