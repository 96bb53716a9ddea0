//! Runtime settings for the superstep loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessError, ProcessResult};
use crate::log::LogLevel;

pub const DEFAULT_MAX_SUPERSTEPS: u32 = 100;
pub const DEFAULT_KEEP_ALIVE_POLL_INTERVAL_MS: u64 = 50;

/// Settings shared by every process driven through one runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Upper bound on supersteps per run. A run that reaches it stops without error.
    pub max_supersteps: u32,
    /// How long an idle keep-alive loop waits before polling for input again.
    pub keep_alive_poll_interval_ms: u64,
    /// Minimum level forwarded by the default logger.
    pub log_level: LogLevel,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_supersteps: DEFAULT_MAX_SUPERSTEPS,
            keep_alive_poll_interval_ms: DEFAULT_KEEP_ALIVE_POLL_INTERVAL_MS,
            log_level: LogLevel::Info,
        }
    }
}

impl ProcessConfig {
    /// Builder: set the superstep limit.
    pub fn with_max_supersteps(mut self, max_supersteps: u32) -> Self {
        self.max_supersteps = max_supersteps;
        self
    }

    /// Builder: set the idle poll interval, saturating at `u64::MAX` milliseconds.
    pub fn with_keep_alive_poll_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Builder: set the default logger's minimum level.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// The idle poll interval as a `Duration`.
    pub fn keep_alive_poll_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_poll_interval_ms)
    }

    /// Reject a zero superstep limit or a zero poll interval.
    pub fn validate(&self) -> ProcessResult<()> {
        if self.max_supersteps == 0 {
            return Err(ProcessError::Config(
                "max_supersteps must be greater than zero".into(),
            ));
        }
        if self.keep_alive_poll_interval_ms == 0 {
            return Err(ProcessError::Config(
                "keep_alive_poll_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate YAML. Missing fields take their defaults.
    pub fn from_yaml_str(source: &str) -> ProcessResult<Self> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate JSON. Missing fields take their defaults.
    pub fn from_json_str(source: &str) -> ProcessResult<Self> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension.
    #[cfg(feature = "native")]
    pub async fn load(path: impl AsRef<std::path::Path>) -> ProcessResult<Self> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path).await?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&source),
            _ => Self::from_yaml_str(&source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ProcessConfig::default();
        assert_eq!(config.max_supersteps, 100);
        assert_eq!(config.keep_alive_poll_interval(), Duration::from_millis(50));
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn yaml_partial_fills_defaults() {
        let config = ProcessConfig::from_yaml_str("max_supersteps: 7\n").unwrap();
        assert_eq!(config.max_supersteps, 7);
        assert_eq!(config.keep_alive_poll_interval_ms, 50);
    }

    #[test]
    fn json_with_log_level() {
        let config =
            ProcessConfig::from_json_str(r#"{"log_level": "debug", "keep_alive_poll_interval_ms": 5}"#)
                .unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.keep_alive_poll_interval(), Duration::from_millis(5));
    }

    #[test]
    fn poll_interval_builder_saturates() {
        let config = ProcessConfig::default().with_keep_alive_poll_interval(Duration::from_millis(7));
        assert_eq!(config.keep_alive_poll_interval_ms, 7);

        let config = ProcessConfig::default().with_keep_alive_poll_interval(Duration::MAX);
        assert_eq!(config.keep_alive_poll_interval_ms, u64::MAX);
    }

    #[test]
    fn log_level_builder() {
        let config = ProcessConfig::default().with_log_level(LogLevel::Trace);
        assert_eq!(config.log_level, LogLevel::Trace);
        assert_eq!(config.with_max_supersteps(3).max_supersteps, 3);
    }

    #[test]
    fn zero_supersteps_rejected() {
        let err = ProcessConfig::from_yaml_str("max_supersteps: 0").unwrap_err();
        assert!(matches!(err, ProcessError::Config(_)));
    }

    #[test]
    fn malformed_yaml_is_yaml_error() {
        let err = ProcessConfig::from_yaml_str("max_supersteps: [").unwrap_err();
        assert!(matches!(err, ProcessError::Yaml(_)));
    }

    #[cfg(feature = "native")]
    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process.yaml");
        tokio::fs::write(&path, "max_supersteps: 3\nlog_level: warn\n")
            .await
            .unwrap();
        let config = ProcessConfig::load(&path).await.unwrap();
        assert_eq!(config.max_supersteps, 3);
        assert_eq!(config.log_level, LogLevel::Warn);
    }
}
