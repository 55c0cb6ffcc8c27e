//! Runtime configuration
//!
//! Loaded through `common::config_loader`: defaults, then an optional YAML/TOML/JSON
//! file, then `CANBUS_*` environment variables (`CANBUS_NOTIFIER__TIMEOUT_MS=250`).

use std::path::Path;
use std::time::Duration;

use common::{load_config, LoggingConfig};
use errors::{CanError, CanResult};
use serde::{Deserialize, Serialize};

use crate::filter::FilterSet;
use crate::notifier::NotifierOptions;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CANBUS_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Poll timeout of each receive call
    pub timeout_ms: u64,
    /// How long `stop` waits for receive loops
    pub stop_timeout_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            stop_timeout_ms: 5000,
        }
    }
}

impl NotifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn options(&self) -> NotifierOptions {
        NotifierOptions {
            timeout: self.timeout(),
            ..NotifierOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    pub timeout_ms: u64,
    /// Stop cyclic reception after this long; unlimited when absent
    pub duration_ms: Option<u64>,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            duration_ms: None,
        }
    }
}

impl ReceiveConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

/// Top level configuration of a bus runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub logging: LoggingConfig,
    pub notifier: NotifierConfig,
    pub receive: ReceiveConfig,
    /// Receive filters applied to every bus opened with this config
    pub filters: Option<FilterSet>,
}

impl RuntimeConfig {
    /// Load and validate; `path` is optional, the environment always applies
    pub fn load(path: Option<&Path>) -> CanResult<Self> {
        let config: Self = load_config(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CanResult<()> {
        if self.notifier.timeout_ms == 0 {
            return Err(CanError::Configuration(
                "notifier.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(CanError::Configuration(
                "logging.level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::filter::CanFilter;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.notifier.timeout(), Duration::from_secs(1));
        assert_eq!(config.notifier.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.receive.timeout(), Duration::from_millis(100));
        assert!(config.receive.duration().is_none());
        assert!(config.filters.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
logging:
  level: debug
notifier:
  timeout_ms: 250
receive:
  duration_ms: 2000
filters:
  - can_id: 256
    can_mask: 2047
  - can_id: 419364864
    can_mask: 536805376
    extended: true
"#
        )
        .unwrap();

        let config = RuntimeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.notifier.timeout_ms, 250);
        assert_eq!(config.notifier.stop_timeout_ms, 5000);
        assert_eq!(config.receive.duration(), Some(Duration::from_secs(2)));
        assert_eq!(config.notifier.options().timeout, Duration::from_millis(250));

        let filters = config.filters.unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(
            filters.iter().next(),
            Some(&CanFilter::new(0x100, 0x7FF))
        );
    }

    #[test]
    fn test_zero_notifier_timeout_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[notifier]\ntimeout_ms = 0").unwrap();

        let err = RuntimeConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, CanError::Configuration(_)));
    }
}
