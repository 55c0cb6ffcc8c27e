//! Configuration loading helper functions
//!
//! Layers, lowest priority first: struct defaults, an optional config file
//! (format picked by extension), then prefixed environment variables.

use std::path::Path;

use errors::{CanError, CanResult};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Build the layered figment without extracting it
///
/// Nested keys in the environment are separated by a double underscore, so
/// `CANBUS_NOTIFIER__TIMEOUT_MS=250` overrides `notifier.timeout_ms`.
pub fn layered_figment<T>(path: Option<&Path>, env_prefix: &str) -> CanResult<Figment>
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        figment = merge_file(figment, path)?;
        info!("Loading configuration from {}", path.display());
    }

    debug!("Applying environment overrides with prefix {}", env_prefix);
    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load configuration with priority: ENV > file > defaults
pub fn load_config<T>(path: Option<&Path>, env_prefix: &str) -> CanResult<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    layered_figment::<T>(path, env_prefix)?
        .extract()
        .map_err(|e| CanError::Configuration(format!("Failed to load configuration: {}", e)))
}

/// Load configuration from a specific file only, ignoring the environment
pub fn load_config_from_file<T, P>(path: P) -> CanResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    merge_file(Figment::new(), path)?.extract().map_err(|e| {
        CanError::Configuration(format!(
            "Failed to load configuration from {}: {}",
            path.display(),
            e
        ))
    })
}

fn merge_file(figment: Figment, path: &Path) -> CanResult<Figment> {
    if !path.exists() {
        return Err(CanError::Configuration(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CanError::Configuration("Config file must have an extension".to_string()))?;

    match extension {
        "toml" => Ok(figment.merge(Toml::file(path))),
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        "json" => Ok(figment.merge(Json::file(path))),
        _ => Err(CanError::Configuration(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Sample {
        timeout_ms: u64,
        name: String,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                timeout_ms: 1000,
                name: "vcan0".to_string(),
            }
        }
    }

    #[test]
    fn test_defaults_without_file() {
        let sample: Sample = load_config(None, "COMMON_TEST_DEFAULTS_").unwrap();
        assert_eq!(sample, Sample::default());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "timeout_ms: 250").unwrap();

        let sample: Sample = load_config(Some(file.path()), "COMMON_TEST_YAML_").unwrap();
        assert_eq!(sample.timeout_ms, 250);
        assert_eq!(sample.name, "vcan0");
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let result: CanResult<Sample> = load_config_from_file(file.path());
        assert!(matches!(result, Err(CanError::Configuration(_))));
    }

    #[test]
    fn test_missing_file() {
        let result: CanResult<Sample> =
            load_config(Some(Path::new("/nonexistent/canbus.yaml")), "COMMON_TEST_MISSING_");
        assert!(result.is_err());
    }
}
