//! Unified logging module for the CAN bus runtime
//!
//! Console output uses a compact `timestamp [LEVEL] message` layout, an optional
//! daily rolling file receives the same events through a non-blocking writer.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use errors::{CanError, CanResult};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809123Z [INFO] Cyclic send task for 0x123 started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Logging configuration, deserialized as part of the runtime config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (e.g. `info` or `info,canbus=debug`). `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of the bracketed text layout
    pub json: bool,
    /// Enable ANSI colors on the console
    pub ansi: bool,
    /// Directory for the daily rolling log file; console only when absent
    pub dir: Option<PathBuf>,
    /// File name prefix for the rolling log file
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            ansi: true,
            dir: None,
            file_prefix: "canbus".to_string(),
        }
    }
}

// Keeps the non-blocking file writer alive for the life of the process
static FILE_GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

// Dynamic log level reload support
type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();

/// Initialize the global subscriber
///
/// Calling this more than once is harmless: later calls return `Ok(())`
/// without touching the already installed subscriber.
pub fn init_logging(config: &LoggingConfig) -> CanResult<()> {
    if LOG_FILTER_HANDLE.get().is_some() {
        return Ok(());
    }

    let env_filter = match std::env::var("RUST_LOG") {
        Ok(directive) if !directive.is_empty() => EnvFilter::try_new(directive),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| CanError::Configuration(format!("invalid log level: {}", e)))?;

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);

    let console_layer = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_ansi(config.ansi)
            .event_format(BracketedLevelFormat)
            .boxed()
    };

    let file_layer = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", config.file_prefix));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            match FILE_GUARD.get_or_init(|| Mutex::new(None)).lock() {
                Ok(mut slot) => *slot = Some(guard),
                Err(poisoned) => *poisoned.into_inner() = Some(guard),
            }
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed(),
            )
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| CanError::Configuration(format!("logging already initialized: {}", e)))?;

    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    tracing::debug!("Logging initialized at level {}", config.level);
    Ok(())
}

/// Dynamically set log filter level at runtime
///
/// # Example
/// ```ignore
/// common::logging::set_log_level("info,canbus=trace")?;
/// ```
pub fn set_log_level(level: &str) -> CanResult<()> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or_else(|| CanError::Configuration("logging not initialized".to_string()))?;

    let new_filter = EnvFilter::try_new(level)
        .map_err(|e| CanError::Configuration(format!("invalid log level '{}': {}", level, e)))?;

    handle
        .reload(new_filter)
        .map_err(|e| CanError::Configuration(format!("failed to reload log filter: {}", e)))?;

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.dir.is_none());
        assert!(!config.json);
    }

    #[test]
    fn test_set_level_before_init_fails() {
        // The global subscriber is never installed by this test binary
        assert!(matches!(
            set_log_level("debug"),
            Err(CanError::Configuration(_))
        ));
    }
}
