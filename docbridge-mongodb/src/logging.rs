//! Logging setup.
//!
//! The crate logs through `tracing`. This module installs a
//! `tracing-subscriber` (feature `tracing-subscriber`) configured from the
//! environment:
//!
//! - `DOCBRIDGE_DEBUG=true|1|yes` - enable debug logging
//! - `DOCBRIDGE_LOG_LEVEL=trace|debug|info|warn|error` - set the level
//! - `DOCBRIDGE_LOG_FORMAT=json|pretty|compact` - output format (default: json)
//!
//! ```rust,no_run
//! use docbridge_mongodb::logging;
//!
//! logging::init();
//! ```

use std::env;
use std::sync::Once;

/// Environment variable enabling debug logging.
pub const ENV_DEBUG: &str = "DOCBRIDGE_DEBUG";
/// Environment variable holding the log level.
pub const ENV_LOG_LEVEL: &str = "DOCBRIDGE_LOG_LEVEL";
/// Environment variable holding the log format.
pub const ENV_LOG_FORMAT: &str = "DOCBRIDGE_LOG_FORMAT";

static INIT: Once = Once::new();

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line human-readable output.
    Compact,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "pretty" => Self::Pretty,
            "compact" => Self::Compact,
            _ => Self::Json,
        }
    }
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Whether logging was requested at all.
    pub enabled: bool,
    /// Level directive.
    pub level: &'static str,
    /// Output format.
    pub format: LogFormat,
}

impl LogSettings {
    /// Read the settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_source(|name| env::var(name).ok())
    }

    /// Read the settings through `lookup`.
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let debug = lookup(ENV_DEBUG)
            .is_some_and(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"));
        let requested = lookup(ENV_LOG_LEVEL);
        let fallback = if debug { "debug" } else { "warn" };
        let level = requested.as_deref().map_or(fallback, |level| {
            parse_level(level).unwrap_or(fallback)
        });
        Self {
            enabled: debug || requested.is_some(),
            level,
            format: lookup(ENV_LOG_FORMAT)
                .map(|f| LogFormat::parse(&f))
                .unwrap_or_default(),
        }
    }

    /// Settings for an explicit level.
    pub fn with_level(level: &str) -> Self {
        Self {
            enabled: true,
            level: parse_level(level).unwrap_or("warn"),
            format: LogFormat::default(),
        }
    }
}

fn parse_level(level: &str) -> Option<&'static str> {
    match level.to_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

/// Install the subscriber from the environment. Subsequent calls are no-ops.
pub fn init() {
    init_with(LogSettings::from_env());
}

/// Install the subscriber at `level`.
pub fn init_with_level(level: &str) {
    init_with(LogSettings::with_level(level));
}

/// Install the subscriber with explicit settings.
pub fn init_with(settings: LogSettings) {
    INIT.call_once(|| {
        if !settings.enabled {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let level = settings.level;
            let filter = EnvFilter::try_new(format!("docbridge={level},docbridge_mongodb={level}"))
                .unwrap_or_else(|_| EnvFilter::new("warn"));

            match settings.format {
                LogFormat::Json => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                LogFormat::Compact => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().compact())
                        .init();
                }
                LogFormat::Pretty => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().pretty())
                        .init();
                }
            }

            tracing::info!(level, format = ?settings.format, "docbridge logging initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::from_source(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_disabled_by_default() {
        let s = settings(&[]);
        assert!(!s.enabled);
        assert_eq!(s.level, "warn");
        assert_eq!(s.format, LogFormat::Json);
    }

    #[test]
    fn test_debug_flag() {
        let s = settings(&[(ENV_DEBUG, "YES")]);
        assert!(s.enabled);
        assert_eq!(s.level, "debug");
    }

    #[test]
    fn test_level_and_format() {
        let s = settings(&[(ENV_LOG_LEVEL, "Info"), (ENV_LOG_FORMAT, "compact")]);
        assert!(s.enabled);
        assert_eq!(s.level, "info");
        assert_eq!(s.format, LogFormat::Compact);

        let s = settings(&[(ENV_LOG_LEVEL, "loud")]);
        assert_eq!(s.level, "warn");
    }

    #[test]
    fn test_with_level() {
        assert_eq!(LogSettings::with_level("TRACE").level, "trace");
    }
}
