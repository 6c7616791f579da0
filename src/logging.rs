// Logging setup for the surrogate binary
// The library only emits `tracing` events; installing a subscriber is left to
// the binary.

use std::collections::BTreeMap;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to emit JSON formatted logs
    pub json_format: bool,

    /// Module-specific log levels
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = BTreeMap::new();
        module_levels.insert("hyper".to_string(), "warn".to_string());
        module_levels.insert("reqwest".to_string(), "warn".to_string());
        module_levels.insert("rustls".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            module_levels,
        }
    }
}

impl LoggingConfig {
    /// `RUST_LOG` when set, otherwise the configured level plus module overrides.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }

        let mut filter = EnvFilter::try_new(&self.level)
            .map_err(|e| Error::Logging(format!("Invalid log level '{}': {}", self.level, e)))?;
        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level);
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| Error::Logging(format!("Invalid log directive '{}': {}", directive, e)))?,
            );
        }
        Ok(filter)
    }
}

/// Install the global subscriber. Output goes to stderr so reports printed on
/// stdout stay clean. A second call is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = config.env_filter()?;

    let result = if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };

    match result {
        Ok(()) => tracing::debug!("Logging initialized at level {}", config.level),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }
    Ok(())
}
