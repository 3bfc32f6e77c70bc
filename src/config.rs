//! Configuration module
//!
//! Provides structured configuration for the chainsight CLI.
//! Configuration can be loaded from:
//! 1. Default values (hardcoded)
//! 2. config.toml file (optional)
//! 3. Environment variables with CHS__ prefix
//!
//! Example environment variable override:
//! CHS__LOGGING__LEVEL=debug
//! CHS__CORRELATION__WINDOW_SECONDS=120

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub rules: RulesConfig,
    pub correlation: CorrelationConfig,
    pub logging: LogConfig,
}

/// Detection rule loading configuration
#[derive(Debug, Deserialize)]
pub struct RulesConfig {
    pub path: PathBuf,
}

/// Correlation engine configuration
#[derive(Debug, Deserialize)]
pub struct CorrelationConfig {
    /// Half-width of the anchor proximity window, in seconds.
    pub window_seconds: u64,
}

/// Operational logging configuration
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub directory: PathBuf,
    pub filename: String,
    pub console_output: bool,
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and environment variables
    pub fn new() -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            // --- Defaults ---
            .set_default("rules.path", "rules")?
            .set_default("correlation.window_seconds", 300)?
            .set_default("logging.level", "info")?
            .set_default("logging.directory", "logs")?
            .set_default("logging.filename", "chainsight.log")?
            .set_default("logging.console_output", true)?
            // --- Sources ---
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("CHS").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rules: RulesConfig {
                path: PathBuf::from("rules"),
            },
            correlation: CorrelationConfig {
                window_seconds: 300,
            },
            logging: LogConfig {
                level: "info".to_string(),
                directory: PathBuf::from("logs"),
                filename: "chainsight.log".to_string(),
                console_output: true,
            },
        }
    }
}
