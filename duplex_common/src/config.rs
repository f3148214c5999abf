//! Configuration loading traits and types.
//!
//! Every duplex binary reads a single TOML file made of a `[shared]`
//! section (logging, instance name) and application sections such as
//! `[channel]`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use duplex_common::config::{ConfigError, ConfigLoader, SharedConfig};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct DriverConfig {
//!     shared: SharedConfig,
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = DriverConfig::load(Path::new("duplex.toml"))?;
//!     println!("Instance: {}", config.shared.instance_name);
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the given path.
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log verbosity, lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Development detail.
    Debug,
    /// Normal operation.
    #[default]
    Info,
    /// Potential problems.
    Warn,
    /// Serious problems only.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Fields common to every duplex configuration file.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// instance_name = "apb-run-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Human readable identifier of this run, echoed in logs.
    pub instance_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `instance_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "instance_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            instance_name: "duplex".to_string(),
        }
    }
}

/// Loads any `DeserializeOwned` type from a TOML file.
///
/// - `ConfigError::FileNotFound` if the file does not exist
/// - `ConfigError::ParseError` if it cannot be read or is not valid TOML
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from an in-memory TOML string.
    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[derive(Debug, Deserialize)]
    struct Wrapper {
        shared: SharedConfig,
    }

    #[test]
    fn test_log_level_default_is_info() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::default().as_directive(), "info");
    }

    #[test]
    fn test_log_level_lowercase_in_toml() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Level {
            level: LogLevel,
        }

        for (text, expected) in [
            ("trace", LogLevel::Trace),
            ("debug", LogLevel::Debug),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
        ] {
            let parsed = Level::from_toml(&format!("level = \"{text}\"")).unwrap();
            assert_eq!(parsed.level, expected);
            assert_eq!(expected.as_directive(), text);
        }
    }

    #[test]
    fn test_shared_config_rejects_blank_instance() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            instance_name: "   ".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(SharedConfig::default().validate().is_ok());
    }

    #[test]
    fn test_loader_missing_file() {
        let result = Wrapper::load(Path::new("/nonexistent/duplex.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[shared\ninstance_name = ").unwrap();

        let result = Wrapper::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_loader_default_log_level() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[shared]\ninstance_name = \"apb\"\n").unwrap();
        file.flush().unwrap();

        let config = Wrapper::load(file.path()).unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Info);
        assert_eq!(config.shared.instance_name, "apb");
    }
}
