//! Runner Configuration
//!
//! Configuration for the host runner and the machine it drives. Values can be
//! set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RILL_BUFFER_SIZE` | Requested serialization buffer size in bytes (at least 4096) | 4096 |
//! | `RILL_MAX_STEPS` | Maximum resume legs per run (0 = unlimited) | 100000 |
//! | `RILL_MAX_CALL_DEPTH` | Maximum machine call depth | 1024 |
//! | `RILL_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust
//! use rill_runtime::config::RunnerConfig;
//!
//! let config = RunnerConfig::builder()
//!     .max_steps(64)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.max_steps, 64);
//! ```

use std::env;

use thiserror::Error;

use crate::wire::MIN_BUFFER_SIZE;

/// Log level for runner logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// The directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Host runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Requested serialization buffer size. The effective size is never
    /// below [`MIN_BUFFER_SIZE`].
    pub buffer_size: usize,

    /// Upper bound on resume legs in one run. 0 disables the bound.
    pub max_steps: usize,

    /// Upper bound on nested machine calls.
    pub max_call_depth: usize,

    pub log_level: LogLevel,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            buffer_size: MIN_BUFFER_SIZE,
            max_steps: 100_000,
            max_call_depth: 1024,
            log_level: LogLevel::Info,
        }
    }
}

impl RunnerConfig {
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("RILL_BUFFER_SIZE") {
            config.buffer_size = val.max(MIN_BUFFER_SIZE);
        }

        if let Some(val) = parse_env_usize("RILL_MAX_STEPS") {
            config.max_steps = val;
        }

        if let Some(val) = parse_env_usize("RILL_MAX_CALL_DEPTH") {
            if val > 0 {
                config.max_call_depth = val;
            }
        }

        if let Ok(val) = env::var("RILL_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log_level = level;
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "buffer_size".into(),
                message: format!("must be at least {MIN_BUFFER_SIZE} bytes"),
            });
        }

        if self.max_call_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_call_depth".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Builder for [`RunnerConfig`].
#[derive(Debug, Default)]
pub struct RunnerConfigBuilder {
    config: RunnerConfig,
}

impl RunnerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn max_steps(mut self, steps: usize) -> Self {
        self.config.max_steps = steps;
        self
    }

    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.config.max_call_depth = depth;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<RunnerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}
