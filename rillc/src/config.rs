//! Compiler Configuration
//!
//! Settings for the effect subsystem. Values can be set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RILL_BACKEND` | Continuation backend (`interp`/`structural`) | structural |
//! | `RILL_BUFFER_SIZE` | Serialization buffer size in bytes (at least 4096) | 4096 |
//! | `RILL_EXHAUSTIVE_HANDLERS` | Report body operations no clause handles ("true"/"false") | true |
//! | `RILL_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |

use std::env;
use std::fmt;
use std::str::FromStr;

use rill_runtime::config::LogLevel;
use rill_runtime::wire::MIN_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which continuation backend gives effectful functions their shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Backend {
    /// Tree-walking reference evaluator.
    Interp,
    /// Resumable entry points in the target module.
    #[default]
    Structural,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "interp" | "interpreter" | "reference" => Ok(Backend::Interp),
            "structural" | "trampoline" => Ok(Backend::Structural),
            other => Err(ConfigError::InvalidValue {
                field: "backend".into(),
                message: format!("unknown backend `{other}`"),
            }),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Interp => f.write_str("interp"),
            Backend::Structural => f.write_str("structural"),
        }
    }
}

/// Compiler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    pub backend: Backend,

    /// Requested serialization buffer size for emitted modules.
    pub buffer_size: usize,

    /// When set, operations a guarded body performs that no clause handles
    /// are reported as `unhandled-effects`. When cleared they propagate into
    /// the handler's row.
    pub exhaustive_handlers: bool,

    pub log_level: LogLevel,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Structural,
            buffer_size: MIN_BUFFER_SIZE,
            exhaustive_handlers: true,
            log_level: LogLevel::Info,
        }
    }
}

impl CompilerConfig {
    pub fn builder() -> CompilerConfigBuilder {
        CompilerConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("RILL_BACKEND") {
            if let Ok(backend) = val.parse() {
                config.backend = backend;
            }
        }

        if let Some(val) = env::var("RILL_BUFFER_SIZE").ok().and_then(|s| s.parse::<usize>().ok()) {
            config.buffer_size = val.max(MIN_BUFFER_SIZE);
        }

        if let Some(val) = parse_env_bool("RILL_EXHAUSTIVE_HANDLERS") {
            config.exhaustive_handlers = val;
        }

        if let Ok(val) = env::var("RILL_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log_level = level;
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "buffer_size".into(),
                message: format!("must be at least {MIN_BUFFER_SIZE} bytes"),
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

/// Builder for [`CompilerConfig`].
#[derive(Debug, Default)]
pub struct CompilerConfigBuilder {
    config: CompilerConfig,
}

impl CompilerConfigBuilder {
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn exhaustive_handlers(mut self, enabled: bool) -> Self {
        self.config.exhaustive_handlers = enabled;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn build(self) -> Result<CompilerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}
