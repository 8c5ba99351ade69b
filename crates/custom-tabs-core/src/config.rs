//! Configuration management for custom-tabs
//!
//! Handles loading and validation of `ctabs.toml` configuration files.
//! Every section defaults, so an empty file is a valid configuration.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "CTABS_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings
    pub logging: LogConfig,

    /// Request throttling backoff curve
    pub throttle: ThrottleConfig,

    /// Verified-origin cache
    pub verification: VerificationConfig,

    /// Speculation policy
    pub speculation: SpeculationConfig,

    /// Coordinator channel sizing
    pub connection: ConnectionConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Backoff curve for speculative-navigation requests.
///
/// Consecutive unconfirmed predictions double the delay starting from
/// `min_delay_ms`, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Recent predictions kept per client.
    pub history_len: usize,
    /// Idle time after which a client's miss streak is forgotten.
    pub forget_after_ms: u64,
    /// Clients tracked at once; least recently seen are evicted first.
    pub max_tracked_clients: usize,
    /// EWMA weight of the newest outcome in the trust score.
    pub trust_alpha: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 10_000,
            history_len: 8,
            forget_after_ms: 30_000,
            max_tracked_clients: 256,
            trust_alpha: 0.1,
        }
    }
}

/// Verified-origin cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// How long a verification result is trusted before revalidation.
    pub freshness_secs: u64,
    pub cache_capacity: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 24 * 60 * 60,
            cache_capacity: 512,
        }
    }
}

/// Speculation policy defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculationConfig {
    /// Site-level "network prediction" preference. When false nothing is
    /// speculated or preconnected.
    pub network_prediction_enabled: bool,
    /// Reserve a spare renderer when a client calls warmup.
    pub spare_renderer_on_warmup: bool,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            network_prediction_enabled: true,
            spare_renderer_on_warmup: true,
        }
    }
}

/// Coordinator channel capacities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub command_buffer: usize,
    /// Per-client event queue; events beyond this are dropped with a warning.
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            command_buffer: 256,
            event_buffer: 64,
        }
    }
}

impl Config {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Load from the resolved path, falling back to defaults when no file exists.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match resolve_config_path(explicit) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.throttle;
        if t.min_delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "throttle.min_delay_ms must be positive".to_string(),
            ));
        }
        if t.min_delay_ms > t.max_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "throttle.min_delay_ms ({}) exceeds throttle.max_delay_ms ({})",
                t.min_delay_ms, t.max_delay_ms
            )));
        }
        if t.history_len == 0 || t.max_tracked_clients == 0 {
            return Err(ConfigError::ValidationError(
                "throttle.history_len and throttle.max_tracked_clients must be positive"
                    .to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&t.trust_alpha) {
            return Err(ConfigError::ValidationError(format!(
                "throttle.trust_alpha ({}) must be within [0, 1]",
                t.trust_alpha
            )));
        }
        if self.verification.cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "verification.cache_capacity must be positive".to_string(),
            ));
        }
        if self.connection.command_buffer == 0 || self.connection.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "connection buffers must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve which config file to read.
///
/// Order: explicit path, `$CTABS_CONFIG`, then `<config dir>/ctabs/ctabs.toml`
/// if it exists. An explicit or env path is returned even when missing so the
/// caller reports it.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let default = dirs::config_dir()?.join("ctabs").join("ctabs.toml");
    default.exists().then_some(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = Config::from_toml_str(
            r#"
[throttle]
min_delay_ms = 50
"#,
        )
        .unwrap();
        assert_eq!(config.throttle.min_delay_ms, 50);
        assert_eq!(config.throttle.max_delay_ms, 10_000);
        assert!(config.speculation.network_prediction_enabled);
    }

    #[test]
    fn inverted_delay_range_is_rejected() {
        let err = Config::from_toml_str(
            r#"
[throttle]
min_delay_ms = 500
max_delay_ms = 100
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn bad_syntax_is_parse_error() {
        let err = Config::from_toml_str("[throttle\nmin_delay_ms = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn log_format_parses_lowercase() {
        let config = Config::from_toml_str(
            r#"
[logging]
format = "json"
level = "debug"
"#,
        )
        .unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn toml_output_reparses() {
        let config = Config::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::load(Path::new("/definitely/not/here/ctabs.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn explicit_path_wins() {
        let p = Path::new("/tmp/explicit.toml");
        assert_eq!(resolve_config_path(Some(p)), Some(p.to_path_buf()));
    }
}
