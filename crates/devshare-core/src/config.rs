//! Configuration types for devshare

use serde::{Deserialize, Serialize};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Allocator configuration
    pub allocator: AllocatorConfig,
    /// Persistence retry configuration
    pub retry: RetrySettings,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::DevshareError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::DevshareError::Config(format!("Failed to read config file: {}", e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, crate::DevshareError> {
        let config: DaemonConfig = toml::from_str(content)
            .map_err(|e| crate::DevshareError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), crate::DevshareError> {
        if self.retry.max_attempts == 0 {
            return Err(crate::DevshareError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(crate::DevshareError::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub rest_address: String,
    /// Port for the REST API server
    pub rest_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rest_address: "0.0.0.0".to_string(),
            rest_port: 9190,
        }
    }
}

/// Allocator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Unit selection policy
    pub policy: SelectionPolicyKind,
}

/// Unit selection policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicyKind {
    /// Smallest sufficient free capacity first
    #[default]
    BestFit,
    /// Lowest minor first
    FirstFit,
}

/// Bounded retry of the persistence write
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound of the exponential delay
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, or an `EnvFilter` directive such as `devshare_scheduler=debug`
    pub level: String,
    /// Include the event target in log lines
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
        }
    }
}
