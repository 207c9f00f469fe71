//! Configuration for bothost.
//!
//! Settings are loaded with priority: env var > `./.env` > `~/.bothost/.env`
//! (the two files are loaded via dotenvy early in startup) > default.

mod database;
mod gateway;
pub(crate) mod helpers;
mod sandbox;

use crate::error::ConfigError;

pub use self::database::{DatabaseBackend, DatabaseConfig, default_libsql_path};
pub use self::gateway::{DEFAULT_DISCORD_API_BASE_URL, GatewayConfig};
pub use self::helpers::EnvSource;
pub use self::sandbox::{GATEWAY_CLIENT_MODULE, SandboxConfig};

/// Main configuration for the host.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub sandbox: SandboxConfig,
    pub gateway: GatewayConfig,
    /// Restart instances persisted as active when `serve` starts.
    pub resume_active: bool,
}

impl Config {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&helpers::process_env)
    }

    /// Resolve configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvSource::new(lookup);
        Ok(Self {
            database: DatabaseConfig::resolve(&env)?,
            sandbox: SandboxConfig::resolve(&env)?,
            gateway: GatewayConfig::resolve(&env)?,
            resume_active: env.bool_env("BOTHOST_RESUME_ACTIVE")?.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(&move |key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.sandbox.execution_timeout, Duration::from_millis(5_000));
        assert_eq!(config.sandbox.max_pending_sends, 50);
        assert!(config.sandbox.enforce_validation);
        assert_eq!(config.gateway.api_base_url, DEFAULT_DISCORD_API_BASE_URL);
        assert!(!config.resume_active);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("DATABASE_BACKEND", "memory"),
            ("SANDBOX_EXECUTION_TIMEOUT_MS", "250"),
            ("SANDBOX_MEMORY_LIMIT_MB", "16"),
            ("SANDBOX_MAX_PENDING_SENDS", "8"),
            ("SANDBOX_ENFORCE_VALIDATION", "off"),
            ("DISCORD_API_BASE_URL", "http://127.0.0.1:9999/api/"),
            ("GATEWAY_SHUTDOWN_TIMEOUT_SECS", "3"),
            ("BOTHOST_RESUME_ACTIVE", "1"),
        ])
        .unwrap();
        assert_eq!(config.database.backend, DatabaseBackend::Memory);
        assert_eq!(config.sandbox.execution_timeout, Duration::from_millis(250));
        assert_eq!(config.sandbox.memory_limit, 16 * 1024 * 1024);
        assert_eq!(config.sandbox.max_pending_sends, 8);
        assert!(!config.sandbox.enforce_validation);
        assert_eq!(config.gateway.api_base_url, "http://127.0.0.1:9999/api");
        assert_eq!(config.gateway.shutdown_timeout, Duration::from_secs(3));
        assert!(config.resume_active);
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let err = config_from(&[("SANDBOX_EXECUTION_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("SANDBOX_EXECUTION_TIMEOUT_MS"));

        let err = config_from(&[("DATABASE_BACKEND", "oracle")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "DATABASE_BACKEND"));

        let err = config_from(&[("SANDBOX_ENFORCE_VALIDATION", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(config_from(&[("SANDBOX_EXECUTION_TIMEOUT_MS", "0")]).is_err());
        assert!(config_from(&[("SANDBOX_MAX_PENDING_SENDS", "0")]).is_err());
    }

    #[test]
    fn test_oversized_limits_rejected() {
        let huge = usize::MAX.to_string();
        let err = config_from(&[("SANDBOX_MEMORY_LIMIT_MB", huge.as_str())]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SANDBOX_MEMORY_LIMIT_MB"));

        let err = config_from(&[("SANDBOX_MAX_STACK_KB", huge.as_str())]).unwrap_err();
        assert!(err.to_string().contains("SANDBOX_MAX_STACK_KB"));

        let config = config_from(&[("SANDBOX_MAX_STACK_KB", "512")]).unwrap();
        assert_eq!(config.sandbox.max_stack_size, 512 * 1024);
    }
}
