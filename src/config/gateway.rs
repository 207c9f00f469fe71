use std::time::Duration;

use crate::config::helpers::EnvSource;
use crate::error::ConfigError;

pub const DEFAULT_DISCORD_API_BASE_URL: &str = "https://discord.com/api/v10";

/// External gateway connection settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_base_url: String,
    /// Deadline for the authentication handshake.
    pub connect_timeout: Duration,
    /// Deadline for tearing down one live handle.
    pub shutdown_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_DISCORD_API_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    pub(crate) fn resolve(env: &EnvSource<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_base_url = match env.optional_env("DISCORD_API_BASE_URL") {
            Some(raw) => {
                url::Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
                    key: "DISCORD_API_BASE_URL".to_string(),
                    message: format!("must be a valid URL: {e}"),
                })?;
                raw.trim_end_matches('/').to_string()
            }
            None => defaults.api_base_url,
        };

        let connect_timeout = env
            .parse_env::<u64>("GATEWAY_CONNECT_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout);

        let shutdown_timeout = env
            .parse_env::<u64>("GATEWAY_SHUTDOWN_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_timeout);

        Ok(Self {
            api_base_url,
            connect_timeout,
            shutdown_timeout,
        })
    }
}
