use std::time::Duration;

use crate::config::helpers::EnvSource;
use crate::error::ConfigError;

/// Module name of the gateway client library exposed to bot code.
pub const GATEWAY_CLIENT_MODULE: &str = "discord.js";

/// Limits and policy for the per-instance interpreter.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Budget for the top-level evaluation and for each handler or timer turn.
    pub execution_timeout: Duration,
    /// Interpreter heap cap in bytes.
    pub memory_limit: usize,
    /// Interpreter stack cap in bytes.
    pub max_stack_size: usize,
    /// Outbound actions a script may have queued before sends are refused.
    pub max_pending_sends: usize,
    /// Refuse to start code whose verdict is invalid.
    pub enforce_validation: bool,
    /// Live timers per instance.
    pub max_timers: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_millis(5_000),
            memory_limit: 64 * 1024 * 1024,
            max_stack_size: 1024 * 1024,
            max_pending_sends: 50,
            enforce_validation: true,
            max_timers: 256,
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve(env: &EnvSource<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let execution_timeout = env
            .parse_env::<u64>("SANDBOX_EXECUTION_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.execution_timeout);
        if execution_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_EXECUTION_TIMEOUT_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let memory_limit = env
            .scaled_env("SANDBOX_MEMORY_LIMIT_MB", 1024 * 1024)?
            .unwrap_or(defaults.memory_limit);

        let max_stack_size = env
            .scaled_env("SANDBOX_MAX_STACK_KB", 1024)?
            .unwrap_or(defaults.max_stack_size);

        let enforce_validation = env
            .bool_env("SANDBOX_ENFORCE_VALIDATION")?
            .unwrap_or(defaults.enforce_validation);

        let max_timers = env
            .parse_env::<usize>("SANDBOX_MAX_TIMERS")?
            .unwrap_or(defaults.max_timers);

        let max_pending_sends = env
            .parse_env::<usize>("SANDBOX_MAX_PENDING_SENDS")?
            .unwrap_or(defaults.max_pending_sends);
        if max_pending_sends == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_MAX_PENDING_SENDS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            execution_timeout,
            memory_limit,
            max_stack_size,
            max_pending_sends,
            enforce_validation,
            max_timers,
        })
    }
}
