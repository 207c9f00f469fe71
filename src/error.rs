//! Error types for bothost.

use serde::Serialize;

use crate::safety::Verdict;

/// Top-level error type for the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Result type alias for the host.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Errors raised while building or running an instance's sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Module {module} not available")]
    ModuleNotAvailable { module: String },

    #[error("Script execution failed: {message}")]
    Execution { message: String },

    #[error("Script exceeded its execution budget of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Sandbox failed to start: {0}")]
    Startup(String),

    #[error("Sandbox worker is no longer running")]
    WorkerGone,
}

/// External gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication failed: {reason}")]
    AuthenticationFailure { reason: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Gateway did not respond within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway connection is closed")]
    Closed,
}

/// Failures of start/stop/restart/review, as seen by the lifecycle boundary.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Instance {id} not found")]
    NotFound { id: String },

    #[error("Code rejected by validator ({} issue(s), risk {})", .verdict.issues.len(), .verdict.risk)]
    ValidationFailure { verdict: Verdict },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Authentication(#[from] GatewayError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Teardown of instance {id} failed: {reason}")]
    Teardown { id: String, reason: String },
}

/// Structured failure reason returned to callers instead of raw internals.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailureReason {
    pub code: &'static str,
    pub retryable: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl FailureReason {
    fn new(code: &'static str, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            code,
            retryable,
            message: message.into(),
            issues: Vec::new(),
        }
    }
}

impl LifecycleError {
    /// Stable machine-readable code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ValidationFailure { .. } => "validation_failure",
            Self::Sandbox(SandboxError::ModuleNotAvailable { .. }) => "module_not_available",
            Self::Sandbox(SandboxError::Timeout { .. }) => "timeout",
            Self::Sandbox(_) => "execution_error",
            Self::Authentication(_) => "authentication_failure",
            Self::Database(_) => "storage_failure",
            Self::Teardown { .. } => "teardown_failure",
        }
    }

    /// Convert into a caller-facing reason.
    ///
    /// Messages for storage and sandbox-internal faults are generic; user-caused
    /// failures keep their detail since it describes the user's own code.
    pub fn failure(&self) -> FailureReason {
        let code = self.code();
        match self {
            Self::NotFound { .. } => FailureReason::new(code, false, self.to_string()),
            Self::ValidationFailure { verdict } => {
                let mut reason = FailureReason::new(code, false, self.to_string());
                reason.issues = verdict.issues.clone();
                reason
            }
            Self::Sandbox(SandboxError::Startup(_) | SandboxError::WorkerGone) => {
                FailureReason::new(code, true, "sandbox unavailable")
            }
            Self::Sandbox(err) => FailureReason::new(code, false, err.to_string()),
            Self::Authentication(GatewayError::AuthenticationFailure { .. }) => {
                FailureReason::new(code, false, "gateway rejected the credential")
            }
            Self::Authentication(_) => {
                FailureReason::new(code, true, "gateway connection failed")
            }
            Self::Database(_) => FailureReason::new(code, true, "storage unavailable"),
            Self::Teardown { .. } => FailureReason::new(code, true, self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::validate;

    #[test]
    fn test_validation_failure_carries_issues() {
        let verdict = validate("eval('1')");
        let err = LifecycleError::ValidationFailure { verdict };
        let reason = err.failure();
        assert_eq!(reason.code, "validation_failure");
        assert!(!reason.retryable);
        assert!(reason.issues.len() >= 2);
    }

    #[test]
    fn test_auth_failure_does_not_leak_reason() {
        let err = LifecycleError::Authentication(GatewayError::AuthenticationFailure {
            reason: "401 body with internals".to_string(),
        });
        let reason = err.failure();
        assert_eq!(reason.code, "authentication_failure");
        assert!(!reason.message.contains("internals"));
    }

    #[test]
    fn test_sandbox_codes() {
        let err = LifecycleError::Sandbox(SandboxError::ModuleNotAvailable {
            module: "fs".to_string(),
        });
        assert_eq!(err.code(), "module_not_available");
        let err = LifecycleError::Sandbox(SandboxError::Timeout { timeout_ms: 10 });
        assert_eq!(err.code(), "timeout");
        assert!(
            serde_json::to_string(&err.failure())
                .unwrap()
                .contains("\"code\":\"timeout\"")
        );
    }
}
