use std::path::PathBuf;

use crate::config::helpers::{EnvSource, normalize_variant};
use crate::error::ConfigError;

/// Which persistence backend holds instance records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Memory,
    LibSql,
}

impl DatabaseBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::LibSql => "libsql",
        }
    }

    pub(crate) fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "libsql" | "sqlite" | "turso" => Ok(Self::LibSql),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'memory' or 'libsql', got '{value}'"),
            }),
        }
    }

    fn default_backend() -> Self {
        if cfg!(feature = "libsql") {
            Self::LibSql
        } else {
            Self::Memory
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub libsql_path: PathBuf,
}

/// Default libSQL path: `~/.bothost/bothost.db`.
pub fn default_libsql_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bothost")
        .join("bothost.db")
}

impl DatabaseConfig {
    pub(crate) fn resolve(env: &EnvSource<'_>) -> Result<Self, ConfigError> {
        let backend = match env.optional_env("DATABASE_BACKEND") {
            Some(raw) => DatabaseBackend::parse(&raw, "DATABASE_BACKEND")?,
            None => DatabaseBackend::default_backend(),
        };
        let libsql_path = env
            .optional_env("LIBSQL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_libsql_path);

        Ok(Self {
            backend,
            libsql_path,
        })
    }
}
