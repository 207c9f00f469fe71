use std::str::FromStr;

use crate::error::ConfigError;

/// Key/value source that configuration is resolved from.
///
/// Production code reads the process environment; tests hand in a map.
pub struct EnvSource<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> EnvSource<'a> {
    pub fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    /// Read a key, treating blank values as unset.
    pub fn optional_env(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Read and parse a key.
    pub fn parse_env<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional_env(key)
            .map(|s| s.parse::<T>())
            .transpose()
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    /// Read a boolean key. Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
    pub fn bool_env(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.optional_env(key) {
            None => Ok(None),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected a boolean, got '{raw}'"),
                }),
            },
        }
    }

    /// Read a count of `unit`-sized blocks and return the total, rejecting overflow.
    pub fn scaled_env(&self, key: &str, unit: usize) -> Result<Option<usize>, ConfigError> {
        let Some(count) = self.parse_env::<usize>(key)? else {
            return Ok(None);
        };
        count
            .checked_mul(unit)
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{count} is too large"),
            })
    }
}

/// Lookup backed by the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

pub(crate) fn normalize_variant(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace('-', "_")
}
