//! Binding surface exposed to bot code.
//!
//! An [`Environment`] is built fresh for every start. It decides which module
//! names `require` resolves and owns the attributed logging facade; the engine
//! turns it into the interpreter-side bindings listed in [`BINDINGS`].

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::config::GATEWAY_CLIENT_MODULE;
use crate::error::SandboxError;
use crate::gateway::Intents;

/// Names bound inside the function that wraps bot code, in parameter order.
pub const BINDINGS: &[&str] = &[
    "require",
    "console",
    "module",
    "exports",
    "process",
    "global",
    "__filename",
    "__dirname",
];

/// Module names `require` resolves.
const AVAILABLE_MODULES: &[&str] = &[GATEWAY_CLIENT_MODULE];

/// Timer functions installed on the sandbox's global object.
pub const TIMER_GLOBALS: &[&str] = &["setTimeout", "setInterval", "clearTimeout", "clearInterval"];

/// Credentials shorter than this are not masked in bot output.
const MIN_REDACTED_LEN: usize = 4;

/// Severity of a bot log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(level: &str) -> Self {
        match level {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Log,
        }
    }
}

/// Logging facade handed to bot code as `console`.
///
/// Every line is prefixed with the instance's display name and the instance
/// credential is masked.
#[derive(Clone)]
pub struct BotConsole {
    name: Arc<str>,
    credential: Option<SecretString>,
}

impl BotConsole {
    pub fn new(name: &str, credential: &SecretString) -> Self {
        let credential =
            (credential.expose_secret().len() >= MIN_REDACTED_LEN).then(|| credential.clone());
        Self {
            name: Arc::from(name),
            credential,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The line as it is written to the log.
    pub fn render(&self, message: &str) -> String {
        let message = match &self.credential {
            Some(secret) => message.replace(secret.expose_secret(), "[REDACTED]"),
            None => message.to_string(),
        };
        format!("[{}] {}", self.name, message)
    }

    pub fn emit(&self, level: LogLevel, message: &str) {
        let line = self.render(message);
        match level {
            LogLevel::Debug => tracing::debug!(target: "bothost::bot", "{}", line),
            LogLevel::Log | LogLevel::Info => tracing::info!(target: "bothost::bot", "{}", line),
            LogLevel::Warn => tracing::warn!(target: "bothost::bot", "{}", line),
            LogLevel::Error => tracing::error!(target: "bothost::bot", "{}", line),
        }
    }
}

impl std::fmt::Debug for BotConsole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConsole")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Builder for an [`Environment`].
pub struct EnvironmentBuilder {
    name: String,
    credential: SecretString,
    main_file: String,
}

impl EnvironmentBuilder {
    pub fn new(name: impl Into<String>, credential: SecretString) -> Self {
        Self {
            name: name.into(),
            credential,
            main_file: "index.js".to_string(),
        }
    }

    /// File name reported as `__filename`.
    pub fn main_file(mut self, file: impl Into<String>) -> Self {
        self.main_file = file.into();
        self
    }

    pub fn build(self) -> Environment {
        Environment {
            console: BotConsole::new(&self.name, &self.credential),
            filename: format!("/bot/{}", self.main_file),
        }
    }
}

/// Constrained namespace for one run of one instance.
#[derive(Debug, Clone)]
pub struct Environment {
    console: BotConsole,
    filename: String,
}

impl Environment {
    pub fn console(&self) -> &BotConsole {
        &self.console
    }

    pub fn name(&self) -> &str {
        self.console.name()
    }

    /// Check a `require` target. Only the built-in gateway client resolves.
    pub fn resolve_module(&self, module: &str) -> Result<(), SandboxError> {
        if AVAILABLE_MODULES.contains(&module) {
            Ok(())
        } else {
            Err(SandboxError::ModuleNotAvailable {
                module: module.to_string(),
            })
        }
    }

    pub fn binding_names(&self) -> &'static [&'static str] {
        BINDINGS
    }

    /// Settings read by the interpreter prelude.
    pub(crate) fn prelude_config(&self) -> serde_json::Value {
        json!({
            "filename": self.filename,
            "dirname": "/bot",
            "defaultIntents": Intents::default_client().0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env() -> Environment {
        EnvironmentBuilder::new("Greeter", SecretString::from("secret-1")).build()
    }

    #[test]
    fn test_only_allowed_modules_resolve() {
        let env = env();
        assert!(env.resolve_module("discord.js").is_ok());
        let err = env.resolve_module("fs").unwrap_err();
        assert!(matches!(err, SandboxError::ModuleNotAvailable { ref module } if module == "fs"));
        assert!(env.resolve_module("child_process").is_err());
    }

    #[test]
    fn test_npm_packages_do_not_resolve() {
        let env = env();
        for module in ["dayjs", "node-fetch", "discord.js/src/client"] {
            assert!(env.resolve_module(module).is_err(), "{module}");
        }
    }

    #[test]
    fn test_console_prefixes_and_redacts() {
        let env = env();
        assert_eq!(
            env.console().render("logged in with secret-1"),
            "[Greeter] logged in with [REDACTED]"
        );
        assert_eq!(env.console().render("hello"), "[Greeter] hello");
    }

    #[test]
    fn test_short_credential_is_not_masked() {
        let console = BotConsole::new("b", &SecretString::from("a"));
        assert_eq!(console.render("banana"), "[b] banana");
    }

    #[test]
    fn test_binding_set_has_no_host_objects() {
        let env = env();
        assert_eq!(env.binding_names().len(), 8);
        assert!(env.binding_names().contains(&"process"));
        let config = env.prelude_config();
        assert_eq!(config["filename"], "/bot/index.js");
        assert_eq!(config["defaultIntents"], 33281);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("warn"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("whatever"), LogLevel::Log);
    }
}
