//! Static checks applied to bot source before it reaches the sandbox.

mod credentials;
mod validator;

pub use credentials::{KNOWN_PLACEHOLDERS, has_placeholder, inject_credential, js_string_literal};
pub use validator::{MAX_CODE_CHARS, RiskLevel, TOKEN_PLACEHOLDER, Verdict, sanitize, validate};
