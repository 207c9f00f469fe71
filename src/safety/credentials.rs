//! Credential injection into bot source.
//!
//! Substitution is textual. Only the spellings in [`KNOWN_PLACEHOLDERS`] are
//! recognised; anything else is left untouched and the script will log in with
//! whatever value it wrote.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Placeholder spellings replaced with the real credential, longest first.
pub const KNOWN_PLACEHOLDERS: &[&str] = &["YOUR_BOT_TOKEN_HERE", "YOUR_BOT_TOKEN"];

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    let names = KNOWN_PLACEHOLDERS.join("|");
    // A quoted placeholder is consumed together with its quotes so the result
    // stays a single string literal.
    Regex::new(&format!(
        r#"'(?:{names})'|"(?:{names})"|`(?:{names})`|\b(?:{names})\b"#
    ))
    .expect("placeholder pattern must compile")
});

/// Whether `code` contains any known placeholder.
pub fn has_placeholder(code: &str) -> bool {
    PLACEHOLDER_RE.is_match(code)
}

/// Replace every known placeholder in `code` with `credential` as a JS string literal.
pub fn inject_credential(code: &str, credential: &str) -> String {
    let literal = js_string_literal(credential);
    PLACEHOLDER_RE
        .replace_all(code, |_: &Captures<'_>| literal.clone())
        .into_owned()
}

/// Quote `value` as a JavaScript string literal.
///
/// JSON string syntax is a subset of JS string syntax; U+2028/U+2029 are
/// escaped too since older engines reject them inside literals.
pub fn js_string_literal(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}
