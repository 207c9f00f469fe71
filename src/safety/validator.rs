//! Static pattern scanner for bot source code.
//!
//! The validator is a best-effort filter, not a sandbox: it flags source text
//! that matches known-dangerous or known-suspicious shapes and produces a
//! [`Verdict`]. Risk only ever escalates while the checks run.
//!
//! ```text
//! code ──► malicious rules ──► suspicious rules ──► structural checks ──► Verdict
//!              (high)              (medium)          client / login / token / size
//! ```

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Code longer than this (in characters) is flagged as medium risk.
pub const MAX_CODE_CHARS: usize = 50_000;

/// Placeholder written over literal credentials by [`sanitize`].
pub const TOKEN_PLACEHOLDER: &str = "YOUR_BOT_TOKEN";

/// Shape of a platform bot token: three dot-separated alphanumeric parts.
const TOKEN_SHAPE: &str = r"[A-Za-z0-9]{24}\.[A-Za-z0-9]{6}\.[A-Za-z0-9_-]{27}";

/// Risk classification of a piece of code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    fn escalate(&mut self, to: RiskLevel) {
        if to > *self {
            *self = to;
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`validate`]. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub risk: RiskLevel,
    pub issues: Vec<String>,
    pub valid: bool,
}

struct Rule {
    label: &'static str,
    pattern: Regex,
}

impl Rule {
    fn new(label: &'static str, pattern: &str) -> Self {
        Self {
            label,
            pattern: Regex::new(&format!("(?i){pattern}")).expect("validator rule must compile"),
        }
    }
}

static MALICIOUS_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule::new("filesystem module import", r#"require\(\s*['"]fs['"]\s*\)"#),
        Rule::new(
            "child process module import",
            r#"require\(\s*['"]child_process['"]\s*\)"#,
        ),
        Rule::new("os module import", r#"require\(\s*['"]os['"]\s*\)"#),
        Rule::new("path module import", r#"require\(\s*['"]path['"]\s*\)"#),
        Rule::new("crypto module import", r#"require\(\s*['"]crypto['"]\s*\)"#),
        Rule::new("raw http module import", r#"require\(\s*['"]https?['"]\s*\)"#),
        Rule::new("socket module import", r#"require\(\s*['"]net['"]\s*\)"#),
        Rule::new("process execution", r"\.exec\s*\("),
        Rule::new("process spawning", r"\.spawn\s*\("),
        Rule::new("dynamic code evaluation (eval)", r"\beval\s*\("),
        Rule::new("dynamic function construction", r"new\s+Function\s*\("),
        Rule::new("process exit", r"process\.exit"),
        Rule::new("process kill", r"process\.kill"),
        Rule::new("environment access", r"process\.env"),
        Rule::new("filesystem access", r"\bfs\."),
        Rule::new(
            "direct file read/write",
            r"readFileSync|writeFileSync|unlinkSync",
        ),
        Rule::new("template literal interpolation", r"\$\{.*\}"),
        Rule::new("logging a token", r"console\.log.*token"),
        Rule::new("logging a password", r"console\.log.*password"),
        Rule::new("token derived from randomness", r"Math\.random.*token"),
    ]
});

static SUSPICIOUS_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule::new("network fetch", r"fetch\s*\("),
        Rule::new("XMLHttpRequest usage", r"XMLHttpRequest"),
        Rule::new("localStorage usage", r"localStorage"),
        Rule::new("sessionStorage usage", r"sessionStorage"),
        Rule::new("document access", r"document\."),
        Rule::new("window access", r"window\."),
        Rule::new("long interval", r"setInterval.*\d{4,}"),
        Rule::new("long timeout", r"setTimeout.*\d{4,}"),
    ]
});

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(TOKEN_SHAPE).expect("token shape must compile"));

static LOGIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.login\s*\(").expect("login pattern must compile"));

/// Scan `code` and produce a risk verdict.
pub fn validate(code: &str) -> Verdict {
    let mut issues = Vec::new();
    let mut risk = RiskLevel::Low;

    for rule in MALICIOUS_RULES.iter() {
        if rule.pattern.is_match(code) {
            issues.push(format!(
                "dangerous code detected: {} ({})",
                rule.label,
                rule.pattern.as_str()
            ));
            risk.escalate(RiskLevel::High);
        }
    }

    for rule in SUSPICIOUS_RULES.iter() {
        if rule.pattern.is_match(code) {
            issues.push(format!(
                "suspicious code: {} ({})",
                rule.label,
                rule.pattern.as_str()
            ));
            risk.escalate(RiskLevel::Medium);
        }
    }

    if !code.contains("discord.js") && !code.contains("Client") {
        issues.push("does not look like a valid bot: no discord.js client found".to_string());
        risk.escalate(RiskLevel::High);
    }

    if TOKEN_RE.is_match(code) {
        issues.push(format!(
            "contains a literal bot token; use the {TOKEN_PLACEHOLDER} placeholder instead"
        ));
        risk.escalate(RiskLevel::Medium);
    }

    if code.chars().count() > MAX_CODE_CHARS {
        issues.push(format!(
            "code is too large (more than {MAX_CODE_CHARS} characters)"
        ));
        risk.escalate(RiskLevel::Medium);
    }

    if !LOGIN_RE.is_match(code) {
        issues.push("missing login call: client.login()".to_string());
        risk.escalate(RiskLevel::High);
    }

    Verdict {
        valid: risk != RiskLevel::High,
        risk,
        issues,
    }
}

/// Replace every literal token-shaped substring with [`TOKEN_PLACEHOLDER`].
pub fn sanitize(code: &str) -> String {
    TOKEN_RE.replace_all(code, TOKEN_PLACEHOLDER).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GOOD_BOT: &str = r#"
const { Client, GatewayIntentBits } = require('discord.js');
const client = new Client({ intents: [GatewayIntentBits.Guilds] });
client.on('messageCreate', (message) => {
    if (message.content === '!ping') message.reply('pong');
});
client.login(YOUR_BOT_TOKEN);
"#;

    fn literal_token() -> String {
        format!("{}.{}.{}", "A".repeat(24), "b".repeat(6), "c".repeat(27))
    }

    #[test]
    fn test_clean_bot_is_low_risk() {
        let verdict = validate(GOOD_BOT);
        assert_eq!(verdict.risk, RiskLevel::Low);
        assert!(verdict.valid);
        assert!(verdict.issues.is_empty(), "{:?}", verdict.issues);
    }

    #[test]
    fn test_eval_is_high_risk() {
        let code = format!("{GOOD_BOT}\neval('1 + 1');");
        let verdict = validate(&code);
        assert_eq!(verdict.risk, RiskLevel::High);
        assert!(!verdict.valid);
        assert!(verdict.issues.iter().any(|i| i.contains("eval")));
    }

    #[test]
    fn test_function_constructor_is_high_risk() {
        let code = format!("{GOOD_BOT}\nconst f = new Function('return 1');");
        assert_eq!(validate(&code).risk, RiskLevel::High);
    }

    #[test]
    fn test_no_client_and_no_login_is_invalid() {
        let verdict = validate("const x = 1 + 2;");
        assert!(!verdict.valid);
        assert_eq!(verdict.risk, RiskLevel::High);
        assert_eq!(verdict.issues.len(), 2);
    }

    #[test]
    fn test_eval_without_login_reports_both() {
        let verdict = validate("eval(\"doSomething()\");");
        assert!(!verdict.valid);
        assert_eq!(verdict.risk, RiskLevel::High);
        assert!(verdict.issues.len() >= 2);
        assert!(verdict.issues.iter().any(|i| i.contains("eval")));
        assert!(verdict.issues.iter().any(|i| i.contains("login")));
    }

    #[test]
    fn test_fetch_is_medium_risk() {
        let code = format!("{GOOD_BOT}\nfetch('https://example.com');");
        let verdict = validate(&code);
        assert_eq!(verdict.risk, RiskLevel::Medium);
        assert!(verdict.valid);
    }

    #[test]
    fn test_long_timer_is_suspicious() {
        let code = format!("{GOOD_BOT}\nsetInterval(() => {{}}, 60000);");
        assert_eq!(validate(&code).risk, RiskLevel::Medium);
    }

    #[test]
    fn test_literal_token_is_medium() {
        let code = GOOD_BOT.replace("YOUR_BOT_TOKEN", &format!("'{}'", literal_token()));
        let verdict = validate(&code);
        assert_eq!(verdict.risk, RiskLevel::Medium);
        assert!(verdict.issues.iter().any(|i| i.contains("literal bot token")));
    }

    #[test]
    fn test_risk_never_downgrades() {
        // A literal token (medium) must not lower an eval finding (high).
        let code = format!(
            "{}\neval('x');",
            GOOD_BOT.replace("YOUR_BOT_TOKEN", &format!("'{}'", literal_token()))
        );
        let verdict = validate(&code);
        assert_eq!(verdict.risk, RiskLevel::High);
        assert!(!verdict.valid);
    }

    #[test]
    fn test_oversized_code_is_flagged() {
        let padding = "// filler\n".repeat(MAX_CODE_CHARS / 10 + 1);
        let code = format!("{GOOD_BOT}{padding}");
        let verdict = validate(&code);
        assert_eq!(verdict.risk, RiskLevel::Medium);
        assert!(verdict.issues.iter().any(|i| i.contains("too large")));
    }

    #[test]
    fn test_template_literal_is_flagged() {
        let code = format!("{GOOD_BOT}\nconst s = `hi ${{name}}`;");
        assert_eq!(validate(&code).risk, RiskLevel::High);
    }

    #[test]
    fn test_sanitize_replaces_token() {
        let code = format!("client.login('{}');", literal_token());
        let clean = sanitize(&code);
        assert_eq!(clean, "client.login('YOUR_BOT_TOKEN');");
        assert!(!TOKEN_RE.is_match(&clean));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let code = format!("a {} b {}", literal_token(), literal_token());
        let once = sanitize(&code);
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn test_risk_serializes_lowercase() {
        let json = serde_json::to_string(&validate(GOOD_BOT)).unwrap();
        assert!(json.contains("\"risk\":\"low\""));
    }
}
