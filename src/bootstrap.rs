//! Bootstrap helpers for bothost.
//!
//! Env vars needed before anything else starts (database selection, sandbox
//! limits) can live in `~/.bothost/.env` (standard dotenvy format).

use std::path::PathBuf;

/// Path to the bothost-specific `.env` file: `~/.bothost/.env`.
pub fn bothost_env_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bothost")
        .join(".env")
}

/// Load env vars from `./.env` and then `~/.bothost/.env`.
///
/// dotenvy never overwrites existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.bothost/.env`
pub fn load_bothost_env() {
    let _ = dotenvy::dotenv();

    let path = bothost_env_path();
    if path.exists()
        && let Err(e) = dotenvy::from_path(&path)
    {
        eprintln!("Warning: failed to load {}: {}", path.display(), e);
    }
}

/// Write bootstrap vars to `~/.bothost/.env`.
///
/// Values are double-quoted so that `#` and other shell-special characters
/// are preserved by dotenvy.
pub fn save_bootstrap_env(vars: &[(&str, &str)]) -> std::io::Result<()> {
    let path = bothost_env_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, render_env(vars))
}

fn render_env(vars: &[(&str, &str)]) -> String {
    let mut content = String::new();
    for (key, value) in vars {
        // Escape backslashes and double quotes so a value cannot break out of its quotes.
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        content.push_str(&format!("{}=\"{}\"\n", key, escaped));
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_path_is_under_home_dir() {
        let path = bothost_env_path();
        assert!(path.ends_with(".bothost/.env"));
    }

    #[test]
    fn test_render_env_escapes_quotes() {
        let rendered = render_env(&[("LIBSQL_PATH", "/tmp/a\"b"), ("DATABASE_BACKEND", "libsql")]);
        assert_eq!(
            rendered,
            "LIBSQL_PATH=\"/tmp/a\\\"b\"\nDATABASE_BACKEND=\"libsql\"\n"
        );
    }

    #[test]
    fn test_rendered_env_round_trips_through_dotenvy() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".env");
        std::fs::write(&file, render_env(&[("BOTHOST_TEST_KEY", "a#b")])).unwrap();
        let parsed: Vec<(String, String)> = dotenvy::from_path_iter(&file)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(parsed, vec![("BOTHOST_TEST_KEY".to_string(), "a#b".to_string())]);
    }
}
