//! Command-line surface.

pub mod doctor;
mod instance;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::bootstrap::{bothost_env_path, save_bootstrap_env};
use crate::config::DatabaseBackend;
use crate::safety::{sanitize, validate};

pub use doctor::DoctorSubcommand;
pub use instance::InstanceCommand;

#[derive(Parser, Debug)]
#[command(name = "bothost", version, about = "Host for sandboxed Discord bots")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the supervisor until SIGINT/SIGTERM, then stop every instance.
    Serve {
        /// Instance ids to start once the supervisor is up.
        #[arg(long = "start", value_name = "ID")]
        start: Vec<String>,
    },

    /// Print the validator verdict for a source file as JSON.
    Review { file: PathBuf },

    /// Print a source file with literal credentials replaced by the placeholder.
    Sanitize { file: PathBuf },

    /// Manage stored instances.
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },

    /// Persist bootstrap settings to ~/.bothost/.env.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Check configuration, storage, sandbox and gateway reachability.
    Doctor {
        #[command(subcommand)]
        command: Option<DoctorSubcommand>,

        /// Exit non-zero if any check fails.
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Choose the persistence backend.
    SetDatabase {
        /// `memory` or `libsql`.
        #[arg(long)]
        backend: String,

        /// libSQL database file.
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Serve { start } => serve::run_serve(start).await,
            Command::Review { file } => run_review(&file),
            Command::Sanitize { file } => run_sanitize(&file),
            Command::Instance { command } => instance::run_instance_command(command).await,
            Command::Config { command } => run_config_command(command),
            Command::Doctor { command, strict } => doctor::run_doctor_command(command, strict).await,
        }
    }
}

fn read_source(file: &PathBuf) -> anyhow::Result<String> {
    std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", file.display(), e))
}

fn run_review(file: &PathBuf) -> anyhow::Result<()> {
    let verdict = validate(&read_source(file)?);
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    if !verdict.valid {
        std::process::exit(2);
    }
    Ok(())
}

fn run_sanitize(file: &PathBuf) -> anyhow::Result<()> {
    print!("{}", sanitize(&read_source(file)?));
    Ok(())
}

fn run_config_command(command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::SetDatabase { backend, path } => {
            let backend = DatabaseBackend::parse(&backend, "--backend")?;
            let path = path.map(|p| p.display().to_string());
            let mut vars = vec![("DATABASE_BACKEND", backend.as_str())];
            if let Some(path) = path.as_deref() {
                vars.push(("LIBSQL_PATH", path));
            }
            save_bootstrap_env(&vars)?;
            println!("Wrote {}", bothost_env_path().display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_with_starts() {
        let cli = Cli::try_parse_from(["bothost", "serve", "--start", "a", "--start", "b"]).unwrap();
        match cli.command {
            Command::Serve { start } => assert_eq!(start, vec!["a", "b"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_instance_add() {
        let cli = Cli::try_parse_from([
            "bothost",
            "instance",
            "add",
            "--name",
            "Greeter",
            "--token-env",
            "GREETER_TOKEN",
            "--file",
            "bot/index.js",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Instance {
                command: InstanceCommand::Add { .. }
            }
        ));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let err = run_config_command(ConfigCommand::SetDatabase {
            backend: "oracle".to_string(),
            path: None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("--backend"));
    }
}
