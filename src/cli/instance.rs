//! `bothost instance` - manage stored instance records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Subcommand;
use secrecy::SecretString;

use crate::config::Config;
use crate::db::{InstanceStore, NewInstance, connect_from_config};
use crate::gateway::DiscordGateway;
use crate::lifecycle::InstanceRuntime;

#[derive(Subcommand, Debug, Clone)]
pub enum InstanceCommand {
    /// Create an instance from source files.
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        description: Option<String>,

        /// Environment variable holding the bot credential.
        #[arg(long, value_name = "VAR")]
        token_env: String,

        /// Source files; stored under their file names.
        #[arg(long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,
    },

    /// List stored instances.
    List,

    /// Add or replace one file of an instance.
    PutFile {
        id: String,
        path: PathBuf,

        /// Store under this name instead of the file's own name.
        #[arg(long = "as", value_name = "NAME")]
        name: Option<String>,
    },

    /// Remove one file. The last file cannot be removed.
    RemoveFile { id: String, name: String },

    /// Print the validator verdict for the instance's main file.
    Review { id: String },

    /// Delete an instance.
    Delete { id: String },
}

pub async fn run_instance_command(command: InstanceCommand) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let store = connect_from_config(&config.database).await?;

    match command {
        InstanceCommand::Add {
            name,
            description,
            token_env,
            files,
        } => {
            let credential = std::env::var(&token_env)
                .map_err(|_| anyhow::anyhow!("environment variable {token_env} is not set"))?;
            let files = read_files(&files)?;
            let record = store
                .create_instance(NewInstance {
                    name,
                    description,
                    credential: SecretString::from(credential),
                    files,
                })
                .await?;
            println!("{}", record.id);
        }
        InstanceCommand::List => {
            let records = store.list_instances().await?;
            if records.is_empty() {
                println!("No instances.");
            }
            for record in records {
                println!(
                    "{}  {:<24}  {:<8}  {} file(s)",
                    record.id,
                    record.name,
                    if record.active { "active" } else { "inactive" },
                    record.files.len()
                );
            }
        }
        InstanceCommand::PutFile { id, path, name } => {
            let name = match name {
                Some(name) => name,
                None => file_name(&path)?,
            };
            let content = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
            let record = store.put_file(&id, &name, &content).await?;
            println!("{} now has {} file(s)", record.id, record.files.len());
        }
        InstanceCommand::RemoveFile { id, name } => {
            let record = store.remove_file(&id, &name).await?;
            println!("{} now has {} file(s)", record.id, record.files.len());
        }
        InstanceCommand::Review { id } => {
            let verdict = runtime(&config, store)?.review(&id).await?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }
        InstanceCommand::Delete { id } => {
            if runtime(&config, store)?.delete(&id).await? {
                println!("Deleted {id}");
            } else {
                anyhow::bail!("instance {id} not found");
            }
        }
    }
    Ok(())
}

fn runtime(config: &Config, store: Arc<dyn InstanceStore>) -> anyhow::Result<InstanceRuntime> {
    let gateway = Arc::new(DiscordGateway::new(&config.gateway)?);
    Ok(InstanceRuntime::from_config(config, store, gateway))
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))
}

fn read_files(paths: &[PathBuf]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for path in paths {
        let name = file_name(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
        if files.insert(name.clone(), content).is_some() {
            anyhow::bail!("duplicate file name {name}");
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_files_keys_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("index.js");
        std::fs::write(&index, "client.login(YOUR_BOT_TOKEN)").unwrap();
        let files = read_files(&[index]).unwrap();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["index.js"]);
    }

    #[test]
    fn test_read_files_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(a.join("index.js"), "1").unwrap();
        std::fs::write(b.join("index.js"), "2").unwrap();
        assert!(read_files(&[a.join("index.js"), b.join("index.js")]).is_err());
    }
}
