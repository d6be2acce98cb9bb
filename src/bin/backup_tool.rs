use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use sheetkeeper::config::AppConfig;
use sheetkeeper::{BackupKind, BackupManager, DocumentStore, JsonFileStore};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sheetkeeper-backup")]
#[command(about = "Inspect and manage character store backups")]
struct Cli {
    /// Character store file; defaults to DATA_DIR/CHARACTERS_FILE.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Backup directory; defaults to BACKUP_DIR.
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List backups, newest first.
    List,
    /// Check that a backup parses and count its records.
    Verify { name: String },
    /// Write a backup of the current store.
    Create {
        #[arg(long, default_value = "manual")]
        kind: String,
    },
    /// Replace the store with a backup. The current store is backed up first.
    Restore { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("failed to load configuration")?;

    let store_path = cli.store.unwrap_or_else(|| config.store_path());
    let backup_dir = cli.backup_dir.unwrap_or_else(|| config.backup_dir.clone());
    let backups =
        BackupManager::new(backup_dir, &store_path).with_history_keep(config.history_keep);
    let store = JsonFileStore::new(&store_path, backups.clone()).with_lock_policy(config.lock_policy());

    match cli.command {
        Command::List => {
            let entries = backups.list().await?;
            if entries.is_empty() {
                println!("No backups in {}", backups.dir().display());
            }
            for entry in entries {
                println!("{:<10} {:>10}  {}", entry.kind.as_str(), entry.bytes, entry.name);
            }
        }
        Command::Verify { name } => {
            let path = backups.resolve(&name)?;
            let report = backups.verify(&path).await?;
            println!(
                "{}: ok, {} records, {} bytes",
                report.name, report.records, report.bytes
            );
        }
        Command::Create { kind } => {
            let kind: BackupKind = kind.parse()?;
            if matches!(kind, BackupKind::History) {
                return Err(anyhow!("history backups are written by saves, not by hand"));
            }
            let path = store.create_backup(kind).await?;
            println!("Created {}", path.display());
        }
        Command::Restore { name } => {
            let path = backups.resolve(&name)?;
            store
                .restore(&path)
                .await
                .with_context(|| format!("failed to restore {}", name))?;
            println!("Restored {} into {}", name, store_path.display());
        }
    }

    Ok(())
}
