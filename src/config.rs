use crate::core::Roster;
use crate::storage::LockPolicy;
use crate::storage::backup::DEFAULT_HISTORY_KEEP;
use anyhow::{Context, Result, anyhow};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CHARACTERS: &str = "frunk,sharon,indigo,zepha";

/// One row of the static login table: a bcrypt hash and who it logs in as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEntry {
    pub password_hash: String,
    pub character: String,
    pub editor: bool,
}

impl AuthEntry {
    /// Parses `hash:character[:editor]`.
    fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.trim().split(':');
        let password_hash = parts.next().unwrap_or_default().trim().to_string();
        let character = parts.next().unwrap_or_default().trim().to_string();
        let editor = match parts.next().map(str::trim) {
            None => false,
            Some("editor") => true,
            Some(other) => return Err(anyhow!("unknown AUTH_TABLE flag '{}'", other)),
        };
        if password_hash.is_empty() || character.is_empty() || parts.next().is_some() {
            return Err(anyhow!(
                "AUTH_TABLE entries must look like hash:character[:editor]"
            ));
        }
        Ok(Self {
            password_hash,
            character,
            editor,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub characters_file: String,
    pub npc_file: String,
    pub backup_dir: PathBuf,
    pub characters: Vec<String>,
    pub lock_timeout: Duration,
    pub lock_retry: Duration,
    pub history_keep: usize,
    pub session_ttl: Duration,
    pub auth: Vec<AuthEntry>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let host = var("APP_HOST", "0.0.0.0");
        let port = var("APP_PORT", "8080")
            .parse::<u16>()
            .context("APP_PORT must be a valid u16")?;

        let data_dir = PathBuf::from(var("DATA_DIR", "./data"));
        let backup_dir = lookup("BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("backups"));

        let characters = var("CHARACTER_KEYS", DEFAULT_CHARACTERS)
            .split(',')
            .map(|key| key.trim().to_lowercase())
            .filter(|key| !key.is_empty())
            .collect::<Vec<_>>();
        if characters.is_empty() {
            return Err(anyhow!("CHARACTER_KEYS must name at least one character"));
        }

        let lock_timeout = var("LOCK_TIMEOUT_MS", "5000")
            .parse::<u64>()
            .context("LOCK_TIMEOUT_MS must be a valid u64")?;
        let lock_retry = var("LOCK_RETRY_MS", "100")
            .parse::<u64>()
            .context("LOCK_RETRY_MS must be a valid u64")?;
        let history_keep = var("TIMESTAMPED_BACKUP_KEEP", &DEFAULT_HISTORY_KEEP.to_string())
            .parse::<usize>()
            .context("TIMESTAMPED_BACKUP_KEEP must be a valid usize")?;
        let session_ttl = var("SESSION_TTL_SECS", "43200")
            .parse::<u64>()
            .context("SESSION_TTL_SECS must be a valid u64")?;

        let auth = lookup("AUTH_TABLE")
            .unwrap_or_default()
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(AuthEntry::parse)
            .collect::<Result<Vec<_>>>()?;
        if let Some(stray) = auth.iter().find(|entry| !characters.contains(&entry.character)) {
            return Err(anyhow!(
                "AUTH_TABLE names unknown character '{}'",
                stray.character
            ));
        }

        Ok(Self {
            host,
            port,
            data_dir,
            characters_file: var("CHARACTERS_FILE", "characters.json"),
            npc_file: var("NPC_FILE", "npcs.json"),
            backup_dir,
            characters,
            lock_timeout: Duration::from_millis(lock_timeout),
            lock_retry: Duration::from_millis(lock_retry.max(1)),
            history_keep,
            session_ttl: Duration::from_secs(session_ttl),
            auth,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.characters_file)
    }

    pub fn npc_path(&self) -> PathBuf {
        self.data_dir.join(&self.npc_file)
    }

    pub fn roster(&self) -> Roster {
        Roster::new(self.characters.iter().cloned())
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            retry: self.lock_retry,
            timeout: self.lock_timeout,
        }
    }
}
