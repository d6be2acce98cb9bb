//! Lock-guarded JSON document store.

use super::backup::{BackupKind, BackupManager};
use super::lock::{FileLock, LockPolicy};
use super::DocumentStore;
use crate::core::{Result, SheetError};
use crate::sheet::Document;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{error, info, warn};

pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
    backups: BackupManager,
    lock_policy: LockPolicy,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, backups: BackupManager) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_name),
            path,
            backups,
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    async fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.lock_path, self.lock_policy).await
    }

    /// Raw bytes of the primary file, `None` when it does not exist yet.
    async fn read_primary(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_inner(&self, locked: bool) -> Result<Document> {
        let Some(bytes) = self.read_primary().await? else {
            return Ok(Document::new());
        };
        match parse_stored(&bytes) {
            Ok(doc) => Ok(doc),
            Err(reason) => self.recover(reason, locked).await,
        }
    }

    /// One-shot recovery from the `recent` backup, written back as primary.
    async fn recover(&self, reason: String, locked: bool) -> Result<Document> {
        let source = self.backups.recent_path();
        warn!(store = %self.path.display(), reason = %reason, backup = %source.display(), "store unreadable, recovering from latest backup");

        let bytes = fs::read(&source).await.map_err(|err| {
            error!(store = %self.path.display(), error = %err, "no usable backup to recover from");
            SheetError::Corrupt(format!("{}; backup unreadable: {}", reason, err))
        })?;
        let doc = parse_stored(&bytes).map_err(|backup_reason| {
            error!(store = %self.path.display(), reason = %backup_reason, "latest backup is corrupt too");
            SheetError::Corrupt(format!("{}; backup invalid: {}", reason, backup_reason))
        })?;

        let _guard = if locked { None } else { Some(self.lock().await?) };
        self.write_verified(bytes).await?;
        info!(store = %self.path.display(), records = doc.record_count(), "store restored from latest backup");
        Ok(doc)
    }

    async fn save_locked(&self, doc: &Document) -> Result<()> {
        if doc.is_empty() {
            return Err(SheetError::validation("refusing to save an empty document"));
        }

        let current = self.read_primary().await?;
        let parsed = current.as_deref().and_then(|bytes| parse_stored(bytes).ok());

        let had_names = parsed.as_ref().is_some_and(Document::has_any_character_name);
        if had_names && !doc.has_any_character_name() {
            warn!(store = %self.path.display(), "rejected save that would blank every character name");
            return Err(SheetError::WipeRejected);
        }

        match (&current, &parsed) {
            (Some(bytes), Some(_)) => {
                self.backups.store(BackupKind::Recent, bytes).await?;
                self.backups.store(BackupKind::History, bytes).await?;
            }
            (Some(_), None) => {
                warn!(store = %self.path.display(), "current store unreadable, skipping pre-save backups");
            }
            (None, _) => {}
        }

        self.write_verified(doc.to_pretty_bytes()?).await
    }

    /// Temp file in the store directory, re-read and parsed, then renamed over the primary.
    pub(crate) async fn write_verified(&self, bytes: Vec<u8>) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_verified_blocking(&path, &bytes))
            .await
            .map_err(|err| SheetError::Io(format!("store writer task failed: {}", err)))?
    }

    /// Copies a backup over the primary, backing up the current primary first.
    pub async fn restore_from(&self, backup: &Path) -> Result<()> {
        let bytes = match fs::read(backup).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SheetError::BackupNotFound(backup.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        Document::parse(&bytes).map_err(|err| {
            SheetError::Corrupt(format!("backup '{}' is not a valid store: {}", backup.display(), err))
        })?;

        let _lock = self.lock().await?;
        if let Some(current) = self.read_primary().await? {
            if !current.is_empty() {
                self.backups.store(BackupKind::History, &current).await?;
            }
        }
        self.write_verified(bytes).await?;
        info!(store = %self.path.display(), backup = %backup.display(), "store restored from backup");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self) -> Result<Document> {
        self.load_inner(false).await
    }

    async fn save(&self, doc: &Document) -> Result<()> {
        if doc.is_empty() {
            return Err(SheetError::validation("refusing to save an empty document"));
        }
        let _lock = self.lock().await?;
        self.save_locked(doc).await
    }

    async fn update(
        &self,
        mutate: &mut (dyn for<'d> FnMut(&'d mut Document) -> Result<()> + Send),
    ) -> Result<bool> {
        let _lock = self.lock().await?;
        let mut doc = self.load_inner(true).await?;
        let before = doc.clone();
        mutate(&mut doc)?;
        if doc == before {
            return Ok(false);
        }
        self.save_locked(&doc).await?;
        Ok(true)
    }

    async fn create_backup(&self, kind: BackupKind) -> Result<PathBuf> {
        let _lock = self.lock().await?;
        let bytes = self
            .read_primary()
            .await?
            .ok_or_else(|| SheetError::validation("store has not been written yet"))?;
        parse_stored(&bytes).map_err(SheetError::Corrupt)?;
        let path = self.backups.store(kind, &bytes).await?;
        info!(kind = %kind, backup = %path.display(), "backup created");
        Ok(path)
    }

    async fn restore(&self, backup: &Path) -> Result<()> {
        self.restore_from(backup).await
    }
}

fn parse_stored(bytes: &[u8]) -> std::result::Result<Document, String> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err("store file is empty".to_string());
    }
    Document::parse(bytes).map_err(|err| err.to_string())
}

fn write_verified_blocking(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    // Dropped (and deleted) on every early return below.
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    let written = std::fs::read(tmp.path())?;
    Document::parse(&written).map_err(|err| {
        SheetError::Corrupt(format!("temp file failed verification: {}", err))
    })?;

    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
