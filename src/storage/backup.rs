//! Backup Manager
//!
//! Backups live next to each other in one directory, named after the store
//! file stem:
//!
//! - `recent`: `<stem>_recent.json`, one slot overwritten before every save.
//!   This is also the file `load` recovers from.
//! - `session`: `<stem>_session_0.json` / `<stem>_session_1.json`, a two-slot
//!   ring. The next slot is tracked in `<stem>_session.slot`.
//! - `manual` / `daily`: `<stem>_<kind>_<seq>_<timestamp>.json`, newest 2 kept.
//! - `history`: `<stem>_<seq>_<timestamp>.json`, newest N kept (5 by default).
//!
//! Sequence numbers are zero-padded so filename order is creation order even
//! when two backups land in the same second.

use crate::core::{Result, SheetError};
use crate::sheet::Document;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info};

pub const SESSION_SLOTS: usize = 2;
pub const CAPPED_KEEP: usize = 2;
pub const DEFAULT_HISTORY_KEEP: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Recent,
    Session,
    Manual,
    Daily,
    History,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Recent => "recent",
            BackupKind::Session => "session",
            BackupKind::Manual => "manual",
            BackupKind::Daily => "daily",
            BackupKind::History => "history",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = SheetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recent" | "pre_save" => Ok(BackupKind::Recent),
            "session" => Ok(BackupKind::Session),
            "manual" => Ok(BackupKind::Manual),
            "daily" => Ok(BackupKind::Daily),
            "history" => Ok(BackupKind::History),
            other => Err(SheetError::validation(format!("unknown backup kind '{}'", other))),
        }
    }
}

/// Result of [`BackupManager::verify`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupReport {
    pub name: String,
    pub records: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupEntry {
    pub name: String,
    pub kind: BackupKind,
    pub bytes: u64,
    #[serde(skip)]
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
    stem: String,
    history_keep: usize,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, store_path: &Path) -> Self {
        let stem = store_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("store")
            .to_string();
        Self {
            dir: dir.into(),
            stem,
            history_keep: DEFAULT_HISTORY_KEEP,
        }
    }

    pub fn with_history_keep(mut self, keep: usize) -> Self {
        self.history_keep = keep.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn recent_path(&self) -> PathBuf {
        self.dir.join(format!("{}_recent.json", self.stem))
    }

    fn session_path(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("{}_session_{}.json", self.stem, slot))
    }

    fn session_slot_path(&self) -> PathBuf {
        self.dir.join(format!("{}_session.slot", self.stem))
    }

    /// Writes `bytes` as a new backup of the given kind and applies its retention.
    pub async fn store(&self, kind: BackupKind, bytes: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;

        let path = match kind {
            BackupKind::Recent => self.recent_path(),
            BackupKind::Session => {
                let slot = self.next_session_slot().await;
                let path = self.session_path(slot);
                write_atomic(&path, bytes).await?;
                let next = (slot + 1) % SESSION_SLOTS;
                write_atomic(&self.session_slot_path(), next.to_string().as_bytes()).await?;
                debug!(kind = %kind, backup = %path.display(), bytes = bytes.len(), "backup written");
                return Ok(path);
            }
            BackupKind::Manual | BackupKind::Daily | BackupKind::History => {
                let seq = self.last_sequence(kind).await? + 1;
                self.dir.join(self.sequenced_name(kind, seq))
            }
        };

        write_atomic(&path, bytes).await?;

        match kind {
            BackupKind::Manual | BackupKind::Daily => self.prune(kind, CAPPED_KEEP).await?,
            BackupKind::History => self.prune(kind, self.history_keep).await?,
            BackupKind::Recent | BackupKind::Session => {}
        }

        debug!(kind = %kind, backup = %path.display(), bytes = bytes.len(), "backup written");
        Ok(path)
    }

    /// Parses a backup and reports its size; never mutates anything.
    pub async fn verify(&self, path: &Path) -> Result<BackupReport> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SheetError::BackupNotFound(display_name(path)));
            }
            Err(err) => return Err(err.into()),
        };
        let doc = Document::parse(&bytes)
            .map_err(|err| SheetError::Corrupt(format!("{}: {}", display_name(path), err)))?;
        Ok(BackupReport {
            name: display_name(path),
            records: doc.record_count(),
            bytes: bytes.len() as u64,
        })
    }

    /// Maps a bare file name from a request onto a backup in this directory.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let name = name.trim();
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
            || !name.ends_with(".json")
        {
            return Err(SheetError::validation(format!("invalid backup name '{}'", name)));
        }
        if self.classify(name).is_none() {
            return Err(SheetError::BackupNotFound(name.to_string()));
        }
        Ok(self.dir.join(name))
    }

    /// All backups, newest first.
    pub async fn list(&self) -> Result<Vec<BackupEntry>> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((kind, _)) = self.classify(&name) else {
                continue;
            };
            let meta = entry.metadata().await?;
            entries.push(BackupEntry {
                name,
                kind,
                bytes: meta.len(),
                modified: meta.modified().ok(),
            });
        }

        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        Ok(entries)
    }

    /// Sequenced backups of one kind, oldest first by filename.
    pub async fn sequenced(&self, kind: BackupKind) -> Result<Vec<PathBuf>> {
        let mut names: Vec<(u64, String)> = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((found, Some(seq))) = self.classify(&name) {
                if found == kind {
                    names.push((seq, name));
                }
            }
        }
        names.sort();
        Ok(names.into_iter().map(|(_, name)| self.dir.join(name)).collect())
    }

    async fn prune(&self, kind: BackupKind, keep: usize) -> Result<()> {
        let existing = self.sequenced(kind).await?;
        let excess = existing.len().saturating_sub(keep);
        for old in existing.into_iter().take(excess) {
            fs::remove_file(&old).await?;
            info!(kind = %kind, backup = %old.display(), "pruned old backup");
        }
        Ok(())
    }

    async fn last_sequence(&self, kind: BackupKind) -> Result<u64> {
        Ok(self
            .sequenced(kind)
            .await?
            .last()
            .and_then(|path| path.file_name())
            .and_then(|name| self.classify(&name.to_string_lossy()))
            .and_then(|(_, seq)| seq)
            .unwrap_or(0))
    }

    async fn next_session_slot(&self) -> usize {
        fs::read_to_string(self.session_slot_path())
            .await
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|slot| *slot < SESSION_SLOTS)
            .unwrap_or(0)
    }

    fn sequenced_name(&self, kind: BackupKind, seq: u64) -> String {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        match kind {
            BackupKind::History => format!("{}_{:08}_{}.json", self.stem, seq, stamp),
            _ => format!("{}_{}_{:08}_{}.json", self.stem, kind, seq, stamp),
        }
    }

    /// Recognizes a backup file name, returning its kind and sequence number.
    fn classify(&self, name: &str) -> Option<(BackupKind, Option<u64>)> {
        let rest = name
            .strip_prefix(self.stem.as_str())?
            .strip_prefix('_')?
            .strip_suffix(".json")?;

        if rest == "recent" {
            return Some((BackupKind::Recent, None));
        }
        if let Some(slot) = rest.strip_prefix("session_") {
            return slot
                .parse::<usize>()
                .ok()
                .filter(|slot| *slot < SESSION_SLOTS)
                .map(|_| (BackupKind::Session, None));
        }

        let (kind, rest) = if let Some(rest) = rest.strip_prefix("manual_") {
            (BackupKind::Manual, rest)
        } else if let Some(rest) = rest.strip_prefix("daily_") {
            (BackupKind::Daily, rest)
        } else {
            (BackupKind::History, rest)
        };
        let seq = rest.get(..8)?;
        if rest.as_bytes().get(8) != Some(&b'_') || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((kind, seq.parse().ok()))
    }
}

/// Writes through a sibling temp file and renames it into place.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    if let Err(err) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(SheetError::Io(format!(
            "Failed to write temp file '{}': {}",
            tmp.display(),
            err
        )));
    }
    fs::rename(&tmp, path).await.map_err(|err| {
        SheetError::Io(format!(
            "Failed to rename temp file '{}' -> '{}': {}",
            tmp.display(),
            path.display(),
            err
        ))
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> BackupManager {
        BackupManager::new(dir.path().join("backups"), Path::new("characters.json"))
    }

    #[test]
    fn classifies_backup_names() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        assert_eq!(m.classify("characters_recent.json"), Some((BackupKind::Recent, None)));
        assert_eq!(m.classify("characters_session_1.json"), Some((BackupKind::Session, None)));
        assert_eq!(m.classify("characters_session_2.json"), None);
        assert_eq!(
            m.classify("characters_manual_00000003_20260101_120000.json"),
            Some((BackupKind::Manual, Some(3)))
        );
        assert_eq!(
            m.classify("characters_00000012_20260101_120000.json"),
            Some((BackupKind::History, Some(12)))
        );
        assert_eq!(m.classify("inventory_recent.json"), None);
        assert_eq!(m.classify("characters.json"), None);
    }

    #[tokio::test]
    async fn session_ring_alternates_slots() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let first = m.store(BackupKind::Session, b"{\"a\":1}").await.unwrap();
        let second = m.store(BackupKind::Session, b"{\"a\":2}").await.unwrap();
        let third = m.store(BackupKind::Session, b"{\"a\":3}").await.unwrap();

        assert!(first.ends_with("characters_session_0.json"));
        assert!(second.ends_with("characters_session_1.json"));
        assert_eq!(first, third);
        assert_eq!(std::fs::read(&third).unwrap(), b"{\"a\":3}");
    }

    #[tokio::test]
    async fn manual_backups_keep_two_newest() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        for n in 0..4 {
            m.store(BackupKind::Manual, format!("{{\"n\":{}}}", n).as_bytes())
                .await
                .unwrap();
        }
        let kept = m.sequenced(BackupKind::Manual).await.unwrap();
        assert_eq!(kept.len(), CAPPED_KEEP);
        assert_eq!(std::fs::read(&kept[1]).unwrap(), b"{\"n\":3}");
        assert_eq!(std::fs::read(&kept[0]).unwrap(), b"{\"n\":2}");
    }

    #[tokio::test]
    async fn verify_reports_records_and_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let body = b"{\"frunk\":{},\"sharon\":{}}";
        let good = m.store(BackupKind::Daily, body).await.unwrap();
        let report = m.verify(&good).await.unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.bytes, body.len() as u64);

        let bad = m.store(BackupKind::Recent, b"{not json").await.unwrap();
        assert!(matches!(m.verify(&bad).await, Err(SheetError::Corrupt(_))));
        assert!(matches!(
            m.verify(&dir.path().join("missing.json")).await,
            Err(SheetError::BackupNotFound(_))
        ));
    }

    #[test]
    fn resolve_rejects_paths() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        assert!(m.resolve("characters_recent.json").is_ok());
        assert!(matches!(m.resolve("../characters.json"), Err(SheetError::Validation(_))));
        assert!(matches!(m.resolve("/etc/passwd.json"), Err(SheetError::Validation(_))));
        assert!(matches!(m.resolve("other.json"), Err(SheetError::BackupNotFound(_))));
    }
}
