pub mod backup;
pub mod json_file;
pub mod lock;

pub use backup::{BackupEntry, BackupKind, BackupManager, BackupReport};
pub use json_file::JsonFileStore;
pub use lock::{FileLock, LockPolicy};

use crate::core::{Result, SheetError};
use crate::sheet::Document;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Storage seam for the character document.
///
/// Every mutating caller goes through [`DocumentStore::update`], which holds
/// the store lock across the whole load-mutate-save cycle. The JSON file
/// store is the only implementation today.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self) -> Result<Document>;

    /// Replaces the whole document, subject to the anti-wipe guard.
    async fn save(&self, doc: &Document) -> Result<()>;

    /// Runs `mutate` against the current document and saves it if it changed.
    ///
    /// Returns whether anything was written.
    async fn update(
        &self,
        mutate: &mut (dyn for<'d> FnMut(&'d mut Document) -> Result<()> + Send),
    ) -> Result<bool>;

    async fn create_backup(&self, kind: BackupKind) -> Result<PathBuf>;

    async fn restore(&self, backup: &Path) -> Result<()>;
}

/// Typed wrapper over [`DocumentStore::update`] for mutations that produce a value.
pub async fn update_with<T, F>(store: &dyn DocumentStore, mutate: F) -> Result<T>
where
    T: Send,
    F: FnOnce(&mut Document) -> Result<T> + Send,
{
    let mut mutate = Some(mutate);
    let mut output = None;
    store
        .update(&mut |doc| {
            let run = mutate
                .take()
                .ok_or_else(|| SheetError::Io("store mutation ran twice".to_string()))?;
            output = Some(run(doc)?);
            Ok(())
        })
        .await?;
    output.ok_or_else(|| SheetError::Io("store mutation did not run".to_string()))
}
