//! NPC relationship mirror.
//!
//! When a character's relationship entry points at an NPC, its points and
//! notes are copied into that NPC's record in a separate JSON document. The
//! copy is best-effort: a failure here is logged and never fails the
//! character save that triggered it.

use crate::core::{Result, SheetError};
use crate::sheet::RelationshipMirror;
use crate::storage::backup::write_atomic;
use crate::storage::{FileLock, LockPolicy};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

#[async_trait]
pub trait NpcMirror: Send + Sync {
    /// Returns `false` when no NPC with that id exists.
    async fn mirror(&self, link: &RelationshipMirror) -> Result<bool>;
}

pub struct JsonNpcStore {
    path: PathBuf,
    lock_policy: LockPolicy,
}

impl JsonNpcStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

#[async_trait]
impl NpcMirror for JsonNpcStore {
    async fn mirror(&self, link: &RelationshipMirror) -> Result<bool> {
        let _lock = FileLock::acquire(&self.lock_path(), self.lock_policy).await?;

        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let mut npcs: Map<String, Value> = serde_json::from_slice(&bytes)?;

        let Some(Value::Object(npc)) = npcs.get_mut(&link.npc_id) else {
            debug!(npc = %link.npc_id, "relationship points at unknown NPC");
            return Ok(false);
        };
        npc.insert(
            format!("{}_points", link.pc_name),
            Value::String(link.points.clone()),
        );
        npc.insert(
            format!("{}_notes", link.pc_name),
            Value::String(link.notes.clone()),
        );

        let out = serde_json::to_vec_pretty(&npcs)?;
        write_atomic(&self.path, &out).await?;
        Ok(true)
    }
}

/// Mirrors every link, logging failures instead of returning them.
pub async fn mirror_best_effort(mirror: &dyn NpcMirror, links: &[RelationshipMirror]) -> usize {
    let mut mirrored = 0;
    for link in links {
        match mirror.mirror(link).await {
            Ok(true) => mirrored += 1,
            Ok(false) => {}
            Err(err) => log_failure(link, &err),
        }
    }
    mirrored
}

fn log_failure(link: &RelationshipMirror, err: &SheetError) {
    warn!(npc = %link.npc_id, character = %link.pc_name, error = %err, "NPC relationship mirror failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn link(npc: &str) -> RelationshipMirror {
        RelationshipMirror {
            npc_id: npc.to_string(),
            pc_name: "frunk".to_string(),
            points: "4".to_string(),
            notes: "met at the docks".to_string(),
        }
    }

    #[tokio::test]
    async fn writes_pc_fields_into_matching_npc() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("npcs.json");
        std::fs::write(&path, json!({"npc-1": {"name": "Mara"}}).to_string()).unwrap();

        let store = JsonNpcStore::new(&path);
        assert!(store.mirror(&link("npc-1")).await.unwrap());
        assert!(!store.mirror(&link("npc-9")).await.unwrap());

        let saved: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved["npc-1"]["frunk_points"], "4");
        assert_eq!(saved["npc-1"]["frunk_notes"], "met at the docks");
        assert_eq!(saved["npc-1"]["name"], "Mara");
    }

    #[tokio::test]
    async fn best_effort_swallows_corrupt_npc_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("npcs.json");
        std::fs::write(&path, "{broken").unwrap();

        let store = JsonNpcStore::new(&path);
        assert_eq!(mirror_best_effort(&store, &[link("npc-1")]).await, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{broken");
    }
}
