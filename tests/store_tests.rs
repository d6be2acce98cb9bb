use serde_json::json;
use sheetkeeper::sheet::{FieldValidator, RawUpdate, apply_batch};
use sheetkeeper::storage::{FileLock, update_with};
use sheetkeeper::{
    BackupKind, BackupManager, Document, DocumentStore, JsonFileStore, LockPolicy, Roster,
    SheetError,
};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    store: JsonFileStore,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = JsonFileStore::new(Self::primary(&dir), Self::backups(&dir));
        Self { dir, store }
    }

    fn primary(dir: &TempDir) -> PathBuf {
        dir.path().join("characters.json")
    }

    fn backups(dir: &TempDir) -> BackupManager {
        BackupManager::new(dir.path().join("backups"), &Self::primary(dir))
    }

    fn path(&self) -> PathBuf {
        Self::primary(&self.dir)
    }

    fn seed(&self, value: serde_json::Value) {
        std::fs::write(self.path(), serde_json::to_vec_pretty(&value).unwrap()).unwrap();
    }

    fn backup_names(&self) -> Vec<String> {
        let dir = self.dir.path().join("backups");
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn doc(value: serde_json::Value) -> Document {
    Document::from_value(value).unwrap()
}

#[tokio::test]
async fn blanking_every_name_is_rejected_and_store_unchanged() {
    let fx = Fixture::new();
    fx.seed(json!({"frunk": {"character": {"character_name": "Joe"}}}));
    let before = std::fs::read(fx.path()).unwrap();

    let err = fx
        .store
        .save(&doc(json!({"frunk": {"character": {"character_name": ""}}})))
        .await
        .unwrap_err();

    assert!(matches!(err, SheetError::WipeRejected));
    assert_eq!(std::fs::read(fx.path()).unwrap(), before);
    assert!(fx.backup_names().is_empty());
}

#[tokio::test]
async fn empty_document_is_never_written() {
    let fx = Fixture::new();
    let err = fx.store.save(&Document::new()).await.unwrap_err();
    assert!(matches!(err, SheetError::Validation(_)));
    assert!(!fx.path().exists());
}

#[tokio::test]
async fn save_backs_up_previous_content_first() {
    let fx = Fixture::new();
    fx.seed(json!({"frunk": {"character": {"character_name": "Joe"}}}));
    let before = std::fs::read(fx.path()).unwrap();

    fx.store
        .save(&doc(json!({"frunk": {"character": {"character_name": "Joseph"}}})))
        .await
        .unwrap();

    let recent = std::fs::read(fx.dir.path().join("backups/characters_recent.json")).unwrap();
    assert_eq!(recent, before);
    let loaded = fx.store.load().await.unwrap();
    let frunk = Roster::new(["frunk"]).resolve("frunk").unwrap();
    assert_eq!(loaded.character_name(&frunk), Some("Joseph"));
    assert!(fx.backup_names().iter().any(|name| name.starts_with("characters_0000")));
}

#[tokio::test]
async fn six_history_backups_leave_the_newest_five() {
    let fx = Fixture::new();
    let backups = Fixture::backups(&fx.dir);

    let mut written = Vec::new();
    for n in 0..6 {
        let body = serde_json::to_vec(&json!({"frunk": {"character": {"level": n.to_string()}}})).unwrap();
        written.push(backups.store(BackupKind::History, &body).await.unwrap());
    }

    let history = backups.sequenced(BackupKind::History).await.unwrap();
    assert_eq!(history.len(), 5);
    assert!(!written[0].exists());
    for path in &written[1..] {
        assert!(path.exists(), "{} should survive", path.display());
    }
}

#[tokio::test]
async fn held_lock_times_out_and_leaves_file_untouched() {
    let fx = Fixture::new();
    fx.seed(json!({"frunk": {"character": {"character_name": "Joe"}}}));
    let before = std::fs::read(fx.path()).unwrap();

    let policy = LockPolicy {
        retry: Duration::from_millis(20),
        timeout: Duration::from_millis(300),
    };
    let store = JsonFileStore::new(fx.path(), Fixture::backups(&fx.dir)).with_lock_policy(policy);
    let _held = FileLock::acquire(store.lock_path(), LockPolicy::default())
        .await
        .unwrap();

    let err = store
        .save(&doc(json!({"frunk": {"character": {"character_name": "Joseph"}}})))
        .await
        .unwrap_err();

    match err {
        SheetError::LockTimeout { waited_ms } => assert!(waited_ms >= 300),
        other => panic!("expected lock timeout, got {other:?}"),
    }
    assert_eq!(std::fs::read(fx.path()).unwrap(), before);
}

#[tokio::test]
async fn lock_is_released_after_each_write() {
    let fx = Fixture::new();
    fx.seed(json!({"frunk": {"character": {"character_name": "Joe"}}}));

    for name in ["A", "B", "C"] {
        fx.store
            .save(&doc(json!({"frunk": {"character": {"character_name": name}}})))
            .await
            .unwrap();
    }

    let policy = LockPolicy {
        retry: Duration::from_millis(10),
        timeout: Duration::from_millis(50),
    };
    FileLock::acquire(fx.store.lock_path(), policy).await.unwrap();
}

#[tokio::test]
async fn corrupt_store_recovers_from_latest_backup() {
    let fx = Fixture::new();
    fx.seed(json!({"frunk": {"character": {"character_name": "Joe"}}}));
    fx.store
        .save(&doc(json!({"frunk": {"character": {"character_name": "Joseph"}}})))
        .await
        .unwrap();

    std::fs::write(fx.path(), b"{\"frunk\": {").unwrap();

    let loaded = fx.store.load().await.unwrap();
    let frunk = Roster::new(["frunk"]).resolve("frunk").unwrap();
    assert_eq!(loaded.character_name(&frunk), Some("Joe"));

    // The recovered copy is written back as the primary.
    let on_disk = Document::parse(&std::fs::read(fx.path()).unwrap()).unwrap();
    assert_eq!(on_disk, loaded);
}

#[tokio::test]
async fn corrupt_store_without_backup_fails_loudly() {
    let fx = Fixture::new();
    std::fs::write(fx.path(), b"not json").unwrap();

    let err = fx.store.load().await.unwrap_err();
    assert!(matches!(err, SheetError::Corrupt(_)));
    assert_eq!(std::fs::read(fx.path()).unwrap(), b"not json");
}

#[tokio::test]
async fn batch_with_two_bad_updates_saves_the_rest_once() {
    let fx = Fixture::new();
    fx.seed(json!({"frunk": {"character": {"character_name": "Joe"}}}));
    let frunk = Roster::new(["frunk"]).resolve("frunk").unwrap();
    let validator = FieldValidator::default();

    let updates: Vec<RawUpdate> = serde_json::from_value(json!([
        {"section": "character", "field": "level", "value": "3"},
        {"section": "character", "field": "house", "value": "Owl"},
        {"section": "inventory", "field": "sword", "value": "yes"},
        {"section": "job", "field": "title", "value": "Courier"},
        {"section": "spells", "field": "fireball", "value": "1"}
    ]))
    .unwrap();

    let outcome = update_with(&fx.store, |doc| Ok(apply_batch(doc, &frunk, &updates, &validator)))
        .await
        .unwrap();

    assert_eq!((outcome.saved, outcome.errors), (3, 2));
    // One save means one history backup.
    let history: Vec<_> = fx
        .backup_names()
        .into_iter()
        .filter(|name| name.starts_with("characters_0"))
        .collect();
    assert_eq!(history.len(), 1);

    let on_disk = Document::parse(&std::fs::read(fx.path()).unwrap()).unwrap();
    let record = on_disk.record(&frunk).unwrap();
    assert_eq!(record["character"]["level"], "3");
    assert_eq!(record["character"]["house"], "Owl");
    assert_eq!(record["job"]["title"], "Courier");
    assert_eq!(record["character"]["character_name"], "Joe");
}

#[tokio::test]
async fn unchanged_update_writes_nothing() {
    let fx = Fixture::new();
    fx.seed(json!({"frunk": {"character": {"character_name": "Joe"}}}));
    let before = std::fs::read(fx.path()).unwrap();

    let mut untouched = |_doc: &mut Document| -> sheetkeeper::Result<()> { Ok(()) };
    let changed = fx.store.update(&mut untouched).await.unwrap();

    assert!(!changed);
    assert_eq!(std::fs::read(fx.path()).unwrap(), before);
    assert!(fx.backup_names().is_empty());
}

#[tokio::test]
async fn restore_keeps_a_copy_of_what_it_replaced() {
    let fx = Fixture::new();
    fx.seed(json!({"frunk": {"character": {"character_name": "Joe"}}}));
    let manual = fx.store.create_backup(BackupKind::Manual).await.unwrap();

    fx.store
        .save(&doc(json!({"frunk": {"character": {"character_name": "Joseph"}}})))
        .await
        .unwrap();
    let history_before = fx.store.backups().sequenced(BackupKind::History).await.unwrap().len();

    fx.store.restore(&manual).await.unwrap();

    let frunk = Roster::new(["frunk"]).resolve("frunk").unwrap();
    let loaded = fx.store.load().await.unwrap();
    assert_eq!(loaded.character_name(&frunk), Some("Joe"));
    let history_after = fx.store.backups().sequenced(BackupKind::History).await.unwrap().len();
    assert_eq!(history_after, history_before + 1);
}
