// ============================================================================
// Sheetkeeper Library
// ============================================================================
//
// Character sheets for a small roster, kept in one JSON document on disk.
// The server side locks, validates, backs up and verifies every write; the
// client side batches edits through a debounced single-flight queue.

pub mod client;
pub mod config;
pub mod core;
pub mod npc;
pub mod sheet;
pub mod storage;
pub mod web;

pub use core::{CharacterKey, FieldUpdate, Result, Roster, Section, SheetError};
pub use sheet::{Document, FieldValidator};
pub use storage::{BackupKind, BackupManager, DocumentStore, JsonFileStore, LockPolicy};
pub use web::{AppState, build_router};
