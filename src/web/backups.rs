use super::{AppState, Identity, Result, WebError, success};
use crate::core::SheetError;
use crate::storage::BackupKind;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::Path;
use tracing::info;

/// Actions accepted by `POST /api/backups`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BackupCommand {
    CreateSessionBackup,
    CreatePreSaveBackup,
    CreateBackup {
        #[serde(default)]
        kind: Option<String>,
    },
    RestoreBackup {
        backup_path: String,
    },
    VerifyBackup {
        backup_path: String,
    },
    ListBackups,
}

pub async fn handle(State(state): State<AppState>, identity: Identity, body: Bytes) -> Response {
    let command = match serde_json::from_slice::<BackupCommand>(&body) {
        Ok(command) => command,
        Err(err) => {
            return WebError::BadRequest(format!("invalid request: {}", err)).into_response();
        }
    };

    match dispatch(&state, &identity, command).await {
        Ok(body) => body.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn dispatch(state: &AppState, identity: &Identity, command: BackupCommand) -> Result<Json<Value>> {
    match command {
        BackupCommand::CreateSessionBackup => create(state, BackupKind::Session).await,
        BackupCommand::CreatePreSaveBackup => create(state, BackupKind::Recent).await,
        BackupCommand::CreateBackup { kind } => {
            identity.require_editor()?;
            let kind = match kind.as_deref().unwrap_or("manual").parse::<BackupKind>()? {
                kind @ (BackupKind::Manual | BackupKind::Daily) => kind,
                other => {
                    return Err(SheetError::validation(format!(
                        "create_backup only makes manual or daily backups, not {}",
                        other
                    ))
                    .into());
                }
            };
            create(state, kind).await
        }
        BackupCommand::RestoreBackup { backup_path } => {
            identity.require_editor()?;
            let path = state.backups.resolve(&backup_path)?;
            state.store.restore(&path).await?;
            info!(backup = %backup_path, by = %identity.character(), "backup restored");
            Ok(success(json!({ "backup_name": file_name(&path) })))
        }
        BackupCommand::VerifyBackup { backup_path } => {
            identity.require_editor()?;
            let path = state.backups.resolve(&backup_path)?;
            let report = state.backups.verify(&path).await?;
            Ok(success(json!({ "backup_name": report.name, "data": report })))
        }
        BackupCommand::ListBackups => {
            identity.require_editor()?;
            let entries = state.backups.list().await?;
            Ok(success(json!({ "data": entries })))
        }
    }
}

async fn create(state: &AppState, kind: BackupKind) -> Result<Json<Value>> {
    let path = state.store.create_backup(kind).await?;
    Ok(success(json!({ "backup_name": file_name(&path) })))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
