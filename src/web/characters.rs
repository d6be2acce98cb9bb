use super::{AppState, Identity, Result, WebError, success};
use crate::core::{CharacterKey, Section};
use crate::npc::mirror_best_effort;
use crate::sheet::{
    RawUpdate, add_item, apply_batch, apply_field_update, delete_item, relationship_mirror,
};
use crate::storage::update_with;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

/// Actions accepted by `POST /api/characters`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CharacterCommand {
    Load {
        #[serde(default)]
        character: Option<String>,
    },
    Save {
        character: String,
        section: String,
        field: String,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        index: Option<usize>,
    },
    BatchSave {
        character: String,
        #[serde(default)]
        updates: Vec<RawUpdate>,
    },
    AddItem {
        character: String,
        section: String,
    },
    DeleteItem {
        character: String,
        section: String,
        index: usize,
    },
}

pub async fn handle(State(state): State<AppState>, identity: Identity, body: Bytes) -> Response {
    let command = match serde_json::from_slice::<CharacterCommand>(&body) {
        Ok(command) => command,
        Err(err) => {
            return WebError::BadRequest(format!("invalid request: {}", err)).into_response();
        }
    };

    let result = match command {
        CharacterCommand::Load { character } => load(&state, &identity, character).await,
        CharacterCommand::Save {
            character,
            section,
            field,
            value,
            index,
        } => {
            let raw = RawUpdate {
                section,
                field,
                value,
                index,
            };
            save(&state, &identity, &character, raw).await
        }
        CharacterCommand::BatchSave { character, updates } => {
            return batch_save(&state, &identity, &character, updates)
                .await
                .unwrap_or_else(IntoResponse::into_response);
        }
        CharacterCommand::AddItem { character, section } => {
            add(&state, &identity, &character, &section).await
        }
        CharacterCommand::DeleteItem {
            character,
            section,
            index,
        } => delete(&state, &identity, &character, &section, index).await,
    };

    match result {
        Ok(body) => body.into_response(),
        Err(err) => err.into_response(),
    }
}

fn target(state: &AppState, identity: &Identity, raw: &str) -> Result<CharacterKey> {
    let key = state.roster.resolve(raw)?;
    identity.authorize(&key)?;
    Ok(key)
}

async fn load(state: &AppState, identity: &Identity, character: Option<String>) -> Result<Json<Value>> {
    let doc = state.store.load().await?;
    match character {
        Some(raw) => {
            let key = target(state, identity, &raw)?;
            let record = doc.record(&key).cloned().unwrap_or_else(|| json!({}));
            Ok(success(json!({ "data": record })))
        }
        None => {
            identity.require_editor()?;
            Ok(success(json!({ "data": doc.into_value() })))
        }
    }
}

async fn save(state: &AppState, identity: &Identity, character: &str, raw: RawUpdate) -> Result<Json<Value>> {
    let key = target(state, identity, character)?;
    let update = raw.parse()?;
    let validator = state.validator.clone();

    let (changed, mirror) = update_with(state.store.as_ref(), |doc| {
        let changed = apply_field_update(doc, &key, &update, &validator)?;
        let mirror = match (update.section, update.index) {
            (Section::Relationships, Some(index)) if changed => relationship_mirror(doc, &key, index),
            _ => None,
        };
        Ok((changed, mirror))
    })
    .await?;

    debug!(character = %key, section = %update.section, field = %update.field, changed, "field saved");
    if let Some(link) = mirror {
        mirror_best_effort(state.npcs.as_ref(), &[link]).await;
    }
    Ok(success(json!({ "data": { "changed": changed } })))
}

async fn batch_save(
    state: &AppState,
    identity: &Identity,
    character: &str,
    updates: Vec<RawUpdate>,
) -> Result<Response> {
    let key = target(state, identity, character)?;
    let validator = state.validator.clone();

    let (outcome, links) = update_with(state.store.as_ref(), |doc| {
        let outcome = apply_batch(doc, &key, &updates, &validator);
        let links: Vec<_> = outcome
            .relationships
            .iter()
            .filter_map(|index| relationship_mirror(doc, &key, *index))
            .collect();
        Ok((outcome, links))
    })
    .await?;

    info!(character = %key, saved = outcome.saved, errors = outcome.errors, "batch saved");
    mirror_best_effort(state.npcs.as_ref(), &links).await;

    let body = json!({
        "saved": outcome.saved,
        "errors": outcome.errors,
        "messages": outcome.messages,
    });
    if outcome.saved == 0 && outcome.errors > 0 {
        let mut failure = body;
        failure["success"] = Value::Bool(false);
        failure["error"] = Value::String("no updates could be applied".to_string());
        return Ok((StatusCode::BAD_REQUEST, Json(failure)).into_response());
    }
    Ok(success(body).into_response())
}

async fn add(state: &AppState, identity: &Identity, character: &str, section: &str) -> Result<Json<Value>> {
    let key = target(state, identity, character)?;
    let section: Section = section.parse()?;
    let index = update_with(state.store.as_ref(), |doc| add_item(doc, &key, section)).await?;
    info!(character = %key, section = %section, index, "item added");
    Ok(success(json!({ "data": { "index": index } })))
}

async fn delete(
    state: &AppState,
    identity: &Identity,
    character: &str,
    section: &str,
    index: usize,
) -> Result<Json<Value>> {
    let key = target(state, identity, character)?;
    let section: Section = section.parse()?;
    let removed = update_with(state.store.as_ref(), |doc| delete_item(doc, &key, section, index)).await?;
    info!(character = %key, section = %section, index, "item deleted");
    Ok(success(json!({ "data": { "removed": removed } })))
}
