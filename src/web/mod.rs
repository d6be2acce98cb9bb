//! HTTP surface for the character store.
//!
//! Two action endpoints (characters and backups) plus login. Every failure,
//! including a body that does not parse, is answered with the same
//! `{"success": false, "error": "..."}` envelope.

pub mod auth;
pub mod backups;
pub mod characters;

use crate::core::{Roster, SheetError};
use crate::npc::NpcMirror;
use crate::sheet::FieldValidator;
use crate::storage::{BackupManager, DocumentStore};
use auth::AuthService;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::error;

pub use auth::Identity;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub backups: Arc<BackupManager>,
    pub npcs: Arc<dyn NpcMirror>,
    pub roster: Arc<Roster>,
    pub validator: Arc<FieldValidator>,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        backups: Arc<BackupManager>,
        npcs: Arc<dyn NpcMirror>,
        roster: Roster,
        auth: AuthService,
    ) -> Self {
        Self {
            store,
            backups,
            npcs,
            roster: Arc::new(roster),
            validator: Arc::new(FieldValidator::default()),
            auth: Arc::new(auth),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/api/characters", post(characters::handle))
        .route("/api/backups", post(backups::handle))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    success(Value::Null)
}

/// `{"success": true}` merged with the fields of `extra`.
pub fn success(extra: Value) -> Json<Value> {
    let mut body = Map::new();
    body.insert("success".to_string(), Value::Bool(true));
    if let Value::Object(fields) = extra {
        body.extend(fields);
    }
    Json(Value::Object(body))
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error(transparent)]
    Sheet(#[from] SheetError),
    #[error("{0}")]
    BadRequest(String),
    #[error("authentication required")]
    Unauthenticated,
    #[error("{0}")]
    Forbidden(String),
}

impl WebError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WebError::Unauthenticated => StatusCode::UNAUTHORIZED,
            WebError::Forbidden(_) => StatusCode::FORBIDDEN,
            WebError::Sheet(err) => match err {
                SheetError::Validation(_) | SheetError::UnknownCharacter(_) => {
                    StatusCode::BAD_REQUEST
                }
                SheetError::BackupNotFound(_) => StatusCode::NOT_FOUND,
                SheetError::WipeRejected => StatusCode::CONFLICT,
                SheetError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
                SheetError::Corrupt(_) | SheetError::Serialization(_) | SheetError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = Json(ErrorBody {
            success: false,
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;
