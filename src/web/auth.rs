use super::{AppState, WebError, success};
use crate::config::AuthEntry;
use crate::core::{CharacterKey, Roster, SheetError};
use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::{Json, response::IntoResponse};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Who is making a request: the character they play and whether they may
/// edit everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    character: CharacterKey,
    editor: bool,
}

impl Identity {
    pub fn new(character: CharacterKey, editor: bool) -> Self {
        Self { character, editor }
    }

    pub fn character(&self) -> &CharacterKey {
        &self.character
    }

    #[inline]
    pub fn is_editor(&self) -> bool {
        self.editor
    }

    /// Players may only touch their own sheet; editors may touch any.
    pub fn authorize(&self, target: &CharacterKey) -> Result<(), WebError> {
        if self.editor || &self.character == target {
            Ok(())
        } else {
            Err(WebError::Forbidden(format!(
                "{} may not edit {}",
                self.character, target
            )))
        }
    }

    pub fn require_editor(&self) -> Result<(), WebError> {
        if self.editor {
            Ok(())
        } else {
            Err(WebError::Forbidden("editor access required".to_string()))
        }
    }
}

struct Account {
    password_hash: String,
    identity: Identity,
}

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

struct Session {
    identity: Identity,
    issued: Instant,
}

/// Static password table plus the sessions issued from it.
///
/// Sessions expire `session_ttl` after they are issued. Expired tokens are
/// swept whenever a new one is issued.
pub struct AuthService {
    accounts: Vec<Account>,
    sessions: RwLock<HashMap<String, Session>>,
    session_ttl: Duration,
}

impl AuthService {
    pub fn new(entries: &[AuthEntry], roster: &Roster) -> crate::core::Result<Self> {
        let accounts = entries
            .iter()
            .map(|entry| {
                Ok(Account {
                    password_hash: entry.password_hash.clone(),
                    identity: Identity::new(roster.resolve(&entry.character)?, entry.editor),
                })
            })
            .collect::<crate::core::Result<Vec<_>>>()?;
        Ok(Self {
            accounts,
            sessions: RwLock::new(HashMap::new()),
            session_ttl: DEFAULT_SESSION_TTL,
        })
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Checks `password` against every bcrypt hash; the first match wins.
    pub async fn login(&self, password: &str) -> Option<(String, Identity)> {
        let candidates: Vec<(String, Identity)> = self
            .accounts
            .iter()
            .map(|account| (account.password_hash.clone(), account.identity.clone()))
            .collect();
        let password = password.to_string();

        let matched = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .find(|(hash, _)| bcrypt::verify(&password, hash).unwrap_or(false))
                .map(|(_, identity)| identity)
        })
        .await
        .ok()
        .flatten()?;

        let token = self.issue(matched.clone()).await;
        info!(character = %matched.character, editor = matched.editor, "login succeeded");
        Some((token, matched))
    }

    pub async fn session(&self, token: &str) -> Option<Identity> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(token)?;
        if session.issued.elapsed() >= self.session_ttl {
            return None;
        }
        Some(session.identity.clone())
    }

    pub async fn logout(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }

    /// Registers a session directly, bypassing the password table.
    pub async fn issue(&self, identity: Identity) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.issued.elapsed() < self.session_ttl);
        if sessions.len() < before {
            debug!(expired = before - sessions.len(), "dropped expired sessions");
        }
        sessions.insert(
            token.clone(),
            Session {
                identity,
                issued: Instant::now(),
            },
        );
        token
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = WebError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer(&parts.headers).ok_or(WebError::Unauthenticated)?;
        state.auth.session(token).await.ok_or_else(|| {
            debug!("request with unknown session token");
            WebError::Unauthenticated
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, WebError> {
    let request: LoginRequest = serde_json::from_slice(&body)
        .map_err(|err| WebError::BadRequest(format!("invalid login request: {}", err)))?;
    if request.password.is_empty() {
        return Err(SheetError::validation("password is required").into());
    }

    let (token, identity) = state
        .auth
        .login(&request.password)
        .await
        .ok_or(WebError::Unauthenticated)?;

    Ok(success(json!({
        "data": {
            "token": token,
            "character": identity.character(),
            "editor": identity.is_editor(),
        }
    })))
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let removed = match bearer(&headers) {
        Some(token) => state.auth.logout(token).await,
        None => false,
    };
    success(json!({ "data": { "logged_out": removed } }))
}
