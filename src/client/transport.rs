use crate::core::FieldUpdate;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Network trouble or a 5xx; worth sending again.
    #[error("transient failure: {0}")]
    Retryable(String),

    /// The server answered and said no; sending again will not help.
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BatchAck {
    pub saved: usize,
    pub errors: usize,
}

/// How the save queue reaches the server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn save_field(&self, character: &str, update: &FieldUpdate) -> Result<(), TransportError>;

    async fn save_batch(
        &self,
        character: &str,
        updates: &[FieldUpdate],
    ) -> Result<BatchAck, TransportError>;

    /// Returns the name of the backup file the server wrote.
    async fn create_session_backup(&self) -> Result<String, TransportError>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    saved: Option<usize>,
    #[serde(default)]
    errors: Option<usize>,
    #[serde(default)]
    backup_name: Option<String>,
}

/// [`Transport`] over the JSON action endpoints.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| TransportError::Retryable(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    async fn post(&self, path: &str, body: Value) -> Result<Envelope, TransportError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Retryable(err.to_string()))?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::Retryable(format!("server answered {}", status)));
        }

        let envelope: Envelope = response.json().await.map_err(|err| {
            if status.is_success() {
                TransportError::Retryable(format!("unreadable response: {}", err))
            } else {
                TransportError::Rejected {
                    status: status.as_u16(),
                    message: err.to_string(),
                }
            }
        })?;
        if !envelope.success || !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message: envelope
                    .error
                    .clone()
                    .unwrap_or_else(|| "request failed".to_string()),
            });
        }
        Ok(envelope)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn save_field(&self, character: &str, update: &FieldUpdate) -> Result<(), TransportError> {
        let mut body = json!({
            "action": "save",
            "character": character,
            "section": update.section,
            "field": update.field,
            "value": update.value,
        });
        if let Some(index) = update.index {
            body["index"] = json!(index);
        }
        self.post("/api/characters", body).await.map(|_| ())
    }

    async fn save_batch(
        &self,
        character: &str,
        updates: &[FieldUpdate],
    ) -> Result<BatchAck, TransportError> {
        let envelope = self
            .post(
                "/api/characters",
                json!({
                    "action": "batch_save",
                    "character": character,
                    "updates": updates,
                }),
            )
            .await?;
        Ok(BatchAck {
            saved: envelope.saved.unwrap_or_default(),
            errors: envelope.errors.unwrap_or_default(),
        })
    }

    async fn create_session_backup(&self) -> Result<String, TransportError> {
        let envelope = self
            .post("/api/backups", json!({ "action": "create_session_backup" }))
            .await?;
        Ok(envelope.backup_name.unwrap_or_default())
    }
}
