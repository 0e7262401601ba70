//! HTTP implementation of [`RemoteCollaborator`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::remote::{PushOutcome, RecentKind, RemoteCollaborator};
use crate::config::RemoteConfig;
use crate::error::{Error, RemoteError, Result};
use crate::models::{PendingMutation, Snapshot};
use crate::util::{body_excerpt, has_http_scheme, trimmed_non_empty};

#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::InvalidInput(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            base_url,
            auth_token: trimmed_non_empty(auth_token),
            client,
        })
    }

    /// Build a client from config; `None` when no base URL is configured.
    pub fn from_config(config: &RemoteConfig) -> Result<Option<Self>> {
        let Some(base_url) = config.base_url.clone() else {
            return Ok(None);
        };
        Self::new(
            base_url,
            config.auth_token.clone(),
            Duration::from_secs(config.timeout_secs),
        )
        .map(Some)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> std::result::Result<T, RemoteError> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RemoteError::Http {
                status: status.as_u16(),
                message: parse_api_error(status, &body),
            });
        }
        serde_json::from_str(&body)
            .map_err(|error| RemoteError::InvalidPayload(format!("{error}: {}", body_excerpt(&body))))
    }
}

#[async_trait]
impl RemoteCollaborator for HttpRemote {
    async fn push(&self, mutation: &PendingMutation) -> PushOutcome {
        let response = match self
            .request(reqwest::Method::POST, "/v1/mutations")
            .json(mutation)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return PushOutcome::Failure(error.into()),
        };

        let status = response.status();
        match response.text().await {
            Ok(body) => classify_push(status, &body),
            Err(error) => PushOutcome::Failure(error.into()),
        }
    }

    async fn fetch_snapshot(&self, entity_id: &str) -> std::result::Result<Snapshot, RemoteError> {
        self.get_json(&format!("/v1/entities/{}", urlencoding::encode(entity_id)))
            .await
    }

    async fn list_recent(
        &self,
        kind: RecentKind,
        scope_id: &str,
        limit: usize,
    ) -> std::result::Result<Vec<serde_json::Value>, RemoteError> {
        self.get_json(&format!(
            "/v1/{}?scope={}&limit={limit}",
            kind.path(),
            urlencoding::encode(scope_id)
        ))
        .await
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
    registration_id: Option<String>,
}

/// Map a push response to its outcome.
pub fn classify_push(status: StatusCode, body: &str) -> PushOutcome {
    if status.is_success() {
        return PushOutcome::Ack;
    }

    if status == StatusCode::CONFLICT {
        return PushOutcome::Conflict(serde_json::from_str::<Snapshot>(body).ok());
    }

    if status == StatusCode::UNPROCESSABLE_ENTITY {
        if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
            if payload.error.as_deref() == Some("duplicate_id") {
                let taken = payload
                    .registration_id
                    .or(payload.message)
                    .unwrap_or_default();
                return PushOutcome::Failure(RemoteError::DuplicateId(taken));
            }
        }
    }

    PushOutcome::Failure(RemoteError::Http {
        status: status.as_u16(),
        message: parse_api_error(status, body),
    })
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body_excerpt(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = trimmed_non_empty(Some(raw))
        .ok_or_else(|| Error::InvalidInput("base URL must not be empty".to_string()))?;
    if has_http_scheme(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "base URL must include http:// or https://".to_string(),
        ))
    }
}
