//! HTTP client for the remote status, identity and token endpoints.
//!
//! Every call carries the client identifier header; status and identity calls
//! also carry the bearer credential. Responses are classified into
//! [`ApiError`] variants so callers can tell an expired credential apart from
//! a transient network failure.

use crate::config::ApiConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

const CLIENT_ID_HEADER: &str = "Client-ID";

/// Errors returned by remote API calls.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Access token rejected (401)")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether the failure is worth retrying on a later cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            ApiError::Unauthorized | ApiError::NotFound(_) | ApiError::Decode(_) => false,
        }
    }
}

/// A watched account currently streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveStream {
    /// Canonical account ID
    pub user_id: String,
    /// Login name used to address the channel
    pub user_login: String,
    /// Display name
    pub user_name: String,
    /// Remote stream session ID
    pub stream_id: String,
    /// Stream title
    pub title: String,
    /// When the remote session started
    pub started_at: DateTime<Utc>,
}

/// Bearer credential returned by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_in: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StreamData {
    id: String,
    user_id: String,
    #[serde(default)]
    user_login: String,
    user_name: String,
    #[serde(default)]
    title: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl From<StreamData> for LiveStream {
    fn from(s: StreamData) -> Self {
        let user_login = if s.user_login.is_empty() {
            s.user_name.to_lowercase()
        } else {
            s.user_login
        };

        Self {
            user_id: s.user_id,
            user_login,
            user_name: s.user_name,
            stream_id: s.id,
            title: s.title,
            started_at: s.started_at,
        }
    }
}

/// Status and identity lookups.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamsApi: Send + Sync {
    /// Query live status for a batch of canonical IDs in one call.
    async fn live_streams(&self, user_ids: &[String], token: &str)
        -> Result<Vec<LiveStream>, ApiError>;

    /// Look up the canonical ID for a login name; `None` if no such account.
    async fn user_id_by_login(&self, login: &str, token: &str)
        -> Result<Option<String>, ApiError>;
}

/// Client-credentials token acquisition.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken, ApiError>;
}

/// reqwest-backed client for the remote API.
#[derive(Debug, Clone)]
pub struct HelixClient {
    http: Client,
    client_id: String,
    client_secret: String,
    api_base_url: String,
    token_url: String,
    token_timeout: Duration,
}

impl HelixClient {
    /// Create a new client from API configuration.
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("live-recorder/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            token_timeout: config.token_timeout(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base_url, path)
    }
}

/// Map non-2xx responses onto [`ApiError`].
async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound(body));
    }

    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl StreamsApi for HelixClient {
    #[instrument(skip(self, token), fields(batch = user_ids.len()))]
    async fn live_streams(
        &self,
        user_ids: &[String],
        token: &str,
    ) -> Result<Vec<LiveStream>, ApiError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let first = user_ids.len().to_string();
        let mut query: Vec<(&str, &str)> = user_ids.iter().map(|id| ("user_id", id.as_str())).collect();
        query.push(("first", first.as_str()));

        let response = self
            .http
            .get(self.endpoint("streams"))
            .header(CLIENT_ID_HEADER, &self.client_id)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await?;

        let bytes = check_status(response).await?.bytes().await?;
        let body: DataResponse<StreamData> = decode(&bytes)?;

        debug!(live = body.data.len(), "Status query completed");

        Ok(body.data.into_iter().map(LiveStream::from).collect())
    }

    #[instrument(skip(self, token))]
    async fn user_id_by_login(&self, login: &str, token: &str) -> Result<Option<String>, ApiError> {
        let response = self
            .http
            .get(self.endpoint("users"))
            .header(CLIENT_ID_HEADER, &self.client_id)
            .bearer_auth(token)
            .query(&[("login", login)])
            .send()
            .await?;

        let response = match check_status(response).await {
            Ok(response) => response,
            Err(ApiError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let bytes = response.bytes().await?;
        let body: DataResponse<UserData> = decode(&bytes)?;

        Ok(body.data.into_iter().next().map(|u| u.id))
    }
}

#[async_trait]
impl TokenSource for HelixClient {
    #[instrument(skip(self))]
    async fn fetch_token(&self) -> Result<AccessToken, ApiError> {
        let response = self
            .http
            .post(&self.token_url)
            .header(CLIENT_ID_HEADER, &self.client_id)
            .timeout(self.token_timeout)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let bytes = check_status(response).await?.bytes().await?;
        let body: TokenResponse = decode(&bytes)?;

        if body.access_token.is_empty() {
            return Err(ApiError::Decode("empty access_token".to_string()));
        }

        Ok(AccessToken {
            value: body.access_token,
            expires_in: body.expires_in.map(Duration::from_secs),
        })
    }
}
