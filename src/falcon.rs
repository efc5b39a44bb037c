use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

const ACTORS_PATH: &str = "/intel/combined/actors/v1";
const INDICATORS_PATH: &str = "/intel/combined/indicators/v1";

// Tokens are renewed this long before the advertised expiry so in-flight
// queries never race the cutoff.
const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum FalconError {
    #[error("Falcon authentication failed: {0}")]
    Auth(String),
    #[error("Falcon API request failed: {0}")]
    Transport(String),
    #[error("Falcon API returned an unreadable body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for FalconError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for FalconError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Raw upstream response. Non-2xx statuses are data, not errors; the
/// normalizer decides what they mean.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status_code: u16,
    pub body: Value,
}

/// The two Intel query operations the tools consume. Handlers only ever see
/// this trait, so tests substitute a stub client.
#[async_trait]
pub trait IntelQueries: Send + Sync {
    async fn query_actor_entities(
        &self,
        filter: Option<&str>,
        limit: Option<i64>,
    ) -> Result<ApiResponse, FalconError>;

    async fn query_indicator_entities(
        &self,
        filter: Option<&str>,
        limit: Option<i64>,
        sort: Option<&str>,
    ) -> Result<ApiResponse, FalconError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct BearerToken {
    access_token: String,
    expires_at: Instant,
}

impl BearerToken {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// OAuth2-authenticated client for the Falcon Intel service. Token refresh
/// is transparent; callers only issue queries.
pub struct FalconClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<BearerToken>>,
}

impl FalconClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: RwLock::new(None),
        }
    }

    /// Acquires the initial token. Called once at startup; a rejection here
    /// means the process must not serve tools.
    pub async fn login(&self) -> Result<(), FalconError> {
        let token = self.request_token().await?;
        *self.token.write().await = Some(token);
        info!("Falcon OAuth2 authentication initialized");
        Ok(())
    }

    async fn request_token(&self) -> Result<BearerToken, FalconError> {
        let url = format!("{}/oauth2/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(FalconError::Auth(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                detail.trim()
            )));
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = token
            .expires_in
            .saturating_sub(TOKEN_REFRESH_MARGIN_SECS)
            .max(1);
        Ok(BearerToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        })
    }

    async fn bearer(&self) -> Result<String, FalconError> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if !token.is_expired() {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref() {
            if !token.is_expired() {
                return Ok(token.access_token.clone());
            }
        }

        let fresh = self.request_token().await?;
        let access = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(access)
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<ApiResponse, FalconError> {
        let token = self.bearer().await?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;

        let status_code = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&text)?
        };

        Ok(ApiResponse { status_code, body })
    }
}

#[async_trait]
impl IntelQueries for FalconClient {
    async fn query_actor_entities(
        &self,
        filter: Option<&str>,
        limit: Option<i64>,
    ) -> Result<ApiResponse, FalconError> {
        let mut query = Vec::new();
        if let Some(filter) = filter {
            query.push(("filter", filter.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        self.get_json(ACTORS_PATH, &query).await
    }

    async fn query_indicator_entities(
        &self,
        filter: Option<&str>,
        limit: Option<i64>,
        sort: Option<&str>,
    ) -> Result<ApiResponse, FalconError> {
        let mut query = Vec::new();
        if let Some(filter) = filter {
            query.push(("filter", filter.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(sort) = sort {
            query.push(("sort", sort.to_string()));
        }
        self.get_json(INDICATORS_PATH, &query).await
    }
}
