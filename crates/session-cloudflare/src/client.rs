//! Cloudflare REST API client
//!
//! Credentials come from the environment (`CLOUDFLARE_ACCOUNT_ID` and
//! `CLOUDFLARE_API_TOKEN`). Unless both are non-empty the integration is
//! disabled and every operation short-circuits: a half-configured client must
//! never issue partial API calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::CloudflareError;
use crate::CloudflareApi;

/// Environment variable holding the Cloudflare account id.
pub const ACCOUNT_ID_ENV: &str = "CLOUDFLARE_ACCOUNT_ID";

/// Environment variable holding the Cloudflare API token.
pub const API_TOKEN_ENV: &str = "CLOUDFLARE_API_TOKEN";

/// Default Cloudflare API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// Hard bound on every request when the caller sets no tighter deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// REST-backed implementation of [`CloudflareApi`].
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    api_token: String,
}

impl ApiClient {
    /// Create a client with explicit configuration.
    ///
    /// `base_url` is normally [`DEFAULT_BASE_URL`]; tests point it at a local
    /// server.
    pub fn new(
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Result<Self, CloudflareError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let client = Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            account_id: account_id.into(),
            api_token: api_token.into(),
        };

        if !client.enabled() && (!client.account_id.is_empty() || !client.api_token.is_empty()) {
            warn!(
                "partial Cloudflare credentials ({} / {}), integration disabled",
                ACCOUNT_ID_ENV, API_TOKEN_ENV
            );
        }

        Ok(client)
    }

    /// Create a client from `CLOUDFLARE_ACCOUNT_ID` / `CLOUDFLARE_API_TOKEN`.
    pub fn from_env() -> Result<Self, CloudflareError> {
        Self::new(
            std::env::var("CLOUDFLARE_API_BASE").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            std::env::var(ACCOUNT_ID_ENV).unwrap_or_default(),
            std::env::var(API_TOKEN_ENV).unwrap_or_default(),
        )
    }

    /// Whether the integration is active. Requires both credentials: a single
    /// missing one is treated as fully disabled rather than risking partial
    /// calls.
    pub fn enabled(&self) -> bool {
        !self.account_id.is_empty() && !self.api_token.is_empty()
    }

    fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}/accounts/{}/sessions/{}",
            self.base_url, self.account_id, session_id
        )
    }

    fn route_url(&self, session_id: &str) -> String {
        format!("{}/route", self.session_url(session_id))
    }
}

#[async_trait]
impl CloudflareApi for ApiClient {
    async fn verify_session(&self, session_id: &str) -> Result<bool, CloudflareError> {
        if session_id.is_empty() {
            return Err(CloudflareError::invalid_argument("sessionID is empty"));
        }
        if !self.enabled() {
            debug!(session_id, "cloudflare integration disabled, assuming session exists");
            return Ok(true);
        }

        let response = self
            .http
            .get(self.session_url(session_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                CloudflareError::unavailable(format!("auth rejected: {}", response.status())),
            ),
            s if s.is_success() => Ok(true),
            s => Err(CloudflareError::unavailable(format!(
                "session lookup failed: {}",
                s
            ))),
        }
    }

    async fn ensure_route(&self, session_id: &str, endpoint: &str) -> Result<(), CloudflareError> {
        if session_id.is_empty() {
            return Err(CloudflareError::invalid_argument("sessionID is empty"));
        }
        if endpoint.is_empty() {
            return Err(CloudflareError::invalid_argument("endpoint is empty"));
        }
        if !self.enabled() {
            debug!(session_id, endpoint, "cloudflare integration disabled, skipping route upsert");
            return Ok(());
        }

        let body = serde_json::json!({ "endpoint": endpoint });
        let response = self
            .http
            .put(self.route_url(session_id))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(session_id, endpoint, "cloudflare route upserted");
            Ok(())
        } else {
            Err(CloudflareError::unavailable(format!(
                "route upsert failed: {}",
                status
            )))
        }
    }

    async fn retract_route(&self, session_id: &str) -> Result<(), CloudflareError> {
        if session_id.is_empty() {
            return Ok(());
        }
        if !self.enabled() {
            debug!(session_id, "cloudflare integration disabled, skipping route retraction");
            return Ok(());
        }

        let response = self
            .http
            .delete(self.route_url(session_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(session_id, "cloudflare route retracted");
            Ok(())
        } else {
            Err(CloudflareError::unavailable(format!(
                "route retraction failed: {}",
                status
            )))
        }
    }
}
