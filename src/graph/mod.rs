//! Microsoft Graph API client
//!
//! Shared HTTP client with cached bearer token (client-credentials flow),
//! proactive refresh, and retry handling for rate limits and transient
//! server errors.

pub mod calendar;
pub mod call_records;
pub mod chat;
pub mod mail;
pub mod transcripts;
pub mod users;

use crate::config::GraphConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Refresh the token this long before it actually expires.
const TOKEN_REFRESH_MARGIN_MINUTES: i64 = 5;

/// Transient failures get this many in-client retries before surfacing.
const MAX_TRANSIENT_RETRIES: u32 = 2;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Rate limited (retry after {retry_after_seconds}s)")]
    RateLimited { retry_after_seconds: u64 },
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request ({status}): {message}")]
    InvalidRequest { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl GraphError {
    /// Whether the failure is worth retrying at the job level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GraphError::RateLimited { .. } | GraphError::Server { .. } | GraphError::Network(_)
        )
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Utc::now() < self.expires_at - ChronoDuration::minutes(TOKEN_REFRESH_MARGIN_MINUTES)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// Authenticated Graph API client. Cheap to clone; all clones share the
/// HTTP connection pool and the token cache.
#[derive(Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    config: GraphConfig,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl GraphClient {
    pub fn new(config: GraphConfig) -> Result<Self, GraphError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| GraphError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            token: Arc::new(Mutex::new(None)),
        })
    }

    /// Current bearer token, fetching a fresh one when missing or within
    /// the refresh margin. Acquisition is serialised by the cache lock so
    /// two simultaneous expirations refresh at most once.
    async fn bearer_token(&self) -> Result<String, GraphError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.access_token.clone());
            }
        }

        let url = format!("{}/oauth2/v2.0/token", self.config.authority());
        let response = self
            .http
            .post(&url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", "https://graph.microsoft.com/.default"),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| GraphError::Network(format!("Token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GraphError::Network(format!("Failed to read token response: {e}")))?;
        if !status.is_success() {
            return Err(GraphError::Auth(format!("Token endpoint returned {status}: {body}")));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| GraphError::Decode(format!("Bad token response: {e}")))?;

        let cached = CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Utc::now() + ChronoDuration::seconds(token.expires_in),
        };
        tracing::info!(expires_in = token.expires_in, "Access token acquired");
        *guard = Some(cached);
        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    fn resolve_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{GRAPH_BASE}{endpoint}")
        }
    }

    /// Request core: 401 forces one token refresh, 429 honours Retry-After,
    /// 5xx gets a short in-client backoff. Everything else surfaces typed.
    async fn request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        query: Option<&[(&str, &str)]>,
        body: Option<&serde_json::Value>,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, GraphError> {
        let url = self.resolve_url(endpoint);
        let mut refreshed_token = false;
        let mut transient_retries = 0_u32;

        loop {
            let token = self.bearer_token().await?;
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token);
            if let Some(q) = query {
                req = req.query(q);
            }
            if let Some(b) = body {
                req = req.json(b);
            }
            if let Some(a) = accept {
                req = req.header(reqwest::header::ACCEPT, a);
            }

            let response = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    GraphError::Network(format!("Request timeout: {e}"))
                } else {
                    GraphError::Network(format!("Request failed: {e}"))
                }
            })?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            match status.as_u16() {
                401 if !refreshed_token => {
                    tracing::warn!(%url, "401 from Graph, refreshing token");
                    self.invalidate_token().await;
                    refreshed_token = true;
                }
                401 => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(GraphError::Auth(text));
                }
                429 => {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(60);
                    if transient_retries < MAX_TRANSIENT_RETRIES {
                        transient_retries += 1;
                        tracing::warn!(retry_after, attempt = transient_retries, "Rate limited by Graph");
                        tokio::time::sleep(Duration::from_secs(retry_after.min(60))).await;
                    } else {
                        return Err(GraphError::RateLimited {
                            retry_after_seconds: retry_after,
                        });
                    }
                }
                500..=599 => {
                    if transient_retries < MAX_TRANSIENT_RETRIES {
                        let wait = 2_u64.pow(transient_retries).min(30);
                        transient_retries += 1;
                        tracing::warn!(status = status.as_u16(), wait, "Graph server error, retrying");
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                    } else {
                        let text = response.text().await.unwrap_or_default();
                        return Err(GraphError::Server {
                            status: status.as_u16(),
                            message: text,
                        });
                    }
                }
                403 => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(GraphError::Forbidden(text));
                }
                404 => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(GraphError::NotFound(text));
                }
                other => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(GraphError::InvalidRequest {
                        status: other,
                        message: text,
                    });
                }
            }
        }
    }

    /// GET returning JSON.
    pub async fn get(&self, endpoint: &str) -> Result<serde_json::Value, GraphError> {
        let response = self
            .request(reqwest::Method::GET, endpoint, None, None, None)
            .await?;
        response
            .json()
            .await
            .map_err(|e| GraphError::Decode(format!("Bad JSON from {endpoint}: {e}")))
    }

    /// GET with query parameters, returning JSON.
    pub async fn get_with_query(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value, GraphError> {
        let response = self
            .request(reqwest::Method::GET, endpoint, Some(query), None, None)
            .await?;
        response
            .json()
            .await
            .map_err(|e| GraphError::Decode(format!("Bad JSON from {endpoint}: {e}")))
    }

    /// GET returning the raw body (transcript content).
    pub async fn get_text(&self, endpoint: &str, accept: &str) -> Result<String, GraphError> {
        let response = self
            .request(reqwest::Method::GET, endpoint, None, None, Some(accept))
            .await?;
        response
            .text()
            .await
            .map_err(|e| GraphError::Decode(format!("Bad body from {endpoint}: {e}")))
    }

    /// POST with a JSON body. Returns the response JSON, or Null for 202/204.
    pub async fn post(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, GraphError> {
        let response = self
            .request(reqwest::Method::POST, endpoint, None, Some(body), None)
            .await?;
        if response.content_length() == Some(0) {
            return Ok(serde_json::Value::Null);
        }
        response.json().await.or(Ok(serde_json::Value::Null))
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, GraphError> {
        let response = self
            .request(reqwest::Method::PATCH, endpoint, None, Some(body), None)
            .await?;
        if response.content_length() == Some(0) {
            return Ok(serde_json::Value::Null);
        }
        response.json().await.or(Ok(serde_json::Value::Null))
    }

    pub async fn delete(&self, endpoint: &str) -> Result<(), GraphError> {
        self.request(reqwest::Method::DELETE, endpoint, None, None, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_classification() {
        assert!(GraphError::RateLimited {
            retry_after_seconds: 30
        }
        .is_retryable());
        assert!(GraphError::Server {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(GraphError::Network("timeout".to_string()).is_retryable());

        assert!(!GraphError::Forbidden(String::new()).is_retryable());
        assert!(!GraphError::NotFound(String::new()).is_retryable());
        assert!(!GraphError::InvalidRequest {
            status: 400,
            message: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn test_token_freshness_margin() {
        let fresh = CachedToken {
            access_token: "t".to_string(),
            expires_at: Utc::now() + ChronoDuration::minutes(30),
        };
        assert!(fresh.is_fresh());

        // inside the 5-minute refresh margin counts as stale
        let stale = CachedToken {
            access_token: "t".to_string(),
            expires_at: Utc::now() + ChronoDuration::minutes(4),
        };
        assert!(!stale.is_fresh());
    }

    #[test]
    fn test_resolve_url_passthrough_for_next_links() {
        let config = GraphConfig {
            tenant_id: "tenant".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        };
        let client = GraphClient::new(config).unwrap();

        assert_eq!(
            client.resolve_url("/subscriptions"),
            "https://graph.microsoft.com/v1.0/subscriptions"
        );
        let next = "https://graph.microsoft.com/v1.0/communications/callRecords?$skiptoken=abc";
        assert_eq!(client.resolve_url(next), next);
    }
}
