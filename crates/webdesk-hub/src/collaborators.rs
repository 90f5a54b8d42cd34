//! Outside services the hub leans on: token checks and host metrics.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use webdesk_core::{SystemMetrics, User};

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("bad endpoint: {0}")]
    Endpoint(String),
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns the username the token belongs to, or `None` if it is not valid.
    async fn validate(&self, token: &str) -> Result<Option<String>, CollaboratorError>;
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self) -> Result<SystemMetrics, CollaboratorError>;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| CollaboratorError::Request(err.to_string()))
}

fn endpoint(base: &Url, path: &str) -> Result<Url, CollaboratorError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
        .map_err(|err| CollaboratorError::Endpoint(err.to_string()))
}

/// Checks tokens against the record API's `auth/me`.
pub struct ApiTokenValidator {
    client: reqwest::Client,
    me: Url,
}

impl ApiTokenValidator {
    pub fn new(api_url: &Url, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client(timeout)?,
            me: endpoint(api_url, "auth/me")?,
        })
    }
}

#[async_trait]
impl TokenValidator for ApiTokenValidator {
    async fn validate(&self, token: &str) -> Result<Option<String>, CollaboratorError> {
        let response = self
            .client
            .get(self.me.clone())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| CollaboratorError::Request(err.to_string()))?;
        match response.status() {
            status if status.is_success() => {
                let user: User = response
                    .json()
                    .await
                    .map_err(|err| CollaboratorError::Request(err.to_string()))?;
                Ok(Some(user.username))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            status => Err(CollaboratorError::Status(status.as_u16())),
        }
    }
}

/// Reads host metrics from the record API with a service token.
pub struct ApiMetricsSource {
    client: reqwest::Client,
    metrics: Url,
    token: String,
}

impl ApiMetricsSource {
    pub fn new(api_url: &Url, token: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client(timeout)?,
            metrics: endpoint(api_url, "hproc/metrics")?,
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl MetricsSource for ApiMetricsSource {
    async fn sample(&self) -> Result<SystemMetrics, CollaboratorError> {
        let response = self
            .client
            .get(self.metrics.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| CollaboratorError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CollaboratorError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|err| CollaboratorError::Request(err.to_string()))
    }
}

/// Fixed token table.
#[derive(Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(token, user)| (token.to_string(), user.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl TokenValidator for StaticTokens {
    async fn validate(&self, token: &str) -> Result<Option<String>, CollaboratorError> {
        Ok(self.tokens.get(token).cloned())
    }
}

/// Always reports the same sample and counts how often it was asked.
pub struct FixedMetrics {
    metrics: SystemMetrics,
    samples: AtomicU64,
}

impl FixedMetrics {
    pub fn new(metrics: SystemMetrics) -> Self {
        Self {
            metrics,
            samples: AtomicU64::new(0),
        }
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsSource for FixedMetrics {
    async fn sample(&self) -> Result<SystemMetrics, CollaboratorError> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        Ok(self.metrics.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_keep_the_base_path() {
        let base = Url::parse("http://127.0.0.1:8000/api").expect("url");
        assert_eq!(
            endpoint(&base, "auth/me").expect("join").as_str(),
            "http://127.0.0.1:8000/api/auth/me"
        );
    }

    #[tokio::test]
    async fn static_tokens_map_to_users() {
        let tokens = StaticTokens::new([("t-1", "alice")]);
        assert_eq!(tokens.validate("t-1").await.expect("ok"), Some("alice".to_string()));
        assert_eq!(tokens.validate("nope").await.expect("ok"), None);
    }
}
