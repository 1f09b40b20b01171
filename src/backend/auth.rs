//! Bearer token cache with single-flight refresh

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::{BackendError, Result};
use super::models::TokenResponse;

/// Something that can mint a fresh bearer token
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

/// Exchanges the long-lived API key for a bearer token
pub struct HttpTokenSource {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpTokenSource {
    pub fn new(client: Client, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: format!("{}/api/oauth_jwt", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("scope", "user")])
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.api_key))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::TokenExchange(format!("HTTP {}", status)));
        }

        let body: TokenResponse = serde_json::from_slice(&response.bytes().await?)?;
        Ok(body.access_token)
    }
}

/// A pre-issued token; refreshing hands back the same value
pub struct StaticTokenSource(String);

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub value: Arc<str>,
    /// Bumped on every refresh; callers hand it back to [`TokenCache::refresh`]
    pub generation: u64,
}

/// Process-wide cached credential
///
/// The only shared mutable state between workers. Concurrent refreshes for
/// the same stale generation collapse into one call to the source.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    current: Mutex<Option<BearerToken>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            current: Mutex::new(None),
        }
    }

    /// Cached token, fetching the first one lazily
    pub async fn get(&self) -> Result<BearerToken> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            return Ok(token.clone());
        }
        let token = self.mint(0).await?;
        *current = Some(token.clone());
        Ok(token)
    }

    /// Replace the token the caller saw rejected
    ///
    /// If another caller already refreshed past `stale_generation`, its token
    /// is returned without hitting the source again.
    pub async fn refresh(&self, stale_generation: u64) -> Result<BearerToken> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            if token.generation > stale_generation {
                debug!(generation = token.generation, "Token already refreshed");
                return Ok(token.clone());
            }
        }

        let last = current.as_ref().map_or(0, |token| token.generation);
        let token = self.mint(last).await?;
        info!(generation = token.generation, "Refreshed bearer token");
        *current = Some(token.clone());
        Ok(token)
    }

    async fn mint(&self, last_generation: u64) -> Result<BearerToken> {
        let value = self.source.fetch().await?;
        Ok(BearerToken {
            value: Arc::from(value),
            generation: last_generation + 1,
        })
    }
}
