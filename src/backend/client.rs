//! REST client for the file-io backend

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

use super::auth::{BearerToken, HttpTokenSource, StaticTokenSource, TokenCache, TokenSource};
use super::error::{BackendError, Result};
use super::models::{CompletionRequest, Filters, JobItems, TouchRequest, TransferItem};
use super::{Ack, Backend};
use crate::config::BackendConfig;

const DOWNLOADER_PATH: &str = "api/v1/fileio/downloader";

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub accept_version: String,
    pub connect_timeout: std::time::Duration,
    pub request_timeout: std::time::Duration,
    pub user_agent: String,
}

impl From<&BackendConfig> for HttpBackendConfig {
    fn from(config: &BackendConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            accept_version: config.accept_version.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            user_agent: concat!("renderferry/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

pub struct HttpBackend {
    client: Client,
    config: HttpBackendConfig,
    tokens: Arc<TokenCache>,
}

impl HttpBackend {
    /// Redirects are not followed: the backend answers 301/302 to requests
    /// carrying an expired token.
    pub fn new(config: HttpBackendConfig, tokens: Arc<TokenCache>) -> Result<Self> {
        let client = Self::client_builder(&config).build()?;
        Ok(Self {
            client,
            config,
            tokens,
        })
    }

    /// Client with the credential `config` carries: a static token when
    /// set, otherwise the API key exchange
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let http_config = HttpBackendConfig::from(config);

        let source: Arc<dyn TokenSource> = match (&config.token, &config.api_key) {
            (Some(token), _) => Arc::new(StaticTokenSource::new(token.clone())),
            (None, Some(api_key)) => {
                let client = Self::client_builder(&http_config).build()?;
                Arc::new(HttpTokenSource::new(
                    client,
                    &http_config.base_url,
                    api_key.clone(),
                ))
            }
            (None, None) => {
                return Err(BackendError::TokenExchange(
                    "no API key or static token configured".to_string(),
                ));
            }
        };

        Self::new(http_config, Arc::new(TokenCache::new(source)))
    }

    /// Shared builder so the token exchange uses identical timeouts
    pub fn client_builder(config: &HttpBackendConfig) -> reqwest::ClientBuilder {
        Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.config.base_url, DOWNLOADER_PATH, path)
    }

    fn request(&self, method: Method, url: &str, token: &BearerToken) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&*token.value)
            .header("accept-version", &self.config.accept_version)
    }

    /// Send with the cached token; on 401/301/302 refresh once and resend once
    async fn execute<B, Q>(
        &self,
        method: Method,
        path: &str,
        query: Option<&Q>,
        body: Option<&B>,
    ) -> Result<Response>
    where
        B: Serialize + ?Sized + Sync,
        Q: Serialize + ?Sized + Sync,
    {
        let url = self.endpoint(path);
        let build = |token: &BearerToken| {
            let mut request = self.request(method.clone(), &url, token);
            if let Some(query) = query {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            request
        };

        let token = self.tokens.get().await?;
        trace!(%method, url = %url, "Backend request");
        let response = build(&token).send().await?;
        if !needs_refresh(response.status()) {
            return Ok(response);
        }

        debug!(status = %response.status(), "Token rejected, refreshing");
        let token = self.tokens.refresh(token.generation).await?;
        let response = build(&token).send().await?;
        if needs_refresh(response.status()) {
            return Err(BackendError::Unauthorized(response.status()));
        }
        Ok(response)
    }

    async fn report(&self, action: &str, id: &str, bytes: u64, filters: &Filters) -> Result<Ack> {
        let path = format!("{}/{}", action, id);
        let response = if action == "touch" {
            let body = TouchRequest {
                bytes_transferred: bytes,
                scope: filters,
            };
            self.execute(Method::PUT, &path, None::<&()>, Some(&body))
                .await?
        } else {
            let body = CompletionRequest {
                bytes_downloaded: bytes,
                scope: filters,
            };
            self.execute(Method::PUT, &path, None::<&()>, Some(&body))
                .await?
        };

        match response.status() {
            StatusCode::GONE => Ok(Ack::Inactive),
            status if status.is_success() => Ok(Ack::Accepted),
            status => Err(status_error(status, response).await),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn next(&self, filters: &Filters) -> Result<Option<TransferItem>> {
        let response = self
            .execute(Method::GET, "next", Some(filters), None::<&()>)
            .await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, response).await);
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Object(ref fields) if fields.is_empty() => Ok(None),
            value => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    async fn touch(&self, id: &str, bytes_transferred: u64, filters: &Filters) -> Result<Ack> {
        self.report("touch", id, bytes_transferred, filters).await
    }

    async fn finish(&self, id: &str, bytes_downloaded: u64, filters: &Filters) -> Result<Ack> {
        self.report("finish", id, bytes_downloaded, filters).await
    }

    async fn fail(&self, id: &str, bytes_downloaded: u64, filters: &Filters) -> Result<Ack> {
        self.report("fail", id, bytes_downloaded, filters).await
    }

    async fn job_items(&self, job_id: &str, task_id: Option<&str>) -> Result<Vec<TransferItem>> {
        let path = format!("jobs/{}", job_id);
        let query = [("tid", task_id.unwrap_or_default())];
        let response = self
            .execute(Method::GET, &path, Some(&query), None::<&()>)
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response).await);
        }
        let listing: JobItems = serde_json::from_slice(&response.bytes().await?)?;
        Ok(listing.items)
    }
}

fn needs_refresh(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
    )
}

async fn status_error(status: StatusCode, response: Response) -> BackendError {
    let body = response.text().await.unwrap_or_default();
    BackendError::Status { status, body }
}
