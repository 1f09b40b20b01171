//! HTTP client for streaming source files

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::error::{Result, TransferError};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Opens the body of a source URL as a stream of byte chunks
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn open(&self, url: &str) -> Result<ByteStream>;
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub connect_timeout: Duration,
    /// Idle limit between body chunks; the whole transfer has no deadline
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            user_agent: concat!("renderferry/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Plain GET against pre-signed storage URLs
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn open(&self, url: &str) -> Result<ByteStream> {
        debug!(url, "Opening source");

        let response = self.client.get(url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransferError::SourceMissing {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(TransferError::SourceStatus { status });
        }

        Ok(response
            .bytes_stream()
            .map_err(TransferError::from)
            .boxed())
    }
}
