use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, warn};
use thiserror::Error;

use crate::record::Manifest;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_DELAYS_SECS: [u64; 3] = [0, 2, 5];

/// Payload bytes as they arrive from the network.
pub type PayloadStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} failed with HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to parse manifest from {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("payload stream interrupted: {0}")]
    Stream(String),
}

/// The HTTP collaborator the fetcher talks through.
///
/// Implementations own retries; the fetcher treats any error as final for
/// the current attempt.
#[async_trait]
pub trait BundleTransport: Send + Sync {
    /// Latest manifest, or `None` when the endpoint reports nothing to serve.
    async fn fetch_manifest(&self) -> Result<Option<Manifest>, TransportError>;

    async fn open_payload(&self, url: &str) -> Result<PayloadStream, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    manifest_url: String,
    retry_delays: Vec<Duration>,
}

impl ReqwestTransport {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(manifest_url: impl Into<String>) -> Result<Self, TransportError> {
        Self::with_timeouts(
            manifest_url,
            DEFAULT_TIMEOUT,
            DEFAULT_CONNECT_TIMEOUT,
            DEFAULT_RETRY_DELAYS_SECS
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
        )
    }

    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeouts(
        manifest_url: impl Into<String>,
        timeout: Duration,
        connect_timeout: Duration,
        retry_delays: Vec<Duration>,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .user_agent(format!("bundlenudge/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(TransportError::Client)?;

        Ok(Self {
            client,
            manifest_url: manifest_url.into(),
            retry_delays,
        })
    }

    async fn fetch_manifest_once(&self) -> Result<Option<Manifest>, TransportError> {
        let url = &self.manifest_url;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT || status == reqwest::StatusCode::NOT_FOUND {
            debug!("Manifest endpoint returned {status}, nothing to serve");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.clone(),
                status,
            });
        }

        response
            .json::<Manifest>()
            .await
            .map(Some)
            .map_err(|source| TransportError::Parse {
                url: url.clone(),
                source,
            })
    }
}

#[async_trait]
impl BundleTransport for ReqwestTransport {
    async fn fetch_manifest(&self) -> Result<Option<Manifest>, TransportError> {
        let mut last_error = None;

        for delay in &self.retry_delays {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }

            match self.fetch_manifest_once().await {
                Ok(manifest) => return Ok(manifest),
                Err(error) => {
                    warn!("Manifest fetch attempt failed: {error}");
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) => Err(error),
            None => self.fetch_manifest_once().await,
        }
    }

    async fn open_payload(&self, url: &str) -> Result<PayloadStream, TransportError> {
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|source| TransportError::Request {
                    url: url.to_string(),
                    source,
                })?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|error| TransportError::Stream(error.to_string()))
            })
            .boxed())
    }
}
