//! HTTP fetch capability.

pub mod links;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub use links::{resolve_archive_url, zip_links};

#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// Whole body of a 2xx response. Anything else is `Error::Network`.
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

const MAX_RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ReqwestFetcher {
    client: Client,
    max_retries: usize,
    retry_delay: Duration,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .gzip(true)
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn retries(mut self, max_retries: usize, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let mut attempt = 0;

        // Connection errors and 5xx are retried; 4xx are not.
        loop {
            attempt += 1;
            let reason = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(bytes) => {
                        debug!(url, size = bytes.len(), attempt, "fetched");
                        return Ok(bytes.to_vec());
                    }
                    Err(e) => e.to_string(),
                },
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(Error::network(url, format!("HTTP {}", resp.status())));
                }
                Ok(resp) => format!("HTTP {}", resp.status()),
                Err(e) => e.to_string(),
            };

            if attempt >= self.max_retries {
                return Err(Error::network(url, reason));
            }
            warn!(url, attempt, %reason, "fetch failed, retrying");
            sleep(self.retry_delay).await;
        }
    }
}
