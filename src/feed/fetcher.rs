use futures::StreamExt;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;

/// Errors that can occur while retrieving a feed document.
///
/// All of these are transport-level and worth retrying on a later cycle.
/// A response with a non-success status is not an error; see
/// [`FetchOutcome::Unavailable`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, body stream, redirect policy)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// No complete response within the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body exceeded the size limit
    #[error("Response larger than {limit} bytes")]
    ResponseTooLarge { limit: usize },
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// What a completed GET produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 2xx response with its full body
    Body(Vec<u8>),
    /// Any other status; there is nothing to ingest this cycle
    Unavailable(StatusCode),
}

/// HTTP retrieval of feed documents. Cheap to clone; clones share the
/// connection pool.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
}

/// Create a custom redirect policy with loop detection and limited hops.
///
/// - Limits redirects to 3 hops maximum
/// - Detects redirect loops (same URL appearing twice in chain)
fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

impl Fetcher {
    /// Build the shared HTTP client from configuration.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let timeout = Duration::from_secs(config.fetch_timeout_secs);
        let client = reqwest::Client::builder()
            .redirect(create_redirect_policy())
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(timeout)
            .build()?;

        Ok(Self::with_client(client, timeout, config.max_feed_bytes))
    }

    /// Wrap an existing client. `timeout` bounds the whole request including
    /// the body; `max_bytes` caps the body size.
    pub fn with_client(client: reqwest::Client, timeout: Duration, max_bytes: usize) -> Self {
        Self {
            client,
            timeout,
            max_bytes,
        }
    }

    /// Retrieve `url` with a single GET.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Network`] - connection, TLS or redirect failure
    /// - [`FetchError::Timeout`] - headers and body not complete in time
    /// - [`FetchError::ResponseTooLarge`] - body above the size limit
    /// - [`FetchError::IncompleteResponse`] - body shorter than Content-Length
    pub async fn fetch(&self, url: &str) -> Result<FetchOutcome, FetchError> {
        tokio::time::timeout(self.timeout, self.fetch_inner(url))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
    }

    async fn fetch_inner(&self, url: &str) -> Result<FetchOutcome, FetchError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url = %url, status = %status, "Feed source answered without content");
            return Ok(FetchOutcome::Unavailable(status));
        }

        let bytes = read_limited_bytes(response, self.max_bytes).await?;
        tracing::debug!(url = %url, bytes = bytes.len(), "Fetched feed");
        Ok(FetchOutcome::Body(bytes))
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge { limit });
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge { limit });
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
