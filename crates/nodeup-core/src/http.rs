use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::debug;
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("transport error for {url}: {details}")]
    Transport { url: String, details: String },
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("response from {url} is not valid UTF-8")]
    InvalidText { url: String },
}

impl HttpError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidText { .. } => false,
        }
    }
}

pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, HttpError>>;

/// An open response body.
pub struct HttpBody {
    /// Length advertised by the server, if any.
    pub total: Option<u64>,
    pub chunks: ChunkStream,
}

/// Transport used by the downloader and the remote catalog.
#[async_trait]
pub trait HttpSource: Send + Sync {
    /// Send a GET request and return once headers have arrived.
    ///
    /// `timeout` bounds the whole exchange, including reading the body.
    async fn open(&self, url: &str, timeout: Duration) -> Result<HttpBody, HttpError>;
}

/// Read an entire response body as UTF-8 text.
///
/// # Errors
/// Returns an error when the request fails or the body is not UTF-8.
pub async fn read_to_string(
    source: &dyn HttpSource,
    url: &str,
    timeout: Duration,
) -> Result<String, HttpError> {
    let mut body = source.open(url, timeout).await?;
    let mut bytes = Vec::new();
    while let Some(chunk) = body.chunks.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    String::from_utf8(bytes).map_err(|_| HttpError::InvalidText {
        url: url.to_string(),
    })
}

#[derive(Clone)]
pub struct ReqwestSource {
    client: reqwest::Client,
}

impl ReqwestSource {
    /// Build a source on a client with the crate's user agent.
    ///
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(format!("nodeup/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| HttpError::Transport {
                url: String::new(),
                details: format!("failed to build HTTP client: {error}"),
            })?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn map_reqwest_error(url: &str, error: &reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::Timeout {
            url: url.to_string(),
        }
    } else {
        HttpError::Transport {
            url: url.to_string(),
            details: error.to_string(),
        }
    }
}

#[async_trait]
impl HttpSource for ReqwestSource {
    async fn open(&self, url: &str, timeout: Duration) -> Result<HttpBody, HttpError> {
        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|error| map_reqwest_error(url, &error))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let owned_url = url.to_string();
        let chunks = response
            .bytes_stream()
            .map(move |chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|error| map_reqwest_error(&owned_url, &error))
            })
            .boxed();

        Ok(HttpBody { total, chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::HttpError;

    #[test]
    fn transient_classification() {
        let url = "https://nodejs.org/dist/index.json".to_string();
        assert!(HttpError::Timeout { url: url.clone() }.is_transient());
        assert!(
            HttpError::Status {
                url: url.clone(),
                status: 503
            }
            .is_transient()
        );
        assert!(
            !HttpError::Status {
                url: url.clone(),
                status: 404
            }
            .is_transient()
        );
        assert!(!HttpError::InvalidText { url }.is_transient());
    }
}
