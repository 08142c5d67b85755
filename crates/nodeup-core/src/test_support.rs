use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};

use crate::http::{HttpBody, HttpError, HttpSource};

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// In-memory server keyed by URL.
#[derive(Default)]
pub(crate) struct MemorySource {
    bodies: HashMap<String, (Vec<u8>, usize)>,
    failures: Mutex<HashMap<String, usize>>,
    requests: AtomicUsize,
}

impl MemorySource {
    pub(crate) fn with(self, url: &str, body: Vec<u8>) -> Self {
        let len = body.len().max(1);
        self.with_chunked(url, body, len)
    }

    pub(crate) fn with_chunked(mut self, url: &str, body: Vec<u8>, chunk_size: usize) -> Self {
        self.bodies.insert(url.to_string(), (body, chunk_size));
        self
    }

    /// Fail the first `count` requests for `url` with a transport error.
    pub(crate) fn failing_first(self, url: &str, count: usize) -> Self {
        self.failures
            .lock()
            .expect("failure map")
            .insert(url.to_string(), count);
        self
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpSource for MemorySource {
    async fn open(&self, url: &str, _timeout: Duration) -> Result<HttpBody, HttpError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if let Some(remaining) = self.failures.lock().expect("failure map").get_mut(url)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(HttpError::Transport {
                url: url.to_string(),
                details: "connection reset".to_string(),
            });
        }

        let Some((body, chunk_size)) = self.bodies.get(url) else {
            return Err(HttpError::Status {
                url: url.to_string(),
                status: 404,
            });
        };

        let chunks: Vec<Result<Vec<u8>, HttpError>> =
            body.chunks(*chunk_size).map(|chunk| Ok(chunk.to_vec())).collect();
        Ok(HttpBody {
            total: Some(body.len() as u64),
            chunks: futures_util::stream::iter(chunks).boxed(),
        })
    }
}
