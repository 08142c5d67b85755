//! Checksummed downloads with bounded retry.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use nodeup_backend::{ErrorKind, PipelineError};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::http::{HttpError, HttpSource, read_to_string};
use crate::retry::RetryPolicy;

const WRITE_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
    pub percent: f64,
}

impl DownloadProgress {
    #[allow(clippy::cast_precision_loss)]
    fn new(downloaded: u64, total: u64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            (downloaded as f64 / total as f64 * 100.0).min(100.0)
        };
        Self {
            downloaded,
            total,
            percent,
        }
    }
}

/// Receiver of download progress updates.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: DownloadProgress);
}

impl ProgressSink for mpsc::UnboundedSender<DownloadProgress> {
    fn report(&self, progress: DownloadProgress) {
        let _ = self.send(progress);
    }
}

impl ProgressSink for mpsc::Sender<DownloadProgress> {
    fn report(&self, progress: DownloadProgress) {
        let _ = self.try_send(progress);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    pub bytes: u64,
    pub checksum_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} after {attempts} attempt(s) ({bytes_downloaded} bytes received): {detail}")]
pub struct DownloadError {
    pub kind: ErrorKind,
    pub detail: String,
    pub bytes_downloaded: u64,
    pub attempts: u32,
}

impl From<DownloadError> for PipelineError {
    fn from(error: DownloadError) -> Self {
        let kind = error.kind;
        PipelineError::new(kind, error.to_string())
    }
}

/// Why a single attempt stopped.
enum AttemptFailure {
    Cancelled { bytes: u64 },
    Transient { detail: String, bytes: u64 },
    Fatal { detail: String, bytes: u64 },
}

/// Compute the lowercase hex SHA-256 digest of a file.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn compute_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a file's digest with `expected`, ignoring hex case.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn verify_checksum(path: &Path, expected: &str) -> std::io::Result<bool> {
    Ok(compute_checksum(path)?.eq_ignore_ascii_case(expected.trim()))
}

/// Find the checksum for `file_name` in a `checksum  filename` manifest.
#[must_use]
pub fn parse_checksum_manifest(manifest: &str, file_name: &str) -> Option<String> {
    manifest.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        let name = parts
            .next()?
            .trim_start_matches('*')
            .trim_start_matches("./");
        name.eq_ignore_ascii_case(file_name)
            .then(|| hash.to_ascii_lowercase())
    })
}

fn require_secure_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|error| format!("invalid URL {url}: {error}"))?;
    if parsed.scheme() == "https" {
        Ok(())
    } else {
        Err(format!(
            "refusing insecure URL {url}: only https downloads are allowed"
        ))
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed partial download {}", path.display()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(
            "Failed to remove partial download {}: {error}",
            path.display()
        ),
    }
}

#[derive(Clone)]
pub struct Downloader {
    source: Arc<dyn HttpSource>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Downloader {
    pub fn new(source: Arc<dyn HttpSource>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            source,
            retry,
            timeout,
        }
    }

    pub fn with_defaults(source: Arc<dyn HttpSource>) -> Self {
        Self::new(source, RetryPolicy::default(), DEFAULT_TIMEOUT)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Download `url` to `destination`, verifying `expected_checksum` if given.
    ///
    /// Transient failures and checksum mismatches restart the download until
    /// the retry budget is spent. Cancellation stops immediately. Every failed
    /// attempt deletes its partial file.
    ///
    /// # Errors
    /// Returns a [`DownloadError`] of kind `DownloadFailed`, `ChecksumMismatch`
    /// or `Cancelled`.
    pub async fn download_file(
        &self,
        url: &str,
        destination: &Path,
        expected_checksum: Option<&str>,
        progress: Option<&dyn ProgressSink>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Download, DownloadError> {
        if let Err(detail) = require_secure_url(url) {
            return Err(DownloadError {
                kind: ErrorKind::DownloadFailed,
                detail,
                bytes_downloaded: 0,
                attempts: 0,
            });
        }

        let timeout = timeout.unwrap_or(self.timeout);
        let mut last_kind = ErrorKind::DownloadFailed;
        let mut last_detail = String::new();
        let mut last_bytes = 0;

        for attempt in 1..=self.retry.max_attempts {
            if !self.retry.wait(attempt, cancel).await {
                remove_partial(destination);
                return Err(DownloadError {
                    kind: ErrorKind::Cancelled,
                    detail: format!("download of {url} cancelled"),
                    bytes_downloaded: last_bytes,
                    attempts: attempt - 1,
                });
            }

            info!(
                "Downloading {url} (attempt {attempt}/{})",
                self.retry.max_attempts
            );
            match self
                .attempt(url, destination, progress, timeout, cancel)
                .await
            {
                Ok(bytes) => {
                    let Some(expected) = expected_checksum else {
                        return Ok(Download {
                            path: destination.to_path_buf(),
                            bytes,
                            checksum_verified: false,
                        });
                    };
                    match verify_checksum(destination, expected) {
                        Ok(true) => {
                            info!("Checksum verified for {}", destination.display());
                            return Ok(Download {
                                path: destination.to_path_buf(),
                                bytes,
                                checksum_verified: true,
                            });
                        }
                        Ok(false) => {
                            warn!("Checksum mismatch for {url} on attempt {attempt}");
                            last_kind = ErrorKind::ChecksumMismatch;
                            last_detail = format!("checksum of {url} does not match {expected}");
                        }
                        Err(error) => {
                            warn!("Could not hash {}: {error}", destination.display());
                            last_kind = ErrorKind::DownloadFailed;
                            last_detail = format!("failed to read downloaded file: {error}");
                        }
                    }
                    last_bytes = bytes;
                    remove_partial(destination);
                }
                Err(AttemptFailure::Cancelled { bytes }) => {
                    remove_partial(destination);
                    return Err(DownloadError {
                        kind: ErrorKind::Cancelled,
                        detail: format!("download of {url} cancelled"),
                        bytes_downloaded: bytes,
                        attempts: attempt,
                    });
                }
                Err(AttemptFailure::Transient { detail, bytes }) => {
                    warn!("Download attempt {attempt} failed: {detail}");
                    remove_partial(destination);
                    last_kind = ErrorKind::DownloadFailed;
                    last_detail = detail;
                    last_bytes = bytes;
                }
                Err(AttemptFailure::Fatal { detail, bytes }) => {
                    error!("Download of {url} failed: {detail}");
                    remove_partial(destination);
                    return Err(DownloadError {
                        kind: ErrorKind::DownloadFailed,
                        detail,
                        bytes_downloaded: bytes,
                        attempts: attempt,
                    });
                }
            }
        }

        error!(
            "Giving up on {url} after {} attempts",
            self.retry.max_attempts
        );
        Err(DownloadError {
            kind: last_kind,
            detail: last_detail,
            bytes_downloaded: last_bytes,
            attempts: self.retry.max_attempts,
        })
    }

    async fn attempt(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<&dyn ProgressSink>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64, AttemptFailure> {
        let transient = |detail: String, bytes: u64| AttemptFailure::Transient { detail, bytes };

        let opened = tokio::select! {
            () = cancel.cancelled() => return Err(AttemptFailure::Cancelled { bytes: 0 }),
            opened = self.source.open(url, timeout) => opened,
        };
        let mut body = opened.map_err(|error: HttpError| {
            if error.is_transient() {
                transient(error.to_string(), 0)
            } else {
                AttemptFailure::Fatal {
                    detail: error.to_string(),
                    bytes: 0,
                }
            }
        })?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| transient(format!("failed to create {}: {error}", parent.display()), 0))?;
        }
        let file = tokio::fs::File::create(destination)
            .await
            .map_err(|error| transient(format!("failed to create download file: {error}"), 0))?;
        let mut writer = BufWriter::with_capacity(WRITE_CHUNK_SIZE, file);
        let mut downloaded: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AttemptFailure::Cancelled { bytes: downloaded }),
                next = body.chunks.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|error| transient(error.to_string(), downloaded))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|error| transient(format!("failed to write download data: {error}"), downloaded))?;
            downloaded += chunk.len() as u64;

            if let (Some(sink), Some(total)) = (progress, body.total) {
                sink.report(DownloadProgress::new(downloaded, total));
            }
        }

        writer
            .flush()
            .await
            .map_err(|error| transient(format!("failed to flush download file: {error}"), downloaded))?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(|error| transient(format!("failed to sync download file: {error}"), downloaded))?;

        if let Some(total) = body.total
            && downloaded != total
        {
            return Err(transient(
                format!("received {downloaded} of {total} bytes"),
                downloaded,
            ));
        }

        debug!("Download complete: {downloaded} bytes");
        Ok(downloaded)
    }

    /// Download a checksum manifest and return the entry for `file_name`.
    ///
    /// # Errors
    /// Returns `DownloadFailed` when the manifest cannot be fetched, or
    /// `Cancelled`.
    pub async fn fetch_checksum_manifest(
        &self,
        url: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, PipelineError> {
        require_secure_url(url)
            .map_err(|detail| PipelineError::new(ErrorKind::DownloadFailed, detail))?;

        let mut last_error = None;
        for attempt in 1..=self.retry.max_attempts {
            if !self.retry.wait(attempt, cancel).await {
                return Err(PipelineError::cancelled("checksum lookup"));
            }
            let fetched = tokio::select! {
                () = cancel.cancelled() => return Err(PipelineError::cancelled("checksum lookup")),
                fetched = read_to_string(self.source.as_ref(), url, MANIFEST_TIMEOUT) => fetched,
            };
            match fetched {
                Ok(manifest) => return Ok(parse_checksum_manifest(&manifest, file_name)),
                Err(error) if error.is_transient() => {
                    warn!("Checksum manifest attempt {attempt} failed: {error}");
                    last_error = Some(error);
                }
                Err(error) => {
                    return Err(PipelineError::new(
                        ErrorKind::DownloadFailed,
                        format!("failed to fetch checksum manifest: {error}"),
                    ));
                }
            }
        }

        Err(PipelineError::new(
            ErrorKind::DownloadFailed,
            format!(
                "failed to fetch checksum manifest: {}",
                last_error.map_or_else(|| url.to_string(), |error| error.to_string())
            ),
        ))
    }
}
