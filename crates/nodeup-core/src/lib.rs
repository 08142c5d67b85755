//! Install pipeline and its supporting primitives.
//!
//! This crate holds the logic that acquires a verified Node.js runtime:
//! - A named cross-process lock backed by an advisory file lock.
//! - Version expression resolution against a release catalog.
//! - A retrying, checksum-verifying downloader over a pluggable HTTP source.
//! - Zip and compressed tarball extraction with path-traversal checks.
//! - The install orchestrator that sequences the stages and rolls back.

pub mod download;
pub mod extract;
mod http;
mod install;
mod lock;
pub mod preflight;
mod resolve;
mod retry;
#[cfg(test)]
mod test_support;

/// Chunked downloads with progress reporting and checksum helpers.
pub use download::{
    Download, DownloadError, DownloadProgress, Downloader, ProgressSink, compute_checksum,
    parse_checksum_manifest, verify_checksum,
};
/// Archive detection, listing and extraction.
pub use extract::{ArchiveFormat, Extraction, is_valid_archive};
/// Transport seam and its reqwest implementation.
pub use http::{ChunkStream, HttpBody, HttpError, HttpSource, ReqwestSource, read_to_string};
/// Install orchestration.
pub use install::{InstallRequest, Installer, InstallerConfig, validate_alias};
/// Cross-process named locks.
pub use lock::{LockError, LockHandle, LockManager, STATE_LOCK};
pub use preflight::PreflightConfig;
/// Version expression classification and resolution.
pub use resolve::{VersionRequest, VersionResolver, classify, is_exact_version};
pub use retry::RetryPolicy;
