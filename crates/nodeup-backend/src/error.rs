use thiserror::Error;

use crate::types::VersionParseError;

/// Failure kinds reported at the pipeline boundary.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    #[error("unsupported platform")]
    UnsupportedPlatform,
    #[error("insufficient permissions")]
    InsufficientPermissions,
    #[error("insufficient disk space")]
    InsufficientDiskSpace,
    #[error("remote API failed")]
    RemoteApiFailed,
    #[error("artifact not available")]
    ArtifactNotAvailable,
    #[error("invalid version format")]
    InvalidVersionFormat,
    #[error("artifact series not found")]
    ArtifactSeriesNotFound,
    #[error("download failed")]
    DownloadFailed,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("corrupted archive")]
    CorruptedArchive,
    #[error("path traversal detected")]
    PathTraversalDetected,
    #[error("already installed")]
    AlreadyInstalled,
    #[error("installation failed")]
    InstallationFailed,
    #[error("lock timeout")]
    LockTimeout,
    #[error("cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Stable process exit code for this kind.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::UnsupportedPlatform => 10,
            Self::InsufficientPermissions => 11,
            Self::InsufficientDiskSpace => 12,
            Self::RemoteApiFailed => 13,
            Self::ArtifactNotAvailable => 20,
            Self::InvalidVersionFormat => 21,
            Self::ArtifactSeriesNotFound => 22,
            Self::DownloadFailed => 30,
            Self::ChecksumMismatch => 31,
            Self::CorruptedArchive => 32,
            Self::PathTraversalDetected => 33,
            Self::AlreadyInstalled => 40,
            Self::InstallationFailed => 41,
            Self::LockTimeout => 50,
            Self::Cancelled => 130,
        }
    }

    #[must_use]
    pub fn is_cancellation(self) -> bool {
        self == Self::Cancelled
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn cancelled(stage: &'static str) -> Self {
        Self::new(ErrorKind::Cancelled, format!("cancelled during {stage}"))
    }

    pub fn io(kind: ErrorKind, context: &str, error: &std::io::Error) -> Self {
        Self::new(kind, format!("{context}: {error}"))
    }

    /// Re-tag an error with a new kind, keeping the original kind in the detail.
    #[must_use]
    pub fn reclassify(self, kind: ErrorKind) -> Self {
        if self.kind == kind || self.kind.is_cancellation() {
            return self;
        }
        Self::new(kind, format!("{} ({})", self.detail, self.kind))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind.is_cancellation()
    }
}

impl From<VersionParseError> for PipelineError {
    fn from(error: VersionParseError) -> Self {
        Self::new(ErrorKind::InvalidVersionFormat, error.to_string())
    }
}

impl From<nodeup_platform::PlatformError> for PipelineError {
    fn from(error: nodeup_platform::PlatformError) -> Self {
        Self::new(ErrorKind::UnsupportedPlatform, error.to_string())
    }
}
