use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use nodeup_backend::{ErrorKind, PipelineError, ReleaseCatalog};
use nodeup_platform::Platform;

pub const DEFAULT_ESTIMATED_INSTALL_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_DISK_SPACE_MULTIPLIER: u64 = 3;
pub const DEFAULT_PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Thresholds for the checks run before any download starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreflightConfig {
    pub estimated_install_bytes: u64,
    pub disk_space_multiplier: u64,
    pub timeout: Duration,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            estimated_install_bytes: DEFAULT_ESTIMATED_INSTALL_BYTES,
            disk_space_multiplier: DEFAULT_DISK_SPACE_MULTIPLIER,
            timeout: DEFAULT_PREFLIGHT_TIMEOUT,
        }
    }
}

impl PreflightConfig {
    #[must_use]
    pub fn required_bytes(&self) -> u64 {
        self.estimated_install_bytes
            .saturating_mul(self.disk_space_multiplier)
    }
}

/// The target platform must have artifacts and match the host OS.
///
/// # Errors
/// Returns `UnsupportedPlatform`.
pub fn check_platform(platform: &Platform) -> Result<(), PipelineError> {
    Platform::new(platform.os, platform.arch)?;
    let host = Platform::current_with_arch(platform.arch)?;
    if host.os != platform.os {
        return Err(PipelineError::new(
            ErrorKind::UnsupportedPlatform,
            format!("cannot install {platform} artifacts on {}", host.os),
        ));
    }
    Ok(())
}

/// Probe write access by creating and dropping a temp file in `dir`.
///
/// # Errors
/// Returns `InsufficientPermissions`.
pub fn check_write_permission(dir: &Path) -> Result<(), PipelineError> {
    std::fs::create_dir_all(dir)
        .and_then(|()| tempfile::NamedTempFile::new_in(dir).map(drop))
        .map_err(|error| {
            PipelineError::new(
                ErrorKind::InsufficientPermissions,
                format!("cannot write to {}: {error}", dir.display()),
            )
        })
}

/// # Errors
/// Returns `InsufficientDiskSpace`, including when free space cannot be read.
pub fn check_disk_space(dir: &Path, required: u64) -> Result<(), PipelineError> {
    let available = fs2::available_space(dir).map_err(|error| {
        PipelineError::new(
            ErrorKind::InsufficientDiskSpace,
            format!("cannot determine free space on {}: {error}", dir.display()),
        )
    })?;
    debug!(
        "Free space on {}: {available} bytes, need {required}",
        dir.display()
    );
    if available < required {
        return Err(PipelineError::new(
            ErrorKind::InsufficientDiskSpace,
            format!(
                "{} has {} MiB free, at least {} MiB required",
                dir.display(),
                available / (1024 * 1024),
                required.div_ceil(1024 * 1024)
            ),
        ));
    }
    Ok(())
}

/// # Errors
/// Returns `RemoteApiFailed` when the catalog does not answer in time.
pub async fn check_remote(
    catalog: &dyn ReleaseCatalog,
    timeout: Duration,
) -> Result<(), PipelineError> {
    catalog
        .ping(timeout)
        .await
        .map_err(|error| error.reclassify(ErrorKind::RemoteApiFailed))
}

/// Run every check in order, stopping at the first failure.
///
/// # Errors
/// Returns the first failing check's error.
pub async fn run(
    config: &PreflightConfig,
    platform: &Platform,
    install_root: &Path,
    catalog: &dyn ReleaseCatalog,
) -> Result<(), PipelineError> {
    check_platform(platform)?;
    check_write_permission(install_root)?;
    check_disk_space(install_root, config.required_bytes())?;
    check_remote(catalog, config.timeout).await?;
    info!("Preflight checks passed for {platform}");
    Ok(())
}
