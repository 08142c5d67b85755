//! The install pipeline.
//!
//! Resolution, availability, preflight, checksum lookup, download, extraction,
//! relocation, verification and registration run strictly in that order. A
//! failing stage removes whatever it created and the error is returned as a
//! typed [`PipelineError`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use nodeup_backend::{
    ArtifactLocator, ErrorKind, Installation, InstallationRegistry, PipelineError, ReleaseCatalog,
    RemoteRelease,
};
use nodeup_platform::Platform;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::download::{Downloader, ProgressSink, verify_checksum};
use crate::extract;
use crate::preflight::{self, PreflightConfig};
use crate::resolve::VersionResolver;

const EXTRACT_PREFIX: &str = ".extract-";

#[derive(Debug, Clone)]
pub struct InstallerConfig {
    pub versions_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub platform: Platform,
    pub preflight: PreflightConfig,
    pub preserve_permissions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub version_expression: String,
    pub alias: Option<String>,
    pub force: bool,
}

impl InstallRequest {
    pub fn new(version_expression: impl Into<String>) -> Self {
        Self {
            version_expression: version_expression.into(),
            alias: None,
            force: false,
        }
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Reject aliases that cannot safely name a directory under the versions root.
///
/// # Errors
/// Returns `InvalidVersionFormat`.
pub fn validate_alias(alias: &str) -> Result<(), PipelineError> {
    let invalid = |reason: &str| {
        Err(PipelineError::new(
            ErrorKind::InvalidVersionFormat,
            format!("invalid alias '{alias}': {reason}"),
        ))
    };

    if alias.trim().is_empty() {
        return invalid("must not be empty");
    }
    if alias != alias.trim() {
        return invalid("must not start or end with whitespace");
    }
    if alias.contains(['/', '\\']) {
        return invalid("must not contain path separators");
    }
    if alias.starts_with('.') {
        return invalid("must not start with '.'");
    }
    if alias.chars().any(char::is_control) {
        return invalid("must not contain control characters");
    }
    Ok(())
}

fn checkpoint(cancel: &CancellationToken, stage: &'static str) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        info!("Install cancelled before {stage}");
        return Err(PipelineError::cancelled(stage));
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = path.symlink_metadata()?;
    if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

fn discard(path: &Path) {
    match remove_path(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!("Failed to remove {}: {error}", path.display()),
    }
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> io::Result<()> {
    std::fs::create_dir(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(std::fs::read_link(source)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    std::fs::copy(source, target).map(drop)
}

/// Put a set-aside installation back at `dest`, replacing whatever is there.
fn restore(previous: &Path, dest: &Path) {
    discard(dest);
    match std::fs::rename(previous, dest) {
        Ok(()) => info!("Restored previous installation at {}", dest.display()),
        Err(error) => warn!(
            "Failed to restore {} from {}: {error}",
            dest.display(),
            previous.display()
        ),
    }
}

/// Move `source` to `dest`.
///
/// A path already at `dest` is moved to `backup` first when one is given and
/// put back if the move fails; without a backup the move fails and the
/// existing path is kept. Returns whether `dest` was set aside.
fn relocate(source: &Path, dest: &Path, backup: Option<&Path>) -> Result<bool, PipelineError> {
    let existed = dest.symlink_metadata().is_ok();
    let set_aside = match backup {
        Some(backup) if existed => {
            info!("Moving existing installation at {} aside", dest.display());
            std::fs::rename(dest, backup).map_err(|error| {
                PipelineError::io(
                    ErrorKind::InstallationFailed,
                    &format!("failed to move {} aside", dest.display()),
                    &error,
                )
            })?;
            true
        }
        _ => false,
    };
    let owns_dest = !existed || set_aside;

    let moved = match std::fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::CrossesDevices => {
            debug!("Rename crosses devices, copying into {}", dest.display());
            copy_dir_recursive(source, dest).map_err(|copy_error| {
                if owns_dest {
                    discard(dest);
                }
                PipelineError::io(
                    ErrorKind::InstallationFailed,
                    &format!("failed to copy into {}", dest.display()),
                    &copy_error,
                )
            })
        }
        Err(error) => {
            if owns_dest && dest.symlink_metadata().is_ok() {
                discard(dest);
            }
            Err(PipelineError::io(
                ErrorKind::InstallationFailed,
                &format!("failed to move installation into {}", dest.display()),
                &error,
            ))
        }
    };

    if let Err(error) = moved {
        if set_aside && let Some(backup) = backup {
            restore(backup, dest);
        }
        return Err(error);
    }
    Ok(set_aside)
}

/// The one directory an artifact unpacks into.
fn single_top_level_dir(root: &Path) -> Result<PathBuf, PipelineError> {
    let entries = std::fs::read_dir(root)
        .and_then(|entries| entries.collect::<io::Result<Vec<_>>>())
        .map_err(|error| {
            PipelineError::io(
                ErrorKind::CorruptedArchive,
                "failed to read extraction directory",
                &error,
            )
        })?;

    match entries.as_slice() {
        [entry] if entry.path().is_dir() => Ok(entry.path()),
        [] => Err(PipelineError::new(
            ErrorKind::CorruptedArchive,
            "archive produced no files",
        )),
        _ => Err(PipelineError::new(
            ErrorKind::CorruptedArchive,
            format!(
                "expected a single top-level directory, found {} entries",
                entries.len()
            ),
        )),
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

pub struct Installer {
    config: InstallerConfig,
    catalog: Arc<dyn ReleaseCatalog>,
    registry: Arc<dyn InstallationRegistry>,
    locator: Arc<dyn ArtifactLocator>,
    downloader: Downloader,
    resolver: VersionResolver,
}

impl Installer {
    pub fn new(
        config: InstallerConfig,
        catalog: Arc<dyn ReleaseCatalog>,
        registry: Arc<dyn InstallationRegistry>,
        locator: Arc<dyn ArtifactLocator>,
        downloader: Downloader,
    ) -> Self {
        let resolver = VersionResolver::new(catalog.clone(), registry.clone());
        Self {
            config,
            catalog,
            registry,
            locator,
            downloader,
            resolver,
        }
    }

    #[must_use]
    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    #[must_use]
    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    fn install_dir(&self, alias: &str) -> PathBuf {
        self.config.versions_dir.join(alias)
    }

    fn ensure_not_installed(&self, alias: &str) -> Result<(), PipelineError> {
        if self.registry.contains(alias)? || self.install_dir(alias).is_dir() {
            return Err(PipelineError::new(
                ErrorKind::AlreadyInstalled,
                format!("'{alias}' is already installed; use force to reinstall"),
            ));
        }
        Ok(())
    }

    /// Install a runtime and register it under its alias.
    ///
    /// # Errors
    /// Returns a [`PipelineError`] naming the failing stage's kind. Nothing the
    /// failed attempt created is left in the versions directory.
    pub async fn install(
        &self,
        request: &InstallRequest,
        progress: Option<&dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<Installation, PipelineError> {
        if let Some(alias) = &request.alias {
            validate_alias(alias)?;
            if !request.force {
                self.ensure_not_installed(alias)?;
            }
        }

        checkpoint(cancel, "version resolution")?;
        let catalog = self.resolver.memo();
        let version = self
            .resolver
            .resolve_with(&catalog, &request.version_expression, cancel)
            .await
            .map_err(|error| error.reclassify(ErrorKind::ArtifactNotAvailable))?;
        info!(
            "Installing Node {} for '{}'",
            version.prefixed(),
            request.version_expression.trim()
        );

        let alias = request
            .alias
            .clone()
            .unwrap_or_else(|| version.to_string());
        if request.alias.is_none() && !request.force {
            self.ensure_not_installed(&alias)?;
        }

        checkpoint(cancel, "availability check")?;
        let release = self.resolver.release_with(&catalog, &version, cancel).await?;
        self.ensure_available(&release)?;

        checkpoint(cancel, "preflight")?;
        preflight::run(
            &self.config.preflight,
            &self.config.platform,
            &self.config.versions_dir,
            self.catalog.as_ref(),
        )
        .await?;

        checkpoint(cancel, "checksum lookup")?;
        let location = self.locator.locate(&version, &self.config.platform);
        let checksum = self
            .downloader
            .fetch_checksum_manifest(&location.checksum_url, &location.file_name, cancel)
            .await?
            .ok_or_else(|| {
                PipelineError::new(
                    ErrorKind::DownloadFailed,
                    format!(
                        "no checksum published for {} in {}",
                        location.file_name, location.checksum_url
                    ),
                )
            })?;

        checkpoint(cancel, "download")?;
        let archive = self.config.downloads_dir.join(&location.file_name);
        if verify_checksum(&archive, &checksum).unwrap_or(false) {
            info!("Reusing cached artifact {}", archive.display());
        } else {
            self.downloader
                .download_file(
                    &location.url,
                    &archive,
                    Some(&checksum),
                    progress,
                    None,
                    cancel,
                )
                .await?;
        }

        checkpoint(cancel, "extraction")?;
        let staging = self.scratch_dir()?;
        extract::extract(
            &archive,
            staging.path(),
            self.config.preserve_permissions,
            cancel,
        )
        .await?;
        let unpacked = single_top_level_dir(staging.path())?;

        checkpoint(cancel, "relocation")?;
        let destination = self.install_dir(&alias);
        let backup_root = if request.force && destination.symlink_metadata().is_ok() {
            Some(self.scratch_dir()?)
        } else {
            None
        };
        let backup = backup_root.as_ref().map(|root| root.path().join(&alias));
        let replaced = relocate(&unpacked, &destination, backup.as_deref())?;
        let previous = backup.filter(|_| replaced);
        if let Err(error) = staging.close() {
            warn!("Failed to remove extraction directory: {error}");
        }

        if let Err(error) = checkpoint(cancel, "verification") {
            self.undo_relocation(&alias, &destination, previous.as_deref());
            return Err(error);
        }
        let binary = destination.join(self.config.platform.binary_relative_path());
        if !is_executable(&binary) {
            error!("Runtime binary missing or not executable: {}", binary.display());
            self.undo_relocation(&alias, &destination, previous.as_deref());
            return Err(PipelineError::new(
                ErrorKind::InstallationFailed,
                format!("{} is missing or not executable", binary.display()),
            ));
        }

        let installation = Installation {
            alias: alias.clone(),
            version,
            path: destination,
            active: false,
            installed_at: Some(Utc::now()),
        };
        if let Err(error) = self.register(&installation, request.force) {
            self.rollback_quietly(&alias);
            return Err(error.reclassify(ErrorKind::InstallationFailed));
        }

        info!("Installed Node {} as '{alias}'", version.prefixed());
        Ok(installation)
    }

    fn ensure_available(&self, release: &RemoteRelease) -> Result<(), PipelineError> {
        if self.locator.is_available(release, &self.config.platform) {
            return Ok(());
        }
        Err(PipelineError::new(
            ErrorKind::ArtifactNotAvailable,
            format!(
                "no {} artifact published for {}",
                self.config.platform,
                release.version.prefixed()
            ),
        ))
    }

    /// Scratch directory under the versions root, removed on drop.
    fn scratch_dir(&self) -> Result<TempDir, PipelineError> {
        tempfile::Builder::new()
            .prefix(EXTRACT_PREFIX)
            .tempdir_in(&self.config.versions_dir)
            .map_err(|error| {
                PipelineError::io(
                    ErrorKind::InstallationFailed,
                    "failed to create extraction directory",
                    &error,
                )
            })
    }

    /// Take back a relocated runtime that failed verification. A replaced
    /// installation is restored together with its registry entry; otherwise
    /// the alias is rolled back entirely.
    fn undo_relocation(&self, alias: &str, destination: &Path, previous: Option<&Path>) {
        match previous {
            Some(previous) => restore(previous, destination),
            None => self.rollback_quietly(alias),
        }
    }

    fn register(&self, installation: &Installation, replace: bool) -> Result<(), PipelineError> {
        if replace && self.registry.remove(&installation.alias)?.is_some() {
            debug!("Replaced registry entry for '{}'", installation.alias);
        }
        self.registry.add(installation.clone())
    }

    fn rollback_quietly(&self, alias: &str) {
        if let Err(error) = self.rollback_installation(alias) {
            warn!("Rollback of '{alias}' was incomplete: {error}");
        }
    }

    /// Delete an installation's directory and registry entry.
    ///
    /// # Errors
    /// Returns `InstallationFailed` if the directory cannot be removed, or the
    /// registry's error.
    pub fn rollback_installation(&self, alias: &str) -> Result<(), PipelineError> {
        let registered = self.registry.get(alias)?;
        let directory = registered
            .as_ref()
            .map_or_else(|| self.install_dir(alias), |entry| entry.path.clone());

        match remove_path(&directory) {
            Ok(()) => info!("Rolled back {}", directory.display()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(PipelineError::io(
                    ErrorKind::InstallationFailed,
                    &format!("failed to remove {}", directory.display()),
                    &error,
                ));
            }
        }

        if registered.is_some() {
            self.registry.remove(alias)?;
        }
        Ok(())
    }

    /// Remove extraction directories left behind by interrupted installs.
    ///
    /// # Errors
    /// Returns `InstallationFailed` if the versions directory cannot be read.
    pub fn cleanup_stale_extractions(&self) -> Result<usize, PipelineError> {
        let entries = match std::fs::read_dir(&self.config.versions_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(error) => {
                return Err(PipelineError::io(
                    ErrorKind::InstallationFailed,
                    "failed to read versions directory",
                    &error,
                ));
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let stale = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(EXTRACT_PREFIX));
            if stale && entry.path().is_dir() {
                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(error) => warn!(
                        "Failed to remove stale extraction {}: {error}",
                        entry.path().display()
                    ),
                }
            }
        }
        if removed > 0 {
            info!("Removed {removed} stale extraction directories");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::{relocate, single_top_level_dir, validate_alias};
    use nodeup_backend::ErrorKind;

    #[test]
    fn aliases_that_escape_the_versions_dir_are_rejected() {
        for alias in ["", " ", "../x", "a/b", "a\\b", ".", "..", ".extract-1", " lead"] {
            let error = validate_alias(alias).expect_err("alias should be rejected");
            assert_eq!(error.kind, ErrorKind::InvalidVersionFormat, "alias {alias:?}");
        }
        validate_alias("work-20").expect("plain alias should pass");
    }

    #[test]
    fn top_level_dir_must_be_unique() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        assert_eq!(
            single_top_level_dir(temp.path())
                .expect_err("empty dir should fail")
                .kind,
            ErrorKind::CorruptedArchive
        );

        std::fs::create_dir(temp.path().join("node-v20.11.0")).expect("dir should be created");
        assert_eq!(
            single_top_level_dir(temp.path()).expect("single dir should be found"),
            temp.path().join("node-v20.11.0")
        );

        std::fs::write(temp.path().join("README"), b"").expect("file should be written");
        assert_eq!(
            single_top_level_dir(temp.path())
                .expect_err("two entries should fail")
                .kind,
            ErrorKind::CorruptedArchive
        );
    }

    #[test]
    fn relocation_keeps_unforced_destination() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let source = temp.path().join("source");
        std::fs::create_dir(&source).expect("source should be created");
        let dest = temp.path().join("dest");
        std::fs::write(&dest, b"user data").expect("dest file should be written");

        let error = relocate(&source, &dest, None).expect_err("rename onto a file should fail");

        assert_eq!(error.kind, ErrorKind::InstallationFailed);
        assert_eq!(
            std::fs::read(&dest).expect("user file should survive"),
            b"user data"
        );
    }

    #[test]
    fn forced_relocation_replaces_destination() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let source = temp.path().join("source");
        std::fs::create_dir(&source).expect("source should be created");
        std::fs::write(source.join("new"), b"").expect("marker should be written");
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest).expect("dest should be created");
        std::fs::write(dest.join("old"), b"").expect("marker should be written");

        let backup = temp.path().join("backup");

        let replaced =
            relocate(&source, &dest, Some(&backup)).expect("forced relocation should succeed");

        assert!(replaced);
        assert!(dest.join("new").exists());
        assert!(!dest.join("old").exists());
        assert!(backup.join("old").exists());
        assert!(!source.exists());
    }

    #[test]
    fn failed_forced_relocation_restores_previous_installation() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let missing_source = temp.path().join("never-extracted");
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest).expect("dest should be created");
        std::fs::write(dest.join("old"), b"runtime").expect("marker should be written");
        let backup = temp.path().join("backup");

        let error = relocate(&missing_source, &dest, Some(&backup))
            .expect_err("moving a missing source should fail");

        assert_eq!(error.kind, ErrorKind::InstallationFailed);
        assert_eq!(
            std::fs::read(dest.join("old")).expect("previous installation should be back"),
            b"runtime"
        );
        assert!(!backup.exists());
    }
}
