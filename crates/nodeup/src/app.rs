use std::sync::Arc;

use log::{info, warn};
use nodeup_backend::{
    ArtifactLocator, ErrorKind, Installation, InstallationRegistry, NodeVersion, PipelineError,
};
use nodeup_core::{
    Downloader, HttpSource, InstallRequest, Installer, InstallerConfig, LockHandle, LockManager,
    ProgressSink, ReqwestSource, STATE_LOCK, validate_alias,
};
use nodeup_dist::{DistCatalog, DistLocator, JsonRegistry};
use nodeup_platform::{Paths, Platform};
use tokio_util::sync::CancellationToken;

use crate::settings::Settings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub stale_locks_released: usize,
    pub stale_extractions_removed: usize,
}

fn not_installed(alias: &str) -> PipelineError {
    PipelineError::new(
        ErrorKind::InstallationFailed,
        format!("no installation named '{alias}'"),
    )
}

/// Entry points for a front end.
///
/// Every state-changing call takes the `"state"` lock exactly once and holds
/// it until the call returns.
pub struct App {
    paths: Paths,
    settings: Settings,
    locks: LockManager,
    registry: Arc<JsonRegistry>,
    installer: Installer,
}

impl App {
    /// Wire the production collaborators for the host platform.
    ///
    /// # Errors
    /// Returns `UnsupportedPlatform` for an unsupported host, or
    /// `InstallationFailed` if the data directories cannot be created.
    pub fn new(paths: Paths, settings: Settings) -> Result<Self, PipelineError> {
        let platform = match settings.arch {
            Some(arch) => Platform::current_with_arch(arch)?,
            None => Platform::current()?,
        };
        let source = ReqwestSource::new()
            .map_err(|error| PipelineError::new(ErrorKind::RemoteApiFailed, error.to_string()))?;
        let locator = DistLocator::new(settings.mirror());
        Self::assemble(paths, settings, Arc::new(source), platform, Arc::new(locator))
    }

    /// Wire the app around an explicit transport, platform and locator.
    ///
    /// # Errors
    /// Returns `InstallationFailed` if the data directories cannot be created.
    pub fn assemble(
        paths: Paths,
        settings: Settings,
        source: Arc<dyn HttpSource>,
        platform: Platform,
        locator: Arc<dyn ArtifactLocator>,
    ) -> Result<Self, PipelineError> {
        paths.ensure_dirs().map_err(|error| {
            PipelineError::io(
                ErrorKind::InstallationFailed,
                "failed to create data directories",
                &error,
            )
        })?;

        let catalog = Arc::new(
            DistCatalog::new(source.clone(), paths.catalog_cache_file())
                .with_mirror(settings.mirror())
                .with_ttl(settings.catalog_cache_ttl()),
        );
        let registry = Arc::new(JsonRegistry::new(paths.registry_file()));
        let downloader = Downloader::new(source, settings.retry_policy(), settings.download_timeout());
        let installer = Installer::new(
            InstallerConfig {
                versions_dir: paths.versions_dir(),
                downloads_dir: paths.downloads_dir(),
                platform,
                preflight: settings.preflight_config(),
                preserve_permissions: settings.preserve_permissions,
            },
            catalog,
            registry.clone(),
            locator,
            downloader,
        );

        Ok(Self {
            locks: LockManager::new(paths.locks_dir()),
            paths,
            settings,
            registry,
            installer,
        })
    }

    #[must_use]
    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    async fn lock_state(&self, cancel: &CancellationToken) -> Result<LockHandle, PipelineError> {
        tokio::select! {
            () = cancel.cancelled() => Err(PipelineError::cancelled("lock acquisition")),
            handle = self.locks.acquire(STATE_LOCK, self.settings.lock_timeout()) => Ok(handle?),
        }
    }

    /// Resolve a version expression without installing anything.
    ///
    /// # Errors
    /// See [`nodeup_core::VersionResolver::resolve`].
    pub async fn resolve(
        &self,
        expression: &str,
        cancel: &CancellationToken,
    ) -> Result<NodeVersion, PipelineError> {
        self.installer.resolver().resolve(expression, cancel).await
    }

    /// # Errors
    /// Returns an error if the registry cannot be read.
    pub fn installations(&self) -> Result<Vec<Installation>, PipelineError> {
        self.registry.list()
    }

    /// # Errors
    /// Returns `LockTimeout` if another process holds the state lock, or any
    /// install pipeline error.
    pub async fn install(
        &self,
        request: &InstallRequest,
        progress: Option<&dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<Installation, PipelineError> {
        let _state = self.lock_state(cancel).await?;
        self.installer.install(request, progress, cancel).await
    }

    /// Delete an installation's directory, then its registry entry.
    ///
    /// # Errors
    /// Returns `LockTimeout`, or `InstallationFailed` when the alias is unknown
    /// or its directory cannot be removed.
    pub async fn uninstall(&self, alias: &str) -> Result<Installation, PipelineError> {
        let _state = self.lock_state(&CancellationToken::new()).await?;
        let installation = self.registry.get(alias)?.ok_or_else(|| not_installed(alias))?;
        self.installer.rollback_installation(&installation.alias)?;
        info!("Uninstalled '{}'", installation.alias);
        Ok(installation)
    }

    /// Make `alias` the single active installation.
    ///
    /// # Errors
    /// Returns `LockTimeout`, or `InstallationFailed` when the alias is unknown.
    pub async fn activate(&self, alias: &str) -> Result<Installation, PipelineError> {
        let _state = self.lock_state(&CancellationToken::new()).await?;
        if !self.registry.contains(alias)? {
            return Err(not_installed(alias));
        }
        self.registry.set_active(alias)?;
        let installation = self.registry.get(alias)?.ok_or_else(|| not_installed(alias))?;
        info!("Activated '{}'", installation.alias);
        Ok(installation)
    }

    /// Rename an alias and move its directory to match.
    ///
    /// # Errors
    /// Returns `InvalidVersionFormat` for an unusable new alias,
    /// `AlreadyInstalled` when the new alias is taken, `LockTimeout`, or
    /// `InstallationFailed`.
    pub async fn rename(&self, alias: &str, new_alias: &str) -> Result<Installation, PipelineError> {
        validate_alias(new_alias)?;
        let _state = self.lock_state(&CancellationToken::new()).await?;

        let installation = self.registry.get(alias)?.ok_or_else(|| not_installed(alias))?;
        if let Some(existing) = self.registry.get(new_alias)?
            && !existing.matches_alias(&installation.alias)
        {
            return Err(PipelineError::new(
                ErrorKind::AlreadyInstalled,
                format!("'{new_alias}' is already installed"),
            ));
        }

        let new_path = self.paths.versions_dir().join(new_alias);
        let moved = installation.path != new_path;
        if moved {
            if new_path.exists() && !installation.matches_alias(new_alias) {
                return Err(PipelineError::new(
                    ErrorKind::AlreadyInstalled,
                    format!("{} already exists", new_path.display()),
                ));
            }
            std::fs::rename(&installation.path, &new_path).map_err(|error| {
                PipelineError::io(
                    ErrorKind::InstallationFailed,
                    &format!("failed to move {}", installation.path.display()),
                    &error,
                )
            })?;
        }

        if let Err(error) = self.registry.rename(alias, new_alias, new_path.clone()) {
            if moved && let Err(undo) = std::fs::rename(&new_path, &installation.path) {
                warn!(
                    "Failed to move {} back after registry error: {undo}",
                    new_path.display()
                );
            }
            return Err(error);
        }

        info!("Renamed '{}' to '{new_alias}'", installation.alias);
        Ok(Installation {
            alias: new_alias.to_string(),
            path: new_path,
            ..installation
        })
    }

    /// Release abandoned lock markers and leftover extraction directories.
    ///
    /// Extraction directories are only swept while this process holds the
    /// state lock; if another process holds it they may belong to its install.
    ///
    /// # Errors
    /// Returns an error if the locks or versions directory cannot be read.
    pub fn startup_maintenance(&self) -> Result<MaintenanceReport, PipelineError> {
        let stale_locks_released = self.locks.release_stale(self.settings.stale_lock_age())?;
        let stale_extractions_removed = match self.locks.try_acquire(STATE_LOCK)? {
            Some(_state) => self.installer.cleanup_stale_extractions()?,
            None => {
                info!("State lock is held elsewhere, skipping extraction cleanup");
                0
            }
        };
        Ok(MaintenanceReport {
            stale_locks_released,
            stale_extractions_removed,
        })
    }
}
