use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use nodeup_platform::Platform;

use crate::error::PipelineError;
use crate::types::{Installation, NodeVersion, RemoteRelease};

/// Source of the remote release list.
#[async_trait]
pub trait ReleaseCatalog: Send + Sync {
    /// All known releases, newest first.
    async fn releases(&self) -> Result<Vec<RemoteRelease>, PipelineError>;

    /// Check that the catalog endpoint answers within `timeout`.
    async fn ping(&self, timeout: Duration) -> Result<(), PipelineError>;
}

/// Persistent set of installations keyed by case-insensitive alias.
pub trait InstallationRegistry: Send + Sync {
    fn get(&self, alias: &str) -> Result<Option<Installation>, PipelineError>;

    fn find_by_version(&self, version: &NodeVersion) -> Result<Vec<Installation>, PipelineError>;

    fn list(&self) -> Result<Vec<Installation>, PipelineError>;

    fn add(&self, installation: Installation) -> Result<(), PipelineError>;

    /// Remove an alias, returning the removed entry when it existed.
    fn remove(&self, alias: &str) -> Result<Option<Installation>, PipelineError>;

    /// Mark one installation active and every other one inactive.
    fn set_active(&self, alias: &str) -> Result<(), PipelineError>;

    fn rename(&self, alias: &str, new_alias: &str, new_path: PathBuf)
    -> Result<(), PipelineError>;

    fn contains(&self, alias: &str) -> Result<bool, PipelineError> {
        Ok(self.get(alias)?.is_some())
    }

    fn active(&self) -> Result<Option<Installation>, PipelineError> {
        Ok(self.list()?.into_iter().find(|installation| installation.active))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocation {
    pub url: String,
    pub checksum_url: String,
    pub file_name: String,
}

/// Maps a release and platform to downloadable artifacts.
pub trait ArtifactLocator: Send + Sync {
    fn locate(&self, version: &NodeVersion, platform: &Platform) -> ArtifactLocation;

    fn is_available(&self, release: &RemoteRelease, platform: &Platform) -> bool;
}

