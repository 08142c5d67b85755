use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

const ROOT_ENV_VAR: &str = "NODEUP_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppPathsError {
    #[error("Could not determine config directory")]
    ConfigDirUnavailable,
    #[error("Could not determine cache directory")]
    CacheDirUnavailable,
    #[error("Could not determine data directory")]
    DataDirUnavailable,
}

/// Filesystem layout used by every component of the install pipeline.
///
/// Components receive a `Paths` value through their constructors, so tests can
/// point the whole pipeline at a temporary root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Paths {
    /// Lay every directory out below a single root.
    #[must_use]
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.join("config"),
            cache_dir: root.join("cache"),
            data_dir: root.join("data"),
        }
    }

    /// Resolve paths for the current user.
    ///
    /// `NODEUP_DIR` overrides the platform directories with a single root.
    ///
    /// # Errors
    /// Returns an error when a required base directory cannot be determined.
    pub fn discover() -> Result<Self, AppPathsError> {
        if let Some(root) = std::env::var_os(ROOT_ENV_VAR).filter(|value| !value.is_empty()) {
            debug!("Using {ROOT_ENV_VAR}={}", PathBuf::from(&root).display());
            return Ok(Self::from_root(root));
        }

        Ok(Self {
            config_dir: dirs::config_dir()
                .ok_or(AppPathsError::ConfigDirUnavailable)?
                .join("nodeup"),
            cache_dir: dirs::cache_dir()
                .ok_or(AppPathsError::CacheDirUnavailable)?
                .join("nodeup"),
            data_dir: dirs::data_dir()
                .ok_or(AppPathsError::DataDirUnavailable)?
                .join("nodeup"),
        })
    }

    #[must_use]
    pub fn versions_dir(&self) -> PathBuf {
        self.data_dir.join("versions")
    }

    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    #[must_use]
    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("installations.json")
    }

    #[must_use]
    pub fn catalog_cache_file(&self) -> PathBuf {
        self.cache_dir.join("catalog.json")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("debug.log")
    }

    /// Ensure all application directories exist on disk.
    ///
    /// # Errors
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.versions_dir())?;
        std::fs::create_dir_all(self.downloads_dir())?;
        std::fs::create_dir_all(self.locks_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::Paths;

    #[test]
    fn file_paths_use_expected_filenames() {
        let paths = Paths::from_root("/srv/nodeup");

        assert!(
            paths
                .settings_file()
                .ends_with(Path::new("config").join("settings.json"))
        );
        assert!(
            paths
                .registry_file()
                .ends_with(Path::new("data").join("installations.json"))
        );
        assert!(
            paths
                .catalog_cache_file()
                .ends_with(Path::new("cache").join("catalog.json"))
        );
        assert!(paths.log_file().ends_with(Path::new("data").join("debug.log")));
        assert!(
            paths
                .downloads_dir()
                .ends_with(Path::new("cache").join("downloads"))
        );
    }

    #[test]
    fn ensure_dirs_creates_all_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = Paths::from_root(temp.path().join("root"));

        paths
            .ensure_dirs()
            .expect("ensure_dirs should create application directories");

        assert!(paths.config_dir.is_dir());
        assert!(paths.cache_dir.is_dir());
        assert!(paths.versions_dir().is_dir());
        assert!(paths.downloads_dir().is_dir());
        assert!(paths.locks_dir().is_dir());
    }
}
