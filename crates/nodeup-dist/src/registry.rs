use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};
use nodeup_backend::{ErrorKind, Installation, InstallationRegistry, NodeVersion, PipelineError};
use serde::{Deserialize, Serialize};

use crate::fs::write_json_atomic;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    installations: Vec<Installation>,
}

/// Installations persisted as JSON.
///
/// The in-process mutex serialises read-modify-write cycles; cross-process
/// writers are expected to hold the state lock.
pub struct JsonRegistry {
    path: PathBuf,
    guard: Mutex<()>,
}

fn storage_error(context: &str, path: &Path, detail: impl std::fmt::Display) -> PipelineError {
    PipelineError::new(
        ErrorKind::InstallationFailed,
        format!("{context} {}: {detail}", path.display()),
    )
}

fn not_registered(alias: &str) -> PipelineError {
    PipelineError::new(
        ErrorKind::InstallationFailed,
        format!("no installation named '{alias}'"),
    )
}

impl JsonRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RegistryFile, PipelineError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryFile::default());
            }
            Err(error) => return Err(storage_error("failed to read", &self.path, error)),
        };
        serde_json::from_str(&data).map_err(|error| storage_error("corrupt registry", &self.path, error))
    }

    fn save(&self, file: &RegistryFile) -> Result<(), PipelineError> {
        write_json_atomic(&self.path, file)
            .map_err(|error| storage_error("failed to write", &self.path, error))
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryFile) -> T) -> Result<T, PipelineError> {
        let _held = self.guard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(f(&self.load()?))
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut RegistryFile) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let _held = self.guard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut file = self.load()?;
        let result = f(&mut file)?;
        self.save(&file)?;
        Ok(result)
    }
}

impl InstallationRegistry for JsonRegistry {
    fn get(&self, alias: &str) -> Result<Option<Installation>, PipelineError> {
        self.read(|file| {
            file.installations
                .iter()
                .find(|installation| installation.matches_alias(alias))
                .cloned()
        })
    }

    fn find_by_version(&self, version: &NodeVersion) -> Result<Vec<Installation>, PipelineError> {
        self.read(|file| {
            file.installations
                .iter()
                .filter(|installation| installation.version == *version)
                .cloned()
                .collect()
        })
    }

    fn list(&self) -> Result<Vec<Installation>, PipelineError> {
        self.read(|file| file.installations.clone())
    }

    fn add(&self, installation: Installation) -> Result<(), PipelineError> {
        self.update(|file| {
            if file
                .installations
                .iter()
                .any(|existing| existing.matches_alias(&installation.alias))
            {
                return Err(PipelineError::new(
                    ErrorKind::AlreadyInstalled,
                    format!("'{}' is already registered", installation.alias),
                ));
            }
            info!(
                "Registering '{}' ({})",
                installation.alias, installation.version
            );
            file.installations.push(installation);
            Ok(())
        })
    }

    fn remove(&self, alias: &str) -> Result<Option<Installation>, PipelineError> {
        self.update(|file| {
            let index = file
                .installations
                .iter()
                .position(|installation| installation.matches_alias(alias));
            let removed = index.map(|index| file.installations.remove(index));
            if removed.is_some() {
                info!("Deregistered '{alias}'");
            }
            Ok(removed)
        })
    }

    fn set_active(&self, alias: &str) -> Result<(), PipelineError> {
        self.update(|file| {
            if !file
                .installations
                .iter()
                .any(|installation| installation.matches_alias(alias))
            {
                return Err(not_registered(alias));
            }
            for installation in &mut file.installations {
                installation.active = installation.matches_alias(alias);
            }
            debug!("Marked '{alias}' active");
            Ok(())
        })
    }

    fn rename(&self, alias: &str, new_alias: &str, new_path: PathBuf) -> Result<(), PipelineError> {
        self.update(|file| {
            let conflict = file.installations.iter().any(|installation| {
                installation.matches_alias(new_alias) && !installation.matches_alias(alias)
            });
            if conflict {
                return Err(PipelineError::new(
                    ErrorKind::AlreadyInstalled,
                    format!("'{new_alias}' is already registered"),
                ));
            }
            let installation = file
                .installations
                .iter_mut()
                .find(|installation| installation.matches_alias(alias))
                .ok_or_else(|| not_registered(alias))?;
            installation.alias = new_alias.to_string();
            installation.path = new_path;
            info!("Renamed '{alias}' to '{new_alias}'");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use nodeup_backend::{ErrorKind, Installation, InstallationRegistry, NodeVersion};

    use super::JsonRegistry;

    fn installation(alias: &str, version: NodeVersion) -> Installation {
        Installation {
            alias: alias.to_string(),
            version,
            path: PathBuf::from("/versions").join(alias),
            active: false,
            installed_at: None,
        }
    }

    fn registry() -> (tempfile::TempDir, JsonRegistry) {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let registry = JsonRegistry::new(temp.path().join("installations.json"));
        (temp, registry)
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let (_temp, registry) = registry();

        assert!(registry.list().expect("list should succeed").is_empty());
        assert!(registry.active().expect("active should succeed").is_none());
    }

    #[test]
    fn aliases_are_case_insensitive_and_unique() {
        let (_temp, registry) = registry();
        registry
            .add(installation("Work", NodeVersion::new(20, 11, 0)))
            .expect("add should succeed");

        assert!(registry.contains("work").expect("lookup should succeed"));
        let error = registry
            .add(installation("WORK", NodeVersion::new(18, 19, 0)))
            .expect_err("duplicate alias should fail");
        assert_eq!(error.kind, ErrorKind::AlreadyInstalled);
    }

    #[test]
    fn only_one_installation_is_active() {
        let (_temp, registry) = registry();
        registry
            .add(installation("a", NodeVersion::new(20, 11, 0)))
            .expect("add should succeed");
        registry
            .add(installation("b", NodeVersion::new(18, 19, 0)))
            .expect("add should succeed");

        registry.set_active("a").expect("activate should succeed");
        registry.set_active("B").expect("activate should succeed");

        let active: Vec<String> = registry
            .list()
            .expect("list should succeed")
            .into_iter()
            .filter(|installation| installation.active)
            .map(|installation| installation.alias)
            .collect();
        assert_eq!(active, vec!["b".to_string()]);
        assert!(registry.set_active("missing").is_err());
    }

    #[test]
    fn rename_moves_alias_and_path() {
        let (temp, registry) = registry();
        registry
            .add(installation("old", NodeVersion::new(20, 11, 0)))
            .expect("add should succeed");
        registry
            .add(installation("taken", NodeVersion::new(18, 19, 0)))
            .expect("add should succeed");

        let conflict = registry
            .rename("old", "TAKEN", PathBuf::from("/versions/TAKEN"))
            .expect_err("rename onto existing alias should fail");
        assert_eq!(conflict.kind, ErrorKind::AlreadyInstalled);

        registry
            .rename("old", "new", PathBuf::from("/versions/new"))
            .expect("rename should succeed");

        let reopened = JsonRegistry::new(temp.path().join("installations.json"));
        let renamed = reopened
            .get("new")
            .expect("lookup should succeed")
            .expect("renamed entry should exist");
        assert_eq!(renamed.path, PathBuf::from("/versions/new"));
        assert!(reopened.get("old").expect("lookup should succeed").is_none());
        assert_eq!(
            reopened
                .find_by_version(&NodeVersion::new(20, 11, 0))
                .expect("find should succeed")
                .len(),
            1
        );
    }

    #[test]
    fn remove_returns_removed_entry() {
        let (_temp, registry) = registry();
        registry
            .add(installation("a", NodeVersion::new(20, 11, 0)))
            .expect("add should succeed");

        let removed = registry.remove("A").expect("remove should succeed");

        assert_eq!(removed.map(|entry| entry.alias), Some("a".to_string()));
        assert!(registry.remove("a").expect("remove should succeed").is_none());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let (temp, registry) = registry();
        std::fs::write(temp.path().join("installations.json"), "{oops")
            .expect("corrupt file should be written");

        let error = registry.list().expect_err("corrupt registry should fail");

        assert_eq!(error.kind, ErrorKind::InstallationFailed);
    }
}
