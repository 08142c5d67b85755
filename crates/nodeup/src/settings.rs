use std::path::Path;
use std::time::Duration;

use log::warn;
use nodeup_core::{PreflightConfig, RetryPolicy};
use nodeup_dist::DEFAULT_MIRROR;
use nodeup_platform::Arch;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub node_dist_mirror: Option<String>,

    /// Install artifacts for this architecture instead of the host's.
    #[serde(default)]
    pub arch: Option<Arch>,

    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_preflight_timeout")]
    pub preflight_timeout_secs: u64,

    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    #[serde(default = "default_stale_lock")]
    pub stale_lock_secs: u64,

    #[serde(default = "default_catalog_cache_ttl")]
    pub catalog_cache_ttl_hours: u64,

    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_disk_space_multiplier")]
    pub disk_space_multiplier: u64,

    #[serde(default = "default_estimated_install_bytes")]
    pub estimated_install_bytes: u64,

    #[serde(default = "default_true")]
    pub preserve_permissions: bool,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_true() -> bool {
    true
}

fn default_download_timeout() -> u64 {
    300
}

fn default_preflight_timeout() -> u64 {
    10
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_stale_lock() -> u64 {
    60 * 60
}

fn default_catalog_cache_ttl() -> u64 {
    1
}

fn default_download_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_disk_space_multiplier() -> u64 {
    3
}

fn default_estimated_install_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_dist_mirror: None,
            arch: None,
            download_timeout_secs: default_download_timeout(),
            preflight_timeout_secs: default_preflight_timeout(),
            lock_timeout_secs: default_lock_timeout(),
            stale_lock_secs: default_stale_lock(),
            catalog_cache_ttl_hours: default_catalog_cache_ttl(),
            download_attempts: default_download_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            disk_space_multiplier: default_disk_space_multiplier(),
            estimated_install_bytes: default_estimated_install_bytes(),
            preserve_permissions: true,
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl Settings {
    /// Read settings, falling back to defaults when the file is missing or
    /// cannot be parsed.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(error) => {
                warn!("Failed to read {}: {error}", path.display());
                return Self::default();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|error| {
            warn!("Ignoring invalid settings in {}: {error}", path.display());
            Self::default()
        })
    }

    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        nodeup_dist::fs::write_json_atomic(path, self).map_err(|source| SettingsError::Io {
            context: format!("failed to write {}", path.display()),
            source,
        })
    }

    #[must_use]
    pub fn mirror(&self) -> &str {
        self.node_dist_mirror
            .as_deref()
            .map(str::trim)
            .filter(|mirror| !mirror.is_empty())
            .unwrap_or(DEFAULT_MIRROR)
    }

    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    #[must_use]
    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    #[must_use]
    pub fn catalog_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_cache_ttl_hours.saturating_mul(60 * 60))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.download_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    #[must_use]
    pub fn preflight_config(&self) -> PreflightConfig {
        PreflightConfig {
            estimated_install_bytes: self.estimated_install_bytes,
            disk_space_multiplier: self.disk_space_multiplier,
            timeout: Duration::from_secs(self.preflight_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nodeup_platform::Arch;
    use serde_json::json;

    use super::Settings;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();

        assert_eq!(settings.download_timeout(), Duration::from_secs(300));
        assert_eq!(settings.preflight_config().timeout, Duration::from_secs(10));
        assert_eq!(settings.lock_timeout(), Duration::from_secs(30));
        assert_eq!(settings.stale_lock_age(), Duration::from_secs(3600));
        assert_eq!(settings.catalog_cache_ttl(), Duration::from_secs(3600));
        assert_eq!(settings.retry_policy().max_attempts, 3);
        assert_eq!(
            settings.preflight_config().required_bytes(),
            300 * 1024 * 1024
        );
        assert!(settings.preserve_permissions);
        assert_eq!(settings.mirror(), "https://nodejs.org/dist");
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let settings: Settings = serde_json::from_value(json!({
            "node_dist_mirror": "https://npmmirror.com/mirrors/node",
            "arch": "arm64",
            "lock_timeout_secs": 0
        }))
        .expect("settings JSON should deserialize");

        assert_eq!(settings.mirror(), "https://npmmirror.com/mirrors/node");
        assert_eq!(settings.arch, Some(Arch::Arm64));
        assert_eq!(settings.lock_timeout(), Duration::ZERO);
        assert_eq!(settings.download_attempts, 3);
        assert!(settings.preserve_permissions);
    }

    #[test]
    fn blank_mirror_falls_back_to_default() {
        let settings = Settings {
            node_dist_mirror: Some("  ".to_string()),
            ..Settings::default()
        };

        assert_eq!(settings.mirror(), "https://nodejs.org/dist");
    }

    #[test]
    fn save_then_load_preserves_values() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("config/settings.json");
        let settings = Settings {
            download_attempts: 5,
            debug_logging: true,
            ..Settings::default()
        };

        settings.save(&path).expect("settings should save");

        assert_eq!(Settings::load(&path), settings);
    }

    #[test]
    fn invalid_file_loads_defaults() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "{not json").expect("file should be written");

        assert_eq!(Settings::load(&path), Settings::default());
        assert_eq!(
            Settings::load(&temp.path().join("missing.json")),
            Settings::default()
        );
    }
}
