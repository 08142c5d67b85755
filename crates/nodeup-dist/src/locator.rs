use nodeup_backend::{ArtifactLocation, ArtifactLocator, NodeVersion, RemoteRelease};
use nodeup_platform::Platform;

pub const DEFAULT_MIRROR: &str = "https://nodejs.org/dist";

/// Builds artifact URLs following the layout of the official dist site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistLocator {
    mirror: String,
}

impl Default for DistLocator {
    fn default() -> Self {
        Self::new(DEFAULT_MIRROR)
    }
}

impl DistLocator {
    pub fn new(mirror: impl Into<String>) -> Self {
        let mirror = mirror.into();
        Self {
            mirror: mirror.trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn mirror(&self) -> &str {
        &self.mirror
    }
}

impl ArtifactLocator for DistLocator {
    fn locate(&self, version: &NodeVersion, platform: &Platform) -> ArtifactLocation {
        let prefixed = version.prefixed();
        let file_name = format!(
            "{}.{}",
            platform.artifact_stem(&prefixed),
            platform.archive_extension()
        );
        ArtifactLocation {
            url: format!("{}/{prefixed}/{file_name}", self.mirror),
            checksum_url: format!("{}/{prefixed}/SHASUMS256.txt", self.mirror),
            file_name,
        }
    }

    fn is_available(&self, release: &RemoteRelease, platform: &Platform) -> bool {
        let tag = platform.catalog_tag();
        release.files.iter().any(|file| *file == tag)
    }
}

#[cfg(test)]
mod tests {
    use nodeup_backend::{ArtifactLocator, NodeVersion, RemoteRelease};
    use nodeup_platform::{Arch, Os, Platform};

    use super::DistLocator;

    fn platform(os: Os, arch: Arch) -> Platform {
        Platform::new(os, arch).expect("platform should be valid")
    }

    #[test]
    fn locates_artifacts_per_platform() {
        let locator = DistLocator::new("https://nodejs.org/dist/");
        let version = NodeVersion::new(20, 11, 0);

        let linux = locator.locate(&version, &platform(Os::Linux, Arch::X64));
        assert_eq!(
            linux.url,
            "https://nodejs.org/dist/v20.11.0/node-v20.11.0-linux-x64.tar.xz"
        );
        assert_eq!(
            linux.checksum_url,
            "https://nodejs.org/dist/v20.11.0/SHASUMS256.txt"
        );
        assert_eq!(linux.file_name, "node-v20.11.0-linux-x64.tar.xz");

        let mac = locator.locate(&version, &platform(Os::MacOs, Arch::Arm64));
        assert_eq!(mac.file_name, "node-v20.11.0-darwin-arm64.tar.gz");

        let windows = locator.locate(&version, &platform(Os::Windows, Arch::X64));
        assert_eq!(windows.file_name, "node-v20.11.0-win-x64.zip");
    }

    #[test]
    fn availability_uses_catalog_file_tags() {
        let locator = DistLocator::default();
        let release = RemoteRelease {
            version: NodeVersion::new(20, 11, 0),
            lts: Some("Iron".to_string()),
            date: "2024-01-09".to_string(),
            files: vec![
                "linux-x64".to_string(),
                "osx-arm64-tar".to_string(),
                "win-x64-zip".to_string(),
            ],
        };

        assert!(locator.is_available(&release, &platform(Os::Linux, Arch::X64)));
        assert!(locator.is_available(&release, &platform(Os::MacOs, Arch::Arm64)));
        assert!(locator.is_available(&release, &platform(Os::Windows, Arch::X64)));
        assert!(!locator.is_available(&release, &platform(Os::Linux, Arch::Armv7l)));
        assert!(!locator.is_available(&release, &platform(Os::MacOs, Arch::X64)));
    }
}
