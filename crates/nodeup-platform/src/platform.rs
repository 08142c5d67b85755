use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("Unsupported operating system: {0}")]
    UnsupportedOs(&'static str),
    #[error("Unsupported architecture: {0}")]
    UnsupportedArch(&'static str),
    #[error("No release artifacts exist for {os} on {arch}")]
    UnsupportedCombination { os: Os, arch: Arch },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    #[serde(rename = "darwin")]
    MacOs,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X64,
    Arm64,
    Armv7l,
}

impl Os {
    /// Operating system segment used in artifact file names.
    #[must_use]
    pub fn dist_name(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "darwin",
            Self::Windows => "win",
        }
    }

    fn current() -> Result<Self, PlatformError> {
        match std::env::consts::OS {
            "linux" => Ok(Self::Linux),
            "macos" => Ok(Self::MacOs),
            "windows" => Ok(Self::Windows),
            other => Err(PlatformError::UnsupportedOs(other)),
        }
    }
}

impl Arch {
    #[must_use]
    pub fn dist_name(self) -> &'static str {
        match self {
            Self::X64 => "x64",
            Self::Arm64 => "arm64",
            Self::Armv7l => "armv7l",
        }
    }

    fn current() -> Result<Self, PlatformError> {
        match std::env::consts::ARCH {
            "x86_64" => Ok(Self::X64),
            "aarch64" => Ok(Self::Arm64),
            "arm" => Ok(Self::Armv7l),
            other => Err(PlatformError::UnsupportedArch(other)),
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dist_name())
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dist_name())
    }
}

/// Operating system and architecture pair that selects one release artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    /// Build a platform, rejecting pairs that have no published artifacts.
    ///
    /// # Errors
    /// Returns [`PlatformError::UnsupportedCombination`] for pairs such as
    /// `armv7l` on macOS.
    pub fn new(os: Os, arch: Arch) -> Result<Self, PlatformError> {
        if arch == Arch::Armv7l && os != Os::Linux {
            return Err(PlatformError::UnsupportedCombination { os, arch });
        }
        Ok(Self { os, arch })
    }

    /// Detect the platform this process runs on.
    ///
    /// # Errors
    /// Returns an error when the host OS or CPU architecture has no release
    /// artifacts.
    pub fn current() -> Result<Self, PlatformError> {
        Self::new(Os::current()?, Arch::current()?)
    }

    /// Same OS as the host, with an explicit architecture override.
    ///
    /// # Errors
    /// See [`Platform::current`].
    pub fn current_with_arch(arch: Arch) -> Result<Self, PlatformError> {
        Self::new(Os::current()?, arch)
    }

    /// Tag used in the catalog's per-release `files` list.
    #[must_use]
    pub fn catalog_tag(&self) -> String {
        match self.os {
            Os::Linux => format!("linux-{}", self.arch),
            Os::MacOs => format!("osx-{}-tar", self.arch),
            Os::Windows => format!("win-{}-zip", self.arch),
        }
    }

    #[must_use]
    pub fn archive_extension(&self) -> &'static str {
        match self.os {
            Os::Linux => "tar.xz",
            Os::MacOs => "tar.gz",
            Os::Windows => "zip",
        }
    }

    /// Artifact base name without extension, for example `node-v20.11.0-linux-x64`.
    #[must_use]
    pub fn artifact_stem(&self, prefixed_version: &str) -> String {
        format!("node-{prefixed_version}-{}-{}", self.os, self.arch)
    }

    /// Location of the runtime binary relative to an installation directory.
    #[must_use]
    pub fn binary_relative_path(&self) -> PathBuf {
        match self.os {
            Os::Windows => PathBuf::from("node.exe"),
            Os::Linux | Os::MacOs => PathBuf::from("bin").join("node"),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}
