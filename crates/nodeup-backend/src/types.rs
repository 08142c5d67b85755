use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A concrete `major.minor.patch` release version.
///
/// Displays without the `v` prefix; use [`NodeVersion::prefixed`] for the
/// form used in artifact names and URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl NodeVersion {
    #[must_use]
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    #[must_use]
    pub fn prefixed(&self) -> String {
        format!("v{self}")
    }
}

impl Ord for NodeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
    }
}

impl PartialOrd for NodeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionComponent {
    Major,
    Minor,
    Patch,
}

impl fmt::Display for VersionComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Major => write!(f, "major"),
            Self::Minor => write!(f, "minor"),
            Self::Patch => write!(f, "patch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    #[error("Expected X.Y.Z format, got: {input}")]
    InvalidFormat { input: String },
    #[error("Invalid {component} version: {value}")]
    InvalidComponent {
        component: VersionComponent,
        value: String,
    },
}

fn parse_component(value: &str, component: VersionComponent) -> Result<u32, VersionParseError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VersionParseError::InvalidComponent {
            component,
            value: value.to_string(),
        });
    }
    value
        .parse()
        .map_err(|_| VersionParseError::InvalidComponent {
            component,
            value: value.to_string(),
        })
}

impl FromStr for NodeVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let s = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let parts: Vec<&str> = s.split('.').collect();
        let [major, minor, patch] = parts.as_slice() else {
            return Err(VersionParseError::InvalidFormat {
                input: s.to_string(),
            });
        };

        Ok(NodeVersion::new(
            parse_component(major, VersionComponent::Major)?,
            parse_component(minor, VersionComponent::Minor)?,
            parse_component(patch, VersionComponent::Patch)?,
        ))
    }
}

impl TryFrom<String> for NodeVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeVersion> for String {
    fn from(version: NodeVersion) -> Self {
        version.to_string()
    }
}

/// One entry of the remote release catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRelease {
    pub version: NodeVersion,
    /// LTS codename; the catalog encodes "not LTS" as `false`.
    #[serde(default, deserialize_with = "deserialize_lts")]
    pub lts: Option<String>,
    #[serde(default)]
    pub date: String,
    /// Platform-arch tags for which artifacts were published.
    #[serde(default)]
    pub files: Vec<String>,
}

impl RemoteRelease {
    #[must_use]
    pub fn is_lts(&self) -> bool {
        self.lts.is_some()
    }

    #[must_use]
    pub fn has_codename(&self, codename: &str) -> bool {
        self.lts
            .as_deref()
            .is_some_and(|lts| lts.eq_ignore_ascii_case(codename))
    }
}

fn deserialize_lts<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LtsMarker {
        Codename(String),
        Flag(bool),
    }

    Ok(match Option::<LtsMarker>::deserialize(deserializer)? {
        Some(LtsMarker::Codename(codename)) if !codename.is_empty() => Some(codename),
        _ => None,
    })
}

/// A registered runtime copy on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub alias: String,
    pub version: NodeVersion,
    pub path: PathBuf,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub installed_at: Option<DateTime<Utc>>,
}

impl Installation {
    #[must_use]
    pub fn matches_alias(&self, alias: &str) -> bool {
        self.alias.to_lowercase() == alias.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_with_v_prefix() {
        let v: NodeVersion = "v20.11.0".parse().unwrap();
        assert_eq!(v, NodeVersion::new(20, 11, 0));
    }

    #[test]
    fn test_parse_version_with_whitespace() {
        let v: NodeVersion = "  v20.11.0  ".parse().unwrap();
        assert_eq!(v.major, 20);
    }

    #[test]
    fn test_parse_version_rejects_partial_and_signed() {
        assert!("v20.11".parse::<NodeVersion>().is_err());
        assert!("20.11.0.1".parse::<NodeVersion>().is_err());
        assert!("+20.11.0".parse::<NodeVersion>().is_err());
        assert!(matches!(
            "vXX.11.0".parse::<NodeVersion>(),
            Err(VersionParseError::InvalidComponent {
                component: VersionComponent::Major,
                ..
            })
        ));
    }

    #[test]
    fn test_version_display_and_prefix() {
        let v = NodeVersion::new(20, 11, 0);
        assert_eq!(v.to_string(), "20.11.0");
        assert_eq!(v.prefixed(), "v20.11.0");
    }

    #[test]
    fn test_version_ordering() {
        let v1: NodeVersion = "v20.10.0".parse().unwrap();
        let v2: NodeVersion = "v20.11.0".parse().unwrap();
        let v3: NodeVersion = "v18.19.1".parse().unwrap();
        assert!(v2 > v1);
        assert!(v1 > v3);
    }

    #[test]
    fn remote_release_parses_catalog_lts_encoding() {
        let releases: Vec<RemoteRelease> = serde_json::from_str(
            r#"[
                {"version":"v21.6.0","date":"2024-01-14","files":["linux-x64"],"lts":false},
                {"version":"v20.11.0","date":"2024-01-09","files":["linux-x64","osx-arm64-tar"],"lts":"Iron","security":false}
            ]"#,
        )
        .expect("catalog fixture should deserialize");

        assert_eq!(releases[0].lts, None);
        assert_eq!(releases[1].lts.as_deref(), Some("Iron"));
        assert!(releases[1].has_codename("iron"));
        assert_eq!(releases[1].version, NodeVersion::new(20, 11, 0));
    }

    #[test]
    fn installation_serializes_version_as_string() {
        let installation = Installation {
            alias: "work".to_string(),
            version: NodeVersion::new(20, 11, 0),
            path: PathBuf::from("/tmp/work"),
            active: false,
            installed_at: None,
        };

        let json = serde_json::to_value(&installation).expect("installation should serialize");
        assert_eq!(json["version"], "20.11.0");
        assert!(installation.matches_alias("WORK"));
    }

    #[test]
    fn alias_matching_folds_non_ascii_case() {
        let installation = Installation {
            alias: "Über".to_string(),
            version: NodeVersion::new(20, 11, 0),
            path: PathBuf::from("/tmp/uber"),
            active: false,
            installed_at: None,
        };

        assert!(installation.matches_alias("über"));
        assert!(installation.matches_alias("ÜBER"));
        assert!(!installation.matches_alias("uber"));
    }
}
