use std::sync::Arc;

use log::debug;
use nodeup_backend::{
    ErrorKind, Installation, InstallationRegistry, NodeVersion, PipelineError, ReleaseCatalog,
    RemoteRelease,
};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

const ACCEPTED_FORMS: &str = "expected an exact version (20.11.0), a major version (20), \
     an installed alias, 'lts', 'lts/<codename>', 'latest', 'current' or an LTS codename";

/// A version expression after classification.
///
/// Classification order is significant: an exact version wins over an alias of
/// the same spelling, and an alias wins over every keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRequest {
    Exact(NodeVersion),
    InstalledAlias(Installation),
    Major(String),
    /// `lts`, `lts/*` or `lts/<codename>`.
    Lts(Option<String>),
    Latest,
    Codename(String),
}

/// True when `input` is a complete `major.minor.patch` version, optionally
/// prefixed with `v`. Never touches the network.
#[must_use]
pub fn is_exact_version(input: &str) -> bool {
    let candidate = strip_version_prefix(input.trim());
    let all_numeric = candidate
        .split('.')
        .all(|part| !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_digit()));
    all_numeric
        && semver::Version::parse(candidate)
            .is_ok_and(|version| version.pre.is_empty() && version.build.is_empty())
}

fn strip_version_prefix(input: &str) -> &str {
    match input.strip_prefix(['v', 'V']) {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
        _ => input,
    }
}

fn is_alphabetic_word(input: &str) -> bool {
    !input.is_empty() && input.chars().all(|c| c.is_ascii_alphabetic())
}

fn series_not_found(detail: String) -> PipelineError {
    PipelineError::new(ErrorKind::ArtifactSeriesNotFound, detail)
}

/// Classify `input`, consulting the registry only for alias lookups.
///
/// # Errors
/// Returns `InvalidVersionFormat` when no form matches, or a registry error.
pub fn classify(
    input: &str,
    registry: &dyn InstallationRegistry,
) -> Result<VersionRequest, PipelineError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::new(
            ErrorKind::InvalidVersionFormat,
            format!("empty version expression; {ACCEPTED_FORMS}"),
        ));
    }

    if is_exact_version(trimmed) {
        let version: NodeVersion = strip_version_prefix(trimmed).parse()?;
        return Ok(VersionRequest::Exact(version));
    }

    if let Some(installation) = registry.get(trimmed)? {
        return Ok(VersionRequest::InstalledAlias(installation));
    }

    let normalized = strip_version_prefix(trimmed);
    if normalized.bytes().all(|byte| byte.is_ascii_digit()) {
        return Ok(VersionRequest::Major(normalized.to_string()));
    }

    let lowered = normalized.to_ascii_lowercase();
    match lowered.as_str() {
        "lts" | "lts/*" => return Ok(VersionRequest::Lts(None)),
        "latest" | "current" | "stable" => return Ok(VersionRequest::Latest),
        _ => {}
    }
    if let Some(codename) = lowered.strip_prefix("lts/")
        && is_alphabetic_word(codename)
    {
        return Ok(VersionRequest::Lts(Some(codename.to_string())));
    }
    if is_alphabetic_word(&lowered) {
        return Ok(VersionRequest::Codename(lowered));
    }

    Err(PipelineError::new(
        ErrorKind::InvalidVersionFormat,
        format!("'{trimmed}' is not a recognised version expression; {ACCEPTED_FORMS}"),
    ))
}

/// Catalog fetched at most once per resolution, sorted newest first.
pub(crate) struct CatalogMemo<'a> {
    catalog: &'a dyn ReleaseCatalog,
    releases: OnceCell<Vec<RemoteRelease>>,
}

impl<'a> CatalogMemo<'a> {
    pub(crate) fn new(catalog: &'a dyn ReleaseCatalog) -> Self {
        Self {
            catalog,
            releases: OnceCell::new(),
        }
    }

    pub(crate) async fn get(&self, cancel: &CancellationToken) -> Result<&[RemoteRelease], PipelineError> {
        let releases = self
            .releases
            .get_or_try_init(|| async {
                let mut releases = tokio::select! {
                    () = cancel.cancelled() => return Err(PipelineError::cancelled("version resolution")),
                    releases = self.catalog.releases() => releases?,
                };
                releases.sort_by(|a, b| b.version.cmp(&a.version));
                Ok::<_, PipelineError>(releases)
            })
            .await?;
        Ok(releases.as_slice())
    }
}

/// Turns version expressions into concrete releases.
#[derive(Clone)]
pub struct VersionResolver {
    catalog: Arc<dyn ReleaseCatalog>,
    registry: Arc<dyn InstallationRegistry>,
}

impl VersionResolver {
    pub fn new(catalog: Arc<dyn ReleaseCatalog>, registry: Arc<dyn InstallationRegistry>) -> Self {
        Self { catalog, registry }
    }

    /// Resolve `input` to a concrete version.
    ///
    /// # Errors
    /// Returns `InvalidVersionFormat` for unrecognised input,
    /// `ArtifactSeriesNotFound` when nothing in the catalog matches, `Cancelled`,
    /// or the catalog's own error.
    pub async fn resolve(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<NodeVersion, PipelineError> {
        let memo = self.memo();
        self.resolve_with(&memo, input, cancel).await
    }

    pub(crate) fn memo(&self) -> CatalogMemo<'_> {
        CatalogMemo::new(self.catalog.as_ref())
    }

    /// [`Self::resolve`] against a caller-owned memo, so later lookups in the
    /// same operation reuse the fetched catalog.
    pub(crate) async fn resolve_with(
        &self,
        memo: &CatalogMemo<'_>,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<NodeVersion, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled("version resolution"));
        }

        let request = classify(input, self.registry.as_ref())?;
        debug!("Resolving '{}' as {request:?}", input.trim());

        let version = match request {
            VersionRequest::Exact(version) => version,
            VersionRequest::InstalledAlias(installation) => installation.version,
            VersionRequest::Major(major) => {
                let releases = memo.get(cancel).await?;
                let wanted = major.parse::<u32>().ok();
                releases
                    .iter()
                    .find(|release| Some(release.version.major) == wanted)
                    .map(|release| release.version)
                    .ok_or_else(|| series_not_found(format!("no release in the {major}.x series")))?
            }
            VersionRequest::Lts(codename) => {
                let releases = memo.get(cancel).await?;
                let found = match codename.as_deref() {
                    None => releases.iter().find(|release| release.is_lts()),
                    Some(codename) => releases
                        .iter()
                        .find(|release| release.has_codename(codename)),
                };
                found.map(|release| release.version).ok_or_else(|| {
                    series_not_found(match codename {
                        None => "the catalog lists no LTS release".to_string(),
                        Some(codename) => format!("no LTS line named '{codename}'"),
                    })
                })?
            }
            VersionRequest::Latest => {
                let releases = memo.get(cancel).await?;
                releases
                    .first()
                    .map(|release| release.version)
                    .ok_or_else(|| series_not_found("the catalog is empty".to_string()))?
            }
            VersionRequest::Codename(codename) => {
                let releases = memo.get(cancel).await?;
                releases
                    .iter()
                    .find(|release| release.has_codename(&codename))
                    .map(|release| release.version)
                    .ok_or_else(|| series_not_found(format!("no LTS line named '{codename}'")))?
            }
        };

        debug!("Resolved '{}' to {version}", input.trim());
        Ok(version)
    }

    /// Find the catalog entry for an already resolved version.
    ///
    /// # Errors
    /// Returns `ArtifactNotAvailable` when the catalog does not list it.
    pub async fn release_for(
        &self,
        version: &NodeVersion,
        cancel: &CancellationToken,
    ) -> Result<RemoteRelease, PipelineError> {
        let memo = self.memo();
        self.release_with(&memo, version, cancel).await
    }

    pub(crate) async fn release_with(
        &self,
        memo: &CatalogMemo<'_>,
        version: &NodeVersion,
        cancel: &CancellationToken,
    ) -> Result<RemoteRelease, PipelineError> {
        memo.get(cancel)
            .await?
            .iter()
            .find(|release| release.version == *version)
            .cloned()
            .ok_or_else(|| {
                PipelineError::new(
                    ErrorKind::ArtifactNotAvailable,
                    format!("{} is not listed in the release catalog", version.prefixed()),
                )
            })
    }
}
