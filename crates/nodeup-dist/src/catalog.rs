use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use nodeup_backend::{ErrorKind, PipelineError, ReleaseCatalog, RemoteRelease};
use nodeup_core::{HttpSource, read_to_string};
use serde::{Deserialize, Serialize};

use crate::fs::write_json_atomic;
use crate::locator::DEFAULT_MIRROR;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize)]
struct CatalogCache {
    mirror: String,
    cached_at: DateTime<Utc>,
    releases: Vec<RemoteRelease>,
}

impl CatalogCache {
    fn load(path: &Path) -> Option<Self> {
        let data = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(cache) => Some(cache),
            Err(error) => {
                warn!("Ignoring unreadable catalog cache {}: {error}", path.display());
                None
            }
        }
    }

    fn save(&self, path: &Path) {
        if let Err(error) = write_json_atomic(path, self) {
            warn!("Failed to write catalog cache {}: {error}", path.display());
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        (Utc::now() - self.cached_at)
            .to_std()
            .is_ok_and(|age| age < ttl)
    }
}

/// Parse `index.json`, skipping entries that do not describe a release.
fn parse_index(body: &str) -> Result<Vec<RemoteRelease>, serde_json::Error> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(body)?;
    let total = entries.len();
    let releases: Vec<RemoteRelease> = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect();
    if releases.len() < total {
        debug!(
            "Skipped {} unparseable catalog entries",
            total - releases.len()
        );
    }
    Ok(releases)
}

/// Release list from `<mirror>/index.json`, cached on disk.
pub struct DistCatalog {
    source: Arc<dyn HttpSource>,
    mirror: String,
    cache_file: PathBuf,
    ttl: Duration,
}

impl DistCatalog {
    pub fn new(source: Arc<dyn HttpSource>, cache_file: impl Into<PathBuf>) -> Self {
        Self {
            source,
            mirror: DEFAULT_MIRROR.to_string(),
            cache_file: cache_file.into(),
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    #[must_use]
    pub fn with_mirror(mut self, mirror: impl Into<String>) -> Self {
        self.mirror = mirror.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn index_url(&self) -> String {
        format!("{}/index.json", self.mirror)
    }

    async fn fetch(&self) -> Result<Vec<RemoteRelease>, PipelineError> {
        let url = self.index_url();
        let body = read_to_string(self.source.as_ref(), &url, FETCH_TIMEOUT)
            .await
            .map_err(|error| PipelineError::new(ErrorKind::RemoteApiFailed, error.to_string()))?;
        let mut releases = parse_index(&body).map_err(|error| {
            PipelineError::new(
                ErrorKind::RemoteApiFailed,
                format!("invalid release catalog from {url}: {error}"),
            )
        })?;
        releases.sort_by(|a, b| b.version.cmp(&a.version));
        info!("Fetched {} releases from {url}", releases.len());
        Ok(releases)
    }

    /// Drop the on-disk cache so the next call fetches.
    pub fn invalidate(&self) {
        match std::fs::remove_file(&self.cache_file) {
            Ok(()) => debug!("Removed catalog cache"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!("Failed to remove catalog cache: {error}"),
        }
    }
}

#[async_trait]
impl ReleaseCatalog for DistCatalog {
    async fn releases(&self) -> Result<Vec<RemoteRelease>, PipelineError> {
        let cached = CatalogCache::load(&self.cache_file).filter(|cache| cache.mirror == self.mirror);
        if let Some(cache) = &cached
            && cache.is_fresh(self.ttl)
        {
            debug!("Using cached catalog from {}", cache.cached_at);
            return Ok(cache.releases.clone());
        }

        match self.fetch().await {
            Ok(releases) => {
                CatalogCache {
                    mirror: self.mirror.clone(),
                    cached_at: Utc::now(),
                    releases: releases.clone(),
                }
                .save(&self.cache_file);
                Ok(releases)
            }
            Err(error) => match cached {
                Some(cache) => {
                    warn!(
                        "Catalog refresh failed, using cache from {}: {error}",
                        cache.cached_at
                    );
                    Ok(cache.releases)
                }
                None => Err(error),
            },
        }
    }

    async fn ping(&self, timeout: Duration) -> Result<(), PipelineError> {
        let url = self.index_url();
        self.source
            .open(&url, timeout)
            .await
            .map(drop)
            .map_err(|error| {
                PipelineError::new(
                    ErrorKind::RemoteApiFailed,
                    format!("release catalog unreachable: {error}"),
                )
            })
    }
}
