//! Collaborators backed by the official Node.js distribution site.
//!
//! - [`DistCatalog`]: the `index.json` release list with an on-disk cache.
//! - [`DistLocator`]: artifact and checksum manifest URLs on a mirror.
//! - [`JsonRegistry`]: the local installation registry file.

mod catalog;
pub mod fs;
mod locator;
mod registry;

pub use catalog::{DEFAULT_CACHE_TTL, DistCatalog};
pub use locator::{DEFAULT_MIRROR, DistLocator};
pub use registry::JsonRegistry;
