mod error;
mod traits;
mod types;

pub use error::{ErrorKind, PipelineError};
pub use traits::{ArtifactLocation, ArtifactLocator, InstallationRegistry, ReleaseCatalog};
pub use types::{Installation, NodeVersion, RemoteRelease, VersionParseError};
