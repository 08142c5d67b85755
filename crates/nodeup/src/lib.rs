//! Library façade over the install pipeline.
//!
//! Front ends load [`Settings`], call [`logging::init_logging`], then drive
//! every operation through [`App`], which serialises state changes across
//! processes with the `"state"` lock.

mod app;
pub mod logging;
mod settings;

pub use app::{App, MaintenanceReport};
pub use settings::{Settings, SettingsError};

pub use nodeup_backend::{ErrorKind, Installation, NodeVersion, PipelineError};
pub use nodeup_core::{DownloadProgress, InstallRequest, ProgressSink};
pub use nodeup_platform::{Arch, Os, Paths, Platform};
