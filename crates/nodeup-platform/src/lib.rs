mod paths;
mod platform;

pub use paths::{AppPathsError, Paths};
pub use platform::{Arch, Os, Platform, PlatformError};
