//! Named cross-process locks backed by advisory file locks.
//!
//! The exclusive claim lives on the open file descriptor, so a process that
//! dies without releasing still frees the lock. Marker files only carry
//! diagnostic metadata.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use fs2::FileExt;
use log::{debug, info, warn};
use nodeup_backend::{ErrorKind, PipelineError};
use thiserror::Error;

/// Resource guarding every state-mutating operation.
pub const STATE_LOCK: &str = "state";

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MARKER_EXTENSION: &str = "lock";
const RELINK_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock '{name}'")]
    Timeout { name: String, waited: Duration },
    #[error("invalid lock name '{0}'")]
    InvalidName(String),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

impl From<LockError> for PipelineError {
    fn from(error: LockError) -> Self {
        let kind = match &error {
            LockError::Timeout { .. } => ErrorKind::LockTimeout,
            LockError::Io { source, .. }
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                ErrorKind::InsufficientPermissions
            }
            LockError::InvalidName(_) | LockError::Io { .. } => ErrorKind::InstallationFailed,
        };
        PipelineError::new(kind, error.to_string())
    }
}

fn is_contended(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Whether `file` is still the inode reachable at `path`.
///
/// A releasing holder unlinks its marker before unlocking, so a waiter can end
/// up holding a lock on an orphaned inode.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// Exclusive ownership of a named resource. Dropping the handle releases it.
#[derive(Debug)]
pub struct LockHandle {
    name: String,
    path: PathBuf,
    file: Option<File>,
}

impl LockHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.file.is_none()
    }

    /// Release the lock. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };

        if let Err(error) = std::fs::remove_file(&self.path) {
            warn!(
                "Failed to remove lock marker {}: {error}",
                self.path.display()
            );
        }
        if let Err(error) = FileExt::unlock(&file) {
            debug!("Explicit unlock of '{}' failed: {error}", self.name);
        }
        debug!("Released lock '{}'", self.name);
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker_path(&self, name: &str) -> Result<PathBuf, LockError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        if !valid {
            return Err(LockError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.{MARKER_EXTENSION}")))
    }

    /// Make a single non-blocking attempt to take `name`.
    ///
    /// # Errors
    /// Returns an error for invalid names or when the marker file cannot be
    /// opened. Contention is `Ok(None)`.
    pub fn try_acquire(&self, name: &str) -> Result<Option<LockHandle>, LockError> {
        let path = self.marker_path(name)?;
        std::fs::create_dir_all(&self.dir)
            .map_err(|error| LockError::io("failed to create lock directory", error))?;

        for _ in 0..RELINK_ATTEMPTS {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|error| LockError::io("failed to open lock marker", error))?;

            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(error) if is_contended(&error) => return Ok(None),
                Err(error) => return Err(LockError::io("failed to lock marker", error)),
            }

            if !still_linked(&file, &path) {
                debug!("Lock marker for '{name}' was replaced while locking, retrying");
                continue;
            }

            write_metadata(&mut file)
                .map_err(|error| LockError::io("failed to write lock metadata", error))?;
            debug!("Acquired lock '{name}'");
            return Ok(Some(LockHandle {
                name: name.to_string(),
                path,
                file: Some(file),
            }));
        }

        Ok(None)
    }

    /// Take `name`, retrying every 100ms until `timeout` elapses.
    ///
    /// A zero timeout makes exactly one attempt.
    ///
    /// # Errors
    /// Returns [`LockError::Timeout`] when the lock stays held for the whole
    /// timeout, or an I/O error from the marker file.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            if let Some(handle) = self.try_acquire(name)? {
                return Ok(handle);
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    waited: timeout,
                });
            }
            if !announced {
                info!("Waiting for lock '{name}' held by another process");
                announced = true;
            }
            tokio::time::sleep(RETRY_INTERVAL.min(timeout - waited)).await;
        }
    }

    /// Whether a live holder currently owns `name`.
    ///
    /// # Errors
    /// Returns an error when the marker exists but cannot be inspected.
    pub fn is_held(&self, name: &str) -> Result<bool, LockError> {
        let path = self.marker_path(name)?;
        probe_held(&path)
    }

    /// Delete markers older than `max_age` whose holder is gone.
    ///
    /// Returns the number of markers removed. Markers still locked by a live
    /// process are left alone.
    ///
    /// # Errors
    /// Returns an error when the lock directory cannot be read.
    pub fn release_stale(&self, max_age: Duration) -> Result<usize, LockError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(LockError::io("failed to read lock directory", error)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(MARKER_EXTENSION) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            if release_if_abandoned(&path) {
                info!("Removed stale lock marker {}", path.display());
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn write_metadata(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "pid={}", std::process::id())?;
    writeln!(file, "acquired_at={}", chrono::Utc::now().to_rfc3339())?;
    file.flush()
}

fn probe_held(path: &Path) -> Result<bool, LockError> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(error) => return Err(LockError::io("failed to open lock marker", error)),
    };

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(false)
        }
        Err(error) if is_contended(&error) => Ok(true),
        Err(error) => Err(LockError::io("failed to probe lock marker", error)),
    }
}

fn release_if_abandoned(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    if file.try_lock_exclusive().is_err() {
        return false;
    }
    let removed = std::fs::remove_file(path).is_ok();
    let _ = FileExt::unlock(&file);
    removed
}
