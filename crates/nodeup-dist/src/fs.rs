//! Crash-safe file replacement for the registry and catalog cache.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

const MAX_TEMP_ATTEMPTS: u8 = 16;

/// Serialize `value` as pretty JSON and write it atomically.
///
/// # Errors
/// Returns an error if serialization or any filesystem step fails.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    write_atomic(path, &data)
}

/// Write `data` to a sibling temp file, sync it, then rename it over `path`.
///
/// Readers see either the old contents or the new ones, never a mix. The
/// parent directory is created if missing.
///
/// # Errors
/// Returns an error if the temp file cannot be created or the rename fails.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = create_sibling_temp(parent, path)?;
    let written = file.write_all(data).and_then(|()| file.sync_all());
    drop(file);

    if let Err(error) = written.and_then(|()| replace_file(&tmp_path, path)) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error);
    }
    Ok(())
}

fn create_sibling_temp(parent: &Path, target: &Path) -> io::Result<(PathBuf, std::fs::File)> {
    let stem = target
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("state");
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    let pid = std::process::id();

    for attempt in 0..MAX_TEMP_ATTEMPTS {
        let candidate = parent.join(format!(".{stem}.{pid}.{nanos}.{attempt}.tmp"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => return Ok((candidate, file)),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free temp file name next to {}", target.display()),
    ))
}

#[cfg(windows)]
fn replace_file(src: &Path, dst: &Path) -> io::Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::{
        MOVEFILE_REPLACE_EXISTING, MOVEFILE_WRITE_THROUGH, MoveFileExW,
    };

    let wide = |path: &Path| -> Vec<u16> {
        path.as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    };
    let src_wide = wide(src);
    let dst_wide = wide(dst);

    // SAFETY: both buffers are NUL-terminated and outlive the call.
    let moved = unsafe {
        MoveFileExW(
            src_wide.as_ptr(),
            dst_wide.as_ptr(),
            MOVEFILE_REPLACE_EXISTING | MOVEFILE_WRITE_THROUGH,
        )
    };
    if moved == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(windows))]
fn replace_file(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::rename(src, dst)
}
