//! Archive extraction for release artifacts.
//!
//! Zip archives are unpacked in-process. Compressed tarballs are handed to the
//! system `tar`, after their listing has been checked for unsafe paths.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use log::{debug, info, warn};
use nodeup_backend::{ErrorKind, PipelineError};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarXz,
}

impl ArchiveFormat {
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.xz") {
            Some(Self::TarXz)
        } else {
            None
        }
    }

    fn tar_codec_flag(self) -> Option<&'static str> {
        match self {
            Self::Zip => None,
            Self::TarGz => Some("-z"),
            Self::TarXz => Some("-J"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub destination: PathBuf,
    pub entry_count: usize,
}

#[must_use]
pub fn is_valid_archive(path: &Path) -> bool {
    ArchiveFormat::from_path(path).is_some()
}

fn corrupted(detail: impl Into<String>) -> PipelineError {
    PipelineError::new(ErrorKind::CorruptedArchive, detail)
}

fn traversal(entry: &str) -> PipelineError {
    PipelineError::new(
        ErrorKind::PathTraversalDetected,
        format!("archive entry '{entry}' resolves outside the destination"),
    )
}

/// Resolve an archive entry name below `root`, or `None` if it would escape.
fn resolve_within(root: &Path, entry: &str) -> Option<PathBuf> {
    let normalized = entry.replace('\\', "/");
    let mut resolved = root.to_path_buf();
    let mut depth = 0_usize;

    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(resolved)
}

fn detect_format(path: &Path) -> Result<ArchiveFormat, PipelineError> {
    ArchiveFormat::from_path(path)
        .ok_or_else(|| corrupted(format!("unsupported archive format: {}", path.display())))
}

fn ensure_source_exists(path: &Path) -> Result<(), PipelineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(corrupted(format!("archive not found: {}", path.display())))
    }
}

/// List the relative entry paths of an archive.
///
/// # Errors
/// Returns `CorruptedArchive` when the archive is missing, unsupported or
/// unreadable.
pub async fn list_contents(path: &Path) -> Result<std::vec::IntoIter<String>, PipelineError> {
    ensure_source_exists(path)?;
    let entries = match detect_format(path)? {
        ArchiveFormat::Zip => {
            let owned = path.to_path_buf();
            tokio::task::spawn_blocking(move || zip_entry_names(&owned))
                .await
                .map_err(|error| corrupted(format!("zip listing task failed: {error}")))??
        }
        format => tar_entry_names(path, format).await?,
    };
    Ok(entries.into_iter())
}

/// Extract `path` into `destination`.
///
/// On failure the destination may hold partial output; callers discard it.
///
/// # Errors
/// Returns `CorruptedArchive`, `PathTraversalDetected` or `Cancelled`.
pub async fn extract(
    path: &Path,
    destination: &Path,
    preserve_permissions: bool,
    cancel: &CancellationToken,
) -> Result<Extraction, PipelineError> {
    ensure_source_exists(path)?;
    let format = detect_format(path)?;
    if cancel.is_cancelled() {
        return Err(PipelineError::cancelled("extraction"));
    }

    info!(
        "Extracting {} into {}",
        path.display(),
        destination.display()
    );
    let entry_count = match format {
        ArchiveFormat::Zip => {
            let archive = path.to_path_buf();
            let dest = destination.to_path_buf();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                extract_zip(&archive, &dest, preserve_permissions, &cancel)
            })
            .await
            .map_err(|error| corrupted(format!("zip extraction task failed: {error}")))??
        }
        format => extract_tar(path, destination, format, preserve_permissions, cancel).await?,
    };

    debug!(
        "Extracted {entry_count} entries to {}",
        destination.display()
    );
    Ok(Extraction {
        destination: destination.to_path_buf(),
        entry_count,
    })
}

fn open_zip(path: &Path) -> Result<zip::ZipArchive<File>, PipelineError> {
    let file = File::open(path)
        .map_err(|error| corrupted(format!("failed to open {}: {error}", path.display())))?;
    zip::ZipArchive::new(file).map_err(|error| corrupted(format!("failed to read zip archive: {error}")))
}

fn zip_entry_names(path: &Path) -> Result<Vec<String>, PipelineError> {
    let mut archive = open_zip(path)?;
    (0..archive.len())
        .map(|index| {
            archive
                .by_index_raw(index)
                .map(|entry| entry.name().to_string())
                .map_err(|error| corrupted(format!("failed to read zip entry: {error}")))
        })
        .collect()
}

fn extract_zip(
    zip_path: &Path,
    dest: &Path,
    preserve_permissions: bool,
    cancel: &CancellationToken,
) -> Result<usize, PipelineError> {
    let mut archive = open_zip(zip_path)?;

    // Every entry is checked before anything is written.
    let mut targets = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|error| corrupted(format!("failed to read zip entry: {error}")))?;
        let name = entry.name().to_string();
        let Some(out_path) = resolve_within(dest, &name) else {
            warn!("Rejecting zip entry with unsafe path: {name}");
            return Err(traversal(&name));
        };
        targets.push(out_path);
    }

    std::fs::create_dir_all(dest).map_err(|error| {
        PipelineError::io(ErrorKind::CorruptedArchive, "failed to create destination", &error)
    })?;

    for (index, out_path) in targets.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled("extraction"));
        }
        let mut entry = archive
            .by_index(index)
            .map_err(|error| corrupted(format!("failed to read zip entry: {error}")))?;

        if entry.is_dir() {
            std::fs::create_dir_all(out_path).map_err(|error| {
                corrupted(format!("failed to create {}: {error}", out_path.display()))
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                corrupted(format!("failed to create {}: {error}", parent.display()))
            })?;
        }
        let mut outfile = File::create(out_path).map_err(|error| {
            corrupted(format!("failed to create {}: {error}", out_path.display()))
        })?;
        std::io::copy(&mut entry, &mut outfile).map_err(|error| {
            corrupted(format!("failed to extract {}: {error}", out_path.display()))
        })?;

        #[cfg(unix)]
        if preserve_permissions && let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(out_path, std::fs::Permissions::from_mode(mode));
        }
        #[cfg(not(unix))]
        let _ = preserve_permissions;
    }

    Ok(targets.len())
}

fn tar_command() -> Result<Command, PipelineError> {
    let program = which::which("tar").map_err(|error| {
        corrupted(format!("cannot extract tarball: tar utility not found ({error})"))
    })?;
    let mut command = Command::new(program);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    Ok(command)
}

async fn tar_entry_names(path: &Path, format: ArchiveFormat) -> Result<Vec<String>, PipelineError> {
    let mut command = tar_command()?;
    command.arg("-t");
    if let Some(flag) = format.tar_codec_flag() {
        command.arg(flag);
    }
    command.arg("-f").arg(path);

    let output = command
        .output()
        .await
        .map_err(|error| corrupted(format!("failed to run tar: {error}")))?;
    if !output.status.success() {
        return Err(corrupted(format!(
            "tar could not list {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

async fn extract_tar(
    path: &Path,
    dest: &Path,
    format: ArchiveFormat,
    preserve_permissions: bool,
    cancel: &CancellationToken,
) -> Result<usize, PipelineError> {
    let entries = tar_entry_names(path, format).await?;
    if let Some(unsafe_entry) = entries
        .iter()
        .find(|entry| resolve_within(dest, entry).is_none())
    {
        warn!("Rejecting tar entry with unsafe path: {unsafe_entry}");
        return Err(traversal(unsafe_entry));
    }

    std::fs::create_dir_all(dest).map_err(|error| {
        PipelineError::io(ErrorKind::CorruptedArchive, "failed to create destination", &error)
    })?;

    let mut command = tar_command()?;
    command.arg("-x");
    if let Some(flag) = format.tar_codec_flag() {
        command.arg(flag);
    }
    if preserve_permissions {
        command.arg("-p");
    }
    command.arg("-f").arg(path).arg("-C").arg(dest);

    let output = tokio::select! {
        () = cancel.cancelled() => return Err(PipelineError::cancelled("extraction")),
        output = command.output() => output,
    }
    .map_err(|error| corrupted(format!("failed to run tar: {error}")))?;

    if !output.status.success() {
        return Err(corrupted(format!(
            "tar exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::Path;

    use nodeup_backend::ErrorKind;
    use tokio_util::sync::CancellationToken;

    use super::{ArchiveFormat, extract, is_valid_archive, list_contents, resolve_within};

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let zip_file = std::fs::File::create(path).expect("zip file should be created");
        let mut writer = zip::ZipWriter::new(zip_file);
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(*name, options)
                    .expect("directory entry should be written");
            } else {
                writer
                    .start_file(*name, options)
                    .expect("file entry should be started");
                writer
                    .write_all(contents)
                    .expect("file entry should be written");
            }
        }
        writer.finish().expect("zip archive should be finalized");
    }

    #[test]
    fn formats_are_detected_by_extension() {
        assert_eq!(
            ArchiveFormat::from_path(Path::new("node-v20.11.0-win-x64.ZIP")),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            ArchiveFormat::from_path(Path::new("node-v20.11.0-darwin-x64.tar.gz")),
            Some(ArchiveFormat::TarGz)
        );
        assert!(is_valid_archive(Path::new("node-v20.11.0-linux-x64.tar.xz")));
        assert!(!is_valid_archive(Path::new("node-v20.11.0.pkg")));
        assert!(!is_valid_archive(Path::new("archive.tar")));
    }

    #[test]
    fn resolve_within_rejects_escaping_entries() {
        let root = Path::new("/tmp/extract");
        assert_eq!(
            resolve_within(root, "node/bin/../lib/x.js"),
            Some(root.join("node/lib/x.js"))
        );
        assert_eq!(resolve_within(root, "../outside.txt"), None);
        assert_eq!(resolve_within(root, "node/../../outside.txt"), None);
        assert_eq!(resolve_within(root, "/etc/passwd"), None);
        assert_eq!(resolve_within(root, "..\\outside.txt"), None);
    }

    #[tokio::test]
    async fn zip_extracts_files_and_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let zip_path = temp.path().join("node.zip");
        let dest = temp.path().join("extract");
        write_zip(
            &zip_path,
            &[
                ("node-v20.11.0/", b""),
                ("node-v20.11.0/bin/node", b"#!/bin/sh\n"),
            ],
        );

        let extraction = extract(&zip_path, &dest, true, &CancellationToken::new())
            .await
            .expect("zip should extract");

        assert_eq!(extraction.entry_count, 2);
        let binary = dest.join("node-v20.11.0/bin/node");
        assert_eq!(
            std::fs::read(&binary).expect("extracted file should be readable"),
            b"#!/bin/sh\n"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&binary)
                .expect("metadata should be readable")
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[tokio::test]
    async fn zip_with_traversal_entry_writes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let zip_path = temp.path().join("evil.zip");
        let dest = temp.path().join("extract");
        write_zip(
            &zip_path,
            &[
                ("benign.txt", b"fine"),
                ("../outside.txt", b"should not be extracted"),
            ],
        );

        let error = extract(&zip_path, &dest, false, &CancellationToken::new())
            .await
            .expect_err("traversal should be rejected");

        assert_eq!(error.kind, ErrorKind::PathTraversalDetected);
        assert!(!temp.path().join("outside.txt").exists());
        assert!(!dest.join("benign.txt").exists());
    }

    #[tokio::test]
    async fn missing_archive_is_reported_before_creating_destination() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let dest = temp.path().join("extract");

        let error = extract(
            &temp.path().join("absent.zip"),
            &dest,
            false,
            &CancellationToken::new(),
        )
        .await
        .expect_err("missing archive should fail");

        assert_eq!(error.kind, ErrorKind::CorruptedArchive);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn cancelled_extraction_stops_before_writing() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let zip_path = temp.path().join("node.zip");
        let dest = temp.path().join("extract");
        write_zip(&zip_path, &[("a.txt", b"a")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = extract(&zip_path, &dest, false, &cancel)
            .await
            .expect_err("cancelled extraction should fail");

        assert_eq!(error.kind, ErrorKind::Cancelled);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn list_contents_returns_entry_names() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let zip_path = temp.path().join("node.zip");
        write_zip(&zip_path, &[("node/", b""), ("node/README.md", b"hi")]);

        let names: Vec<String> = list_contents(&zip_path)
            .await
            .expect("listing should succeed")
            .collect();

        assert_eq!(names, vec!["node/".to_string(), "node/README.md".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tarball_is_extracted_with_system_tar() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let source = temp.path().join("source");
        std::fs::create_dir_all(source.join("node-v20.11.0-linux-x64/bin"))
            .expect("source tree should be created");
        std::fs::write(
            source.join("node-v20.11.0-linux-x64/bin/node"),
            b"binary",
        )
        .expect("source file should be written");
        let tarball = temp.path().join("node.tar.gz");
        let status = std::process::Command::new("tar")
            .arg("-czf")
            .arg(&tarball)
            .arg("-C")
            .arg(&source)
            .arg("node-v20.11.0-linux-x64")
            .status()
            .expect("tar should run");
        assert!(status.success());

        let dest = temp.path().join("extract");
        let extraction = extract(&tarball, &dest, true, &CancellationToken::new())
            .await
            .expect("tarball should extract");

        assert_eq!(extraction.entry_count, 3);
        assert_eq!(
            std::fs::read(dest.join("node-v20.11.0-linux-x64/bin/node"))
                .expect("extracted binary should exist"),
            b"binary"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn corrupt_tarball_reports_tar_diagnostics() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let tarball = temp.path().join("broken.tar.gz");
        std::fs::write(&tarball, b"definitely not gzip").expect("fixture should be written");

        let error = extract(
            &tarball,
            &temp.path().join("extract"),
            false,
            &CancellationToken::new(),
        )
        .await
        .expect_err("corrupt tarball should fail");

        assert_eq!(error.kind, ErrorKind::CorruptedArchive);
        assert!(error.detail.contains("tar"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tarball_with_parent_member_is_rejected_before_extraction() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let packing = temp.path().join("packing");
        std::fs::create_dir_all(&packing).expect("packing dir should be created");
        std::fs::write(temp.path().join("escape.txt"), b"payload")
            .expect("escaping member should be written");
        let tarball = temp.path().join("evil.tar.gz");
        let status = std::process::Command::new("tar")
            .arg("-P")
            .arg("-czf")
            .arg(&tarball)
            .arg("-C")
            .arg(&packing)
            .arg("../escape.txt")
            .status()
            .expect("tar should run");
        assert!(status.success());

        let stage = temp.path().join("stage");
        let dest = stage.join("extract");
        let error = extract(&tarball, &dest, false, &CancellationToken::new())
            .await
            .expect_err("parent member should be rejected");

        assert_eq!(error.kind, ErrorKind::PathTraversalDetected);
        assert!(!dest.exists());
        assert!(!stage.join("escape.txt").exists());
    }
}
