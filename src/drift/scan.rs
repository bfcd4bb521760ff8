use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use super::{changeset::FileEntry, definition::FileFilter};

/// Errors surfaced while walking a base directory.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Base directory is not a directory: {0}")]
    InvalidRoot(PathBuf),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Scan canceled")]
    Canceled,
}

/// One accepted file found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub absolute: PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// Hash every accepted regular file below `base_dir`, keyed by `/`-separated relative path.
///
/// Symlinks are skipped. Unreadable nested directories are logged and skipped;
/// an unreadable `base_dir` fails the scan.
pub fn scan_directory(
    base_dir: &Path,
    filter: &FileFilter,
    cancel: Option<&AtomicBool>,
) -> Result<BTreeMap<String, ScannedFile>, ScanError> {
    if !base_dir.is_dir() {
        return Err(ScanError::InvalidRoot(base_dir.to_path_buf()));
    }
    let mut files = BTreeMap::new();
    visit_dir(base_dir, cancel, &mut |path| {
        let relative = strip_relative(base_dir, path)?;
        if !filter.accepts(&relative) {
            return Ok(());
        }
        let (sha256, size) = match sha256_file(path) {
            Ok(hashed) => hashed,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Skipping unreadable file");
                return Ok(());
            }
        };
        files.insert(
            to_manifest_path(&relative),
            ScannedFile {
                absolute: path.to_path_buf(),
                sha256,
                size,
            },
        );
        Ok(())
    })?;
    Ok(files)
}

/// Classify `current` against the baseline hashes, sorted by path.
pub fn diff(
    baseline: &BTreeMap<String, String>,
    current: &BTreeMap<String, ScannedFile>,
) -> Vec<FileEntry> {
    let mut entries = Vec::new();
    for (path, file) in current {
        match baseline.get(path) {
            None => entries.push(FileEntry::added(path.clone(), file.sha256.clone())),
            Some(old) if *old != file.sha256 => entries.push(FileEntry::changed(
                path.clone(),
                old.clone(),
                file.sha256.clone(),
            )),
            Some(_) => {}
        }
    }
    for (path, old) in baseline {
        if !current.contains_key(path) {
            entries.push(FileEntry::removed(path.clone(), old.clone()));
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

/// Full-snapshot entries for a scan result.
pub fn snapshot_entries(current: &BTreeMap<String, ScannedFile>) -> Vec<FileEntry> {
    current
        .iter()
        .map(|(path, file)| FileEntry::added(path.clone(), file.sha256.clone()))
        .collect()
}

/// SHA-256 of a file as lowercase hex, plus its length.
pub fn sha256_file(path: &Path) -> Result<(String, u64), ScanError> {
    let mut file = fs::File::open(path).map_err(|source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buffer).map_err(|source| ScanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if read == 0 {
            break;
        }
        size += read as u64;
        hasher.update(&buffer[..read]);
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn visit_dir(
    root: &Path,
    cancel: Option<&AtomicBool>,
    visitor: &mut impl FnMut(&Path) -> Result<(), ScanError>,
) -> Result<(), ScanError> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if let Some(cancel) = cancel
            && cancel.load(Ordering::Relaxed)
        {
            return Err(ScanError::Canceled);
        }
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(source) if dir != root => {
                warn!(
                    dir = %dir.display(),
                    error = %source,
                    "Failed to read directory during drift scan"
                );
                continue;
            }
            Err(source) => {
                return Err(ScanError::Io {
                    path: dir.clone(),
                    source,
                });
            }
        };
        for entry_result in entries {
            let entry = match entry_result {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(
                        dir = %dir.display(),
                        error = %err,
                        "Failed to read directory entry during drift scan"
                    );
                    continue;
                }
            };
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                warn!(path = %path.display(), "Failed to read file type during drift scan");
                continue;
            };
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                visitor(&path)?;
            }
        }
    }
    Ok(())
}

fn strip_relative(root: &Path, path: &Path) -> Result<PathBuf, ScanError> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| ScanError::InvalidRoot(path.to_path_buf()))
}

fn to_manifest_path(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
