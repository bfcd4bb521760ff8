//! On-disk change-set layout for one `(resource, definition)` pair.
//!
//! ```text
//! <data_dir>/<resource_id>/<definition_name>/
//!     changeset.txt              current full snapshot
//!     changeset.txt.previous     prior snapshot, kept until the server acks
//!     drift-changeset.txt        delta of the last DRIFT pass
//!     changeset_<ms>.zip         manifest awaiting transmission
//!     content/<sha256>           new or changed files awaiting upload
//!     content_<ms>.zip           content awaiting transmission
//! ```

mod archive;
mod format;

use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{definition::DriftDefinition, schedule::now_millis};

pub use archive::ZipKind;
pub use format::{
    ChangeSet, ChangeSetCategory, EntryKind, FileEntry, Headers, NO_HASH, read_change_set,
};

pub const CHANGE_SET_FILE: &str = "changeset.txt";
pub const PREVIOUS_CHANGE_SET_FILE: &str = "changeset.txt.previous";
pub const DRIFT_CHANGE_SET_FILE: &str = "drift-changeset.txt";
pub const CONTENT_DIR: &str = "content";

/// Errors raised while reading or mutating a change-set directory.
#[derive(Debug, Error)]
pub enum ChangeSetError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("Failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("Failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
    #[error("Failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
    #[error("Malformed change set {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("Zip error for {path}: {message}")]
    Zip { path: PathBuf, message: String },
    #[error("No {category} change set to send in {dir}")]
    MissingChangeSet {
        dir: PathBuf,
        category: ChangeSetCategory,
    },
}

/// A freshly computed detection result to persist.
#[derive(Debug, Clone, Copy)]
pub struct NewChangeSet<'a> {
    pub category: ChangeSetCategory,
    pub version: i32,
    /// Entries transmitted to the server. For COVERAGE this is the snapshot.
    pub delta: &'a [FileEntry],
    /// Full snapshot that becomes the next baseline.
    pub snapshot: &'a [FileEntry],
}

/// A content zip and the content files it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentZip {
    pub path: PathBuf,
    pub size: u64,
    pub files: Vec<PathBuf>,
}

/// Owns the change-set directories below a data directory.
#[derive(Debug)]
pub struct ChangeSetManager {
    data_dir: PathBuf,
    in_flight_content: Mutex<HashSet<PathBuf>>,
}

impl ChangeSetManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            in_flight_content: Mutex::new(HashSet::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn change_set_dir(&self, resource_id: i32, definition_name: &str) -> PathBuf {
        self.data_dir
            .join(resource_id.to_string())
            .join(definition_name)
    }

    pub fn content_dir(&self, resource_id: i32, definition_name: &str) -> PathBuf {
        self.change_set_dir(resource_id, definition_name)
            .join(CONTENT_DIR)
    }

    /// Create the change-set directory and its `content/` child.
    pub fn create_change_set_dir(
        &self,
        resource_id: i32,
        definition_name: &str,
    ) -> Result<PathBuf, ChangeSetError> {
        let dir = self.change_set_dir(resource_id, definition_name);
        let content = dir.join(CONTENT_DIR);
        fs::create_dir_all(&content).map_err(|source| ChangeSetError::CreateDir {
            path: content.clone(),
            source,
        })?;
        Ok(dir)
    }

    pub fn snapshot_exists(&self, resource_id: i32, definition_name: &str) -> bool {
        self.change_set_dir(resource_id, definition_name)
            .join(CHANGE_SET_FILE)
            .is_file()
    }

    /// Parse the current snapshot, if one exists.
    pub fn read_snapshot(
        &self,
        resource_id: i32,
        definition_name: &str,
    ) -> Result<Option<ChangeSet>, ChangeSetError> {
        let path = self
            .change_set_dir(resource_id, definition_name)
            .join(CHANGE_SET_FILE);
        match read_change_set(&path) {
            Ok(change_set) => Ok(Some(change_set)),
            Err(ChangeSetError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Change-set zips in `dir`, oldest first.
    pub fn find_change_set_zip_files(&self, dir: &Path) -> Result<Vec<PathBuf>, ChangeSetError> {
        archive::find_zip_files(dir, ZipKind::ChangeSet)
    }

    /// Content zips in `dir`, oldest first.
    pub fn find_content_zip_files(&self, dir: &Path) -> Result<Vec<PathBuf>, ChangeSetError> {
        archive::find_zip_files(dir, ZipKind::Content)
    }

    /// Newest change-set zip awaiting transmission.
    pub fn latest_change_set_zip(
        &self,
        resource_id: i32,
        definition_name: &str,
    ) -> Result<Option<PathBuf>, ChangeSetError> {
        let dir = self.change_set_dir(resource_id, definition_name);
        let mut zips = self.find_change_set_zip_files(&dir)?;
        if zips.len() > 1 {
            warn!(
                dir = %dir.display(),
                count = zips.len(),
                "Found more than one change-set zip; sending the newest"
            );
        }
        Ok(zips.pop())
    }

    /// True when a change-set zip is still waiting for a server ack.
    pub fn has_pending_upload(
        &self,
        resource_id: i32,
        definition_name: &str,
    ) -> Result<bool, ChangeSetError> {
        let dir = self.change_set_dir(resource_id, definition_name);
        Ok(!self.find_change_set_zip_files(&dir)?.is_empty())
    }

    /// True when `content/` holds files that have not been uploaded yet.
    pub fn has_pending_content(
        &self,
        resource_id: i32,
        definition_name: &str,
    ) -> Result<bool, ChangeSetError> {
        let content = self.content_dir(resource_id, definition_name);
        Ok(!list_content_files(&content)?.is_empty())
    }

    /// Category of the change set currently awaiting an ack.
    pub fn pending_category(&self, resource_id: i32, definition_name: &str) -> ChangeSetCategory {
        let dir = self.change_set_dir(resource_id, definition_name);
        if dir.join(PREVIOUS_CHANGE_SET_FILE).is_file() && dir.join(DRIFT_CHANGE_SET_FILE).is_file()
        {
            ChangeSetCategory::Drift
        } else {
            ChangeSetCategory::Coverage
        }
    }

    /// Persist a detection result and zip it for transmission.
    ///
    /// The current snapshot rotates to `.previous` (unless an older
    /// unconfirmed `.previous` is already there) and the new snapshot is
    /// renamed into place. Returns the new change-set zip.
    pub fn write_change_set(
        &self,
        resource_id: i32,
        definition: &DriftDefinition,
        change_set: NewChangeSet<'_>,
    ) -> Result<PathBuf, ChangeSetError> {
        let dir = self.create_change_set_dir(resource_id, &definition.name)?;
        let current = dir.join(CHANGE_SET_FILE);
        let previous = dir.join(PREVIOUS_CHANGE_SET_FILE);
        let staged = dir.join(format!("{CHANGE_SET_FILE}.new"));

        let headers = |category| Headers {
            resource_id,
            definition_id: definition.id,
            definition_name: definition.name.clone(),
            base_dir: definition.base_dir.clone(),
            category,
            version: change_set.version,
        };
        format::write_change_set(
            &staged,
            &headers(ChangeSetCategory::Coverage),
            change_set.snapshot,
        )?;
        if change_set.category == ChangeSetCategory::Drift {
            format::write_change_set(
                &dir.join(DRIFT_CHANGE_SET_FILE),
                &headers(ChangeSetCategory::Drift),
                change_set.delta,
            )?;
        }
        if current.exists() {
            if previous.exists() {
                debug!(
                    dir = %dir.display(),
                    "Keeping unconfirmed previous snapshot"
                );
                remove_file(&current)?;
            } else {
                rename(&current, &previous)?;
            }
        }
        rename(&staged, &current)?;
        self.zip_change_set(resource_id, &definition.name, change_set.category)
    }

    /// Zip the manifest for `category` into a new `changeset_<ms>.zip`.
    pub fn zip_change_set(
        &self,
        resource_id: i32,
        definition_name: &str,
        category: ChangeSetCategory,
    ) -> Result<PathBuf, ChangeSetError> {
        let dir = self.change_set_dir(resource_id, definition_name);
        let manifest_name = match category {
            ChangeSetCategory::Coverage => CHANGE_SET_FILE,
            ChangeSetCategory::Drift => DRIFT_CHANGE_SET_FILE,
        };
        let manifest = dir.join(manifest_name);
        if !manifest.is_file() {
            return Err(ChangeSetError::MissingChangeSet { dir, category });
        }
        let zip_path = dir.join(ZipKind::ChangeSet.file_name(now_millis()));
        archive::write_zip(&zip_path, &[(manifest_name.to_string(), manifest)])?;
        debug!(zip = %zip_path.display(), %category, "Zipped change set");
        Ok(zip_path)
    }

    /// Zip every file in `content/` into a new `content_<ms>.zip`.
    ///
    /// Returns `None` when there is nothing to upload.
    pub fn write_content_zip(
        &self,
        resource_id: i32,
        definition_name: &str,
    ) -> Result<Option<ContentZip>, ChangeSetError> {
        let dir = self.change_set_dir(resource_id, definition_name);
        let files = list_content_files(&dir.join(CONTENT_DIR))?;
        if files.is_empty() {
            return Ok(None);
        }
        let entries: Vec<(String, PathBuf)> = files
            .iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                Some((name, path.clone()))
            })
            .collect();
        let zip_path = dir.join(ZipKind::Content.file_name(now_millis()));
        let size = archive::write_zip(&zip_path, &entries)?;
        Ok(Some(ContentZip {
            path: zip_path,
            size,
            files,
        }))
    }

    /// Server confirmed the change set: drop `.previous` and every change-set zip.
    pub fn ack_change_set(
        &self,
        resource_id: i32,
        definition_name: &str,
    ) -> Result<(), ChangeSetError> {
        let dir = self.change_set_dir(resource_id, definition_name);
        remove_if_exists(&dir.join(PREVIOUS_CHANGE_SET_FILE))?;
        for zip in self.find_change_set_zip_files(&dir)? {
            remove_if_exists(&zip)?;
        }
        info!(resource_id, definition = definition_name, "Change set acknowledged");
        Ok(())
    }

    /// Upload stream consumed: drop the zip and exactly the files it carried.
    pub fn ack_content(&self, content: &ContentZip) -> Result<(), ChangeSetError> {
        let result = remove_if_exists(&content.path).and_then(|()| {
            content
                .files
                .iter()
                .try_for_each(|file| remove_if_exists(file))
        });
        self.release_content(&content.path);
        result
    }

    /// Mark a content zip as being read by a transport.
    ///
    /// Returns false when it was already marked.
    pub fn mark_content_in_flight(&self, zip: &Path) -> bool {
        self.lock_in_flight().insert(zip.to_path_buf())
    }

    pub fn release_content(&self, zip: &Path) {
        self.lock_in_flight().remove(zip);
    }

    /// True while any content zip under `dir` is still being read.
    pub fn content_in_flight(&self, dir: &Path) -> bool {
        self.lock_in_flight().iter().any(|zip| zip.starts_with(dir))
    }

    /// Remove content zips left behind by an interrupted upload.
    ///
    /// Zips still being read are left alone.
    pub fn discard_stale_content_zips(&self, dir: &Path) -> Result<usize, ChangeSetError> {
        let mut removed = 0;
        for zip in self.find_content_zip_files(dir)? {
            if self.lock_in_flight().contains(&zip) {
                continue;
            }
            remove_if_exists(&zip)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Copy `source` into `content/` under its hash.
    pub fn store_content(
        &self,
        resource_id: i32,
        definition_name: &str,
        source: &Path,
        sha256: &str,
    ) -> Result<PathBuf, ChangeSetError> {
        let content = self.content_dir(resource_id, definition_name);
        fs::create_dir_all(&content).map_err(|source| ChangeSetError::CreateDir {
            path: content.clone(),
            source,
        })?;
        let dest = content.join(sha256);
        if !dest.exists() {
            fs::copy(source, &dest).map_err(|err| ChangeSetError::Write {
                path: dest.clone(),
                source: err,
            })?;
        }
        Ok(dest)
    }

    /// Undo a cycle that failed before its zip was written.
    pub fn rollback(
        &self,
        resource_id: i32,
        definition_name: &str,
        category: ChangeSetCategory,
    ) -> Result<(), ChangeSetError> {
        let dir = self.change_set_dir(resource_id, definition_name);
        let current = dir.join(CHANGE_SET_FILE);
        let previous = dir.join(PREVIOUS_CHANGE_SET_FILE);
        if !self.find_change_set_zip_files(&dir)?.is_empty() {
            debug!(dir = %dir.display(), "Change-set zip exists; nothing to roll back");
            return Ok(());
        }
        remove_if_exists(&dir.join(format!("{CHANGE_SET_FILE}.new")))?;
        if previous.exists() {
            rename(&previous, &current)?;
        } else if category == ChangeSetCategory::Coverage {
            remove_if_exists(&current)?;
        }
        if category == ChangeSetCategory::Drift {
            remove_if_exists(&dir.join(DRIFT_CHANGE_SET_FILE))?;
        }
        warn!(
            resource_id,
            definition = definition_name,
            %category,
            "Rolled back change set"
        );
        Ok(())
    }

    /// Write a baseline snapshot without producing a zip.
    pub fn write_snapshot(
        &self,
        resource_id: i32,
        definition: &DriftDefinition,
        version: i32,
        entries: &[FileEntry],
    ) -> Result<(), ChangeSetError> {
        let dir = self.create_change_set_dir(resource_id, &definition.name)?;
        let staged = dir.join(format!("{CHANGE_SET_FILE}.new"));
        let headers = Headers {
            resource_id,
            definition_id: definition.id,
            definition_name: definition.name.clone(),
            base_dir: definition.base_dir.clone(),
            category: ChangeSetCategory::Coverage,
            version,
        };
        format::write_change_set(&staged, &headers, entries)?;
        rename(&staged, &dir.join(CHANGE_SET_FILE))
    }

    /// Remove the whole change-set directory. A missing directory is fine.
    pub fn delete_change_set_directory(
        &self,
        resource_id: i32,
        definition_name: &str,
    ) -> Result<(), ChangeSetError> {
        let dir = self.change_set_dir(resource_id, definition_name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(dir = %dir.display(), "Deleted change-set directory");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ChangeSetError::Remove { path: dir, source }),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.in_flight_content.lock().unwrap_or_else(|poisoned| {
            warn!("In-flight content lock poisoned; recovering.");
            poisoned.into_inner()
        })
    }
}

fn list_content_files(content: &Path) -> Result<Vec<PathBuf>, ChangeSetError> {
    let entries = match fs::read_dir(content) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ChangeSetError::Read {
                path: content.to_path_buf(),
                source,
            });
        }
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ChangeSetError::Read {
            path: content.to_path_buf(),
            source,
        })?;
        if entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn rename(from: &Path, to: &Path) -> Result<(), ChangeSetError> {
    fs::rename(from, to).map_err(|source| ChangeSetError::Rename {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

fn remove_file(path: &Path) -> Result<(), ChangeSetError> {
    fs::remove_file(path).map_err(|source| ChangeSetError::Remove {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_if_exists(path: &Path) -> Result<(), ChangeSetError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ChangeSetError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}
