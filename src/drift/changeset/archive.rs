use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter},
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use super::ChangeSetError;

static CHANGE_SET_ZIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^changeset_([0-9]+)\.zip$").expect("change-set zip regex"));
static CONTENT_ZIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^content_([0-9]+)\.zip$").expect("content zip regex"));

/// Kind of in-flight archive kept in a change-set directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZipKind {
    ChangeSet,
    Content,
}

impl ZipKind {
    fn pattern(self) -> &'static Regex {
        match self {
            Self::ChangeSet => &CHANGE_SET_ZIP,
            Self::Content => &CONTENT_ZIP,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::ChangeSet => "changeset",
            Self::Content => "content",
        }
    }

    /// File name for an archive created at `epoch_millis`.
    pub fn file_name(self, epoch_millis: u64) -> String {
        format!("{}_{epoch_millis}.zip", self.prefix())
    }

    /// Timestamp embedded in a matching file name.
    pub fn timestamp(self, file_name: &str) -> Option<u64> {
        self.pattern()
            .captures(file_name)
            .and_then(|caps| caps.get(1))
            .and_then(|stamp| stamp.as_str().parse().ok())
    }
}

/// List archives of `kind` directly inside `dir`, oldest first.
///
/// A missing directory yields an empty list.
pub fn find_zip_files(dir: &Path, kind: ZipKind) -> Result<Vec<PathBuf>, ChangeSetError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ChangeSetError::Read {
                path: dir.to_path_buf(),
                source,
            });
        }
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ChangeSetError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let Some(stamp) = name.to_str().and_then(|name| kind.timestamp(name)) else {
            continue;
        };
        if entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            found.push((stamp, entry.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Write a deflated zip at `zip_path` holding each `(entry name, source file)`.
///
/// A partially written archive is removed on failure.
pub fn write_zip(zip_path: &Path, entries: &[(String, PathBuf)]) -> Result<u64, ChangeSetError> {
    let result = write_zip_inner(zip_path, entries);
    if result.is_err() {
        let _ = fs::remove_file(zip_path);
    }
    result
}

fn write_zip_inner(zip_path: &Path, entries: &[(String, PathBuf)]) -> Result<u64, ChangeSetError> {
    let file = File::create(zip_path).map_err(|source| ChangeSetError::Write {
        path: zip_path.to_path_buf(),
        source,
    })?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);
    for (name, source_path) in entries {
        writer
            .start_file(name.as_str(), options)
            .map_err(|err| zip_error(zip_path, err))?;
        let source = File::open(source_path).map_err(|source| ChangeSetError::Read {
            path: source_path.clone(),
            source,
        })?;
        io::copy(&mut BufReader::new(source), &mut writer).map_err(|source| {
            ChangeSetError::Write {
                path: zip_path.to_path_buf(),
                source,
            }
        })?;
    }
    let inner = writer.finish().map_err(|err| zip_error(zip_path, err))?;
    let file = inner.into_inner().map_err(|err| ChangeSetError::Write {
        path: zip_path.to_path_buf(),
        source: err.into_error(),
    })?;
    file.sync_all().map_err(|source| ChangeSetError::Write {
        path: zip_path.to_path_buf(),
        source,
    })?;
    let size = file
        .metadata()
        .map_err(|source| ChangeSetError::Read {
            path: zip_path.to_path_buf(),
            source,
        })?
        .len();
    Ok(size)
}

fn zip_error(path: &Path, err: zip::result::ZipError) -> ChangeSetError {
    ChangeSetError::Zip {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
