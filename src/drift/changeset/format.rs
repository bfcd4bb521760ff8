//! Line-based change-set manifest format.
//!
//! Six header lines (resource id, definition id, definition name, base
//! directory, category code, version) followed by one entry per line:
//! `<kind> <new_sha> <old_sha> <path>`, with `0` standing in for a missing hash.
//!
//! Paths and the base directory are written with `%`, `\n` and `\r`
//! percent-encoded (`%25`, `%0A`, `%0D`) so every record stays on one line.

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use super::ChangeSetError;

/// Placeholder written for an absent hash.
pub const NO_HASH: &str = "0";

/// Category of a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSetCategory {
    /// Full snapshot of the monitored directory.
    Coverage,
    /// Incremental delta against the previous snapshot.
    Drift,
}

impl ChangeSetCategory {
    pub fn code(self) -> &'static str {
        match self {
            Self::Coverage => "C",
            Self::Drift => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "C" => Some(Self::Coverage),
            "D" => Some(Self::Drift),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeSetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Coverage => "COVERAGE",
            Self::Drift => "DRIFT",
        })
    }
}

/// How a file differs from the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Added,
    Changed,
    Removed,
}

impl EntryKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::Added => "A",
            Self::Changed => "C",
            Self::Removed => "R",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Self::Added),
            "C" => Some(Self::Changed),
            "R" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// One line of a change set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileEntry {
    pub kind: EntryKind,
    /// Hash of the current content; `None` for removed files.
    pub new_sha: Option<String>,
    /// Hash of the baseline content; `None` for added files.
    pub old_sha: Option<String>,
    /// Path relative to the definition base directory, `/` separated.
    pub path: String,
}

impl FileEntry {
    pub fn added(path: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Added,
            new_sha: Some(sha.into()),
            old_sha: None,
            path: path.into(),
        }
    }

    pub fn changed(
        path: impl Into<String>,
        old_sha: impl Into<String>,
        new_sha: impl Into<String>,
    ) -> Self {
        Self {
            kind: EntryKind::Changed,
            new_sha: Some(new_sha.into()),
            old_sha: Some(old_sha.into()),
            path: path.into(),
        }
    }

    pub fn removed(path: impl Into<String>, old_sha: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Removed,
            new_sha: None,
            old_sha: Some(old_sha.into()),
            path: path.into(),
        }
    }

    fn to_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.kind.code(),
            self.new_sha.as_deref().unwrap_or(NO_HASH),
            self.old_sha.as_deref().unwrap_or(NO_HASH),
            escape_field(&self.path)
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.splitn(4, ' ');
        let kind = EntryKind::from_code(fields.next()?)?;
        let new_sha = hash_field(fields.next()?);
        let old_sha = hash_field(fields.next()?);
        let path = unescape_field(fields.next()?)?;
        if path.is_empty() {
            return None;
        }
        Some(Self {
            kind,
            new_sha,
            old_sha,
            path,
        })
    }
}

fn hash_field(field: &str) -> Option<String> {
    (field != NO_HASH).then(|| field.to_string())
}

fn escape_field(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            '\n' => escaped.push_str("%0A"),
            '\r' => escaped.push_str("%0D"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Reverse of [`escape_field`]; `None` on an unknown escape.
fn unescape_field(value: &str) -> Option<String> {
    let mut unescaped = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(idx) = rest.find('%') {
        unescaped.push_str(&rest[..idx]);
        let code = rest.get(idx + 1..idx + 3)?;
        unescaped.push(match code {
            "25" => '%',
            "0A" | "0a" => '\n',
            "0D" | "0d" => '\r',
            _ => return None,
        });
        rest = &rest[idx + 3..];
    }
    unescaped.push_str(rest);
    Some(unescaped)
}

/// Header block of a change-set file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    pub resource_id: i32,
    pub definition_id: i32,
    pub definition_name: String,
    pub base_dir: PathBuf,
    pub category: ChangeSetCategory,
    pub version: i32,
}

/// A parsed change-set file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub headers: Headers,
    pub entries: Vec<FileEntry>,
}

impl ChangeSet {
    /// Current content hash per path, as recorded by a full snapshot.
    pub fn hashes_by_path(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter(|entry| entry.kind != EntryKind::Removed)
            .filter_map(|entry| Some((entry.path.clone(), entry.new_sha.clone()?)))
            .collect()
    }
}

/// Write `headers` and `entries` to `path`, replacing any existing file.
pub fn write_change_set(
    path: &Path,
    headers: &Headers,
    entries: &[FileEntry],
) -> Result<(), ChangeSetError> {
    let file = File::create(path).map_err(|source| ChangeSetError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    let mut emit = |line: &str| -> Result<(), ChangeSetError> {
        writeln!(writer, "{line}").map_err(|source| ChangeSetError::Write {
            path: path.to_path_buf(),
            source,
        })
    };
    emit(&headers.resource_id.to_string())?;
    emit(&headers.definition_id.to_string())?;
    emit(&headers.definition_name)?;
    emit(&escape_field(&headers.base_dir.to_string_lossy()))?;
    emit(headers.category.code())?;
    emit(&headers.version.to_string())?;
    for entry in entries {
        emit(&entry.to_line())?;
    }
    writer
        .into_inner()
        .map_err(|err| ChangeSetError::Write {
            path: path.to_path_buf(),
            source: err.into_error(),
        })?
        .sync_all()
        .map_err(|source| ChangeSetError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Parse a change-set file.
pub fn read_change_set(path: &Path) -> Result<ChangeSet, ChangeSetError> {
    let file = File::open(path).map_err(|source| ChangeSetError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut lines = BufReader::new(file).lines();
    let mut next_header = |name: &'static str| -> Result<String, ChangeSetError> {
        match lines.next() {
            Some(Ok(line)) => Ok(line),
            Some(Err(source)) => Err(ChangeSetError::Read {
                path: path.to_path_buf(),
                source,
            }),
            None => Err(ChangeSetError::Malformed {
                path: path.to_path_buf(),
                reason: format!("missing {name} header"),
            }),
        }
    };
    let malformed = |reason: String| ChangeSetError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let resource_id = next_header("resource id")?;
    let definition_id = next_header("definition id")?;
    let definition_name = next_header("definition name")?;
    let base_dir = next_header("base directory")?;
    let category = next_header("category")?;
    let version = next_header("version")?;
    let headers = Headers {
        resource_id: resource_id
            .trim()
            .parse()
            .map_err(|_| malformed(format!("bad resource id '{resource_id}'")))?,
        definition_id: definition_id
            .trim()
            .parse()
            .map_err(|_| malformed(format!("bad definition id '{definition_id}'")))?,
        definition_name,
        base_dir: unescape_field(&base_dir)
            .map(PathBuf::from)
            .ok_or_else(|| malformed(format!("bad base directory '{base_dir}'")))?,
        category: ChangeSetCategory::from_code(category.trim())
            .ok_or_else(|| malformed(format!("bad category '{category}'")))?,
        version: version
            .trim()
            .parse()
            .map_err(|_| malformed(format!("bad version '{version}'")))?,
    };

    let mut entries = Vec::new();
    for line in lines {
        let line = line.map_err(|source| ChangeSetError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let entry =
            FileEntry::parse(&line).ok_or_else(|| malformed(format!("bad entry '{line}'")))?;
        entries.push(entry);
    }
    Ok(ChangeSet { headers, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn headers(category: ChangeSetCategory) -> Headers {
        Headers {
            resource_id: 1,
            definition_id: 2,
            definition_name: "add-file-test".to_string(),
            base_dir: PathBuf::from("/opt/myresource"),
            category,
            version: 1,
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn writes_six_headers_then_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changeset.txt");
        write_change_set(
            &path,
            &headers(ChangeSetCategory::Coverage),
            &[FileEntry::added("conf/myconf.conf", "a34ef6")],
        )
        .unwrap();

        let lines = lines(&path);
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "1");
        assert_eq!(lines[1], "2");
        assert_eq!(lines[2], "add-file-test");
        assert_eq!(lines[3], "/opt/myresource");
        assert_eq!(lines[4], "C");
        assert_eq!(lines[5], "1");
        assert_eq!(lines[6], "A a34ef6 0 conf/myconf.conf");
    }

    #[test]
    fn removed_and_changed_entries_use_placeholder_hashes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drift-changeset.txt");
        write_change_set(
            &path,
            &headers(ChangeSetCategory::Drift),
            &[
                FileEntry::removed("conf/old.conf", "a34ef6"),
                FileEntry::changed("conf/myconf.conf", "a34ef6", "c2d55f"),
            ],
        )
        .unwrap();

        let lines = lines(&path);
        assert_eq!(lines[4], "D");
        assert_eq!(lines[6], "R 0 a34ef6 conf/old.conf");
        assert_eq!(lines[7], "C c2d55f a34ef6 conf/myconf.conf");
    }

    #[test]
    fn reads_back_paths_with_spaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changeset.txt");
        let entries = vec![FileEntry::added("my docs/read me.txt", "abc")];
        write_change_set(&path, &headers(ChangeSetCategory::Coverage), &entries).unwrap();

        let parsed = read_change_set(&path).unwrap();
        assert_eq!(parsed.headers, headers(ChangeSetCategory::Coverage));
        assert_eq!(parsed.entries, entries);
        assert_eq!(
            parsed.hashes_by_path().get("my docs/read me.txt"),
            Some(&"abc".to_string())
        );
    }

    #[test]
    fn line_breaks_and_percent_signs_in_paths_survive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changeset.txt");
        let mut headers = headers(ChangeSetCategory::Coverage);
        headers.base_dir = PathBuf::from("/opt/100%\nbase");
        let entries = vec![
            FileEntry::added("a\nb", "abc"),
            FileEntry::added("ends-with-cr\r", "def"),
            FileEntry::added("50% off/%0A literal", "123"),
        ];
        write_change_set(&path, &headers, &entries).unwrap();

        let lines = lines(&path);
        assert_eq!(lines.len(), 9);
        assert_eq!(lines[3], "/opt/100%25%0Abase");
        assert_eq!(lines[6], "A abc 0 a%0Ab");
        assert_eq!(lines[8], "A 123 0 50%25 off/%250A literal");

        let parsed = read_change_set(&path).unwrap();
        assert_eq!(parsed.headers, headers);
        assert_eq!(parsed.entries, entries);
    }

    #[test]
    fn unknown_escape_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changeset.txt");
        std::fs::write(&path, "1\n2\nname\n/base\nC\n0\nA abc 0 bad%zz\n").unwrap();
        assert!(matches!(
            read_change_set(&path),
            Err(ChangeSetError::Malformed { .. })
        ));
    }

    #[test]
    fn truncated_headers_are_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changeset.txt");
        std::fs::write(&path, "1\n2\nname\n").unwrap();
        assert!(matches!(
            read_change_set(&path),
            Err(ChangeSetError::Malformed { .. })
        ));
    }

    #[test]
    fn unknown_entry_kind_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changeset.txt");
        std::fs::write(&path, "1\n2\nname\n/base\nC\n0\nX abc 0 file\n").unwrap();
        assert!(matches!(
            read_change_set(&path),
            Err(ChangeSetError::Malformed { .. })
        ));
    }
}
