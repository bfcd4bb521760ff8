use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::defaults::{default_interval_secs, default_true};

/// Definition names end up as directory names, so only a safe subset is allowed.
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ .\-\w]+$").expect("definition name regex"));

/// Errors raised while validating a drift definition or compiling its filters.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Invalid drift definition name '{0}'")]
    InvalidName(String),
    #[error("Drift definition '{name}' has a zero interval")]
    ZeroInterval { name: String },
    #[error("Invalid filter pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },
}

/// What to monitor for one resource: a base directory, filters and an interval.
///
/// Config keys (TOML): `id`, `name`, `base_dir`, `interval`, `enabled`,
/// `includes`, `excludes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftDefinition {
    /// Server-side identifier, written into change-set headers.
    #[serde(default)]
    pub id: i32,
    pub name: String,
    pub base_dir: PathBuf,
    /// Seconds between detection passes.
    #[serde(default = "default_interval_secs")]
    pub interval: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub includes: Vec<DriftFilter>,
    #[serde(default)]
    pub excludes: Vec<DriftFilter>,
}

impl DriftDefinition {
    /// Create an enabled definition with the default interval and no filters.
    pub fn new(id: i32, name: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            base_dir: base_dir.into(),
            interval: default_interval_secs(),
            enabled: true,
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.as_secs();
        self
    }

    pub fn with_include(mut self, filter: DriftFilter) -> Self {
        self.includes.push(filter);
        self
    }

    pub fn with_exclude(mut self, filter: DriftFilter) -> Self {
        self.excludes.push(filter);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Check the name and interval before the definition is scheduled.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if !NAME_PATTERN.is_match(&self.name)
            || self.name.trim() != self.name
            || self.name.chars().all(|c| c == '.')
        {
            return Err(DefinitionError::InvalidName(self.name.clone()));
        }
        if self.interval == 0 {
            return Err(DefinitionError::ZeroInterval {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Compile the include/exclude filters for a scan.
    pub fn file_filter(&self) -> Result<FileFilter, DefinitionError> {
        FileFilter::new(&self.includes, &self.excludes)
    }
}

/// A path/pattern pair relative to the definition base directory.
///
/// An empty `pattern` matches everything below `path`; an empty `path` anchors
/// the pattern at the base directory. `*` stays within one directory level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftFilter {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub pattern: String,
}

impl DriftFilter {
    pub fn new(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pattern: pattern.into(),
        }
    }

    fn globs(&self) -> Vec<String> {
        let path = self
            .path
            .trim()
            .trim_start_matches("./")
            .trim_matches('/')
            .replace('\\', "/");
        let path = if path == "." { String::new() } else { path };
        let pattern = self.pattern.trim().trim_start_matches('/').to_string();
        match (path.is_empty(), pattern.is_empty()) {
            (true, true) => vec!["**".to_string()],
            (true, false) => vec![pattern],
            (false, true) => vec![path.clone(), format!("{path}/**")],
            (false, false) => vec![format!("{path}/{pattern}")],
        }
    }
}

/// Compiled include/exclude matcher over base-relative paths.
#[derive(Debug, Clone)]
pub struct FileFilter {
    includes: Option<GlobSet>,
    excludes: Option<GlobSet>,
}

impl FileFilter {
    pub fn new(includes: &[DriftFilter], excludes: &[DriftFilter]) -> Result<Self, DefinitionError> {
        Ok(Self {
            includes: build_set(includes)?,
            excludes: build_set(excludes)?,
        })
    }

    /// Matcher that accepts every file.
    pub fn accept_all() -> Self {
        Self {
            includes: None,
            excludes: None,
        }
    }

    pub fn accepts(&self, relative: &Path) -> bool {
        if let Some(excludes) = &self.excludes
            && excludes.is_match(relative)
        {
            return false;
        }
        match &self.includes {
            Some(includes) => includes.is_match(relative),
            None => true,
        }
    }
}

fn build_set(filters: &[DriftFilter]) -> Result<Option<GlobSet>, DefinitionError> {
    if filters.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for glob in filters.iter().flat_map(DriftFilter::globs) {
        let compiled = GlobBuilder::new(&glob)
            .literal_separator(true)
            .build()
            .map_err(|source| DefinitionError::Pattern {
                pattern: glob.clone(),
                source,
            })?;
        builder.add(compiled);
    }
    builder
        .build()
        .map(Some)
        .map_err(|source| DefinitionError::Pattern {
            pattern: filters
                .iter()
                .map(|filter| filter.pattern.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            source,
        })
}
