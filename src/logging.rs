//! Tracing setup for the agent binary.
//!
//! Events go to stdout and to one file per launch. Launch files are named
//! `drift-agent_<local time>_<pid>.log`, so their names sort by start time,
//! and only the newest `log_files_kept` of them survive a launch. Both layers
//! print the thread name, which tells detector workers apart.

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use time::{OffsetDateTime, UtcOffset, format_description::FormatItem, macros::format_description};
use tracing::{info, warn};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, Registry, filter::ParseError, fmt, prelude::*};

use crate::config::{AgentConfig, ResolvedDirs};

const FILE_PREFIX: &str = "drift-agent_";
const FILE_SUFFIX: &str = ".log";
const DEFAULT_DIRECTIVES: &str = "info";

static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to prepare log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to create log file at {path}: {source}")]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to format log file timestamp: {0}")]
    FormatTime(#[from] time::error::Format),
    #[error("Invalid log filter '{directives}': {source}")]
    Filter {
        directives: String,
        source: ParseError,
    },
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Where the agent logs, how verbosely, and how many launches it remembers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub dir: PathBuf,
    /// Filter directives used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    pub keep_files: usize,
}

impl LogSettings {
    pub fn from_config(config: &AgentConfig, dirs: &ResolvedDirs) -> Self {
        Self {
            dir: dirs.log_dir.clone(),
            filter: config.log_filter.clone(),
            keep_files: config.log_files_kept,
        }
    }
}

/// Install the global subscriber. Later calls are no-ops.
///
/// Errors leave no subscriber installed; the binary reports them and runs on
/// without a log file.
pub fn init(settings: &LogSettings) -> Result<(), LoggingError> {
    if WRITER_GUARD.get().is_some() {
        return Ok(());
    }
    let filter = env_filter(settings.filter.as_deref())?;
    let log_file = create_launch_file(&settings.dir, now_local_or_utc(), std::process::id())?;
    let file_name = log_file
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_default();
    let (file_writer, guard) =
        tracing_appender::non_blocking(rolling::never(&settings.dir, file_name));

    let timer = local_timer();
    let subscriber = Registry::default()
        .with(filter)
        .with(
            fmt::layer()
                .with_thread_names(true)
                .with_timer(timer.clone())
                .with_writer(std::io::stdout),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_timer(timer)
                .with_writer(file_writer),
        );
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = WRITER_GUARD.set(guard);

    let pruned = prune_launch_files(&settings.dir, settings.keep_files);
    info!(
        log_file = %log_file.display(),
        keep = settings.keep_files,
        pruned,
        "Logging initialized"
    );
    Ok(())
}

/// `RUST_LOG` wins; otherwise the configured directives, then `info`.
fn env_filter(configured: Option<&str>) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    parse_filter(configured.unwrap_or(DEFAULT_DIRECTIVES))
}

fn parse_filter(directives: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(directives).map_err(|source| LoggingError::Filter {
        directives: directives.to_string(),
        source,
    })
}

// `rolling::never` panics when it cannot open its file, so the file is
// created here first.
fn create_launch_file(dir: &Path, started: OffsetDateTime, pid: u32) -> Result<PathBuf, LoggingError> {
    fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(launch_file_name(started, pid)?);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| LoggingError::CreateFile {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}

fn launch_file_name(started: OffsetDateTime, pid: u32) -> Result<String, LoggingError> {
    const STAMP: &[FormatItem<'_>] =
        format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    Ok(format!("{FILE_PREFIX}{}_{pid}{FILE_SUFFIX}", started.format(STAMP)?))
}

fn is_launch_file(name: &str) -> bool {
    name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX)
}

/// Delete all but the newest `keep` launch files. Returns how many went.
///
/// Runs after the subscriber is installed, so failures are logged and
/// skipped instead of stopping startup.
fn prune_launch_files(dir: &Path, keep: usize) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "Failed to list log directory");
            return 0;
        }
    };
    let mut launches: Vec<(String, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            is_launch_file(&name).then(|| (name, entry.path()))
        })
        .collect();
    launches.sort();

    let excess = launches.len().saturating_sub(keep.max(1));
    let mut pruned = 0;
    for (_, path) in launches.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => pruned += 1,
            Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove old log file"),
        }
    }
    pruned
}

fn local_timer() -> fmt::time::OffsetTime<time::format_description::BorrowedFormatItem<'static>> {
    const DISPLAY: &[FormatItem<'static>] =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    fmt::time::OffsetTime::new(offset, DISPLAY.into())
}

fn now_local_or_utc() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}
