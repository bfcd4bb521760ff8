//! Agent directory helpers anchored to a single `.drift-agent` folder.
//!
//! Config, logs and the default data, temp and outbox directories live below
//! the OS config directory unless `DRIFT_AGENT_HOME` points elsewhere.

use std::{
    path::PathBuf,
    sync::{LazyLock, Mutex},
};

use directories::BaseDirs;
use thiserror::Error;

/// Name of the agent directory that lives under the OS config root.
pub const APP_DIR_NAME: &str = ".drift-agent";
/// Environment variable that replaces the OS config root.
pub const HOME_ENV_VAR: &str = "DRIFT_AGENT_HOME";

static CONFIG_BASE_OVERRIDE: LazyLock<Mutex<Option<PathBuf>>> = LazyLock::new(|| Mutex::new(None));

/// Errors that can occur while resolving or preparing agent directories.
#[derive(Debug, Error)]
pub enum AppDirError {
    #[error("No suitable base config directory available for agent files")]
    NoBaseDir,
    #[error("Failed to create agent directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Return the root `.drift-agent` directory, creating it if needed.
pub fn app_root_dir() -> Result<PathBuf, AppDirError> {
    let base = config_base_dir().ok_or(AppDirError::NoBaseDir)?;
    ensure_dir(base.join(APP_DIR_NAME))
}

pub fn logs_dir() -> Result<PathBuf, AppDirError> {
    ensure_dir(app_root_dir()?.join("logs"))
}

/// Default location of change-set directories.
pub fn data_dir() -> Result<PathBuf, AppDirError> {
    ensure_dir(app_root_dir()?.join("data"))
}

pub fn temp_dir() -> Result<PathBuf, AppDirError> {
    ensure_dir(app_root_dir()?.join("tmp"))
}

pub fn outbox_dir() -> Result<PathBuf, AppDirError> {
    ensure_dir(app_root_dir()?.join("outbox"))
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf, AppDirError> {
    std::fs::create_dir_all(&path).map_err(|source| AppDirError::CreateDir {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn config_base_dir() -> Option<PathBuf> {
    if let Some(path) = CONFIG_BASE_OVERRIDE
        .lock()
        .ok()
        .and_then(|guard| guard.clone())
    {
        return Some(path);
    }
    if let Ok(path) = std::env::var(HOME_ENV_VAR) {
        return Some(PathBuf::from(path));
    }
    BaseDirs::new().map(|dirs| dirs.config_dir().to_path_buf())
}

#[cfg(test)]
pub(crate) fn set_config_base_override(path: Option<PathBuf>) {
    let mut guard = CONFIG_BASE_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = path;
}

#[cfg(test)]
pub(crate) struct OverrideGuard(std::sync::MutexGuard<'static, ()>);

#[cfg(test)]
impl OverrideGuard {
    /// Point the agent root at `path` until dropped; serializes tests that do so.
    pub(crate) fn set(path: PathBuf) -> Self {
        static SERIAL: Mutex<()> = Mutex::new(());
        let lock = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set_config_base_override(Some(path));
        Self(lock)
    }
}

#[cfg(test)]
impl Drop for OverrideGuard {
    fn drop(&mut self) {
        set_config_base_override(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn uses_override_for_root_dir() {
        let base = tempdir().unwrap();
        let _guard = OverrideGuard::set(base.path().to_path_buf());
        let root = app_root_dir().unwrap();
        assert_eq!(root, base.path().join(APP_DIR_NAME));
        assert!(root.is_dir());
    }

    #[test]
    fn default_dirs_live_under_root() {
        let base = tempdir().unwrap();
        let _guard = OverrideGuard::set(base.path().to_path_buf());
        let root = base.path().join(APP_DIR_NAME);
        assert_eq!(data_dir().unwrap(), root.join("data"));
        assert_eq!(temp_dir().unwrap(), root.join("tmp"));
        assert_eq!(outbox_dir().unwrap(), root.join("outbox"));
        assert!(logs_dir().unwrap().is_dir());
    }
}
