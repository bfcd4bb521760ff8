use std::path::{Path, PathBuf};

use crate::app_dirs;

use super::{AgentConfig, CONFIG_FILE_NAME, ConfigError, map_app_dir_error};

/// Resolve the configuration file path, ensuring the parent directory exists.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let dir = app_dirs::app_root_dir().map_err(map_app_dir_error)?;
    Ok(dir.join(CONFIG_FILE_NAME))
}

/// Load the configuration from the agent root, returning defaults if missing.
pub fn load_or_default() -> Result<AgentConfig, ConfigError> {
    load_from(&config_path()?)
}

/// Load and normalize configuration from `path`; a missing file yields defaults.
pub fn load_from(path: &Path) -> Result<AgentConfig, ConfigError> {
    if !path.exists() {
        return Ok(AgentConfig::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: AgentConfig = toml::from_str(&text).map_err(|source| ConfigError::ParseToml {
        path: path.to_path_buf(),
        source,
    })?;
    let config = config.normalized();
    if let Some(reason) = config.problem() {
        return Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        });
    }
    Ok(config)
}

/// Directories the agent runs with after applying defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDirs {
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub log_dir: PathBuf,
}

/// Fill unset directories from the agent root.
pub fn resolve_dirs(config: &AgentConfig) -> Result<ResolvedDirs, ConfigError> {
    let pick = |configured: &Option<PathBuf>,
                fallback: fn() -> Result<PathBuf, app_dirs::AppDirError>|
     -> Result<PathBuf, ConfigError> {
        match configured {
            Some(path) => Ok(path.clone()),
            None => fallback().map_err(map_app_dir_error),
        }
    };
    Ok(ResolvedDirs {
        data_dir: pick(&config.data_dir, app_dirs::data_dir)?,
        temp_dir: pick(&config.temp_dir, app_dirs::temp_dir)?,
        outbox_dir: pick(&config.outbox_dir, app_dirs::outbox_dir)?,
        log_dir: pick(&config.log_dir, app_dirs::logs_dir)?,
    })
}
