//! Agent configuration stored as TOML under the agent root.

use crate::app_dirs;

pub(crate) mod defaults;
mod errors;
mod load;
mod save;
mod types;


/// Default filename used to store the agent configuration.
pub const CONFIG_FILE_NAME: &str = "config.toml";

pub use errors::ConfigError;
pub use load::{ResolvedDirs, config_path, load_from, load_or_default, resolve_dirs};
pub use save::{save, save_to_path};
pub use types::{AgentConfig, ResourceConfig};

fn map_app_dir_error(error: app_dirs::AppDirError) -> ConfigError {
    match error {
        app_dirs::AppDirError::NoBaseDir => ConfigError::NoConfigDir,
        app_dirs::AppDirError::CreateDir { path, source } => {
            ConfigError::CreateDir { path, source }
        }
    }
}
