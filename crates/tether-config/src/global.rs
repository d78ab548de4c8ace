//! Global Configuration (~/.tether/config.toml)
//!
//! User-level defaults, layered under the project file.

use crate::project::ConfigFile;
use crate::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};

/// Get the global configuration directory (~/.tether)
pub fn global_config_dir() -> ConfigResult<PathBuf> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    Ok(home.join(".tether"))
}

/// Get the global config file path (~/.tether/config.toml)
pub fn global_config_path() -> ConfigResult<PathBuf> {
    Ok(global_config_dir()?.join("config.toml"))
}

/// Load the global config at `path`; a missing file is an empty config
pub fn load_global_config(path: &Path) -> ConfigResult<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    ConfigFile::load_from_file(path)
}
