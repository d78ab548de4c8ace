//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::global;
use crate::project::{ArrayLength, ConfigFile};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const CONFIG_FILE_NAME: &str = "tether.toml";

/// Library loaded when nothing is configured
pub const DEFAULT_LIBRARY: &str = "clang";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.tether/config.toml) - lowest priority
/// 2. Project config (./tether.toml) - overrides global
/// 3. Environment variables (TETHER_*) - overrides project
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Merged file contents after environment overrides
    pub file: ConfigFile,

    /// Project root directory (where tether.toml was found)
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use a specific global config file instead of ~/.tether/config.toml
    pub fn with_global_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_config_path = Some(path.into());
        self
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find tether.toml, then merges it over
    /// the global config if one exists.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project) = self.find_project_config(start_dir)?;
        self.assemble(project_root, project)
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project = ConfigFile::load_from_file(config_path)?;
        let project_root = config_path.parent().map(|p| p.to_path_buf());
        self.assemble(project_root, project)
    }

    fn assemble(&mut self, project_root: Option<PathBuf>, project: ConfigFile) -> ConfigResult<Config> {
        let mut file = self.load_global_config()?;
        file.merge(&resolve_relative(project, project_root.as_deref()));
        let file = self.apply_env_overrides(file)?;
        Ok(Config { file, project_root })
    }

    /// Find project configuration by walking up directory tree
    ///
    /// Returns (project_root, project_config); no file found is an empty config
    fn find_project_config(&self, start_dir: &Path) -> ConfigResult<(Option<PathBuf>, ConfigFile)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(CONFIG_FILE_NAME);

            if config_path.exists() {
                let project_config = ConfigFile::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, ConfigFile::default())),
            }
        }
    }

    /// Load global configuration from ~/.tether/config.toml
    fn load_global_config(&mut self) -> ConfigResult<ConfigFile> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => match global::global_config_path() {
                Ok(path) => {
                    self.global_config_path = Some(path.clone());
                    path
                }
                // No home directory: there is no global config to merge
                Err(ConfigError::HomeNotFound) => return Ok(ConfigFile::default()),
                Err(e) => return Err(e),
            },
        };
        global::load_global_config(&path)
    }

    /// Apply environment variable overrides
    ///
    /// - TETHER_LIBRARY: library name or path
    /// - TETHER_LIBRARY_PATH: extra search directories (platform path list), searched first
    /// - TETHER_ARRAY_LENGTH: "pad" or "strict"
    fn apply_env_overrides(&self, mut config: ConfigFile) -> ConfigResult<ConfigFile> {
        if let Ok(name) = env::var("TETHER_LIBRARY") {
            config.library.get_or_insert_with(Default::default).name = Some(name);
        }

        if let Some(paths) = env::var_os("TETHER_LIBRARY_PATH") {
            let library = config.library.get_or_insert_with(Default::default);
            let mut search_paths: Vec<PathBuf> = env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            search_paths.append(&mut library.search_paths);
            library.search_paths = search_paths;
        }

        if let Ok(array_length) = env::var("TETHER_ARRAY_LENGTH") {
            config.marshal.get_or_insert_with(Default::default).array_length = Some(array_length);
        }

        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_relative(mut config: ConfigFile, root: Option<&Path>) -> ConfigFile {
    if let (Some(library), Some(root)) = (config.library.as_mut(), root) {
        for path in &mut library.search_paths {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
    }
    config
}

impl Config {
    /// Effective library name (configured or "clang")
    pub fn library_name(&self) -> &str {
        self.file
            .library
            .as_ref()
            .and_then(|l| l.name.as_deref())
            .unwrap_or(DEFAULT_LIBRARY)
    }

    /// Configured search paths, highest priority first
    pub fn search_paths(&self) -> &[PathBuf] {
        self.file
            .library
            .as_ref()
            .map(|l| l.search_paths.as_slice())
            .unwrap_or(&[])
    }

    /// Effective array length policy
    pub fn array_length(&self) -> ArrayLength {
        self.file
            .marshal
            .as_ref()
            .and_then(|m| m.array_length.as_deref())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    /// Whether leaked handles are reported (default: true)
    pub fn warn_on_leak(&self) -> bool {
        self.file
            .finalization
            .as_ref()
            .and_then(|f| f.warn_on_leak)
            .unwrap_or(true)
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if a tether.toml was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn create_config_file(dir: &Path, content: &str) -> PathBuf {
        let config_path = dir.join(CONFIG_FILE_NAME);
        fs::write(&config_path, content).unwrap();
        config_path
    }

    fn loader(temp_dir: &TempDir) -> ConfigLoader {
        ConfigLoader::new().with_global_config_path(temp_dir.path().join("no-global.toml"))
    }

    #[test]
    #[serial]
    fn test_load_project_config() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "[library]\nname = \"clang-17\"\n");

        let config = loader(&temp_dir).load_from_directory(temp_dir.path()).unwrap();

        assert_eq!(config.library_name(), "clang-17");
        assert!(config.is_project());
    }

    #[test]
    #[serial]
    fn test_defaults_without_project() {
        let temp_dir = TempDir::new().unwrap();

        let config = loader(&temp_dir).load_from_directory(temp_dir.path()).unwrap();

        assert!(!config.is_project());
        assert_eq!(config.library_name(), "clang");
        assert_eq!(config.array_length(), ArrayLength::Pad);
        assert!(config.warn_on_leak());
    }

    #[test]
    #[serial]
    fn test_relative_search_paths_resolved_against_root() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "[library]\nsearch_paths = [\"vendor/lib\"]\n");

        let config = loader(&temp_dir).load_from_directory(temp_dir.path()).unwrap();

        assert_eq!(config.search_paths(), &[temp_dir.path().join("vendor/lib")]);
    }

    #[test]
    #[serial]
    fn test_env_override_array_length() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "[marshal]\narray_length = \"pad\"\n");

        env::set_var("TETHER_ARRAY_LENGTH", "strict");
        let config = loader(&temp_dir).load_from_directory(temp_dir.path());
        env::remove_var("TETHER_ARRAY_LENGTH");

        assert_eq!(config.unwrap().array_length(), ArrayLength::Strict);
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_value_rejected() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("TETHER_ARRAY_LENGTH", "sloppy");
        let result = loader(&temp_dir).load_from_directory(temp_dir.path());
        env::remove_var("TETHER_ARRAY_LENGTH");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
