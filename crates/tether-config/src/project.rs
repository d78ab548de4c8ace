//! Configuration file schema (tether.toml)
//!
//! The same schema is used for the project file and the global file. Every
//! field is optional so files can be layered; `Config` resolves defaults.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Contents of one configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Native library to load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<LibrarySection>,

    /// Struct marshalling behaviour
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marshal: Option<MarshalSection>,

    /// Handle finalization behaviour
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalization: Option<FinalizationSection>,
}

/// `[library]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LibrarySection {
    /// Library name without platform prefix/suffix (e.g. "clang"), or a path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Extra directories searched before the system defaults
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,
}

/// `[marshal]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct MarshalSection {
    /// "pad" or "strict"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array_length: Option<String>,
}

/// `[finalization]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FinalizationSection {
    /// Log a warning when owned handles are still pending at shutdown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warn_on_leak: Option<bool>,
}

/// Fixed-array length mismatch handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayLength {
    /// Zero-fill short lists, truncate long ones
    #[default]
    Pad,
    /// Reject mismatched lengths
    Strict,
}

impl FromStr for ArrayLength {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pad" => Ok(ArrayLength::Pad),
            "strict" => Ok(ArrayLength::Strict),
            _ => Err(ConfigError::InvalidValue {
                field: "marshal.array_length".to_string(),
                reason: format!("must be 'pad' or 'strict', got '{}'", s),
            }),
        }
    }
}

impl fmt::Display for ArrayLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayLength::Pad => write!(f, "pad"),
            ArrayLength::Strict => write!(f, "strict"),
        }
    }
}

impl ConfigFile {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate field values
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(library) = &self.library {
            if let Some(name) = &library.name {
                if name.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "library.name".to_string(),
                        reason: "must not be empty".to_string(),
                    });
                }
            }
            for path in &library.search_paths {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::InvalidPath(path.clone()));
                }
            }
        }

        if let Some(marshal) = &self.marshal {
            if let Some(value) = &marshal.array_length {
                value.parse::<ArrayLength>()?;
            }
        }

        Ok(())
    }

    /// Merge another file into this one
    /// Other config takes precedence for set values; search paths accumulate
    pub fn merge(&mut self, other: &ConfigFile) {
        if let Some(theirs) = &other.library {
            let ours = self.library.get_or_insert_with(Default::default);
            if theirs.name.is_some() {
                ours.name = theirs.name.clone();
            }
            let mut paths = theirs.search_paths.clone();
            paths.append(&mut ours.search_paths);
            ours.search_paths = paths;
        }
        if let Some(theirs) = &other.marshal {
            if theirs.array_length.is_some() {
                self.marshal.get_or_insert_with(Default::default).array_length = theirs.array_length.clone();
            }
        }
        if let Some(theirs) = &other.finalization {
            if theirs.warn_on_leak.is_some() {
                self.finalization.get_or_insert_with(Default::default).warn_on_leak = theirs.warn_on_leak;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[library]
name = "clang"
search_paths = ["/usr/lib/llvm-17/lib"]

[marshal]
array_length = "strict"

[finalization]
warn_on_leak = false
"#;

        let config: ConfigFile = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.library.as_ref().unwrap().name.as_deref(), Some("clang"));
        assert_eq!(config.marshal.unwrap().array_length.as_deref(), Some("strict"));
        assert_eq!(config.finalization.unwrap().warn_on_leak, Some(false));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = r#"
[library]
nmae = "clang"
"#;
        assert!(toml::from_str::<ConfigFile>(toml).is_err());
    }

    #[test]
    fn test_invalid_array_length() {
        let config = ConfigFile {
            marshal: Some(MarshalSection {
                array_length: Some("loose".to_string()),
            }),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_empty_library_name_rejected() {
        let config = ConfigFile {
            library: Some(LibrarySection {
                name: Some("  ".to_string()),
                search_paths: Vec::new(),
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_prefers_overlay_and_accumulates_paths() {
        let mut base = ConfigFile {
            library: Some(LibrarySection {
                name: Some("clang".to_string()),
                search_paths: vec![PathBuf::from("/global")],
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            library: Some(LibrarySection {
                name: None,
                search_paths: vec![PathBuf::from("/project")],
            }),
            marshal: Some(MarshalSection {
                array_length: Some("strict".to_string()),
            }),
            ..Default::default()
        };

        base.merge(&overlay);
        let library = base.library.unwrap();
        assert_eq!(library.name.as_deref(), Some("clang"));
        assert_eq!(library.search_paths, vec![PathBuf::from("/project"), PathBuf::from("/global")]);
        assert_eq!(base.marshal.unwrap().array_length.as_deref(), Some("strict"));
    }

    #[test]
    fn test_array_length_from_str_case_insensitive() {
        assert_eq!("PAD".parse::<ArrayLength>().unwrap(), ArrayLength::Pad);
        assert_eq!(ArrayLength::Strict.to_string(), "strict");
    }
}
