//! Dynamic library loading for FFI
//!
//! Provides cross-platform dynamic library loading using `libloading`.
//! Handles platform-specific library naming conventions (including
//! versioned sonames such as `libclang.so.1`) and search paths.

use libloading::{Library, Symbol};
use std::collections::HashMap;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tether_config::Config;
use thiserror::Error;

/// Library loading errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// Library file not found in search paths
    #[error("Library not found: {0}")]
    LibraryNotFound(String),
    /// Symbol not found in library
    #[error("Symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound { library: String, symbol: String },
    /// The file exists but could not be loaded
    #[error("Failed to load library {path}: {reason}")]
    LoadFailed { path: PathBuf, reason: String },
}

/// Dynamic library loader with caching and platform-specific path resolution
///
/// # Safety
///
/// Loading dynamic libraries is inherently unsafe. The loaded code runs in the
/// same process and can perform arbitrary operations.
pub struct LibraryLoader {
    /// Cache of loaded libraries by resolved path
    loaded: HashMap<PathBuf, Rc<Library>>,
    /// Search paths, highest priority first
    search_paths: Vec<PathBuf>,
}

impl LibraryLoader {
    /// Create a new library loader with default search paths
    pub fn new() -> Self {
        Self {
            loaded: HashMap::new(),
            search_paths: Self::default_search_paths(),
        }
    }

    /// Loader searching the configured paths before the defaults
    pub fn from_config(config: &Config) -> Self {
        let mut search_paths = config.search_paths().to_vec();
        search_paths.extend(Self::default_search_paths());
        Self {
            loaded: HashMap::new(),
            search_paths,
        }
    }

    /// Get platform-specific default library search paths
    ///
    /// - Linux: /usr/lib, /usr/local/lib, /lib (+ lib64, multiarch and LLVM dirs)
    /// - macOS: /usr/lib, /usr/local/lib, /opt/homebrew/lib, Homebrew LLVM
    /// - Windows: the LLVM install dir, System32
    /// - All platforms: current working directory first
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/lib"));

            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
            }
            paths.push(PathBuf::from(format!("/usr/lib/{}-linux-gnu", std::env::consts::ARCH)));
            paths.extend(versioned_llvm_dirs(Path::new("/usr/lib")));
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
            paths.push(PathBuf::from("/opt/homebrew/opt/llvm/lib"));
            paths.push(PathBuf::from("/usr/local/opt/llvm/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            paths.push(PathBuf::from("C:\\Program Files\\LLVM\\bin"));
            if let Ok(system_root) = std::env::var("SystemRoot") {
                paths.push(PathBuf::from(format!("{}\\System32", system_root)));
            }
        }

        paths
    }

    /// Search paths, highest priority first
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Resolve library name to full path with platform-specific naming
    ///
    /// - Linux: lib{name}.so, then lib{name}.so.{version} (highest version wins)
    /// - macOS: lib{name}.dylib or lib{name}.so
    /// - Windows: {name}.dll or lib{name}.dll
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.components().count() > 1 || path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }

        let candidates = candidate_file_names(name);
        for search_path in &self.search_paths {
            for filename in &candidates {
                let full_path = search_path.join(filename);
                if full_path.exists() {
                    return Some(full_path);
                }
            }
            if let Some(versioned) = versioned_soname(search_path, name) {
                return Some(versioned);
            }
        }

        None
    }

    /// Load a library by name or path
    ///
    /// Returns the cached instance if the resolved path was loaded before.
    /// The library stays loaded while any returned `Rc` is alive.
    pub fn load(&mut self, name: &str) -> Result<Rc<Library>, LoadError> {
        let path = self
            .resolve(name)
            .ok_or_else(|| LoadError::LibraryNotFound(name.to_string()))?;

        if let Some(library) = self.loaded.get(&path) {
            return Ok(Rc::clone(library));
        }

        log::debug!("loading {} from {}", name, path.display());
        let library = unsafe {
            Library::new(&path).map_err(|e| LoadError::LoadFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?
        };
        let library = Rc::new(library);
        self.loaded.insert(path, Rc::clone(&library));
        Ok(library)
    }

    /// Add a custom search path (prepended to search list)
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    /// Get the number of loaded libraries
    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Address of a function symbol
///
/// # Safety
///
/// The caller must use the address with the symbol's actual signature and
/// keep the library loaded while the address is in use.
pub unsafe fn lookup_symbol(library: &Library, library_name: &str, symbol: &str) -> Result<*const c_void, LoadError> {
    let found: Symbol<'_, unsafe extern "C" fn()> =
        library
            .get(symbol.as_bytes())
            .map_err(|_| LoadError::SymbolNotFound {
                library: library_name.to_string(),
                symbol: symbol.to_string(),
            })?;
    Ok(*found as *const c_void)
}

fn candidate_file_names(name: &str) -> Vec<String> {
    let (prefixes, extensions): (&[&str], &[&str]) = if cfg!(target_os = "windows") {
        (&["", "lib"], &["dll"])
    } else if cfg!(target_os = "macos") {
        (&["lib", ""], &["dylib", "so"])
    } else {
        (&["lib", ""], &["so"])
    };
    let mut names = Vec::with_capacity(prefixes.len() * extensions.len());
    for prefix in prefixes {
        for ext in extensions {
            names.push(format!("{}{}.{}", prefix, name, ext));
        }
    }
    names
}

/// `lib{name}.so.N[.M...]` in `dir`, highest version first
fn versioned_soname(dir: &Path, name: &str) -> Option<PathBuf> {
    if cfg!(target_os = "windows") || cfg!(target_os = "macos") {
        return None;
    }
    let prefix = format!("lib{}.so.", name);
    let mut found: Vec<(Vec<u32>, PathBuf)> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name().into_string().ok()?;
            let version = file_name.strip_prefix(&prefix)?;
            let parts = version
                .split('.')
                .map(|part| part.parse().ok())
                .collect::<Option<Vec<u32>>>()?;
            Some((parts, entry.path()))
        })
        .collect();
    found.sort();
    found.pop().map(|(_, path)| path)
}

/// `{root}/llvm-N/lib`, newest first
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn versioned_llvm_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<(u32, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name().into_string().ok()?;
            let version = file_name.strip_prefix("llvm-")?.parse().ok()?;
            Some((version, entry.path().join("lib")))
        })
        .collect();
    dirs.sort_by(|a, b| b.0.cmp(&a.0));
    dirs.into_iter().map(|(_, path)| path).collect()
}
