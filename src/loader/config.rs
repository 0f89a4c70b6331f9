//! Loader configuration.
//!
//! [`LoaderConfig`] carries the search order, the built-in module directory and the per-module
//! load order: the mechanisms ([`LoadMechanism::Native`] image files, [`LoadMechanism::Builtin`]
//! implementations provided by the embedding) tried in turn when a module is not yet loaded.
//!
//! Load order overrides use the familiar `WINEDLLOVERRIDES` syntax:
//!
//! ```text
//! comctl32=n,b;shell32,shlwapi=b;msvcrt=
//! ```
//!
//! Each entry names one or more modules (base names, extension optional) and the mechanisms to
//! try, in order. An empty mechanism list disables the module entirely.

use std::{collections::HashMap, str::FromStr};

use strum::{Display, EnumString};

use crate::{Error, Result};

const DEFAULT_SYSTEM_DIRECTORY: &str = "C:\\windows\\system32";
const DEFAULT_EXTENSION: &str = ".dll";
const DEFAULT_MAX_FORWARD_DEPTH: usize = 16;

/// A way of producing a module image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum LoadMechanism {
    /// Map the image file found by the search order
    #[strum(serialize = "native", serialize = "n")]
    Native,
    /// Map the implementation provided by the embedding
    #[strum(serialize = "builtin", serialize = "b")]
    Builtin,
}

/// Loader settings.
///
/// # Example
///
/// ```rust,ignore
/// use ldrkit::loader::{LoadMechanism, LoaderConfig};
///
/// let config = LoaderConfig::builtin_first()
///     .with_search_path("C:\\app")
///     .with_load_order("msvcrt", vec![LoadMechanism::Native])
///     .with_overrides("comctl32=n,b;shell32=b")?;
/// ```
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// Directories searched for image files, in order
    pub search_paths: Vec<String>,
    /// Directory used to synthesize paths of built-in modules
    pub system_directory: String,
    /// Extension appended to module names without one
    pub default_extension: String,
    /// Mechanisms tried for modules without an override
    pub default_load_order: Vec<LoadMechanism>,
    /// Per-module overrides, keyed by lowercase base name without extension
    pub load_order: HashMap<String, Vec<LoadMechanism>>,
    /// Maximum length of an export forwarder chain
    pub max_forward_depth: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::native_first()
    }
}

impl LoaderConfig {
    /// Prefer image files, fall back to built-in implementations.
    pub fn native_first() -> Self {
        Self::with_order(vec![LoadMechanism::Native, LoadMechanism::Builtin])
    }

    /// Prefer built-in implementations, fall back to image files.
    pub fn builtin_first() -> Self {
        Self::with_order(vec![LoadMechanism::Builtin, LoadMechanism::Native])
    }

    fn with_order(default_load_order: Vec<LoadMechanism>) -> Self {
        LoaderConfig {
            search_paths: Vec::new(),
            system_directory: DEFAULT_SYSTEM_DIRECTORY.to_string(),
            default_extension: DEFAULT_EXTENSION.to_string(),
            default_load_order,
            load_order: HashMap::new(),
            max_forward_depth: DEFAULT_MAX_FORWARD_DEPTH,
        }
    }

    /// Append a directory to the search order.
    pub fn with_search_path(mut self, path: impl Into<String>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Set the directory of built-in modules.
    pub fn with_system_directory(mut self, path: impl Into<String>) -> Self {
        self.system_directory = path.into();
        self
    }

    /// Override the mechanisms tried for `module`.
    pub fn with_load_order(mut self, module: &str, order: Vec<LoadMechanism>) -> Self {
        self.load_order.insert(order_key(module), order);
        self
    }

    /// Set the mechanisms tried for modules without an override.
    pub fn with_default_load_order(mut self, order: Vec<LoadMechanism>) -> Self {
        self.default_load_order = order;
        self
    }

    /// Set the extension appended to bare module names.
    pub fn with_default_extension(mut self, extension: impl Into<String>) -> Self {
        self.default_extension = extension.into();
        self
    }

    /// Set the maximum export forwarder chain length.
    pub fn with_max_forward_depth(mut self, depth: usize) -> Self {
        self.max_forward_depth = depth;
        self
    }

    /// Apply the overrides in `overrides`, see [`LoaderConfig::parse_load_order`].
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] for unknown mechanisms.
    pub fn with_overrides(mut self, overrides: &str) -> Result<Self> {
        for (module, order) in Self::parse_load_order(overrides)? {
            self.load_order.insert(module, order);
        }
        Ok(self)
    }

    /// Parse a load order override string such as `"libfoo=n,b;libbar,libbaz=b"`.
    ///
    /// Module keys are returned lowercased with their extension stripped.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] for unknown mechanisms and entries without `=`.
    pub fn parse_load_order(overrides: &str) -> Result<Vec<(String, Vec<LoadMechanism>)>> {
        let mut entries = Vec::new();
        for entry in overrides.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((modules, mechanisms)) = entry.split_once('=') else {
                return Err(Error::NotSupported(format!(
                    "load order entry '{}' has no mechanism list",
                    entry
                )));
            };

            let order = mechanisms
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(|m| {
                    LoadMechanism::from_str(m).map_err(|_| {
                        Error::NotSupported(format!("unknown load mechanism '{}'", m))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            for module in modules.split(',').map(str::trim).filter(|m| !m.is_empty()) {
                entries.push((order_key(module), order.clone()));
            }
        }
        Ok(entries)
    }

    /// Mechanisms to try for `name` (a path or base name).
    pub fn load_order_for(&self, name: &str) -> &[LoadMechanism] {
        self.load_order
            .get(&order_key(name))
            .unwrap_or(&self.default_load_order)
    }

    /// `name` with the default extension appended if its base name has none.
    pub fn with_extension(&self, name: &str) -> String {
        if base_name(name).contains('.') {
            name.to_string()
        } else {
            format!("{}{}", name, self.default_extension)
        }
    }
}

/// Final path component of `path`, accepting both separators.
pub(crate) fn base_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Directory part of `path`, without the trailing separator.
pub(crate) fn dir_name(path: &str) -> Option<&str> {
    path.rfind(['\\', '/']).map(|at| &path[..at])
}

/// Whether `name` names a location rather than a bare module.
pub(crate) fn contains_path(name: &str) -> bool {
    name.contains(['\\', '/', ':'])
}

fn order_key(name: &str) -> String {
    let base = base_name(name);
    let stem = match base.rfind('.') {
        Some(at) if at > 0 => &base[..at],
        _ => base,
    };
    stem.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanism_parse() {
        assert_eq!(LoadMechanism::from_str("n").unwrap(), LoadMechanism::Native);
        assert_eq!(LoadMechanism::from_str("Builtin").unwrap(), LoadMechanism::Builtin);
        assert!(LoadMechanism::from_str("x").is_err());
        assert_eq!(LoadMechanism::Native.to_string(), "native");
    }

    #[test]
    fn test_parse_load_order() {
        let entries = LoaderConfig::parse_load_order("libfoo=n,b; Shell32.dll,shlwapi=b;msvcrt=")
            .unwrap();
        assert_eq!(
            entries,
            vec![
                (
                    "libfoo".to_string(),
                    vec![LoadMechanism::Native, LoadMechanism::Builtin]
                ),
                ("shell32".to_string(), vec![LoadMechanism::Builtin]),
                ("shlwapi".to_string(), vec![LoadMechanism::Builtin]),
                ("msvcrt".to_string(), vec![]),
            ]
        );

        assert!(LoaderConfig::parse_load_order("libfoo").is_err());
        assert!(LoaderConfig::parse_load_order("libfoo=q").is_err());
    }

    #[test]
    fn test_load_order_lookup() {
        let config = LoaderConfig::native_first()
            .with_overrides("libfoo=b")
            .unwrap();

        assert_eq!(
            config.load_order_for("C:\\dir\\LIBFOO.DLL"),
            &[LoadMechanism::Builtin]
        );
        assert_eq!(
            config.load_order_for("other.dll"),
            &[LoadMechanism::Native, LoadMechanism::Builtin]
        );
    }

    #[test]
    fn test_name_helpers() {
        let config = LoaderConfig::default();
        assert_eq!(config.with_extension("kernel32"), "kernel32.dll");
        assert_eq!(config.with_extension("app.exe"), "app.exe");
        assert_eq!(config.with_extension("C:\\a.b\\lib"), "C:\\a.b\\lib.dll");
        assert_eq!(base_name("C:\\dir/sub\\x.dll"), "x.dll");
        assert_eq!(dir_name("C:\\dir\\x.dll"), Some("C:\\dir"));
        assert_eq!(dir_name("x.dll"), None);
        assert!(contains_path("C:x.dll"));
        assert!(!contains_path("x.dll"));
    }
}
