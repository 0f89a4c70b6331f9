//! In-memory image source.
//!
//! [`ImageStore`] holds prepared [`MappedImage`]s under two namespaces: image files keyed by
//! their full path, and built-in implementations keyed by module base name. It resolves and
//! maps modules for the loader without touching the host filesystem, which makes it the
//! backend of embeddings that synthesize their system libraries and of the test suite.
//!
//! Lookups are case-insensitive, as module names are on Windows.

use dashmap::DashMap;
use tracing::trace;

use crate::{
    image::MappedImage,
    loader::{
        collab::{ImageMapper, MapError, ModuleSearch},
        config::{base_name, contains_path},
    },
};

/// Thread-safe collection of prepared images.
#[derive(Default)]
pub struct ImageStore {
    /// Lowercased full path -> (path as registered, image)
    files: DashMap<String, (String, MappedImage)>,
    /// Lowercased base name -> image
    builtins: DashMap<String, MappedImage>,
}

impl ImageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `image` as the image file at `path`.
    pub fn add_file(&self, path: &str, image: MappedImage) {
        self.files
            .insert(path.to_ascii_lowercase(), (path.to_string(), image));
    }

    /// Register `image` as the built-in implementation of the module named `image.name`.
    pub fn add_builtin(&self, image: MappedImage) {
        self.builtins
            .insert(base_name(&image.name).to_ascii_lowercase(), image);
    }

    /// Remove the image file at `path`.
    pub fn remove_file(&self, path: &str) -> bool {
        self.files.remove(&path.to_ascii_lowercase()).is_some()
    }

    /// Remove the built-in module `name`.
    pub fn remove_builtin(&self, name: &str) -> bool {
        self.builtins
            .remove(&base_name(name).to_ascii_lowercase())
            .is_some()
    }

    /// Number of registered image files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of registered built-in modules.
    pub fn builtin_count(&self) -> usize {
        self.builtins.len()
    }

    fn lookup_file(&self, path: &str) -> Option<String> {
        self.files
            .get(&path.to_ascii_lowercase())
            .map(|entry| entry.value().0.clone())
    }
}

impl ModuleSearch for ImageStore {
    fn search_for_module(&self, name: &str, directories: &[String]) -> Option<String> {
        if contains_path(name) {
            return self.lookup_file(name);
        }
        directories.iter().find_map(|directory| {
            let candidate = format!("{}\\{}", directory.trim_end_matches(['\\', '/']), name);
            self.lookup_file(&candidate)
        })
    }
}

impl ImageMapper for ImageStore {
    fn map_native(&self, path: &str) -> Result<MappedImage, MapError> {
        match self.files.get(&path.to_ascii_lowercase()) {
            Some(entry) => {
                trace!("mapping {} from the image store", path);
                Ok(entry.value().1.clone())
            }
            None => Err(MapError::NotFound),
        }
    }

    fn map_builtin(&self, name: &str, _path: &str) -> Result<MappedImage, MapError> {
        self.builtins
            .get(&base_name(name).to_ascii_lowercase())
            .map(|entry| entry.value().clone())
            .ok_or(MapError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::ImageBuilder;

    #[test]
    fn test_search_is_case_insensitive() {
        let store = ImageStore::new();
        store.add_file(
            "C:\\App\\Plugin.dll",
            ImageBuilder::dll("Plugin.dll").build().unwrap(),
        );

        let dirs = vec!["c:\\windows".to_string(), "c:\\app\\".to_string()];
        assert_eq!(
            store.search_for_module("PLUGIN.DLL", &dirs).as_deref(),
            Some("C:\\App\\Plugin.dll")
        );
        assert_eq!(
            store.search_for_module("c:\\app\\plugin.dll", &[]).as_deref(),
            Some("C:\\App\\Plugin.dll")
        );
        assert_eq!(store.search_for_module("other.dll", &dirs), None);
        assert_eq!(store.search_for_module("d:\\plugin.dll", &dirs), None);
    }

    #[test]
    fn test_map_sources() {
        let store = ImageStore::new();
        store.add_file("C:\\a\\file.dll", ImageBuilder::dll("file.dll").build().unwrap());
        store.add_builtin(ImageBuilder::dll("Builtin.dll").build().unwrap());
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.builtin_count(), 1);

        assert_eq!(store.map_native("c:\\A\\FILE.dll").unwrap().name, "file.dll");
        assert!(matches!(store.map_native("c:\\b\\file.dll"), Err(MapError::NotFound)));
        assert_eq!(
            store.map_builtin("builtin.DLL", "c:\\windows\\system32\\builtin.dll").unwrap().name,
            "Builtin.dll"
        );
        assert!(matches!(store.map_builtin("file.dll", ""), Err(MapError::NotFound)));

        assert!(store.remove_builtin("BUILTIN.dll"));
        assert!(!store.remove_builtin("builtin.dll"));
        assert!(store.remove_file("C:\\A\\File.dll"));
        assert_eq!(store.file_count(), 0);
    }
}
