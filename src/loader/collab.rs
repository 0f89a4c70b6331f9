//! Collaborators the loader drives but does not implement.
//!
//! - [`ModuleSearch`] turns a module name into a path
//! - [`ImageMapper`] produces a [`MappedImage`] for a path, either from an image file or from a
//!   built-in implementation
//! - [`EntryPoints`] runs module code: entry points and TLS callbacks
//!
//! [`crate::image::store::ImageStore`] implements the first two over in-memory images.
//! [`EntryTable`] implements the third by dispatching on the entry point address to registered
//! Rust closures.

use std::sync::Arc;

use dashmap::DashMap;
use strum::{Display, FromRepr};
use thiserror::Error;
use tracing::trace;

use crate::{
    image::MappedImage,
    loader::{config::base_name, module::ModuleHandle, LoaderSession},
    Error,
};

/// Resolves module names to paths.
pub trait ModuleSearch: Send + Sync {
    /// Find `name` in `directories`, or at the path it names. Returns the full path.
    fn search_for_module(&self, name: &str, directories: &[String]) -> Option<String>;

    /// Path a built-in implementation of `name` lives at.
    fn synthesize_builtin_path(&self, name: &str, system_directory: &str) -> Option<String> {
        Some(format!(
            "{}\\{}",
            system_directory.trim_end_matches(['\\', '/']),
            base_name(name)
        ))
    }
}

/// Failure of one load mechanism.
#[derive(Error, Debug)]
pub enum MapError {
    /// The mechanism has no image for the request; the next mechanism may be tried
    #[error("image not found")]
    NotFound,
    /// The image exists but could not be mapped; the load is aborted
    #[error(transparent)]
    Fatal(#[from] Error),
}

/// Produces mapped images.
pub trait ImageMapper: Send + Sync {
    /// Map the image file at `path`.
    fn map_native(&self, path: &str) -> std::result::Result<MappedImage, MapError>;

    /// Map the built-in implementation of the module `name`, to be known as `path`.
    fn map_builtin(&self, name: &str, path: &str) -> std::result::Result<MappedImage, MapError>;

    /// Release an image that was unloaded.
    fn unmap(&self, _image: &MappedImage) {}
}

/// Reason passed to entry points and TLS callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u32)]
pub enum DllReason {
    /// `DLL_PROCESS_DETACH`
    ProcessDetach = 0,
    /// `DLL_PROCESS_ATTACH`
    ProcessAttach = 1,
    /// `DLL_THREAD_ATTACH`
    ThreadAttach = 2,
    /// `DLL_THREAD_DETACH`
    ThreadDetach = 3,
}

/// One call into module code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryCall {
    /// The module being notified
    pub module: ModuleHandle,
    /// Its base name
    pub name: String,
    /// Its load address (the `hinstDLL` argument)
    pub base: u64,
    /// The routine being called
    pub address: u64,
    /// Notification reason
    pub reason: DllReason,
    /// The `lpReserved` argument: non-zero for static loads and process termination
    pub reserved: u64,
}

/// Runs module code.
///
/// Calls are made with the loader lock held. The [`LoaderSession`] passed in may be used to
/// load, query and unload further modules.
pub trait EntryPoints: Send + Sync {
    /// Call a module entry point. Returning `false` from a process attach fails the attach.
    fn call_entry(&self, session: &LoaderSession<'_>, call: &EntryCall) -> bool;

    /// Call a TLS callback.
    fn call_tls_callback(&self, session: &LoaderSession<'_>, call: &EntryCall) {
        self.call_entry(session, call);
    }
}

/// An entry point implemented in Rust.
pub type EntryRoutine = Arc<dyn Fn(&LoaderSession<'_>, &EntryCall) -> bool + Send + Sync>;

/// [`EntryPoints`] dispatching on the routine address.
///
/// Addresses without a registered routine succeed without doing anything.
#[derive(Default)]
pub struct EntryTable {
    routines: DashMap<u64, EntryRoutine>,
}

impl EntryTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `routine` to `address`.
    pub fn register<F>(&self, address: u64, routine: F)
    where
        F: Fn(&LoaderSession<'_>, &EntryCall) -> bool + Send + Sync + 'static,
    {
        self.routines.insert(address, Arc::new(routine));
    }

    /// Remove the routine bound to `address`.
    pub fn unregister(&self, address: u64) -> bool {
        self.routines.remove(&address).is_some()
    }
}

impl EntryPoints for EntryTable {
    fn call_entry(&self, session: &LoaderSession<'_>, call: &EntryCall) -> bool {
        // The shard lock must be released before calling out.
        let routine = self.routines.get(&call.address).map(|r| r.value().clone());
        match routine {
            Some(routine) => routine(session, call),
            None => {
                trace!("no routine at {:#x} for {}, skipping", call.address, call.name);
                true
            }
        }
    }
}
