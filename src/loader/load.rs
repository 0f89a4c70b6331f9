//! Module loading.
//!
//! A load request is resolved in four steps: find a path through [`ModuleSearch`], check the
//! module table for a module already loaded under that path (or, for bare names, under the
//! bare name), try the configured load mechanisms in order through [`ImageMapper`], and bind
//! the imports of the new module.
//!
//! [`ModuleSearch`]: crate::loader::collab::ModuleSearch
//! [`ImageMapper`]: crate::loader::collab::ImageMapper

use bitflags::bitflags;
use tracing::{debug, debug_span, trace, warn};

use crate::{
    image::MappedImage,
    loader::{
        collab::MapError,
        config::{base_name, contains_path, dir_name, LoadMechanism},
        module::{LoadCount, Module, ModuleFlags, ModuleHandle},
        LoaderSession,
    },
    Error, Result,
};

/// Alignment of addresses chosen for rebased images.
const REBASE_ALIGNMENT: u64 = 0x1_0000;

bitflags! {
    /// Flags of a load request (`LOAD_LIBRARY_*`).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LoadFlags: u32 {
        /// Map the module without binding its imports or attaching it
        const DONT_RESOLVE_DLL_REFERENCES = 0x0000_0001;
        /// Search the directory of a path-qualified request first, for nested loads too
        const LOAD_WITH_ALTERED_SEARCH_PATH = 0x0000_0008;
    }
}

impl LoaderSession<'_> {
    /// Load `name` and attach it (`LoadLibraryEx`).
    ///
    /// A module that is already loaded gets another reference. If the attach fails, the
    /// reference is released again through the normal unload path.
    ///
    /// # Errors
    /// Returns [`Error::ModuleNotFound`] if no mechanism has an image for `name`,
    /// [`Error::LoadFailed`] if mapping failed, the bind errors of
    /// [`Error::DependencyNotFound`] / [`Error::DependencyFailed`], [`Error::DllInitFailed`]
    /// if an entry point refused the attach and [`Error::ProcessDetaching`] during shutdown.
    pub fn load_module(&self, name: &str, flags: LoadFlags) -> Result<ModuleHandle> {
        let _span = debug_span!("load_module", module = name).entered();
        let handle = self.load_dll(name, flags)?;

        let unbound = self.with_state(|state| {
            state
                .table
                .get(handle)
                .is_some_and(|m| m.flags.contains(ModuleFlags::DONT_RESOLVE_REFS))
        });
        if unbound {
            return Ok(handle);
        }

        if let Err(e) = self.attach(handle) {
            warn!("attaching {} failed: {}", name, e);
            if let Err(e) = self.unload_module(handle) {
                warn!("unloading {} after failed attach failed: {}", name, e);
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Load the primary executable `name`. It is pinned and attached by
    /// [`LoaderSession::on_process_attach`].
    ///
    /// # Errors
    /// See [`LoaderSession::load_module`].
    pub fn load_executable(&self, name: &str) -> Result<ModuleHandle> {
        let _span = debug_span!("load_executable", module = name).entered();
        let handle = self.load_dll(name, LoadFlags::empty())?;
        self.with_state(|state| {
            if let Some(module) = state.table.get_mut(handle) {
                module.load_count = LoadCount::PINNED;
            }
        });
        Ok(handle)
    }

    /// Load `name` without attaching it.
    pub(crate) fn load_dll(&self, name: &str, flags: LoadFlags) -> Result<ModuleHandle> {
        if self.with_state(|state| state.process_detaching) {
            return Err(Error::ProcessDetaching);
        }

        let altered = match dir_name(name) {
            Some(dir) if flags.contains(LoadFlags::LOAD_WITH_ALTERED_SEARCH_PATH) => {
                Some(dir.to_string())
            }
            _ => None,
        };

        self.with_state(|state| state.load_depth += 1);
        let result = match altered {
            Some(directory) => {
                trace!("search path altered to {}", directory);
                let previous =
                    self.with_state(|state| state.altered_directory.replace(directory));
                let result = self.load_dll_inner(name, flags);
                self.with_state(|state| state.altered_directory = previous);
                result
            }
            None => self.load_dll_inner(name, flags),
        };
        self.with_state(|state| state.load_depth -= 1);
        result
    }

    fn load_dll_inner(&self, name: &str, flags: LoadFlags) -> Result<ModuleHandle> {
        let config = &self.loader.config;
        let request = config.with_extension(name);

        let directories = self.with_state(|state| {
            state
                .altered_directory
                .iter()
                .chain(config.search_paths.iter())
                .cloned()
                .collect::<Vec<_>>()
        });
        let found = self.loader.search.search_for_module(&request, &directories);
        let builtin_path = self
            .loader
            .search
            .synthesize_builtin_path(&request, &config.system_directory);
        let Some(path) = found.clone().or_else(|| builtin_path.clone()) else {
            return Err(Error::ModuleNotFound(request));
        };

        let mut existing = self.with_state(|state| state.table.find_by_name(&path));
        if existing.is_none() && !contains_path(name) {
            existing = self.with_state(|state| state.table.find_by_name(&request));
            if existing.is_some() {
                warn!("{} resolved to {} but is already loaded under another path", request, path);
            }
        }
        if let Some(handle) = existing {
            return self.load_existing(handle, flags);
        }

        let mut mapped = None;
        for mechanism in config.load_order_for(&request) {
            let attempt = match mechanism {
                LoadMechanism::Native => match &found {
                    Some(path) => self.loader.mapper.map_native(path),
                    None => Err(MapError::NotFound),
                },
                LoadMechanism::Builtin => self.loader.mapper.map_builtin(
                    base_name(&request),
                    builtin_path.as_deref().unwrap_or(&path),
                ),
            };
            match attempt {
                Ok(image) => {
                    mapped = Some((image, *mechanism));
                    break;
                }
                Err(MapError::NotFound) => {
                    trace!("{} mechanism has no image for {}", mechanism, request);
                }
                Err(MapError::Fatal(e)) => {
                    warn!("Failed to load module {}: {}", request, e);
                    return Err(Error::LoadFailed {
                        name: request,
                        reason: e.to_string(),
                    });
                }
            }
        }
        let Some((image, mechanism)) = mapped else {
            return Err(Error::ModuleNotFound(request));
        };

        let full_path = match mechanism {
            LoadMechanism::Native => path,
            LoadMechanism::Builtin => builtin_path.unwrap_or(path),
        };
        let handle = self.insert_module(image, &full_path, mechanism)?;

        if !flags.contains(LoadFlags::DONT_RESOLVE_DLL_REFERENCES) {
            if let Err(e) = self.bind_imports(handle) {
                self.discard_module(handle);
                return Err(e);
            }
        }

        self.with_state(|state| {
            if let Some(module) = state.table.get_mut(handle) {
                if !module.load_count.is_pinned() {
                    module.load_count = LoadCount::new(1);
                }
                debug!(
                    "Loaded module {} ({}) at {:#x}",
                    full_path, mechanism, module.image.base
                );
            }
        });
        Ok(handle)
    }

    fn load_existing(&self, handle: ModuleHandle, flags: LoadFlags) -> Result<ModuleHandle> {
        let needs_bind = self.with_state(|state| {
            let module = state.table.get_mut(handle).ok_or(Error::InvalidHandle)?;
            module.load_count.increment();
            trace!("Found {}, count={}", module.base_name(), module.load_count);
            Ok::<_, Error>(
                module.flags.contains(ModuleFlags::DONT_RESOLVE_REFS)
                    && !flags.contains(LoadFlags::DONT_RESOLVE_DLL_REFERENCES),
            )
        })?;

        if needs_bind {
            if let Err(e) = self.bind_imports(handle) {
                self.with_state(|state| {
                    if let Some(module) = state.table.get_mut(handle) {
                        module.load_count.decrement();
                    }
                });
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Place `image` in the address space and the module table.
    fn insert_module(
        &self,
        mut image: MappedImage,
        full_path: &str,
        mechanism: LoadMechanism,
    ) -> Result<ModuleHandle> {
        let late_tls = image.tls.is_some() && self.loader.tls.is_initialized();
        self.with_state(|state| {
            if state.table.overlaps(image.base, image.size as u64) {
                let highest = state.table.highest_address().max(image.base);
                let new_base = highest.div_ceil(REBASE_ALIGNMENT) * REBASE_ALIGNMENT;
                debug!("relocating {} from {:#x} to {:#x}", image.name, image.base, new_base);
                image.relocate(new_base).map_err(|e| match e {
                    Error::LoadFailed { .. } => e,
                    other => Error::LoadFailed {
                        name: image.name.clone(),
                        reason: other.to_string(),
                    },
                })?;
            }

            if !image.functions.is_empty() {
                self.loader.function_tables.register_module(
                    &image.name,
                    image.base,
                    image.size as u64,
                    image.functions.clone(),
                );
            }

            let mut module = Module::new(image, full_path, mechanism);
            if late_tls {
                warn!(
                    "{} has TLS data but was loaded after process start, pinning it without a slot",
                    full_path
                );
                module.load_count = LoadCount::PINNED;
            }
            Ok(state.table.insert(module))
        })
    }

    /// Undo a load whose bind failed: release the dependencies acquired so far and drop the
    /// module.
    ///
    /// The outermost failed load also detaches and unmaps the dependencies left without
    /// references. Nested loads leave that to their caller, whose own module is still
    /// unreferenced while it binds.
    fn discard_module(&self, handle: ModuleHandle) {
        let dependencies: Vec<ModuleHandle> = self.with_state(|state| {
            state
                .table
                .get(handle)
                .map(|m| m.all_dependencies().collect())
                .unwrap_or_default()
        });
        for dependency in dependencies {
            self.release(dependency);
        }
        self.free_module(handle);

        let outermost =
            self.with_state(|state| state.load_depth == 1 && state.free_lib_count == 0);
        if outermost {
            self.detach_sweep(false);
            self.flush_modules();
        }
    }

    /// Remove `handle` from the table and unmap it.
    pub(crate) fn free_module(&self, handle: ModuleHandle) {
        let Some(module) = self.with_state(|state| state.table.remove(handle)) else {
            return;
        };
        debug!("unmapping {} at {:#x}", module.names.full_path, module.image.base);
        if !module.image.functions.is_empty() {
            self.loader
                .function_tables
                .unregister_module(module.image.base);
        }
        self.loader.mapper.unmap(&module.image);
    }
}
