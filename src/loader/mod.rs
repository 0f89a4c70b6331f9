//! The module loader.
//!
//! [`Loader`] owns the process's module graph: it loads images through the configured
//! [`collab::ModuleSearch`] and [`collab::ImageMapper`], binds their imports, drives entry points
//! through [`collab::EntryPoints`] and hands out thread-local storage.
//!
//! # Locking
//!
//! All loader operations are serialized by one reentrant lock. Holding it is represented by a
//! [`LoaderSession`]; the convenience methods on [`Loader`] open a session per call. Entry
//! points run with the lock held and receive the session, so module code may load, query and
//! unload further modules on the same thread.
//!
//! The bookkeeping (module table and loader scratch state) sits behind a separate short-held
//! mutex that is never held across a call into module code.
//!
//! # Key Components
//!
//! - [`module`] - module handles, flags, reference counts and info snapshots
//! - [`exports`] - export lookup and forwarder resolution
//! - [`imports`] - import binding and unresolved import slots
//! - [`load`] - the load path and [`LoadFlags`]
//! - [`lifecycle`] - attach, detach, unload and thread notifications
//! - [`tls`] - thread-local storage slots and blocks
//! - [`config`] - [`LoaderConfig`] and load order overrides
//!
//! # Example
//!
//! ```rust,ignore
//! use ldrkit::prelude::*;
//!
//! let loader = Loader::builder(LoaderConfig::builtin_first())
//!     .search(store.clone())
//!     .mapper(store)
//!     .entry_points(entries)
//!     .build();
//!
//! let app = loader.start_process("app.exe")?;
//! let sleep = loader.get_procedure_address(loader.get_module_handle("kernel32.dll").unwrap(), "Sleep".into())?;
//! ```

use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::{
    image::{store::ImageStore, MappedImage},
    unwind::table::FunctionTables,
    Error, Result,
};

pub mod collab;
pub mod config;
pub mod exports;
pub mod imports;
pub mod lifecycle;
pub mod load;
pub mod module;
pub(crate) mod table;
pub mod tls;

pub use collab::{DllReason, EntryCall, EntryPoints, EntryTable, ImageMapper, MapError, ModuleSearch};
pub use config::{LoadMechanism, LoaderConfig};
pub use exports::Procedure;
pub use imports::ImportSlot;
pub use load::LoadFlags;
pub use module::{LoadCount, ModuleFlags, ModuleHandle, ModuleInfo, ModuleState};
pub use tls::TlsAllocator;

use table::ModuleTable;

/// Bookkeeping guarded by the short-held mutex.
#[derive(Default)]
pub(crate) struct LoaderState {
    pub table: ModuleTable,
    /// Directory searched first while a `LOAD_WITH_ALTERED_SEARCH_PATH` load runs
    pub altered_directory: Option<String>,
    /// Nesting depth of `unload_module`
    pub free_lib_count: u32,
    /// Nesting depth of module loads
    pub load_depth: u32,
    pub process_detaching: bool,
}

/// The process module loader.
pub struct Loader {
    config: LoaderConfig,
    search: Arc<dyn ModuleSearch>,
    mapper: Arc<dyn ImageMapper>,
    entry_points: Arc<dyn EntryPoints>,
    function_tables: Arc<FunctionTables>,
    tls: TlsAllocator,
    lock: ReentrantMutex<()>,
    state: Mutex<LoaderState>,
}

/// Builder for [`Loader`].
pub struct LoaderBuilder {
    config: LoaderConfig,
    search: Option<Arc<dyn ModuleSearch>>,
    mapper: Option<Arc<dyn ImageMapper>>,
    entry_points: Option<Arc<dyn EntryPoints>>,
    function_tables: Option<Arc<FunctionTables>>,
}

impl LoaderBuilder {
    /// Set the path resolver. Defaults to an empty [`ImageStore`].
    pub fn search(mut self, search: Arc<dyn ModuleSearch>) -> Self {
        self.search = Some(search);
        self
    }

    /// Set the image source. Defaults to an empty [`ImageStore`].
    pub fn mapper(mut self, mapper: Arc<dyn ImageMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Set the entry point runner. Defaults to an empty [`EntryTable`].
    pub fn entry_points(mut self, entry_points: Arc<dyn EntryPoints>) -> Self {
        self.entry_points = Some(entry_points);
        self
    }

    /// Share `tables` with the unwinder; loaded modules register their function tables there.
    pub fn function_tables(mut self, tables: Arc<FunctionTables>) -> Self {
        self.function_tables = Some(tables);
        self
    }

    /// Create the loader.
    pub fn build(self) -> Loader {
        let store = Arc::new(ImageStore::new());
        Loader {
            config: self.config,
            search: self.search.unwrap_or_else(|| store.clone()),
            mapper: self.mapper.unwrap_or(store),
            entry_points: self
                .entry_points
                .unwrap_or_else(|| Arc::new(EntryTable::new())),
            function_tables: self.function_tables.unwrap_or_default(),
            tls: TlsAllocator::new(),
            lock: ReentrantMutex::new(()),
            state: Mutex::new(LoaderState::default()),
        }
    }
}

/// Proof that the loader lock is held by the current thread.
///
/// Every loader operation is available on the session. Sessions nest: opening one while the
/// thread already holds another (for example from inside an entry point) does not block.
pub struct LoaderSession<'a> {
    loader: &'a Loader,
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl Loader {
    /// Start configuring a loader.
    pub fn builder(config: LoaderConfig) -> LoaderBuilder {
        LoaderBuilder {
            config,
            search: None,
            mapper: None,
            entry_points: None,
            function_tables: None,
        }
    }

    /// Take the loader lock.
    pub fn session(&self) -> LoaderSession<'_> {
        LoaderSession {
            loader: self,
            _guard: self.lock.lock(),
        }
    }

    /// The loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Function tables of the loaded modules.
    pub fn function_tables(&self) -> &Arc<FunctionTables> {
        &self.function_tables
    }

    /// Thread-local storage state.
    pub fn tls(&self) -> &TlsAllocator {
        &self.tls
    }

    /// See [`LoaderSession::load_module`].
    pub fn load_module(&self, name: &str, flags: LoadFlags) -> Result<ModuleHandle> {
        self.session().load_module(name, flags)
    }

    /// See [`LoaderSession::load_executable`].
    pub fn load_executable(&self, name: &str) -> Result<ModuleHandle> {
        self.session().load_executable(name)
    }

    /// See [`LoaderSession::start_process`].
    pub fn start_process(&self, name: &str) -> Result<ModuleHandle> {
        self.session().start_process(name)
    }

    /// See [`LoaderSession::get_procedure_address`].
    pub fn get_procedure_address(&self, module: ModuleHandle, procedure: Procedure<'_>) -> Result<u64> {
        self.session().get_procedure_address(module, procedure)
    }

    /// See [`LoaderSession::unload_module`].
    pub fn unload_module(&self, module: ModuleHandle) -> Result<()> {
        self.session().unload_module(module)
    }

    /// See [`LoaderSession::get_module_handle`].
    pub fn get_module_handle(&self, name: &str) -> Option<ModuleHandle> {
        self.session().get_module_handle(name)
    }

    /// See [`LoaderSession::find_module_by_address`].
    pub fn find_module_by_address(&self, address: u64) -> Option<ModuleHandle> {
        self.session().find_module_by_address(address)
    }

    /// See [`LoaderSession::module`].
    pub fn module(&self, module: ModuleHandle) -> Option<ModuleInfo> {
        self.session().module(module)
    }

    /// See [`LoaderSession::with_image`].
    pub fn with_image<R>(&self, module: ModuleHandle, f: impl FnOnce(&MappedImage) -> R) -> Option<R> {
        self.session().with_image(module, f)
    }

    /// See [`LoaderSession::attach`].
    pub fn attach(&self, module: ModuleHandle) -> Result<()> {
        self.session().attach(module)
    }

    /// See [`LoaderSession::add_ref`].
    pub fn add_ref(&self, module: ModuleHandle, pin: bool) -> Result<()> {
        self.session().add_ref(module, pin)
    }

    /// See [`LoaderSession::disable_thread_calls`].
    pub fn disable_thread_calls(&self, module: ModuleHandle) -> Result<()> {
        self.session().disable_thread_calls(module)
    }

    /// See [`LoaderSession::on_process_attach`].
    pub fn on_process_attach(&self) -> Result<()> {
        self.session().on_process_attach()
    }

    /// See [`LoaderSession::on_process_detach`].
    pub fn on_process_detach(&self, force: bool) {
        self.session().on_process_detach(force)
    }

    /// See [`LoaderSession::on_thread_attach`].
    pub fn on_thread_attach(&self) -> Result<()> {
        self.session().on_thread_attach()
    }

    /// See [`LoaderSession::on_thread_detach`].
    pub fn on_thread_detach(&self) {
        self.session().on_thread_detach()
    }

    /// See [`LoaderSession::init_order`].
    pub fn init_order(&self) -> Vec<ModuleHandle> {
        self.session().init_order()
    }
}

impl<'a> LoaderSession<'a> {
    /// The loader this session belongs to.
    pub fn loader(&self) -> &'a Loader {
        self.loader
    }

    /// Run `f` on the bookkeeping state. Must not call into module code.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut LoaderState) -> R) -> R {
        let mut state = self.loader.state.lock();
        f(&mut state)
    }

    /// Base name of `handle`, for diagnostics.
    pub(crate) fn module_name(&self, handle: ModuleHandle) -> String {
        self.with_state(|state| {
            state
                .table
                .get(handle)
                .map(|m| m.base_name().to_string())
                .unwrap_or_else(|| "<unloaded>".to_string())
        })
    }

    /// Address of an exported procedure (`GetProcAddress`).
    ///
    /// Forwarded exports are followed; a forward target that has to be loaded is attached
    /// immediately.
    ///
    /// # Errors
    /// Returns [`Error::InvalidHandle`] for an unknown module and [`Error::ProcedureNotFound`]
    /// if the export does not exist or its forward cannot be resolved.
    pub fn get_procedure_address(&self, module: ModuleHandle, procedure: Procedure<'_>) -> Result<u64> {
        let name = self
            .with_state(|state| state.table.get(module).map(|m| m.base_name().to_string()))
            .ok_or(Error::InvalidHandle)?;
        let resolution = exports::Resolution::runtime();
        let address = match procedure {
            Procedure::Name(symbol) => self.export_by_name(module, symbol, None, resolution),
            Procedure::Ordinal(ordinal) => self.export_by_ordinal(module, ordinal, resolution),
        };
        address.ok_or_else(|| Error::ProcedureNotFound(format!("{}!{}", name, procedure)))
    }

    /// Find a loaded module by name without touching its reference count.
    pub fn get_module_handle(&self, name: &str) -> Option<ModuleHandle> {
        let request = self.loader.config.with_extension(name);
        self.with_state(|state| state.table.find_by_name(&request))
    }

    /// Find the loaded module whose image contains `address`.
    pub fn find_module_by_address(&self, address: u64) -> Option<ModuleHandle> {
        self.with_state(|state| state.table.find_by_address(address))
    }

    /// Snapshot of the loader state of `module`.
    pub fn module(&self, module: ModuleHandle) -> Option<ModuleInfo> {
        self.with_state(|state| state.table.get(module).map(|m| m.info(module)))
    }

    /// Run `f` on the mapped image of `module`.
    pub fn with_image<R>(&self, module: ModuleHandle, f: impl FnOnce(&MappedImage) -> R) -> Option<R> {
        self.with_state(|state| state.table.get(module).map(|m| f(&m.image)))
    }

    /// Snapshots of every loaded module, in load order.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.with_state(|state| state.table.modules().map(|(h, m)| m.info(h)).collect())
    }

    /// Loaded modules in load order.
    pub fn load_order(&self) -> Vec<ModuleHandle> {
        self.with_state(|state| state.table.load_order().to_vec())
    }

    /// Loaded modules by ascending base address.
    pub fn memory_order(&self) -> Vec<ModuleHandle> {
        self.with_state(|state| state.table.memory_order().to_vec())
    }

    /// Attached modules in attach completion order.
    pub fn init_order(&self) -> Vec<ModuleHandle> {
        self.with_state(|state| state.table.init_order().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::builder::ImageBuilder,
        test::{loader_with, store_with},
    };

    #[test]
    fn test_procedure_lookup() {
        let store = store_with(vec![ImageBuilder::dll("proc.dll")
            .ordinal_base(1)
            .export("Named", 0x1100)
            .export_ordinal(5, 0x1500)]);
        let loader = loader_with(store);
        let module = loader.load_module("proc.dll", LoadFlags::empty()).unwrap();

        assert_eq!(
            loader.get_procedure_address(module, "Named".into()).unwrap(),
            0x1000_1100
        );
        assert_eq!(
            loader.get_procedure_address(module, Procedure::Ordinal(5)).unwrap(),
            0x1000_1500
        );
        let err = loader.get_procedure_address(module, "Other".into()).unwrap_err();
        assert_eq!(err.to_string(), "Procedure not found - proc.dll!Other");
        assert!(matches!(
            loader.get_procedure_address(module, 9u32.into()),
            Err(Error::ProcedureNotFound(_))
        ));
    }

    #[test]
    fn test_nested_sessions() {
        let store = store_with(vec![ImageBuilder::dll("nest.dll")]);
        let loader = loader_with(store);

        let outer = loader.session();
        let module = outer.load_module("nest.dll", LoadFlags::empty()).unwrap();
        let inner = loader.session();
        assert_eq!(inner.get_module_handle("nest"), Some(module));
        assert_eq!(inner.find_module_by_address(0x1000_0010), Some(module));
        assert_eq!(outer.modules().len(), 1);
    }
}
