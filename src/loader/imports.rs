//! Import binding.
//!
//! Every import descriptor loads its module and resolves its thunks into the import address
//! table. A symbol that cannot be resolved does not fail the bind: its slot is poisoned and
//! remembered as [`ImportSlot::Unresolved`], deferring the failure to the first call through
//! it. A descriptor whose module cannot be loaded does fail the bind, after every other
//! descriptor has been processed.

use tracing::{debug_span, error, trace, warn};

use crate::{
    exception::{status, ExceptionRecord},
    image::{ImportDescriptor, ImportThunk},
    loader::{
        exports::Resolution,
        load::LoadFlags,
        module::{ModuleFlags, ModuleHandle},
        LoaderSession,
    },
    Error, Result,
};

/// Value written to import address table slots that could not be bound.
pub const POISONED_IMPORT: u64 = 0xdead_beef;

/// Binding state of one import address table slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportSlot {
    /// Bound to an export
    Resolved(u64),
    /// No export matched; calls through the slot must fail
    Unresolved {
        /// Base name of the importing module
        importer: String,
        /// Module the symbol was imported from
        dll: String,
        /// Symbol name, or `#ordinal`
        symbol: String,
    },
}

impl ImportSlot {
    /// Bound address, if any.
    pub fn address(&self) -> Option<u64> {
        match self {
            ImportSlot::Resolved(address) => Some(*address),
            ImportSlot::Unresolved { .. } => None,
        }
    }

    /// Whether the slot is bound.
    pub fn is_resolved(&self) -> bool {
        matches!(self, ImportSlot::Resolved(_))
    }

    /// Error reported for a call through an unbound slot.
    pub fn call_error(&self) -> Option<Error> {
        match self {
            ImportSlot::Resolved(_) => None,
            ImportSlot::Unresolved { dll, symbol, .. } => Some(Error::UnresolvedImport {
                dll: dll.clone(),
                symbol: symbol.clone(),
            }),
        }
    }

    /// Exception to raise for a call through an unbound slot at `address`.
    pub fn stub_exception(&self, address: u64) -> Option<ExceptionRecord> {
        match self {
            ImportSlot::Resolved(_) => None,
            ImportSlot::Unresolved { .. } => Some(
                ExceptionRecord::new(status::EXCEPTION_WINE_STUB)
                    .noncontinuable()
                    .with_address(address),
            ),
        }
    }
}

impl LoaderSession<'_> {
    /// Bind the imports of `handle` if they are not bound yet.
    ///
    /// # Errors
    /// Returns the failure of the first descriptor whose module could not be loaded:
    /// [`Error::DependencyNotFound`] or [`Error::DependencyFailed`], or the error of an
    /// import address table write. The dependencies acquired so far are recorded either way.
    pub(crate) fn bind_imports(&self, handle: ModuleHandle) -> Result<()> {
        let pending = self.with_state(|state| {
            let module = state.table.get_mut(handle).ok_or(Error::InvalidHandle)?;
            if !module.flags.contains(ModuleFlags::DONT_RESOLVE_REFS) {
                return Ok::<_, Error>(None);
            }
            module.flags.remove(ModuleFlags::DONT_RESOLVE_REFS);
            Ok(Some((
                module.base_name().to_string(),
                module.image.imports.clone(),
            )))
        })?;
        let Some((importer, descriptors)) = pending else {
            return Ok(());
        };
        let _span = debug_span!("bind_imports", module = %importer).entered();

        let mut dependencies = Vec::with_capacity(descriptors.len());
        let mut slots = Vec::with_capacity(descriptors.len());
        let mut failure = None;

        for descriptor in &descriptors {
            match self.load_dll(&descriptor.dll_name, LoadFlags::empty()) {
                Ok(dependency) => {
                    dependencies.push(Some(dependency));
                    match self.bind_descriptor(handle, &importer, dependency, descriptor) {
                        Ok(bound) => slots.push(bound),
                        Err(e) => {
                            error!(
                                "Binding imports of {} from {} failed: {}",
                                importer, descriptor.dll_name, e
                            );
                            failure.get_or_insert(e);
                            slots.push(unresolved_all(&importer, descriptor));
                        }
                    }
                }
                Err(e) => {
                    let failed = if e.is_not_found() {
                        error!("Library {} (which is needed by {}) not found", descriptor.dll_name, importer);
                        Error::DependencyNotFound {
                            name: descriptor.dll_name.clone(),
                            needed_by: importer.clone(),
                        }
                    } else {
                        error!(
                            "Loading library {} (which is needed by {}) failed: {}",
                            descriptor.dll_name, importer, e
                        );
                        Error::DependencyFailed {
                            name: descriptor.dll_name.clone(),
                            needed_by: importer.clone(),
                            source: Box::new(e),
                        }
                    };
                    failure.get_or_insert(failed);
                    dependencies.push(None);
                    slots.push(unresolved_all(&importer, descriptor));
                }
            }
        }

        self.with_state(|state| {
            if let Some(module) = state.table.get_mut(handle) {
                module.dependencies = dependencies;
                module.import_slots = slots;
            }
        });
        failure.map_or(Ok(()), Err)
    }

    fn bind_descriptor(
        &self,
        handle: ModuleHandle,
        importer: &str,
        dependency: ModuleHandle,
        descriptor: &ImportDescriptor,
    ) -> Result<Vec<ImportSlot>> {
        let pointer_size = self.with_state(|state| {
            state
                .table
                .get(handle)
                .map(|m| m.image.machine.pointer_size() as u32)
                .ok_or(Error::InvalidHandle)
        })?;

        let mut slots = Vec::with_capacity(descriptor.thunks.len());
        for (index, thunk) in descriptor.thunks.iter().enumerate() {
            let resolution = Resolution::binding(handle);
            let address = match thunk {
                ImportThunk::Ordinal(ordinal) => {
                    self.export_by_ordinal(dependency, *ordinal as u32, resolution)
                }
                ImportThunk::Name { hint, name } => {
                    self.export_by_name(dependency, name, Some(*hint), resolution)
                }
            };

            let slot = match address {
                Some(address) => {
                    trace!("{}: {}.{} -> {:#x}", importer, descriptor.dll_name, thunk, address);
                    ImportSlot::Resolved(address)
                }
                None => {
                    warn!(
                        "No implementation for {}.{} imported from {}, setting to {:#x}",
                        descriptor.dll_name, thunk, importer, POISONED_IMPORT
                    );
                    unresolved(importer, descriptor, thunk)
                }
            };

            let rva = descriptor.first_thunk + index as u32 * pointer_size;
            let value = slot.address().unwrap_or(POISONED_IMPORT);
            self.with_state(|state| match state.table.get_mut(handle) {
                Some(module) => module.image.write_pointer(rva, value),
                None => Err(Error::InvalidHandle),
            })?;
            slots.push(slot);
        }
        Ok(slots)
    }

    /// Binding of the import address table slot at `address`.
    ///
    /// This is how a call through a poisoned slot is recognized and turned into
    /// [`ImportSlot::stub_exception`].
    pub fn import_slot(&self, address: u64) -> Option<ImportSlot> {
        self.with_state(|state| {
            let handle = state.table.find_by_address(address)?;
            let module = state.table.get(handle)?;
            let rva = module.image.va_to_rva(address)?;
            let pointer_size = module.image.machine.pointer_size() as u32;

            module
                .image
                .imports
                .iter()
                .zip(module.import_slots.iter())
                .find_map(|(descriptor, slots)| {
                    let offset = rva.checked_sub(descriptor.first_thunk)?;
                    if offset % pointer_size != 0 {
                        return None;
                    }
                    slots.get((offset / pointer_size) as usize).cloned()
                })
        })
    }
}

fn unresolved_all(importer: &str, descriptor: &ImportDescriptor) -> Vec<ImportSlot> {
    descriptor
        .thunks
        .iter()
        .map(|thunk| unresolved(importer, descriptor, thunk))
        .collect()
}

fn unresolved(importer: &str, descriptor: &ImportDescriptor, thunk: &ImportThunk) -> ImportSlot {
    ImportSlot::Unresolved {
        importer: importer.to_string(),
        dll: descriptor.dll_name.clone(),
        symbol: thunk.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::builder::ImageBuilder,
        test::{loader_with, store_with},
    };
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_unresolved_symbol_is_poisoned() {
        let store = store_with(vec![
            ImageBuilder::dll("user.dll").base(0x1000_0000).import(
                "provider.dll",
                [ImportThunk::name("Present"), ImportThunk::name("Missing")],
            ),
            ImageBuilder::dll("provider.dll").base(0x2000_0000).export("Present", 0x1000),
        ]);
        let loader = loader_with(store);
        let session = loader.session();
        let user = session.load_module("user.dll", LoadFlags::empty()).unwrap();

        let info = session.module(user).unwrap();
        assert_eq!(info.import_slots.len(), 1);
        let slots = &info.import_slots[0];
        assert_eq!(slots[0], ImportSlot::Resolved(0x2000_1000));
        assert!(!slots[1].is_resolved());
        assert!(matches!(
            slots[1].call_error(),
            Some(Error::UnresolvedImport { ref symbol, .. }) if symbol == "Missing"
        ));

        let first_thunk = loader.with_image(user, |image| image.imports[0].first_thunk).unwrap();
        let iat = 0x1000_0000 + first_thunk as u64;
        assert_eq!(session.import_slot(iat), Some(ImportSlot::Resolved(0x2000_1000)));
        let stub = session.import_slot(iat + 8).unwrap();
        let record = stub.stub_exception(iat + 8).unwrap();
        assert_eq!(record.code, status::EXCEPTION_WINE_STUB);
        assert!(record.is_noncontinuable());
        assert_eq!(
            loader.with_image(user, |image| image.read_u64(first_thunk + 8).unwrap()),
            Some(POISONED_IMPORT)
        );
        assert_eq!(session.import_slot(iat + 4), None);
        assert!(logs_contain("No implementation for provider.dll.Missing imported from user.dll"));
    }

    #[test]
    fn test_missing_dependency_fails_bind() {
        let store = store_with(vec![ImageBuilder::dll("needy.dll")
            .import("absent.dll", [ImportThunk::name("F")])]);
        let loader = loader_with(store);
        let session = loader.session();

        let err = session.load_module("needy.dll", LoadFlags::empty()).unwrap_err();
        assert!(matches!(
            err,
            Error::DependencyNotFound { ref name, ref needed_by } if name == "absent.dll" && needed_by == "needy.dll"
        ));
        assert!(session.get_module_handle("needy.dll").is_none());
    }
}
