//! Export resolution.
//!
//! Exports are looked up by ordinal or by name. The name table is sorted, so a name lookup
//! probes the importer's hint first and falls back to a binary search. An export whose address
//! lies inside the export directory is a forwarder string (`"Module.Function"` or
//! `"Module.#ordinal"`) that is resolved against the named module, loading it when needed.

use std::fmt;

use tracing::{debug, error, trace, warn};

use crate::loader::{
    load::LoadFlags,
    module::{ModuleFlags, ModuleHandle},
    LoaderSession,
};

/// A procedure to look up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Procedure<'a> {
    /// By exported name
    Name(&'a str),
    /// By ordinal (biased by the export directory's ordinal base)
    Ordinal(u32),
}

impl<'a> From<&'a str> for Procedure<'a> {
    fn from(name: &'a str) -> Self {
        Procedure::Name(name)
    }
}

impl From<u32> for Procedure<'_> {
    fn from(ordinal: u32) -> Self {
        Procedure::Ordinal(ordinal)
    }
}

impl fmt::Display for Procedure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::Name(name) => f.write_str(name),
            Procedure::Ordinal(ordinal) => write!(f, "#{}", ordinal),
        }
    }
}

/// Where a resolution was requested from.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Resolution {
    /// Module whose imports are being bound; forward targets become its dependencies
    pub importer: Option<ModuleHandle>,
    /// Forwarders followed so far
    pub depth: usize,
}

impl Resolution {
    /// A lookup made at run time (`GetProcAddress`).
    pub fn runtime() -> Self {
        Resolution {
            importer: None,
            depth: 0,
        }
    }

    /// A lookup made while binding the imports of `importer`.
    pub fn binding(importer: ModuleHandle) -> Self {
        Resolution {
            importer: Some(importer),
            depth: 0,
        }
    }

    fn forwarded(self) -> Self {
        Resolution {
            depth: self.depth + 1,
            ..self
        }
    }
}

enum ExportTarget {
    Address(u64),
    Forward(String),
}

impl LoaderSession<'_> {
    /// Resolve the export with the given (biased) `ordinal`.
    ///
    /// Ordinals outside the export table, empty slots and failed forwards yield `None`.
    pub fn resolve_by_ordinal(&self, module: ModuleHandle, ordinal: u32) -> Option<u64> {
        self.export_by_ordinal(module, ordinal, Resolution::runtime())
    }

    /// Resolve the export named `name`, probing the name table at `hint` first.
    pub fn resolve_by_name(&self, module: ModuleHandle, name: &str, hint: Option<u16>) -> Option<u64> {
        self.export_by_name(module, name, hint, Resolution::runtime())
    }

    pub(crate) fn export_by_ordinal(
        &self,
        module: ModuleHandle,
        ordinal: u32,
        resolution: Resolution,
    ) -> Option<u64> {
        let base = self.with_state(|state| {
            state
                .table
                .get(module)?
                .image
                .exports
                .as_ref()
                .map(|exports| exports.ordinal_base)
        })?;
        let index = ordinal.checked_sub(base)?;
        self.export_by_index(module, index, resolution)
    }

    pub(crate) fn export_by_name(
        &self,
        module: ModuleHandle,
        name: &str,
        hint: Option<u16>,
        resolution: Resolution,
    ) -> Option<u64> {
        let index = self.with_state(|state| {
            let exports = state.table.get(module)?.image.exports.as_ref()?;
            if let Some(entry) = hint.and_then(|hint| exports.names.get(hint as usize)) {
                if entry.name == name {
                    return Some(entry.index);
                }
            }
            exports
                .names
                .binary_search_by(|entry| entry.name.as_bytes().cmp(name.as_bytes()))
                .ok()
                .map(|at| exports.names[at].index)
        })?;
        self.export_by_index(module, index, resolution)
    }

    /// Resolve the export address table entry at `index` (unbiased).
    fn export_by_index(&self, module: ModuleHandle, index: u32, resolution: Resolution) -> Option<u64> {
        let target = self.with_state(|state| {
            let module = state.table.get(module)?;
            let exports = module.image.exports.as_ref()?;
            let rva = *exports.functions.get(index as usize)?;
            if rva == 0 {
                return None;
            }
            if !exports.contains_rva(rva) {
                return Some(ExportTarget::Address(module.image.rva_to_va(rva)));
            }
            match module.image.read_cstr(rva) {
                Ok(forward) => Some(ExportTarget::Forward(forward)),
                Err(e) => {
                    warn!("{}: unreadable forwarder at {:#x}: {}", module.base_name(), rva, e);
                    None
                }
            }
        })?;

        match target {
            ExportTarget::Address(address) => Some(address),
            ExportTarget::Forward(forward) => self.resolve_forward(module, &forward, resolution),
        }
    }

    fn resolve_forward(&self, exporter: ModuleHandle, forward: &str, resolution: Resolution) -> Option<u64> {
        let exporter_name = self.module_name(exporter);
        if resolution.depth >= self.loader.config.max_forward_depth {
            warn!(
                "forward '{}' from {} exceeds the forwarder chain limit",
                forward, exporter_name
            );
            return None;
        }
        let Some((module_part, symbol)) = forward.rsplit_once('.') else {
            warn!("malformed forward '{}' in {}", forward, exporter_name);
            return None;
        };
        trace!("{} forwards to {}", exporter_name, forward);

        let dll = format!("{}{}", module_part, self.loader.config.default_extension);
        let target = match self.with_state(|state| state.table.find_by_name(&dll)) {
            Some(target) => target,
            None => {
                debug!("loading {} for forward '{}'", dll, forward);
                let target = match self.load_dll(&dll, LoadFlags::empty()) {
                    Ok(target) => target,
                    Err(e) => {
                        error!(
                            "module not found for forward '{}' used by {}: {}",
                            forward, exporter_name, e
                        );
                        return None;
                    }
                };

                match resolution.importer {
                    Some(importer) => self.with_state(|state| {
                        if let Some(module) = state.table.get_mut(importer) {
                            module.forward_dependencies.push(target);
                        }
                    }),
                    None => {
                        let bound = self.with_state(|state| {
                            state
                                .table
                                .get(target)
                                .is_some_and(|m| !m.flags.contains(ModuleFlags::DONT_RESOLVE_REFS))
                        });
                        if bound {
                            if let Err(e) = self.attach(target) {
                                error!("forward target {} failed to attach: {}", dll, e);
                                if let Err(e) = self.unload_module(target) {
                                    warn!("unloading forward target {} failed: {}", dll, e);
                                }
                                return None;
                            }
                        }
                    }
                }
                target
            }
        };

        let next = resolution.forwarded();
        let address = match symbol.strip_prefix('#') {
            Some(ordinal) => match ordinal.parse::<u32>() {
                Ok(ordinal) => self.export_by_ordinal(target, ordinal, next),
                Err(_) => None,
            },
            None => self.export_by_name(target, symbol, None, next),
        };
        if address.is_none() {
            warn!(
                "function '{}' not found for forward '{}' used by {}",
                symbol, forward, exporter_name
            );
        }
        address
    }
}
