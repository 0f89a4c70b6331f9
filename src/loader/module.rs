//! Loaded modules.

use bitflags::bitflags;
use strum::Display;

use crate::{
    image::MappedImage,
    loader::{
        config::{base_name, dir_name, LoadMechanism},
        imports::ImportSlot,
    },
};

bitflags! {
    /// Per-module loader flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ModuleFlags: u32 {
        /// The image is a library rather than a primary executable
        const IMAGE_DLL = 0x0000_0004;
        /// Attach is running (cycle guard)
        const LOAD_IN_PROGRESS = 0x0000_1000;
        /// Reference release is running (cycle guard)
        const UNLOAD_IN_PROGRESS = 0x0000_2000;
        /// Detach notification is running
        const DETACH_IN_PROGRESS = 0x0000_4000;
        /// The process attach notification completed
        const PROCESS_ATTACHED = 0x0008_0000;
        /// Opted out of thread notifications
        const NO_DLL_CALLS = 0x0004_0000;
        /// Imports are not bound yet
        const DONT_RESOLVE_REFS = 0x0080_0000;
    }
}

/// Attach protocol state, derived from [`ModuleFlags`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum ModuleState {
    /// Not attached
    Unattached,
    /// Dependencies or the entry point are being attached
    AttachInProgress,
    /// Process attach completed
    Attached,
    /// The detach notification is running
    DetachInProgress,
}

impl ModuleFlags {
    /// Lifecycle state encoded in the flags.
    pub fn state(self) -> ModuleState {
        if self.contains(ModuleFlags::DETACH_IN_PROGRESS) {
            ModuleState::DetachInProgress
        } else if self.contains(ModuleFlags::PROCESS_ATTACHED) {
            ModuleState::Attached
        } else if self.contains(ModuleFlags::LOAD_IN_PROGRESS) {
            ModuleState::AttachInProgress
        } else {
            ModuleState::Unattached
        }
    }
}

/// A saturating module reference count with a "never unload" sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LoadCount(u32);

impl LoadCount {
    /// The sentinel of pinned modules.
    pub const PINNED: LoadCount = LoadCount(u32::MAX);

    /// A count of `count` references.
    pub fn new(count: u32) -> Self {
        LoadCount(count.min(u32::MAX - 1))
    }

    /// Whether the module can never be unloaded.
    pub fn is_pinned(self) -> bool {
        self == Self::PINNED
    }

    /// Number of references, `None` when pinned.
    pub fn get(self) -> Option<u32> {
        (!self.is_pinned()).then_some(self.0)
    }

    /// Whether no references remain.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Add one reference. Pinned counts stay pinned.
    pub fn increment(&mut self) {
        if !self.is_pinned() {
            *self = LoadCount::new(self.0.saturating_add(1));
        }
    }

    /// Drop one reference. Returns `false` if the count was pinned or already zero.
    pub fn decrement(&mut self) -> bool {
        if self.is_pinned() || self.0 == 0 {
            return false;
        }
        self.0 -= 1;
        true
    }
}

impl std::fmt::Display for LoadCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.get() {
            Some(count) => write!(f, "{}", count),
            None => f.write_str("pinned"),
        }
    }
}

/// Handle of a loaded module.
///
/// Handles are generation-checked: a handle to an unloaded module stays invalid even after its
/// slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// The four names a module is known by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleNames {
    /// Full path
    pub full_path: String,
    /// Short (8.3) form of the full path
    pub short_path: String,
}

impl ModuleNames {
    /// Names for a module mapped from `full_path`.
    pub fn new(full_path: &str) -> Self {
        let base = base_name(full_path);
        let short_base = short_name(base);
        let short_path = match dir_name(full_path) {
            Some(dir) => format!("{}\\{}", dir, short_base),
            None => short_base,
        };
        ModuleNames {
            full_path: full_path.to_string(),
            short_path,
        }
    }

    /// Base name of the full path.
    pub fn base_name(&self) -> &str {
        base_name(&self.full_path)
    }

    /// Base name of the short path.
    pub fn short_base_name(&self) -> &str {
        base_name(&self.short_path)
    }

    /// Case-insensitive match against any of the four names.
    pub fn matches(&self, name: &str) -> bool {
        [
            self.full_path.as_str(),
            self.base_name(),
            self.short_path.as_str(),
            self.short_base_name(),
        ]
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
    }
}

/// DOS 8.3 form of a base name: up to six stem characters and `~1` when the name does not fit.
fn short_name(base: &str) -> String {
    let (stem, ext) = match base.rfind('.') {
        Some(at) if at > 0 => (&base[..at], &base[at + 1..]),
        _ => (base, ""),
    };
    let clean = |s: &str| -> String {
        s.chars()
            .filter(|c| !matches!(c, ' ' | '.'))
            .map(|c| c.to_ascii_uppercase())
            .collect()
    };
    let stem = clean(stem);
    let ext = clean(ext);
    let stem = if stem.len() > 8 || ext.len() > 3 || base.contains(' ') {
        let head: String = stem.chars().take(6).collect();
        format!("{}~1", head)
    } else {
        stem
    };
    let ext: String = ext.chars().take(3).collect();
    if ext.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, ext)
    }
}

/// A loaded module.
#[derive(Debug)]
pub(crate) struct Module {
    pub image: MappedImage,
    pub names: ModuleNames,
    pub mechanism: LoadMechanism,
    pub flags: ModuleFlags,
    pub load_count: LoadCount,
    pub tls_index: Option<u32>,
    /// One entry per import descriptor, `None` where the dependency failed
    pub dependencies: Vec<Option<ModuleHandle>>,
    /// Modules loaded to resolve export forwarders during binding
    pub forward_dependencies: Vec<ModuleHandle>,
    /// Binding of every import thunk, per descriptor
    pub import_slots: Vec<Vec<ImportSlot>>,
}

impl Module {
    pub fn new(image: MappedImage, full_path: &str, mechanism: LoadMechanism) -> Self {
        let mut flags = ModuleFlags::DONT_RESOLVE_REFS;
        if image.is_dll {
            flags |= ModuleFlags::IMAGE_DLL;
        }
        Module {
            image,
            names: ModuleNames::new(full_path),
            mechanism,
            flags,
            load_count: LoadCount::default(),
            tls_index: None,
            dependencies: Vec::new(),
            forward_dependencies: Vec::new(),
            import_slots: Vec::new(),
        }
    }

    pub fn base_name(&self) -> &str {
        self.names.base_name()
    }

    pub fn is_dll(&self) -> bool {
        self.flags.contains(ModuleFlags::IMAGE_DLL)
    }

    /// Every module this one holds a reference on, descriptor dependencies first.
    pub fn all_dependencies(&self) -> impl Iterator<Item = ModuleHandle> + '_ {
        self.dependencies
            .iter()
            .flatten()
            .chain(self.forward_dependencies.iter())
            .copied()
    }

    pub fn info(&self, handle: ModuleHandle) -> ModuleInfo {
        ModuleInfo {
            handle,
            names: self.names.clone(),
            base: self.image.base,
            size: self.image.size,
            entry_point: self.image.entry_point_va(),
            mechanism: self.mechanism,
            flags: self.flags,
            state: self.flags.state(),
            load_count: self.load_count,
            tls_index: self.tls_index,
            dependencies: self.dependencies.clone(),
            forward_dependencies: self.forward_dependencies.clone(),
            import_slots: self.import_slots.clone(),
        }
    }
}

/// Snapshot of a module's loader state.
#[derive(Clone, Debug)]
pub struct ModuleInfo {
    /// The module's handle
    pub handle: ModuleHandle,
    /// Full and short names
    pub names: ModuleNames,
    /// Load address
    pub base: u64,
    /// Image size
    pub size: u32,
    /// Entry point address
    pub entry_point: Option<u64>,
    /// How the image was produced
    pub mechanism: LoadMechanism,
    /// Loader flags
    pub flags: ModuleFlags,
    /// Attach protocol state
    pub state: ModuleState,
    /// Reference count
    pub load_count: LoadCount,
    /// TLS slot
    pub tls_index: Option<u32>,
    /// One entry per import descriptor, `None` where the dependency failed
    pub dependencies: Vec<Option<ModuleHandle>>,
    /// Modules loaded to resolve export forwarders
    pub forward_dependencies: Vec<ModuleHandle>,
    /// Import bindings, per descriptor
    pub import_slots: Vec<Vec<ImportSlot>>,
}

impl ModuleInfo {
    /// Base name of the module.
    pub fn name(&self) -> &str {
        self.names.base_name()
    }
}
