//! Synthetic image construction.
//!
//! [`ImageBuilder`] assembles a [`MappedImage`] without a PE file: built-in modules provided by
//! an embedding, and the fixtures of the loader and unwinder tests. Generated tables that must
//! live in image memory (forwarder strings, import address tables, the TLS template and index
//! cell) are placed in a data area that starts at [`ImageBuilder::data_rva`] (by default the
//! upper half of the image); code and unwind data supplied through [`ImageBuilder::bytes`] should
//! stay below it.
//!
//! # Example
//!
//! ```rust,ignore
//! use ldrkit::image::{builder::ImageBuilder, ImportThunk};
//!
//! let image = ImageBuilder::dll("libA.dll")
//!     .base(0x1000_0000)
//!     .entry_point(0x1000)
//!     .export("F", 0x1100)
//!     .forward("G", "libB.G")
//!     .import("libC.dll", [ImportThunk::name("H")])
//!     .build()?;
//! ```

use crate::{
    image::{
        ExportDirectory, ExportName, ImportDescriptor, ImportThunk, Machine, MappedImage,
        TlsDirectory,
    },
    unwind::table::RuntimeFunction,
    Result,
};

const DEFAULT_DLL_BASE: u64 = 0x1000_0000;
const DEFAULT_EXE_BASE: u64 = 0x40_0000;
const DEFAULT_SIZE: u32 = 0x10000;
const EXPORT_HEADER_SIZE: u32 = 40;

enum ExportTarget {
    Code(u32),
    Forward(String),
}

struct ExportEntry {
    name: Option<String>,
    ordinal: Option<u32>,
    target: ExportTarget,
}

struct TlsTemplate {
    template: Vec<u8>,
    zero_fill: u32,
    callbacks: Vec<u32>,
}

/// Builder for synthetic [`MappedImage`]s.
pub struct ImageBuilder {
    name: String,
    base: u64,
    size: u32,
    machine: Machine,
    is_dll: bool,
    entry_point: Option<u32>,
    data_rva: Option<u32>,
    ordinal_base: u32,
    exports: Vec<ExportEntry>,
    imports: Vec<(String, Vec<ImportThunk>)>,
    tls: Option<TlsTemplate>,
    functions: Vec<RuntimeFunction>,
    patches: Vec<(u32, Vec<u8>)>,
}

impl ImageBuilder {
    fn new(name: &str, is_dll: bool, base: u64) -> Self {
        ImageBuilder {
            name: name.to_string(),
            base,
            size: DEFAULT_SIZE,
            machine: Machine::X86_64,
            is_dll,
            entry_point: None,
            data_rva: None,
            ordinal_base: 1,
            exports: Vec::new(),
            imports: Vec::new(),
            tls: None,
            functions: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Start a library image.
    pub fn dll(name: &str) -> Self {
        Self::new(name, true, DEFAULT_DLL_BASE)
    }

    /// Start an executable image.
    pub fn exe(name: &str) -> Self {
        Self::new(name, false, DEFAULT_EXE_BASE)
    }

    /// Set the base address.
    pub fn base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    /// Set the image size.
    pub fn size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    /// Set the target architecture.
    pub fn machine(mut self, machine: Machine) -> Self {
        self.machine = machine;
        self
    }

    /// Set the entry point RVA.
    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = Some(rva);
        self
    }

    /// Set the RVA at which generated tables are placed.
    pub fn data_rva(mut self, rva: u32) -> Self {
        self.data_rva = Some(rva);
        self
    }

    /// Set the ordinal of the first export address table entry.
    pub fn ordinal_base(mut self, base: u32) -> Self {
        self.ordinal_base = base;
        self
    }

    /// Export `name` at `rva`, taking the next free ordinal.
    pub fn export(mut self, name: &str, rva: u32) -> Self {
        self.exports.push(ExportEntry {
            name: Some(name.to_string()),
            ordinal: None,
            target: ExportTarget::Code(rva),
        });
        self
    }

    /// Export `rva` by ordinal only.
    pub fn export_ordinal(mut self, ordinal: u32, rva: u32) -> Self {
        self.exports.push(ExportEntry {
            name: None,
            ordinal: Some(ordinal),
            target: ExportTarget::Code(rva),
        });
        self
    }

    /// Export `name` as a forwarder to `target` (`"Module.Function"` or `"Module.#ordinal"`).
    pub fn forward(mut self, name: &str, target: &str) -> Self {
        self.exports.push(ExportEntry {
            name: Some(name.to_string()),
            ordinal: None,
            target: ExportTarget::Forward(target.to_string()),
        });
        self
    }

    /// Add an import descriptor for `dll`.
    pub fn import(mut self, dll: &str, thunks: impl IntoIterator<Item = ImportThunk>) -> Self {
        self.imports
            .push((dll.to_string(), thunks.into_iter().collect()));
        self
    }

    /// Add a TLS directory with the given template, zero-fill size and callback RVAs.
    pub fn tls(mut self, template: &[u8], zero_fill: u32, callbacks: &[u32]) -> Self {
        self.tls = Some(TlsTemplate {
            template: template.to_vec(),
            zero_fill,
            callbacks: callbacks.to_vec(),
        });
        self
    }

    /// Add a function table entry.
    pub fn function(mut self, function: RuntimeFunction) -> Self {
        self.functions.push(function);
        self
    }

    /// Copy `bytes` into the image at `rva` (code, unwind data, scope tables).
    pub fn bytes(mut self, rva: u32, bytes: &[u8]) -> Self {
        self.patches.push((rva, bytes.to_vec()));
        self
    }

    /// Lay out the image.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the generated tables or the supplied bytes do
    /// not fit into the image, or if two exports claim the same ordinal.
    pub fn build(self) -> Result<MappedImage> {
        let mut image = MappedImage {
            name: self.name.clone(),
            base: self.base,
            preferred_base: self.base,
            size: self.size,
            machine: self.machine,
            is_dll: self.is_dll,
            entry_point: self.entry_point,
            memory: vec![0u8; self.size as usize],
            exports: None,
            imports: Vec::new(),
            tls: None,
            functions: self.functions,
            relocations: Vec::new(),
        };
        image.functions.sort_by_key(|function| function.begin);

        let mut cursor = DataCursor {
            next: self.data_rva.unwrap_or(self.size / 2),
            limit: self.size,
            image: &self.name,
        };

        if !self.exports.is_empty() {
            image.exports = Some(layout_exports(
                &mut image,
                &mut cursor,
                self.ordinal_base,
                self.exports,
            )?);
        }

        let pointer_size = self.machine.pointer_size() as u32;
        for (dll_name, thunks) in self.imports {
            let first_thunk = cursor.reserve((thunks.len() as u32 + 1) * pointer_size)?;
            image.imports.push(ImportDescriptor {
                dll_name,
                thunks,
                first_thunk,
            });
        }

        if let Some(tls) = self.tls {
            let start = cursor.reserve(tls.template.len() as u32)?;
            image.write(start, &tls.template)?;
            let index_rva = cursor.reserve(4)?;
            image.tls = Some(TlsDirectory {
                raw_data: start..start + tls.template.len() as u32,
                zero_fill: tls.zero_fill,
                index_rva,
                callbacks: tls.callbacks,
            });
        }

        for (rva, bytes) in &self.patches {
            image.write(*rva, bytes).map_err(|_| {
                malformed_error!(
                    "{}: {} bytes at RVA {:#x} do not fit the image",
                    self.name,
                    bytes.len(),
                    rva
                )
            })?;
        }

        Ok(image)
    }
}

struct DataCursor<'a> {
    next: u32,
    limit: u32,
    image: &'a str,
}

impl DataCursor<'_> {
    fn reserve(&mut self, len: u32) -> Result<u32> {
        let start = (self.next + 7) & !7;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.limit)
            .ok_or_else(|| malformed_error!("{}: generated tables overflow the image", self.image))?;
        self.next = end;
        Ok(start)
    }
}

fn layout_exports(
    image: &mut MappedImage,
    cursor: &mut DataCursor<'_>,
    ordinal_base: u32,
    exports: Vec<ExportEntry>,
) -> Result<ExportDirectory> {
    let mut slots: Vec<Option<ExportEntry>> = Vec::new();

    let (explicit, implicit): (Vec<_>, Vec<_>) =
        exports.into_iter().partition(|export| export.ordinal.is_some());
    for export in explicit {
        let ordinal = export.ordinal.unwrap_or(ordinal_base);
        let index = ordinal
            .checked_sub(ordinal_base)
            .ok_or_else(|| malformed_error!("ordinal {} below base {}", ordinal, ordinal_base))?
            as usize;
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        if slots[index].is_some() {
            return Err(malformed_error!("ordinal {} exported twice", ordinal));
        }
        slots[index] = Some(export);
    }
    for export in implicit {
        match slots.iter().position(Option::is_none) {
            Some(free) => slots[free] = Some(export),
            None => slots.push(Some(export)),
        }
    }

    let rva = cursor.reserve(EXPORT_HEADER_SIZE)?;
    let mut directory = ExportDirectory {
        rva,
        size: 0,
        ordinal_base,
        functions: vec![0; slots.len()],
        names: Vec::new(),
    };

    for (index, slot) in slots.into_iter().enumerate() {
        let Some(export) = slot else { continue };
        directory.functions[index] = match export.target {
            ExportTarget::Code(target) => target,
            ExportTarget::Forward(forward) => {
                let mut bytes = forward.into_bytes();
                bytes.push(0);
                let at = cursor.reserve(bytes.len() as u32)?;
                image.write(at, &bytes)?;
                at
            }
        };
        if let Some(name) = export.name {
            directory.names.push(ExportName {
                name,
                index: index as u32,
            });
        }
    }

    directory.size = cursor.next - rva;
    directory
        .names
        .sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let dll = ImageBuilder::dll("a.dll").build().unwrap();
        let exe = ImageBuilder::exe("a.exe").build().unwrap();

        assert!(dll.is_dll);
        assert!(!exe.is_dll);
        assert_eq!(dll.base, DEFAULT_DLL_BASE);
        assert_eq!(exe.base, DEFAULT_EXE_BASE);
        assert_eq!(dll.memory.len(), DEFAULT_SIZE as usize);
        assert!(dll.exports.is_none());
    }

    #[test]
    fn test_builder_exports_sorted_and_ordinals() {
        let image = ImageBuilder::dll("exp.dll")
            .ordinal_base(5)
            .export("Zeta", 0x1300)
            .export("Alpha", 0x1100)
            .export_ordinal(7, 0x1500)
            .build()
            .unwrap();
        let exports = image.exports.unwrap();

        assert_eq!(exports.ordinal_base, 5);
        assert_eq!(exports.functions, vec![0x1300, 0x1100, 0x1500]);
        let names: Vec<&str> = exports.names.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Zeta"]);
        assert_eq!(exports.names[0].index, 1);
    }

    #[test]
    fn test_builder_ordinal_gap() {
        let image = ImageBuilder::dll("gap.dll")
            .export_ordinal(4, 0x1400)
            .build()
            .unwrap();
        let exports = image.exports.unwrap();

        assert_eq!(exports.functions, vec![0, 0, 0, 0x1400]);
    }

    #[test]
    fn test_builder_forward_inside_directory() {
        let image = ImageBuilder::dll("fwd.dll")
            .forward("F", "libB.G")
            .build()
            .unwrap();
        let exports = image.exports.as_ref().unwrap();
        let target = exports.functions[0];

        assert!(exports.contains_rva(target));
        assert_eq!(image.read_cstr(target).unwrap(), "libB.G");
    }

    #[test]
    fn test_builder_duplicate_ordinal() {
        let result = ImageBuilder::dll("dup.dll")
            .export_ordinal(1, 0x1000)
            .export_ordinal(1, 0x1004)
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_builder_imports_and_tls() {
        let image = ImageBuilder::dll("imp.dll")
            .import("libC.dll", [ImportThunk::name("H"), ImportThunk::ordinal(3)])
            .tls(&[1, 2, 3, 4], 12, &[0x1200])
            .build()
            .unwrap();

        assert_eq!(image.imports.len(), 1);
        let descriptor = &image.imports[0];
        assert_eq!(descriptor.dll_name, "libC.dll");
        assert_eq!(descriptor.thunks.len(), 2);
        assert_eq!(image.read_u64(descriptor.first_thunk).unwrap(), 0);

        let tls = image.tls.as_ref().unwrap();
        assert_eq!(tls.raw_size(), 4);
        assert_eq!(tls.block_size(), 16);
        assert_eq!(image.read(tls.raw_data.start, 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(tls.callbacks, vec![0x1200]);
    }

    #[test]
    fn test_builder_overflow() {
        let result = ImageBuilder::dll("tiny.dll")
            .size(0x100)
            .tls(&[0u8; 0x200], 0, &[])
            .build();

        assert!(result.is_err());
    }
}
