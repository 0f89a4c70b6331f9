//! On-disk PE images.
//!
//! [`PeFile`] memory-maps an image file and lays it out the way the system loader would: a
//! zeroed buffer of `SizeOfImage` bytes receiving the headers and every section at its virtual
//! address. `goblin` validates the headers and provides the section and data directory tables;
//! the directories the loader consumes are then decoded from the laid-out memory, so forwarder
//! strings, import address tables and TLS templates keep their RVAs.
//!
//! [`PeMapper`] plugs this into the loader as a [`ModuleSearch`] and [`ImageMapper`] over host
//! directories, with an optional [`ImageStore`] supplying built-in modules.
//!
//! # Example
//!
//! ```rust,ignore
//! use ldrkit::image::pe::{PeFile, PeFileConfig};
//!
//! let file = PeFile::open("/opt/app/plugin.dll")?;
//! let image = file.map(&PeFileConfig::default().with_base_address(0x1_8000_0000))?;
//! println!("{} exports", image.exports.map_or(0, |e| e.functions.len()));
//! ```

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use goblin::pe::{
    data_directories::DataDirectoryType,
    header::{COFF_MACHINE_ARM64, COFF_MACHINE_X86, COFF_MACHINE_X86_64},
    PE,
};
use memmap2::Mmap;
use tracing::{debug, trace};

use crate::{
    image::{
        store::ImageStore, BaseRelocation, ExportDirectory, ExportName, ImportDescriptor,
        ImportThunk, Machine, MappedImage, TlsDirectory,
    },
    loader::collab::{ImageMapper, MapError, ModuleSearch},
    unwind::{arm64, table::RuntimeFunction},
    Error, Result,
};

const IMPORT_DESCRIPTOR_SIZE: u32 = 20;
const MAX_IMPORT_THUNKS: u32 = 0x10000;

/// How [`PeFile::map`] places an image.
#[derive(Clone, Debug)]
pub struct PeFileConfig {
    /// Address to map at; the preferred base when `None`
    pub base_address: Option<u64>,
    /// Apply base relocations when the image moves
    pub apply_relocations: bool,
}

impl Default for PeFileConfig {
    fn default() -> Self {
        PeFileConfig {
            base_address: None,
            apply_relocations: true,
        }
    }
}

impl PeFileConfig {
    /// Map at `base` instead of the preferred base.
    pub fn with_base_address(mut self, base: u64) -> Self {
        self.base_address = Some(base);
        self
    }

    /// Enable or disable base relocation processing.
    pub fn with_relocations(mut self, apply: bool) -> Self {
        self.apply_relocations = apply;
        self
    }
}

/// A memory-mapped PE file.
pub struct PeFile {
    name: String,
    data: Mmap,
}

impl PeFile {
    /// Memory-map the file at `path`.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the file cannot be opened or mapped.
    pub fn open(path: impl AsRef<Path>) -> Result<PeFile> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        // The mapping is read-only and the bytes are copied out by `map`.
        let data = unsafe { Mmap::map(&file) }?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(PeFile { name, data })
    }

    /// File name of the image.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw file bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Lay out the image.
    ///
    /// # Errors
    /// Returns [`Error::GoblinErr`] for unparseable headers, [`Error::Malformed`] for damaged
    /// directories and [`Error::NotSupported`] for foreign architectures.
    pub fn map(&self, config: &PeFileConfig) -> Result<MappedImage> {
        map_image(&self.name, &self.data, config)
    }
}

/// Lay out the PE image in `data`, known as `name`.
///
/// # Errors
/// See [`PeFile::map`].
pub fn map_image(name: &str, data: &[u8], config: &PeFileConfig) -> Result<MappedImage> {
    let pe = PE::parse(data)?;
    let Some(optional_header) = pe.header.optional_header else {
        return Err(malformed_error!("{}: file does not have an OptionalHeader", name));
    };

    let machine = match pe.header.coff_header.machine {
        COFF_MACHINE_X86_64 => Machine::X86_64,
        COFF_MACHINE_ARM64 => Machine::Arm64,
        COFF_MACHINE_X86 => Machine::I386,
        other => {
            return Err(Error::NotSupported(format!(
                "{}: machine type {:#x}",
                name, other
            )))
        }
    };

    let size = optional_header.windows_fields.size_of_image as u32;
    let mut memory = vec![0u8; size as usize];

    let headers = (optional_header.windows_fields.size_of_headers as usize)
        .min(data.len())
        .min(memory.len());
    memory[..headers].copy_from_slice(&data[..headers]);

    for section in &pe.sections {
        let virtual_size = if section.virtual_size == 0 {
            section.size_of_raw_data
        } else {
            section.virtual_size
        };
        let len = section.size_of_raw_data.min(virtual_size) as usize;
        let src_start = section.pointer_to_raw_data as usize;
        let dst_start = section.virtual_address as usize;
        let (Some(src), Some(dst)) = (
            data.get(src_start..src_start.saturating_add(len)),
            memory.get_mut(dst_start..dst_start.saturating_add(len)),
        ) else {
            return Err(malformed_error!(
                "{}: section {} does not fit the image",
                name,
                String::from_utf8_lossy(&section.name).trim_end_matches('\0')
            ));
        };
        dst.copy_from_slice(src);
    }

    let directory = |kind: DataDirectoryType| {
        optional_header
            .data_directories
            .dirs()
            .find(|(directory_type, directory)| {
                *directory_type == kind && directory.virtual_address != 0 && directory.size != 0
            })
            .map(|(_, directory)| (directory.virtual_address, directory.size))
    };

    let entry = pe.entry as u32;
    let mut image = MappedImage {
        name: name.to_string(),
        base: pe.image_base,
        preferred_base: pe.image_base,
        size,
        machine,
        is_dll: pe.is_lib,
        entry_point: (entry != 0).then_some(entry),
        memory,
        exports: None,
        imports: Vec::new(),
        tls: None,
        functions: Vec::new(),
        relocations: Vec::new(),
    };

    if let Some((rva, size)) = directory(DataDirectoryType::ExportTable) {
        image.exports = Some(decode_exports(&image, rva, size)?);
    }
    if let Some((rva, _)) = directory(DataDirectoryType::ImportTable) {
        image.imports = decode_imports(&image, rva)?;
    }
    if let Some((rva, _)) = directory(DataDirectoryType::TlsTable) {
        image.tls = Some(decode_tls(&image, rva)?);
    }
    if let Some((rva, size)) = directory(DataDirectoryType::ExceptionTable) {
        image.functions = decode_functions(&image, rva, size)?;
    }
    if let Some((rva, size)) = directory(DataDirectoryType::BaseRelocationTable) {
        image.relocations = decode_relocations(&image, rva, size)?;
    }

    debug!(
        "{}: {} image, {:#x} bytes, {} imports, {} functions",
        name,
        machine,
        size,
        image.imports.len(),
        image.functions.len()
    );

    if let Some(base) = config.base_address {
        if config.apply_relocations {
            image.relocate(base)?;
        } else {
            image.base = base;
        }
    }
    Ok(image)
}

fn decode_exports(image: &MappedImage, rva: u32, size: u32) -> Result<ExportDirectory> {
    let ordinal_base = image.read_u32(rva + 16)?;
    let function_count = image.read_u32(rva + 20)?;
    let name_count = image.read_u32(rva + 24)?;
    let functions_rva = image.read_u32(rva + 28)?;
    let names_rva = image.read_u32(rva + 32)?;
    let ordinals_rva = image.read_u32(rva + 36)?;

    let functions = (0..function_count)
        .map(|i| image.read_u32(functions_rva + i * 4))
        .collect::<Result<Vec<_>>>()?;

    let mut names = Vec::with_capacity(name_count as usize);
    for i in 0..name_count {
        let name_rva = image.read_u32(names_rva + i * 4)?;
        let index = image.read_u16(ordinals_rva + i * 2)? as u32;
        if index >= function_count {
            return Err(malformed_error!(
                "{}: export name {} points past the address table",
                image.name,
                i
            ));
        }
        names.push(ExportName {
            name: image.read_cstr(name_rva)?,
            index,
        });
    }

    Ok(ExportDirectory {
        rva,
        size,
        ordinal_base,
        functions,
        names,
    })
}

fn decode_imports(image: &MappedImage, rva: u32) -> Result<Vec<ImportDescriptor>> {
    let pointer_size = image.machine.pointer_size() as u32;
    let ordinal_flag = 1u64 << (pointer_size * 8 - 1);

    let mut descriptors = Vec::new();
    let mut cursor = rva;
    loop {
        let original_first_thunk = image.read_u32(cursor)?;
        let name_rva = image.read_u32(cursor + 12)?;
        let first_thunk = image.read_u32(cursor + 16)?;
        if name_rva == 0 && first_thunk == 0 {
            break;
        }

        let lookup = if original_first_thunk != 0 {
            original_first_thunk
        } else {
            first_thunk
        };
        let mut thunks = Vec::new();
        for i in 0..MAX_IMPORT_THUNKS {
            let value = image.read_pointer(lookup + i * pointer_size)?;
            if value == 0 {
                break;
            }
            if value & ordinal_flag != 0 {
                thunks.push(ImportThunk::Ordinal(value as u16));
            } else {
                let hint_rva = value as u32;
                thunks.push(ImportThunk::Name {
                    hint: image.read_u16(hint_rva)?,
                    name: image.read_cstr(hint_rva + 2)?,
                });
            }
        }

        let dll_name = image.read_cstr(name_rva)?;
        trace!("{}: imports {} symbols from {}", image.name, thunks.len(), dll_name);
        descriptors.push(ImportDescriptor {
            dll_name,
            thunks,
            first_thunk,
        });
        cursor += IMPORT_DESCRIPTOR_SIZE;
    }
    Ok(descriptors)
}

fn decode_tls(image: &MappedImage, rva: u32) -> Result<TlsDirectory> {
    let pointer_size = image.machine.pointer_size() as u32;
    let to_rva = |va: u64| -> Result<u32> {
        va.checked_sub(image.preferred_base)
            .filter(|rva| *rva <= image.size as u64)
            .map(|rva| rva as u32)
            .ok_or_else(|| malformed_error!("{}: TLS address {:#x} outside the image", image.name, va))
    };

    let start = to_rva(image.read_pointer(rva)?)?;
    let end = to_rva(image.read_pointer(rva + pointer_size)?)?;
    let index_rva = to_rva(image.read_pointer(rva + 2 * pointer_size)?)?;
    let callbacks_va = image.read_pointer(rva + 3 * pointer_size)?;
    let zero_fill = image.read_u32(rva + 4 * pointer_size)?;

    let mut callbacks = Vec::new();
    if callbacks_va != 0 {
        let mut cursor = to_rva(callbacks_va)?;
        loop {
            let callback = image.read_pointer(cursor)?;
            if callback == 0 {
                break;
            }
            callbacks.push(to_rva(callback)?);
            cursor += pointer_size;
        }
    }

    if end < start {
        return Err(malformed_error!("{}: TLS template ends before it starts", image.name));
    }
    Ok(TlsDirectory {
        raw_data: start..end,
        zero_fill,
        index_rva,
        callbacks,
    })
}

fn decode_functions(image: &MappedImage, rva: u32, size: u32) -> Result<Vec<RuntimeFunction>> {
    let mut functions = match image.machine {
        Machine::X86_64 => (0..size / 12)
            .map(|i| {
                let entry = rva + i * 12;
                Ok(RuntimeFunction::new(
                    image.read_u32(entry)?,
                    image.read_u32(entry + 4)?,
                    image.read_u32(entry + 8)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?,
        Machine::Arm64 => (0..size / 8)
            .map(|i| {
                let entry = rva + i * 8;
                let begin = image.read_u32(entry)?;
                let word = image.read_u32(entry + 4)?;
                let length = arm64::function_length(image, image.base, word)?;
                Ok(RuntimeFunction::new(begin, begin + length, word))
            })
            .collect::<Result<Vec<_>>>()?,
        Machine::I386 => Vec::new(),
    };
    functions.sort_by_key(|function| function.begin);
    Ok(functions)
}

fn decode_relocations(image: &MappedImage, rva: u32, size: u32) -> Result<Vec<BaseRelocation>> {
    let mut relocations = Vec::new();
    let mut cursor = rva;
    let end = rva.saturating_add(size);
    while cursor + 8 <= end {
        let page = image.read_u32(cursor)?;
        let block_size = image.read_u32(cursor + 4)?;
        if block_size < 8 {
            return Err(malformed_error!(
                "{}: relocation block at {:#x} has size {}",
                image.name,
                cursor,
                block_size
            ));
        }
        for i in 0..(block_size - 8) / 2 {
            let entry = image.read_u16(cursor + 8 + i * 2)?;
            relocations.push(BaseRelocation {
                rva: page + (entry & 0xfff) as u32,
                kind: entry >> 12,
            });
        }
        cursor += block_size;
    }
    Ok(relocations)
}

/// [`ModuleSearch`] and [`ImageMapper`] over PE files in host directories.
///
/// Built-in modules come from an optional [`ImageStore`].
pub struct PeMapper {
    config: PeFileConfig,
    builtins: Option<Arc<ImageStore>>,
}

impl PeMapper {
    /// Map files at their preferred base.
    pub fn new(config: PeFileConfig) -> Self {
        PeMapper {
            config,
            builtins: None,
        }
    }

    /// Serve built-in modules from `store`.
    pub fn with_builtins(mut self, store: Arc<ImageStore>) -> Self {
        self.builtins = Some(store);
        self
    }
}

fn find_in_directory(directory: &Path, name: &str) -> Option<PathBuf> {
    let exact = directory.join(name);
    if exact.is_file() {
        return Some(exact);
    }
    fs::read_dir(directory)
        .ok()?
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_name().to_string_lossy().eq_ignore_ascii_case(name))
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
}

impl ModuleSearch for PeMapper {
    fn search_for_module(&self, name: &str, directories: &[String]) -> Option<String> {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.is_file().then(|| name.to_string());
        }
        directories
            .iter()
            .find_map(|directory| find_in_directory(Path::new(directory), name))
            .map(|path| path.to_string_lossy().into_owned())
    }
}

impl ImageMapper for PeMapper {
    fn map_native(&self, path: &str) -> std::result::Result<MappedImage, MapError> {
        let file = match PeFile::open(path) {
            Ok(file) => file,
            Err(Error::FileError(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(MapError::NotFound)
            }
            Err(e) => return Err(MapError::Fatal(e)),
        };
        Ok(file.map(&self.config)?)
    }

    fn map_builtin(&self, name: &str, path: &str) -> std::result::Result<MappedImage, MapError> {
        match &self.builtins {
            Some(store) => store.map_builtin(name, path),
            None => Err(MapError::NotFound),
        }
    }
}
