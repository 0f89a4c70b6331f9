//! Mapped executable images.
//!
//! A [`MappedImage`] is the result of the "map image into memory" step: the image bytes laid
//! out at their virtual addresses together with the decoded directories the loader and the
//! unwinder consume (exports, imports, TLS, the function table and base relocations).
//!
//! Images are produced by one of three sources:
//!
//! - [`pe::PeFile`] parses an on-disk PE file with `goblin`, lays out its sections and decodes
//!   the directories from the laid-out memory
//! - [`builder::ImageBuilder`] assembles synthetic images (built-in modules and tests)
//! - [`store::ImageStore`] serves prepared images by path or built-in name
//!
//! All directory addresses are stored as RVAs so an image can be rebased with
//! [`MappedImage::relocate`] without touching the decoded tables.

use std::ops::Range;

use strum::Display;

use crate::{unwind::table::RuntimeFunction, Error, Result};

pub mod builder;
pub mod pe;
pub mod store;

/// Relocation type constants as defined by the PE specification.
pub mod reloc_type {
    /// The base relocation is skipped (padding).
    pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
    /// 32-bit field fixup.
    pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
    /// 64-bit field fixup.
    pub const IMAGE_REL_BASED_DIR64: u16 = 10;
}

/// Target architecture of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Machine {
    /// 32-bit x86 (loader support only, no unwinder)
    #[strum(serialize = "i386")]
    I386,
    /// x86-64
    #[strum(serialize = "x86_64")]
    X86_64,
    /// AArch64
    #[strum(serialize = "arm64")]
    Arm64,
}

impl Machine {
    /// Size in bytes of a pointer (and of an import address table slot).
    pub fn pointer_size(self) -> usize {
        match self {
            Machine::I386 => 4,
            Machine::X86_64 | Machine::Arm64 => 8,
        }
    }
}

/// One entry of the export name table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportName {
    /// Exported symbol name
    pub name: String,
    /// Index into [`ExportDirectory::functions`] (the unbiased ordinal)
    pub index: u32,
}

/// Decoded export directory.
///
/// `functions` is the export address table indexed by `ordinal - ordinal_base`; a zero entry
/// means "exported by ordinal but not present". `names` is sorted by byte-wise name comparison.
/// An export whose RVA falls into `rva..rva + size` is a forwarder string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportDirectory {
    /// RVA of the export directory
    pub rva: u32,
    /// Size in bytes of the export directory
    pub size: u32,
    /// Ordinal of the first entry in `functions`
    pub ordinal_base: u32,
    /// Export address table (RVAs)
    pub functions: Vec<u32>,
    /// Sorted export name table
    pub names: Vec<ExportName>,
}

impl ExportDirectory {
    /// Whether `rva` lies inside the export directory byte range (forwarder check).
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.rva && (rva as u64) < self.rva as u64 + self.size as u64
    }
}

/// One thunk of an import lookup table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportThunk {
    /// Import by ordinal
    Ordinal(u16),
    /// Import by name, with the index hint into the exporter's name table
    Name {
        /// Hint into the exporter's sorted name table
        hint: u16,
        /// Symbol name
        name: String,
    },
}

impl ImportThunk {
    /// Import `name` with a zero hint.
    pub fn name(name: impl Into<String>) -> Self {
        ImportThunk::Name {
            hint: 0,
            name: name.into(),
        }
    }

    /// Import `name` with an explicit hint.
    pub fn hinted(name: impl Into<String>, hint: u16) -> Self {
        ImportThunk::Name {
            hint,
            name: name.into(),
        }
    }

    /// Import by ordinal.
    pub fn ordinal(ordinal: u16) -> Self {
        ImportThunk::Ordinal(ordinal)
    }
}

impl std::fmt::Display for ImportThunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportThunk::Ordinal(ordinal) => write!(f, "#{}", ordinal),
            ImportThunk::Name { name, .. } => f.write_str(name),
        }
    }
}

/// One import descriptor: a dependency module and the symbols taken from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportDescriptor {
    /// Name of the imported module as written in the image
    pub dll_name: String,
    /// Import lookup table
    pub thunks: Vec<ImportThunk>,
    /// RVA of the import address table (one pointer-sized slot per thunk)
    pub first_thunk: u32,
}

/// Decoded TLS directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsDirectory {
    /// RVA range of the initialized TLS template
    pub raw_data: Range<u32>,
    /// Bytes zero-filled after the template
    pub zero_fill: u32,
    /// RVA of the 32-bit cell receiving the module's TLS index
    pub index_rva: u32,
    /// RVAs of the TLS callbacks, in registration order
    pub callbacks: Vec<u32>,
}

impl TlsDirectory {
    /// Size of the initialized template.
    pub fn raw_size(&self) -> usize {
        self.raw_data.end.saturating_sub(self.raw_data.start) as usize
    }

    /// Size of one thread's data block for this module.
    pub fn block_size(&self) -> usize {
        self.raw_size() + self.zero_fill as usize
    }
}

/// A base relocation entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BaseRelocation {
    /// RVA of the field to fix up
    pub rva: u32,
    /// One of the [`reloc_type`] constants
    pub kind: u16,
}

/// An image laid out at its virtual addresses, with decoded directories.
#[derive(Clone, Debug)]
pub struct MappedImage {
    /// File name the image was created from
    pub name: String,
    /// Address the image is mapped at
    pub base: u64,
    /// Address the image was linked for
    pub preferred_base: u64,
    /// Size of the mapped image in bytes
    pub size: u32,
    /// Target architecture
    pub machine: Machine,
    /// `true` for libraries, `false` for executables
    pub is_dll: bool,
    /// Entry point RVA
    pub entry_point: Option<u32>,
    /// Image bytes, `size` long
    pub memory: Vec<u8>,
    /// Export directory
    pub exports: Option<ExportDirectory>,
    /// Import descriptors in file order
    pub imports: Vec<ImportDescriptor>,
    /// TLS directory
    pub tls: Option<TlsDirectory>,
    /// Function table (exception directory), sorted by begin address
    pub functions: Vec<RuntimeFunction>,
    /// Base relocations
    pub relocations: Vec<BaseRelocation>,
}

impl MappedImage {
    /// Convert an RVA to a virtual address.
    pub fn rva_to_va(&self, rva: u32) -> u64 {
        self.base + rva as u64
    }

    /// Convert a virtual address inside the image to an RVA.
    pub fn va_to_rva(&self, va: u64) -> Option<u32> {
        if self.contains_va(va) {
            Some((va - self.base) as u32)
        } else {
            None
        }
    }

    /// Whether `va` lies inside `[base, base + size)`.
    pub fn contains_va(&self, va: u64) -> bool {
        va >= self.base && va < self.base + self.size as u64
    }

    /// Virtual address of the entry point.
    pub fn entry_point_va(&self) -> Option<u64> {
        self.entry_point.map(|rva| self.rva_to_va(rva))
    }

    /// Borrow `len` bytes at `rva`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the range leaves the image.
    pub fn read(&self, rva: u32, len: usize) -> Result<&[u8]> {
        let start = rva as usize;
        let end = start.checked_add(len).ok_or(Error::OutOfBounds)?;
        self.memory.get(start..end).ok_or(Error::OutOfBounds)
    }

    /// Read a little-endian `u16` at `rva`.
    pub fn read_u16(&self, rva: u32) -> Result<u16> {
        let bytes = self.read(rva, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a little-endian `u32` at `rva`.
    pub fn read_u32(&self, rva: u32) -> Result<u32> {
        let bytes = self.read(rva, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a little-endian `u64` at `rva`.
    pub fn read_u64(&self, rva: u32) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.read(rva, 8)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a pointer-sized value at `rva`.
    pub fn read_pointer(&self, rva: u32) -> Result<u64> {
        match self.machine.pointer_size() {
            4 => self.read_u32(rva).map(u64::from),
            _ => self.read_u64(rva),
        }
    }

    /// Read a NUL-terminated string at `rva`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if `rva` is outside the image and
    /// [`Error::Malformed`] if the string is unterminated or not valid UTF-8.
    pub fn read_cstr(&self, rva: u32) -> Result<String> {
        let tail = self.memory.get(rva as usize..).ok_or(Error::OutOfBounds)?;
        let Some(len) = tail.iter().position(|&b| b == 0) else {
            return Err(malformed_error!("Unterminated string at RVA {:#x}", rva));
        };
        String::from_utf8(tail[..len].to_vec())
            .map_err(|_| malformed_error!("Invalid string at RVA {:#x}", rva))
    }

    /// Copy `bytes` into the image at `rva`.
    pub fn write(&mut self, rva: u32, bytes: &[u8]) -> Result<()> {
        let start = rva as usize;
        let end = start.checked_add(bytes.len()).ok_or(Error::OutOfBounds)?;
        let target = self.memory.get_mut(start..end).ok_or(Error::OutOfBounds)?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Write a little-endian `u32` at `rva`.
    pub fn write_u32(&mut self, rva: u32, value: u32) -> Result<()> {
        self.write(rva, &value.to_le_bytes())
    }

    /// Write a pointer-sized value at `rva`.
    pub fn write_pointer(&mut self, rva: u32, value: u64) -> Result<()> {
        match self.machine.pointer_size() {
            4 => self.write(rva, &(value as u32).to_le_bytes()),
            _ => self.write(rva, &value.to_le_bytes()),
        }
    }

    /// Move the image to `new_base`, applying its base relocations.
    ///
    /// # Errors
    /// Returns [`Error::LoadFailed`] if the image has to move but carries no relocation
    /// data, and [`Error::OutOfBounds`] for relocations outside the image.
    pub fn relocate(&mut self, new_base: u64) -> Result<()> {
        let delta = new_base.wrapping_sub(self.base) as i64;
        if delta == 0 {
            return Ok(());
        }
        if self.relocations.is_empty() {
            return Err(Error::LoadFailed {
                name: self.name.clone(),
                reason: "image requires relocation but has no relocation directory".to_string(),
            });
        }

        let relocations = std::mem::take(&mut self.relocations);
        for relocation in &relocations {
            match relocation.kind {
                reloc_type::IMAGE_REL_BASED_ABSOLUTE => {}
                reloc_type::IMAGE_REL_BASED_HIGHLOW => {
                    let value = self.read_u32(relocation.rva)?;
                    self.write_u32(relocation.rva, (value as i64 + delta) as u32)?;
                }
                reloc_type::IMAGE_REL_BASED_DIR64 => {
                    let value = self.read_u64(relocation.rva)?;
                    self.write(relocation.rva, &((value as i64 + delta) as u64).to_le_bytes())?;
                }
                _ => {}
            }
        }
        self.relocations = relocations;
        self.base = new_base;
        Ok(())
    }
}

impl crate::unwind::memory::MemoryReader for MappedImage {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let rva = self.va_to_rva(address).ok_or(Error::MemoryFault(address))?;
        let bytes = MappedImage::read(self, rva, buf.len()).map_err(|_| Error::MemoryFault(address))?;
        buf.copy_from_slice(bytes);
        Ok(())
    }
}
