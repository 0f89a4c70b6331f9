//! Memory access for the unwinder.
//!
//! Unwinding reads three kinds of memory: unwind metadata inside images, instruction bytes
//! (epilogue detection) and the thread's stack. All of it goes through [`MemoryReader`], so the
//! engines run unchanged against a live process, a mapped image or the in-memory
//! [`SimulatedMemory`] used by emulators and tests.

use std::{collections::BTreeMap, sync::Arc};

use crate::{image::MappedImage, Error, Result};

/// Read-only access to an address space.
pub trait MemoryReader {
    /// Fill `buf` with the bytes at `address`.
    ///
    /// # Errors
    /// Returns [`Error::MemoryFault`] if any byte of the range is not mapped.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Read one byte.
    fn read_u8(&self, address: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(address, &mut buf)?;
        Ok(buf[0])
    }

    /// Read a little-endian `u16`.
    fn read_u16(&self, address: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a little-endian `u32`.
    fn read_u32(&self, address: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a little-endian `u64`.
    fn read_u64(&self, address: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a little-endian `u128` (vector registers).
    fn read_u128(&self, address: u64) -> Result<u128> {
        let mut buf = [0u8; 16];
        self.read(address, &mut buf)?;
        Ok(u128::from_le_bytes(buf))
    }
}

impl<T: MemoryReader + ?Sized> MemoryReader for Arc<T> {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read(address, buf)
    }
}

impl<T: MemoryReader + ?Sized> MemoryReader for &T {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read(address, buf)
    }
}

/// A sparse address space made of non-overlapping byte regions.
#[derive(Clone, Debug, Default)]
pub struct SimulatedMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SimulatedMemory {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `base`.
    ///
    /// # Errors
    /// Returns [`Error::MemoryFault`] if the region overlaps an existing one.
    pub fn map(&mut self, base: u64, bytes: Vec<u8>) -> Result<()> {
        let end = base
            .checked_add(bytes.len() as u64)
            .ok_or(Error::MemoryFault(base))?;
        if let Some((start, region)) = self.regions.range(..end).next_back() {
            if start + region.len() as u64 > base {
                return Err(Error::MemoryFault(base));
            }
        }
        self.regions.insert(base, bytes);
        Ok(())
    }

    /// Map `len` zero bytes at `base`.
    pub fn map_zeroed(&mut self, base: u64, len: usize) -> Result<()> {
        self.map(base, vec![0u8; len])
    }

    /// Map a copy of an image's memory at its base address.
    pub fn map_image(&mut self, image: &MappedImage) -> Result<()> {
        self.map(image.base, image.memory.clone())
    }

    /// Overwrite mapped bytes at `address`.
    ///
    /// # Errors
    /// Returns [`Error::MemoryFault`] if the range is not fully inside one region.
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        let (start, region) = self
            .regions
            .range_mut(..=address)
            .next_back()
            .ok_or(Error::MemoryFault(address))?;
        let offset = (address - start) as usize;
        let target = region
            .get_mut(offset..offset + bytes.len())
            .ok_or(Error::MemoryFault(address))?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Write a little-endian `u64`.
    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Write a little-endian `u32`.
    pub fn write_u32(&mut self, address: u64, value: u32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }
}

impl MemoryReader for SimulatedMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let (start, region) = self
            .regions
            .range(..=address)
            .next_back()
            .ok_or(Error::MemoryFault(address))?;
        let offset = (address - start) as usize;
        let source = region
            .get(offset..offset + buf.len())
            .ok_or(Error::MemoryFault(address))?;
        buf.copy_from_slice(source);
        Ok(())
    }
}
