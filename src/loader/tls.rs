//! Static thread-local storage.
//!
//! At process start every module with a TLS directory gets a dense slot index, written back
//! into the module's index cell, and is pinned: slot indices are never reused. Each thread then
//! owns one buffer holding a copy of every module's template followed by its zero-fill area.
//!
//! The directory list is append-only ([`boxcar::Vec`]), so thread setup reads it without
//! taking the loader's bookkeeping lock.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread::ThreadId,
};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::{
    loader::{
        module::{LoadCount, ModuleHandle},
        table::ModuleTable,
    },
    Error, Result,
};

/// The TLS template of one module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsTemplate {
    /// Owning module
    pub module: ModuleHandle,
    /// Initialized data copied into every thread's block
    pub data: Vec<u8>,
    /// Zeroed bytes following the initialized data
    pub zero_fill: u32,
}

impl TlsTemplate {
    /// Size of the module's block in each thread.
    pub fn block_size(&self) -> usize {
        self.data.len() + self.zero_fill as usize
    }
}

/// The TLS blocks of one thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadTls {
    blocks: Vec<(usize, usize)>,
    data: Vec<u8>,
}

impl ThreadTls {
    /// Number of module blocks.
    pub fn slot_count(&self) -> usize {
        self.blocks.len()
    }

    /// The block of the module with TLS index `index`.
    pub fn block(&self, index: u32) -> Option<&[u8]> {
        let (start, len) = *self.blocks.get(index as usize)?;
        self.data.get(start..start + len)
    }

    /// Mutable access to the block of the module with TLS index `index`.
    pub fn block_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        let (start, len) = *self.blocks.get(index as usize)?;
        self.data.get_mut(start..start + len)
    }
}

/// Process-wide TLS slot assignment and per-thread blocks.
pub struct TlsAllocator {
    directories: boxcar::Vec<TlsTemplate>,
    total_bytes: AtomicUsize,
    initialized: AtomicBool,
    threads: DashMap<ThreadId, ThreadTls>,
}

impl Default for TlsAllocator {
    fn default() -> Self {
        TlsAllocator {
            directories: boxcar::Vec::new(),
            total_bytes: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            threads: DashMap::new(),
        }
    }
}

impl TlsAllocator {
    /// Create an allocator with no slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether slots have been assigned.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Number of modules with a TLS slot.
    pub fn module_count(&self) -> usize {
        self.directories.count()
    }

    /// Size of one thread's TLS buffer.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// Template of slot `index`.
    pub fn template(&self, index: u32) -> Option<&TlsTemplate> {
        self.directories.get(index as usize)
    }

    /// Assign slots to every module with a TLS directory, in memory order. Runs once.
    ///
    /// Slots are committed only after every index cell was written, so a failed call can be
    /// retried.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] if the combined block size overflows, and image access
    /// errors for directories pointing outside their image.
    pub(crate) fn init_process(&self, table: &mut ModuleTable) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let mut total: usize = 0;
        let mut templates = Vec::new();
        for handle in table.memory_order() {
            let Some(module) = table.get(*handle) else {
                continue;
            };
            let Some(tls) = module.image.tls.as_ref() else {
                continue;
            };
            let data = module
                .image
                .read(tls.raw_data.start, tls.raw_size())?
                .to_vec();
            total = total
                .checked_add(tls.block_size())
                .ok_or(Error::OutOfMemory)?;
            templates.push((
                tls.index_rva,
                TlsTemplate {
                    module: *handle,
                    data,
                    zero_fill: tls.zero_fill,
                },
            ));
        }

        for (index, (index_rva, template)) in templates.iter().enumerate() {
            if let Some(module) = table.get_mut(template.module) {
                module.image.write_u32(*index_rva, index as u32)?;
            }
        }

        for (index, (_, template)) in templates.into_iter().enumerate() {
            if let Some(module) = table.get_mut(template.module) {
                module.tls_index = Some(index as u32);
                module.load_count = LoadCount::PINNED;
                trace!("{}: TLS index {}", module.base_name(), index);
            }
            self.directories.push(template);
        }

        self.total_bytes.store(total, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        debug!(
            "TLS: {} modules, {} bytes per thread",
            self.module_count(),
            total
        );
        Ok(())
    }

    /// Allocate and initialize the TLS blocks of `thread`, replacing any previous ones.
    ///
    /// Nothing is installed unless every allocation succeeds.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] if an allocation fails.
    pub fn init_thread(&self, thread: ThreadId) -> Result<()> {
        let count = self.module_count();
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(count)
            .map_err(|_| Error::OutOfMemory)?;
        let mut data = Vec::new();
        data.try_reserve_exact(self.total_bytes())
            .map_err(|_| Error::OutOfMemory)?;

        for (_, template) in self.directories.iter() {
            blocks.push((data.len(), template.block_size()));
            data.extend_from_slice(&template.data);
            data.resize(data.len() + template.zero_fill as usize, 0);
        }

        self.threads.insert(thread, ThreadTls { blocks, data });
        Ok(())
    }

    /// Free the TLS blocks of `thread`.
    pub fn free_thread(&self, thread: ThreadId) -> bool {
        self.threads.remove(&thread).is_some()
    }

    /// Whether `thread` has TLS blocks.
    pub fn has_thread(&self, thread: ThreadId) -> bool {
        self.threads.contains_key(&thread)
    }

    /// Copy of the block of slot `index` in `thread`.
    pub fn block(&self, thread: ThreadId, index: u32) -> Option<Vec<u8>> {
        self.threads
            .get(&thread)
            .and_then(|tls| tls.block(index).map(<[u8]>::to_vec))
    }

    /// Run `f` on the block of slot `index` in `thread`.
    pub fn with_block_mut<R>(
        &self,
        thread: ThreadId,
        index: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        let mut tls = self.threads.get_mut(&thread)?;
        tls.block_mut(index).map(f)
    }
}
