//! Function tables: the "look up per-function unwind metadata by instruction pointer"
//! capability.
//!
//! Every loaded image with an exception directory contributes a static table of
//! [`RuntimeFunction`] entries, sorted by begin address. Code generated at runtime registers
//! dynamic tables instead, either as an explicit list ([`FunctionTables::add_function_table`])
//! or as a callback that produces an entry on demand for an address range
//! ([`FunctionTables::install_table_callback`]).
//!
//! Static tables are keyed by image base in a lock-free skip list; a lookup takes the nearest
//! base at or below the address and binary searches inside it. The [`HistoryTable`] caches the
//! most recent results for the duration of one dispatch pass.

use std::{
    collections::VecDeque,
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam_skiplist::SkipMap;

/// One function table entry (`RUNTIME_FUNCTION`).
///
/// All fields are RVAs relative to the owning image base. On x86-64 an `unwind_data` with the
/// low bit set points at another [`RuntimeFunction`] rather than at unwind information.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RuntimeFunction {
    /// First byte of the function
    pub begin: u32,
    /// One past the last byte of the function
    pub end: u32,
    /// RVA of the unwind information
    pub unwind_data: u32,
}

impl RuntimeFunction {
    /// Create an entry.
    pub fn new(begin: u32, end: u32, unwind_data: u32) -> Self {
        RuntimeFunction {
            begin,
            end,
            unwind_data,
        }
    }

    /// Whether `rva` lies inside `[begin, end)`.
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.begin && rva < self.end
    }
}

/// Binary search a sorted function table for the entry covering `rva`.
pub fn find_function(functions: &[RuntimeFunction], rva: u32) -> Option<&RuntimeFunction> {
    let index = functions.partition_point(|function| function.begin <= rva);
    let candidate = functions.get(index.checked_sub(1)?)?;
    candidate.contains(rva).then_some(candidate)
}

/// The result of a function table lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionLookup {
    /// The entry covering the address
    pub function: RuntimeFunction,
    /// Base the entry's RVAs are relative to
    pub image_base: u64,
    /// Name of the owning module, for static tables
    pub module: Option<Arc<str>>,
}

impl FunctionLookup {
    /// Whether `pc` lies inside the function.
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.image_base + self.function.begin as u64
            && pc < self.image_base + self.function.end as u64
    }

    /// Virtual address of the function's first byte.
    pub fn begin_va(&self) -> u64 {
        self.image_base + self.function.begin as u64
    }

    /// Virtual address of the unwind information.
    pub fn unwind_data_va(&self) -> u64 {
        self.image_base + self.function.unwind_data as u64
    }
}

/// Callback producing a function entry for an address inside a registered range.
pub type FunctionTableCallback = Arc<dyn Fn(u64) -> Option<RuntimeFunction> + Send + Sync>;

/// Identifier of a dynamic function table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DynamicTableId(u64);

struct StaticTable {
    name: Arc<str>,
    size: u64,
    functions: Vec<RuntimeFunction>,
}

enum DynamicSource {
    Entries(Vec<RuntimeFunction>),
    Callback(FunctionTableCallback),
}

struct DynamicTable {
    base: u64,
    low: u64,
    high: u64,
    source: DynamicSource,
}

/// All function tables of an address space.
#[derive(Default)]
pub struct FunctionTables {
    modules: SkipMap<u64, StaticTable>,
    dynamic: SkipMap<DynamicTableId, DynamicTable>,
    next_id: AtomicU64,
}

impl FunctionTables {
    /// Create an empty set of tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the static table of an image mapped at `base`.
    pub fn register_module(
        &self,
        name: &str,
        base: u64,
        size: u64,
        mut functions: Vec<RuntimeFunction>,
    ) {
        functions.sort_by_key(|function| function.begin);
        self.modules.insert(
            base,
            StaticTable {
                name: Arc::from(name),
                size,
                functions,
            },
        );
    }

    /// Drop the static table registered at `base`.
    pub fn unregister_module(&self, base: u64) -> bool {
        self.modules.remove(&base).is_some()
    }

    /// Number of registered static tables.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Register a dynamic table whose entries are relative to `base`.
    pub fn add_function_table(
        &self,
        mut functions: Vec<RuntimeFunction>,
        base: u64,
    ) -> DynamicTableId {
        functions.sort_by_key(|function| function.begin);
        let low = functions
            .first()
            .map_or(base, |function| base + function.begin as u64);
        let high = functions
            .iter()
            .map(|function| base + function.end as u64)
            .max()
            .unwrap_or(base);
        self.insert_dynamic(DynamicTable {
            base,
            low,
            high,
            source: DynamicSource::Entries(functions),
        })
    }

    /// Register a callback answering lookups inside `[base, base + length)`.
    pub fn install_table_callback(
        &self,
        base: u64,
        length: u64,
        callback: FunctionTableCallback,
    ) -> DynamicTableId {
        self.insert_dynamic(DynamicTable {
            base,
            low: base,
            high: base.saturating_add(length),
            source: DynamicSource::Callback(callback),
        })
    }

    /// Remove a dynamic table. Returns `false` if the id is unknown.
    pub fn delete_function_table(&self, id: DynamicTableId) -> bool {
        self.dynamic.remove(&id).is_some()
    }

    fn insert_dynamic(&self, table: DynamicTable) -> DynamicTableId {
        let id = DynamicTableId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.dynamic.insert(id, table);
        id
    }

    /// Find the entry covering `pc`, static tables first.
    pub fn lookup(&self, pc: u64) -> Option<FunctionLookup> {
        if let Some(entry) = self.modules.upper_bound(Bound::Included(&pc)) {
            let base = *entry.key();
            let table = entry.value();
            if pc < base + table.size {
                let rva = (pc - base) as u32;
                return find_function(&table.functions, rva).map(|function| FunctionLookup {
                    function: *function,
                    image_base: base,
                    module: Some(table.name.clone()),
                });
            }
        }

        for entry in self.dynamic.iter() {
            let table = entry.value();
            if pc < table.low || pc >= table.high {
                continue;
            }
            let function = match &table.source {
                DynamicSource::Entries(functions) => {
                    find_function(functions, (pc - table.base) as u32).copied()
                }
                DynamicSource::Callback(callback) => callback(pc),
            };
            if let Some(function) = function {
                return Some(FunctionLookup {
                    function,
                    image_base: table.base,
                    module: None,
                });
            }
        }
        None
    }

    /// Find the entry covering `pc`, consulting and filling `history` first.
    pub fn lookup_cached(
        &self,
        pc: u64,
        history: Option<&mut HistoryTable>,
    ) -> Option<FunctionLookup> {
        match history {
            Some(history) => {
                if let Some(hit) = history.lookup(pc) {
                    return Some(hit);
                }
                let found = self.lookup(pc)?;
                history.insert(found.clone());
                Some(found)
            }
            None => self.lookup(pc),
        }
    }
}

/// Number of entries kept by a [`HistoryTable`].
pub const UNWIND_HISTORY_TABLE_SIZE: usize = 12;

/// Cache of recent function lookups, owned by one dispatch pass.
#[derive(Clone, Debug, Default)]
pub struct HistoryTable {
    entries: VecDeque<FunctionLookup>,
    hits: usize,
}

impl HistoryTable {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached entry covering `pc`.
    pub fn lookup(&mut self, pc: u64) -> Option<FunctionLookup> {
        let found = self.entries.iter().find(|entry| entry.contains(pc)).cloned();
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    /// Cache a lookup result, evicting the oldest entry when full.
    pub fn insert(&mut self, lookup: FunctionLookup) {
        if self.entries.len() == UNWIND_HISTORY_TABLE_SIZE {
            self.entries.pop_front();
        }
        self.entries.push_back(lookup);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of lookups answered from the cache.
    pub fn hits(&self) -> usize {
        self.hits
    }
}
