use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    image::{builder::ImageBuilder, store::ImageStore},
    loader::{
        collab::{DllReason, EntryTable},
        config::LoaderConfig,
        Loader,
    },
    unwind::UnwindFlags,
};

pub const IMAGE_BASE: u64 = 0x1000_0000;
pub const STACK_BASE: u64 = 0x7000_0000;

// Helper function to encode one x64 unwind code slot
pub fn unwind_code(offset: u8, op: u8, info: u8) -> [u8; 2] {
    [offset, op | (info << 4)]
}

// Helper function to assemble x64 UNWIND_INFO: header, codes padded to an even count, then
// whatever follows the codes (handler RVA and data, or a chained entry)
pub fn x64_unwind_info(
    flags: UnwindFlags,
    prolog: u8,
    frame_reg: u8,
    frame_offset: u8,
    codes: &[[u8; 2]],
    tail: &[u8],
) -> Vec<u8> {
    let mut info = vec![
        1 | (flags.bits() << 3),
        prolog,
        codes.len() as u8,
        frame_reg | (frame_offset << 4),
    ];
    for code in codes {
        info.extend_from_slice(code);
    }
    if codes.len() % 2 == 1 {
        info.extend_from_slice(&[0, 0]);
    }
    info.extend_from_slice(tail);
    info
}

// Helper function to build images and register them as built-in modules
pub fn store_with(images: Vec<ImageBuilder>) -> Arc<ImageStore> {
    let store = Arc::new(ImageStore::new());
    for image in images {
        store.add_builtin(image.build().unwrap());
    }
    store
}

pub fn loader_with(store: Arc<ImageStore>) -> Loader {
    loader_with_config(store, LoaderConfig::default())
}

pub fn loader_with_config(store: Arc<ImageStore>, config: LoaderConfig) -> Loader {
    Loader::builder(config)
        .search(store.clone())
        .mapper(store)
        .build()
}

// Helper function for a loader whose entry points at `addresses` record into `log`
pub fn loader_with_entries(store: Arc<ImageStore>, log: &EntryLog, addresses: &[u64]) -> Loader {
    let entries = EntryTable::new();
    for &address in addresses {
        let log = log.clone();
        entries.register(address, move |_, call| log.record(&call.name, address, call.reason));
    }
    Loader::builder(LoaderConfig::default())
        .search(store.clone())
        .mapper(store)
        .entry_points(Arc::new(entries))
        .build()
}

#[derive(Default)]
struct EntryLogState {
    calls: Vec<(String, DllReason)>,
    failing: Vec<u64>,
}

/// Records entry point calls in order.
#[derive(Clone, Default)]
pub struct EntryLog {
    state: Arc<Mutex<EntryLogState>>,
}

impl EntryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the process attach of the routine at `address` fail.
    pub fn fail_attach(&self, address: u64) {
        self.state.lock().failing.push(address);
    }

    pub fn calls(&self) -> Vec<(String, DllReason)> {
        self.state.lock().calls.clone()
    }

    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }

    pub fn record(&self, name: &str, address: u64, reason: DllReason) -> bool {
        let mut state = self.state.lock();
        state.calls.push((name.to_string(), reason));
        !(reason == DllReason::ProcessAttach && state.failing.contains(&address))
    }
}
