//! The module table.
//!
//! Live modules sit in a generation-checked arena. Three orderings are kept over them: load
//! order (insertion, executables ahead of libraries), memory order (ascending base address) and
//! initialization order (attach completion). A one-entry cache short-cuts repeated lookups of the
//! same name.
//!
//! The table does no locking of its own. It is only reached through the loader's bookkeeping
//! mutex, which in turn is only taken while the loader lock is held.

use crate::loader::module::{Module, ModuleHandle};

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    module: Option<Module>,
}

#[derive(Debug, Default)]
pub(crate) struct ModuleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    load_order: Vec<ModuleHandle>,
    memory_order: Vec<ModuleHandle>,
    init_order: Vec<ModuleHandle>,
    cache: Option<ModuleHandle>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `module` to the load and memory orders.
    pub fn insert(&mut self, module: Module) -> ModuleHandle {
        let is_dll = module.is_dll();
        let base = module.image.base;

        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.module = Some(module);
                ModuleHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    module: Some(module),
                });
                ModuleHandle {
                    index: self.slots.len() as u32 - 1,
                    generation: 0,
                }
            }
        };

        let load_at = if is_dll {
            self.load_order.len()
        } else {
            self.load_order
                .iter()
                .position(|h| self.get(*h).is_some_and(Module::is_dll))
                .unwrap_or(self.load_order.len())
        };
        self.load_order.insert(load_at, handle);

        let memory_at = self
            .memory_order
            .iter()
            .position(|h| self.get(*h).is_some_and(|m| m.image.base > base))
            .unwrap_or(self.memory_order.len());
        self.memory_order.insert(memory_at, handle);

        handle
    }

    /// Record that `handle` completed its attach.
    pub fn push_init_order(&mut self, handle: ModuleHandle) {
        if !self.init_order.contains(&handle) {
            self.init_order.push(handle);
        }
    }

    pub fn get(&self, handle: ModuleHandle) -> Option<&Module> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.module.as_ref())
    }

    pub fn get_mut(&mut self, handle: ModuleHandle) -> Option<&mut Module> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.module.as_mut())
    }

    pub fn contains(&self, handle: ModuleHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Find a module by full path, base name, short path or short base name.
    pub fn find_by_name(&mut self, name: &str) -> Option<ModuleHandle> {
        if let Some(cached) = self.cache {
            if self.get(cached).is_some_and(|m| m.names.matches(name)) {
                return Some(cached);
            }
        }

        let found = self
            .load_order
            .iter()
            .copied()
            .find(|h| self.get(*h).is_some_and(|m| m.names.matches(name)))?;
        self.cache = Some(found);
        Some(found)
    }

    /// Find the module whose image contains `address`.
    pub fn find_by_address(&self, address: u64) -> Option<ModuleHandle> {
        let mut previous = None;
        for handle in &self.memory_order {
            let Some(module) = self.get(*handle) else {
                continue;
            };
            if module.image.base > address {
                break;
            }
            previous = Some((*handle, module));
        }
        previous
            .filter(|(_, module)| module.image.contains_va(address))
            .map(|(handle, _)| handle)
    }

    /// Whether `[base, base + size)` overlaps a loaded image.
    pub fn overlaps(&self, base: u64, size: u64) -> bool {
        self.modules().any(|(_, module)| {
            let start = module.image.base;
            let end = start + module.image.size as u64;
            base < end && start < base.saturating_add(size)
        })
    }

    /// Highest end address of any loaded image.
    pub fn highest_address(&self) -> u64 {
        self.modules()
            .map(|(_, m)| m.image.base + m.image.size as u64)
            .max()
            .unwrap_or(0)
    }

    /// Remove `handle` from every ordering and free its slot.
    pub fn remove(&mut self, handle: ModuleHandle) -> Option<Module> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let module = slot.module.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        self.load_order.retain(|h| *h != handle);
        self.memory_order.retain(|h| *h != handle);
        self.init_order.retain(|h| *h != handle);
        if self.cache == Some(handle) {
            self.cache = None;
        }
        Some(module)
    }

    pub fn load_order(&self) -> &[ModuleHandle] {
        &self.load_order
    }

    pub fn memory_order(&self) -> &[ModuleHandle] {
        &self.memory_order
    }

    pub fn init_order(&self) -> &[ModuleHandle] {
        &self.init_order
    }

    /// Live modules in load order.
    pub fn modules(&self) -> impl Iterator<Item = (ModuleHandle, &Module)> + '_ {
        self.load_order
            .iter()
            .filter_map(|h| self.get(*h).map(|m| (*h, m)))
    }

    pub fn len(&self) -> usize {
        self.load_order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{image::builder::ImageBuilder, loader::config::LoadMechanism};

    fn module(name: &str, base: u64, dll: bool) -> Module {
        let builder = if dll {
            ImageBuilder::dll(name)
        } else {
            ImageBuilder::exe(name)
        };
        let image = builder.base(base).size(0x2000).build().unwrap();
        Module::new(image, &format!("C:\\dir\\{}", name), LoadMechanism::Native)
    }

    #[test]
    fn test_orderings() {
        let mut table = ModuleTable::new();
        let high = table.insert(module("high.dll", 0x3000_0000, true));
        let low = table.insert(module("low.dll", 0x1000_0000, true));
        let exe = table.insert(module("app.exe", 0x40_0000, false));

        assert_eq!(table.load_order(), &[exe, high, low]);
        assert_eq!(table.memory_order(), &[exe, low, high]);
        assert!(table.init_order().is_empty());

        table.push_init_order(low);
        table.push_init_order(low);
        assert_eq!(table.init_order(), &[low]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_find_by_name_and_address() {
        let mut table = ModuleTable::new();
        let a = table.insert(module("alpha.dll", 0x1000_0000, true));
        let b = table.insert(module("beta.dll", 0x2000_0000, true));

        assert_eq!(table.find_by_name("ALPHA.DLL"), Some(a));
        assert_eq!(table.find_by_name("c:\\dir\\beta.dll"), Some(b));
        assert_eq!(table.find_by_name("alpha.dll"), Some(a));
        assert_eq!(table.find_by_name("gamma.dll"), None);

        assert_eq!(table.find_by_address(0x1000_1fff), Some(a));
        assert_eq!(table.find_by_address(0x1000_2000), None);
        assert_eq!(table.find_by_address(0x2000_0000), Some(b));
        assert_eq!(table.find_by_address(0x0fff_ffff), None);
        assert!(table.overlaps(0x1000_1000, 0x2000));
        assert!(!table.overlaps(0x1000_2000, 0x1000));
        assert_eq!(table.highest_address(), 0x2000_2000);
    }

    #[test]
    fn test_remove_invalidates_handle() {
        let mut table = ModuleTable::new();
        let a = table.insert(module("alpha.dll", 0x1000_0000, true));
        table.push_init_order(a);
        assert_eq!(table.find_by_name("alpha.dll"), Some(a));

        assert!(table.remove(a).is_some());
        assert!(table.remove(a).is_none());
        assert!(!table.contains(a));
        assert_eq!(table.find_by_name("alpha.dll"), None);
        assert!(table.init_order().is_empty());

        let b = table.insert(module("beta.dll", 0x1000_0000, true));
        assert_eq!(b.index, a.index);
        assert_ne!(b, a);
        assert!(table.get(a).is_none());
    }
}
