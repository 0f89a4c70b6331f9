//! The attach / detach protocol.
//!
//! Attach walks the dependency graph depth-first and notifies each module after all of its
//! dependencies, recording the completion order. Detach runs in reverse completion order and
//! restarts from the tail after every notification, because module code may load or unload
//! further modules while it runs. References are released transitively; a module is detached
//! and unmapped only after the whole release has finished.

use std::thread;

use tracing::{debug, debug_span, trace, warn};

use crate::{
    loader::{
        collab::{DllReason, EntryCall},
        module::{LoadCount, ModuleFlags, ModuleHandle},
        LoaderSession,
    },
    Error, Result,
};

/// Work gathered under the bookkeeping lock for one module notification.
struct Notification {
    name: String,
    base: u64,
    entry: Option<u64>,
    tls_callbacks: Vec<u64>,
}

impl LoaderSession<'_> {
    /// Attach `handle` and its dependencies.
    ///
    /// Modules already attached, or being attached further up a dependency cycle, are skipped.
    ///
    /// # Errors
    /// Returns [`Error::DllInitFailed`] if an entry point refused the attach, and
    /// [`Error::InvalidHandle`] for an unknown handle.
    pub fn attach(&self, handle: ModuleHandle) -> Result<()> {
        self.process_attach(handle, 0)
    }

    fn process_attach(&self, handle: ModuleHandle, reserved: u64) -> Result<()> {
        let dependencies = self.with_state(|state| {
            let module = state.table.get_mut(handle).ok_or(Error::InvalidHandle)?;
            if module.flags.intersects(
                ModuleFlags::LOAD_IN_PROGRESS
                    | ModuleFlags::PROCESS_ATTACHED
                    | ModuleFlags::DONT_RESOLVE_REFS,
            ) {
                return Ok(None);
            }
            module.flags.insert(ModuleFlags::LOAD_IN_PROGRESS);
            Ok::<_, Error>(Some((
                module.base_name().to_string(),
                module.all_dependencies().collect::<Vec<_>>(),
            )))
        })?;
        let Some((name, dependencies)) = dependencies else {
            return Ok(());
        };
        let _span = debug_span!("attach", module = %name).entered();

        let mut result = Ok(());
        for dependency in dependencies {
            if let Err(e) = self.process_attach(dependency, reserved) {
                result = Err(e);
                break;
            }
        }

        if result.is_ok() {
            result = self.notify(handle, DllReason::ProcessAttach, reserved);
            match &result {
                Ok(()) => {
                    self.with_state(|state| {
                        state.table.push_init_order(handle);
                        if let Some(module) = state.table.get_mut(handle) {
                            module.flags.insert(ModuleFlags::PROCESS_ATTACHED);
                        }
                    });
                    debug!("{} attached", name);
                }
                Err(_) => {
                    if let Err(e) = self.notify(handle, DllReason::ProcessDetach, reserved) {
                        warn!("detach notification of {} failed: {}", name, e);
                    }
                    warn!("Initialization of {} failed", name);
                }
            }
        }

        self.with_state(|state| {
            if let Some(module) = state.table.get_mut(handle) {
                module.flags.remove(ModuleFlags::LOAD_IN_PROGRESS);
            }
        });
        result
    }

    /// Run the TLS callbacks and the entry point of `handle` for `reason`.
    fn notify(&self, handle: ModuleHandle, reason: DllReason, reserved: u64) -> Result<()> {
        let notification = self.with_state(|state| {
            let module = state.table.get(handle)?;
            if module.flags.contains(ModuleFlags::DONT_RESOLVE_REFS) {
                return None;
            }
            let image = &module.image;
            let entry = image
                .entry_point_va()
                .filter(|_| module.is_dll() && !module.flags.contains(ModuleFlags::NO_DLL_CALLS));
            let tls_callbacks = image
                .tls
                .as_ref()
                .map(|tls| tls.callbacks.iter().map(|rva| image.rva_to_va(*rva)).collect())
                .unwrap_or_default();
            Some(Notification {
                name: module.base_name().to_string(),
                base: image.base,
                entry,
                tls_callbacks,
            })
        });
        let Some(notification) = notification else {
            return Ok(());
        };

        let entry_points = &self.loader.entry_points;
        let call = |address| EntryCall {
            module: handle,
            name: notification.name.clone(),
            base: notification.base,
            address,
            reason,
            reserved,
        };

        for callback in &notification.tls_callbacks {
            trace!("{}: TLS callback {:#x} ({})", notification.name, callback, reason);
            entry_points.call_tls_callback(self, &call(*callback));
        }

        let Some(entry) = notification.entry else {
            return Ok(());
        };
        trace!("{}: entry {:#x} ({})", notification.name, entry, reason);
        let succeeded = entry_points.call_entry(self, &call(entry));
        if !succeeded && reason == DllReason::ProcessAttach {
            return Err(Error::DllInitFailed(notification.name));
        }
        Ok(())
    }

    /// Detach attached modules in reverse initialization order: all of them if `force`,
    /// otherwise only those without references.
    pub(crate) fn detach_sweep(&self, force: bool) {
        loop {
            let next = self.with_state(|state| {
                let handle = state.table.init_order().iter().rev().copied().find(|h| {
                    state.table.get(*h).is_some_and(|m| {
                        m.flags.contains(ModuleFlags::PROCESS_ATTACHED)
                            && !m.flags.contains(ModuleFlags::DETACH_IN_PROGRESS)
                            && (force || m.load_count.is_zero())
                    })
                })?;
                let module = state.table.get_mut(handle)?;
                module.flags.insert(ModuleFlags::DETACH_IN_PROGRESS);
                Some((handle, module.base_name().to_string()))
            });
            let Some((handle, name)) = next else {
                break;
            };

            debug!("detaching {}", name);
            if let Err(e) = self.notify(handle, DllReason::ProcessDetach, force as u64) {
                warn!("detach notification of {} failed: {}", name, e);
            }
            self.with_state(|state| {
                if let Some(module) = state.table.get_mut(handle) {
                    module
                        .flags
                        .remove(ModuleFlags::PROCESS_ATTACHED | ModuleFlags::DETACH_IN_PROGRESS);
                }
            });
        }
    }

    /// Drop one reference on `handle`, releasing its dependencies when none remain.
    pub(crate) fn release(&self, handle: ModuleHandle) {
        let dependencies = self.with_state(|state| {
            let module = state.table.get_mut(handle)?;
            if module.flags.contains(ModuleFlags::UNLOAD_IN_PROGRESS) || !module.load_count.decrement() {
                return None;
            }
            trace!("{} load count {}", module.base_name(), module.load_count);
            if !module.load_count.is_zero() {
                return None;
            }
            module.flags.insert(ModuleFlags::UNLOAD_IN_PROGRESS);
            Some(module.all_dependencies().collect::<Vec<_>>())
        });
        let Some(dependencies) = dependencies else {
            return;
        };

        for dependency in dependencies {
            self.release(dependency);
        }
        self.with_state(|state| {
            if let Some(module) = state.table.get_mut(handle) {
                module.flags.remove(ModuleFlags::UNLOAD_IN_PROGRESS);
            }
        });
    }

    /// Unmap every module without references, initialization order first.
    pub(crate) fn flush_modules(&self) {
        let unreferenced: Vec<ModuleHandle> = self.with_state(|state| {
            let table = &state.table;
            let mut handles: Vec<ModuleHandle> = Vec::new();
            for handle in table.init_order().iter().rev().chain(table.load_order().iter().rev()) {
                if table.get(*handle).is_some_and(|m| m.load_count.is_zero()) && !handles.contains(handle) {
                    handles.push(*handle);
                }
            }
            handles
        });
        for handle in unreferenced {
            self.free_module(handle);
        }
    }

    /// Release one reference on `handle` (`FreeLibrary`).
    ///
    /// Modules left without references are detached and unmapped once the outermost unload
    /// call finishes. During process shutdown this does nothing.
    ///
    /// # Errors
    /// Returns [`Error::InvalidHandle`] for an unknown handle.
    pub fn unload_module(&self, handle: ModuleHandle) -> Result<()> {
        if self.with_state(|state| state.process_detaching) {
            return Ok(());
        }
        let _span = debug_span!("unload_module", module = %self.module_name(handle)).entered();

        let outermost = self.with_state(|state| {
            if !state.table.contains(handle) {
                return Err(Error::InvalidHandle);
            }
            state.free_lib_count += 1;
            Ok(state.free_lib_count == 1)
        })?;

        self.release(handle);
        if outermost {
            self.detach_sweep(false);
            self.flush_modules();
        }

        self.with_state(|state| state.free_lib_count -= 1);
        Ok(())
    }

    /// Add a reference to `handle`, or pin it so it is never unloaded.
    ///
    /// # Errors
    /// Returns [`Error::InvalidHandle`] for an unknown handle.
    pub fn add_ref(&self, handle: ModuleHandle, pin: bool) -> Result<()> {
        self.with_state(|state| {
            let module = state.table.get_mut(handle).ok_or(Error::InvalidHandle)?;
            if pin {
                module.load_count = LoadCount::PINNED;
            } else {
                module.load_count.increment();
            }
            Ok(())
        })
    }

    /// Stop sending thread notifications to `handle`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidHandle`] for an unknown handle.
    pub fn disable_thread_calls(&self, handle: ModuleHandle) -> Result<()> {
        self.with_state(|state| {
            let module = state.table.get_mut(handle).ok_or(Error::InvalidHandle)?;
            module.flags.insert(ModuleFlags::NO_DLL_CALLS);
            Ok(())
        })
    }

    /// Start the process: assign TLS slots, set up the calling thread and attach every
    /// primary executable with its dependencies.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] if the thread's TLS block cannot be allocated and the
    /// attach errors of [`LoaderSession::attach`].
    pub fn on_process_attach(&self) -> Result<()> {
        let _span = debug_span!("process_attach").entered();
        let executables = self.with_state(|state| {
            self.loader.tls.init_process(&mut state.table)?;
            Ok::<_, Error>(
                state
                    .table
                    .modules()
                    .filter(|(_, m)| !m.is_dll())
                    .map(|(h, _)| h)
                    .collect::<Vec<_>>(),
            )
        })?;
        self.loader.tls.init_thread(thread::current().id())?;

        for executable in executables {
            self.process_attach(executable, 1)?;
        }
        Ok(())
    }

    /// Shut the process down: detach modules (all of them if `force`) and refuse further
    /// loads.
    pub fn on_process_detach(&self, force: bool) {
        let _span = debug_span!("process_detach", force).entered();
        self.with_state(|state| state.process_detaching = true);
        self.detach_sweep(force);
    }

    /// Set up the calling thread: allocate its TLS block and send thread attach
    /// notifications in initialization order.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] if the TLS block cannot be allocated.
    pub fn on_thread_attach(&self) -> Result<()> {
        self.loader.tls.init_thread(thread::current().id())?;
        for handle in self.thread_notified(false) {
            if let Err(e) = self.notify(handle, DllReason::ThreadAttach, 0) {
                warn!("thread attach notification of {} failed: {}", self.module_name(handle), e);
            }
        }
        Ok(())
    }

    /// Tear down the calling thread: send thread detach notifications in reverse
    /// initialization order and free its TLS block.
    pub fn on_thread_detach(&self) {
        for handle in self.thread_notified(true) {
            if let Err(e) = self.notify(handle, DllReason::ThreadDetach, 0) {
                warn!("thread detach notification of {} failed: {}", self.module_name(handle), e);
            }
        }
        self.loader.tls.free_thread(thread::current().id());
    }

    /// Attached modules that take thread notifications, in initialization order.
    fn thread_notified(&self, reverse: bool) -> Vec<ModuleHandle> {
        self.with_state(|state| {
            let mut handles: Vec<ModuleHandle> = state
                .table
                .init_order()
                .iter()
                .copied()
                .filter(|h| {
                    state.table.get(*h).is_some_and(|m| {
                        m.flags.contains(ModuleFlags::PROCESS_ATTACHED)
                            && !m.flags.contains(ModuleFlags::NO_DLL_CALLS)
                    })
                })
                .collect();
            if reverse {
                handles.reverse();
            }
            handles
        })
    }

    /// Load `name` as the primary executable and start the process.
    ///
    /// # Errors
    /// See [`LoaderSession::load_executable`] and [`LoaderSession::on_process_attach`].
    pub fn start_process(&self, name: &str) -> Result<ModuleHandle> {
        let executable = self.load_executable(name)?;
        self.on_process_attach()?;
        Ok(executable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::{builder::ImageBuilder, ImportThunk},
        loader::{load::LoadFlags, module::ModuleState},
        test::{loader_with_entries, store_with, EntryLog},
    };
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_init_failure_runs_detach_and_unloads() {
        let store = store_with(vec![
            ImageBuilder::dll("bad.dll")
                .base(0x1000_0000)
                .entry_point(0x1000)
                .import("good.dll", [ImportThunk::name("F")]),
            ImageBuilder::dll("good.dll")
                .base(0x2000_0000)
                .entry_point(0x1000)
                .export("F", 0x1100),
        ]);
        let log = EntryLog::new();
        log.fail_attach(0x1000_1000);
        let loader = loader_with_entries(store, &log, &[0x1000_1000, 0x2000_1000]);

        let err = loader.load_module("bad.dll", LoadFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::DllInitFailed(ref name) if name == "bad.dll"));
        assert_eq!(
            log.calls(),
            vec![
                ("good.dll".to_string(), DllReason::ProcessAttach),
                ("bad.dll".to_string(), DllReason::ProcessAttach),
                ("bad.dll".to_string(), DllReason::ProcessDetach),
                ("good.dll".to_string(), DllReason::ProcessDetach),
            ]
        );
        assert!(loader.get_module_handle("bad.dll").is_none());
        assert!(loader.get_module_handle("good.dll").is_none());

        assert!(logs_contain("Initialization of bad.dll failed"));
        assert!(logs_contain("attaching bad.dll failed"));
        assert!(!logs_contain("detach notification of"));
        assert!(!logs_contain("after failed attach failed"));
    }

    #[test]
    fn test_thread_notifications_skip_disabled_modules() {
        let store = store_with(vec![
            ImageBuilder::dll("chatty.dll").base(0x1000_0000).entry_point(0x1000),
            ImageBuilder::dll("quiet.dll").base(0x2000_0000).entry_point(0x1000),
        ]);
        let log = EntryLog::new();
        let loader = loader_with_entries(store, &log, &[0x1000_1000, 0x2000_1000]);
        let session = loader.session();

        let chatty = session.load_module("chatty.dll", LoadFlags::empty()).unwrap();
        let quiet = session.load_module("quiet.dll", LoadFlags::empty()).unwrap();
        session.disable_thread_calls(quiet).unwrap();
        log.clear();

        session.on_thread_attach().unwrap();
        session.on_thread_detach();
        assert_eq!(
            log.calls(),
            vec![
                ("chatty.dll".to_string(), DllReason::ThreadAttach),
                ("chatty.dll".to_string(), DllReason::ThreadDetach),
            ]
        );
        assert_eq!(session.module(chatty).unwrap().state, ModuleState::Attached);
    }

    #[test]
    fn test_add_ref_and_pin() {
        let store = store_with(vec![ImageBuilder::dll("kept.dll")]);
        let loader = loader_with_entries(store, &EntryLog::new(), &[]);
        let session = loader.session();

        let kept = session.load_module("kept.dll", LoadFlags::empty()).unwrap();
        session.add_ref(kept, false).unwrap();
        session.unload_module(kept).unwrap();
        assert_eq!(session.module(kept).unwrap().load_count, LoadCount::new(1));

        session.add_ref(kept, true).unwrap();
        session.unload_module(kept).unwrap();
        session.unload_module(kept).unwrap();
        assert!(session.module(kept).unwrap().load_count.is_pinned());
    }

    #[test]
    fn test_invalid_handle() {
        let store = store_with(vec![ImageBuilder::dll("gone.dll")]);
        let loader = loader_with_entries(store, &EntryLog::new(), &[]);
        let session = loader.session();

        let gone = session.load_module("gone.dll", LoadFlags::empty()).unwrap();
        session.unload_module(gone).unwrap();
        assert!(matches!(session.unload_module(gone), Err(Error::InvalidHandle)));
        assert!(matches!(session.add_ref(gone, false), Err(Error::InvalidHandle)));
        assert!(matches!(session.attach(gone), Err(Error::InvalidHandle)));
    }
}
