//! Integration tests for the module loader.
//!
//! These tests drive complete processes through the public API: load chains with shared
//! dependencies, dependency cycles, reference counting, export forwarding and thread-local
//! storage, observing entry point calls through a recording [`EntryPoints`] implementation.

use std::{sync::Arc, thread};

use ldrkit::{prelude::*, Result};
use parking_lot::Mutex;

/// Records every entry point and TLS callback call.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, DllReason, u64)>>,
    refuse: Mutex<Vec<String>>,
}

impl Recorder {
    fn refuse_attach(&self, name: &str) {
        self.refuse.lock().push(name.to_string());
    }

    fn calls(&self) -> Vec<(String, DllReason)> {
        self.calls
            .lock()
            .iter()
            .map(|(name, reason, _)| (name.clone(), *reason))
            .collect()
    }

    fn addresses(&self) -> Vec<u64> {
        self.calls.lock().iter().map(|(_, _, address)| *address).collect()
    }

    fn position(&self, name: &str, reason: DllReason) -> Option<usize> {
        self.calls()
            .iter()
            .position(|(n, r)| n == name && *r == reason)
    }

    fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl EntryPoints for Recorder {
    fn call_entry(&self, _session: &LoaderSession<'_>, call: &EntryCall) -> bool {
        self.calls
            .lock()
            .push((call.name.clone(), call.reason, call.address));
        !(call.reason == DllReason::ProcessAttach && self.refuse.lock().contains(&call.name))
    }
}

fn dll(name: &str, base: u64) -> ImageBuilder {
    ImageBuilder::dll(name).base(base).entry_point(0x1000)
}

fn process(images: Vec<ImageBuilder>) -> Result<(Loader, Arc<Recorder>)> {
    let images = images
        .into_iter()
        .map(ImageBuilder::build)
        .collect::<Result<Vec<_>>>()?;
    process_images(images)
}

fn process_images(images: Vec<MappedImage>) -> Result<(Loader, Arc<Recorder>)> {
    let store = Arc::new(ImageStore::new());
    for image in images {
        store.add_builtin(image);
    }
    let recorder = Arc::new(Recorder::default());
    let loader = Loader::builder(LoaderConfig::builtin_first())
        .search(store.clone())
        .mapper(store)
        .entry_points(recorder.clone())
        .build();
    Ok((loader, recorder))
}

/// app.exe -> libA -> libC, app.exe -> libB -> libC
fn diamond() -> Vec<ImageBuilder> {
    vec![
        ImageBuilder::exe("app.exe")
            .import("libA.dll", [ImportThunk::name("A")])
            .import("libB.dll", [ImportThunk::name("B")]),
        dll("libA.dll", 0x1000_0000)
            .export("A", 0x1100)
            .import("libC.dll", [ImportThunk::name("C")]),
        dll("libB.dll", 0x2000_0000)
            .export("B", 0x1100)
            .import("libC.dll", [ImportThunk::name("C")]),
        dll("libC.dll", 0x3000_0000).export("C", 0x1100),
    ]
}

#[test]
fn test_shared_dependency_attach_order() -> Result<()> {
    let (loader, recorder) = process(diamond())?;
    let app = loader.start_process("app.exe")?;
    let session = loader.session();

    let names: Vec<String> = session
        .init_order()
        .into_iter()
        .map(|h| session.module(h).map(|m| m.name().to_string()).unwrap_or_default())
        .collect();
    assert_eq!(names, ["libC.dll", "libA.dll", "libB.dll", "app.exe"]);

    let lib_c = session.get_module_handle("libc.dll").unwrap();
    assert_eq!(session.module(lib_c).unwrap().load_count, LoadCount::new(2));
    assert!(session.module(app).unwrap().load_count.is_pinned());

    assert_eq!(
        recorder.calls(),
        vec![
            ("libC.dll".to_string(), DllReason::ProcessAttach),
            ("libA.dll".to_string(), DllReason::ProcessAttach),
            ("libB.dll".to_string(), DllReason::ProcessAttach),
        ]
    );

    let iat = session
        .with_image(app, |image| image.read_u64(image.imports[1].first_thunk))
        .unwrap()?;
    assert_eq!(iat, 0x2000_1100);
    Ok(())
}

#[test]
fn test_detach_runs_before_dependencies() -> Result<()> {
    let (loader, recorder) = process(diamond())?;
    loader.start_process("app.exe")?;
    recorder.clear();

    loader.on_process_detach(true);

    let detach_a = recorder.position("libA.dll", DllReason::ProcessDetach).unwrap();
    let detach_b = recorder.position("libB.dll", DllReason::ProcessDetach).unwrap();
    let detach_c = recorder.position("libC.dll", DllReason::ProcessDetach).unwrap();
    assert!(detach_a < detach_c);
    assert!(detach_b < detach_c);
    assert_eq!(recorder.calls().len(), 3);

    assert!(matches!(
        loader.load_module("libC.dll", LoadFlags::empty()),
        Err(Error::ProcessDetaching)
    ));
    Ok(())
}

#[test]
fn test_dependency_cycle_attaches_once() -> Result<()> {
    let (loader, recorder) = process(vec![
        dll("cyclex.dll", 0x1000_0000)
            .export("X", 0x1100)
            .import("cycley.dll", [ImportThunk::name("Y")]),
        dll("cycley.dll", 0x2000_0000)
            .export("Y", 0x1100)
            .import("cyclex.dll", [ImportThunk::name("X")]),
    ])?;

    let x = loader.load_module("cyclex.dll", LoadFlags::empty())?;
    let y = loader.get_module_handle("cycley.dll").unwrap();

    assert_eq!(
        recorder.calls(),
        vec![
            ("cycley.dll".to_string(), DllReason::ProcessAttach),
            ("cyclex.dll".to_string(), DllReason::ProcessAttach),
        ]
    );
    assert_eq!(loader.module(x).unwrap().state, ModuleState::Attached);
    assert_eq!(loader.module(y).unwrap().state, ModuleState::Attached);

    loader.attach(x)?;
    assert_eq!(recorder.calls().len(), 2);

    loader.unload_module(x)?;
    assert!(loader.get_module_handle("cyclex.dll").is_none());
    assert!(loader.get_module_handle("cycley.dll").is_none());
    Ok(())
}

#[test]
fn test_reference_counts_balance() -> Result<()> {
    let (loader, recorder) = process(vec![dll("counted.dll", 0x1000_0000)])?;

    for n in 1..=4u32 {
        let mut handle = None;
        for _ in 0..n {
            handle = Some(loader.load_module("counted.dll", LoadFlags::empty())?);
        }
        let handle = handle.unwrap();
        for _ in 0..n - 1 {
            loader.unload_module(handle)?;
        }
        assert_eq!(loader.module(handle).unwrap().load_count, LoadCount::new(1));

        loader.unload_module(handle)?;
        assert!(loader.module(handle).is_none());
        assert!(loader.get_module_handle("counted.dll").is_none());
    }

    let attaches = recorder
        .calls()
        .iter()
        .filter(|(_, reason)| *reason == DllReason::ProcessAttach)
        .count();
    assert_eq!(attaches, 4);
    Ok(())
}

#[test]
fn test_ordinal_lookup_never_overruns() -> Result<()> {
    let (loader, _) = process(vec![dll("ord.dll", 0x1000_0000)
        .ordinal_base(5)
        .export_ordinal(5, 0x1100)
        .export_ordinal(7, 0x1300)])?;
    let module = loader.load_module("ord.dll", LoadFlags::empty())?;
    let session = loader.session();

    assert_eq!(session.resolve_by_ordinal(module, 5), Some(0x1000_1100));
    assert_eq!(session.resolve_by_ordinal(module, 7), Some(0x1000_1300));
    for ordinal in [0, 4, 6, 8, 9, 0x7fff_ffff, u32::MAX] {
        assert_eq!(session.resolve_by_ordinal(module, ordinal), None);
    }
    assert!(matches!(
        session.get_procedure_address(module, Procedure::Ordinal(8)),
        Err(Error::ProcedureNotFound(_))
    ));
    Ok(())
}

#[test]
fn test_forwarded_export() -> Result<()> {
    let (loader, recorder) = process(vec![
        dll("front.dll", 0x1000_0000)
            .forward("F", "back.G")
            .forward("Lost", "absent.G"),
        dll("back.dll", 0x2000_0000).export("G", 0x1800),
    ])?;
    let front = loader.load_module("front.dll", LoadFlags::empty())?;
    let session = loader.session();

    assert_eq!(session.resolve_by_name(front, "F", None), Some(0x2000_1800));
    let back = session.get_module_handle("back.dll").unwrap();
    assert_eq!(session.module(back).unwrap().state, ModuleState::Attached);
    assert!(recorder.position("back.dll", DllReason::ProcessAttach).is_some());

    assert_eq!(session.resolve_by_name(front, "Lost", None), None);
    assert!(session.get_module_handle("absent.dll").is_none());
    Ok(())
}

#[test]
fn test_forward_through_imports_records_dependency() -> Result<()> {
    let (loader, _) = process(vec![
        dll("user.dll", 0x1000_0000).import("front.dll", [ImportThunk::name("F")]),
        dll("front.dll", 0x2000_0000).forward("F", "back.G"),
        dll("back.dll", 0x3000_0000).export("G", 0x1800),
    ])?;
    let user = loader.load_module("user.dll", LoadFlags::empty())?;
    let session = loader.session();

    let back = session.get_module_handle("back.dll").unwrap();
    let info = session.module(user).unwrap();
    assert_eq!(info.import_slots[0][0], ImportSlot::Resolved(0x3000_1800));
    assert_eq!(info.forward_dependencies, vec![back]);

    let names: Vec<String> = session
        .init_order()
        .into_iter()
        .filter_map(|h| session.module(h).map(|m| m.name().to_string()))
        .collect();
    assert_eq!(names, ["front.dll", "back.dll", "user.dll"]);
    Ok(())
}

#[test]
fn test_refused_attach_unloads_module() -> Result<()> {
    let (loader, recorder) = process(vec![dll("grumpy.dll", 0x1000_0000)])?;
    recorder.refuse_attach("grumpy.dll");

    let err = loader.load_module("grumpy.dll", LoadFlags::empty()).unwrap_err();
    assert!(matches!(err, Error::DllInitFailed(_)));
    assert_eq!(
        err.exception_record().map(|r| r.code),
        Some(status::STATUS_DLL_INIT_FAILED)
    );
    assert!(loader.get_module_handle("grumpy.dll").is_none());
    Ok(())
}

#[test]
fn test_process_tls() -> Result<()> {
    let (loader, recorder) = process(vec![
        ImageBuilder::exe("tls.exe")
            .tls(&[0xaa, 0xbb], 2, &[0x1200])
            .import("tlsdep.dll", [ImportThunk::name("D")]),
        dll("tlsdep.dll", 0x1000_0000)
            .export("D", 0x1100)
            .tls(&[0x11], 3, &[]),
    ])?;
    let app = loader.start_process("tls.exe")?;
    let me = thread::current().id();

    let tls = loader.tls();
    assert_eq!(tls.module_count(), 2);
    assert_eq!(loader.module(app).unwrap().tls_index, Some(0));
    assert_eq!(tls.block(me, 0), Some(vec![0xaa, 0xbb, 0, 0]));
    assert_eq!(tls.block(me, 1), Some(vec![0x11, 0, 0, 0]));

    assert!(recorder.addresses().contains(&0x40_1200));

    let other = thread::spawn({
        let loader = Arc::new(loader);
        move || -> Result<bool> {
            loader.on_thread_attach()?;
            let id = thread::current().id();
            let has_block = loader.tls().block(id, 1) == Some(vec![0x11, 0, 0, 0]);
            loader.on_thread_detach();
            Ok(has_block && !loader.tls().has_thread(id))
        }
    })
    .join()
    .unwrap()?;
    assert!(other);
    Ok(())
}

#[test]
fn test_missing_import_fails_process() -> Result<()> {
    let (loader, _) = process(vec![
        ImageBuilder::exe("broken.exe").import("nowhere.dll", [ImportThunk::name("F")])
    ])?;

    match loader.start_process("broken.exe") {
        Err(Error::DependencyNotFound { name, needed_by }) => {
            assert_eq!(name, "nowhere.dll");
            assert_eq!(needed_by, "broken.exe");
        }
        other => panic!("expected missing dependency, got {:?}", other),
    }
    assert!(loader.get_module_handle("broken.exe").is_none());
    Ok(())
}

#[test]
fn test_failed_bind_releases_loaded_dependencies() -> Result<()> {
    let mut user = dll("user.dll", 0x1000_0000)
        .import("shared.dll", [ImportThunk::name("S")])
        .import("fresh.dll", [ImportThunk::name("F")])
        .build()?;
    // Import address table of the second descriptor lies past the end of the image
    user.imports[1].first_thunk = user.size + 0x1000;

    let (loader, recorder) = process_images(vec![
        user,
        dll("shared.dll", 0x2000_0000).export("S", 0x1100).build()?,
        dll("fresh.dll", 0x3000_0000)
            .export("F", 0x1100)
            .import("deep.dll", [ImportThunk::name("D")])
            .build()?,
        dll("deep.dll", 0x4000_0000).export("D", 0x1100).build()?,
    ])?;
    let shared = loader.load_module("shared.dll", LoadFlags::empty())?;
    recorder.clear();

    let err = loader.load_module("user.dll", LoadFlags::empty()).unwrap_err();
    assert!(matches!(err, Error::OutOfBounds));

    assert_eq!(loader.module(shared).unwrap().load_count, LoadCount::new(1));
    assert!(loader.get_module_handle("user.dll").is_none());
    assert!(loader.get_module_handle("fresh.dll").is_none());
    assert!(loader.get_module_handle("deep.dll").is_none());
    assert!(recorder.calls().is_empty());

    loader.unload_module(shared)?;
    assert!(loader.get_module_handle("shared.dll").is_none());
    Ok(())
}

/// A loader over image files at the given paths, plus built-in modules.
fn file_loader(
    files: Vec<(&str, ImageBuilder)>,
    builtins: Vec<ImageBuilder>,
    config: LoaderConfig,
) -> Result<Loader> {
    let store = Arc::new(ImageStore::new());
    for (path, image) in files {
        store.add_file(path, image.build()?);
    }
    for image in builtins {
        store.add_builtin(image.build()?);
    }
    Ok(Loader::builder(config)
        .search(store.clone())
        .mapper(store)
        .build())
}

#[test]
fn test_altered_search_path_prefers_module_directory() -> Result<()> {
    let loader = file_loader(
        vec![
            (
                "C:\\plugins\\plugin.dll",
                dll("plugin.dll", 0x1000_0000).import("helper.dll", [ImportThunk::name("H")]),
            ),
            (
                "C:\\plugins\\helper.dll",
                dll("helper.dll", 0x2000_0000).export("H", 0x1100),
            ),
            (
                "C:\\app\\helper.dll",
                dll("helper.dll", 0x3000_0000).export("H", 0x1100),
            ),
        ],
        vec![],
        LoaderConfig::native_first().with_search_path("C:\\app"),
    )?;

    let plugin = loader.load_module(
        "C:\\plugins\\plugin.dll",
        LoadFlags::LOAD_WITH_ALTERED_SEARCH_PATH,
    )?;
    let helper = loader.get_module_handle("helper.dll").unwrap();
    let info = loader.module(helper).unwrap();
    assert_eq!(info.names.full_path, "C:\\plugins\\helper.dll");
    assert_eq!(info.base, 0x2000_0000);
    assert_eq!(loader.module(plugin).unwrap().import_slots[0][0], ImportSlot::Resolved(0x2000_1100));

    // The altered directory only applies while the flagged load runs
    loader.unload_module(plugin)?;
    assert!(loader.get_module_handle("helper.dll").is_none());
    let plugin = loader.load_module("C:\\plugins\\plugin.dll", LoadFlags::empty())?;
    let helper = loader.get_module_handle("helper.dll").unwrap();
    assert_eq!(loader.module(helper).unwrap().names.full_path, "C:\\app\\helper.dll");
    assert_eq!(loader.module(plugin).unwrap().import_slots[0][0], ImportSlot::Resolved(0x3000_1100));
    Ok(())
}

#[test]
fn test_bare_name_finds_module_loaded_by_path() -> Result<()> {
    let loader = file_loader(
        vec![("C:\\plugins\\helper.dll", dll("helper.dll", 0x2000_0000))],
        vec![dll("helper.dll", 0x5000_0000)],
        LoaderConfig::native_first(),
    )?;

    let by_path = loader.load_module("C:\\plugins\\helper.dll", LoadFlags::empty())?;
    // Not on the search path: the request falls back to the built-in path, which is not
    // loaded, and then matches the loaded module by its bare name
    let by_name = loader.load_module("helper.dll", LoadFlags::empty())?;

    assert_eq!(by_name, by_path);
    let info = loader.module(by_path).unwrap();
    assert_eq!(info.base, 0x2000_0000);
    assert_eq!(info.mechanism, LoadMechanism::Native);
    assert_eq!(info.load_count, LoadCount::new(2));
    assert_eq!(loader.session().load_order().len(), 1);
    Ok(())
}
