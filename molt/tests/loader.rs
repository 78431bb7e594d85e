//! End-to-end loader tests: build an object, load it, call into it.
#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use common::*;
use molt::{registry, Error, LinkerOptions, ModuleState};

// The registry is process-global; serialize the tests that measure it.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn add_loads_runs_and_unloads() {
    let _guard = serial();
    let before = registry().len();
    let host = HashMap::new();

    let (_linker, mut module) =
        load_bytes("add.o", &add_object(), &host, LinkerOptions::default()).unwrap();
    assert_eq!(registry().len(), before + 1);

    let addr = module.function_addresses()["demo.Add"];
    let (text, _) = module.code_range();
    assert_eq!(addr, text, "map address and resolved address agree");

    let add: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(addr) };
    assert_eq!(add(5, 6), 11);
    assert_eq!(add(-3, 4), 1);

    // The runtime can attribute a pc inside the function to its name.
    assert_eq!(
        registry().func_name_at(addr + 2).as_deref(),
        Some("demo.Add")
    );

    module.unload().unwrap();
    assert_eq!(module.state(), ModuleState::Freed);
    assert_eq!(registry().len(), before, "round-trip leaves the registry as found");
    assert!(registry().func_name_at(addr + 2).is_none());

    // A fresh load of the same source yields a working, independent module.
    let (_l2, mut again) =
        load_bytes("add.o", &add_object(), &host, LinkerOptions::default()).unwrap();
    let add2: extern "C" fn(i64, i64) -> i64 =
        unsafe { std::mem::transmute(again.function_addresses()["demo.Add"]) };
    assert_eq!(add2(20, 22), 42);
    again.unload().unwrap();
}

#[test]
fn reads_containers_from_disk() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("add.o");
    std::fs::write(&path, add_object()).unwrap();

    let mut linker = molt::Linker::new(LinkerOptions::default()).unwrap();
    linker.read_object_file(&path).unwrap();
    let roots = linker.object_symbol_names();
    linker.add_symbols(&roots).unwrap();

    let mut module = molt::load(&mut linker, &HashMap::new()).unwrap();
    let add: extern "C" fn(i64, i64) -> i64 =
        unsafe { std::mem::transmute(module.function_addresses()["demo.Add"]) };
    assert_eq!(add(7, 35), 42);
    module.unload().unwrap();
}

#[test]
fn double_unload_fails_cleanly() {
    let _guard = serial();
    let (_linker, mut module) = load_bytes(
        "add.o",
        &add_object(),
        &HashMap::new(),
        LinkerOptions::default(),
    )
    .unwrap();
    module.unload().unwrap();
    let err = module.unload().unwrap_err();
    assert!(matches!(err, Error::Unload(_)));
    assert_eq!(module.state(), ModuleState::Freed);
}

extern "C" fn host_forty_two() -> i64 {
    42
}

#[test]
fn far_host_call_goes_through_a_trampoline() {
    let _guard = serial();
    let mut host = HashMap::new();
    host.insert("rt.forty_two".to_string(), host_forty_two as usize);

    let (_linker, mut module) = load_bytes(
        "far.o",
        &call_host_object("CallOut", "rt.forty_two"),
        &host,
        LinkerOptions::default(),
    )
    .unwrap();

    let f: extern "C" fn() -> i64 =
        unsafe { std::mem::transmute(module.function_addresses()["demo.CallOut"]) };
    assert_eq!(f(), 42);

    let (text, etext) = module.code_range();
    if (host_forty_two as usize).abs_diff(text) > i32::MAX as usize {
        // The code region sits in the low 4 GiB while the test binary does
        // not: the rel32 call cannot reach it directly, so the engine must
        // have appended an indirect-jump trampoline past the 16 aligned
        // code bytes.
        assert!(etext - text > 16, "expected a trampoline at the code tail");
    }
    module.unload().unwrap();
}

#[test]
fn unresolved_host_symbol_rolls_back() {
    let _guard = serial();
    let before = registry().len();
    let err = load_bytes(
        "missing.o",
        &call_host_object("CallOut", "rt.not_there"),
        &HashMap::new(),
        LinkerOptions::default(),
    )
    .unwrap_err();
    match err {
        Error::UnresolvedSymbol {
            symbol,
            required_by,
        } => {
            assert_eq!(symbol, "rt.not_there");
            assert_eq!(required_by, vec!["demo.CallOut".to_string()]);
        }
        other => panic!("expected UnresolvedSymbol, got {other}"),
    }
    assert_eq!(registry().len(), before, "failed load holds nothing");
}

static WORKERS: AtomicUsize = AtomicUsize::new(0);
static STOP_WORKERS: AtomicBool = AtomicBool::new(false);

extern "C" fn host_spawn_worker() {
    WORKERS.fetch_add(1, Ordering::SeqCst);
    std::thread::spawn(|| {
        while !STOP_WORKERS.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        WORKERS.fetch_sub(1, Ordering::SeqCst);
    });
}

fn wait_for_workers(n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while WORKERS.load(Ordering::SeqCst) != n {
        assert!(Instant::now() < deadline, "worker count never reached {n}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn loaded_code_spawns_and_stops_workers() {
    let _guard = serial();
    STOP_WORKERS.store(false, Ordering::SeqCst);
    let n = WORKERS.load(Ordering::SeqCst);

    let mut host = HashMap::new();
    host.insert("rt.spawn_worker".to_string(), host_spawn_worker as usize);
    let (_linker, mut module) = load_bytes(
        "worker.o",
        &call_host_object("StartWorker", "rt.spawn_worker"),
        &host,
        LinkerOptions::default(),
    )
    .unwrap();

    let start: extern "C" fn() =
        unsafe { std::mem::transmute(module.function_addresses()["demo.StartWorker"]) };
    start();
    wait_for_workers(n + 1);

    STOP_WORKERS.store(true, Ordering::SeqCst);
    wait_for_workers(n);

    // The worker is confirmed stopped; unload must succeed.
    module.unload().unwrap();
}

static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn host_mark_init() {
    INIT_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn package_initializers_run_once_at_load() {
    let _guard = serial();
    let mut host = HashMap::new();
    host.insert("rt.mark_init".to_string(), host_mark_init as usize);

    let before = INIT_CALLS.load(Ordering::SeqCst);
    let (_linker, mut module) = load_bytes(
        "init.o",
        &call_host_object("init", "rt.mark_init"),
        &host,
        LinkerOptions::default(),
    )
    .unwrap();
    assert_eq!(INIT_CALLS.load(Ordering::SeqCst), before + 1);
    module.unload().unwrap();
}

#[derive(Clone, Default)]
struct SharedSink(std::sync::Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn relocation_debug_writer_traces_each_patch() {
    let _guard = serial();
    let sink = SharedSink::default();
    let mut host = HashMap::new();
    host.insert("rt.forty_two".to_string(), host_forty_two as usize);

    let (_linker, mut module) = load_bytes(
        "traced.o",
        &call_host_object("CallOut", "rt.forty_two"),
        &host,
        LinkerOptions {
            relocation_debug_writer: Some(Box::new(sink.clone())),
            ..LinkerOptions::default()
        },
    )
    .unwrap();

    let trace = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
    assert!(trace.contains("RELOCATING"), "trace lines were emitted");
    assert!(trace.contains("demo.CallOut"));
    assert!(trace.contains("rt.forty_two"));
    assert!(trace.contains("Call"));
    module.unload().unwrap();
}

#[test]
fn heap_strings_survive_code_unload() {
    let _guard = serial();
    let (_linker, mut module) = load_bytes(
        "strings.o",
        &string_object(),
        &HashMap::new(),
        LinkerOptions {
            heap_strings: true,
            ..LinkerOptions::default()
        },
    )
    .unwrap();

    let cell = module.function_addresses()["demo.msgref"];
    let p = unsafe { read_u64(cell) } as usize;
    let bytes = unsafe { std::slice::from_raw_parts(p as *const u8, 4) };
    assert_eq!(bytes, b"hiya");

    module.unload().unwrap();
    // The code is gone; the diverted string is not.
    let bytes = unsafe { std::slice::from_raw_parts(p as *const u8, 4) };
    assert_eq!(bytes, b"hiya");

    module.unload_strings().unwrap();
}

#[test]
fn string_container_is_released_separately() {
    let _guard = serial();
    let (_linker, mut module) = load_bytes(
        "strings.o",
        &string_object(),
        &HashMap::new(),
        LinkerOptions {
            string_container_size: 4096,
            ..LinkerOptions::default()
        },
    )
    .unwrap();

    let cell = module.function_addresses()["demo.msgref"];
    let p = unsafe { read_u64(cell) } as usize;
    assert_eq!(unsafe { std::slice::from_raw_parts(p as *const u8, 4) }, b"hiya");

    module.unload().unwrap();
    assert_eq!(unsafe { std::slice::from_raw_parts(p as *const u8, 4) }, b"hiya");

    module.unload_strings().unwrap();
    let err = module.unload_strings().unwrap_err();
    assert!(matches!(err, Error::Unload(_)), "arena cannot unmap twice");
}
