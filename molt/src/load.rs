//! The load driver: address assignment, relocation, module registration.

use std::collections::HashMap;
use std::io::Write;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use molt_link::{Linker, StringArena, INVALID_OFFSET};
use molt_obj::{SymKind, ITAB_PREFIX, MAIN_PKG_PREFIX, STR_PREFIX, TLS_NAME, TYPE_PREFIX};
use molt_runtime::moduledata::SegmentLayout;
use molt_runtime::{
    build_module, deduplicate_type_descriptors, registry, runtime_version, PatchLog,
};
use molt_target::{Arch, Machine, RelocCtx, RelocKind, Site};

use crate::codemodule::{CodeModule, ModuleState};
use crate::segment::Segment;
use crate::{arch_for_machine, Error};

/// Key prefix marking "the host program also defines this symbol"; the
/// relocation pass prefers the running copy so both sides share state.
pub(crate) const FIRST_MODULE_PREFIX: &str = "firstmodule.";

static MODULE_SEQ: AtomicU64 = AtomicU64::new(1);

pub(crate) struct LoadedParts {
    pub mod_syms: HashMap<String, usize>,
    pub module: Box<molt_runtime::ModuleData>,
    pub patches: PatchLog,
    pub itabs: Vec<usize>,
    pub heap_strings: HashMap<String, Box<[u8]>>,
    pub string_arena: Option<StringArena>,
}

/// Load a fully linked unit against the host's running-symbol table.
///
/// On any failure both memory regions are released before the error is
/// returned; a failed load holds no resources.
pub fn load(linker: &mut Linker, host_symbols: &HashMap<String, usize>) -> Result<CodeModule, Error> {
    let machine = linker.machine().ok_or(Error::NoObjects)?;
    let arch = arch_for_machine(machine);
    let mut seg = Segment::allocate(linker)?;
    match link_into(linker, host_symbols, arch, machine, &mut seg) {
        Ok(parts) => Ok(CodeModule::new(seg, parts, ModuleState::Loaded)),
        Err(e) => {
            let e = match seg.release() {
                Ok(()) => e,
                Err(un) => Error::Unload(format!("failed to unmap ({un}) after load error: {e}")),
            };
            Err(e)
        }
    }
}

fn link_into(
    linker: &mut Linker,
    host: &HashMap<String, usize>,
    arch: &'static dyn Arch,
    machine: Machine,
    seg: &mut Segment,
) -> Result<LoadedParts, Error> {
    let tls_offset = runtime_version().tls_offset(machine);

    // Heap-diverted strings are cloned per load so the linker stays
    // reusable; the clone's allocations are the symbol addresses.
    let heap_strings: HashMap<String, Box<[u8]>> = linker
        .heap_strings()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let (mut symbol_map, mod_syms) =
        build_symbol_map(linker, host, seg, &heap_strings)?;

    let mut applied = HashMap::new();
    let mut itabs = Vec::new();
    relocate(
        linker,
        arch,
        seg,
        &mut symbol_map,
        tls_offset,
        &mut applied,
        &mut itabs,
    )?;

    let layout = SegmentLayout {
        code_base: seg.code_base(),
        code_off: seg.code_off,
        data_base: seg.data_base(),
        data_len: seg.data_len,
        noptrdata_len: seg.noptrdata_len,
        bss_len: seg.bss_len,
        noptrbss_len: seg.noptrbss_len,
    };
    let name = format!("molt.{}", MODULE_SEQ.fetch_add(1, Ordering::Relaxed));
    let mut module = build_module(&name, linker, &layout, &symbol_map, itabs.clone())?;
    let md_ptr = NonNull::from(&mut *module);

    // Registration must precede deduplication: type identity resolves
    // through the module list.
    registry().register(md_ptr);
    if let Err(e) = runtime_version().verify_module(&module) {
        registry().deregister(md_ptr);
        return Err(e.into());
    }
    registry().add_itabs(&itabs);

    let patches = match dedup(linker, arch, seg, &symbol_map, tls_offset, &mut applied) {
        Ok(p) => p,
        Err(e) => {
            registry().remove_itabs(&itabs);
            registry().deregister(md_ptr);
            return Err(e);
        }
    };

    // The module is live; run its initializers.
    for init in linker.init_funcs() {
        if let Some(&addr) = symbol_map.get(init) {
            debug!("running initializer {init} at {addr:#x}");
            let f: extern "C" fn() = unsafe { std::mem::transmute(addr) };
            f();
        }
    }

    let (_, string_arena) = linker.take_strings();
    debug!(
        "loaded {name}: {} functions, code {:#x}..{:#x}",
        mod_syms.len(),
        seg.code_base(),
        seg.code_base() + seg.code_off
    );
    Ok(LoadedParts {
        mod_syms,
        module,
        patches,
        itabs,
        heap_strings,
        string_arena,
    })
}

/// Assign every symbol its final runtime address.
fn build_symbol_map(
    linker: &Linker,
    host: &HashMap<String, usize>,
    seg: &Segment,
    heap_strings: &HashMap<String, Box<[u8]>>,
) -> Result<(HashMap<String, usize>, HashMap<String, usize>), Error> {
    let code_base = seg.code_base();
    let data_base = seg.data_base();
    let heap_mode = linker.options.heap_strings;
    let arena_mode = linker.options.string_container_size > 0;
    let arena_base = linker.string_arena().map(|a| a.base());

    let mut symbol_map = HashMap::new();
    let mut mod_syms = HashMap::new();
    let mut names: Vec<&String> = linker.symbols().keys().collect();
    names.sort();

    for name in names {
        let sym = &linker.symbols()[name];
        if sym.offset == INVALID_OFFSET {
            if name.as_str() == TLS_NAME {
                continue;
            }
            if let Some(&addr) = host.get(name.as_str()) {
                symbol_map.insert(name.clone(), addr);
            } else if name.starts_with(ITAB_PREFIX) {
                // Host-resident itabs are optional; locally defined ones
                // materialize during relocation.
                continue;
            } else {
                return Err(Error::UnresolvedSymbol {
                    symbol: name.clone(),
                    required_by: linker.required_by(name),
                });
            }
        } else if sym.kind == SymKind::Text {
            let addr = code_base + sym.offset as usize;
            symbol_map.insert(name.clone(), addr);
            mod_syms.insert(name.clone(), addr);
        } else if heap_mode && name.starts_with(STR_PREFIX) {
            let bytes = heap_strings.get(name.as_str()).ok_or_else(|| {
                Error::UnresolvedSymbol {
                    symbol: name.clone(),
                    required_by: Vec::new(),
                }
            })?;
            symbol_map.insert(name.clone(), bytes.as_ptr() as usize);
        } else if arena_mode && name.starts_with(STR_PREFIX) {
            let base = arena_base.expect("arena configured");
            symbol_map.insert(name.clone(), base + sym.offset as usize);
        } else if !host.contains_key(name.as_str()) {
            symbol_map.insert(name.clone(), data_base + sym.offset as usize);
        } else if name.starts_with(MAIN_PKG_PREFIX) || name.starts_with(TYPE_PREFIX) {
            // Keep the fresh copy addressable, but remember the host's so
            // relocation prefers the running one; dedup still needs ours.
            symbol_map.insert(name.clone(), data_base + sym.offset as usize);
            symbol_map.insert(
                format!("{FIRST_MODULE_PREFIX}{name}"),
                host[name.as_str()],
            );
        } else {
            symbol_map.insert(name.clone(), host[name.as_str()]);
        }
    }
    Ok((symbol_map, mod_syms))
}

/// Rewrite every reference; itab symbols resolved locally are recorded
/// for registration.
fn relocate(
    linker: &mut Linker,
    arch: &'static dyn Arch,
    seg: &mut Segment,
    symbol_map: &mut HashMap<String, usize>,
    tls_offset: i64,
    applied: &mut HashMap<usize, [u8; 8]>,
    itabs: &mut Vec<usize>,
) -> Result<(), Error> {
    let mut writer = linker.options.relocation_debug_writer.take();
    let code_base = seg.code_base();
    let data_base = seg.data_base();
    let mut code_off = seg.code_off;

    let result = (|| -> Result<(), Error> {
        let (code, data) = seg.regions_mut();
        let mut ctx = RelocCtx {
            code,
            data,
            code_base,
            data_base,
            code_off,
            tls_offset,
            applied,
        };
        let mut names: Vec<&String> = linker.symbols().keys().collect();
        names.sort();
        for name in &names {
            let sym = &linker.symbols()[*name];
            let in_code = sym.kind == SymKind::Text;
            for r in &sym.relocs {
                let target_sym = linker.sym(&r.target);
                let site = Site {
                    in_code,
                    target_in_code: target_sym.map(|t| t.kind == SymKind::Text).unwrap_or(false),
                };
                if r.kind == RelocKind::TlsLe {
                    arch.apply(&mut ctx, r, site, 0)?;
                    continue;
                }
                let mut addr = symbol_map.get(&r.target).copied();
                if let Some(&running) =
                    symbol_map.get(&format!("{FIRST_MODULE_PREFIX}{}", r.target))
                {
                    addr = Some(running);
                }
                if addr.is_none() && r.target.starts_with(ITAB_PREFIX) {
                    if let Some(ts) = target_sym {
                        if ts.offset != INVALID_OFFSET {
                            let a = data_base + ts.offset as usize;
                            symbol_map.insert(r.target.clone(), a);
                            itabs.push(a);
                            addr = Some(a);
                        }
                    }
                }
                let Some(addr) = addr else {
                    // Weak or liveness-only reference with no resolution.
                    continue;
                };
                if let Some(w) = writer.as_mut() {
                    let _ = writeln!(
                        w,
                        "RELOCATING {:>8?} {:>8?} {:>14?} base {:#x} pos {:#010x} addr {:#018x} {} -> {}",
                        sym.kind,
                        target_sym.map(|t| t.kind).unwrap_or(SymKind::Unknown),
                        r.kind,
                        if in_code { code_base } else { data_base },
                        r.offset,
                        addr,
                        name,
                        r.target
                    );
                }
                arch.apply(&mut ctx, r, site, addr)?;
            }
        }
        code_off = ctx.code_off;
        Ok(())
    })();

    linker.options.relocation_debug_writer = writer;
    seg.code_off = code_off;
    result
}

fn dedup(
    linker: &Linker,
    arch: &'static dyn Arch,
    seg: &mut Segment,
    symbol_map: &HashMap<String, usize>,
    tls_offset: i64,
    applied: &mut HashMap<usize, [u8; 8]>,
) -> Result<PatchLog, Error> {
    let code_base = seg.code_base();
    let data_base = seg.data_base();
    let code_off = seg.code_off;
    let (code, data) = seg.regions_mut();
    let mut ctx = RelocCtx {
        code,
        data,
        code_base,
        data_base,
        code_off,
        tls_offset,
        applied,
    };
    let log = deduplicate_type_descriptors(linker, arch, &mut ctx, symbol_map)?;
    let final_off = ctx.code_off;
    seg.code_off = final_off;
    Ok(log)
}
