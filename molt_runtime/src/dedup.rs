//! Type-descriptor deduplication.
//!
//! Type assertion compares descriptor pointers, so a loaded unit defining
//! a type the host program already has must not keep its private copy
//! live: every relocation that targets such a descriptor is re-applied
//! against the host's equivalent. Runs only after the module is in the
//! registry, since equality resolution needs the module list.
//!
//! When the host descriptor lacks method implementations the loaded copy
//! has (the host binary pruned them), its method table is grafted to point
//! into the new module's text; every such write is recorded so unload can
//! revert it byte-for-byte.

use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use molt_link::{Linker, INVALID_OFFSET};
use molt_obj::{SymKind, TYPE_DOUBLE_DOT_PREFIX, TYPE_PREFIX};
use molt_target::{Arch, RelocCtx, RelocKind, Site};

use crate::registry::registry;
use crate::typedesc::{methods, methods_mut, read_name, types_equal, TypeDescriptor, UncommonMeta};
use crate::RuntimeError;

/// One reverted-on-unload method-table write.
#[derive(Debug, Clone, Copy)]
pub struct MethodPatch {
    /// Address of the patched i32 slot.
    pub slot: usize,
    pub old: i32,
}

/// The record of every method-table write made during dedup.
#[derive(Debug, Default)]
pub struct PatchLog {
    pub patches: Vec<MethodPatch>,
}

impl PatchLog {
    /// Undo every write, newest first.
    pub fn revert(&self) {
        for p in self.patches.iter().rev() {
            unsafe { (p.slot as *mut i32).write_unaligned(p.old) };
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Re-point relocations at host descriptors wherever an equivalent type
/// already exists. Candidates come from the first registered module; the
/// first structurally-equal candidate in (sorted) typelink order wins.
pub fn deduplicate_type_descriptors(
    linker: &Linker,
    arch: &dyn Arch,
    ctx: &mut RelocCtx<'_>,
    symbol_map: &HashMap<String, usize>,
) -> Result<PatchLog, RuntimeError> {
    let mut log = PatchLog::default();
    let Some(host) = registry().first() else {
        return Ok(log);
    };
    let (host_text, typehash) = unsafe {
        let hm = host.0.as_ref();
        let mut typehash: HashMap<u32, Vec<usize>> = HashMap::new();
        for off in &hm.typelinks {
            if let Some(&addr) = hm.typemap.get(off) {
                let t = addr as *const TypeDescriptor;
                typehash.entry((*t).hash).or_default().push(addr);
            }
        }
        (hm.text, typehash)
    };
    if typehash.is_empty() {
        return Ok(log);
    }

    let mut names: Vec<&String> = linker.symbols().keys().collect();
    names.sort();
    for name in names {
        let sym = &linker.symbols()[name];
        for r in &sym.relocs {
            let Some(target) = linker.sym(&r.target) else {
                continue;
            };
            if target.kind != SymKind::ReadOnly
                || target.offset == INVALID_OFFSET
                || !r.target.starts_with(TYPE_PREFIX)
                || r.target.starts_with(TYPE_DOUBLE_DOT_PREFIX)
            {
                continue;
            }
            let Some(&addr) = symbol_map.get(&r.target) else {
                continue;
            };
            let local = addr as *const TypeDescriptor;
            let mut chosen = local;
            unsafe {
                if let Some(candidates) = typehash.get(&(*local).hash) {
                    for &cand in candidates {
                        let mut seen = HashSet::new();
                        if types_equal(local, cand as *const TypeDescriptor, &mut seen) {
                            chosen = cand as *const TypeDescriptor;
                            break;
                        }
                    }
                }
            }
            if std::ptr::eq(chosen, local) {
                continue;
            }
            trace!(
                "dedup {}: {:p} -> {:p} (reloc in {})",
                r.target,
                local,
                chosen,
                name
            );
            unsafe {
                graft_missing_methods(chosen, local, host_text, ctx.code_base, &mut log)?;
            }
            let site = Site {
                in_code: sym.kind == SymKind::Text,
                target_in_code: false,
            };
            match r.kind {
                RelocKind::PcRel
                | RelocKind::AdrpAdd
                | RelocKind::Addr
                | RelocKind::WeakAddr
                | RelocKind::AddrOff
                | RelocKind::WeakAddrOff
                | RelocKind::MethodOff => {
                    arch.apply(ctx, r, site, chosen as usize)?;
                }
                k if k.is_inert() => {}
                other => panic!(
                    "unhandled relocation {:?} against {} during type deduplication",
                    other, r.target
                ),
            }
        }
    }
    if !log.is_empty() {
        debug!("dedup grafted {} method slots", log.patches.len());
    }
    Ok(log)
}

/// Fill -1 method offsets on the winning host descriptor with
/// implementations from the superseded local copy.
///
/// # Safety
/// Both descriptors must be valid; the host method table must be writable.
unsafe fn graft_missing_methods(
    host_t: *const TypeDescriptor,
    local_t: *const TypeDescriptor,
    host_text: usize,
    code_base: usize,
    log: &mut PatchLog,
) -> Result<(), RuntimeError> {
    let hu = (*host_t).uncommon;
    let lu = (*local_t).uncommon;
    if hu.is_null() || lu.is_null() {
        return Ok(());
    }
    let host_methods = methods_mut(hu as *mut UncommonMeta);
    let local_methods = methods(lu);
    for hm in host_methods {
        let hname = read_name(hm.name);
        let Some(lm) = local_methods.iter().find(|m| read_name(m.name) == hname) else {
            continue;
        };
        for (slot, local_off) in [(&mut hm.ifn, lm.ifn), (&mut hm.tfn, lm.tfn)] {
            if *slot != -1 || local_off == -1 {
                continue;
            }
            let target = code_base + local_off as usize;
            let rebased = target as i64 - host_text as i64;
            if rebased > i32::MAX as i64 || rebased < i32::MIN as i64 {
                return Err(RuntimeError::MethodPatchOverflow {
                    ty: read_name((*host_t).name).to_string(),
                    offset: rebased,
                });
            }
            log.patches.push(MethodPatch {
                slot: slot as *mut i32 as usize,
                old: *slot,
            });
            *slot = rebased as i32;
        }
    }
    Ok(())
}
