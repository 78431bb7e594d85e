//! Cross-module value conversion.
//!
//! A value produced by one loaded module keeps a pointer to that module's
//! type descriptor; unloading the module would leave the value dangling.
//! Conversion re-points the value at an equivalent descriptor in a
//! destination module (or the host program), failing loudly when none
//! exists. The walk over the descriptor graph is a visitor with a
//! seen-set, so cyclic types terminate.

use std::collections::HashSet;
use std::ptr::NonNull;

use crate::moduledata::ModuleData;
use crate::registry::registry;
use crate::typedesc::{kind, methods, read_name, struct_fields, types_equal, TypeDescriptor};
use crate::RuntimeError;

/// A runtime value: a data word and its type descriptor. The data is
/// owned elsewhere; conversion only rewrites the descriptor pointer.
#[derive(Debug, Clone, Copy)]
pub struct Value {
    pub ty: *const TypeDescriptor,
    pub data: NonNull<u8>,
}

/// Find the destination module's equivalent of `ty`.
///
/// Structural identity first, then the method set: every method the
/// source descriptor carries must exist on the candidate, otherwise calls
/// through the converted value would hit missing implementations.
pub fn find_equivalent(
    ty: *const TypeDescriptor,
    dst: &ModuleData,
) -> Result<*const TypeDescriptor, RuntimeError> {
    unsafe {
        let addr = ty as usize;
        if addr >= dst.types && addr < dst.etypes {
            return Ok(ty);
        }
        let hash = (*ty).hash;
        for off in &dst.typelinks {
            let Some(&cand_addr) = dst.typemap.get(off) else {
                continue;
            };
            let cand = cand_addr as *const TypeDescriptor;
            if (*cand).hash != hash {
                continue;
            }
            let mut seen = HashSet::new();
            if !types_equal(ty, cand, &mut seen) {
                continue;
            }
            if !method_superset(cand, ty) {
                continue;
            }
            return Ok(cand);
        }
        Err(RuntimeError::NoEquivalentType(
            read_name((*ty).name).to_string(),
        ))
    }
}

/// Convert `value` for use after its source module is gone.
pub fn convert_to_module(value: &Value, dst: &ModuleData) -> Result<Value, RuntimeError> {
    let ty = find_equivalent(value.ty, dst)?;
    let mut seen = HashSet::new();
    verify_resident(ty, dst, &mut seen)?;
    Ok(Value {
        ty,
        data: value.data,
    })
}

/// Every method on `needed` must appear by name on `cand`.
unsafe fn method_superset(cand: *const TypeDescriptor, needed: *const TypeDescriptor) -> bool {
    let nu = (*needed).uncommon;
    if nu.is_null() {
        return true;
    }
    let cu = (*cand).uncommon;
    if cu.is_null() {
        return false;
    }
    let cms = methods(cu);
    methods(nu).iter().all(|nm| {
        let name = read_name(nm.name);
        cms.iter().any(|cm| read_name(cm.name) == name)
    })
}

/// Walk the descriptor graph and require every reachable descriptor to
/// live inside the destination module or the host program.
fn verify_resident(
    ty: *const TypeDescriptor,
    dst: &ModuleData,
    seen: &mut HashSet<usize>,
) -> Result<(), RuntimeError> {
    if ty.is_null() || !seen.insert(ty as usize) {
        return Ok(());
    }
    let addr = ty as usize;
    let in_dst = addr >= dst.types && addr < dst.etypes;
    let in_host = registry()
        .first()
        .map(|h| {
            let hm = unsafe { h.0.as_ref() };
            addr >= hm.types && addr < hm.etypes
        })
        .unwrap_or(false);
    // Host-program descriptors registered statically (outside any data
    // range) count as resident too: the host module is permanent.
    let in_host_links = registry()
        .first()
        .map(|h| unsafe { h.0.as_ref() }.typemap.values().any(|&a| a == addr))
        .unwrap_or(false);
    if !in_dst && !in_host && !in_host_links {
        return Err(RuntimeError::ForeignType {
            ty: unsafe { read_name((*ty).name) }.to_string(),
            via: format!("{addr:#x}"),
        });
    }
    unsafe {
        let t = &*ty;
        match t.kind {
            kind::PTR | kind::SLICE => verify_resident(t.elem, dst, seen)?,
            kind::STRUCT => {
                if !t.extra.is_null() {
                    for f in struct_fields(t) {
                        verify_resident(f.ty, dst, seen)?;
                    }
                }
            }
            // Interface payloads carry method names only; no descriptor
            // edges to follow.
            _ => {}
        }
    }
    Ok(())
}
