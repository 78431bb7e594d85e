//! Type descriptors and identity.
//!
//! Descriptors are data-resident structures emitted by the toolchain into
//! read-only data; the runtime compares types by descriptor pointer
//! equality, which is why loading the "same" type twice requires
//! deduplication (see [`crate::dedup`]). Structural equality is the
//! fallback used to find an equivalent descriptor: it walks the tagged
//! kind variants recursively, with a seen-set of pointer pairs so cyclic
//! types (self-referential structs) terminate.

use std::collections::HashSet;

/// Kind tags. A subset of the language's kinds sufficient for identity.
pub mod kind {
    pub const BOOL: u8 = 1;
    pub const INT: u8 = 2;
    pub const INT64: u8 = 3;
    pub const UINT64: u8 = 4;
    pub const FLOAT64: u8 = 5;
    pub const STRING: u8 = 6;
    pub const PTR: u8 = 7;
    pub const SLICE: u8 = 8;
    pub const STRUCT: u8 = 9;
    pub const INTERFACE: u8 = 10;
    pub const FUNC: u8 = 11;
}

/// The descriptor layout the toolchain emits (64-bit targets).
#[repr(C)]
#[derive(Debug)]
pub struct TypeDescriptor {
    pub size: usize,
    /// Prefix of the value holding pointers, for the collector.
    pub ptr_bytes: usize,
    pub hash: u32,
    pub tflag: u8,
    pub align: u8,
    pub kind: u8,
    pub _pad: u8,
    /// Name blob: `{tag, len_be_u16, bytes, 0}`.
    pub name: *const u8,
    /// Element type for PTR and SLICE; null otherwise.
    pub elem: *const TypeDescriptor,
    /// Kind-specific payload (struct fields, interface methods, func
    /// signature); null when the kind has none.
    pub extra: *const u8,
    /// Method set; null for plain types.
    pub uncommon: *const UncommonMeta,
}

/// Method-set header; `mcount` [`MethodMeta`] records follow inline.
#[repr(C)]
#[derive(Debug)]
pub struct UncommonMeta {
    pub mcount: u16,
    pub _pad: [u16; 3],
}

/// One method: name blob plus interface-call and direct-call text offsets
/// relative to the owning module's text base; -1 when not compiled in.
#[repr(C)]
#[derive(Debug)]
pub struct MethodMeta {
    pub name: *const u8,
    pub ifn: i32,
    pub tfn: i32,
}

/// Struct payload header; `fcount` [`FieldMeta`] records follow inline.
#[repr(C)]
pub struct StructMeta {
    pub fcount: usize,
}

#[repr(C)]
pub struct FieldMeta {
    pub name: *const u8,
    pub ty: *const TypeDescriptor,
    pub offset: usize,
}

/// Interface payload header; `mcount` [`IMethod`] records follow inline.
#[repr(C)]
pub struct InterfaceMeta {
    pub mcount: usize,
}

#[repr(C)]
pub struct IMethod {
    pub name: *const u8,
}

/// Func payload header; `in_count + out_count` parameter descriptor
/// pointers follow inline.
#[repr(C)]
pub struct FuncSigMeta {
    pub in_count: u16,
    pub out_count: u16,
    pub _pad: u32,
}

/// An interface table: one concrete type seen through one interface.
/// Method fun-words follow inline.
#[repr(C)]
pub struct RawItab {
    pub inter: *const TypeDescriptor,
    pub ty: *const TypeDescriptor,
    pub hash: u32,
    pub _pad: u32,
}

/// Decode a name blob. Returns "" for null.
///
/// # Safety
/// `p` must be null or point at a well-formed `{tag, len_be_u16, bytes}`
/// blob that outlives the returned reference.
pub unsafe fn read_name<'a>(p: *const u8) -> &'a str {
    if p.is_null() {
        return "";
    }
    let len = u16::from_be_bytes([*p.add(1), *p.add(2)]) as usize;
    let bytes = std::slice::from_raw_parts(p.add(3), len);
    std::str::from_utf8(bytes).unwrap_or("")
}

/// Encode a name blob (`{0, len_be_u16, bytes, 0}`).
pub fn encode_name(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 4);
    out.push(0);
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    out
}

/// # Safety
/// `u` must point at a descriptor-owned method set.
pub unsafe fn methods<'a>(u: *const UncommonMeta) -> &'a [MethodMeta] {
    let count = (*u).mcount as usize;
    let base = (u as *const u8).add(std::mem::size_of::<UncommonMeta>()) as *const MethodMeta;
    std::slice::from_raw_parts(base, count)
}

/// # Safety
/// As [`methods`]; the method set must be writable (dedup patches it).
pub unsafe fn methods_mut<'a>(u: *mut UncommonMeta) -> &'a mut [MethodMeta] {
    let count = (*u).mcount as usize;
    let base = (u as *mut u8).add(std::mem::size_of::<UncommonMeta>()) as *mut MethodMeta;
    std::slice::from_raw_parts_mut(base, count)
}

/// # Safety
/// `t` must be a STRUCT descriptor with a valid payload.
pub unsafe fn struct_fields<'a>(t: &TypeDescriptor) -> &'a [FieldMeta] {
    let meta = t.extra as *const StructMeta;
    let base = (t.extra).add(std::mem::size_of::<StructMeta>()) as *const FieldMeta;
    std::slice::from_raw_parts(base, (*meta).fcount)
}

/// # Safety
/// `t` must be an INTERFACE descriptor with a valid payload.
pub unsafe fn interface_methods<'a>(t: &TypeDescriptor) -> &'a [IMethod] {
    let meta = t.extra as *const InterfaceMeta;
    let base = (t.extra).add(std::mem::size_of::<InterfaceMeta>()) as *const IMethod;
    std::slice::from_raw_parts(base, (*meta).mcount)
}

/// # Safety
/// `t` must be a FUNC descriptor with a valid payload.
pub unsafe fn func_params<'a>(t: &TypeDescriptor) -> (u16, u16, &'a [*const TypeDescriptor]) {
    let meta = t.extra as *const FuncSigMeta;
    let base = (t.extra).add(std::mem::size_of::<FuncSigMeta>()) as *const *const TypeDescriptor;
    let total = ((*meta).in_count + (*meta).out_count) as usize;
    ((*meta).in_count, (*meta).out_count, std::slice::from_raw_parts(base, total))
}

/// Structural equality of two descriptors under the runtime's identity
/// rules (method sets excluded). Cycle-safe: a pointer pair already under
/// comparison is assumed equal.
///
/// # Safety
/// Both pointers must be valid descriptors with well-formed payloads.
pub unsafe fn types_equal(
    a: *const TypeDescriptor,
    b: *const TypeDescriptor,
    seen: &mut HashSet<(usize, usize)>,
) -> bool {
    if a == b {
        return true;
    }
    if a.is_null() || b.is_null() {
        return false;
    }
    if !seen.insert((a as usize, b as usize)) {
        return true;
    }
    let ta = &*a;
    let tb = &*b;
    if ta.kind != tb.kind || ta.size != tb.size || ta.ptr_bytes != tb.ptr_bytes {
        return false;
    }
    if read_name(ta.name) != read_name(tb.name) {
        return false;
    }
    match ta.kind {
        kind::PTR | kind::SLICE => types_equal(ta.elem, tb.elem, seen),
        kind::STRUCT => {
            if ta.extra.is_null() || tb.extra.is_null() {
                return ta.extra == tb.extra;
            }
            let fa = struct_fields(ta);
            let fb = struct_fields(tb);
            if fa.len() != fb.len() {
                return false;
            }
            fa.iter().zip(fb).all(|(x, y)| {
                x.offset == y.offset
                    && read_name(x.name) == read_name(y.name)
                    && types_equal(x.ty, y.ty, seen)
            })
        }
        kind::INTERFACE => {
            if ta.extra.is_null() || tb.extra.is_null() {
                return ta.extra == tb.extra;
            }
            let ma = interface_methods(ta);
            let mb = interface_methods(tb);
            ma.len() == mb.len()
                && ma
                    .iter()
                    .zip(mb)
                    .all(|(x, y)| read_name(x.name) == read_name(y.name))
        }
        kind::FUNC => {
            if ta.extra.is_null() || tb.extra.is_null() {
                return ta.extra == tb.extra;
            }
            let (ia, oa, pa) = func_params(ta);
            let (ib, ob, pb) = func_params(tb);
            ia == ib && oa == ob && pa.iter().zip(pb).all(|(&x, &y)| types_equal(x, y, seen))
        }
        _ => true,
    }
}
