//! Module descriptors and their function lookup tables.

use std::collections::HashMap;

use log::debug;

use molt_link::Linker;
use molt_obj::{TYPE_DOUBLE_DOT_PREFIX, TYPE_PREFIX};

use crate::RuntimeError;

/// Minimum function size the bucketing assumes.
pub const MIN_FUNC: usize = 16;
/// Text bytes covered by one bucket of the pc lookup index.
pub const PC_BUCKET_SIZE: usize = 256 * MIN_FUNC;
/// Sub-buckets per bucket (256 bytes each).
pub const NSUB: usize = 16;

/// One function-table entry: entry pc and index into the function list.
/// The table is sorted by entry and terminated by a sentinel at `etext`.
#[derive(Debug, Clone, Copy)]
pub struct FuncTab {
    pub entry: usize,
    pub idx: u32,
}

/// One bucket of the pc-to-function index: the function index reaching the
/// bucket start, plus per-256-byte deltas.
#[derive(Debug, Clone)]
pub struct FindFuncBucket {
    pub idx: u32,
    pub subbuckets: [u8; NSUB],
}

/// Synthesized per-function record.
#[derive(Debug, Clone)]
pub struct RawFunc {
    pub entry: usize,
    pub name_off: u32,
    pub pcsp: u32,
    pub pcfile: u32,
    pub pcln: u32,
    pub cu_offset: u32,
    pub pcdata: Vec<u32>,
    /// Absolute addresses of auxiliary data (stack-object maps); 0 when
    /// the reference was accepted-empty.
    pub funcdata: Vec<usize>,
    /// Offset of the inlining tree in the pc table, or -1.
    pub inl_off: i32,
}

/// The module descriptor: everything the runtime's introspection needs to
/// recognize one loaded unit. Exactly one per unit, alive while the unit
/// is registered.
pub struct ModuleData {
    pub name: String,

    pub text: usize,
    pub etext: usize,
    pub data: usize,
    pub edata: usize,
    pub noptrdata: usize,
    pub enoptrdata: usize,
    pub bss: usize,
    pub ebss: usize,
    pub noptrbss: usize,
    pub enoptrbss: usize,
    /// Type descriptors are data-resident: the whole data region.
    pub types: usize,
    pub etypes: usize,

    pub funcnametab: Vec<u8>,
    pub pctab: Vec<u8>,
    pub filetab: Vec<u8>,
    pub cutab: Vec<u32>,

    pub funcs: Vec<RawFunc>,
    pub ftab: Vec<FuncTab>,
    pub findfunctab: Vec<FindFuncBucket>,

    /// Offsets of type descriptors from `types`, sorted.
    pub typelinks: Vec<i32>,
    /// Offset to descriptor address; dedup may re-point entries at host
    /// descriptors.
    pub typemap: HashMap<i32, usize>,
    /// Addresses of interface tables owned by this module.
    pub itablinks: Vec<usize>,
}

impl ModuleData {
    /// An empty descriptor with zeroed ranges; hosts fill in what they
    /// expose before registering.
    pub fn new(name: &str) -> ModuleData {
        ModuleData {
            name: name.to_string(),
            text: 0,
            etext: 0,
            data: 0,
            edata: 0,
            noptrdata: 0,
            enoptrdata: 0,
            bss: 0,
            ebss: 0,
            noptrbss: 0,
            enoptrbss: 0,
            types: 0,
            etypes: 0,
            funcnametab: Vec::new(),
            pctab: Vec::new(),
            filetab: Vec::new(),
            cutab: Vec::new(),
            funcs: Vec::new(),
            ftab: Vec::new(),
            findfunctab: Vec::new(),
            typelinks: Vec::new(),
            typemap: HashMap::new(),
            itablinks: Vec::new(),
        }
    }

    pub fn contains_pc(&self, pc: usize) -> bool {
        pc >= self.text && pc < self.etext
    }

    /// Resolve a function name from the shared name table.
    pub fn func_name(&self, f: &RawFunc) -> &str {
        let start = f.name_off as usize;
        if start >= self.funcnametab.len() {
            return "";
        }
        let end = self.funcnametab[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(self.funcnametab.len());
        std::str::from_utf8(&self.funcnametab[start..end]).unwrap_or("")
    }

    /// Find the function containing `pc` via the bucketed index.
    pub fn find_func(&self, pc: usize) -> Option<&RawFunc> {
        if !self.contains_pc(pc) || self.funcs.is_empty() {
            return None;
        }
        let off = pc - self.text;
        let b = off / PC_BUCKET_SIZE;
        let i = off % PC_BUCKET_SIZE / (PC_BUCKET_SIZE / NSUB);
        let bucket = self.findfunctab.get(b)?;
        let mut idx = (bucket.idx as usize + bucket.subbuckets[i] as usize)
            .min(self.funcs.len().saturating_sub(1));
        while idx > 0 && self.ftab[idx].entry > pc {
            idx -= 1;
        }
        while idx + 1 < self.ftab.len() && self.ftab[idx + 1].entry <= pc {
            idx += 1;
        }
        self.funcs.get(self.ftab.get(idx)?.idx as usize)
    }
}

/// Build the bucketed pc index from the functions' code offsets
/// (ascending). Mirrors the runtime's own bucketing so lookups behave
/// identically for loaded code.
pub fn build_findfunctab(offsets: &[usize]) -> Result<Vec<FindFuncBucket>, RuntimeError> {
    let mut buckets: Vec<FindFuncBucket> = Vec::new();
    for (k, &off) in offsets.iter().enumerate() {
        let b = off / PC_BUCKET_SIZE;
        let i = off % PC_BUCKET_SIZE / (PC_BUCKET_SIZE / NSUB);
        while buckets.len() <= b {
            buckets.push(FindFuncBucket {
                idx: k as u32,
                subbuckets: [0; NSUB],
            });
        }
        let bucket = &mut buckets[b];
        let delta = k - bucket.idx as usize;
        if delta >= PC_BUCKET_SIZE / MIN_FUNC {
            return Err(RuntimeError::BucketOverflow(delta));
        }
        if bucket.subbuckets[i] == 0 {
            bucket.subbuckets[i] = delta as u8;
        }
    }
    Ok(buckets)
}

/// Placement of a loaded unit's two memory regions.
pub struct SegmentLayout {
    pub code_base: usize,
    /// Code length including relocation-appended trampolines.
    pub code_off: usize,
    pub data_base: usize,
    pub data_len: usize,
    pub noptrdata_len: usize,
    pub bss_len: usize,
    pub noptrbss_len: usize,
}

/// Assemble the module descriptor for a linked, relocated unit.
pub fn build_module(
    name: &str,
    linker: &Linker,
    layout: &SegmentLayout,
    symbol_map: &HashMap<String, usize>,
    itabs: Vec<usize>,
) -> Result<Box<ModuleData>, RuntimeError> {
    let mut md = ModuleData::new(name);
    md.text = layout.code_base;
    md.etext = layout.code_base + layout.code_off;
    md.data = layout.data_base;
    md.edata = md.data + layout.data_len;
    md.noptrdata = md.edata;
    md.enoptrdata = md.noptrdata + layout.noptrdata_len;
    md.bss = md.enoptrdata;
    md.ebss = md.bss + layout.bss_len;
    md.noptrbss = md.ebss;
    md.enoptrbss = md.noptrbss + layout.noptrbss_len;
    md.types = md.data;
    md.etypes = md.enoptrbss;

    md.funcnametab = linker.funcnametab().to_vec();
    md.pctab = linker.pctab().to_vec();
    md.filetab = linker.filetab().to_vec();
    md.cutab = linker.cutab().to_vec();
    md.itablinks = itabs;

    let mut offsets = Vec::with_capacity(linker.func_order().len());
    for fname in linker.func_order() {
        let sym = linker.sym(fname).expect("linked function symbol");
        let meta = sym.func.as_ref().expect("function metadata");
        let entry = *symbol_map.get(fname).ok_or_else(|| {
            RuntimeError::BadModule(format!("no address for function {fname}"))
        })?;
        offsets.push(sym.offset as usize);
        md.funcs.push(RawFunc {
            entry,
            name_off: meta.name_off,
            pcsp: meta.pcsp,
            pcfile: meta.pcfile,
            pcln: meta.pcln,
            cu_offset: meta.cu_offset,
            pcdata: meta.pcdata.clone(),
            funcdata: meta
                .funcdata
                .iter()
                .map(|&off| {
                    if off <= 0 {
                        0
                    } else {
                        md.noptrdata + off as usize
                    }
                })
                .collect(),
            inl_off: meta.inl_off,
        });
    }
    md.ftab = md
        .funcs
        .iter()
        .enumerate()
        .map(|(i, f)| FuncTab {
            entry: f.entry,
            idx: i as u32,
        })
        .collect();
    md.ftab.push(FuncTab {
        entry: md.etext,
        idx: md.funcs.len() as u32,
    });
    md.findfunctab = build_findfunctab(&offsets)?;

    for (sym_name, &addr) in symbol_map {
        if sym_name.starts_with(TYPE_PREFIX)
            && !sym_name.starts_with(TYPE_DOUBLE_DOT_PREFIX)
            && addr >= md.types
            && addr < md.etypes
        {
            let off = (addr - md.types) as i32;
            md.typelinks.push(off);
            md.typemap.insert(off, addr);
        }
    }
    md.typelinks.sort_unstable();

    debug!(
        "module {}: {} functions, {} typelinks, text {:#x}..{:#x}",
        name,
        md.funcs.len(),
        md.typelinks.len(),
        md.text,
        md.etext
    );
    Ok(Box::new(md))
}
