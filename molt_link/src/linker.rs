//! The symbol closure and offset assignment.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use log::{debug, trace};

use molt_obj::{
    CompilationUnitFiles, ObjSymbol, Package, SymFlags, SymKind, ABI_INTERNAL_SUFFIX,
    IMPORTPATH_PREFIX, STR_PREFIX, TLS_NAME,
};
use molt_target::reloc::{Machine, Reloc, RelocKind};
use molt_target::PTR_SIZE;

use crate::arena::StringArena;
use crate::funcmeta::FuncMeta;
use crate::{LinkError, LinkerOptions, WrapperRule};

/// Offset value of a symbol with no local definition: it must be supplied
/// by the host's running-symbol table at load time.
pub const INVALID_OFFSET: isize = -1;

/// A linker-resident symbol: one per unique name across the link unit.
#[derive(Debug)]
pub struct Sym {
    pub name: String,
    pub kind: SymKind,
    /// Offset inside the destination segment, or [`INVALID_OFFSET`].
    pub offset: isize,
    /// Relocations rebased to absolute segment-buffer offsets.
    pub relocs: Vec<Reloc>,
    pub func: Option<FuncMeta>,
}

/// Grow `buf` with zero bytes up to the next multiple of `align`.
pub(crate) fn align_buf(buf: &mut Vec<u8>, align: usize) {
    let rem = buf.len() % align;
    if rem != 0 {
        buf.resize(buf.len() + align - rem, 0);
    }
}

/// The symbol linker. Feed it containers, then close over the roots with
/// [`Linker::add_symbols`]; the loader consumes the result.
pub struct Linker {
    machine: Option<Machine>,
    pub(crate) code: Vec<u8>,
    pub(crate) data: Vec<u8>,
    pub(crate) noptrdata: Vec<u8>,
    pub(crate) bss: Vec<u8>,
    pub(crate) noptrbss: Vec<u8>,

    pub(crate) syms: HashMap<String, Sym>,
    pub(crate) obj_syms: HashMap<String, ObjSymbol>,
    obj_order: Vec<String>,
    cu_files: Vec<CompilationUnitFiles>,

    pub(crate) funcnametab: Vec<u8>,
    pub(crate) name_map: HashMap<String, u32>,
    pub(crate) pctab: Vec<u8>,
    pub(crate) filetab: Vec<u8>,
    pub(crate) cutab: Vec<u32>,
    pub(crate) file_map: HashMap<String, u32>,

    func_order: Vec<String>,
    init_funcs: Vec<String>,
    sym_order: Vec<String>,

    heap_strings: HashMap<String, Box<[u8]>>,
    string_arena: Option<StringArena>,

    pub options: LinkerOptions,
}

impl Linker {
    pub fn new(options: LinkerOptions) -> Result<Linker, LinkError> {
        if options.heap_strings && options.string_container_size > 0 {
            return Err(LinkError::StringModeConflict);
        }
        let string_arena = if options.string_container_size > 0 {
            Some(StringArena::new(options.string_container_size).map_err(LinkError::Arena)?)
        } else {
            None
        };
        Ok(Linker {
            machine: None,
            code: Vec::new(),
            data: Vec::new(),
            noptrdata: Vec::new(),
            bss: Vec::new(),
            noptrbss: Vec::new(),
            syms: HashMap::new(),
            obj_syms: HashMap::new(),
            obj_order: Vec::new(),
            cu_files: Vec::new(),
            // Pad the shared tables so no real entry sits at offset 0; the
            // runtime's lookups use 0 as "absent".
            funcnametab: vec![0; PTR_SIZE],
            name_map: HashMap::new(),
            pctab: vec![0; PTR_SIZE],
            filetab: Vec::new(),
            cutab: Vec::new(),
            file_map: HashMap::new(),
            func_order: Vec::new(),
            init_funcs: Vec::new(),
            sym_order: Vec::new(),
            heap_strings: HashMap::new(),
            string_arena,
            options,
        })
    }

    /// Read one container file into the link unit.
    pub fn read_object_file(&mut self, path: impl AsRef<Path>) -> Result<(), LinkError> {
        let pkg = Package::read_file(path)?;
        self.merge_package(pkg)
    }

    /// Read one in-memory container into the link unit.
    pub fn read_object_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<(), LinkError> {
        let pkg = Package::read_bytes(name, bytes)?;
        self.merge_package(pkg)
    }

    fn merge_package(&mut self, mut pkg: Package) -> Result<(), LinkError> {
        if let Some(m) = pkg.machine {
            match self.machine {
                None => self.machine = Some(m),
                Some(prev) if prev != m => {
                    return Err(LinkError::Object(molt_obj::ObjError::MachineMismatch(
                        pkg.path.clone(),
                    )))
                }
                _ => {}
            }
        }
        for name in pkg.sym_order.drain(..) {
            if let Some(sym) = pkg.syms.remove(&name) {
                if !self.obj_syms.contains_key(&name) {
                    self.obj_order.push(name.clone());
                    self.obj_syms.insert(name, sym);
                }
            }
        }
        self.cu_files.append(&mut pkg.cu_files);
        Ok(())
    }

    /// Names of every object symbol in first-definition order; the usual
    /// root list for [`Linker::add_symbols`].
    pub fn object_symbol_names(&self) -> Vec<String> {
        self.obj_order.clone()
    }

    /// Close over the roots and assign all offsets.
    pub fn add_symbols(&mut self, names: &[String]) -> Result<(), LinkError> {
        // Anonymous zero values resolve to slot 0 of noptrdata; reserve it
        // so no legitimate symbol can land there.
        self.noptrdata.extend_from_slice(&[0u8; PTR_SIZE]);

        let cu_files = self.cu_files.clone();
        for cu in &cu_files {
            for file in &cu.files {
                if let Some(&off) = self.file_map.get(file) {
                    self.cutab.push(off);
                } else {
                    let off = self.filetab.len() as u32;
                    self.cutab.push(off);
                    self.file_map.insert(file.clone(), off);
                    self.filetab.extend_from_slice(file.as_bytes());
                    self.filetab.push(0);
                }
            }
        }

        for name in names {
            let add = {
                let objsym = self
                    .obj_syms
                    .get(name)
                    .ok_or_else(|| LinkError::InvalidSymbol(name.clone()))?;
                match objsym.kind {
                    SymKind::Text if !objsym.flags.contains(SymFlags::DUP_OK) => true,
                    SymKind::Text => self.keep_dup_ok_wrapper(objsym),
                    SymKind::ReadOnly => true,
                    _ => false,
                }
            };
            if add {
                self.add_symbol(name)?;
            }
        }

        self.rebase_data_offsets();
        self.sym_order = names.to_vec();
        debug!(
            "linked {} symbols: code={} data={} noptrdata={} bss={} noptrbss={}",
            self.syms.len(),
            self.code.len(),
            self.data.len(),
            self.noptrdata.len(),
            self.bss.len(),
            self.noptrbss.len()
        );
        Ok(())
    }

    /// Duplicate-OK text symbols are usually alternate-ABI copies we drop in
    /// favor of the first definition. The exception is an assembly wrapper
    /// whose relocation list points at its own register-ABI base name.
    fn keep_dup_ok_wrapper(&self, objsym: &ObjSymbol) -> bool {
        match self.options.wrapper_rule {
            WrapperRule::KeepAll => true,
            WrapperRule::KeepNone => false,
            WrapperRule::DetectSelfReferential => {
                if !objsym.flags.contains(SymFlags::WRAPPER) {
                    return false;
                }
                match objsym.name.strip_suffix(ABI_INTERNAL_SUFFIX) {
                    Some(base) => objsym.relocs.iter().any(|r| r.target == base),
                    None => false,
                }
            }
        }
    }

    /// Add one symbol and everything reachable from it. Memoized by name,
    /// so relocation cycles terminate.
    pub fn add_symbol(&mut self, name: &str) -> Result<(), LinkError> {
        if self.syms.contains_key(name) {
            return Ok(());
        }
        let objsym = self
            .obj_syms
            .get(name)
            .cloned()
            .ok_or_else(|| LinkError::InvalidSymbol(name.to_string()))?;
        trace!("add symbol {} ({:?})", name, objsym.kind);

        let mut offset;
        match objsym.kind {
            SymKind::Text => {
                offset = self.code.len() as isize;
                self.code.extend_from_slice(&objsym.data);
                align_buf(&mut self.code, PTR_SIZE);
            }
            SymKind::Data => {
                offset = self.data.len() as isize;
                self.data.extend_from_slice(&objsym.data);
                align_buf(&mut self.data, PTR_SIZE);
            }
            SymKind::ReadOnly => {
                // String assignment is pointer assignment: diverted string
                // constants live outside the data segment so they survive
                // module unload.
                offset = 0;
                if self.options.heap_strings && name.starts_with(STR_PREFIX) {
                    self.heap_strings
                        .insert(name.to_string(), objsym.data.clone().into_boxed_slice());
                } else if self.options.string_container_size > 0 && name.starts_with(STR_PREFIX) {
                    let arena = self.string_arena.as_mut().expect("arena configured");
                    match arena.write(&objsym.data) {
                        Some(at) => offset = at as isize,
                        None => {
                            return Err(LinkError::StringContainer {
                                need: objsym.data.len(),
                                avail: arena.capacity() - arena.used(),
                            })
                        }
                    }
                } else {
                    offset = self.noptrdata.len() as isize;
                    self.noptrdata.extend_from_slice(&objsym.data);
                    align_buf(&mut self.noptrdata, PTR_SIZE);
                }
            }
            SymKind::Bss => {
                offset = self.bss.len() as isize;
                self.bss.extend_from_slice(&objsym.data);
                align_buf(&mut self.bss, PTR_SIZE);
            }
            SymKind::NoPtrBss => {
                offset = self.noptrbss.len() as isize;
                self.noptrbss.extend_from_slice(&objsym.data);
                align_buf(&mut self.noptrbss, PTR_SIZE);
            }
            SymKind::Unknown => return Err(LinkError::InvalidSymbol(name.to_string())),
        }

        self.syms.insert(
            name.to_string(),
            Sym {
                name: name.to_string(),
                kind: objsym.kind,
                offset,
                relocs: Vec::new(),
                func: None,
            },
        );

        if objsym.kind == SymKind::Text {
            let meta = self.read_func_meta(&objsym)?;
            if name.ends_with(".init") {
                self.init_funcs.push(name.to_string());
            }
            self.func_order.push(name.to_string());
            self.syms.get_mut(name).expect("just inserted").func = Some(meta);
        }

        let mut relocs = Vec::with_capacity(objsym.relocs.len());
        for loc in &objsym.relocs {
            let mut r = loc.clone();
            r.offset += offset as usize;
            if self.obj_syms.contains_key(&r.target) {
                self.add_symbol(&r.target)?;
                let target_empty = self.obj_syms[&r.target].data.is_empty();
                if target_empty && r.size > 0 {
                    if r.size <= PTR_SIZE {
                        // The compiler allocated nothing for this zero
                        // value; point it at the reserved sentinel slot.
                        self.syms.get_mut(&r.target).expect("added above").offset = 0;
                    } else {
                        return Err(LinkError::ZeroValueTooLarge {
                            symbol: r.target.clone(),
                            size: r.size,
                            max: PTR_SIZE,
                        });
                    }
                }
            } else {
                if r.kind == RelocKind::TlsLe {
                    r.target = TLS_NAME.to_string();
                }
                if r.target.starts_with(IMPORTPATH_PREFIX) && !self.syms.contains_key(&r.target) {
                    self.synthesize_import_path(&r.target);
                } else if !r.target.is_empty() && !self.syms.contains_key(&r.target) {
                    self.syms.insert(
                        r.target.clone(),
                        Sym {
                            name: r.target.clone(),
                            kind: SymKind::Unknown,
                            offset: INVALID_OFFSET,
                            relocs: Vec::new(),
                            func: None,
                        },
                    );
                }
            }
            relocs.push(r);
        }
        self.syms.get_mut(name).expect("just inserted").relocs = relocs;
        Ok(())
    }

    /// Import-path references have no backing bytes in the object; build
    /// the name blob `{tag, len_be, bytes, 0}` in noptrdata on first use.
    fn synthesize_import_path(&mut self, target: &str) {
        let path = target
            .trim_start_matches(IMPORTPATH_PREFIX)
            .trim_matches('.')
            .to_string();
        let off = self.noptrdata.len() as isize;
        self.noptrdata.push(0);
        self.noptrdata
            .extend_from_slice(&(path.len() as u16).to_be_bytes());
        self.noptrdata.extend_from_slice(path.as_bytes());
        self.noptrdata.push(0);
        align_buf(&mut self.noptrdata, PTR_SIZE);
        self.syms.insert(
            target.to_string(),
            Sym {
                name: target.to_string(),
                kind: SymKind::ReadOnly,
                offset: off,
                relocs: Vec::new(),
                func: None,
            },
        );
    }

    /// The data-kind buffers are laid out back to back in one region:
    /// data | noptrdata | bss | noptrbss. Shift every symbol's offset (and
    /// its relocation sites) from buffer-relative to region-relative.
    fn rebase_data_offsets(&mut self) {
        let dlen = self.data.len() as isize;
        let nlen = self.noptrdata.len() as isize;
        let blen = self.bss.len() as isize;
        let divert = self.options.heap_strings || self.options.string_container_size > 0;
        for sym in self.syms.values_mut() {
            let delta = match sym.kind {
                SymKind::ReadOnly => {
                    if divert && sym.name.starts_with(STR_PREFIX) {
                        0
                    } else {
                        dlen
                    }
                }
                SymKind::Bss => dlen + nlen,
                SymKind::NoPtrBss => dlen + nlen + blen,
                _ => 0,
            };
            if delta != 0 && sym.offset != INVALID_OFFSET {
                sym.offset += delta;
                for r in &mut sym.relocs {
                    r.offset += delta as usize;
                }
            }
        }
    }

    /// Externals with no definition anywhere and no entry in `host`.
    pub fn unresolved_external_symbols(&self, host: &HashMap<String, usize>) -> Vec<String> {
        let mut out: Vec<String> = self
            .syms
            .iter()
            .filter(|(name, sym)| {
                sym.offset == INVALID_OFFSET
                    && !host.contains_key(*name)
                    && !self.obj_syms.contains_key(*name)
                    && name.as_str() != TLS_NAME
            })
            .map(|(name, _)| name.clone())
            .collect();
        out.sort();
        out
    }

    /// For each unresolved external, the sorted list of symbols whose
    /// relocations require it.
    pub fn unresolved_external_symbol_users(
        &self,
        host: &HashMap<String, usize>,
    ) -> BTreeMap<String, Vec<String>> {
        let mut out = BTreeMap::new();
        for name in self.unresolved_external_symbols(host) {
            out.insert(name.clone(), self.required_by(&name));
        }
        out
    }

    /// Sorted names of symbols with a relocation against `target`.
    pub fn required_by(&self, target: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .syms
            .values()
            .filter(|s| s.relocs.iter().any(|r| r.target == target))
            .map(|s| s.name.clone())
            .collect();
        users.sort();
        users.dedup();
        users
    }

    /// Drop the heap-string map; with an arena configured, unmap it.
    pub fn unload_strings(&mut self) -> Result<(), LinkError> {
        self.heap_strings.clear();
        if let Some(arena) = self.string_arena.as_mut() {
            arena.unmap().map_err(LinkError::Arena)?;
        }
        Ok(())
    }

    // Accessors for the loader and the metadata synthesizer.

    pub fn machine(&self) -> Option<Machine> {
        self.machine
    }

    pub fn symbols(&self) -> &HashMap<String, Sym> {
        &self.syms
    }

    pub fn sym(&self, name: &str) -> Option<&Sym> {
        self.syms.get(name)
    }

    pub fn has_object_symbol(&self, name: &str) -> bool {
        self.obj_syms.contains_key(name)
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn noptrdata(&self) -> &[u8] {
        &self.noptrdata
    }

    pub fn bss(&self) -> &[u8] {
        &self.bss
    }

    pub fn noptrbss(&self) -> &[u8] {
        &self.noptrbss
    }

    pub fn funcnametab(&self) -> &[u8] {
        &self.funcnametab
    }

    pub fn pctab(&self) -> &[u8] {
        &self.pctab
    }

    pub fn filetab(&self) -> &[u8] {
        &self.filetab
    }

    pub fn cutab(&self) -> &[u32] {
        &self.cutab
    }

    /// Text symbols with metadata, in code-offset order.
    pub fn func_order(&self) -> &[String] {
        &self.func_order
    }

    /// Initializer functions, in link order.
    pub fn init_funcs(&self) -> &[String] {
        &self.init_funcs
    }

    /// The root list passed to [`Linker::add_symbols`].
    pub fn symbol_order(&self) -> &[String] {
        &self.sym_order
    }

    pub fn heap_strings(&self) -> &HashMap<String, Box<[u8]>> {
        &self.heap_strings
    }

    pub fn string_arena(&self) -> Option<&StringArena> {
        self.string_arena.as_ref()
    }

    /// Move string ownership onto the module handle at load time.
    pub fn take_strings(&mut self) -> (HashMap<String, Box<[u8]>>, Option<StringArena>) {
        (
            std::mem::take(&mut self.heap_strings),
            self.string_arena.take(),
        )
    }
}

impl fmt::Debug for Linker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linker")
            .field("machine", &self.machine)
            .field("symbols", &self.syms.len())
            .field("code_len", &self.code.len())
            .field(
                "data_len",
                &(self.data.len() + self.noptrdata.len() + self.bss.len() + self.noptrbss.len()),
            )
            .finish()
    }
}
