//! Fixture objects for the loader tests, synthesized with `object::write`
//! the same way the toolchain emits them.
#![allow(dead_code)]

use std::collections::HashMap;

use object::write::{
    Object, Relocation as ObjRelocation, SectionId, Symbol, SymbolId, SymbolSection,
};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolFlags,
    SymbolKind, SymbolScope,
};

use molt::{load, CodeModule, Linker, LinkerOptions};
use molt_obj::fnmeta::{write_cufiles, write_fnmeta, FnMetaRecord};
use molt_obj::FuncInfo;

pub const R_ADDR64: u32 = 1;
pub const R_PC32: u32 = 2;
pub const R_CALL: u32 = 4;
pub const R_METHODOFF: u32 = 0x101;

// Field offsets inside a serialized type descriptor.
pub const DESC_NAME: u64 = 24;
pub const DESC_ELEM: u64 = 32;
pub const DESC_EXTRA: u64 = 40;
pub const DESC_UNCOMMON: u64 = 48;

pub struct ObjBuilder {
    pub obj: Object<'static>,
}

impl ObjBuilder {
    pub fn new(pkg: &str) -> ObjBuilder {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let s = obj.add_section(Vec::new(), b".pkgpath".to_vec(), SectionKind::Other);
        obj.set_section_data(s, pkg.as_bytes().to_vec(), 1);
        ObjBuilder { obj }
    }

    fn place(
        &mut self,
        name: &str,
        section: SectionId,
        bytes: &[u8],
        kind: SymbolKind,
    ) -> SymbolId {
        let offset = self.obj.append_section_data(section, bytes, 16);
        self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: bytes.len() as u64,
            kind,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        })
    }

    pub fn text(&mut self, name: &str, code: &[u8]) -> (SymbolId, u64) {
        let section = self.obj.section_id(object::write::StandardSection::Text);
        let id = self.place(name, section, code, SymbolKind::Text);
        let off = self.obj.symbol(id).value;
        (id, off)
    }

    pub fn rodata(&mut self, name: &str, bytes: &[u8]) -> (SymbolId, u64) {
        let section = self
            .obj
            .section_id(object::write::StandardSection::ReadOnlyData);
        let id = self.place(name, section, bytes, SymbolKind::Data);
        let off = self.obj.symbol(id).value;
        (id, off)
    }

    pub fn undef(&mut self, name: &str) -> SymbolId {
        self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Unknown,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        })
    }

    pub fn text_reloc(&mut self, offset: u64, symbol: SymbolId, r_type: u32, addend: i64) {
        let section = self.obj.section_id(object::write::StandardSection::Text);
        self.reloc(section, offset, symbol, r_type, addend);
    }

    pub fn rodata_reloc(&mut self, offset: u64, symbol: SymbolId, r_type: u32, addend: i64) {
        let section = self
            .obj
            .section_id(object::write::StandardSection::ReadOnlyData);
        self.reloc(section, offset, symbol, r_type, addend);
    }

    fn reloc(&mut self, section: SectionId, offset: u64, symbol: SymbolId, r_type: u32, addend: i64) {
        self.obj
            .add_relocation(
                section,
                ObjRelocation {
                    offset,
                    symbol,
                    addend,
                    flags: RelocationFlags::Elf { r_type },
                },
            )
            .unwrap();
    }

    pub fn fnmeta(&mut self, records: &[FnMetaRecord]) {
        let s = self
            .obj
            .add_section(Vec::new(), b".fnmeta".to_vec(), SectionKind::Other);
        self.obj.set_section_data(s, write_fnmeta(records), 1);
    }

    pub fn cufiles(&mut self, files: &[&str]) {
        let s = self
            .obj
            .add_section(Vec::new(), b".cufiles".to_vec(), SectionKind::Other);
        let data = write_cufiles(&files.iter().map(|f| f.to_string()).collect::<Vec<_>>());
        self.obj.set_section_data(s, data, 1);
    }

    pub fn build(mut self) -> Vec<u8> {
        self.obj.write().unwrap()
    }
}

/// A 56-byte type descriptor with null pointer fields (relocations fill
/// them in).
pub fn desc_bytes(size: u64, hash: u32, kind: u8) -> Vec<u8> {
    let mut b = vec![0u8; 56];
    b[0..8].copy_from_slice(&size.to_le_bytes());
    // ptr_bytes stays 0
    b[16..20].copy_from_slice(&hash.to_le_bytes());
    b[21] = 8; // align
    b[22] = kind;
    b
}

/// `{tag, len_be, bytes, 0}` name blob.
pub fn name_blob(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 4);
    out.push(0);
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    out
}

/// `mov rax, rdi; add rax, rsi; ret`: Add(a, b) under the C ABI.
pub const ADD_CODE: &[u8] = &[0x48, 0x89, 0xf8, 0x48, 0x01, 0xf0, 0xc3];

/// `sub rsp, 8; call <reloc>; add rsp, 8; ret`: call a host function.
pub const CALL_HOST_CODE: &[u8] = &[
    0x48, 0x83, 0xec, 0x08, 0xe8, 0x00, 0x00, 0x00, 0x00, 0x48, 0x83, 0xc4, 0x08, 0xc3,
];
/// Offset of the call displacement inside [`CALL_HOST_CODE`].
pub const CALL_HOST_DISP: u64 = 5;

/// `add qword [rdi], 1; mov rax, [rdi]; ret`: bump and return a counter.
pub const COUNTER_INC_CODE: &[u8] = &[0x48, 0x83, 0x07, 0x01, 0x48, 0x8b, 0x07, 0xc3];

/// An object exporting `demo.Add` with function metadata.
pub fn add_object() -> Vec<u8> {
    let mut b = ObjBuilder::new("demo");
    b.text("\"\".Add", ADD_CODE);
    b.cufiles(&["demo/add.mt"]);
    b.fnmeta(&[FnMetaRecord {
        name: "\"\".Add".to_string(),
        wrapper: false,
        info: FuncInfo {
            pcsp: vec![2, 0],
            pcfile: vec![1, 0],
            pcline: vec![3, 0],
            ..FuncInfo::default()
        },
    }]);
    b.build()
}

/// An object whose `demo.<fn_name>` calls the host symbol `<host_name>`.
pub fn call_host_object(fn_name: &str, host_name: &str) -> Vec<u8> {
    let mut b = ObjBuilder::new("demo");
    let host = b.undef(host_name);
    let (_, off) = b.text(&format!("\"\".{fn_name}"), CALL_HOST_CODE);
    b.text_reloc(off + CALL_HOST_DISP, host, R_CALL, 0);
    b.build()
}

/// An object with a text cell `demo.tickref` holding the address of its
/// own `type.demo.Tick` descriptor.
pub fn tick_object(hash: u32) -> Vec<u8> {
    let mut b = ObjBuilder::new("demo");
    let (tick, tick_off) = b.rodata("type.demo.Tick", &desc_bytes(8, hash, 3));
    let (name, _) = b.rodata("type..namedata.Tick", &name_blob("demo.Tick"));
    b.rodata_reloc(tick_off + DESC_NAME, name, R_ADDR64, 0);
    let (_, ref_off) = b.text("\"\".tickref", &[0u8; 8]);
    b.text_reloc(ref_off, tick, R_ADDR64, 0);
    b.build()
}

/// An object defining `type.demo.Counter` with one method (`Inc`) backed
/// by `demo.CounterInc`.
pub fn counter_object(hash: u32) -> Vec<u8> {
    let mut b = ObjBuilder::new("demo");
    let (inc, _) = b.text("\"\".CounterInc", COUNTER_INC_CODE);
    let (cname, _) = b.rodata("type..namedata.Counter", &name_blob("demo.Counter"));
    let (mname, _) = b.rodata("type..namedata.Inc", &name_blob("Inc"));

    // UncommonMeta { mcount: 1 } followed by MethodMeta { name, ifn, tfn }.
    let mut unc = vec![0u8; 24];
    unc[0] = 1;
    unc[16..20].copy_from_slice(&(-1i32).to_le_bytes());
    unc[20..24].copy_from_slice(&(-1i32).to_le_bytes());
    let (unc_id, unc_off) = b.rodata("type..uncommon.Counter", &unc);
    b.rodata_reloc(unc_off + 8, mname, R_ADDR64, 0);
    b.rodata_reloc(unc_off + 16, inc, R_METHODOFF, 0);
    b.rodata_reloc(unc_off + 20, inc, R_METHODOFF, 0);

    let (_, desc_off) = b.rodata("type.demo.Counter", &desc_bytes(8, hash, 3));
    b.rodata_reloc(desc_off + DESC_NAME, cname, R_ADDR64, 0);
    b.rodata_reloc(desc_off + DESC_UNCOMMON, unc_id, R_ADDR64, 0);
    b.build()
}

/// An object with a string constant and a text cell holding its address.
pub fn string_object() -> Vec<u8> {
    let mut b = ObjBuilder::new("demo");
    let (s, _) = b.rodata("str.\"\".msg", b"hiya");
    let (_, ref_off) = b.text("\"\".msgref", &[0u8; 8]);
    b.text_reloc(ref_off, s, R_ADDR64, 0);
    b.build()
}

/// Read a u64 from an address produced by the loader.
pub unsafe fn read_u64(addr: usize) -> u64 {
    (addr as *const u64).read_unaligned()
}

/// Build a linker over `bytes`, close over every symbol, and load.
pub fn load_bytes(
    name: &str,
    bytes: &[u8],
    host: &HashMap<String, usize>,
    options: LinkerOptions,
) -> Result<(Linker, CodeModule), molt::Error> {
    let mut linker = Linker::new(options)?;
    linker.read_object_bytes(name, bytes)?;
    let roots = linker.object_symbol_names();
    linker.add_symbols(&roots)?;
    let module = load(&mut linker, host)?;
    Ok((linker, module))
}
