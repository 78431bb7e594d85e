use object::write::{Object, Relocation as ObjRelocation, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolFlags,
    SymbolKind, SymbolScope,
};

use molt_target::RelocKind;

use crate::fnmeta::{write_cufiles, write_fnmeta, FnMetaRecord};
use crate::symbol::{FuncInfo, SymFlags, SymKind};
use crate::{ObjError, Package};

fn new_object() -> Object<'static> {
    Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little)
}

fn add_text_symbol(obj: &mut Object, name: &str, code: &[u8]) -> object::write::SymbolId {
    let text = obj.section_id(object::write::StandardSection::Text);
    let offset = obj.append_section_data(text, code, 16);
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: offset,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    })
}

fn set_pkgpath(obj: &mut Object, path: &str) {
    let s = obj.add_section(Vec::new(), b".pkgpath".to_vec(), SectionKind::Other);
    obj.set_section_data(s, path.as_bytes().to_vec(), 1);
}

#[test]
fn placeholder_names_get_the_package_path() {
    let mut obj = new_object();
    set_pkgpath(&mut obj, "demo");

    let callee = obj.add_symbol(Symbol {
        name: b"\"\".helper".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Text,
        scope: SymbolScope::Unknown,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    // call rel32 to the helper
    add_text_symbol(&mut obj, "\"\".Add", &[0xe8, 0, 0, 0, 0, 0xc3]);
    let text = obj.section_id(object::write::StandardSection::Text);
    obj.add_relocation(
        text,
        ObjRelocation {
            offset: 1,
            symbol: callee,
            addend: 0,
            flags: RelocationFlags::Elf { r_type: 4 },
        },
    )
    .unwrap();

    let bytes = obj.write().unwrap();
    let pkg = Package::read_bytes("add.o", &bytes).unwrap();

    assert_eq!(pkg.path, "demo");
    let sym = &pkg.syms["demo.Add"];
    assert_eq!(sym.kind, SymKind::Text);
    assert_eq!(sym.relocs.len(), 1);
    assert_eq!(sym.relocs[0].kind, RelocKind::Call);
    assert_eq!(sym.relocs[0].size, 4);
    assert_eq!(sym.relocs[0].target, "demo.helper");
}

#[test]
fn string_constant_names_are_left_alone() {
    let mut obj = new_object();
    set_pkgpath(&mut obj, "demo");
    let rodata = obj.section_id(object::write::StandardSection::ReadOnlyData);
    let off = obj.append_section_data(rodata, b"hello", 1);
    obj.add_symbol(Symbol {
        name: b"str.\"\".hello".to_vec(),
        value: off,
        size: 5,
        kind: SymbolKind::Data,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(rodata),
        flags: SymbolFlags::None,
    });

    let bytes = obj.write().unwrap();
    let pkg = Package::read_bytes("strings.o", &bytes).unwrap();
    let sym = &pkg.syms["str.\"\".hello"];
    assert_eq!(sym.kind, SymKind::ReadOnly);
    assert_eq!(sym.data, b"hello");
}

#[test]
fn function_metadata_is_attached() {
    let mut obj = new_object();
    set_pkgpath(&mut obj, "demo");
    add_text_symbol(&mut obj, "\"\".Add", &[0xc3]);

    let meta = write_fnmeta(&[FnMetaRecord {
        name: "\"\".Add".to_string(),
        wrapper: false,
        info: FuncInfo {
            pcsp: vec![2, 0],
            pcfile: vec![1, 0],
            pcline: vec![9, 0],
            pcdata: vec![vec![7, 7]],
            funcdata: vec!["\"\".Add.stkobj".to_string(), String::new()],
            inl_tree: vec![],
            cu_offset: 0,
        },
    }]);
    let s = obj.add_section(Vec::new(), b".fnmeta".to_vec(), SectionKind::Other);
    obj.set_section_data(s, meta, 1);

    let cu = obj.add_section(Vec::new(), b".cufiles".to_vec(), SectionKind::Other);
    obj.set_section_data(cu, write_cufiles(&["demo/add.mt".to_string()]), 1);

    let bytes = obj.write().unwrap();
    let pkg = Package::read_bytes("add.o", &bytes).unwrap();

    let func = pkg.syms["demo.Add"].func.as_ref().unwrap();
    assert_eq!(func.pcsp, vec![2, 0]);
    assert_eq!(func.funcdata, vec!["demo.Add.stkobj".to_string(), String::new()]);
    assert_eq!(pkg.cu_files.len(), 1);
    assert_eq!(pkg.cu_files[0].files, vec!["demo/add.mt".to_string()]);
}

#[test]
fn weak_symbols_are_marked_dup_ok() {
    let mut obj = new_object();
    let text = obj.section_id(object::write::StandardSection::Text);
    let off = obj.append_section_data(text, &[0xc3], 16);
    obj.add_symbol(Symbol {
        name: b"dup.wrapper".to_vec(),
        value: off,
        size: 1,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: true,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    let bytes = obj.write().unwrap();
    let pkg = Package::read_bytes("dup.o", &bytes).unwrap();
    assert!(pkg.syms["dup.wrapper"].flags.contains(SymFlags::DUP_OK));
}

#[test]
fn garbage_is_a_format_error() {
    let err = Package::read_bytes("junk.bin", b"\x7fNOT-AN-ELF").unwrap_err();
    assert!(matches!(err, ObjError::BadContainer { .. }));
}

#[test]
fn truncated_fnmeta_is_a_format_error() {
    let mut obj = new_object();
    add_text_symbol(&mut obj, "f", &[0xc3]);
    let s = obj.add_section(Vec::new(), b".fnmeta".to_vec(), SectionKind::Other);
    // Claims one record but carries no payload.
    obj.set_section_data(s, vec![1, 0, 0, 0], 1);

    let bytes = obj.write().unwrap();
    let err = Package::read_bytes("bad.o", &bytes).unwrap_err();
    assert!(matches!(err, ObjError::Truncated(".fnmeta")));
}

#[test]
fn archives_are_walked_member_by_member() {
    let mut a = new_object();
    set_pkgpath(&mut a, "demo");
    add_text_symbol(&mut a, "\"\".A", &[0xc3]);
    let mut b = new_object();
    set_pkgpath(&mut b, "demo");
    add_text_symbol(&mut b, "\"\".B", &[0xc3, 0xc3]);

    let archive = ar_archive(&[("a.o/", &a.write().unwrap()), ("b.o/", &b.write().unwrap())]);
    let pkg = Package::read_bytes("unit.a", &archive).unwrap();
    assert!(pkg.syms.contains_key("demo.A"));
    assert!(pkg.syms.contains_key("demo.B"));
    assert_eq!(pkg.sym_order, vec!["demo.A".to_string(), "demo.B".to_string()]);
}

/// Minimal GNU-style `!<arch>` writer for fixtures.
fn ar_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = b"!<arch>\n".to_vec();
    for (name, data) in members {
        let mut header = vec![b' '; 60];
        header[..name.len()].copy_from_slice(name.as_bytes());
        header[16] = b'0'; // mtime
        header[28] = b'0'; // uid
        header[34] = b'0'; // gid
        header[40..43].copy_from_slice(b"644");
        let size = data.len().to_string();
        header[48..48 + size.len()].copy_from_slice(size.as_bytes());
        header[58] = 0x60;
        header[59] = b'\n';
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}
