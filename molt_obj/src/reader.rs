//! Container reading: archives, ELF objects, symbol extraction.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::debug;
use object::read::archive::ArchiveFile;
use object::{
    Object, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget, SectionIndex,
    SectionKind, SymbolKind,
};

use molt_target::reloc::{decode, Machine, Reloc};

use crate::fnmeta::{parse_cufiles, parse_fnmeta};
use crate::symbol::{
    CompilationUnitFiles, ObjSymbol, SymFlags, SymKind, EMPTY_PKG, STR_PREFIX,
};
use crate::ObjError;

/// The merged symbol table of one link unit's containers.
#[derive(Debug)]
pub struct Package {
    /// Package path substituted into placeholder-prefixed names.
    pub path: String,
    pub machine: Option<Machine>,
    pub syms: HashMap<String, ObjSymbol>,
    /// Names in first-definition order.
    pub sym_order: Vec<String>,
    pub cu_files: Vec<CompilationUnitFiles>,
}

struct Span {
    addr: u64,
    size: u64,
    name: String,
    /// False when this definition lost to an earlier one; its relocations
    /// are dropped with it.
    keep: bool,
}

impl Package {
    pub fn new() -> Self {
        Package {
            path: String::new(),
            machine: None,
            syms: HashMap::new(),
            sym_order: Vec::new(),
            cu_files: Vec::new(),
        }
    }

    /// Read a container from disk.
    pub fn read_file(path: impl AsRef<Path>) -> Result<Package, ObjError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::read_bytes(&name, &data)
    }

    /// Read a container from memory.
    pub fn read_bytes(name: &str, data: &[u8]) -> Result<Package, ObjError> {
        let mut pkg = Package::new();
        pkg.append_bytes(name, data)?;
        Ok(pkg)
    }

    /// Merge another container into this package.
    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<(), ObjError> {
        if data.starts_with(b"!<arch>") {
            let archive = ArchiveFile::parse(data).map_err(|e| ObjError::BadContainer {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            for member in archive.members() {
                let member = member.map_err(|e| ObjError::BadContainer {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
                let entry = format!("{}({})", name, String::from_utf8_lossy(member.name()));
                let bytes = member.data(data).map_err(|e| ObjError::BadContainer {
                    name: entry.clone(),
                    reason: e.to_string(),
                })?;
                self.read_object(&entry, bytes)?;
            }
            Ok(())
        } else {
            self.read_object(name, data)
        }
    }

    fn read_object(&mut self, entry: &str, data: &[u8]) -> Result<(), ObjError> {
        let file = object::File::parse(data).map_err(|e| ObjError::BadContainer {
            name: entry.to_string(),
            reason: e.to_string(),
        })?;
        let machine = match file.architecture() {
            object::Architecture::X86_64 => Machine::Amd64,
            object::Architecture::Aarch64 => Machine::Arm64,
            _ => return Err(ObjError::UnsupportedMachine(entry.to_string())),
        };
        match self.machine {
            None => self.machine = Some(machine),
            Some(m) if m != machine => return Err(ObjError::MachineMismatch(entry.to_string())),
            _ => {}
        }

        let pkg_path = file
            .section_by_name(".pkgpath")
            .and_then(|s| s.data().ok())
            .map(|d| String::from_utf8_lossy(d).trim().to_string())
            .unwrap_or_default();
        if self.path.is_empty() && !pkg_path.is_empty() {
            self.path = pkg_path.clone();
        }
        // String constants embed their content in the name; everything else
        // gets the package path spliced in for the placeholder.
        let expand = |n: &str| -> String {
            if pkg_path.is_empty() || n.starts_with(STR_PREFIX) {
                n.to_string()
            } else {
                n.replace(EMPTY_PKG, &pkg_path)
            }
        };

        let mut kinds: HashMap<SectionIndex, SymKind> = HashMap::new();
        for section in file.sections() {
            let kind = match section.name().unwrap_or("") {
                ".text" => SymKind::Text,
                ".data" => SymKind::Data,
                ".rodata" | ".noptrdata" => SymKind::ReadOnly,
                ".bss" => SymKind::Bss,
                ".noptrbss" => SymKind::NoPtrBss,
                _ => continue,
            };
            kinds.insert(section.index(), kind);
        }

        let mut spans: HashMap<SectionIndex, Vec<Span>> = HashMap::new();
        for sym in file.symbols() {
            match sym.kind() {
                SymbolKind::Text | SymbolKind::Data => {}
                _ => continue,
            }
            if !sym.is_definition() {
                continue;
            }
            let raw_name = sym.name().map_err(|e| ObjError::BadContainer {
                name: entry.to_string(),
                reason: e.to_string(),
            })?;
            if raw_name.is_empty() {
                continue;
            }
            let Some(index) = sym.section_index() else {
                continue;
            };
            let section = file
                .section_by_index(index)
                .map_err(|e| ObjError::BadContainer {
                    name: entry.to_string(),
                    reason: e.to_string(),
                })?;
            let kind = match kinds.get(&index) {
                Some(k) => *k,
                None => {
                    return Err(ObjError::UnknownSection {
                        symbol: raw_name.to_string(),
                        section: section.name().unwrap_or("?").to_string(),
                    })
                }
            };
            let name = expand(raw_name);
            let keep = !self.syms.contains_key(&name);
            spans.entry(index).or_default().push(Span {
                addr: sym.address(),
                size: sym.size(),
                name: name.clone(),
                keep,
            });
            if !keep {
                continue;
            }

            let bytes = if section.kind() == SectionKind::UninitializedData {
                vec![0u8; sym.size() as usize]
            } else {
                let sd = section.data().map_err(|e| ObjError::BadContainer {
                    name: entry.to_string(),
                    reason: e.to_string(),
                })?;
                sd[sym.address() as usize..(sym.address() + sym.size()) as usize].to_vec()
            };
            let mut flags = SymFlags::empty();
            if sym.is_weak() {
                flags |= SymFlags::DUP_OK;
            }
            self.syms.insert(
                name.clone(),
                ObjSymbol {
                    name: name.clone(),
                    kind,
                    data: bytes,
                    size: sym.size(),
                    flags,
                    relocs: Vec::new(),
                    func: None,
                },
            );
            self.sym_order.push(name);
        }

        for section in file.sections() {
            let Some(spanlist) = spans.get_mut(&section.index()) else {
                continue;
            };
            spanlist.sort_by_key(|s| s.addr);
            let secname = section.name().unwrap_or("?").to_string();
            for (off, rel) in section.relocations() {
                let owner = spanlist
                    .iter()
                    .rev()
                    .find(|s| off >= s.addr && off < s.addr + s.size.max(1));
                let Some(owner) = owner else {
                    return Err(ObjError::OrphanReloc {
                        section: secname,
                        offset: off,
                    });
                };
                if !owner.keep {
                    continue;
                }
                let target = match rel.target() {
                    RelocationTarget::Symbol(si) => {
                        let ts = file.symbol_by_index(si).map_err(|e| ObjError::BadContainer {
                            name: entry.to_string(),
                            reason: e.to_string(),
                        })?;
                        let n = ts.name().map_err(|e| ObjError::BadContainer {
                            name: entry.to_string(),
                            reason: e.to_string(),
                        })?;
                        if n.is_empty() {
                            return Err(ObjError::UnnamedRelocTarget {
                                section: secname.clone(),
                                offset: off,
                            });
                        }
                        expand(n)
                    }
                    _ => {
                        return Err(ObjError::UnnamedRelocTarget {
                            section: secname.clone(),
                            offset: off,
                        })
                    }
                };
                let r_type = match rel.flags() {
                    RelocationFlags::Elf { r_type } => r_type,
                    _ => 0,
                };
                let (kind, size) = decode(machine, r_type);
                let sym = self.syms.get_mut(&owner.name).unwrap();
                sym.relocs.push(Reloc {
                    offset: (off - owner.addr) as usize,
                    size,
                    kind,
                    addend: rel.addend(),
                    target,
                });
            }
        }

        if let Some(section) = file.section_by_name(".fnmeta") {
            let meta = section.data().map_err(|_| ObjError::Truncated(".fnmeta"))?;
            for rec in parse_fnmeta(meta)? {
                let name = expand(&rec.name);
                let Some(sym) = self.syms.get_mut(&name) else {
                    return Err(ObjError::MissingFunction(name));
                };
                if rec.wrapper {
                    sym.flags |= SymFlags::WRAPPER;
                }
                let mut info = rec.info;
                for f in &mut info.funcdata {
                    if !f.is_empty() {
                        *f = expand(f);
                    }
                }
                for node in &mut info.inl_tree {
                    node.func = expand(&node.func);
                }
                sym.func = Some(info);
            }
        }

        if let Some(section) = file.section_by_name(".cufiles") {
            let raw = section.data().map_err(|_| ObjError::Truncated(".cufiles"))?;
            let files = parse_cufiles(raw)?;
            self.cu_files.push(CompilationUnitFiles {
                archive_name: entry.to_string(),
                files,
            });
        }

        debug!(
            "read {}: {} symbols, {} compilation units",
            entry,
            self.sym_order.len(),
            self.cu_files.len()
        );
        Ok(())
    }
}

impl Default for Package {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
