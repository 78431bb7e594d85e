//! Per-function metadata assembly.
//!
//! Each linked function contributes to four shared tables: the function
//! name table, the pc-delta table, the file table and the compilation-unit
//! index. The offsets recorded here are what the runtime synthesizer later
//! copies into the module descriptor. All tables are pre-padded so that
//! offset 0 stays free; the runtime treats a zero table offset as
//! "absent".

use molt_obj::{FuncInfo, ObjSymbol};
use molt_target::PTR_SIZE;

use crate::linker::{align_buf, Linker};
use crate::LinkError;

/// Size of one serialized inlining-tree node in the pc table.
pub const INLINED_CALL_SIZE: usize = 20;

/// Finalized table offsets for one function.
#[derive(Debug, Clone)]
pub struct FuncMeta {
    /// Offset of the function name in the shared name table.
    pub name_off: u32,
    pub pcsp: u32,
    pub pcfile: u32,
    pub pcln: u32,
    /// Offsets of the pc-to-stack-map tables.
    pub pcdata: Vec<u32>,
    /// Offsets of auxiliary data symbols in the noptrdata buffer; 0 for
    /// accepted-empty references.
    pub funcdata: Vec<isize>,
    /// Offset of the serialized inlining tree in the pc table, or -1.
    pub inl_off: i32,
    /// Index of the function's compilation unit in the cu table.
    pub cu_offset: u32,
}

impl Linker {
    /// Intern a function name, returning its name-table offset.
    pub(crate) fn intern_func_name(&mut self, name: &str) -> u32 {
        if let Some(&off) = self.name_map.get(name) {
            return off;
        }
        let off = self.funcnametab.len() as u32;
        self.name_map.insert(name.to_string(), off);
        self.funcnametab.extend_from_slice(name.as_bytes());
        self.funcnametab.push(0);
        off
    }

    /// Build the [`FuncMeta`] for a text symbol, appending its tables.
    pub(crate) fn read_func_meta(&mut self, objsym: &ObjSymbol) -> Result<FuncMeta, LinkError> {
        let default_info = FuncInfo::default();
        let info = objsym.func.as_ref().unwrap_or(&default_info);

        let name_off = self.intern_func_name(&objsym.name);

        let pcsp = self.pctab.len() as u32;
        self.pctab.extend_from_slice(&info.pcsp);
        let pcfile = self.pctab.len() as u32;
        self.pctab.extend_from_slice(&info.pcfile);
        let pcln = self.pctab.len() as u32;
        self.pctab.extend_from_slice(&info.pcline);

        let mut pcdata = Vec::with_capacity(info.pcdata.len());
        for table in &info.pcdata {
            pcdata.push(self.pctab.len() as u32);
            self.pctab.extend_from_slice(table);
        }

        let mut funcdata = Vec::with_capacity(info.funcdata.len());
        for aux in &info.funcdata {
            if !self.syms.contains_key(aux.as_str()) {
                if self.obj_syms.contains_key(aux.as_str()) {
                    self.add_symbol(aux)?;
                } else if !aux.is_empty() {
                    return Err(LinkError::UnknownGcObj(aux.clone()));
                }
            }
            funcdata.push(self.syms.get(aux.as_str()).map(|s| s.offset).unwrap_or(0));
        }

        let inl_off = self.add_inline_tree(info);
        align_buf(&mut self.pctab, PTR_SIZE);

        Ok(FuncMeta {
            name_off,
            pcsp,
            pcfile,
            pcln,
            pcdata,
            funcdata,
            inl_off,
            cu_offset: info.cu_offset,
        })
    }

    /// Serialize a function's inlining tree into the pc table.
    ///
    /// Node layout: parent i16, pad u16, file-table offset i32, line i32,
    /// callee name-table offset i32, parent pc i32.
    fn add_inline_tree(&mut self, info: &FuncInfo) -> i32 {
        if info.inl_tree.is_empty() {
            return -1;
        }
        let callees: Vec<u32> = info
            .inl_tree
            .iter()
            .map(|n| self.intern_func_name(&n.func))
            .collect();
        let start = self.pctab.len() as i32;
        for (node, &name_off) in info.inl_tree.iter().zip(&callees) {
            let file_off = self
                .file_map
                .get(&node.file)
                .map(|&o| o as i32)
                .unwrap_or(-1);
            self.pctab.extend_from_slice(&node.parent.to_le_bytes());
            self.pctab.extend_from_slice(&0u16.to_le_bytes());
            self.pctab.extend_from_slice(&file_off.to_le_bytes());
            self.pctab.extend_from_slice(&(node.line as i32).to_le_bytes());
            self.pctab.extend_from_slice(&(name_off as i32).to_le_bytes());
            self.pctab
                .extend_from_slice(&(node.parent_pc as i32).to_le_bytes());
        }
        start
    }
}
