//! Parsers for the toolchain's metadata sections.
//!
//! `.fnmeta` holds one record per function: flags, compilation-unit index,
//! the pcsp/pcfile/pcline delta tables, pcdata tables, funcdata symbol
//! names and the inlining tree. `.cufiles` holds the ordered file list of
//! each compilation unit. Both are little-endian and length-prefixed
//! throughout.

use crate::symbol::{FuncInfo, InlineNode};
use crate::ObjError;

pub struct FnMetaRecord {
    pub name: String,
    pub wrapper: bool,
    pub info: FuncInfo,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    section: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], section: &'static str) -> Self {
        Cursor {
            data,
            pos: 0,
            section,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ObjError> {
        if self.pos + n > self.data.len() {
            return Err(ObjError::Truncated(self.section));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, ObjError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ObjError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i16(&mut self) -> Result<i16, ObjError> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, ObjError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn str16(&mut self) -> Result<String, ObjError> {
        let n = self.u16()? as usize;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ObjError::Truncated(self.section))
    }

    fn bytes32(&mut self) -> Result<Vec<u8>, ObjError> {
        let n = self.u32()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    fn done(&self) -> bool {
        self.pos == self.data.len()
    }
}

/// Parse a `.fnmeta` section.
pub fn parse_fnmeta(data: &[u8]) -> Result<Vec<FnMetaRecord>, ObjError> {
    let mut c = Cursor::new(data, ".fnmeta");
    let count = c.u32()? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let name = c.str16()?;
        let flags = c.u8()?;
        let cu_offset = c.u32()?;
        let pcsp = c.bytes32()?;
        let pcfile = c.bytes32()?;
        let pcline = c.bytes32()?;

        let n_pcdata = c.u8()? as usize;
        let mut pcdata = Vec::with_capacity(n_pcdata);
        for _ in 0..n_pcdata {
            pcdata.push(c.bytes32()?);
        }

        let n_funcdata = c.u8()? as usize;
        let mut funcdata = Vec::with_capacity(n_funcdata);
        for _ in 0..n_funcdata {
            funcdata.push(c.str16()?);
        }

        let n_inline = c.u16()? as usize;
        let mut inl_tree = Vec::with_capacity(n_inline);
        for _ in 0..n_inline {
            let parent = c.i16()?;
            let file = c.str16()?;
            let line = c.u32()?;
            let func = c.str16()?;
            let parent_pc = c.u32()?;
            inl_tree.push(InlineNode {
                parent,
                file,
                line,
                func,
                parent_pc,
            });
        }

        records.push(FnMetaRecord {
            name,
            wrapper: flags & 1 != 0,
            info: FuncInfo {
                pcsp,
                pcfile,
                pcline,
                pcdata,
                funcdata,
                inl_tree,
                cu_offset,
            },
        });
    }
    if !c.done() {
        return Err(ObjError::Truncated(".fnmeta"));
    }
    Ok(records)
}

/// Parse a `.cufiles` section into the ordered file list.
pub fn parse_cufiles(data: &[u8]) -> Result<Vec<String>, ObjError> {
    let mut c = Cursor::new(data, ".cufiles");
    let count = c.u32()? as usize;
    let mut files = Vec::with_capacity(count);
    for _ in 0..count {
        files.push(c.str16()?);
    }
    if !c.done() {
        return Err(ObjError::Truncated(".cufiles"));
    }
    Ok(files)
}

/// Serialize `.fnmeta` records; the write side of [`parse_fnmeta`], used by
/// the test fixtures that synthesize objects.
pub fn write_fnmeta(records: &[FnMetaRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for rec in records {
        put_str16(&mut out, &rec.name);
        out.push(if rec.wrapper { 1 } else { 0 });
        out.extend_from_slice(&rec.info.cu_offset.to_le_bytes());
        put_bytes32(&mut out, &rec.info.pcsp);
        put_bytes32(&mut out, &rec.info.pcfile);
        put_bytes32(&mut out, &rec.info.pcline);
        out.push(rec.info.pcdata.len() as u8);
        for t in &rec.info.pcdata {
            put_bytes32(&mut out, t);
        }
        out.push(rec.info.funcdata.len() as u8);
        for f in &rec.info.funcdata {
            put_str16(&mut out, f);
        }
        out.extend_from_slice(&(rec.info.inl_tree.len() as u16).to_le_bytes());
        for n in &rec.info.inl_tree {
            out.extend_from_slice(&n.parent.to_le_bytes());
            put_str16(&mut out, &n.file);
            out.extend_from_slice(&n.line.to_le_bytes());
            put_str16(&mut out, &n.func);
            out.extend_from_slice(&n.parent_pc.to_le_bytes());
        }
    }
    out
}

/// Serialize a `.cufiles` section.
pub fn write_cufiles(files: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(files.len() as u32).to_le_bytes());
    for f in files {
        put_str16(&mut out, f);
    }
    out
}

fn put_str16(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_bytes32(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
    out.extend_from_slice(b);
}
