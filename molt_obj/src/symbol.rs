//! Symbol-table types produced by the reader.

use bitflags::bitflags;

use molt_target::Reloc;

/// Prefix of type-descriptor symbols.
pub const TYPE_PREFIX: &str = "type.";
/// Prefix of internal type metadata (name blobs, equality helpers) that is
/// never a descriptor itself.
pub const TYPE_DOUBLE_DOT_PREFIX: &str = "type..";
/// Prefix of string-constant symbols eligible for arena diversion.
pub const STR_PREFIX: &str = "str.";
/// Prefix of interface-table symbols.
pub const ITAB_PREFIX: &str = "itab.";
/// Prefix of import-path name symbols synthesized on demand.
pub const IMPORTPATH_PREFIX: &str = "type.importpath.";
/// Placeholder the toolchain leaves where the package path belongs.
pub const EMPTY_PKG: &str = "\"\"";
/// Suffix distinguishing the register-ABI variant of an assembly wrapper.
pub const ABI_INTERNAL_SUFFIX: &str = ".abiinternal";
/// The distinguished thread-local pseudo-symbol.
pub const TLS_NAME: &str = "rt.tls_g";
/// Prefix of entry-package symbols.
pub const MAIN_PKG_PREFIX: &str = "main.";

/// Destination category of a symbol's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymKind {
    /// Executable code (`.text`).
    Text,
    /// Initialized, pointer-bearing data (`.data`).
    Data,
    /// Read-only or pointer-free initialized data (`.rodata`, `.noptrdata`).
    ReadOnly,
    /// Zero-initialized data scanned by the collector (`.bss`).
    Bss,
    /// Zero-initialized data without pointers (`.noptrbss`).
    NoPtrBss,
    /// External reference with no local definition.
    Unknown,
}

bitflags! {
    /// Per-symbol flags carried by the container.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymFlags: u8 {
        /// Duplicate definitions of this symbol are permitted.
        const DUP_OK = 1 << 0;
        /// The function is an ABI-transition wrapper.
        const WRAPPER = 1 << 1;
    }
}

/// One symbol as read from a container. Immutable once produced.
#[derive(Debug, Clone)]
pub struct ObjSymbol {
    pub name: String,
    pub kind: SymKind,
    pub data: Vec<u8>,
    pub size: u64,
    pub flags: SymFlags,
    pub relocs: Vec<Reloc>,
    pub func: Option<FuncInfo>,
}

/// Per-function metadata from the `.fnmeta` section.
///
/// The pc-delta tables are opaque to the loader; they are copied into the
/// module's shared tables and re-offset, nothing more.
#[derive(Debug, Clone, Default)]
pub struct FuncInfo {
    pub pcsp: Vec<u8>,
    pub pcfile: Vec<u8>,
    pub pcline: Vec<u8>,
    pub pcdata: Vec<Vec<u8>>,
    /// Names of auxiliary data symbols (stack-object maps); empty entries
    /// are accepted and resolve to no data.
    pub funcdata: Vec<String>,
    pub inl_tree: Vec<InlineNode>,
    /// Index of this function's compilation unit in the shared file table.
    pub cu_offset: u32,
}

/// One node of a function's inlining tree.
#[derive(Debug, Clone)]
pub struct InlineNode {
    /// Index of the parent node, or negative for the root.
    pub parent: i16,
    pub file: String,
    pub line: u32,
    pub func: String,
    pub parent_pc: u32,
}

/// Ordered source files of one compilation unit.
#[derive(Debug, Clone)]
pub struct CompilationUnitFiles {
    pub archive_name: String,
    pub files: Vec<String>,
}
