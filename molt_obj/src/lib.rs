//! molt_obj: reader for the Molt toolchain's compiled-object containers.
//!
//! A container is an ELF64 relocatable object, or an `!<arch>` archive of
//! several, as emitted by the collaborating build step. Beyond the usual
//! sections, the toolchain adds `.fnmeta` (per-function runtime metadata),
//! `.cufiles` (compilation-unit file lists) and `.pkgpath` (the package
//! path substituted into `""`-placeholder symbol names).
//!
//! The reader produces an immutable symbol table: every symbol's kind, raw
//! bytes, relocation list and, for functions, the metadata the runtime
//! needs for unwinding and garbage-collection scanning.

pub mod fnmeta;
pub mod reader;
pub mod symbol;

use thiserror::Error;

pub use reader::Package;
pub use symbol::{
    CompilationUnitFiles, FuncInfo, InlineNode, ObjSymbol, SymFlags, SymKind,
    ABI_INTERNAL_SUFFIX, EMPTY_PKG, IMPORTPATH_PREFIX, ITAB_PREFIX, MAIN_PKG_PREFIX, STR_PREFIX,
    TLS_NAME, TYPE_DOUBLE_DOT_PREFIX, TYPE_PREFIX,
};

/// Errors produced while reading a container.
#[derive(Debug, Error)]
pub enum ObjError {
    #[error("unrecognized object container `{name}`: {reason}")]
    BadContainer { name: String, reason: String },

    #[error("unsupported machine in `{0}`")]
    UnsupportedMachine(String),

    #[error("conflicting machines within link unit at `{0}`")]
    MachineMismatch(String),

    #[error("truncated {0} section")]
    Truncated(&'static str),

    #[error("symbol `{symbol}` lives in unrecognized section `{section}`")]
    UnknownSection { symbol: String, section: String },

    #[error("function metadata names unknown symbol `{0}`")]
    MissingFunction(String),

    #[error("relocation at {offset:#x} in `{section}` has no named target")]
    UnnamedRelocTarget { section: String, offset: u64 },

    #[error("relocation at {offset:#x} in `{section}` falls outside any symbol")]
    OrphanReloc { section: String, offset: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
