//! molt_link: the symbol linker.
//!
//! Takes the union of all compilation units' symbol tables plus a root list
//! of must-include names, computes the transitive closure over relocation
//! edges, assigns every symbol a final offset inside its destination
//! segment buffer, and incrementally builds the shared function-metadata
//! tables (name table, pc tables, file tables, inline trees) the runtime
//! synthesizer later turns into a module descriptor.

pub mod arena;
pub mod funcmeta;
pub mod linker;

use std::io::Write;

use thiserror::Error;

pub use arena::StringArena;
pub use funcmeta::FuncMeta;
pub use linker::{Linker, Sym, INVALID_OFFSET};

use molt_obj::ObjError;

/// Errors produced while linking.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("can only use heap_strings or string_container_size, not both")]
    StringModeConflict,

    #[error("string container overflow: need {need} bytes, {avail} available")]
    StringContainer { need: usize, avail: usize },

    #[error("invalid symbol `{0}`: no definition in any input object")]
    InvalidSymbol(String),

    #[error("unknown gc object: {0}")]
    UnknownGcObj(String),

    #[error("zero-sized symbol `{symbol}` referenced with size {size} (max {max})")]
    ZeroValueTooLarge {
        symbol: String,
        size: usize,
        max: usize,
    },

    #[error("mmap of string container failed: {0}")]
    Arena(std::io::Error),

    #[error(transparent)]
    Object(#[from] ObjError),
}

/// How duplicate-OK text symbols are filtered during closure.
///
/// The default keeps only ABI-transition wrappers whose relocation list
/// points back at their own register-ABI variant; the rule is
/// toolchain-version specific, so it stays swappable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapperRule {
    #[default]
    DetectSelfReferential,
    KeepNone,
    KeepAll,
}

/// Linker configuration.
///
/// `heap_strings` and `string_container_size` are mutually exclusive ways
/// of diverting string constants out of the data segment so they can
/// outlive the code. `keep_temporary_artifacts` is carried opaquely for
/// the external build collaborator.
pub struct LinkerOptions {
    pub keep_temporary_artifacts: bool,
    pub heap_strings: bool,
    pub string_container_size: usize,
    /// Optional sink for one human-readable line per applied relocation.
    pub relocation_debug_writer: Option<Box<dyn Write + Send>>,
    pub wrapper_rule: WrapperRule,
}

impl Default for LinkerOptions {
    fn default() -> Self {
        LinkerOptions {
            keep_temporary_artifacts: false,
            heap_strings: false,
            string_container_size: 0,
            relocation_debug_writer: None,
            wrapper_rule: WrapperRule::default(),
        }
    }
}
