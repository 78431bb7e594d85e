//! molt_runtime: the structures the Molt runtime consults to treat loaded
//! memory as first-class code.
//!
//! A loaded unit becomes visible to the runtime through a module
//! descriptor ([`ModuleData`]): pc ranges, a sorted function table with a
//! bucketed pc lookup index, the shared name/pc/file tables, type links
//! and interface tables. Descriptors live in a process-wide registry
//! mutated only under its lock; registration must precede any
//! type-identity comparison, since identity is resolved across the module
//! list.
//!
//! Layout knowledge is isolated behind the versioned [`RuntimeVersion`]
//! adapter so a future runtime revision touches one implementation, not
//! the linker.

pub mod adapter;
pub mod convert;
pub mod dedup;
pub mod moduledata;
pub mod registry;
pub mod typedesc;


use thiserror::Error;

pub use adapter::{runtime_version, set_runtime_version, RuntimeVersion, V1Runtime};
pub use convert::{convert_to_module, Value};
pub use dedup::{deduplicate_type_descriptors, MethodPatch, PatchLog};
pub use moduledata::{
    build_module, FindFuncBucket, FuncTab, ModuleData, RawFunc, SegmentLayout, MIN_FUNC, NSUB,
    PC_BUCKET_SIZE,
};
pub use registry::{register_host_module, registry, ModPtr, ModuleRegistry};
pub use typedesc::TypeDescriptor;

use molt_target::RelocError;

/// Errors produced while synthesizing or consulting runtime metadata.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} functions fall into one pc bucket (max 256)")]
    BucketOverflow(usize),

    #[error("module descriptor verification failed: {0}")]
    BadModule(String),

    #[error("no equivalent for type `{0}` in the destination module")]
    NoEquivalentType(String),

    #[error("type `{ty}` reaches descriptor `{via}` outside the destination module")]
    ForeignType { ty: String, via: String },

    #[error("method patch for type `{ty}` overflows a text offset: {offset}")]
    MethodPatchOverflow { ty: String, offset: i64 },

    #[error("runtime version adapter already installed")]
    RuntimeAlreadySet,

    #[error(transparent)]
    Reloc(#[from] RelocError),
}
