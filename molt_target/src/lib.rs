//! molt_target: relocation vocabulary shared between the object reader, the
//! symbol linker and the per-architecture relocation engines.
//!
//! The actual patch logic lives in the target crates (`molt_target_x86`,
//! `molt_target_arm64`); this crate defines what they all agree on: the
//! relocation kinds, the decode tables from ELF `r_type` values, and the
//! [`Arch`] trait plus the mutable context an engine patches through.

pub mod arch;
pub mod ctx;
pub mod reloc;

pub use arch::{Arch, Site};
pub use ctx::RelocCtx;
pub use reloc::{Machine, Reloc, RelocError, RelocKind};

/// Pointer size of every supported target, in bytes.
pub const PTR_SIZE: usize = 8;
