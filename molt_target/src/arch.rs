//! The architecture seam.
//!
//! One implementation per supported target, selected from the object file's
//! ELF machine. Engines patch through a [`RelocCtx`] and may append
//! trampolines at the growing code tail when a displacement does not fit
//! its encoding.

use crate::ctx::RelocCtx;
use crate::reloc::{Machine, Reloc, RelocError};

/// Where a relocation site and its target live.
#[derive(Debug, Clone, Copy)]
pub struct Site {
    /// The patched bytes are in the code region (owning symbol is text).
    pub in_code: bool,
    /// The target symbol is a text symbol.
    pub target_in_code: bool,
}

/// Target-specific relocation engine.
pub trait Arch: Send + Sync {
    fn name(&self) -> &'static str;

    fn machine(&self) -> Machine;

    /// Patch one relocation. `addr` is the resolved absolute address of the
    /// target symbol. Inert kinds must be accepted and ignored.
    fn apply(
        &self,
        ctx: &mut RelocCtx<'_>,
        reloc: &Reloc,
        site: Site,
        addr: usize,
    ) -> Result<(), RelocError>;
}
