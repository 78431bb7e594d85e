//! molt: load, link and unload compiled Molt object code inside a running
//! process.
//!
//! The pipeline: [`molt_obj`] parses the toolchain's object containers,
//! [`molt_link`] computes the symbol closure and assigns offsets,
//! [`Segment`] maps an executable and a data region and copies bytes in,
//! the target engines rewrite every reference (synthesizing trampolines
//! where displacements overflow), and [`molt_runtime`] registers the
//! module descriptor so the runtime can unwind, scan and type-check the
//! new code. Unload reverses the registrations and releases both regions.
//!
//! ```no_run
//! use std::collections::HashMap;
//!
//! let mut linker = molt::Linker::new(molt::LinkerOptions::default())?;
//! linker.read_object_file("demo.o")?;
//! let roots = linker.object_symbol_names();
//! linker.add_symbols(&roots)?;
//!
//! let mut host = HashMap::new();
//! host.insert("rt.print".to_string(), rt_print as usize);
//! let mut module = molt::load(&mut linker, &host)?;
//! let add = module.function_addresses()["demo.Add"];
//! // call `add`, then:
//! module.unload()?;
//! # extern "C" fn rt_print() {}
//! # Ok::<(), molt::Error>(())
//! ```
//!
//! Loaded code runs with the full privileges of the host process; this is
//! a loader, not a sandbox.

mod codemodule;
mod load;
mod mmap;
mod segment;

use std::io;

use thiserror::Error;

pub use codemodule::{convert_across_modules, CodeModule, ModuleState};
pub use load::load;
pub use segment::Segment;

pub use molt_link::{Linker, LinkerOptions, WrapperRule};
pub use molt_runtime::{
    register_host_module, registry, set_runtime_version, ModuleData, RuntimeVersion, Value,
};
pub use molt_target::{Arch, Machine};

/// Select the relocation engine for a link unit's machine.
pub fn arch_for_machine(machine: Machine) -> &'static dyn Arch {
    match machine {
        Machine::Amd64 => &molt_target_x86::Amd64,
        Machine::Arm64 => &molt_target_arm64::Arm64,
    }
}

/// Everything that can go wrong between reading a container and freeing a
/// module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no objects were read into the linker")]
    NoObjects,

    #[error("unresolved external symbol: {symbol} (required by {required_by:?})")]
    UnresolvedSymbol {
        symbol: String,
        required_by: Vec<String>,
    },

    #[error("mmap of {size} bytes failed: {source}")]
    Allocation { size: usize, source: io::Error },

    #[error("unload: {0}")]
    Unload(String),

    #[error(transparent)]
    Object(#[from] molt_obj::ObjError),

    #[error(transparent)]
    Link(#[from] molt_link::LinkError),

    #[error(transparent)]
    Reloc(#[from] molt_target::RelocError),

    #[error(transparent)]
    Runtime(#[from] molt_runtime::RuntimeError),
}
