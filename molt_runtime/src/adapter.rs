//! Versioned runtime adapter.
//!
//! Everything that depends on a specific runtime revision (TLS block
//! layout, the quiescence hook taken before metadata disappears, module
//! sanity rules) sits behind this trait. One implementation per
//! supported runtime version; [`V1Runtime`] is the current one.

use std::sync::atomic::{fence, Ordering};

use once_cell::sync::OnceCell;

use molt_target::Machine;

use crate::moduledata::ModuleData;
use crate::RuntimeError;

pub trait RuntimeVersion: Send + Sync {
    fn name(&self) -> &'static str;

    /// Offset of the runtime's thread-block slot from the TLS base.
    fn tls_offset(&self, machine: Machine) -> i64;

    /// Quiescence point taken during unload, before the module's metadata
    /// and memory are released, so in-flight readers of the old metadata
    /// drain first.
    fn collect(&self);

    /// Sanity-check a descriptor before it goes live.
    fn verify_module(&self, md: &ModuleData) -> Result<(), RuntimeError>;
}

/// The current runtime revision.
pub struct V1Runtime;

impl RuntimeVersion for V1Runtime {
    fn name(&self) -> &'static str {
        "v1"
    }

    fn tls_offset(&self, machine: Machine) -> i64 {
        match machine {
            Machine::Amd64 => -8,
            Machine::Arm64 => 16,
        }
    }

    fn collect(&self) {
        // v1 has no concurrent collector; a full fence is its quiescence
        // point. Embedders with their own collector install an adapter
        // that triggers a real pass here.
        fence(Ordering::SeqCst);
    }

    fn verify_module(&self, md: &ModuleData) -> Result<(), RuntimeError> {
        if md.ftab.len() != md.funcs.len() + 1 {
            return Err(RuntimeError::BadModule(format!(
                "ftab has {} entries for {} functions",
                md.ftab.len(),
                md.funcs.len()
            )));
        }
        let mut prev = md.text;
        for ft in &md.ftab {
            if ft.entry < prev || ft.entry > md.etext {
                return Err(RuntimeError::BadModule(format!(
                    "function table not sorted within text range at entry {:#x}",
                    ft.entry
                )));
            }
            prev = ft.entry;
        }
        Ok(())
    }
}

static RUNTIME: OnceCell<Box<dyn RuntimeVersion>> = OnceCell::new();

/// Install a runtime adapter. May be called once, before the first load.
pub fn set_runtime_version(rt: Box<dyn RuntimeVersion>) -> Result<(), RuntimeError> {
    RUNTIME.set(rt).map_err(|_| RuntimeError::RuntimeAlreadySet)
}

/// The installed adapter, defaulting to [`V1Runtime`].
pub fn runtime_version() -> &'static dyn RuntimeVersion {
    RUNTIME.get_or_init(|| Box::new(V1Runtime)).as_ref()
}
