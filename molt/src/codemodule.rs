//! The loaded unit's public handle and its lifecycle.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use log::debug;

use molt_link::StringArena;
use molt_runtime::{convert_to_module, registry, runtime_version, ModuleData, PatchLog, Value};

use crate::load::LoadedParts;
use crate::segment::Segment;
use crate::Error;

/// Lifecycle of a module handle. Function addresses are only safe to call
/// in `Loaded`; a handle that failed to unload stays `Unloading` and must
/// not be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Loaded,
    Unloading,
    Freed,
}

/// A loaded unit: its memory regions, the name-to-address map for its
/// functions, the registered module descriptor, and the bookkeeping
/// needed to make unload exact (method-table patch log, itab list,
/// diverted strings).
///
/// Owns its regions exclusively. Dropping a still-loaded handle leaks
/// its regions; unload explicitly if leak-free shutdown matters.
pub struct CodeModule {
    state: ModuleState,
    segment: Segment,
    syms: HashMap<String, usize>,
    module: Box<ModuleData>,
    patches: PatchLog,
    itabs: Vec<usize>,
    heap_strings: HashMap<String, Box<[u8]>>,
    string_arena: Option<StringArena>,
}

impl CodeModule {
    pub(crate) fn new(segment: Segment, parts: LoadedParts, state: ModuleState) -> CodeModule {
        CodeModule {
            state,
            segment,
            syms: parts.mod_syms,
            module: parts.module,
            patches: parts.patches,
            itabs: parts.itabs,
            heap_strings: parts.heap_strings,
            string_arena: parts.string_arena,
        }
    }

    /// Name-to-address map of every loaded function.
    pub fn function_addresses(&self) -> &HashMap<String, usize> {
        &self.syms
    }

    pub fn module_data(&self) -> &ModuleData {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.module.name
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn code_range(&self) -> (usize, usize) {
        (self.module.text, self.module.etext)
    }

    /// Tear the module down: revert method-table grafts, drop interface
    /// tables, leave the registry, wait out in-flight metadata readers,
    /// then release both regions.
    ///
    /// Calling a function address obtained from this module after unload
    /// is undefined behavior; so is reusing the handle after an error.
    pub fn unload(&mut self) -> Result<(), Error> {
        if self.state != ModuleState::Loaded {
            return Err(Error::Unload(format!(
                "module {} is not loaded (state {:?})",
                self.module.name, self.state
            )));
        }
        self.state = ModuleState::Unloading;
        debug!("unloading {}", self.module.name);

        self.patches.revert();
        registry().remove_itabs(&self.itabs);
        registry().deregister(NonNull::from(&*self.module));
        runtime_version().collect();

        self.segment
            .release()
            .map_err(|e| Error::Unload(e.to_string()))?;
        // Diverted strings stay alive: in-flight references may outlive
        // the code. They go with unload_strings (or the handle itself).
        self.state = ModuleState::Freed;
        Ok(())
    }

    /// Release the diverted string storage independently of the code.
    /// Separate from [`CodeModule::unload`] because in-flight string
    /// references may need to outlive the module.
    pub fn unload_strings(&mut self) -> Result<(), Error> {
        self.heap_strings.clear();
        if let Some(arena) = self.string_arena.as_mut() {
            arena.unmap().map_err(|e| Error::Unload(e.to_string()))?;
        }
        Ok(())
    }
}

impl fmt::Debug for CodeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeModule")
            .field("name", &self.module.name)
            .field("state", &self.state)
            .field("functions", &self.syms.len())
            .field("text", &format_args!("{:#x}..{:#x}", self.module.text, self.module.etext))
            .finish()
    }
}

impl Drop for CodeModule {
    fn drop(&mut self) {
        if self.state == ModuleState::Loaded {
            // The handle dies without an explicit unload. The regions are
            // leaked on purpose (loaded code may still be running), but
            // the descriptor is about to be freed, so it must leave the
            // registry and its grafts must be undone.
            self.patches.revert();
            registry().remove_itabs(&self.itabs);
            registry().deregister(NonNull::from(&*self.module));
        }
    }
}

/// Re-point `value`'s type references so it stays usable after `src` is
/// unloaded, using equivalent descriptors from `dst` (or the host
/// program). Must run before `src.unload()`; fails loudly when `dst` has
/// no equivalent type.
pub fn convert_across_modules(
    src: &CodeModule,
    dst: &CodeModule,
    value: &Value,
) -> Result<Value, Error> {
    debug!(
        "converting value of type at {:p} from {} to {}",
        value.ty,
        src.name(),
        dst.name()
    );
    convert_to_module(value, dst.module_data()).map_err(Into::into)
}
