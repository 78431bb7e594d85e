//! The process-wide module registry.
//!
//! Shared mutable process state with explicit concurrency discipline: one
//! mutex guards the module list, another the interface-table list. Adding
//! and removing descriptors happens only inside these critical sections;
//! the I/O-bound work of independent loads proceeds unlocked.

use std::ptr::NonNull;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::moduledata::ModuleData;

/// A registered descriptor pointer. The pointee is owned by its
/// `CodeModule` (or leaked for the host module) and outlives registration.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ModPtr(pub NonNull<ModuleData>);

// Descriptors are only mutated before registration or under the registry
// lock during dedup patch reverts.
unsafe impl Send for ModPtr {}

pub struct ModuleRegistry {
    modules: Mutex<Vec<ModPtr>>,
    itabs: Mutex<Vec<usize>>,
}

static REGISTRY: Lazy<ModuleRegistry> = Lazy::new(|| ModuleRegistry {
    modules: Mutex::new(Vec::new()),
    itabs: Mutex::new(Vec::new()),
});

/// The singleton registry. Initialized once, never reset.
pub fn registry() -> &'static ModuleRegistry {
    &REGISTRY
}

impl ModuleRegistry {
    /// Append a descriptor. The host module, if any, must be first.
    pub fn register(&self, md: NonNull<ModuleData>) {
        self.modules.lock().unwrap().push(ModPtr(md));
    }

    /// Remove a descriptor; returns false when it was not registered.
    pub fn deregister(&self, md: NonNull<ModuleData>) -> bool {
        let mut modules = self.modules.lock().unwrap();
        let before = modules.len();
        modules.retain(|m| m.0 != md);
        modules.len() != before
    }

    pub fn len(&self) -> usize {
        self.modules.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first registered module: the host program's descriptor.
    pub fn first(&self) -> Option<ModPtr> {
        self.modules.lock().unwrap().first().copied()
    }

    /// Run `f` over a snapshot of the module list.
    pub fn with_modules<R>(&self, f: impl FnOnce(&[ModPtr]) -> R) -> R {
        let modules = self.modules.lock().unwrap();
        f(&modules)
    }

    /// Find the module whose text range contains `pc`.
    pub fn module_of(&self, pc: usize) -> Option<ModPtr> {
        let modules = self.modules.lock().unwrap();
        modules
            .iter()
            .copied()
            .find(|m| unsafe { m.0.as_ref() }.contains_pc(pc))
    }

    /// Find the function containing `pc` across all modules, returning its
    /// full name.
    pub fn func_name_at(&self, pc: usize) -> Option<String> {
        let modules = self.modules.lock().unwrap();
        for m in modules.iter() {
            let md = unsafe { m.0.as_ref() };
            if let Some(f) = md.find_func(pc) {
                return Some(md.func_name(f).to_string());
            }
        }
        None
    }

    pub fn add_itabs(&self, addrs: &[usize]) {
        self.itabs.lock().unwrap().extend_from_slice(addrs);
    }

    pub fn remove_itabs(&self, addrs: &[usize]) {
        let mut itabs = self.itabs.lock().unwrap();
        itabs.retain(|a| !addrs.contains(a));
    }

    pub fn itab_count(&self) -> usize {
        self.itabs.lock().unwrap().len()
    }
}

/// Register the embedding program's own descriptor. Leaked: the host
/// module lives for the rest of the process.
pub fn register_host_module(md: ModuleData) -> &'static ModuleData {
    let leaked: &'static mut ModuleData = Box::leak(Box::new(md));
    registry().register(NonNull::from(&*leaked));
    leaked
}
