//! The module system (`spec.md` §4.7; `SPEC_FULL.md` §4.7, §3).
//!
//! `vm->modules` in the reference is a singly-linked chain threaded through
//! each `Module`'s `next` pointer; here it is a flat `Vec<Module>` owned by
//! the `Vm`, indexed by `ModuleId`. Every `Closure` stores the `ModuleId` it
//! closes over instead of a raw pointer, so global reads/writes always
//! resolve through `Vm::modules[id]` regardless of GC movement (there is
//! none — this crate never moves heap objects — but the indirection also
//! keeps `Module` itself out of the GC'd arena, since it is VM-owned
//! infrastructure, not a `Value` any Dragon expression can reference).

use std::path::{Path, PathBuf};

use dragon_core::{ObjRef, Table};

pub type ModuleId = usize;

/// A namespace of globals plus a separate table of exported bindings
/// (`spec.md` §3's `Module` record). `directory` is owned (`PathBuf`) per
/// the Open Question resolution recorded in `DESIGN.md`: relative imports
/// inside this module resolve against it.
pub struct Module {
    pub globals: Table,
    pub exports: Table,
    pub directory: PathBuf,
    /// Class objects this module's `initModule`-equivalent bootstrap
    /// installed into `globals`: `Object`, `Iterator`, `Import`, `Exception`,
    /// and the exception taxonomy. Kept alongside `globals` (which also
    /// holds them, keyed by name) so the engine can reach them without a
    /// name-string lookup on every allocation.
    pub object_class: ObjRef,
    pub iterator_class: ObjRef,
    pub import_class: ObjRef,
    pub exception_class: ObjRef,
}

impl Module {
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.dgn"))
    }
}

/// Resolved-path cache so a second `import "lib"` of the same file returns
/// the same `Import` instance (`spec.md` §4.7, §8 scenario 5).
#[derive(Default)]
pub struct ModuleCache {
    entries: Vec<(PathBuf, ObjRef)>,
}

impl ModuleCache {
    pub fn get(&self, path: &Path) -> Option<ObjRef> {
        self.entries.iter().find(|(p, _)| p == path).map(|(_, r)| *r)
    }

    pub fn insert(&mut self, path: PathBuf, import_instance: ObjRef) {
        self.entries.push((path, import_instance));
    }

    /// Cached `Import` instances are reachable only from here once the
    /// importing expression's own local goes out of scope, so the collector
    /// must walk this alongside the value stack and module globals.
    pub fn values(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.entries.iter().map(|(_, r)| *r)
    }
}
