//! The allocator and tracing garbage collector (`spec.md` §4.1).
//!
//! Every heap object lives in one arena slot, indexed by [`crate::ObjRef`].
//! This mirrors the reference VM's intrusive `Obj* next` sweep chain without
//! needing raw pointers: slots are never physically removed, only marked
//! free and pushed onto `free_list` for reuse, so an `ObjRef` a caller is
//! still holding either resolves to the object they expect or (if they kept
//! one past a collection that reclaimed it — a caller bug, not something the
//! collector can prevent) panics loudly on access rather than reading
//! unrelated data.
//!
//! GC roots live outside this crate (stack, call frames, modules — all
//! owned by `dragon-vm`), so [`Heap::collect`] takes the root-marking logic
//! as a caller-supplied closure rather than walking them itself.

use crate::object::{fnv1a_hash, Native};
use crate::table::Table;
use crate::{
    BoundMethod, Class, Closure, Function, HeapObject, Instance, List, ObjRef, ObjString,
    Upvalue, Value,
};

/// Tunable collector parameters (`spec.md` §4.1's `reallocate` contract).
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// `bytes_allocated` threshold that triggers the first collection.
    pub initial_threshold: usize,
    /// `next_gc = bytes_allocated * growth_factor` after each collection.
    /// Must be at least 2.0 per `spec.md` §4.1.
    pub growth_factor: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            initial_threshold: 1024 * 1024,
            growth_factor: 2.0,
        }
    }
}

struct Slot {
    marked: bool,
    object: Option<HeapObject>,
}

pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    /// Weak: a matching entry survives only if its key is still marked
    /// after tracing (`spec.md` §4.1's "weak string pruning").
    strings: Table,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    config: GcConfig,
    /// Suspends collection (set false during VM bootstrap and, as a
    /// deliberate simplification recorded in `DESIGN.md`, for the duration
    /// of compiling a single module — see `SPEC_FULL.md` §4.4).
    gc_enabled: bool,
    pub collections_run: usize,
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        Heap {
            slots: Vec::new(),
            free_list: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: config.initial_threshold,
            config,
            gc_enabled: true,
            collections_run: 0,
        }
    }

    pub fn set_gc_enabled(&mut self, enabled: bool) {
        self.gc_enabled = enabled;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.gc_enabled && self.bytes_allocated > self.next_gc
    }

    fn approx_size(object: &HeapObject) -> usize {
        use std::mem::size_of_val;
        match object {
            HeapObject::String(s) => size_of_val(s) + s.bytes.len(),
            HeapObject::List(l) => size_of_val(l) + l.items.len() * size_of::<Value>(),
            HeapObject::Function(f) => size_of_val(f) + f.chunk.code.len() + f.chunk.constants.len() * size_of::<Value>(),
            other => std::mem::size_of_val(other),
        }
    }

    /// Raw allocation: always succeeds, accounts bytes, never itself
    /// triggers collection (that is the caller's job via `should_collect`,
    /// since only the caller knows when it is safe — e.g. with the new
    /// value already rooted).
    pub fn alloc(&mut self, object: HeapObject) -> ObjRef {
        self.bytes_allocated += Self::approx_size(&object);
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Slot {
                marked: false,
                object: Some(object),
            };
            ObjRef(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot {
                marked: false,
                object: Some(object),
            });
            ObjRef(idx)
        }
    }

    pub fn get(&self, r: ObjRef) -> &HeapObject {
        self.slots[r.0 as usize]
            .object
            .as_ref()
            .expect("dangling ObjRef: object already collected")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut HeapObject {
        self.slots[r.0 as usize]
            .object
            .as_mut()
            .expect("dangling ObjRef: object already collected")
    }

    pub fn hash_of(&self, r: ObjRef) -> u32 {
        Self::hash_of_slots(&self.slots, r)
    }

    fn hash_of_slots(slots: &[Slot], r: ObjRef) -> u32 {
        slots[r.0 as usize]
            .object
            .as_ref()
            .and_then(|o| o.as_string())
            .map(|s| s.hash)
            .unwrap_or(0)
    }

    // ---- string interning (spec.md §4.1) ----------------------------------

    /// `copy(bytes, len)`: intern a freshly-copied string, returning the
    /// canonical `ObjRef` (existing or newly allocated).
    pub fn intern_copy(&mut self, bytes: &str) -> ObjRef {
        let hash = fnv1a_hash(bytes.as_bytes());
        if let Some(existing) = self.find_interned(bytes, hash) {
            return existing;
        }
        let r = self.alloc(HeapObject::String(ObjString {
            bytes: bytes.to_string(),
            hash,
        }));
        let slots = &self.slots;
        self.strings.set(r, hash, Value::Null, |k| Self::hash_of_slots(slots, k));
        r
    }

    /// `take(owned_buf, len)`: intern a buffer the caller already owns; if
    /// an equal string is already interned the buffer is simply dropped
    /// (Rust's ownership makes the reference implementation's explicit
    /// `FREE_ARRAY` a no-op — dropping `bytes` does it).
    pub fn intern_take(&mut self, bytes: String) -> ObjRef {
        let hash = fnv1a_hash(bytes.as_bytes());
        if let Some(existing) = self.find_interned(&bytes, hash) {
            return existing;
        }
        let r = self.alloc(HeapObject::String(ObjString { bytes, hash }));
        let slots = &self.slots;
        self.strings.set(r, hash, Value::Null, |k| Self::hash_of_slots(slots, k));
        r
    }

    fn find_interned(&self, bytes: &str, hash: u32) -> Option<ObjRef> {
        self.strings.find_by(hash, |k| {
            self.get(k).as_string().map(|s| s.bytes == bytes).unwrap_or(false)
        })
    }

    /// `makeStringf`-equivalent: intern the result of formatting.
    pub fn intern_format(&mut self, args: std::fmt::Arguments<'_>) -> ObjRef {
        self.intern_take(std::fmt::format(args))
    }

    // ---- other allocation helpers -----------------------------------------

    pub fn alloc_function(&mut self, f: Function) -> ObjRef {
        self.alloc(HeapObject::Function(f))
    }

    pub fn alloc_native(&mut self, n: Native) -> ObjRef {
        self.alloc(HeapObject::Native(n))
    }

    pub fn alloc_closure(&mut self, c: Closure) -> ObjRef {
        self.alloc(HeapObject::Closure(c))
    }

    pub fn alloc_upvalue(&mut self, u: Upvalue) -> ObjRef {
        self.alloc(HeapObject::Upvalue(u))
    }

    pub fn alloc_class(&mut self, c: Class) -> ObjRef {
        self.alloc(HeapObject::Class(c))
    }

    pub fn alloc_instance(&mut self, i: Instance) -> ObjRef {
        self.alloc(HeapObject::Instance(i))
    }

    pub fn alloc_list(&mut self, l: List) -> ObjRef {
        self.alloc(HeapObject::List(l))
    }

    pub fn alloc_bound_method(&mut self, b: BoundMethod) -> ObjRef {
        self.alloc(HeapObject::BoundMethod(b))
    }

    // ---- equality (spec.md §3) --------------------------------------------

    /// Structural on primitives and lists, identity on other object kinds.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Object(x), Value::Object(y)) => {
                match (self.get(x).as_list(), self.get(y).as_list()) {
                    (Some(lx), Some(ly)) => {
                        lx.items.len() == ly.items.len()
                            && lx
                                .items
                                .iter()
                                .zip(ly.items.iter())
                                .all(|(&i, &j)| self.values_equal(i, j))
                    }
                    _ => x == y,
                }
            }
            _ => false,
        }
    }

    // ---- garbage collection (spec.md §4.1) --------------------------------

    pub fn mark(&mut self, r: ObjRef) {
        let slot = &mut self.slots[r.0 as usize];
        if !slot.marked {
            slot.marked = true;
            self.gray.push(r);
        }
    }

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Object(r) = v {
            self.mark(r);
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark(key);
            self.mark_value(value);
        }
    }

    fn children_of(object: &HeapObject) -> Vec<Value> {
        match object {
            HeapObject::String(_) | HeapObject::Native(_) => Vec::new(),
            HeapObject::Function(f) => {
                let mut v: Vec<Value> = f.chunk.constants.clone();
                if let Some(name) = f.name {
                    v.push(Value::Object(name));
                }
                v
            }
            HeapObject::Closure(c) => {
                let mut v = vec![Value::Object(c.function)];
                v.extend(c.upvalues.iter().map(|u| Value::Object(*u)));
                v
            }
            HeapObject::Upvalue(Upvalue::Closed(value)) => vec![*value],
            HeapObject::Upvalue(Upvalue::Open(_)) => Vec::new(),
            HeapObject::Class(c) => {
                let mut v: Vec<Value> = c.methods.iter().map(|(_, v)| v).collect();
                v.extend(c.methods.iter().map(|(k, _)| Value::Object(k)));
                v.push(Value::Object(c.name));
                if let Some(sup) = c.superclass {
                    v.push(Value::Object(sup));
                }
                v
            }
            HeapObject::Instance(i) => {
                let mut v: Vec<Value> = i.fields.iter().map(|(_, v)| v).collect();
                v.extend(i.fields.iter().map(|(k, _)| Value::Object(k)));
                v.push(Value::Object(i.class));
                v
            }
            HeapObject::List(l) => l.items.clone(),
            HeapObject::BoundMethod(b) => vec![b.receiver, Value::Object(b.method)],
        }
    }

    /// Runs a full mark/weak-prune/sweep cycle. `mark_roots` is invoked
    /// first and is expected to call `mark`/`mark_value`/`mark_table` for
    /// every VM-owned root named in `spec.md` §4.1 (stack, frames, open
    /// upvalues, class registry, modules' globals/exports, method tables).
    pub fn collect(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        mark_roots(self);

        while let Some(r) = self.gray.pop() {
            let children = Self::children_of(self.get(r));
            for child in children {
                self.mark_value(child);
            }
        }

        let slots = &self.slots;
        self.strings.retain_keys(|r| slots[r.0 as usize].marked);

        let mut freed = 0usize;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_some() {
                if slot.marked {
                    slot.marked = false;
                } else {
                    let size = Self::approx_size(slot.object.as_ref().unwrap());
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                    slot.object = None;
                    self.free_list.push(i as u32);
                    freed += 1;
                }
            }
        }

        self.next_gc = ((self.bytes_allocated as f64) * self.config.growth_factor) as usize;
        self.collections_run += 1;
        tracing::debug!(freed, bytes_allocated = self.bytes_allocated, next_gc = self.next_gc, "gc collection complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Heap {
        Heap::new(GcConfig::default())
    }

    #[test]
    fn interning_is_canonical() {
        let mut h = fresh();
        let a = h.intern_copy("hello");
        let b = h.intern_copy("hello");
        assert_eq!(a, b);
        let c = h.intern_copy("world");
        assert_ne!(a, c);
    }

    #[test]
    fn take_releases_into_canonical_existing_entry() {
        let mut h = fresh();
        let a = h.intern_copy("dup");
        let b = h.intern_take("dup".to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut h = fresh();
        let dead = h.alloc_list(List::default());
        let _ = dead;
        h.collect(|_heap| {
            // no roots: everything is garbage
        });
        // slot reused on next alloc
        let next = h.alloc_list(List::default());
        assert_eq!(next, dead);
    }

    #[test]
    fn rooted_objects_survive_and_strings_stay_interned() {
        let mut h = fresh();
        let s = h.intern_copy("kept");
        h.collect(|heap| heap.mark(s));
        assert!(h.intern_copy("kept") == s);
        assert_eq!(h.get(s).as_string().unwrap().bytes, "kept");
    }

    #[test]
    fn unreachable_interned_strings_are_pruned_from_table_on_collect() {
        let mut h = fresh();
        let first = h.intern_copy("ephemeral");
        h.collect(|_heap| {});
        let second = h.intern_copy("ephemeral");
        // first slot was freed and reused; re-interning must not find a
        // stale (and now wrong) table entry.
        assert_eq!(first, second);
        assert_eq!(h.get(second).as_string().unwrap().bytes, "ephemeral");
    }

    #[test]
    fn lists_trace_their_elements() {
        let mut h = fresh();
        let inner = h.intern_copy("nested");
        let list = h.alloc_list(List {
            items: vec![Value::Object(inner)],
        });
        h.collect(|heap| heap.mark(list));
        // inner string must have survived via the list's child trace
        assert_eq!(h.get(inner).as_string().unwrap().bytes, "nested");
    }
}
