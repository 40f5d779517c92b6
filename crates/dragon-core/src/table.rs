//! Open-addressed hash table with linear probing, used both for string
//! interning and for module globals/exports/class method tables
//! (`spec.md` §3, §4.1). Keys are interned strings (`ObjRef`); callers are
//! responsible for only ever using `ObjRef`s that point at `HeapObject::String`.

use crate::ObjRef;
use crate::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone)]
struct Entry {
    /// `None` means either a true-empty slot (probing stops here) or a
    /// tombstone (probing continues past it); `tombstone` disambiguates the
    /// two. The reference table instead overloads `value` (null key + `true`
    /// value means tombstone) — kept explicit here since `Value` isn't
    /// `Eq`-comparable the same cheap way an `ObjString*` null check is.
    key: Option<ObjRef>,
    value: Value,
    tombstone: bool,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: None,
            value: Value::Null,
            tombstone: false,
        }
    }
}

/// Open-addressed string-keyed hash table. Capacity is always zero or a
/// power of two; probing wraps with `(index + 1) & (capacity - 1)`.
#[derive(Debug, Clone)]
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Find the slot `key` belongs in: an existing entry with that key, the
    /// first tombstone seen along the probe sequence, or the first true
    /// empty slot if no tombstone was seen.
    fn find_slot(entries: &[Entry], capacity: usize, key: ObjRef, hash: u32) -> usize {
        let mut index = (hash as usize) & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None if entry.tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                None => {
                    return tombstone.unwrap_or(index);
                }
                Some(k) if k == key => {
                    return index;
                }
                _ => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn grow(&mut self, new_capacity: usize, hash_of: impl Fn(ObjRef) -> u32) {
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut new_count = 0;
        for entry in self.entries.drain(..) {
            if let Some(key) = entry.key {
                let hash = hash_of(key);
                let index = Self::find_slot(&new_entries, new_capacity, key, hash);
                new_entries[index] = Entry {
                    key: Some(key),
                    value: entry.value,
                    tombstone: false,
                };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Look up `key` (interned string `hash` precomputed by the caller, who
    /// already has the `ObjString` in hand).
    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let index = Self::find_slot(&self.entries, capacity, key, hash);
        let entry = &self.entries[index];
        if entry.key.is_some() {
            Some(entry.value)
        } else {
            None
        }
    }

    /// Returns `true` if this inserted a brand-new key (matches the
    /// reference `tableSet`'s return semantics, used by `DEFINE_GLOBAL`
    /// redefinition checks and similar call sites).
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value, hash_of: impl Fn(ObjRef) -> u32) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let new_capacity = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
            self.grow(new_capacity, &hash_of);
        }
        let capacity = self.capacity();
        let index = Self::find_slot(&self.entries, capacity, key, hash);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && !entry.tombstone {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        entry.tombstone = false;
        is_new_key
    }

    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let capacity = self.capacity();
        let index = Self::find_slot(&self.entries, capacity, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        entry.tombstone = true;
        true
    }

    /// Probe by hash with a custom equality predicate, used by string
    /// interning: before a candidate `ObjString` has an `ObjRef` of its own,
    /// lookup must compare raw bytes rather than an already-known key
    /// (`spec.md` §4.1's `copy`/`take`, grounded on the reference
    /// `tableFindString`). Stops at the first true-empty slot; tombstones
    /// are skipped, not treated as a miss.
    pub fn find_by(&self, hash: u32, same: impl Fn(ObjRef) -> bool) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.tombstone => return None,
                None => {}
                Some(k) if same(k) => return Some(k),
                _ => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Copy every live entry from `other` into `self`, used by `INHERIT` to
    /// seed a subclass's method table from its superclass.
    pub fn add_all(&mut self, other: &Table, hash_of: impl Fn(ObjRef) -> u32 + Copy) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, hash_of(key), entry.value, hash_of);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Every interned key currently live in this table. Used by the weak
    /// string-interning table during GC pruning.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !keep(key) {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                    entry.tombstone = true;
                }
            }
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(r: ObjRef) -> u32 {
        r.raw()
    }

    fn key(n: u32) -> ObjRef {
        ObjRef(n)
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut t = Table::new();
        assert!(t.set(key(1), 1, Value::Number(42.0), hash_of));
        match t.get(key(1), 1) {
            Some(Value::Number(n)) => assert_eq!(n, 42.0),
            other => panic!("expected Number(42), got {other:?}"),
        }
    }

    #[test]
    fn delete_then_lookup_misses_but_probe_continues_past_tombstone() {
        let mut t = Table::new();
        t.set(key(1), 1, Value::Number(1.0), hash_of);
        t.set(key(2), 2, Value::Number(2.0), hash_of);
        assert!(t.delete(key(1), 1));
        assert!(t.get(key(1), 1).is_none());
        assert!(t.get(key(2), 2).is_some());
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..100u32 {
            t.set(key(i), i, Value::Number(i as f64), hash_of);
        }
        assert_eq!(t.len(), 100);
        for i in 0..100u32 {
            assert!(t.get(key(i), i).is_some());
        }
    }

    #[test]
    fn add_all_copies_live_entries_only() {
        let mut src = Table::new();
        src.set(key(1), 1, Value::Number(1.0), hash_of);
        src.set(key(2), 2, Value::Number(2.0), hash_of);
        src.delete(key(2), 2);

        let mut dst = Table::new();
        dst.add_all(&src, hash_of);
        assert_eq!(dst.len(), 1);
        assert!(dst.get(key(1), 1).is_some());
        assert!(dst.get(key(2), 2).is_none());
    }
}
