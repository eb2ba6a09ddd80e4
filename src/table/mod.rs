use std::mem::size_of;

use crate::object::{Handle, Value};

// ── Open-addressing hash table ───────────────────────────────────────
//
// Keys are interned string handles, so key equality is handle equality.
// Each entry caches the key's content hash, which keeps probing free of
// heap lookups. Deletion leaves a tombstone (vacated, distinct from
// empty) so probe sequences across it stay valid. `count` includes
// tombstones and is never decremented by `delete`; only a resize
// recomputes it from live entries.

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<Handle>,
    hash: u32,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry { key: None, hash: 0, value: Value::Nil };
    const TOMBSTONE_VALUE: Value = Value::Bool(true);

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value == Entry::TOMBSTONE_VALUE
    }
}

#[derive(Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries plus tombstones.
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn byte_size(&self) -> usize {
        self.entries.capacity() * size_of::<Entry>()
    }

    /// Probe index for `key`, or for the slot where it would be inserted.
    /// The first tombstone on the probe path is remembered and reused so
    /// deleted slots get recycled.
    fn find_slot(entries: &[Entry], key: Handle, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        tombstone.get_or_insert(index);
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    pub fn get(&self, key: Handle, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_slot(&self.entries, key, hash);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    /// Inserts or updates. Returns true when `key` was not present.
    pub fn set(&mut self, key: Handle, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let index = Self::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // Reusing a tombstone does not bump the count; its slot is already
        // accounted for.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry { key: Some(key), hash, value };
        is_new
    }

    /// Removes `key`, leaving a tombstone. Returns false if absent.
    pub fn delete(&mut self, key: Handle, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_slot(&self.entries, key, hash);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry {
            key: None,
            hash: 0,
            value: Entry::TOMBSTONE_VALUE,
        };
        true
    }

    /// Content-addressed lookup for the intern table: probes by `hash` and
    /// lets the caller compare the candidate's bytes.
    pub fn find_key(&self, hash: u32, mut eq: impl FnMut(Handle) -> bool) -> Option<Handle> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(k) => {
                    if entry.hash == hash && eq(k) {
                        return Some(k);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Copies every live entry of `other` into `self` (subclass method
    /// inheritance).
    pub fn extend_from(&mut self, other: &Table) {
        for (key, hash, value) in other.iter_with_hash() {
            self.set(key, hash, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    fn iter_with_hash(&self) -> impl Iterator<Item = (Handle, u32, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.hash, e.value)))
    }

    /// Weak-reference sweep hook: tombstones every key the collector left
    /// unmarked. Run between marking and the sweep so the intern table
    /// cannot resurrect dead strings.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(Handle) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    *entry = Entry {
                        key: None,
                        hash: 0,
                        value: Entry::TOMBSTONE_VALUE,
                    };
                }
            }
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; new_cap]);
        // Rehash drops tombstones; count restarts at the live-entry total.
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = Self::find_slot(&self.entries, key, entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}
