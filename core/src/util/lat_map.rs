//! Open-addressed string-keyed hash table.
//!
//! Backs Map and Set values as well as the global table. Deleted entries leave
//! tombstones so probe chains stay intact; tombstones count against the load
//! factor and are dropped when the table is rebuilt.

use std::{
    fmt,
    hash::{BuildHasher, Hasher},
    sync::Arc,
};

use rustc_hash::FxBuildHasher;

const MIN_CAPACITY: usize = 8;

#[derive(Clone)]
enum Slot<V> {
    Empty,
    Tombstone,
    Occupied { hash: u64, key: Arc<str>, value: V },
}

/// Linear-probing map from `Arc<str>` keys to `V`.
#[derive(Clone)]
pub struct LatMap<V> {
    slots: Vec<Slot<V>>,
    len: usize,
    tombstones: usize,
}

#[inline]
fn hash_key(key: &str) -> u64 {
    let mut hasher = FxBuildHasher.build_hasher();
    hasher.write(key.as_bytes());
    hasher.write_u8(0xff);
    hasher.finish()
}

impl<V> LatMap<V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
            tombstones: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut map = Self::new();
        if capacity > 0 {
            let slots = (capacity * 4 / 3 + 1).next_power_of_two().max(MIN_CAPACITY);
            map.slots = Self::empty_slots(slots);
        }
        map
    }

    fn empty_slots(n: usize) -> Vec<Slot<V>> {
        let mut slots = Vec::with_capacity(n);
        slots.resize_with(n, || Slot::Empty);
        slots
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots currently allocated.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// Locate the slot holding `key`, if any.
    fn find(&self, key: &str, hash: u64) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied { hash: h, key: k, .. } if *h == hash && k.as_ref() == key => return Some(idx),
                _ => {}
            }
            idx = (idx + 1) & mask;
        }
        None
    }

    fn grow_if_needed(&mut self) {
        let cap = self.slots.len();
        if cap == 0 {
            self.slots = Self::empty_slots(MIN_CAPACITY);
            return;
        }
        if (self.len + self.tombstones + 1) * 4 <= cap * 3 {
            return;
        }
        // Mostly tombstones: rebuild at the same size instead of doubling.
        let new_cap = if (self.len + 1) * 2 <= cap { cap } else { cap * 2 };
        self.rebuild(new_cap);
    }

    fn rebuild(&mut self, new_cap: usize) {
        let old = std::mem::replace(&mut self.slots, Self::empty_slots(new_cap));
        self.tombstones = 0;
        let mask = new_cap - 1;
        for slot in old {
            if let Slot::Occupied { hash, key, value } = slot {
                let mut idx = (hash as usize) & mask;
                while matches!(self.slots[idx], Slot::Occupied { .. }) {
                    idx = (idx + 1) & mask;
                }
                self.slots[idx] = Slot::Occupied { hash, key, value };
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        let idx = self.find(key, hash_key(key))?;
        match &self.slots[idx] {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        let idx = self.find(key, hash_key(key))?;
        match &mut self.slots[idx] {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.find(key, hash_key(key)).is_some()
    }

    /// Insert or replace; returns the previous value for `key`.
    pub fn insert(&mut self, key: impl Into<Arc<str>>, value: V) -> Option<V> {
        let key = key.into();
        let hash = hash_key(&key);
        if let Some(idx) = self.find(&key, hash) {
            if let Slot::Occupied { value: slot, .. } = &mut self.slots[idx] {
                return Some(std::mem::replace(slot, value));
            }
        }
        self.grow_if_needed();
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        loop {
            match self.slots[idx] {
                Slot::Empty => break,
                Slot::Tombstone => {
                    self.tombstones -= 1;
                    break;
                }
                Slot::Occupied { .. } => idx = (idx + 1) & mask,
            }
        }
        self.slots[idx] = Slot::Occupied { hash, key, value };
        self.len += 1;
        None
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let idx = self.find(key, hash_key(key))?;
        match std::mem::replace(&mut self.slots[idx], Slot::Tombstone) {
            Slot::Occupied { value, .. } => {
                self.len -= 1;
                self.tombstones += 1;
                Some(value)
            }
            other => {
                self.slots[idx] = other;
                None
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.len = 0;
        self.tombstones = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &V)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied { key, value, .. } => Some((key, value)),
            _ => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Arc<str>, &mut V)> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Occupied { key, value, .. } => Some((&*key, value)),
            _ => None,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &Arc<str>> {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.iter_mut().map(|(_, v)| v)
    }
}

impl<V> Default for LatMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: PartialEq> PartialEq for LatMap<V> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().all(|(k, v)| other.get(k).is_some_and(|o| v == o))
    }
}

impl<V: fmt::Debug> fmt::Debug for LatMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Into<Arc<str>>, V> FromIterator<(K, V)> for LatMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut map = LatMap::with_capacity(iter.size_hint().0);
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}
