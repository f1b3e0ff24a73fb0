//! Insertion-ordered hash containers.
//!
//! [`Dict`] and [`Set`] are bucketed hash tables over VM-computed hashes.
//! Each bucket holds a small vector of indices into a dense entry vector, so
//! collisions chain without pointer-heavy nodes and iteration walks the
//! entries in insertion order. Membership is decided by value equality, never
//! by pointer identity; overwriting a key keeps its original position;
//! deleting removes the entry from both structures.
//!
//! Callers compute hashes (see [`crate::py_hash`]) before touching the table:
//! hashing an instance may invoke `__hash__`, which needs the VM, and the
//! container layer stays free of that entanglement.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::value::{structural_eq, Value};

type Bucket = SmallVec<[u32; 1]>;

#[derive(Clone)]
struct DictEntry {
    hash: i64,
    key: Value,
    value: Value,
}

/// A mutable mapping preserving insertion order.
#[derive(Clone, Default)]
pub struct Dict {
    buckets: AHashMap<i64, Bucket>,
    entries: Vec<DictEntry>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buckets: AHashMap::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite. Returns the previous value for an existing key,
    /// whose position in the order is preserved.
    pub fn insert(&mut self, hash: i64, key: Value, value: Value) -> Option<Value> {
        if let Some(bucket) = self.buckets.get(&hash) {
            for &i in bucket {
                let entry = &mut self.entries[i as usize];
                if structural_eq(&entry.key, &key) {
                    return Some(std::mem::replace(&mut entry.value, value));
                }
            }
        }
        let index = self.entries.len() as u32;
        self.entries.push(DictEntry { hash, key, value });
        self.buckets.entry(hash).or_default().push(index);
        None
    }

    pub fn get_with_hash(&self, hash: i64, key: &Value) -> Option<&Value> {
        let bucket = self.buckets.get(&hash)?;
        bucket
            .iter()
            .map(|&i| &self.entries[i as usize])
            .find(|e| structural_eq(&e.key, key))
            .map(|e| &e.value)
    }

    pub fn get_mut_with_hash(&mut self, hash: i64, key: &Value) -> Option<&mut Value> {
        let bucket = self.buckets.get(&hash)?;
        let idx = bucket
            .iter()
            .copied()
            .find(|&i| structural_eq(&self.entries[i as usize].key, key))?;
        Some(&mut self.entries[idx as usize].value)
    }

    pub fn contains(&self, hash: i64, key: &Value) -> bool {
        self.get_with_hash(hash, key).is_some()
    }

    /// Remove a key, closing the gap in the insertion order.
    pub fn remove(&mut self, hash: i64, key: &Value) -> Option<Value> {
        let bucket = self.buckets.get_mut(&hash)?;
        let pos = bucket
            .iter()
            .position(|&i| structural_eq(&self.entries[i as usize].key, key))?;
        let index = bucket.remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        let entry = self.entries.remove(index as usize);
        self.shift_indices_after(index);
        Some(entry.value)
    }

    /// Remove and return the most recently inserted pair (`dict.popitem`).
    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        let entry = self.entries.last()?.clone();
        self.remove(entry.hash, &entry.key)?;
        Some((entry.key, entry.value))
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.entries.clear();
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &Value, &Value)> {
        self.entries.iter().map(|e| (e.hash, &e.key, &e.value))
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|e| e.value.clone()).collect()
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        self.entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    /// Merge `other` into `self`; colliding keys take the right-hand value.
    pub fn update(&mut self, other: &Dict) {
        for (hash, k, v) in other.iter() {
            self.insert(hash, k.clone(), v.clone());
        }
    }

    // -- String-keyed convenience used by namespace dicts -------------------

    /// Look up a string key without allocating.
    pub fn get_str(&self, name: &str) -> Option<&Value> {
        let hash = crate::py_hash::hash_str(name);
        let bucket = self.buckets.get(&hash)?;
        bucket
            .iter()
            .map(|&i| &self.entries[i as usize])
            .find(|e| e.key.as_str() == Some(name))
            .map(|e| &e.value)
    }

    pub fn insert_str(&mut self, name: &str, value: Value) {
        let hash = crate::py_hash::hash_str(name);
        self.insert(hash, Value::str(name), value);
    }

    pub fn remove_str(&mut self, name: &str) -> Option<Value> {
        let hash = crate::py_hash::hash_str(name);
        self.remove(hash, &Value::str(name))
    }

    pub fn contains_str(&self, name: &str) -> bool {
        self.get_str(name).is_some()
    }

    fn shift_indices_after(&mut self, removed: u32) {
        for bucket in self.buckets.values_mut() {
            for i in bucket.iter_mut() {
                if *i > removed {
                    *i -= 1;
                }
            }
        }
    }
}

#[derive(Clone)]
struct SetEntry {
    hash: i64,
    key: Value,
}

/// A unique collection; the same table as [`Dict`] without values. Also the
/// backing store for `frozenset` (immutably shared).
#[derive(Clone, Default)]
pub struct Set {
    buckets: AHashMap<i64, Bucket>,
    entries: Vec<SetEntry>,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an element; returns false when it was already present.
    pub fn insert(&mut self, hash: i64, key: Value) -> bool {
        if self.contains(hash, &key) {
            return false;
        }
        let index = self.entries.len() as u32;
        self.entries.push(SetEntry { hash, key });
        self.buckets.entry(hash).or_default().push(index);
        true
    }

    pub fn contains(&self, hash: i64, key: &Value) -> bool {
        self.buckets
            .get(&hash)
            .is_some_and(|bucket| {
                bucket
                    .iter()
                    .any(|&i| structural_eq(&self.entries[i as usize].key, key))
            })
    }

    pub fn remove(&mut self, hash: i64, key: &Value) -> Option<Value> {
        let bucket = self.buckets.get_mut(&hash)?;
        let pos = bucket
            .iter()
            .position(|&i| structural_eq(&self.entries[i as usize].key, key))?;
        let index = bucket.remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        let entry = self.entries.remove(index as usize);
        for bucket in self.buckets.values_mut() {
            for i in bucket.iter_mut() {
                if *i > index {
                    *i -= 1;
                }
            }
        }
        Some(entry.key)
    }

    /// Remove and return an arbitrary element (the oldest, as it happens).
    pub fn pop(&mut self) -> Option<Value> {
        let entry = self.entries.first()?.clone();
        self.remove(entry.hash, &entry.key)
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|e| &e.key)
    }

    /// Element and hash pairs, used to build derived sets without rehashing.
    pub fn iter_hashed(&self) -> impl Iterator<Item = (i64, &Value)> {
        self.entries.iter().map(|e| (e.hash, &e.key))
    }

    pub fn elem_hashes(&self) -> Vec<i64> {
        self.entries.iter().map(|e| e.hash).collect()
    }

    pub fn is_subset(&self, other: &Set) -> bool {
        self.iter_hashed().all(|(h, k)| other.contains(h, k))
    }

    /// Equality as sets: same elements regardless of insertion order.
    pub fn set_eq(&self, other: &Set) -> bool {
        self.len() == other.len() && self.is_subset(other)
    }

    pub fn union(&self, other: &Set) -> Set {
        let mut out = self.clone();
        for (h, k) in other.iter_hashed() {
            out.insert(h, k.clone());
        }
        out
    }

    pub fn intersection(&self, other: &Set) -> Set {
        let mut out = Set::new();
        for (h, k) in self.iter_hashed() {
            if other.contains(h, k) {
                out.insert(h, k.clone());
            }
        }
        out
    }

    pub fn difference(&self, other: &Set) -> Set {
        let mut out = Set::new();
        for (h, k) in self.iter_hashed() {
            if !other.contains(h, k) {
                out.insert(h, k.clone());
            }
        }
        out
    }

    pub fn symmetric_difference(&self, other: &Set) -> Set {
        let mut out = self.difference(other);
        for (h, k) in other.iter_hashed() {
            if !self.contains(h, k) {
                out.insert(h, k.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::py_hash::{hash_int, hash_str};

    fn int_key(i: i64) -> (i64, Value) {
        (hash_int(i), Value::Int(i))
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut d = Dict::new();
        d.insert_str("b", Value::Int(2));
        d.insert_str("a", Value::Int(1));
        d.insert_str("c", Value::Int(3));
        let keys: Vec<_> = d.keys().iter().filter_map(|k| k.as_str().map(str::to_owned)).collect();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn overwrite_keeps_position() {
        let mut d = Dict::new();
        d.insert_str("a", Value::Int(1));
        d.insert_str("b", Value::Int(2));
        d.insert_str("a", Value::Int(10));
        let items = d.items();
        assert_eq!(items[0].1, Value::Int(10));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn delete_closes_the_gap() {
        let mut d = Dict::new();
        for name in ["a", "b", "c", "d"] {
            d.insert_str(name, Value::str(name));
        }
        d.remove_str("b");
        let keys: Vec<_> = d.keys().iter().filter_map(|k| k.as_str().map(str::to_owned)).collect();
        assert_eq!(keys, ["a", "c", "d"]);
        assert_eq!(d.get_str("d").unwrap().as_str(), Some("d"));
    }

    #[test]
    fn lookup_is_by_value_equality() {
        let mut d = Dict::new();
        let (h, k) = int_key(1);
        d.insert(h, k, Value::str("one"));
        // 1, 1.0 and True all hash and compare equal.
        assert!(d.contains(crate::py_hash::hash_float(1.0), &Value::Float(1.0)));
        assert!(d.contains(hash_int(1), &Value::Bool(true)));
    }

    #[test]
    fn set_ops() {
        let mut a = Set::new();
        let mut b = Set::new();
        for i in [1, 2, 3] {
            let (h, k) = int_key(i);
            a.insert(h, k);
        }
        for i in [2, 3, 4] {
            let (h, k) = int_key(i);
            b.insert(h, k);
        }
        assert_eq!(a.union(&b).len(), 4);
        assert_eq!(a.intersection(&b).len(), 2);
        assert_eq!(a.difference(&b).len(), 1);
        assert_eq!(a.symmetric_difference(&b).len(), 2);
        assert!(!a.is_subset(&b));
        assert!(a.intersection(&b).is_subset(&b));
    }

    #[test]
    fn set_equality_ignores_order() {
        let mut a = Set::new();
        let mut b = Set::new();
        for i in [1, 2, 3] {
            let (h, k) = int_key(i);
            a.insert(h, k);
        }
        for i in [3, 1, 2] {
            let (h, k) = int_key(i);
            b.insert(h, k);
        }
        assert!(a.set_eq(&b));
    }

    #[test]
    fn string_keys_roundtrip() {
        let mut d = Dict::new();
        d.insert_str("name", Value::str("krait"));
        assert_eq!(d.get_str("name").unwrap().as_str(), Some("krait"));
        assert_eq!(hash_str("name"), d.iter().next().unwrap().0);
    }
}
