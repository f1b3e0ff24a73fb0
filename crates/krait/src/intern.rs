//! Short-string interning.
//!
//! Strings of 64 bytes or less are stored once in a process-wide pool and
//! shared by every VM, so equality between short strings is usually a pointer
//! comparison and `'a' is 'a'` holds the way embedders expect. The pool is
//! guarded by a mutex on the insertion path only; a hit clones an `Arc`.
//!
//! Longer strings are plain reference-counted allocations local to whoever
//! built them.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock};

use ahash::AHashSet;

/// Strings at or below this length are interned.
pub const INTERN_MAX_LEN: usize = 64;

static POOL: OnceLock<Mutex<AHashSet<Arc<str>>>> = OnceLock::new();

fn pool() -> &'static Mutex<AHashSet<Arc<str>>> {
    POOL.get_or_init(|| Mutex::new(AHashSet::new()))
}

/// An immutable Python string.
///
/// Cheap to clone; indexing and slicing operate on code points at the call
/// sites that need it. `Arc` rather than `Rc` so the intern pool can be
/// shared across VMs on different threads.
#[derive(Clone)]
pub struct PyStr(Arc<str>);

impl PyStr {
    /// Build a string, interning it when short enough.
    pub fn new(s: &str) -> Self {
        if s.len() <= INTERN_MAX_LEN {
            let mut pool = pool().lock().expect("intern pool poisoned");
            if let Some(existing) = pool.get(s) {
                return Self(existing.clone());
            }
            let arc: Arc<str> = Arc::from(s);
            pool.insert(arc.clone());
            Self(arc)
        } else {
            Self(Arc::from(s))
        }
    }

    /// Build from an owned string without copying when it skips the pool.
    pub fn from_string(s: String) -> Self {
        if s.len() <= INTERN_MAX_LEN {
            Self::new(&s)
        } else {
            Self(Arc::from(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length in code points, which is what Python-level `len` reports.
    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }

    /// Pointer identity, used by `is`.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for PyStr {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PyStr {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PyStr {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq for PyStr {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl Eq for PyStr {}

impl PartialEq<str> for PyStr {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl std::hash::Hash for PyStr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for PyStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PyStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl From<&str> for PyStr {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PyStr {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_share_one_allocation() {
        let a = PyStr::new("hello");
        let b = PyStr::new("hello");
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn long_strings_are_not_interned() {
        let long = "x".repeat(INTERN_MAX_LEN + 1);
        let a = PyStr::new(&long);
        let b = PyStr::new(&long);
        assert!(!a.ptr_eq(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn char_len_counts_code_points() {
        assert_eq!(PyStr::new("héllo").char_len(), 5);
    }
}
