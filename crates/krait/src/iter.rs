//! Iterator objects and suspended generator state.
//!
//! A [`PyIter`] is a cursor over a finite sequence, or one of the lazy
//! combinators (`map`, `filter`, `zip`, `enumerate`) that pull from inner
//! iterators on demand. Iterators are non-restartable: `iter(it) is it`.
//!
//! Advancing an iterator may run Python code (a `map` function, a generator
//! frame), so the advance itself lives on the VM (`Vm::iter_next`); this
//! module only owns the state.

use crate::frame::Frame;
use crate::intern::PyStr;
use crate::value::Value;

/// State of a builtin iterator value.
pub struct PyIter {
    pub(crate) kind: IterKind,
}

pub(crate) enum IterKind {
    /// Snapshot cursor over materialized items (list, tuple, str, bytes,
    /// dict keys, set, reversed, ...).
    Seq { items: Vec<Value>, index: usize },
    /// Lazy arithmetic cursor; ranges can be huge, so they never materialize.
    Range { current: i64, stop: i64, step: i64 },
    /// `map(func, *iterables)`.
    Map { func: Value, iters: Vec<Value> },
    /// `filter(func_or_none, iterable)`.
    Filter { func: Value, iter: Value },
    /// `zip(*iterables)`: stops with the shortest input.
    Zip { iters: Vec<Value> },
    /// `enumerate(iterable, start)`.
    Enumerate { iter: Value, index: i64 },
}

impl PyIter {
    pub fn from_items(items: Vec<Value>) -> Self {
        Self {
            kind: IterKind::Seq { items, index: 0 },
        }
    }

    pub fn from_range(start: i64, stop: i64, step: i64) -> Self {
        Self {
            kind: IterKind::Range {
                current: start,
                stop,
                step,
            },
        }
    }

    pub fn map(func: Value, iters: Vec<Value>) -> Self {
        Self {
            kind: IterKind::Map { func, iters },
        }
    }

    pub fn filter(func: Value, iter: Value) -> Self {
        Self {
            kind: IterKind::Filter { func, iter },
        }
    }

    pub fn zip(iters: Vec<Value>) -> Self {
        Self {
            kind: IterKind::Zip { iters },
        }
    }

    pub fn enumerate(iter: Value, start: i64) -> Self {
        Self {
            kind: IterKind::Enumerate { iter, index: start },
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            IterKind::Seq { .. } => "iterator",
            IterKind::Range { .. } => "range_iterator",
            IterKind::Map { .. } => "map",
            IterKind::Filter { .. } => "filter",
            IterKind::Zip { .. } => "zip",
            IterKind::Enumerate { .. } => "enumerate",
        }
    }

    /// Advance the dunder-free kinds. Returns `Err(())` for combinator kinds
    /// that need the VM to call back into Python code.
    pub(crate) fn next_simple(&mut self) -> Result<Option<Value>, ()> {
        match &mut self.kind {
            IterKind::Seq { items, index } => {
                if *index < items.len() {
                    let v = items[*index].clone();
                    *index += 1;
                    Ok(Some(v))
                } else {
                    Ok(None)
                }
            }
            IterKind::Range { current, stop, step } => {
                let more = if *step > 0 {
                    *current < *stop
                } else {
                    *current > *stop
                };
                if more {
                    let v = *current;
                    *current += *step;
                    Ok(Some(Value::Int(v)))
                } else {
                    Ok(None)
                }
            }
            _ => Err(()),
        }
    }
}

/// Generator lifecycle. Transitions are monotonic:
/// `Created -> Suspended <-> Running -> Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    Created,
    Running,
    Suspended,
    Done,
}

/// A generator (or coroutine): a suspended frame plus lifecycle state.
///
/// The frame is taken out while running and put back on suspension, which
/// also guards against reentrant resumption.
pub struct Generator {
    pub name: PyStr,
    pub state: GenState,
    pub frame: Option<Frame>,
    pub is_coroutine: bool,
}

impl Generator {
    pub fn new(name: PyStr, frame: Frame, is_coroutine: bool) -> Self {
        Self {
            name,
            state: GenState::Created,
            frame: Some(frame),
            is_coroutine,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == GenState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_iterator_is_exhausted_once() {
        let mut it = PyIter::from_items(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(it.next_simple().unwrap(), Some(Value::Int(1)));
        assert_eq!(it.next_simple().unwrap(), Some(Value::Int(2)));
        assert_eq!(it.next_simple().unwrap(), None);
        assert_eq!(it.next_simple().unwrap(), None);
    }

    #[test]
    fn range_iterator_counts_down() {
        let mut it = PyIter::from_range(3, 0, -1);
        let mut seen = Vec::new();
        while let Some(v) = it.next_simple().unwrap() {
            seen.push(v);
        }
        assert_eq!(seen, vec![Value::Int(3), Value::Int(2), Value::Int(1)]);
    }
}
