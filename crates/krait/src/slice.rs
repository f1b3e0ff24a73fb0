//! Slicing helpers shared by lists, tuples, strings, bytes, and ranges.
//!
//! Python slice semantics: negative indices count from the end, out-of-range
//! bounds clamp instead of failing, and a negative step walks backward with
//! defaults mirrored (`start` defaults to the last element, `stop` to one
//! before the beginning).

use crate::exceptions::PyExc;
use crate::value::Value;

/// Resolved, clamped slice bounds ready to drive a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceIndices {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl SliceIndices {
    /// Number of elements the slice selects.
    pub fn len(&self) -> usize {
        if self.step > 0 {
            if self.stop > self.start {
                ((self.stop - self.start + self.step - 1) / self.step) as usize
            } else {
                0
            }
        } else if self.start > self.stop {
            ((self.start - self.stop - self.step - 1) / -self.step) as usize
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve optional slice fields against a sequence length.
pub fn resolve(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<SliceIndices, PyExc> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(PyExc::value_error("slice step cannot be zero"));
    }
    let len = len as i64;

    let clamp = |idx: i64, lo: i64, hi: i64| idx.max(lo).min(hi);
    let adjust = |idx: i64| if idx < 0 { idx + len } else { idx };

    let (start, stop) = if step > 0 {
        (
            clamp(start.map_or(0, adjust), 0, len),
            clamp(stop.map_or(len, adjust), 0, len),
        )
    } else {
        (
            clamp(start.map_or(len - 1, adjust), -1, len - 1),
            clamp(stop.map_or(-1, adjust), -1, len - 1),
        )
    };

    Ok(SliceIndices { start, stop, step })
}

/// Extract the selected elements of a sequence.
pub fn take_slice(items: &[Value], idx: SliceIndices) -> Vec<Value> {
    let mut out = Vec::with_capacity(idx.len());
    let mut i = idx.start;
    if idx.step > 0 {
        while i < idx.stop {
            out.push(items[i as usize].clone());
            i += idx.step;
        }
    } else {
        while i > idx.stop {
            out.push(items[i as usize].clone());
            i += idx.step;
        }
    }
    out
}

/// `s[a:b:c]` over code points.
pub fn slice_str(s: &str, idx: SliceIndices) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(idx.len());
    let mut i = idx.start;
    if idx.step > 0 {
        while i < idx.stop {
            out.push(chars[i as usize]);
            i += idx.step;
        }
    } else {
        while i > idx.stop {
            out.push(chars[i as usize]);
            i += idx.step;
        }
    }
    out
}

pub fn slice_bytes(bytes: &[u8], idx: SliceIndices) -> Vec<u8> {
    let mut out = Vec::with_capacity(idx.len());
    let mut i = idx.start;
    if idx.step > 0 {
        while i < idx.stop {
            out.push(bytes[i as usize]);
            i += idx.step;
        }
    } else {
        while i > idx.stop {
            out.push(bytes[i as usize]);
            i += idx.step;
        }
    }
    out
}

/// Assign into `list[a:b]` (contiguous step-1 form).
pub fn assign_slice(
    items: &mut Vec<Value>,
    idx: SliceIndices,
    replacement: Vec<Value>,
) -> Result<(), PyExc> {
    if idx.step == 1 {
        let start = idx.start as usize;
        let stop = (idx.stop.max(idx.start)) as usize;
        items.splice(start..stop, replacement);
        Ok(())
    } else {
        // Extended slice assignment requires matching lengths.
        let selected = idx.len();
        if selected != replacement.len() {
            return Err(PyExc::value_error(format!(
                "attempt to assign sequence of size {} to extended slice of size {}",
                replacement.len(),
                selected
            )));
        }
        let mut i = idx.start;
        for v in replacement {
            items[i as usize] = v;
            i += idx.step;
        }
        Ok(())
    }
}

/// Delete `list[a:b:c]`.
pub fn delete_slice(items: &mut Vec<Value>, idx: SliceIndices) {
    let mut positions: Vec<usize> = Vec::with_capacity(idx.len());
    let mut i = idx.start;
    if idx.step > 0 {
        while i < idx.stop {
            positions.push(i as usize);
            i += idx.step;
        }
    } else {
        while i > idx.stop {
            positions.push(i as usize);
            i += idx.step;
        }
    }
    positions.sort_unstable();
    for p in positions.into_iter().rev() {
        items.remove(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|&i| Value::Int(i)).collect()
    }

    #[test]
    fn basic_slices() {
        let items = ints(&[0, 1, 2, 3, 4]);
        let idx = resolve(5, Some(1), Some(4), None).unwrap();
        assert_eq!(take_slice(&items, idx), ints(&[1, 2, 3]));
    }

    #[test]
    fn negative_indices_wrap() {
        let items = ints(&[0, 1, 2, 3, 4]);
        let idx = resolve(5, Some(-3), None, None).unwrap();
        assert_eq!(take_slice(&items, idx), ints(&[2, 3, 4]));
    }

    #[test]
    fn reverse_slice() {
        let items = ints(&[0, 1, 2]);
        let idx = resolve(3, None, None, Some(-1)).unwrap();
        assert_eq!(take_slice(&items, idx), ints(&[2, 1, 0]));
    }

    #[test]
    fn out_of_range_clamps() {
        let items = ints(&[0, 1]);
        let idx = resolve(2, Some(-100), Some(100), None).unwrap();
        assert_eq!(take_slice(&items, idx), ints(&[0, 1]));
    }

    #[test]
    fn zero_step_is_an_error() {
        assert!(resolve(3, None, None, Some(0)).is_err());
    }

    #[test]
    fn string_slicing_is_code_point_based() {
        let idx = resolve(5, Some(1), Some(4), None).unwrap();
        assert_eq!(slice_str("héllo", idx), "éll");
    }

    #[test]
    fn slice_assignment_replaces_range() {
        let mut items = ints(&[0, 1, 2, 3]);
        let idx = resolve(4, Some(1), Some(3), None).unwrap();
        assign_slice(&mut items, idx, ints(&[9])).unwrap();
        assert_eq!(items, ints(&[0, 9, 3]));
    }

    #[test]
    fn slice_deletion() {
        let mut items = ints(&[0, 1, 2, 3, 4]);
        let idx = resolve(5, None, None, Some(2)).unwrap();
        delete_slice(&mut items, idx);
        assert_eq!(items, ints(&[1, 3]));
    }
}
