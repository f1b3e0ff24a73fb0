//! Operator dispatch.
//!
//! Binary operators resolve in a fixed order: bool canonicalizes to int, the
//! int fast path handles int-int pairs, instance dunders get a chance
//! (forward on the left operand, then reflected on the right when the
//! forward answer is `NotImplemented`), then the kind-specific rules (string
//! and sequence concat/repeat, dict merge, set algebra, printf-style `%`),
//! and finally the numeric promotion ladder int -> float -> complex. Anything
//! left over fails with the canonical `unsupported operand type(s)` message.

use std::cmp::Ordering;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::bytecode::{BinOp, CmpOp, UnOp};
use crate::exceptions::{PyExc, VmResult};
use crate::format::printf_format;
use crate::resource::{SEQ_REPEAT_CAP, STR_REPEAT_CAP};
use crate::value::{numeric_as_complex, structural_cmp, structural_eq, Value};
use crate::vm::Vm;

/// Entry point for the `BINARY_OP` family.
pub(crate) fn binary_op(vm: &mut Vm, op: BinOp, a: Value, b: Value) -> VmResult<Value> {
    // Fast path: machine integers (bool counts as int).
    if let (Some(x), Some(y)) = (small_int(&a), small_int(&b)) {
        if let Some(result) = int_fast_path(vm, op, x, y)? {
            return Ok(result);
        }
    }

    // Instance dunders, forward then reflected.
    if let Some(result) = try_instance_binop(vm, op, &a, &b)? {
        return Ok(result);
    }

    // Kind-specific rules.
    if let Some(result) = kind_specific(vm, op, &a, &b)? {
        return Ok(result);
    }

    // Numeric promotion ladder.
    if let Some(result) = numeric_binop(vm, op, &a, &b)? {
        return Ok(result);
    }

    Err(unsupported(op, &a, &b))
}

/// `INPLACE_OP`: try `__iadd__`-style dunders on instances, mutate lists and
/// sets in place for `+=`/`|=` and friends, then fall back to the plain
/// binary operator.
pub(crate) fn inplace_op(vm: &mut Vm, op: BinOp, a: Value, b: Value) -> VmResult<Value> {
    if matches!(a, Value::Instance(_)) {
        if let Some(m) = vm.lookup_dunder(&a, op.idunder()) {
            let result = vm.call_value(m, vec![b.clone()])?;
            if !matches!(result, Value::NotImplemented) {
                return Ok(result);
            }
        }
    }

    // `list += iterable` extends in place (and tolerates any iterable,
    // unlike `list + x`); `list *= n` repeats in place.
    if let Value::List(items) = &a {
        let items = items.clone();
        if op == BinOp::Add {
            let extra = vm.iterate_to_vec(b)?;
            let new_len = items.borrow().len() + extra.len();
            vm.check_collection(new_len)?;
            items.borrow_mut().extend(extra);
            return Ok(Value::List(items));
        }
        if op == BinOp::Mul {
            if let Some(n) = small_int(&b) {
                let snapshot = items.borrow().clone();
                let repeated = repeat_seq(vm, &snapshot, n)?;
                *items.borrow_mut() = repeated;
                return Ok(Value::List(items));
            }
        }
    }

    binary_op(vm, op, a, b)
}

/// Entry point for `UNARY_OP`.
pub(crate) fn unary_op(vm: &mut Vm, op: UnOp, v: Value) -> VmResult<Value> {
    match op {
        UnOp::Not => Ok(Value::Bool(!vm.truthy(&v)?)),
        UnOp::Neg => match &v {
            Value::Int(i) => match i.checked_neg() {
                Some(n) => Ok(Value::Int(n)),
                None => Ok(Value::from_bigint(-BigInt::from(*i))),
            },
            Value::Bool(b) => Ok(Value::Int(-i64::from(*b))),
            Value::BigInt(b) => Ok(Value::from_bigint(-(**b).clone())),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Complex { re, im } => Ok(Value::complex(-re, -im)),
            Value::Instance(_) => instance_unary(vm, v, "__neg__", "unary -"),
            _ => Err(bad_unary("-", &v)),
        },
        UnOp::Pos => match &v {
            Value::Int(_) | Value::BigInt(_) | Value::Float(_) | Value::Complex { .. } => Ok(v),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::Instance(_) => instance_unary(vm, v, "__pos__", "unary +"),
            _ => Err(bad_unary("+", &v)),
        },
        UnOp::Invert => match &v {
            Value::Int(i) => Ok(Value::Int(!i)),
            Value::Bool(b) => Ok(Value::Int(!i64::from(*b))),
            Value::BigInt(b) => Ok(Value::from_bigint(!(**b).clone())),
            Value::Instance(_) => instance_unary(vm, v, "__invert__", "unary ~"),
            _ => Err(bad_unary("~", &v)),
        },
    }
}

fn instance_unary(vm: &mut Vm, v: Value, dunder: &str, opname: &str) -> VmResult<Value> {
    match vm.lookup_dunder(&v, dunder) {
        Some(m) => vm.call_value(m, vec![]),
        None => Err(PyExc::type_error(format!(
            "bad operand type for {opname}: '{}'",
            v.type_name()
        ))
        .into()),
    }
}

fn bad_unary(sym: &str, v: &Value) -> crate::exceptions::VmError {
    PyExc::type_error(format!(
        "bad operand type for unary {sym}: '{}'",
        v.type_name()
    ))
    .into()
}

// ---------------------------------------------------------------------------
// Comparisons
// ---------------------------------------------------------------------------

/// Entry point for `COMPARE_OP`.
pub(crate) fn compare_op(vm: &mut Vm, op: CmpOp, a: Value, b: Value) -> VmResult<Value> {
    let result = match op {
        CmpOp::Is => a.is_identical(&b),
        CmpOp::IsNot => !a.is_identical(&b),
        CmpOp::Eq => py_eq(vm, &a, &b)?,
        CmpOp::Ne => !py_eq(vm, &a, &b)?,
        CmpOp::In => contains(vm, &a, &b)?,
        CmpOp::NotIn => !contains(vm, &a, &b)?,
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            return ordered_compare(vm, op, &a, &b);
        }
    };
    Ok(Value::Bool(result))
}

/// Equality with dunder dispatch: identity short-circuit, `__eq__` on either
/// instance operand, then the structural core.
pub(crate) fn py_eq(vm: &mut Vm, a: &Value, b: &Value) -> VmResult<bool> {
    if a.is_identical(b) {
        return true_unless_nan(a);
    }
    if matches!(a, Value::Instance(_)) {
        if let Some(m) = vm.lookup_dunder(a, "__eq__") {
            let r = vm.call_value(m, vec![b.clone()])?;
            if !matches!(r, Value::NotImplemented) {
                return vm.truthy(&r);
            }
        }
    }
    if matches!(b, Value::Instance(_)) {
        if let Some(m) = vm.lookup_dunder(b, "__eq__") {
            let r = vm.call_value(m, vec![a.clone()])?;
            if !matches!(r, Value::NotImplemented) {
                return vm.truthy(&r);
            }
        }
    }
    Ok(structural_eq(a, b))
}

fn true_unless_nan(a: &Value) -> VmResult<bool> {
    // `x is x` implies equal except for the NaN oddity.
    if let Value::Float(f) = a {
        return Ok(!f.is_nan());
    }
    Ok(true)
}

/// Ordered comparison with set subset semantics and instance dunders.
fn ordered_compare(vm: &mut Vm, op: CmpOp, a: &Value, b: &Value) -> VmResult<Value> {
    // Sets order by inclusion, which is a partial order, so handle them
    // before the total-order machinery.
    if let (Some(x), Some(y)) = (as_set(a), as_set(b)) {
        let result = match op {
            CmpOp::Lt => x.len() < y.len() && x.is_subset(&y),
            CmpOp::Le => x.is_subset(&y),
            CmpOp::Gt => y.len() < x.len() && y.is_subset(&x),
            CmpOp::Ge => y.is_subset(&x),
            _ => unreachable!(),
        };
        return Ok(Value::Bool(result));
    }

    if matches!(a, Value::Instance(_)) || matches!(b, Value::Instance(_)) {
        let (fwd, rev) = match op {
            CmpOp::Lt => ("__lt__", "__gt__"),
            CmpOp::Le => ("__le__", "__ge__"),
            CmpOp::Gt => ("__gt__", "__lt__"),
            CmpOp::Ge => ("__ge__", "__le__"),
            _ => unreachable!(),
        };
        if matches!(a, Value::Instance(_)) {
            if let Some(m) = vm.lookup_dunder(a, fwd) {
                let r = vm.call_value(m, vec![b.clone()])?;
                if !matches!(r, Value::NotImplemented) {
                    return Ok(r);
                }
            }
        }
        if matches!(b, Value::Instance(_)) {
            if let Some(m) = vm.lookup_dunder(b, rev) {
                let r = vm.call_value(m, vec![a.clone()])?;
                if !matches!(r, Value::NotImplemented) {
                    return Ok(r);
                }
            }
        }
        return Err(cmp_unsupported(op, a, b));
    }

    match py_cmp(vm, a, b)? {
        Some(ordering) => {
            let result = match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Ge => ordering != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        None => Err(cmp_unsupported(op, a, b)),
    }
}

/// Three-way comparison for orderable kinds, used by sorting and `min`/`max`.
/// `None` means the pair is unordered. Float NaN also reports unordered.
pub(crate) fn py_cmp(vm: &mut Vm, a: &Value, b: &Value) -> VmResult<Option<Ordering>> {
    // Sequences compare lexicographically and elements may carry dunders, so
    // walk them here rather than in the dunder-free core.
    match (a, b) {
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(Some(Ordering::Equal));
            }
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            seq_py_cmp(vm, &x, &y)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_py_cmp(vm, x, y),
        (Value::Instance(_), _) | (_, Value::Instance(_)) => {
            if py_eq(vm, a, b)? {
                return Ok(Some(Ordering::Equal));
            }
            if py_lt(vm, a, b)? {
                return Ok(Some(Ordering::Less));
            }
            if py_lt(vm, b, a)? {
                return Ok(Some(Ordering::Greater));
            }
            Ok(None)
        }
        _ => Ok(structural_cmp(a, b)),
    }
}

fn seq_py_cmp(vm: &mut Vm, a: &[Value], b: &[Value]) -> VmResult<Option<Ordering>> {
    for (x, y) in a.iter().zip(b.iter()) {
        if !py_eq(vm, x, y)? {
            return py_cmp(vm, x, y);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

/// `a < b` with dunder dispatch; the workhorse for stable sorting.
pub(crate) fn py_lt(vm: &mut Vm, a: &Value, b: &Value) -> VmResult<bool> {
    let r = ordered_compare(vm, CmpOp::Lt, a, b)?;
    vm.truthy(&r)
}

fn cmp_unsupported(op: CmpOp, a: &Value, b: &Value) -> crate::exceptions::VmError {
    PyExc::type_error(format!(
        "'{}' not supported between instances of '{}' and '{}'",
        op.symbol(),
        a.type_name(),
        b.type_name()
    ))
    .into()
}

/// `item in container`.
pub(crate) fn contains(vm: &mut Vm, item: &Value, container: &Value) -> VmResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.as_str().contains(needle.as_str())),
            _ => Err(PyExc::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                item.type_name()
            ))
            .into()),
        },
        Value::Bytes(b) => match item {
            Value::Bytes(needle) => {
                Ok(needle.is_empty()
                    || b.windows(needle.len()).any(|w| w == &needle[..]))
            }
            _ => match item.as_int() {
                Some(i) if (0..=255).contains(&i) => Ok(b.contains(&(i as u8))),
                Some(_) => Err(PyExc::value_error("byte must be in range(0, 256)").into()),
                None => Err(PyExc::type_error(
                    "a bytes-like object is required",
                )
                .into()),
            },
        },
        Value::Dict(d) => {
            let hash = vm.hash_value(item)?;
            Ok(d.borrow().contains(hash, item))
        }
        Value::Set(s) => {
            let hash = vm.hash_value(item)?;
            Ok(s.borrow().contains(hash, item))
        }
        Value::FrozenSet(s) => {
            let hash = vm.hash_value(item)?;
            Ok(s.contains(hash, item))
        }
        Value::Range(r) => match item.as_int() {
            Some(i) => Ok(r.contains(i)),
            None => Ok(false),
        },
        Value::List(items) => {
            let snapshot = items.borrow().clone();
            for v in &snapshot {
                if py_eq(vm, item, v)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Tuple(items) => {
            for v in items.iter() {
                if py_eq(vm, item, v)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Instance(_) => {
            if let Some(m) = vm.lookup_dunder(container, "__contains__") {
                let r = vm.call_value(m, vec![item.clone()])?;
                return vm.truthy(&r);
            }
            // Fall back to iteration.
            let iter = vm.get_iter(container.clone())?;
            while let Some(v) = vm.iter_next(&iter)? {
                if py_eq(vm, item, &v)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(PyExc::type_error(format!(
            "argument of type '{}' is not iterable",
            container.type_name()
        ))
        .into()),
    }
}

// ---------------------------------------------------------------------------
// Integer fast path
// ---------------------------------------------------------------------------

fn small_int(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// int op int with Python semantics: floor division rounds toward negative
/// infinity, modulo takes the divisor's sign, negative exponents promote to
/// float, and overflow promotes to big integers.
fn int_fast_path(vm: &mut Vm, op: BinOp, a: i64, b: i64) -> VmResult<Option<Value>> {
    let v = match op {
        BinOp::Add => match a.checked_add(b) {
            Some(r) => Value::Int(r),
            None => Value::from_bigint(BigInt::from(a) + BigInt::from(b)),
        },
        BinOp::Sub => match a.checked_sub(b) {
            Some(r) => Value::Int(r),
            None => Value::from_bigint(BigInt::from(a) - BigInt::from(b)),
        },
        BinOp::Mul => match a.checked_mul(b) {
            Some(r) => Value::Int(r),
            None => Value::from_bigint(BigInt::from(a) * BigInt::from(b)),
        },
        BinOp::TrueDiv => {
            if b == 0 {
                return Err(PyExc::zero_division("division by zero").into());
            }
            Value::Float(a as f64 / b as f64)
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(
                    PyExc::zero_division("integer division or modulo by zero").into()
                );
            }
            if a == i64::MIN && b == -1 {
                Value::from_bigint(-BigInt::from(a))
            } else {
                Value::Int(floor_div_i64(a, b))
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(
                    PyExc::zero_division("integer division or modulo by zero").into()
                );
            }
            // Result takes the sign of the divisor.
            let r = a % b;
            Value::Int(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
        }
        BinOp::Pow => return int_pow(vm, BigInt::from(a), b).map(Some),
        BinOp::LShift => {
            if b < 0 {
                return Err(PyExc::value_error("negative shift count").into());
            }
            if a == 0 {
                Value::Int(0)
            } else if b < 62 && a.checked_shl(b as u32).is_some_and(|r| r >> b == a) {
                Value::Int(a << b)
            } else {
                return big_shift(vm, BigInt::from(a), b as u64).map(Some);
            }
        }
        BinOp::RShift => {
            if b < 0 {
                return Err(PyExc::value_error("negative shift count").into());
            }
            // Arithmetic shift floors toward negative infinity, matching
            // Python.
            Value::Int(if b >= 63 {
                if a < 0 {
                    -1
                } else {
                    0
                }
            } else {
                a >> b
            })
        }
        BinOp::BitAnd => Value::Int(a & b),
        BinOp::BitOr => Value::Int(a | b),
        BinOp::BitXor => Value::Int(a ^ b),
        BinOp::MatMul => return Ok(None),
    };
    Ok(Some(v))
}

/// Python-style floor division for i64, without the double-correction bug:
/// `div_euclid` rounds toward negative infinity for positive divisors only.
fn floor_div_i64(a: i64, b: i64) -> i64 {
    let q = a / b;
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn int_pow(vm: &mut Vm, base: BigInt, exp: i64) -> VmResult<Value> {
    if exp < 0 {
        // Negative exponent promotes to float.
        let base = base.to_f64().unwrap_or(f64::INFINITY);
        if base == 0.0 {
            return Err(
                PyExc::zero_division("0.0 cannot be raised to a negative power").into()
            );
        }
        return Ok(Value::Float(base.powi(exp.max(-1_000_000) as i32)));
    }
    // Pre-empt absurd results before allocating them.
    let bits = base.bits().saturating_mul(exp as u64);
    if bits > 4_000_000_000 {
        return Err(PyExc::memory_error("pow() result is too large").into());
    }
    vm.charge_allocation(bits / 64 + 1)?;
    Ok(Value::from_bigint(bigint_pow(&base, exp as u64)))
}

fn bigint_pow(base: &BigInt, mut exp: u64) -> BigInt {
    let mut result = BigInt::from(1);
    let mut base = base.clone();
    while exp > 0 {
        if exp & 1 == 1 {
            result = &result * &base;
        }
        exp >>= 1;
        if exp > 0 {
            base = &base * &base;
        }
    }
    result
}

fn big_shift(vm: &mut Vm, base: BigInt, count: u64) -> VmResult<Value> {
    if base.bits().saturating_add(count) > 4_000_000_000 {
        return Err(PyExc::memory_error("shift result is too large").into());
    }
    vm.charge_allocation(count / 64 + 1)?;
    Ok(Value::from_bigint(base << count))
}

// ---------------------------------------------------------------------------
// Instance dunders
// ---------------------------------------------------------------------------

fn try_instance_binop(
    vm: &mut Vm,
    op: BinOp,
    a: &Value,
    b: &Value,
) -> VmResult<Option<Value>> {
    if matches!(a, Value::Instance(_)) {
        if let Some(m) = vm.lookup_dunder(a, op.dunder()) {
            let r = vm.call_value(m, vec![b.clone()])?;
            if !matches!(r, Value::NotImplemented) {
                return Ok(Some(r));
            }
        }
    }
    if matches!(b, Value::Instance(_)) {
        if let Some(m) = vm.lookup_dunder(b, op.rdunder()) {
            let r = vm.call_value(m, vec![a.clone()])?;
            if !matches!(r, Value::NotImplemented) {
                return Ok(Some(r));
            }
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Kind-specific rules
// ---------------------------------------------------------------------------

fn kind_specific(vm: &mut Vm, op: BinOp, a: &Value, b: &Value) -> VmResult<Option<Value>> {
    match op {
        BinOp::Add => match (a, b) {
            (Value::Str(x), Value::Str(y)) => {
                let total = x.len() + y.len();
                if total > STR_REPEAT_CAP {
                    return Err(PyExc::memory_error("string is too large").into());
                }
                vm.charge_allocation((total / 64 + 1) as u64)?;
                let mut s = String::with_capacity(total);
                s.push_str(x);
                s.push_str(y);
                Ok(Some(Value::Str(crate::intern::PyStr::from_string(s))))
            }
            (Value::Bytes(x), Value::Bytes(y)) => {
                let mut out = Vec::with_capacity(x.len() + y.len());
                out.extend_from_slice(x);
                out.extend_from_slice(y);
                Ok(Some(Value::bytes(out)))
            }
            (Value::List(x), Value::List(y)) => {
                let mut out = x.borrow().clone();
                out.extend(y.borrow().iter().cloned());
                vm.check_collection(out.len())?;
                vm.charge_allocation(out.len() as u64)?;
                Ok(Some(Value::list(out)))
            }
            (Value::Tuple(x), Value::Tuple(y)) => {
                let mut out = x.to_vec();
                out.extend(y.iter().cloned());
                vm.check_collection(out.len())?;
                vm.charge_allocation(out.len() as u64)?;
                Ok(Some(Value::tuple(out)))
            }
            _ => Ok(None),
        },
        BinOp::Mul => {
            // seq * int, in either order.
            let (seq, n) = if small_int(b).is_some() && !a.is_real_number() {
                (a, small_int(b).unwrap())
            } else if small_int(a).is_some() && !b.is_real_number() {
                (b, small_int(a).unwrap())
            } else {
                return Ok(None);
            };
            match seq {
                Value::Str(s) => {
                    let n = n.max(0) as usize;
                    if s.len().saturating_mul(n) > STR_REPEAT_CAP {
                        return Err(PyExc::memory_error("repeated string is too large").into());
                    }
                    vm.charge_allocation((s.len() * n / 64 + 1) as u64)?;
                    Ok(Some(Value::Str(crate::intern::PyStr::from_string(
                        s.repeat(n),
                    ))))
                }
                Value::Bytes(bs) => {
                    let n = n.max(0) as usize;
                    if bs.len().saturating_mul(n) > SEQ_REPEAT_CAP {
                        return Err(PyExc::memory_error("repeated bytes is too large").into());
                    }
                    Ok(Some(Value::bytes(bs.repeat(n))))
                }
                Value::List(items) => {
                    let items = items.borrow();
                    Ok(Some(Value::list(repeat_seq(vm, &items, n)?)))
                }
                Value::Tuple(items) => Ok(Some(Value::tuple(repeat_seq(vm, items, n)?))),
                _ => Ok(None),
            }
        }
        BinOp::Mod => match a {
            Value::Str(fmt) => {
                let s = printf_format(fmt, b)?;
                Ok(Some(Value::str(&s)))
            }
            _ => Ok(None),
        },
        BinOp::BitOr => match (a, b) {
            (Value::Dict(x), Value::Dict(y)) => {
                let mut out = x.borrow().clone();
                out.update(&y.borrow());
                Ok(Some(Value::Dict(Rc::new(std::cell::RefCell::new(out)))))
            }
            _ => {
                if let Some(v) = set_algebra(op, a, b) {
                    return Ok(Some(v));
                }
                // `int | str` over types builds a union.
                if is_type_like(a) && is_type_like(b) {
                    return Ok(Some(Value::Union(Rc::from(vec![a.clone(), b.clone()].into_boxed_slice()))));
                }
                if let (Value::Union(x), true) = (a, is_type_like(b)) {
                    let mut parts = x.to_vec();
                    parts.push(b.clone());
                    return Ok(Some(Value::Union(Rc::from(parts.into_boxed_slice()))));
                }
                Ok(None)
            }
        },
        BinOp::BitAnd | BinOp::BitXor | BinOp::Sub => Ok(set_algebra(op, a, b)),
        _ => Ok(None),
    }
}

fn is_type_like(v: &Value) -> bool {
    matches!(v, Value::Type(_) | Value::Class(_) | Value::ExcClass(_) | Value::Union(_))
}

/// Set algebra with frozen-typing: the result is frozen when the left
/// operand is.
fn set_algebra(op: BinOp, a: &Value, b: &Value) -> Option<Value> {
    let x = as_set(a)?;
    let y = as_set(b)?;
    let result = match op {
        BinOp::BitOr => x.union(&y),
        BinOp::BitAnd => x.intersection(&y),
        BinOp::Sub => x.difference(&y),
        BinOp::BitXor => x.symmetric_difference(&y),
        _ => return None,
    };
    Some(if matches!(a, Value::FrozenSet(_)) {
        Value::frozenset(result)
    } else {
        Value::set(result)
    })
}

fn as_set(v: &Value) -> Option<crate::dict::Set> {
    match v {
        Value::Set(s) => Some(s.borrow().clone()),
        Value::FrozenSet(s) => Some((**s).clone()),
        _ => None,
    }
}

fn repeat_seq(vm: &mut Vm, items: &[Value], n: i64) -> VmResult<Vec<Value>> {
    let n = n.max(0) as usize;
    let total = items.len().saturating_mul(n);
    if total > SEQ_REPEAT_CAP {
        return Err(PyExc::memory_error("repeated sequence is too large").into());
    }
    vm.check_collection(total)?;
    vm.charge_allocation(total as u64)?;
    let mut out = Vec::with_capacity(total);
    for _ in 0..n {
        out.extend(items.iter().cloned());
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Numeric promotion ladder
// ---------------------------------------------------------------------------

fn numeric_binop(vm: &mut Vm, op: BinOp, a: &Value, b: &Value) -> VmResult<Option<Value>> {
    // Big integers first (both big, or one big and one small int).
    if a.is_int_like() && b.is_int_like() {
        let x = to_bigint(a);
        let y = to_bigint(b);
        return big_int_binop(vm, op, x, y).map(Some);
    }

    // Real floats next.
    if a.is_real_number() && b.is_real_number() {
        let x = a.as_float().unwrap_or(f64::INFINITY);
        let y = b.as_float().unwrap_or(f64::INFINITY);
        return float_binop(op, x, y).map(Some);
    }

    // Complex last.
    if let (Some(x), Some(y)) = (numeric_as_complex(a), numeric_as_complex(b)) {
        if matches!(a, Value::Complex { .. }) || matches!(b, Value::Complex { .. }) {
            return complex_binop(op, x, y).map(Some);
        }
    }

    Ok(None)
}

fn to_bigint(v: &Value) -> BigInt {
    match v {
        Value::Int(i) => BigInt::from(*i),
        Value::Bool(b) => BigInt::from(i64::from(*b)),
        Value::BigInt(b) => (**b).clone(),
        _ => unreachable!("caller checked is_int_like"),
    }
}

fn big_int_binop(vm: &mut Vm, op: BinOp, a: BigInt, b: BigInt) -> VmResult<Value> {
    let v = match op {
        BinOp::Add => Value::from_bigint(a + b),
        BinOp::Sub => Value::from_bigint(a - b),
        BinOp::Mul => {
            vm.charge_allocation((a.bits() + b.bits()) / 64 + 1)?;
            Value::from_bigint(a * b)
        }
        BinOp::TrueDiv => {
            if b.is_zero() {
                return Err(PyExc::zero_division("division by zero").into());
            }
            let x = a.to_f64().unwrap_or(f64::INFINITY);
            let y = b.to_f64().unwrap_or(f64::INFINITY);
            Value::Float(x / y)
        }
        BinOp::FloorDiv => {
            if b.is_zero() {
                return Err(
                    PyExc::zero_division("integer division or modulo by zero").into()
                );
            }
            let (q, r) = num_integer_div_mod_floor(&a, &b);
            let _ = r;
            Value::from_bigint(q)
        }
        BinOp::Mod => {
            if b.is_zero() {
                return Err(
                    PyExc::zero_division("integer division or modulo by zero").into()
                );
            }
            let (_, r) = num_integer_div_mod_floor(&a, &b);
            Value::from_bigint(r)
        }
        BinOp::Pow => {
            let exp = match b.to_i64() {
                Some(e) => e,
                None => {
                    return Err(PyExc::memory_error("pow() exponent is too large").into());
                }
            };
            return int_pow(vm, a, exp);
        }
        BinOp::LShift => {
            let count = match b.to_i64() {
                Some(c) if c >= 0 => c as u64,
                Some(_) => return Err(PyExc::value_error("negative shift count").into()),
                None => return Err(PyExc::memory_error("shift count is too large").into()),
            };
            return big_shift(vm, a, count);
        }
        BinOp::RShift => {
            let count = match b.to_i64() {
                Some(c) if c >= 0 => c as u64,
                Some(_) => return Err(PyExc::value_error("negative shift count").into()),
                None => {
                    return Ok(Value::Int(if a.is_negative() { -1 } else { 0 }));
                }
            };
            Value::from_bigint(a >> count)
        }
        BinOp::BitAnd => Value::from_bigint(a & b),
        BinOp::BitOr => Value::from_bigint(a | b),
        BinOp::BitXor => Value::from_bigint(a ^ b),
        BinOp::MatMul => {
            return Err(PyExc::type_error(
                "unsupported operand type(s) for @: 'int' and 'int'",
            )
            .into());
        }
    };
    Ok(v)
}

/// Floored division and matching-sign remainder for big integers.
fn num_integer_div_mod_floor(a: &BigInt, b: &BigInt) -> (BigInt, BigInt) {
    use num_integer::Integer;
    a.div_mod_floor(b)
}

fn float_binop(op: BinOp, a: f64, b: f64) -> VmResult<Value> {
    let v = match op {
        BinOp::Add => Value::Float(a + b),
        BinOp::Sub => Value::Float(a - b),
        BinOp::Mul => Value::Float(a * b),
        BinOp::TrueDiv => {
            if b == 0.0 {
                return Err(PyExc::zero_division("float division by zero").into());
            }
            Value::Float(a / b)
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(PyExc::zero_division("float floor division by zero").into());
            }
            Value::Float((a / b).floor())
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(PyExc::zero_division("float modulo").into());
            }
            // Sign follows the divisor.
            let r = a % b;
            Value::Float(if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r + b
            } else {
                r
            })
        }
        BinOp::Pow => {
            if a < 0.0 && b.fract() != 0.0 {
                // Negative base with a fractional exponent lands in the
                // complex plane.
                return complex_binop(BinOp::Pow, (a, 0.0), (b, 0.0));
            }
            Value::Float(a.powf(b))
        }
        _ => {
            return Err(PyExc::type_error(format!(
                "unsupported operand type(s) for {}: 'float' and 'float'",
                op.symbol()
            ))
            .into());
        }
    };
    Ok(v)
}

fn complex_binop(op: BinOp, a: (f64, f64), b: (f64, f64)) -> VmResult<Value> {
    let (ar, ai) = a;
    let (br, bi) = b;
    let v = match op {
        BinOp::Add => Value::complex(ar + br, ai + bi),
        BinOp::Sub => Value::complex(ar - br, ai - bi),
        BinOp::Mul => Value::complex(ar * br - ai * bi, ar * bi + ai * br),
        BinOp::TrueDiv => {
            let denom = br * br + bi * bi;
            if denom == 0.0 {
                return Err(PyExc::zero_division("complex division by zero").into());
            }
            Value::complex((ar * br + ai * bi) / denom, (ai * br - ar * bi) / denom)
        }
        BinOp::Pow => {
            // z ** w = exp(w * ln z)
            if ar == 0.0 && ai == 0.0 {
                if br == 0.0 && bi == 0.0 {
                    return Ok(Value::complex(1.0, 0.0));
                }
                if br > 0.0 {
                    return Ok(Value::complex(0.0, 0.0));
                }
                return Err(PyExc::zero_division(
                    "0.0 to a negative or complex power",
                )
                .into());
            }
            let modulus = (ar * ar + ai * ai).sqrt();
            let arg = ai.atan2(ar);
            let ln_r = modulus.ln();
            let new_ln_r = br * ln_r - bi * arg;
            let new_arg = bi * ln_r + br * arg;
            let new_mod = new_ln_r.exp();
            Value::complex(new_mod * new_arg.cos(), new_mod * new_arg.sin())
        }
        BinOp::FloorDiv | BinOp::Mod => {
            return Err(PyExc::type_error(format!(
                "unsupported operand type(s) for {}: 'complex' and 'complex'",
                op.symbol()
            ))
            .into());
        }
        _ => {
            return Err(PyExc::type_error(format!(
                "unsupported operand type(s) for {}: 'complex' and 'complex'",
                op.symbol()
            ))
            .into());
        }
    };
    Ok(v)
}

fn unsupported(op: BinOp, a: &Value, b: &Value) -> crate::exceptions::VmError {
    PyExc::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        a.type_name(),
        b.type_name()
    ))
    .into()
}
