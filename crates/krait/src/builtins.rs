//! Builtin functions and the callable type objects.
//!
//! Builtins are an enum dispatched by a single `match` rather than boxed
//! closures: they are cheap to copy into the builtins namespace and the
//! dispatch point gets the VM handle it needs for re-entry (`sorted(key=…)`,
//! `map`, `print`). Type objects (`int`, `list`, `type`, ...) are callable
//! values handled by [`call_type`].

use std::cell::RefCell;
use std::rc::Rc;

use num_traits::ToPrimitive;

use crate::dict::{Dict, Set};
use crate::exceptions::{ExcType, PyExc, VmError, VmResult};
use crate::format::{ascii_repr, format_spec, plain_repr};
use crate::intern::PyStr;
use crate::iter::PyIter;
use crate::methods::sort_values;
use crate::object::{class_name_of, mro_contains, mro_of, same_class, Property};
use crate::operators::py_lt;
use crate::value::{PyType, Value};
use crate::vm::Vm;

/// The interpreter's builtin functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Abs,
    Min,
    Max,
    Sum,
    Sorted,
    Map,
    Filter,
    Zip,
    Enumerate,
    Reversed,
    Iter,
    Next,
    Hash,
    Isinstance,
    Issubclass,
    Callable,
    Dir,
    Getattr,
    Setattr,
    Delattr,
    Hasattr,
    Hex,
    Oct,
    Bin,
    Chr,
    Ord,
    Repr,
    Ascii,
    Format,
    Pow,
    Divmod,
    Round,
    Any,
    All,
    Id,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Len => "len",
            Self::Abs => "abs",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Sorted => "sorted",
            Self::Map => "map",
            Self::Filter => "filter",
            Self::Zip => "zip",
            Self::Enumerate => "enumerate",
            Self::Reversed => "reversed",
            Self::Iter => "iter",
            Self::Next => "next",
            Self::Hash => "hash",
            Self::Isinstance => "isinstance",
            Self::Issubclass => "issubclass",
            Self::Callable => "callable",
            Self::Dir => "dir",
            Self::Getattr => "getattr",
            Self::Setattr => "setattr",
            Self::Delattr => "delattr",
            Self::Hasattr => "hasattr",
            Self::Hex => "hex",
            Self::Oct => "oct",
            Self::Bin => "bin",
            Self::Chr => "chr",
            Self::Ord => "ord",
            Self::Repr => "repr",
            Self::Ascii => "ascii",
            Self::Format => "format",
            Self::Pow => "pow",
            Self::Divmod => "divmod",
            Self::Round => "round",
            Self::Any => "any",
            Self::All => "all",
            Self::Id => "id",
        }
    }

    /// Every builtin, for populating the builtins namespace.
    pub fn all() -> &'static [Builtin] {
        use Builtin::*;
        &[
            Print, Len, Abs, Min, Max, Sum, Sorted, Map, Filter, Zip, Enumerate,
            Reversed, Iter, Next, Hash, Isinstance, Issubclass, Callable, Dir, Getattr,
            Setattr, Delattr, Hasattr, Hex, Oct, Bin, Chr, Ord, Repr, Ascii, Format,
            Pow, Divmod, Round, Any, All, Id,
        ]
    }
}

/// Populate a builtins dict with functions, type objects, singletons, and
/// the exception classes.
pub(crate) fn install(dict: &mut Dict) {
    for &b in Builtin::all() {
        dict.insert_str(b.name(), Value::Builtin(b));
    }
    for (name, t) in [
        ("object", PyType::Object),
        ("type", PyType::Type),
        ("bool", PyType::Bool),
        ("int", PyType::Int),
        ("float", PyType::Float),
        ("complex", PyType::Complex),
        ("str", PyType::Str),
        ("bytes", PyType::Bytes),
        ("list", PyType::List),
        ("tuple", PyType::Tuple),
        ("dict", PyType::Dict),
        ("set", PyType::Set),
        ("frozenset", PyType::FrozenSet),
        ("range", PyType::Range),
        ("slice", PyType::Slice),
        ("property", PyType::Property),
        ("classmethod", PyType::ClassMethod),
        ("staticmethod", PyType::StaticMethod),
    ] {
        dict.insert_str(name, Value::Type(t));
    }
    for ty in [
        ExcType::BaseException,
        ExcType::Exception,
        ExcType::ArithmeticError,
        ExcType::ZeroDivisionError,
        ExcType::OverflowError,
        ExcType::FloatingPointError,
        ExcType::LookupError,
        ExcType::KeyError,
        ExcType::IndexError,
        ExcType::TypeError,
        ExcType::ValueError,
        ExcType::AttributeError,
        ExcType::NameError,
        ExcType::UnboundLocalError,
        ExcType::ImportError,
        ExcType::ModuleNotFoundError,
        ExcType::OsError,
        ExcType::FileNotFoundError,
        ExcType::FileExistsError,
        ExcType::PermissionError,
        ExcType::RuntimeError,
        ExcType::RecursionError,
        ExcType::NotImplementedError,
        ExcType::AssertionError,
        ExcType::MemoryError,
        ExcType::StopIteration,
        ExcType::GeneratorExit,
        ExcType::SyntaxError,
        ExcType::BaseExceptionGroup,
        ExcType::ExceptionGroup,
    ] {
        dict.insert_str(ty.name(), Value::ExcClass(ty));
    }
    dict.insert_str("IOError", Value::ExcClass(ExcType::OsError));
    dict.insert_str("None", Value::None);
    dict.insert_str("True", Value::Bool(true));
    dict.insert_str("False", Value::Bool(false));
    dict.insert_str("NotImplemented", Value::NotImplemented);
}

fn arity(name: &str, args: &[Value], n: usize) -> VmResult<()> {
    if args.len() == n {
        Ok(())
    } else {
        Err(PyExc::type_error(format!(
            "{name}() takes exactly {n} argument{} ({} given)",
            if n == 1 { "" } else { "s" },
            args.len()
        ))
        .into())
    }
}

/// Dispatch a builtin call.
pub(crate) fn call_builtin(
    vm: &mut Vm,
    b: Builtin,
    mut args: Vec<Value>,
    kwargs: Vec<(PyStr, Value)>,
) -> VmResult<Value> {
    match b {
        Builtin::Print => {
            let mut sep = " ".to_string();
            let mut end = "\n".to_string();
            for (k, v) in &kwargs {
                match k.as_str() {
                    "sep" => {
                        sep = match v {
                            Value::None => " ".into(),
                            v => vm.py_str(v)?,
                        }
                    }
                    "end" => {
                        end = match v {
                            Value::None => "\n".into(),
                            v => vm.py_str(v)?,
                        }
                    }
                    "file" | "flush" => {}
                    other => {
                        return Err(PyExc::type_error(format!(
                            "'{other}' is an invalid keyword argument for print()"
                        ))
                        .into());
                    }
                }
            }
            let mut line = String::new();
            for (i, v) in args.iter().enumerate() {
                if i > 0 {
                    line.push_str(&sep);
                }
                line.push_str(&vm.py_str(v)?);
            }
            line.push_str(&end);
            vm.write_output(&line);
            Ok(Value::None)
        }
        Builtin::Len => {
            arity("len", &args, 1)?;
            vm.py_len(&args[0]).map(Value::Int)
        }
        Builtin::Abs => {
            arity("abs", &args, 1)?;
            match &args[0] {
                Value::Int(i) => Ok(match i.checked_abs() {
                    Some(a) => Value::Int(a),
                    None => Value::from_bigint(-num_bigint::BigInt::from(*i)),
                }),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::BigInt(b) => {
                    Ok(Value::from_bigint(num_traits::Signed::abs(&**b)))
                }
                Value::Float(f) => Ok(Value::Float(f.abs())),
                Value::Complex { re, im } => Ok(Value::Float(re.hypot(*im))),
                v @ Value::Instance(_) => match vm.lookup_dunder(v, "__abs__") {
                    Some(m) => vm.call_value(m, vec![]),
                    None => Err(PyExc::type_error(format!(
                        "bad operand type for abs(): '{}'",
                        v.type_name()
                    ))
                    .into()),
                },
                v => Err(PyExc::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    v.type_name()
                ))
                .into()),
            }
        }
        Builtin::Min | Builtin::Max => min_max(vm, b, args, kwargs),
        Builtin::Sum => {
            let iterable = args
                .first()
                .cloned()
                .ok_or_else(|| VmError::from(PyExc::type_error("sum() expected an iterable")))?;
            let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(PyExc::type_error(
                    "sum() can't sum strings [use ''.join(seq) instead]",
                )
                .into());
            }
            let items = vm.iterate_to_vec(iterable)?;
            for v in items {
                total = crate::operators::binary_op(
                    vm,
                    crate::bytecode::BinOp::Add,
                    total,
                    v,
                )?;
            }
            Ok(total)
        }
        Builtin::Sorted => {
            let iterable = args
                .first()
                .cloned()
                .ok_or_else(|| VmError::from(PyExc::type_error("sorted expected 1 argument, got 0")))?;
            let mut key = Value::None;
            let mut reverse = false;
            for (k, v) in kwargs {
                match k.as_str() {
                    "key" => key = v,
                    "reverse" => reverse = vm.truthy(&v)?,
                    other => {
                        return Err(PyExc::type_error(format!(
                            "'{other}' is an invalid keyword argument for sorted()"
                        ))
                        .into());
                    }
                }
            }
            let items = vm.iterate_to_vec(iterable)?;
            sort_values(vm, items, key, reverse).map(Value::list)
        }
        Builtin::Map => {
            if args.len() < 2 {
                return Err(PyExc::type_error("map() must have at least two arguments.").into());
            }
            let func = args.remove(0);
            let iters = args
                .into_iter()
                .map(|a| vm.get_iter(a))
                .collect::<VmResult<Vec<_>>>()?;
            Ok(Value::Iter(Rc::new(RefCell::new(PyIter::map(func, iters)))))
        }
        Builtin::Filter => {
            arity("filter", &args, 2)?;
            let iter = vm.get_iter(args.pop().unwrap())?;
            let func = args.pop().unwrap();
            Ok(Value::Iter(Rc::new(RefCell::new(PyIter::filter(func, iter)))))
        }
        Builtin::Zip => {
            let iters = args
                .into_iter()
                .map(|a| vm.get_iter(a))
                .collect::<VmResult<Vec<_>>>()?;
            Ok(Value::Iter(Rc::new(RefCell::new(PyIter::zip(iters)))))
        }
        Builtin::Enumerate => {
            let iterable = args
                .first()
                .cloned()
                .ok_or_else(|| VmError::from(PyExc::type_error("enumerate() missing required argument")))?;
            let start = match args.get(1).or_else(|| {
                kwargs
                    .iter()
                    .find(|(k, _)| k.as_str() == "start")
                    .map(|(_, v)| v)
            }) {
                Some(v) => v.as_int().ok_or_else(|| {
                    VmError::from(PyExc::type_error(
                        "'start' must be an integer",
                    ))
                })?,
                None => 0,
            };
            let iter = vm.get_iter(iterable)?;
            Ok(Value::Iter(Rc::new(RefCell::new(PyIter::enumerate(iter, start)))))
        }
        Builtin::Reversed => {
            arity("reversed", &args, 1)?;
            let v = args.pop().unwrap();
            if let Value::Instance(_) = &v {
                if let Some(m) = vm.lookup_dunder(&v, "__reversed__") {
                    return vm.call_value(m, vec![]);
                }
            }
            let mut items = match &v {
                Value::List(l) => l.borrow().clone(),
                Value::Tuple(t) => t.to_vec(),
                Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
                Value::Range(r) => {
                    let mut out = Vec::with_capacity(r.len().max(0) as usize);
                    let mut i = 0;
                    while let Some(x) = r.get(i) {
                        out.push(Value::Int(x));
                        i += 1;
                    }
                    out
                }
                other => {
                    return Err(PyExc::type_error(format!(
                        "'{}' object is not reversible",
                        other.type_name()
                    ))
                    .into());
                }
            };
            items.reverse();
            Ok(vm.new_iter_value(items))
        }
        Builtin::Iter => {
            arity("iter", &args, 1)?;
            vm.get_iter(args.pop().unwrap())
        }
        Builtin::Next => {
            if args.is_empty() || args.len() > 2 {
                return Err(PyExc::type_error("next expected 1 or 2 arguments").into());
            }
            let default = args.get(1).cloned();
            let it = args[0].clone();
            match vm.iter_next(&it) {
                Ok(Some(v)) => Ok(v),
                Ok(None) => match default {
                    Some(d) => Ok(d),
                    None => Err(PyExc::stop_iteration(None).into()),
                },
                // A generator's return value travels in StopIteration; the
                // default still wins when one was supplied.
                Err(VmError::Exc(e)) if crate::vm::is_stop_iteration(&e) => match default {
                    Some(d) => Ok(d),
                    None => Err(VmError::Exc(e)),
                },
                Err(e) => Err(e),
            }
        }
        Builtin::Hash => {
            arity("hash", &args, 1)?;
            vm.hash_value(&args[0]).map(Value::Int)
        }
        Builtin::Isinstance => {
            arity("isinstance", &args, 2)?;
            isinstance_check(vm, &args[0], &args[1]).map(Value::Bool)
        }
        Builtin::Issubclass => {
            arity("issubclass", &args, 2)?;
            issubclass_check(vm, &args[0], &args[1]).map(Value::Bool)
        }
        Builtin::Callable => {
            arity("callable", &args, 1)?;
            let c = match &args[0] {
                Value::Function(_)
                | Value::Native(_)
                | Value::Builtin(_)
                | Value::BoundMethod(_)
                | Value::Type(_)
                | Value::ExcClass(_)
                | Value::Class(_) => true,
                v @ Value::Instance(_) => vm.lookup_dunder(v, "__call__").is_some(),
                _ => false,
            };
            Ok(Value::Bool(c))
        }
        Builtin::Dir => match args.len() {
            0 => {
                let mut names = vm.visible_names();
                names.sort();
                names.dedup();
                Ok(Value::list(names.into_iter().map(Value::str).collect()))
            }
            1 => {
                let names = crate::attr::dir_names(vm, &args[0])?;
                Ok(Value::list(names.into_iter().map(Value::str).collect()))
            }
            _ => Err(PyExc::type_error("dir expected at most 1 argument").into()),
        },
        Builtin::Getattr => {
            if args.len() < 2 || args.len() > 3 {
                return Err(PyExc::type_error("getattr expected 2 or 3 arguments").into());
            }
            let name = match &args[1] {
                Value::Str(s) => s.clone(),
                _ => {
                    return Err(PyExc::type_error(
                        "attribute name must be string",
                    )
                    .into());
                }
            };
            match crate::attr::get_attr(vm, &args[0], &name) {
                Ok(v) => Ok(v),
                Err(VmError::Exc(e)) if is_attribute_error(&e) => match args.get(2) {
                    Some(default) => Ok(default.clone()),
                    None => Err(VmError::Exc(e)),
                },
                Err(e) => Err(e),
            }
        }
        Builtin::Setattr => {
            arity("setattr", &args, 3)?;
            let name = args[1]
                .as_str()
                .ok_or_else(|| {
                    VmError::from(PyExc::type_error("attribute name must be string"))
                })?
                .to_owned();
            crate::attr::set_attr(vm, &args[0], &name, args[2].clone())?;
            Ok(Value::None)
        }
        Builtin::Delattr => {
            arity("delattr", &args, 2)?;
            let name = args[1]
                .as_str()
                .ok_or_else(|| {
                    VmError::from(PyExc::type_error("attribute name must be string"))
                })?
                .to_owned();
            crate::attr::del_attr(vm, &args[0], &name)?;
            Ok(Value::None)
        }
        Builtin::Hasattr => {
            arity("hasattr", &args, 2)?;
            let name = args[1]
                .as_str()
                .ok_or_else(|| {
                    VmError::from(PyExc::type_error("attribute name must be string"))
                })?
                .to_owned();
            match crate::attr::get_attr(vm, &args[0], &name) {
                Ok(_) => Ok(Value::Bool(true)),
                Err(VmError::Exc(e)) if is_attribute_error(&e) => Ok(Value::Bool(false)),
                Err(e) => Err(e),
            }
        }
        Builtin::Hex | Builtin::Oct | Builtin::Bin => {
            arity(b.name(), &args, 1)?;
            radix_repr(b, &args[0])
        }
        Builtin::Chr => {
            arity("chr", &args, 1)?;
            let i = args[0].as_int().ok_or_else(|| {
                VmError::from(PyExc::type_error("an integer is required"))
            })?;
            let c = u32::try_from(i)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| {
                    VmError::from(PyExc::value_error("chr() arg not in range(0x110000)"))
                })?;
            Ok(Value::str(c.to_string()))
        }
        Builtin::Ord => {
            arity("ord", &args, 1)?;
            match &args[0] {
                Value::Str(s) => {
                    let mut chars = s.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => Ok(Value::Int(c as i64)),
                        _ => Err(PyExc::type_error(format!(
                            "ord() expected a character, but string of length {} found",
                            s.char_len()
                        ))
                        .into()),
                    }
                }
                Value::Bytes(bs) if bs.len() == 1 => Ok(Value::Int(i64::from(bs[0]))),
                other => Err(PyExc::type_error(format!(
                    "ord() expected string of length 1, but {} found",
                    other.type_name()
                ))
                .into()),
            }
        }
        Builtin::Repr => {
            arity("repr", &args, 1)?;
            vm.py_repr(&args[0]).map(Value::str)
        }
        Builtin::Ascii => {
            arity("ascii", &args, 1)?;
            Ok(Value::str(ascii_repr(&args[0])))
        }
        Builtin::Format => {
            if args.is_empty() || args.len() > 2 {
                return Err(PyExc::type_error("format expected 1 or 2 arguments").into());
            }
            let spec = match args.get(1) {
                Some(Value::Str(s)) => s.to_string(),
                Some(other) => {
                    return Err(PyExc::type_error(format!(
                        "format_spec must be a str, not {}",
                        other.type_name()
                    ))
                    .into());
                }
                None => String::new(),
            };
            if let Value::Instance(_) = &args[0] {
                if let Some(m) = vm.lookup_dunder(&args[0], "__format__") {
                    return vm.call_value(m, vec![Value::str(&spec)]);
                }
            }
            if spec.is_empty() {
                return vm.py_str(&args[0]).map(Value::str);
            }
            Ok(Value::str(format_spec(&args[0], &spec)?))
        }
        Builtin::Pow => {
            if args.len() == 2 {
                let exp = args.pop().unwrap();
                let base = args.pop().unwrap();
                return crate::operators::binary_op(
                    vm,
                    crate::bytecode::BinOp::Pow,
                    base,
                    exp,
                );
            }
            arity("pow", &args, 3)?;
            let modulus = args[2].as_int().ok_or_else(|| {
                VmError::from(PyExc::type_error(
                    "pow() 3rd argument not allowed unless all arguments are integers",
                ))
            })?;
            let base = args[0].as_int().ok_or_else(|| {
                VmError::from(PyExc::type_error(
                    "pow() 3rd argument not allowed unless all arguments are integers",
                ))
            })?;
            let exp = args[1].as_int().ok_or_else(|| {
                VmError::from(PyExc::type_error(
                    "pow() 3rd argument not allowed unless all arguments are integers",
                ))
            })?;
            if modulus == 0 {
                return Err(PyExc::value_error("pow() 3rd argument cannot be 0").into());
            }
            if exp < 0 {
                return Err(PyExc::value_error(
                    "pow() 2nd argument cannot be negative when 3rd argument specified",
                )
                .into());
            }
            Ok(Value::Int(mod_pow(base, exp, modulus)))
        }
        Builtin::Divmod => {
            arity("divmod", &args, 2)?;
            let b = args.pop().unwrap();
            let a = args.pop().unwrap();
            let q = crate::operators::binary_op(
                vm,
                crate::bytecode::BinOp::FloorDiv,
                a.clone(),
                b.clone(),
            )?;
            let r = crate::operators::binary_op(vm, crate::bytecode::BinOp::Mod, a, b)?;
            Ok(Value::tuple(vec![q, r]))
        }
        Builtin::Round => {
            if args.is_empty() || args.len() > 2 {
                return Err(PyExc::type_error("round expected 1 or 2 arguments").into());
            }
            let ndigits = match args.get(1) {
                None | Some(Value::None) => None,
                Some(v) => Some(v.as_int().ok_or_else(|| {
                    VmError::from(PyExc::type_error(
                        "'ndigits' must be an integer",
                    ))
                })?),
            };
            round_value(&args[0], ndigits)
        }
        Builtin::Any | Builtin::All => {
            arity(b.name(), &args, 1)?;
            let iter = vm.get_iter(args.pop().unwrap())?;
            while let Some(v) = vm.iter_next(&iter)? {
                let t = vm.truthy(&v)?;
                if t && b == Builtin::Any {
                    return Ok(Value::Bool(true));
                }
                if !t && b == Builtin::All {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(b == Builtin::All))
        }
        Builtin::Id => {
            arity("id", &args, 1)?;
            let id = args[0].heap_id();
            // Immediates get a synthetic id from their bits.
            Ok(Value::Int(if id != 0 {
                id as i64
            } else {
                crate::py_hash::hash_str(&plain_repr(&args[0]))
            }))
        }
    }
}

fn is_attribute_error(e: &Value) -> bool {
    match e {
        Value::Exception(exc) => crate::exceptions::match_class(
            &exc.borrow().class,
            &Value::ExcClass(ExcType::AttributeError),
        ),
        _ => false,
    }
}

fn radix_repr(b: Builtin, v: &Value) -> VmResult<Value> {
    let (prefix, render): (&str, fn(&num_bigint::BigInt) -> String) = match b {
        Builtin::Hex => ("0x", |n| format!("{n:x}")),
        Builtin::Oct => ("0o", |n| format!("{n:o}")),
        _ => ("0b", |n| format!("{n:b}")),
    };
    let big = match v {
        Value::Int(i) => num_bigint::BigInt::from(*i),
        Value::Bool(x) => num_bigint::BigInt::from(i64::from(*x)),
        Value::BigInt(x) => (**x).clone(),
        other => {
            return Err(PyExc::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                other.type_name()
            ))
            .into());
        }
    };
    let s = if num_traits::Signed::is_negative(&big) {
        format!("-{prefix}{}", render(&num_traits::Signed::abs(&big)))
    } else {
        format!("{prefix}{}", render(&big))
    };
    Ok(Value::str(s))
}

fn mod_pow(base: i64, mut exp: i64, modulus: i64) -> i64 {
    let mut result: i128 = 1;
    let m = i128::from(modulus);
    let mut b = i128::from(base) % m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = (result * b) % m;
        }
        exp >>= 1;
        b = (b * b) % m;
    }
    // Python's result has the modulus's sign.
    let mut r = result % m;
    if r != 0 && (r < 0) != (m < 0) {
        r += m;
    }
    r as i64
}

/// `round` with banker's rounding (round half to even), matching `round(0.5)
/// == 0` and `round(2.675, 2) == 2.67`-style float behavior.
fn round_value(v: &Value, ndigits: Option<i64>) -> VmResult<Value> {
    match v {
        Value::Int(_) | Value::BigInt(_) | Value::Bool(_) => match ndigits {
            None | Some(0..) => Ok(match v {
                Value::Bool(b) => Value::Int(i64::from(*b)),
                other => other.clone(),
            }),
            Some(nd) => {
                // Negative ndigits rounds an int to a multiple of 10^-nd.
                let i = v.as_int().unwrap_or(0);
                let factor = 10i64.checked_pow((-nd).min(18) as u32).unwrap_or(i64::MAX);
                let half = factor / 2;
                let rem = i.rem_euclid(factor);
                let down = i - rem;
                let rounded = if rem > half || (rem == half && (down / factor) % 2 != 0) {
                    down + factor
                } else {
                    down
                };
                Ok(Value::Int(rounded))
            }
        },
        Value::Float(f) => match ndigits {
            None => {
                let r = round_half_even(*f);
                if r.abs() < i64::MAX as f64 {
                    Ok(Value::Int(r as i64))
                } else {
                    Err(PyExc::overflow(
                        "cannot convert float infinity to integer",
                    )
                    .into())
                }
            }
            Some(nd) => {
                if !f.is_finite() {
                    return Ok(Value::Float(*f));
                }
                let factor = 10f64.powi(nd.clamp(-308, 308) as i32);
                let scaled = f * factor;
                if !scaled.is_finite() {
                    return Ok(Value::Float(*f));
                }
                Ok(Value::Float(round_half_even(scaled) / factor))
            }
        },
        other => Err(PyExc::type_error(format!(
            "type {} doesn't define __round__ method",
            other.type_name()
        ))
        .into()),
    }
}

fn round_half_even(f: f64) -> f64 {
    let floor = f.floor();
    let diff = f - floor;
    if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    }
}

fn min_max(
    vm: &mut Vm,
    b: Builtin,
    args: Vec<Value>,
    kwargs: Vec<(PyStr, Value)>,
) -> VmResult<Value> {
    let name = b.name();
    let mut key = Value::None;
    let mut default: Option<Value> = None;
    for (k, v) in kwargs {
        match k.as_str() {
            "key" => key = v,
            "default" => default = Some(v),
            other => {
                return Err(PyExc::type_error(format!(
                    "'{other}' is an invalid keyword argument for {name}()"
                ))
                .into());
            }
        }
    }

    let values = match args.len() {
        0 => {
            return Err(PyExc::type_error(format!(
                "{name} expected at least 1 argument, got 0"
            ))
            .into());
        }
        1 => vm.iterate_to_vec(args.into_iter().next().unwrap())?,
        _ => {
            if default.is_some() {
                return Err(PyExc::type_error(format!(
                    "Cannot specify a default for {name}() with multiple positional arguments"
                ))
                .into());
            }
            args
        }
    };

    if values.is_empty() {
        return match default {
            Some(d) => Ok(d),
            None => Err(PyExc::value_error(format!("{name}() arg is an empty sequence")).into()),
        };
    }

    let mut best = values[0].clone();
    let mut best_key = match &key {
        Value::None => best.clone(),
        f => vm.call_value(f.clone(), vec![best.clone()])?,
    };
    for v in &values[1..] {
        let k = match &key {
            Value::None => v.clone(),
            f => vm.call_value(f.clone(), vec![v.clone()])?,
        };
        let better = if b == Builtin::Min {
            py_lt(vm, &k, &best_key)?
        } else {
            py_lt(vm, &best_key, &k)?
        };
        if better {
            best = v.clone();
            best_key = k;
        }
    }
    Ok(best)
}

// ---------------------------------------------------------------------------
// Callable type objects
// ---------------------------------------------------------------------------

/// Call a builtin type object as a constructor.
pub(crate) fn call_type(
    vm: &mut Vm,
    t: PyType,
    mut args: Vec<Value>,
    kwargs: Vec<(PyStr, Value)>,
) -> VmResult<Value> {
    match t {
        PyType::Object => {
            if !args.is_empty() {
                return Err(PyExc::type_error("object() takes no arguments").into());
            }
            Ok(Value::Instance(Rc::new(crate::object::Instance::new(
                Value::Type(PyType::Object),
            ))))
        }
        PyType::Type => match args.len() {
            1 => Ok(vm.type_of(&args[0])),
            3 => {
                let namespace = args.pop().unwrap();
                let bases = args.pop().unwrap();
                let name = args.pop().unwrap();
                let Value::Str(name) = name else {
                    return Err(PyExc::type_error("type() argument 1 must be str").into());
                };
                let Value::Tuple(bases) = bases else {
                    return Err(PyExc::type_error("type() argument 2 must be tuple").into());
                };
                let Value::Dict(ns) = namespace else {
                    return Err(PyExc::type_error("type() argument 3 must be dict").into());
                };
                vm.build_class(&name, bases.to_vec(), ns, None)
            }
            _ => Err(PyExc::type_error("type() takes 1 or 3 arguments").into()),
        },
        PyType::Bool => {
            let v = args.first().cloned().unwrap_or(Value::Bool(false));
            Ok(Value::Bool(vm.truthy(&v)?))
        }
        PyType::Int => int_ctor(vm, args),
        PyType::Float => float_ctor(vm, args),
        PyType::Complex => {
            let (mut re, mut im) = (0.0, 0.0);
            if let Some(v) = args.first() {
                match v {
                    Value::Complex { re: r, im: i } => {
                        re = *r;
                        im = *i;
                    }
                    v => {
                        re = v.as_float().ok_or_else(|| {
                            VmError::from(PyExc::type_error(format!(
                                "complex() first argument must be a number, not '{}'",
                                v.type_name()
                            )))
                        })?;
                    }
                }
            }
            if let Some(v) = args.get(1) {
                match v {
                    Value::Complex { re: r, im: i } => {
                        // complex(a, bj) adds the second argument times 1j.
                        re -= *i;
                        im += *r;
                    }
                    v => {
                        im += v.as_float().ok_or_else(|| {
                            VmError::from(PyExc::type_error(
                                "complex() second argument must be a number",
                            ))
                        })?;
                    }
                }
            }
            Ok(Value::complex(re, im))
        }
        PyType::Str => match args.len() {
            0 => Ok(Value::str("")),
            1 => vm.py_str(&args[0]).map(Value::str),
            _ => Err(PyExc::type_error("str() takes at most 1 argument").into()),
        },
        PyType::Bytes => bytes_ctor(vm, args),
        PyType::List => match args.len() {
            0 => Ok(Value::list(vec![])),
            1 => {
                let items = vm.iterate_to_vec(args.pop().unwrap())?;
                vm.check_collection(items.len())?;
                Ok(Value::list(items))
            }
            _ => Err(PyExc::type_error("list expected at most 1 argument").into()),
        },
        PyType::Tuple => match args.len() {
            0 => Ok(Value::tuple(vec![])),
            1 => {
                let items = vm.iterate_to_vec(args.pop().unwrap())?;
                Ok(Value::tuple(items))
            }
            _ => Err(PyExc::type_error("tuple expected at most 1 argument").into()),
        },
        PyType::Dict => {
            let mut d = Dict::new();
            if let Some(src) = args.first().cloned() {
                match &src {
                    Value::Dict(o) => d = o.borrow().clone(),
                    _ => {
                        for pair in vm.iterate_to_vec(src)? {
                            let kv = vm.iterate_to_vec(pair)?;
                            if kv.len() != 2 {
                                return Err(PyExc::value_error(
                                    "dictionary update sequence element is not a pair",
                                )
                                .into());
                            }
                            let hash = vm.hash_value(&kv[0])?;
                            d.insert(hash, kv[0].clone(), kv[1].clone());
                        }
                    }
                }
            }
            for (k, v) in kwargs {
                d.insert_str(&k, v);
            }
            Ok(Value::Dict(Rc::new(RefCell::new(d))))
        }
        PyType::Set | PyType::FrozenSet => {
            let mut s = Set::new();
            if let Some(src) = args.first().cloned() {
                for v in vm.iterate_to_vec(src)? {
                    let hash = vm.hash_value(&v)?;
                    s.insert(hash, v);
                }
            }
            Ok(if t == PyType::Set {
                Value::set(s)
            } else {
                Value::frozenset(s)
            })
        }
        PyType::Range => {
            let ints: Vec<i64> = args
                .iter()
                .map(|v| {
                    v.as_int().ok_or_else(|| {
                        VmError::from(PyExc::type_error(format!(
                            "'{}' object cannot be interpreted as an integer",
                            v.type_name()
                        )))
                    })
                })
                .collect::<VmResult<_>>()?;
            let (start, stop, step) = match ints.len() {
                1 => (0, ints[0], 1),
                2 => (ints[0], ints[1], 1),
                3 => (ints[0], ints[1], ints[2]),
                n => {
                    return Err(PyExc::type_error(format!(
                        "range expected 1 to 3 arguments, got {n}"
                    ))
                    .into());
                }
            };
            if step == 0 {
                return Err(PyExc::value_error("range() arg 3 must not be zero").into());
            }
            Ok(Value::range(start, stop, step))
        }
        PyType::Slice => {
            let (start, stop, step) = match args.len() {
                1 => (Value::None, args[0].clone(), Value::None),
                2 => (args[0].clone(), args[1].clone(), Value::None),
                3 => (args[0].clone(), args[1].clone(), args[2].clone()),
                n => {
                    return Err(PyExc::type_error(format!(
                        "slice expected 1 to 3 arguments, got {n}"
                    ))
                    .into());
                }
            };
            Ok(Value::Slice(Rc::new(crate::value::SliceObj {
                start,
                stop,
                step,
            })))
        }
        PyType::Property => {
            let fget = args.first().cloned().filter(|v| !matches!(v, Value::None));
            let fset = args.get(1).cloned().filter(|v| !matches!(v, Value::None));
            let fdel = args.get(2).cloned().filter(|v| !matches!(v, Value::None));
            Ok(Value::Property(Rc::new(Property {
                fget,
                fset,
                fdel,
                doc: args.get(3).cloned(),
            })))
        }
        PyType::ClassMethod => {
            arity("classmethod", &args, 1)?;
            Ok(Value::ClassMethod(Rc::new(args.pop().unwrap())))
        }
        PyType::StaticMethod => {
            arity("staticmethod", &args, 1)?;
            Ok(Value::StaticMethod(Rc::new(args.pop().unwrap())))
        }
        _ => Err(PyExc::type_error(format!(
            "cannot create '{}' instances",
            t.name()
        ))
        .into()),
    }
}

fn int_ctor(vm: &mut Vm, args: Vec<Value>) -> VmResult<Value> {
    match args.len() {
        0 => Ok(Value::Int(0)),
        1 => match &args[0] {
            Value::Int(_) | Value::BigInt(_) => Ok(args[0].clone()),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::Float(f) => {
                if !f.is_finite() {
                    return Err(if f.is_nan() {
                        PyExc::value_error("cannot convert float NaN to integer").into()
                    } else {
                        PyExc::overflow("cannot convert float infinity to integer").into()
                    });
                }
                Ok(Value::Int(f.trunc() as i64))
            }
            Value::Str(s) => parse_int_str(s.trim(), 10),
            v @ Value::Instance(_) => match vm.lookup_dunder(v, "__int__") {
                Some(m) => vm.call_value(m, vec![]),
                None => Err(int_conv_err(v)),
            },
            v => Err(int_conv_err(v)),
        },
        2 => {
            let base = args[1].as_int().ok_or_else(|| {
                VmError::from(PyExc::type_error("'base' must be an integer"))
            })?;
            if !(2..=36).contains(&base) && base != 0 {
                return Err(PyExc::value_error("int() base must be >= 2 and <= 36, or 0").into());
            }
            match &args[0] {
                Value::Str(s) => parse_int_str(s.trim(), base as u32),
                _ => Err(PyExc::type_error(
                    "int() can't convert non-string with explicit base",
                )
                .into()),
            }
        }
        _ => Err(PyExc::type_error("int() takes at most 2 arguments").into()),
    }
}

fn int_conv_err(v: &Value) -> VmError {
    PyExc::type_error(format!(
        "int() argument must be a string, a bytes-like object or a real number, not '{}'",
        v.type_name()
    ))
    .into()
}

fn parse_int_str(s: &str, mut base: u32) -> VmResult<Value> {
    let original = s;
    let (sign, s) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let s = if base == 16 || base == 0 {
        let stripped = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"));
        if let Some(rest) = stripped {
            base = 16;
            rest
        } else {
            s
        }
    } else {
        s
    };
    let s = if base == 2 || base == 0 {
        match s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
            Some(rest) => {
                base = 2;
                rest
            }
            None => s,
        }
    } else {
        s
    };
    let s = if base == 8 || base == 0 {
        match s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
            Some(rest) => {
                base = 8;
                rest
            }
            None => s,
        }
    } else {
        s
    };
    if base == 0 {
        base = 10;
    }
    let cleaned: String = s.chars().filter(|&c| c != '_').collect();
    match num_bigint::BigInt::parse_bytes(cleaned.as_bytes(), base) {
        Some(big) if !cleaned.is_empty() => {
            Ok(Value::from_bigint(if sign < 0 { -big } else { big }))
        }
        _ => Err(PyExc::value_error(format!(
            "invalid literal for int() with base {base}: {}",
            crate::format::string_repr(original, false)
        ))
        .into()),
    }
}

fn float_ctor(vm: &mut Vm, args: Vec<Value>) -> VmResult<Value> {
    match args.len() {
        0 => Ok(Value::Float(0.0)),
        1 => match &args[0] {
            Value::Float(_) => Ok(args[0].clone()),
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Bool(b) => Ok(Value::Float(f64::from(u8::from(*b)))),
            Value::BigInt(b) => Ok(Value::Float(b.to_f64().unwrap_or(f64::INFINITY))),
            Value::Str(s) => {
                let t = s.trim();
                let parsed = match t.to_ascii_lowercase().as_str() {
                    "inf" | "infinity" | "+inf" | "+infinity" => Some(f64::INFINITY),
                    "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
                    "nan" | "+nan" | "-nan" => Some(f64::NAN),
                    _ => t.replace('_', "").parse::<f64>().ok(),
                };
                match parsed {
                    Some(f) => Ok(Value::Float(f)),
                    None => Err(PyExc::value_error(format!(
                        "could not convert string to float: {}",
                        crate::format::string_repr(s, false)
                    ))
                    .into()),
                }
            }
            v @ Value::Instance(_) => match vm.lookup_dunder(v, "__float__") {
                Some(m) => vm.call_value(m, vec![]),
                None => Err(PyExc::type_error(format!(
                    "float() argument must be a string or a real number, not '{}'",
                    v.type_name()
                ))
                .into()),
            },
            v => Err(PyExc::type_error(format!(
                "float() argument must be a string or a real number, not '{}'",
                v.type_name()
            ))
            .into()),
        },
        _ => Err(PyExc::type_error("float expected at most 1 argument").into()),
    }
}

fn bytes_ctor(vm: &mut Vm, mut args: Vec<Value>) -> VmResult<Value> {
    match args.len() {
        0 => Ok(Value::bytes(vec![])),
        1 => match args.pop().unwrap() {
            Value::Bytes(b) => Ok(Value::Bytes(b)),
            Value::Int(n) => {
                if n < 0 {
                    return Err(PyExc::value_error("negative count").into());
                }
                vm.check_collection(n as usize)?;
                Ok(Value::bytes(vec![0u8; n as usize]))
            }
            src @ (Value::List(_) | Value::Tuple(_) | Value::Range(_) | Value::Iter(_)) => {
                let mut out = Vec::new();
                for v in vm.iterate_to_vec(src)? {
                    match v.as_int() {
                        Some(i) if (0..=255).contains(&i) => out.push(i as u8),
                        Some(_) => {
                            return Err(
                                PyExc::value_error("bytes must be in range(0, 256)").into()
                            );
                        }
                        None => {
                            return Err(PyExc::type_error(
                                "an integer is required",
                            )
                            .into());
                        }
                    }
                }
                Ok(Value::bytes(out))
            }
            Value::Str(_) => Err(PyExc::type_error(
                "string argument without an encoding",
            )
            .into()),
            other => Err(PyExc::type_error(format!(
                "cannot convert '{}' object to bytes",
                other.type_name()
            ))
            .into()),
        },
        2 => {
            let _encoding = args.pop().unwrap();
            match args.pop().unwrap() {
                Value::Str(s) => Ok(Value::bytes(s.as_bytes().to_vec())),
                _ => Err(PyExc::type_error("encoding without a string argument").into()),
            }
        }
        _ => Err(PyExc::type_error("bytes() takes at most 2 arguments").into()),
    }
}

// ---------------------------------------------------------------------------
// isinstance / issubclass
// ---------------------------------------------------------------------------

/// `isinstance(obj, target)` with tuples, unions, virtual subclasses, and
/// metaclass `__instancecheck__`.
pub(crate) fn isinstance_check(vm: &mut Vm, obj: &Value, target: &Value) -> VmResult<bool> {
    match target {
        Value::Tuple(options) => {
            for t in options.iter() {
                if isinstance_check(vm, obj, t)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Union(parts) => {
            for t in parts.iter() {
                if isinstance_check(vm, obj, t)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::GenericAlias(g) => isinstance_check(vm, obj, &g.origin.clone()),
        _ => {
            // Metaclass hook.
            if let Value::Class(c) = target {
                if let Some(meta) = &c.metaclass {
                    if let Some(hook) =
                        crate::object::find_in_mro(meta, "__instancecheck__")
                    {
                        let r = vm.call_value(
                            hook,
                            vec![target.clone(), obj.clone()],
                        )?;
                        return vm.truthy(&r);
                    }
                }
            }
            let class = vm.type_of(obj);
            issubclass_inner(vm, &class, target)
        }
    }
}

/// `issubclass(cls, target)`.
pub(crate) fn issubclass_check(vm: &mut Vm, cls: &Value, target: &Value) -> VmResult<bool> {
    if !matches!(cls, Value::Class(_) | Value::Type(_) | Value::ExcClass(_)) {
        return Err(PyExc::type_error("issubclass() arg 1 must be a class").into());
    }
    match target {
        Value::Tuple(options) => {
            for t in options.iter() {
                if issubclass_check(vm, cls, t)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Union(parts) => {
            for t in parts.iter() {
                if issubclass_check(vm, cls, t)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => {
            if let Value::Class(c) = target {
                if let Some(meta) = &c.metaclass {
                    if let Some(hook) =
                        crate::object::find_in_mro(meta, "__subclasscheck__")
                    {
                        let r = vm.call_value(
                            hook,
                            vec![target.clone(), cls.clone()],
                        )?;
                        return vm.truthy(&r);
                    }
                }
            }
            issubclass_inner(vm, cls, target)
        }
    }
}

fn issubclass_inner(vm: &mut Vm, cls: &Value, target: &Value) -> VmResult<bool> {
    if !matches!(
        target,
        Value::Class(_) | Value::Type(_) | Value::ExcClass(_)
    ) {
        return Err(PyExc::type_error(format!(
            "isinstance() arg 2 must be a type, a tuple of types, or a union, not {}",
            class_name_of(target)
        ))
        .into());
    }
    // object is the universal base.
    if same_class(target, &Value::Type(PyType::Object)) {
        return Ok(true);
    }
    if mro_contains(cls, target) {
        return Ok(true);
    }
    // Virtual subclasses registered on the target.
    if let Value::Class(tc) = target {
        let registered = tc.virtual_subclasses.borrow().clone();
        for reg in registered {
            if same_class(&reg, cls) || mro_of(cls).iter().any(|c| same_class(c, &reg)) {
                return Ok(true);
            }
        }
    }
    let _ = vm;
    Ok(false)
}
