//! Method tables for the builtin types.
//!
//! `call_type_method` is the single dispatch point: the attribute engine and
//! the `LOAD_METHOD`/`CALL_METHOD` fast path both land here with a receiver,
//! a method name, and evaluated arguments. Mutating methods work directly on
//! the shared container storage, so `xs.append(1)` is visible through every
//! alias of `xs`.

use std::rc::Rc;

use crate::dict::Set;
use crate::exceptions::{ExcType, PyExc, VmResult};
use crate::format::{format_spec, plain_repr};
use crate::intern::PyStr;
use crate::operators::{py_eq, py_lt};
use crate::value::Value;
use crate::vm::Vm;

/// Whether `recv`'s builtin kind has a method called `name`.
pub(crate) fn has_type_method(recv: &Value, name: &str) -> bool {
    type_method_names(recv).contains(&name)
}

/// The method names a builtin kind exposes, for `dir` and `hasattr`.
pub(crate) fn type_method_names(recv: &Value) -> &'static [&'static str] {
    match recv {
        Value::Str(_) => &[
            "capitalize", "casefold", "center", "count", "endswith", "find", "format",
            "index", "isalnum", "isalpha", "isdigit", "islower", "isspace", "isupper",
            "join", "ljust", "lower", "lstrip", "removeprefix", "removesuffix",
            "replace", "rfind", "rindex", "rjust", "rsplit", "rstrip", "split",
            "splitlines", "startswith", "strip", "swapcase", "title", "upper", "zfill",
            "encode",
        ],
        Value::List(_) => &[
            "append", "clear", "copy", "count", "extend", "index", "insert", "pop",
            "remove", "reverse", "sort",
        ],
        Value::Dict(_) => &[
            "clear", "copy", "get", "items", "keys", "pop", "popitem", "setdefault",
            "update", "values",
        ],
        Value::Set(_) => &[
            "add", "clear", "copy", "difference", "discard", "intersection",
            "isdisjoint", "issubset", "issuperset", "pop", "remove",
            "symmetric_difference", "union", "update",
        ],
        Value::FrozenSet(_) => &[
            "copy", "difference", "intersection", "isdisjoint", "issubset",
            "issuperset", "symmetric_difference", "union",
        ],
        Value::Tuple(_) => &["count", "index"],
        Value::Int(_) | Value::BigInt(_) | Value::Bool(_) => {
            &["bit_length", "bit_count", "conjugate"]
        }
        Value::Float(_) => &["is_integer", "hex", "conjugate"],
        Value::Complex { .. } => &["conjugate"],
        Value::Bytes(_) => &[
            "count", "decode", "endswith", "find", "hex", "startswith",
        ],
        Value::Generator(g) => {
            if g.borrow().is_coroutine {
                &["send", "throw", "close"]
            } else {
                &["send", "throw", "close"]
            }
        }
        Value::Exception(_) => &["add_note", "with_traceback"],
        _ => &[],
    }
}

/// Call a method on a builtin receiver.
pub(crate) fn call_type_method(
    vm: &mut Vm,
    recv: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(PyStr, Value)>,
) -> VmResult<Value> {
    match recv {
        Value::Str(s) => str_method(vm, s, name, args, kwargs),
        Value::List(_) => list_method(vm, recv, name, args, kwargs),
        Value::Dict(_) => dict_method(vm, recv, name, args),
        Value::Set(_) | Value::FrozenSet(_) => set_method(vm, recv, name, args),
        Value::Tuple(items) => tuple_method(vm, items, name, args),
        Value::Int(_) | Value::BigInt(_) | Value::Bool(_) => int_method(recv, name, args),
        Value::Float(f) => float_method(*f, name, args),
        Value::Complex { re, im } => match name {
            "conjugate" => {
                no_args("complex.conjugate", &args)?;
                Ok(Value::complex(*re, -im))
            }
            _ => Err(no_method(recv, name)),
        },
        Value::Bytes(b) => bytes_method(b, name, args),
        Value::Generator(_) => generator_method(vm, recv, name, args),
        Value::Property(p) => {
            let f = one_arg(name, args)?;
            let updated = match name {
                "getter" => p.with_getter(f),
                "setter" => p.with_setter(f),
                "deleter" => p.with_deleter(f),
                _ => return Err(no_method(recv, name)),
            };
            Ok(Value::Property(Rc::new(updated)))
        }
        Value::Exception(exc) => match name {
            "add_note" => {
                let note = one_arg("add_note", args)?;
                let Value::Str(s) = note else {
                    return Err(PyExc::type_error("note must be a str").into());
                };
                exc.borrow_mut().notes.push(s);
                Ok(Value::None)
            }
            "with_traceback" => {
                let _ = one_arg("with_traceback", args)?;
                Ok(recv.clone())
            }
            _ => Err(no_method(recv, name)),
        },
        _ => Err(no_method(recv, name)),
    }
}

fn no_method(recv: &Value, name: &str) -> crate::exceptions::VmError {
    PyExc::attribute_error(&recv.type_name(), name).into()
}

// ---------------------------------------------------------------------------
// Argument plumbing
// ---------------------------------------------------------------------------

fn no_args(what: &str, args: &[Value]) -> VmResult<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(PyExc::type_error(format!("{what}() takes no arguments ({} given)", args.len())).into())
    }
}

fn one_arg(what: &str, mut args: Vec<Value>) -> VmResult<Value> {
    if args.len() == 1 {
        Ok(args.remove(0))
    } else {
        Err(PyExc::type_error(format!(
            "{what}() takes exactly one argument ({} given)",
            args.len()
        ))
        .into())
    }
}

fn arg_str(what: &str, v: &Value) -> VmResult<PyStr> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(PyExc::type_error(format!(
            "{what} must be str, not {}",
            other.type_name()
        ))
        .into()),
    }
}

fn arg_index(what: &str, v: &Value) -> VmResult<i64> {
    v.as_int().ok_or_else(|| {
        PyExc::type_error(format!(
            "{what} indices must be integers, not {}",
            v.type_name()
        ))
        .into()
    })
}

// ---------------------------------------------------------------------------
// str
// ---------------------------------------------------------------------------

fn str_method(
    vm: &mut Vm,
    s: &PyStr,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(PyStr, Value)>,
) -> VmResult<Value> {
    let text = s.as_str();
    match name {
        "upper" => {
            no_args("upper", &args)?;
            Ok(Value::str(text.to_uppercase()))
        }
        "lower" => {
            no_args("lower", &args)?;
            Ok(Value::str(text.to_lowercase()))
        }
        "casefold" => {
            no_args("casefold", &args)?;
            Ok(Value::str(text.to_lowercase()))
        }
        "capitalize" => {
            no_args("capitalize", &args)?;
            let mut chars = text.chars();
            let out = match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            };
            Ok(Value::str(out))
        }
        "title" => {
            no_args("title", &args)?;
            let mut out = String::with_capacity(text.len());
            let mut at_word_start = true;
            for c in text.chars() {
                if c.is_alphabetic() {
                    if at_word_start {
                        out.extend(c.to_uppercase());
                    } else {
                        out.extend(c.to_lowercase());
                    }
                    at_word_start = false;
                } else {
                    out.push(c);
                    at_word_start = true;
                }
            }
            Ok(Value::str(out))
        }
        "swapcase" => {
            no_args("swapcase", &args)?;
            let out: String = text
                .chars()
                .flat_map(|c| {
                    if c.is_uppercase() {
                        c.to_lowercase().collect::<Vec<_>>()
                    } else {
                        c.to_uppercase().collect::<Vec<_>>()
                    }
                })
                .collect();
            Ok(Value::str(out))
        }
        "strip" | "lstrip" | "rstrip" => {
            let pat: Option<String> = match args.first() {
                None | Some(Value::None) => None,
                Some(v) => Some(arg_str("strip arg", v)?.to_string()),
            };
            let matches_pat = |c: char| match &pat {
                Some(p) => p.contains(c),
                None => c.is_whitespace(),
            };
            let out = match name {
                "strip" => text.trim_matches(matches_pat),
                "lstrip" => text.trim_start_matches(matches_pat),
                _ => text.trim_end_matches(matches_pat),
            };
            Ok(Value::str(out))
        }
        "split" | "rsplit" => {
            let sep: Option<String> = match args.first() {
                None | Some(Value::None) => None,
                Some(v) => {
                    let s = arg_str("sep", v)?;
                    if s.is_empty() {
                        return Err(PyExc::value_error("empty separator").into());
                    }
                    Some(s.to_string())
                }
            };
            let maxsplit = match args.get(1) {
                Some(v) => arg_index("maxsplit", v)?,
                None => -1,
            };
            let parts = split_str(text, sep.as_deref(), maxsplit, name == "rsplit");
            Ok(Value::list(parts.into_iter().map(Value::str).collect()))
        }
        "splitlines" => {
            let out: Vec<Value> = text.lines().map(Value::str).collect();
            Ok(Value::list(out))
        }
        "join" => {
            let it = one_arg("join", args)?;
            let items = vm.iterate_to_vec(it)?;
            let mut parts = Vec::with_capacity(items.len());
            for (i, v) in items.iter().enumerate() {
                match v {
                    Value::Str(s) => parts.push(s.to_string()),
                    other => {
                        return Err(PyExc::type_error(format!(
                            "sequence item {i}: expected str instance, {} found",
                            other.type_name()
                        ))
                        .into());
                    }
                }
            }
            Ok(Value::str(parts.join(text)))
        }
        "replace" => {
            let old = arg_str("replace old", args.first().unwrap_or(&Value::None))?;
            let new = arg_str("replace new", args.get(1).unwrap_or(&Value::None))?;
            let count = match args.get(2) {
                Some(v) => arg_index("count", v)?,
                None => -1,
            };
            let out = if count < 0 {
                text.replace(old.as_str(), new.as_str())
            } else {
                text.replacen(old.as_str(), new.as_str(), count as usize)
            };
            Ok(Value::str(out))
        }
        "startswith" | "endswith" => {
            let target = args.first().cloned().unwrap_or(Value::None);
            let check = |needle: &str| {
                if name == "startswith" {
                    text.starts_with(needle)
                } else {
                    text.ends_with(needle)
                }
            };
            let result = match &target {
                Value::Str(n) => check(n),
                Value::Tuple(options) => {
                    let mut any = false;
                    for opt in options.iter() {
                        any = any || check(&arg_str(name, opt)?);
                    }
                    any
                }
                other => {
                    return Err(PyExc::type_error(format!(
                        "{name} first arg must be str or a tuple of str, not {}",
                        other.type_name()
                    ))
                    .into());
                }
            };
            Ok(Value::Bool(result))
        }
        "find" | "rfind" | "index" | "rindex" => {
            let needle = arg_str(name, args.first().unwrap_or(&Value::None))?;
            let byte_pos = if name.starts_with('r') {
                text.rfind(needle.as_str())
            } else {
                text.find(needle.as_str())
            };
            // Convert the byte offset to a code-point offset.
            match byte_pos.map(|bp| text[..bp].chars().count() as i64) {
                Some(p) => Ok(Value::Int(p)),
                None if name == "find" || name == "rfind" => Ok(Value::Int(-1)),
                None => Err(PyExc::value_error("substring not found").into()),
            }
        }
        "count" => {
            let needle = arg_str("count", args.first().unwrap_or(&Value::None))?;
            if needle.is_empty() {
                return Ok(Value::Int(text.chars().count() as i64 + 1));
            }
            Ok(Value::Int(text.matches(needle.as_str()).count() as i64))
        }
        "zfill" => {
            let width = arg_index("zfill width", args.first().unwrap_or(&Value::None))?;
            let width = width.max(0) as usize;
            let len = text.chars().count();
            if len >= width {
                return Ok(Value::str(text));
            }
            let pad = "0".repeat(width - len);
            let out = match text.strip_prefix(['-', '+']) {
                Some(rest) => format!("{}{}{}", &text[..1], pad, rest),
                None => format!("{pad}{text}"),
            };
            Ok(Value::str(out))
        }
        "center" | "ljust" | "rjust" => {
            let width = arg_index("width", args.first().unwrap_or(&Value::None))?.max(0) as usize;
            let fill = match args.get(1) {
                Some(v) => {
                    let f = arg_str("fillchar", v)?;
                    let mut chars = f.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => c,
                        _ => {
                            return Err(PyExc::type_error(
                                "the fill character must be exactly one character long",
                            )
                            .into());
                        }
                    }
                }
                None => ' ',
            };
            let len = text.chars().count();
            if len >= width {
                return Ok(Value::str(text));
            }
            let pad = width - len;
            let out = match name {
                "ljust" => format!("{text}{}", fill.to_string().repeat(pad)),
                "rjust" => format!("{}{text}", fill.to_string().repeat(pad)),
                _ => {
                    let left = pad / 2;
                    format!(
                        "{}{text}{}",
                        fill.to_string().repeat(left),
                        fill.to_string().repeat(pad - left)
                    )
                }
            };
            Ok(Value::str(out))
        }
        "removeprefix" => {
            let p = arg_str("removeprefix", args.first().unwrap_or(&Value::None))?;
            Ok(Value::str(text.strip_prefix(p.as_str()).unwrap_or(text)))
        }
        "removesuffix" => {
            let p = arg_str("removesuffix", args.first().unwrap_or(&Value::None))?;
            Ok(Value::str(text.strip_suffix(p.as_str()).unwrap_or(text)))
        }
        "isdigit" => Ok(Value::Bool(
            !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()),
        )),
        "isalpha" => Ok(Value::Bool(
            !text.is_empty() && text.chars().all(char::is_alphabetic),
        )),
        "isalnum" => Ok(Value::Bool(
            !text.is_empty() && text.chars().all(char::is_alphanumeric),
        )),
        "isspace" => Ok(Value::Bool(
            !text.is_empty() && text.chars().all(char::is_whitespace),
        )),
        "isupper" => Ok(Value::Bool(
            text.chars().any(char::is_uppercase) && !text.chars().any(char::is_lowercase),
        )),
        "islower" => Ok(Value::Bool(
            text.chars().any(char::is_lowercase) && !text.chars().any(char::is_uppercase),
        )),
        "encode" => {
            // UTF-8 only; that is the interpreter's native encoding.
            Ok(Value::bytes(text.as_bytes().to_vec()))
        }
        "format" => str_format(vm, text, args, kwargs),
        _ => Err(no_method(&Value::Str(s.clone()), name)),
    }
}

fn split_str(text: &str, sep: Option<&str>, maxsplit: i64, from_right: bool) -> Vec<String> {
    match sep {
        None => {
            // Whitespace splitting never yields empty fields.
            let mut parts: Vec<String> =
                text.split_whitespace().map(str::to_owned).collect();
            if maxsplit >= 0 && parts.len() > maxsplit as usize + 1 {
                // Re-split keeping the tail intact.
                let limit = maxsplit as usize;
                if from_right {
                    let tail = parts.split_off(parts.len() - limit);
                    let head = parts.join(" ");
                    let mut out = vec![head];
                    out.extend(tail);
                    return out;
                }
                let tail = parts.split_off(limit);
                parts.push(tail.join(" "));
            }
            parts
        }
        Some(sep) => {
            let mut parts: Vec<String> = text.split(sep).map(str::to_owned).collect();
            if maxsplit >= 0 && parts.len() > maxsplit as usize + 1 {
                let limit = maxsplit as usize;
                if from_right {
                    let tail = parts.split_off(parts.len() - limit);
                    let head = parts.join(sep);
                    let mut out = vec![head];
                    out.extend(tail);
                    return out;
                }
                let tail = parts.split_off(limit);
                parts.push(tail.join(sep));
            }
            parts
        }
    }
}

/// `str.format`: `{}`, `{0}`, `{name}`, conversions `!r`/`!s`/`!a`, and a
/// format spec after `:`. Nested fields inside specs are not supported.
fn str_format(
    vm: &mut Vm,
    fmt: &str,
    args: Vec<Value>,
    kwargs: Vec<(PyStr, Value)>,
) -> VmResult<Value> {
    let mut out = String::with_capacity(fmt.len());
    let mut auto = 0usize;
    let mut explicit = false;
    let mut chars = fmt.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => {
                return Err(
                    PyExc::value_error("Single '}' encountered in format string").into()
                );
            }
            '{' => {
                let mut field = String::new();
                let mut depth = 1;
                for c in chars.by_ref() {
                    if c == '{' {
                        depth += 1;
                    } else if c == '}' {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    field.push(c);
                }
                if depth != 0 {
                    return Err(PyExc::value_error(
                        "Single '{' encountered in format string",
                    )
                    .into());
                }

                let (name_conv, spec) = field
                    .split_once(':')
                    .map_or((field.as_str(), ""), |(a, b)| (a, b));
                let (name, conversion) = name_conv
                    .split_once('!')
                    .map_or((name_conv, None), |(a, b)| (a, Some(b)));

                let value = if name.is_empty() {
                    if explicit {
                        return Err(PyExc::value_error(
                            "cannot switch from manual field specification to automatic field numbering",
                        )
                        .into());
                    }
                    let v = args.get(auto).cloned().ok_or_else(|| {
                        crate::exceptions::VmError::from(PyExc::index_error(
                            "Replacement index out of range for positional args tuple",
                        ))
                    })?;
                    auto += 1;
                    v
                } else if let Ok(i) = name.parse::<usize>() {
                    explicit = true;
                    args.get(i).cloned().ok_or_else(|| {
                        crate::exceptions::VmError::from(PyExc::index_error(
                            "Replacement index out of range for positional args tuple",
                        ))
                    })?
                } else {
                    kwargs
                        .iter()
                        .find(|(k, _)| k.as_str() == name)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| {
                            crate::exceptions::VmError::from(PyExc::key_error(format!(
                                "'{name}'"
                            )))
                        })?
                };

                let value = match conversion {
                    None => value,
                    Some("s") => Value::str(vm.py_str(&value)?),
                    Some("r") => Value::str(vm.py_repr(&value)?),
                    Some("a") => Value::str(crate::format::ascii_repr(&value)),
                    Some(other) => {
                        return Err(PyExc::value_error(format!(
                            "Unknown conversion specifier {other}"
                        ))
                        .into());
                    }
                };

                if spec.is_empty() && matches!(value, Value::Instance(_)) {
                    out.push_str(&vm.py_str(&value)?);
                } else {
                    out.push_str(&format_spec(&value, spec)?);
                }
            }
            c => out.push(c),
        }
    }
    Ok(Value::str(out))
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn list_method(
    vm: &mut Vm,
    recv: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(PyStr, Value)>,
) -> VmResult<Value> {
    let Value::List(items) = recv else { unreachable!() };
    match name {
        "append" => {
            let v = one_arg("append", args)?;
            vm.check_collection(items.borrow().len() + 1)?;
            vm.charge_allocation(1)?;
            items.borrow_mut().push(v);
            Ok(Value::None)
        }
        "extend" => {
            let it = one_arg("extend", args)?;
            let extra = vm.iterate_to_vec(it)?;
            vm.check_collection(items.borrow().len() + extra.len())?;
            vm.charge_allocation(extra.len() as u64)?;
            items.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        "insert" => {
            let index = arg_index("insert", args.first().unwrap_or(&Value::None))?;
            let v = args.get(1).cloned().ok_or_else(|| {
                crate::exceptions::VmError::from(PyExc::type_error(
                    "insert expected 2 arguments",
                ))
            })?;
            let mut list = items.borrow_mut();
            let len = list.len() as i64;
            let pos = if index < 0 {
                (index + len).max(0)
            } else {
                index.min(len)
            } as usize;
            list.insert(pos, v);
            Ok(Value::None)
        }
        "remove" => {
            let target = one_arg("remove", args)?;
            let snapshot = items.borrow().clone();
            for (i, v) in snapshot.iter().enumerate() {
                if py_eq(vm, &target, v)? {
                    items.borrow_mut().remove(i);
                    return Ok(Value::None);
                }
            }
            Err(PyExc::value_error("list.remove(x): x not in list").into())
        }
        "pop" => {
            let mut list = items.borrow_mut();
            let len = list.len() as i64;
            let index = match args.first() {
                Some(v) => arg_index("pop", v)?,
                None => -1,
            };
            let pos = if index < 0 { index + len } else { index };
            if len == 0 {
                return Err(PyExc::index_error("pop from empty list").into());
            }
            if pos < 0 || pos >= len {
                return Err(PyExc::index_error("pop index out of range").into());
            }
            Ok(list.remove(pos as usize))
        }
        "clear" => {
            no_args("clear", &args)?;
            items.borrow_mut().clear();
            Ok(Value::None)
        }
        "index" => {
            let target = args.first().cloned().ok_or_else(|| {
                crate::exceptions::VmError::from(PyExc::type_error(
                    "index expected at least 1 argument",
                ))
            })?;
            let snapshot = items.borrow().clone();
            for (i, v) in snapshot.iter().enumerate() {
                if py_eq(vm, &target, v)? {
                    return Ok(Value::Int(i as i64));
                }
            }
            Err(PyExc::value_error(format!(
                "{} is not in list",
                plain_repr(&target)
            ))
            .into())
        }
        "count" => {
            let target = one_arg("count", args)?;
            let snapshot = items.borrow().clone();
            let mut n = 0;
            for v in &snapshot {
                if py_eq(vm, &target, v)? {
                    n += 1;
                }
            }
            Ok(Value::Int(n))
        }
        "sort" => {
            let mut key = Value::None;
            let mut reverse = false;
            for (k, v) in kwargs {
                match k.as_str() {
                    "key" => key = v,
                    "reverse" => reverse = vm.truthy(&v)?,
                    other => {
                        return Err(PyExc::type_error(format!(
                            "'{other}' is an invalid keyword argument for sort()"
                        ))
                        .into());
                    }
                }
            }
            let snapshot = items.borrow().clone();
            let sorted = sort_values(vm, snapshot, key, reverse)?;
            *items.borrow_mut() = sorted;
            Ok(Value::None)
        }
        "reverse" => {
            no_args("reverse", &args)?;
            items.borrow_mut().reverse();
            Ok(Value::None)
        }
        "copy" => {
            no_args("copy", &args)?;
            let out = items.borrow().clone();
            Ok(Value::list(out))
        }
        _ => Err(no_method(recv, name)),
    }
}

/// Stable merge-free sort: decorate with keys, insertion-merge via the
/// `__lt__` protocol. `reverse=True` compares `b < a` rather than negating,
/// which keeps equal elements in their original order.
pub(crate) fn sort_values(
    vm: &mut Vm,
    values: Vec<Value>,
    key: Value,
    reverse: bool,
) -> VmResult<Vec<Value>> {
    // Decorate.
    let mut keyed: Vec<(Value, Value)> = Vec::with_capacity(values.len());
    for v in values {
        let k = match &key {
            Value::None => v.clone(),
            f => vm.call_value(f.clone(), vec![v.clone()])?,
        };
        keyed.push((k, v));
    }

    // Binary insertion sort driven by py_lt; stable because insertion
    // position is after the run of equal keys.
    let mut sorted: Vec<(Value, Value)> = Vec::with_capacity(keyed.len());
    for item in keyed {
        let mut lo = 0;
        let mut hi = sorted.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let before = if reverse {
                // Compare b < a to preserve stability under reversal.
                py_lt(vm, &sorted[mid].0, &item.0)?
            } else {
                py_lt(vm, &item.0, &sorted[mid].0)?
            };
            if before {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        sorted.insert(lo, item);
    }
    Ok(sorted.into_iter().map(|(_, v)| v).collect())
}

// ---------------------------------------------------------------------------
// dict
// ---------------------------------------------------------------------------

fn dict_method(vm: &mut Vm, recv: &Value, name: &str, args: Vec<Value>) -> VmResult<Value> {
    let Value::Dict(d) = recv else { unreachable!() };
    match name {
        "get" => {
            let key = args.first().cloned().unwrap_or(Value::None);
            let default = args.get(1).cloned().unwrap_or(Value::None);
            let hash = vm.hash_value(&key)?;
            Ok(d.borrow().get_with_hash(hash, &key).cloned().unwrap_or(default))
        }
        "keys" => {
            no_args("keys", &args)?;
            Ok(vm.new_iter_value(d.borrow().keys()))
        }
        "values" => {
            no_args("values", &args)?;
            Ok(vm.new_iter_value(d.borrow().values()))
        }
        "items" => {
            no_args("items", &args)?;
            let items: Vec<Value> = d
                .borrow()
                .items()
                .into_iter()
                .map(|(k, v)| Value::tuple(vec![k, v]))
                .collect();
            Ok(vm.new_iter_value(items))
        }
        "pop" => {
            let key = args.first().cloned().unwrap_or(Value::None);
            let hash = vm.hash_value(&key)?;
            match d.borrow_mut().remove(hash, &key) {
                Some(v) => Ok(v),
                None => match args.get(1) {
                    Some(default) => Ok(default.clone()),
                    None => Err(PyExc::key_error(plain_repr(&key)).into()),
                },
            }
        }
        "popitem" => {
            no_args("popitem", &args)?;
            match d.borrow_mut().pop_last() {
                Some((k, v)) => Ok(Value::tuple(vec![k, v])),
                None => Err(PyExc::key_error("'popitem(): dictionary is empty'").into()),
            }
        }
        "setdefault" => {
            let key = args.first().cloned().unwrap_or(Value::None);
            let default = args.get(1).cloned().unwrap_or(Value::None);
            let hash = vm.hash_value(&key)?;
            let existing = d.borrow().get_with_hash(hash, &key).cloned();
            match existing {
                Some(v) => Ok(v),
                None => {
                    d.borrow_mut().insert(hash, key, default.clone());
                    Ok(default)
                }
            }
        }
        "update" => {
            let other = one_arg("update", args)?;
            match &other {
                Value::Dict(o) => {
                    let snapshot = o.borrow().clone();
                    d.borrow_mut().update(&snapshot);
                }
                _ => {
                    // An iterable of (key, value) pairs.
                    let pairs = vm.iterate_to_vec(other)?;
                    for pair in pairs {
                        let kv = vm.iterate_to_vec(pair)?;
                        if kv.len() != 2 {
                            return Err(PyExc::value_error(
                                "dictionary update sequence element is not a pair",
                            )
                            .into());
                        }
                        let hash = vm.hash_value(&kv[0])?;
                        d.borrow_mut().insert(hash, kv[0].clone(), kv[1].clone());
                    }
                }
            }
            Ok(Value::None)
        }
        "clear" => {
            no_args("clear", &args)?;
            d.borrow_mut().clear();
            Ok(Value::None)
        }
        "copy" => {
            no_args("copy", &args)?;
            let out = d.borrow().clone();
            Ok(Value::Dict(Rc::new(std::cell::RefCell::new(out))))
        }
        _ => Err(no_method(recv, name)),
    }
}

// ---------------------------------------------------------------------------
// set / frozenset
// ---------------------------------------------------------------------------

fn set_method(vm: &mut Vm, recv: &Value, name: &str, args: Vec<Value>) -> VmResult<Value> {
    let frozen = matches!(recv, Value::FrozenSet(_));
    let read = |recv: &Value| -> Set {
        match recv {
            Value::Set(s) => s.borrow().clone(),
            Value::FrozenSet(s) => (**s).clone(),
            _ => unreachable!(),
        }
    };

    // Mutating methods only exist on set proper.
    if frozen
        && matches!(
            name,
            "add" | "remove" | "discard" | "pop" | "clear" | "update"
        )
    {
        return Err(no_method(recv, name));
    }

    match name {
        "add" => {
            let Value::Set(s) = recv else { unreachable!() };
            let v = one_arg("add", args)?;
            let hash = vm.hash_value(&v)?;
            s.borrow_mut().insert(hash, v);
            Ok(Value::None)
        }
        "remove" => {
            let Value::Set(s) = recv else { unreachable!() };
            let v = one_arg("remove", args)?;
            let hash = vm.hash_value(&v)?;
            match s.borrow_mut().remove(hash, &v) {
                Some(_) => Ok(Value::None),
                None => Err(PyExc::key_error(plain_repr(&v)).into()),
            }
        }
        "discard" => {
            let Value::Set(s) = recv else { unreachable!() };
            let v = one_arg("discard", args)?;
            let hash = vm.hash_value(&v)?;
            s.borrow_mut().remove(hash, &v);
            Ok(Value::None)
        }
        "pop" => {
            let Value::Set(s) = recv else { unreachable!() };
            no_args("pop", &args)?;
            s.borrow_mut()
                .pop()
                .ok_or_else(|| PyExc::key_error("'pop from an empty set'").into())
        }
        "clear" => {
            let Value::Set(s) = recv else { unreachable!() };
            no_args("clear", &args)?;
            s.borrow_mut().clear();
            Ok(Value::None)
        }
        "update" => {
            let Value::Set(s) = recv else { unreachable!() };
            let other = one_arg("update", args)?;
            let values = vm.iterate_to_vec(other)?;
            for v in values {
                let hash = vm.hash_value(&v)?;
                s.borrow_mut().insert(hash, v);
            }
            Ok(Value::None)
        }
        "union" | "intersection" | "difference" | "symmetric_difference" => {
            let mine = read(recv);
            let other = one_arg(name, args)?;
            let other_set = match &other {
                Value::Set(_) | Value::FrozenSet(_) => read(&other),
                _ => {
                    let mut out = Set::new();
                    for v in vm.iterate_to_vec(other)? {
                        let hash = vm.hash_value(&v)?;
                        out.insert(hash, v);
                    }
                    out
                }
            };
            let result = match name {
                "union" => mine.union(&other_set),
                "intersection" => mine.intersection(&other_set),
                "difference" => mine.difference(&other_set),
                _ => mine.symmetric_difference(&other_set),
            };
            Ok(if frozen {
                Value::frozenset(result)
            } else {
                Value::set(result)
            })
        }
        "issubset" => {
            let mine = read(recv);
            let other = one_arg("issubset", args)?;
            let other = match &other {
                Value::Set(_) | Value::FrozenSet(_) => read(&other),
                _ => return Err(PyExc::type_error("issubset requires a set").into()),
            };
            Ok(Value::Bool(mine.is_subset(&other)))
        }
        "issuperset" => {
            let mine = read(recv);
            let other = one_arg("issuperset", args)?;
            let other = match &other {
                Value::Set(_) | Value::FrozenSet(_) => read(&other),
                _ => return Err(PyExc::type_error("issuperset requires a set").into()),
            };
            Ok(Value::Bool(other.is_subset(&mine)))
        }
        "isdisjoint" => {
            let mine = read(recv);
            let other = one_arg("isdisjoint", args)?;
            let other = match &other {
                Value::Set(_) | Value::FrozenSet(_) => read(&other),
                _ => return Err(PyExc::type_error("isdisjoint requires a set").into()),
            };
            Ok(Value::Bool(mine.intersection(&other).is_empty()))
        }
        "copy" => {
            no_args("copy", &args)?;
            let out = read(recv);
            Ok(if frozen {
                Value::frozenset(out)
            } else {
                Value::set(out)
            })
        }
        _ => Err(no_method(recv, name)),
    }
}

// ---------------------------------------------------------------------------
// tuple / numbers / bytes / generators
// ---------------------------------------------------------------------------

fn tuple_method(
    vm: &mut Vm,
    items: &Rc<[Value]>,
    name: &str,
    args: Vec<Value>,
) -> VmResult<Value> {
    match name {
        "count" => {
            let target = one_arg("count", args)?;
            let mut n = 0;
            for v in items.iter() {
                if py_eq(vm, &target, v)? {
                    n += 1;
                }
            }
            Ok(Value::Int(n))
        }
        "index" => {
            let target = args.first().cloned().unwrap_or(Value::None);
            for (i, v) in items.iter().enumerate() {
                if py_eq(vm, &target, v)? {
                    return Ok(Value::Int(i as i64));
                }
            }
            Err(PyExc::value_error("tuple.index(x): x not in tuple").into())
        }
        _ => Err(no_method(&Value::Tuple(items.clone()), name)),
    }
}

fn int_method(recv: &Value, name: &str, args: Vec<Value>) -> VmResult<Value> {
    match name {
        "bit_length" => {
            no_args("bit_length", &args)?;
            let bits = match recv {
                Value::Int(i) => 64 - i.unsigned_abs().leading_zeros() as i64,
                Value::Bool(b) => i64::from(*b),
                Value::BigInt(b) => b.bits() as i64,
                _ => unreachable!(),
            };
            Ok(Value::Int(bits))
        }
        "bit_count" => {
            no_args("bit_count", &args)?;
            let n = match recv {
                Value::Int(i) => i.unsigned_abs().count_ones() as i64,
                Value::Bool(b) => i64::from(*b),
                Value::BigInt(b) => b
                    .to_u64_digits()
                    .1
                    .iter()
                    .map(|d| d.count_ones() as i64)
                    .sum(),
                _ => unreachable!(),
            };
            Ok(Value::Int(n))
        }
        "conjugate" => {
            no_args("conjugate", &args)?;
            Ok(match recv {
                Value::Bool(b) => Value::Int(i64::from(*b)),
                other => other.clone(),
            })
        }
        _ => Err(no_method(recv, name)),
    }
}

fn float_method(f: f64, name: &str, args: Vec<Value>) -> VmResult<Value> {
    match name {
        "is_integer" => {
            no_args("is_integer", &args)?;
            Ok(Value::Bool(f.is_finite() && f.fract() == 0.0))
        }
        "conjugate" => {
            no_args("conjugate", &args)?;
            Ok(Value::Float(f))
        }
        "hex" => {
            no_args("hex", &args)?;
            Ok(Value::str(float_hex(f)))
        }
        _ => Err(no_method(&Value::Float(f), name)),
    }
}

/// Python's `float.hex`: `[sign]0x1.<mantissa>p<exp>` for normal values.
pub(crate) fn float_hex(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if f == 0.0 {
        return if f.is_sign_negative() {
            "-0x0.0p+0".into()
        } else {
            "0x0.0p+0".into()
        };
    }
    let bits = f.to_bits();
    let sign = if bits >> 63 == 1 { "-" } else { "" };
    let exponent = ((bits >> 52) & 0x7ff) as i64;
    let mantissa = bits & 0xf_ffff_ffff_ffff;
    if exponent == 0 {
        // Subnormal: 0x0.<mantissa>p-1022
        format!("{sign}0x0.{mantissa:013x}p-1022")
    } else {
        format!("{sign}0x1.{mantissa:013x}p{:+}", exponent - 1023)
    }
}

/// Parse the output of [`float_hex`], for `float.fromhex`.
pub(crate) fn float_from_hex(s: &str) -> Result<f64, PyExc> {
    let t = s.trim().to_ascii_lowercase();
    match t.as_str() {
        "inf" | "infinity" | "+inf" | "+infinity" => return Ok(f64::INFINITY),
        "-inf" | "-infinity" => return Ok(f64::NEG_INFINITY),
        "nan" | "+nan" | "-nan" => return Ok(f64::NAN),
        _ => {}
    }
    let (sign, rest) = match t.strip_prefix('-') {
        Some(r) => (-1.0, r),
        None => (1.0, t.strip_prefix('+').unwrap_or(&t)),
    };
    let rest = rest
        .strip_prefix("0x")
        .ok_or_else(|| PyExc::value_error("invalid hexadecimal floating-point string"))?;
    let (mantissa_str, exp_str) = rest
        .split_once('p')
        .ok_or_else(|| PyExc::value_error("invalid hexadecimal floating-point string"))?;
    let exp: i32 = exp_str
        .parse()
        .map_err(|_| PyExc::value_error("invalid hexadecimal floating-point string"))?;
    let (int_part, frac_part) = mantissa_str
        .split_once('.')
        .map_or((mantissa_str, ""), |(a, b)| (a, b));
    let mut value = 0.0f64;
    for c in int_part.chars() {
        let d = c
            .to_digit(16)
            .ok_or_else(|| PyExc::value_error("invalid hexadecimal floating-point string"))?;
        value = value * 16.0 + f64::from(d);
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_part.chars() {
        let d = c
            .to_digit(16)
            .ok_or_else(|| PyExc::value_error("invalid hexadecimal floating-point string"))?;
        value += f64::from(d) * scale;
        scale /= 16.0;
    }
    Ok(sign * value * 2f64.powi(exp))
}

fn bytes_method(bytes: &Rc<[u8]>, name: &str, args: Vec<Value>) -> VmResult<Value> {
    let recv = Value::Bytes(bytes.clone());
    match name {
        "decode" => {
            // UTF-8 (optionally named explicitly).
            if let Some(enc) = args.first() {
                let enc = arg_str("encoding", enc)?;
                if !matches!(enc.as_str(), "utf-8" | "utf8" | "ascii") {
                    return Err(PyExc::value_error(format!("unknown encoding: {enc}")).into());
                }
            }
            match std::str::from_utf8(bytes) {
                Ok(s) => Ok(Value::str(s)),
                Err(e) => Err(PyExc::new(
                    ExcType::ValueError,
                    format!("invalid utf-8 sequence at byte {}", e.valid_up_to()),
                )
                .into()),
            }
        }
        "hex" => {
            no_args("hex", &args)?;
            let mut out = String::with_capacity(bytes.len() * 2);
            for b in bytes.iter() {
                out.push_str(&format!("{b:02x}"));
            }
            Ok(Value::str(out))
        }
        "count" => {
            let target = one_arg("count", args)?;
            match &target {
                Value::Bytes(needle) if !needle.is_empty() => Ok(Value::Int(
                    bytes
                        .windows(needle.len())
                        .filter(|w| *w == &needle[..])
                        .count() as i64,
                )),
                _ => match target.as_int() {
                    Some(i) if (0..=255).contains(&i) => Ok(Value::Int(
                        bytes.iter().filter(|&&b| b == i as u8).count() as i64,
                    )),
                    _ => Err(PyExc::type_error("argument should be integer or bytes").into()),
                },
            }
        }
        "find" => {
            let target = one_arg("find", args)?;
            let Value::Bytes(needle) = &target else {
                return Err(PyExc::type_error("argument should be bytes").into());
            };
            let pos = bytes
                .windows(needle.len().max(1))
                .position(|w| w == &needle[..])
                .map_or(-1, |p| p as i64);
            Ok(Value::Int(pos))
        }
        "startswith" => {
            let target = one_arg("startswith", args)?;
            let Value::Bytes(needle) = &target else {
                return Err(PyExc::type_error("argument should be bytes").into());
            };
            Ok(Value::Bool(bytes.starts_with(needle)))
        }
        "endswith" => {
            let target = one_arg("endswith", args)?;
            let Value::Bytes(needle) = &target else {
                return Err(PyExc::type_error("argument should be bytes").into());
            };
            Ok(Value::Bool(bytes.ends_with(needle)))
        }
        _ => Err(no_method(&recv, name)),
    }
}

fn generator_method(
    vm: &mut Vm,
    recv: &Value,
    name: &str,
    args: Vec<Value>,
) -> VmResult<Value> {
    let Value::Generator(g) = recv else { unreachable!() };
    match name {
        "send" => {
            let v = one_arg("send", args)?;
            vm.generator_send(g, v)
        }
        "throw" => {
            let exc = args.first().cloned().ok_or_else(|| {
                crate::exceptions::VmError::from(PyExc::type_error(
                    "throw expected at least 1 argument",
                ))
            })?;
            vm.generator_throw(g, exc)
        }
        "close" => {
            no_args("close", &args)?;
            vm.generator_close(g)
        }
        _ => Err(no_method(recv, name)),
    }
}
