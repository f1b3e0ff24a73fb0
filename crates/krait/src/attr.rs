//! The attribute engine: `getattr`/`setattr`/`delattr` across every value
//! kind, the descriptor protocol, and bound-method creation.
//!
//! Instance lookup follows the standard order: data descriptors found on the
//! class (a `property` with a setter/deleter, or any descriptor object whose
//! class defines `__set__`/`__delete__`) win over the instance dict; the
//! instance dict wins over non-data class attributes; `__getattr__` is the
//! last resort before `AttributeError`.

use std::rc::Rc;

use crate::exceptions::{ExcType, PyExc, VmError, VmResult};
use crate::methods;
use crate::object::{class_name_of, find_in_mro, mro_of, BoundMethod, InstanceStorage};
use crate::value::{InstanceRef, PyType, Value};
use crate::vm::Vm;

/// `getattr(obj, name)`.
pub(crate) fn get_attr(vm: &mut Vm, obj: &Value, name: &str) -> VmResult<Value> {
    match obj {
        Value::Instance(inst) => instance_get_attr(vm, obj, inst, name),
        Value::Class(_) | Value::Type(_) | Value::ExcClass(_) => {
            class_get_attr(vm, obj, name)
        }
        Value::Module(m) => {
            match name {
                "__name__" => return Ok(Value::Str(m.name.clone())),
                "__doc__" => {
                    return Ok(m
                        .doc
                        .borrow()
                        .clone()
                        .map_or(Value::None, Value::Str));
                }
                "__dict__" => return Ok(Value::Dict(m.dict.clone())),
                _ => {}
            }
            m.dict.borrow().get_str(name).cloned().ok_or_else(|| {
                PyExc::new(
                    ExcType::AttributeError,
                    format!("module '{}' has no attribute '{name}'", m.name),
                )
                .into()
            })
        }
        Value::Exception(_) => exception_get_attr(vm, obj, name),
        Value::Function(f) => match name {
            "__name__" => Ok(Value::Str(f.name.borrow().clone())),
            "__doc__" => Ok(f.doc.clone().map_or(Value::None, Value::Str)),
            "__dict__" => Ok(Value::Dict(f.dict.clone())),
            "__code__" => Ok(Value::Code(f.code.clone())),
            "__defaults__" => Ok(if f.defaults.is_empty() {
                Value::None
            } else {
                Value::tuple(f.defaults.clone())
            }),
            "__globals__" => Ok(Value::Dict(f.globals.clone())),
            _ => f
                .dict
                .borrow()
                .get_str(name)
                .cloned()
                .ok_or_else(|| attr_missing(obj, name)),
        },
        Value::BoundMethod(m) => match name {
            "__self__" => Ok(m.receiver.clone()),
            "__func__" => Ok(m.func.clone()),
            "__name__" => get_attr(vm, &m.func, "__name__"),
            _ => Err(attr_missing(obj, name)),
        },
        Value::Property(p) => match name {
            "fget" => Ok(p.fget.clone().unwrap_or(Value::None)),
            "fset" => Ok(p.fset.clone().unwrap_or(Value::None)),
            "fdel" => Ok(p.fdel.clone().unwrap_or(Value::None)),
            "getter" | "setter" | "deleter" => Ok(method_marker(name, obj)),
            _ => Err(attr_missing(obj, name)),
        },
        Value::GenericAlias(g) => match name {
            "__origin__" => Ok(g.origin.clone()),
            "__args__" => Ok(Value::tuple(g.args.clone())),
            _ => Err(attr_missing(obj, name)),
        },
        Value::Union(parts) => match name {
            "__args__" => Ok(Value::tuple(parts.to_vec())),
            _ => Err(attr_missing(obj, name)),
        },
        Value::UserData(ud) => {
            if let Some(meta) = &ud.metatable {
                if let Some((_, f)) = meta.properties.iter().find(|(n, _)| n == name) {
                    let f = f.clone();
                    let mut args = crate::embed::Args::positional(vec![obj.clone()]);
                    return f(vm, &mut args).map_err(VmError::from);
                }
                if let Some((method_name, f)) = meta.methods.iter().find(|(n, _)| n == name) {
                    return Ok(Value::BoundMethod(Rc::new(BoundMethod {
                        func: Value::Native(Rc::new(crate::value::NativeFunction {
                            name: crate::intern::PyStr::new(method_name),
                            func: f.clone(),
                        })),
                        receiver: obj.clone(),
                    })));
                }
            }
            Err(attr_missing(obj, name))
        }
        Value::Generator(_) => {
            if methods::has_type_method(obj, name) {
                Ok(method_marker(name, obj))
            } else {
                Err(attr_missing(obj, name))
            }
        }
        // Builtin kinds: pseudo-properties first, then the method tables.
        _ => {
            if name == "__class__" {
                return Ok(vm.type_of(obj));
            }
            if let Some(v) = builtin_property(obj, name) {
                return Ok(v);
            }
            if methods::has_type_method(obj, name) {
                return Ok(method_marker(name, obj));
            }
            Err(attr_missing(obj, name))
        }
    }
}

/// The bound form of a builtin type method: a `(name, receiver)` pair that
/// the call machinery dispatches through `methods::call_type_method` without
/// re-resolving.
fn method_marker(name: &str, recv: &Value) -> Value {
    Value::BoundMethod(Rc::new(BoundMethod {
        func: Value::str(name),
        receiver: recv.clone(),
    }))
}

fn attr_missing(obj: &Value, name: &str) -> VmError {
    PyExc::attribute_error(&obj.type_name(), name).into()
}

/// Numeric pseudo-properties (`int.real`, `complex.imag`, ...).
fn builtin_property(obj: &Value, name: &str) -> Option<Value> {
    match obj {
        Value::Int(_) | Value::BigInt(_) | Value::Bool(_) => match name {
            "real" | "numerator" => Some(match obj {
                Value::Bool(b) => Value::Int(i64::from(*b)),
                other => other.clone(),
            }),
            "imag" => Some(Value::Int(0)),
            "denominator" => Some(Value::Int(1)),
            _ => None,
        },
        Value::Float(f) => match name {
            "real" => Some(Value::Float(*f)),
            "imag" => Some(Value::Float(0.0)),
            _ => None,
        },
        Value::Complex { re, im } => match name {
            "real" => Some(Value::Float(*re)),
            "imag" => Some(Value::Float(*im)),
            _ => None,
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

fn instance_get_attr(
    vm: &mut Vm,
    obj: &Value,
    inst: &InstanceRef,
    name: &str,
) -> VmResult<Value> {
    let class = inst.class_value();

    match name {
        "__dict__" => {
            // The live proxy: mutations through it hit the instance.
            return match inst.dict() {
                Some(d) => Ok(Value::Dict(d)),
                None => Err(attr_missing(obj, name)),
            };
        }
        "__class__" => return Ok(class),
        _ => {}
    }

    // Pass 1: data descriptors on the class shadow everything.
    if let Some(class_attr) = find_in_mro(&class, name) {
        match &class_attr {
            Value::Property(p) if p.is_data() => {
                return match &p.fget {
                    Some(f) => vm.call_value(f.clone(), vec![obj.clone()]),
                    None => Err(PyExc::new(
                        ExcType::AttributeError,
                        format!("property '{name}' has no getter"),
                    )
                    .into()),
                };
            }
            Value::Instance(_) if is_data_descriptor(&class_attr) => {
                if let Some(get) = vm.lookup_dunder(&class_attr, "__get__") {
                    return vm.call_value(get, vec![obj.clone(), class]);
                }
            }
            _ => {}
        }
    }

    // Pass 2: the instance's own storage.
    match &inst.storage {
        InstanceStorage::Dict(d) => {
            if let Some(v) = d.borrow().get_str(name) {
                return Ok(v.clone());
            }
        }
        InstanceStorage::Slots(slots) => {
            if let Value::Class(c) = &class {
                if let Some(i) = c.slot_index(name) {
                    if let Some(v) = slots.borrow()[i].clone() {
                        return Ok(v);
                    }
                    return Err(attr_missing(obj, name));
                }
            }
        }
    }

    // Pass 3: non-data class attributes and descriptors.
    if let Some(class_attr) = find_in_mro(&class, name) {
        return bind_class_attr(vm, obj, &class, class_attr);
    }

    // Builtin bases contribute their method tables (user exceptions get
    // `add_note`, subclasses of builtin containers would get theirs).
    if methods::has_type_method(obj, name) {
        return Ok(method_marker(name, obj));
    }

    // Pass 4: __getattr__ hook.
    if let Some(hook) = find_in_mro(&class, "__getattr__") {
        let bound = bind_class_attr(vm, obj, &class, hook)?;
        return vm.call_value(bound, vec![Value::str(name)]);
    }

    Err(PyExc::attribute_error(&class_name_of(&class), name).into())
}

/// Turn a class-namespace value into what attribute access on an instance
/// yields: functions bind, classmethods bind to the class, staticmethods
/// unwrap, properties call their getter, descriptor objects get `__get__`.
fn bind_class_attr(
    vm: &mut Vm,
    obj: &Value,
    class: &Value,
    class_attr: Value,
) -> VmResult<Value> {
    match class_attr {
        Value::Function(_) | Value::Native(_) | Value::Builtin(_) => {
            Ok(Value::BoundMethod(Rc::new(BoundMethod {
                func: class_attr,
                receiver: obj.clone(),
            })))
        }
        Value::ClassMethod(inner) => Ok(Value::BoundMethod(Rc::new(BoundMethod {
            func: (*inner).clone(),
            receiver: class.clone(),
        }))),
        Value::StaticMethod(inner) => Ok((*inner).clone()),
        Value::Property(p) => match &p.fget {
            Some(f) => vm.call_value(f.clone(), vec![obj.clone()]),
            None => Err(PyExc::new(
                ExcType::AttributeError,
                "property has no getter",
            )
            .into()),
        },
        Value::Instance(_) => {
            if let Some(get) = vm.lookup_dunder(&class_attr, "__get__") {
                return vm.call_value(get, vec![obj.clone(), class.clone()]);
            }
            Ok(class_attr)
        }
        other => Ok(other),
    }
}

/// A descriptor object is "data" when its class defines `__set__` or
/// `__delete__`.
fn is_data_descriptor(v: &Value) -> bool {
    if let Value::Instance(inst) = v {
        let class = inst.class_value();
        return find_in_mro(&class, "__set__").is_some()
            || find_in_mro(&class, "__delete__").is_some();
    }
    false
}

// ---------------------------------------------------------------------------
// Classes and type objects
// ---------------------------------------------------------------------------

fn class_get_attr(vm: &mut Vm, obj: &Value, name: &str) -> VmResult<Value> {
    match name {
        "__name__" => return Ok(Value::str(class_name_of(obj))),
        "__mro__" => return Ok(Value::tuple(mro_of(obj))),
        "__bases__" => {
            let bases = match obj {
                Value::Class(c) => c.bases.clone(),
                Value::ExcClass(e) => match e.parent() {
                    Some(p) => vec![Value::ExcClass(p)],
                    None => vec![Value::Type(PyType::Object)],
                },
                Value::Type(PyType::Object) => vec![],
                Value::Type(PyType::Bool) => vec![Value::Type(PyType::Int)],
                _ => vec![Value::Type(PyType::Object)],
            };
            return Ok(Value::tuple(bases));
        }
        "__dict__" => {
            if let Value::Class(c) = obj {
                return Ok(Value::Dict(c.dict.clone()));
            }
        }
        "__class__" => {
            return Ok(match obj {
                Value::Class(c) => c
                    .metaclass
                    .clone()
                    .unwrap_or(Value::Type(PyType::Type)),
                _ => Value::Type(PyType::Type),
            });
        }
        // Virtual subclass registration, usable on any user class.
        "register" => {
            if let Value::Class(_) = obj {
                let class = obj.clone();
                return Ok(Value::native("register", move |_vm, args| {
                    let sub = args.check_any(1)?;
                    if let Value::Class(c) = &class {
                        c.virtual_subclasses.borrow_mut().push(sub.clone());
                    }
                    Ok(sub)
                }));
            }
        }
        _ => {}
    }

    // Class namespace through the MRO. Functions stay unbound.
    if let Some(v) = find_in_mro(obj, name) {
        return match v {
            Value::ClassMethod(inner) => Ok(Value::BoundMethod(Rc::new(BoundMethod {
                func: (*inner).clone(),
                receiver: obj.clone(),
            }))),
            Value::StaticMethod(inner) => Ok((*inner).clone()),
            other => Ok(other),
        };
    }

    // Type-object conveniences: unbound builtin methods (`str.upper`) and
    // the float classmethods the round-trip contract needs.
    if let Value::Type(t) = obj {
        if *t == PyType::Float && name == "fromhex" {
            return Ok(Value::native("fromhex", |_vm, args| {
                let s = args.check_str(1)?;
                methods::float_from_hex(&s).map(Value::Float)
            }));
        }
        if let Some(v) = unbound_type_method(*t, name) {
            return Ok(v);
        }
    }

    Err(PyExc::new(
        ExcType::AttributeError,
        format!(
            "type object '{}' has no attribute '{name}'",
            class_name_of(obj)
        ),
    )
    .into())
}

/// `str.upper` and friends: an unbound wrapper that takes the receiver as
/// its first positional argument.
fn unbound_type_method(t: PyType, name: &str) -> Option<Value> {
    let probe = match t {
        PyType::Str => Value::str(""),
        PyType::List => Value::list(vec![]),
        PyType::Dict => Value::dict(),
        PyType::Set => Value::set(crate::dict::Set::new()),
        PyType::FrozenSet => Value::frozenset(crate::dict::Set::new()),
        PyType::Tuple => Value::tuple(vec![]),
        PyType::Int => Value::Int(0),
        PyType::Float => Value::Float(0.0),
        PyType::Bytes => Value::bytes(vec![]),
        _ => return None,
    };
    if !methods::has_type_method(&probe, name) {
        return None;
    }
    let name_owned = name.to_string();
    let expect = probe.type_name();
    Some(Value::native(name, move |vm, args| {
        if args.len() == 0 {
            return Err(PyExc::type_error(format!(
                "unbound method {name_owned}() needs an argument"
            )));
        }
        let recv = args.check_any(1)?;
        if recv.type_name() != expect && !(expect == "int" && recv.is_int_like()) {
            return Err(PyExc::type_error(format!(
                "descriptor '{name_owned}' requires a '{expect}' object but received a '{}'",
                recv.type_name()
            )));
        }
        let rest = args.drain_from(2);
        let kwargs = args.take_kwargs();
        match methods::call_type_method(vm, &recv, &name_owned, rest, kwargs) {
            Ok(v) => Ok(v),
            Err(VmError::Exc(e)) => Err(crate::vm::exc_value_to_pyexc(e)),
            Err(VmError::Halt(_)) => Err(PyExc::runtime_error("interrupted")),
        }
    }))
}

// ---------------------------------------------------------------------------
// Exceptions
// ---------------------------------------------------------------------------

fn exception_get_attr(vm: &mut Vm, obj: &Value, name: &str) -> VmResult<Value> {
    let Value::Exception(exc_ref) = obj else { unreachable!() };
    let exc = exc_ref.borrow();
    match name {
        "args" => Ok(Value::tuple(exc.args.clone())),
        "__class__" => Ok(exc.class.clone()),
        "__cause__" => Ok(exc.cause.clone().unwrap_or(Value::None)),
        "__context__" => Ok(exc.context.clone().unwrap_or(Value::None)),
        "__suppress_context__" => Ok(Value::Bool(exc.suppress_context)),
        "__notes__" => Ok(Value::list(
            exc.notes.iter().cloned().map(Value::Str).collect(),
        )),
        "__traceback__" => Ok(Value::None),
        "exceptions" => match &exc.group {
            Some(leaves) => Ok(Value::tuple(leaves.clone())),
            None => Err(attr_missing(obj, name)),
        },
        "message" => Ok(Value::str(exc.message())),
        "value" if matches!(exc.class, Value::ExcClass(ExcType::StopIteration)) => {
            Ok(exc.stop_iteration_value())
        }
        _ => {
            if methods::has_type_method(obj, name) {
                return Ok(method_marker(name, obj));
            }
            // Backing instance attributes, then its class namespace.
            if let Some(inst) = exc.instance.clone() {
                let class = exc.class.clone();
                drop(exc);
                let inst_value = Value::Instance(inst.clone());
                if let Some(d) = inst.dict() {
                    if let Some(v) = d.borrow().get_str(name).cloned() {
                        return Ok(v);
                    }
                }
                if let Some(class_attr) = find_in_mro(&class, name) {
                    return bind_class_attr(vm, &inst_value, &class, class_attr);
                }
            }
            Err(attr_missing(obj, name))
        }
    }
}

// ---------------------------------------------------------------------------
// setattr / delattr
// ---------------------------------------------------------------------------

/// `setattr(obj, name, value)`.
pub(crate) fn set_attr(
    vm: &mut Vm,
    obj: &Value,
    name: &str,
    value: Value,
) -> VmResult<()> {
    match obj {
        Value::Instance(inst) => {
            let class = inst.class_value();

            // User __setattr__ wins (object's default is the plain store).
            if let Some(hook) = find_in_mro(&class, "__setattr__") {
                let bound = bind_class_attr(vm, obj, &class, hook)?;
                vm.call_value(bound, vec![Value::str(name), value])?;
                return Ok(());
            }

            if name == "__class__" {
                if !matches!(value, Value::Class(_)) {
                    return Err(PyExc::type_error(
                        "__class__ must be set to a class",
                    )
                    .into());
                }
                *inst.class.borrow_mut() = value;
                return Ok(());
            }

            // Data descriptors intercept the write.
            if let Some(class_attr) = find_in_mro(&class, name) {
                match &class_attr {
                    Value::Property(p) => {
                        return match &p.fset {
                            Some(f) => {
                                vm.call_value(f.clone(), vec![obj.clone(), value])?;
                                Ok(())
                            }
                            None => Err(PyExc::new(
                                ExcType::AttributeError,
                                format!("property '{name}' has no setter"),
                            )
                            .into()),
                        };
                    }
                    Value::Instance(_) if is_data_descriptor(&class_attr) => {
                        if let Some(set) = vm.lookup_dunder(&class_attr, "__set__") {
                            vm.call_value(set, vec![obj.clone(), value])?;
                            return Ok(());
                        }
                    }
                    _ => {}
                }
            }

            raw_set_instance_attr(inst, &class, name, value)
        }
        Value::Class(c) => {
            c.dict.borrow_mut().insert_str(name, value);
            Ok(())
        }
        Value::Module(m) => {
            m.dict.borrow_mut().insert_str(name, value);
            Ok(())
        }
        Value::Function(f) => {
            if name == "__name__" {
                if let Value::Str(s) = value {
                    *f.name.borrow_mut() = s;
                    return Ok(());
                }
                return Err(PyExc::type_error("__name__ must be set to a string").into());
            }
            f.dict.borrow_mut().insert_str(name, value);
            Ok(())
        }
        Value::Exception(exc) => {
            let mut exc = exc.borrow_mut();
            match name {
                "__cause__" => {
                    exc.cause = match value {
                        Value::None => None,
                        v => Some(v),
                    };
                    // Explicit cause assignment suppresses the implicit
                    // context, matching `raise ... from ...`.
                    exc.suppress_context = true;
                    Ok(())
                }
                "__context__" => {
                    exc.context = match value {
                        Value::None => None,
                        v => Some(v),
                    };
                    Ok(())
                }
                "__suppress_context__" => {
                    drop(exc);
                    let truthy = vm.truthy(&value)?;
                    let Value::Exception(exc) = obj else { unreachable!() };
                    exc.borrow_mut().suppress_context = truthy;
                    Ok(())
                }
                "args" => {
                    let Value::Tuple(items) = value else {
                        return Err(PyExc::type_error("args must be a tuple").into());
                    };
                    exc.args = items.to_vec();
                    Ok(())
                }
                _ => {
                    if let Some(inst) = &exc.instance {
                        if let Some(d) = inst.dict() {
                            d.borrow_mut().insert_str(name, value);
                            return Ok(());
                        }
                    }
                    Err(attr_missing(obj, name))
                }
            }
        }
        _ => Err(PyExc::new(
            ExcType::AttributeError,
            format!(
                "'{}' object has no attribute '{name}'",
                obj.type_name()
            ),
        )
        .into()),
    }
}

/// The plain storage write, shared by the default path and `object.__setattr__`
/// semantics inside user `__setattr__` implementations.
pub(crate) fn raw_set_instance_attr(
    inst: &InstanceRef,
    class: &Value,
    name: &str,
    value: Value,
) -> VmResult<()> {
    match &inst.storage {
        InstanceStorage::Dict(d) => {
            d.borrow_mut().insert_str(name, value);
            Ok(())
        }
        InstanceStorage::Slots(slots) => {
            if let Value::Class(c) = class {
                if let Some(i) = c.slot_index(name) {
                    slots.borrow_mut()[i] = Some(value);
                    return Ok(());
                }
            }
            Err(PyExc::attribute_error(&class_name_of(class), name).into())
        }
    }
}

/// `delattr(obj, name)`.
pub(crate) fn del_attr(vm: &mut Vm, obj: &Value, name: &str) -> VmResult<()> {
    match obj {
        Value::Instance(inst) => {
            let class = inst.class_value();

            if let Some(hook) = find_in_mro(&class, "__delattr__") {
                let bound = bind_class_attr(vm, obj, &class, hook)?;
                vm.call_value(bound, vec![Value::str(name)])?;
                return Ok(());
            }

            if let Some(class_attr) = find_in_mro(&class, name) {
                match &class_attr {
                    Value::Property(p) => {
                        return match &p.fdel {
                            Some(f) => {
                                vm.call_value(f.clone(), vec![obj.clone()])?;
                                Ok(())
                            }
                            None => Err(PyExc::new(
                                ExcType::AttributeError,
                                format!("property '{name}' has no deleter"),
                            )
                            .into()),
                        };
                    }
                    Value::Instance(_) if is_data_descriptor(&class_attr) => {
                        if let Some(del) = vm.lookup_dunder(&class_attr, "__delete__") {
                            vm.call_value(del, vec![obj.clone()])?;
                            return Ok(());
                        }
                    }
                    _ => {}
                }
            }

            let removed = match &inst.storage {
                InstanceStorage::Dict(d) => d.borrow_mut().remove_str(name),
                InstanceStorage::Slots(slots) => {
                    if let Value::Class(c) = &class {
                        match c.slot_index(name) {
                            Some(i) => slots.borrow_mut()[i].take(),
                            None => None,
                        }
                    } else {
                        None
                    }
                }
            };
            match removed {
                Some(old) => {
                    run_finalizer_if_last(vm, old)?;
                    Ok(())
                }
                None => Err(PyExc::attribute_error(&class_name_of(&class), name).into()),
            }
        }
        Value::Class(c) => match c.dict.borrow_mut().remove_str(name) {
            Some(_) => Ok(()),
            None => Err(attr_missing(obj, name)),
        },
        Value::Module(m) => match m.dict.borrow_mut().remove_str(name) {
            Some(_) => Ok(()),
            None => Err(PyExc::new(
                ExcType::AttributeError,
                format!("module '{}' has no attribute '{name}'", m.name),
            )
            .into()),
        },
        _ => Err(attr_missing(obj, name)),
    }
}

/// When an attribute delete drops the last reference to an instance whose
/// class defines `__del__`, run the finalizer now. Best effort: exceptions
/// from `__del__` are swallowed, as finalizer errors are unrecoverable for
/// the deleting code.
fn run_finalizer_if_last(vm: &mut Vm, removed: Value) -> VmResult<()> {
    if let Value::Instance(inst) = &removed {
        if Rc::strong_count(inst) == 1 {
            let class = inst.class_value();
            if let Some(del) = find_in_mro(&class, "__del__") {
                if let Ok(bound) = bind_class_attr(vm, &removed, &class, del) {
                    let _ = vm.call_value(bound, vec![]);
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// dir()
// ---------------------------------------------------------------------------

/// Attribute names for `dir(obj)`: `__dir__` when defined, otherwise the
/// instance dict, the MRO namespaces, and the builtin method tables, sorted
/// and deduplicated.
pub(crate) fn dir_names(vm: &mut Vm, obj: &Value) -> VmResult<Vec<String>> {
    if let Value::Instance(_) = obj {
        if let Some(hook) = vm.lookup_dunder(obj, "__dir__") {
            let listed = vm.call_value(hook, vec![])?;
            let items = vm.iterate_to_vec(listed)?;
            let mut names: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect();
            names.sort();
            return Ok(names);
        }
    }

    let mut names: Vec<String> = Vec::new();
    match obj {
        Value::Instance(inst) => {
            if let Some(d) = inst.dict() {
                names.extend(
                    d.borrow()
                        .keys()
                        .iter()
                        .filter_map(|k| k.as_str().map(str::to_owned)),
                );
            }
            collect_mro_names(&inst.class_value(), &mut names);
        }
        Value::Class(_) | Value::Type(_) | Value::ExcClass(_) => {
            collect_mro_names(obj, &mut names);
        }
        Value::Module(m) => {
            names.extend(
                m.dict
                    .borrow()
                    .keys()
                    .iter()
                    .filter_map(|k| k.as_str().map(str::to_owned)),
            );
        }
        _ => {
            names.extend(
                methods::type_method_names(obj)
                    .iter()
                    .map(|s| (*s).to_string()),
            );
            for dunder in common_dunders(obj) {
                names.push((*dunder).to_string());
            }
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

fn collect_mro_names(class: &Value, names: &mut Vec<String>) {
    for c in mro_of(class) {
        if let Value::Class(cls) = &c {
            names.extend(
                cls.dict
                    .borrow()
                    .keys()
                    .iter()
                    .filter_map(|k| k.as_str().map(str::to_owned)),
            );
        }
    }
    names.push("__class__".to_string());
    names.push("__dict__".to_string());
}

/// The dunder protocol a builtin kind advertises through `dir`/`hasattr`.
pub(crate) fn common_dunders(v: &Value) -> &'static [&'static str] {
    match v {
        Value::Int(_) | Value::BigInt(_) | Value::Bool(_) | Value::Float(_) => &[
            "__abs__", "__add__", "__bool__", "__eq__", "__float__", "__floordiv__",
            "__ge__", "__gt__", "__hash__", "__int__", "__le__", "__lt__", "__mod__",
            "__mul__", "__ne__", "__neg__", "__pos__", "__pow__", "__repr__",
            "__str__", "__sub__", "__truediv__",
        ],
        Value::Str(_) => &[
            "__add__", "__contains__", "__eq__", "__ge__", "__getitem__", "__gt__",
            "__hash__", "__iter__", "__le__", "__len__", "__lt__", "__mod__",
            "__mul__", "__ne__", "__repr__", "__str__",
        ],
        Value::List(_) => &[
            "__add__", "__contains__", "__delitem__", "__eq__", "__getitem__",
            "__iadd__", "__iter__", "__len__", "__mul__", "__ne__", "__repr__",
            "__reversed__", "__setitem__",
        ],
        Value::Dict(_) => &[
            "__contains__", "__delitem__", "__eq__", "__getitem__", "__iter__",
            "__len__", "__ne__", "__or__", "__repr__", "__setitem__",
        ],
        Value::Set(_) | Value::FrozenSet(_) => &[
            "__and__", "__contains__", "__eq__", "__iter__", "__len__", "__or__",
            "__repr__", "__sub__", "__xor__",
        ],
        Value::Tuple(_) => &[
            "__add__", "__contains__", "__eq__", "__getitem__", "__hash__",
            "__iter__", "__len__", "__mul__", "__repr__",
        ],
        _ => &["__eq__", "__hash__", "__repr__", "__str__"],
    }
}

// ---------------------------------------------------------------------------
// Method-load fast path
// ---------------------------------------------------------------------------

/// Resolution for `LOAD_METHOD`: returns `(func_slot, self_slot)`.
///
/// Builtin receivers get the `(name, receiver)` marker pair so `CALL_METHOD`
/// dispatches straight into the type method tables; instance lookups that
/// land on a plain function return `(function, receiver)` without building a
/// bound method. Everything else falls back to a full `getattr` with
/// `NotImplemented` marking "call without a receiver".
pub(crate) fn load_method(
    vm: &mut Vm,
    obj: &Value,
    name: &str,
) -> VmResult<(Value, Value)> {
    if methods::has_type_method(obj, name) && !matches!(obj, Value::Instance(_)) {
        return Ok((Value::str(name), obj.clone()));
    }

    if let Value::Instance(inst) = obj {
        let class = inst.class_value();
        let shadowed = match &inst.storage {
            InstanceStorage::Dict(d) => d.borrow().get_str(name).is_some(),
            InstanceStorage::Slots(_) => true,
        };
        if !shadowed {
            if let Some(Value::Function(f)) = find_in_mro(&class, name) {
                return Ok((Value::Function(f), obj.clone()));
            }
        }
    }

    let resolved = get_attr(vm, obj, name)?;
    Ok((resolved, Value::NotImplemented))
}
