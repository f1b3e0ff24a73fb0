//! The user-defined object model: classes, instances, functions, methods,
//! modules, and descriptors.
//!
//! A class holds its namespace dict, its direct bases, and its fully
//! C3-linearized MRO (self first, `object` last). Attribute lookup walks the
//! MRO; see `attr.rs` for the descriptor protocol built on top.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::bytecode::CodeObject;
use crate::exceptions::ExcType;
use crate::intern::PyStr;
use crate::value::{CellRef, ClassRef, DictRef, PyType, Value};

/// A user-defined class.
pub struct Class {
    pub name: PyStr,
    /// Direct bases: user classes, builtin exception classes, or `object`.
    pub bases: Vec<Value>,
    /// The class namespace. Mutable so `C.attr = x` works after creation.
    pub dict: DictRef,
    /// Linearized method resolution order, starting with this class itself
    /// and always ending with `object`.
    pub mro: RefCell<Vec<Value>>,
    /// The metaclass, when one other than `type` was requested.
    pub metaclass: Option<Value>,
    /// Classes registered as virtual subclasses; `isinstance`/`issubclass`
    /// honor them without affecting the MRO.
    pub virtual_subclasses: RefCell<Vec<Value>>,
    /// Fixed attribute slots when the body declared `__slots__`.
    pub slots: Option<Vec<PyStr>>,
}

impl Class {
    /// Look up a name in this class's own namespace only.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.dict.borrow().get_str(name).cloned()
    }

    /// Position of a slot name, when this class uses `__slots__`.
    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.slots
            .as_ref()
            .and_then(|slots| slots.iter().position(|s| s.as_str() == name))
    }
}

/// Mutable attribute storage of one instance.
pub enum InstanceStorage {
    /// The common case: a live attribute dict. `obj.__dict__` hands out this
    /// same shared table, so mutations through either side are visible to
    /// the other.
    Dict(DictRef),
    /// Fixed storage for classes that declare `__slots__`.
    Slots(RefCell<Vec<Option<Value>>>),
}

/// An instance of a user-defined class.
pub struct Instance {
    /// The class, assignable through `__class__`.
    pub class: RefCell<Value>,
    pub storage: InstanceStorage,
}

impl Instance {
    pub fn new(class: Value) -> Self {
        let storage = match &class {
            Value::Class(c) => match &c.slots {
                Some(slots) => {
                    InstanceStorage::Slots(RefCell::new(vec![None; slots.len()]))
                }
                None => InstanceStorage::Dict(Rc::new(RefCell::new(
                    crate::dict::Dict::new(),
                ))),
            },
            _ => InstanceStorage::Dict(Rc::new(RefCell::new(crate::dict::Dict::new()))),
        };
        Self {
            class: RefCell::new(class),
            storage,
        }
    }

    pub fn class_value(&self) -> Value {
        self.class.borrow().clone()
    }

    pub fn class_name(&self) -> String {
        class_name_of(&self.class.borrow())
    }

    /// The live attribute dict, absent for `__slots__` instances.
    pub fn dict(&self) -> Option<DictRef> {
        match &self.storage {
            InstanceStorage::Dict(d) => Some(d.clone()),
            InstanceStorage::Slots(_) => None,
        }
    }
}

/// A function compiled from Python source.
pub struct Function {
    pub code: Rc<CodeObject>,
    /// The globals of the defining module; every call executes against them.
    pub globals: DictRef,
    pub defaults: Vec<Value>,
    pub kw_defaults: Vec<(PyStr, Value)>,
    /// Cells captured at definition time, one per free variable of `code`.
    pub closure: Vec<CellRef>,
    pub name: RefCell<PyStr>,
    pub doc: Option<PyStr>,
    /// `f.attr = x` storage.
    pub dict: DictRef,
}

/// A `(callable, receiver)` pair produced by attribute lookup.
pub struct BoundMethod {
    pub func: Value,
    pub receiver: Value,
}

/// A loaded module: a name and a live attribute dict.
pub struct Module {
    pub name: PyStr,
    pub dict: DictRef,
    pub doc: RefCell<Option<PyStr>>,
    /// Set while the loader is running; lets a cyclic import observe the
    /// partially-initialized module instead of recursing.
    pub loading: Cell<bool>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        let dict = Rc::new(RefCell::new(crate::dict::Dict::new()));
        dict.borrow_mut().insert_str("__name__", Value::str(name));
        Self {
            name: PyStr::new(name),
            dict,
            doc: RefCell::new(None),
            loading: Cell::new(false),
        }
    }
}

/// The `property` descriptor.
pub struct Property {
    pub fget: Option<Value>,
    pub fset: Option<Value>,
    pub fdel: Option<Value>,
    pub doc: Option<Value>,
}

impl Property {
    /// Whether this property intercepts writes or deletes, which makes it a
    /// data descriptor that shadows the instance dict.
    pub fn is_data(&self) -> bool {
        self.fset.is_some() || self.fdel.is_some()
    }

    pub fn with_getter(&self, f: Value) -> Self {
        Self {
            fget: Some(f),
            fset: self.fset.clone(),
            fdel: self.fdel.clone(),
            doc: self.doc.clone(),
        }
    }

    pub fn with_setter(&self, f: Value) -> Self {
        Self {
            fget: self.fget.clone(),
            fset: Some(f),
            fdel: self.fdel.clone(),
            doc: self.doc.clone(),
        }
    }

    pub fn with_deleter(&self, f: Value) -> Self {
        Self {
            fget: self.fget.clone(),
            fset: self.fset.clone(),
            fdel: Some(f),
            doc: self.doc.clone(),
        }
    }
}

/// A subscripted type such as `list[int]`.
pub struct GenericAlias {
    pub origin: Value,
    pub args: Vec<Value>,
}

// ---------------------------------------------------------------------------
// MRO machinery
// ---------------------------------------------------------------------------

/// Human-readable name of anything usable as a class.
pub fn class_name_of(v: &Value) -> String {
    match v {
        Value::Class(c) => c.name.to_string(),
        Value::Type(t) => t.name().to_string(),
        Value::ExcClass(e) => e.name().to_string(),
        other => other.type_name(),
    }
}

/// The MRO of anything usable as a class, self first, `object` last.
pub fn mro_of(v: &Value) -> Vec<Value> {
    match v {
        Value::Class(c) => c.mro.borrow().clone(),
        Value::ExcClass(e) => {
            let mut out: Vec<Value> = e.mro().into_iter().map(Value::ExcClass).collect();
            out.push(Value::Type(PyType::Object));
            out
        }
        Value::Type(PyType::Object) => vec![Value::Type(PyType::Object)],
        Value::Type(PyType::Bool) => vec![
            Value::Type(PyType::Bool),
            Value::Type(PyType::Int),
            Value::Type(PyType::Object),
        ],
        Value::Type(t) => vec![Value::Type(*t), Value::Type(PyType::Object)],
        _ => vec![v.clone()],
    }
}

/// Whether two class-like values denote the same class.
pub fn same_class(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Class(x), Value::Class(y)) => Rc::ptr_eq(x, y),
        (Value::Type(x), Value::Type(y)) => x == y,
        (Value::ExcClass(x), Value::ExcClass(y)) => x == y,
        _ => false,
    }
}

/// C3 linearization over the bases of a new class.
///
/// `head` is the class being created. Returns an error message (wrapped into
/// a `TypeError` by the caller) when no consistent order exists.
pub fn c3_linearize(head: Value, bases: &[Value]) -> Result<Vec<Value>, String> {
    // Sequences to merge: each base's MRO, then the list of bases itself.
    let mut seqs: Vec<Vec<Value>> = bases.iter().map(mro_of).collect();
    seqs.push(bases.to_vec());

    let mut out = vec![head];
    loop {
        // Drop exhausted sequences.
        seqs.retain(|s| !s.is_empty());
        if seqs.is_empty() {
            // Every linearization ends at object exactly once.
            if !out.iter().any(|c| same_class(c, &Value::Type(PyType::Object))) {
                out.push(Value::Type(PyType::Object));
            }
            return Ok(out);
        }

        // A good head appears in no tail of any sequence.
        let mut candidate = None;
        'search: for seq in &seqs {
            let h = &seq[0];
            for other in &seqs {
                if other[1..].iter().any(|c| same_class(c, h)) {
                    continue 'search;
                }
            }
            candidate = Some(h.clone());
            break;
        }

        let Some(winner) = candidate else {
            return Err(
                "Cannot create a consistent method resolution order (MRO) for bases"
                    .to_string(),
            );
        };

        if !out.iter().any(|c| same_class(c, &winner)) {
            out.push(winner.clone());
        }
        for seq in &mut seqs {
            if same_class(&seq[0], &winner) {
                seq.remove(0);
            }
        }
    }
}

/// Walk a class-like value's MRO looking for a named attribute in user-class
/// namespaces. Builtin types in the MRO are skipped here; their method tables
/// live in `methods.rs` and are consulted by the attribute engine.
pub fn find_in_mro(class: &Value, name: &str) -> Option<Value> {
    for c in mro_of(class) {
        if let Value::Class(cls) = &c {
            if let Some(v) = cls.get(name) {
                return Some(v);
            }
        }
    }
    None
}

/// `issubclass` without virtual-subclass or metaclass hooks: MRO membership.
pub fn mro_contains(class: &Value, target: &Value) -> bool {
    mro_of(class).iter().any(|c| same_class(c, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn make_class(name: &str, bases: Vec<Value>) -> Value {
        let head = Class {
            name: PyStr::new(name),
            bases: bases.clone(),
            dict: Rc::new(RefCell::new(crate::dict::Dict::new())),
            mro: RefCell::new(Vec::new()),
            metaclass: None,
            virtual_subclasses: RefCell::new(Vec::new()),
            slots: None,
        };
        let class = Value::Class(Rc::new(head));
        let mro = c3_linearize(class.clone(), &bases).unwrap();
        if let Value::Class(c) = &class {
            *c.mro.borrow_mut() = mro;
        }
        class
    }

    fn names(v: &Value) -> Vec<String> {
        mro_of(v).iter().map(class_name_of).collect()
    }

    #[test]
    fn single_inheritance_chain() {
        let a = make_class("A", vec![Value::Type(PyType::Object)]);
        let b = make_class("B", vec![a.clone()]);
        assert_eq!(names(&b), ["B", "A", "object"]);
    }

    #[test]
    fn diamond_is_linearized() {
        let a = make_class("A", vec![Value::Type(PyType::Object)]);
        let b = make_class("B", vec![a.clone()]);
        let c = make_class("C", vec![a.clone()]);
        let d = make_class("D", vec![b.clone(), c.clone()]);
        assert_eq!(names(&d), ["D", "B", "C", "A", "object"]);
    }

    #[test]
    fn inconsistent_order_is_rejected() {
        let a = make_class("A", vec![Value::Type(PyType::Object)]);
        let b = make_class("B", vec![a.clone()]);
        // class C(A, B) is invalid: A precedes B but B's MRO puts B before A.
        let err = c3_linearize(
            Value::str("head-placeholder"),
            &[a.clone(), b.clone()],
        );
        assert!(err.is_err());
    }

    #[test]
    fn bool_is_a_subtype_of_int() {
        assert!(mro_contains(
            &Value::Type(PyType::Bool),
            &Value::Type(PyType::Int)
        ));
    }
}
