//! The runtime value model.
//!
//! A [`Value`] is one Python object. Immediates (`None`, booleans, machine
//! integers, floats, complex numbers) are stored inline; everything else is
//! reference-counted so that assignment and argument passing have Python's
//! aliasing semantics. A single VM is single-threaded, so `Rc`/`RefCell` is
//! the ownership model throughout.
//!
//! Identity (`is`) is pointer identity for heap values and value identity for
//! immediates. Because small integers are stored inline, the small-int cache
//! contract (`a is b` for equal ints in the cached range) holds by
//! construction, and interned short strings share one allocation so `is` is
//! cheap for them too.

use std::any::Any;
use std::cell::{Cell as StdCell, RefCell};
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::builtins::Builtin;
use crate::bytecode::CodeObject;
use crate::dict::{Dict, Set};
use crate::exceptions::PyExc;
use crate::frame::Ctrl;
use crate::intern::PyStr;
use crate::iter::{Generator, PyIter};
use crate::object::{
    BoundMethod, Class, Function, GenericAlias, Instance, Module, Property,
};

/// Shared mutable list storage.
pub type ListRef = Rc<RefCell<Vec<Value>>>;
/// Shared mutable dict storage.
pub type DictRef = Rc<RefCell<Dict>>;
/// Shared mutable set storage.
pub type SetRef = Rc<RefCell<Set>>;
/// A closure cell: one mutable slot shared between an enclosing function and
/// every closure that captured it. An empty cell means the variable is
/// unbound.
pub type CellRef = Rc<RefCell<Option<Value>>>;
/// Shared class storage.
pub type ClassRef = Rc<Class>;
/// Shared instance storage.
pub type InstanceRef = Rc<Instance>;
/// Shared exception storage. Mutable because `__cause__`, `__context__`, and
/// notes are assignable after construction.
pub type ExcRef = Rc<RefCell<PyExc>>;

/// A Python value.
///
/// The variants mirror the runtime type lattice: one variant per builtin
/// kind, plus class/instance/module for the user-defined object model and a
/// handful of callable shapes. `NotImplemented` is its own variant because
/// binary dispatch passes it around as an ordinary value.
#[derive(Clone)]
pub enum Value {
    None,
    NotImplemented,
    Bool(bool),
    /// Machine integer fast path. Results that overflow promote to `BigInt`;
    /// big results that fit demote back, so a given number has exactly one
    /// representation.
    Int(i64),
    BigInt(Rc<BigInt>),
    Float(f64),
    Complex { re: f64, im: f64 },
    Str(PyStr),
    Bytes(Rc<[u8]>),
    List(ListRef),
    Tuple(Rc<[Value]>),
    Dict(DictRef),
    Set(SetRef),
    FrozenSet(Rc<Set>),
    Range(Rc<RangeObj>),
    Slice(Rc<SliceObj>),
    Iter(Rc<RefCell<PyIter>>),
    Generator(Rc<RefCell<Generator>>),
    /// A function compiled from Python source.
    Function(Rc<Function>),
    /// A host-registered native function.
    Native(Rc<NativeFunction>),
    /// One of the interpreter's own builtin functions (`print`, `len`, ...).
    Builtin(Builtin),
    /// A callable bound to a receiver: `(callable, self)`.
    BoundMethod(Rc<BoundMethod>),
    /// A builtin type object (`int`, `list`, `type`, ...).
    Type(PyType),
    /// A builtin exception class (`ValueError`, ...).
    ExcClass(crate::exceptions::ExcType),
    /// A user-defined class.
    Class(ClassRef),
    Instance(InstanceRef),
    Module(Rc<Module>),
    Exception(ExcRef),
    Code(Rc<CodeObject>),
    Cell(CellRef),
    Property(Rc<Property>),
    ClassMethod(Rc<Value>),
    StaticMethod(Rc<Value>),
    /// `X | Y` over types, usable as the second argument of `isinstance`.
    Union(Rc<[Value]>),
    /// `list[int]` and friends: a subscripted type.
    GenericAlias(Rc<GenericAlias>),
    /// Host-supplied opaque value with an optional metatable.
    UserData(Rc<UserData>),
    /// Internal unwind sentinel used by the block stack while running
    /// `finally` handlers. Never observable from Python code.
    #[doc(hidden)]
    Ctrl(Rc<Ctrl>),
}

/// The builtin (non-exception) type objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyType {
    Object,
    Type,
    NoneType,
    NotImplementedType,
    Bool,
    Int,
    Float,
    Complex,
    Str,
    Bytes,
    List,
    Tuple,
    Dict,
    Set,
    FrozenSet,
    Range,
    Slice,
    FunctionType,
    MethodType,
    ModuleType,
    GeneratorType,
    Coroutine,
    Property,
    ClassMethod,
    StaticMethod,
}

impl PyType {
    /// The name used by `repr(T)`, error messages, and `T.__name__`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Type => "type",
            Self::NoneType => "NoneType",
            Self::NotImplementedType => "NotImplementedType",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Complex => "complex",
            Self::Str => "str",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Dict => "dict",
            Self::Set => "set",
            Self::FrozenSet => "frozenset",
            Self::Range => "range",
            Self::Slice => "slice",
            Self::FunctionType => "function",
            Self::MethodType => "method",
            Self::ModuleType => "module",
            Self::GeneratorType => "generator",
            Self::Coroutine => "coroutine",
            Self::Property => "property",
            Self::ClassMethod => "classmethod",
            Self::StaticMethod => "staticmethod",
        }
    }
}

/// A lazy arithmetic integer sequence. `step` is never zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeObj {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeObj {
    /// Number of elements produced by iteration.
    pub fn len(&self) -> i64 {
        if self.step > 0 {
            if self.stop > self.start {
                (self.stop - self.start + self.step - 1) / self.step
            } else {
                0
            }
        } else if self.start > self.stop {
            (self.start - self.stop - self.step - 1) / -self.step
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `i`, or `None` when out of range. Negative indices wrap.
    pub fn get(&self, i: i64) -> Option<i64> {
        let len = self.len();
        let i = if i < 0 { i + len } else { i };
        if i < 0 || i >= len {
            None
        } else {
            Some(self.start + i * self.step)
        }
    }

    pub fn contains(&self, v: i64) -> bool {
        if self.step > 0 {
            v >= self.start && v < self.stop && (v - self.start) % self.step == 0
        } else {
            v <= self.start && v > self.stop && (self.start - v) % (-self.step) == 0
        }
    }
}

/// A slice object: any of the three fields may be `Value::None`.
#[derive(Clone)]
pub struct SliceObj {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

/// Signature of a host-registered function.
///
/// The function receives the VM (for re-entry, output, and the stack API) and
/// its arguments. A Python-level error is returned as a typed [`PyExc`], not
/// as a panic.
pub type NativeFn =
    Rc<dyn Fn(&mut crate::vm::Vm, &mut crate::embed::Args) -> Result<Value, PyExc>>;

/// A native function registered by the host.
pub struct NativeFunction {
    pub name: PyStr,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

/// A host-supplied opaque value. The metatable, when present, gives the value
/// a type name plus method and property tables so it behaves like an object
/// from Python code.
pub struct UserData {
    pub data: Rc<dyn Any>,
    pub metatable: Option<Rc<Metatable>>,
}

/// Per-type method/property table for [`UserData`] values.
pub struct Metatable {
    pub type_name: String,
    pub methods: Vec<(String, NativeFn)>,
    pub properties: Vec<(String, NativeFn)>,
}

impl Metatable {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Add a method callable as `obj.name(...)`.
    pub fn method(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&mut crate::vm::Vm, &mut crate::embed::Args) -> Result<Value, PyExc> + 'static,
    ) -> &mut Self {
        self.methods.push((name.into(), Rc::new(f)));
        self
    }

    /// Add a read-only property computed on attribute access.
    pub fn property(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&mut crate::vm::Vm, &mut crate::embed::Args) -> Result<Value, PyExc> + 'static,
    ) -> &mut Self {
        self.properties.push((name.into(), Rc::new(f)));
        self
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

impl Value {
    /// Build an integer value.
    ///
    /// Integers are stored inline, so the small-int identity contract (`is`
    /// holds for equal integers in `[-5, 256]`) is satisfied without a cache
    /// table.
    pub fn int(i: i64) -> Self {
        Self::Int(i)
    }

    /// Build an integer from an arbitrary-precision value, demoting to the
    /// machine-int fast path when it fits.
    pub fn from_bigint(b: BigInt) -> Self {
        match b.to_i64() {
            Some(i) => Self::Int(i),
            None => Self::BigInt(Rc::new(b)),
        }
    }

    pub fn float(f: f64) -> Self {
        Self::Float(f)
    }

    pub fn complex(re: f64, im: f64) -> Self {
        Self::Complex { re, im }
    }

    /// Build a string value. Short strings (64 bytes or less) are interned in
    /// the process-wide pool, so equal short strings are identical.
    pub fn str(s: impl AsRef<str>) -> Self {
        Self::Str(PyStr::new(s.as_ref()))
    }

    pub fn bool(b: bool) -> Self {
        Self::Bool(b)
    }

    pub fn bytes(bs: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(Rc::from(bs.into().into_boxed_slice()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Self::Tuple(Rc::from(items.into_boxed_slice()))
    }

    pub fn dict() -> Self {
        Self::Dict(Rc::new(RefCell::new(Dict::new())))
    }

    pub fn set(s: Set) -> Self {
        Self::Set(Rc::new(RefCell::new(s)))
    }

    pub fn frozenset(s: Set) -> Self {
        Self::FrozenSet(Rc::new(s))
    }

    pub fn range(start: i64, stop: i64, step: i64) -> Self {
        debug_assert!(step != 0);
        Self::Range(Rc::new(RangeObj { start, stop, step }))
    }

    /// Wrap a host value as userdata, optionally with a metatable.
    pub fn user_data(data: Rc<dyn Any>, metatable: Option<Rc<Metatable>>) -> Self {
        Self::UserData(Rc::new(UserData { data, metatable }))
    }

    /// Build a native function value.
    pub fn native(
        name: impl AsRef<str>,
        f: impl Fn(&mut crate::vm::Vm, &mut crate::embed::Args) -> Result<Value, PyExc> + 'static,
    ) -> Self {
        Self::Native(Rc::new(NativeFunction {
            name: PyStr::new(name.as_ref()),
            func: Rc::new(f),
        }))
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

impl Value {
    /// Canonical type name, as used in error messages and by `type(v)`.
    pub fn type_name(&self) -> String {
        match self {
            Self::None => "NoneType".into(),
            Self::NotImplemented => "NotImplementedType".into(),
            Self::Bool(_) => "bool".into(),
            Self::Int(_) | Self::BigInt(_) => "int".into(),
            Self::Float(_) => "float".into(),
            Self::Complex { .. } => "complex".into(),
            Self::Str(_) => "str".into(),
            Self::Bytes(_) => "bytes".into(),
            Self::List(_) => "list".into(),
            Self::Tuple(_) => "tuple".into(),
            Self::Dict(_) => "dict".into(),
            Self::Set(_) => "set".into(),
            Self::FrozenSet(_) => "frozenset".into(),
            Self::Range(_) => "range".into(),
            Self::Slice(_) => "slice".into(),
            Self::Iter(it) => it.borrow().type_name().into(),
            Self::Generator(g) => {
                if g.borrow().is_coroutine {
                    "coroutine".into()
                } else {
                    "generator".into()
                }
            }
            Self::Function(_) => "function".into(),
            Self::Native(_) | Self::Builtin(_) => "builtin_function_or_method".into(),
            Self::BoundMethod(m) => match m.func {
                Self::Native(_) | Self::Builtin(_) => "builtin_function_or_method".into(),
                _ => "method".into(),
            },
            Self::Type(_) | Self::ExcClass(_) | Self::Class(_) => "type".into(),
            Self::Instance(inst) => inst.class_name(),
            Self::Module(_) => "module".into(),
            Self::Exception(exc) => exc.borrow().class_name(),
            Self::Code(_) => "code".into(),
            Self::Cell(_) => "cell".into(),
            Self::Property(_) => "property".into(),
            Self::ClassMethod(_) => "classmethod".into(),
            Self::StaticMethod(_) => "staticmethod".into(),
            Self::Union(_) => "UnionType".into(),
            Self::GenericAlias(_) => "types.GenericAlias".into(),
            Self::UserData(ud) => ud
                .metatable
                .as_ref()
                .map_or_else(|| "userdata".into(), |m| m.type_name.clone()),
            Self::Ctrl(_) => "ctrl".into(),
        }
    }

    /// Object identity for `is` / `is not`.
    ///
    /// Heap values compare by pointer; immediates compare by value, which
    /// makes every singleton referentially unique and gives the documented
    /// `is` behavior for cached small integers and interned short strings.
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::NotImplemented, Self::NotImplemented) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::BigInt(a), Self::BigInt(b)) => Rc::ptr_eq(a, b),
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Complex { re: a, im: b }, Self::Complex { re: c, im: d }) => {
                a.to_bits() == c.to_bits() && b.to_bits() == d.to_bits()
            }
            (Self::Str(a), Self::Str(b)) => a.ptr_eq(b),
            (Self::Bytes(a), Self::Bytes(b)) => Rc::ptr_eq(a, b),
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => Rc::ptr_eq(a, b),
            (Self::Set(a), Self::Set(b)) => Rc::ptr_eq(a, b),
            (Self::FrozenSet(a), Self::FrozenSet(b)) => Rc::ptr_eq(a, b),
            (Self::Range(a), Self::Range(b)) => Rc::ptr_eq(a, b),
            (Self::Slice(a), Self::Slice(b)) => Rc::ptr_eq(a, b),
            (Self::Iter(a), Self::Iter(b)) => Rc::ptr_eq(a, b),
            (Self::Generator(a), Self::Generator(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Native(a), Self::Native(b)) => Rc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::BoundMethod(a), Self::BoundMethod(b)) => Rc::ptr_eq(a, b),
            (Self::Type(a), Self::Type(b)) => a == b,
            (Self::ExcClass(a), Self::ExcClass(b)) => a == b,
            (Self::Class(a), Self::Class(b)) => Rc::ptr_eq(a, b),
            (Self::Instance(a), Self::Instance(b)) => Rc::ptr_eq(a, b),
            (Self::Module(a), Self::Module(b)) => Rc::ptr_eq(a, b),
            (Self::Exception(a), Self::Exception(b)) => Rc::ptr_eq(a, b),
            (Self::Code(a), Self::Code(b)) => Rc::ptr_eq(a, b),
            (Self::Cell(a), Self::Cell(b)) => Rc::ptr_eq(a, b),
            (Self::Property(a), Self::Property(b)) => Rc::ptr_eq(a, b),
            (Self::ClassMethod(a), Self::ClassMethod(b)) => Rc::ptr_eq(a, b),
            (Self::StaticMethod(a), Self::StaticMethod(b)) => Rc::ptr_eq(a, b),
            (Self::Union(a), Self::Union(b)) => Rc::ptr_eq(a, b),
            (Self::GenericAlias(a), Self::GenericAlias(b)) => Rc::ptr_eq(a, b),
            (Self::UserData(a), Self::UserData(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// A stable address for cycle tracking in `repr` and equality. Zero for
    /// immediates, which cannot participate in cycles.
    pub(crate) fn heap_id(&self) -> usize {
        match self {
            Self::List(r) => Rc::as_ptr(r) as usize,
            Self::Dict(r) => Rc::as_ptr(r) as usize,
            Self::Set(r) => Rc::as_ptr(r) as usize,
            Self::Tuple(r) => Rc::as_ptr(r) as *const u8 as usize,
            Self::FrozenSet(r) => Rc::as_ptr(r) as usize,
            Self::Instance(r) => Rc::as_ptr(r) as usize,
            Self::Exception(r) => Rc::as_ptr(r) as usize,
            _ => 0,
        }
    }

    /// Truth testing for the builtin kinds.
    ///
    /// Instances are not handled here: the VM consults `__bool__`/`__len__`
    /// and falls back to `true`, see `Vm::truthy`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::BigInt(_) => true, // a big int never normalizes to zero
            Self::Float(f) => *f != 0.0,
            Self::Complex { re, im } => *re != 0.0 || *im != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::List(l) => !l.borrow().is_empty(),
            Self::Tuple(t) => !t.is_empty(),
            Self::Dict(d) => !d.borrow().is_empty(),
            Self::Set(s) => !s.borrow().is_empty(),
            Self::FrozenSet(s) => !s.is_empty(),
            Self::Range(r) => !r.is_empty(),
            _ => true,
        }
    }

    /// Whether this kind can be hashed at all. Mutable containers cannot;
    /// tuples depend on their elements and are checked element-wise by the
    /// hash routine itself.
    pub fn is_hashable_kind(&self) -> bool {
        !matches!(
            self,
            Self::List(_) | Self::Dict(_) | Self::Set(_) | Self::Slice(_)
        )
    }

    // -- Narrowing accessors, best effort -----------------------------------

    /// The integer payload, accepting bool as its numeric value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::BigInt(b) => b.to_i64(),
            _ => None,
        }
    }

    /// The float payload, widening ints and bools.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::BigInt(b) => b.to_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// True for `Int`, `BigInt`, and `Bool` (bool is a subtype of int).
    pub fn is_int_like(&self) -> bool {
        matches!(self, Self::Int(_) | Self::BigInt(_) | Self::Bool(_))
    }

    /// True for any numeric kind up the promotion ladder except complex.
    pub fn is_real_number(&self) -> bool {
        self.is_int_like() || matches!(self, Self::Float(_))
    }
}

// ---------------------------------------------------------------------------
// Structural equality
// ---------------------------------------------------------------------------

/// Equality as the containers see it: structural for builtin kinds with
/// numeric cross-kind coercion, identity for instances and opaque kinds.
///
/// Dunder-aware equality (`__eq__`) lives in the operator layer; this
/// function is the dunder-free core shared by `PartialEq`, dict/set key
/// lookup, and `list.index`-style searches. A visited set keyed by pointer
/// pairs keeps cyclic containers from recursing forever.
pub(crate) fn structural_eq(a: &Value, b: &Value) -> bool {
    let mut seen = Vec::new();
    structural_eq_inner(a, b, &mut seen)
}

fn structural_eq_inner(a: &Value, b: &Value, seen: &mut Vec<(usize, usize)>) -> bool {
    if a.is_identical(b) {
        return true;
    }
    // Numeric cross-kind comparison: bool == int == float == complex(real).
    if let (Some(x), Some(y)) = (numeric_as_complex(a), numeric_as_complex(b)) {
        // Compare exactly; int-vs-float equality goes through f64, which is
        // what the arithmetic itself uses.
        return x == y;
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => x.as_str() == y.as_str(),
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::Range(x), Value::Range(y)) => {
            // Ranges are equal when they describe the same sequence.
            if x.len() != y.len() {
                return false;
            }
            if x.is_empty() {
                return true;
            }
            x.start == y.start && (x.len() == 1 || x.step == y.step)
        }
        (Value::List(x), Value::List(y)) => {
            let key = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
            if seen.contains(&key) {
                return true; // assume equal within a cycle
            }
            seen.push(key);
            let (x, y) = (x.borrow(), y.borrow());
            seq_eq(&x, &y, seen)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_eq(x, y, seen),
        (Value::Dict(x), Value::Dict(y)) => {
            let key = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
            if seen.contains(&key) {
                return true;
            }
            seen.push(key);
            let (x, y) = (x.borrow(), y.borrow());
            if x.len() != y.len() {
                return false;
            }
            let eq = x.iter().all(|(h, k, v)| match y.get_with_hash(h, k) {
                Some(other) => structural_eq_inner(v, other, seen),
                None => false,
            });
            eq
        }
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.set_eq(&y)
        }
        (Value::FrozenSet(x), Value::FrozenSet(y)) => x.set_eq(y),
        (Value::Set(x), Value::FrozenSet(y)) => x.borrow().set_eq(y),
        (Value::FrozenSet(x), Value::Set(y)) => x.set_eq(&y.borrow()),
        (Value::Exception(x), Value::Exception(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

fn seq_eq(a: &[Value], b: &[Value], seen: &mut Vec<(usize, usize)>) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| structural_eq_inner(x, y, seen))
}

/// Widen any real or complex number to a complex pair for comparison.
pub(crate) fn numeric_as_complex(v: &Value) -> Option<(f64, f64)> {
    match v {
        Value::Bool(b) => Some((f64::from(u8::from(*b)), 0.0)),
        Value::Int(i) => Some((*i as f64, 0.0)),
        Value::BigInt(b) => b.to_f64().map(|f| (f, 0.0)),
        Value::Float(f) => Some((*f, 0.0)),
        Value::Complex { re, im } => Some((*re, *im)),
        _ => None,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        // Strict kind-aware equality for host code and tests: numbers compare
        // across int/float like Python, containers compare structurally.
        structural_eq(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::format::plain_repr(self))
    }
}

// ---------------------------------------------------------------------------
// Dunder-free ordering used by sort fallbacks and set subset checks
// ---------------------------------------------------------------------------

/// Total order within orderable kinds, `None` for unordered combinations.
/// The operator layer turns `None` into the usual `TypeError`.
pub(crate) fn structural_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.as_str().cmp(y.as_str())),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return Some(Ordering::Equal);
            }
            seq_cmp(&x.borrow(), &y.borrow())
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x, y),
        _ => {
            if a.is_real_number() && b.is_real_number() {
                let (x, y) = (a.as_float()?, b.as_float()?);
                x.partial_cmp(&y)
            } else {
                None
            }
        }
    }
}

fn seq_cmp(a: &[Value], b: &[Value]) -> Option<Ordering> {
    for (x, y) in a.iter().zip(b.iter()) {
        if !structural_eq(x, y) {
            return structural_cmp(x, y);
        }
    }
    Some(a.len().cmp(&b.len()))
}

/// Tracks `id()`-style addresses while recursing through possibly-cyclic
/// structures for repr.
pub(crate) struct ReprGuard {
    seen: StdCell<Vec<usize>>,
}

impl ReprGuard {
    pub fn new() -> Self {
        Self {
            seen: StdCell::new(Vec::new()),
        }
    }

    /// Returns false when `v` is already being printed further up the stack.
    pub fn enter(&self, v: &Value) -> bool {
        let id = v.heap_id();
        if id == 0 {
            return true;
        }
        let mut seen = self.seen.take();
        let fresh = !seen.contains(&id);
        if fresh {
            seen.push(id);
        }
        self.seen.set(seen);
        fresh
    }

    pub fn leave(&self, v: &Value) {
        let id = v.heap_id();
        if id == 0 {
            return;
        }
        let mut seen = self.seen.take();
        if let Some(pos) = seen.iter().rposition(|&x| x == id) {
            seen.remove(pos);
        }
        self.seen.set(seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_len_and_get() {
        let r = RangeObj {
            start: 0,
            stop: 10,
            step: 3,
        };
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(0), Some(0));
        assert_eq!(r.get(3), Some(9));
        assert_eq!(r.get(-1), Some(9));
        assert_eq!(r.get(4), None);

        let down = RangeObj {
            start: 10,
            stop: 0,
            step: -2,
        };
        assert_eq!(down.len(), 5);
        assert_eq!(down.get(0), Some(10));
        assert_eq!(down.get(4), Some(2));
    }

    #[test]
    fn empty_ranges_compare_equal() {
        let a = Value::range(0, 0, 1);
        let b = Value::range(5, 5, -3);
        assert!(structural_eq(&a, &b));
    }

    #[test]
    fn numeric_cross_kind_equality() {
        assert!(structural_eq(&Value::Int(1), &Value::Float(1.0)));
        assert!(structural_eq(&Value::Bool(true), &Value::Int(1)));
        assert!(!structural_eq(&Value::Int(1), &Value::str("1")));
    }

    #[test]
    fn list_is_not_tuple() {
        let l = Value::list(vec![Value::Int(1)]);
        let t = Value::tuple(vec![Value::Int(1)]);
        assert!(!structural_eq(&l, &t));
    }

    #[test]
    fn cyclic_list_equality_terminates() {
        let a = Value::list(vec![]);
        let b = Value::list(vec![]);
        if let (Value::List(ra), Value::List(rb)) = (&a, &b) {
            ra.borrow_mut().push(a.clone());
            rb.borrow_mut().push(b.clone());
        }
        assert!(structural_eq(&a, &b));
        // Break the cycles so the test does not leak under sanitizers.
        if let (Value::List(ra), Value::List(rb)) = (&a, &b) {
            ra.borrow_mut().clear();
            rb.borrow_mut().clear();
        }
    }
}
