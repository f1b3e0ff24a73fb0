//! The embedding surface: native-function arguments, the value stack API,
//! and host registration.
//!
//! Native functions receive the VM plus an [`Args`] view with 1-based,
//! position-naming checked accessors, so a host function reads like:
//!
//! ```
//! use krait::{Value, Vm};
//!
//! let mut vm = Vm::new();
//! vm.register("clamp", |_vm, args| {
//!     let x = args.check_int(1)?;
//!     let lo = args.opt_int(2, 0);
//!     let hi = args.opt_int(3, 100);
//!     Ok(Value::Int(x.clamp(lo, hi)))
//! });
//! assert_eq!(vm.run("clamp(250, 0, 99)").unwrap(), Value::Int(99));
//! ```
//!
//! The VM also exposes a plain value stack for staging data across host
//! calls: `push`/`pop`/`get_top`/`set_top`/`get` with 1-based indices where
//! negative counts from the top.

use std::rc::Rc;

use crate::exceptions::{ExcType, PyExc};
use crate::intern::PyStr;
use crate::value::{Metatable, UserData, Value};
use crate::vm::Vm;

/// Arguments handed to a native function.
pub struct Args {
    pos: Vec<Value>,
    kw: Vec<(PyStr, Value)>,
}

impl Args {
    pub(crate) fn new(pos: Vec<Value>, kw: Vec<(PyStr, Value)>) -> Self {
        Self { pos, kw }
    }

    /// Positional-only arguments, mostly for tests and internal calls.
    pub fn positional(pos: Vec<Value>) -> Self {
        Self {
            pos,
            kw: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    /// The argument at 1-based position `i`, `None` when absent.
    pub fn get(&self, i: usize) -> Value {
        if i == 0 {
            return Value::None;
        }
        self.pos.get(i - 1).cloned().unwrap_or(Value::None)
    }

    /// A keyword argument by name.
    pub fn kwarg(&self, name: &str) -> Option<Value> {
        self.kw
            .iter()
            .find(|(k, _)| k.as_str() == name)
            .map(|(_, v)| v.clone())
    }

    pub(crate) fn kwargs(&self) -> &[(PyStr, Value)] {
        &self.kw
    }

    pub(crate) fn take_kwargs(&mut self) -> Vec<(PyStr, Value)> {
        std::mem::take(&mut self.kw)
    }

    /// Remove and return the arguments from 1-based position `i` onward.
    pub(crate) fn drain_from(&mut self, i: usize) -> Vec<Value> {
        let start = (i - 1).min(self.pos.len());
        self.pos.split_off(start)
    }

    fn missing(&self, i: usize, expected: &str) -> PyExc {
        PyExc::type_error(format!("argument {i} is required and must be {expected}"))
    }

    fn mismatch(&self, i: usize, expected: &str, got: &Value) -> PyExc {
        PyExc::type_error(format!(
            "argument {i} must be {expected}, not {}",
            got.type_name()
        ))
    }

    // -- Checked accessors --------------------------------------------------

    /// The argument at position `i`, required to be present.
    pub fn check_any(&self, i: usize) -> Result<Value, PyExc> {
        self.pos
            .get(i.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| self.missing(i, "a value"))
    }

    pub fn check_int(&self, i: usize) -> Result<i64, PyExc> {
        let v = self.check_any(i).map_err(|_| self.missing(i, "int"))?;
        v.as_int().ok_or_else(|| self.mismatch(i, "int", &v))
    }

    pub fn check_float(&self, i: usize) -> Result<f64, PyExc> {
        let v = self.check_any(i).map_err(|_| self.missing(i, "float"))?;
        v.as_float().ok_or_else(|| self.mismatch(i, "float", &v))
    }

    pub fn check_str(&self, i: usize) -> Result<String, PyExc> {
        let v = self.check_any(i).map_err(|_| self.missing(i, "str"))?;
        v.as_str()
            .map(str::to_owned)
            .ok_or_else(|| self.mismatch(i, "str", &v))
    }

    pub fn check_bool(&self, i: usize) -> Result<bool, PyExc> {
        let v = self.check_any(i).map_err(|_| self.missing(i, "bool"))?;
        v.as_bool().ok_or_else(|| self.mismatch(i, "bool", &v))
    }

    pub fn check_list(&self, i: usize) -> Result<Vec<Value>, PyExc> {
        let v = self.check_any(i).map_err(|_| self.missing(i, "list"))?;
        match &v {
            Value::List(items) => Ok(items.borrow().clone()),
            _ => Err(self.mismatch(i, "list", &v)),
        }
    }

    pub fn check_dict(&self, i: usize) -> Result<crate::value::DictRef, PyExc> {
        let v = self.check_any(i).map_err(|_| self.missing(i, "dict"))?;
        match &v {
            Value::Dict(d) => Ok(d.clone()),
            _ => Err(self.mismatch(i, "dict", &v)),
        }
    }

    pub fn check_user_data(&self, i: usize) -> Result<Rc<UserData>, PyExc> {
        let v = self.check_any(i).map_err(|_| self.missing(i, "userdata"))?;
        match &v {
            Value::UserData(ud) => Ok(ud.clone()),
            _ => Err(self.mismatch(i, "userdata", &v)),
        }
    }

    // -- Coercive accessors -------------------------------------------------

    pub fn to_int(&self, i: usize) -> i64 {
        let v = self.get(i);
        v.as_int()
            .or_else(|| v.as_float().map(|f| f as i64))
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .unwrap_or(0)
    }

    pub fn to_float(&self, i: usize) -> f64 {
        let v = self.get(i);
        v.as_float()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .unwrap_or(0.0)
    }

    pub fn to_string(&self, i: usize) -> String {
        crate::format::plain_str(&self.get(i))
    }

    pub fn to_bool(&self, i: usize) -> bool {
        self.get(i).is_truthy()
    }

    // -- Optional accessors -------------------------------------------------

    pub fn opt_int(&self, i: usize, default: i64) -> i64 {
        match self.get(i) {
            Value::None => default,
            v => v.as_int().unwrap_or(default),
        }
    }

    pub fn opt_float(&self, i: usize, default: f64) -> f64 {
        match self.get(i) {
            Value::None => default,
            v => v.as_float().unwrap_or(default),
        }
    }

    pub fn opt_str(&self, i: usize, default: &str) -> String {
        match self.get(i) {
            Value::None => default.to_owned(),
            v => v.as_str().map_or_else(|| default.to_owned(), str::to_owned),
        }
    }

    pub fn opt_bool(&self, i: usize, default: bool) -> bool {
        match self.get(i) {
            Value::None => default,
            v => v.as_bool().unwrap_or(default),
        }
    }
}

impl Vm {
    // -- Value stack --------------------------------------------------------

    /// Push a value onto the embedding stack.
    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    /// Pop the top of the embedding stack; `None` when empty.
    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::None)
    }

    /// Current stack height.
    pub fn get_top(&self) -> usize {
        self.stack.len()
    }

    /// Resize the stack: a positive `n` is an absolute height; a
    /// non-positive `n` addresses relative to the top as `SP + n + 1`, so
    /// `-1` names the current top (no change) and `-2` drops one element.
    /// Growing fills with `None`.
    pub fn set_top(&mut self, n: isize) {
        let target = if n > 0 {
            n as usize
        } else {
            (self.stack.len() as isize + n + 1).max(0) as usize
        };
        if target <= self.stack.len() {
            self.stack.truncate(target);
        } else {
            self.stack.resize(target, Value::None);
        }
    }

    /// The value at 1-based index `idx`; negative indexes from the top.
    /// Out-of-range reads return `None` rather than failing.
    pub fn get(&self, idx: isize) -> Value {
        self.stack_slot(idx).cloned().unwrap_or(Value::None)
    }

    fn stack_slot(&self, idx: isize) -> Option<&Value> {
        if idx > 0 {
            self.stack.get(idx as usize - 1)
        } else if idx < 0 {
            let len = self.stack.len() as isize;
            let i = len + idx;
            if i >= 0 {
                self.stack.get(i as usize)
            } else {
                None
            }
        } else {
            None
        }
    }

    // -- Checked stack accessors --------------------------------------------

    pub fn check_int(&self, idx: isize) -> Result<i64, PyExc> {
        let v = self.get(idx);
        v.as_int()
            .ok_or_else(|| stack_mismatch(idx, "int", &v))
    }

    pub fn check_float(&self, idx: isize) -> Result<f64, PyExc> {
        let v = self.get(idx);
        v.as_float()
            .ok_or_else(|| stack_mismatch(idx, "float", &v))
    }

    pub fn check_str(&self, idx: isize) -> Result<String, PyExc> {
        let v = self.get(idx);
        v.as_str()
            .map(str::to_owned)
            .ok_or_else(|| stack_mismatch(idx, "str", &v))
    }

    pub fn check_bool(&self, idx: isize) -> Result<bool, PyExc> {
        let v = self.get(idx);
        v.as_bool()
            .ok_or_else(|| stack_mismatch(idx, "bool", &v))
    }

    pub fn check_list(&self, idx: isize) -> Result<Vec<Value>, PyExc> {
        match self.get(idx) {
            Value::List(items) => Ok(items.borrow().clone()),
            v => Err(stack_mismatch(idx, "list", &v)),
        }
    }

    pub fn check_dict(&self, idx: isize) -> Result<crate::value::DictRef, PyExc> {
        match self.get(idx) {
            Value::Dict(d) => Ok(d),
            v => Err(stack_mismatch(idx, "dict", &v)),
        }
    }

    pub fn check_user_data(&self, idx: isize) -> Result<Rc<UserData>, PyExc> {
        match self.get(idx) {
            Value::UserData(ud) => Ok(ud),
            v => Err(stack_mismatch(idx, "userdata", &v)),
        }
    }

    // -- Coercive stack accessors -------------------------------------------

    pub fn to_int(&self, idx: isize) -> i64 {
        let v = self.get(idx);
        v.as_int()
            .or_else(|| v.as_float().map(|f| f as i64))
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .unwrap_or(0)
    }

    pub fn to_float(&self, idx: isize) -> f64 {
        let v = self.get(idx);
        v.as_float()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .unwrap_or(0.0)
    }

    pub fn to_string_at(&self, idx: isize) -> String {
        crate::format::plain_str(&self.get(idx))
    }

    pub fn to_bool(&self, idx: isize) -> bool {
        self.get(idx).is_truthy()
    }

    // -- Optional stack accessors -------------------------------------------

    pub fn opt_int(&self, idx: isize, default: i64) -> i64 {
        match self.get(idx) {
            Value::None => default,
            v => v.as_int().unwrap_or(default),
        }
    }

    pub fn opt_float(&self, idx: isize, default: f64) -> f64 {
        match self.get(idx) {
            Value::None => default,
            v => v.as_float().unwrap_or(default),
        }
    }

    pub fn opt_str(&self, idx: isize, default: &str) -> String {
        match self.get(idx) {
            Value::None => default.to_owned(),
            v => v.as_str().map_or_else(|| default.to_owned(), str::to_owned),
        }
    }

    pub fn opt_bool(&self, idx: isize, default: bool) -> bool {
        match self.get(idx) {
            Value::None => default,
            v => v.as_bool().unwrap_or(default),
        }
    }

    // -- Registration -------------------------------------------------------

    /// Register a native function as a global.
    pub fn register(
        &mut self,
        name: &str,
        f: impl Fn(&mut Vm, &mut Args) -> Result<Value, PyExc> + 'static,
    ) {
        let value = Value::native(name, f);
        self.set_global(name, value);
    }

    /// Register a native function in the builtins namespace, visible even
    /// when a global of the same name is later deleted.
    pub fn register_builtin(
        &mut self,
        name: &str,
        f: impl Fn(&mut Vm, &mut Args) -> Result<Value, PyExc> + 'static,
    ) {
        let value = Value::native(name, f);
        self.set_builtin(name, value);
    }

    /// Register a batch of functions at once.
    pub fn register_fns(
        &mut self,
        fns: Vec<(
            &str,
            Box<dyn Fn(&mut Vm, &mut Args) -> Result<Value, PyExc>>,
        )>,
    ) {
        for (name, f) in fns {
            let value = Value::Native(Rc::new(crate::value::NativeFunction {
                name: PyStr::new(name),
                func: Rc::from(f),
            }));
            self.set_global(name, value);
        }
    }

    /// Wrap a host value as userdata with an optional metatable.
    pub fn new_user_data(
        &mut self,
        data: Rc<dyn std::any::Any>,
        metatable: Option<Rc<Metatable>>,
    ) -> Value {
        Value::user_data(data, metatable)
    }

    /// Build a native function value without registering it.
    pub fn new_function(
        &mut self,
        name: &str,
        f: impl Fn(&mut Vm, &mut Args) -> Result<Value, PyExc> + 'static,
    ) -> Value {
        Value::native(name, f)
    }
}

fn stack_mismatch(idx: isize, expected: &str, got: &Value) -> PyExc {
    PyExc::type_error(format!(
        "argument {idx} must be {expected}, not {}",
        got.type_name()
    ))
}

/// Build a typed exception from a `"TypeName: message"` string, the
/// last-resort translation for untyped host errors. Unknown or missing
/// prefixes produce a `RuntimeError`.
pub fn raise_error(message: &str) -> PyExc {
    if let Some((prefix, rest)) = message.split_once(':') {
        if let Some(ty) = ExcType::from_name(prefix.trim()) {
            return PyExc::new(ty, rest.trim());
        }
    }
    PyExc::new(ExcType::RuntimeError, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_error_parses_typed_prefixes() {
        let e = raise_error("ValueError: bad input");
        assert_eq!(e.class_name(), "ValueError");
        assert_eq!(e.message(), "bad input");

        let e = raise_error("SomethingElse: nope");
        assert_eq!(e.class_name(), "RuntimeError");

        let e = raise_error("no prefix at all");
        assert_eq!(e.class_name(), "RuntimeError");
    }

    #[test]
    fn args_accessors() {
        let args = Args::positional(vec![Value::Int(7), Value::str("x")]);
        assert_eq!(args.check_int(1).unwrap(), 7);
        assert_eq!(args.check_str(2).unwrap(), "x");
        assert!(args.check_int(2).is_err());
        assert!(args.check_any(3).is_err());
        assert_eq!(args.opt_int(3, 42), 42);
        assert_eq!(args.to_int(2), 0);
        assert_eq!(args.get(3), Value::None);
    }
}
