//! The virtual machine: dispatch loop, call protocol, exception engine, and
//! generator resumption.
//!
//! A single `Vm` owns the global namespace, the builtins, the module
//! registry, and the active frame stack. Execution is a fetch-decode-execute
//! loop over the byte stream of the current frame's code object; calls push
//! frames, returns pop them, and exceptions unwind through each frame's
//! block stack before propagating to the caller.
//!
//! Re-entry (operator dunders, `sorted(key=…)`, native callbacks) runs a
//! nested `run_frames` over the same frame stack with a higher base index,
//! sharing the instruction budget and cancellation token.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use crate::attr;
use crate::builtins;
use crate::bytecode::{BinOp, CmpOp, CodeFlags, CodeObject, Opcode, UnOp};
use crate::dict::{Dict, Set};
use crate::embed::Args;
use crate::error::{Error, UncaughtException};
use crate::exceptions::{
    is_exception_class, match_class, ExcType, Halt, PyExc, VmError, VmResult,
};
use crate::frame::{Block, Ctrl, EgState, Frame};
use crate::intern::PyStr;
use crate::iter::{GenState, Generator, IterKind, PyIter};
use crate::modules::{self, ModuleEntry};
use crate::object::{c3_linearize, class_name_of, find_in_mro, BoundMethod, Class, Instance};
use crate::operators;
use crate::resource::{Budget, CancelToken, Limits};
use crate::slice;
use crate::value::{DictRef, PyType, SliceObj, Value};

/// How a `run_frames` invocation ended.
enum Exit {
    Return(Value),
    Yield(Value),
}

/// Result of one instruction.
enum Flow {
    Continue,
    Exit(Exit),
}

/// Result of resuming a generator frame.
enum GenStep {
    Yield(Value),
    Done(Value),
}

/// The bytecode virtual machine.
///
/// ```
/// use krait::{Value, Vm};
///
/// let mut vm = Vm::new();
/// let result = vm.run("sum(x * x for x in range(4))").unwrap();
/// assert_eq!(result, Value::Int(14));
/// ```
pub struct Vm {
    /// Embedding value stack (see the stack API in `embed.rs`).
    pub(crate) stack: Vec<Value>,
    pub(crate) globals: DictRef,
    pub(crate) builtins_ns: DictRef,
    pub(crate) module_registry: AHashMap<String, ModuleEntry>,
    pub(crate) limits: Limits,
    pub(crate) budget: Budget,
    /// Active call frames; generators park theirs elsewhere while suspended.
    frames: Vec<Frame>,
    /// A halt raised while a native callback re-entered Python; re-thrown as
    /// soon as the callback returns, since natives only speak `PyExc`.
    pending_halt: Option<Halt>,
    output: String,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut builtins_dict = Dict::new();
        builtins::install(&mut builtins_dict);
        let mut vm = Self {
            stack: Vec::new(),
            globals: Rc::new(RefCell::new(Dict::new())),
            builtins_ns: Rc::new(RefCell::new(builtins_dict)),
            module_registry: AHashMap::new(),
            limits: Limits::default(),
            budget: Budget::new(None, None),
            frames: Vec::new(),
            pending_halt: None,
            output: String::new(),
        };
        vm.globals
            .borrow_mut()
            .insert_str("__name__", Value::str("__main__"));
        modules::register_stock_modules(&mut vm);
        vm
    }

    pub fn with_limits(limits: Limits) -> Self {
        let mut vm = Self::new();
        vm.limits = limits;
        vm
    }

    pub fn limits_mut(&mut self) -> &mut Limits {
        &mut self.limits
    }

    /// Instructions between cancellation/deadline checks, minimum 1.
    pub fn set_check_interval(&mut self, n: u64) {
        self.limits.check_interval = n.max(1);
    }

    // -- Globals and builtins -----------------------------------------------

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.borrow_mut().insert_str(name, value);
    }

    /// A global by name; `None` when missing.
    pub fn get_global(&self, name: &str) -> Value {
        self.globals
            .borrow()
            .get_str(name)
            .cloned()
            .unwrap_or(Value::None)
    }

    pub fn set_builtin(&mut self, name: &str, value: Value) {
        self.builtins_ns.borrow_mut().insert_str(name, value);
    }

    pub fn get_builtin(&self, name: &str) -> Value {
        self.builtins_ns
            .borrow()
            .get_str(name)
            .cloned()
            .unwrap_or(Value::None)
    }

    // -- Output -------------------------------------------------------------

    pub(crate) fn write_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    /// Take everything `print` wrote since the last call.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    // -- Compilation and execution ------------------------------------------

    /// Compile source to a code object without running it.
    pub fn compile(&mut self, source: &str, filename: &str) -> Result<Rc<CodeObject>, Error> {
        crate::compiler::compile(source, filename)
            .map(Rc::new)
            .map_err(Error::Compile)
    }

    /// Compile and execute; the value of a trailing expression statement is
    /// the result.
    pub fn run(&mut self, source: &str) -> Result<Value, Error> {
        let code = self.compile(source, "<string>")?;
        self.execute(code)
    }

    /// Execute a compiled code object against this VM's globals.
    pub fn execute(&mut self, code: Rc<CodeObject>) -> Result<Value, Error> {
        self.execute_inner(code, Budget::new(None, None))
    }

    /// Execute with a wall-clock deadline. A deadline hit aborts the loop at
    /// the next check boundary; no `finally` handlers run.
    pub fn execute_with_timeout(
        &mut self,
        code: Rc<CodeObject>,
        timeout: std::time::Duration,
    ) -> Result<Value, Error> {
        self.execute_inner(code, Budget::new(Some(timeout), None))
    }

    /// Execute under a cancellation token.
    pub fn execute_with_cancel(
        &mut self,
        code: Rc<CodeObject>,
        token: CancelToken,
    ) -> Result<Value, Error> {
        self.execute_inner(code, Budget::new(None, Some(token)))
    }

    fn execute_inner(&mut self, code: Rc<CodeObject>, budget: Budget) -> Result<Value, Error> {
        self.budget = budget;
        let frame = Frame::new(code, self.globals.clone(), Some(self.globals.clone()));
        let base = self.frames.len();
        self.frames.push(frame);
        match self.run_frames(base) {
            Ok(Exit::Return(v)) => Ok(v),
            Ok(Exit::Yield(_)) => {
                self.frames.truncate(base);
                Err(Error::Exception(UncaughtException::new(
                    PyExc::runtime_error("module body yielded").into_value(),
                )))
            }
            Err(VmError::Exc(e)) => {
                self.frames.truncate(base);
                Err(Error::Exception(UncaughtException::new(e)))
            }
            Err(VmError::Halt(h)) => {
                self.frames.truncate(base);
                Err(match h {
                    Halt::Timeout(elapsed) => Error::Timeout { elapsed },
                    Halt::Cancelled => Error::Cancelled,
                    Halt::InstructionLimit(n) => Error::InstructionLimit(n),
                })
            }
        }
    }

    // -- Resource plumbing --------------------------------------------------

    pub(crate) fn check_collection(&self, len: usize) -> Result<(), PyExc> {
        crate::resource::check_collection_size(&self.limits, len)
    }

    pub(crate) fn charge_allocation(&mut self, n: u64) -> Result<(), PyExc> {
        self.budget.charge_allocation(&self.limits, n)
    }

    // =======================================================================
    // The dispatch loop
    // =======================================================================

    fn run_frames(&mut self, base: usize) -> VmResult<Exit> {
        loop {
            // Fetch and decode.
            let decoded = {
                let frame = self.frames.last_mut().expect("frame stack underflow");
                let code = &frame.code.code;
                if frame.ip >= code.len() {
                    None
                } else {
                    let byte = code[frame.ip];
                    let Some(op) = Opcode::from_byte(byte) else {
                        return Err(PyExc::runtime_error(format!(
                            "invalid opcode {byte:#04x} at offset {}",
                            frame.ip
                        ))
                        .into());
                    };
                    let arg = if op.has_arg() {
                        let a =
                            u16::from_le_bytes([code[frame.ip + 1], code[frame.ip + 2]]);
                        frame.ip += 3;
                        a
                    } else {
                        frame.ip += 1;
                        0
                    };
                    Some((op, arg))
                }
            };
            let Some((op, arg)) = decoded else {
                // Implicit `return None` at the end of a body.
                match self.do_return(Value::None, base)? {
                    Flow::Exit(exit) => return Ok(exit),
                    Flow::Continue => continue,
                }
            };

            // Budget and cancellation.
            self.budget.instructions += 1;
            if let Some(limit) = self.limits.max_instructions {
                if self.budget.instructions > limit {
                    return Err(VmError::Halt(Halt::InstructionLimit(limit)));
                }
            }
            if self.budget.instructions % self.limits.check_interval.max(1) == 0 {
                if let Some(token) = &self.budget.cancel {
                    if token.is_cancelled() {
                        return Err(VmError::Halt(Halt::Cancelled));
                    }
                }
                if let Some(deadline) = self.budget.deadline {
                    let elapsed = self.budget.elapsed();
                    if elapsed > deadline {
                        return Err(VmError::Halt(Halt::Timeout(elapsed)));
                    }
                }
            }

            // Execute.
            match self.exec_op(op, arg, base) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(exit)) => return Ok(exit),
                Err(VmError::Exc(exc)) => self.handle_raise(exc, base)?,
                Err(halt @ VmError::Halt(_)) => return Err(halt),
            }
        }
    }

    fn frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    /// The value `depth` slots below the top of the current operand stack.
    fn peek_at_depth(&mut self, depth: usize) -> Value {
        let frame = self.frame();
        frame.stack[frame.stack.len() - depth].clone()
    }

    #[allow(clippy::too_many_lines)]
    fn exec_op(&mut self, op: Opcode, arg: u16, base: usize) -> VmResult<Flow> {
        let i = arg as usize;
        match op {
            Opcode::Nop => {}

            // -- Stack shuffling --------------------------------------------
            Opcode::PopTop => {
                self.frame().pop();
            }
            Opcode::DupTop => {
                let v = self.frame().peek().clone();
                self.frame().push(v);
            }
            Opcode::RotTwo => {
                let frame = self.frame();
                let len = frame.stack.len();
                frame.stack.swap(len - 1, len - 2);
            }
            Opcode::RotThree => {
                let frame = self.frame();
                let top = frame.pop();
                let len = frame.stack.len();
                frame.stack.insert(len - 2, top);
            }

            // -- Constants and names ----------------------------------------
            Opcode::LoadConst => {
                let v = self.frame().code.constants[i].clone();
                self.frame().push(v);
            }
            Opcode::LoadNone => self.frame().push(Value::None),
            Opcode::LoadTrue => self.frame().push(Value::Bool(true)),
            Opcode::LoadFalse => self.frame().push(Value::Bool(false)),
            Opcode::LoadZero => self.frame().push(Value::Int(0)),
            Opcode::LoadOne => self.frame().push(Value::Int(1)),
            Opcode::LoadEmptyList => self.frame().push(Value::list(vec![])),
            Opcode::LoadEmptyTuple => self.frame().push(Value::tuple(vec![])),
            Opcode::LoadEmptyDict => self.frame().push(Value::dict()),

            Opcode::LoadName => {
                let v = self.load_name(i)?;
                self.frame().push(v);
            }
            Opcode::StoreName => {
                let v = self.frame().pop();
                let frame = self.frame();
                let name = frame.code.names[i].clone();
                match &frame.names {
                    Some(ns) => ns.borrow_mut().insert_str(&name, v),
                    None => frame.globals.borrow_mut().insert_str(&name, v),
                }
            }
            Opcode::DeleteName => {
                let frame = self.frame();
                let name = frame.code.names[i].clone();
                let removed = match &frame.names {
                    Some(ns) => ns.borrow_mut().remove_str(&name),
                    None => frame.globals.borrow_mut().remove_str(&name),
                };
                if removed.is_none() {
                    return Err(PyExc::name_error(&name).into());
                }
            }
            Opcode::LoadFast => {
                let v = self.load_fast(i)?;
                self.frame().push(v);
            }
            Opcode::LoadFast0 => {
                let v = self.load_fast(0)?;
                self.frame().push(v);
            }
            Opcode::LoadFast1 => {
                let v = self.load_fast(1)?;
                self.frame().push(v);
            }
            Opcode::LoadFast2 => {
                let v = self.load_fast(2)?;
                self.frame().push(v);
            }
            Opcode::LoadFast3 => {
                let v = self.load_fast(3)?;
                self.frame().push(v);
            }
            Opcode::StoreFast => {
                let v = self.frame().pop();
                self.frame().locals[i] = Some(v);
            }
            Opcode::StoreFast0 => {
                let v = self.frame().pop();
                self.frame().locals[0] = Some(v);
            }
            Opcode::StoreFast1 => {
                let v = self.frame().pop();
                self.frame().locals[1] = Some(v);
            }
            Opcode::StoreFast2 => {
                let v = self.frame().pop();
                self.frame().locals[2] = Some(v);
            }
            Opcode::StoreFast3 => {
                let v = self.frame().pop();
                self.frame().locals[3] = Some(v);
            }
            Opcode::DeleteFast => {
                let frame = self.frame();
                if frame.locals[i].take().is_none() {
                    let name = frame.code.var_names[i].clone();
                    return Err(PyExc::new(
                        ExcType::UnboundLocalError,
                        format!("local variable '{name}' referenced before assignment"),
                    )
                    .into());
                }
            }
            Opcode::LoadGlobal => {
                let name = self.frame().code.names[i].clone();
                let v = self.lookup_global(&name)?;
                self.frame().push(v);
            }
            Opcode::StoreGlobal => {
                let v = self.frame().pop();
                let name = self.frame().code.names[i].clone();
                self.globals.borrow_mut().insert_str(&name, v);
            }
            Opcode::DeleteGlobal => {
                let name = self.frame().code.names[i].clone();
                if self.globals.borrow_mut().remove_str(&name).is_none() {
                    return Err(PyExc::name_error(&name).into());
                }
            }
            Opcode::LoadDeref => {
                let frame = self.frame();
                let cell = frame.cells[i].clone();
                let name = self.deref_name(i);
                let v = cell.borrow().clone();
                match v {
                    Some(v) => self.frame().push(v),
                    None => {
                        return Err(PyExc::new(
                            ExcType::NameError,
                            format!(
                                "free variable '{name}' referenced before assignment in enclosing scope"
                            ),
                        )
                        .into());
                    }
                }
            }
            Opcode::StoreDeref => {
                let v = self.frame().pop();
                let frame = self.frame();
                *frame.cells[i].borrow_mut() = Some(v);
            }
            Opcode::LoadClosure => {
                let cell = self.frame().cells[i].clone();
                self.frame().push(Value::Cell(cell));
            }
            Opcode::MakeCell => {
                // Move a parameter's value into its cell at function entry.
                let frame = self.frame();
                let cell_name = frame.code.cell_vars[i].clone();
                if let Some(pi) = frame
                    .code
                    .var_names
                    .iter()
                    .position(|n| n.as_str() == cell_name.as_str())
                {
                    let v = frame.locals[pi].take();
                    *frame.cells[i].borrow_mut() = v;
                }
            }

            // -- Attributes and subscripts ----------------------------------
            Opcode::LoadAttr => {
                let name = self.frame().code.names[i].clone();
                let obj = self.frame().pop();
                let v = attr::get_attr(self, &obj, &name)?;
                self.frame().push(v);
            }
            Opcode::StoreAttr => {
                let name = self.frame().code.names[i].clone();
                let obj = self.frame().pop();
                let v = self.frame().pop();
                attr::set_attr(self, &obj, &name, v)?;
            }
            Opcode::DeleteAttr => {
                let name = self.frame().code.names[i].clone();
                let obj = self.frame().pop();
                attr::del_attr(self, &obj, &name)?;
            }
            Opcode::BinarySubscr => {
                let key = self.frame().pop();
                let obj = self.frame().pop();
                let v = self.get_item(&obj, &key)?;
                self.frame().push(v);
            }
            Opcode::StoreSubscr => {
                let key = self.frame().pop();
                let obj = self.frame().pop();
                let v = self.frame().pop();
                self.set_item(&obj, &key, v)?;
            }
            Opcode::DeleteSubscr => {
                let key = self.frame().pop();
                let obj = self.frame().pop();
                self.del_item(&obj, &key)?;
            }
            Opcode::LoadLocals => {
                let frame = self.frame();
                let ns = frame
                    .names
                    .clone()
                    .unwrap_or_else(|| frame.globals.clone());
                self.frame().push(Value::Dict(ns));
            }

            // -- Operators --------------------------------------------------
            Opcode::BinaryOp => {
                let op = BinOp::from_arg(arg).expect("binary operator arg");
                let b = self.frame().pop();
                let a = self.frame().pop();
                let v = operators::binary_op(self, op, a, b)?;
                self.frame().push(v);
            }
            Opcode::InplaceOp => {
                let op = BinOp::from_arg(arg).expect("inplace operator arg");
                let b = self.frame().pop();
                let a = self.frame().pop();
                let v = operators::inplace_op(self, op, a, b)?;
                self.frame().push(v);
            }
            Opcode::UnaryOp => {
                let op = UnOp::from_arg(arg).expect("unary operator arg");
                let v = self.frame().pop();
                let r = operators::unary_op(self, op, v)?;
                self.frame().push(r);
            }
            Opcode::CompareOp => {
                let op = CmpOp::from_arg(arg).expect("compare operator arg");
                let b = self.frame().pop();
                let a = self.frame().pop();
                let v = operators::compare_op(self, op, a, b)?;
                self.frame().push(v);
            }

            // -- Integer specializations ------------------------------------
            Opcode::BinaryAddInt | Opcode::BinarySubInt | Opcode::BinaryMulInt => {
                let b = self.frame().pop();
                let a = self.frame().pop();
                let ints = int_pair(&a, &b);
                let generic = match op {
                    Opcode::BinaryAddInt => BinOp::Add,
                    Opcode::BinarySubInt => BinOp::Sub,
                    _ => BinOp::Mul,
                };
                let fast = ints.and_then(|(x, y)| match op {
                    Opcode::BinaryAddInt => x.checked_add(y),
                    Opcode::BinarySubInt => x.checked_sub(y),
                    _ => x.checked_mul(y),
                });
                let v = match fast {
                    Some(r) => Value::Int(r),
                    None => operators::binary_op(self, generic, a, b)?,
                };
                self.frame().push(v);
            }
            Opcode::CompareLtInt
            | Opcode::CompareLeInt
            | Opcode::CompareGtInt
            | Opcode::CompareGeInt
            | Opcode::CompareEqInt
            | Opcode::CompareNeInt => {
                let b = self.frame().pop();
                let a = self.frame().pop();
                let cmp = int_compare_kind(op);
                let v = match int_pair(&a, &b) {
                    Some((x, y)) => Value::Bool(apply_int_compare(cmp, x, y)),
                    None => operators::compare_op(self, cmp, a, b)?,
                };
                self.frame().push(v);
            }
            Opcode::CompareLtJump
            | Opcode::CompareLeJump
            | Opcode::CompareGtJump
            | Opcode::CompareGeJump
            | Opcode::CompareEqJump
            | Opcode::CompareNeJump => {
                let b = self.frame().pop();
                let a = self.frame().pop();
                let cmp = jump_compare_kind(op);
                let truthy = match int_pair(&a, &b) {
                    Some((x, y)) => apply_int_compare(cmp, x, y),
                    None => {
                        let v = operators::compare_op(self, cmp, a, b)?;
                        self.truthy(&v)?
                    }
                };
                if !truthy {
                    self.frame().ip = i;
                }
            }
            Opcode::IncrementFast | Opcode::DecrementFast => {
                let delta = if op == Opcode::IncrementFast { 1 } else { -1 };
                let current = self.load_fast(i)?;
                match current {
                    Value::Int(x) if x.checked_add(delta).is_some() => {
                        self.frame().locals[i] = Some(Value::Int(x + delta));
                    }
                    other => {
                        let v = operators::binary_op(
                            self,
                            if delta > 0 { BinOp::Add } else { BinOp::Sub },
                            other,
                            Value::Int(1),
                        )?;
                        self.frame().locals[i] = Some(v);
                    }
                }
            }
            Opcode::LenList | Opcode::LenString | Opcode::LenTuple | Opcode::LenDict
            | Opcode::LenGeneric => {
                let v = self.frame().pop();
                let len = match (op, &v) {
                    (Opcode::LenList, Value::List(l)) => l.borrow().len() as i64,
                    (Opcode::LenString, Value::Str(s)) => s.char_len() as i64,
                    (Opcode::LenTuple, Value::Tuple(t)) => t.len() as i64,
                    (Opcode::LenDict, Value::Dict(d)) => d.borrow().len() as i64,
                    _ => self.py_len(&v)?,
                };
                self.frame().push(Value::Int(len));
            }

            // -- Superinstructions ------------------------------------------
            Opcode::LoadFastLoadFast => {
                let (a, b) = unpack_pair(arg);
                let x = self.load_fast(a)?;
                let y = self.load_fast(b)?;
                let frame = self.frame();
                frame.push(x);
                frame.push(y);
            }
            Opcode::LoadFastLoadConst => {
                let (a, b) = unpack_pair(arg);
                let x = self.load_fast(a)?;
                let y = self.frame().code.constants[b].clone();
                let frame = self.frame();
                frame.push(x);
                frame.push(y);
            }
            Opcode::LoadConstLoadFast => {
                let (a, b) = unpack_pair(arg);
                let x = self.frame().code.constants[a].clone();
                let y = self.load_fast(b)?;
                let frame = self.frame();
                frame.push(x);
                frame.push(y);
            }
            Opcode::StoreFastLoadFast => {
                let (a, b) = unpack_pair(arg);
                let v = self.frame().pop();
                self.frame().locals[a] = Some(v);
                let y = self.load_fast(b)?;
                self.frame().push(y);
            }
            Opcode::LoadGlobalLoadFast => {
                let (a, b) = unpack_pair(arg);
                let name = self.frame().code.names[a].clone();
                let x = self.lookup_global(&name)?;
                let y = self.load_fast(b)?;
                let frame = self.frame();
                frame.push(x);
                frame.push(y);
            }

            // -- Control flow -----------------------------------------------
            Opcode::Jump => self.frame().ip = i,
            Opcode::PopJumpIfTrue => {
                let v = self.frame().pop();
                if self.truthy(&v)? {
                    self.frame().ip = i;
                }
            }
            Opcode::PopJumpIfFalse => {
                let v = self.frame().pop();
                if !self.truthy(&v)? {
                    self.frame().ip = i;
                }
            }
            Opcode::JumpIfTrueOrPop => {
                let v = self.frame().peek().clone();
                if self.truthy(&v)? {
                    self.frame().ip = i;
                } else {
                    self.frame().pop();
                }
            }
            Opcode::JumpIfFalseOrPop => {
                let v = self.frame().peek().clone();
                if self.truthy(&v)? {
                    self.frame().pop();
                } else {
                    self.frame().ip = i;
                }
            }

            // -- Iteration --------------------------------------------------
            Opcode::GetIter => {
                let v = self.frame().pop();
                let it = self.get_iter(v)?;
                self.frame().push(it);
            }
            Opcode::ForIter => {
                let it = self.frame().peek().clone();
                match self.iter_next(&it) {
                    Ok(Some(v)) => self.frame().push(v),
                    Ok(None) => {
                        self.frame().pop();
                        self.frame().ip = i;
                    }
                    Err(VmError::Exc(e)) if is_stop_iteration(&e) => {
                        self.frame().pop();
                        self.frame().ip = i;
                    }
                    Err(e) => return Err(e),
                }
            }

            // -- Construction -----------------------------------------------
            Opcode::BuildTuple => {
                let items = self.frame().pop_n(i);
                self.frame().push(Value::tuple(items));
            }
            Opcode::BuildList => {
                let items = self.frame().pop_n(i);
                self.check_collection(items.len())?;
                self.frame().push(Value::list(items));
            }
            Opcode::BuildSet => {
                let items = self.frame().pop_n(i);
                let mut set = Set::new();
                for v in items {
                    let h = self.hash_value(&v)?;
                    set.insert(h, v);
                }
                self.frame().push(Value::set(set));
            }
            Opcode::BuildMap => {
                let flat = self.frame().pop_n(i * 2);
                let mut d = Dict::with_capacity(i);
                for pair in flat.chunks(2) {
                    let h = self.hash_value(&pair[0])?;
                    d.insert(h, pair[0].clone(), pair[1].clone());
                }
                self.frame().push(Value::Dict(Rc::new(RefCell::new(d))));
            }
            Opcode::BuildString => {
                let parts = self.frame().pop_n(i);
                let mut out = String::new();
                for p in parts {
                    match p {
                        Value::Str(s) => out.push_str(&s),
                        other => out.push_str(&self.py_str(&other)?),
                    }
                }
                self.frame().push(Value::str(out));
            }
            Opcode::FormatValue => {
                let spec = if arg & 0x4 != 0 {
                    match self.frame().pop() {
                        Value::Str(s) => s.to_string(),
                        other => self.py_str(&other)?,
                    }
                } else {
                    String::new()
                };
                let v = self.frame().pop();
                let converted = match arg & 0x3 {
                    2 => self.py_repr(&v)?,
                    3 => crate::format::ascii_repr(&v),
                    _ => self.py_str(&v)?,
                };
                let rendered = if spec.is_empty() {
                    converted
                } else if arg & 0x3 == 0 {
                    // No conversion: the spec applies to the value itself.
                    crate::format::format_spec(&v, &spec)?
                } else {
                    crate::format::format_spec(&Value::str(&converted), &spec)?
                };
                self.frame().push(Value::str(rendered));
            }
            Opcode::BuildSlice => {
                let step = if i == 3 { self.frame().pop() } else { Value::None };
                let stop = self.frame().pop();
                let start = self.frame().pop();
                self.frame()
                    .push(Value::Slice(Rc::new(SliceObj { start, stop, step })));
            }

            // -- Unpacking --------------------------------------------------
            Opcode::UnpackSequence => {
                let v = self.frame().pop();
                let items = self.iterate_to_vec(v)?;
                if items.len() != i {
                    return Err(unpack_error(items.len(), i).into());
                }
                for item in items.into_iter().rev() {
                    self.frame().push(item);
                }
            }
            Opcode::UnpackEx => {
                let before = (arg & 0xff) as usize;
                let after = (arg >> 8) as usize;
                let v = self.frame().pop();
                let mut items = self.iterate_to_vec(v)?;
                if items.len() < before + after {
                    return Err(PyExc::value_error(format!(
                        "not enough values to unpack (expected at least {}, got {})",
                        before + after,
                        items.len()
                    ))
                    .into());
                }
                let tail = items.split_off(items.len() - after);
                let star = items.split_off(before);
                for item in tail.into_iter().rev() {
                    self.frame().push(item);
                }
                self.frame().push(Value::list(star));
                for item in items.into_iter().rev() {
                    self.frame().push(item);
                }
            }

            // -- Comprehensions ---------------------------------------------
            Opcode::ListAppend => {
                let v = self.frame().pop();
                let target = self.peek_at_depth(i);
                if let Value::List(items) = target {
                    self.check_collection(items.borrow().len() + 1)?;
                    self.charge_allocation(1)?;
                    items.borrow_mut().push(v);
                }
            }
            Opcode::SetAdd => {
                let v = self.frame().pop();
                let target = self.peek_at_depth(i);
                let h = self.hash_value(&v)?;
                if let Value::Set(set) = target {
                    set.borrow_mut().insert(h, v);
                }
            }
            Opcode::MapAdd => {
                let value = self.frame().pop();
                let key = self.frame().pop();
                let target = self.peek_at_depth(i);
                let h = self.hash_value(&key)?;
                if let Value::Dict(d) = target {
                    d.borrow_mut().insert(h, key, value);
                }
            }

            // -- Calls ------------------------------------------------------
            Opcode::Call => {
                let args = self.frame().pop_n(i);
                let callable = self.frame().pop();
                let v = self.call_with_kwargs(callable, args, Vec::new())?;
                self.frame().push(v);
            }
            Opcode::CallEx => {
                let kwargs = if arg & 1 != 0 {
                    match self.frame().pop() {
                        Value::Dict(d) => d
                            .borrow()
                            .items()
                            .into_iter()
                            .map(|(k, v)| match k {
                                Value::Str(s) => Ok((s, v)),
                                _ => Err(VmError::from(PyExc::type_error(
                                    "keywords must be strings",
                                ))),
                            })
                            .collect::<VmResult<Vec<_>>>()?,
                        _ => {
                            return Err(PyExc::type_error(
                                "argument after ** must be a mapping",
                            )
                            .into());
                        }
                    }
                } else {
                    Vec::new()
                };
                let spread = self.frame().pop();
                let args = self.iterate_to_vec(spread)?;
                let callable = self.frame().pop();
                let v = self.call_with_kwargs(callable, args, kwargs)?;
                self.frame().push(v);
            }
            Opcode::CallKw => {
                let names = self.frame().pop();
                let Value::Tuple(names) = names else {
                    return Err(PyExc::type_error("malformed keyword call").into());
                };
                let mut all = self.frame().pop_n(i);
                let callable = self.frame().pop();
                let kw_values = all.split_off(all.len() - names.len());
                let kwargs = names
                    .iter()
                    .zip(kw_values)
                    .map(|(n, v)| match n {
                        Value::Str(s) => Ok((s.clone(), v)),
                        _ => Err(VmError::from(PyExc::type_error(
                            "keywords must be strings",
                        ))),
                    })
                    .collect::<VmResult<Vec<_>>>()?;
                let v = self.call_with_kwargs(callable, all, kwargs)?;
                self.frame().push(v);
            }
            Opcode::LoadMethod => {
                let name = self.frame().code.names[i].clone();
                let obj = self.frame().pop();
                let (func, receiver) = attr::load_method(self, &obj, &name)?;
                let frame = self.frame();
                frame.push(func);
                frame.push(receiver);
            }
            Opcode::CallMethod => {
                let args = self.frame().pop_n(i);
                let receiver = self.frame().pop();
                let func = self.frame().pop();
                let v = if let Value::Str(name) = &func {
                    // Builtin type-method marker from LOAD_METHOD.
                    let name = name.clone();
                    crate::methods::call_type_method(self, &receiver, &name, args, Vec::new())?
                } else if matches!(receiver, Value::NotImplemented) {
                    self.call_with_kwargs(func, args, Vec::new())?
                } else {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(receiver);
                    full.extend(args);
                    self.call_with_kwargs(func, full, Vec::new())?
                };
                self.frame().push(v);
            }
            Opcode::ReturnValue => {
                let v = self.frame().pop();
                return self.do_return(v, base);
            }
            Opcode::YieldValue => {
                let v = self.frame().pop();
                if self.frames.len() != base + 1 {
                    return Err(PyExc::runtime_error("yield outside generator frame").into());
                }
                return Ok(Flow::Exit(Exit::Yield(v)));
            }
            Opcode::GetAwaitable => {
                // Await drives the coroutine to completion cooperatively.
                let v = self.frame().pop();
                let result = self.await_value(v)?;
                self.frame().push(result);
            }
            Opcode::MakeFunction => {
                let v = self.make_function(arg)?;
                self.frame().push(v);
            }
            Opcode::BuildClass => {
                let meta = self.frame().pop();
                let bases = self.frame().pop();
                let name = self.frame().pop();
                let ns = self.frame().pop();
                let Value::Str(name) = name else {
                    return Err(PyExc::type_error("class name must be a string").into());
                };
                let Value::Tuple(bases) = bases else {
                    return Err(PyExc::type_error("class bases must be a tuple").into());
                };
                let Value::Dict(ns) = ns else {
                    return Err(PyExc::type_error("class namespace must be a dict").into());
                };
                let meta = match meta {
                    Value::None => None,
                    m => Some(m),
                };
                let class = self.build_class(&name, bases.to_vec(), ns, meta)?;
                self.frame().push(class);
            }

            // -- Imports ----------------------------------------------------
            Opcode::ImportName => {
                let name = self.frame().code.names[i].clone();
                let fromlist = self.frame().pop();
                let level = self.frame().pop().as_int().unwrap_or(0) as u32;
                let resolved = if level > 0 {
                    let package = self.current_package();
                    modules::resolve_relative(package.as_deref(), level, &name)
                        .map_err(VmError::from)?
                } else {
                    name.to_string()
                };
                let has_fromlist = match &fromlist {
                    Value::None => false,
                    Value::Tuple(t) => !t.is_empty(),
                    _ => false,
                };
                let module = if has_fromlist {
                    modules::import_leaf(self, &resolved)?
                } else {
                    modules::import_top(self, &resolved)?
                };
                self.frame().push(Value::Module(module));
            }
            Opcode::ImportFrom => {
                let name = self.frame().code.names[i].clone();
                let module = self.frame().peek().clone();
                let Value::Module(m) = &module else {
                    return Err(PyExc::type_error("import source is not a module").into());
                };
                let value = m.dict.borrow().get_str(&name).cloned();
                let v = match value {
                    Some(v) => v,
                    None => {
                        // Maybe a registered submodule.
                        let full = format!("{}.{}", m.name, name);
                        match modules::import_leaf(self, &full) {
                            Ok(sub) => Value::Module(sub),
                            Err(_) => {
                                return Err(PyExc::new(
                                    ExcType::ImportError,
                                    format!(
                                        "cannot import name '{name}' from '{}'",
                                        m.name
                                    ),
                                )
                                .into());
                            }
                        }
                    }
                };
                self.frame().push(v);
            }
            Opcode::ImportStar => {
                let module = self.frame().pop();
                let Value::Module(m) = &module else {
                    return Err(PyExc::type_error("import source is not a module").into());
                };
                let items = m.dict.borrow().items();
                let frame = self.frame();
                let target = frame
                    .names
                    .clone()
                    .unwrap_or_else(|| frame.globals.clone());
                for (k, v) in items {
                    if let Some(name) = k.as_str() {
                        if !name.starts_with('_') {
                            target.borrow_mut().insert_str(name, v);
                        }
                    }
                }
            }

            // -- Blocks and exceptions --------------------------------------
            Opcode::SetupLoop => {
                let frame = self.frame();
                let level = frame.stack.len();
                frame.blocks.push(Block::Loop { end: i, level });
            }
            Opcode::SetupExcept => {
                let frame = self.frame();
                let level = frame.stack.len();
                frame.blocks.push(Block::Except { handler: i, level });
            }
            Opcode::SetupFinally => {
                let frame = self.frame();
                let level = frame.stack.len();
                frame.blocks.push(Block::Finally { handler: i, level });
            }
            Opcode::SetupExceptStar => {
                let frame = self.frame();
                let level = frame.stack.len();
                frame.blocks.push(Block::ExceptStar { handler: i, level });
            }
            Opcode::SetupWith => {
                let ctx = self.frame().pop();
                let enter = attr::get_attr(self, &ctx, "__enter__")?;
                let exit = attr::get_attr(self, &ctx, "__exit__")?;
                let entered = self.call_value(enter, vec![])?;
                let frame = self.frame();
                frame.push(exit);
                let level = frame.stack.len();
                frame.blocks.push(Block::With { handler: i, level });
                frame.push(entered);
            }
            Opcode::PopBlock => {
                self.frame().blocks.pop();
            }
            Opcode::ExitWith => {
                // Normal completion: call __exit__(None, None, None).
                let exit = self.frame().pop();
                self.call_value(exit, vec![Value::None, Value::None, Value::None])?;
            }
            Opcode::PopExcept => {
                let frame = self.frame();
                match frame.blocks.pop() {
                    Some(Block::Handler { level }) => {
                        frame.stack.truncate(level);
                        frame.handling.pop();
                    }
                    _ => {
                        return Err(PyExc::runtime_error("mismatched POP_EXCEPT").into());
                    }
                }
            }
            Opcode::BeginFinally => {
                self.frame()
                    .push(Value::Ctrl(Rc::new(Ctrl::Fallthrough)));
            }
            Opcode::EndFinally => {
                let v = self.frame().pop();
                match v {
                    Value::Ctrl(ctrl) => match &*ctrl {
                        Ctrl::Fallthrough => {}
                        Ctrl::Exception(exc) => return Err(VmError::Exc(exc.clone())),
                        Ctrl::Return(v) => return self.do_return(v.clone(), base),
                        Ctrl::Break => return self.do_break(base),
                        Ctrl::Continue(target) => {
                            let t = *target;
                            return self.do_continue(t, base);
                        }
                    },
                    _ => {
                        return Err(
                            PyExc::runtime_error("mismatched END_FINALLY").into()
                        );
                    }
                }
            }
            Opcode::JumpIfNotExcMatch => {
                let matcher = self.frame().pop();
                let exc = self.frame().peek().clone();
                self.validate_exc_matcher(&matcher)?;
                let matched = match &exc {
                    Value::Exception(e) => match_class(&e.borrow().class, &matcher),
                    _ => false,
                };
                if !matched {
                    self.frame().ip = i;
                }
            }
            Opcode::CheckEgMatch => {
                let matcher = self.frame().pop();
                self.validate_exc_matcher(&matcher)?;
                let frame = self.frame();
                let Some(state) = frame.eg_states.last_mut() else {
                    return Err(PyExc::runtime_error("except* outside group handler").into());
                };
                let mut matched = Vec::new();
                state.remaining.retain(|leaf| {
                    let hit = match leaf {
                        Value::Exception(e) => match_class(&e.borrow().class, &matcher),
                        _ => false,
                    };
                    if hit {
                        matched.push(leaf.clone());
                    }
                    !hit
                });
                let result = if matched.is_empty() {
                    Value::None
                } else {
                    PyExc::group("", matched).into_value()
                };
                self.frame().push(result);
            }
            Opcode::ReraiseStar => {
                let frame = self.frame();
                let Some(state) = frame.eg_states.pop() else {
                    return Err(PyExc::runtime_error("except* outside group handler").into());
                };
                frame.handling.pop();
                if !state.remaining.is_empty() {
                    // Reassemble the unmatched leaves and keep unwinding.
                    let exc = if state.remaining.len() == 1
                        && !matches!(&state.original, Value::Exception(e) if e.borrow().group.is_some())
                    {
                        state.remaining[0].clone()
                    } else {
                        PyExc::group("", state.remaining).into_value()
                    };
                    return Err(VmError::Exc(exc));
                }
            }
            Opcode::RaiseVarargs => {
                return Err(self.raise_varargs(arg)?);
            }
            Opcode::BreakLoop => return self.do_break(base),
            Opcode::ContinueLoop => return self.do_continue(i, base),
        }
        Ok(Flow::Continue)
    }

    // -----------------------------------------------------------------------
    // Name lookups
    // -----------------------------------------------------------------------

    fn load_fast(&mut self, i: usize) -> VmResult<Value> {
        let frame = self.frame();
        match &frame.locals[i] {
            Some(v) => Ok(v.clone()),
            None => {
                let name = frame.code.var_names[i].clone();
                Err(PyExc::new(
                    ExcType::UnboundLocalError,
                    format!("local variable '{name}' referenced before assignment"),
                )
                .into())
            }
        }
    }

    fn load_name(&mut self, i: usize) -> VmResult<Value> {
        let frame = self.frame();
        let name = frame.code.names[i].clone();
        if let Some(ns) = &frame.names {
            if let Some(v) = ns.borrow().get_str(&name) {
                return Ok(v.clone());
            }
        }
        self.lookup_global(&name)
    }

    fn lookup_global(&mut self, name: &str) -> VmResult<Value> {
        let frame_globals = self
            .frames
            .last()
            .map(|f| f.globals.clone())
            .unwrap_or_else(|| self.globals.clone());
        if let Some(v) = frame_globals.borrow().get_str(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.builtins_ns.borrow().get_str(name) {
            return Ok(v.clone());
        }
        Err(PyExc::name_error(name).into())
    }

    fn deref_name(&mut self, i: usize) -> String {
        let frame = self.frame();
        let n_cells = frame.code.cell_vars.len();
        if i < n_cells {
            frame.code.cell_vars[i].to_string()
        } else {
            frame.code.free_vars[i - n_cells].to_string()
        }
    }

    /// Names visible from the current frame, for `dir()` with no argument.
    pub(crate) fn visible_names(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(frame) = self.frames.last() {
            for (idx, slot) in frame.locals.iter().enumerate() {
                if slot.is_some() {
                    names.push(frame.code.var_names[idx].to_string());
                }
            }
            if let Some(ns) = &frame.names {
                names.extend(
                    ns.borrow()
                        .keys()
                        .iter()
                        .filter_map(|k| k.as_str().map(str::to_owned)),
                );
            }
        }
        names.extend(
            self.globals
                .borrow()
                .keys()
                .iter()
                .filter_map(|k| k.as_str().map(str::to_owned)),
        );
        names.extend(
            self.builtins_ns
                .borrow()
                .keys()
                .iter()
                .filter_map(|k| k.as_str().map(str::to_owned)),
        );
        names
    }

    fn current_package(&self) -> Option<String> {
        let frame = self.frames.last()?;
        let globals = frame.globals.borrow();
        if let Some(v) = globals.get_str("__package__") {
            return v.as_str().map(str::to_owned);
        }
        None
    }

    // -----------------------------------------------------------------------
    // Return / break / continue unwinding
    // -----------------------------------------------------------------------

    /// Unwind for `return`: run intervening `with` exits and `finally`
    /// handlers, then pop the frame.
    fn do_return(&mut self, value: Value, base: usize) -> VmResult<Flow> {
        loop {
            let Some(block) = self.frame().blocks.pop() else {
                break;
            };
            match block {
                Block::Loop { .. } | Block::Except { .. } | Block::ExceptStar { .. } => {}
                Block::Handler { level } => {
                    let frame = self.frame();
                    frame.stack.truncate(level);
                    frame.handling.pop();
                }
                Block::With { handler: _, level } => {
                    self.run_with_exit(level)?;
                }
                Block::Finally { handler, level } => {
                    let frame = self.frame();
                    frame.stack.truncate(level);
                    frame.push(Value::Ctrl(Rc::new(Ctrl::Return(value))));
                    frame.ip = handler;
                    return Ok(Flow::Continue);
                }
            }
        }
        // No interception: pop the frame.
        let finished = self.frames.pop().expect("returning without a frame");
        drop(finished);
        if self.frames.len() == base {
            return Ok(Flow::Exit(Exit::Return(value)));
        }
        self.frame().push(value);
        Ok(Flow::Continue)
    }

    fn do_break(&mut self, _base: usize) -> VmResult<Flow> {
        loop {
            let Some(block) = self.frame().blocks.pop() else {
                return Err(PyExc::runtime_error("'break' outside loop").into());
            };
            match block {
                Block::Except { .. } | Block::ExceptStar { .. } => {}
                Block::Handler { level } => {
                    let frame = self.frame();
                    frame.stack.truncate(level);
                    frame.handling.pop();
                }
                Block::With { handler: _, level } => {
                    self.run_with_exit(level)?;
                }
                Block::Finally { handler, level } => {
                    let frame = self.frame();
                    frame.stack.truncate(level);
                    frame.push(Value::Ctrl(Rc::new(Ctrl::Break)));
                    frame.ip = handler;
                    return Ok(Flow::Continue);
                }
                Block::Loop { end, level, .. } => {
                    let frame = self.frame();
                    frame.stack.truncate(level);
                    frame.ip = end;
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    fn do_continue(&mut self, target: usize, _base: usize) -> VmResult<Flow> {
        loop {
            let Some(block) = self.frame().blocks.last().copied() else {
                return Err(PyExc::runtime_error("'continue' outside loop").into());
            };
            match block {
                Block::Loop { level, .. } => {
                    // The loop block stays; drop loop-body temporaries above
                    // the iterator.
                    let frame = self.frame();
                    frame.stack.truncate(level + 1);
                    frame.ip = target;
                    return Ok(Flow::Continue);
                }
                Block::Except { .. } | Block::ExceptStar { .. } => {
                    self.frame().blocks.pop();
                }
                Block::Handler { level } => {
                    self.frame().blocks.pop();
                    let frame = self.frame();
                    frame.stack.truncate(level);
                    frame.handling.pop();
                }
                Block::With { level, .. } => {
                    self.frame().blocks.pop();
                    self.run_with_exit(level)?;
                }
                Block::Finally { handler, level } => {
                    self.frame().blocks.pop();
                    let frame = self.frame();
                    frame.stack.truncate(level);
                    frame.push(Value::Ctrl(Rc::new(Ctrl::Continue(target))));
                    frame.ip = handler;
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    /// Pop the `__exit__` callable sitting at `level - 1` and invoke it with
    /// a no-exception triple.
    fn run_with_exit(&mut self, level: usize) -> VmResult<()> {
        let frame = self.frame();
        frame.stack.truncate(level);
        let exit = frame.pop();
        self.call_value(exit, vec![Value::None, Value::None, Value::None])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Exception engine
    // -----------------------------------------------------------------------

    fn raise_varargs(&mut self, arg: u16) -> VmResult<VmError> {
        match arg {
            0 => {
                // Bare raise: the innermost exception being handled.
                let current = self
                    .frames
                    .iter()
                    .rev()
                    .find_map(|f| f.handling.last().cloned());
                match current {
                    Some(exc) => Ok(VmError::Exc(exc)),
                    None => {
                        Ok(PyExc::runtime_error("No active exception to re-raise").into())
                    }
                }
            }
            1 => {
                let v = self.frame().pop();
                let exc = self.make_exception(v)?;
                Ok(VmError::Exc(exc))
            }
            2 => {
                let cause = self.frame().pop();
                let v = self.frame().pop();
                let exc = self.make_exception(v)?;
                let cause = match cause {
                    Value::None => None,
                    c => Some(self.make_exception(c)?),
                };
                if let Value::Exception(e) = &exc {
                    let mut e = e.borrow_mut();
                    e.cause = cause;
                    e.suppress_context = true;
                }
                Ok(VmError::Exc(exc))
            }
            _ => {
                // Three-operand raise: the third operand is a traceback to
                // attach to the raised exception.
                let tb = self.frame().pop();
                let cause = self.frame().pop();
                let v = self.frame().pop();
                let exc = self.make_exception(v)?;
                let cause = match cause {
                    Value::None => None,
                    c => Some(self.make_exception(c)?),
                };
                if let Value::Exception(e) = &exc {
                    let mut e = e.borrow_mut();
                    e.cause = cause;
                    e.suppress_context = true;
                    if let Value::Exception(source) = &tb {
                        e.traceback = source.borrow().traceback.clone();
                    }
                }
                Ok(VmError::Exc(exc))
            }
        }
    }

    /// Normalize a raised value into an exception value.
    pub(crate) fn make_exception(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::Exception(_) => Ok(v),
            Value::ExcClass(_) | Value::Class(_) => {
                if !is_exception_class(&v) {
                    return Err(PyExc::type_error(
                        "exceptions must derive from BaseException",
                    )
                    .into());
                }
                self.call_value(v, vec![])
            }
            other => Err(PyExc::type_error(format!(
                "exceptions must derive from BaseException, not {}",
                other.type_name()
            ))
            .into()),
        }
    }

    fn validate_exc_matcher(&self, matcher: &Value) -> VmResult<()> {
        let ok = match matcher {
            Value::Tuple(items) => items.iter().all(is_exception_class),
            m => is_exception_class(m),
        };
        if ok {
            Ok(())
        } else {
            Err(PyExc::type_error(
                "catching classes that do not inherit from BaseException is not allowed",
            )
            .into())
        }
    }

    /// Route a raised exception through the block stacks. On success the
    /// frames/ips are adjusted and execution continues; otherwise the
    /// exception propagates to the caller of `run_frames`.
    fn handle_raise(&mut self, mut exc: Value, base: usize) -> VmResult<()> {
        // Implicit context: the innermost exception currently being handled.
        if let Value::Exception(e) = &exc {
            let needs_context = {
                let e = e.borrow();
                e.context.is_none() && !e.suppress_context
            };
            if needs_context {
                let current = self
                    .frames
                    .iter()
                    .rev()
                    .find_map(|f| f.handling.last().cloned());
                if let Some(ctx) = current {
                    if !ctx.is_identical(&exc) {
                        e.borrow_mut().context = Some(ctx);
                    }
                }
            }
        }

        // Record the faulting location.
        self.record_trace(&exc);

        loop {
            // Walk the current frame's block stack.
            loop {
                let Some(block) = self.frame().blocks.pop() else {
                    break;
                };
                match block {
                    Block::Loop { .. } => {}
                    Block::Handler { level } => {
                        let frame = self.frame();
                        frame.stack.truncate(level);
                        frame.handling.pop();
                    }
                    Block::Except { handler, level } => {
                        let frame = self.frame();
                        frame.stack.truncate(level);
                        frame.blocks.push(Block::Handler { level });
                        frame.handling.push(exc.clone());
                        frame.push(exc);
                        frame.ip = handler;
                        return Ok(());
                    }
                    Block::ExceptStar { handler, level } => {
                        let leaves = match &exc {
                            Value::Exception(e) => match &e.borrow().group {
                                Some(leaves) => leaves.clone(),
                                None => vec![exc.clone()],
                            },
                            _ => vec![exc.clone()],
                        };
                        let frame = self.frame();
                        frame.stack.truncate(level);
                        frame.eg_states.push(EgState {
                            remaining: leaves,
                            original: exc.clone(),
                        });
                        frame.handling.push(exc.clone());
                        frame.ip = handler;
                        return Ok(());
                    }
                    Block::Finally { handler, level } => {
                        let frame = self.frame();
                        frame.stack.truncate(level);
                        frame.push(Value::Ctrl(Rc::new(Ctrl::Exception(exc))));
                        frame.ip = handler;
                        return Ok(());
                    }
                    Block::With { handler, level } => {
                        // __exit__(type, value, traceback); truthy suppresses.
                        let frame = self.frame();
                        frame.stack.truncate(level);
                        let exit = frame.pop();
                        let (ty, val) = match &exc {
                            Value::Exception(e) => {
                                (e.borrow().class.clone(), exc.clone())
                            }
                            _ => (Value::None, exc.clone()),
                        };
                        match self.call_value(exit, vec![ty, val, Value::None]) {
                            Ok(result) => {
                                if self.truthy(&result)? {
                                    self.frame().ip = handler;
                                    return Ok(());
                                }
                            }
                            Err(VmError::Exc(from_exit)) => {
                                // __exit__ failed: the new exception takes
                                // over, chained to the one being unwound.
                                if let Value::Exception(e) = &from_exit {
                                    let mut e = e.borrow_mut();
                                    if e.context.is_none() && !e.suppress_context {
                                        e.context = Some(exc.clone());
                                    }
                                }
                                exc = from_exit;
                            }
                            Err(halt) => return Err(halt),
                        }
                    }
                }
            }

            // Nothing in this frame: pop it and continue in the caller.
            let finished = self.frames.pop().expect("unwinding without a frame");
            drop(finished);
            if self.frames.len() == base {
                return Err(VmError::Exc(exc));
            }
            self.record_trace(&exc);
        }
    }

    fn record_trace(&mut self, exc: &Value) {
        if let (Value::Exception(e), Some(frame)) = (exc, self.frames.last()) {
            let line = frame.current_line();
            e.borrow_mut().push_trace(
                frame.code.filename.clone(),
                line,
                frame.trace_name(),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Call a Python value from host code, for native callbacks that re-enter
    /// the interpreter (`sorted`-style key functions, visitors, hooks).
    pub fn call(&mut self, callable: Value, args: Vec<Value>) -> Result<Value, PyExc> {
        match self.call_value(callable, args) {
            Ok(v) => Ok(v),
            Err(VmError::Exc(e)) => Err(exc_value_to_pyexc(e)),
            Err(VmError::Halt(h)) => {
                // Stash the halt so the dispatch loop re-raises it once the
                // native frame unwinds.
                self.pending_halt = Some(h);
                Err(PyExc::runtime_error("execution interrupted"))
            }
        }
    }

    /// Synchronous positional call, the workhorse for dunders and builtins.
    pub(crate) fn call_value(&mut self, callable: Value, args: Vec<Value>) -> VmResult<Value> {
        self.call_with_kwargs(callable, args, Vec::new())
    }

    pub(crate) fn call_with_kwargs(
        &mut self,
        callable: Value,
        args: Vec<Value>,
        kwargs: Vec<(PyStr, Value)>,
    ) -> VmResult<Value> {
        match callable {
            Value::Function(f) => self.call_function(&f, args, kwargs),
            Value::BoundMethod(m) => match &m.func {
                Value::Str(name) => {
                    let name = name.clone();
                    crate::methods::call_type_method(self, &m.receiver, &name, args, kwargs)
                }
                func => {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(m.receiver.clone());
                    full.extend(args);
                    self.call_with_kwargs(func.clone(), full, kwargs)
                }
            },
            Value::Native(f) => {
                let mut call_args = Args::new(args, kwargs);
                let func = f.func.clone();
                let result = func(self, &mut call_args).map_err(VmError::from);
                if let Some(halt) = self.pending_halt.take() {
                    return Err(VmError::Halt(halt));
                }
                result
            }
            Value::Builtin(b) => builtins::call_builtin(self, b, args, kwargs),
            Value::Type(t) => builtins::call_type(self, t, args, kwargs),
            Value::ExcClass(ty) => {
                if matches!(ty, ExcType::ExceptionGroup | ExcType::BaseExceptionGroup) {
                    let msg = match args.first() {
                        Some(Value::Str(s)) => s.to_string(),
                        _ => {
                            return Err(PyExc::type_error(
                                "exception group argument 1 must be str",
                            )
                            .into());
                        }
                    };
                    let Some(seq) = args.get(1).cloned() else {
                        return Err(PyExc::type_error(
                            "exception group argument 2 must be a sequence of exceptions",
                        )
                        .into());
                    };
                    let leaves = self.iterate_to_vec(seq)?;
                    if leaves.is_empty()
                        || !leaves.iter().all(|l| matches!(l, Value::Exception(_)))
                    {
                        return Err(PyExc::value_error(
                            "second argument must be a non-empty sequence of exceptions",
                        )
                        .into());
                    }
                    return Ok(PyExc::group(msg, leaves).into_value());
                }
                Ok(PyExc::with_args(Value::ExcClass(ty), args).into_value())
            }
            Value::Class(_) => self.call_class(callable, args, kwargs),
            v @ Value::Instance(_) => match self.lookup_dunder(&v, "__call__") {
                Some(m) => self.call_with_kwargs(m, args, kwargs),
                None => Err(PyExc::type_error(format!(
                    "'{}' object is not callable",
                    v.type_name()
                ))
                .into()),
            },
            other => Err(PyExc::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))
            .into()),
        }
    }

    /// Bind arguments and run (or suspend) a Python function.
    fn call_function(
        &mut self,
        f: &Rc<crate::object::Function>,
        args: Vec<Value>,
        kwargs: Vec<(PyStr, Value)>,
    ) -> VmResult<Value> {
        if self.frames.len() >= self.limits.max_recursion {
            return Err(PyExc::new(
                ExcType::RecursionError,
                "maximum recursion depth exceeded",
            )
            .into());
        }

        let code = f.code.clone();
        let names_dict = if code.flags.contains(CodeFlags::OPTIMIZED) {
            None
        } else {
            // Class bodies execute against a fresh namespace dict.
            Some(Rc::new(RefCell::new(Dict::new())))
        };
        let mut frame = Frame::new(code.clone(), f.globals.clone(), names_dict);
        self.bind_args(f, &mut frame, args, kwargs)?;

        // Free variables share the captured cells.
        let n_cells = code.cell_vars.len();
        for (j, cell) in f.closure.iter().enumerate() {
            frame.cells[n_cells + j] = cell.clone();
        }

        if code.is_generator() || code.is_coroutine() {
            let generator = Generator::new(
                f.name.borrow().clone(),
                frame,
                code.is_coroutine(),
            );
            return Ok(Value::Generator(Rc::new(RefCell::new(generator))));
        }

        let gen_base = self.frames.len();
        self.frames.push(frame);
        match self.run_frames(gen_base)? {
            Exit::Return(v) => Ok(v),
            Exit::Yield(_) => {
                Err(PyExc::runtime_error("unexpected yield from function").into())
            }
        }
    }

    fn bind_args(
        &mut self,
        f: &Rc<crate::object::Function>,
        frame: &mut Frame,
        args: Vec<Value>,
        kwargs: Vec<(PyStr, Value)>,
    ) -> VmResult<()> {
        let code = &f.code;
        let name = f.name.borrow().clone();
        let n_pos = code.arg_count;
        let n_kwonly = code.kw_only_arg_count;
        let has_varargs = code.flags.contains(CodeFlags::VAR_ARGS);
        let has_varkw = code.flags.contains(CodeFlags::VAR_KEYWORDS);

        let mut extra_positional = Vec::new();
        for (idx, value) in args.into_iter().enumerate() {
            if idx < n_pos {
                frame.locals[idx] = Some(value);
            } else if has_varargs {
                extra_positional.push(value);
            } else {
                return Err(PyExc::type_error(format!(
                    "{name}() takes {n_pos} positional argument{} but {} were given",
                    if n_pos == 1 { "" } else { "s" },
                    idx + 1
                ))
                .into());
            }
        }

        let mut extra_kw: Vec<(PyStr, Value)> = Vec::new();
        for (key, value) in kwargs {
            let slot = code.var_names[..n_pos + n_kwonly]
                .iter()
                .position(|p| p.as_str() == key.as_str());
            match slot {
                Some(idx) => {
                    if frame.locals[idx].is_some() {
                        return Err(PyExc::type_error(format!(
                            "{name}() got multiple values for argument '{key}'"
                        ))
                        .into());
                    }
                    frame.locals[idx] = Some(value);
                }
                None if has_varkw => extra_kw.push((key, value)),
                None => {
                    return Err(PyExc::type_error(format!(
                        "{name}() got an unexpected keyword argument '{key}'"
                    ))
                    .into());
                }
            }
        }

        // Positional defaults fill from the right.
        let first_default = n_pos - f.defaults.len().min(n_pos);
        for (offset, default) in f.defaults.iter().enumerate() {
            let idx = first_default + offset;
            if frame.locals[idx].is_none() {
                frame.locals[idx] = Some(default.clone());
            }
        }
        // Keyword-only defaults fill by name.
        for (key, default) in &f.kw_defaults {
            if let Some(idx) = code.var_names[n_pos..n_pos + n_kwonly]
                .iter()
                .position(|p| p.as_str() == key.as_str())
            {
                let idx = n_pos + idx;
                if frame.locals[idx].is_none() {
                    frame.locals[idx] = Some(default.clone());
                }
            }
        }

        // Verify nothing required is missing.
        for idx in 0..n_pos + n_kwonly {
            if frame.locals[idx].is_none() {
                let kind = if idx < n_pos {
                    "positional argument"
                } else {
                    "keyword-only argument"
                };
                return Err(PyExc::type_error(format!(
                    "{name}() missing 1 required {kind}: '{}'",
                    code.var_names[idx]
                ))
                .into());
            }
        }

        let mut slot = n_pos + n_kwonly;
        if has_varargs {
            frame.locals[slot] = Some(Value::tuple(extra_positional));
            slot += 1;
        } else if !extra_positional.is_empty() {
            unreachable!("extras collected only with *args");
        }
        if has_varkw {
            let mut d = Dict::with_capacity(extra_kw.len());
            for (k, v) in extra_kw {
                d.insert_str(&k, v);
            }
            frame.locals[slot] = Some(Value::Dict(Rc::new(RefCell::new(d))));
        }
        Ok(())
    }

    /// Instantiate a user class: `__new__` when overridden, the default
    /// allocation otherwise, then `__init__`.
    fn call_class(
        &mut self,
        class: Value,
        args: Vec<Value>,
        kwargs: Vec<(PyStr, Value)>,
    ) -> VmResult<Value> {
        // A user subclass of an exception type builds an exception value
        // carrying a backing instance for attribute storage.
        if is_exception_class(&class) {
            let inst = Rc::new(Instance::new(class.clone()));
            let mut exc = PyExc::with_args(class.clone(), args.clone());
            exc.instance = Some(inst.clone());
            let value = exc.into_value();
            if let Some(init) = find_in_mro(&class, "__init__") {
                let mut full = vec![value.clone()];
                full.extend(args);
                self.call_with_kwargs(init, full, kwargs)?;
            }
            return Ok(value);
        }

        let instance = if let Some(new) = find_in_mro(&class, "__new__") {
            let new = match new {
                Value::StaticMethod(inner) => (*inner).clone(),
                other => other,
            };
            let mut full = vec![class.clone()];
            full.extend(args.clone());
            let produced = self.call_with_kwargs(new, full, kwargs.clone())?;
            // __new__ returning something else skips __init__.
            let same_cls = match &produced {
                Value::Instance(inst) => {
                    crate::object::same_class(&inst.class_value(), &class)
                }
                _ => false,
            };
            if !same_cls {
                return Ok(produced);
            }
            produced
        } else {
            Value::Instance(Rc::new(Instance::new(class.clone())))
        };

        if let Some(init) = find_in_mro(&class, "__init__") {
            let mut full = vec![instance.clone()];
            full.extend(args);
            let result = self.call_with_kwargs(init, full, kwargs)?;
            if !matches!(result, Value::None) {
                return Err(PyExc::type_error(format!(
                    "__init__() should return None, not '{}'",
                    result.type_name()
                ))
                .into());
            }
        } else if !args.is_empty() || !kwargs.is_empty() {
            return Err(PyExc::type_error(format!(
                "{}() takes no arguments",
                class_name_of(&class)
            ))
            .into());
        }
        Ok(instance)
    }

    fn make_function(&mut self, flags: u16) -> VmResult<Value> {
        let code = match self.frame().pop() {
            Value::Code(c) => c,
            _ => return Err(PyExc::type_error("MAKE_FUNCTION needs a code object").into()),
        };
        let closure = if flags & 0x08 != 0 {
            match self.frame().pop() {
                Value::Tuple(cells) => cells
                    .iter()
                    .map(|c| match c {
                        Value::Cell(cell) => Ok(cell.clone()),
                        _ => Err(VmError::from(PyExc::type_error(
                            "closure must be a tuple of cells",
                        ))),
                    })
                    .collect::<VmResult<Vec<_>>>()?,
                _ => {
                    return Err(PyExc::type_error("closure must be a tuple").into());
                }
            }
        } else {
            Vec::new()
        };
        let kw_defaults = if flags & 0x02 != 0 {
            match self.frame().pop() {
                Value::Dict(d) => d
                    .borrow()
                    .items()
                    .into_iter()
                    .filter_map(|(k, v)| match k {
                        Value::Str(s) => Some((s, v)),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            }
        } else {
            Vec::new()
        };
        let defaults = if flags & 0x01 != 0 {
            match self.frame().pop() {
                Value::Tuple(t) => t.to_vec(),
                _ => Vec::new(),
            }
        } else {
            Vec::new()
        };
        let globals = self.frame().globals.clone();
        let name = code.name.clone();
        Ok(Value::Function(Rc::new(crate::object::Function {
            code,
            globals,
            defaults,
            kw_defaults,
            closure,
            name: RefCell::new(name),
            doc: None,
            dict: Rc::new(RefCell::new(Dict::new())),
        })))
    }

    /// Create a class from its parts; shared by `BUILD_CLASS` and the
    /// three-argument `type()`.
    pub(crate) fn build_class(
        &mut self,
        name: &str,
        mut bases: Vec<Value>,
        ns: DictRef,
        metaclass: Option<Value>,
    ) -> VmResult<Value> {
        if bases.is_empty() {
            bases.push(Value::Type(PyType::Object));
        }
        for b in &bases {
            if !matches!(b, Value::Class(_) | Value::ExcClass(_) | Value::Type(PyType::Object)) {
                return Err(PyExc::type_error(format!(
                    "cannot subclass '{}'",
                    class_name_of(b)
                ))
                .into());
            }
        }

        let slots = match ns.borrow().get_str("__slots__") {
            Some(Value::Str(s)) => Some(vec![s.clone()]),
            Some(Value::Tuple(items)) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(PyStr::new))
                    .collect(),
            ),
            Some(Value::List(items)) => Some(
                items
                    .borrow()
                    .iter()
                    .filter_map(|v| v.as_str().map(PyStr::new))
                    .collect(),
            ),
            _ => None,
        };

        let class = Value::Class(Rc::new(Class {
            name: PyStr::new(name),
            bases: bases.clone(),
            dict: ns,
            mro: RefCell::new(Vec::new()),
            metaclass,
            virtual_subclasses: RefCell::new(Vec::new()),
            slots,
        }));
        let mro = c3_linearize(class.clone(), &bases)
            .map_err(|msg| VmError::from(PyExc::type_error(msg)))?;
        if let Value::Class(c) = &class {
            *c.mro.borrow_mut() = mro;
        }
        Ok(class)
    }

    // -----------------------------------------------------------------------
    // Truthiness, hashing, formatting, length
    // -----------------------------------------------------------------------

    /// Truth value, consulting `__bool__` then `__len__` on instances.
    pub(crate) fn truthy(&mut self, v: &Value) -> VmResult<bool> {
        match v {
            Value::Instance(_) => {
                if let Some(m) = self.lookup_dunder(v, "__bool__") {
                    let r = self.call_value(m, vec![])?;
                    return match r {
                        Value::Bool(b) => Ok(b),
                        other => Err(PyExc::type_error(format!(
                            "__bool__ should return bool, returned {}",
                            other.type_name()
                        ))
                        .into()),
                    };
                }
                if let Some(m) = self.lookup_dunder(v, "__len__") {
                    let r = self.call_value(m, vec![])?;
                    return Ok(r.as_int().is_some_and(|n| n != 0));
                }
                Ok(true)
            }
            _ => Ok(v.is_truthy()),
        }
    }

    /// `len(v)`, consulting `__len__` on instances.
    pub(crate) fn py_len(&mut self, v: &Value) -> VmResult<i64> {
        let n = match v {
            Value::Str(s) => s.char_len() as i64,
            Value::Bytes(b) => b.len() as i64,
            Value::List(l) => l.borrow().len() as i64,
            Value::Tuple(t) => t.len() as i64,
            Value::Dict(d) => d.borrow().len() as i64,
            Value::Set(s) => s.borrow().len() as i64,
            Value::FrozenSet(s) => s.len() as i64,
            Value::Range(r) => r.len(),
            Value::Instance(_) => {
                let Some(m) = self.lookup_dunder(v, "__len__") else {
                    return Err(PyExc::type_error(format!(
                        "object of type '{}' has no len()",
                        v.type_name()
                    ))
                    .into());
                };
                let r = self.call_value(m, vec![])?;
                let Some(n) = r.as_int() else {
                    return Err(PyExc::type_error(
                        "'__len__' should return an integer",
                    )
                    .into());
                };
                if n < 0 {
                    return Err(PyExc::value_error("__len__() should return >= 0").into());
                }
                n
            }
            other => {
                return Err(PyExc::type_error(format!(
                    "object of type '{}' has no len()",
                    other.type_name()
                ))
                .into());
            }
        };
        Ok(n)
    }

    /// Hash a value, consulting `__hash__` on instances and rejecting the
    /// unhashable kinds.
    pub(crate) fn hash_value(&mut self, v: &Value) -> VmResult<i64> {
        use crate::py_hash as ph;
        let h = match v {
            Value::None => ph::hash_str("NoneType"),
            Value::NotImplemented => ph::hash_str("NotImplementedType"),
            Value::Bool(b) => ph::hash_int(i64::from(*b)),
            Value::Int(x) => ph::hash_int(*x),
            Value::BigInt(b) => ph::hash_bigint(b),
            Value::Float(f) => ph::hash_float(*f),
            Value::Complex { re, im } => {
                // Combine the parts the way the numeric hash docs describe.
                ph::hash_float(*re).wrapping_add(ph::hash_float(*im).wrapping_mul(1_000_003))
            }
            Value::Str(s) => ph::hash_str(s),
            Value::Bytes(b) => ph::hash_bytes(b),
            Value::Tuple(items) => {
                let mut elem = Vec::with_capacity(items.len());
                for item in items.iter() {
                    elem.push(self.hash_value(item)?);
                }
                ph::hash_tuple(&elem)
            }
            Value::FrozenSet(s) => ph::hash_frozenset(&s.elem_hashes()),
            Value::Range(r) => {
                ph::hash_tuple(&[ph::hash_int(r.start), ph::hash_int(r.stop), ph::hash_int(r.step)])
            }
            Value::Instance(inst) => {
                let class = inst.class_value();
                if let Some(m) = find_in_mro(&class, "__hash__") {
                    if matches!(m, Value::None) {
                        return Err(unhashable(v));
                    }
                    let bound = Value::BoundMethod(Rc::new(BoundMethod {
                        func: m,
                        receiver: v.clone(),
                    }));
                    let r = self.call_value(bound, vec![])?;
                    return r.as_int().ok_or_else(|| {
                        VmError::from(PyExc::type_error(
                            "__hash__ method should return an integer",
                        ))
                    });
                }
                if find_in_mro(&class, "__eq__").is_some() {
                    return Err(unhashable(v));
                }
                Rc::as_ptr(inst) as i64
            }
            Value::List(_) | Value::Dict(_) | Value::Set(_) | Value::Slice(_) => {
                return Err(unhashable(v));
            }
            other => {
                // Identity hash for opaque kinds.
                let id = other.heap_id();
                if id != 0 {
                    id as i64
                } else {
                    ph::hash_str(&other.type_name())
                }
            }
        };
        Ok(h)
    }

    /// `str(v)` with `__str__`/`__repr__` dispatch.
    pub(crate) fn py_str(&mut self, v: &Value) -> VmResult<String> {
        if let Value::Instance(_) = v {
            if let Some(m) = self.lookup_dunder(v, "__str__") {
                let r = self.call_value(m, vec![])?;
                return match r {
                    Value::Str(s) => Ok(s.to_string()),
                    other => Err(PyExc::type_error(format!(
                        "__str__ returned non-string (type {})",
                        other.type_name()
                    ))
                    .into()),
                };
            }
            return self.py_repr(v);
        }
        Ok(crate::format::plain_str(v))
    }

    /// `repr(v)` with `__repr__` dispatch.
    pub(crate) fn py_repr(&mut self, v: &Value) -> VmResult<String> {
        if let Value::Instance(_) = v {
            if let Some(m) = self.lookup_dunder(v, "__repr__") {
                let r = self.call_value(m, vec![])?;
                return match r {
                    Value::Str(s) => Ok(s.to_string()),
                    other => Err(PyExc::type_error(format!(
                        "__repr__ returned non-string (type {})",
                        other.type_name()
                    ))
                    .into()),
                };
            }
        }
        Ok(crate::format::plain_repr(v))
    }

    /// The class of a value, as `type(v)` reports it.
    pub(crate) fn type_of(&self, v: &Value) -> Value {
        match v {
            Value::None => Value::Type(PyType::NoneType),
            Value::NotImplemented => Value::Type(PyType::NotImplementedType),
            Value::Bool(_) => Value::Type(PyType::Bool),
            Value::Int(_) | Value::BigInt(_) => Value::Type(PyType::Int),
            Value::Float(_) => Value::Type(PyType::Float),
            Value::Complex { .. } => Value::Type(PyType::Complex),
            Value::Str(_) => Value::Type(PyType::Str),
            Value::Bytes(_) => Value::Type(PyType::Bytes),
            Value::List(_) => Value::Type(PyType::List),
            Value::Tuple(_) => Value::Type(PyType::Tuple),
            Value::Dict(_) => Value::Type(PyType::Dict),
            Value::Set(_) => Value::Type(PyType::Set),
            Value::FrozenSet(_) => Value::Type(PyType::FrozenSet),
            Value::Range(_) => Value::Type(PyType::Range),
            Value::Slice(_) => Value::Type(PyType::Slice),
            Value::Function(_) => Value::Type(PyType::FunctionType),
            Value::BoundMethod(_) => Value::Type(PyType::MethodType),
            Value::Module(_) => Value::Type(PyType::ModuleType),
            Value::Generator(g) => {
                if g.borrow().is_coroutine {
                    Value::Type(PyType::Coroutine)
                } else {
                    Value::Type(PyType::GeneratorType)
                }
            }
            Value::Property(_) => Value::Type(PyType::Property),
            Value::ClassMethod(_) => Value::Type(PyType::ClassMethod),
            Value::StaticMethod(_) => Value::Type(PyType::StaticMethod),
            Value::Instance(inst) => inst.class_value(),
            Value::Exception(e) => e.borrow().class.clone(),
            Value::Class(c) => c
                .metaclass
                .clone()
                .unwrap_or(Value::Type(PyType::Type)),
            Value::Type(_) | Value::ExcClass(_) => Value::Type(PyType::Type),
            _ => Value::Type(PyType::Object),
        }
    }

    /// Find a special method on a value's class (never in the instance
    /// dict), bound to the value.
    pub(crate) fn lookup_dunder(&mut self, v: &Value, name: &str) -> Option<Value> {
        let class = match v {
            Value::Instance(inst) => inst.class_value(),
            Value::Exception(e) => e.borrow().class.clone(),
            _ => return None,
        };
        let found = find_in_mro(&class, name)?;
        match found {
            Value::Function(_) | Value::Native(_) | Value::Builtin(_) => {
                Some(Value::BoundMethod(Rc::new(BoundMethod {
                    func: found,
                    receiver: v.clone(),
                })))
            }
            Value::StaticMethod(inner) => Some((*inner).clone()),
            Value::ClassMethod(inner) => Some(Value::BoundMethod(Rc::new(BoundMethod {
                func: (*inner).clone(),
                receiver: class,
            }))),
            Value::None => None,
            other => Some(other),
        }
    }

    // -----------------------------------------------------------------------
    // Subscripts
    // -----------------------------------------------------------------------

    pub(crate) fn get_item(&mut self, obj: &Value, key: &Value) -> VmResult<Value> {
        match obj {
            Value::List(items) => {
                if let Value::Slice(s) = key {
                    let items = items.borrow();
                    let idx = self.resolve_slice(s, items.len())?;
                    return Ok(Value::list(slice::take_slice(&items, idx)));
                }
                let items = items.borrow();
                let idx = seq_index(key, items.len(), "list")?;
                Ok(items[idx].clone())
            }
            Value::Tuple(items) => {
                if let Value::Slice(s) = key {
                    let idx = self.resolve_slice(s, items.len())?;
                    return Ok(Value::tuple(slice::take_slice(items, idx)));
                }
                let idx = seq_index(key, items.len(), "tuple")?;
                Ok(items[idx].clone())
            }
            Value::Str(s) => {
                if let Value::Slice(sl) = key {
                    let len = s.char_len();
                    let idx = self.resolve_slice(sl, len)?;
                    return Ok(Value::str(slice::slice_str(s, idx)));
                }
                let len = s.char_len();
                let idx = seq_index(key, len, "string")?;
                let c = s.chars().nth(idx).expect("index checked");
                Ok(Value::str(c.to_string()))
            }
            Value::Bytes(b) => {
                if let Value::Slice(sl) = key {
                    let idx = self.resolve_slice(sl, b.len())?;
                    return Ok(Value::bytes(slice::slice_bytes(b, idx)));
                }
                let idx = seq_index(key, b.len(), "bytes")?;
                Ok(Value::Int(i64::from(b[idx])))
            }
            Value::Dict(d) => {
                let hash = self.hash_value(key)?;
                d.borrow()
                    .get_with_hash(hash, key)
                    .cloned()
                    .ok_or_else(|| {
                        PyExc::key_error(crate::format::plain_repr(key)).into()
                    })
            }
            Value::Range(r) => {
                if let Value::Slice(sl) = key {
                    let len = r.len().max(0) as usize;
                    let idx = self.resolve_slice(sl, len)?;
                    let start = r.start + idx.start * r.step;
                    let stop = r.start + idx.stop * r.step;
                    let step = r.step * idx.step;
                    return Ok(Value::range(start, stop, if step == 0 { 1 } else { step }));
                }
                match key.as_int() {
                    Some(i) => r.get(i).map(Value::Int).ok_or_else(|| {
                        PyExc::index_error("range object index out of range").into()
                    }),
                    None => Err(PyExc::type_error(
                        "range indices must be integers or slices",
                    )
                    .into()),
                }
            }
            Value::Instance(_) => match self.lookup_dunder(obj, "__getitem__") {
                Some(m) => self.call_value(m, vec![key.clone()]),
                None => Err(PyExc::type_error(format!(
                    "'{}' object is not subscriptable",
                    obj.type_name()
                ))
                .into()),
            },
            // `list[int]`: subscripting a type builds a generic alias.
            Value::Type(_) | Value::Class(_) | Value::ExcClass(_) => {
                let args = match key {
                    Value::Tuple(items) => items.to_vec(),
                    other => vec![other.clone()],
                };
                Ok(Value::GenericAlias(Rc::new(crate::object::GenericAlias {
                    origin: obj.clone(),
                    args,
                })))
            }
            other => Err(PyExc::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))
            .into()),
        }
    }

    pub(crate) fn set_item(&mut self, obj: &Value, key: &Value, value: Value) -> VmResult<()> {
        match obj {
            Value::List(items) => {
                if let Value::Slice(s) = key {
                    let replacement = self.iterate_to_vec(value)?;
                    let mut items = items.borrow_mut();
                    let idx = self.resolve_slice(s, items.len())?;
                    slice::assign_slice(&mut items, idx, replacement)?;
                    return Ok(());
                }
                let mut items = items.borrow_mut();
                let idx = seq_index(key, items.len(), "list")?;
                items[idx] = value;
                Ok(())
            }
            Value::Dict(d) => {
                let hash = self.hash_value(key)?;
                d.borrow_mut().insert(hash, key.clone(), value);
                Ok(())
            }
            Value::Instance(_) => match self.lookup_dunder(obj, "__setitem__") {
                Some(m) => {
                    self.call_value(m, vec![key.clone(), value])?;
                    Ok(())
                }
                None => Err(PyExc::type_error(format!(
                    "'{}' object does not support item assignment",
                    obj.type_name()
                ))
                .into()),
            },
            other => Err(PyExc::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))
            .into()),
        }
    }

    pub(crate) fn del_item(&mut self, obj: &Value, key: &Value) -> VmResult<()> {
        match obj {
            Value::List(items) => {
                if let Value::Slice(s) = key {
                    let mut items = items.borrow_mut();
                    let idx = self.resolve_slice(s, items.len())?;
                    slice::delete_slice(&mut items, idx);
                    return Ok(());
                }
                let mut items = items.borrow_mut();
                let idx = seq_index(key, items.len(), "list")?;
                items.remove(idx);
                Ok(())
            }
            Value::Dict(d) => {
                let hash = self.hash_value(key)?;
                match d.borrow_mut().remove(hash, key) {
                    Some(_) => Ok(()),
                    None => {
                        Err(PyExc::key_error(crate::format::plain_repr(key)).into())
                    }
                }
            }
            Value::Instance(_) => match self.lookup_dunder(obj, "__delitem__") {
                Some(m) => {
                    self.call_value(m, vec![key.clone()])?;
                    Ok(())
                }
                None => Err(PyExc::type_error(format!(
                    "'{}' object does not support item deletion",
                    obj.type_name()
                ))
                .into()),
            },
            other => Err(PyExc::type_error(format!(
                "'{}' object does not support item deletion",
                other.type_name()
            ))
            .into()),
        }
    }

    fn resolve_slice(
        &mut self,
        s: &SliceObj,
        len: usize,
    ) -> VmResult<slice::SliceIndices> {
        let field = |v: &Value| -> VmResult<Option<i64>> {
            match v {
                Value::None => Ok(None),
                v => v.as_int().map(Some).ok_or_else(|| {
                    VmError::from(PyExc::type_error(
                        "slice indices must be integers or None",
                    ))
                }),
            }
        };
        let start = field(&s.start)?;
        let stop = field(&s.stop)?;
        let step = field(&s.step)?;
        slice::resolve(len, start, stop, step).map_err(VmError::from)
    }

    // -----------------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------------

    pub(crate) fn new_iter_value(&mut self, items: Vec<Value>) -> Value {
        Value::Iter(Rc::new(RefCell::new(PyIter::from_items(items))))
    }

    /// `iter(v)`.
    pub(crate) fn get_iter(&mut self, v: Value) -> VmResult<Value> {
        let it = match &v {
            Value::Iter(_) | Value::Generator(_) => return Ok(v),
            Value::List(items) => PyIter::from_items(items.borrow().clone()),
            Value::Tuple(items) => PyIter::from_items(items.to_vec()),
            Value::Str(s) => {
                PyIter::from_items(s.chars().map(|c| Value::str(c.to_string())).collect())
            }
            Value::Bytes(b) => {
                PyIter::from_items(b.iter().map(|&x| Value::Int(i64::from(x))).collect())
            }
            Value::Range(r) => PyIter::from_range(r.start, r.stop, r.step),
            Value::Dict(d) => PyIter::from_items(d.borrow().keys()),
            Value::Set(s) => {
                PyIter::from_items(s.borrow().iter().cloned().collect())
            }
            Value::FrozenSet(s) => PyIter::from_items(s.iter().cloned().collect()),
            Value::Instance(_) => {
                if let Some(m) = self.lookup_dunder(&v, "__iter__") {
                    let produced = self.call_value(m, vec![])?;
                    return match &produced {
                        Value::Iter(_) | Value::Generator(_) | Value::Instance(_) => {
                            Ok(produced)
                        }
                        other => Err(PyExc::type_error(format!(
                            "iter() returned non-iterator of type '{}'",
                            other.type_name()
                        ))
                        .into()),
                    };
                }
                // A bare __next__ makes the object its own iterator.
                if self.lookup_dunder(&v, "__next__").is_some() {
                    return Ok(v);
                }
                return Err(not_iterable(&v));
            }
            _ => return Err(not_iterable(&v)),
        };
        Ok(Value::Iter(Rc::new(RefCell::new(it))))
    }

    /// Advance an iterator. `Ok(None)` is plain exhaustion; a
    /// `StopIteration` error carries a generator's return value.
    pub(crate) fn iter_next(&mut self, it: &Value) -> VmResult<Option<Value>> {
        match it {
            Value::Iter(rc) => {
                // Fast kinds first.
                if let Ok(step) = rc.borrow_mut().next_simple() {
                    return Ok(step);
                }
                self.combinator_next(rc)
            }
            Value::Generator(g) => match self.gen_resume(g, None)? {
                GenStep::Yield(v) => Ok(Some(v)),
                GenStep::Done(Value::None) => Ok(None),
                GenStep::Done(v) => Err(PyExc::stop_iteration(Some(v)).into()),
            },
            Value::Instance(_) => {
                let Some(m) = self.lookup_dunder(it, "__next__") else {
                    return Err(not_iterable(it));
                };
                match self.call_value(m, vec![]) {
                    Ok(v) => Ok(Some(v)),
                    Err(e) => Err(e),
                }
            }
            _ => Err(not_iterable(it)),
        }
    }

    fn combinator_next(
        &mut self,
        rc: &Rc<RefCell<PyIter>>,
    ) -> VmResult<Option<Value>> {
        enum Plan {
            Map(Value, Vec<Value>),
            Filter(Value, Value),
            Zip(Vec<Value>),
            Enumerate(Value, i64),
        }
        let plan = {
            let it = rc.borrow();
            match &it.kind {
                IterKind::Map { func, iters } => Plan::Map(func.clone(), iters.clone()),
                IterKind::Filter { func, iter } => {
                    Plan::Filter(func.clone(), iter.clone())
                }
                IterKind::Zip { iters } => Plan::Zip(iters.clone()),
                IterKind::Enumerate { iter, index } => {
                    Plan::Enumerate(iter.clone(), *index)
                }
                _ => unreachable!("simple kinds handled by next_simple"),
            }
        };
        match plan {
            Plan::Map(func, iters) => {
                let mut row = Vec::with_capacity(iters.len());
                for inner in &iters {
                    match self.iter_next(inner)? {
                        Some(v) => row.push(v),
                        None => return Ok(None),
                    }
                }
                self.call_value(func, row).map(Some)
            }
            Plan::Filter(func, iter) => loop {
                let Some(v) = self.iter_next(&iter)? else {
                    return Ok(None);
                };
                let keep = match &func {
                    Value::None => self.truthy(&v)?,
                    f => {
                        let r = self.call_value(f.clone(), vec![v.clone()])?;
                        self.truthy(&r)?
                    }
                };
                if keep {
                    return Ok(Some(v));
                }
            },
            Plan::Zip(iters) => {
                if iters.is_empty() {
                    return Ok(None);
                }
                let mut row = Vec::with_capacity(iters.len());
                for inner in &iters {
                    match self.iter_next(inner)? {
                        Some(v) => row.push(v),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::tuple(row)))
            }
            Plan::Enumerate(iter, index) => {
                let Some(v) = self.iter_next(&iter)? else {
                    return Ok(None);
                };
                if let IterKind::Enumerate { index: stored, .. } =
                    &mut rc.borrow_mut().kind
                {
                    *stored = index + 1;
                }
                Ok(Some(Value::tuple(vec![Value::Int(index), v])))
            }
        }
    }

    /// Materialize any iterable into a vector.
    pub(crate) fn iterate_to_vec(&mut self, v: Value) -> VmResult<Vec<Value>> {
        match &v {
            Value::List(items) => return Ok(items.borrow().clone()),
            Value::Tuple(items) => return Ok(items.to_vec()),
            _ => {}
        }
        let iter = self.get_iter(v)?;
        let mut out = Vec::new();
        loop {
            match self.iter_next(&iter) {
                Ok(Some(v)) => {
                    self.check_collection(out.len() + 1)?;
                    self.charge_allocation(1)?;
                    out.push(v);
                }
                Ok(None) => break,
                Err(VmError::Exc(e)) if is_stop_iteration(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Generators
    // -----------------------------------------------------------------------

    fn gen_resume(
        &mut self,
        g: &Rc<RefCell<Generator>>,
        send: Option<Value>,
    ) -> VmResult<GenStep> {
        {
            let gen = g.borrow();
            match gen.state {
                GenState::Done => {
                    return Err(PyExc::stop_iteration(None).into());
                }
                GenState::Running => {
                    return Err(PyExc::value_error("generator already executing").into());
                }
                GenState::Created => {
                    if let Some(v) = &send {
                        if !matches!(v, Value::None) {
                            return Err(PyExc::type_error(
                                "can't send non-None value to a just-started generator",
                            )
                            .into());
                        }
                    }
                }
                GenState::Suspended => {}
            }
        }

        let frame = {
            let mut gen = g.borrow_mut();
            let mut frame = gen.frame.take().expect("suspended generator has a frame");
            let was_created = gen.state == GenState::Created;
            gen.state = GenState::Running;
            if !was_created {
                // The value sent becomes the result of the suspended yield.
                frame.push(send.unwrap_or(Value::None));
            }
            frame
        };

        if self.frames.len() >= self.limits.max_recursion {
            g.borrow_mut().state = GenState::Done;
            return Err(PyExc::new(
                ExcType::RecursionError,
                "maximum recursion depth exceeded",
            )
            .into());
        }

        let base = self.frames.len();
        self.frames.push(frame);
        match self.run_frames(base) {
            Ok(Exit::Yield(v)) => {
                let frame = self.frames.pop().expect("yielding frame");
                let mut gen = g.borrow_mut();
                gen.frame = Some(frame);
                gen.state = GenState::Suspended;
                Ok(GenStep::Yield(v))
            }
            Ok(Exit::Return(v)) => {
                g.borrow_mut().state = GenState::Done;
                Ok(GenStep::Done(v))
            }
            Err(e) => {
                g.borrow_mut().state = GenState::Done;
                self.frames.truncate(base);
                Err(e)
            }
        }
    }

    /// `gen.send(value)`.
    pub(crate) fn generator_send(
        &mut self,
        g: &Rc<RefCell<Generator>>,
        value: Value,
    ) -> VmResult<Value> {
        match self.gen_resume(g, Some(value))? {
            GenStep::Yield(v) => Ok(v),
            GenStep::Done(v) => Err(PyExc::stop_iteration(Some(v)).into()),
        }
    }

    /// `gen.throw(exc)`: resume by raising at the suspension point.
    pub(crate) fn generator_throw(
        &mut self,
        g: &Rc<RefCell<Generator>>,
        exc: Value,
    ) -> VmResult<Value> {
        let exc = self.make_exception(exc)?;
        {
            let gen = g.borrow();
            match gen.state {
                GenState::Done => return Err(VmError::Exc(exc)),
                GenState::Running => {
                    return Err(PyExc::value_error("generator already executing").into());
                }
                _ => {}
            }
        }
        let frame = {
            let mut gen = g.borrow_mut();
            gen.state = GenState::Running;
            gen.frame.take().expect("suspended generator has a frame")
        };
        let base = self.frames.len();
        self.frames.push(frame);

        // Deliver the exception at the resume point, then keep running if a
        // handler inside the generator caught it.
        match self.handle_raise(exc, base) {
            Ok(()) => {}
            Err(e) => {
                g.borrow_mut().state = GenState::Done;
                self.frames.truncate(base);
                return Err(e);
            }
        }
        match self.run_frames(base) {
            Ok(Exit::Yield(v)) => {
                let frame = self.frames.pop().expect("yielding frame");
                let mut gen = g.borrow_mut();
                gen.frame = Some(frame);
                gen.state = GenState::Suspended;
                Ok(v)
            }
            Ok(Exit::Return(v)) => {
                g.borrow_mut().state = GenState::Done;
                Err(PyExc::stop_iteration(Some(v)).into())
            }
            Err(e) => {
                g.borrow_mut().state = GenState::Done;
                self.frames.truncate(base);
                Err(e)
            }
        }
    }

    /// `gen.close()`: raise `GeneratorExit` at the suspension point.
    pub(crate) fn generator_close(
        &mut self,
        g: &Rc<RefCell<Generator>>,
    ) -> VmResult<Value> {
        {
            let mut gen = g.borrow_mut();
            match gen.state {
                GenState::Done => return Ok(Value::None),
                GenState::Created => {
                    gen.state = GenState::Done;
                    gen.frame = None;
                    return Ok(Value::None);
                }
                GenState::Running => {
                    return Err(PyExc::value_error("generator already executing").into());
                }
                GenState::Suspended => {}
            }
        }
        let exit = PyExc::new(ExcType::GeneratorExit, "").into_value();
        match self.generator_throw_value(g, exit) {
            Ok(_) => Err(PyExc::runtime_error("generator ignored GeneratorExit").into()),
            Err(VmError::Exc(e)) => {
                let swallowed = match &e {
                    Value::Exception(exc) => {
                        let class = exc.borrow().class.clone();
                        match_class(&class, &Value::ExcClass(ExcType::GeneratorExit))
                            || match_class(&class, &Value::ExcClass(ExcType::StopIteration))
                    }
                    _ => false,
                };
                if swallowed {
                    Ok(Value::None)
                } else {
                    Err(VmError::Exc(e))
                }
            }
            Err(halt) => Err(halt),
        }
    }

    fn generator_throw_value(
        &mut self,
        g: &Rc<RefCell<Generator>>,
        exc: Value,
    ) -> VmResult<Value> {
        self.generator_throw(g, exc)
    }

    /// Drive an awaitable to completion on this thread.
    fn await_value(&mut self, v: Value) -> VmResult<Value> {
        match &v {
            Value::Generator(g) if g.borrow().is_coroutine => {
                let g = g.clone();
                loop {
                    match self.gen_resume(&g, None) {
                        Ok(GenStep::Yield(_)) => continue,
                        Ok(GenStep::Done(result)) => return Ok(result),
                        Err(e) => return Err(e),
                    }
                }
            }
            Value::Instance(_) => {
                if let Some(m) = self.lookup_dunder(&v, "__await__") {
                    let inner = self.call_value(m, vec![])?;
                    return self.await_value(inner);
                }
                Err(PyExc::type_error(format!(
                    "object {} can't be used in 'await' expression",
                    v.type_name()
                ))
                .into())
            }
            Value::Generator(_) | Value::Iter(_) => {
                // An iterator-flavored awaitable: drain it for its result.
                loop {
                    match self.iter_next(&v) {
                        Ok(Some(_)) => continue,
                        Ok(None) => return Ok(Value::None),
                        Err(VmError::Exc(e)) if is_stop_iteration(&e) => {
                            if let Value::Exception(exc) = &e {
                                return Ok(exc.borrow().stop_iteration_value());
                            }
                            return Ok(Value::None);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            other => Err(PyExc::type_error(format!(
                "object {} can't be used in 'await' expression",
                other.type_name()
            ))
            .into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Unwrap an exception value into a plain `PyExc` for host-facing paths.
pub(crate) fn exc_value_to_pyexc(v: Value) -> PyExc {
    match v {
        Value::Exception(e) => e.borrow().clone(),
        other => PyExc::runtime_error(crate::format::plain_repr(&other)),
    }
}

fn unhashable(v: &Value) -> VmError {
    PyExc::type_error(format!("unhashable type: '{}'", v.type_name())).into()
}

fn not_iterable(v: &Value) -> VmError {
    PyExc::type_error(format!("'{}' object is not iterable", v.type_name())).into()
}

pub(crate) fn is_stop_iteration(e: &Value) -> bool {
    match e {
        Value::Exception(exc) => match_class(
            &exc.borrow().class,
            &Value::ExcClass(ExcType::StopIteration),
        ),
        _ => false,
    }
}

fn seq_index(key: &Value, len: usize, what: &str) -> VmResult<usize> {
    let Some(i) = key.as_int() else {
        return Err(PyExc::type_error(format!(
            "{what} indices must be integers, not {}",
            key.type_name()
        ))
        .into());
    };
    let len = len as i64;
    let idx = if i < 0 { i + len } else { i };
    if idx < 0 || idx >= len {
        return Err(PyExc::index_error(format!("{what} index out of range")).into());
    }
    Ok(idx as usize)
}

fn unpack_error(got: usize, expected: usize) -> PyExc {
    if got < expected {
        PyExc::value_error(format!(
            "not enough values to unpack (expected {expected}, got {got})"
        ))
    } else {
        PyExc::value_error(format!(
            "too many values to unpack (expected {expected})"
        ))
    }
}

fn unpack_pair(arg: u16) -> (usize, usize) {
    ((arg & 0xff) as usize, (arg >> 8) as usize)
}

fn int_pair(a: &Value, b: &Value) -> Option<(i64, i64)> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some((*x, *y)),
        _ => None,
    }
}

fn int_compare_kind(op: Opcode) -> CmpOp {
    match op {
        Opcode::CompareLtInt => CmpOp::Lt,
        Opcode::CompareLeInt => CmpOp::Le,
        Opcode::CompareGtInt => CmpOp::Gt,
        Opcode::CompareGeInt => CmpOp::Ge,
        Opcode::CompareEqInt => CmpOp::Eq,
        _ => CmpOp::Ne,
    }
}

fn jump_compare_kind(op: Opcode) -> CmpOp {
    match op {
        Opcode::CompareLtJump => CmpOp::Lt,
        Opcode::CompareLeJump => CmpOp::Le,
        Opcode::CompareGtJump => CmpOp::Gt,
        Opcode::CompareGeJump => CmpOp::Ge,
        Opcode::CompareEqJump => CmpOp::Eq,
        _ => CmpOp::Ne,
    }
}

fn apply_int_compare(op: CmpOp, a: i64, b: i64) -> bool {
    match op {
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
        CmpOp::Eq => a == b,
        _ => a != b,
    }
}
