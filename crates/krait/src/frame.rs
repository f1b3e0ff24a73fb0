//! Call frames and the block stack.
//!
//! Every call gets a [`Frame`]: the code object, an instruction pointer, its
//! own operand stack (sized from the code's `stack_size`), the fast local
//! slots, closure cells, and a block stack guarding `try`/`finally`/`with`
//! and loops. Frames are plain values so a generator can own its suspended
//! frame and hand it back to the VM on resume.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::CodeObject;
use crate::value::{CellRef, DictRef, Value};

/// An entry on a frame's block stack.
#[derive(Debug, Clone, Copy)]
pub enum Block {
    /// A loop; `end` is where `break` goes.
    Loop { end: usize, level: usize },
    /// `try:` with at least one `except` clause.
    Except { handler: usize, level: usize },
    /// `try:` with a `finally` clause.
    Finally { handler: usize, level: usize },
    /// `with` body; `handler` is the join point after the statement. The
    /// `__exit__` callable sits on the operand stack at `level - 1`.
    With { handler: usize, level: usize },
    /// `try:` with `except*` clauses.
    ExceptStar { handler: usize, level: usize },
    /// An `except` handler is running; popped by `POP_EXCEPT`.
    Handler { level: usize },
}

impl Block {
    pub fn level(&self) -> usize {
        match *self {
            Block::Loop { level, .. }
            | Block::Except { level, .. }
            | Block::Finally { level, .. }
            | Block::With { level, .. }
            | Block::ExceptStar { level, .. }
            | Block::Handler { level } => level,
        }
    }
}

/// Why control is passing through a `finally` handler. Pushed on the operand
/// stack (wrapped in `Value::Ctrl`) before jumping to the handler;
/// `END_FINALLY` pops it and resumes whatever was interrupted.
#[derive(Debug)]
pub enum Ctrl {
    /// The body completed normally.
    Fallthrough,
    /// An exception is unwinding; re-raised at `END_FINALLY` unless the
    /// handler replaced it.
    Exception(Value),
    /// A `return` is unwinding with this value.
    Return(Value),
    Break,
    Continue(usize),
}

/// Split leaves of an exception group while `except*` handlers run.
pub struct EgState {
    /// Leaves not yet claimed by any `except*` clause.
    pub remaining: Vec<Value>,
    /// The originally raised exception, for context chaining on reraise.
    pub original: Value,
}

/// One activation record.
pub struct Frame {
    pub code: Rc<CodeObject>,
    /// Byte offset of the next instruction.
    pub ip: usize,
    /// Operand stack, private to this frame.
    pub stack: Vec<Value>,
    /// Fast local slots, `None` when unbound.
    pub locals: Vec<Option<Value>>,
    /// Closure cells: the code's `cell_vars` first, then `free_vars`.
    pub cells: Vec<CellRef>,
    pub globals: DictRef,
    /// Name-based locals for module and class bodies (code without the
    /// `OPTIMIZED` flag). For module bodies this aliases `globals`.
    pub names: Option<DictRef>,
    pub blocks: Vec<Block>,
    /// Exceptions being handled by active `except` blocks in this frame,
    /// innermost last. Feeds bare `raise` and implicit context chaining.
    pub handling: Vec<Value>,
    /// `except*` split state, innermost last.
    pub eg_states: Vec<EgState>,
}

impl Frame {
    pub fn new(code: Rc<CodeObject>, globals: DictRef, names: Option<DictRef>) -> Self {
        let n_locals = code.var_names.len();
        let n_cells = code.cell_vars.len() + code.free_vars.len();
        let mut cells = Vec::with_capacity(n_cells);
        for _ in 0..n_cells {
            cells.push(Rc::new(RefCell::new(None)));
        }
        Self {
            stack: Vec::with_capacity(code.stack_size),
            locals: vec![None; n_locals],
            cells,
            globals,
            names,
            ip: 0,
            blocks: Vec::new(),
            handling: Vec::new(),
            eg_states: Vec::new(),
            code,
        }
    }

    /// The name used in traceback lines. The compiler names module bodies
    /// `<module>`, so the code name is already the right thing.
    pub fn trace_name(&self) -> crate::intern::PyStr {
        self.code.name.clone()
    }

    pub fn current_line(&self) -> u32 {
        // `ip` has usually advanced past the faulting instruction; back up to
        // the instruction start when possible.
        self.code.line_for_offset(self.ip.saturating_sub(1))
    }

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::None)
    }

    pub fn peek(&self) -> &Value {
        self.stack.last().expect("operand stack underflow")
    }

    /// Pop `n` values preserving push order.
    pub fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let start = self.stack.len().saturating_sub(n);
        self.stack.split_off(start)
    }
}
