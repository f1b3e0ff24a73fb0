//! Krait - an embeddable Python bytecode interpreter.
//!
//! Krait executes a substantial subset of Python 3 on a stack-based bytecode
//! virtual machine with a rich object model: classes with C3 method
//! resolution, the descriptor protocol, generators as suspended frames,
//! exception chaining with `ExceptionGroup`/`except*`, insertion-ordered
//! dicts, and unbounded integers.
//!
//! # Quick Start
//!
//! ```
//! use krait::{Value, Vm};
//!
//! let mut vm = Vm::new();
//!
//! // Register a native function callable from Python.
//! vm.register("fib", |_vm, args| {
//!     let n = args.check_int(1)?;
//!     let (mut a, mut b) = (0i64, 1i64);
//!     for _ in 0..n {
//!         (a, b) = (b, a + b);
//!     }
//!     Ok(Value::Int(a))
//! });
//!
//! let result = vm.run("[fib(n) for n in range(7)]").unwrap();
//! assert_eq!(
//!     result,
//!     Value::list((0..7).map(|n| Value::Int([0, 1, 1, 2, 3, 5, 8][n])).collect())
//! );
//! ```
//!
//! # Supported Python
//!
//! - Numbers: unbounded `int` (machine-word fast path), `float`, `complex`,
//!   `bool` as an `int` subtype
//! - Containers: `list`, `tuple`, insertion-ordered `dict`, `set`,
//!   `frozenset`, `range`, `bytes`, slices with negative indices
//! - Functions: defaults, keyword-only parameters, `*args`/`**kwargs`,
//!   closures with shared cells, `lambda`, decorators
//! - Classes: multiple inheritance with C3 linearization, `property`,
//!   `classmethod`/`staticmethod`, user descriptors, `__slots__`,
//!   virtual-subclass registration, operator dunders
//! - Control flow: `for`/`while`/`else`, `with`, `try`/`except`/`except*`/
//!   `finally`, `raise ... from ...`, `assert`, comprehensions
//! - Generators (`yield`, `send`/`throw`/`close`) and coroutines driven
//!   cooperatively by `await`
//! - Imports against a registered module table, including relative imports,
//!   plus bundled `math` and `json` modules
//!
//! # Sandboxing
//!
//! A `Vm` has no ambient authority: no filesystem, network, or process
//! access exists unless the host registers a function that provides it.
//! Execution is bounded by [`Limits`] (instructions, recursion, collection
//! sizes, allocations) and can be cancelled cooperatively with a
//! [`CancelToken`] or a deadline; `print` output is captured in a buffer
//! read back with [`Vm::take_output`].

mod attr;
mod builtins;
mod bytecode;
mod compiler;
mod dict;
mod embed;
mod error;
mod exceptions;
mod format;
mod frame;
mod intern;
mod iter;
mod methods;
pub(crate) mod modules;
mod object;
mod operators;
mod py_hash;
mod resource;
mod slice;
mod value;
mod vm;

pub use builtins::Builtin;
pub use bytecode::{BinOp, CmpOp, CodeBuilder, CodeFlags, CodeObject, Opcode, UnOp, HAS_ARG};
pub use embed::{raise_error, Args};
pub use error::{CompileError, Error, Result, UncaughtException};
pub use exceptions::{ExcType, PyExc, TraceEntry};
pub use intern::PyStr;
pub use modules::ModuleBuilder;
pub use resource::{CancelToken, Limits};
pub use value::{Metatable, PyType, Value};
pub use vm::Vm;
