//! Exception values and the builtin exception class hierarchy.
//!
//! Python-level errors travel as typed [`PyExc`] values inside `Err`; host
//! panics never cross the VM boundary. Builtin exception classes are the
//! [`ExcType`] enum with a static parent table; user-defined exception
//! classes are ordinary classes whose MRO bottoms out in an `ExcType`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::intern::PyStr;
use crate::object::{class_name_of, mro_of, same_class};
use crate::value::{ExcRef, InstanceRef, Value};

/// The builtin exception classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcType {
    BaseException,
    Exception,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    FloatingPointError,
    LookupError,
    KeyError,
    IndexError,
    TypeError,
    ValueError,
    AttributeError,
    NameError,
    UnboundLocalError,
    ImportError,
    ModuleNotFoundError,
    OsError,
    FileNotFoundError,
    FileExistsError,
    PermissionError,
    RuntimeError,
    RecursionError,
    NotImplementedError,
    AssertionError,
    MemoryError,
    StopIteration,
    GeneratorExit,
    SyntaxError,
    BaseExceptionGroup,
    ExceptionGroup,
}

impl ExcType {
    pub fn name(self) -> &'static str {
        match self {
            Self::BaseException => "BaseException",
            Self::Exception => "Exception",
            Self::ArithmeticError => "ArithmeticError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::OverflowError => "OverflowError",
            Self::FloatingPointError => "FloatingPointError",
            Self::LookupError => "LookupError",
            Self::KeyError => "KeyError",
            Self::IndexError => "IndexError",
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
            Self::AttributeError => "AttributeError",
            Self::NameError => "NameError",
            Self::UnboundLocalError => "UnboundLocalError",
            Self::ImportError => "ImportError",
            Self::ModuleNotFoundError => "ModuleNotFoundError",
            Self::OsError => "OSError",
            Self::FileNotFoundError => "FileNotFoundError",
            Self::FileExistsError => "FileExistsError",
            Self::PermissionError => "PermissionError",
            Self::RuntimeError => "RuntimeError",
            Self::RecursionError => "RecursionError",
            Self::NotImplementedError => "NotImplementedError",
            Self::AssertionError => "AssertionError",
            Self::MemoryError => "MemoryError",
            Self::StopIteration => "StopIteration",
            Self::GeneratorExit => "GeneratorExit",
            Self::SyntaxError => "SyntaxError",
            Self::BaseExceptionGroup => "BaseExceptionGroup",
            Self::ExceptionGroup => "ExceptionGroup",
        }
    }

    /// The direct base class. `BaseException` has none.
    pub fn parent(self) -> Option<ExcType> {
        use ExcType::*;
        Some(match self {
            BaseException => return None,
            Exception | GeneratorExit | BaseExceptionGroup => BaseException,
            ArithmeticError | LookupError | TypeError | ValueError | AttributeError
            | NameError | ImportError | OsError | RuntimeError | AssertionError
            | MemoryError | StopIteration | SyntaxError => Exception,
            ZeroDivisionError | OverflowError | FloatingPointError => ArithmeticError,
            KeyError | IndexError => LookupError,
            UnboundLocalError => NameError,
            ModuleNotFoundError => ImportError,
            FileNotFoundError | FileExistsError | PermissionError => OsError,
            RecursionError | NotImplementedError => RuntimeError,
            // ExceptionGroup multiply inherits; mro() special-cases it.
            ExceptionGroup => BaseExceptionGroup,
        })
    }

    /// The class's linearization, self first, `BaseException` last.
    pub fn mro(self) -> Vec<ExcType> {
        if self == Self::ExceptionGroup {
            // class ExceptionGroup(BaseExceptionGroup, Exception)
            return vec![
                Self::ExceptionGroup,
                Self::BaseExceptionGroup,
                Self::Exception,
                Self::BaseException,
            ];
        }
        let mut out = vec![self];
        let mut cur = self;
        while let Some(p) = cur.parent() {
            out.push(p);
            cur = p;
        }
        out
    }

    pub fn is_subtype_of(self, other: ExcType) -> bool {
        self.mro().contains(&other)
    }

    /// Resolve a class by name, used when translating untyped host error
    /// strings and when Python code looks up exception builtins.
    pub fn from_name(name: &str) -> Option<ExcType> {
        use ExcType::*;
        Some(match name {
            "BaseException" => BaseException,
            "Exception" => Exception,
            "ArithmeticError" => ArithmeticError,
            "ZeroDivisionError" => ZeroDivisionError,
            "OverflowError" => OverflowError,
            "FloatingPointError" => FloatingPointError,
            "LookupError" => LookupError,
            "KeyError" => KeyError,
            "IndexError" => IndexError,
            "TypeError" => TypeError,
            "ValueError" => ValueError,
            "AttributeError" => AttributeError,
            "NameError" => NameError,
            "UnboundLocalError" => UnboundLocalError,
            "ImportError" => ImportError,
            "ModuleNotFoundError" => ModuleNotFoundError,
            // IOError has been an alias of OSError since Python 3.3.
            "OSError" | "IOError" => OsError,
            "FileNotFoundError" => FileNotFoundError,
            "FileExistsError" => FileExistsError,
            "PermissionError" => PermissionError,
            "RuntimeError" => RuntimeError,
            "RecursionError" => RecursionError,
            "NotImplementedError" => NotImplementedError,
            "AssertionError" => AssertionError,
            "MemoryError" => MemoryError,
            "StopIteration" => StopIteration,
            "GeneratorExit" => GeneratorExit,
            "SyntaxError" => SyntaxError,
            "BaseExceptionGroup" => BaseExceptionGroup,
            "ExceptionGroup" => ExceptionGroup,
            _ => return None,
        })
    }
}

/// One traceback line: where a frame was executing when the exception passed
/// through it. Collected oldest-first.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub filename: PyStr,
    pub line: u32,
    pub function: PyStr,
}

/// A live exception object.
#[derive(Clone)]
pub struct PyExc {
    /// `ExcClass(..)` for builtin classes, `Class(..)` for user classes.
    pub class: Value,
    pub args: Vec<Value>,
    /// `raise X from Y` target; assigning it also suppresses the context.
    pub cause: Option<Value>,
    /// The exception that was being handled when this one was raised.
    pub context: Option<Value>,
    pub suppress_context: bool,
    pub notes: Vec<PyStr>,
    /// Leaves of a `BaseExceptionGroup`, in order.
    pub group: Option<Vec<Value>>,
    /// The backing instance when the exception was raised from a user class
    /// with instance state.
    pub instance: Option<InstanceRef>,
    pub traceback: Vec<TraceEntry>,
}

impl PyExc {
    pub fn new(ty: ExcType, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let args = if msg.is_empty() {
            Vec::new()
        } else {
            vec![Value::str(&msg)]
        };
        Self {
            class: Value::ExcClass(ty),
            args,
            cause: None,
            context: None,
            suppress_context: false,
            notes: Vec::new(),
            group: None,
            instance: None,
            traceback: Vec::new(),
        }
    }

    pub fn with_args(class: Value, args: Vec<Value>) -> Self {
        Self {
            class,
            args,
            cause: None,
            context: None,
            suppress_context: false,
            notes: Vec::new(),
            group: None,
            instance: None,
            traceback: Vec::new(),
        }
    }

    /// Build an exception group from leaves.
    pub fn group(msg: impl Into<String>, leaves: Vec<Value>) -> Self {
        // ExceptionGroup when every leaf derives from Exception, otherwise
        // BaseExceptionGroup.
        let all_exception = leaves.iter().all(|leaf| match leaf {
            Value::Exception(e) => match_class(&e.borrow().class, &Value::ExcClass(ExcType::Exception)),
            _ => false,
        });
        let ty = if all_exception {
            ExcType::ExceptionGroup
        } else {
            ExcType::BaseExceptionGroup
        };
        let msg = msg.into();
        let mut exc = Self::new(ty, msg);
        exc.args.push(Value::tuple(leaves.clone()));
        exc.group = Some(leaves);
        exc
    }

    // -- Typed constructors for the common kinds ----------------------------

    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::new(ExcType::TypeError, msg)
    }

    pub fn value_error(msg: impl Into<String>) -> Self {
        Self::new(ExcType::ValueError, msg)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new(ExcType::NameError, format!("name '{name}' is not defined"))
    }

    pub fn attribute_error(type_name: &str, attr: &str) -> Self {
        Self::new(
            ExcType::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
    }

    pub fn index_error(msg: impl Into<String>) -> Self {
        Self::new(ExcType::IndexError, msg)
    }

    pub fn key_error(key_repr: impl Into<String>) -> Self {
        Self::new(ExcType::KeyError, key_repr)
    }

    pub fn zero_division(msg: impl Into<String>) -> Self {
        Self::new(ExcType::ZeroDivisionError, msg)
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        Self::new(ExcType::OverflowError, msg)
    }

    pub fn memory_error(msg: impl Into<String>) -> Self {
        Self::new(ExcType::MemoryError, msg)
    }

    pub fn runtime_error(msg: impl Into<String>) -> Self {
        Self::new(ExcType::RuntimeError, msg)
    }

    pub fn stop_iteration(value: Option<Value>) -> Self {
        let mut exc = Self::new(ExcType::StopIteration, "");
        if let Some(v) = value {
            exc.args.push(v);
        }
        exc
    }

    /// The return value a generator attached to its terminal `StopIteration`.
    pub fn stop_iteration_value(&self) -> Value {
        self.args.first().cloned().unwrap_or(Value::None)
    }

    pub fn class_name(&self) -> String {
        class_name_of(&self.class)
    }

    /// The message as printed after the class name.
    pub fn message(&self) -> String {
        match self.args.len() {
            0 => String::new(),
            1 => match &self.args[0] {
                Value::Str(s) => s.to_string(),
                other => crate::format::plain_repr(other),
            },
            _ => crate::format::plain_repr(&Value::tuple(self.args.clone())),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Exception(Rc::new(RefCell::new(self)))
    }

    /// Record a traceback frame; oldest entries stay first.
    pub fn push_trace(&mut self, filename: PyStr, line: u32, function: PyStr) {
        self.traceback.insert(0, TraceEntry { filename, line, function });
    }
}

impl std::fmt::Debug for PyExc {
    /// `Value` does not implement `Debug`, so this reports the class and
    /// message rather than deriving through every field.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyExc")
            .field("class", &self.class_name())
            .field("message", &self.message())
            .finish()
    }
}

/// Whether an exception whose class is `class` is caught by `matcher`.
///
/// `matcher` may be a builtin exception class, a user class, or a tuple of
/// matchers (checked recursively). User classes match through their MRO;
/// classes registered as virtual subclasses of the matcher match as well.
pub fn match_class(class: &Value, matcher: &Value) -> bool {
    match matcher {
        Value::Tuple(items) => items.iter().any(|m| match_class(class, m)),
        Value::ExcClass(_) | Value::Class(_) => {
            if mro_of(class).iter().any(|c| same_class(c, matcher)) {
                return true;
            }
            // Virtual subclass registration on a user matcher class.
            if let Value::Class(m) = matcher {
                return m
                    .virtual_subclasses
                    .borrow()
                    .iter()
                    .any(|reg| same_class(reg, class) || mro_of(class).iter().any(|c| same_class(c, reg)));
            }
            false
        }
        _ => false,
    }
}

/// Whether a class-like value names an exception class at all (required for
/// `raise` and `except`).
pub fn is_exception_class(v: &Value) -> bool {
    match v {
        Value::ExcClass(_) => true,
        Value::Class(_) => mro_of(v)
            .iter()
            .any(|c| matches!(c, Value::ExcClass(ExcType::BaseException))),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Internal error channel
// ---------------------------------------------------------------------------

/// Why the dispatch loop stopped without a Python-visible exception. These
/// are not catchable by `except`.
#[derive(Debug, Clone)]
pub(crate) enum Halt {
    Timeout(Duration),
    Cancelled,
    InstructionLimit(u64),
}

/// Internal result channel of every VM operation: a typed Python exception
/// or a hard stop.
pub(crate) enum VmError {
    /// Always a `Value::Exception`.
    Exc(Value),
    Halt(Halt),
}

pub(crate) type VmResult<T> = Result<T, VmError>;

impl From<PyExc> for VmError {
    fn from(exc: PyExc) -> Self {
        Self::Exc(exc.into_value())
    }
}

impl VmError {
    /// The exception value, for code that has already excluded halts.
    pub(crate) fn into_exc_value(self) -> Value {
        match self {
            Self::Exc(v) => v,
            Self::Halt(_) => unreachable!("halt has no exception value"),
        }
    }
}

// ---------------------------------------------------------------------------
// Traceback rendering
// ---------------------------------------------------------------------------

/// Render an uncaught exception the way the REPL prints it: the chained
/// tracebacks oldest cause first, then `Type: message` lines.
pub fn render_traceback(value: &Value) -> String {
    let mut out = String::new();
    render_chain(value, &mut out);
    out
}

fn render_chain(value: &Value, out: &mut String) {
    let Value::Exception(exc) = value else {
        out.push_str(&crate::format::plain_repr(value));
        return;
    };
    let exc = exc.borrow();

    if let Some(cause) = &exc.cause {
        render_chain(cause, out);
        out.push_str(
            "\nThe above exception was the direct cause of the following exception:\n\n",
        );
    } else if let Some(context) = &exc.context {
        if !exc.suppress_context {
            render_chain(context, out);
            out.push_str(
                "\nDuring handling of the above exception, another exception occurred:\n\n",
            );
        }
    }

    if !exc.traceback.is_empty() {
        out.push_str("Traceback (most recent call last):\n");
        for entry in &exc.traceback {
            out.push_str(&format!(
                "  File \"{}\", line {}, in {}\n",
                entry.filename, entry.line, entry.function
            ));
        }
    }
    let msg = exc.message();
    if msg.is_empty() {
        out.push_str(&exc.class_name());
    } else {
        out.push_str(&format!("{}: {}", exc.class_name(), msg));
    }
    for note in &exc.notes {
        out.push('\n');
        out.push_str(note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_is_transitive() {
        assert!(ExcType::ZeroDivisionError.is_subtype_of(ExcType::ArithmeticError));
        assert!(ExcType::ZeroDivisionError.is_subtype_of(ExcType::Exception));
        assert!(!ExcType::ZeroDivisionError.is_subtype_of(ExcType::LookupError));
    }

    #[test]
    fn exception_group_derives_from_both_parents() {
        assert!(ExcType::ExceptionGroup.is_subtype_of(ExcType::BaseExceptionGroup));
        assert!(ExcType::ExceptionGroup.is_subtype_of(ExcType::Exception));
        assert!(!ExcType::BaseExceptionGroup.is_subtype_of(ExcType::Exception));
    }

    #[test]
    fn ioerror_is_an_alias() {
        assert_eq!(ExcType::from_name("IOError"), Some(ExcType::OsError));
    }

    #[test]
    fn tuple_matchers_match_any_element() {
        let exc = PyExc::new(ExcType::KeyError, "k");
        let matcher = Value::tuple(vec![
            Value::ExcClass(ExcType::ValueError),
            Value::ExcClass(ExcType::LookupError),
        ]);
        assert!(match_class(&exc.class, &matcher));
    }
}
