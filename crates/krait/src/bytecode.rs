//! The bytecode format: opcodes, code objects, and the emitting builder.
//!
//! Instructions are a flat byte stream. Every instruction is a one-byte
//! opcode, followed by a little-endian 16-bit argument when the opcode takes
//! one; a 256-entry table ([`has_arg`]) decides which. Jump targets are
//! absolute byte offsets.
//!
//! The base instruction set carries all semantics. The specialized opcodes
//! (`LoadFast0`, `BinaryAddInt`, the fused compare-and-jump family, and the
//! two-register superinstructions with packed 8-bit operands) are rewrites a
//! peephole pass applies for speed; they are observably identical to the
//! sequences they replace.

use std::fmt::Write as _;

use crate::intern::PyStr;
use crate::value::Value;

macro_rules! opcodes {
    ($( $(#[$attr:meta])* $name:ident = $byte:expr, $has_arg:expr; )*) => {
        /// One opcode of the instruction set.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {
            $( $(#[$attr])* $name = $byte, )*
        }

        impl Opcode {
            /// Decode a byte, `None` for gaps in the numbering.
            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $( $byte => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// Whether this opcode is followed by a 16-bit argument.
            pub fn has_arg(self) -> bool {
                match self {
                    $( Opcode::$name => $has_arg, )*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$name => stringify!($name), )*
                }
            }
        }

        /// The 256-entry argument table: `HAS_ARG[b]` tells whether the
        /// opcode at byte value `b` carries an argument.
        pub const HAS_ARG: [bool; 256] = {
            let mut table = [false; 256];
            $( table[$byte] = $has_arg; )*
            table
        };
    };
}

opcodes! {
    // -- Stack manipulation --
    Nop = 0, false;
    PopTop = 1, false;
    DupTop = 2, false;
    RotTwo = 3, false;
    RotThree = 4, false;

    // -- Constants and names --
    LoadConst = 10, true;
    LoadName = 11, true;
    StoreName = 12, true;
    DeleteName = 13, true;
    LoadFast = 14, true;
    StoreFast = 15, true;
    DeleteFast = 16, true;
    LoadGlobal = 17, true;
    StoreGlobal = 18, true;
    DeleteGlobal = 19, true;
    LoadDeref = 20, true;
    StoreDeref = 21, true;
    LoadClosure = 22, true;
    MakeCell = 23, true;
    LoadAttr = 24, true;
    StoreAttr = 25, true;
    DeleteAttr = 26, true;
    BinarySubscr = 27, false;
    StoreSubscr = 28, false;
    DeleteSubscr = 29, false;
    LoadLocals = 30, false;

    // -- Operators (argument selects the operator) --
    BinaryOp = 32, true;
    InplaceOp = 33, true;
    UnaryOp = 34, true;
    CompareOp = 35, true;

    // -- Control flow (argument is an absolute byte offset) --
    Jump = 40, true;
    PopJumpIfTrue = 41, true;
    PopJumpIfFalse = 42, true;
    JumpIfTrueOrPop = 43, true;
    JumpIfFalseOrPop = 44, true;

    // -- Iteration --
    GetIter = 48, false;
    ForIter = 49, true;

    // -- Calls and functions --
    Call = 52, true;
    CallKw = 53, true;
    LoadMethod = 54, true;
    CallMethod = 55, true;
    ReturnValue = 56, false;
    YieldValue = 57, false;
    GetAwaitable = 58, false;
    MakeFunction = 59, true;
    BuildClass = 60, false;
    /// Call with spread arguments: `[callable, args_list, kwargs_dict?]`;
    /// the argument is 1 when a kwargs dict is present.
    CallEx = 61, true;

    // -- Construction --
    BuildTuple = 64, true;
    BuildList = 65, true;
    BuildSet = 66, true;
    BuildMap = 67, true;
    BuildString = 68, true;
    FormatValue = 69, true;
    BuildSlice = 70, true;

    // -- Unpacking --
    UnpackSequence = 72, true;
    UnpackEx = 73, true;

    // -- Comprehensions (argument is the collection's stack depth) --
    ListAppend = 76, true;
    SetAdd = 77, true;
    MapAdd = 78, true;

    // -- Imports --
    ImportName = 80, true;
    ImportFrom = 81, true;
    ImportStar = 82, false;

    // -- Blocks and exceptions --
    SetupLoop = 88, true;
    SetupExcept = 89, true;
    SetupFinally = 90, true;
    SetupWith = 91, true;
    SetupExceptStar = 92, true;
    PopBlock = 93, false;
    PopExcept = 94, false;
    BeginFinally = 95, false;
    EndFinally = 96, false;
    ExitWith = 97, false;
    RaiseVarargs = 98, true;
    JumpIfNotExcMatch = 99, true;
    CheckEgMatch = 100, false;
    ReraiseStar = 101, false;
    BreakLoop = 102, false;
    ContinueLoop = 103, true;

    // -- Specializations: identical semantics, fewer decodes --
    LoadFast0 = 112, false;
    LoadFast1 = 113, false;
    LoadFast2 = 114, false;
    LoadFast3 = 115, false;
    StoreFast0 = 116, false;
    StoreFast1 = 117, false;
    StoreFast2 = 118, false;
    StoreFast3 = 119, false;
    LoadNone = 120, false;
    LoadTrue = 121, false;
    LoadFalse = 122, false;
    LoadZero = 123, false;
    LoadOne = 124, false;
    LoadEmptyList = 125, false;
    LoadEmptyTuple = 126, false;
    LoadEmptyDict = 127, false;
    IncrementFast = 128, true;
    DecrementFast = 129, true;
    BinaryAddInt = 130, false;
    BinarySubInt = 131, false;
    BinaryMulInt = 132, false;
    CompareLtInt = 133, false;
    CompareLeInt = 134, false;
    CompareGtInt = 135, false;
    CompareGeInt = 136, false;
    CompareEqInt = 137, false;
    CompareNeInt = 138, false;
    CompareLtJump = 140, true;
    CompareLeJump = 141, true;
    CompareGtJump = 142, true;
    CompareGeJump = 143, true;
    CompareEqJump = 144, true;
    CompareNeJump = 145, true;
    LenList = 148, false;
    LenString = 149, false;
    LenTuple = 150, false;
    LenDict = 151, false;
    LenGeneric = 152, false;

    // -- Superinstructions: two packed 8-bit operands --
    LoadFastLoadFast = 154, true;
    LoadFastLoadConst = 155, true;
    StoreFastLoadFast = 156, true;
    LoadConstLoadFast = 157, true;
    LoadGlobalLoadFast = 158, true;
}

/// Binary operator selector for `BinaryOp`/`InplaceOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    TrueDiv = 3,
    FloorDiv = 4,
    Mod = 5,
    Pow = 6,
    MatMul = 7,
    LShift = 8,
    RShift = 9,
    BitAnd = 10,
    BitOr = 11,
    BitXor = 12,
}

impl BinOp {
    pub fn from_arg(arg: u16) -> Option<Self> {
        use BinOp::*;
        Some(match arg {
            0 => Add,
            1 => Sub,
            2 => Mul,
            3 => TrueDiv,
            4 => FloorDiv,
            5 => Mod,
            6 => Pow,
            7 => MatMul,
            8 => LShift,
            9 => RShift,
            10 => BitAnd,
            11 => BitOr,
            12 => BitXor,
            _ => return None,
        })
    }

    /// The operator as it appears in error messages.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::TrueDiv => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "** or pow()",
            Self::MatMul => "@",
            Self::LShift => "<<",
            Self::RShift => ">>",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
        }
    }

    /// The forward dunder consulted on the left operand.
    pub fn dunder(self) -> &'static str {
        match self {
            Self::Add => "__add__",
            Self::Sub => "__sub__",
            Self::Mul => "__mul__",
            Self::TrueDiv => "__truediv__",
            Self::FloorDiv => "__floordiv__",
            Self::Mod => "__mod__",
            Self::Pow => "__pow__",
            Self::MatMul => "__matmul__",
            Self::LShift => "__lshift__",
            Self::RShift => "__rshift__",
            Self::BitAnd => "__and__",
            Self::BitOr => "__or__",
            Self::BitXor => "__xor__",
        }
    }

    /// The reflected dunder consulted on the right operand.
    pub fn rdunder(self) -> &'static str {
        match self {
            Self::Add => "__radd__",
            Self::Sub => "__rsub__",
            Self::Mul => "__rmul__",
            Self::TrueDiv => "__rtruediv__",
            Self::FloorDiv => "__rfloordiv__",
            Self::Mod => "__rmod__",
            Self::Pow => "__rpow__",
            Self::MatMul => "__rmatmul__",
            Self::LShift => "__rlshift__",
            Self::RShift => "__rrshift__",
            Self::BitAnd => "__rand__",
            Self::BitOr => "__ror__",
            Self::BitXor => "__rxor__",
        }
    }

    /// The in-place dunder tried first by `InplaceOp`.
    pub fn idunder(self) -> &'static str {
        match self {
            Self::Add => "__iadd__",
            Self::Sub => "__isub__",
            Self::Mul => "__imul__",
            Self::TrueDiv => "__itruediv__",
            Self::FloorDiv => "__ifloordiv__",
            Self::Mod => "__imod__",
            Self::Pow => "__ipow__",
            Self::MatMul => "__imatmul__",
            Self::LShift => "__ilshift__",
            Self::RShift => "__irshift__",
            Self::BitAnd => "__iand__",
            Self::BitOr => "__ior__",
            Self::BitXor => "__ixor__",
        }
    }
}

/// Comparison selector for `CompareOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmpOp {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
    Is = 6,
    IsNot = 7,
    In = 8,
    NotIn = 9,
}

impl CmpOp {
    pub fn from_arg(arg: u16) -> Option<Self> {
        use CmpOp::*;
        Some(match arg {
            0 => Eq,
            1 => Ne,
            2 => Lt,
            3 => Le,
            4 => Gt,
            5 => Ge,
            6 => Is,
            7 => IsNot,
            8 => In,
            9 => NotIn,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}

/// Unary selector for `UnaryOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnOp {
    Neg = 0,
    Pos = 1,
    Invert = 2,
    Not = 3,
}

impl UnOp {
    pub fn from_arg(arg: u16) -> Option<Self> {
        Some(match arg {
            0 => Self::Neg,
            1 => Self::Pos,
            2 => Self::Invert,
            3 => Self::Not,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Code objects
// ---------------------------------------------------------------------------

/// Code object flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CodeFlags(pub u32);

impl CodeFlags {
    /// Locals live in the fast slot array, not a namespace dict.
    pub const OPTIMIZED: u32 = 1 << 0;
    /// A call creates a fresh local namespace.
    pub const NEW_LOCALS: u32 = 1 << 1;
    pub const VAR_ARGS: u32 = 1 << 2;
    pub const VAR_KEYWORDS: u32 = 1 << 3;
    pub const NESTED: u32 = 1 << 4;
    pub const GENERATOR: u32 = 1 << 5;
    pub const NO_FREE: u32 = 1 << 6;
    pub const COROUTINE: u32 = 1 << 7;
    pub const ITER_COROUTINE: u32 = 1 << 8;
    pub const ASYNC_GENERATOR: u32 = 1 << 9;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }
}

/// A compiled unit: the module body, a function body, a class body, or a
/// comprehension, as emitted by the compiler and consumed by the VM.
pub struct CodeObject {
    pub name: PyStr,
    pub filename: PyStr,
    pub first_line: u32,
    /// Flat instruction stream; see the module docs for the encoding.
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    /// Symbol table for the name-indexed opcodes.
    pub names: Vec<PyStr>,
    /// Local variable names; parameters come first.
    pub var_names: Vec<PyStr>,
    /// Variables captured from an enclosing scope.
    pub free_vars: Vec<PyStr>,
    /// Local variables captured by nested functions.
    pub cell_vars: Vec<PyStr>,
    pub arg_count: usize,
    pub kw_only_arg_count: usize,
    pub flags: CodeFlags,
    /// Maximum operand stack depth a frame needs.
    pub stack_size: usize,
    /// `(start_offset, end_offset, line)` entries for tracebacks.
    pub line_no_tab: Vec<(u32, u32, u32)>,
}

impl CodeObject {
    /// Source line for a byte offset, used when building tracebacks.
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let offset = offset as u32;
        for &(start, end, line) in &self.line_no_tab {
            if offset >= start && offset < end {
                return line;
            }
        }
        self.first_line
    }

    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    pub fn is_coroutine(&self) -> bool {
        self.flags.contains(CodeFlags::COROUTINE)
    }

    /// Render a `dis`-style listing, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut ip = 0;
        while ip < self.code.len() {
            let byte = self.code[ip];
            let Some(op) = Opcode::from_byte(byte) else {
                let _ = writeln!(out, "{ip:6}  <invalid {byte:#04x}>");
                ip += 1;
                continue;
            };
            if op.has_arg() {
                let arg = u16::from_le_bytes([self.code[ip + 1], self.code[ip + 2]]);
                let detail = self.arg_detail(op, arg);
                let _ = writeln!(out, "{ip:6}  {:<22}{arg:6}{detail}", op.name());
                ip += 3;
            } else {
                let _ = writeln!(out, "{ip:6}  {}", op.name());
                ip += 1;
            }
        }
        out
    }

    fn arg_detail(&self, op: Opcode, arg: u16) -> String {
        let i = arg as usize;
        match op {
            Opcode::LoadConst => self
                .constants
                .get(i)
                .map(|c| format!("  ({})", crate::format::plain_repr(c)))
                .unwrap_or_default(),
            Opcode::LoadName
            | Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::DeleteGlobal
            | Opcode::LoadAttr
            | Opcode::StoreAttr
            | Opcode::DeleteAttr
            | Opcode::LoadMethod
            | Opcode::ImportName
            | Opcode::ImportFrom => self
                .names
                .get(i)
                .map(|n| format!("  ({n})"))
                .unwrap_or_default(),
            Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => self
                .var_names
                .get(i)
                .map(|n| format!("  ({n})"))
                .unwrap_or_default(),
            Opcode::BinaryOp | Opcode::InplaceOp => BinOp::from_arg(arg)
                .map(|b| format!("  ({})", b.symbol()))
                .unwrap_or_default(),
            Opcode::CompareOp => CmpOp::from_arg(arg)
                .map(|c| format!("  ({})", c.symbol()))
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Incrementally emits a [`CodeObject`]. The compiler drives this; tests and
/// embedders can also assemble code objects by hand.
pub struct CodeBuilder {
    pub name: PyStr,
    pub filename: PyStr,
    pub first_line: u32,
    code: Vec<u8>,
    constants: Vec<Value>,
    names: Vec<PyStr>,
    pub var_names: Vec<PyStr>,
    pub free_vars: Vec<PyStr>,
    pub cell_vars: Vec<PyStr>,
    pub arg_count: usize,
    pub kw_only_arg_count: usize,
    pub flags: CodeFlags,
    line_starts: Vec<(u32, u32)>,
    current_line: u32,
}

impl CodeBuilder {
    pub fn new(name: &str, filename: &str, first_line: u32) -> Self {
        Self {
            name: PyStr::new(name),
            filename: PyStr::new(filename),
            first_line,
            code: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            var_names: Vec::new(),
            free_vars: Vec::new(),
            cell_vars: Vec::new(),
            arg_count: 0,
            kw_only_arg_count: 0,
            flags: CodeFlags::default(),
            line_starts: Vec::new(),
            current_line: first_line,
        }
    }

    /// Current emit position (the next instruction's offset).
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Record that subsequent instructions come from `line`.
    pub fn set_line(&mut self, line: u32) {
        if line != self.current_line || self.line_starts.is_empty() {
            self.current_line = line;
            self.line_starts.push((self.code.len() as u32, line));
        }
    }

    pub fn emit(&mut self, op: Opcode) {
        debug_assert!(!op.has_arg(), "{} requires an argument", op.name());
        self.code.push(op as u8);
    }

    pub fn emit_arg(&mut self, op: Opcode, arg: u16) {
        debug_assert!(op.has_arg(), "{} takes no argument", op.name());
        self.code.push(op as u8);
        self.code.extend_from_slice(&arg.to_le_bytes());
    }

    /// Emit a jump-family instruction with a placeholder target; returns the
    /// patch site for [`Self::patch_jump`].
    pub fn emit_jump(&mut self, op: Opcode) -> usize {
        let site = self.code.len();
        self.emit_arg(op, 0xffff);
        site
    }

    /// Point a previously emitted jump at the current offset.
    pub fn patch_jump(&mut self, site: usize) {
        self.patch_jump_to(site, self.code.len());
    }

    pub fn patch_jump_to(&mut self, site: usize, target: usize) {
        let bytes = (target as u16).to_le_bytes();
        self.code[site + 1] = bytes[0];
        self.code[site + 2] = bytes[1];
    }

    /// Intern a constant; identical constants share a pool slot.
    pub fn add_const(&mut self, value: Value) -> u16 {
        for (i, existing) in self.constants.iter().enumerate() {
            if existing.is_identical(&value) {
                return i as u16;
            }
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u16
    }

    pub fn add_name(&mut self, name: &str) -> u16 {
        if let Some(i) = self.names.iter().position(|n| n.as_str() == name) {
            return i as u16;
        }
        self.names.push(PyStr::new(name));
        (self.names.len() - 1) as u16
    }

    pub fn add_var_name(&mut self, name: &str) -> u16 {
        if let Some(i) = self.var_names.iter().position(|n| n.as_str() == name) {
            return i as u16;
        }
        self.var_names.push(PyStr::new(name));
        (self.var_names.len() - 1) as u16
    }

    pub fn var_index(&self, name: &str) -> Option<u16> {
        self.var_names
            .iter()
            .position(|n| n.as_str() == name)
            .map(|i| i as u16)
    }

    /// Finish, computing the stack-depth bound.
    pub fn finish(mut self) -> CodeObject {
        let stack_size = max_stack_depth(&self.code);
        // Close the line table into (start, end, line) ranges.
        let mut line_no_tab = Vec::with_capacity(self.line_starts.len());
        for (i, &(start, line)) in self.line_starts.iter().enumerate() {
            let end = self
                .line_starts
                .get(i + 1)
                .map_or(self.code.len() as u32, |&(next, _)| next);
            line_no_tab.push((start, end, line));
        }
        CodeObject {
            name: self.name,
            filename: self.filename,
            first_line: self.first_line,
            code: std::mem::take(&mut self.code),
            constants: std::mem::take(&mut self.constants),
            names: std::mem::take(&mut self.names),
            var_names: std::mem::take(&mut self.var_names),
            free_vars: std::mem::take(&mut self.free_vars),
            cell_vars: std::mem::take(&mut self.cell_vars),
            arg_count: self.arg_count,
            kw_only_arg_count: self.kw_only_arg_count,
            flags: self.flags,
            stack_size,
            line_no_tab,
        }
    }
}

/// Conservative worst-case operand stack bound for a code stream.
///
/// A simple abstract walk: track the running depth, take the max, and reset
/// optimistically at unconditional jumps. Overestimating is fine; frames use
/// this only to reserve capacity.
pub(crate) fn max_stack_depth(code: &[u8]) -> usize {
    let mut depth: i32 = 0;
    let mut max: i32 = 0;
    let mut ip = 0;
    while ip < code.len() {
        let Some(op) = Opcode::from_byte(code[ip]) else {
            ip += 1;
            continue;
        };
        let arg = if op.has_arg() {
            let a = u16::from_le_bytes([code[ip + 1], code[ip + 2]]);
            ip += 3;
            a as i32
        } else {
            ip += 1;
            0
        };
        depth += stack_effect(op, arg);
        if depth > max {
            max = depth;
        }
        if depth < 0 {
            depth = 0;
        }
    }
    // Headroom for handler entries pushing the live exception.
    (max + 2).max(4) as usize
}

fn stack_effect(op: Opcode, arg: i32) -> i32 {
    use Opcode::*;
    match op {
        Nop | Jump | PopBlock | PopExcept | ImportStar | BreakLoop | ContinueLoop
        | SetupLoop | SetupExcept | SetupFinally | SetupExceptStar | EndFinally
        | ReraiseStar => 0,
        PopTop | PopJumpIfTrue | PopJumpIfFalse | StoreGlobal | StoreName | StoreFast
        | StoreDeref | ReturnValue | ListAppend | SetAdd | ExitWith => -1,
        DupTop => 1,
        RotTwo | RotThree => 0,
        LoadConst | LoadName | LoadFast | LoadGlobal | LoadDeref | LoadClosure
        | LoadLocals | LoadNone | LoadTrue | LoadFalse | LoadZero | LoadOne
        | LoadEmptyList | LoadEmptyTuple | LoadEmptyDict | LoadFast0 | LoadFast1
        | LoadFast2 | LoadFast3 => 1,
        DeleteName | DeleteFast | DeleteGlobal | DeleteAttr | MakeCell | IncrementFast
        | DecrementFast => 0,
        LoadAttr | UnaryOp | GetIter | GetAwaitable | FormatValue | LenList | LenString
        | LenTuple | LenDict | LenGeneric | YieldValue | CheckEgMatch => 0,
        StoreAttr => -2,
        BinarySubscr | BinaryOp | InplaceOp | CompareOp | BinaryAddInt | BinarySubInt
        | BinaryMulInt | CompareLtInt | CompareLeInt | CompareGtInt | CompareGeInt
        | CompareEqInt | CompareNeInt | MapAdd | JumpIfNotExcMatch => -1,
        StoreSubscr => -3,
        DeleteSubscr => -2,
        JumpIfTrueOrPop | JumpIfFalseOrPop => 0,
        ForIter => 1,
        Call => -(arg),
        CallKw => -(arg) - 1,
        CallEx => -(arg) - 1,
        LoadMethod => 1,
        CallMethod => -(arg) - 1,
        MakeFunction => {
            let mut effect = 0;
            if arg & 0x01 != 0 {
                effect -= 1;
            }
            if arg & 0x02 != 0 {
                effect -= 1;
            }
            if arg & 0x08 != 0 {
                effect -= 1;
            }
            effect
        }
        BuildClass => -3,
        BuildTuple | BuildList | BuildSet | BuildString => -(arg) + 1,
        BuildMap => -(arg * 2) + 1,
        BuildSlice => -(arg) + 1,
        UnpackSequence => arg - 1,
        UnpackEx => (arg & 0xff) + (arg >> 8),
        ImportName => -1,
        ImportFrom => 1,
        SetupWith => 1,
        BeginFinally => 1,
        RaiseVarargs => -(arg),
        StoreFast0 | StoreFast1 | StoreFast2 | StoreFast3 => -1,
        CompareLtJump | CompareLeJump | CompareGtJump | CompareGeJump | CompareEqJump
        | CompareNeJump => -2,
        LoadFastLoadFast | LoadFastLoadConst | LoadConstLoadFast | LoadGlobalLoadFast => 2,
        StoreFastLoadFast => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_arg_table_matches_enum() {
        for byte in 0..=255u8 {
            match Opcode::from_byte(byte) {
                Some(op) => assert_eq!(op.has_arg(), HAS_ARG[byte as usize]),
                None => assert!(!HAS_ARG[byte as usize]),
            }
        }
    }

    #[test]
    fn builder_roundtrip() {
        let mut b = CodeBuilder::new("<test>", "<test>", 1);
        b.set_line(1);
        let k = b.add_const(Value::Int(42));
        b.emit_arg(Opcode::LoadConst, k);
        b.emit(Opcode::ReturnValue);
        let code = b.finish();
        assert_eq!(
            code.code,
            vec![Opcode::LoadConst as u8, 0, 0, Opcode::ReturnValue as u8]
        );
        assert_eq!(code.constants[0], Value::Int(42));
        assert!(code.stack_size >= 1);
    }

    #[test]
    fn jump_patching() {
        let mut b = CodeBuilder::new("<test>", "<test>", 1);
        let site = b.emit_jump(Opcode::Jump);
        b.emit(Opcode::Nop);
        b.patch_jump(site);
        let code = b.finish();
        assert_eq!(code.code[0], Opcode::Jump as u8);
        assert_eq!(u16::from_le_bytes([code.code[1], code.code[2]]), 4);
    }

    #[test]
    fn constants_are_deduplicated() {
        let mut b = CodeBuilder::new("<t>", "<t>", 1);
        let a = b.add_const(Value::Int(1));
        let c = b.add_const(Value::Int(1));
        assert_eq!(a, c);
        let d = b.add_const(Value::Int(2));
        assert_ne!(a, d);
    }

    #[test]
    fn line_table_covers_ranges() {
        let mut b = CodeBuilder::new("<t>", "<t>", 1);
        b.set_line(1);
        b.emit(Opcode::Nop);
        b.set_line(2);
        b.emit(Opcode::Nop);
        b.emit(Opcode::ReturnValue);
        let code = b.finish();
        assert_eq!(code.line_for_offset(0), 1);
        assert_eq!(code.line_for_offset(1), 2);
        assert_eq!(code.line_for_offset(2), 2);
    }
}
