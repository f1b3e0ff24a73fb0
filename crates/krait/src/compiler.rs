//! The source-to-bytecode compiler.
//!
//! Parsing is `rustpython-parser`'s job; this module walks the AST twice.
//! The first pass builds a scope tree (locals, `global`/`nonlocal`
//! declarations, name uses) and resolves every name to local, cell, free, or
//! global, marking cells in enclosing scopes along the way. The second pass
//! emits instructions against symbolic labels, and a peephole pass rewrites
//! common shapes into the specialized opcodes before assembly into the flat
//! byte stream.
//!
//! Only this module depends on the parser crate; the VM sees code objects
//! and nothing else.

use std::collections::HashSet;

use rustpython_parser::ast::{self, Ranged};
use rustpython_parser::text_size::TextRange;
use rustpython_parser::{parse, Mode};

use crate::bytecode::{
    max_stack_depth, BinOp, CmpOp, CodeFlags, CodeObject, Opcode, UnOp,
};
use crate::error::CompileError;
use crate::intern::PyStr;
use crate::value::Value;

/// Compile a module's source to a code object.
pub(crate) fn compile(source: &str, filename: &str) -> Result<CodeObject, CompileError> {
    let lines = LineIndex::new(source);
    let parsed = parse(source, Mode::Module, filename).map_err(|e| CompileError {
        message: e.error.to_string(),
        filename: filename.to_string(),
        line: lines.line_of(u32::from(e.offset)),
    })?;
    let ast::Mod::Module(module) = parsed else {
        return Err(CompileError {
            message: "expected a module".into(),
            filename: filename.to_string(),
            line: 1,
        });
    };

    // Pass 1: scopes and name resolution.
    let mut scopes = Scopes::default();
    let root = scopes.push(ScopeKind::Module, "<module>", None);
    {
        let mut collector = Collector {
            scopes: &mut scopes,
        };
        collector.stmts(root, &module.body);
    }
    resolve_scope(&mut scopes, root, &mut Vec::new()).map_err(|message| CompileError {
        message,
        filename: filename.to_string(),
        line: 1,
    })?;

    // Pass 2: code generation.
    let mut compiler = Compiler {
        scopes,
        lines,
        filename: filename.to_string(),
    };
    compiler.compile_module(root, &module.body)
}

// ---------------------------------------------------------------------------
// Line index
// ---------------------------------------------------------------------------

struct LineIndex {
    starts: Vec<u32>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0u32];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i as u32 + 1);
            }
        }
        Self { starts }
    }

    fn line_of(&self, offset: u32) -> u32 {
        match self.starts.binary_search(&offset) {
            Ok(i) => i as u32 + 1,
            Err(i) => i as u32,
        }
    }
}

// ---------------------------------------------------------------------------
// Scope analysis
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Module,
    Function,
    Class,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NameKind {
    Local,
    Cell,
    Free,
    Global,
    /// Dict-based lookup in module and class bodies.
    Name,
}

struct Scope {
    kind: ScopeKind,
    name: String,
    parent: Option<usize>,
    /// Bound names in binding order; parameters first.
    locals: Vec<String>,
    param_count: usize,
    kwonly_count: usize,
    has_vararg: bool,
    has_kwarg: bool,
    globals_decl: HashSet<String>,
    nonlocals_decl: HashSet<String>,
    used: Vec<String>,
    children: Vec<usize>,
    has_yield: bool,
    is_async: bool,
    /// Locals captured by nested scopes.
    cells: Vec<String>,
    /// Names captured from enclosing scopes (or passed through for deeper
    /// scopes).
    frees: Vec<String>,
    resolution: Vec<(String, NameKind)>,
}

impl Scope {
    fn classify(&self, name: &str) -> Option<NameKind> {
        self.resolution
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, k)| *k)
    }

    fn add_local(&mut self, name: &str) {
        if !self.locals.iter().any(|n| n == name) {
            self.locals.push(name.to_string());
        }
    }

    fn add_use(&mut self, name: &str) {
        if !self.used.iter().any(|n| n == name) {
            self.used.push(name.to_string());
        }
    }
}

#[derive(Default)]
struct Scopes {
    list: Vec<Scope>,
    /// Whether any scope assigns the name `len`; disables the `len()`
    /// specialization for the whole unit.
    len_shadowed: bool,
}

impl Scopes {
    fn push(&mut self, kind: ScopeKind, name: &str, parent: Option<usize>) -> usize {
        let id = self.list.len();
        self.list.push(Scope {
            kind,
            name: name.to_string(),
            parent,
            locals: Vec::new(),
            param_count: 0,
            kwonly_count: 0,
            has_vararg: false,
            has_kwarg: false,
            globals_decl: HashSet::new(),
            nonlocals_decl: HashSet::new(),
            used: Vec::new(),
            children: Vec::new(),
            has_yield: false,
            is_async: false,
            cells: Vec::new(),
            frees: Vec::new(),
            resolution: Vec::new(),
        });
        if let Some(p) = parent {
            self.list[p].children.push(id);
        }
        id
    }
}

struct Collector<'a> {
    scopes: &'a mut Scopes,
}

impl Collector<'_> {
    fn stmts(&mut self, sid: usize, body: &[ast::Stmt]) {
        for stmt in body {
            self.stmt(sid, stmt);
        }
    }

    fn bind(&mut self, sid: usize, name: &str) {
        if name == "len" {
            self.scopes.len_shadowed = true;
        }
        let scope = &mut self.scopes.list[sid];
        if scope.nonlocals_decl.contains(name) || scope.globals_decl.contains(name) {
            return;
        }
        scope.add_local(name);
    }

    fn stmt(&mut self, sid: usize, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::FunctionDef(ast::StmtFunctionDef {
                name,
                args,
                body,
                decorator_list,
                ..
            }) => {
                self.function_like(sid, name.as_str(), args, body, decorator_list, false);
            }
            ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                name,
                args,
                body,
                decorator_list,
                ..
            }) => {
                self.function_like(sid, name.as_str(), args, body, decorator_list, true);
            }
            ast::Stmt::ClassDef(ast::StmtClassDef {
                name,
                bases,
                keywords,
                body,
                decorator_list,
                ..
            }) => {
                for d in decorator_list {
                    self.expr(sid, d);
                }
                for b in bases {
                    self.expr(sid, b);
                }
                for k in keywords {
                    self.expr(sid, &k.value);
                }
                let child = self.scopes.push(ScopeKind::Class, name.as_str(), Some(sid));
                self.stmts(child, body);
                self.bind(sid, name.as_str());
            }
            ast::Stmt::Return(ast::StmtReturn { value, .. }) => {
                if let Some(v) = value {
                    self.expr(sid, v);
                }
            }
            ast::Stmt::Delete(ast::StmtDelete { targets, .. }) => {
                for t in targets {
                    self.expr(sid, t);
                }
            }
            ast::Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.expr(sid, value);
                for t in targets {
                    self.target(sid, t);
                }
            }
            ast::Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                // The target is read once, then the value; the walk mirrors
                // emission order so nested scopes line up between the two
                // passes.
                match target.as_ref() {
                    ast::Expr::Name(ast::ExprName { id, .. }) => {
                        self.scopes.list[sid].add_use(id.as_str());
                        self.bind(sid, id.as_str());
                    }
                    ast::Expr::Attribute(ast::ExprAttribute { value: obj, .. }) => {
                        self.expr(sid, obj);
                    }
                    ast::Expr::Subscript(ast::ExprSubscript {
                        value: obj, slice, ..
                    }) => {
                        self.expr(sid, obj);
                        self.expr(sid, slice);
                    }
                    other => self.expr(sid, other),
                }
                self.expr(sid, value);
            }
            ast::Stmt::AnnAssign(ast::StmtAnnAssign { target, value, .. }) => {
                if let Some(v) = value {
                    self.expr(sid, v);
                }
                self.target(sid, target);
            }
            ast::Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            })
            | ast::Stmt::AsyncFor(ast::StmtAsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.expr(sid, iter);
                self.target(sid, target);
                self.stmts(sid, body);
                self.stmts(sid, orelse);
            }
            ast::Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            }) => {
                self.expr(sid, test);
                self.stmts(sid, body);
                self.stmts(sid, orelse);
            }
            ast::Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => {
                self.expr(sid, test);
                self.stmts(sid, body);
                self.stmts(sid, orelse);
            }
            ast::Stmt::With(ast::StmtWith { items, body, .. })
            | ast::Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                for item in items {
                    self.expr(sid, &item.context_expr);
                    if let Some(v) = &item.optional_vars {
                        self.target(sid, v);
                    }
                }
                self.stmts(sid, body);
            }
            ast::Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                if let Some(e) = exc {
                    self.expr(sid, e);
                }
                if let Some(c) = cause {
                    self.expr(sid, c);
                }
            }
            ast::Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            })
            | ast::Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                // Emission order: body, else, handlers, finally.
                self.stmts(sid, body);
                self.stmts(sid, orelse);
                for ast::ExceptHandler::ExceptHandler(h) in handlers {
                    if let Some(ty) = &h.type_ {
                        self.expr(sid, ty);
                    }
                    if let Some(name) = &h.name {
                        self.bind(sid, name.as_str());
                    }
                    self.stmts(sid, &h.body);
                }
                self.stmts(sid, finalbody);
            }
            ast::Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.expr(sid, test);
                if let Some(m) = msg {
                    self.expr(sid, m);
                }
            }
            ast::Stmt::Import(ast::StmtImport { names, .. }) => {
                for alias in names {
                    let bound = alias
                        .asname
                        .as_ref()
                        .map(|n| n.as_str().to_string())
                        .unwrap_or_else(|| {
                            alias
                                .name
                                .as_str()
                                .split('.')
                                .next()
                                .unwrap_or("")
                                .to_string()
                        });
                    self.bind(sid, &bound);
                }
            }
            ast::Stmt::ImportFrom(ast::StmtImportFrom { names, .. }) => {
                for alias in names {
                    if alias.name.as_str() == "*" {
                        continue;
                    }
                    let bound = alias
                        .asname
                        .as_ref()
                        .map_or(alias.name.as_str(), |n| n.as_str());
                    self.bind(sid, bound);
                }
            }
            ast::Stmt::Global(ast::StmtGlobal { names, .. }) => {
                for n in names {
                    self.scopes.list[sid]
                        .globals_decl
                        .insert(n.as_str().to_string());
                }
            }
            ast::Stmt::Nonlocal(ast::StmtNonlocal { names, .. }) => {
                for n in names {
                    self.scopes.list[sid]
                        .nonlocals_decl
                        .insert(n.as_str().to_string());
                }
            }
            ast::Stmt::Expr(ast::StmtExpr { value, .. }) => self.expr(sid, value),
            ast::Stmt::Pass(_) | ast::Stmt::Break(_) | ast::Stmt::Continue(_) => {}
            _ => {}
        }
    }

    fn function_like(
        &mut self,
        sid: usize,
        name: &str,
        args: &ast::Arguments,
        body: &[ast::Stmt],
        decorator_list: &[ast::Expr],
        is_async: bool,
    ) {
        for d in decorator_list {
            self.expr(sid, d);
        }
        // Defaults evaluate in the enclosing scope.
        for a in args.posonlyargs.iter().chain(&args.args) {
            if let Some(default) = &a.default {
                self.expr(sid, default);
            }
        }
        for a in &args.kwonlyargs {
            if let Some(default) = &a.default {
                self.expr(sid, default);
            }
        }
        let child = self.scopes.push(ScopeKind::Function, name, Some(sid));
        self.scopes.list[child].is_async = is_async;
        self.enter_params(child, args);
        self.stmts(child, body);
        self.bind(sid, name);
    }

    fn enter_params(&mut self, sid: usize, args: &ast::Arguments) {
        let scope = &mut self.scopes.list[sid];
        for a in args.posonlyargs.iter().chain(&args.args) {
            scope.add_local(a.def.arg.as_str());
            scope.param_count += 1;
        }
        for a in &args.kwonlyargs {
            scope.add_local(a.def.arg.as_str());
            scope.kwonly_count += 1;
        }
        if let Some(v) = &args.vararg {
            scope.add_local(v.arg.as_str());
            scope.has_vararg = true;
        }
        if let Some(k) = &args.kwarg {
            scope.add_local(k.arg.as_str());
            scope.has_kwarg = true;
        }
    }

    fn target(&mut self, sid: usize, expr: &ast::Expr) {
        match expr {
            ast::Expr::Name(ast::ExprName { id, .. }) => self.bind(sid, id.as_str()),
            ast::Expr::Tuple(ast::ExprTuple { elts, .. })
            | ast::Expr::List(ast::ExprList { elts, .. }) => {
                for e in elts {
                    self.target(sid, e);
                }
            }
            ast::Expr::Starred(ast::ExprStarred { value, .. }) => self.target(sid, value),
            ast::Expr::Attribute(ast::ExprAttribute { value, .. }) => self.expr(sid, value),
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.expr(sid, value);
                self.expr(sid, slice);
            }
            _ => self.expr(sid, expr),
        }
    }

    fn expr(&mut self, sid: usize, expr: &ast::Expr) {
        match expr {
            ast::Expr::Name(ast::ExprName { id, .. }) => {
                self.scopes.list[sid].add_use(id.as_str());
            }
            ast::Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                for a in args.posonlyargs.iter().chain(&args.args) {
                    if let Some(default) = &a.default {
                        self.expr(sid, default);
                    }
                }
                for a in &args.kwonlyargs {
                    if let Some(default) = &a.default {
                        self.expr(sid, default);
                    }
                }
                let child = self.scopes.push(ScopeKind::Function, "<lambda>", Some(sid));
                self.enter_params(child, args);
                self.expr(child, body);
            }
            ast::Expr::BoolOp(ast::ExprBoolOp { values, .. }) => {
                for v in values {
                    self.expr(sid, v);
                }
            }
            ast::Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.expr(sid, value);
                self.target(sid, target);
            }
            ast::Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.expr(sid, left);
                self.expr(sid, right);
            }
            ast::Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => self.expr(sid, operand),
            ast::Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => {
                self.expr(sid, test);
                self.expr(sid, body);
                self.expr(sid, orelse);
            }
            ast::Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                for (k, v) in keys.iter().zip(values) {
                    if let Some(k) = k {
                        self.expr(sid, k);
                    }
                    self.expr(sid, v);
                }
            }
            ast::Expr::Set(ast::ExprSet { elts, .. })
            | ast::Expr::Tuple(ast::ExprTuple { elts, .. })
            | ast::Expr::List(ast::ExprList { elts, .. }) => {
                for e in elts {
                    self.expr(sid, e);
                }
            }
            ast::Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            })
            | ast::Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            })
            | ast::Expr::GeneratorExp(ast::ExprGeneratorExp {
                elt, generators, ..
            }) => {
                self.comprehension(sid, generators);
                self.expr(sid, elt);
            }
            ast::Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.comprehension(sid, generators);
                self.expr(sid, key);
                self.expr(sid, value);
            }
            ast::Expr::Await(ast::ExprAwait { value, .. }) => self.expr(sid, value),
            ast::Expr::Yield(ast::ExprYield { value, .. }) => {
                self.scopes.list[sid].has_yield = true;
                if let Some(v) = value {
                    self.expr(sid, v);
                }
            }
            ast::Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => {
                self.scopes.list[sid].has_yield = true;
                self.expr(sid, value);
            }
            ast::Expr::Compare(ast::ExprCompare {
                left, comparators, ..
            }) => {
                self.expr(sid, left);
                for c in comparators {
                    self.expr(sid, c);
                }
            }
            ast::Expr::Call(ast::ExprCall {
                func,
                args,
                keywords,
                ..
            }) => {
                self.expr(sid, func);
                for a in args {
                    self.expr(sid, a);
                }
                for k in keywords {
                    self.expr(sid, &k.value);
                }
            }
            ast::Expr::FormattedValue(ast::ExprFormattedValue {
                value, format_spec, ..
            }) => {
                self.expr(sid, value);
                if let Some(s) = format_spec {
                    self.expr(sid, s);
                }
            }
            ast::Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => {
                for v in values {
                    self.expr(sid, v);
                }
            }
            ast::Expr::Attribute(ast::ExprAttribute { value, .. }) => self.expr(sid, value),
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.expr(sid, value);
                self.expr(sid, slice);
            }
            ast::Expr::Starred(ast::ExprStarred { value, .. }) => self.expr(sid, value),
            ast::Expr::Slice(ast::ExprSlice {
                lower, upper, step, ..
            }) => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.expr(sid, part);
                }
            }
            ast::Expr::Constant(_) => {}
            _ => {}
        }
    }

    fn comprehension(&mut self, sid: usize, generators: &[ast::Comprehension]) {
        for gen in generators {
            self.expr(sid, &gen.iter);
            self.target(sid, &gen.target);
            for cond in &gen.ifs {
                self.expr(sid, cond);
            }
        }
    }
}

/// Resolve every used name in a scope, marking captures in ancestors.
fn resolve_scope(
    scopes: &mut Scopes,
    sid: usize,
    chain: &mut Vec<usize>,
) -> Result<(), String> {
    // Work over snapshots to keep the borrow checker out of the recursion.
    let used: Vec<String> = scopes.list[sid].used.clone();
    let nonlocals: Vec<String> = scopes.list[sid].nonlocals_decl.iter().cloned().collect();

    for name in used.iter().chain(nonlocals.iter()) {
        if scopes.list[sid].classify(name).is_some() {
            continue;
        }
        let kind = classify_name(scopes, sid, chain, name)?;
        scopes.list[sid].resolution.push((name.clone(), kind));
    }

    chain.push(sid);
    let children = scopes.list[sid].children.clone();
    for child in children {
        resolve_scope(scopes, child, chain)?;
    }
    chain.pop();
    Ok(())
}

fn classify_name(
    scopes: &mut Scopes,
    sid: usize,
    chain: &[usize],
    name: &str,
) -> Result<NameKind, String> {
    let scope = &scopes.list[sid];
    let is_nonlocal = scope.nonlocals_decl.contains(name);

    if scope.globals_decl.contains(name) {
        return Ok(NameKind::Global);
    }
    if !is_nonlocal && scope.locals.iter().any(|n| n == name) {
        // May be promoted to Cell later if a nested scope captures it; the
        // promotion happens when the capture is discovered, so the emitter
        // re-checks the cells list. Module and class bodies bind by name.
        return Ok(match scope.kind {
            ScopeKind::Function => NameKind::Local,
            _ => NameKind::Name,
        });
    }
    if !is_nonlocal && scope.frees.iter().any(|n| n == name) {
        return Ok(NameKind::Free);
    }

    // Search enclosing function scopes, innermost first.
    let mut origin = None;
    for &ancestor in chain.iter().rev() {
        let a = &scopes.list[ancestor];
        if a.kind != ScopeKind::Function {
            continue;
        }
        if a.globals_decl.contains(name) {
            break;
        }
        if a.locals.iter().any(|n| n == name) || a.frees.iter().any(|n| n == name) {
            origin = Some(ancestor);
            break;
        }
    }

    let Some(origin) = origin else {
        if is_nonlocal {
            return Err(format!("no binding for nonlocal '{name}' found"));
        }
        return Ok(match scope.kind {
            ScopeKind::Function => NameKind::Global,
            _ => NameKind::Name,
        });
    };

    // Mark the defining scope's cell (unless the origin itself holds it
    // free, in which case the true cell is already marked further out).
    {
        let o = &mut scopes.list[origin];
        if o.locals.iter().any(|n| n == name) && !o.cells.iter().any(|n| n == name) {
            o.cells.push(name.to_string());
        }
    }
    // Thread the name through every intervening scope as a free variable.
    let start = chain.iter().position(|&s| s == origin).unwrap_or(0);
    for &mid in &chain[start + 1..] {
        let m = &mut scopes.list[mid];
        if !m.frees.iter().any(|n| n == name) {
            m.frees.push(name.to_string());
        }
    }
    let s = &mut scopes.list[sid];
    if !s.frees.iter().any(|n| n == name) {
        s.frees.push(name.to_string());
    }
    Ok(NameKind::Free)
}

// ---------------------------------------------------------------------------
// Code generation
// ---------------------------------------------------------------------------

type Label = usize;

#[derive(Clone, Copy)]
enum IArg {
    None,
    U(u16),
    L(Label),
    Pair(u8, u8),
}

#[derive(Clone, Copy)]
struct Instr {
    op: Opcode,
    arg: IArg,
    line: u32,
}

struct LoopCtx {
    start: Label,
}

/// Per-code-object emission state.
struct Ctx {
    sid: usize,
    instrs: Vec<Instr>,
    labels: Vec<Option<usize>>,
    consts: Vec<Value>,
    names: Vec<PyStr>,
    var_names: Vec<PyStr>,
    child_cursor: usize,
    loops: Vec<LoopCtx>,
    line: u32,
    temp_counter: usize,
}

impl Ctx {
    fn emit(&mut self, op: Opcode) {
        self.instrs.push(Instr {
            op,
            arg: IArg::None,
            line: self.line,
        });
    }

    fn emit_u(&mut self, op: Opcode, arg: u16) {
        self.instrs.push(Instr {
            op,
            arg: IArg::U(arg),
            line: self.line,
        });
    }

    fn emit_label(&mut self, op: Opcode, label: Label) {
        self.instrs.push(Instr {
            op,
            arg: IArg::L(label),
            line: self.line,
        });
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn bind(&mut self, label: Label) {
        self.labels[label] = Some(self.instrs.len());
    }

    fn const_idx(&mut self, v: Value) -> u16 {
        for (i, existing) in self.consts.iter().enumerate() {
            if existing.is_identical(&v) {
                return i as u16;
            }
        }
        self.consts.push(v);
        (self.consts.len() - 1) as u16
    }

    fn name_idx(&mut self, name: &str) -> u16 {
        if let Some(i) = self.names.iter().position(|n| n.as_str() == name) {
            return i as u16;
        }
        self.names.push(PyStr::new(name));
        (self.names.len() - 1) as u16
    }

    fn var_idx(&mut self, name: &str) -> u16 {
        if let Some(i) = self.var_names.iter().position(|n| n.as_str() == name) {
            return i as u16;
        }
        self.var_names.push(PyStr::new(name));
        (self.var_names.len() - 1) as u16
    }

    fn temp(&mut self) -> String {
        self.temp_counter += 1;
        format!(".t{}", self.temp_counter - 1)
    }
}

struct Compiler {
    scopes: Scopes,
    lines: LineIndex,
    filename: String,
}

type CResult<T> = Result<T, CompileError>;

impl Compiler {
    fn err<T>(&self, message: impl Into<String>, line: u32) -> CResult<T> {
        Err(CompileError {
            message: message.into(),
            filename: self.filename.clone(),
            line,
        })
    }

    fn line(&self, range: TextRange) -> u32 {
        self.lines.line_of(u32::from(range.start()))
    }

    fn new_ctx(&self, sid: usize) -> Ctx {
        let scope = &self.scopes.list[sid];
        // Fast slots: every local that is not a pure cell variable. Cell
        // parameters stay in the slot table so binding can fill them before
        // MAKE_CELL moves them into their cells. Module and class bodies use
        // namespace dicts, not slots.
        let mut var_names = Vec::new();
        if scope.kind == ScopeKind::Function {
            let n_params = scope.param_count
                + scope.kwonly_count
                + usize::from(scope.has_vararg)
                + usize::from(scope.has_kwarg);
            for (i, name) in scope.locals.iter().enumerate() {
                let is_param = i < n_params;
                if is_param || !scope.cells.iter().any(|c| c == name) {
                    var_names.push(PyStr::new(name));
                }
            }
        }
        Ctx {
            sid,
            instrs: Vec::new(),
            labels: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            var_names,
            child_cursor: 0,
            loops: Vec::new(),
            line: 1,
            temp_counter: 0,
        }
    }

    fn next_child(&self, ctx: &mut Ctx) -> usize {
        let child = self.scopes.list[ctx.sid].children[ctx.child_cursor];
        ctx.child_cursor += 1;
        child
    }

    // -- Entry points -------------------------------------------------------

    fn compile_module(&mut self, sid: usize, body: &[ast::Stmt]) -> CResult<CodeObject> {
        let mut ctx = self.new_ctx(sid);
        let (main, last) = match body.split_last() {
            Some((last @ ast::Stmt::Expr(_), main)) => (main, Some(last)),
            _ => (body, None),
        };
        for stmt in main {
            self.stmt(&mut ctx, stmt)?;
        }
        match last {
            Some(ast::Stmt::Expr(ast::StmtExpr { value, range, .. })) => {
                ctx.line = self.line(*range);
                self.expr(&mut ctx, value)?;
            }
            _ => ctx.emit(Opcode::LoadNone),
        }
        ctx.emit(Opcode::ReturnValue);
        self.assemble(ctx, "<module>", CodeFlags::default(), 1)
    }

    fn compile_function_body(
        &mut self,
        sid: usize,
        name: &str,
        body: &[ast::Stmt],
        first_line: u32,
    ) -> CResult<CodeObject> {
        let mut ctx = self.new_ctx(sid);
        ctx.line = first_line;

        // Move captured parameters into their cells.
        let cells = self.scopes.list[sid].cells.clone();
        let locals = self.scopes.list[sid].locals.clone();
        let n_params = {
            let scope = &self.scopes.list[sid];
            scope.param_count + scope.kwonly_count
                + usize::from(scope.has_vararg)
                + usize::from(scope.has_kwarg)
        };
        for (ci, cell_name) in cells.iter().enumerate() {
            if locals.iter().take(n_params).any(|n| n == cell_name) {
                ctx.emit_u(Opcode::MakeCell, ci as u16);
            }
        }

        for stmt in body {
            self.stmt(&mut ctx, stmt)?;
        }
        ctx.emit(Opcode::LoadNone);
        ctx.emit(Opcode::ReturnValue);

        let scope = &self.scopes.list[sid];
        let mut flags = CodeFlags(CodeFlags::OPTIMIZED | CodeFlags::NEW_LOCALS);
        if scope.has_vararg {
            flags.insert(CodeFlags::VAR_ARGS);
        }
        if scope.has_kwarg {
            flags.insert(CodeFlags::VAR_KEYWORDS);
        }
        if scope.parent.is_some_and(|p| self.scopes.list[p].kind != ScopeKind::Module) {
            flags.insert(CodeFlags::NESTED);
        }
        if scope.has_yield {
            flags.insert(CodeFlags::GENERATOR);
        }
        if scope.is_async {
            flags.insert(CodeFlags::COROUTINE);
            if scope.has_yield {
                flags.insert(CodeFlags::ASYNC_GENERATOR);
            }
        }
        if scope.frees.is_empty() {
            flags.insert(CodeFlags::NO_FREE);
        }
        self.assemble(ctx, name, flags, first_line)
    }

    fn compile_class_body(
        &mut self,
        sid: usize,
        name: &str,
        body: &[ast::Stmt],
        first_line: u32,
    ) -> CResult<CodeObject> {
        let mut ctx = self.new_ctx(sid);
        ctx.line = first_line;
        for stmt in body {
            self.stmt(&mut ctx, stmt)?;
        }
        ctx.emit(Opcode::LoadLocals);
        ctx.emit(Opcode::ReturnValue);
        self.assemble(ctx, name, CodeFlags::default(), first_line)
    }

    // -- Statements ---------------------------------------------------------

    fn stmt(&mut self, ctx: &mut Ctx, stmt: &ast::Stmt) -> CResult<()> {
        ctx.line = self.line(stmt.range());
        match stmt {
            ast::Stmt::Expr(ast::StmtExpr { value, .. }) => {
                self.expr(ctx, value)?;
                ctx.emit(Opcode::PopTop);
            }
            ast::Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.expr(ctx, value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        ctx.emit(Opcode::DupTop);
                    }
                    self.store(ctx, target)?;
                }
            }
            ast::Stmt::AugAssign(ast::StmtAugAssign {
                target, op, value, ..
            }) => {
                self.aug_assign(ctx, target, bin_op(op), value)?;
            }
            ast::Stmt::AnnAssign(ast::StmtAnnAssign { target, value, .. }) => {
                if let Some(value) = value {
                    self.expr(ctx, value)?;
                    self.store(ctx, target)?;
                }
            }
            ast::Stmt::Return(ast::StmtReturn { value, .. }) => {
                match value {
                    Some(v) => self.expr(ctx, v)?,
                    None => ctx.emit(Opcode::LoadNone),
                }
                ctx.emit(Opcode::ReturnValue);
            }
            ast::Stmt::Delete(ast::StmtDelete { targets, .. }) => {
                for target in targets {
                    self.delete(ctx, target)?;
                }
            }
            ast::Stmt::Pass(_) => {}
            ast::Stmt::Break(_) => ctx.emit(Opcode::BreakLoop),
            ast::Stmt::Continue(ast::StmtContinue { range, .. }) => {
                let Some(loop_ctx) = ctx.loops.last() else {
                    return self.err("'continue' not properly in loop", self.line(*range));
                };
                let start = loop_ctx.start;
                ctx.emit_label(Opcode::ContinueLoop, start);
            }
            ast::Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => {
                let lelse = ctx.new_label();
                let lend = ctx.new_label();
                self.expr(ctx, test)?;
                ctx.emit_label(Opcode::PopJumpIfFalse, lelse);
                for s in body {
                    self.stmt(ctx, s)?;
                }
                if !orelse.is_empty() {
                    ctx.emit_label(Opcode::Jump, lend);
                }
                ctx.bind(lelse);
                for s in orelse {
                    self.stmt(ctx, s)?;
                }
                ctx.bind(lend);
            }
            ast::Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            }) => {
                let lend = ctx.new_label();
                let lstart = ctx.new_label();
                let lelse = ctx.new_label();
                ctx.emit_label(Opcode::SetupLoop, lend);
                ctx.bind(lstart);
                self.expr(ctx, test)?;
                ctx.emit_label(Opcode::PopJumpIfFalse, lelse);
                ctx.loops.push(LoopCtx { start: lstart });
                for s in body {
                    self.stmt(ctx, s)?;
                }
                ctx.loops.pop();
                ctx.emit_label(Opcode::Jump, lstart);
                ctx.bind(lelse);
                ctx.emit(Opcode::PopBlock);
                for s in orelse {
                    self.stmt(ctx, s)?;
                }
                ctx.bind(lend);
            }
            ast::Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                let lend = ctx.new_label();
                let lstart = ctx.new_label();
                let lelse = ctx.new_label();
                ctx.emit_label(Opcode::SetupLoop, lend);
                self.expr(ctx, iter)?;
                ctx.emit(Opcode::GetIter);
                ctx.bind(lstart);
                ctx.emit_label(Opcode::ForIter, lelse);
                self.store(ctx, target)?;
                ctx.loops.push(LoopCtx { start: lstart });
                for s in body {
                    self.stmt(ctx, s)?;
                }
                ctx.loops.pop();
                ctx.emit_label(Opcode::Jump, lstart);
                ctx.bind(lelse);
                ctx.emit(Opcode::PopBlock);
                for s in orelse {
                    self.stmt(ctx, s)?;
                }
                ctx.bind(lend);
            }
            ast::Stmt::With(ast::StmtWith { items, body, .. }) => {
                self.with_items(ctx, items, body)?;
            }
            ast::Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                match (exc, cause) {
                    (None, _) => ctx.emit_u(Opcode::RaiseVarargs, 0),
                    (Some(e), None) => {
                        self.expr(ctx, e)?;
                        ctx.emit_u(Opcode::RaiseVarargs, 1);
                    }
                    (Some(e), Some(c)) => {
                        self.expr(ctx, e)?;
                        self.expr(ctx, c)?;
                        ctx.emit_u(Opcode::RaiseVarargs, 2);
                    }
                }
            }
            ast::Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.try_stmt(ctx, body, handlers, orelse, finalbody, false)?;
            }
            ast::Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.try_stmt(ctx, body, handlers, orelse, finalbody, true)?;
            }
            ast::Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                let lok = ctx.new_label();
                self.expr(ctx, test)?;
                ctx.emit_label(Opcode::PopJumpIfTrue, lok);
                let idx = ctx.name_idx("AssertionError");
                ctx.emit_u(Opcode::LoadGlobal, idx);
                if let Some(msg) = msg {
                    self.expr(ctx, msg)?;
                    ctx.emit_u(Opcode::Call, 1);
                }
                ctx.emit_u(Opcode::RaiseVarargs, 1);
                ctx.bind(lok);
            }
            ast::Stmt::Import(ast::StmtImport { names, .. }) => {
                for alias in names {
                    let module = alias.name.as_str();
                    let none = ctx.const_idx(Value::None);
                    let zero = ctx.const_idx(Value::Int(0));
                    ctx.emit_u(Opcode::LoadConst, zero);
                    ctx.emit_u(Opcode::LoadConst, none);
                    let idx = ctx.name_idx(module);
                    ctx.emit_u(Opcode::ImportName, idx);
                    match &alias.asname {
                        Some(asname) => {
                            // `import a.b as x` binds the leaf.
                            for part in module.split('.').skip(1) {
                                let attr = ctx.name_idx(part);
                                ctx.emit_u(Opcode::LoadAttr, attr);
                            }
                            self.store_name(ctx, asname.as_str())?;
                        }
                        None => {
                            let first = module.split('.').next().unwrap_or(module);
                            self.store_name(ctx, first)?;
                        }
                    }
                }
            }
            ast::Stmt::ImportFrom(ast::StmtImportFrom {
                module,
                names,
                level,
                ..
            }) => {
                let level_value = level.as_ref().map_or(0, |l| l.to_u32());
                let module_name = module.as_ref().map_or("", |m| m.as_str());
                let star = names.iter().any(|a| a.name.as_str() == "*");
                let fromlist: Vec<Value> = if star {
                    vec![Value::str("*")]
                } else {
                    names
                        .iter()
                        .map(|a| Value::str(a.name.as_str()))
                        .collect()
                };
                let level_idx = ctx.const_idx(Value::Int(i64::from(level_value)));
                ctx.emit_u(Opcode::LoadConst, level_idx);
                let fl = ctx.const_idx(Value::tuple(fromlist));
                ctx.emit_u(Opcode::LoadConst, fl);
                let idx = ctx.name_idx(module_name);
                ctx.emit_u(Opcode::ImportName, idx);
                if star {
                    ctx.emit(Opcode::ImportStar);
                } else {
                    for alias in names {
                        let attr = ctx.name_idx(alias.name.as_str());
                        ctx.emit_u(Opcode::ImportFrom, attr);
                        let bound = alias
                            .asname
                            .as_ref()
                            .map_or(alias.name.as_str(), |n| n.as_str());
                        self.store_name(ctx, bound)?;
                    }
                    ctx.emit(Opcode::PopTop);
                }
            }
            ast::Stmt::Global(_) | ast::Stmt::Nonlocal(_) => {}
            ast::Stmt::FunctionDef(ast::StmtFunctionDef {
                name,
                args,
                body,
                decorator_list,
                range,
                ..
            }) => {
                self.function_def(
                    ctx,
                    name.as_str(),
                    args,
                    body,
                    decorator_list,
                    self.line(*range),
                )?;
                self.store_name(ctx, name.as_str())?;
            }
            ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                name,
                args,
                body,
                decorator_list,
                range,
                ..
            }) => {
                self.function_def(
                    ctx,
                    name.as_str(),
                    args,
                    body,
                    decorator_list,
                    self.line(*range),
                )?;
                self.store_name(ctx, name.as_str())?;
            }
            ast::Stmt::ClassDef(ast::StmtClassDef {
                name,
                bases,
                keywords,
                body,
                decorator_list,
                range,
                ..
            }) => {
                self.class_def(
                    ctx,
                    name.as_str(),
                    bases,
                    keywords,
                    body,
                    decorator_list,
                    self.line(*range),
                )?;
                self.store_name(ctx, name.as_str())?;
            }
            other => {
                return self.err(
                    "unsupported statement in this interpreter",
                    self.line(other.range()),
                );
            }
        }
        Ok(())
    }

    fn with_items(
        &mut self,
        ctx: &mut Ctx,
        items: &[ast::WithItem],
        body: &[ast::Stmt],
    ) -> CResult<()> {
        let Some((item, rest)) = items.split_first() else {
            for s in body {
                self.stmt(ctx, s)?;
            }
            return Ok(());
        };
        let lafter = ctx.new_label();
        self.expr(ctx, &item.context_expr)?;
        ctx.emit_label(Opcode::SetupWith, lafter);
        match &item.optional_vars {
            Some(target) => self.store(ctx, target)?,
            None => ctx.emit(Opcode::PopTop),
        }
        self.with_items(ctx, rest, body)?;
        ctx.emit(Opcode::PopBlock);
        ctx.emit(Opcode::ExitWith);
        ctx.bind(lafter);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn try_stmt(
        &mut self,
        ctx: &mut Ctx,
        body: &[ast::Stmt],
        handlers: &[ast::ExceptHandler],
        orelse: &[ast::Stmt],
        finalbody: &[ast::Stmt],
        star: bool,
    ) -> CResult<()> {
        let lfin = ctx.new_label();
        let lhand = ctx.new_label();
        let lafter = ctx.new_label();

        if !finalbody.is_empty() {
            ctx.emit_label(Opcode::SetupFinally, lfin);
        }
        if !handlers.is_empty() {
            if star {
                ctx.emit_label(Opcode::SetupExceptStar, lhand);
            } else {
                ctx.emit_label(Opcode::SetupExcept, lhand);
            }
        }
        for s in body {
            self.stmt(ctx, s)?;
        }
        if !handlers.is_empty() {
            ctx.emit(Opcode::PopBlock);
            for s in orelse {
                self.stmt(ctx, s)?;
            }
            ctx.emit_label(Opcode::Jump, lafter);
            ctx.bind(lhand);
            if star {
                self.except_star_handlers(ctx, handlers)?;
            } else {
                self.except_handlers(ctx, handlers)?;
            }
        } else {
            for s in orelse {
                self.stmt(ctx, s)?;
            }
        }
        ctx.bind(lafter);
        if !finalbody.is_empty() {
            ctx.emit(Opcode::PopBlock);
            ctx.emit(Opcode::BeginFinally);
            ctx.bind(lfin);
            for s in finalbody {
                self.stmt(ctx, s)?;
            }
            ctx.emit(Opcode::EndFinally);
        }
        Ok(())
    }

    /// Handler chain; at entry the live exception is on the stack.
    fn except_handlers(
        &mut self,
        ctx: &mut Ctx,
        handlers: &[ast::ExceptHandler],
    ) -> CResult<()> {
        let lafter = ctx.new_label();
        for ast::ExceptHandler::ExceptHandler(h) in handlers {
            ctx.line = self.line(h.range);
            let lnext = ctx.new_label();
            if let Some(ty) = &h.type_ {
                self.expr(ctx, ty)?;
                ctx.emit_label(Opcode::JumpIfNotExcMatch, lnext);
            }
            match &h.name {
                Some(name) => self.store_name(ctx, name.as_str())?,
                None => ctx.emit(Opcode::PopTop),
            }
            for s in &h.body {
                self.stmt(ctx, s)?;
            }
            ctx.emit(Opcode::PopExcept);
            ctx.emit_label(Opcode::Jump, lafter);
            ctx.bind(lnext);
        }
        // No handler matched: re-raise the active exception.
        ctx.emit_u(Opcode::RaiseVarargs, 0);
        ctx.bind(lafter);
        Ok(())
    }

    /// `except*` chain; every clause runs against the remaining leaves.
    fn except_star_handlers(
        &mut self,
        ctx: &mut Ctx,
        handlers: &[ast::ExceptHandler],
    ) -> CResult<()> {
        for ast::ExceptHandler::ExceptHandler(h) in handlers {
            ctx.line = self.line(h.range);
            let lskip = ctx.new_label();
            let Some(ty) = &h.type_ else {
                return self.err("except* requires an exception type", ctx.line);
            };
            self.expr(ctx, ty)?;
            ctx.emit(Opcode::CheckEgMatch);
            ctx.emit(Opcode::DupTop);
            ctx.emit(Opcode::LoadNone);
            ctx.emit_u(Opcode::CompareOp, CmpOp::Is as u16);
            ctx.emit_label(Opcode::PopJumpIfTrue, lskip);
            match &h.name {
                Some(name) => self.store_name(ctx, name.as_str())?,
                None => ctx.emit(Opcode::PopTop),
            }
            for s in &h.body {
                self.stmt(ctx, s)?;
            }
            let ldone = ctx.new_label();
            ctx.emit_label(Opcode::Jump, ldone);
            ctx.bind(lskip);
            ctx.emit(Opcode::PopTop);
            ctx.bind(ldone);
        }
        ctx.emit(Opcode::ReraiseStar);
        Ok(())
    }

    fn aug_assign(
        &mut self,
        ctx: &mut Ctx,
        target: &ast::Expr,
        op: BinOp,
        value: &ast::Expr,
    ) -> CResult<()> {
        match target {
            ast::Expr::Name(ast::ExprName { id, .. }) => {
                self.load_name(ctx, id.as_str())?;
                self.expr(ctx, value)?;
                ctx.emit_u(Opcode::InplaceOp, op as u16);
                self.store_name(ctx, id.as_str())?;
            }
            ast::Expr::Attribute(ast::ExprAttribute { value: obj, attr, .. }) => {
                let t_obj = ctx.temp();
                self.expr(ctx, obj)?;
                self.store_temp(ctx, &t_obj);
                self.load_temp(ctx, &t_obj);
                let idx = ctx.name_idx(attr.as_str());
                ctx.emit_u(Opcode::LoadAttr, idx);
                self.expr(ctx, value)?;
                ctx.emit_u(Opcode::InplaceOp, op as u16);
                self.load_temp(ctx, &t_obj);
                ctx.emit_u(Opcode::StoreAttr, idx);
            }
            ast::Expr::Subscript(ast::ExprSubscript { value: obj, slice, .. }) => {
                let t_obj = ctx.temp();
                let t_key = ctx.temp();
                self.expr(ctx, obj)?;
                self.store_temp(ctx, &t_obj);
                self.subscript_key(ctx, slice)?;
                self.store_temp(ctx, &t_key);
                self.load_temp(ctx, &t_obj);
                self.load_temp(ctx, &t_key);
                ctx.emit(Opcode::BinarySubscr);
                self.expr(ctx, value)?;
                ctx.emit_u(Opcode::InplaceOp, op as u16);
                self.load_temp(ctx, &t_obj);
                self.load_temp(ctx, &t_key);
                ctx.emit(Opcode::StoreSubscr);
            }
            other => {
                return self.err(
                    "illegal target for augmented assignment",
                    self.line(other.range()),
                );
            }
        }
        Ok(())
    }

    // -- Functions and classes ----------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn function_def(
        &mut self,
        ctx: &mut Ctx,
        name: &str,
        args: &ast::Arguments,
        body: &[ast::Stmt],
        decorator_list: &[ast::Expr],
        first_line: u32,
    ) -> CResult<()> {
        for d in decorator_list {
            self.expr(ctx, d)?;
        }

        // Positional defaults as a tuple.
        let mut flags: u16 = 0;
        let defaults: Vec<&ast::Expr> = args
            .posonlyargs
            .iter()
            .chain(&args.args)
            .filter_map(|a| a.default.as_deref())
            .collect();
        if !defaults.is_empty() {
            for d in &defaults {
                self.expr(ctx, d)?;
            }
            ctx.emit_u(Opcode::BuildTuple, defaults.len() as u16);
            flags |= 0x01;
        }
        // Keyword-only defaults as a dict.
        let kw_defaults: Vec<(&str, &ast::Expr)> = args
            .kwonlyargs
            .iter()
            .filter_map(|a| a.default.as_deref().map(|d| (a.def.arg.as_str(), d)))
            .collect();
        if !kw_defaults.is_empty() {
            for (kname, d) in &kw_defaults {
                let idx = ctx.const_idx(Value::str(*kname));
                ctx.emit_u(Opcode::LoadConst, idx);
                self.expr(ctx, d)?;
            }
            ctx.emit_u(Opcode::BuildMap, kw_defaults.len() as u16);
            flags |= 0x02;
        }

        let child = self.next_child(ctx);
        let code = self.compile_function_body(child, name, body, first_line)?;

        // Closure: load the child's free variables as cells.
        let child_frees = self.scopes.list[child].frees.clone();
        if !child_frees.is_empty() {
            for free in &child_frees {
                let deref = self.deref_index(ctx.sid, free).ok_or_else(|| CompileError {
                    message: format!("cannot capture '{free}'"),
                    filename: self.filename.clone(),
                    line: first_line,
                })?;
                ctx.emit_u(Opcode::LoadClosure, deref);
            }
            ctx.emit_u(Opcode::BuildTuple, child_frees.len() as u16);
            flags |= 0x08;
        }

        let code_idx = ctx.const_idx(Value::Code(std::rc::Rc::new(code)));
        ctx.emit_u(Opcode::LoadConst, code_idx);
        ctx.emit_u(Opcode::MakeFunction, flags);

        for _ in decorator_list {
            ctx.emit_u(Opcode::Call, 1);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn class_def(
        &mut self,
        ctx: &mut Ctx,
        name: &str,
        bases: &[ast::Expr],
        keywords: &[ast::Keyword],
        body: &[ast::Stmt],
        decorator_list: &[ast::Expr],
        first_line: u32,
    ) -> CResult<()> {
        for d in decorator_list {
            self.expr(ctx, d)?;
        }
        // Base and keyword expressions evaluate before the body runs, but
        // BUILD_CLASS wants [ns, name, bases, meta]; stash them in temps.
        let base_temps: Vec<String> = bases
            .iter()
            .map(|b| {
                let t = ctx.temp();
                self.expr(ctx, b)?;
                self.store_temp(ctx, &t);
                Ok(t)
            })
            .collect::<CResult<_>>()?;
        let mut meta_temp = None;
        for k in keywords {
            match k.arg.as_ref().map(|a| a.as_str()) {
                Some("metaclass") => {
                    let t = ctx.temp();
                    self.expr(ctx, &k.value)?;
                    self.store_temp(ctx, &t);
                    meta_temp = Some(t);
                }
                _ => {
                    return self.err(
                        "unsupported class keyword argument",
                        self.line(k.range()),
                    );
                }
            }
        }

        let child = self.next_child(ctx);
        let code = self.compile_class_body(child, name, body, first_line)?;

        // The body runs as a closure-carrying function returning its
        // namespace.
        let mut mk_flags: u16 = 0;
        let child_frees = self.scopes.list[child].frees.clone();
        if !child_frees.is_empty() {
            for free in &child_frees {
                let deref = self.deref_index(ctx.sid, free).ok_or_else(|| CompileError {
                    message: format!("cannot capture '{free}'"),
                    filename: self.filename.clone(),
                    line: first_line,
                })?;
                ctx.emit_u(Opcode::LoadClosure, deref);
            }
            ctx.emit_u(Opcode::BuildTuple, child_frees.len() as u16);
            mk_flags |= 0x08;
        }
        let code_idx = ctx.const_idx(Value::Code(std::rc::Rc::new(code)));
        ctx.emit_u(Opcode::LoadConst, code_idx);
        ctx.emit_u(Opcode::MakeFunction, mk_flags);
        ctx.emit_u(Opcode::Call, 0);

        let name_idx = ctx.const_idx(Value::str(name));
        ctx.emit_u(Opcode::LoadConst, name_idx);
        for t in &base_temps {
            self.load_temp(ctx, t);
        }
        ctx.emit_u(Opcode::BuildTuple, base_temps.len() as u16);
        match &meta_temp {
            Some(t) => self.load_temp(ctx, t),
            None => ctx.emit(Opcode::LoadNone),
        }
        ctx.emit(Opcode::BuildClass);

        for _ in decorator_list {
            ctx.emit_u(Opcode::Call, 1);
        }
        Ok(())
    }

    /// Deref slot of `name` in scope `sid`: cells first, then frees.
    fn deref_index(&self, sid: usize, name: &str) -> Option<u16> {
        let scope = &self.scopes.list[sid];
        if let Some(i) = scope.cells.iter().position(|c| c == name) {
            return Some(i as u16);
        }
        scope
            .frees
            .iter()
            .position(|f| f == name)
            .map(|i| (scope.cells.len() + i) as u16)
    }

    // -- Name access --------------------------------------------------------

    fn load_name(&mut self, ctx: &mut Ctx, name: &str) -> CResult<()> {
        match self.name_kind(ctx.sid, name) {
            NameKind::Local => {
                let idx = ctx.var_idx(name);
                ctx.emit_u(Opcode::LoadFast, idx);
            }
            NameKind::Cell | NameKind::Free => {
                let idx = self.deref_index(ctx.sid, name).unwrap_or(0);
                ctx.emit_u(Opcode::LoadDeref, idx);
            }
            NameKind::Global => {
                let idx = ctx.name_idx(name);
                ctx.emit_u(Opcode::LoadGlobal, idx);
            }
            NameKind::Name => {
                let idx = ctx.name_idx(name);
                ctx.emit_u(Opcode::LoadName, idx);
            }
        }
        Ok(())
    }

    fn store_name(&mut self, ctx: &mut Ctx, name: &str) -> CResult<()> {
        match self.name_kind(ctx.sid, name) {
            NameKind::Local => {
                let idx = ctx.var_idx(name);
                ctx.emit_u(Opcode::StoreFast, idx);
            }
            NameKind::Cell | NameKind::Free => {
                let idx = self.deref_index(ctx.sid, name).unwrap_or(0);
                ctx.emit_u(Opcode::StoreDeref, idx);
            }
            NameKind::Global => {
                let idx = ctx.name_idx(name);
                ctx.emit_u(Opcode::StoreGlobal, idx);
            }
            NameKind::Name => {
                let idx = ctx.name_idx(name);
                ctx.emit_u(Opcode::StoreName, idx);
            }
        }
        Ok(())
    }

    /// Effective kind of a name in a scope, accounting for cell promotion.
    fn name_kind(&self, sid: usize, name: &str) -> NameKind {
        let scope = &self.scopes.list[sid];
        if scope.cells.iter().any(|c| c == name) {
            return NameKind::Cell;
        }
        match scope.classify(name) {
            Some(NameKind::Local) => NameKind::Local,
            Some(kind) => kind,
            None => {
                // Assigned-only names never enter `used`; classify directly.
                if scope.globals_decl.contains(name) {
                    NameKind::Global
                } else if scope.nonlocals_decl.contains(name)
                    || scope.frees.iter().any(|f| f == name)
                {
                    NameKind::Free
                } else if scope.kind == ScopeKind::Function {
                    NameKind::Local
                } else {
                    NameKind::Name
                }
            }
        }
    }

    fn store_temp(&mut self, ctx: &mut Ctx, name: &str) {
        if self.scopes.list[ctx.sid].kind == ScopeKind::Function {
            let idx = ctx.var_idx(name);
            ctx.emit_u(Opcode::StoreFast, idx);
        } else {
            let idx = ctx.name_idx(name);
            ctx.emit_u(Opcode::StoreName, idx);
        }
    }

    fn load_temp(&mut self, ctx: &mut Ctx, name: &str) {
        if self.scopes.list[ctx.sid].kind == ScopeKind::Function {
            let idx = ctx.var_idx(name);
            ctx.emit_u(Opcode::LoadFast, idx);
        } else {
            let idx = ctx.name_idx(name);
            ctx.emit_u(Opcode::LoadName, idx);
        }
    }

    // -- Assignment targets -------------------------------------------------

    fn store(&mut self, ctx: &mut Ctx, target: &ast::Expr) -> CResult<()> {
        match target {
            ast::Expr::Name(ast::ExprName { id, .. }) => self.store_name(ctx, id.as_str()),
            ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.expr(ctx, value)?;
                let idx = ctx.name_idx(attr.as_str());
                ctx.emit_u(Opcode::StoreAttr, idx);
                Ok(())
            }
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.expr(ctx, value)?;
                self.subscript_key(ctx, slice)?;
                ctx.emit(Opcode::StoreSubscr);
                Ok(())
            }
            ast::Expr::Tuple(ast::ExprTuple { elts, .. })
            | ast::Expr::List(ast::ExprList { elts, .. }) => {
                let star_pos = elts
                    .iter()
                    .position(|e| matches!(e, ast::Expr::Starred(_)));
                match star_pos {
                    None => {
                        ctx.emit_u(Opcode::UnpackSequence, elts.len() as u16);
                        for e in elts {
                            self.store(ctx, e)?;
                        }
                    }
                    Some(pos) => {
                        let after = elts.len() - pos - 1;
                        ctx.emit_u(
                            Opcode::UnpackEx,
                            (pos as u16) | ((after as u16) << 8),
                        );
                        for (i, e) in elts.iter().enumerate() {
                            if i == pos {
                                let ast::Expr::Starred(ast::ExprStarred {
                                    value, ..
                                }) = e
                                else {
                                    unreachable!()
                                };
                                self.store(ctx, value)?;
                            } else {
                                self.store(ctx, e)?;
                            }
                        }
                    }
                }
                Ok(())
            }
            other => self.err("cannot assign to this target", self.line(other.range())),
        }
    }

    fn delete(&mut self, ctx: &mut Ctx, target: &ast::Expr) -> CResult<()> {
        match target {
            ast::Expr::Name(ast::ExprName { id, .. }) => {
                match self.name_kind(ctx.sid, id.as_str()) {
                    NameKind::Local => {
                        let idx = ctx.var_idx(id.as_str());
                        ctx.emit_u(Opcode::DeleteFast, idx);
                    }
                    NameKind::Global => {
                        let idx = ctx.name_idx(id.as_str());
                        ctx.emit_u(Opcode::DeleteGlobal, idx);
                    }
                    NameKind::Name => {
                        let idx = ctx.name_idx(id.as_str());
                        ctx.emit_u(Opcode::DeleteName, idx);
                    }
                    _ => {
                        return self.err(
                            "cannot delete variable captured in closure",
                            self.line(target.range()),
                        );
                    }
                }
                Ok(())
            }
            ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.expr(ctx, value)?;
                let idx = ctx.name_idx(attr.as_str());
                ctx.emit_u(Opcode::DeleteAttr, idx);
                Ok(())
            }
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.expr(ctx, value)?;
                self.subscript_key(ctx, slice)?;
                ctx.emit(Opcode::DeleteSubscr);
                Ok(())
            }
            other => self.err("cannot delete this target", self.line(other.range())),
        }
    }

    // -- Expressions --------------------------------------------------------

    fn expr(&mut self, ctx: &mut Ctx, expr: &ast::Expr) -> CResult<()> {
        match expr {
            ast::Expr::Constant(ast::ExprConstant { value, .. }) => {
                let v = const_value(value);
                let idx = ctx.const_idx(v);
                ctx.emit_u(Opcode::LoadConst, idx);
            }
            ast::Expr::Name(ast::ExprName { id, .. }) => {
                self.load_name(ctx, id.as_str())?;
            }
            ast::Expr::BinOp(ast::ExprBinOp {
                left, op, right, ..
            }) => {
                self.expr(ctx, left)?;
                self.expr(ctx, right)?;
                ctx.emit_u(Opcode::BinaryOp, bin_op(op) as u16);
            }
            ast::Expr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => {
                self.expr(ctx, operand)?;
                let un = match op {
                    ast::UnaryOp::USub => UnOp::Neg,
                    ast::UnaryOp::UAdd => UnOp::Pos,
                    ast::UnaryOp::Invert => UnOp::Invert,
                    ast::UnaryOp::Not => UnOp::Not,
                };
                ctx.emit_u(Opcode::UnaryOp, un as u16);
            }
            ast::Expr::BoolOp(ast::ExprBoolOp { op, values, .. }) => {
                let lend = ctx.new_label();
                let jump = match op {
                    ast::BoolOp::And => Opcode::JumpIfFalseOrPop,
                    ast::BoolOp::Or => Opcode::JumpIfTrueOrPop,
                };
                for (i, v) in values.iter().enumerate() {
                    self.expr(ctx, v)?;
                    if i + 1 < values.len() {
                        ctx.emit_label(jump, lend);
                    }
                }
                ctx.bind(lend);
            }
            ast::Expr::Compare(ast::ExprCompare {
                left,
                ops,
                comparators,
                ..
            }) => {
                self.expr(ctx, left)?;
                if ops.len() == 1 {
                    self.expr(ctx, &comparators[0])?;
                    ctx.emit_u(Opcode::CompareOp, cmp_op(&ops[0]) as u16);
                } else {
                    let lcleanup = ctx.new_label();
                    let lend = ctx.new_label();
                    for (i, (op, comp)) in
                        ops.iter().zip(comparators.iter()).enumerate()
                    {
                        self.expr(ctx, comp)?;
                        if i + 1 < ops.len() {
                            ctx.emit(Opcode::DupTop);
                            ctx.emit(Opcode::RotThree);
                            ctx.emit_u(Opcode::CompareOp, cmp_op(op) as u16);
                            ctx.emit_label(Opcode::JumpIfFalseOrPop, lcleanup);
                        } else {
                            ctx.emit_u(Opcode::CompareOp, cmp_op(op) as u16);
                        }
                    }
                    ctx.emit_label(Opcode::Jump, lend);
                    ctx.bind(lcleanup);
                    ctx.emit(Opcode::RotTwo);
                    ctx.emit(Opcode::PopTop);
                    ctx.bind(lend);
                }
            }
            ast::Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => {
                let lelse = ctx.new_label();
                let lend = ctx.new_label();
                self.expr(ctx, test)?;
                ctx.emit_label(Opcode::PopJumpIfFalse, lelse);
                self.expr(ctx, body)?;
                ctx.emit_label(Opcode::Jump, lend);
                ctx.bind(lelse);
                self.expr(ctx, orelse)?;
                ctx.bind(lend);
            }
            ast::Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.expr(ctx, value)?;
                ctx.emit(Opcode::DupTop);
                self.store(ctx, target)?;
            }
            ast::Expr::Tuple(ast::ExprTuple { elts, .. }) => {
                if elts.iter().any(|e| matches!(e, ast::Expr::Starred(_))) {
                    self.build_spread_list(ctx, elts)?;
                    // Convert through the tuple constructor.
                    let idx = ctx.name_idx("tuple");
                    ctx.emit_u(Opcode::LoadGlobal, idx);
                    ctx.emit(Opcode::RotTwo);
                    ctx.emit_u(Opcode::Call, 1);
                } else {
                    for e in elts {
                        self.expr(ctx, e)?;
                    }
                    ctx.emit_u(Opcode::BuildTuple, elts.len() as u16);
                }
            }
            ast::Expr::List(ast::ExprList { elts, .. }) => {
                if elts.iter().any(|e| matches!(e, ast::Expr::Starred(_))) {
                    self.build_spread_list(ctx, elts)?;
                } else {
                    for e in elts {
                        self.expr(ctx, e)?;
                    }
                    ctx.emit_u(Opcode::BuildList, elts.len() as u16);
                }
            }
            ast::Expr::Set(ast::ExprSet { elts, .. }) => {
                if elts.iter().any(|e| matches!(e, ast::Expr::Starred(_))) {
                    self.build_spread_list(ctx, elts)?;
                    let idx = ctx.name_idx("set");
                    ctx.emit_u(Opcode::LoadGlobal, idx);
                    ctx.emit(Opcode::RotTwo);
                    ctx.emit_u(Opcode::Call, 1);
                } else {
                    for e in elts {
                        self.expr(ctx, e)?;
                    }
                    ctx.emit_u(Opcode::BuildSet, elts.len() as u16);
                }
            }
            ast::Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                self.dict_literal(ctx, keys, values)?;
            }
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.expr(ctx, value)?;
                self.subscript_key(ctx, slice)?;
                ctx.emit(Opcode::BinarySubscr);
            }
            ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.expr(ctx, value)?;
                let idx = ctx.name_idx(attr.as_str());
                ctx.emit_u(Opcode::LoadAttr, idx);
            }
            ast::Expr::Call(call) => self.call(ctx, call)?,
            ast::Expr::Lambda(ast::ExprLambda {
                args, body, range, ..
            }) => {
                self.lambda(ctx, args, body, self.line(*range))?;
            }
            ast::Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            }) => {
                self.comprehension(ctx, CompKind::List, generators, elt, None)?;
            }
            ast::Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            }) => {
                self.comprehension(ctx, CompKind::Set, generators, elt, None)?;
            }
            ast::Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.comprehension(ctx, CompKind::Dict, generators, key, Some(value))?;
            }
            ast::Expr::GeneratorExp(ast::ExprGeneratorExp {
                elt, generators, ..
            }) => {
                // Materialized eagerly, then exposed through an iterator.
                self.comprehension(ctx, CompKind::List, generators, elt, None)?;
                ctx.emit(Opcode::GetIter);
            }
            ast::Expr::Yield(ast::ExprYield { value, .. }) => {
                match value {
                    Some(v) => self.expr(ctx, v)?,
                    None => ctx.emit(Opcode::LoadNone),
                }
                ctx.emit(Opcode::YieldValue);
            }
            ast::Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => {
                // Desugars to a yielding loop over the delegate.
                let lstart = ctx.new_label();
                let lelse = ctx.new_label();
                let lend = ctx.new_label();
                ctx.emit_label(Opcode::SetupLoop, lend);
                self.expr(ctx, value)?;
                ctx.emit(Opcode::GetIter);
                ctx.bind(lstart);
                ctx.emit_label(Opcode::ForIter, lelse);
                ctx.emit(Opcode::YieldValue);
                ctx.emit(Opcode::PopTop);
                ctx.emit_label(Opcode::Jump, lstart);
                ctx.bind(lelse);
                ctx.emit(Opcode::PopBlock);
                ctx.bind(lend);
                ctx.emit(Opcode::LoadNone);
            }
            ast::Expr::Await(ast::ExprAwait { value, .. }) => {
                self.expr(ctx, value)?;
                ctx.emit(Opcode::GetAwaitable);
            }
            ast::Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => {
                if values.is_empty() {
                    let idx = ctx.const_idx(Value::str(""));
                    ctx.emit_u(Opcode::LoadConst, idx);
                } else {
                    for part in values {
                        self.fstring_part(ctx, part)?;
                    }
                    if values.len() > 1 {
                        ctx.emit_u(Opcode::BuildString, values.len() as u16);
                    }
                }
            }
            ast::Expr::FormattedValue(_) => {
                self.fstring_part(ctx, expr)?;
            }
            ast::Expr::Starred(ast::ExprStarred { range, .. }) => {
                return self.err(
                    "starred expression is only valid in assignments and calls",
                    self.line(*range),
                );
            }
            ast::Expr::Slice(ast::ExprSlice { range, .. }) => {
                return self.err(
                    "slice syntax is only valid inside subscripts",
                    self.line(*range),
                );
            }
            other => {
                return self.err(
                    "unsupported expression in this interpreter",
                    self.line(other.range()),
                );
            }
        }
        Ok(())
    }

    /// Build a list from elements where some are `*spread`.
    fn build_spread_list(&mut self, ctx: &mut Ctx, elts: &[ast::Expr]) -> CResult<()> {
        ctx.emit_u(Opcode::BuildList, 0);
        let mut chunk = 0u16;
        for e in elts {
            match e {
                ast::Expr::Starred(ast::ExprStarred { value, .. }) => {
                    if chunk > 0 {
                        ctx.emit_u(Opcode::BuildList, chunk);
                        ctx.emit_u(Opcode::InplaceOp, BinOp::Add as u16);
                        chunk = 0;
                    }
                    self.expr(ctx, value)?;
                    ctx.emit_u(Opcode::InplaceOp, BinOp::Add as u16);
                }
                e => {
                    self.expr(ctx, e)?;
                    chunk += 1;
                }
            }
        }
        if chunk > 0 {
            ctx.emit_u(Opcode::BuildList, chunk);
            ctx.emit_u(Opcode::InplaceOp, BinOp::Add as u16);
        }
        Ok(())
    }

    fn dict_literal(
        &mut self,
        ctx: &mut Ctx,
        keys: &[Option<ast::Expr>],
        values: &[ast::Expr],
    ) -> CResult<()> {
        let has_spread = keys.iter().any(Option::is_none);
        if !has_spread {
            for (k, v) in keys.iter().zip(values) {
                self.expr(ctx, k.as_ref().expect("checked"))?;
                self.expr(ctx, v)?;
            }
            ctx.emit_u(Opcode::BuildMap, keys.len() as u16);
            return Ok(());
        }
        // `{**a, 'k': v}`: fold segments with the dict-merge operator.
        ctx.emit_u(Opcode::BuildMap, 0);
        let mut pending: Vec<(&ast::Expr, &ast::Expr)> = Vec::new();
        for (k, v) in keys.iter().zip(values) {
            match k {
                Some(key) => pending.push((key, v)),
                None => {
                    self.flush_dict_chunk(ctx, &mut pending)?;
                    self.expr(ctx, v)?;
                    ctx.emit_u(Opcode::BinaryOp, BinOp::BitOr as u16);
                }
            }
        }
        self.flush_dict_chunk(ctx, &mut pending)?;
        Ok(())
    }

    fn flush_dict_chunk(
        &mut self,
        ctx: &mut Ctx,
        pending: &mut Vec<(&ast::Expr, &ast::Expr)>,
    ) -> CResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let chunk = pending.len() as u16;
        for (k, v) in pending.drain(..) {
            self.expr(ctx, k)?;
            self.expr(ctx, v)?;
        }
        ctx.emit_u(Opcode::BuildMap, chunk);
        ctx.emit_u(Opcode::BinaryOp, BinOp::BitOr as u16);
        Ok(())
    }

    fn subscript_key(&mut self, ctx: &mut Ctx, slice: &ast::Expr) -> CResult<()> {
        if let ast::Expr::Slice(ast::ExprSlice {
            lower, upper, step, ..
        }) = slice
        {
            match lower {
                Some(e) => self.expr(ctx, e)?,
                None => ctx.emit(Opcode::LoadNone),
            }
            match upper {
                Some(e) => self.expr(ctx, e)?,
                None => ctx.emit(Opcode::LoadNone),
            }
            match step {
                Some(e) => {
                    self.expr(ctx, e)?;
                    ctx.emit_u(Opcode::BuildSlice, 3);
                }
                None => ctx.emit_u(Opcode::BuildSlice, 2),
            }
            Ok(())
        } else {
            self.expr(ctx, slice)
        }
    }

    fn fstring_part(&mut self, ctx: &mut Ctx, part: &ast::Expr) -> CResult<()> {
        match part {
            ast::Expr::Constant(ast::ExprConstant { value, .. }) => {
                let v = const_value(value);
                let idx = ctx.const_idx(v);
                ctx.emit_u(Opcode::LoadConst, idx);
            }
            ast::Expr::FormattedValue(ast::ExprFormattedValue {
                value,
                conversion,
                format_spec,
                ..
            }) => {
                self.expr(ctx, value)?;
                let mut flags: u16 = match conversion {
                    ast::ConversionFlag::Str => 1,
                    ast::ConversionFlag::Repr => 2,
                    ast::ConversionFlag::Ascii => 3,
                    ast::ConversionFlag::None => 0,
                };
                if let Some(spec) = format_spec {
                    self.expr(ctx, spec)?;
                    flags |= 0x4;
                }
                ctx.emit_u(Opcode::FormatValue, flags);
            }
            other => {
                self.expr(ctx, other)?;
                ctx.emit_u(Opcode::FormatValue, 0);
            }
        }
        Ok(())
    }

    fn lambda(
        &mut self,
        ctx: &mut Ctx,
        args: &ast::Arguments,
        body: &ast::Expr,
        first_line: u32,
    ) -> CResult<()> {
        let mut flags: u16 = 0;
        let defaults: Vec<&ast::Expr> = args
            .posonlyargs
            .iter()
            .chain(&args.args)
            .filter_map(|a| a.default.as_deref())
            .collect();
        if !defaults.is_empty() {
            for d in &defaults {
                self.expr(ctx, d)?;
            }
            ctx.emit_u(Opcode::BuildTuple, defaults.len() as u16);
            flags |= 0x01;
        }
        let kw_defaults: Vec<(&str, &ast::Expr)> = args
            .kwonlyargs
            .iter()
            .filter_map(|a| a.default.as_deref().map(|d| (a.def.arg.as_str(), d)))
            .collect();
        if !kw_defaults.is_empty() {
            for (kname, d) in &kw_defaults {
                let idx = ctx.const_idx(Value::str(*kname));
                ctx.emit_u(Opcode::LoadConst, idx);
                self.expr(ctx, d)?;
            }
            ctx.emit_u(Opcode::BuildMap, kw_defaults.len() as u16);
            flags |= 0x02;
        }

        let child = self.next_child(ctx);
        let code = {
            let mut body_ctx = self.new_ctx(child);
            body_ctx.line = first_line;
            let cells = self.scopes.list[child].cells.clone();
            let locals = self.scopes.list[child].locals.clone();
            let n_params = {
                let s = &self.scopes.list[child];
                s.param_count + s.kwonly_count
                    + usize::from(s.has_vararg)
                    + usize::from(s.has_kwarg)
            };
            for (ci, cell_name) in cells.iter().enumerate() {
                if locals.iter().take(n_params).any(|n| n == cell_name) {
                    body_ctx.emit_u(Opcode::MakeCell, ci as u16);
                }
            }
            self.expr(&mut body_ctx, body)?;
            body_ctx.emit(Opcode::ReturnValue);
            let scope = &self.scopes.list[child];
            let mut cf = CodeFlags(CodeFlags::OPTIMIZED | CodeFlags::NEW_LOCALS);
            if scope.has_vararg {
                cf.insert(CodeFlags::VAR_ARGS);
            }
            if scope.has_kwarg {
                cf.insert(CodeFlags::VAR_KEYWORDS);
            }
            if scope.frees.is_empty() {
                cf.insert(CodeFlags::NO_FREE);
            }
            self.assemble(body_ctx, "<lambda>", cf, first_line)?
        };

        let child_frees = self.scopes.list[child].frees.clone();
        if !child_frees.is_empty() {
            for free in &child_frees {
                let deref = self.deref_index(ctx.sid, free).ok_or_else(|| CompileError {
                    message: format!("cannot capture '{free}'"),
                    filename: self.filename.clone(),
                    line: first_line,
                })?;
                ctx.emit_u(Opcode::LoadClosure, deref);
            }
            ctx.emit_u(Opcode::BuildTuple, child_frees.len() as u16);
            flags |= 0x08;
        }
        let code_idx = ctx.const_idx(Value::Code(std::rc::Rc::new(code)));
        ctx.emit_u(Opcode::LoadConst, code_idx);
        ctx.emit_u(Opcode::MakeFunction, flags);
        Ok(())
    }

    fn call(&mut self, ctx: &mut Ctx, call: &ast::ExprCall) -> CResult<()> {
        let ast::ExprCall {
            func,
            args,
            keywords,
            ..
        } = call;
        let has_star = args.iter().any(|a| matches!(a, ast::Expr::Starred(_)));
        let has_kw_spread = keywords.iter().any(|k| k.arg.is_none());

        if has_star || has_kw_spread {
            self.expr(ctx, func)?;
            self.build_spread_list(ctx, args)?;
            if keywords.is_empty() {
                ctx.emit_u(Opcode::CallEx, 0);
            } else {
                // Merge keyword segments into one dict.
                ctx.emit_u(Opcode::BuildMap, 0);
                for k in keywords {
                    match &k.arg {
                        Some(name) => {
                            let idx = ctx.const_idx(Value::str(name.as_str()));
                            ctx.emit_u(Opcode::LoadConst, idx);
                            self.expr(ctx, &k.value)?;
                            ctx.emit_u(Opcode::BuildMap, 1);
                        }
                        None => self.expr(ctx, &k.value)?,
                    }
                    ctx.emit_u(Opcode::BinaryOp, BinOp::BitOr as u16);
                }
                ctx.emit_u(Opcode::CallEx, 1);
            }
            return Ok(());
        }

        if keywords.is_empty() {
            // Bound-method fast path for plain attribute calls.
            if let ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) =
                func.as_ref()
            {
                self.expr(ctx, value)?;
                let idx = ctx.name_idx(attr.as_str());
                ctx.emit_u(Opcode::LoadMethod, idx);
                for a in args {
                    self.expr(ctx, a)?;
                }
                ctx.emit_u(Opcode::CallMethod, args.len() as u16);
                return Ok(());
            }
            self.expr(ctx, func)?;
            for a in args {
                self.expr(ctx, a)?;
            }
            ctx.emit_u(Opcode::Call, args.len() as u16);
            return Ok(());
        }

        self.expr(ctx, func)?;
        for a in args {
            self.expr(ctx, a)?;
        }
        let mut kw_names = Vec::with_capacity(keywords.len());
        for k in keywords {
            let name = k.arg.as_ref().expect("spread handled above");
            kw_names.push(Value::str(name.as_str()));
            self.expr(ctx, &k.value)?;
        }
        let names_idx = ctx.const_idx(Value::tuple(kw_names));
        ctx.emit_u(Opcode::LoadConst, names_idx);
        ctx.emit_u(Opcode::CallKw, (args.len() + keywords.len()) as u16);
        Ok(())
    }

    fn comprehension(
        &mut self,
        ctx: &mut Ctx,
        kind: CompKind,
        generators: &[ast::Comprehension],
        elt: &ast::Expr,
        value: Option<&ast::Expr>,
    ) -> CResult<()> {
        match kind {
            CompKind::List => ctx.emit_u(Opcode::BuildList, 0),
            CompKind::Set => ctx.emit_u(Opcode::BuildSet, 0),
            CompKind::Dict => ctx.emit_u(Opcode::BuildMap, 0),
        }

        let mut ends: Vec<(Label, Label)> = Vec::new();
        for gen in generators {
            if gen.is_async {
                return self.err(
                    "async comprehensions are not supported",
                    self.line(gen.iter.range()),
                );
            }
            let lstart = ctx.new_label();
            let lend = ctx.new_label();
            self.expr(ctx, &gen.iter)?;
            ctx.emit(Opcode::GetIter);
            ctx.bind(lstart);
            ctx.emit_label(Opcode::ForIter, lend);
            self.store(ctx, &gen.target)?;
            for cond in &gen.ifs {
                self.expr(ctx, cond)?;
                ctx.emit_label(Opcode::PopJumpIfFalse, lstart);
            }
            ends.push((lstart, lend));
        }

        // Depth: the accumulator sits under one iterator per active loop.
        let depth = generators.len() as u16 + 1;
        match kind {
            CompKind::List => {
                self.expr(ctx, elt)?;
                ctx.emit_u(Opcode::ListAppend, depth);
            }
            CompKind::Set => {
                self.expr(ctx, elt)?;
                ctx.emit_u(Opcode::SetAdd, depth);
            }
            CompKind::Dict => {
                self.expr(ctx, elt)?;
                self.expr(ctx, value.expect("dict comprehension value"))?;
                ctx.emit_u(Opcode::MapAdd, depth);
            }
        }

        for (lstart, lend) in ends.into_iter().rev() {
            ctx.emit_label(Opcode::Jump, lstart);
            ctx.bind(lend);
        }
        Ok(())
    }

    // -- Assembly -----------------------------------------------------------

    fn assemble(
        &mut self,
        mut ctx: Ctx,
        name: &str,
        flags: CodeFlags,
        first_line: u32,
    ) -> CResult<CodeObject> {
        optimize(
            &mut ctx.instrs,
            &mut ctx.labels,
            &ctx.consts,
            &ctx.names,
            self.scopes.len_shadowed,
        );

        // Layout.
        let mut offsets = Vec::with_capacity(ctx.instrs.len() + 1);
        let mut off = 0usize;
        for instr in &ctx.instrs {
            offsets.push(off);
            off += if instr.op.has_arg() { 3 } else { 1 };
        }
        offsets.push(off);

        let mut code = Vec::with_capacity(off);
        let mut line_starts: Vec<(u32, u32)> = Vec::new();
        for instr in &ctx.instrs {
            if line_starts.last().map(|&(_, l)| l) != Some(instr.line) {
                line_starts.push((code.len() as u32, instr.line));
            }
            code.push(instr.op as u8);
            let raw = match instr.arg {
                IArg::None => None,
                IArg::U(v) => Some(v),
                IArg::Pair(a, b) => Some(u16::from(a) | (u16::from(b) << 8)),
                IArg::L(label) => {
                    let target = ctx.labels[label].expect("unbound label");
                    Some(offsets[target] as u16)
                }
            };
            if let Some(v) = raw {
                code.extend_from_slice(&v.to_le_bytes());
            }
        }

        let mut line_no_tab = Vec::with_capacity(line_starts.len());
        for (i, &(start, line)) in line_starts.iter().enumerate() {
            let end = line_starts
                .get(i + 1)
                .map_or(code.len() as u32, |&(next, _)| next);
            line_no_tab.push((start, end, line));
        }

        let scope = &self.scopes.list[ctx.sid];
        let stack_size = max_stack_depth(&code);
        Ok(CodeObject {
            name: PyStr::new(name),
            filename: PyStr::new(&self.filename),
            first_line,
            code,
            constants: ctx.consts,
            names: ctx.names,
            var_names: ctx.var_names,
            free_vars: scope.frees.iter().map(|s| PyStr::new(s)).collect(),
            cell_vars: scope.cells.iter().map(|s| PyStr::new(s)).collect(),
            arg_count: scope.param_count,
            kw_only_arg_count: scope.kwonly_count,
            flags,
            stack_size,
            line_no_tab,
        })
    }
}

enum CompKind {
    List,
    Set,
    Dict,
}

fn bin_op(op: &ast::Operator) -> BinOp {
    match op {
        ast::Operator::Add => BinOp::Add,
        ast::Operator::Sub => BinOp::Sub,
        ast::Operator::Mult => BinOp::Mul,
        ast::Operator::MatMult => BinOp::MatMul,
        ast::Operator::Div => BinOp::TrueDiv,
        ast::Operator::Mod => BinOp::Mod,
        ast::Operator::Pow => BinOp::Pow,
        ast::Operator::LShift => BinOp::LShift,
        ast::Operator::RShift => BinOp::RShift,
        ast::Operator::BitOr => BinOp::BitOr,
        ast::Operator::BitXor => BinOp::BitXor,
        ast::Operator::BitAnd => BinOp::BitAnd,
        ast::Operator::FloorDiv => BinOp::FloorDiv,
    }
}

fn cmp_op(op: &ast::CmpOp) -> CmpOp {
    match op {
        ast::CmpOp::Eq => CmpOp::Eq,
        ast::CmpOp::NotEq => CmpOp::Ne,
        ast::CmpOp::Lt => CmpOp::Lt,
        ast::CmpOp::LtE => CmpOp::Le,
        ast::CmpOp::Gt => CmpOp::Gt,
        ast::CmpOp::GtE => CmpOp::Ge,
        ast::CmpOp::Is => CmpOp::Is,
        ast::CmpOp::IsNot => CmpOp::IsNot,
        ast::CmpOp::In => CmpOp::In,
        ast::CmpOp::NotIn => CmpOp::NotIn,
    }
}

fn const_value(c: &ast::Constant) -> Value {
    match c {
        ast::Constant::None => Value::None,
        ast::Constant::Bool(b) => Value::Bool(*b),
        ast::Constant::Str(s) => Value::str(s),
        ast::Constant::Bytes(b) => Value::bytes(b.clone()),
        ast::Constant::Int(i) => Value::from_bigint(i.clone()),
        ast::Constant::Float(f) => Value::Float(*f),
        ast::Constant::Complex { real, imag } => Value::complex(*real, *imag),
        ast::Constant::Tuple(items) => {
            Value::tuple(items.iter().map(const_value).collect())
        }
        // Ellipsis has no first-class value here; None is the stand-in.
        ast::Constant::Ellipsis => Value::None,
    }
}

// ---------------------------------------------------------------------------
// Peephole specialization
// ---------------------------------------------------------------------------

/// Rewrite base instruction shapes into the specialized opcodes. Label
/// targets block any fusion across them, so observable control flow is
/// untouched; every rewrite computes the identical result.
fn optimize(
    instrs: &mut Vec<Instr>,
    labels: &mut [Option<usize>],
    consts: &[Value],
    names: &[PyStr],
    len_shadowed: bool,
) {
    let targets: HashSet<usize> = labels.iter().flatten().copied().collect();
    let mut out: Vec<Instr> = Vec::with_capacity(instrs.len());
    let mut map = vec![0usize; instrs.len() + 1];

    let u_arg = |instr: &Instr| -> Option<u16> {
        match instr.arg {
            IArg::U(v) => Some(v),
            _ => None,
        }
    };

    let mut i = 0;
    while i < instrs.len() {
        map[i] = out.len();
        let line = instrs[i].line;
        let free = |k: usize| !targets.contains(&k);

        // x += 1 / x -= 1 on a fast local.
        if i + 3 < instrs.len() && free(i + 1) && free(i + 2) && free(i + 3) {
            let window = &instrs[i..i + 4];
            if window[0].op == Opcode::LoadFast
                && window[1].op == Opcode::LoadConst
                && window[2].op == Opcode::InplaceOp
                && window[3].op == Opcode::StoreFast
                && u_arg(&window[0]) == u_arg(&window[3])
            {
                let is_one = u_arg(&window[1])
                    .and_then(|c| consts.get(c as usize))
                    .is_some_and(|c| matches!(c, Value::Int(1)));
                let delta = u_arg(&window[2]).and_then(|a| match a {
                    a if a == BinOp::Add as u16 => Some(Opcode::IncrementFast),
                    a if a == BinOp::Sub as u16 => Some(Opcode::DecrementFast),
                    _ => None,
                });
                if let (true, Some(op)) = (is_one, delta) {
                    for j in i..i + 4 {
                        map[j] = out.len();
                    }
                    out.push(Instr {
                        op,
                        arg: window[0].arg,
                        line,
                    });
                    i += 4;
                    continue;
                }
            }
        }

        // len(x) through the never-shadowed global builtin becomes an inline
        // length read.
        if !len_shadowed && i + 2 < instrs.len() && free(i + 1) && free(i + 2) {
            let window = &instrs[i..i + 3];
            let loads_len = window[0].op == Opcode::LoadGlobal
                && u_arg(&window[0])
                    .and_then(|n| names.get(n as usize))
                    .is_some_and(|n| n.as_str() == "len");
            let single_push = matches!(
                window[1].op,
                Opcode::LoadFast
                    | Opcode::LoadGlobal
                    | Opcode::LoadName
                    | Opcode::LoadConst
                    | Opcode::LoadDeref
            );
            if loads_len
                && single_push
                && window[2].op == Opcode::Call
                && u_arg(&window[2]) == Some(1)
            {
                let operand = window[1];
                for j in i..i + 3 {
                    map[j] = out.len();
                }
                out.push(operand);
                out.push(Instr {
                    op: Opcode::LenGeneric,
                    arg: IArg::None,
                    line,
                });
                i += 3;
                continue;
            }
        }

        // Fused compare-and-branch.
        if i + 1 < instrs.len() && free(i + 1) {
            let a = instrs[i];
            let b = instrs[i + 1];
            if a.op == Opcode::CompareOp && b.op == Opcode::PopJumpIfFalse {
                let fused = match u_arg(&a) {
                    Some(x) if x == CmpOp::Lt as u16 => Some(Opcode::CompareLtJump),
                    Some(x) if x == CmpOp::Le as u16 => Some(Opcode::CompareLeJump),
                    Some(x) if x == CmpOp::Gt as u16 => Some(Opcode::CompareGtJump),
                    Some(x) if x == CmpOp::Ge as u16 => Some(Opcode::CompareGeJump),
                    Some(x) if x == CmpOp::Eq as u16 => Some(Opcode::CompareEqJump),
                    Some(x) if x == CmpOp::Ne as u16 => Some(Opcode::CompareNeJump),
                    _ => None,
                };
                if let Some(op) = fused {
                    map[i + 1] = out.len();
                    out.push(Instr {
                        op,
                        arg: b.arg,
                        line,
                    });
                    i += 2;
                    continue;
                }
            }

            // Two-register superinstructions with 8-bit operands.
            let pair = |x: Option<u16>, y: Option<u16>| -> Option<(u8, u8)> {
                match (x, y) {
                    (Some(x), Some(y)) if x < 256 && y < 256 => {
                        Some((x as u8, y as u8))
                    }
                    _ => None,
                }
            };
            let fused = match (a.op, b.op) {
                (Opcode::LoadFast, Opcode::LoadFast) => {
                    pair(u_arg(&a), u_arg(&b)).map(|p| (Opcode::LoadFastLoadFast, p))
                }
                (Opcode::LoadFast, Opcode::LoadConst) => {
                    pair(u_arg(&a), u_arg(&b)).map(|p| (Opcode::LoadFastLoadConst, p))
                }
                (Opcode::LoadConst, Opcode::LoadFast) => {
                    pair(u_arg(&a), u_arg(&b)).map(|p| (Opcode::LoadConstLoadFast, p))
                }
                (Opcode::StoreFast, Opcode::LoadFast) => {
                    pair(u_arg(&a), u_arg(&b)).map(|p| (Opcode::StoreFastLoadFast, p))
                }
                (Opcode::LoadGlobal, Opcode::LoadFast) => {
                    pair(u_arg(&a), u_arg(&b)).map(|p| (Opcode::LoadGlobalLoadFast, p))
                }
                _ => None,
            };
            if let Some((op, (x, y))) = fused {
                map[i + 1] = out.len();
                out.push(Instr {
                    op,
                    arg: IArg::Pair(x, y),
                    line,
                });
                i += 2;
                continue;
            }
        }

        // Single-instruction specializations.
        let instr = instrs[i];
        let replacement = match (instr.op, u_arg(&instr)) {
            (Opcode::LoadFast, Some(0)) => Some(Opcode::LoadFast0),
            (Opcode::LoadFast, Some(1)) => Some(Opcode::LoadFast1),
            (Opcode::LoadFast, Some(2)) => Some(Opcode::LoadFast2),
            (Opcode::LoadFast, Some(3)) => Some(Opcode::LoadFast3),
            (Opcode::StoreFast, Some(0)) => Some(Opcode::StoreFast0),
            (Opcode::StoreFast, Some(1)) => Some(Opcode::StoreFast1),
            (Opcode::StoreFast, Some(2)) => Some(Opcode::StoreFast2),
            (Opcode::StoreFast, Some(3)) => Some(Opcode::StoreFast3),
            (Opcode::BuildList, Some(0)) => Some(Opcode::LoadEmptyList),
            (Opcode::BuildTuple, Some(0)) => Some(Opcode::LoadEmptyTuple),
            (Opcode::BuildMap, Some(0)) => Some(Opcode::LoadEmptyDict),
            (Opcode::LoadConst, Some(c)) => match consts.get(c as usize) {
                Some(Value::None) => Some(Opcode::LoadNone),
                Some(Value::Bool(true)) => Some(Opcode::LoadTrue),
                Some(Value::Bool(false)) => Some(Opcode::LoadFalse),
                Some(Value::Int(0)) => Some(Opcode::LoadZero),
                Some(Value::Int(1)) => Some(Opcode::LoadOne),
                _ => None,
            },
            _ => None,
        };
        match replacement {
            Some(op) => out.push(Instr {
                op,
                arg: IArg::None,
                line,
            }),
            None => out.push(instr),
        }
        i += 1;
    }
    map[instrs.len()] = out.len();

    for label in labels.iter_mut().flatten() {
        *label = map[*label];
    }
    *instrs = out;
}
