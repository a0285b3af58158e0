//! AST to `CodeObject` compilation (spec §4.4).
//!
//! Calling convention used throughout (a compiler-internal decision, since
//! spec.md fixes the opcode set but not stack layouts): for a call site,
//! the callable is pushed first, then positional arguments in source
//! order, then `CALL_FUNCTION n` pops `n` args and the callable and pushes
//! the result. `MAKE_FUNCTION` always expects `[code, defaults_tuple,
//! kwdefaults_dict, closure_tuple]` on the stack (empty tuple/dict for the
//! pieces a function doesn't need) so its shape never varies.

use crate::error::{CompileError, CompileErrorType};
use crate::mode::Mode;
use crate::symboltable::{build_symbol_table, SymbolTable};
use indexmap::IndexSet;
use protopython_bytecode::{CodeFlags, CodeObject, Constant as BcConstant, NameScope, Opcode};
use protopython_common::{Location, StringPool};
use protopython_parser::{
    self as ast, Alias, BoolOpKind, CmpOp, Comprehension, Constant as AstConstant, ExceptHandler, Expr, ExprKind,
    Ident, Operator, Params, Stmt, StmtKind, UnaryOpKind, WithItem,
};
use std::sync::Arc;

type CResult<T> = Result<T, CompileError>;

struct LoopCtx {
    continue_target: usize,
    break_jumps: Vec<usize>,
}

/// One function/module/class body being compiled. Nested defs spawn a new
/// `Compiler` and fold the finished `CodeObject` back in as a constant.
pub struct Compiler {
    code: CodeObject,
    symtab: SymbolTable,
    is_module: bool,
    is_class: bool,
    in_function: bool,
    loops: Vec<LoopCtx>,
    /// Names visible to closures nested inside this scope: this scope's
    /// own locals plus anything it itself already closes over. Class
    /// bodies do not contribute to this set for their nested methods'
    /// *grandchildren*, matching ordinary Python scoping.
    closure_sources: IndexSet<Ident>,
    /// Shared with every nested `Compiler` spawned for this compilation
    /// (closures, class bodies) so `co_names`/`co_varnames`/`co_freevars`/
    /// `co_cellvars` across the whole unit resolve to the same `InternedStr`
    /// identities as the VM's attribute maps and globals dict use for the
    /// same text — an explicit caller-supplied pool rather than a
    /// process-wide one, matching how `Space` owns its own (spec §4.1).
    strings: Arc<StringPool>,
}

pub fn compile_program(source: &str, filename: &str, mode: Mode, strings: Arc<StringPool>) -> CResult<CodeObject> {
    match mode {
        Mode::Exec | Mode::Single => {
            let module = ast::parse_module(source)?;
            let params = Params::default();
            let symtab = build_symbol_table(&module.body, &params, true, false);
            let mut compiler = Compiler::new(filename, "<module>", symtab, true, false, false, IndexSet::new(), strings);
            if mode == Mode::Single {
                compiler.compile_single_mode_body(&module.body)?;
            } else {
                compiler.compile_stmts(&module.body)?;
            }
            let end_loc = Location::new(compiler.code.first_line_number, 0);
            compiler.emit_load_const(BcConstant::None, end_loc);
            compiler.code.emit(Opcode::RETURN_VALUE, 0, end_loc);
            Ok(compiler.code)
        }
        Mode::Eval => {
            let expr = ast::parse_expression(source)?;
            let params = Params::default();
            let symtab = build_symbol_table(&[], &params, true, false);
            let mut compiler = Compiler::new(filename, "<eval>", symtab, true, false, false, IndexSet::new(), strings);
            let loc = expr.location;
            compiler.compile_expr(&expr)?;
            compiler.code.emit(Opcode::RETURN_VALUE, 0, loc);
            Ok(compiler.code)
        }
    }
}

impl Compiler {
    fn new(
        filename: &str,
        name: &str,
        symtab: SymbolTable,
        is_module: bool,
        is_class: bool,
        in_function: bool,
        closure_sources: IndexSet<Ident>,
        strings: Arc<StringPool>,
    ) -> Self {
        Compiler {
            code: CodeObject::new(filename.to_string(), name, &strings),
            symtab,
            is_module,
            is_class,
            in_function,
            loops: Vec::new(),
            closure_sources,
            strings,
        }
    }

    fn loc0(&self) -> Location {
        Location::new(self.code.first_line_number, 0)
    }

    fn compile_single_mode_body(&mut self, body: &[Stmt]) -> CResult<()> {
        if let Some((last, init)) = body.split_last() {
            if let StmtKind::Expr(e) = &last.kind {
                self.compile_stmts(init)?;
                self.compile_expr(e)?;
                self.code.emit(Opcode::PRINT_EXPR, 0, last.location);
                return Ok(());
            }
        }
        self.compile_stmts(body)
    }

    // ---- emission helpers ----

    fn emit_load_const(&mut self, c: BcConstant, loc: Location) {
        let idx = self.code.add_const(c);
        self.code.emit(Opcode::LOAD_CONST, idx, loc);
    }

    fn emit_jump(&mut self, op: Opcode, loc: Location) -> usize {
        self.code.emit(op, -1, loc)
    }

    fn patch_jump_here(&mut self, pc: usize) {
        let here = self.code.len() as i32;
        self.code.patch_arg(pc, here);
    }

    fn patch_jump_to(&mut self, pc: usize, target: usize) {
        self.code.patch_arg(pc, target as i32);
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn name_scope(&self, name: &str) -> NameScope {
        self.symtab.scopes.get(name).copied().unwrap_or(NameScope::Builtin)
    }

    fn emit_load_name(&mut self, name: &str, loc: Location) {
        let scope = self.name_scope(name);
        if self.is_module || self.is_class {
            if matches!(scope, NameScope::Free) {
                let idx = self.deref_index(name);
                self.code.emit(Opcode::LOAD_DEREF, idx, loc);
                return;
            }
            let idx = self.code.intern_name(name, &self.strings);
            self.code.emit(Opcode::LOAD_NAME, idx, loc);
            return;
        }
        match scope {
            NameScope::Local if self.is_cellvar(name) => {
                let idx = self.deref_index(name);
                self.code.emit(Opcode::LOAD_DEREF, idx, loc);
            }
            NameScope::Local => {
                let idx = self.varname_index(name);
                self.code.emit(Opcode::LOAD_FAST, idx, loc);
            }
            NameScope::Free => {
                let idx = self.deref_index(name);
                self.code.emit(Opcode::LOAD_DEREF, idx, loc);
            }
            NameScope::Global | NameScope::Builtin => {
                let idx = self.code.intern_name(name, &self.strings);
                self.code.emit(Opcode::LOAD_GLOBAL, idx, loc);
            }
        }
    }

    fn emit_store_name(&mut self, name: &str, loc: Location) {
        let scope = self.name_scope(name);
        if self.is_module || self.is_class {
            if matches!(scope, NameScope::Free) {
                let idx = self.deref_index(name);
                self.code.emit(Opcode::STORE_DEREF, idx, loc);
                return;
            }
            let idx = self.code.intern_name(name, &self.strings);
            self.code.emit(Opcode::STORE_NAME, idx, loc);
            return;
        }
        match scope {
            NameScope::Local if self.is_cellvar(name) => {
                let idx = self.deref_index(name);
                self.code.emit(Opcode::STORE_DEREF, idx, loc);
            }
            NameScope::Local => {
                let idx = self.varname_index(name);
                self.code.emit(Opcode::STORE_FAST, idx, loc);
            }
            NameScope::Free => {
                let idx = self.deref_index(name);
                self.code.emit(Opcode::STORE_DEREF, idx, loc);
            }
            NameScope::Global | NameScope::Builtin => {
                let idx = self.code.intern_name(name, &self.strings);
                self.code.emit(Opcode::STORE_GLOBAL, idx, loc);
            }
        }
    }

    fn emit_delete_name(&mut self, name: &str, loc: Location) {
        let scope = self.name_scope(name);
        if self.is_module || self.is_class {
            let idx = self.code.intern_name(name, &self.strings);
            self.code.emit(Opcode::DELETE_NAME, idx, loc);
            return;
        }
        match scope {
            NameScope::Local if self.is_cellvar(name) => {
                let idx = self.deref_index(name);
                self.code.emit(Opcode::DELETE_DEREF, idx, loc);
            }
            NameScope::Local => {
                let idx = self.varname_index(name);
                self.code.emit(Opcode::DELETE_FAST, idx, loc);
            }
            NameScope::Free => {
                let idx = self.deref_index(name);
                self.code.emit(Opcode::DELETE_DEREF, idx, loc);
            }
            NameScope::Global | NameScope::Builtin => {
                let idx = self.code.intern_name(name, &self.strings);
                self.code.emit(Opcode::DELETE_GLOBAL, idx, loc);
            }
        }
    }

    fn varname_index(&mut self, name: &str) -> i32 {
        if let Some(i) = self.code.co_varnames.iter().position(|n| n.as_str() == name) {
            return i as i32;
        }
        self.code.co_varnames.push(self.strings.intern(name));
        (self.code.co_varnames.len() - 1) as i32
    }

    fn is_cellvar(&self, name: &str) -> bool {
        self.code.co_cellvars.iter().any(|n| n.as_str() == name)
    }

    /// `LOAD_DEREF`/`STORE_DEREF`/`DELETE_DEREF`/`LOAD_CLOSURE` all index into
    /// one conceptual array: this frame's cellvars, then its freevars (the
    /// same layout CPython uses pre-3.11). Appends to `co_freevars` the first
    /// time a name is referenced this way.
    fn deref_index(&mut self, name: &str) -> i32 {
        if let Some(i) = self.code.co_cellvars.iter().position(|n| n.as_str() == name) {
            return i as i32;
        }
        let offset = self.code.co_cellvars.len();
        if let Some(i) = self.code.co_freevars.iter().position(|n| n.as_str() == name) {
            return (offset + i) as i32;
        }
        self.code.co_freevars.push(self.strings.intern(name));
        (offset + self.code.co_freevars.len() - 1) as i32
    }

    /// For every name this (already-built) nested symbol table left
    /// classified `Builtin` (unbound locally), check whether an enclosing
    /// scope can supply it as a closure variable; if so reclassify it
    /// `Free` here and register the requirement with the enclosing scope
    /// (a cellvar if this is the immediate enclosing scope, a pass-through
    /// freevar if the binder is further out).
    fn resolve_free_variables(&mut self, enclosing: &mut Compiler) {
        let candidates: Vec<Ident> = self
            .symtab
            .scopes
            .iter()
            .filter(|(_, s)| matches!(s, NameScope::Builtin))
            .map(|(n, _)| n.clone())
            .collect();
        for name in candidates {
            if enclosing.closure_sources.contains(&name) {
                self.symtab.scopes.insert(name.clone(), NameScope::Free);
                if !self.code.co_freevars.iter().any(|n| n.as_str() == name) {
                    self.code.co_freevars.push(self.strings.intern(&name));
                }
                if enclosing.is_local_here(&name) {
                    enclosing.mark_cellvar(&name);
                } else {
                    // Pass-through: the enclosing scope itself must also
                    // expose this name as a freevar so MAKE_FUNCTION can
                    // thread the cell further down the chain.
                    enclosing.symtab.scopes.insert(name.clone(), NameScope::Free);
                    enclosing.closure_sources.insert(name.clone());
                    if !enclosing.code.co_freevars.iter().any(|n| n.as_str() == name) {
                        enclosing.code.co_freevars.push(enclosing.strings.intern(&name));
                    }
                }
            }
        }
    }

    fn is_local_here(&self, name: &str) -> bool {
        matches!(self.symtab.scopes.get(name), Some(NameScope::Local))
    }

    /// Registers `name` as a cellvar this scope must allocate, and records
    /// it as a closure source so further-nested scopes can resolve it too.
    /// Must run before any statement compiles that might read/write `name`,
    /// so its load/store sites consistently use `LOAD_DEREF`/`STORE_DEREF`
    /// instead of `LOAD_FAST`/`STORE_FAST` (see `promote_required_cellvars`).
    fn mark_cellvar(&mut self, name: &str) {
        if !self.code.co_cellvars.iter().any(|n| n.as_str() == name) {
            self.code.co_cellvars.push(self.strings.intern(name));
        }
        self.closure_sources.insert(name.to_string());
    }

    /// Pre-pass: before compiling `body`'s own statements, find every name
    /// nested scopes (at any depth) need from `body`'s own locals, and
    /// promote those to cellvars up front. Without this, a name read via
    /// `LOAD_FAST` earlier in `body` and only later closed over by a nested
    /// `def` would desync from the cell a closure mutates through
    /// `STORE_DEREF`.
    fn promote_required_cellvars(&mut self, body: &[Stmt]) {
        let needed = names_required_by_nested_scopes(body);
        for name in needed {
            if matches!(self.symtab.scopes.get(&name), Some(NameScope::Local)) {
                self.mark_cellvar(&name);
            }
        }
    }

    // ---- statement sequences ----

    fn compile_stmts(&mut self, stmts: &[Stmt]) -> CResult<()> {
        for s in stmts {
            self.compile_stmt(s)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> CResult<()> {
        let loc = stmt.location;
        match &stmt.kind {
            StmtKind::Pass => {}
            StmtKind::Expr(e) => {
                self.compile_expr(e)?;
                self.code.emit(Opcode::POP_TOP, 0, loc);
            }
            StmtKind::Assign { targets, value } => {
                self.compile_expr(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.code.emit(Opcode::DUP_TOP, 0, loc);
                    }
                    self.compile_assign_target(target)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.compile_aug_assign(target, *op, value, loc)?,
            StmtKind::AnnAssign { target, value, .. } => {
                if let Some(v) = value {
                    self.compile_expr(v)?;
                    self.compile_assign_target(target)?;
                }
            }
            StmtKind::Return(value) => {
                if !self.in_function {
                    return Err(CompileError::new(CompileErrorType::ReturnOutsideFunction, loc, ""));
                }
                match value {
                    Some(v) => self.compile_expr(v)?,
                    None => self.emit_load_const(BcConstant::None, loc),
                }
                self.code.emit(Opcode::RETURN_VALUE, 0, loc);
            }
            StmtKind::Delete(targets) => {
                for t in targets {
                    self.compile_delete_target(t)?;
                }
            }
            StmtKind::If { test, body, orelse } => self.compile_if(test, body, orelse)?,
            StmtKind::While { test, body, orelse } => self.compile_while(test, body, orelse)?,
            StmtKind::For { target, iter, body, orelse, .. } => self.compile_for(target, iter, body, orelse)?,
            StmtKind::Try { body, handlers, orelse, finalbody } => {
                self.compile_try(body, handlers, orelse, finalbody)?
            }
            StmtKind::With { items, body, .. } => self.compile_with(items, body)?,
            StmtKind::Raise { exc, cause } => self.compile_raise(exc, cause, loc)?,
            StmtKind::Assert { test, msg } => self.compile_assert(test, msg, loc)?,
            StmtKind::Import(aliases) => self.compile_import(aliases, loc),
            StmtKind::ImportFrom { module, names, level } => {
                self.compile_import_from(module.as_deref(), names, *level, loc)
            }
            StmtKind::Global(_) | StmtKind::Nonlocal(_) => {}
            StmtKind::Break => {
                if self.loops.is_empty() {
                    return Err(CompileError::new(CompileErrorType::BreakOutsideLoop, loc, ""));
                }
                let pc = self.emit_jump(Opcode::JUMP_ABSOLUTE, loc);
                self.loops.last_mut().unwrap().break_jumps.push(pc);
            }
            StmtKind::Continue => {
                if self.loops.is_empty() {
                    return Err(CompileError::new(CompileErrorType::ContinueOutsideLoop, loc, ""));
                }
                let target = self.loops.last().unwrap().continue_target;
                let pc = self.emit_jump(Opcode::JUMP_ABSOLUTE, loc);
                self.patch_jump_to(pc, target);
            }
            StmtKind::FunctionDef { name, params, body, decorators, is_async, .. } => {
                self.compile_function_def(name, params, body, decorators, *is_async, loc)?
            }
            StmtKind::ClassDef { name, bases, keywords, body, decorators } => {
                self.compile_class_def(name, bases, keywords, body, decorators, loc)?
            }
        }
        Ok(())
    }

    // ---- assignment / deletion targets ----

    fn compile_assign_target(&mut self, target: &Expr) -> CResult<()> {
        let loc = target.location;
        match &target.kind {
            ExprKind::Name(n) => self.emit_store_name(n, loc),
            ExprKind::Attribute { value, attr } => {
                self.compile_expr(value)?;
                self.code.emit(Opcode::ROT_TWO, 0, loc);
                let idx = self.code.intern_name(attr, &self.strings);
                self.code.emit(Opcode::STORE_ATTR, idx, loc);
            }
            ExprKind::Subscript { value, slice } => {
                self.compile_expr(value)?;
                self.compile_expr(slice)?;
                self.code.emit(Opcode::ROT_THREE, 0, loc);
                self.code.emit(Opcode::STORE_SUBSCR, 0, loc);
            }
            ExprKind::Tuple(elts) | ExprKind::List(elts) => self.compile_unpack_targets(elts, loc)?,
            ExprKind::Starred(inner) => self.compile_assign_target(inner)?,
            _ => {
                return Err(CompileError::new(
                    CompileErrorType::Parse(protopython_parser::ParseErrorType::InvalidSyntax(
                        "cannot assign to this expression".into(),
                    )),
                    loc,
                    "",
                ))
            }
        }
        Ok(())
    }

    fn compile_unpack_targets(&mut self, elts: &[Expr], loc: Location) -> CResult<()> {
        if let Some(star_pos) = elts.iter().position(|e| matches!(e.kind, ExprKind::Starred(_))) {
            let before = star_pos as i32;
            let after = (elts.len() - star_pos - 1) as i32;
            self.code.emit(Opcode::UNPACK_EX, before | (after << 8), loc);
        } else {
            self.code.emit(Opcode::UNPACK_SEQUENCE, elts.len() as i32, loc);
        }
        for e in elts {
            self.compile_assign_target(e)?;
        }
        Ok(())
    }

    fn compile_delete_target(&mut self, target: &Expr) -> CResult<()> {
        let loc = target.location;
        match &target.kind {
            ExprKind::Name(n) => self.emit_delete_name(n, loc),
            ExprKind::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let idx = self.code.intern_name(attr, &self.strings);
                self.code.emit(Opcode::DELETE_ATTR, idx, loc);
            }
            ExprKind::Subscript { value, slice } => {
                self.compile_expr(value)?;
                self.compile_expr(slice)?;
                self.code.emit(Opcode::DELETE_SUBSCR, 0, loc);
            }
            ExprKind::Tuple(elts) | ExprKind::List(elts) => {
                for e in elts {
                    self.compile_delete_target(e)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn compile_aug_assign(&mut self, target: &Expr, op: Operator, value: &Expr, loc: Location) -> CResult<()> {
        match &target.kind {
            ExprKind::Name(n) => {
                self.emit_load_name(n, loc);
                self.compile_expr(value)?;
                self.code.emit(inplace_opcode(op), 0, loc);
                self.emit_store_name(n, loc);
            }
            ExprKind::Attribute { value: obj, attr } => {
                self.compile_expr(obj)?;
                self.code.emit(Opcode::DUP_TOP, 0, loc);
                let idx = self.code.intern_name(attr, &self.strings);
                self.code.emit(Opcode::LOAD_ATTR, idx, loc);
                self.compile_expr(value)?;
                self.code.emit(inplace_opcode(op), 0, loc);
                self.code.emit(Opcode::ROT_TWO, 0, loc);
                self.code.emit(Opcode::STORE_ATTR, idx, loc);
            }
            ExprKind::Subscript { value: obj, slice } => {
                self.compile_expr(obj)?;
                self.compile_expr(slice)?;
                self.code.emit(Opcode::DUP_TOP_TWO, 0, loc);
                self.code.emit(Opcode::BINARY_SUBSCR, 0, loc);
                self.compile_expr(value)?;
                self.code.emit(inplace_opcode(op), 0, loc);
                self.code.emit(Opcode::ROT_THREE, 0, loc);
                self.code.emit(Opcode::STORE_SUBSCR, 0, loc);
            }
            _ => {}
        }
        Ok(())
    }

    // ---- control flow ----

    fn compile_if(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CResult<()> {
        let loc = test.location;
        self.compile_expr(test)?;
        let jump_else = self.emit_jump(Opcode::POP_JUMP_IF_FALSE, loc);
        self.compile_stmts(body)?;
        if orelse.is_empty() {
            self.patch_jump_here(jump_else);
        } else {
            let jump_end = self.emit_jump(Opcode::JUMP_ABSOLUTE, loc);
            self.patch_jump_here(jump_else);
            self.compile_stmts(orelse)?;
            self.patch_jump_here(jump_end);
        }
        Ok(())
    }

    fn compile_while(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CResult<()> {
        let loc = test.location;
        let test_pc = self.here();
        self.compile_expr(test)?;
        let exit_jump = self.emit_jump(Opcode::POP_JUMP_IF_FALSE, loc);
        self.loops.push(LoopCtx { continue_target: test_pc, break_jumps: Vec::new() });
        self.compile_stmts(body)?;
        self.code.emit(Opcode::JUMP_ABSOLUTE, test_pc as i32, loc);
        let ctx = self.loops.pop().unwrap();
        self.patch_jump_here(exit_jump);
        self.compile_stmts(orelse)?;
        let end = self.here();
        for pc in ctx.break_jumps {
            self.patch_jump_to(pc, end);
        }
        Ok(())
    }

    fn compile_for(&mut self, target: &Expr, iter: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CResult<()> {
        let loc = iter.location;
        self.compile_expr(iter)?;
        self.code.emit(Opcode::GET_ITER, 0, loc);
        let loop_pc = self.here();
        let for_iter_pc = self.emit_jump(Opcode::FOR_ITER, loc);
        self.compile_assign_target(target)?;
        self.loops.push(LoopCtx { continue_target: loop_pc, break_jumps: Vec::new() });
        self.compile_stmts(body)?;
        self.code.emit(Opcode::JUMP_ABSOLUTE, loop_pc as i32, loc);
        let ctx = self.loops.pop().unwrap();
        self.patch_jump_here(for_iter_pc);
        self.compile_stmts(orelse)?;
        let end = self.here();
        for pc in ctx.break_jumps {
            self.patch_jump_to(pc, end);
        }
        Ok(())
    }

    /// `try`/`except`/`else`/`finally`. Handler type matching is ordinary
    /// bytecode calling the `isinstance` builtin, not a dedicated opcode:
    /// the block stack only needs to know where the handler chain starts.
    fn compile_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> CResult<()> {
        let loc = self.loc0();
        if !finalbody.is_empty() {
            let setup = self.emit_jump(Opcode::SETUP_FINALLY, loc);
            self.compile_try_core(body, handlers, orelse)?;
            self.code.emit(Opcode::POP_BLOCK, 0, loc);
            self.compile_stmts(finalbody)?;
            let jump_end = self.emit_jump(Opcode::JUMP_ABSOLUTE, loc);
            self.patch_jump_here(setup);
            // Finally block entered via unwinding: exception value on stack.
            self.compile_stmts(finalbody)?;
            self.code.emit(Opcode::RERAISE, 0, loc);
            self.patch_jump_here(jump_end);
        } else {
            self.compile_try_core(body, handlers, orelse)?;
        }
        Ok(())
    }

    fn compile_try_core(&mut self, body: &[Stmt], handlers: &[ExceptHandler], orelse: &[Stmt]) -> CResult<()> {
        let loc = self.loc0();
        if handlers.is_empty() {
            self.compile_stmts(body)?;
            self.compile_stmts(orelse)?;
            return Ok(());
        }
        let setup = self.emit_jump(Opcode::SETUP_FINALLY, loc);
        self.compile_stmts(body)?;
        self.code.emit(Opcode::POP_BLOCK, 0, loc);
        self.compile_stmts(orelse)?;
        let jump_end = self.emit_jump(Opcode::JUMP_ABSOLUTE, loc);
        self.patch_jump_here(setup);

        let mut next_check: Option<usize> = None;
        let mut end_jumps = Vec::new();
        for handler in handlers {
            if let Some(pc) = next_check.take() {
                self.patch_jump_here(pc);
            }
            let hloc = handler.location;
            if let Some(typ) = &handler.typ {
                self.code.emit(Opcode::DUP_TOP, 0, hloc);
                let isinstance_idx = self.code.intern_name("isinstance", &self.strings);
                self.code.emit(Opcode::LOAD_GLOBAL, isinstance_idx, hloc);
                self.code.emit(Opcode::ROT_TWO, 0, hloc);
                self.compile_expr(typ)?;
                self.code.emit(Opcode::CALL_FUNCTION, 2, hloc);
                next_check = Some(self.emit_jump(Opcode::POP_JUMP_IF_FALSE, hloc));
            }
            match &handler.name {
                Some(n) => self.emit_store_name(n, hloc),
                None => self.code.emit(Opcode::POP_TOP, 0, hloc),
            }
            self.compile_stmts(&handler.body)?;
            self.code.emit(Opcode::POP_EXCEPT, 0, hloc);
            end_jumps.push(self.emit_jump(Opcode::JUMP_ABSOLUTE, hloc));
        }
        if let Some(pc) = next_check {
            self.patch_jump_here(pc);
        }
        self.code.emit(Opcode::RERAISE, 0, loc);
        let end = self.here();
        self.patch_jump_to(jump_end, end);
        for pc in end_jumps {
            self.patch_jump_to(pc, end);
        }
        Ok(())
    }

    /// `with ctx as v: body` lowers to `SETUP_WITH` (calls `__enter__`,
    /// pushes its result) / body / `POP_BLOCK` + `WITH_CLEANUP` on the
    /// normal path, `WITH_CLEANUP` again at the handler PC on the
    /// exceptional path (spec §4.4: "`with` is lowered to `try/finally`
    /// plus `__enter__`/`__exit__` calls").
    fn compile_with(&mut self, items: &[WithItem], body: &[Stmt]) -> CResult<()> {
        if let Some((first, rest)) = items.split_first() {
            let loc = first.context_expr.location;
            self.compile_expr(&first.context_expr)?;
            let setup = self.emit_jump(Opcode::SETUP_WITH, loc);
            match &first.optional_vars {
                Some(t) => self.compile_assign_target(t)?,
                None => self.code.emit(Opcode::POP_TOP, 0, loc),
            }
            self.compile_with(rest, body)?;
            self.code.emit(Opcode::POP_BLOCK, 0, loc);
            self.emit_load_const(BcConstant::None, loc);
            self.code.emit(Opcode::WITH_CLEANUP, 0, loc);
            let jump_end = self.emit_jump(Opcode::JUMP_ABSOLUTE, loc);
            self.patch_jump_here(setup);
            self.code.emit(Opcode::WITH_CLEANUP, 0, loc);
            self.code.emit(Opcode::RERAISE, 0, loc);
            self.patch_jump_here(jump_end);
        } else {
            self.compile_stmts(body)?;
        }
        Ok(())
    }

    fn compile_raise(&mut self, exc: &Option<Expr>, cause: &Option<Expr>, loc: Location) -> CResult<()> {
        match (exc, cause) {
            (None, _) => {
                self.code.emit(Opcode::RAISE_VARARGS, 0, loc);
            }
            (Some(e), None) => {
                self.compile_expr(e)?;
                self.code.emit(Opcode::RAISE_VARARGS, 1, loc);
            }
            (Some(e), Some(c)) => {
                self.compile_expr(e)?;
                self.compile_expr(c)?;
                self.code.emit(Opcode::RAISE_VARARGS, 2, loc);
            }
        }
        Ok(())
    }

    fn compile_assert(&mut self, test: &Expr, msg: &Option<Expr>, loc: Location) -> CResult<()> {
        self.compile_expr(test)?;
        let skip = self.emit_jump(Opcode::POP_JUMP_IF_TRUE, loc);
        self.code.emit(Opcode::LOAD_ASSERTION_ERROR, 0, loc);
        if let Some(m) = msg {
            self.compile_expr(m)?;
            self.code.emit(Opcode::CALL_FUNCTION, 1, loc);
        }
        self.code.emit(Opcode::RAISE_VARARGS, 1, loc);
        self.patch_jump_here(skip);
        Ok(())
    }

    fn compile_import(&mut self, aliases: &[Alias], loc: Location) {
        for alias in aliases {
            let name_idx = self.code.intern_name(&alias.name, &self.strings);
            self.emit_load_const(BcConstant::None, loc);
            self.code.emit(Opcode::IMPORT_NAME, name_idx, loc);
            match &alias.asname {
                Some(bound) => self.emit_store_name(bound, loc),
                None => {
                    let top = alias.name.split('.').next().unwrap().to_string();
                    self.emit_store_name(&top, loc);
                }
            }
        }
    }

    fn compile_import_from(&mut self, module: Option<&str>, names: &[Alias], level: usize, loc: Location) {
        let module_name = module.unwrap_or("");
        let name_idx = self.code.intern_name(module_name, &self.strings);
        self.emit_load_const(BcConstant::Int(level as i64), loc);
        self.code.emit(Opcode::IMPORT_NAME, name_idx, loc);
        if names.len() == 1 && names[0].name == "*" {
            self.code.emit(Opcode::IMPORT_STAR, 0, loc);
            return;
        }
        for alias in names {
            self.code.emit(Opcode::DUP_TOP, 0, loc);
            let attr_idx = self.code.intern_name(&alias.name, &self.strings);
            self.code.emit(Opcode::IMPORT_FROM, attr_idx, loc);
            let bound = alias.asname.as_deref().unwrap_or(&alias.name);
            self.emit_store_name(bound, loc);
            self.code.emit(Opcode::POP_TOP, 0, loc);
        }
        self.code.emit(Opcode::POP_TOP, 0, loc);
    }

    // ---- function / class definitions ----

    fn compile_function_def(
        &mut self,
        name: &str,
        params: &Params,
        body: &[Stmt],
        decorators: &[Expr],
        is_async: bool,
        loc: Location,
    ) -> CResult<()> {
        for d in decorators {
            self.compile_expr(d)?;
        }
        self.compile_code_and_make_function(name, params, body, is_async, false, loc)?;
        for _ in decorators {
            self.code.emit(Opcode::CALL_FUNCTION, 1, loc);
        }
        self.emit_store_name(name, loc);
        Ok(())
    }

    /// Shared by `def`, `lambda` and comprehensions: compiles the nested
    /// body into its own code object, pushes defaults/kwdefaults/closure,
    /// then `MAKE_FUNCTION`.
    fn compile_code_and_make_function(
        &mut self,
        name: &str,
        params: &Params,
        body: &[Stmt],
        is_async: bool,
        is_generator_hint_only: bool,
        loc: Location,
    ) -> CResult<()> {
        let _ = is_generator_hint_only;
        for default in &params.defaults {
            self.compile_expr(default)?;
        }
        let ndefaults = params.defaults.len();
        self.code.emit(Opcode::BUILD_TUPLE, ndefaults as i32, loc);

        let mut nkw = 0i32;
        for (arg, default) in params.kwonlyargs.iter().zip(&params.kw_defaults) {
            if let Some(d) = default {
                let key_idx = self.code.add_const(BcConstant::Str(arg.name.as_str().into()));
                self.code.emit(Opcode::LOAD_CONST, key_idx, loc);
                self.compile_expr(d)?;
                nkw += 1;
            }
        }
        self.code.emit(Opcode::BUILD_MAP, nkw, loc);

        let child_code = self.compile_nested(name, params, body, is_async)?;
        let nfreevars = child_code.co_freevars.len();
        for fv in child_code.co_freevars.clone() {
            let idx = self.deref_index(fv.as_str());
            self.code.emit(Opcode::LOAD_CLOSURE, idx, loc);
        }
        self.code.emit(Opcode::BUILD_TUPLE, nfreevars as i32, loc);

        let code_idx = self.code.add_const(BcConstant::Code(std::sync::Arc::new(child_code)));
        self.code.emit(Opcode::LOAD_CONST, code_idx, loc);
        self.code.emit(Opcode::ROT_FOUR, 0, loc);
        self.code.emit(Opcode::MAKE_FUNCTION, 0, loc);
        Ok(())
    }

    fn compile_nested(&mut self, name: &str, params: &Params, body: &[Stmt], is_async: bool) -> CResult<CodeObject> {
        let filename = self.code.co_filename.to_string();
        let is_generator = contains_yield_stmts(body);
        let symtab = build_symbol_table(body, params, false, false);
        let mut child = Compiler::new(&filename, name, symtab, false, false, true, IndexSet::new(), self.strings.clone());
        child.resolve_free_variables(self);
        child.bind_params(params);
        child.code.co_nparams = params.posonlyargs.len() + params.args.len();
        child.code.co_posonly_count = params.posonlyargs.len();
        child.code.co_kwonly_count = params.kwonlyargs.len();
        if params.vararg.is_some() {
            child.code.flags |= CodeFlags::HAS_VARARGS;
        }
        if params.kwarg.is_some() {
            child.code.flags |= CodeFlags::HAS_VARKEYWORDS;
        }
        if !params.defaults.is_empty() {
            child.code.flags |= CodeFlags::HAS_DEFAULTS;
        }
        if params.kw_defaults.iter().any(Option::is_some) {
            child.code.flags |= CodeFlags::HAS_KW_DEFAULTS;
        }
        if is_generator {
            child.code.flags |= CodeFlags::IS_GENERATOR;
        }
        if is_async {
            child.code.flags |= CodeFlags::IS_COROUTINE;
        }
        child.promote_required_cellvars(body);
        child.compile_stmts(body)?;
        let end_loc = child.loc0();
        child.emit_load_const(BcConstant::None, end_loc);
        child.code.emit(Opcode::RETURN_VALUE, 0, end_loc);
        Ok(child.code)
    }

    fn bind_params(&mut self, params: &Params) {
        for a in params.posonlyargs.iter().chain(&params.args) {
            self.varname_index(&a.name);
        }
        if let Some(v) = &params.vararg {
            self.varname_index(&v.name);
        }
        for a in &params.kwonlyargs {
            self.varname_index(&a.name);
        }
        if let Some(k) = &params.kwarg {
            self.varname_index(&k.name);
        }
    }

    fn compile_class_def(
        &mut self,
        name: &str,
        bases: &[Expr],
        keywords: &[(Option<Ident>, Expr)],
        body: &[Stmt],
        decorators: &[Expr],
        loc: Location,
    ) -> CResult<()> {
        for d in decorators {
            self.compile_expr(d)?;
        }
        self.code.emit(Opcode::LOAD_BUILD_CLASS, 0, loc);

        let filename = self.code.co_filename.to_string();
        let symtab = build_symbol_table(body, &Params::default(), false, true);
        let mut class_compiler = Compiler::new(&filename, name, symtab, false, true, false, IndexSet::new(), self.strings.clone());
        class_compiler.resolve_free_variables(self);
        class_compiler.promote_required_cellvars(body);
        class_compiler.compile_stmts(body)?;
        let end_loc = class_compiler.loc0();
        class_compiler.emit_load_const(BcConstant::None, end_loc);
        class_compiler.code.emit(Opcode::RETURN_VALUE, 0, end_loc);
        let class_code = class_compiler.code;

        self.code.emit(Opcode::BUILD_TUPLE, 0, loc);
        let nfreevars = class_code.co_freevars.len();
        for fv in class_code.co_freevars.clone() {
            let idx = self.deref_index(fv.as_str());
            self.code.emit(Opcode::LOAD_CLOSURE, idx, loc);
        }
        self.code.emit(Opcode::BUILD_TUPLE, nfreevars as i32, loc);
        let code_idx = self.code.add_const(BcConstant::Code(std::sync::Arc::new(class_code)));
        self.code.emit(Opcode::LOAD_CONST, code_idx, loc);
        self.code.emit(Opcode::ROT_FOUR, 0, loc);
        self.code.emit(Opcode::MAKE_FUNCTION, 0, loc);

        let name_idx = self.code.add_const(BcConstant::Str(name.into()));
        self.code.emit(Opcode::LOAD_CONST, name_idx, loc);

        for b in bases {
            self.compile_expr(b)?;
        }
        let mut nkw = 0i32;
        for (key, value) in keywords {
            if let Some(k) = key {
                let key_idx = self.code.add_const(BcConstant::Str(k.as_str().into()));
                self.code.emit(Opcode::LOAD_CONST, key_idx, loc);
                self.compile_expr(value)?;
                nkw += 1;
            }
        }
        if nkw > 0 {
            self.code.emit(Opcode::CALL_FUNCTION_KW, 2 + bases.len() as i32 + nkw, loc);
        } else {
            self.code.emit(Opcode::CALL_FUNCTION, 2 + bases.len() as i32, loc);
        }
        for _ in decorators {
            self.code.emit(Opcode::CALL_FUNCTION, 1, loc);
        }
        self.emit_store_name(name, loc);
        Ok(())
    }

    // ---- expressions ----

    fn compile_expr(&mut self, expr: &Expr) -> CResult<()> {
        let loc = expr.location;
        match &expr.kind {
            ExprKind::Constant(c) => self.emit_load_const(ast_const_to_bc(c), loc),
            ExprKind::Name(n) => self.emit_load_name(n, loc),
            ExprKind::BoolOp { op, values } => self.compile_bool_op(*op, values)?,
            ExprKind::UnaryOp { op, operand } => {
                self.compile_expr(operand)?;
                self.code.emit(unary_opcode(*op), 0, loc);
            }
            ExprKind::BinOp { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.code.emit(binary_opcode(*op), 0, loc);
            }
            ExprKind::Compare { left, ops, comparators } => self.compile_compare(left, ops, comparators)?,
            ExprKind::IfExp { test, body, orelse } => {
                self.compile_expr(test)?;
                let jump_else = self.emit_jump(Opcode::POP_JUMP_IF_FALSE, loc);
                self.compile_expr(body)?;
                let jump_end = self.emit_jump(Opcode::JUMP_ABSOLUTE, loc);
                self.patch_jump_here(jump_else);
                self.compile_expr(orelse)?;
                self.patch_jump_here(jump_end);
            }
            ExprKind::Call { func, args, keywords } => self.compile_call(func, args, keywords)?,
            ExprKind::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let idx = self.code.intern_name(attr, &self.strings);
                self.code.emit(Opcode::LOAD_ATTR, idx, loc);
            }
            ExprKind::Subscript { value, slice } => {
                self.compile_expr(value)?;
                self.compile_expr(slice)?;
                self.code.emit(Opcode::BINARY_SUBSCR, 0, loc);
            }
            ExprKind::Slice { lower, upper, step } => {
                match lower {
                    Some(e) => self.compile_expr(e)?,
                    None => self.emit_load_const(BcConstant::None, loc),
                }
                match upper {
                    Some(e) => self.compile_expr(e)?,
                    None => self.emit_load_const(BcConstant::None, loc),
                }
                match step {
                    Some(e) => self.compile_expr(e)?,
                    None => self.emit_load_const(BcConstant::None, loc),
                }
                self.code.emit(Opcode::BUILD_SLICE, 0, loc);
            }
            ExprKind::List(elts) => {
                for e in elts {
                    self.compile_expr(e)?;
                }
                self.code.emit(Opcode::BUILD_LIST, elts.len() as i32, loc);
            }
            ExprKind::Tuple(elts) => {
                for e in elts {
                    self.compile_expr(e)?;
                }
                self.code.emit(Opcode::BUILD_TUPLE, elts.len() as i32, loc);
            }
            ExprKind::Set(elts) => {
                for e in elts {
                    self.compile_expr(e)?;
                }
                self.code.emit(Opcode::BUILD_SET, elts.len() as i32, loc);
            }
            ExprKind::Dict { keys, values } => {
                // Each key/value pair (or lone `**mapping` value) becomes its
                // own one-piece dict, then pieces fold together left to
                // right via `BINARY_OR` (dict union, later keys win) so
                // `**` entries can appear anywhere in the literal.
                let mut pieces = 0i32;
                for (k, v) in keys.iter().zip(values) {
                    match k {
                        Some(k) => {
                            self.compile_expr(k)?;
                            self.compile_expr(v)?;
                            self.code.emit(Opcode::BUILD_MAP, 1, loc);
                        }
                        None => self.compile_expr(v)?,
                    }
                    pieces += 1;
                }
                if pieces == 0 {
                    self.code.emit(Opcode::BUILD_MAP, 0, loc);
                } else {
                    for _ in 1..pieces {
                        self.code.emit(Opcode::BINARY_OR, 0, loc);
                    }
                }
            }
            ExprKind::Lambda { params, body } => {
                let wrapped = Stmt { location: loc, kind: StmtKind::Return(Some((**body).clone())) };
                self.compile_code_and_make_function("<lambda>", params, std::slice::from_ref(&wrapped), false, false, loc)?;
            }
            ExprKind::ListComp { elt, generators } => self.compile_comprehension(
                "<listcomp>",
                elt,
                None,
                generators,
                ComprehensionKind::List,
                loc,
            )?,
            ExprKind::SetComp { elt, generators } => {
                self.compile_comprehension("<setcomp>", elt, None, generators, ComprehensionKind::Set, loc)?
            }
            ExprKind::DictComp { key, value, generators } => self.compile_comprehension(
                "<dictcomp>",
                key,
                Some(value.as_ref()),
                generators,
                ComprehensionKind::Dict,
                loc,
            )?,
            ExprKind::GeneratorExp { elt, generators } => {
                self.compile_comprehension("<genexpr>", elt, None, generators, ComprehensionKind::Gen, loc)?
            }
            ExprKind::Yield(value) => {
                if !self.in_function {
                    return Err(CompileError::new(CompileErrorType::YieldOutsideFunction, loc, ""));
                }
                self.code.flags |= CodeFlags::IS_GENERATOR;
                match value {
                    Some(v) => self.compile_expr(v)?,
                    None => self.emit_load_const(BcConstant::None, loc),
                }
                self.code.emit(Opcode::YIELD_VALUE, 0, loc);
            }
            ExprKind::YieldFrom(value) => {
                if !self.in_function {
                    return Err(CompileError::new(CompileErrorType::YieldOutsideFunction, loc, ""));
                }
                self.code.flags |= CodeFlags::IS_GENERATOR;
                self.compile_expr(value)?;
                self.code.emit(Opcode::GET_YIELD_FROM_ITER, 0, loc);
                self.emit_load_const(BcConstant::None, loc);
                self.code.emit(Opcode::YIELD_FROM, 0, loc);
            }
            ExprKind::Await(value) => {
                self.compile_expr(value)?;
                self.code.emit(Opcode::GET_YIELD_FROM_ITER, 0, loc);
                self.emit_load_const(BcConstant::None, loc);
                self.code.emit(Opcode::YIELD_FROM, 0, loc);
            }
            ExprKind::Starred(inner) => self.compile_expr(inner)?,
            ExprKind::JoinedStr(parts) => {
                for p in parts {
                    self.compile_expr(p)?;
                }
                self.code.emit(Opcode::BUILD_STRING, parts.len() as i32, loc);
            }
            ExprKind::FormattedValue { value, conversion, format_spec } => {
                self.compile_expr(value)?;
                match format_spec {
                    Some(s) => self.compile_expr(s)?,
                    None => self.emit_load_const(BcConstant::None, loc),
                }
                let conv = conversion.map(|c| c as i32).unwrap_or(0);
                self.code.emit(Opcode::FORMAT_VALUE, conv, loc);
            }
        }
        Ok(())
    }

    fn compile_bool_op(&mut self, op: BoolOpKind, values: &[Expr]) -> CResult<()> {
        let loc = values[0].location;
        let jump_op = match op {
            BoolOpKind::And => Opcode::JUMP_IF_FALSE_OR_POP,
            BoolOpKind::Or => Opcode::JUMP_IF_TRUE_OR_POP,
        };
        let mut end_jumps = Vec::new();
        for (i, v) in values.iter().enumerate() {
            self.compile_expr(v)?;
            if i + 1 < values.len() {
                end_jumps.push(self.emit_jump(jump_op, loc));
            }
        }
        let end = self.here();
        for pc in end_jumps {
            self.patch_jump_to(pc, end);
        }
        Ok(())
    }

    fn compile_compare(&mut self, left: &Expr, ops: &[CmpOp], comparators: &[Expr]) -> CResult<()> {
        let loc = left.location;
        self.compile_expr(left)?;
        let mut end_jumps = Vec::new();
        for (i, (op, comparator)) in ops.iter().zip(comparators).enumerate() {
            self.compile_expr(comparator)?;
            let is_last = i + 1 == ops.len();
            if !is_last {
                self.code.emit(Opcode::DUP_TOP, 0, loc);
                self.code.emit(Opcode::ROT_THREE, 0, loc);
            }
            self.emit_compare_op(*op, loc);
            if !is_last {
                end_jumps.push(self.emit_jump(Opcode::JUMP_IF_FALSE_OR_POP, loc));
                self.code.emit(Opcode::POP_TOP, 0, loc);
            }
        }
        let end = self.here();
        for pc in end_jumps {
            self.patch_jump_to(pc, end);
        }
        Ok(())
    }

    fn emit_compare_op(&mut self, op: CmpOp, loc: Location) {
        use protopython_bytecode::CompareOp as Cmp;
        match op {
            CmpOp::Eq => self.code.emit(Opcode::COMPARE_OP, Cmp::Eq as i32, loc),
            CmpOp::NotEq => self.code.emit(Opcode::COMPARE_OP, Cmp::Ne as i32, loc),
            CmpOp::Lt => self.code.emit(Opcode::COMPARE_OP, Cmp::Lt as i32, loc),
            CmpOp::LtE => self.code.emit(Opcode::COMPARE_OP, Cmp::Le as i32, loc),
            CmpOp::Gt => self.code.emit(Opcode::COMPARE_OP, Cmp::Gt as i32, loc),
            CmpOp::GtE => self.code.emit(Opcode::COMPARE_OP, Cmp::Ge as i32, loc),
            CmpOp::Is => self.code.emit(Opcode::IS_OP, 0, loc),
            CmpOp::IsNot => self.code.emit(Opcode::IS_NOT_OP, 0, loc),
            CmpOp::In => self.code.emit(Opcode::IN_OP, 0, loc),
            CmpOp::NotIn => self.code.emit(Opcode::NOT_IN_OP, 0, loc),
        };
    }

    fn compile_call(&mut self, func: &Expr, args: &[Expr], keywords: &[(Option<Ident>, Expr)]) -> CResult<()> {
        let loc = func.location;
        self.compile_expr(func)?;
        let has_star = args.iter().any(|a| matches!(a.kind, ExprKind::Starred(_)));
        let has_kwsplat = keywords.iter().any(|(k, _)| k.is_none());
        if has_star || has_kwsplat {
            self.compile_call_ex(args, keywords, loc)?;
            return Ok(());
        }
        for a in args {
            self.compile_expr(a)?;
        }
        if keywords.is_empty() {
            self.code.emit(Opcode::CALL_FUNCTION, args.len() as i32, loc);
        } else {
            for (key, value) in keywords {
                let key_idx = self.code.add_const(BcConstant::Str(key.as_deref().unwrap_or("").into()));
                self.code.emit(Opcode::LOAD_CONST, key_idx, loc);
                self.compile_expr(value)?;
            }
            self.code.emit(Opcode::CALL_FUNCTION_KW, (args.len() + keywords.len()) as i32, loc);
        }
        Ok(())
    }

    /// `f(*args, **kwargs)` style call: build one positional tuple and one
    /// keyword dict, regardless of how many starred/plain pieces compose
    /// them, then `CALL_FUNCTION_EX`.
    fn compile_call_ex(&mut self, args: &[Expr], keywords: &[(Option<Ident>, Expr)], loc: Location) -> CResult<()> {
        let mut pieces = 0i32;
        for a in args {
            match &a.kind {
                ExprKind::Starred(inner) => {
                    self.compile_expr(inner)?;
                }
                _ => {
                    self.compile_expr(a)?;
                    self.code.emit(Opcode::BUILD_TUPLE, 1, loc);
                }
            }
            pieces += 1;
        }
        if pieces == 0 {
            self.code.emit(Opcode::BUILD_TUPLE, 0, loc);
        } else {
            for _ in 1..pieces {
                self.code.emit(Opcode::BINARY_ADD, 0, loc);
            }
        }
        let mut kw_pieces = 0i32;
        for (key, value) in keywords {
            match key {
                None => self.compile_expr(value)?,
                Some(k) => {
                    let key_idx = self.code.add_const(BcConstant::Str(k.as_str().into()));
                    self.code.emit(Opcode::LOAD_CONST, key_idx, loc);
                    self.compile_expr(value)?;
                    self.code.emit(Opcode::BUILD_MAP, 1, loc);
                }
            }
            kw_pieces += 1;
        }
        if kw_pieces == 0 {
            self.code.emit(Opcode::BUILD_MAP, 0, loc);
        } else {
            for _ in 1..kw_pieces {
                self.code.emit(Opcode::BINARY_OR, 0, loc);
            }
        }
        self.code.emit(Opcode::CALL_FUNCTION_EX, 0, loc);
        Ok(())
    }

    /// Comprehensions compile to an implicit function taking the outermost
    /// iterable as its sole parameter, called immediately with `GET_ITER`
    /// applied to the outer iterable expression (spec §4.4).
    fn compile_comprehension(
        &mut self,
        label: &str,
        elt: &Expr,
        value_for_dict: Option<&Expr>,
        generators: &[Comprehension],
        kind: ComprehensionKind,
        loc: Location,
    ) -> CResult<()> {
        let outer_iter = generators[0].iter.clone();
        let arg_name = ".0".to_string();
        let params = Params { args: vec![ast::Arg { name: arg_name.clone(), annotation: None }], ..Default::default() };
        let body = build_comprehension_body(&arg_name, elt, value_for_dict, generators, kind, loc);
        self.compile_code_and_make_function(label, &params, &body, false, false, loc)?;
        self.compile_expr(&outer_iter)?;
        self.code.emit(Opcode::GET_ITER, 0, loc);
        self.code.emit(Opcode::CALL_FUNCTION, 1, loc);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum ComprehensionKind {
    List,
    Set,
    Dict,
    Gen,
}

/// Desugars a comprehension into an ordinary function body: build the
/// accumulator, loop the (possibly nested) `for`/`if` clauses, append/add
/// to the accumulator, return it. Generator expressions instead `yield`
/// each element and return nothing, matching a real generator function.
fn build_comprehension_body(
    arg_name: &str,
    elt: &Expr,
    value_for_dict: Option<&Expr>,
    generators: &[Comprehension],
    kind: ComprehensionKind,
    loc: Location,
) -> Vec<Stmt> {
    let acc_name = ".acc".to_string();
    let mut stmts = Vec::new();
    if !matches!(kind, ComprehensionKind::Gen) {
        let empty = match kind {
            ComprehensionKind::List => ExprKind::List(Vec::new()),
            ComprehensionKind::Set => ExprKind::Set(Vec::new()),
            ComprehensionKind::Dict => ExprKind::Dict { keys: Vec::new(), values: Vec::new() },
            ComprehensionKind::Gen => unreachable!(),
        };
        stmts.push(Stmt {
            location: loc,
            kind: StmtKind::Assign {
                targets: vec![name_expr(&acc_name, loc)],
                value: Expr::new(loc, empty),
            },
        });
    }

    let append_call = |method: &str, args: Vec<Expr>| -> Stmt {
        Stmt {
            location: loc,
            kind: StmtKind::Expr(Expr::new(
                loc,
                ExprKind::Call {
                    func: Box::new(Expr::new(
                        loc,
                        ExprKind::Attribute { value: Box::new(name_expr(&acc_name, loc)), attr: method.to_string() },
                    )),
                    args,
                    keywords: Vec::new(),
                },
            )),
        }
    };

    let inner = match kind {
        ComprehensionKind::List => vec![append_call("append", vec![elt.clone()])],
        ComprehensionKind::Set => vec![append_call("add", vec![elt.clone()])],
        ComprehensionKind::Dict => {
            let value = value_for_dict.expect("dict comprehension needs a value expr").clone();
            vec![Stmt {
                location: loc,
                kind: StmtKind::Assign {
                    targets: vec![Expr::new(
                        loc,
                        ExprKind::Subscript { value: Box::new(name_expr(&acc_name, loc)), slice: Box::new(elt.clone()) },
                    )],
                    value,
                },
            }]
        }
        ComprehensionKind::Gen => vec![Stmt {
            location: loc,
            kind: StmtKind::Expr(Expr::new(loc, ExprKind::Yield(Some(Box::new(elt.clone()))))),
        }],
    };

    let mut body = inner;
    for (i, gen) in generators.iter().enumerate().rev() {
        let iter_expr = if i == 0 { name_expr(arg_name, loc) } else { gen.iter.clone() };
        let mut wrapped = body;
        for cond in gen.ifs.iter().rev() {
            wrapped = vec![Stmt {
                location: loc,
                kind: StmtKind::If { test: cond.clone(), body: wrapped, orelse: Vec::new() },
            }];
        }
        body = vec![Stmt {
            location: loc,
            kind: StmtKind::For {
                target: gen.target.clone(),
                iter: iter_expr,
                body: wrapped,
                orelse: Vec::new(),
                is_async: gen.is_async,
            },
        }];
    }
    stmts.extend(body);
    if !matches!(kind, ComprehensionKind::Gen) {
        stmts.push(Stmt { location: loc, kind: StmtKind::Return(Some(name_expr(&acc_name, loc))) });
    }
    stmts
}

fn name_expr(name: &str, loc: Location) -> Expr {
    Expr::new(loc, ExprKind::Name(name.to_string()))
}

fn ast_const_to_bc(c: &AstConstant) -> BcConstant {
    match c {
        AstConstant::None => BcConstant::None,
        AstConstant::Bool(b) => BcConstant::Bool(*b),
        AstConstant::Int(i) => BcConstant::Int(*i),
        AstConstant::Float(f) => BcConstant::Float(*f),
        AstConstant::Str(s) => BcConstant::Str(s.as_str().into()),
        AstConstant::Bytes(b) => BcConstant::Bytes(b.as_slice().into()),
        AstConstant::Ellipsis => BcConstant::None,
    }
}

fn unary_opcode(op: UnaryOpKind) -> Opcode {
    match op {
        UnaryOpKind::UAdd => Opcode::UNARY_POSITIVE,
        UnaryOpKind::USub => Opcode::UNARY_NEGATIVE,
        UnaryOpKind::Invert => Opcode::UNARY_INVERT,
        UnaryOpKind::Not => Opcode::UNARY_NOT,
    }
}

fn binary_opcode(op: Operator) -> Opcode {
    match op {
        Operator::Add => Opcode::BINARY_ADD,
        Operator::Sub => Opcode::BINARY_SUBTRACT,
        Operator::Mult => Opcode::BINARY_MULTIPLY,
        Operator::Div => Opcode::BINARY_TRUE_DIVIDE,
        Operator::FloorDiv => Opcode::BINARY_FLOOR_DIVIDE,
        Operator::Mod => Opcode::BINARY_MODULO,
        Operator::Pow => Opcode::BINARY_POWER,
        Operator::LShift => Opcode::BINARY_LSHIFT,
        Operator::RShift => Opcode::BINARY_RSHIFT,
        Operator::BitAnd => Opcode::BINARY_AND,
        Operator::BitOr => Opcode::BINARY_OR,
        Operator::BitXor => Opcode::BINARY_XOR,
    }
}

fn inplace_opcode(op: Operator) -> Opcode {
    match op {
        Operator::Add => Opcode::INPLACE_ADD,
        Operator::Sub => Opcode::INPLACE_SUBTRACT,
        Operator::Mult => Opcode::INPLACE_MULTIPLY,
        Operator::Div => Opcode::INPLACE_TRUE_DIVIDE,
        Operator::FloorDiv => Opcode::INPLACE_FLOOR_DIVIDE,
        Operator::Mod => Opcode::INPLACE_MODULO,
        Operator::Pow => Opcode::INPLACE_POWER,
        Operator::LShift => Opcode::INPLACE_LSHIFT,
        Operator::RShift => Opcode::INPLACE_RSHIFT,
        Operator::BitAnd => Opcode::INPLACE_AND,
        Operator::BitOr => Opcode::INPLACE_OR,
        Operator::BitXor => Opcode::INPLACE_XOR,
    }
}

/// A function body is a generator (spec §4.4: "flagged `co_is_generator`")
/// if it contains a `yield`/`yield from` anywhere not inside a nested
/// `def`/`lambda` (those get their own flag independently).
fn contains_yield_stmts(body: &[Stmt]) -> bool {
    body.iter().any(contains_yield_stmt)
}

fn contains_yield_stmt(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::FunctionDef { .. } | StmtKind::ClassDef { .. } => false,
        StmtKind::Expr(e) | StmtKind::Return(Some(e)) => contains_yield_expr(e),
        StmtKind::Assign { value, .. } => contains_yield_expr(value),
        StmtKind::AugAssign { value, .. } => contains_yield_expr(value),
        StmtKind::AnnAssign { value, .. } => value.as_ref().map(contains_yield_expr).unwrap_or(false),
        StmtKind::If { test, body, orelse } => {
            contains_yield_expr(test) || contains_yield_stmts(body) || contains_yield_stmts(orelse)
        }
        StmtKind::While { test, body, orelse } => {
            contains_yield_expr(test) || contains_yield_stmts(body) || contains_yield_stmts(orelse)
        }
        StmtKind::For { iter, body, orelse, .. } => {
            contains_yield_expr(iter) || contains_yield_stmts(body) || contains_yield_stmts(orelse)
        }
        StmtKind::Try { body, handlers, orelse, finalbody } => {
            contains_yield_stmts(body)
                || handlers.iter().any(|h| contains_yield_stmts(&h.body))
                || contains_yield_stmts(orelse)
                || contains_yield_stmts(finalbody)
        }
        StmtKind::With { body, .. } => contains_yield_stmts(body),
        _ => false,
    }
}

fn contains_yield_expr(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Yield(_) | ExprKind::YieldFrom(_) => true,
        ExprKind::BoolOp { values, .. } => values.iter().any(contains_yield_expr),
        ExprKind::BinOp { left, right, .. } => contains_yield_expr(left) || contains_yield_expr(right),
        ExprKind::UnaryOp { operand, .. } => contains_yield_expr(operand),
        ExprKind::IfExp { test, body, orelse } => {
            contains_yield_expr(test) || contains_yield_expr(body) || contains_yield_expr(orelse)
        }
        ExprKind::Compare { left, comparators, .. } => {
            contains_yield_expr(left) || comparators.iter().any(contains_yield_expr)
        }
        ExprKind::Call { func, args, .. } => contains_yield_expr(func) || args.iter().any(contains_yield_expr),
        ExprKind::Attribute { value, .. } => contains_yield_expr(value),
        ExprKind::Subscript { value, slice } => contains_yield_expr(value) || contains_yield_expr(slice),
        ExprKind::Starred(inner) | ExprKind::Await(inner) => contains_yield_expr(inner),
        ExprKind::List(elts) | ExprKind::Tuple(elts) | ExprKind::Set(elts) => elts.iter().any(contains_yield_expr),
        _ => false,
    }
}

// ---- closure pre-pass ----
//
// Cellvar promotion has to be decided before a scope's own statements
// compile, not discovered lazily while walking them: a name read via
// `LOAD_FAST` before the nested `def` that closes over it would otherwise
// never observe the `STORE_DEREF` mutations that closure performs later.
// `names_required_by_nested_scopes` answers "which of my locals does some
// descendant scope, at any depth, need as a free variable?" up front.

#[derive(Clone, Copy)]
enum ScopeKind {
    Function,
    Class,
}

struct NestedScope {
    kind: ScopeKind,
    params: Params,
    body: Vec<Stmt>,
}

fn collect_nested_scopes(stmts: &[Stmt], out: &mut Vec<NestedScope>) {
    for s in stmts {
        collect_nested_scopes_stmt(s, out);
    }
}

fn collect_nested_scopes_stmt(stmt: &Stmt, out: &mut Vec<NestedScope>) {
    match &stmt.kind {
        StmtKind::FunctionDef { params, body, decorators, returns, .. } => {
            for d in decorators {
                collect_nested_scopes_expr(d, out);
            }
            if let Some(r) = returns {
                collect_nested_scopes_expr(r, out);
            }
            for d in &params.defaults {
                collect_nested_scopes_expr(d, out);
            }
            for d in params.kw_defaults.iter().flatten() {
                collect_nested_scopes_expr(d, out);
            }
            out.push(NestedScope { kind: ScopeKind::Function, params: params.clone(), body: body.clone() });
        }
        StmtKind::ClassDef { bases, keywords, decorators, body, .. } => {
            for d in decorators {
                collect_nested_scopes_expr(d, out);
            }
            for b in bases {
                collect_nested_scopes_expr(b, out);
            }
            for (_, v) in keywords {
                collect_nested_scopes_expr(v, out);
            }
            out.push(NestedScope { kind: ScopeKind::Class, params: Params::default(), body: body.clone() });
        }
        StmtKind::Return(v) => {
            if let Some(v) = v {
                collect_nested_scopes_expr(v, out);
            }
        }
        StmtKind::Delete(targets) => targets.iter().for_each(|t| collect_nested_scopes_expr(t, out)),
        StmtKind::Assign { targets, value } => {
            collect_nested_scopes_expr(value, out);
            targets.iter().for_each(|t| collect_nested_scopes_expr(t, out));
        }
        StmtKind::AugAssign { target, value, .. } => {
            collect_nested_scopes_expr(target, out);
            collect_nested_scopes_expr(value, out);
        }
        StmtKind::AnnAssign { target, annotation, value } => {
            collect_nested_scopes_expr(target, out);
            collect_nested_scopes_expr(annotation, out);
            if let Some(v) = value {
                collect_nested_scopes_expr(v, out);
            }
        }
        StmtKind::For { target, iter, body, orelse, .. } => {
            collect_nested_scopes_expr(target, out);
            collect_nested_scopes_expr(iter, out);
            collect_nested_scopes(body, out);
            collect_nested_scopes(orelse, out);
        }
        StmtKind::While { test, body, orelse } => {
            collect_nested_scopes_expr(test, out);
            collect_nested_scopes(body, out);
            collect_nested_scopes(orelse, out);
        }
        StmtKind::If { test, body, orelse } => {
            collect_nested_scopes_expr(test, out);
            collect_nested_scopes(body, out);
            collect_nested_scopes(orelse, out);
        }
        StmtKind::With { items, body, .. } => {
            for item in items {
                collect_nested_scopes_expr(&item.context_expr, out);
                if let Some(t) = &item.optional_vars {
                    collect_nested_scopes_expr(t, out);
                }
            }
            collect_nested_scopes(body, out);
        }
        StmtKind::Raise { exc, cause } => {
            if let Some(e) = exc {
                collect_nested_scopes_expr(e, out);
            }
            if let Some(c) = cause {
                collect_nested_scopes_expr(c, out);
            }
        }
        StmtKind::Try { body, handlers, orelse, finalbody } => {
            collect_nested_scopes(body, out);
            for h in handlers {
                if let Some(t) = &h.typ {
                    collect_nested_scopes_expr(t, out);
                }
                collect_nested_scopes(&h.body, out);
            }
            collect_nested_scopes(orelse, out);
            collect_nested_scopes(finalbody, out);
        }
        StmtKind::Assert { test, msg } => {
            collect_nested_scopes_expr(test, out);
            if let Some(m) = msg {
                collect_nested_scopes_expr(m, out);
            }
        }
        StmtKind::Expr(e) => collect_nested_scopes_expr(e, out),
        StmtKind::Import(_)
        | StmtKind::ImportFrom { .. }
        | StmtKind::Global(_)
        | StmtKind::Nonlocal(_)
        | StmtKind::Pass
        | StmtKind::Break
        | StmtKind::Continue => {}
    }
}

fn collect_nested_scopes_expr(expr: &Expr, out: &mut Vec<NestedScope>) {
    match &expr.kind {
        ExprKind::Lambda { params, body } => {
            for d in &params.defaults {
                collect_nested_scopes_expr(d, out);
            }
            for d in params.kw_defaults.iter().flatten() {
                collect_nested_scopes_expr(d, out);
            }
            let wrapped = vec![Stmt { location: expr.location, kind: StmtKind::Return(Some((**body).clone())) }];
            out.push(NestedScope { kind: ScopeKind::Function, params: params.clone(), body: wrapped });
        }
        ExprKind::ListComp { elt, generators } => {
            push_comprehension_scope(out, expr.location, elt, None, generators, ComprehensionKind::List)
        }
        ExprKind::SetComp { elt, generators } => {
            push_comprehension_scope(out, expr.location, elt, None, generators, ComprehensionKind::Set)
        }
        ExprKind::DictComp { key, value, generators } => {
            push_comprehension_scope(out, expr.location, key, Some(value), generators, ComprehensionKind::Dict)
        }
        ExprKind::GeneratorExp { elt, generators } => {
            push_comprehension_scope(out, expr.location, elt, None, generators, ComprehensionKind::Gen)
        }
        ExprKind::BoolOp { values, .. } => values.iter().for_each(|v| collect_nested_scopes_expr(v, out)),
        ExprKind::BinOp { left, right, .. } => {
            collect_nested_scopes_expr(left, out);
            collect_nested_scopes_expr(right, out);
        }
        ExprKind::UnaryOp { operand, .. } => collect_nested_scopes_expr(operand, out),
        ExprKind::IfExp { test, body, orelse } => {
            collect_nested_scopes_expr(test, out);
            collect_nested_scopes_expr(body, out);
            collect_nested_scopes_expr(orelse, out);
        }
        ExprKind::Dict { keys, values } => {
            keys.iter().flatten().for_each(|k| collect_nested_scopes_expr(k, out));
            values.iter().for_each(|v| collect_nested_scopes_expr(v, out));
        }
        ExprKind::Set(elts) | ExprKind::List(elts) | ExprKind::Tuple(elts) => {
            elts.iter().for_each(|e| collect_nested_scopes_expr(e, out))
        }
        ExprKind::Yield(v) => {
            if let Some(v) = v {
                collect_nested_scopes_expr(v, out);
            }
        }
        ExprKind::YieldFrom(v) | ExprKind::Await(v) => collect_nested_scopes_expr(v, out),
        ExprKind::Compare { left, comparators, .. } => {
            collect_nested_scopes_expr(left, out);
            comparators.iter().for_each(|c| collect_nested_scopes_expr(c, out));
        }
        ExprKind::Call { func, args, keywords } => {
            collect_nested_scopes_expr(func, out);
            args.iter().for_each(|a| collect_nested_scopes_expr(a, out));
            keywords.iter().for_each(|(_, v)| collect_nested_scopes_expr(v, out));
        }
        ExprKind::JoinedStr(parts) => parts.iter().for_each(|p| collect_nested_scopes_expr(p, out)),
        ExprKind::FormattedValue { value, format_spec, .. } => {
            collect_nested_scopes_expr(value, out);
            if let Some(s) = format_spec {
                collect_nested_scopes_expr(s, out);
            }
        }
        ExprKind::Attribute { value, .. } => collect_nested_scopes_expr(value, out),
        ExprKind::Subscript { value, slice } => {
            collect_nested_scopes_expr(value, out);
            collect_nested_scopes_expr(slice, out);
        }
        ExprKind::Starred(inner) => collect_nested_scopes_expr(inner, out),
        ExprKind::Slice { lower, upper, step } => {
            for e in [lower, upper, step].into_iter().flatten() {
                collect_nested_scopes_expr(e, out);
            }
        }
        ExprKind::Constant(_) | ExprKind::Name(_) => {}
    }
}

/// Only the outermost generator's iterable is evaluated in the enclosing
/// scope; the rest of the comprehension's clauses live inside its own
/// implicit-function body (see `build_comprehension_body`).
fn push_comprehension_scope(
    out: &mut Vec<NestedScope>,
    loc: Location,
    elt: &Expr,
    value_for_dict: Option<&Expr>,
    generators: &[Comprehension],
    kind: ComprehensionKind,
) {
    collect_nested_scopes_expr(&generators[0].iter, out);
    let arg_name = ".0".to_string();
    let params = Params { args: vec![ast::Arg { name: arg_name.clone(), annotation: None }], ..Default::default() };
    let body = build_comprehension_body(&arg_name, elt, value_for_dict, generators, kind, loc);
    out.push(NestedScope { kind: ScopeKind::Function, params, body });
}

/// Free variables a scope (and everything nested inside it) needs pulled
/// from further out, computed bottom-up: a descendant's request is
/// satisfied (not propagated further) once it reaches a scope that binds
/// it as a true local. Class bodies never bind anything this way (their
/// assignments classify as `Global`, matching ordinary Python scoping
/// where methods skip over their enclosing class body).
fn free_variable_requests(stmts: &[Stmt], params: &Params, is_module: bool, is_class: bool) -> IndexSet<Ident> {
    let symtab = build_symbol_table(stmts, params, is_module, is_class);
    let mut result = IndexSet::new();
    let mut locals = IndexSet::new();
    for (name, scope) in symtab.scopes.iter() {
        match scope {
            NameScope::Builtin => {
                result.insert(name.clone());
            }
            NameScope::Local => {
                locals.insert(name.clone());
            }
            _ => {}
        }
    }
    let mut nested = Vec::new();
    collect_nested_scopes(stmts, &mut nested);
    for scope in nested {
        let is_class_scope = matches!(scope.kind, ScopeKind::Class);
        for name in free_variable_requests(&scope.body, &scope.params, false, is_class_scope) {
            if !locals.contains(&name) {
                result.insert(name);
            }
        }
    }
    result
}

fn names_required_by_nested_scopes(stmts: &[Stmt]) -> IndexSet<Ident> {
    let mut nested = Vec::new();
    collect_nested_scopes(stmts, &mut nested);
    let mut result = IndexSet::new();
    for scope in nested {
        let is_class_scope = matches!(scope.kind, ScopeKind::Class);
        result.extend(free_variable_requests(&scope.body, &scope.params, false, is_class_scope));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(src: &str) -> CodeObject {
        compile_program(src, "<test>", Mode::Exec, Arc::new(StringPool::new())).unwrap()
    }

    #[test]
    fn compiles_print_call() {
        let code = compile_ok("print(1 + 2)\n");
        assert!(!code.is_empty());
    }

    #[test]
    fn flags_generator_function() {
        let module = compile_ok("def g():\n    yield 1\n    yield 2\n");
        match &module.co_consts[0] {
            BcConstant::Code(c) => assert!(c.flags.contains(CodeFlags::IS_GENERATOR)),
            _ => panic!("expected nested code constant"),
        }
    }

    #[test]
    fn closure_variable_becomes_cellvar() {
        let module = compile_ok("def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\n");
        let outer = module.co_consts.iter().find_map(|c| match c {
            BcConstant::Code(c) if c.co_name.as_str() == "outer" => Some(c.clone()),
            _ => None,
        });
        let outer = outer.expect("outer code object");
        assert!(outer.co_cellvars.iter().any(|n| n.as_str() == "x"));
    }

    #[test]
    fn rejects_return_outside_function() {
        let err = compile_program("return 1\n", "<test>", Mode::Exec, Arc::new(StringPool::new())).unwrap_err();
        assert!(matches!(err.error, CompileErrorType::ReturnOutsideFunction));
    }

    #[test]
    fn compiles_try_except() {
        let code = compile_ok("try:\n    raise ValueError(1)\nexcept ValueError as e:\n    print(e)\n");
        assert!(!code.is_empty());
    }

    #[test]
    fn compiles_comprehension() {
        let code = compile_ok("xs = [x * 2 for x in range(5) if x % 2 == 0]\n");
        assert!(code.co_consts.iter().any(|c| matches!(c, BcConstant::Code(_))));
    }
}
