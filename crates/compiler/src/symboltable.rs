//! Pre-pass scope classification (spec §4.4 "Scopes").
//!
//! For every name used in a function body, determines whether it is local
//! (assigned somewhere in the body and not declared `global`/`nonlocal`), a
//! free variable (referenced here, bound in an enclosing function), global,
//! or a builtin (not bound anywhere visible, resolved at run time).

use indexmap::{IndexMap, IndexSet};
use protopython_bytecode::NameScope;
use protopython_parser::{Comprehension, Expr, ExprKind, Ident, Params, Stmt, StmtKind};

/// The resolved classification for every name mentioned in one function
/// (or module/class) body, ready for the compiler to consult while
/// emitting `LOAD_FAST`/`LOAD_DEREF`/`LOAD_GLOBAL`/`LOAD_NAME`.
#[derive(Debug, Default)]
pub struct SymbolTable {
    pub scopes: IndexMap<Ident, NameScope>,
    /// Names this scope's nested functions close over — these need a cell
    /// allocated here even though this scope may not itself read them after
    /// binding.
    pub cellvars: IndexSet<Ident>,
    pub freevars: IndexSet<Ident>,
}

struct Collector {
    assigned: IndexSet<Ident>,
    used: IndexSet<Ident>,
    globals: IndexSet<Ident>,
    nonlocals: IndexSet<Ident>,
}

impl Collector {
    fn new() -> Self {
        Collector {
            assigned: IndexSet::new(),
            used: IndexSet::new(),
            globals: IndexSet::new(),
            nonlocals: IndexSet::new(),
        }
    }

    fn visit_stmts(&mut self, stmts: &[Stmt]) {
        for s in stmts {
            self.visit_stmt(s);
        }
    }

    fn bind(&mut self, name: &str) {
        self.assigned.insert(name.to_string());
    }

    fn visit_target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name(n) => self.bind(n),
            ExprKind::Tuple(elts) | ExprKind::List(elts) => {
                for e in elts {
                    self.visit_target(e);
                }
            }
            ExprKind::Starred(inner) => self.visit_target(inner),
            // Attribute/subscript targets don't bind a name in this scope;
            // the base expression is a read.
            ExprKind::Attribute { value, .. } => self.visit_expr(value),
            ExprKind::Subscript { value, slice } => {
                self.visit_expr(value);
                self.visit_expr(slice);
            }
            _ => self.visit_expr(target),
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::FunctionDef { name, decorators, returns, params, .. } => {
                self.bind(name);
                for d in decorators {
                    self.visit_expr(d);
                }
                if let Some(r) = returns {
                    self.visit_expr(r);
                }
                self.visit_params_defaults(params);
            }
            StmtKind::ClassDef { name, bases, keywords, decorators, .. } => {
                self.bind(name);
                for d in decorators {
                    self.visit_expr(d);
                }
                for b in bases {
                    self.visit_expr(b);
                }
                for (_, v) in keywords {
                    self.visit_expr(v);
                }
            }
            StmtKind::Return(v) => {
                if let Some(v) = v {
                    self.visit_expr(v);
                }
            }
            StmtKind::Delete(targets) => {
                for t in targets {
                    self.visit_expr(t);
                }
            }
            StmtKind::Assign { targets, value } => {
                self.visit_expr(value);
                for t in targets {
                    self.visit_target(t);
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.visit_expr(value);
                // Augmented assignment both reads and writes the target.
                if let ExprKind::Name(n) = &target.kind {
                    self.used.insert(n.clone());
                    self.bind(n);
                } else {
                    self.visit_target(target);
                }
            }
            StmtKind::AnnAssign { target, annotation, value } => {
                self.visit_expr(annotation);
                if let Some(v) = value {
                    self.visit_expr(v);
                }
                self.visit_target(target);
            }
            StmtKind::For { target, iter, body, orelse, .. } => {
                self.visit_expr(iter);
                self.visit_target(target);
                self.visit_stmts(body);
                self.visit_stmts(orelse);
            }
            StmtKind::While { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_stmts(body);
                self.visit_stmts(orelse);
            }
            StmtKind::If { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_stmts(body);
                self.visit_stmts(orelse);
            }
            StmtKind::With { items, body, .. } => {
                for item in items {
                    self.visit_expr(&item.context_expr);
                    if let Some(t) = &item.optional_vars {
                        self.visit_target(t);
                    }
                }
                self.visit_stmts(body);
            }
            StmtKind::Raise { exc, cause } => {
                if let Some(e) = exc {
                    self.visit_expr(e);
                }
                if let Some(c) = cause {
                    self.visit_expr(c);
                }
            }
            StmtKind::Try { body, handlers, orelse, finalbody } => {
                self.visit_stmts(body);
                for h in handlers {
                    if let Some(t) = &h.typ {
                        self.visit_expr(t);
                    }
                    if let Some(n) = &h.name {
                        self.bind(n);
                    }
                    self.visit_stmts(&h.body);
                }
                self.visit_stmts(orelse);
                self.visit_stmts(finalbody);
            }
            StmtKind::Assert { test, msg } => {
                self.visit_expr(test);
                if let Some(m) = msg {
                    self.visit_expr(m);
                }
            }
            StmtKind::Import(aliases) => {
                for a in aliases {
                    let bound = a.asname.clone().unwrap_or_else(|| {
                        a.name.split('.').next().unwrap().to_string()
                    });
                    self.bind(&bound);
                }
            }
            StmtKind::ImportFrom { names, .. } => {
                for a in names {
                    if a.name == "*" {
                        continue;
                    }
                    self.bind(a.asname.as_deref().unwrap_or(&a.name));
                }
            }
            StmtKind::Global(names) => {
                for n in names {
                    self.globals.insert(n.clone());
                }
            }
            StmtKind::Nonlocal(names) => {
                for n in names {
                    self.nonlocals.insert(n.clone());
                }
            }
            StmtKind::Expr(e) => self.visit_expr(e),
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
        }
    }

    fn visit_params_defaults(&mut self, params: &Params) {
        for d in &params.defaults {
            self.visit_expr(d);
        }
        for d in params.kw_defaults.iter().flatten() {
            self.visit_expr(d);
        }
        for a in params.args.iter().chain(&params.posonlyargs).chain(&params.kwonlyargs) {
            if let Some(ann) = &a.annotation {
                self.visit_expr(ann);
            }
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::BoolOp { values, .. } => values.iter().for_each(|v| self.visit_expr(v)),
            ExprKind::BinOp { left, right, .. } => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            ExprKind::UnaryOp { operand, .. } => self.visit_expr(operand),
            ExprKind::Lambda { params, body } => {
                self.visit_params_defaults(params);
                // The lambda's own body is a separate scope; defaults are
                // evaluated here, the body is not.
                let _ = body;
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_expr(body);
                self.visit_expr(orelse);
            }
            ExprKind::Dict { keys, values } => {
                for k in keys.iter().flatten() {
                    self.visit_expr(k);
                }
                values.iter().for_each(|v| self.visit_expr(v));
            }
            ExprKind::Set(elts) | ExprKind::List(elts) | ExprKind::Tuple(elts) => {
                elts.iter().for_each(|e| self.visit_expr(e));
            }
            ExprKind::ListComp { generators, .. }
            | ExprKind::SetComp { generators, .. }
            | ExprKind::GeneratorExp { generators, .. } => {
                self.visit_comprehension_outer_iter(generators);
            }
            ExprKind::DictComp { generators, .. } => {
                self.visit_comprehension_outer_iter(generators);
            }
            ExprKind::Yield(v) => {
                if let Some(v) = v {
                    self.visit_expr(v);
                }
            }
            ExprKind::YieldFrom(v) => self.visit_expr(v),
            ExprKind::Await(v) => self.visit_expr(v),
            ExprKind::Compare { left, comparators, .. } => {
                self.visit_expr(left);
                comparators.iter().for_each(|c| self.visit_expr(c));
            }
            ExprKind::Call { func, args, keywords } => {
                self.visit_expr(func);
                args.iter().for_each(|a| self.visit_expr(a));
                keywords.iter().for_each(|(_, v)| self.visit_expr(v));
            }
            ExprKind::JoinedStr(parts) => parts.iter().for_each(|p| self.visit_expr(p)),
            ExprKind::FormattedValue { value, format_spec, .. } => {
                self.visit_expr(value);
                if let Some(s) = format_spec {
                    self.visit_expr(s);
                }
            }
            ExprKind::Constant(_) => {}
            ExprKind::Attribute { value, .. } => self.visit_expr(value),
            ExprKind::Subscript { value, slice } => {
                self.visit_expr(value);
                self.visit_expr(slice);
            }
            ExprKind::Starred(inner) => self.visit_expr(inner),
            ExprKind::Name(n) => {
                self.used.insert(n.clone());
            }
            ExprKind::Slice { lower, upper, step } => {
                for e in [lower, upper, step].into_iter().flatten() {
                    self.visit_expr(e);
                }
            }
        }
    }

    /// Only the outermost comprehension `for`'s iterable is evaluated in
    /// the enclosing scope (spec §4.4: comprehensions compile to an
    /// implicit function taking the outermost iterable as its parameter).
    fn visit_comprehension_outer_iter(&mut self, generators: &[Comprehension]) {
        if let Some(first) = generators.first() {
            self.visit_expr(&first.iter);
        }
    }
}

/// Walks a function/module/class body's direct statements (not nested
/// `def`/`lambda`/comprehension bodies, which get their own table) and
/// classifies every name.
pub fn build_symbol_table(stmts: &[Stmt], params: &Params, is_module: bool, is_class: bool) -> SymbolTable {
    let mut collector = Collector::new();
    for a in &params.posonlyargs {
        collector.bind(&a.name);
    }
    for a in &params.args {
        collector.bind(&a.name);
    }
    if let Some(v) = &params.vararg {
        collector.bind(&v.name);
    }
    for a in &params.kwonlyargs {
        collector.bind(&a.name);
    }
    if let Some(k) = &params.kwarg {
        collector.bind(&k.name);
    }
    collector.visit_stmts(stmts);

    let mut table = SymbolTable::default();
    for name in &collector.nonlocals {
        table.scopes.insert(name.clone(), NameScope::Free);
    }
    for name in &collector.globals {
        table.scopes.insert(name.clone(), NameScope::Global);
    }
    for name in &collector.assigned {
        table.scopes.entry(name.clone()).or_insert(if is_module || is_class {
            NameScope::Global
        } else {
            NameScope::Local
        });
    }
    for name in &collector.used {
        table.scopes.entry(name.clone()).or_insert(NameScope::Builtin);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use protopython_parser::parse_module;

    fn table_for(src: &str) -> SymbolTable {
        let module = parse_module(src).unwrap();
        if let StmtKind::FunctionDef { body, params, .. } = &module.body[0].kind {
            build_symbol_table(body, params, false, false)
        } else {
            panic!("expected a function def");
        }
    }

    #[test]
    fn classifies_locals_and_builtins() {
        let table = table_for("def f(x):\n    y = x + 1\n    print(y)\n    return y\n");
        assert_eq!(table.scopes.get("x"), Some(&NameScope::Local));
        assert_eq!(table.scopes.get("y"), Some(&NameScope::Local));
        assert_eq!(table.scopes.get("print"), Some(&NameScope::Builtin));
    }

    #[test]
    fn global_declaration_overrides_assignment() {
        let table = table_for("def f():\n    global counter\n    counter = 1\n");
        assert_eq!(table.scopes.get("counter"), Some(&NameScope::Global));
    }

    #[test]
    fn nonlocal_declaration_marks_free() {
        let table = table_for("def f():\n    nonlocal acc\n    acc = acc + 1\n");
        assert_eq!(table.scopes.get("acc"), Some(&NameScope::Free));
    }
}
