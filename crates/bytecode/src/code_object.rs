//! The code object: the compiler's output and the VM's input (spec §3
//! "Code object", §4.4).

use crate::opcode::Opcode;
use bitflags::bitflags;
use protopython_common::{InternedStr, Location, StringPool};
use std::sync::Arc;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CodeFlags: u16 {
        const HAS_VARARGS     = 0x01;
        const HAS_VARKEYWORDS = 0x02;
        const HAS_DEFAULTS    = 0x04;
        const HAS_KW_DEFAULTS = 0x08;
        const IS_GENERATOR    = 0x10;
        const IS_COROUTINE    = 0x20;
        const NEW_LOCALS      = 0x40;
    }
}

/// A literal value that can appear in `co_consts`. Compound containers are
/// restricted to other constants so the whole pool stays tree-shaped;
/// non-literal values (e.g. a freshly built `list`) are produced by opcodes
/// (`BUILD_LIST`) at run time instead of living in `co_consts`.
#[derive(Clone, Debug)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Tuple(Arc<[Constant]>),
    /// A nested code object, produced by `def`/`lambda`/comprehension/class
    /// bodies and consumed by `MAKE_FUNCTION`.
    Code(Arc<CodeObject>),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            // NaN != NaN, matching co_consts dedup by *value*-equality (spec
            // §4.4): two separately-compiled NaN literals are not deduped.
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Code(a), Self::Code(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// How a variable name used in a function body is bound (spec §4.4
/// "Scopes").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameScope {
    /// Assigned somewhere in the body, not declared `global`/`nonlocal`.
    Local,
    /// Referenced, bound in an enclosing function: closed over via a cell.
    Free,
    /// Declared `global`, or assigned at module scope.
    Global,
    /// Not assigned anywhere visible; resolved through builtins at run time.
    Builtin,
}

/// One compiled unit: a module, function, lambda, comprehension or class
/// body (spec §3 "Code object").
#[derive(Clone, Debug)]
pub struct CodeObject {
    /// Flat `[opcode, arg, opcode, arg, ...]` stream (spec §4.4).
    pub co_code: Vec<i32>,
    pub co_consts: Vec<Constant>,
    pub co_names: Vec<InternedStr>,
    pub co_varnames: Vec<InternedStr>,
    pub co_cellvars: Vec<InternedStr>,
    pub co_freevars: Vec<InternedStr>,
    pub co_nparams: usize,
    pub co_posonly_count: usize,
    pub co_kwonly_count: usize,
    pub locations: Vec<Location>,
    pub flags: CodeFlags,
    pub co_filename: Arc<str>,
    pub co_name: InternedStr,
    pub first_line_number: u32,
}

impl CodeObject {
    pub fn new(filename: impl Into<Arc<str>>, name: &str, pool: &StringPool) -> Self {
        CodeObject {
            co_code: Vec::new(),
            co_consts: Vec::new(),
            co_names: Vec::new(),
            co_varnames: Vec::new(),
            co_cellvars: Vec::new(),
            co_freevars: Vec::new(),
            co_nparams: 0,
            co_posonly_count: 0,
            co_kwonly_count: 0,
            locations: Vec::new(),
            flags: CodeFlags::NEW_LOCALS,
            co_filename: filename.into(),
            co_name: pool.intern(name),
            first_line_number: 1,
        }
    }

    /// Appends one `(opcode, arg)` pair and returns the PC (stream offset)
    /// it was written at, so callers can later patch jump targets.
    pub fn emit(&mut self, opcode: Opcode, arg: i32, location: Location) -> usize {
        let pc = self.co_code.len();
        self.co_code.push(opcode as u8 as i32);
        self.co_code.push(arg);
        self.locations.push(location);
        pc
    }

    pub fn patch_arg(&mut self, pc: usize, arg: i32) {
        self.co_code[pc + 1] = arg;
    }

    /// Decodes the instruction at `pc`. Returns `None` past the end of the
    /// stream or on an unrecognized opcode byte.
    pub fn decode(&self, pc: usize) -> Option<(Opcode, i32)> {
        let op = *self.co_code.get(pc)?;
        let arg = *self.co_code.get(pc + 1)?;
        Some((Opcode::from_i32(op)?, arg))
    }

    pub fn len(&self) -> usize {
        self.co_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.co_code.is_empty()
    }

    pub fn location_for(&self, pc: usize) -> Location {
        self.locations
            .get(pc / 2)
            .copied()
            .unwrap_or_else(|| Location::new(self.first_line_number, 0))
    }

    /// Interns `name` through `pool` and returns its index in `co_names`,
    /// deduplicating (spec §4.4: "co_names: unique interned strings").
    pub fn intern_name(&mut self, name: &str, pool: &StringPool) -> i32 {
        let interned = pool.intern(name);
        if let Some(idx) = self.co_names.iter().position(|n| *n == interned) {
            return idx as i32;
        }
        self.co_names.push(interned);
        (self.co_names.len() - 1) as i32
    }

    /// Adds `value` to `co_consts`, deduplicating hashable/value-equal
    /// constants (spec §4.4: "co_consts ... deduplicated by value-equality
    /// for hashable literals").
    pub fn add_const(&mut self, value: Constant) -> i32 {
        if let Some(idx) = self.co_consts.iter().position(|c| *c == value) {
            return idx as i32;
        }
        self.co_consts.push(value);
        (self.co_consts.len() - 1) as i32
    }
}

impl std::fmt::Display for CodeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<code object {} at {}, line {}>",
            self.co_name, self.co_filename, self.first_line_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_advances_pc_by_two_slots() {
        let mut code = CodeObject::new("<test>", "<module>", &StringPool::new());
        let loc = Location::new(1, 0);
        let pc0 = code.emit(Opcode::LOAD_CONST, 0, loc);
        let pc1 = code.emit(Opcode::RETURN_VALUE, 0, loc);
        assert_eq!(pc0, 0);
        assert_eq!(pc1, 2);
        assert_eq!(code.len(), 4);
    }

    #[test]
    fn const_dedup_by_value() {
        let mut code = CodeObject::new("<test>", "<module>", &StringPool::new());
        let a = code.add_const(Constant::Int(1));
        let b = code.add_const(Constant::Int(1));
        let c = code.add_const(Constant::Int(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(code.co_consts.len(), 2);
    }

    #[test]
    fn names_are_unique() {
        let pool = StringPool::new();
        let mut code = CodeObject::new("<test>", "<module>", &pool);
        let a = code.intern_name("x", &pool);
        let b = code.intern_name("y", &pool);
        let c = code.intern_name("x", &pool);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(code.co_names.len(), 2);
    }
}
