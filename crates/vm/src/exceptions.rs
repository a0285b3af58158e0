//! Guest-level exceptions: the pending-exception slot, the exception class
//! hierarchy, and `PyResult` (spec §7, SPEC_FULL.md §B.2).
//!
//! There is exactly one error representation the dispatch loop sees: a
//! `Value` living in the per-thread pending-exception slot. `PyResult<T>` is
//! `Result<T, ()>` — the `Err(())` is a plain unwind signal, grounded on the
//! teacher's `PyResult = Result<PyObjectRef, PyObjectRef>` convention but
//! collapsed to a unit error per SPEC_FULL.md §B.2: the caller never needs
//! the exception value itself (it's already in the slot), only the fact
//! that one is pending.

use crate::space::ObjectRef;
use crate::value::Value;
use std::cell::RefCell;

pub type PyResult<T> = Result<T, ()>;

thread_local! {
    static PENDING: RefCell<Option<Value>> = const { RefCell::new(None) };
}

/// Sets the thread-local pending exception, returning the conventional
/// `Err(())` unwind signal so call sites can `return set_exception(...)`.
pub fn set_pending(exc: Value) {
    PENDING.with(|p| *p.borrow_mut() = Some(exc));
}

pub fn raise<T>(exc: Value) -> PyResult<T> {
    set_pending(exc);
    Err(())
}

pub fn take_pending() -> Option<Value> {
    PENDING.with(|p| p.borrow_mut().take())
}

pub fn peek_pending() -> Option<Value> {
    PENDING.with(|p| p.borrow().clone())
}

pub fn is_pending() -> bool {
    PENDING.with(|p| p.borrow().is_some())
}

pub fn clear_pending() {
    PENDING.with(|p| *p.borrow_mut() = None);
}

/// Registered exception type objects (spec §7 taxonomy). Each is a plain
/// type Object (spec §3 "Types as objects"); this struct is just a quick
/// lookup table the environment builds once at bootstrap, mirroring the
/// teacher's `vm.ctx.exceptions` bundle.
#[derive(Clone, Copy)]
pub struct ExceptionTypes {
    pub base_exception: ObjectRef,
    pub exception: ObjectRef,
    pub syntax_error: ObjectRef,
    pub indentation_error: ObjectRef,
    pub name_error: ObjectRef,
    pub attribute_error: ObjectRef,
    pub type_error: ObjectRef,
    pub value_error: ObjectRef,
    pub key_error: ObjectRef,
    pub index_error: ObjectRef,
    pub zero_division_error: ObjectRef,
    pub overflow_error: ObjectRef,
    pub stop_iteration: ObjectRef,
    pub generator_exit: ObjectRef,
    pub keyboard_interrupt: ObjectRef,
    pub system_exit: ObjectRef,
    pub import_error: ObjectRef,
    pub module_not_found_error: ObjectRef,
    pub recursion_error: ObjectRef,
    pub assertion_error: ObjectRef,
    pub memory_error: ObjectRef,
    pub not_implemented_error: ObjectRef,
    pub stop_async_iteration: ObjectRef,
}

/// The declared hierarchy, `(name, parent_field)` edges from `BaseException`
/// down, built by `Environment::bootstrap` (spec §7 taxonomy, with
/// `StopIteration`/`GeneratorExit` as "control-flow sentinels" rather than
/// `Exception` subclasses only by convention — CPython itself makes them
/// siblings of `Exception` directly off `BaseException`, which this mirrors).
pub const HIERARCHY: &[(&str, &str)] = &[
    ("Exception", "BaseException"),
    ("SyntaxError", "Exception"),
    ("IndentationError", "SyntaxError"),
    ("SystemExit", "BaseException"),
    ("KeyboardInterrupt", "BaseException"),
    ("GeneratorExit", "BaseException"),
    ("StopIteration", "Exception"),
    ("StopAsyncIteration", "Exception"),
    ("ArithmeticError", "Exception"),
    ("ZeroDivisionError", "ArithmeticError"),
    ("OverflowError", "ArithmeticError"),
    ("LookupError", "Exception"),
    ("IndexError", "LookupError"),
    ("KeyError", "LookupError"),
    ("NameError", "Exception"),
    ("AttributeError", "Exception"),
    ("TypeError", "Exception"),
    ("ValueError", "Exception"),
    ("AssertionError", "Exception"),
    ("ImportError", "Exception"),
    ("ModuleNotFoundError", "ImportError"),
    ("RuntimeError", "Exception"),
    ("RecursionError", "RuntimeError"),
    ("MemoryError", "Exception"),
    ("NotImplementedError", "RuntimeError"),
];
