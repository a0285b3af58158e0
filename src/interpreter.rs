//! Thin wrapper assembling a `protopython_vm::Interpreter` from parsed
//! `Settings` (SPEC_FULL.md §B.1).
//!
//! Grounded on the teacher's `interpreter.rs` (an `InterpreterBuilderExt`
//! extension trait around `rustpython_vm::Interpreter::with_init` that wires
//! up stdlib module tables); this runtime's `Interpreter` has no
//! stdlib-freezing story to hook into, so the builder collapses to plumbing
//! search paths through.

use crate::settings::Settings;
use protopython_vm::Interpreter;

pub fn build_interpreter(settings: &Settings) -> Interpreter {
    Interpreter::new(settings.search_paths.clone())
}
