//! The three ways a chunk of source text can be compiled, matching the
//! teacher's `compiler/src/mode.rs`.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// A module body or a script: statements, result discarded.
    Exec,
    /// A single expression (`eval()`, `-c` with expression-only source):
    /// the value is left for the caller rather than printed.
    Eval,
    /// A single interactive statement: non-`None` expression statements
    /// are auto-printed, matching the REPL's `>>> ` behavior.
    Single,
}
