//! AST-to-bytecode compiler: symbol tables, code generation, and the
//! `Mode`/`CompileError` types callers use to drive it (spec §4.4).

mod compile;
mod error;
mod mode;
mod symboltable;

pub use compile::{compile_program, Compiler};
pub use error::{CompileError, CompileErrorType};
pub use mode::Mode;
pub use symboltable::{build_symbol_table, SymbolTable};
