//! Object model, memory space, bytecode VM, environment, and import
//! pipeline for the protopython runtime (spec §3, §4).
//!
//! Grounded on the teacher's `vm` crate's own top-level module layout
//! (`vm.rs`/`frame.rs`/`pyobject.rs`/`import.rs` as siblings under one
//! crate), reshaped around this runtime's arena-backed `Space` rather than
//! the teacher's `Rc`/`Arc`-refcounted object graph.

pub mod builtins;
pub mod collections;
pub mod environment;
pub mod exceptions;
pub mod frame;
pub mod function;
pub mod generator;
pub mod import;
pub mod object;
pub mod space;
pub mod value;
pub mod vm;

pub use environment::Environment;
pub use exceptions::{raise, PyResult};
pub use frame::{ExecutionResult, Frame};
pub use function::FuncArgs;
pub use object::{NativeFn, ObjectData, Payload};
pub use space::{ObjectRef, Space};
pub use value::Value;
pub use vm::{Interpreter, VirtualMachine};
