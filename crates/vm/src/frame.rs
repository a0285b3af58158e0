//! The per-call activation record: value stack, block stack, program
//! counter (spec §3 "Frame", §4.5).
//!
//! Grounded on the teacher's early `Frame { code, stack, blocks, locals,
//! lasti }` / `Block::{Loop,TryExcept,With}` / `ExecutionResult::{Return,
//! Yield}` shape (`examples/RustPython-RustPython/vm/src/frame.rs`), with
//! `Loop` dropped: this compiler patches `break`/`continue` to absolute
//! jump targets at compile time (spec §4.4 "recorded on a compiler-internal
//! loop stack"), so the VM block stack only ever needs to unwind exception
//! and with-statement handlers, not loop boundaries.

use crate::object::Cell;
use crate::space::ObjectRef;
use crate::value::Value;
use protopython_bytecode::CodeObject;
use protopython_common::lock::PyMutex;
use std::sync::Arc;

/// A handler frame pushed by `SETUP_FINALLY`/`SETUP_WITH`, popped either by
/// `POP_BLOCK` on the normal-exit path or by exception unwinding.
///
/// `Handler` and `With` carry the same two fields and unwind identically —
/// the only difference is what compiled code sits at `handler`: an
/// isinstance-dispatch chain for `Handler`, always `WITH_CLEANUP`+`RERAISE`
/// for `With`. The context manager `WITH_CLEANUP` needs is *not* stored
/// here: the block is already popped (by `POP_BLOCK` or by unwinding) by
/// the time `WITH_CLEANUP` runs, so it lives in `Frame::with_stack` instead,
/// pushed by `SETUP_WITH` and popped by `WITH_CLEANUP` on its own schedule.
#[derive(Clone)]
pub enum Block {
    /// `try` block: `handler` is the absolute PC of the except-chain
    /// dispatch; `stack_depth` is the value stack depth to restore to
    /// before pushing the exception object there.
    Handler { handler: usize, stack_depth: usize },
    /// `with` block: as `Handler`, but `handler` points at a
    /// `WITH_CLEANUP`/`RERAISE` pair.
    With { handler: usize, stack_depth: usize },
}

impl Block {
    pub fn handler_pc(&self) -> usize {
        match self {
            Block::Handler { handler, .. } => *handler,
            Block::With { handler, .. } => *handler,
        }
    }

    pub fn stack_depth(&self) -> usize {
        match self {
            Block::Handler { stack_depth, .. } => *stack_depth,
            Block::With { stack_depth, .. } => *stack_depth,
        }
    }
}

/// What happened when a frame finished running without raising (spec §4.5
/// "Generator calls" / normal return).
pub enum ExecutionResult {
    Return(Value),
    Yield(Value),
}

pub type FrameResult = Result<ExecutionResult, ()>;

pub struct Frame {
    pub code: Arc<CodeObject>,
    pub pc: usize,
    pub stack: Vec<Value>,
    pub blocks: Vec<Block>,
    /// `co_varnames`-indexed local slots, used when the compiler emitted
    /// `LOAD_FAST`/`STORE_FAST` (function scopes).
    pub fastlocals: Vec<Value>,
    /// `co_cellvars`-indexed cells, shared with any nested closures.
    pub cells: Vec<Arc<Cell>>,
    /// `co_freevars`-indexed cells, supplied by the enclosing scope at
    /// `MAKE_FUNCTION` time.
    pub freevars: Vec<Arc<Cell>>,
    /// The module Object serving as `f_globals`.
    pub globals: ObjectRef,
    /// `f_locals`: for module/class scopes this is the namespace
    /// `LOAD_NAME`/`STORE_NAME` read and write; `None` for function scopes,
    /// which use `fastlocals` exclusively (spec §3 "typically the frame
    /// itself for module/function scopes" — here split into an explicit
    /// namespace object only where the compiler actually needs one).
    pub locals_ns: Option<ObjectRef>,
    pub f_back: Option<Arc<PyMutex<Frame>>>,
    /// Context managers entered by `SETUP_WITH`, most-recently-entered last;
    /// `WITH_CLEANUP` pops the matching one regardless of which path (normal
    /// exit or exception unwind) got it there.
    pub with_stack: Vec<Value>,
    /// Set once a `YIELD_VALUE` has paused this frame (spec §4.5 "Generator
    /// calls"); resuming re-enters `run` from `pc` with `stack` intact.
    pub running: bool,
}

impl Frame {
    pub fn new(
        code: Arc<CodeObject>,
        globals: ObjectRef,
        locals_ns: Option<ObjectRef>,
        f_back: Option<Arc<PyMutex<Frame>>>,
    ) -> Self {
        let cells = (0..code.co_cellvars.len())
            .map(|_| Arc::new(Cell::new(None)))
            .collect();
        Frame {
            fastlocals: vec![Value::None; code.co_varnames.len()],
            cells,
            freevars: Vec::new(),
            code,
            pc: 0,
            stack: Vec::new(),
            blocks: Vec::new(),
            globals,
            locals_ns,
            f_back,
            with_stack: Vec::new(),
            running: false,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    pub fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let at = self.stack.len() - n;
        self.stack.split_off(at)
    }

    pub fn top(&self) -> &Value {
        self.stack.last().expect("value stack underflow")
    }

    pub fn nth_from_top(&self, n: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - n]
    }

    pub fn truncate_to(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    pub fn push_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn pop_block(&mut self) -> Option<Block> {
        self.blocks.pop()
    }

    /// Unwinds the block stack looking for the nearest handler (spec §7
    /// "Propagation"). Returns the handler PC to jump to, restoring the
    /// value stack to that handler's recorded depth; `None` if no handler
    /// remains, meaning the caller should propagate the pending exception.
    /// `With` blocks stop unwinding exactly like `Handler` blocks — their
    /// target always re-raises once `WITH_CLEANUP` has run `__exit__`.
    pub fn unwind_to_handler(&mut self) -> Option<usize> {
        let block = self.blocks.pop()?;
        self.truncate_to(block.stack_depth());
        Some(block.handler_pc())
    }

    pub fn jump(&mut self, target: usize) {
        self.pc = target;
    }

    pub fn trace(&self, worklist: &mut Vec<ObjectRef>) {
        for v in &self.stack {
            if let Value::Object(r) = v {
                worklist.push(*r);
            }
        }
        for v in &self.fastlocals {
            if let Value::Object(r) = v {
                worklist.push(*r);
            }
        }
        for cell in self.cells.iter().chain(self.freevars.iter()) {
            if let Some(Value::Object(r)) = cell.0.lock().as_ref() {
                worklist.push(*r);
            }
        }
        worklist.push(self.globals);
        if let Some(ns) = self.locals_ns {
            worklist.push(ns);
        }
        for v in &self.with_stack {
            if let Value::Object(r) = v {
                worklist.push(*r);
            }
        }
    }
}
