//! Generator/coroutine resumption built on frame suspension (spec §4.5
//! "Generator calls", GLOSSARY "Generator").
//!
//! A generator Object wraps a paused `Frame`; `next`/`send` resume it by
//! re-entering the dispatch loop at its saved `pc` with the value stack
//! exactly as `YIELD_VALUE` left it. Per spec §9 ("Coroutines vs
//! generators"), `async def` bodies reuse this same primitive and are
//! distinguished only by `CodeFlags::IS_COROUTINE` and the wrapping type
//! prototype (`generator` vs `coroutine`), not a separate suspension
//! mechanism. The frame is `Arc<PyMutex<Frame>>`, the same representation
//! `VirtualMachine::frames` uses, so a resumed generator's frame is pushed
//! onto the call stack like any other and traced by `VirtualMachine::collect`
//! the same way.

use crate::exceptions::{raise, PyResult};
use crate::frame::{ExecutionResult, Frame};
use crate::value::Value;
use crate::vm::VirtualMachine;
use protopython_common::lock::PyMutex;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GeneratorPhase {
    /// Never resumed yet; `next`/`send` start the frame from `pc == 0`.
    Created,
    Suspended,
    Running,
    Exhausted,
}

pub struct GeneratorState {
    pub frame: Arc<PyMutex<Frame>>,
    pub phase: GeneratorPhase,
    pub is_coroutine: bool,
}

impl GeneratorState {
    pub fn new(frame: Arc<PyMutex<Frame>>, is_coroutine: bool) -> Self {
        GeneratorState {
            frame,
            phase: GeneratorPhase::Created,
            is_coroutine,
        }
    }
}

/// Resumes a suspended generator, sending `sent` in as the value of the
/// `yield` expression that paused it (spec §4.5 "Generator calls"). On a
/// fresh `Created` generator `sent` is ignored (there is no pending `yield`
/// expression to receive it yet) — matching CPython's requirement that the
/// first `send()` call pass `None`, just without raising on anything else.
///
/// Returns `Ok(v)` for a newly yielded value; `Err(())` for either an
/// ordinary propagated exception or (the frame returning normally) a
/// `StopIteration` carrying its return value in the pending slot — callers
/// distinguish the two the same way any `__next__` caller does, by checking
/// the pending exception's class.
pub fn resume(vm: &mut VirtualMachine, gen: &Arc<PyMutex<GeneratorState>>, sent: Value) -> PyResult<Value> {
    let frame = {
        let mut state = gen.lock();
        match state.phase {
            GeneratorPhase::Exhausted => {
                return raise(vm.new_error(vm.env.exc.stop_iteration, "generator already exhausted"));
            }
            GeneratorPhase::Running => {
                return raise(vm.new_value_error("generator already executing"));
            }
            GeneratorPhase::Created => {}
            GeneratorPhase::Suspended => frame_push_sent(&state.frame, sent),
        }
        state.phase = GeneratorPhase::Running;
        Arc::clone(&state.frame)
    };

    if vm.frames.len() >= vm.recursion_limit {
        gen.lock().phase = GeneratorPhase::Exhausted;
        return raise(vm.new_error(vm.env.exc.recursion_error, "maximum recursion depth exceeded"));
    }

    vm.frames.push(Arc::clone(&frame));
    let result = crate::vm::dispatch::run(vm, &frame);
    vm.frames.pop();

    match result {
        Ok(ExecutionResult::Yield(v)) => {
            gen.lock().phase = GeneratorPhase::Suspended;
            Ok(v)
        }
        Ok(ExecutionResult::Return(v)) => {
            gen.lock().phase = GeneratorPhase::Exhausted;
            raise(vm.new_stop_iteration(v))
        }
        Err(()) => {
            gen.lock().phase = GeneratorPhase::Exhausted;
            Err(())
        }
    }
}

fn frame_push_sent(frame: &Arc<PyMutex<Frame>>, sent: Value) {
    frame.lock().push(sent);
}
