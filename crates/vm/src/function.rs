//! Call arguments and parameter binding (spec §4.5 "Call dispatch").
//!
//! Grounded on the teacher's `PyFuncArgs { args: Vec<PyObjectRef>, kwargs:
//! Vec<(String, PyObjectRef)> }` and on `examples/original_source/`'s
//! `ExecutionEngine.cpp`, which assembles a fresh argument list *before*
//! invoking `__call__` rather than handing the callee a borrowed stack
//! window — `CALL_FUNCTION`/`CALL_FUNCTION_KW`/`CALL_FUNCTION_EX` all build a
//! `FuncArgs` first.

use crate::exceptions::{raise, PyResult};
use crate::object::{Payload, UserFunction};
use crate::value::Value;
use crate::vm::VirtualMachine;
use indexmap::IndexMap;
use protopython_common::InternedStr;

#[derive(Clone, Default)]
pub struct FuncArgs {
    pub args: Vec<Value>,
    pub kwargs: IndexMap<InternedStr, Value>,
}

impl FuncArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        FuncArgs {
            args,
            kwargs: IndexMap::new(),
        }
    }
}

/// Binds `call_args` to a fresh frame's local variable slots, following
/// Python's parameter-binding rules (spec §4.5(b): "positional-only,
/// defaults, `*args`, `**kwargs`"). `slots` is indexed exactly like
/// `code.co_varnames`; unfilled slots stay `Value::None` (cells are
/// populated separately once the frame decides which varnames are promoted
/// to cellvars).
pub fn bind_params(
    vm: &mut VirtualMachine,
    func: &UserFunction,
    mut call_args: FuncArgs,
    slots: &mut [Value],
) -> PyResult<()> {
    let code = &func.code;
    let nparams = code.co_nparams;
    let has_varargs = code
        .flags
        .contains(protopython_bytecode::CodeFlags::HAS_VARARGS);
    let has_varkw = code
        .flags
        .contains(protopython_bytecode::CodeFlags::HAS_VARKEYWORDS);
    let vararg_slot = if has_varargs { Some(nparams) } else { None };
    let varkw_slot = if has_varkw {
        Some(nparams + has_varargs as usize)
    } else {
        None
    };

    let positional_params = nparams;
    let mut filled = vec![false; slots.len()];

    let n_pos = call_args.args.len().min(positional_params);
    for (i, arg) in call_args.args.drain(..n_pos).enumerate() {
        slots[i] = arg;
        filled[i] = true;
    }

    if !call_args.args.is_empty() {
        match vararg_slot {
            Some(slot) => {
                slots[slot] = vm.new_tuple(call_args.args.drain(..).collect());
                filled[slot] = true;
            }
            None => {
                return raise(vm.new_type_error(format!(
                    "{}() takes {} positional arguments but {} were given",
                    func.name,
                    positional_params,
                    n_pos + call_args.args.len()
                )));
            }
        }
    }

    let mut extra_kwargs = IndexMap::new();
    for (name, value) in call_args.kwargs.drain(..) {
        if let Some(idx) = code.co_varnames.iter().position(|v| *v == name) {
            if idx < positional_params + code.co_kwonly_count && !filled[idx] {
                slots[idx] = value;
                filled[idx] = true;
                continue;
            }
        }
        extra_kwargs.insert(name, value);
    }

    if !extra_kwargs.is_empty() {
        match varkw_slot {
            Some(slot) => {
                slots[slot] = vm.new_dict_from_pairs(
                    extra_kwargs
                        .into_iter()
                        .map(|(k, v)| (vm.new_str(k.as_str()), v))
                        .collect(),
                )?;
                filled[slot] = true;
            }
            None => {
                let name = extra_kwargs.keys().next().cloned().unwrap();
                return raise(vm.new_type_error(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    func.name, name
                )));
            }
        }
    }

    for i in 0..positional_params + code.co_kwonly_count {
        if filled[i] {
            continue;
        }
        if let Some(default) = default_for(func, code, i) {
            slots[i] = default;
        } else {
            return raise(vm.new_type_error(format!(
                "{}() missing required argument: '{}'",
                func.name,
                code.co_varnames[i]
            )));
        }
    }

    if let Some(slot) = vararg_slot {
        if !filled[slot] {
            slots[slot] = vm.new_tuple(Vec::new());
        }
    }
    if let Some(slot) = varkw_slot {
        if !filled[slot] {
            slots[slot] = vm.new_dict_from_pairs(Vec::new())?;
        }
    }

    Ok(())
}

fn default_for(func: &UserFunction, code: &protopython_bytecode::CodeObject, idx: usize) -> Option<Value> {
    let nparams = code.co_nparams;
    if idx < nparams {
        let n_defaults = func.defaults.len();
        let first_defaulted = nparams.saturating_sub(n_defaults);
        if idx >= first_defaulted {
            return func.defaults.get(idx - first_defaulted).cloned();
        }
        None
    } else {
        func.kw_defaults.get(&code.co_varnames[idx]).cloned()
    }
}

/// Resolves the callable on top of the stack to the value the VM should
/// actually invoke, following spec §4.5(a)-(d): a bound native method, a
/// user function, a type (whose `__call__` constructs an instance), or any
/// other Object with a `__call__` attribute — looked up exactly like any
/// other attribute, matching `examples/original_source/`'s
/// `invokeCallable`, which resolves `__call__` via ordinary attribute
/// lookup rather than a dedicated "is this callable" tag.
pub fn call_value(vm: &mut VirtualMachine, callee: Value, args: FuncArgs) -> PyResult<Value> {
    if let Value::Object(r) = &callee {
        let payload = vm.space.get(*r).read().payload.clone();
        match payload {
            Payload::Native(f) => return f(vm, args),
            Payload::Function(func) => return vm.call_user_function(func, args),
            Payload::BoundMethod(bm) => {
                let mut full = FuncArgs {
                    args: std::iter::once(bm.receiver).chain(args.args).collect(),
                    kwargs: args.kwargs,
                };
                return call_value(vm, bm.func, std::mem::take(&mut full));
            }
            _ => {}
        }
    }
    let call_attr = vm.get_attribute(callee.clone(), "__call__")?;
    match call_attr {
        Some(call_attr) => call_value(vm, call_attr, args),
        None => raise(vm.new_type_error(format!("'{}' object is not callable", vm.type_name(&callee)))),
    }
}
