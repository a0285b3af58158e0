//! The `builtins` module: names visible without an explicit import (spec
//! §4.6 "Name resolution" falls through to `builtins` last; SPEC_FULL.md
//! ambient-stack "a minimal but real standard library surface").
//!
//! Grounded on the teacher's `vm/builtins.rs` (`#[pyfunction]` definitions
//! registered into a `builtins` module at `VirtualMachine::new` time),
//! narrowed to native-Rust closures registered directly as `Payload::Native`
//! Objects rather than through a derive macro — this runtime has no
//! `#[pyfunction]` proc-macro layer, so each builtin is a plain
//! `fn(&mut VirtualMachine, FuncArgs) -> PyResult<Value>`.

mod methods;
pub mod sys;

use crate::collections::{chain_find, chain_insert, py_hash};
use crate::exceptions::{raise, PyResult};
use crate::function::FuncArgs;
use crate::object::{HashChain, NativeFn, ObjectData, Payload};
use crate::space::ObjectRef;
use crate::value::Value;
use crate::vm::dispatch;
use crate::vm::VirtualMachine;
use std::sync::Arc;

fn register(vm: &mut VirtualMachine, name: &str, f: NativeFn) {
    let r = vm.space.alloc(ObjectData::with_payload(
        vm.env.types.function,
        vec![vm.env.types.object],
        Payload::Native(f),
    ));
    vm.space.get(vm.env.builtins_module).write().attrs.insert(vm.space.intern(name), Value::Object(r));
}

/// Registers `name` as a type prototype's callable constructor: `type_ref`
/// gets a native `__call__`, and `name` in `builtins` resolves to the type
/// object itself so `isinstance(x, int)`/`type(x) is int` see the same
/// Object that `int(...)` constructs from.
fn register_type_ctor(vm: &mut VirtualMachine, type_ref: ObjectRef, name: &str, f: NativeFn) {
    let ctor = vm.space.alloc(ObjectData::with_payload(
        vm.env.types.function,
        vec![vm.env.types.object],
        Payload::Native(f),
    ));
    vm.space.get(type_ref).write().attrs.insert(vm.space.intern("__call__"), Value::Object(ctor));
    vm.space.get(vm.env.builtins_module).write().attrs.insert(vm.space.intern(name), Value::Object(type_ref));
}

/// Populates the `builtins` module with every name this runtime resolves
/// through `Environment::resolve`'s builtins fallback (spec §4.6).
pub fn install(vm: &mut VirtualMachine) {
    register(vm, "print", Arc::new(bi_print));
    register(vm, "len", Arc::new(bi_len));
    register(vm, "repr", Arc::new(bi_repr));
    register(vm, "isinstance", Arc::new(bi_isinstance));
    register(vm, "issubclass", Arc::new(bi_issubclass));
    register(vm, "getattr", Arc::new(bi_getattr));
    register(vm, "setattr", Arc::new(bi_setattr));
    register(vm, "hasattr", Arc::new(bi_hasattr));
    register(vm, "callable", Arc::new(bi_callable));
    register(vm, "iter", Arc::new(bi_iter));
    register(vm, "next", Arc::new(bi_next));
    register(vm, "range", Arc::new(bi_range));
    register(vm, "abs", Arc::new(bi_abs));
    register(vm, "min", Arc::new(bi_min));
    register(vm, "max", Arc::new(bi_max));
    register(vm, "sum", Arc::new(bi_sum));
    register(vm, "id", Arc::new(bi_id));
    register(vm, "hash", Arc::new(bi_hash));
    register(vm, "all", Arc::new(bi_all));
    register(vm, "any", Arc::new(bi_any));
    register(vm, "sorted", Arc::new(bi_sorted));
    register(vm, "enumerate", Arc::new(bi_enumerate));
    register(vm, "zip", Arc::new(bi_zip));

    register_type_ctor(vm, vm.env.types.type_, "type", Arc::new(bi_type));
    register_type_ctor(vm, vm.env.types.str_, "str", Arc::new(bi_str));
    register_type_ctor(vm, vm.env.types.int, "int", Arc::new(bi_int));
    register_type_ctor(vm, vm.env.types.float, "float", Arc::new(bi_float));
    register_type_ctor(vm, vm.env.types.bool_, "bool", Arc::new(bi_bool));
    register_type_ctor(vm, vm.env.types.list, "list", Arc::new(bi_list));
    register_type_ctor(vm, vm.env.types.tuple, "tuple", Arc::new(bi_tuple));
    register_type_ctor(vm, vm.env.types.set, "set", Arc::new(bi_set));
    register_type_ctor(vm, vm.env.types.dict, "dict", Arc::new(bi_dict));

    for (r, name) in [
        (vm.env.exc.base_exception, "BaseException"),
        (vm.env.exc.exception, "Exception"),
        (vm.env.exc.syntax_error, "SyntaxError"),
        (vm.env.exc.indentation_error, "IndentationError"),
        (vm.env.exc.name_error, "NameError"),
        (vm.env.exc.attribute_error, "AttributeError"),
        (vm.env.exc.type_error, "TypeError"),
        (vm.env.exc.value_error, "ValueError"),
        (vm.env.exc.key_error, "KeyError"),
        (vm.env.exc.index_error, "IndexError"),
        (vm.env.exc.zero_division_error, "ZeroDivisionError"),
        (vm.env.exc.overflow_error, "OverflowError"),
        (vm.env.exc.stop_iteration, "StopIteration"),
        (vm.env.exc.generator_exit, "GeneratorExit"),
        (vm.env.exc.keyboard_interrupt, "KeyboardInterrupt"),
        (vm.env.exc.system_exit, "SystemExit"),
        (vm.env.exc.import_error, "ImportError"),
        (vm.env.exc.module_not_found_error, "ModuleNotFoundError"),
        (vm.env.exc.recursion_error, "RecursionError"),
        (vm.env.exc.assertion_error, "AssertionError"),
        (vm.env.exc.memory_error, "MemoryError"),
        (vm.env.exc.not_implemented_error, "NotImplementedError"),
        (vm.env.exc.stop_async_iteration, "StopAsyncIteration"),
    ] {
        vm.space.get(vm.env.builtins_module).write().attrs.insert(vm.space.intern(name), Value::Object(r));
    }
    vm.space.get(vm.env.builtins_module).write().attrs.insert(vm.space.intern("object"), Value::Object(vm.env.types.object));
    vm.space.get(vm.env.builtins_module).write().attrs.insert(vm.space.intern("bytes"), Value::Object(vm.env.types.bytes));
    vm.space.get(vm.env.builtins_module).write().attrs.insert(vm.space.intern("True"), Value::Bool(true));
    vm.space.get(vm.env.builtins_module).write().attrs.insert(vm.space.intern("False"), Value::Bool(false));
    vm.space.get(vm.env.builtins_module).write().attrs.insert(vm.space.intern("None"), Value::None);

    methods::install(vm);
}

fn bi_print(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let sep = args
        .kwargs
        .get(&vm.space.intern("sep"))
        .map(|v| vm.str_of(v))
        .transpose()?
        .unwrap_or_else(|| " ".to_string());
    let end = args
        .kwargs
        .get(&vm.space.intern("end"))
        .map(|v| vm.str_of(v))
        .transpose()?
        .unwrap_or_else(|| "\n".to_string());
    let mut parts = Vec::with_capacity(args.args.len());
    for v in &args.args {
        parts.push(vm.str_of(v)?);
    }
    print!("{}{}", parts.join(&sep), end);
    Ok(Value::None)
}

/// Pulls the sole positional argument a builtin expects, raising the same
/// `TypeError` CPython does for a missing one rather than panicking.
fn one_arg<'a>(vm: &mut VirtualMachine, args: &'a FuncArgs, name: &str) -> PyResult<&'a Value> {
    match args.args.first() {
        Some(v) => Ok(v),
        None => raise(vm.new_type_error(format!("{name}() missing required positional argument"))),
    }
}

fn bi_len(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "len")?.clone();
    if let Some(method) = vm.get_attribute(v.clone(), "__len__")? {
        return vm.call_value(method, FuncArgs::positional(vec![]));
    }
    if let Value::Object(r) = &v {
        let n = match &vm.space.get(*r).read().payload {
            Payload::List(items) => items.len(),
            Payload::Tuple(items) => items.len(),
            Payload::Str(s) => s.chars().count(),
            Payload::Bytes(b) => b.len(),
            Payload::Dict(chain, _) => chain.len(),
            Payload::Set(chain) => chain.len(),
            _ => return raise(vm.new_type_error(format!("object of type '{}' has no len()", vm.type_name(&v)))),
        };
        return Ok(Value::Int(n as i64));
    }
    raise(vm.new_type_error(format!("object of type '{}' has no len()", vm.type_name(&v))))
}

fn bi_repr(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "repr")?.clone();
    let s = vm.repr_of(&v)?;
    Ok(vm.new_str(&s))
}

fn bi_str(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    match args.args.first() {
        Some(v) => {
            let s = vm.str_of(v)?;
            Ok(vm.new_str(&s))
        }
        None => Ok(vm.new_str("")),
    }
}

fn bi_int(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    match args.args.first() {
        None => Ok(Value::Int(0)),
        Some(v) => match v {
            Value::Int(_) => Ok(v.clone()),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::Object(r) => match &vm.space.get(*r).read().payload.clone() {
                Payload::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| ())
                    .or_else(|_| raise(vm.new_value_error(format!("invalid literal for int() with base 10: '{s}'")))),
                _ => raise(vm.new_type_error(format!("int() argument must be a string or a number, not '{}'", vm.type_name(v)))),
            },
            Value::None => raise(vm.new_type_error("int() argument must be a string or a number, not 'NoneType'")),
        },
    }
}

fn bi_float(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    match args.args.first() {
        None => Ok(Value::Float(0.0)),
        Some(v) => match v.as_float() {
            Some(f) => Ok(Value::Float(f)),
            None => match v {
                Value::Object(r) => match &vm.space.get(*r).read().payload.clone() {
                    Payload::Str(s) => s
                        .trim()
                        .parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| ())
                        .or_else(|_| raise(vm.new_value_error(format!("could not convert string to float: '{s}'")))),
                    _ => raise(vm.new_type_error("float() argument must be a string or a number")),
                },
                _ => raise(vm.new_type_error("float() argument must be a string or a number")),
            },
        },
    }
}

fn bi_bool(vm: &mut VirtualMachine, mut args: FuncArgs) -> PyResult<Value> {
    match args.args.pop() {
        Some(v) => Ok(Value::Bool(vm.is_truthy(&v))),
        None => Ok(Value::Bool(false)),
    }
}

fn bi_list(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    match args.args.first().cloned() {
        Some(v) => {
            let items = dispatch::items_of(vm, &v)?;
            Ok(vm.new_list(items))
        }
        None => Ok(vm.new_list(Vec::new())),
    }
}

fn bi_tuple(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    match args.args.first().cloned() {
        Some(v) => {
            let items = dispatch::items_of(vm, &v)?;
            Ok(vm.new_tuple(items))
        }
        None => Ok(vm.new_tuple(Vec::new())),
    }
}

fn bi_set(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let mut chain = HashChain::new();
    if let Some(v) = args.args.first().cloned() {
        for item in dispatch::items_of(vm, &v)? {
            chain = chain_insert(vm, &chain, item, Value::None)?;
        }
    }
    Ok(vm.new_set(chain))
}

fn bi_dict(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let mut pairs = Vec::new();
    if let Some(v) = args.args.first().cloned() {
        for item in dispatch::items_of(vm, &v)? {
            let parts = dispatch::items_of(vm, &item)?;
            if parts.len() == 2 {
                pairs.push((parts[0].clone(), parts[1].clone()));
            }
        }
    }
    for (k, v) in args.kwargs {
        pairs.push((vm.new_str(k.as_str()), v));
    }
    vm.new_dict_from_pairs(pairs)
}

fn bi_type(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "type")?.clone();
    Ok(vm.type_of(&v))
}

fn bi_isinstance(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "isinstance")?.clone();
    let target = match args.args.get(1).cloned() {
        Some(t) => t,
        None => return raise(vm.new_type_error("isinstance() takes 2 arguments")),
    };
    let class = vm.env.class_of(&vm.space, &v);
    let Value::Object(target_ref) = target else {
        return raise(vm.new_type_error("isinstance() arg 2 must be a type"));
    };
    Ok(Value::Bool(vm.env.is_subclass(&vm.space, class, target_ref)))
}

fn bi_issubclass(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let (Some(Value::Object(a)), Some(Value::Object(b))) = (args.args.first().cloned(), args.args.get(1).cloned()) else {
        return raise(vm.new_type_error("issubclass() arguments must be classes"));
    };
    Ok(Value::Bool(vm.env.is_subclass(&vm.space, a, b)))
}

fn bi_getattr(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "getattr")?.clone();
    let name = match args.args.get(1) {
        Some(n) => vm.str_of(n)?,
        None => return raise(vm.new_type_error("getattr() missing required argument: 'name'")),
    };
    match vm.get_attribute(v.clone(), &name)? {
        Some(found) => Ok(found),
        None => match args.args.get(2) {
            Some(default) => Ok(default.clone()),
            None => raise(vm.new_attribute_error(&v, &name)),
        },
    }
}

fn bi_setattr(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let Some(Value::Object(r)) = args.args.first().cloned() else {
        return raise(vm.new_type_error("setattr() target must be an object"));
    };
    let name = match args.args.get(1) {
        Some(n) => vm.str_of(n)?,
        None => return raise(vm.new_type_error("setattr() missing required argument: 'name'")),
    };
    let value = args.args.get(2).cloned().unwrap_or(Value::None);
    vm.set_attribute(r, &name, value)?;
    Ok(Value::None)
}

fn bi_hasattr(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "hasattr")?.clone();
    let name = match args.args.get(1) {
        Some(n) => vm.str_of(n)?,
        None => return raise(vm.new_type_error("hasattr() missing required argument: 'name'")),
    };
    Ok(Value::Bool(vm.get_attribute(v, &name)?.is_some()))
}

fn bi_callable(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "callable")?.clone();
    if let Value::Object(r) = &v {
        if matches!(vm.space.get(*r).read().payload, Payload::Function(_) | Payload::Native(_) | Payload::BoundMethod(_)) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(vm.get_attribute(v, "__call__")?.is_some()))
}

fn bi_iter(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "iter")?.clone();
    dispatch::iter_of(vm, &v)
}

fn bi_next(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "next")?.clone();
    match dispatch::next_of(vm, &v)? {
        Some(item) => Ok(item),
        None => match args.args.get(1) {
            Some(default) => Ok(default.clone()),
            None => raise(vm.new_stop_iteration(Value::None)),
        },
    }
}

fn bi_range(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let (start, stop, step) = match args.args.len() {
        1 => (0, args.args[0].as_int().unwrap_or(0), 1),
        2 => (args.args[0].as_int().unwrap_or(0), args.args[1].as_int().unwrap_or(0), 1),
        _ => (
            args.args[0].as_int().unwrap_or(0),
            args.args[1].as_int().unwrap_or(0),
            args.args.get(2).and_then(|v| v.as_int()).unwrap_or(1),
        ),
    };
    if step == 0 {
        return raise(vm.new_value_error("range() arg 3 must not be zero"));
    }
    let mut items = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        items.push(Value::Int(i));
        i += step;
    }
    Ok(vm.new_list(items))
}

fn bi_abs(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    match one_arg(vm, &args, "abs")?.clone() {
        Value::Int(i) => Ok(Value::Int(i.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        Value::Bool(b) => Ok(Value::Int(b as i64)),
        v => raise(vm.new_type_error(format!("bad operand type for abs(): '{}'", vm.type_name(&v)))),
    }
}

fn bi_min(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    reduce_extreme(vm, args, false)
}

fn bi_max(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    reduce_extreme(vm, args, true)
}

fn reduce_extreme(vm: &mut VirtualMachine, args: FuncArgs, want_max: bool) -> PyResult<Value> {
    let items = if args.args.len() == 1 {
        dispatch::items_of(vm, &args.args[0])?
    } else {
        args.args.clone()
    };
    let mut it = items.into_iter();
    let Some(mut best) = it.next() else {
        return raise(vm.new_value_error("min()/max() arg is an empty sequence"));
    };
    for candidate in it {
        let better = if want_max {
            dispatch::less_than(vm, &best, &candidate)?
        } else {
            dispatch::less_than(vm, &candidate, &best)?
        };
        if better {
            best = candidate;
        }
    }
    Ok(best)
}

fn bi_sum(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "sum")?.clone();
    let items = dispatch::items_of(vm, &v)?;
    let mut acc = args.args.get(1).cloned().unwrap_or(Value::Int(0));
    for item in items {
        acc = dispatch::add_values(vm, acc, item)?;
    }
    Ok(acc)
}

fn bi_id(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    match one_arg(vm, &args, "id")?.clone() {
        Value::Object(r) => Ok(Value::Int(r.index() as i64)),
        _ => Ok(Value::Int(0)),
    }
}

fn bi_hash(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "hash")?.clone();
    py_hash(vm, &v).map(Value::Int)
}

fn bi_all(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "all")?.clone();
    for item in dispatch::items_of(vm, &v)? {
        if !vm.is_truthy(&item) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn bi_any(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "any")?.clone();
    for item in dispatch::items_of(vm, &v)? {
        if vm.is_truthy(&item) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn bi_sorted(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let v = one_arg(vm, &args, "sorted")?.clone();
    let mut items = dispatch::items_of(vm, &v)?;
    let reverse = args.kwargs.get(&vm.space.intern("reverse")).map(|v| vm.is_truthy(v)).unwrap_or(false);
    insertion_sort(vm, &mut items)?;
    if reverse {
        items.reverse();
    }
    Ok(vm.new_list(items))
}

fn insertion_sort(vm: &mut VirtualMachine, items: &mut [Value]) -> PyResult<()> {
    for i in 1..items.len() {
        let mut j = i;
        while j > 0 && dispatch::less_than(vm, &items[j], &items[j - 1])? {
            items.swap(j, j - 1);
            j -= 1;
        }
    }
    Ok(())
}

fn bi_enumerate(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let start = args.args.get(1).and_then(|v| v.as_int()).unwrap_or(0);
    let v = one_arg(vm, &args, "enumerate")?.clone();
    let items = dispatch::items_of(vm, &v)?;
    let pairs = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| vm.new_tuple(vec![Value::Int(start + i as i64), item]))
        .collect();
    Ok(vm.new_list(pairs))
}

fn bi_zip(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let mut columns = Vec::with_capacity(args.args.len());
    for v in args.args.clone() {
        columns.push(dispatch::items_of(vm, &v)?);
    }
    let len = columns.iter().map(|c| c.len()).min().unwrap_or(0);
    let mut rows = Vec::with_capacity(len);
    for i in 0..len {
        let row: Vec<Value> = columns.iter().map(|c| c[i].clone()).collect();
        rows.push(vm.new_tuple(row));
    }
    Ok(vm.new_list(rows))
}

/// Reuses `chain_find` to check dict containment without round-tripping
/// through the opcode-level `contains` helper (builtins aren't opcodes).
#[allow(dead_code)]
fn dict_contains(vm: &mut VirtualMachine, chain: &HashChain, key: &Value) -> PyResult<bool> {
    Ok(chain_find(vm, chain, key)?.is_some())
}
