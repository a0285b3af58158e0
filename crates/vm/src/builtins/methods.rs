//! Built-in instance methods (`list.append`, `dict.get`, `str.split`, ...):
//! spec §4.6 "install built-in methods (append, get, split, etc.)" onto the
//! relevant type prototype rather than the `builtins` module.
//!
//! Grounded on the teacher's per-type `#[pyclass]` method tables
//! (`builtins/list.rs`, `builtins/dict.rs`, `builtins/pystr.rs`): each method
//! here is a plain native function taking `self` as `args.args[0]` (the
//! calling convention `function.rs::call_value`'s `Payload::BoundMethod`
//! branch already establishes for anything reachable through a type
//! prototype's `attrs`), registered directly into that prototype rather than
//! into `builtins_module`.

use crate::collections::{self, chain_find, chain_insert, chain_remove, py_eq};
use crate::exceptions::{raise, PyResult};
use crate::function::FuncArgs;
use crate::object::{HashChain, ObjectData, Payload};
use crate::space::ObjectRef;
use crate::value::Value;
use crate::vm::dispatch;
use crate::vm::VirtualMachine;
use std::sync::Arc;

fn register_method(vm: &mut VirtualMachine, type_ref: ObjectRef, name: &str, f: crate::object::NativeFn) {
    let r = vm.space.alloc(ObjectData::with_payload(
        vm.env.types.function,
        vec![vm.env.types.object],
        Payload::Native(f),
    ));
    vm.space.get(type_ref).write().attrs.insert(vm.space.intern(name), Value::Object(r));
}

fn method_self(args: &FuncArgs, name: &str, vm: &mut VirtualMachine) -> PyResult<Value> {
    match args.args.first() {
        Some(v) => Ok(v.clone()),
        None => raise(vm.new_type_error(format!("{name}() missing 'self'"))),
    }
}

fn list_self(vm: &mut VirtualMachine, args: &FuncArgs, name: &str) -> PyResult<ObjectRef> {
    match method_self(args, name, vm)? {
        Value::Object(r) if matches!(vm.space.get(r).read().payload, Payload::List(_)) => Ok(r),
        v => raise(vm.new_type_error(format!("descriptor '{name}' requires a 'list' object but received a '{}'", vm.type_name(&v)))),
    }
}

fn dict_self(vm: &mut VirtualMachine, args: &FuncArgs, name: &str) -> PyResult<ObjectRef> {
    match method_self(args, name, vm)? {
        Value::Object(r) if matches!(vm.space.get(r).read().payload, Payload::Dict(..)) => Ok(r),
        v => raise(vm.new_type_error(format!("descriptor '{name}' requires a 'dict' object but received a '{}'", vm.type_name(&v)))),
    }
}

fn set_self(vm: &mut VirtualMachine, args: &FuncArgs, name: &str) -> PyResult<ObjectRef> {
    match method_self(args, name, vm)? {
        Value::Object(r) if matches!(vm.space.get(r).read().payload, Payload::Set(_)) => Ok(r),
        v => raise(vm.new_type_error(format!("descriptor '{name}' requires a 'set' object but received a '{}'", vm.type_name(&v)))),
    }
}

fn str_self(vm: &mut VirtualMachine, args: &FuncArgs, name: &str) -> PyResult<Arc<str>> {
    match method_self(args, name, vm)? {
        Value::Object(r) => {
            if let Payload::Str(s) = &vm.space.get(r).read().payload {
                return Ok(s.clone());
            }
            raise(vm.new_type_error(format!("descriptor '{name}' requires a 'str' object")))
        }
        v => raise(vm.new_type_error(format!("descriptor '{name}' requires a 'str' object but received a '{}'", vm.type_name(&v)))),
    }
}

/// Registers the methods required for comprehension desugaring
/// (`list.append`, `set.add`) plus the illustrative stdlib surface spec
/// §4.6 names (`dict.get`, `str.split`) and their natural neighbors.
pub fn install(vm: &mut VirtualMachine) {
    let list = vm.env.types.list;
    register_method(vm, list, "append", Arc::new(list_append));
    register_method(vm, list, "extend", Arc::new(list_extend));
    register_method(vm, list, "pop", Arc::new(list_pop));
    register_method(vm, list, "insert", Arc::new(list_insert));
    register_method(vm, list, "remove", Arc::new(list_remove));
    register_method(vm, list, "index", Arc::new(list_index));
    register_method(vm, list, "count", Arc::new(list_count));
    register_method(vm, list, "clear", Arc::new(list_clear));
    register_method(vm, list, "reverse", Arc::new(list_reverse));

    let dict = vm.env.types.dict;
    register_method(vm, dict, "get", Arc::new(dict_get));
    register_method(vm, dict, "keys", Arc::new(dict_keys));
    register_method(vm, dict, "values", Arc::new(dict_values));
    register_method(vm, dict, "items", Arc::new(dict_items));
    register_method(vm, dict, "pop", Arc::new(dict_pop));
    register_method(vm, dict, "setdefault", Arc::new(dict_setdefault));
    register_method(vm, dict, "update", Arc::new(dict_update));
    register_method(vm, dict, "clear", Arc::new(dict_clear));

    let set = vm.env.types.set;
    register_method(vm, set, "add", Arc::new(set_add));
    register_method(vm, set, "remove", Arc::new(set_remove));
    register_method(vm, set, "discard", Arc::new(set_discard));
    register_method(vm, set, "clear", Arc::new(set_clear));

    let str_ = vm.env.types.str_;
    register_method(vm, str_, "split", Arc::new(str_split));
    register_method(vm, str_, "join", Arc::new(str_join));
    register_method(vm, str_, "strip", Arc::new(str_strip));
    register_method(vm, str_, "upper", Arc::new(str_upper));
    register_method(vm, str_, "lower", Arc::new(str_lower));
    register_method(vm, str_, "replace", Arc::new(str_replace));
    register_method(vm, str_, "startswith", Arc::new(str_startswith));
    register_method(vm, str_, "endswith", Arc::new(str_endswith));
    register_method(vm, str_, "find", Arc::new(str_find));
}

// ---------------------------------------------------------------- list ----

fn list_append(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = list_self(vm, &args, "append")?;
    let value = args.args.get(1).cloned().unwrap_or(Value::None);
    if let Payload::List(items) = &mut vm.space.get(r).write().payload {
        items.push_back(value);
    }
    Ok(Value::None)
}

fn list_extend(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = list_self(vm, &args, "extend")?;
    let other = args.args.get(1).cloned().unwrap_or(Value::None);
    let extra = dispatch::items_of(vm, &other)?;
    if let Payload::List(items) = &mut vm.space.get(r).write().payload {
        for item in extra {
            items.push_back(item);
        }
    }
    Ok(Value::None)
}

fn list_pop(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = list_self(vm, &args, "pop")?;
    let len = collections::as_list(vm, r)?.len();
    if len == 0 {
        return raise(vm.new_index_error("pop from empty list"));
    }
    let requested = args.args.get(1).and_then(|v| v.as_int()).unwrap_or(-1);
    let idx = match collections::normalize_index(requested, len) {
        Some(idx) => idx,
        None => return raise(vm.new_index_error("pop index out of range")),
    };
    let mut removed = None;
    if let Payload::List(items) = &mut vm.space.get(r).write().payload {
        removed = Some(items.remove(idx));
    }
    Ok(removed.unwrap_or(Value::None))
}

fn list_insert(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = list_self(vm, &args, "insert")?;
    let len = collections::as_list(vm, r)?.len();
    let requested = args.args.get(1).and_then(|v| v.as_int()).unwrap_or(0);
    let idx = (requested.clamp(0, len as i64)) as usize;
    let value = args.args.get(2).cloned().unwrap_or(Value::None);
    if let Payload::List(items) = &mut vm.space.get(r).write().payload {
        items.insert(idx, value);
    }
    Ok(Value::None)
}

fn list_remove(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = list_self(vm, &args, "remove")?;
    let target = args.args.get(1).cloned().unwrap_or(Value::None);
    let items = collections::as_list(vm, r)?;
    let mut found = None;
    for (i, item) in items.iter().enumerate() {
        if py_eq(vm, item, &target)? {
            found = Some(i);
            break;
        }
    }
    match found {
        Some(idx) => {
            if let Payload::List(l) = &mut vm.space.get(r).write().payload {
                l.remove(idx);
            }
            Ok(Value::None)
        }
        None => raise(vm.new_value_error("list.remove(x): x not in list")),
    }
}

fn list_index(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = list_self(vm, &args, "index")?;
    let target = args.args.get(1).cloned().unwrap_or(Value::None);
    let items = collections::as_list(vm, r)?;
    for (i, item) in items.iter().enumerate() {
        if py_eq(vm, item, &target)? {
            return Ok(Value::Int(i as i64));
        }
    }
    raise(vm.new_value_error("value not in list"))
}

fn list_count(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = list_self(vm, &args, "count")?;
    let target = args.args.get(1).cloned().unwrap_or(Value::None);
    let items = collections::as_list(vm, r)?;
    let mut n = 0i64;
    for item in items.iter() {
        if py_eq(vm, item, &target)? {
            n += 1;
        }
    }
    Ok(Value::Int(n))
}

fn list_clear(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = list_self(vm, &args, "clear")?;
    if let Payload::List(items) = &mut vm.space.get(r).write().payload {
        items.clear();
    }
    Ok(Value::None)
}

fn list_reverse(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = list_self(vm, &args, "reverse")?;
    if let Payload::List(items) = &mut vm.space.get(r).write().payload {
        let rev: im::Vector<Value> = items.iter().rev().cloned().collect();
        *items = rev;
    }
    Ok(Value::None)
}

// ---------------------------------------------------------------- dict ----

fn dict_get(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = dict_self(vm, &args, "get")?;
    let key = args.args.get(1).cloned().unwrap_or(Value::None);
    let default = args.args.get(2).cloned().unwrap_or(Value::None);
    let chain = match &vm.space.get(r).read().payload {
        Payload::Dict(c, _) => c.clone(),
        _ => HashChain::new(),
    };
    match chain_find(vm, &chain, &key)? {
        Some((_, value)) => Ok(value),
        None => Ok(default),
    }
}

fn dict_keys(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = dict_self(vm, &args, "keys")?;
    let order = match &vm.space.get(r).read().payload {
        Payload::Dict(_, order) => order.clone(),
        _ => im::Vector::new(),
    };
    Ok(vm.new_list(order.into_iter().collect()))
}

fn dict_values(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = dict_self(vm, &args, "values")?;
    let (chain, order) = match &vm.space.get(r).read().payload {
        Payload::Dict(c, o) => (c.clone(), o.clone()),
        _ => (HashChain::new(), im::Vector::new()),
    };
    let mut values = Vec::with_capacity(order.len());
    for key in order.iter() {
        if let Some((_, v)) = chain_find(vm, &chain, key)? {
            values.push(v);
        }
    }
    Ok(vm.new_list(values))
}

fn dict_items(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = dict_self(vm, &args, "items")?;
    let (chain, order) = match &vm.space.get(r).read().payload {
        Payload::Dict(c, o) => (c.clone(), o.clone()),
        _ => (HashChain::new(), im::Vector::new()),
    };
    let mut pairs = Vec::with_capacity(order.len());
    for key in order.iter() {
        if let Some((_, v)) = chain_find(vm, &chain, key)? {
            pairs.push(vm.new_tuple(vec![key.clone(), v]));
        }
    }
    Ok(vm.new_list(pairs))
}

fn dict_pop(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = dict_self(vm, &args, "pop")?;
    let key = args.args.get(1).cloned().unwrap_or(Value::None);
    let (chain, order) = match &vm.space.get(r).read().payload {
        Payload::Dict(c, o) => (c.clone(), o.clone()),
        _ => (HashChain::new(), im::Vector::new()),
    };
    let Some((_, value)) = chain_find(vm, &chain, &key)? else {
        return match args.args.get(2) {
            Some(default) => Ok(default.clone()),
            None => {
                let repr = vm.repr_of(&key)?;
                raise(vm.new_key_error(repr))
            }
        };
    };
    let new_chain = chain_remove(vm, &chain, &key)?.unwrap_or(chain);
    let mut new_order = im::Vector::new();
    for k in order.iter() {
        if !py_eq(vm, k, &key)? {
            new_order.push_back(k.clone());
        }
    }
    if let Payload::Dict(c, o) = &mut vm.space.get(r).write().payload {
        *c = new_chain;
        *o = new_order;
    }
    Ok(value)
}

fn dict_setdefault(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = dict_self(vm, &args, "setdefault")?;
    let key = args.args.get(1).cloned().unwrap_or(Value::None);
    let default = args.args.get(2).cloned().unwrap_or(Value::None);
    let (chain, mut order) = match &vm.space.get(r).read().payload {
        Payload::Dict(c, o) => (c.clone(), o.clone()),
        _ => (HashChain::new(), im::Vector::new()),
    };
    if let Some((_, value)) = chain_find(vm, &chain, &key)? {
        return Ok(value);
    }
    let new_chain = chain_insert(vm, &chain, key.clone(), default.clone())?;
    order.push_back(key);
    if let Payload::Dict(c, o) = &mut vm.space.get(r).write().payload {
        *c = new_chain;
        *o = order;
    }
    Ok(default)
}

fn dict_update(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = dict_self(vm, &args, "update")?;
    let other = args.args.get(1).cloned().unwrap_or(Value::None);
    let pairs = dispatch::items_of(vm, &other)?;
    for pair in pairs {
        let parts = dispatch::items_of(vm, &pair)?;
        if parts.len() != 2 {
            continue;
        }
        let (chain, mut order) = match &vm.space.get(r).read().payload {
            Payload::Dict(c, o) => (c.clone(), o.clone()),
            _ => (HashChain::new(), im::Vector::new()),
        };
        let existed = chain_find(vm, &chain, &parts[0])?.is_some();
        let new_chain = chain_insert(vm, &chain, parts[0].clone(), parts[1].clone())?;
        if !existed {
            order.push_back(parts[0].clone());
        }
        if let Payload::Dict(c, o) = &mut vm.space.get(r).write().payload {
            *c = new_chain;
            *o = order;
        }
    }
    Ok(Value::None)
}

fn dict_clear(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = dict_self(vm, &args, "clear")?;
    if let Payload::Dict(c, o) = &mut vm.space.get(r).write().payload {
        *c = HashChain::new();
        *o = im::Vector::new();
    }
    Ok(Value::None)
}

// ----------------------------------------------------------------- set ----

fn set_add(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = set_self(vm, &args, "add")?;
    let value = args.args.get(1).cloned().unwrap_or(Value::None);
    let chain = match &vm.space.get(r).read().payload {
        Payload::Set(c) => c.clone(),
        _ => HashChain::new(),
    };
    let new_chain = chain_insert(vm, &chain, value, Value::None)?;
    if let Payload::Set(c) = &mut vm.space.get(r).write().payload {
        *c = new_chain;
    }
    Ok(Value::None)
}

fn set_remove(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = set_self(vm, &args, "remove")?;
    let value = args.args.get(1).cloned().unwrap_or(Value::None);
    let chain = match &vm.space.get(r).read().payload {
        Payload::Set(c) => c.clone(),
        _ => HashChain::new(),
    };
    match chain_remove(vm, &chain, &value)? {
        Some(new_chain) => {
            if let Payload::Set(c) = &mut vm.space.get(r).write().payload {
                *c = new_chain;
            }
            Ok(Value::None)
        }
        None => {
            let repr = vm.repr_of(&value)?;
            raise(vm.new_key_error(repr))
        }
    }
}

fn set_discard(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = set_self(vm, &args, "discard")?;
    let value = args.args.get(1).cloned().unwrap_or(Value::None);
    let chain = match &vm.space.get(r).read().payload {
        Payload::Set(c) => c.clone(),
        _ => HashChain::new(),
    };
    if let Some(new_chain) = chain_remove(vm, &chain, &value)? {
        if let Payload::Set(c) = &mut vm.space.get(r).write().payload {
            *c = new_chain;
        }
    }
    Ok(Value::None)
}

fn set_clear(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let r = set_self(vm, &args, "clear")?;
    if let Payload::Set(c) = &mut vm.space.get(r).write().payload {
        *c = HashChain::new();
    }
    Ok(Value::None)
}

// ----------------------------------------------------------------- str ----

fn str_split(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let s = str_self(vm, &args, "split")?;
    let parts: Vec<Value> = match args.args.get(1) {
        Some(sep) if !matches!(sep, Value::None) => {
            let sep = vm.str_of(sep)?;
            if sep.is_empty() {
                return raise(vm.new_value_error("empty separator"));
            }
            s.split(sep.as_str()).map(|p| vm.new_str(p)).collect()
        }
        _ => s.split_whitespace().map(|p| vm.new_str(p)).collect(),
    };
    Ok(vm.new_list(parts))
}

fn str_join(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let s = str_self(vm, &args, "join")?;
    let iterable = args.args.get(1).cloned().unwrap_or(Value::None);
    let items = dispatch::items_of(vm, &iterable)?;
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(vm.str_of(&item)?);
    }
    Ok(vm.new_str(&parts.join(&s)))
}

fn str_strip(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let s = str_self(vm, &args, "strip")?;
    match args.args.get(1) {
        Some(chars) if !matches!(chars, Value::None) => {
            let chars = vm.str_of(chars)?;
            let cs: Vec<char> = chars.chars().collect();
            Ok(vm.new_str(s.trim_matches(|c| cs.contains(&c))))
        }
        _ => Ok(vm.new_str(s.trim())),
    }
}

fn str_upper(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let s = str_self(vm, &args, "upper")?;
    Ok(vm.new_str(&s.to_uppercase()))
}

fn str_lower(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let s = str_self(vm, &args, "lower")?;
    Ok(vm.new_str(&s.to_lowercase()))
}

fn str_replace(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let s = str_self(vm, &args, "replace")?;
    let old = match args.args.get(1) {
        Some(v) => vm.str_of(v)?,
        None => return raise(vm.new_type_error("replace() missing required argument: 'old'")),
    };
    let new = match args.args.get(2) {
        Some(v) => vm.str_of(v)?,
        None => return raise(vm.new_type_error("replace() missing required argument: 'new'")),
    };
    match args.args.get(3).and_then(|v| v.as_int()) {
        Some(count) if count >= 0 => Ok(vm.new_str(&s.replacen(old.as_str(), &new, count as usize))),
        _ => Ok(vm.new_str(&s.replace(old.as_str(), &new))),
    }
}

fn str_startswith(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let s = str_self(vm, &args, "startswith")?;
    let prefix = match args.args.get(1) {
        Some(v) => vm.str_of(v)?,
        None => return raise(vm.new_type_error("startswith() missing required argument: 'prefix'")),
    };
    Ok(Value::Bool(s.starts_with(prefix.as_str())))
}

fn str_endswith(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let s = str_self(vm, &args, "endswith")?;
    let suffix = match args.args.get(1) {
        Some(v) => vm.str_of(v)?,
        None => return raise(vm.new_type_error("endswith() missing required argument: 'suffix'")),
    };
    Ok(Value::Bool(s.ends_with(suffix.as_str())))
}

fn str_find(vm: &mut VirtualMachine, args: FuncArgs) -> PyResult<Value> {
    let s = str_self(vm, &args, "find")?;
    let needle = match args.args.get(1) {
        Some(v) => vm.str_of(v)?,
        None => return raise(vm.new_type_error("find() missing required argument: 'sub'")),
    };
    match s.find(needle.as_str()) {
        Some(byte_idx) => Ok(Value::Int(s[..byte_idx].chars().count() as i64)),
        None => Ok(Value::Int(-1)),
    }
}
