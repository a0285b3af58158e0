//! Persistent container operations (spec §3 "Containers"): list, sparse-list
//! (dict backing), tuple, set. Every mutator is non-mutating at the
//! structural-sharing level and returns a new handle that the caller swaps
//! back onto the owning Object's payload (spec: "the new handle is stored
//! back onto the owning Object's `__data__` attribute") — grounded on the
//! teacher's own `im`-backed `PyList`/`PyDict` payloads plus
//! `dictdatatype.rs`'s hash-then-chain lookup strategy.

use crate::exceptions::{raise, PyResult};
use crate::object::{HashChain, Payload};
use crate::space::ObjectRef;
use crate::value::{fast_eq, fast_hash, Value};
use crate::vm::VirtualMachine;

/// Computes a value's hash for use as a sparse-list bucket key (spec §4.1
/// "Interning" / §3 "keyed by a 64-bit hash"). Falls back to `__hash__`
/// dispatch for heap objects that aren't a fast-path immediate.
pub fn py_hash(vm: &mut VirtualMachine, v: &Value) -> PyResult<i64> {
    if let Some(h) = fast_hash(v) {
        return Ok(h);
    }
    let hash_method = vm.get_attribute(v.clone(), "__hash__")?;
    match hash_method {
        Some(method) => {
            let result = vm.call_value(method, crate::function::FuncArgs::positional(vec![]))?;
            match result.as_int() {
                Some(i) => Ok(i),
                None => raise(vm.new_type_error("__hash__ method should return an integer".to_string())),
            }
        }
        None => raise(vm.new_type_error(format!("unhashable type: '{}'", vm.type_name(v)))),
    }
}

/// Value equality used by container lookup and `==` (spec §4.5 cascading
/// dispatch: immediate fast path, then `__eq__`/`__req__`).
pub fn py_eq(vm: &mut VirtualMachine, a: &Value, b: &Value) -> PyResult<bool> {
    if let Some(result) = fast_eq(a, b) {
        return Ok(result);
    }
    if let (Value::Object(x), Value::Object(y)) = (a, b) {
        if x == y {
            return Ok(true);
        }
    }
    let eq_method = vm.get_attribute(a.clone(), "__eq__")?;
    if let Some(method) = eq_method {
        let result = vm.call_value(method, crate::function::FuncArgs::positional(vec![b.clone()]))?;
        return Ok(vm.is_truthy(&result));
    }
    Ok(false)
}

pub fn list_get(items: &im::Vector<Value>, index: i64) -> Option<Value> {
    let idx = normalize_index(index, items.len())?;
    items.get(idx).cloned()
}

pub fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let idx = if index < 0 { index + len as i64 } else { index };
    if idx < 0 || idx as usize >= len {
        None
    } else {
        Some(idx as usize)
    }
}

pub fn list_set(items: &im::Vector<Value>, index: i64, value: Value) -> Option<im::Vector<Value>> {
    let idx = normalize_index(index, items.len())?;
    let mut new_items = items.clone();
    new_items.set(idx, value);
    Some(new_items)
}

pub fn list_append(items: &im::Vector<Value>, value: Value) -> im::Vector<Value> {
    let mut new_items = items.clone();
    new_items.push_back(value);
    new_items
}

pub fn list_remove_at(items: &im::Vector<Value>, index: i64) -> Option<im::Vector<Value>> {
    let idx = normalize_index(index, items.len())?;
    let mut new_items = items.clone();
    new_items.remove(idx);
    Some(new_items)
}

/// Looks up `key` in a hash-chained dict/set bucket table, resolving hash
/// collisions with real (possibly user-defined `__eq__`) equality.
pub fn chain_find(
    vm: &mut VirtualMachine,
    chain: &HashChain,
    key: &Value,
) -> PyResult<Option<(usize, Value)>> {
    let h = py_hash(vm, key)?;
    if let Some(bucket) = chain.buckets.get(&h) {
        for (i, (k, v)) in bucket.iter().enumerate() {
            if py_eq(vm, k, key)? {
                return Ok(Some((i, v.clone())));
            }
        }
    }
    Ok(None)
}

pub fn chain_insert(
    vm: &mut VirtualMachine,
    chain: &HashChain,
    key: Value,
    value: Value,
) -> PyResult<HashChain> {
    let h = py_hash(vm, &key)?;
    let mut new_chain = chain.clone();
    let mut bucket = new_chain.buckets.get(&h).cloned().unwrap_or_default();
    let mut replaced = false;
    for slot in bucket.iter_mut() {
        if py_eq(vm, &slot.0, &key)? {
            *slot = (key.clone(), value.clone());
            replaced = true;
            break;
        }
    }
    if !replaced {
        bucket.push_back((key, value));
    }
    new_chain.buckets.insert(h, bucket);
    Ok(new_chain)
}

pub fn chain_remove(vm: &mut VirtualMachine, chain: &HashChain, key: &Value) -> PyResult<Option<HashChain>> {
    let h = py_hash(vm, key)?;
    let Some(bucket) = chain.buckets.get(&h) else {
        return Ok(None);
    };
    let mut found = false;
    let mut new_bucket = im::Vector::new();
    for (k, v) in bucket.iter() {
        if !found && py_eq(vm, k, key)? {
            found = true;
            continue;
        }
        new_bucket.push_back((k.clone(), v.clone()));
    }
    if !found {
        return Ok(None);
    }
    let mut new_chain = chain.clone();
    if new_bucket.is_empty() {
        new_chain.buckets.remove(&h);
    } else {
        new_chain.buckets.insert(h, new_bucket);
    }
    Ok(Some(new_chain))
}

/// Reads an Object's `List` payload, raising `TypeError` if it isn't one.
pub fn as_list(vm: &mut VirtualMachine, obj: ObjectRef) -> PyResult<im::Vector<Value>> {
    match &vm.space.get(obj).read().payload {
        Payload::List(items) => Ok(items.clone()),
        _ => raise(vm.new_type_error("expected a list".to_string())),
    }
}
