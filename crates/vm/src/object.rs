//! The heap Object: attribute map, prototype chain, and native payload
//! (spec §3 "Object", "Containers", "Types as objects").
//!
//! Grounded on the teacher's `PyObject`/`PyObjectKind` split (an identity
//! header plus a payload enum for the handful of kinds that need more than
//! an attribute dict) but reshaped around the spec's explicit multi-parent
//! prototype chain rather than a single `class` pointer plus MRO cache.

use crate::space::ObjectRef;
use crate::value::Value;
use indexmap::IndexMap;
use protopython_bytecode::CodeObject;
use protopython_common::InternedStr;
use protopython_common::lock::PyMutex;
use std::sync::Arc;

pub type AttrMap = IndexMap<InternedStr, Value>;

/// A native function pointer: context, receiver-free positional/keyword
/// arguments in, a `Value` or an unwind signal out (spec §4.6 "each a native
/// function receiving context, self, positional args, keyword args").
pub type NativeFn = Arc<dyn Fn(&mut crate::vm::VirtualMachine, crate::function::FuncArgs) -> crate::exceptions::PyResult<Value> + Send + Sync>;

/// A single closure cell: the storage `LOAD_DEREF`/`STORE_DEREF` address,
/// shared between a defining scope and every nested scope that closes over
/// it (spec §4.4 "Free variables are closed over via explicit cell objects").
#[derive(Debug)]
pub struct Cell(pub PyMutex<Option<Value>>);

impl Cell {
    pub fn new(value: Option<Value>) -> Self {
        Cell(PyMutex::new(value))
    }
}

#[derive(Clone)]
pub struct UserFunction {
    pub code: Arc<CodeObject>,
    pub globals: ObjectRef,
    pub defaults: Vec<Value>,
    pub kw_defaults: IndexMap<InternedStr, Value>,
    pub closure: Vec<Arc<Cell>>,
    pub name: InternedStr,
}

#[derive(Clone)]
pub struct BoundMethod {
    pub func: Value,
    pub receiver: Value,
}

/// Hash-chained storage shared by dict and set: collisions are resolved by
/// a `Vec` bucket, with real equality (not just hash equality) deciding
/// membership (spec §3 "Sparse-list: ... iterator yields hash keys").
#[derive(Clone, Default)]
pub struct HashChain {
    pub buckets: im::HashMap<i64, im::Vector<(Value, Value)>>,
}

/// Backing state for the one generic iterator kind every built-in container
/// produces (spec §4.4 "`GET_ITER`/`FOR_ITER`"): a snapshot of the elements
/// taken at `__iter__` time plus a cursor. Snapshotting rather than a live
/// view matches Python's own list-iterator behavior under most mutation
/// patterns closely enough for this runtime's scope, and keeps `FOR_ITER`
/// a simple index bump with no borrow of the original container.
pub struct IterState {
    pub items: im::Vector<Value>,
    pub pos: usize,
}

impl IterState {
    pub fn new(items: im::Vector<Value>) -> Self {
        IterState { items, pos: 0 }
    }

    pub fn next(&mut self) -> Option<Value> {
        let v = self.items.get(self.pos).cloned();
        if v.is_some() {
            self.pos += 1;
        }
        v
    }
}

impl HashChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The native payload an Object may carry alongside its attribute map (spec
/// §3 "optional native payloads"). Stored as its own field rather than
/// literally under a `__data__` attribute key: both give single-writer,
/// swap-the-whole-handle semantics, and a typed Rust field avoids smuggling
/// a non-`Value` Rust type through the attribute map.
#[derive(Clone)]
pub enum Payload {
    None,
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    List(im::Vector<Value>),
    /// Sparse-list backing both generic dicts and (conceptually) attribute
    /// maps; insertion order is tracked separately via `order` so iteration
    /// and `repr` are deterministic even though `buckets` is hash-keyed.
    Dict(HashChain, im::Vector<Value>),
    Tuple(Arc<[Value]>),
    Set(HashChain),
    Slice(Box<(Value, Value, Value)>),
    Native(NativeFn),
    BoundMethod(BoundMethod),
    Function(Arc<UserFunction>),
    Cell(Arc<Cell>),
    Code(Arc<CodeObject>),
    Frame(Arc<PyMutex<crate::frame::Frame>>),
    Generator(Arc<PyMutex<crate::generator::GeneratorState>>),
    Iterator(Arc<PyMutex<IterState>>),
    /// Tombstone left behind by the sweeper so a use-after-free shows up as
    /// an empty object rather than aliasing whatever reused the slot.
    Tombstone,
}

/// The mutable state behind one [`ObjectRef`] (spec §3 invariant: "mutating
/// an Object's attribute map requires single-writer access").
pub struct ObjectData {
    pub class: ObjectRef,
    pub parents: Vec<ObjectRef>,
    pub attrs: AttrMap,
    pub payload: Payload,
}

impl ObjectData {
    pub fn new(class: ObjectRef, parents: Vec<ObjectRef>) -> Self {
        ObjectData {
            class,
            parents,
            attrs: AttrMap::new(),
            payload: Payload::None,
        }
    }

    pub fn with_payload(class: ObjectRef, parents: Vec<ObjectRef>, payload: Payload) -> Self {
        ObjectData {
            class,
            parents,
            attrs: AttrMap::new(),
            payload,
        }
    }

    pub fn tombstone() -> Self {
        ObjectData {
            class: ObjectRef::dangling(),
            parents: Vec::new(),
            attrs: AttrMap::new(),
            payload: Payload::Tombstone,
        }
    }

    /// Pushes every `ObjectRef` directly reachable from this object onto
    /// `worklist` — the GC mark phase's per-object edge function (spec §9
    /// "The garbage collector must mark transitively through Object
    /// attribute maps and container payloads").
    pub fn trace(&self, worklist: &mut Vec<ObjectRef>) {
        worklist.push(self.class);
        worklist.extend_from_slice(&self.parents);
        for value in self.attrs.values() {
            trace_value(value, worklist);
        }
        match &self.payload {
            Payload::List(items) => {
                for v in items.iter() {
                    trace_value(v, worklist);
                }
            }
            Payload::Tuple(items) => {
                for v in items.iter() {
                    trace_value(v, worklist);
                }
            }
            Payload::Dict(chain, order) => {
                for bucket in chain.buckets.values() {
                    for (k, v) in bucket.iter() {
                        trace_value(k, worklist);
                        trace_value(v, worklist);
                    }
                }
                for v in order.iter() {
                    trace_value(v, worklist);
                }
            }
            Payload::Set(chain) => {
                for bucket in chain.buckets.values() {
                    for (k, _) in bucket.iter() {
                        trace_value(k, worklist);
                    }
                }
            }
            Payload::Slice(boxed) => {
                trace_value(&boxed.0, worklist);
                trace_value(&boxed.1, worklist);
                trace_value(&boxed.2, worklist);
            }
            Payload::BoundMethod(bm) => {
                trace_value(&bm.func, worklist);
                trace_value(&bm.receiver, worklist);
            }
            Payload::Function(f) => {
                worklist.push(f.globals);
                for v in &f.defaults {
                    trace_value(v, worklist);
                }
                for v in f.kw_defaults.values() {
                    trace_value(v, worklist);
                }
                for cell in &f.closure {
                    if let Some(v) = cell.0.lock().as_ref() {
                        trace_value(v, worklist);
                    }
                }
            }
            Payload::Cell(cell) => {
                if let Some(v) = cell.0.lock().as_ref() {
                    trace_value(v, worklist);
                }
            }
            Payload::Frame(frame) => frame.lock().trace(worklist),
            Payload::Generator(gen) => gen.lock().frame.lock().trace(worklist),
            Payload::Iterator(it) => {
                for v in it.lock().items.iter() {
                    trace_value(v, worklist);
                }
            }
            Payload::None
            | Payload::Str(_)
            | Payload::Bytes(_)
            | Payload::Native(_)
            | Payload::Code(_)
            | Payload::Tombstone => {}
        }
    }
}

fn trace_value(value: &Value, worklist: &mut Vec<ObjectRef>) {
    if let Value::Object(r) = value {
        worklist.push(*r);
    }
}

