//! The virtual machine: per-thread dispatch state sitting on top of the
//! shared [`Space`]/[`Environment`] (spec §4 "Virtual Machine", §5
//! "Concurrency model").
//!
//! Grounded on the teacher's `VirtualMachine { ctx: PyRc<Context>, ... }`
//! split between process-wide state (`PyGlobalState`/`Context`) and
//! per-thread state (`frames`, `recursion_depth`) — reshaped so the
//! process-wide half is exactly `Space`+`Environment`, shared via `Arc`
//! across one `VirtualMachine` per OS thread (spec §5: "each worker thread
//! owns one `VirtualMachine`").

pub(crate) mod dispatch;

use crate::environment::{finish_attribute, Environment};
use crate::exceptions::{self, raise, PyResult};
use crate::frame::{ExecutionResult, Frame};
use crate::function::{call_value, FuncArgs};
use crate::generator::GeneratorState;
use crate::import::ModuleProvider;
use crate::object::{BoundMethod, Cell, ObjectData, Payload, UserFunction};
use crate::space::{ObjectRef, Space, ThreadHandle};
use crate::value::Value;
use protopython_bytecode::CodeFlags;
use protopython_common::lock::PyMutex;
use std::sync::Arc;

/// The default recursion ceiling (spec §4.5 "a configurable recursion
/// limit, defaulting to 1000 frames, raises `RecursionError`").
pub const DEFAULT_RECURSION_LIMIT: usize = 1000;

/// Per-thread dispatch state. Cheap to create: the expensive part (type
/// bootstrap) lives once in the shared [`Environment`] and is cloned only as
/// an `Arc`.
pub struct VirtualMachine {
    pub space: Arc<Space>,
    pub env: Arc<Environment>,
    pub providers: Arc<Vec<Box<dyn ModuleProvider>>>,
    pub thread: ThreadHandle,
    pub recursion_limit: usize,
    /// The active call stack, most-recent last; also the GC's per-thread
    /// root set for frames currently executing (spec §4.1 "Roots": "live
    /// frame chains ... supplied per-collection by the environment").
    pub frames: Vec<Arc<PyMutex<Frame>>>,
}

impl VirtualMachine {
    /// Builds a fresh process: bootstraps a `Space`/`Environment` pair,
    /// registers the calling thread, and wires up the default module
    /// provider chain (spec §4.7 "providers are tried in registration
    /// order").
    pub fn new(search_paths: Vec<String>) -> Self {
        let (space, env) = Environment::bootstrap();
        *env.search_paths.write() = search_paths;
        let space = Arc::new(space);
        let thread = space.register_thread();
        let providers: Vec<Box<dyn ModuleProvider>> = vec![
            Box::new(crate::import::NativeProvider),
            Box::new(crate::import::SourceProvider),
        ];
        let mut vm = VirtualMachine {
            space,
            env: Arc::new(env),
            providers: Arc::new(providers),
            thread,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            frames: Vec::new(),
        };
        crate::builtins::install(&mut vm);
        vm
    }

    /// Spawns a sibling `VirtualMachine` sharing the same space and
    /// environment, for a new OS thread (spec §5 "each worker thread owns
    /// one `VirtualMachine`, sharing the space").
    pub fn spawn_thread(&self) -> Self {
        VirtualMachine {
            space: Arc::clone(&self.space),
            env: Arc::clone(&self.env),
            providers: Arc::clone(&self.providers),
            thread: self.space.register_thread(),
            recursion_limit: self.recursion_limit,
            frames: Vec::new(),
        }
    }

    /// Runs a full stop-the-world collection (spec §4.1). `extra_roots`
    /// beyond the active call stack — the module registry and any pending
    /// exception — are gathered here so callers (the `gc` builtin module)
    /// don't need to know the root set's shape.
    pub fn collect(&self) {
        let mut roots = Vec::new();
        for frame in &self.frames {
            frame.lock().trace(&mut roots);
        }
        for module in self.env.modules.read().values() {
            roots.push(*module);
        }
        roots.push(self.env.builtins_module);
        if let Some(Value::Object(r)) = exceptions::peek_pending() {
            roots.push(r);
        }
        self.space.collect(&self.thread, &roots);
    }

    // ---- attribute protocol -------------------------------------------------

    pub fn get_attribute(&mut self, value: Value, name: &str) -> PyResult<Option<Value>> {
        let disposition = self.env.get_attribute(&self.space, &value, name);
        finish_attribute(self, disposition)
    }

    /// `setattr(obj, name, value)` (spec §4.6): a data descriptor found via
    /// the prototype chain wins over plain instance storage.
    pub fn set_attribute(&mut self, obj: ObjectRef, name: &str, value: Value) -> PyResult<()> {
        use crate::environment::AttrTarget;
        match self.env.attribute_target(&self.space, obj, name) {
            AttrTarget::Instance => {
                self.space
                    .get(obj)
                    .write()
                    .attrs
                    .insert(self.space.intern(name), value);
                Ok(())
            }
            AttrTarget::Descriptor(descriptor) => {
                let setter = self.get_attribute(descriptor, "__set__")?.expect(
                    "attribute_target only returns Descriptor when __set__ was already found",
                );
                call_value(
                    self,
                    setter,
                    FuncArgs::positional(vec![Value::Object(obj), value]),
                )?;
                Ok(())
            }
        }
    }

    pub fn type_of(&self, value: &Value) -> Value {
        Value::Object(self.env.class_of(&self.space, value))
    }

    pub fn type_name(&self, value: &Value) -> String {
        let class = self.env.class_of(&self.space, value);
        match self.env.own_attr(&self.space, class, &self.space.intern("__name__")) {
            Some(Value::Object(r)) => match &self.space.get(r).read().payload {
                Payload::Str(s) => s.to_string(),
                _ => "object".to_string(),
            },
            _ => "object".to_string(),
        }
    }

    /// Truthiness (spec §4.5 "Boolean coercion"): `__bool__` first, then
    /// `__len__`, then `True` by default — mirroring the teacher's
    /// `is_true`/`obj_len` cascade.
    pub fn is_truthy(&mut self, value: &Value) -> bool {
        match value {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Object(r) => {
                if let Ok(Some(method)) = self.get_attribute(value.clone(), "__bool__") {
                    if let Ok(result) = call_value(self, method, FuncArgs::positional(vec![])) {
                        return matches!(result, Value::Bool(true)) || result.as_int() == Some(1);
                    }
                }
                if let Ok(Some(method)) = self.get_attribute(value.clone(), "__len__") {
                    if let Ok(result) = call_value(self, method, FuncArgs::positional(vec![])) {
                        return result.as_int().unwrap_or(1) != 0;
                    }
                }
                match &self.space.get(*r).read().payload {
                    Payload::List(items) => !items.is_empty(),
                    Payload::Tuple(items) => !items.is_empty(),
                    Payload::Str(s) => !s.is_empty(),
                    Payload::Bytes(b) => !b.is_empty(),
                    Payload::Dict(chain, _) => !chain.is_empty(),
                    Payload::Set(chain) => !chain.is_empty(),
                    Payload::None => false,
                    _ => true,
                }
            }
        }
    }

    // ---- constructors --------------------------------------------------------

    pub fn new_str(&self, s: &str) -> Value {
        let r = self.space.alloc(ObjectData::with_payload(
            self.env.types.str_,
            vec![self.env.types.str_],
            Payload::Str(Arc::from(s)),
        ));
        Value::Object(r)
    }

    pub fn new_bytes(&self, b: &[u8]) -> Value {
        let r = self.space.alloc(ObjectData::with_payload(
            self.env.types.bytes,
            vec![self.env.types.bytes],
            Payload::Bytes(Arc::from(b)),
        ));
        Value::Object(r)
    }

    /// Instances get the type prototype itself as their sole `parents`
    /// entry (not `types.object` directly) so `LOAD_ATTR`'s prototype-chain
    /// walk (`environment.rs::get_attribute`, which searches an instance's
    /// `parents`, not its `class`) reaches the methods registered on
    /// `types.list` — `types.list` already chains up to `types.object` on
    /// its own (`Environment::bootstrap`), so nothing built on `object` is
    /// lost.
    pub fn new_list(&self, items: Vec<Value>) -> Value {
        let r = self.space.alloc(ObjectData::with_payload(
            self.env.types.list,
            vec![self.env.types.list],
            Payload::List(items.into_iter().collect()),
        ));
        Value::Object(r)
    }

    pub fn new_tuple(&self, items: Vec<Value>) -> Value {
        let r = self.space.alloc(ObjectData::with_payload(
            self.env.types.tuple,
            vec![self.env.types.tuple],
            Payload::Tuple(Arc::from(items)),
        ));
        Value::Object(r)
    }

    pub fn new_set(&self, chain: crate::object::HashChain) -> Value {
        let r = self.space.alloc(ObjectData::with_payload(
            self.env.types.set,
            vec![self.env.types.set],
            Payload::Set(chain),
        ));
        Value::Object(r)
    }

    pub fn new_dict_from_pairs(&mut self, pairs: Vec<(Value, Value)>) -> PyResult<Value> {
        let mut chain = crate::object::HashChain::new();
        let mut order = im::Vector::new();
        for (k, v) in pairs {
            let existed = crate::collections::chain_find(self, &chain, &k)?.is_some();
            chain = crate::collections::chain_insert(self, &chain, k.clone(), v)?;
            if !existed {
                order.push_back(k);
            }
        }
        let r = self.space.alloc(ObjectData::with_payload(
            self.env.types.dict,
            vec![self.env.types.dict],
            Payload::Dict(chain, order),
        ));
        Ok(Value::Object(r))
    }

    pub fn new_bound_method(&self, func: Value, receiver: Value) -> Value {
        let r = self.space.alloc(ObjectData::with_payload(
            self.env.types.bound_method,
            vec![self.env.types.bound_method],
            Payload::BoundMethod(BoundMethod { func, receiver }),
        ));
        Value::Object(r)
    }

    /// Allocates an exception instance of `exc_type`, storing `msg` as both
    /// `args` (a one-tuple, matching `BaseException.args`) and a convenience
    /// `message` attribute. Never pinned: exceptions are ordinary garbage
    /// once caught and discarded.
    pub fn new_error(&mut self, exc_type: ObjectRef, msg: impl Into<String>) -> Value {
        let msg_val = self.new_str(&msg.into());
        let r = self
            .space
            .alloc(ObjectData::new(exc_type, vec![exc_type]));
        let args = self.new_tuple(vec![msg_val.clone()]);
        {
            let mut data = self.space.get(r).write();
            data.attrs.insert(self.space.intern("args"), args);
            data.attrs.insert(self.space.intern("message"), msg_val);
        }
        Value::Object(r)
    }

    pub fn new_type_error(&mut self, msg: impl Into<String>) -> Value {
        self.new_error(self.env.exc.type_error, msg)
    }

    pub fn new_value_error(&mut self, msg: impl Into<String>) -> Value {
        self.new_error(self.env.exc.value_error, msg)
    }

    pub fn new_key_error(&mut self, key_repr: impl Into<String>) -> Value {
        self.new_error(self.env.exc.key_error, key_repr)
    }

    pub fn new_index_error(&mut self, msg: impl Into<String>) -> Value {
        self.new_error(self.env.exc.index_error, msg)
    }

    pub fn new_name_error(&mut self, name: &str) -> Value {
        self.new_error(self.env.exc.name_error, format!("name '{name}' is not defined"))
    }

    pub fn new_attribute_error(&mut self, obj: &Value, name: &str) -> Value {
        let tn = self.type_name(obj);
        self.new_error(
            self.env.exc.attribute_error,
            format!("'{tn}' object has no attribute '{name}'"),
        )
    }

    pub fn new_stop_iteration(&mut self, value: Value) -> Value {
        let exc = self.new_error(self.env.exc.stop_iteration, "");
        if let Value::Object(r) = &exc {
            self.space.get(*r).write().attrs.insert(self.space.intern("value"), value);
        }
        exc
    }

    pub fn call_value(&mut self, callee: Value, args: FuncArgs) -> PyResult<Value> {
        call_value(self, callee, args)
    }

    /// Calls a user-defined function. Generator/coroutine functions don't
    /// run their body here — calling one only materializes a suspended
    /// generator object (spec §4.5 "calling a generator function creates a
    /// suspended generator object rather than running the body").
    pub fn call_user_function(&mut self, func: Arc<UserFunction>, args: FuncArgs) -> PyResult<Value> {
        if self.frames.len() >= self.recursion_limit {
            return raise(self.new_error(self.env.exc.recursion_error, "maximum recursion depth exceeded"));
        }

        let mut slots = vec![Value::None; func.code.co_varnames.len()];
        crate::function::bind_params(self, &func, args, &mut slots)?;

        let mut frame = Frame::new(Arc::clone(&func.code), func.globals, None, self.frames.last().cloned());
        frame.fastlocals = slots;
        frame.freevars = func.closure.clone();

        let is_generator = func
            .code
            .flags
            .intersects(CodeFlags::IS_GENERATOR | CodeFlags::IS_COROUTINE);
        if is_generator {
            let is_coroutine = func.code.flags.contains(CodeFlags::IS_COROUTINE);
            let class = if is_coroutine {
                self.env.types.coroutine
            } else {
                self.env.types.generator
            };
            let gen = GeneratorState::new(Arc::new(PyMutex::new(frame)), is_coroutine);
            let r = self.space.alloc(ObjectData::with_payload(
                class,
                vec![self.env.types.object],
                Payload::Generator(Arc::new(PyMutex::new(gen))),
            ));
            return Ok(Value::Object(r));
        }

        let arc_frame = Arc::new(PyMutex::new(frame));
        self.frames.push(arc_frame.clone());
        let result = dispatch::run(self, &arc_frame);
        self.frames.pop();
        match result? {
            ExecutionResult::Return(v) => Ok(v),
            ExecutionResult::Yield(_) => unreachable!("non-generator frame yielded"),
        }
    }

    /// Runs a fresh top-level frame (module body, `exec`) to completion
    /// (spec §4.7, consumed by the import pipeline).
    pub fn run_frame(&mut self, frame: Frame) -> PyResult<Value> {
        if self.frames.len() >= self.recursion_limit {
            return raise(self.new_error(self.env.exc.recursion_error, "maximum recursion depth exceeded"));
        }
        let arc_frame = Arc::new(PyMutex::new(frame));
        self.frames.push(arc_frame.clone());
        let result = dispatch::run(self, &arc_frame);
        self.frames.pop();
        match result? {
            ExecutionResult::Return(v) => Ok(v),
            ExecutionResult::Yield(v) => Ok(v),
        }
    }

    pub fn new_cell(&self, value: Option<Value>) -> Arc<Cell> {
        Arc::new(Cell::new(value))
    }

    /// `str(value)` (spec §4.6 "Display protocol"): `__str__` if defined,
    /// falling back to `repr_of`.
    pub fn str_of(&mut self, value: &Value) -> PyResult<String> {
        if let Value::Object(r) = value {
            if !matches!(self.space.get(*r).read().payload, Payload::Str(_)) {
                if let Some(method) = self.get_attribute(value.clone(), "__str__")? {
                    let result = call_value(self, method, FuncArgs::positional(vec![]))?;
                    if let Value::Object(sr) = &result {
                        if let Payload::Str(s) = &self.space.get(*sr).read().payload {
                            return Ok(s.to_string());
                        }
                    }
                }
            }
        }
        self.repr_of(value)
    }

    /// `repr(value)` (spec §4.6): `__repr__` if defined; otherwise a
    /// structural default covering every built-in payload kind.
    pub fn repr_of(&mut self, value: &Value) -> PyResult<String> {
        match value {
            Value::None => return Ok("None".to_string()),
            Value::Bool(b) => return Ok(if *b { "True".to_string() } else { "False".to_string() }),
            Value::Int(i) => return Ok(i.to_string()),
            Value::Float(f) => return Ok(format_float(*f)),
            Value::Object(r) => {
                if let Some(method) = self.get_attribute(value.clone(), "__repr__")? {
                    let result = call_value(self, method, FuncArgs::positional(vec![]))?;
                    if let Value::Object(sr) = &result {
                        if let Payload::Str(s) = &self.space.get(*sr).read().payload {
                            return Ok(s.to_string());
                        }
                    }
                }
                let payload = self.space.get(*r).read().payload.clone();
                match payload {
                    Payload::Str(s) => Ok(format!("'{s}'")),
                    Payload::Bytes(b) => Ok(format!("b'{}'", String::from_utf8_lossy(&b))),
                    Payload::None if self.env.is_subclass(&self.space, self.env.class_of(&self.space, value), self.env.exc.base_exception) => {
                        let tn = self.type_name(value);
                        let message = self
                            .space
                            .get(*r)
                            .read()
                            .attrs
                            .get(&self.space.intern("message"))
                            .cloned();
                        match message {
                            Some(Value::Object(sr)) => {
                                if let Payload::Str(s) = &self.space.get(sr).read().payload {
                                    if s.is_empty() {
                                        Ok(tn)
                                    } else {
                                        Ok(format!("{tn}: {s}"))
                                    }
                                } else {
                                    Ok(tn)
                                }
                            }
                            _ => Ok(tn),
                        }
                    }
                    // `Payload::None` is the empty-payload marker `ObjectData::new`
                    // gives plain instances (`object()`, user-class instances) —
                    // it is *not* the `None` singleton, which lives in `Value::None`
                    // and never reaches here. Fall through to the generic
                    // `<Type object at 0x..>` catch-all below for those.
                    Payload::List(items) => self.repr_seq(&items, '[', ']'),
                    Payload::Tuple(items) => {
                        let inner = self.repr_seq_str(items.iter())?;
                        if items.len() == 1 {
                            Ok(format!("({inner},)"))
                        } else {
                            Ok(format!("({inner})"))
                        }
                    }
                    Payload::Set(chain) => {
                        if chain.is_empty() {
                            return Ok("set()".to_string());
                        }
                        let keys: Vec<Value> = chain.buckets.values().flat_map(|b| b.iter().map(|(k, _)| k.clone())).collect();
                        self.repr_seq(&keys.into_iter().collect(), '{', '}')
                    }
                    Payload::Dict(chain, order) => {
                        let mut parts = Vec::new();
                        for k in order.iter() {
                            if let Some((_, v)) = crate::collections::chain_find(self, &chain, k)? {
                                parts.push(format!("{}: {}", self.repr_of(k)?, self.repr_of(&v)?));
                            }
                        }
                        Ok(format!("{{{}}}", parts.join(", ")))
                    }
                    Payload::Function(f) => Ok(format!("<function {} at 0x{:x}>", f.name, r.index())),
                    Payload::Native(_) => Ok(format!("<built-in function at 0x{:x}>", r.index())),
                    Payload::BoundMethod(_) => Ok(format!("<bound method at 0x{:x}>", r.index())),
                    _ => {
                        let tn = self.type_name(value);
                        Ok(format!("<{tn} object at 0x{:x}>", r.index()))
                    }
                }
            }
        }
    }

    fn repr_seq(&mut self, items: &im::Vector<Value>, open: char, close: char) -> PyResult<String> {
        let inner = self.repr_seq_str(items.iter())?;
        Ok(format!("{open}{inner}{close}"))
    }

    fn repr_seq_str<'a>(&mut self, items: impl Iterator<Item = &'a Value>) -> PyResult<String> {
        let mut parts = Vec::new();
        for v in items {
            parts.push(self.repr_of(v)?);
        }
        Ok(parts.join(", "))
    }
}

/// Python's float repr: integral floats always show a trailing `.0`.
fn format_float(f: f64) -> String {
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// The process entry point (spec SPEC_FULL.md §B.1 "Entry points"): owns the
/// one `VirtualMachine` the root binary drives, and the convenience of
/// running source text end to end without hand-assembling a module Object.
///
/// Grounded on the teacher's `Interpreter` (`enter`/`run`), narrowed to this
/// runtime's single-VM-per-process default use (spawning additional
/// `VirtualMachine`s for worker threads is `VirtualMachine::spawn_thread`,
/// used directly by `threading`-feature code rather than through
/// `Interpreter`).
pub struct Interpreter {
    pub vm: VirtualMachine,
}

impl Interpreter {
    pub fn new(search_paths: Vec<String>) -> Self {
        Interpreter {
            vm: VirtualMachine::new(search_paths),
        }
    }

    /// Compiles and runs `source` as a top-level module named `name` in a
    /// fresh `__main__`-like namespace, returning the last expression
    /// statement's value executed (`Mode::Exec` programs normally return
    /// `None`; this exists mainly for the REPL's `Mode::Eval`/single-statement
    /// use, per the root `shell.rs`).
    pub fn run_source(&mut self, source: &str, name: &str, mode: protopython_compiler::Mode) -> PyResult<Value> {
        let code = match protopython_compiler::compile_program(source, name, mode, self.vm.space.strings()) {
            Ok(code) => code,
            Err(e) => {
                let exc = self.vm.new_error(self.vm.env.exc.syntax_error, e.to_string());
                return raise(exc);
            }
        };
        let module = self.vm.space.alloc(ObjectData::new(
            self.vm.env.types.module,
            Vec::new(),
        ));
        {
            let name_val = self.vm.new_str(name);
            self.vm
                .space
                .get(module)
                .write()
                .attrs
                .insert(self.space.intern("__name__"), name_val);
        }
        self.vm.env.modules.write().insert(name.to_string(), module);
        let frame = Frame::new(Arc::new(code), module, Some(module), None);
        self.vm.run_frame(frame)
    }
}
