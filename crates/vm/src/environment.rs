//! Type prototypes, builtins, name resolution, the import lock, and the
//! descriptor protocol (spec §4.6).
//!
//! Grounded on the teacher's `PyContext` (type-singleton bundle built once
//! at `VirtualMachine::new`) and its attribute-lookup split between
//! `AttributeProtocol`/`DictProtocol`, reshaped around the spec's explicit
//! own-attribute-vs-prototype classification (§4.6 "must re-scan the
//! instance's own map after resolution to classify the hit" — §9).

use crate::exceptions::ExceptionTypes;
use crate::function::{call_value, FuncArgs};
use crate::object::{ObjectData, Payload};
use crate::space::{ObjectRef, Space, ThreadHandle};
use crate::value::Value;
use indexmap::IndexMap;
use protopython_common::lock::{MutexGuard, PyMutex, PyRwLock};
use protopython_common::InternedStr;
use std::cell::Cell as StdCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Reentrant import lock (spec §4.6 "Import lock", §5). Nested imports on
/// the same thread skip the park/unpark safepoint dance entirely, per spec:
/// "Nested imports on the same thread increment a thread-local depth
/// counter and skip the safepoint dance."
pub struct ImportLock {
    mutex: PyMutex<()>,
}

thread_local! {
    static IMPORT_DEPTH: StdCell<u32> = const { StdCell::new(0) };
}

pub struct ImportGuard<'a> {
    _held: Option<MutexGuard<'a, ()>>,
    top_level: bool,
}

impl Drop for ImportGuard<'_> {
    fn drop(&mut self) {
        IMPORT_DEPTH.with(|d| d.set(d.get() - 1));
        let _ = self.top_level;
    }
}

impl ImportLock {
    pub fn new() -> Self {
        ImportLock {
            mutex: PyMutex::new(()),
        }
    }

    pub fn acquire<'a>(&'a self, space: &Space, handle: &ThreadHandle) -> ImportGuard<'a> {
        let depth = IMPORT_DEPTH.with(|d| {
            let v = d.get();
            d.set(v + 1);
            v
        });
        if depth == 0 {
            space.park(handle);
            let guard = self.mutex.lock();
            space.unpark(handle);
            ImportGuard {
                _held: Some(guard),
                top_level: true,
            }
        } else {
            ImportGuard {
                _held: None,
                top_level: false,
            }
        }
    }
}

impl Default for ImportLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread resolve cache with a generation counter for lock-free
/// invalidation (spec §4.6 "thread-local resolve cache keyed by name, with
/// a generation counter").
#[derive(Default)]
pub struct ResolveCache {
    generation: u32,
    entries: IndexMap<String, (u32, Value)>,
}

impl ResolveCache {
    pub fn get(&self, name: &str, current_gen: u32) -> Option<Value> {
        self.entries.get(name).and_then(|(gen, v)| {
            if *gen == current_gen {
                Some(v.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&mut self, name: &str, current_gen: u32, value: Value) {
        self.entries.insert(name.to_string(), (current_gen, value));
    }
}

thread_local! {
    static RESOLVE_CACHE: std::cell::RefCell<ResolveCache> = std::cell::RefCell::new(ResolveCache::default());
}

/// Bundle of well-known type prototypes, built once at bootstrap (spec §3
/// "Types as objects").
#[derive(Clone, Copy)]
pub struct TypePrototypes {
    pub object: ObjectRef,
    pub type_: ObjectRef,
    pub int: ObjectRef,
    pub float: ObjectRef,
    pub bool_: ObjectRef,
    pub none_type: ObjectRef,
    pub str_: ObjectRef,
    pub list: ObjectRef,
    pub dict: ObjectRef,
    pub tuple: ObjectRef,
    pub set: ObjectRef,
    pub frozenset: ObjectRef,
    pub bytes: ObjectRef,
    pub slice: ObjectRef,
    pub function: ObjectRef,
    pub bound_method: ObjectRef,
    pub code: ObjectRef,
    pub frame: ObjectRef,
    pub generator: ObjectRef,
    pub coroutine: ObjectRef,
    pub module: ObjectRef,
}

pub struct Environment {
    pub types: TypePrototypes,
    pub exc: ExceptionTypes,
    pub builtins_module: ObjectRef,
    pub modules: PyRwLock<IndexMap<String, ObjectRef>>,
    pub import_lock: ImportLock,
    pub search_paths: PyRwLock<Vec<String>>,
    resolve_generation: AtomicU64,
}

impl Environment {
    /// Allocates a bare type Object: `type` is its own `__class__` (spec §3
    /// invariant); every other type's `__class__` is `type`.
    fn new_type(space: &Space, type_type: Option<ObjectRef>, name: &str, parents: Vec<ObjectRef>) -> ObjectRef {
        let class = type_type.unwrap_or(ObjectRef::dangling());
        let r = space.alloc(ObjectData::new(class, parents));
        space.pin_root(r);
        // `__name__` can't be a real `str` object yet — `str`'s own type
        // doesn't exist until later in bootstrap — so every name is patched
        // in with `patch_names` once `str_type` is available.
        let _ = name;
        r
    }

    /// Replaces every bootstrapped type's placeholder `__name__` with a real
    /// `str` instance, now that `str_type` exists (spec §3 "Types as
    /// objects" — a type's `__name__` is visible Python-level state, not
    /// just an internal label).
    fn patch_names(space: &Space, str_type: ObjectRef, object_type: ObjectRef, names: &[(ObjectRef, &str)]) {
        for (r, name) in names {
            let s = space.alloc(ObjectData::with_payload(
                str_type,
                vec![object_type],
                Payload::Str(Arc::from(*name)),
            ));
            space.get(*r).write().attrs.insert(space.intern("__name__"), Value::Object(s));
        }
    }

    /// Builds the space and bootstraps every well-known type/exception
    /// prototype inside it, returning both (spec §4.6 bootstrap sequence).
    pub fn bootstrap() -> (Space, Self) {
        let space = Space::new();

        // `type` is its own class (spec §3 invariant); allocate with a
        // placeholder self-reference fixed up immediately after.
        let type_type = space.alloc(ObjectData::new(ObjectRef::dangling(), Vec::new()));
        space.get(type_type).write().class = type_type;
        space.pin_root(type_type);

        let mut names: Vec<(ObjectRef, &str)> = vec![(type_type, "type")];

        let object_type = Self::new_type(&space, Some(type_type), "object", Vec::new());
        names.push((object_type, "object"));

        macro_rules! builtin_type {
            ($name:expr) => {{
                let r = Self::new_type(&space, Some(type_type), $name, vec![object_type]);
                names.push((r, $name));
                r
            }};
        }

        let int_type = builtin_type!("int");
        let float_type = builtin_type!("float");
        let bool_type = builtin_type!("bool");
        let none_type = builtin_type!("NoneType");
        let str_type = builtin_type!("str");
        let list_type = builtin_type!("list");
        let dict_type = builtin_type!("dict");
        let tuple_type = builtin_type!("tuple");
        let set_type = builtin_type!("set");
        let frozenset_type = builtin_type!("frozenset");
        let bytes_type = builtin_type!("bytes");
        let slice_type = builtin_type!("slice");
        let function_type = builtin_type!("function");
        let bound_method_type = builtin_type!("method");
        let code_type = builtin_type!("code");
        let frame_type = builtin_type!("frame");
        let generator_type = builtin_type!("generator");
        let coroutine_type = builtin_type!("coroutine");
        let module_type = builtin_type!("module");

        let types = TypePrototypes {
            object: object_type,
            type_: type_type,
            int: int_type,
            float: float_type,
            bool_: bool_type,
            none_type,
            str_: str_type,
            list: list_type,
            dict: dict_type,
            tuple: tuple_type,
            set: set_type,
            frozenset: frozenset_type,
            bytes: bytes_type,
            slice: slice_type,
            function: function_type,
            bound_method: bound_method_type,
            code: code_type,
            frame: frame_type,
            generator: generator_type,
            coroutine: coroutine_type,
            module: module_type,
        };

        let base_exception = Self::new_type(&space, Some(type_type), "BaseException", vec![object_type]);
        names.push((base_exception, "BaseException"));
        let mut by_name: IndexMap<&str, ObjectRef> = IndexMap::new();
        by_name.insert("BaseException", base_exception);
        for (name, parent) in crate::exceptions::HIERARCHY {
            let parent_ref = by_name[parent];
            let r = Self::new_type(&space, Some(type_type), name, vec![parent_ref]);
            by_name.insert(name, r);
            names.push((r, name));
        }
        let exc = ExceptionTypes {
            base_exception,
            exception: by_name["Exception"],
            syntax_error: by_name["SyntaxError"],
            indentation_error: by_name["IndentationError"],
            name_error: by_name["NameError"],
            attribute_error: by_name["AttributeError"],
            type_error: by_name["TypeError"],
            value_error: by_name["ValueError"],
            key_error: by_name["KeyError"],
            index_error: by_name["IndexError"],
            zero_division_error: by_name["ZeroDivisionError"],
            overflow_error: by_name["OverflowError"],
            stop_iteration: by_name["StopIteration"],
            generator_exit: by_name["GeneratorExit"],
            keyboard_interrupt: by_name["KeyboardInterrupt"],
            system_exit: by_name["SystemExit"],
            import_error: by_name["ImportError"],
            module_not_found_error: by_name["ModuleNotFoundError"],
            recursion_error: by_name["RecursionError"],
            assertion_error: by_name["AssertionError"],
            memory_error: by_name["MemoryError"],
            not_implemented_error: by_name["NotImplementedError"],
            stop_async_iteration: by_name["StopAsyncIteration"],
        };

        Self::patch_names(&space, str_type, object_type, &names);

        let builtins_module = space.alloc(ObjectData::new(module_type, Vec::new()));
        space.pin_root(builtins_module);
        {
            let name = space.alloc(ObjectData::with_payload(
                str_type,
                vec![object_type],
                Payload::Str(Arc::from("builtins")),
            ));
            let mut data = space.get(builtins_module).write();
            data.attrs.insert(space.intern("__name__"), Value::Object(name));
        }

        let env = Environment {
            types,
            exc,
            builtins_module,
            modules: PyRwLock::new(IndexMap::new()),
            import_lock: ImportLock::new(),
            search_paths: PyRwLock::new(Vec::new()),
            resolve_generation: AtomicU64::new(0),
        };
        (space, env)
    }

    pub fn bump_resolve_generation(&self) {
        self.resolve_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn current_generation(&self) -> u32 {
        self.resolve_generation.load(Ordering::SeqCst) as u32
    }

    /// Walks `obj`'s own attribute map only — used both by `get_attribute`'s
    /// first step and, internally, to classify a prototype hit without
    /// re-entering the full descriptor dance (spec §9).
    pub fn own_attr(&self, space: &Space, obj: ObjectRef, name: &InternedStr) -> Option<Value> {
        space.get(obj).read().attrs.get(name).cloned()
    }

    /// Raw (non-descriptor, non-binding) prototype chain search, first-wins,
    /// insertion order (spec §3 "first-wins on lookup").
    pub fn raw_chain_lookup(&self, space: &Space, obj: ObjectRef, name: &InternedStr) -> Option<(ObjectRef, Value)> {
        let data = space.get(obj).read();
        if let Some(v) = data.attrs.get(name) {
            return Some((obj, v.clone()));
        }
        let parents = data.parents.clone();
        drop(data);
        for parent in parents {
            if let Some(hit) = self.raw_chain_lookup(space, parent, name) {
                return Some(hit);
            }
        }
        None
    }

    /// The type Object a value's attribute lookups and `isinstance` checks
    /// resolve against (spec §3 "Types as objects").
    pub fn class_of(&self, space: &Space, value: &Value) -> ObjectRef {
        self.class_of_with(space, value, &self.types)
    }

    fn class_of_with(&self, space: &Space, value: &Value, type_protos: &TypePrototypes) -> ObjectRef {
        match value {
            Value::None => type_protos.none_type,
            Value::Bool(_) => type_protos.bool_,
            Value::Int(_) => type_protos.int,
            Value::Float(_) => type_protos.float,
            Value::Object(r) => space.get(*r).read().class,
        }
    }

    /// Walks the multi-parent prototype chain breadth-first-ish (plain
    /// recursion; the chain is shallow) to answer `issubclass(class, target)`.
    pub fn is_subclass(&self, space: &Space, class: ObjectRef, target: ObjectRef) -> bool {
        if class == target {
            return true;
        }
        let parents = space.get(class).read().parents.clone();
        parents.into_iter().any(|p| self.is_subclass(space, p, target))
    }

    /// `get_attribute(obj, name)` (spec §4.6). Own attributes are returned
    /// raw and unbound; prototype hits that are data/non-data descriptors
    /// invoke `__get__`, and prototype hits that are plain callables are
    /// bound to `obj`.
    pub fn get_attribute(&self, space: &Space, value: &Value, name: &str) -> PyResultAttr {
        let name = space.intern(name);
        let type_protos = self.types;
        if let Value::Object(r) = value {
            if let Some(own) = self.own_attr(space, *r, &name) {
                return PyResultAttr::Found(own);
            }
            let data = space.get(*r).read();
            let parents = data.parents.clone();
            drop(data);
            for parent in parents {
                if let Some((_, hit)) = self.raw_chain_lookup(space, parent, &name) {
                    return self.classify_prototype_hit(space, *value, hit);
                }
            }
            return PyResultAttr::NotFound;
        }
        // Immediates: attribute lookup dispatches to the owning type
        // prototype (spec §3 "Attribute lookup on immediates dispatches to
        // the corresponding type prototype").
        let class = self.class_of_with(space, value, &type_protos);
        if let Some((_, hit)) = self.raw_chain_lookup(space, class, &name) {
            return self.classify_prototype_hit(space, value.clone(), hit);
        }
        PyResultAttr::NotFound
    }

    fn classify_prototype_hit(&self, space: &Space, receiver: Value, hit: Value) -> PyResultAttr {
        if let Value::Object(hr) = &hit {
            if self.raw_chain_lookup(space, *hr, &space.intern("__get__")).is_some() {
                return PyResultAttr::Descriptor(hit, receiver);
            }
            let is_callable = matches!(
                space.get(*hr).read().payload,
                Payload::Function(_) | Payload::Native(_)
            );
            if is_callable {
                return PyResultAttr::Bind(hit, receiver);
            }
        }
        PyResultAttr::Found(hit)
    }

    /// `set_attribute(obj, name, value)` (spec §4.6): a data descriptor
    /// found via the prototype chain wins over instance storage.
    pub fn attribute_target(&self, space: &Space, obj: ObjectRef, name: &str) -> AttrTarget {
        let name = space.intern(name);
        let data = space.get(obj).read();
        let parents = data.parents.clone();
        drop(data);
        for parent in parents {
            if let Some((_, hit)) = self.raw_chain_lookup(space, parent, &name) {
                if let Value::Object(hr) = &hit {
                    if self.raw_chain_lookup(space, *hr, &space.intern("__set__")).is_some() {
                        return AttrTarget::Descriptor(hit);
                    }
                }
            }
        }
        AttrTarget::Instance
    }

    /// Step (i) of `resolve`'s search order (spec §4.6): singleton/type
    /// shortcuts for the well-known type names, answered directly off
    /// `self.types` rather than walking `globals`/`builtins` attribute maps.
    /// Recorded as a deliberate simplification in DESIGN.md: these names
    /// take precedence over a same-named global.
    fn type_shortcut(&self, name: &str) -> Option<Value> {
        Some(match name {
            "None" => Value::None,
            "True" => Value::Bool(true),
            "False" => Value::Bool(false),
            "object" => Value::Object(self.types.object),
            "type" => Value::Object(self.types.type_),
            "int" => Value::Object(self.types.int),
            "float" => Value::Object(self.types.float),
            "bool" => Value::Object(self.types.bool_),
            "str" => Value::Object(self.types.str_),
            "list" => Value::Object(self.types.list),
            "dict" => Value::Object(self.types.dict),
            "tuple" => Value::Object(self.types.tuple),
            "set" => Value::Object(self.types.set),
            "frozenset" => Value::Object(self.types.frozenset),
            "bytes" => Value::Object(self.types.bytes),
            _ => return None,
        })
    }

    /// `resolve(name)` (spec §4.6 "Name resolution"): type/singleton
    /// shortcuts, then the thread-local cache, then the frame's globals,
    /// then the builtins module. Returns `None` rather than raising —
    /// callers (`LOAD_NAME`/`LOAD_GLOBAL`) turn a miss into `NameError`.
    ///
    /// Step (iii) of the documented order ("attempt module import via the
    /// provider chain") is intentionally not implemented here: `resolve`
    /// only has `&self`/`&Space`, not the `&mut VirtualMachine` an import
    /// attempt needs to run a module's top-level code and possibly raise
    /// `ImportError`; see DESIGN.md's Open Question decisions.
    pub fn resolve(&self, space: &Space, globals: ObjectRef, name: &str) -> Option<Value> {
        if let Some(value) = self.type_shortcut(name) {
            return Some(value);
        }
        let gen = self.current_generation();
        if let Some(hit) = RESOLVE_CACHE.with(|c| c.borrow().get(name, gen)) {
            log::trace!(target: "protopython_vm::environment", "resolve cache hit for '{name}'");
            return Some(hit);
        }
        let interned = space.intern(name);
        let found = self
            .own_attr(space, globals, &interned)
            .or_else(|| self.own_attr(space, self.builtins_module, &interned));
        if let Some(value) = &found {
            RESOLVE_CACHE.with(|c| c.borrow_mut().put(name, gen, value.clone()));
        }
        found
    }
}

pub enum PyResultAttr {
    Found(Value),
    /// Found via the prototype chain, and the hit is a data/non-data
    /// descriptor: the caller must invoke `hit.__get__(receiver, type)`.
    Descriptor(Value, Value),
    /// Found via the prototype chain and is a plain callable: the caller
    /// should wrap it as a bound method.
    Bind(Value, Value),
    NotFound,
}

pub enum AttrTarget {
    Instance,
    Descriptor(Value),
}

/// Resolves `hit`/`Descriptor`/`Bind` dispositions down to a concrete
/// `Value`, running `__get__` or constructing the bound-method Object as
/// needed. Split out of `Environment` because it needs `&mut VirtualMachine`
/// to invoke `__get__`.
pub fn finish_attribute(
    vm: &mut crate::vm::VirtualMachine,
    disposition: PyResultAttr,
) -> crate::exceptions::PyResult<Option<Value>> {
    match disposition {
        PyResultAttr::Found(v) => Ok(Some(v)),
        PyResultAttr::NotFound => Ok(None),
        PyResultAttr::Bind(func, receiver) => Ok(Some(vm.new_bound_method(func, receiver))),
        PyResultAttr::Descriptor(descriptor, receiver) => {
            let get = vm.env.get_attribute(&vm.space, &descriptor, "__get__");
            let get = finish_attribute(vm, get)?.expect("__get__ presence already checked");
            let owner_type = vm.type_of(&receiver);
            Ok(Some(call_value(
                vm,
                get,
                FuncArgs::positional(vec![receiver, owner_type]),
            )?))
        }
    }
}
