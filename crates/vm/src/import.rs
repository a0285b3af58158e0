//! Module-provider import pipeline (spec §4.7 "Import pipeline").
//!
//! Grounded on the teacher's `import.rs` (`import_file`/`import_source`,
//! walking `sys.path` and handing source text to the compiler before
//! executing it in a fresh module frame), generalized into an ordered chain
//! of `ModuleProvider`s so native (Rust-implemented) modules and
//! source-backed modules share one lookup path (spec: "providers are tried
//! in registration order; the first to claim a name wins").

use crate::exceptions::{raise, PyResult};
use crate::frame::Frame;
use crate::object::ObjectData;
use crate::space::ObjectRef;
use crate::value::Value;
use crate::vm::VirtualMachine;
use std::fs;
use std::path::PathBuf;

/// What a provider found for a given module name (spec §4.7 "a provider
/// either declines or returns a module body").
pub enum ModuleSource {
    /// Populates the module's attribute dict directly; used for modules with
    /// no Python-level source (`sys`, `builtins` helpers).
    Native(fn(&mut VirtualMachine, ObjectRef) -> PyResult<()>),
    /// Python source text plus the path it was read from, to tokenize,
    /// parse, compile, and execute in a fresh module-scope frame.
    Source(String, String),
}

pub trait ModuleProvider: Send + Sync {
    /// Returns `Some` the first time a provider recognizes `name`; providers
    /// are consulted in the chain's registration order and the search stops
    /// at the first hit (spec §4.7).
    fn find(&self, name: &str, search_paths: &[String]) -> Option<ModuleSource>;
}

/// Serves the handful of modules built into the runtime rather than loaded
/// from source (spec §4.7 "native providers"; `builtins` itself is handled
/// separately since it's always present and never looked up by name here).
pub struct NativeProvider;

impl ModuleProvider for NativeProvider {
    fn find(&self, name: &str, _search_paths: &[String]) -> Option<ModuleSource> {
        match name {
            "sys" => Some(ModuleSource::Native(crate::builtins::sys::init_module)),
            _ => None,
        }
    }
}

/// Resolves `<search_path>/<name>.py` on disk, mirroring the teacher's
/// `import_file` path-joining (spec §4.7 "source providers consult
/// `sys.path`-style search paths").
pub struct SourceProvider;

impl ModuleProvider for SourceProvider {
    fn find(&self, name: &str, search_paths: &[String]) -> Option<ModuleSource> {
        for dir in search_paths {
            let mut path = PathBuf::from(dir);
            path.push(format!("{name}.py"));
            if let Ok(text) = fs::read_to_string(&path) {
                return Some(ModuleSource::Source(text, path.display().to_string()));
            }
        }
        None
    }
}

/// True once a module's top-level body has returned without raising; a
/// module whose execution failed stays in the registry with this `false` so
/// a later `import` of the same name retries rather than silently handing
/// back a half-initialized module (spec §4.7).
fn is_executed(vm: &VirtualMachine, module: ObjectRef) -> bool {
    matches!(
        vm.space.get(module).read().attrs.get(&vm.space.intern("__executed__")),
        Some(Value::Bool(true))
    )
}

/// Imports `name`, returning the (possibly cached) module Object (spec
/// §4.7). Acquires the reentrant import lock for the duration of the search
/// and first execution so two threads racing to import the same module
/// can't both run its top-level code.
pub fn import_module(vm: &mut VirtualMachine, name: &str) -> PyResult<ObjectRef> {
    if let Some(existing) = vm.env.modules.read().get(name).copied() {
        if is_executed(vm, existing) {
            return Ok(existing);
        }
    }

    let _guard = vm.env.import_lock.acquire(&vm.space, &vm.thread);
    if let Some(existing) = vm.env.modules.read().get(name).copied() {
        if is_executed(vm, existing) {
            return Ok(existing);
        }
        return retry_module(vm, existing, name);
    }

    let search_paths = vm.env.search_paths.read().clone();
    let found = vm.providers.iter().find_map(|p| p.find(name, &search_paths));

    let Some(source) = found else {
        log::warn!(target: "protopython_vm::import", "no provider claimed module '{name}'");
        return raise(vm.new_error(
            vm.env.exc.module_not_found_error,
            format!("No module named '{name}'"),
        ));
    };
    log::debug!(target: "protopython_vm::import", "loading module '{name}'");

    let module = vm.space.alloc(ObjectData::new(vm.env.types.module, vec![vm.env.types.module]));
    {
        let mut data = vm.space.get(module).write();
        data.attrs.insert(vm.space.intern("__name__"), vm.new_str(name));
        data.attrs.insert(vm.space.intern("__executed__"), Value::Bool(false));
        data.attrs.insert(vm.space.intern("__file__"), Value::None);
        data.attrs.insert(vm.space.intern("__builtins__"), Value::Object(vm.env.builtins_module));
    }
    // Not pinned: the module registry itself is supplied as a GC root
    // (`VirtualMachine::collect`), so a module only stays alive as long as
    // `sys.modules` (or something reachable) still references it.
    vm.env.modules.write().insert(name.to_string(), module);

    run_module_source(vm, module, name, source)?;
    Ok(module)
}

/// Re-attempts a module whose previous execution left `__executed__ =
/// false`, reusing the same registry entry rather than allocating a fresh
/// module Object.
fn retry_module(vm: &mut VirtualMachine, module: ObjectRef, name: &str) -> PyResult<ObjectRef> {
    log::warn!(target: "protopython_vm::import", "retrying previously-failed import of '{name}'");
    let search_paths = vm.env.search_paths.read().clone();
    let found = vm.providers.iter().find_map(|p| p.find(name, &search_paths));
    let Some(source) = found else {
        return raise(vm.new_error(
            vm.env.exc.module_not_found_error,
            format!("No module named '{name}'"),
        ));
    };
    run_module_source(vm, module, name, source)?;
    Ok(module)
}

fn run_module_source(vm: &mut VirtualMachine, module: ObjectRef, name: &str, source: ModuleSource) -> PyResult<()> {
    match source {
        ModuleSource::Native(init) => {
            init(vm, module)?;
        }
        ModuleSource::Source(text, path) => {
            let path_val = vm.new_str(&path);
            vm.space.get(module).write().attrs.insert(vm.space.intern("__file__"), path_val);
            exec_module_source(vm, module, name, &text)?;
        }
    }
    vm.space.get(module).write().attrs.insert(vm.space.intern("__executed__"), Value::Bool(true));
    log::info!(target: "protopython_vm::import", "module '{name}' executed");
    Ok(())
}

fn exec_module_source(vm: &mut VirtualMachine, module: ObjectRef, name: &str, text: &str) -> PyResult<()> {
    let code = match protopython_compiler::compile_program(text, name, protopython_compiler::Mode::Exec, vm.space.strings()) {
        Ok(code) => code,
        Err(e) => {
            let exc = vm.env.exc.syntax_error;
            return raise(vm.new_error(exc, e.to_string()));
        }
    };
    let frame = Frame::new(std::sync::Arc::new(code), module, Some(module), None);
    vm.run_frame(frame)?;
    Ok(())
}
