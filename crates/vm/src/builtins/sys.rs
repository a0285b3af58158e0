//! The native `sys` module (spec §4.7 "native providers"; SPEC_FULL.md
//! ambient-stack "a minimal but real standard library surface").
//!
//! Populated directly into a module's attribute map by `ModuleSource::Native`
//! rather than compiled from source, since there is no Python-level body to
//! run — grounded on the teacher's `stdlib/sys.rs` attribute set, narrowed to
//! the handful of names this runtime's own import/compile pipeline actually
//! consults (`sys.path`) plus the identifying constants a script typically
//! inspects (`sys.argv`, `sys.version`, `sys.maxsize`).

use crate::exceptions::PyResult;
use crate::space::ObjectRef;
use crate::value::Value;
use crate::vm::VirtualMachine;

pub fn init_module(vm: &mut VirtualMachine, module: ObjectRef) -> PyResult<()> {
    let argv = vm.new_list(Vec::new());
    let path_entries: Vec<Value> = vm.env.search_paths.read().iter().map(|p| vm.new_str(p)).collect();
    let path = vm.new_list(path_entries);
    let version = vm.new_str("3.11.0 (protopython)");
    let modules: Vec<Value> = vm
        .env
        .modules
        .read()
        .keys()
        .map(|name| vm.new_str(name))
        .collect();
    let modules = vm.new_list(modules);

    let mut data = vm.space.get(module).write();
    data.attrs.insert(vm.space.intern("argv"), argv);
    data.attrs.insert(vm.space.intern("path"), path);
    data.attrs.insert(vm.space.intern("version"), version);
    data.attrs.insert(vm.space.intern("maxsize"), Value::Int(i64::MAX));
    data.attrs.insert(vm.space.intern("platform"), vm.new_str("protopython"));
    data.attrs.insert(vm.space.intern("modules"), modules);
    Ok(())
}
