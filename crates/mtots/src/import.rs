//! The import subsystem: module cache, search roots, and the prelude.
//!
//! `import_module` resolves a name to a module instance and leaves it on
//! the VM stack. Resolution order: cache, registered native modules, then
//! `<name>.mtots` under the four search roots (project, auxiliary, library,
//! stdlib), each taken from its environment variable. The prelude is
//! embedded in the binary and importable without any filesystem.

use std::path::PathBuf;

use crate::compiler;
use crate::error::{Error, Result};
use crate::object::{Obj, ObjClosure};
use crate::value::{StrId, Value};
use crate::vm::Vm;

pub const MTOTS_FILE_EXTENSION: &str = ".mtots";

const PRELUDE_SOURCE: &str = include_str!("prelude.mtots");

/// The names the prelude contributes to the default globals.
const HOISTED_PRELUDE_NAMES: [&str; 5] = ["sorted", "list", "tuple", "dict", "set"];

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/home"))
}

fn stdlib_root() -> PathBuf {
    match std::env::var_os("MTOTS_STDLIB_ROOT") {
        Some(root) => PathBuf::from(root),
        // A guess, for checkouts that have not set the variable.
        None => home_dir().join("git").join("mtots").join("root"),
    }
}

/// Search roots in priority order: project, auxiliary, library, stdlib.
fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for var in ["MTOTS_ROOT", "MTOTS_AUX_ROOT", "MTOTS_LIB_ROOT"] {
        if let Some(root) = std::env::var_os(var) {
            roots.push(PathBuf::from(root));
        }
    }
    roots.push(stdlib_root());
    roots
}

/// Locate `<name>.mtots` under the search roots.
pub fn find_module_path(module_name: &str) -> Option<PathBuf> {
    for root in search_roots() {
        let path = root.join(format!("{module_name}{MTOTS_FILE_EXTENSION}"));
        if path.is_file() {
            return Some(path);
        }
    }
    None
}

/// Import a module by name, consulting the cache first. On success the
/// module instance is on top of the VM stack.
pub fn import_module(vm: &mut Vm, name: StrId) -> Result<()> {
    if let Some(module) = vm.module_cache_get(name) {
        vm.push(module);
        return Ok(());
    }
    import_module_no_cache(vm, name)?;
    let module = vm.peek(0);
    vm.module_cache_set(name, module);
    Ok(())
}

fn import_module_no_cache(vm: &mut Vm, name: StrId) -> Result<()> {
    if let Some(thunk) = vm.native_module_thunk(name) {
        return import_native_module(vm, name, thunk);
    }

    if name == vm.names.prelude {
        return import_module_source(vm, name, PRELUDE_SOURCE, None);
    }

    let module_name = vm.heap.str(name).to_string();
    match find_module_path(&module_name) {
        Some(path) => {
            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(err) => panic!("Could not read file \"{}\": {err}", path.display()),
            };
            import_module_source(vm, name, &source, Some(&path.display().to_string()))
        }
        None => Err(vm.error(format!("Could not find module {module_name}"))),
    }
}

fn import_native_module(vm: &mut Vm, name: StrId, thunk: Value) -> Result<()> {
    let cfunction = match thunk {
        Value::CFunction(cfunction) => cfunction,
        _ => panic!("native module table holds a non-cfunction"),
    };
    // Native modules start without the script globals.
    let module = compiler::new_module(&mut vm.heap, name, None);
    let module_value = Value::Obj(module);
    vm.push(module_value);

    let stack_depth = vm.stack_len();
    (cfunction.body)(vm, thunk, &[module_value])?;
    if vm.stack_len() != stack_depth {
        panic!(
            "Native module started with {} items on the stack, but ended with {}",
            stack_depth,
            vm.stack_len()
        );
    }

    vm.promote_module_fields(module);
    Ok(())
}

/// Compile and run `source` as the module body. On success the module
/// instance is on top of the VM stack.
fn import_module_source(
    vm: &mut Vm,
    name: StrId,
    source: &str,
    path: Option<&str>,
) -> Result<()> {
    let module = compiler::new_module(&mut vm.heap, name, Some(&vm.globals));
    vm.push(Value::Obj(module));

    if let Some(path) = path {
        let path_id = vm.heap.intern(path);
        vm.set_module_field(module, "__path__", Value::Str(path_id));
    }

    let thunk = match compiler::compile(&mut vm.heap, source, name) {
        Ok(thunk) => thunk,
        Err(Error::Compile(_)) => {
            let what = path.unwrap_or_else(|| vm.heap.str(name));
            return Err(vm.error(format!("Failed to compile {what}")));
        }
        Err(other) => return Err(other),
    };

    vm.push(Value::Obj(thunk));
    let closure = vm.alloc(Obj::Closure(ObjClosure {
        module,
        thunk,
        upvalues: Vec::new(),
    }));
    vm.pop();
    vm.push(Value::Obj(closure));

    let frame_base = vm.frames_len();
    vm.call_closure(closure, 0)?;
    vm.run_until(frame_base)?;
    vm.pop(); // the module body's return value

    // Make qualified calls dispatch as methods.
    vm.promote_module_fields(module);

    // The module pushed at the start is still on top.
    Ok(())
}

/// Import the prelude and hoist its contribution into the builtin globals:
/// `sorted`, `list`, `tuple`, `dict`, `set`, and `__List__.sort` onto the
/// built-in `List` class.
pub fn prep_prelude(vm: &mut Vm) {
    if let Err(err) = import_module(vm, vm.names.prelude) {
        panic!("Failed to load prelude: {err}");
    }
    let module = match vm.peek(0) {
        Value::Obj(id) if matches!(vm.heap.get(id), Obj::Instance(_)) => id,
        other => panic!("Unexpected stack state after loading prelude: {other:?}"),
    };

    let fields: Vec<(Value, Value)> = match vm.heap.get(module) {
        Obj::Instance(instance) => instance.fields.iter().collect(),
        _ => unreachable!("checked above"),
    };

    for (key, value) in fields {
        let Value::Str(key_id) = key else { continue };
        let key_text = vm.heap.str(key_id).to_string();
        if HOISTED_PRELUDE_NAMES.contains(&key_text.as_str()) {
            vm.define_global(&key_text, value);
        } else if key_text == "__List__" {
            let mixin_class = match value {
                Value::Obj(id) if matches!(vm.heap.get(id), Obj::Class(_)) => id,
                _ => panic!("__prelude__.__List__ is not a class"),
            };
            let sort = {
                let sort_name = vm.heap.intern("sort");
                let hash = vm.heap.strings.hash(sort_name);
                match vm.heap.get(mixin_class) {
                    Obj::Class(class) => class.methods.get(Value::Str(sort_name), hash),
                    _ => unreachable!("checked above"),
                }
            };
            if let Some(sort) = sort {
                let sort_name = vm.heap.intern("sort");
                let hash = vm.heap.strings.hash(sort_name);
                let list_class = vm.classes.list;
                if let Obj::Class(class) = vm.heap.get_mut(list_class) {
                    class.methods.set(Value::Str(sort_name), hash, sort);
                }
            }
        }
    }

    vm.pop(); // the prelude module; it stays alive through the module cache
}
