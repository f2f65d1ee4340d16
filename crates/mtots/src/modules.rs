//! Bundled native modules and the registration entry point.
//!
//! A native module is an arity-1 `CFunction` receiving the freshly created
//! module instance; it populates the instance's fields and must leave the
//! value stack depth unchanged. The import subsystem copies the fields into
//! the module's class afterwards so `module.fn(x)` dispatches as a method.

use crate::error::Result;
use crate::map::Map;
use crate::object::{Obj, ObjDict, ObjList};
use crate::value::{CFunction, TypePattern, Value};
use crate::vm::Vm;

/// Register the modules that ship with the interpreter.
pub fn register_native_modules(vm: &mut Vm) {
    vm.add_native_module(&OS_MODULE);
    vm.add_native_module(&JSON_MODULE);
}

// ---------------------------------------------------------------------------
// os
// ---------------------------------------------------------------------------

fn impl_dirname(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let path = match args[0] {
        Value::Str(id) => vm.heap.str(id).to_string(),
        _ => unreachable!("validated by TypePattern"),
    };
    let dirname = std::path::Path::new(&path)
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or("")
        .to_string();
    Ok(Value::Str(vm.heap.intern_owned(dirname)))
}

static FUNC_DIRNAME: CFunction =
    CFunction::typed("dirname", &[TypePattern::Str], impl_dirname);

fn impl_basename(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let path = match args[0] {
        Value::Str(id) => vm.heap.str(id).to_string(),
        _ => unreachable!("validated by TypePattern"),
    };
    let basename = std::path::Path::new(&path)
        .file_name()
        .and_then(|p| p.to_str())
        .unwrap_or("")
        .to_string();
    Ok(Value::Str(vm.heap.intern_owned(basename)))
}

static FUNC_BASENAME: CFunction =
    CFunction::typed("basename", &[TypePattern::Str], impl_basename);

fn impl_join(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let list_id = args[0].as_obj_id().expect("validated by TypePattern");
    let items = match vm.heap.get(list_id) {
        Obj::List(list) => list.items.clone(),
        _ => unreachable!("validated by TypePattern"),
    };
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Str(id) => parts.push(vm.heap.str(id).to_string()),
            other => {
                return Err(vm.error(format!(
                    "os.join() requires a list of strings but got list item {}",
                    vm.heap.kind_name(other)
                )));
            }
        }
    }
    let joined = parts.join(std::path::MAIN_SEPARATOR_STR);
    Ok(Value::Str(vm.heap.intern_owned(joined)))
}

static FUNC_JOIN: CFunction =
    CFunction::typed("join", &[TypePattern::List], impl_join);

fn impl_os_module(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let module = args[0].as_obj_id().expect("native modules receive a module instance");
    let name_value = {
        let id = vm.heap.intern(std::env::consts::OS);
        Value::Str(id)
    };
    vm.set_module_field(module, "name", name_value);
    let sep_value = {
        let id = vm.heap.intern(std::path::MAIN_SEPARATOR_STR);
        Value::Str(id)
    };
    vm.set_module_field(module, "sep", sep_value);
    vm.set_module_field(module, "dirname", Value::CFunction(&FUNC_DIRNAME));
    vm.set_module_field(module, "basename", Value::CFunction(&FUNC_BASENAME));
    vm.set_module_field(module, "join", Value::CFunction(&FUNC_JOIN));
    Ok(Value::Nil)
}

static OS_MODULE: CFunction = CFunction::new("os", 1, impl_os_module);

// ---------------------------------------------------------------------------
// json
// ---------------------------------------------------------------------------

/// Convert parsed JSON into runtime values.
///
/// Everything here allocates straight against the heap (never through the
/// VM's gate) so a collection cannot run while the tree is only reachable
/// from Rust locals.
fn json_to_value(vm: &mut Vm, json: &serde_json::Value) -> Result<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::Str(vm.heap.intern(s)),
        serde_json::Value::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(json_to_value(vm, item)?);
            }
            Value::Obj(vm.heap.allocate(Obj::List(ObjList { items: list })))
        }
        serde_json::Value::Object(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                let key_id = vm.heap.intern(key);
                let hash = vm.heap.strings.hash(key_id);
                let value = json_to_value(vm, value)?;
                map.set(Value::Str(key_id), hash, value);
            }
            Value::Obj(vm.heap.allocate(Obj::Dict(ObjDict { map })))
        }
    })
}

fn value_to_json(vm: &Vm, value: Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Number(n) => match serde_json::Number::from_f64(n) {
            Some(n) => serde_json::Value::Number(n),
            None => {
                return Err(vm.error("json.dumps() cannot serialize nan or infinity"));
            }
        },
        Value::Str(id) => serde_json::Value::String(vm.heap.str(id).to_string()),
        Value::Obj(id) => match vm.heap.get(id) {
            Obj::List(list) => {
                let mut items = Vec::with_capacity(list.items.len());
                for item in &list.items {
                    items.push(value_to_json(vm, *item)?);
                }
                serde_json::Value::Array(items)
            }
            Obj::Tuple(tuple) => {
                let mut items = Vec::with_capacity(tuple.items.len());
                for item in tuple.items.iter() {
                    items.push(value_to_json(vm, *item)?);
                }
                serde_json::Value::Array(items)
            }
            Obj::Dict(dict) => json_object_from_map(vm, &dict.map)?,
            Obj::FrozenDict(fdict) => json_object_from_map(vm, &fdict.map)?,
            _ => {
                return Err(vm.error(format!(
                    "json.dumps() cannot serialize {} values",
                    vm.heap.kind_name(value)
                )));
            }
        },
        _ => {
            return Err(vm.error(format!(
                "json.dumps() cannot serialize {} values",
                vm.heap.kind_name(value)
            )));
        }
    })
}

fn json_object_from_map(vm: &Vm, map: &Map) -> Result<serde_json::Value> {
    let mut object = serde_json::Map::new();
    for (key, value) in map.iter() {
        let Value::Str(key_id) = key else {
            return Err(vm.error("json.dumps() requires string keys"));
        };
        object.insert(vm.heap.str(key_id).to_string(), value_to_json(vm, value)?);
    }
    Ok(serde_json::Value::Object(object))
}

fn impl_loads(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let text = match args[0] {
        Value::Str(id) => vm.heap.str(id).to_string(),
        _ => unreachable!("validated by TypePattern"),
    };
    let parsed: serde_json::Value = serde_json::from_str(&text)
        .map_err(|err| vm.error(format!("json.loads(): {err}")))?;
    json_to_value(vm, &parsed)
}

static FUNC_LOADS: CFunction =
    CFunction::typed("loads", &[TypePattern::Str], impl_loads);

fn impl_dumps(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let json = value_to_json(vm, args[0])?;
    let text = json.to_string();
    Ok(Value::Str(vm.heap.intern_owned(text)))
}

static FUNC_DUMPS: CFunction = CFunction::new("dumps", 1, impl_dumps);

fn impl_json_module(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let module = args[0].as_obj_id().expect("native modules receive a module instance");
    vm.set_module_field(module, "loads", Value::CFunction(&FUNC_LOADS));
    vm.set_module_field(module, "dumps", Value::CFunction(&FUNC_DUMPS));
    Ok(Value::Nil)
}

static JSON_MODULE: CFunction = CFunction::new("json", 1, impl_json_module);
