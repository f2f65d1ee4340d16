//! Methods on the `FrozenDict` class: the read-only subset of `Dict`.

use crate::error::Result;
use crate::heap::Heap;
use crate::object::{NativeClosureState, Obj, ObjNativeClosure};
use crate::ops;
use crate::value::{CFunction, ObjId, Value};
use crate::vm::Vm;

fn receiver_frozen(vm: &Vm, receiver: Value, method: &str) -> Result<ObjId> {
    if let Value::Obj(id) = receiver {
        if matches!(vm.heap.get(id), Obj::FrozenDict(_)) {
            return Ok(id);
        }
    }
    Err(vm.error(format!(
        "Expected FrozenDict as receiver to FrozenDict.{method}()"
    )))
}

fn impl_getitem(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_frozen(vm, receiver, "__getitem__")?;
    let hash = vm.heap.value_hash(args[0])?;
    let found = match vm.heap.get(id) {
        Obj::FrozenDict(fdict) => fdict.map.get(args[0], hash),
        _ => unreachable!("receiver checked above"),
    };
    match found {
        Some(value) => Ok(value),
        None => Err(vm.error(format!(
            "Key {} not found in FrozenDict",
            ops::value_repr(&vm.heap, args[0])
        ))),
    }
}

static FUNC_GETITEM: CFunction = CFunction::new("__getitem__", 1, impl_getitem);

fn impl_contains(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_frozen(vm, receiver, "__contains__")?;
    let hash = vm.heap.value_hash(args[0])?;
    let contains = match vm.heap.get(id) {
        Obj::FrozenDict(fdict) => fdict.map.contains(args[0], hash),
        _ => unreachable!("receiver checked above"),
    };
    Ok(Value::Bool(contains))
}

static FUNC_CONTAINS: CFunction = CFunction::new("__contains__", 1, impl_contains);

fn impl_iter(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let id = receiver_frozen(vm, receiver, "__iter__")?;
    let keys: Vec<Value> = match vm.heap.get(id) {
        Obj::FrozenDict(fdict) => fdict.map.keys().collect(),
        _ => unreachable!("receiver checked above"),
    };
    let iterator = vm.alloc(Obj::NativeClosure(ObjNativeClosure {
        name: "FrozenDictIterator",
        arity: 0,
        state: NativeClosureState::MapKeyIter { keys, index: 0 },
    }));
    Ok(Value::Obj(iterator))
}

static FUNC_ITER: CFunction = CFunction::new("__iter__", 0, impl_iter);

fn impl_rget(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_frozen(vm, receiver, "rget")?;
    let pairs: Vec<(Value, Value)> = match vm.heap.get(id) {
        Obj::FrozenDict(fdict) => fdict.map.iter().collect(),
        _ => unreachable!("receiver checked above"),
    };
    for (key, value) in pairs {
        if ops::values_equal(&vm.heap, value, args[0]) {
            return Ok(key);
        }
    }
    match args.get(1) {
        Some(default) => Ok(*default),
        None => Err(vm.error("No key found for the given value in FrozenDict.rget()")),
    }
}

static FUNC_RGET: CFunction = CFunction::variadic("rget", 1, 2, impl_rget);

pub fn init(heap: &mut Heap) -> ObjId {
    super::make_builtin_class(
        heap,
        "FrozenDict",
        &[&FUNC_GETITEM, &FUNC_CONTAINS, &FUNC_ITER, &FUNC_RGET],
    )
}
