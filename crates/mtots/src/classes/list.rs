//! Methods on the `List` class. The prelude grafts `sort` on afterwards.

use crate::error::Result;
use crate::heap::Heap;
use crate::object::{NativeClosureState, Obj, ObjList, ObjNativeClosure};
use crate::value::{CFunction, ObjId, TypePattern, Value};
use crate::vm::Vm;

fn receiver_list(vm: &Vm, receiver: Value, method: &str) -> Result<ObjId> {
    if let Value::Obj(id) = receiver {
        if matches!(vm.heap.get(id), Obj::List(_)) {
            return Ok(id);
        }
    }
    Err(vm.error(format!("Expected list as receiver to List.{method}()")))
}

fn impl_append(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_list(vm, receiver, "append")?;
    if let Obj::List(list) = vm.heap.get_mut(id) {
        list.items.push(args[0]);
    }
    Ok(Value::Nil)
}

static FUNC_APPEND: CFunction = CFunction::new("append", 1, impl_append);

fn impl_pop(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let id = receiver_list(vm, receiver, "pop")?;
    let popped = match vm.heap.get_mut(id) {
        Obj::List(list) => list.items.pop(),
        _ => unreachable!("receiver checked above"),
    };
    match popped {
        Some(value) => Ok(value),
        None => Err(vm.error("Pop from an empty List")),
    }
}

static FUNC_POP: CFunction = CFunction::new("pop", 0, impl_pop);

/// `list * n` builds a list with the elements repeated `n` times.
fn impl_mul(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_list(vm, receiver, "__mul__")?;
    let repetitions = args[0].as_u32() as usize;
    let items = match vm.heap.get(id) {
        Obj::List(list) => list.items.clone(),
        _ => unreachable!("receiver checked above"),
    };
    let mut result = Vec::with_capacity(items.len() * repetitions);
    for _ in 0..repetitions {
        result.extend_from_slice(&items);
    }
    let list = vm.alloc(Obj::List(ObjList { items: result }));
    Ok(Value::Obj(list))
}

static FUNC_MUL: CFunction =
    CFunction::typed("__mul__", &[TypePattern::Number], impl_mul);

fn checked_index(vm: &Vm, arg: Value, length: usize, method: &str) -> Result<usize> {
    let Some(index) = arg.as_number() else {
        return Err(vm.error(format!("Expected List index to {method} to be a number")));
    };
    let mut index = index as i64;
    if index < 0 {
        index += length as i64;
    }
    if index < 0 || index >= length as i64 {
        return Err(vm.error("List index out of bounds"));
    }
    Ok(index as usize)
}

fn impl_getitem(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_list(vm, receiver, "__getitem__")?;
    let length = match vm.heap.get(id) {
        Obj::List(list) => list.items.len(),
        _ => unreachable!("receiver checked above"),
    };
    let index = checked_index(vm, args[0], length, "List.__getitem__()")?;
    match vm.heap.get(id) {
        Obj::List(list) => Ok(list.items[index]),
        _ => unreachable!("receiver checked above"),
    }
}

static FUNC_GETITEM: CFunction = CFunction::new("__getitem__", 1, impl_getitem);

fn impl_setitem(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_list(vm, receiver, "__setitem__")?;
    let length = match vm.heap.get(id) {
        Obj::List(list) => list.items.len(),
        _ => unreachable!("receiver checked above"),
    };
    let index = checked_index(vm, args[0], length, "List.__setitem__()")?;
    if let Obj::List(list) = vm.heap.get_mut(id) {
        list.items[index] = args[1];
    }
    Ok(Value::Nil)
}

static FUNC_SETITEM: CFunction = CFunction::new("__setitem__", 2, impl_setitem);

fn impl_iter(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let id = receiver_list(vm, receiver, "__iter__")?;
    let iterator = vm.alloc(Obj::NativeClosure(ObjNativeClosure {
        name: "ListIterator",
        arity: 0,
        state: NativeClosureState::ListIter { list: id, index: 0 },
    }));
    Ok(Value::Obj(iterator))
}

static FUNC_ITER: CFunction = CFunction::new("__iter__", 0, impl_iter);

pub fn init(heap: &mut Heap) -> ObjId {
    super::make_builtin_class(
        heap,
        "List",
        &[
            &FUNC_APPEND,
            &FUNC_POP,
            &FUNC_MUL,
            &FUNC_GETITEM,
            &FUNC_SETITEM,
            &FUNC_ITER,
        ],
    )
}
