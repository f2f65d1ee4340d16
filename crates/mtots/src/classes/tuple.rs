//! Methods on the `Tuple` class.

use crate::error::Result;
use crate::heap::Heap;
use crate::object::{NativeClosureState, Obj, ObjNativeClosure};
use crate::value::{CFunction, ObjId, TypePattern, Value};
use crate::vm::Vm;

fn receiver_tuple(vm: &Vm, receiver: Value, method: &str) -> Result<ObjId> {
    if let Value::Obj(id) = receiver {
        if matches!(vm.heap.get(id), Obj::Tuple(_)) {
            return Ok(id);
        }
    }
    Err(vm.error(format!("Expected tuple as receiver to Tuple.{method}()")))
}

/// `tuple * n` interns a tuple with the elements repeated `n` times.
fn impl_mul(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_tuple(vm, receiver, "__mul__")?;
    let repetitions = args[0].as_u32() as usize;
    let items: Vec<Value> = match vm.heap.get(id) {
        Obj::Tuple(tuple) => tuple.items.to_vec(),
        _ => unreachable!("receiver checked above"),
    };
    let mut result = Vec::with_capacity(items.len() * repetitions);
    for _ in 0..repetitions {
        result.extend_from_slice(&items);
    }
    let tuple = vm.heap.intern_tuple(&result)?;
    Ok(Value::Obj(tuple))
}

static FUNC_MUL: CFunction =
    CFunction::typed("__mul__", &[TypePattern::Number], impl_mul);

fn impl_getitem(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_tuple(vm, receiver, "__getitem__")?;
    let length = match vm.heap.get(id) {
        Obj::Tuple(tuple) => tuple.items.len(),
        _ => unreachable!("receiver checked above"),
    };
    let Some(index) = args[0].as_number() else {
        return Err(vm.error("Expected Tuple index to be a number"));
    };
    let mut index = index as i64;
    if index < 0 {
        index += length as i64;
    }
    if index < 0 || index >= length as i64 {
        return Err(vm.error("Tuple index out of bounds"));
    }
    match vm.heap.get(id) {
        Obj::Tuple(tuple) => Ok(tuple.items[index as usize]),
        _ => unreachable!("receiver checked above"),
    }
}

static FUNC_GETITEM: CFunction = CFunction::new("__getitem__", 1, impl_getitem);

fn impl_iter(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let id = receiver_tuple(vm, receiver, "__iter__")?;
    let iterator = vm.alloc(Obj::NativeClosure(ObjNativeClosure {
        name: "TupleIterator",
        arity: 0,
        state: NativeClosureState::TupleIter { tuple: id, index: 0 },
    }));
    Ok(Value::Obj(iterator))
}

static FUNC_ITER: CFunction = CFunction::new("__iter__", 0, impl_iter);

pub fn init(heap: &mut Heap) -> ObjId {
    super::make_builtin_class(heap, "Tuple", &[&FUNC_MUL, &FUNC_GETITEM, &FUNC_ITER])
}
