//! Methods on the `Class` class.

use crate::error::Result;
use crate::heap::Heap;
use crate::object::Obj;
use crate::value::{CFunction, ObjId, Value};
use crate::vm::Vm;

fn impl_get_name(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    match receiver {
        Value::Obj(id) => match vm.heap.get(id) {
            Obj::Class(class) => Ok(Value::Str(class.name)),
            _ => Err(vm.error("Expected class as receiver to Class.getName()")),
        },
        _ => Err(vm.error("Expected class as receiver to Class.getName()")),
    }
}

static FUNC_GET_NAME: CFunction = CFunction::new("getName", 0, impl_get_name);

pub fn init(heap: &mut Heap) -> ObjId {
    super::make_builtin_class(heap, "Class", &[&FUNC_GET_NAME])
}
