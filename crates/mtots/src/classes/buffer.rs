//! Methods on the `Buffer` class: a growable byte vector with typed
//! accessors honoring the buffer's byte order, lockable into immutability.

use crate::error::Result;
use crate::heap::Heap;
use crate::object::{ByteOrder, Obj};
use crate::value::{CFunction, ObjId, TypePattern, Value};
use crate::vm::Vm;

fn receiver_buffer(vm: &Vm, receiver: Value, method: &str) -> Result<ObjId> {
    if let Value::Obj(id) = receiver {
        if matches!(vm.heap.get(id), Obj::Buffer(_)) {
            return Ok(id);
        }
    }
    Err(vm.error(format!("Expected Buffer as receiver to Buffer.{method}()")))
}

fn check_mutable(vm: &Vm, id: ObjId, method: &str) -> Result<()> {
    match vm.heap.get(id) {
        Obj::Buffer(buffer) if buffer.locked => {
            Err(vm.error(format!("Buffer is locked and cannot be modified by {method}()")))
        }
        _ => Ok(()),
    }
}

/// Bounds-checked read of `len` bytes at `pos`.
fn read_bytes(vm: &Vm, id: ObjId, pos: usize, len: usize) -> Result<Vec<u8>> {
    match vm.heap.get(id) {
        Obj::Buffer(buffer) => match buffer.data.get(pos..pos + len) {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(vm.error(format!(
                "Buffer read of {len} bytes at {pos} is out of bounds (length {})",
                buffer.data.len()
            ))),
        },
        _ => unreachable!("receiver checked by caller"),
    }
}

fn write_bytes(vm: &mut Vm, id: ObjId, pos: usize, bytes: &[u8]) -> Result<()> {
    match vm.heap.get_mut(id) {
        Obj::Buffer(buffer) => match buffer.data.get_mut(pos..pos + bytes.len()) {
            Some(slot) => {
                slot.copy_from_slice(bytes);
                Ok(())
            }
            None => {
                let length = buffer.data.len();
                Err(vm.error(format!(
                    "Buffer write of {} bytes at {pos} is out of bounds (length {length})",
                    bytes.len()
                )))
            }
        },
        _ => unreachable!("receiver checked by caller"),
    }
}

fn byte_order_of(vm: &Vm, id: ObjId) -> ByteOrder {
    match vm.heap.get(id) {
        Obj::Buffer(buffer) => buffer.byte_order,
        _ => ByteOrder::LittleEndian,
    }
}

fn impl_lock(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let id = receiver_buffer(vm, receiver, "lock")?;
    if let Obj::Buffer(buffer) = vm.heap.get_mut(id) {
        buffer.locked = true;
    }
    Ok(Value::Nil)
}

static FUNC_LOCK: CFunction = CFunction::new("lock", 0, impl_lock);

fn impl_is_locked(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let id = receiver_buffer(vm, receiver, "isLocked")?;
    match vm.heap.get(id) {
        Obj::Buffer(buffer) => Ok(Value::Bool(buffer.locked)),
        _ => unreachable!("receiver checked above"),
    }
}

static FUNC_IS_LOCKED: CFunction = CFunction::new("isLocked", 0, impl_is_locked);

fn impl_getitem(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_buffer(vm, receiver, "__getitem__")?;
    let length = match vm.heap.get(id) {
        Obj::Buffer(buffer) => buffer.data.len(),
        _ => unreachable!("receiver checked above"),
    };
    let mut index = args[0].as_number().unwrap_or(0.0) as i64;
    if index < 0 {
        index += length as i64;
    }
    if index < 0 || index >= length as i64 {
        return Err(vm.error("Buffer index out of bounds"));
    }
    match vm.heap.get(id) {
        Obj::Buffer(buffer) => Ok(Value::Number(buffer.data[index as usize] as f64)),
        _ => unreachable!("receiver checked above"),
    }
}

static FUNC_GETITEM: CFunction =
    CFunction::typed("__getitem__", &[TypePattern::Number], impl_getitem);

fn impl_setitem(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_buffer(vm, receiver, "__setitem__")?;
    check_mutable(vm, id, "__setitem__")?;
    let length = match vm.heap.get(id) {
        Obj::Buffer(buffer) => buffer.data.len(),
        _ => unreachable!("receiver checked above"),
    };
    let mut index = args[0].as_number().unwrap_or(0.0) as i64;
    if index < 0 {
        index += length as i64;
    }
    if index < 0 || index >= length as i64 {
        return Err(vm.error("Buffer index out of bounds"));
    }
    let byte = args[1].as_number().unwrap_or(0.0) as u8;
    if let Obj::Buffer(buffer) = vm.heap.get_mut(id) {
        buffer.data[index as usize] = byte;
    }
    Ok(Value::Nil)
}

static FUNC_SETITEM: CFunction = CFunction::typed(
    "__setitem__",
    &[TypePattern::Number, TypePattern::Number],
    impl_setitem,
);

/// Stamp out the `addX`/`getX`/`setX` accessor triple for one scalar type.
macro_rules! scalar_accessors {
    (
        $ty:ty,
        $add_impl:ident, $get_impl:ident, $set_impl:ident,
        $add_static:ident, $get_static:ident, $set_static:ident,
        $add_name:literal, $get_name:literal, $set_name:literal
    ) => {
        fn $add_impl(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
            let id = receiver_buffer(vm, receiver, $add_name)?;
            check_mutable(vm, id, $add_name)?;
            let value = args[0].as_number().unwrap_or(0.0) as $ty;
            let bytes = match byte_order_of(vm, id) {
                ByteOrder::LittleEndian => value.to_le_bytes(),
                ByteOrder::BigEndian => value.to_be_bytes(),
            };
            if let Obj::Buffer(buffer) = vm.heap.get_mut(id) {
                buffer.data.extend_from_slice(&bytes);
            }
            Ok(Value::Nil)
        }

        fn $get_impl(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
            let id = receiver_buffer(vm, receiver, $get_name)?;
            let pos = args[0].as_number().unwrap_or(0.0) as usize;
            let bytes = read_bytes(vm, id, pos, std::mem::size_of::<$ty>())?;
            let array: [u8; std::mem::size_of::<$ty>()] =
                bytes.try_into().expect("read_bytes returns the exact width");
            let value = match byte_order_of(vm, id) {
                ByteOrder::LittleEndian => <$ty>::from_le_bytes(array),
                ByteOrder::BigEndian => <$ty>::from_be_bytes(array),
            };
            Ok(Value::Number(value as f64))
        }

        fn $set_impl(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
            let id = receiver_buffer(vm, receiver, $set_name)?;
            check_mutable(vm, id, $set_name)?;
            let pos = args[0].as_number().unwrap_or(0.0) as usize;
            let value = args[1].as_number().unwrap_or(0.0) as $ty;
            let bytes = match byte_order_of(vm, id) {
                ByteOrder::LittleEndian => value.to_le_bytes(),
                ByteOrder::BigEndian => value.to_be_bytes(),
            };
            write_bytes(vm, id, pos, &bytes)?;
            Ok(Value::Nil)
        }

        static $add_static: CFunction =
            CFunction::typed($add_name, &[TypePattern::Number], $add_impl);
        static $get_static: CFunction =
            CFunction::typed($get_name, &[TypePattern::Number], $get_impl);
        static $set_static: CFunction = CFunction::typed(
            $set_name,
            &[TypePattern::Number, TypePattern::Number],
            $set_impl,
        );
    };
}

scalar_accessors!(i8, add_i8, get_i8, set_i8, FUNC_ADD_I8, FUNC_GET_I8, FUNC_SET_I8, "addI8", "getI8", "setI8");
scalar_accessors!(u8, add_u8, get_u8, set_u8, FUNC_ADD_U8, FUNC_GET_U8, FUNC_SET_U8, "addU8", "getU8", "setU8");
scalar_accessors!(i16, add_i16, get_i16, set_i16, FUNC_ADD_I16, FUNC_GET_I16, FUNC_SET_I16, "addI16", "getI16", "setI16");
scalar_accessors!(u16, add_u16, get_u16, set_u16, FUNC_ADD_U16, FUNC_GET_U16, FUNC_SET_U16, "addU16", "getU16", "setU16");
scalar_accessors!(i32, add_i32, get_i32, set_i32, FUNC_ADD_I32, FUNC_GET_I32, FUNC_SET_I32, "addI32", "getI32", "setI32");
scalar_accessors!(u32, add_u32, get_u32, set_u32, FUNC_ADD_U32, FUNC_GET_U32, FUNC_SET_U32, "addU32", "getU32", "setU32");
scalar_accessors!(f32, add_f32, get_f32, set_f32, FUNC_ADD_F32, FUNC_GET_F32, FUNC_SET_F32, "addF32", "getF32", "setF32");
scalar_accessors!(f64, add_f64, get_f64, set_f64, FUNC_ADD_F64, FUNC_GET_F64, FUNC_SET_F64, "addF64", "getF64", "setF64");

pub fn init(heap: &mut Heap) -> ObjId {
    super::make_builtin_class(
        heap,
        "Buffer",
        &[
            &FUNC_LOCK,
            &FUNC_IS_LOCKED,
            &FUNC_GETITEM,
            &FUNC_SETITEM,
            &FUNC_ADD_I8,
            &FUNC_ADD_U8,
            &FUNC_ADD_I16,
            &FUNC_ADD_U16,
            &FUNC_ADD_I32,
            &FUNC_ADD_U32,
            &FUNC_ADD_F32,
            &FUNC_ADD_F64,
            &FUNC_GET_I8,
            &FUNC_GET_U8,
            &FUNC_GET_I16,
            &FUNC_GET_U16,
            &FUNC_GET_I32,
            &FUNC_GET_U32,
            &FUNC_GET_F32,
            &FUNC_GET_F64,
            &FUNC_SET_I8,
            &FUNC_SET_U8,
            &FUNC_SET_I16,
            &FUNC_SET_U16,
            &FUNC_SET_I32,
            &FUNC_SET_U32,
            &FUNC_SET_F32,
            &FUNC_SET_F64,
        ],
    )
}
