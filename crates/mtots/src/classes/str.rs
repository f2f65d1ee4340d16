//! Methods on the `String` class.
//!
//! Strings are byte-oriented: indices, lengths, and slice bounds count
//! bytes, matching the rest of the runtime.

use crate::error::Result;
use crate::heap::Heap;
use crate::object::Obj;
use crate::ops;
use crate::value::{CFunction, StrId, TypePattern, Value};
use crate::vm::Vm;

fn receiver_str(vm: &Vm, receiver: Value, method: &str) -> Result<StrId> {
    match receiver {
        Value::Str(id) => Ok(id),
        _ => Err(vm.error(format!("Expected string as receiver to String.{method}()"))),
    }
}

fn impl_getitem(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_str(vm, receiver, "__getitem__")?;
    let Some(index) = args[0].as_number() else {
        return Err(vm.error(format!(
            "Expected index to String.__getitem__() to be a number but got {}",
            vm.heap.kind_name(args[0])
        )));
    };
    let length = vm.heap.strings.len_of(id) as i64;
    let mut index = index as i64;
    if index < 0 {
        index += length;
    }
    if index < 0 || index >= length {
        return Err(vm.error("String index out of bounds"));
    }
    let byte = vm.heap.str(id).as_bytes()[index as usize];
    let text = (byte as char).to_string();
    Ok(Value::Str(vm.heap.intern_owned(text)))
}

static FUNC_GETITEM: CFunction = CFunction::new("__getitem__", 1, impl_getitem);

fn slice_bound(vm: &Vm, arg: Value, default: i64, length: i64, which: &str) -> Result<i64> {
    let mut bound = match arg {
        Value::Nil => default,
        Value::Number(n) => n as i64,
        other => {
            return Err(vm.error(format!(
                "Expected argument '{which}' to String.__slice__() to be a number but got {}",
                vm.heap.kind_name(other)
            )));
        }
    };
    if bound < 0 {
        bound += length;
    }
    Ok(bound)
}

fn impl_slice(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_str(vm, receiver, "__slice__")?;
    let length = vm.heap.strings.len_of(id) as i64;
    let lower = slice_bound(vm, args[0], 0, length, "lower")?;
    if lower < 0 || lower > length {
        return Err(vm.error("Lower slice index out of bounds"));
    }
    let upper = slice_bound(vm, args[1], length, length, "upper")?;
    if upper < 0 || upper > length {
        return Err(vm.error("Upper slice index out of bounds"));
    }
    let (lower, upper) = (lower as usize, usize::max(lower as usize, upper as usize));
    let bytes = vm.heap.str(id).as_bytes()[lower..upper].to_vec();
    let text = String::from_utf8_lossy(&bytes).into_owned();
    Ok(Value::Str(vm.heap.intern_owned(text)))
}

static FUNC_SLICE: CFunction = CFunction::new("__slice__", 2, impl_slice);

/// `"fmt" % [args]` — `%s`, `%r`, and `%%`.
fn impl_mod(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_str(vm, receiver, "__mod__")?;
    let items: Vec<Value> = match args[0] {
        Value::Obj(list_id) => match vm.heap.get(list_id) {
            Obj::List(list) => list.items.clone(),
            _ => {
                return Err(vm.error("Expected List as argument to String.__mod__()"));
            }
        },
        _ => {
            return Err(vm.error("Expected List as argument to String.__mod__()"));
        }
    };
    let format = vm.heap.str(id).to_string();
    let text = ops::str_mod(&vm.heap, &format, &items)?;
    Ok(Value::Str(vm.heap.intern_owned(text)))
}

static FUNC_MOD: CFunction = CFunction::new("__mod__", 1, impl_mod);

const DEFAULT_STRIP_SET: &str = " \t\r\n";

fn impl_strip(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_str(vm, receiver, "strip")?;
    let strip_set = match args.first() {
        Some(Value::Str(set)) => vm.heap.str(*set).to_string(),
        _ => DEFAULT_STRIP_SET.to_string(),
    };
    let stripped = vm
        .heap
        .str(id)
        .trim_matches(|c: char| strip_set.contains(c))
        .to_string();
    Ok(Value::Str(vm.heap.intern_owned(stripped)))
}

static FUNC_STRIP: CFunction = CFunction::typed_variadic(
    "strip",
    0,
    1,
    &[TypePattern::Str],
    impl_strip,
);

fn impl_replace(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_str(vm, receiver, "replace")?;
    let (old, new) = match (args[0], args[1]) {
        (Value::Str(old), Value::Str(new)) => {
            (vm.heap.str(old).to_string(), vm.heap.str(new).to_string())
        }
        _ => unreachable!("validated by TypePattern"),
    };
    let replaced = vm.heap.str(id).replace(&old, &new);
    Ok(Value::Str(vm.heap.intern_owned(replaced)))
}

static FUNC_REPLACE: CFunction = CFunction::typed(
    "replace",
    &[TypePattern::Str, TypePattern::Str],
    impl_replace,
);

fn impl_join(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let separator_id = receiver_str(vm, receiver, "join")?;
    let items: Vec<Value> = match args[0] {
        Value::Obj(list_id) => match vm.heap.get(list_id) {
            Obj::List(list) => list.items.clone(),
            _ => unreachable!("validated by TypePattern"),
        },
        _ => unreachable!("validated by TypePattern"),
    };
    let separator = vm.heap.str(separator_id).to_string();
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        let Value::Str(part) = item else {
            return Err(vm.error(format!(
                "String.join() requires a list of strings but got list item {}",
                vm.heap.kind_name(*item)
            )));
        };
        if i > 0 {
            out.push_str(&separator);
        }
        out.push_str(vm.heap.str(*part));
    }
    Ok(Value::Str(vm.heap.intern_owned(out)))
}

static FUNC_JOIN: CFunction =
    CFunction::typed("join", &[TypePattern::List], impl_join);

pub fn init(heap: &mut Heap) -> crate::value::ObjId {
    super::make_builtin_class(
        heap,
        "String",
        &[
            &FUNC_GETITEM,
            &FUNC_SLICE,
            &FUNC_MOD,
            &FUNC_STRIP,
            &FUNC_REPLACE,
            &FUNC_JOIN,
        ],
    )
}
