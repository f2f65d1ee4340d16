//! The default global environment: native functions, constants, the `len`
//! operator value, the singleton class names, and the three stdio files.
//!
//! Every entry defined here is copied into the fields of each new script
//! module, which is what makes them reachable as bare names.

use crate::error::Result;
use crate::heap::Heap;
use crate::object::{
    FileHandle, FileMode, NativeClosureState, Obj, ObjFile, ObjNativeClosure,
};
use crate::ops;
use crate::value::{CFunction, Operator, Sentinel, TypePattern, Value};
use crate::vm::Vm;

const PI: f64 = std::f64::consts::PI;

fn impl_clock(vm: &mut Vm, _receiver: Value, _args: &[Value]) -> Result<Value> {
    Ok(Value::Number(vm.uptime_seconds()))
}

static FUNC_CLOCK: CFunction = CFunction::new("clock", 0, impl_clock);

fn impl_exit(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let code = args.first().and_then(|v| v.as_number()).unwrap_or(0.0);
    std::process::exit(code as i32);
}

static FUNC_EXIT: CFunction = CFunction::variadic("exit", 0, 1, impl_exit);

fn impl_type(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    match vm.class_of_value(args[0]) {
        Some(class) => Ok(Value::Obj(class)),
        None => Err(vm.error(format!(
            "{} values do not have a class",
            vm.heap.kind_name(args[0])
        ))),
    }
}

static FUNC_TYPE: CFunction = CFunction::new("type", 1, impl_type);

fn impl_repr(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let text = ops::value_repr(&vm.heap, args[0]);
    Ok(Value::Str(vm.heap.intern_owned(text)))
}

static FUNC_REPR: CFunction = CFunction::new("repr", 1, impl_repr);

fn impl_str(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    if args[0].is_str() {
        return Ok(args[0]);
    }
    impl_repr(vm, _receiver, args)
}

static FUNC_STR: CFunction = CFunction::new("str", 1, impl_str);

fn impl_chr(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let code = match args[0] {
        Value::Number(n) => n,
        other => {
            return Err(vm.error(format!(
                "chr() requires a number but got {}",
                vm.heap.kind_name(other)
            )));
        }
    };
    let text = ((code as u32 as u8) as char).to_string();
    Ok(Value::Str(vm.heap.intern_owned(text)))
}

static FUNC_CHR: CFunction = CFunction::new("chr", 1, impl_chr);

fn impl_ord(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let id = match args[0] {
        Value::Str(id) => id,
        other => {
            return Err(vm.error(format!(
                "ord() requires a string but got {}",
                vm.heap.kind_name(other)
            )));
        }
    };
    let text = vm.heap.str(id);
    if text.len() != 1 {
        return Err(vm.error(format!(
            "ord() requires a string of length 1 but got a string of length {}",
            text.len()
        )));
    }
    Ok(Value::Number(text.as_bytes()[0] as f64))
}

static FUNC_ORD: CFunction = CFunction::new("ord", 1, impl_ord);

fn impl_print(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let mut text = ops::value_str(&vm.heap, args[0]);
    text.push('\n');
    vm.write_stdout(&text);
    Ok(Value::Nil)
}

static FUNC_PRINT: CFunction = CFunction::new("print", 1, impl_print);

fn impl_range(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let mut numbers = [0.0f64; 3];
    for (i, arg) in args.iter().enumerate() {
        match arg.as_number() {
            Some(n) => numbers[i] = n,
            None => {
                return Err(vm.error(format!(
                    "range() requires number arguments but got {} for argument {}",
                    vm.heap.kind_name(*arg),
                    i
                )));
            }
        }
    }
    let (start, stop, step) = match args.len() {
        1 => (0.0, numbers[0], 1.0),
        2 => (numbers[0], numbers[1], 1.0),
        _ => (numbers[0], numbers[1], numbers[2]),
    };
    let iterator = vm.alloc(Obj::NativeClosure(ObjNativeClosure {
        name: "rangeiter",
        arity: 0,
        state: NativeClosureState::RangeIter {
            next: start,
            stop,
            step,
        },
    }));
    Ok(Value::Obj(iterator))
}

static FUNC_RANGE: CFunction = CFunction::variadic("range", 1, 3, impl_range);

fn impl_open(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let path_id = match args[0] {
        Value::Str(id) => id,
        other => {
            return Err(vm.error(format!(
                "open() expects string but got {}",
                vm.heap.kind_name(other)
            )));
        }
    };
    let mode = match args.get(1) {
        None => FileMode::Read,
        Some(Value::Str(id)) => match FileMode::parse(vm.heap.str(*id)) {
            Some(mode) => mode,
            None => {
                return Err(vm.error(format!("Invalid mode string {}", vm.heap.str(*id))));
            }
        },
        Some(other) => {
            return Err(vm.error(format!(
                "open() mode must be a string but got {}",
                vm.heap.kind_name(*other)
            )));
        }
    };

    let path = vm.heap.str(path_id).to_string();
    let opened = match mode {
        FileMode::Read => std::fs::File::open(&path),
        FileMode::Write => std::fs::File::create(&path),
        FileMode::Append => std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path),
    };
    let file = match opened {
        Ok(file) => file,
        Err(err) => {
            return Err(vm.error(format!("Could not open file \"{path}\": {err}")));
        }
    };
    let id = vm.alloc(Obj::File(ObjFile {
        handle: Some(FileHandle::Disk(file)),
        is_open: true,
        name: path_id,
        mode,
    }));
    Ok(Value::Obj(id))
}

static FUNC_OPEN: CFunction = CFunction::variadic("open", 1, 2, impl_open);

fn impl_float(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    match args[0] {
        Value::Number(_) => Ok(args[0]),
        Value::Str(id) => {
            let text = vm.heap.str(id);
            if is_float_literal(text) {
                Ok(Value::Number(text.parse().unwrap_or(0.0)))
            } else {
                Err(vm.error(format!("Could not convert string to float: {text}")))
            }
        }
        other => Err(vm.error(format!(
            "{} is not convertible to float",
            vm.heap.kind_name(other)
        ))),
    }
}

/// Accepts `[+-]? digits [. digits]? ([eE] [+-]? digits)?` with an optional
/// leading decimal point.
fn is_float_literal(text: &str) -> bool {
    let mut rest = text.strip_prefix(['-', '+']).unwrap_or(text);
    let leading_point = rest.starts_with('.');
    if leading_point {
        rest = &rest[1..];
    }
    let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return false;
    }
    rest = &rest[digits..];
    if !leading_point && rest.starts_with('.') {
        rest = rest[1..].trim_start_matches(|c: char| c.is_ascii_digit());
    }
    if let Some(exp) = rest.strip_prefix(['e', 'E']) {
        let exp = exp.strip_prefix(['-', '+']).unwrap_or(exp);
        if exp.is_empty() {
            return false;
        }
        rest = exp.trim_start_matches(|c: char| c.is_ascii_digit());
    }
    rest.is_empty()
}

static FUNC_FLOAT: CFunction = CFunction::new("float", 1, impl_float);

fn impl_int(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    match args[0] {
        Value::Number(n) => Ok(Value::Number(n.floor())),
        Value::Str(id) => {
            let text = vm.heap.str(id);
            let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                Ok(Value::Number(text.parse().unwrap_or(0.0)))
            } else {
                Err(vm.error(format!("Could not convert string to int: {text}")))
            }
        }
        other => Err(vm.error(format!(
            "{} is not convertible to int",
            vm.heap.kind_name(other)
        ))),
    }
}

static FUNC_INT: CFunction = CFunction::new("int", 1, impl_int);

fn impl_sin(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    Ok(Value::Number(args[0].as_number().unwrap_or(0.0).sin()))
}

static FUNC_SIN: CFunction =
    CFunction::typed("sin", &[TypePattern::Number], impl_sin);

fn impl_cos(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    Ok(Value::Number(args[0].as_number().unwrap_or(0.0).cos()))
}

static FUNC_COS: CFunction =
    CFunction::typed("cos", &[TypePattern::Number], impl_cos);

fn impl_tan(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    Ok(Value::Number(args[0].as_number().unwrap_or(0.0).tan()))
}

static FUNC_TAN: CFunction =
    CFunction::typed("tan", &[TypePattern::Number], impl_tan);

fn impl_abs(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    Ok(Value::Number(args[0].as_number().unwrap_or(0.0).abs()))
}

static FUNC_ABS: CFunction =
    CFunction::typed("abs", &[TypePattern::Number], impl_abs);

/// `__sort__(list, keys)`: in-place stable sort, optionally ordered by a
/// parallel key list. The prelude builds `sorted()` and `List.sort` on top.
fn impl_sort(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let list_id = args[0].as_obj_id().expect("validated by TypePattern");
    let keys: Option<Vec<Value>> = match args.get(1) {
        None | Some(Value::Nil) => None,
        Some(Value::Obj(id)) => match vm.heap.get(*id) {
            Obj::List(keys) => Some(keys.items.clone()),
            _ => None,
        },
        _ => None,
    };

    // Take the items out so the comparator can read the heap freely.
    let mut items = match vm.heap.get_mut(list_id) {
        Obj::List(list) => std::mem::take(&mut list.items),
        _ => unreachable!("validated by TypePattern"),
    };
    let outcome = ops::sort_values(&vm.heap, &mut items, keys.as_deref());
    if let Obj::List(list) = vm.heap.get_mut(list_id) {
        list.items = items;
    }
    outcome?;
    Ok(Value::Nil)
}

static FUNC_SORT: CFunction = CFunction::typed_variadic(
    "__sort__",
    1,
    2,
    &[TypePattern::List, TypePattern::ListOrNil],
    impl_sort,
);

/// `__tuple__(list)`: the interning tuple constructor.
fn impl_tuple(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let list_id = args[0].as_obj_id().expect("validated by TypePattern");
    let items = match vm.heap.get(list_id) {
        Obj::List(list) => list.items.clone(),
        _ => unreachable!("validated by TypePattern"),
    };
    let tuple = vm.heap.intern_tuple(&items)?;
    Ok(Value::Obj(tuple))
}

static FUNC_TUPLE: CFunction =
    CFunction::typed("__tuple__", &[TypePattern::List], impl_tuple);

/// Create the stdin/stdout/stderr file objects.
pub fn make_std_files(heap: &mut Heap) -> (crate::value::ObjId, crate::value::ObjId, crate::value::ObjId) {
    let stdin_name = heap.intern("stdin");
    let stdout_name = heap.intern("stdout");
    let stderr_name = heap.intern("stderr");
    let stdin = heap.allocate(Obj::File(ObjFile {
        handle: Some(FileHandle::Stdin),
        is_open: true,
        name: stdin_name,
        mode: FileMode::Read,
    }));
    let stdout = heap.allocate(Obj::File(ObjFile {
        handle: Some(FileHandle::Stdout),
        is_open: true,
        name: stdout_name,
        mode: FileMode::Write,
    }));
    let stderr = heap.allocate(Obj::File(ObjFile {
        handle: Some(FileHandle::Stderr),
        is_open: true,
        name: stderr_name,
        mode: FileMode::Write,
    }));
    (stdin, stdout, stderr)
}

/// Install every default global into the VM's builtin table.
pub fn define_default_globals(vm: &mut Vm) {
    vm.define_global("PI", Value::Number(PI));
    vm.define_global("NAN", Value::Number(f64::NAN));
    vm.define_global("INFINITY", Value::Number(f64::INFINITY));

    vm.define_global("len", Value::Operator(Operator::Len));

    vm.define_global("clock", Value::CFunction(&FUNC_CLOCK));
    vm.define_global("exit", Value::CFunction(&FUNC_EXIT));
    vm.define_global("type", Value::CFunction(&FUNC_TYPE));
    vm.define_global("repr", Value::CFunction(&FUNC_REPR));
    vm.define_global("str", Value::CFunction(&FUNC_STR));
    vm.define_global("chr", Value::CFunction(&FUNC_CHR));
    vm.define_global("ord", Value::CFunction(&FUNC_ORD));
    vm.define_global("print", Value::CFunction(&FUNC_PRINT));
    vm.define_global("range", Value::CFunction(&FUNC_RANGE));
    vm.define_global("open", Value::CFunction(&FUNC_OPEN));
    vm.define_global("float", Value::CFunction(&FUNC_FLOAT));
    vm.define_global("int", Value::CFunction(&FUNC_INT));
    vm.define_global("sin", Value::CFunction(&FUNC_SIN));
    vm.define_global("cos", Value::CFunction(&FUNC_COS));
    vm.define_global("tan", Value::CFunction(&FUNC_TAN));
    vm.define_global("abs", Value::CFunction(&FUNC_ABS));
    vm.define_global("StopIteration", Value::Sentinel(Sentinel::StopIteration));

    vm.define_global("__sort__", Value::CFunction(&FUNC_SORT));
    vm.define_global("__tuple__", Value::CFunction(&FUNC_TUPLE));

    vm.define_global("Sentinel", Value::Obj(vm.classes.sentinel));
    vm.define_global("Nil", Value::Obj(vm.classes.nil));
    vm.define_global("Bool", Value::Obj(vm.classes.bool_));
    vm.define_global("Number", Value::Obj(vm.classes.number));
    vm.define_global("String", Value::Obj(vm.classes.string));
    vm.define_global("Buffer", Value::Obj(vm.classes.buffer));
    vm.define_global("List", Value::Obj(vm.classes.list));
    vm.define_global("Tuple", Value::Obj(vm.classes.tuple));
    vm.define_global("Dict", Value::Obj(vm.classes.dict));
    vm.define_global("FrozenDict", Value::Obj(vm.classes.frozen_dict));
    vm.define_global("Function", Value::Obj(vm.classes.function));
    vm.define_global("Operator", Value::Obj(vm.classes.operator));
    vm.define_global("Class", Value::Obj(vm.classes.class));
    vm.define_global("File", Value::Obj(vm.classes.file));

    vm.define_global("stdin", Value::Obj(vm.stdin_file));
    vm.define_global("stdout", Value::Obj(vm.stdout_file));
    vm.define_global("stderr", Value::Obj(vm.stderr_file));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_literal_validation() {
        assert!(is_float_literal("1"));
        assert!(is_float_literal("-1.5"));
        assert!(is_float_literal("+.5"));
        assert!(is_float_literal("2.5e-3"));
        assert!(is_float_literal("2E10"));
        assert!(!is_float_literal(""));
        assert!(!is_float_literal("abc"));
        assert!(!is_float_literal("1.2.3"));
        assert!(!is_float_literal("1e"));
    }
}
