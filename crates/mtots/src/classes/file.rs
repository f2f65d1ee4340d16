//! Methods on the `File` class.

use std::io::{Read, Write};

use crate::error::Result;
use crate::heap::Heap;
use crate::object::{FileHandle, FileMode, Obj};
use crate::value::{CFunction, ObjId, Value};
use crate::vm::Vm;

fn receiver_file(vm: &Vm, receiver: Value, method: &str) -> Result<ObjId> {
    if let Value::Obj(id) = receiver {
        if matches!(vm.heap.get(id), Obj::File(_)) {
            return Ok(id);
        }
    }
    Err(vm.error(format!("Expected file as receiver to File.{method}()")))
}

fn check_open(vm: &Vm, id: ObjId) -> Result<()> {
    match vm.heap.get(id) {
        Obj::File(file) if file.is_open => Ok(()),
        Obj::File(file) => Err(vm.error(format!(
            "File {} is already closed",
            vm.heap.str(file.name)
        ))),
        _ => unreachable!("receiver checked by caller"),
    }
}

fn impl_write(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_file(vm, receiver, "write")?;
    check_open(vm, id)?;
    let Value::Str(text_id) = args[0] else {
        return Err(vm.error(format!(
            "File.write() expects a string but got {}",
            vm.heap.kind_name(args[0])
        )));
    };
    let text = vm.heap.str(text_id).to_string();

    let is_stdout = matches!(
        vm.heap.get(id),
        Obj::File(file) if matches!(file.handle, Some(FileHandle::Stdout))
    );
    if is_stdout {
        // Route through the VM so captured-output mode sees it.
        vm.write_stdout(&text);
        return Ok(Value::Number(text.len() as f64));
    }

    let outcome = match vm.heap.get_mut(id) {
        Obj::File(file) => match &mut file.handle {
            Some(FileHandle::Stderr) => {
                eprint!("{text}");
                Ok(())
            }
            Some(FileHandle::Disk(disk)) => disk.write_all(text.as_bytes()),
            Some(FileHandle::Stdin) | None => {
                return Err(vm.error("File is not writable"));
            }
            Some(FileHandle::Stdout) => unreachable!("handled above"),
        },
        _ => unreachable!("receiver checked above"),
    };
    match outcome {
        Ok(()) => Ok(Value::Number(text.len() as f64)),
        Err(err) => Err(vm.error(format!("Failed to write to file: {err}"))),
    }
}

static FUNC_WRITE: CFunction = CFunction::new("write", 1, impl_write);

fn impl_read(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let id = receiver_file(vm, receiver, "read")?;
    check_open(vm, id)?;
    let limit = args.first().and_then(|v| v.as_number());

    let read_outcome: std::io::Result<Vec<u8>> = {
        let mode = match vm.heap.get(id) {
            Obj::File(file) => file.mode,
            _ => unreachable!("receiver checked above"),
        };
        if mode != FileMode::Read {
            return Err(vm.error("File is not readable"));
        }
        match vm.heap.get_mut(id) {
            Obj::File(file) => match &mut file.handle {
                Some(FileHandle::Stdin) => {
                    let mut buffer = Vec::new();
                    match limit {
                        Some(n) => {
                            let mut chunk = vec![0u8; n as usize];
                            std::io::stdin().read(&mut chunk).map(|read| {
                                chunk.truncate(read);
                                chunk
                            })
                        }
                        None => std::io::stdin().read_to_end(&mut buffer).map(|_| buffer),
                    }
                }
                Some(FileHandle::Disk(disk)) => {
                    let mut buffer = Vec::new();
                    match limit {
                        Some(n) => {
                            let mut chunk = vec![0u8; n as usize];
                            disk.read(&mut chunk).map(|read| {
                                chunk.truncate(read);
                                chunk
                            })
                        }
                        None => disk.read_to_end(&mut buffer).map(|_| buffer),
                    }
                }
                _ => return Err(vm.error("File is not readable")),
            },
            _ => unreachable!("receiver checked above"),
        }
    };

    match read_outcome {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            Ok(Value::Str(vm.heap.intern_owned(text)))
        }
        Err(err) => Err(vm.error(format!("Failed to read from file: {err}"))),
    }
}

static FUNC_READ: CFunction = CFunction::variadic("read", 0, 1, impl_read);

fn impl_close(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let id = receiver_file(vm, receiver, "close")?;
    if let Obj::File(file) = vm.heap.get_mut(id) {
        // Dropping the handle closes a disk file; the stdio handles are
        // only flagged closed.
        if matches!(file.handle, Some(FileHandle::Disk(_))) {
            file.handle = None;
        }
        file.is_open = false;
    }
    Ok(Value::Nil)
}

static FUNC_CLOSE: CFunction = CFunction::new("close", 0, impl_close);

pub fn init(heap: &mut Heap) -> ObjId {
    super::make_builtin_class(heap, "File", &[&FUNC_WRITE, &FUNC_READ, &FUNC_CLOSE])
}
