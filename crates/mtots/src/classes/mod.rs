//! Method tables for the built-in classes.
//!
//! Each submodule owns one class: its native method implementations, the
//! `CFunction` statics describing them, and an `init` that assembles the
//! class object. Built-in classes refuse instantiation (the `Buffer`
//! constructor is special-cased by the VM).

pub mod buffer;
pub mod class;
pub mod dict;
pub mod file;
pub mod frozendict;
pub mod list;
pub mod str;
pub mod tuple;

use crate::heap::Heap;
use crate::map::Map;
use crate::object::{NativeObjectDescriptor, Obj, ObjClass};
use crate::value::{CFunction, ObjId, Value};

/// Assemble a built-in class from a native method table.
pub fn make_builtin_class(
    heap: &mut Heap,
    name: &str,
    methods: &[&'static CFunction],
) -> ObjId {
    let name = heap.intern(name);
    let mut table = Map::new();
    for method in methods {
        let method_name = heap.intern(method.name);
        let hash = heap.strings.hash(method_name);
        table.set(Value::Str(method_name), hash, Value::CFunction(method));
    }
    heap.allocate(Obj::Class(ObjClass {
        name,
        methods: table,
        static_methods: Map::new(),
        is_builtin: true,
        is_module: false,
        descriptor: None,
    }))
}

/// Assemble the class for a registered native (extension) descriptor.
pub fn make_class_from_descriptor(
    heap: &mut Heap,
    descriptor: &'static NativeObjectDescriptor,
) -> ObjId {
    let name = heap.intern(descriptor.name);
    let mut table = Map::new();
    for method in descriptor.methods {
        let method_name = heap.intern(method.name);
        let hash = heap.strings.hash(method_name);
        table.set(Value::Str(method_name), hash, Value::CFunction(method));
    }
    heap.allocate(Obj::Class(ObjClass {
        name,
        methods: table,
        static_methods: Map::new(),
        is_builtin: false,
        is_module: false,
        descriptor: Some(descriptor),
    }))
}
