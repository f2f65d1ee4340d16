//! Heap object variants.
//!
//! Everything the collector manages lives in one of these variants, stored
//! in the arena slots of [`crate::heap::Heap`] and addressed by [`ObjId`].
//! Interned strings are deliberately *not* here — they live in the string
//! pool with their own mark bits.

use std::any::Any;
use std::fs;
use std::mem;

use crate::bytecode::Chunk;
use crate::map::Map;
use crate::value::{CFunction, ObjId, StrId, Value};

/// How multi-byte values are read and written by a [`ObjBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

impl FileMode {
    /// Parse an `open()` mode string. The `b` suffix is accepted and
    /// ignored: the runtime is byte-oriented either way.
    pub fn parse(mode: &str) -> Option<FileMode> {
        match mode {
            "r" | "rb" => Some(FileMode::Read),
            "w" | "wb" => Some(FileMode::Write),
            "a" | "ab" => Some(FileMode::Append),
            _ => None,
        }
    }
}

/// The backing stream of a file object.
pub enum FileHandle {
    Stdin,
    Stdout,
    Stderr,
    Disk(fs::File),
}

pub struct ObjFile {
    pub handle: Option<FileHandle>,
    pub is_open: bool,
    pub name: StrId,
    pub mode: FileMode,
}

/// A compiled function prototype, immutable after compilation.
///
/// One thunk may be shared by many closures; the closure binds it to a
/// module and to captured upvalues.
pub struct ObjThunk {
    pub arity: u8,
    pub chunk: Chunk,
    pub name: Option<StrId>,
    pub module_name: Option<StrId>,
    /// Compile-time constant values backfilling missing trailing arguments.
    pub default_args: Vec<Value>,
    /// Capture descriptors recorded by the compiler, consumed by the
    /// `Closure` opcode when the runtime closure is built.
    pub upvalues: Vec<UpvalueDesc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpvalueDesc {
    /// True: capture the enclosing frame's local at `index`. False: share
    /// the enclosing closure's upvalue at `index`.
    pub is_local: bool,
    pub index: u8,
}

pub struct ObjClosure {
    /// The module instance whose fields are this closure's globals.
    pub module: ObjId,
    pub thunk: ObjId,
    pub upvalues: Vec<ObjId>,
}

/// A captured variable. Open while the source stack slot is live, closed
/// (owning its value) once the slot leaves scope.
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub state: UpvalueState,
}

pub struct ObjClass {
    pub name: StrId,
    pub methods: Map,
    pub static_methods: Map,
    pub is_builtin: bool,
    pub is_module: bool,
    pub descriptor: Option<&'static NativeObjectDescriptor>,
}

pub struct ObjInstance {
    pub class: ObjId,
    pub fields: Map,
}

pub struct ObjList {
    pub items: Vec<Value>,
}

pub struct ObjTuple {
    pub items: Box<[Value]>,
    /// Structural hash, computed once at interning time.
    pub hash: u32,
}

pub struct ObjDict {
    pub map: Map,
}

pub struct ObjFrozenDict {
    pub map: Map,
    pub hash: u32,
}

pub struct ObjBuffer {
    pub data: Vec<u8>,
    pub byte_order: ByteOrder,
    pub locked: bool,
}

/// Descriptor of a native (extension) class, registered once as a static.
///
/// `instantiate` is invoked when the class itself is called. The field
/// hooks service `a.b` and `a.b = c` on native instances. The method table
/// is installed on the class when the descriptor is registered.
pub struct NativeObjectDescriptor {
    pub name: &'static str,
    pub instantiate: Option<&'static CFunction>,
    pub get_field: Option<fn(&crate::vm::Vm, ObjId, StrId) -> Option<Value>>,
    pub set_field: Option<fn(&mut crate::vm::Vm, ObjId, StrId, Value) -> bool>,
    pub methods: &'static [&'static CFunction],
}

/// Opaque state carried by a native instance. `trace` reports any contained
/// GC references to the collector.
pub trait NativeData: Any {
    fn trace(&self, _mark: &mut dyn FnMut(Value)) {}
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct ObjNative {
    pub descriptor: &'static NativeObjectDescriptor,
    pub data: Box<dyn NativeData>,
}

/// A native function bundled with runtime state. The state is a closed enum
/// of the iterator shapes the runtime needs; its contained handles are
/// traced by [`Obj::trace`].
pub struct ObjNativeClosure {
    pub name: &'static str,
    pub arity: u8,
    pub state: NativeClosureState,
}

pub enum NativeClosureState {
    /// `range()` iterator; `next` advances by `step` until `stop`.
    RangeIter { next: f64, stop: f64, step: f64 },
    ListIter { list: ObjId, index: usize },
    TupleIter { tuple: ObjId, index: usize },
    /// Dict/frozen-dict key iterator over a snapshot of the insertion order.
    MapKeyIter { keys: Vec<Value>, index: usize },
}

pub enum Obj {
    Class(ObjClass),
    Closure(ObjClosure),
    Thunk(ObjThunk),
    NativeClosure(ObjNativeClosure),
    Instance(ObjInstance),
    Buffer(ObjBuffer),
    List(ObjList),
    Tuple(ObjTuple),
    Dict(ObjDict),
    FrozenDict(ObjFrozenDict),
    File(ObjFile),
    Native(ObjNative),
    Upvalue(ObjUpvalue),
}

impl Obj {
    /// Rough payload size in bytes, fed into the GC trigger accounting.
    pub fn heap_size(&self) -> usize {
        let payload = match self {
            Obj::Class(c) => (c.methods.len() + c.static_methods.len()) * 3 * mem::size_of::<Value>(),
            Obj::Closure(c) => c.upvalues.len() * mem::size_of::<ObjId>(),
            Obj::Thunk(t) => {
                t.chunk.code.len() * mem::size_of::<crate::bytecode::Op>()
                    + t.chunk.constants.len() * mem::size_of::<Value>()
                    + t.default_args.len() * mem::size_of::<Value>()
            }
            Obj::NativeClosure(nc) => match &nc.state {
                NativeClosureState::MapKeyIter { keys, .. } => keys.len() * mem::size_of::<Value>(),
                _ => 0,
            },
            Obj::Instance(i) => i.fields.len() * 3 * mem::size_of::<Value>(),
            Obj::Buffer(b) => b.data.len(),
            Obj::List(l) => l.items.capacity() * mem::size_of::<Value>(),
            Obj::Tuple(t) => t.items.len() * mem::size_of::<Value>(),
            Obj::Dict(d) => d.map.len() * 3 * mem::size_of::<Value>(),
            Obj::FrozenDict(d) => d.map.len() * 3 * mem::size_of::<Value>(),
            Obj::File(_) | Obj::Native(_) | Obj::Upvalue(_) => 0,
        };
        mem::size_of::<Obj>() + payload
    }

    /// Report every value this object references, for the blacken phase.
    pub fn trace(&self, mark: &mut dyn FnMut(Value)) {
        match self {
            Obj::Class(c) => {
                mark(Value::Str(c.name));
                for (k, v) in c.methods.iter() {
                    mark(k);
                    mark(v);
                }
                for (k, v) in c.static_methods.iter() {
                    mark(k);
                    mark(v);
                }
            }
            Obj::Closure(c) => {
                mark(Value::Obj(c.module));
                mark(Value::Obj(c.thunk));
                for upvalue in &c.upvalues {
                    mark(Value::Obj(*upvalue));
                }
            }
            Obj::Thunk(t) => {
                if let Some(name) = t.name {
                    mark(Value::Str(name));
                }
                if let Some(name) = t.module_name {
                    mark(Value::Str(name));
                }
                for constant in &t.chunk.constants {
                    mark(*constant);
                }
                for default in &t.default_args {
                    mark(*default);
                }
            }
            Obj::NativeClosure(nc) => match &nc.state {
                NativeClosureState::RangeIter { .. } => {}
                NativeClosureState::ListIter { list, .. } => mark(Value::Obj(*list)),
                NativeClosureState::TupleIter { tuple, .. } => mark(Value::Obj(*tuple)),
                NativeClosureState::MapKeyIter { keys, .. } => {
                    for key in keys {
                        mark(*key);
                    }
                }
            },
            Obj::Instance(i) => {
                mark(Value::Obj(i.class));
                for (k, v) in i.fields.iter() {
                    mark(k);
                    mark(v);
                }
            }
            Obj::Buffer(_) => {}
            Obj::List(l) => {
                for item in &l.items {
                    mark(*item);
                }
            }
            Obj::Tuple(t) => {
                for item in t.items.iter() {
                    mark(*item);
                }
            }
            Obj::Dict(d) => {
                for (k, v) in d.map.iter() {
                    mark(k);
                    mark(v);
                }
            }
            Obj::FrozenDict(d) => {
                for (k, v) in d.map.iter() {
                    mark(k);
                    mark(v);
                }
            }
            Obj::File(f) => mark(Value::Str(f.name)),
            Obj::Native(n) => n.data.trace(mark),
            Obj::Upvalue(u) => {
                if let UpvalueState::Closed(value) = u.state {
                    mark(value);
                }
            }
        }
    }
}
