//! The bytecode virtual machine.
//!
//! A fixed-capacity value stack, call frames of (closure, ip, slot base),
//! and a fetch-decode-execute loop over the current frame's chunk. The VM
//! owns the heap and is the only place a garbage collection can start: every
//! GC-visible allocation made while bytecode runs goes through [`Vm::alloc`],
//! which collects first when the heap asks for it. The root set is exactly
//! the state held here plus the heap's pin list.
//!
//! Runtime errors are `Err(Error::Runtime)` values. The run loop intercepts
//! them: if a `try` snapshot is active the stack and frames are restored and
//! execution resumes at the else branch; otherwise the rendered call stack
//! is appended and the error continues out to the caller.

use std::time::Instant;

use crate::builtins;
use crate::bytecode::Op;
use crate::classes;
use crate::compiler;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::import;
use crate::map::Map;
use crate::modules;
use crate::object::{
    ByteOrder, NativeClosureState, NativeObjectDescriptor, Obj, ObjBuffer, ObjClass, ObjClosure,
    ObjInstance, UpvalueState,
};
use crate::ops;
use crate::value::{CFunction, ObjId, Operator, StrId, TypePattern, Value};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;
const TRY_SNAPSHOTS_MAX: usize = 64;

struct CallFrame {
    closure: ObjId,
    /// Index of the next instruction to execute.
    ip: usize,
    /// Stack index of slot 0 (the receiver slot).
    slots: usize,
}

struct TrySnapshot {
    catch_ip: usize,
    stack_len: usize,
    frame_count: usize,
}

/// Interned names the VM consults on hot paths.
pub struct CommonNames {
    pub init: StrId,
    pub iter: StrId,
    pub len: StrId,
    pub mul: StrId,
    pub modulo: StrId,
    pub contains: StrId,
    pub prelude: StrId,
}

/// The singleton built-in classes.
pub struct BuiltinClasses {
    pub sentinel: ObjId,
    pub nil: ObjId,
    pub bool_: ObjId,
    pub number: ObjId,
    pub string: ObjId,
    pub buffer: ObjId,
    pub list: ObjId,
    pub tuple: ObjId,
    pub dict: ObjId,
    pub frozen_dict: ObjId,
    pub function: ObjId,
    pub operator: ObjId,
    pub class: ObjId,
    pub file: ObjId,
}

enum OutputSink {
    Standard,
    Capture(String),
}

pub struct Vm {
    pub(crate) heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues ordered by descending stack slot.
    open_upvalues: Vec<ObjId>,
    /// The builtin global table copied into each new script module.
    pub(crate) globals: Map,
    /// Module cache: name string -> module instance.
    modules: Map,
    /// Registered native modules: name string -> arity-1 CFunction.
    native_module_thunks: Map,
    try_snapshots: Vec<TrySnapshot>,
    /// Native class descriptors registered so far, with their class objects.
    native_class_bindings: Vec<(&'static NativeObjectDescriptor, ObjId)>,
    output: OutputSink,
    started_at: Instant,

    pub(crate) names: CommonNames,
    pub(crate) classes: BuiltinClasses,
    pub(crate) stdin_file: ObjId,
    pub(crate) stdout_file: ObjId,
    pub(crate) stderr_file: ObjId,
}

impl Vm {
    /// Create a VM with stdout printing.
    pub fn new() -> Vm {
        Vm::build(OutputSink::Standard)
    }

    /// Create a VM that captures `print` and stdout-file output for later
    /// retrieval with [`Vm::take_output`].
    pub fn with_captured_output() -> Vm {
        Vm::build(OutputSink::Capture(String::new()))
    }

    fn build(output: OutputSink) -> Vm {
        let mut heap = Heap::new();

        let names = CommonNames {
            init: heap.intern("__init__"),
            iter: heap.intern("__iter__"),
            len: heap.intern("__len__"),
            mul: heap.intern("__mul__"),
            modulo: heap.intern("__mod__"),
            contains: heap.intern("__contains__"),
            prelude: heap.intern("__prelude__"),
        };

        let classes = BuiltinClasses {
            sentinel: classes::make_builtin_class(&mut heap, "Sentinel", &[]),
            nil: classes::make_builtin_class(&mut heap, "Nil", &[]),
            bool_: classes::make_builtin_class(&mut heap, "Bool", &[]),
            number: classes::make_builtin_class(&mut heap, "Number", &[]),
            string: classes::str::init(&mut heap),
            buffer: classes::buffer::init(&mut heap),
            list: classes::list::init(&mut heap),
            tuple: classes::tuple::init(&mut heap),
            dict: classes::dict::init(&mut heap),
            frozen_dict: classes::frozendict::init(&mut heap),
            function: classes::make_builtin_class(&mut heap, "Function", &[]),
            operator: classes::make_builtin_class(&mut heap, "Operator", &[]),
            class: classes::class::init(&mut heap),
            file: classes::file::init(&mut heap),
        };

        let (stdin_file, stdout_file, stderr_file) = builtins::make_std_files(&mut heap);

        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            globals: Map::new(),
            modules: Map::new(),
            native_module_thunks: Map::new(),
            try_snapshots: Vec::new(),
            native_class_bindings: Vec::new(),
            output,
            started_at: Instant::now(),
            names,
            classes,
            stdin_file,
            stdout_file,
            stderr_file,
        };

        builtins::define_default_globals(&mut vm);
        modules::register_native_modules(&mut vm);
        import::prep_prelude(&mut vm);
        vm
    }

    // -- Embedding API ------------------------------------------------------

    /// Compile and run `source` inside `module`, returning the script's
    /// result value.
    pub fn interpret(&mut self, source: &str, module: ObjId) -> Result<Value> {
        let module_name = self.module_name_of(module);
        let thunk = compiler::compile(&mut self.heap, source, module_name)?;

        let stack_base = self.stack.len();
        let frame_base = self.frames.len();
        self.push(Value::Obj(thunk));
        let closure = self.alloc(Obj::Closure(ObjClosure {
            module,
            thunk,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        let outcome = self
            .call_closure(closure, 0)
            .and_then(|_| self.run_until(frame_base));
        match outcome {
            Ok(()) => Ok(self.pop()),
            Err(err) => {
                // Restore a sane machine for the next interpret() call.
                self.stack.truncate(stack_base);
                self.frames.truncate(frame_base);
                self.try_snapshots.clear();
                let mut kept = Vec::new();
                for id in std::mem::take(&mut self.open_upvalues) {
                    let keep = match self.heap.get(id) {
                        Obj::Upvalue(upvalue) => match upvalue.state {
                            UpvalueState::Open(slot) => slot < stack_base,
                            UpvalueState::Closed(_) => false,
                        },
                        _ => false,
                    };
                    if keep {
                        kept.push(id);
                    }
                }
                self.open_upvalues = kept;
                Err(err)
            }
        }
    }

    /// Build a fresh module (carrying the builtin globals) for embedding or
    /// the REPL. The module is entered into the module cache, which also
    /// keeps it rooted across calls.
    pub fn new_script_module(&mut self, name: &str) -> ObjId {
        let name = self.heap.intern(name);
        let module = compiler::new_module(&mut self.heap, name, Some(&self.globals));
        self.module_cache_set(name, Value::Obj(module));
        module
    }

    /// Intern `text` as a string value.
    pub fn string_value(&mut self, text: &str) -> Value {
        Value::Str(self.heap.intern(text))
    }

    /// Captured output accumulated so far (capture mode only).
    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            OutputSink::Capture(buffer) => std::mem::take(buffer),
            OutputSink::Standard => String::new(),
        }
    }

    pub(crate) fn write_stdout(&mut self, text: &str) {
        match &mut self.output {
            OutputSink::Standard => print!("{text}"),
            OutputSink::Capture(buffer) => buffer.push_str(text),
        }
    }

    /// Register a native module: an arity-1 function receiving the fresh
    /// module instance when the module is first imported.
    pub fn add_native_module(&mut self, thunk: &'static CFunction) {
        if thunk.arity != 1 {
            panic!(
                "Native modules must accept 1 argument but got {}",
                thunk.arity
            );
        }
        let name = self.heap.intern(thunk.name);
        let hash = self.heap.strings.hash(name);
        if !self
            .native_module_thunks
            .set(Value::Str(name), hash, Value::CFunction(thunk))
        {
            panic!("Native module {} is already defined", thunk.name);
        }
    }

    /// Register a native class descriptor, creating its class object and
    /// installing its method table.
    pub fn register_native_class(&mut self, descriptor: &'static NativeObjectDescriptor) -> ObjId {
        let class = classes::make_class_from_descriptor(&mut self.heap, descriptor);
        self.native_class_bindings.push((descriptor, class));
        class
    }

    pub(crate) fn native_class_of(&self, descriptor: &'static NativeObjectDescriptor) -> Option<ObjId> {
        self.native_class_bindings
            .iter()
            .find(|(d, _)| std::ptr::eq(*d, descriptor))
            .map(|(_, class)| *class)
    }

    /// Define a builtin global visible to every future script module.
    pub fn define_global(&mut self, name: &str, value: Value) {
        let id = self.heap.intern(name);
        let hash = self.heap.strings.hash(id);
        self.globals.set(Value::Str(id), hash, value);
    }

    // -- Stack primitives ---------------------------------------------------

    pub(crate) fn push(&mut self, value: Value) {
        if self.stack.len() >= STACK_MAX {
            panic!("stack overflow");
        }
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => panic!("stack underflow"),
        }
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len()
    }

    // -- Allocation gate ----------------------------------------------------

    /// Allocate a heap object, collecting first if the heap asks for it.
    /// Anything the new object references must be reachable from a root
    /// (usually: still on the value stack) when this is called.
    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(obj)
    }

    /// Run a full collection now. Observationally invisible to programs.
    pub fn collect_garbage(&mut self) {
        let heap = &mut self.heap;
        for value in &self.stack {
            heap.mark_value(*value);
        }
        for frame in &self.frames {
            heap.mark_object(frame.closure);
        }
        for upvalue in &self.open_upvalues {
            heap.mark_object(*upvalue);
        }
        for (key, value) in self.globals.iter() {
            heap.mark_value(key);
            heap.mark_value(value);
        }
        for (key, value) in self.modules.iter() {
            heap.mark_value(key);
            heap.mark_value(value);
        }
        for (key, value) in self.native_module_thunks.iter() {
            heap.mark_value(key);
            heap.mark_value(value);
        }
        for (_, class) in &self.native_class_bindings {
            heap.mark_object(*class);
        }

        heap.strings.mark(self.names.init);
        heap.strings.mark(self.names.iter);
        heap.strings.mark(self.names.len);
        heap.strings.mark(self.names.mul);
        heap.strings.mark(self.names.modulo);
        heap.strings.mark(self.names.contains);
        heap.strings.mark(self.names.prelude);

        heap.mark_object(self.classes.sentinel);
        heap.mark_object(self.classes.nil);
        heap.mark_object(self.classes.bool_);
        heap.mark_object(self.classes.number);
        heap.mark_object(self.classes.string);
        heap.mark_object(self.classes.buffer);
        heap.mark_object(self.classes.list);
        heap.mark_object(self.classes.tuple);
        heap.mark_object(self.classes.dict);
        heap.mark_object(self.classes.frozen_dict);
        heap.mark_object(self.classes.function);
        heap.mark_object(self.classes.operator);
        heap.mark_object(self.classes.class);
        heap.mark_object(self.classes.file);
        heap.mark_object(self.stdin_file);
        heap.mark_object(self.stdout_file);
        heap.mark_object(self.stderr_file);

        heap.mark_pinned();
        heap.trace_references();
        heap.finish_collection();
    }

    // -- Errors -------------------------------------------------------------

    pub(crate) fn error(&self, message: impl Into<String>) -> Error {
        Error::Runtime(message.into())
    }

    /// Render the `[line N] in module:function` frames, newest first.
    fn stack_trace(&self) -> String {
        let mut out = String::new();
        for frame in self.frames.iter().rev() {
            let closure = match self.heap.get(frame.closure) {
                Obj::Closure(closure) => closure,
                _ => continue,
            };
            let thunk = match self.heap.get(closure.thunk) {
                Obj::Thunk(thunk) => thunk,
                _ => continue,
            };
            let instruction = frame.ip.saturating_sub(1);
            let line = thunk
                .chunk
                .lines
                .get(instruction)
                .copied()
                .unwrap_or(0);
            out.push_str(&format!("[line {line}] in "));
            match (thunk.name, thunk.module_name) {
                (None, None) => out.push_str("[script]\n"),
                (None, Some(module)) => {
                    out.push_str(self.heap.str(module));
                    out.push('\n');
                }
                (Some(name), None) => {
                    out.push_str(self.heap.str(name));
                    out.push_str("()\n");
                }
                (Some(name), Some(module)) => {
                    out.push_str(&format!(
                        "{}:{}()\n",
                        self.heap.str(module),
                        self.heap.str(name)
                    ));
                }
            }
        }
        out
    }

    // -- Frame and module helpers -------------------------------------------

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("the VM always runs inside a frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("the VM always runs inside a frame")
    }

    fn current_closure(&self) -> &ObjClosure {
        match self.heap.get(self.frame().closure) {
            Obj::Closure(closure) => closure,
            _ => panic!("call frame does not hold a closure"),
        }
    }

    /// The module instance whose fields are the current frame's globals.
    fn current_module(&self) -> ObjId {
        self.current_closure().module
    }

    fn module_name_of(&self, module: ObjId) -> StrId {
        match self.heap.get(module) {
            Obj::Instance(instance) => match self.heap.get(instance.class) {
                Obj::Class(class) => class.name,
                _ => panic!("module instance has a non-class class"),
            },
            _ => panic!("module value is not an instance"),
        }
    }

    fn read_constant(&self, index: u16) -> Value {
        let closure = self.current_closure();
        match self.heap.get(closure.thunk) {
            Obj::Thunk(thunk) => thunk.chunk.constants[index as usize],
            _ => panic!("closure does not reference a thunk"),
        }
    }

    fn read_string_constant(&self, index: u16) -> StrId {
        match self.read_constant(index) {
            Value::Str(id) => id,
            other => panic!("expected string constant but found {other:?}"),
        }
    }

    // -- Class lookup -------------------------------------------------------

    /// The class of any value, or `None` for internal-only objects.
    pub(crate) fn class_of_value(&self, value: Value) -> Option<ObjId> {
        match value {
            Value::Nil => Some(self.classes.nil),
            Value::Bool(_) => Some(self.classes.bool_),
            Value::Number(_) => Some(self.classes.number),
            Value::Str(_) => Some(self.classes.string),
            Value::CFunction(_) => Some(self.classes.function),
            Value::Operator(_) => Some(self.classes.operator),
            Value::Sentinel(_) => Some(self.classes.sentinel),
            Value::Obj(id) => match self.heap.get(id) {
                Obj::Class(_) => Some(self.classes.class),
                Obj::Closure(_) | Obj::NativeClosure(_) => Some(self.classes.function),
                Obj::Instance(instance) => Some(instance.class),
                Obj::Buffer(_) => Some(self.classes.buffer),
                Obj::List(_) => Some(self.classes.list),
                Obj::Tuple(_) => Some(self.classes.tuple),
                Obj::Dict(_) => Some(self.classes.dict),
                Obj::FrozenDict(_) => Some(self.classes.frozen_dict),
                Obj::File(_) => Some(self.classes.file),
                Obj::Native(native) => self.native_class_of(native.descriptor),
                Obj::Thunk(_) | Obj::Upvalue(_) => None,
            },
        }
    }

    // -- Call dispatch ------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<()> {
        match callee {
            Value::CFunction(cfunction) => self.call_cfunction(cfunction, arg_count),
            Value::Operator(op) => self.call_operator(op, arg_count),
            Value::Obj(id) => match self.heap.get(id) {
                Obj::Class(_) => self.call_class(id, arg_count),
                Obj::Closure(_) => self.call_closure(id, arg_count),
                Obj::NativeClosure(_) => self.call_native_closure(id, arg_count),
                _ => Err(self.error(format!(
                    "Can only call functions and classes but got {}",
                    self.heap.kind_name(callee)
                ))),
            },
            _ => Err(self.error(format!(
                "Can only call functions and classes but got {}",
                self.heap.kind_name(callee)
            ))),
        }
    }

    pub(crate) fn call_closure(&mut self, closure_id: ObjId, arg_count: u8) -> Result<()> {
        let (arity, defaults) = {
            let closure = match self.heap.get(closure_id) {
                Obj::Closure(closure) => closure,
                _ => panic!("call_closure on a non-closure"),
            };
            match self.heap.get(closure.thunk) {
                Obj::Thunk(thunk) => (thunk.arity, thunk.default_args.clone()),
                _ => panic!("closure does not reference a thunk"),
            }
        };

        let mut arg_count = arg_count as usize;
        let arity = arity as usize;
        if arg_count < arity && arg_count + defaults.len() >= arity {
            // Backfill the missing trailing parameters from their defaults.
            let missing = arity - arg_count;
            for default in defaults[defaults.len() - missing..].iter() {
                self.push(*default);
                arg_count += 1;
            }
        }

        if arg_count != arity {
            return Err(self.error(format!(
                "Expected {arity} arguments but got {arg_count}"
            )));
        }

        if self.frames.len() == FRAMES_MAX {
            return Err(self.error("Stack overflow"));
        }

        self.frames.push(CallFrame {
            closure: closure_id,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_cfunction(&mut self, cfunction: &'static CFunction, arg_count: u8) -> Result<()> {
        self.check_native_arity(cfunction.name, cfunction.arity, cfunction.max_arity, arg_count)?;

        let base = self.stack.len() - arg_count as usize - 1;
        let receiver = self.stack[base];
        if !self.type_pattern_match(cfunction.receiver_type, receiver) {
            return Err(self.error(format!(
                "Invalid receiver passed to method {}()",
                cfunction.name
            )));
        }
        for (i, pattern) in cfunction.arg_types.iter().enumerate() {
            if i >= arg_count as usize {
                break;
            }
            let arg = self.stack[base + 1 + i];
            if !self.type_pattern_match(*pattern, arg) {
                return Err(self.error(format!(
                    "{}() expects {} for argument {}, but got {}",
                    cfunction.name,
                    pattern.name(),
                    i,
                    self.heap.kind_name(arg)
                )));
            }
        }

        // Arguments stay on the stack while the body runs so a collection
        // inside the body cannot reclaim them.
        let args: Vec<Value> = self.stack[base + 1..].to_vec();
        let result = (cfunction.body)(self, receiver, &args)?;
        self.stack.truncate(base);
        self.push(result);
        Ok(())
    }

    fn check_native_arity(
        &self,
        name: &str,
        arity: u8,
        max_arity: u8,
        arg_count: u8,
    ) -> Result<()> {
        if arg_count == arity {
            return Ok(());
        }
        if max_arity != 0 {
            if arg_count < arity {
                return Err(self.error(format!(
                    "Function {name} expects at least {arity} arguments but got {arg_count}"
                )));
            }
            if arg_count > max_arity {
                return Err(self.error(format!(
                    "Function {name} expects at most {max_arity} arguments but got {arg_count}"
                )));
            }
            return Ok(());
        }
        Err(self.error(format!(
            "Function {name} expects {arity} arguments but got {arg_count}"
        )))
    }

    pub(crate) fn type_pattern_match(&self, pattern: TypePattern, value: Value) -> bool {
        match pattern {
            TypePattern::Any => true,
            TypePattern::Number => value.is_number(),
            TypePattern::Str => value.is_str(),
            TypePattern::StrOrNil => value.is_str() || value.is_nil(),
            TypePattern::Bool => matches!(value, Value::Bool(_)),
            TypePattern::Buffer => self.obj_is(value, |o| matches!(o, Obj::Buffer(_))),
            TypePattern::BufferOrNil => {
                value.is_nil() || self.obj_is(value, |o| matches!(o, Obj::Buffer(_)))
            }
            TypePattern::List => self.obj_is(value, |o| matches!(o, Obj::List(_))),
            TypePattern::ListOrNil => {
                value.is_nil() || self.obj_is(value, |o| matches!(o, Obj::List(_)))
            }
            TypePattern::Dict => self.obj_is(value, |o| matches!(o, Obj::Dict(_))),
            TypePattern::Class => self.obj_is(value, |o| matches!(o, Obj::Class(_))),
            TypePattern::Native(descriptor) => self.obj_is(value, |o| match o {
                Obj::Native(native) => std::ptr::eq(native.descriptor, descriptor),
                _ => false,
            }),
            TypePattern::NativeOrNil(descriptor) => {
                value.is_nil()
                    || self.obj_is(value, |o| match o {
                        Obj::Native(native) => std::ptr::eq(native.descriptor, descriptor),
                        _ => false,
                    })
            }
        }
    }

    fn obj_is(&self, value: Value, pred: impl Fn(&Obj) -> bool) -> bool {
        match value {
            Value::Obj(id) => pred(self.heap.get(id)),
            _ => false,
        }
    }

    fn call_native_closure(&mut self, id: ObjId, arg_count: u8) -> Result<()> {
        let (name, arity) = match self.heap.get(id) {
            Obj::NativeClosure(nc) => (nc.name, nc.arity),
            _ => panic!("call_native_closure on a non-native-closure"),
        };
        self.check_native_arity(name, arity, 0, arg_count)?;

        let base = self.stack.len() - arg_count as usize - 1;
        let result = self.step_native_closure(id)?;
        self.stack.truncate(base);
        self.push(result);
        Ok(())
    }

    /// Advance a native-closure iterator one step.
    fn step_native_closure(&mut self, id: ObjId) -> Result<Value> {
        // Read the state with a short immutable borrow, then write back.
        enum Advance {
            Range(f64),
            Index,
            Done(Value),
        }
        let (result, advance) = match self.heap.get(id) {
            Obj::NativeClosure(nc) => match &nc.state {
                NativeClosureState::RangeIter { next, stop, step } => {
                    let exhausted = if *step >= 0.0 { next >= stop } else { next <= stop };
                    if exhausted {
                        (Value::Sentinel(crate::value::Sentinel::StopIteration), Advance::Done(Value::Nil))
                    } else {
                        (Value::Number(*next), Advance::Range(next + step))
                    }
                }
                NativeClosureState::ListIter { list, index } => {
                    let item = match self.heap.get(*list) {
                        Obj::List(l) => l.items.get(*index).copied(),
                        _ => None,
                    };
                    match item {
                        Some(item) => (item, Advance::Index),
                        None => (
                            Value::Sentinel(crate::value::Sentinel::StopIteration),
                            Advance::Done(Value::Nil),
                        ),
                    }
                }
                NativeClosureState::TupleIter { tuple, index } => {
                    let item = match self.heap.get(*tuple) {
                        Obj::Tuple(t) => t.items.get(*index).copied(),
                        _ => None,
                    };
                    match item {
                        Some(item) => (item, Advance::Index),
                        None => (
                            Value::Sentinel(crate::value::Sentinel::StopIteration),
                            Advance::Done(Value::Nil),
                        ),
                    }
                }
                NativeClosureState::MapKeyIter { keys, index } => match keys.get(*index) {
                    Some(key) => (*key, Advance::Index),
                    None => (
                        Value::Sentinel(crate::value::Sentinel::StopIteration),
                        Advance::Done(Value::Nil),
                    ),
                },
            },
            _ => panic!("step_native_closure on a non-native-closure"),
        };

        if let Obj::NativeClosure(nc) = self.heap.get_mut(id) {
            match (&mut nc.state, advance) {
                (NativeClosureState::RangeIter { next, .. }, Advance::Range(new_next)) => {
                    *next = new_next;
                }
                (NativeClosureState::ListIter { index, .. }, Advance::Index)
                | (NativeClosureState::TupleIter { index, .. }, Advance::Index)
                | (NativeClosureState::MapKeyIter { index, .. }, Advance::Index) => {
                    *index += 1;
                }
                _ => {}
            }
        }
        Ok(result)
    }

    fn call_operator(&mut self, op: Operator, arg_count: u8) -> Result<()> {
        match op {
            Operator::Len => {
                if arg_count != 1 {
                    return Err(self.error(format!(
                        "len() requires 1 argument but got {arg_count}"
                    )));
                }
                // Drop the operator value; the argument becomes the receiver.
                let receiver = self.pop();
                let top = self.stack.len() - 1;
                self.stack[top] = receiver;

                let length = match receiver {
                    Value::Str(id) => Some(self.heap.strings.len_of(id)),
                    Value::Obj(id) => match self.heap.get(id) {
                        Obj::Buffer(b) => Some(b.data.len()),
                        Obj::List(l) => Some(l.items.len()),
                        Obj::Tuple(t) => Some(t.items.len()),
                        Obj::Dict(d) => Some(d.map.len()),
                        _ => None,
                    },
                    _ => {
                        return Err(self.error(format!(
                            "object of kind '{}' has no len()",
                            self.heap.kind_name(receiver)
                        )));
                    }
                };
                match length {
                    Some(length) => {
                        self.stack[top] = Value::Number(length as f64);
                        Ok(())
                    }
                    None => self.invoke(self.names.len, 0),
                }
            }
        }
    }

    fn call_class(&mut self, class_id: ObjId, arg_count: u8) -> Result<()> {
        enum ClassKind {
            Native(&'static CFunction),
            NativeNoCtor(&'static str),
            Buffer,
            Builtin(StrId),
            Module,
            Plain(Option<Value>),
        }
        let kind = {
            let class = match self.heap.get(class_id) {
                Obj::Class(class) => class,
                _ => panic!("call_class on a non-class"),
            };
            if let Some(descriptor) = class.descriptor {
                match descriptor.instantiate {
                    Some(ctor) => ClassKind::Native(ctor),
                    None => ClassKind::NativeNoCtor(descriptor.name),
                }
            } else if class.is_builtin {
                if class_id == self.classes.buffer {
                    ClassKind::Buffer
                } else {
                    ClassKind::Builtin(class.name)
                }
            } else if class.is_module {
                ClassKind::Module
            } else {
                let init = class.methods.get(
                    Value::Str(self.names.init),
                    self.heap.strings.hash(self.names.init),
                );
                ClassKind::Plain(init)
            }
        };

        match kind {
            ClassKind::Native(ctor) => self.call_cfunction(ctor, arg_count),
            ClassKind::NativeNoCtor(name) => Err(self.error(format!(
                "Native class {name} does not allow instantiation"
            ))),
            ClassKind::Buffer => self.instantiate_buffer(arg_count),
            ClassKind::Builtin(name) => Err(self.error(format!(
                "Builtin class {} does not allow instantiation",
                self.heap.str(name)
            ))),
            ClassKind::Module => {
                Err(self.error("Instantiating module classes is not allowed"))
            }
            ClassKind::Plain(init) => {
                let instance = self.alloc(Obj::Instance(ObjInstance {
                    class: class_id,
                    fields: Map::new(),
                }));
                let receiver_slot = self.stack.len() - arg_count as usize - 1;
                self.stack[receiver_slot] = Value::Obj(instance);
                match init {
                    Some(init) => self.call_value(init, arg_count),
                    None if arg_count != 0 => Err(self.error(format!(
                        "Expected 0 arguments but got {arg_count}"
                    ))),
                    None => Ok(()),
                }
            }
        }
    }

    /// `Buffer(n | buffer | string | list-of-bytes)`.
    fn instantiate_buffer(&mut self, arg_count: u8) -> Result<()> {
        if arg_count != 1 {
            return Err(self.error("Buffer() requires exactly one argument"));
        }
        let arg = self.peek(0);
        let data: Vec<u8> = match arg {
            Value::Number(n) => vec![0; n as usize],
            Value::Str(id) => self.heap.str(id).as_bytes().to_vec(),
            Value::Obj(id) => match self.heap.get(id) {
                Obj::Buffer(buffer) => buffer.data.clone(),
                Obj::List(list) => {
                    let mut data = Vec::with_capacity(list.items.len());
                    for item in &list.items {
                        match item {
                            Value::Number(n) => data.push(*n as u8),
                            other => {
                                let kind = self.heap.kind_name(*other);
                                return Err(self.error(format!(
                                    "Buffer() requires a list of numbers, but got list item {kind}"
                                )));
                            }
                        }
                    }
                    data
                }
                _ => {
                    return Err(self.error(format!(
                        "Buffer() expects a number, string or list argument but got {}",
                        self.heap.kind_name(arg)
                    )));
                }
            },
            _ => {
                return Err(self.error(format!(
                    "Buffer() expects a number, string or list argument but got {}",
                    self.heap.kind_name(arg)
                )));
            }
        };
        let buffer = self.alloc(Obj::Buffer(ObjBuffer {
            data,
            byte_order: ByteOrder::LittleEndian,
            locked: false,
        }));
        self.pop(); // argument
        self.pop(); // the Buffer class
        self.push(Value::Obj(buffer));
        Ok(())
    }

    fn invoke_from_class(&mut self, class_id: ObjId, name: StrId, arg_count: u8) -> Result<()> {
        let method = {
            let class = match self.heap.get(class_id) {
                Obj::Class(class) => class,
                _ => panic!("invoke_from_class on a non-class"),
            };
            class
                .methods
                .get(Value::Str(name), self.heap.strings.hash(name))
        };
        match method {
            Some(method) => self.call_value(method, arg_count),
            None => {
                let class_name = match self.heap.get(class_id) {
                    Obj::Class(class) => self.heap.str(class.name).to_string(),
                    _ => String::new(),
                };
                Err(self.error(format!(
                    "Method '{}' not found in '{}'",
                    self.heap.str(name),
                    class_name
                )))
            }
        }
    }

    pub(crate) fn invoke(&mut self, name: StrId, arg_count: u8) -> Result<()> {
        let receiver = self.peek(arg_count as usize);
        match self.class_of_value(receiver) {
            Some(class) => self.invoke_from_class(class, name, arg_count),
            None => Err(self.error(format!(
                "{} kind does not yet support method calls",
                self.heap.kind_name(receiver)
            ))),
        }
    }

    // -- Upvalues -----------------------------------------------------------

    fn upvalue_slot(&self, id: ObjId) -> Option<usize> {
        match self.heap.get(id) {
            Obj::Upvalue(upvalue) => match upvalue.state {
                UpvalueState::Open(slot) => Some(slot),
                UpvalueState::Closed(_) => None,
            },
            _ => panic!("expected an upvalue object"),
        }
    }

    /// Find or create the open upvalue for a stack slot. The open list is
    /// kept sorted by descending slot so closing can stop early.
    fn capture_upvalue(&mut self, slot: usize) -> ObjId {
        let mut insert_at = self.open_upvalues.len();
        for (i, &existing) in self.open_upvalues.iter().enumerate() {
            match self.upvalue_slot(existing) {
                Some(existing_slot) if existing_slot > slot => continue,
                Some(existing_slot) if existing_slot == slot => return existing,
                _ => {
                    insert_at = i;
                    break;
                }
            }
        }
        let created = self.alloc(Obj::Upvalue(crate::object::ObjUpvalue {
            state: UpvalueState::Open(slot),
        }));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue pointing at `from_slot` or above.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&first) = self.open_upvalues.first() {
            let slot = match self.upvalue_slot(first) {
                Some(slot) if slot >= from_slot => slot,
                _ => break,
            };
            let value = self.stack[slot];
            if let Obj::Upvalue(upvalue) = self.heap.get_mut(first) {
                upvalue.state = UpvalueState::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    // -- The interpreter loop -----------------------------------------------

    /// Execute until the frame stack shrinks back to `return_frame_count`.
    pub(crate) fn run_until(&mut self, return_frame_count: usize) -> Result<()> {
        loop {
            let op = {
                let frame = self.frame();
                let closure = match self.heap.get(frame.closure) {
                    Obj::Closure(closure) => closure,
                    _ => panic!("call frame does not hold a closure"),
                };
                match self.heap.get(closure.thunk) {
                    Obj::Thunk(thunk) => thunk.chunk.code[frame.ip],
                    _ => panic!("closure does not reference a thunk"),
                }
            };
            self.frame_mut().ip += 1;

            #[cfg(feature = "trace")]
            {
                eprintln!("          {:?}", &self.stack);
                eprintln!("{:04} {:?}", self.frame().ip - 1, op);
            }

            match self.step(op, return_frame_count) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(Error::Runtime(message)) => {
                    match self.try_snapshots.pop() {
                        Some(snapshot) => {
                            // Restore the machine to the snapshot and resume
                            // at the else branch; the error is consumed.
                            self.stack.truncate(snapshot.stack_len);
                            self.frames.truncate(snapshot.frame_count);
                            self.frame_mut().ip = snapshot.catch_ip;
                        }
                        None => {
                            let trace = self.stack_trace();
                            return Err(Error::Runtime(format!("{message}\n{trace}")));
                        }
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Execute one instruction. Returns true when the run loop should stop
    /// (a `Return` brought the frame stack back to its entry depth).
    fn step(&mut self, op: Op, return_frame_count: usize) -> Result<bool> {
        match op {
            Op::Constant(index) => {
                let constant = self.read_constant(index);
                self.push(constant);
            }
            Op::Nil => self.push(Value::Nil),
            Op::True => self.push(Value::Bool(true)),
            Op::False => self.push(Value::Bool(false)),
            Op::Pop => {
                self.pop();
            }

            Op::GetLocal(slot) => {
                let value = self.stack[self.frame().slots + slot as usize];
                self.push(value);
            }
            Op::SetLocal(slot) => {
                let value = self.peek(0);
                let base = self.frame().slots;
                self.stack[base + slot as usize] = value;
            }
            Op::GetUpvalue(slot) => {
                let upvalue = self.current_closure().upvalues[slot as usize];
                let value = match self.heap.get(upvalue) {
                    Obj::Upvalue(u) => match u.state {
                        UpvalueState::Open(stack_slot) => self.stack[stack_slot],
                        UpvalueState::Closed(value) => value,
                    },
                    _ => panic!("closure upvalue slot holds a non-upvalue"),
                };
                self.push(value);
            }
            Op::SetUpvalue(slot) => {
                let upvalue = self.current_closure().upvalues[slot as usize];
                let value = self.peek(0);
                let open_slot = match self.heap.get_mut(upvalue) {
                    Obj::Upvalue(u) => match &mut u.state {
                        UpvalueState::Open(stack_slot) => Some(*stack_slot),
                        UpvalueState::Closed(closed) => {
                            *closed = value;
                            None
                        }
                    },
                    _ => panic!("closure upvalue slot holds a non-upvalue"),
                };
                if let Some(stack_slot) = open_slot {
                    self.stack[stack_slot] = value;
                }
            }

            Op::GetGlobal(index) => {
                let name = self.read_string_constant(index);
                let module = self.current_module();
                let value = match self.heap.get(module) {
                    Obj::Instance(instance) => instance
                        .fields
                        .get(Value::Str(name), self.heap.strings.hash(name)),
                    _ => panic!("module value is not an instance"),
                };
                match value {
                    Some(value) => self.push(value),
                    None => {
                        return Err(self.error(format!(
                            "Undefined variable '{}'",
                            self.heap.str(name)
                        )));
                    }
                }
            }
            Op::DefineGlobal(index) => {
                let name = self.read_string_constant(index);
                let hash = self.heap.strings.hash(name);
                let module = self.current_module();
                let value = self.peek(0);
                if let Obj::Instance(instance) = self.heap.get_mut(module) {
                    instance.fields.set(Value::Str(name), hash, value);
                }
                self.pop();
            }
            Op::SetGlobal(index) => {
                let name = self.read_string_constant(index);
                let hash = self.heap.strings.hash(name);
                let module = self.current_module();
                let value = self.peek(0);
                let replaced = match self.heap.get_mut(module) {
                    Obj::Instance(instance) => {
                        instance.fields.replace(Value::Str(name), hash, value)
                    }
                    _ => false,
                };
                if !replaced {
                    return Err(self.error(format!(
                        "Undefined variable '{}'",
                        self.heap.str(name)
                    )));
                }
            }

            Op::GetField(index) => {
                let name = self.read_string_constant(index);
                self.get_field(name)?;
            }
            Op::SetField(index) => {
                let name = self.read_string_constant(index);
                self.set_field(name)?;
            }

            Op::Is => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(ops::values_is(a, b)));
            }
            Op::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(ops::values_equal(&self.heap, a, b)));
            }
            Op::Greater => {
                let result = ops::value_less_than(&self.heap, self.peek(0), self.peek(1))?;
                self.pop();
                self.pop();
                self.push(Value::Bool(result));
            }
            Op::Less => {
                let result = ops::value_less_than(&self.heap, self.peek(1), self.peek(0))?;
                self.pop();
                self.pop();
                self.push(Value::Bool(result));
            }
            Op::Not => {
                let value = self.pop();
                self.push(Value::Bool(!value.is_truthy()));
            }
            Op::In => {
                if self.obj_is(self.peek(0), |o| matches!(o, Obj::Class(_))) {
                    let class = self.pop().as_obj_id().expect("checked to be a class");
                    let value = self.pop();
                    let is_instance = self.class_of_value(value) == Some(class);
                    self.push(Value::Bool(is_instance));
                } else {
                    // Swap so the container becomes the receiver of
                    // __contains__.
                    let b = self.pop();
                    let a = self.pop();
                    self.push(b);
                    self.push(a);
                    self.invoke(self.names.contains, 1)?;
                }
            }

            Op::Add => {
                let (a, b) = (self.peek(1), self.peek(0));
                match (a, b) {
                    (Value::Number(x), Value::Number(y)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(x + y));
                    }
                    (Value::Str(x), Value::Str(y)) => {
                        let mut text =
                            String::with_capacity(self.heap.str(x).len() + self.heap.str(y).len());
                        text.push_str(self.heap.str(x));
                        text.push_str(self.heap.str(y));
                        let id = self.heap.intern_owned(text);
                        self.pop();
                        self.pop();
                        self.push(Value::Str(id));
                    }
                    _ => {
                        return Err(self.error("Operands must be two numbers or two strings"));
                    }
                }
            }
            Op::Subtract => self.binary_number_op(op)?,
            Op::Multiply => {
                if self.peek(0).is_number() && self.peek(1).is_number() {
                    self.binary_number_op(op)?;
                } else {
                    self.invoke(self.names.mul, 1)?;
                }
            }
            Op::Divide => self.binary_number_op(op)?,
            Op::FloorDivide => self.binary_number_op(op)?,
            Op::Modulo => {
                if self.peek(0).is_number() && self.peek(1).is_number() {
                    self.binary_number_op(op)?;
                } else {
                    self.invoke(self.names.modulo, 1)?;
                }
            }
            Op::Negate => {
                if !self.peek(0).is_number() {
                    return Err(self.error("Operand must be a number"));
                }
                let n = self.pop().as_number().expect("checked to be a number");
                self.push(Value::Number(-n));
            }

            Op::ShiftLeft | Op::ShiftRight | Op::BitwiseOr | Op::BitwiseAnd | Op::BitwiseXor => {
                if !self.peek(0).is_number() || !self.peek(1).is_number() {
                    return Err(self.error("Operands must be numbers"));
                }
                let b = self.pop().as_u32();
                let a = self.pop().as_u32();
                let result = match op {
                    Op::ShiftLeft => a.wrapping_shl(b),
                    Op::ShiftRight => a.wrapping_shr(b),
                    Op::BitwiseOr => a | b,
                    Op::BitwiseAnd => a & b,
                    Op::BitwiseXor => a ^ b,
                    _ => unreachable!(),
                };
                self.push(Value::Number(result as f64));
            }
            Op::BitwiseNot => {
                if !self.peek(0).is_number() {
                    return Err(self.error("Operand must be a number"));
                }
                let x = self.pop().as_u32();
                self.push(Value::Number(!x as f64));
            }

            Op::Jump(target) => {
                self.frame_mut().ip = target as usize;
            }
            Op::JumpIfFalse(target) => {
                if !self.peek(0).is_truthy() {
                    self.frame_mut().ip = target as usize;
                }
            }
            Op::JumpIfStopIteration(target) => {
                if self.peek(0).is_stop_iteration() {
                    self.frame_mut().ip = target as usize;
                }
            }
            Op::Loop(target) => {
                self.frame_mut().ip = target as usize;
            }

            Op::TryStart(catch_target) => {
                if self.try_snapshots.len() >= TRY_SNAPSHOTS_MAX {
                    panic!("try snapshot overflow");
                }
                self.try_snapshots.push(TrySnapshot {
                    catch_ip: catch_target as usize,
                    stack_len: self.stack.len(),
                    frame_count: self.frames.len(),
                });
            }
            Op::TryEnd(target) => {
                if self.try_snapshots.pop().is_none() {
                    panic!("try snapshot underflow");
                }
                self.frame_mut().ip = target as usize;
            }
            Op::Raise => {
                let value = self.peek(0);
                match value {
                    Value::Str(id) => {
                        let message = self.heap.str(id).to_string();
                        return Err(self.error(message));
                    }
                    _ => panic!("Only strings can be raised right now"),
                }
            }

            Op::GetIter => {
                let iterable = self.peek(0);
                if !self.is_iterator(iterable) {
                    self.invoke(self.names.iter, 0)?;
                }
            }
            Op::GetNext => {
                let iterator = self.peek(0);
                self.push(iterator);
                self.call_value(iterator, 0)?;
            }

            Op::Call(arg_count) => {
                let callee = self.peek(arg_count as usize);
                self.call_value(callee, arg_count)?;
            }
            Op::Invoke(name_index, arg_count) => {
                let name = self.read_string_constant(name_index);
                self.invoke(name, arg_count)?;
            }
            Op::SuperInvoke(name_index, arg_count) => {
                let name = self.read_string_constant(name_index);
                let superclass = self
                    .pop()
                    .as_obj_id()
                    .expect("the compiler places the superclass on top");
                self.invoke_from_class(superclass, name, arg_count)?;
            }

            Op::Closure(index) => {
                let thunk_id = match self.read_constant(index) {
                    Value::Obj(id) => id,
                    other => panic!("Closure operand is not a thunk: {other:?}"),
                };
                let module = self.current_module();
                let descriptors = match self.heap.get(thunk_id) {
                    Obj::Thunk(thunk) => thunk.upvalues.clone(),
                    _ => panic!("Closure operand is not a thunk"),
                };
                let closure = self.alloc(Obj::Closure(ObjClosure {
                    module,
                    thunk: thunk_id,
                    upvalues: Vec::with_capacity(descriptors.len()),
                }));
                self.push(Value::Obj(closure));
                let frame_slots = self.frame().slots;
                let enclosing = self.frame().closure;
                for descriptor in descriptors {
                    let upvalue = if descriptor.is_local {
                        self.capture_upvalue(frame_slots + descriptor.index as usize)
                    } else {
                        match self.heap.get(enclosing) {
                            Obj::Closure(enclosing) => {
                                enclosing.upvalues[descriptor.index as usize]
                            }
                            _ => panic!("call frame does not hold a closure"),
                        }
                    };
                    if let Obj::Closure(closure) = self.heap.get_mut(closure) {
                        closure.upvalues.push(upvalue);
                    }
                }
            }
            Op::CloseUpvalue => {
                self.close_upvalues(self.stack.len() - 1);
                self.pop();
            }

            Op::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("Return outside any frame");
                self.close_upvalues(frame.slots);
                self.stack.truncate(frame.slots);
                self.push(result);
                if self.frames.len() == return_frame_count {
                    return Ok(true);
                }
            }

            Op::Import(index) => {
                let name = self.read_string_constant(index);
                import::import_module(self, name)?;
            }

            Op::NewList(length) => {
                let start = self.stack.len() - length as usize;
                let items: Vec<Value> = self.stack[start..].to_vec();
                let list = self.alloc(Obj::List(crate::object::ObjList { items }));
                self.stack.truncate(start);
                self.push(Value::Obj(list));
            }
            Op::NewTuple(length) => {
                let start = self.stack.len() - length as usize;
                let items: Vec<Value> = self.stack[start..].to_vec();
                let tuple = self.heap.intern_tuple(&items)?;
                self.stack.truncate(start);
                self.push(Value::Obj(tuple));
            }
            Op::NewDict(length) => {
                let start = self.stack.len() - 2 * length as usize;
                let dict = self.alloc(Obj::Dict(crate::object::ObjDict { map: Map::new() }));
                // Keep the dict reachable while the pairs are inserted.
                self.push(Value::Obj(dict));
                for i in 0..length as usize {
                    let key = self.stack[start + 2 * i];
                    let value = self.stack[start + 2 * i + 1];
                    let hash = self.heap.value_hash(key)?;
                    if let Obj::Dict(d) = self.heap.get_mut(dict) {
                        d.map.set(key, hash, value);
                    }
                }
                self.stack.truncate(start);
                self.push(Value::Obj(dict));
            }

            Op::Class(index) => {
                let name = self.read_string_constant(index);
                let class = self.alloc(Obj::Class(ObjClass {
                    name,
                    methods: Map::new(),
                    static_methods: Map::new(),
                    is_builtin: false,
                    is_module: false,
                    descriptor: None,
                }));
                self.push(Value::Obj(class));
            }
            Op::Inherit => {
                let superclass = self.peek(1);
                let superclass_id = match superclass {
                    Value::Obj(id) if matches!(self.heap.get(id), Obj::Class(_)) => id,
                    _ => return Err(self.error("Superclass must be a class")),
                };
                let subclass_id = self
                    .peek(0)
                    .as_obj_id()
                    .expect("the compiler places the subclass on top");
                let methods = match self.heap.get(superclass_id) {
                    Obj::Class(class) => class.methods.clone(),
                    _ => unreachable!(),
                };
                if let Obj::Class(subclass) = self.heap.get_mut(subclass_id) {
                    subclass.methods.extend_from(&methods);
                }
                self.pop();
            }
            Op::Method(index) => {
                let name = self.read_string_constant(index);
                let hash = self.heap.strings.hash(name);
                let method = self.peek(0);
                let class_id = self
                    .peek(1)
                    .as_obj_id()
                    .expect("the compiler places the class below the method");
                if let Obj::Class(class) = self.heap.get_mut(class_id) {
                    class.methods.set(Value::Str(name), hash, method);
                }
                self.pop();
            }
        }
        Ok(false)
    }

    fn binary_number_op(&mut self, op: Op) -> Result<()> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err(self.error("Operands must be numbers"));
        }
        let b = self.pop().as_number().expect("checked to be a number");
        let a = self.pop().as_number().expect("checked to be a number");
        let result = match op {
            Op::Subtract => a - b,
            Op::Multiply => a * b,
            Op::Divide => a / b,
            Op::FloorDivide => (a / b).floor(),
            // fmod semantics: the result takes the dividend's sign.
            Op::Modulo => a % b,
            _ => unreachable!("binary_number_op on a non-arithmetic op"),
        };
        self.push(Value::Number(result));
        Ok(())
    }

    fn is_iterator(&self, value: Value) -> bool {
        match value {
            Value::Obj(id) => match self.heap.get(id) {
                Obj::NativeClosure(nc) => nc.arity == 0,
                Obj::Closure(closure) => match self.heap.get(closure.thunk) {
                    Obj::Thunk(thunk) => thunk.arity == 0,
                    _ => false,
                },
                _ => false,
            },
            _ => false,
        }
    }

    // -- Field access -------------------------------------------------------

    fn get_field(&mut self, name: StrId) -> Result<()> {
        let receiver = self.peek(0);
        let hash = self.heap.strings.hash(name);

        if let Value::Obj(id) = receiver {
            match self.heap.get(id) {
                Obj::Instance(instance) => {
                    match instance.fields.get(Value::Str(name), hash) {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                            return Ok(());
                        }
                        None => {
                            let class_name = match self.heap.get(instance.class) {
                                Obj::Class(class) => self.heap.str(class.name).to_string(),
                                _ => String::new(),
                            };
                            return Err(self.error(format!(
                                "Field '{}' not found in {}",
                                self.heap.str(name),
                                class_name
                            )));
                        }
                    }
                }
                Obj::Dict(dict) => match dict.map.get(Value::Str(name), hash) {
                    Some(value) => {
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    None => {
                        return Err(self.error(format!(
                            "Field '{}' not found in Dict",
                            self.heap.str(name)
                        )));
                    }
                },
                Obj::Class(class) => {
                    if let Some(value) = class.static_methods.get(Value::Str(name), hash) {
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                }
                Obj::Native(native) => {
                    if let Some(get_field) = native.descriptor.get_field {
                        return match get_field(self, id, name) {
                            Some(value) => {
                                self.pop();
                                self.push(value);
                                Ok(())
                            }
                            None => Err(self.error(format!(
                                "Field '{}' not found in native type {}",
                                self.heap.str(name),
                                self.heap.kind_name(receiver)
                            ))),
                        };
                    }
                }
                _ => {}
            }
        }

        Err(self.error(format!(
            "{} values do not have fields",
            self.heap.kind_name(receiver)
        )))
    }

    fn set_field(&mut self, name: StrId) -> Result<()> {
        let target = self.peek(1);
        let value = self.peek(0);
        let hash = self.heap.strings.hash(name);

        if let Value::Obj(id) = target {
            let handled = match self.heap.get_mut(id) {
                Obj::Instance(instance) => {
                    instance.fields.set(Value::Str(name), hash, value);
                    true
                }
                Obj::Dict(dict) => {
                    dict.map.set(Value::Str(name), hash, value);
                    true
                }
                _ => false,
            };
            if handled {
                let value = self.pop();
                self.pop();
                self.push(value);
                return Ok(());
            }
            if let Obj::Native(native) = self.heap.get(id) {
                if let Some(set_field) = native.descriptor.set_field {
                    if set_field(self, id, name, value) {
                        let value = self.pop();
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    return Err(self.error(format!(
                        "Field {} not found on {}",
                        self.heap.str(name),
                        self.heap.kind_name(target)
                    )));
                }
            }
        }

        Err(self.error(format!(
            "{} values do not have fields",
            self.heap.kind_name(target)
        )))
    }

    // -- Misc helpers shared with builtins and import -------------------------

    pub(crate) fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub(crate) fn module_cache_get(&self, name: StrId) -> Option<Value> {
        self.modules
            .get(Value::Str(name), self.heap.strings.hash(name))
    }

    pub(crate) fn module_cache_set(&mut self, name: StrId, module: Value) {
        let hash = self.heap.strings.hash(name);
        self.modules.set(Value::Str(name), hash, module);
    }

    pub(crate) fn native_module_thunk(&self, name: StrId) -> Option<Value> {
        self.native_module_thunks
            .get(Value::Str(name), self.heap.strings.hash(name))
    }

    /// Copy a module's fields into its class's method map so qualified
    /// calls (`module.fn(x)`) dispatch as methods.
    pub(crate) fn promote_module_fields(&mut self, module: ObjId) {
        let (class_id, fields) = match self.heap.get(module) {
            Obj::Instance(instance) => (instance.class, instance.fields.clone()),
            _ => panic!("module value is not an instance"),
        };
        if let Obj::Class(class) = self.heap.get_mut(class_id) {
            class.methods.extend_from(&fields);
        }
    }

    /// Set one field on a module instance; for native module bodies.
    pub fn set_module_field(&mut self, module: ObjId, name: &str, value: Value) {
        let id = self.heap.intern(name);
        let hash = self.heap.strings.hash(id);
        if let Obj::Instance(instance) = self.heap.get_mut(module) {
            instance.fields.set(Value::Str(id), hash, value);
        }
    }

    pub(crate) fn frames_len(&self) -> usize {
        self.frames.len()
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}
