//! Mtots - an embeddable, dynamically-typed scripting language.
//!
//! Mtots has indentation-based, Python-flavored syntax, class-based OO with
//! single inheritance, first-class functions with closures, tuples, lists
//! and dicts, operator overloading through dunder methods, modules, and a
//! structured `try ... else` / `raise` exception mechanism. Programs are
//! compiled to bytecode and executed by a stack-based virtual machine with
//! a tracing mark-sweep garbage collector.
//!
//! # Quick start
//!
//! ```
//! use mtots::Vm;
//!
//! let mut vm = Vm::with_captured_output();
//! let module = vm.new_script_module("__main__");
//! vm.interpret("print(2 + 3)", module).unwrap();
//! assert_eq!(vm.take_output(), "5\n");
//! ```
//!
//! # Language features
//!
//! ## Types
//! - `nil`, `true`/`false`, numbers (IEEE-754 doubles), interned strings
//! - `List`, `Tuple` (interned), `Dict` (insertion-ordered), `FrozenDict`
//!   (interned and hashable), `Buffer` (byte array)
//!
//! ## Syntax
//! - Indentation blocks in two-space units, `#` comments
//! - `def` with compile-time-constant default arguments and `@decorator`s
//! - `class` with single inheritance, `this`, `super`, and `__init__`
//! - `if`/`elif`/`else`, `while`, `for x in iterable`, C-style `for (;;)`
//! - `import name [as alias]`, `var`/`final` declarations, `pass`
//! - `try EXPR else EXPR` expressions and `raise "message"`
//! - Operator overloading via `__mul__`, `__mod__`, `__getitem__`,
//!   `__setitem__`, `__slice__`, `__contains__`, `__iter__`, `__len__`
//! - `0x`/`0b` number literals; raw and triple-quoted strings
//! - Type annotations are parsed and discarded
//!
//! ## Iteration
//! An iterator is any zero-argument callable returning the next value or
//! `StopIteration`; `for` loops call `__iter__` when needed. `range()`
//! returns such an iterator.
//!
//! ## Modules
//! `import` resolves through the registered native modules (`os`, `json`
//! ship with the runtime) and then `<name>.mtots` files under the
//! `MTOTS_ROOT`, `MTOTS_AUX_ROOT`, `MTOTS_LIB_ROOT`, and
//! `MTOTS_STDLIB_ROOT` search roots. Host applications register their own
//! native modules with [`Vm::add_native_module`] and native classes with
//! [`Vm::register_native_class`].

mod builtins;
mod bytecode;
mod classes;
mod compiler;
mod error;
mod heap;
mod import;
mod map;
mod modules;
mod object;
mod ops;
mod scanner;
mod strings;
mod value;
mod vm;

pub use error::{Error, Result};
pub use object::{NativeData, NativeObjectDescriptor};
pub use value::{CFunction, NativeFn, ObjId, Operator, Sentinel, StrId, TypePattern, Value};
pub use vm::{Vm, FRAMES_MAX, STACK_MAX};
