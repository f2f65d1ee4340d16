//! Error types shared across the interpreter.
//!
//! Mtots has two error tiers. Recoverable, user-surface failures (type
//! mismatches, missing methods, undefined globals, `raise`d strings) travel
//! through this module's [`Error`] and can be intercepted by a `try ... else`
//! expression. Internal invariant violations (value-stack overflow, a native
//! module unbalancing the stack) are `panic!`s and terminate the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The compiler reported one or more diagnostics. The diagnostics
    /// themselves were already printed to stderr; this carries a summary.
    #[error("{0}")]
    Compile(String),

    /// A runtime error. The message includes the pretty-printed call stack,
    /// one `[line N] in module:function` entry per frame, newest first.
    #[error("{0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;
