//! rill — a bytecode-compiled scripting language.
//!
//! The pipeline is a single-pass compiler (source → bytecode chunks), a
//! stack-based virtual machine with an explicit call-frame stack, and a
//! stop-the-world mark-sweep garbage collector over a handle-addressed
//! heap arena. See `Vm::interpret` for the one-call entry point.

pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod diagnostic;
pub mod heap;
pub mod lexer;
pub mod object;
pub mod table;
pub mod vm;

pub use compiler::CompileError;
pub use vm::{InterpretError, RuntimeError, Vm};
