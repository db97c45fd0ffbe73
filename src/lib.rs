//! scriptjit - a baseline JIT for a stack-based script VM.
//!
//! The engine hands over functions as word-coded bytecode; the compiler
//! emits x86 or x86-64 code that runs them on the same register file and
//! value stack the interpreter uses, returning to the interpreter wherever
//! it has no native rendition.

pub mod config;
pub mod error;
pub mod jit;
pub mod vm;

pub use config::{JitConfig, JitMode};
pub use error::{ConfigError, JitError, JitResult, MemoryError};
pub use jit::{JitCompiler, NativeHandle, Target};
pub use vm::{Engine, RuntimeHooks, ScriptFunction, VmRegisters};
