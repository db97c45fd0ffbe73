//! Native code generation for x86 and x86-64.
//!
//! - [`memory`] and [`page`]: executable regions packed with many functions
//! - [`x86`] and [`codebuf`]: instruction encoding and fix-ups
//! - [`abi`] and [`callconv`]: per-target tables and call emission
//! - [`translator`]: bytecode to machine code
//! - [`linker`]: calls between compiled functions
//! - [`compiler`]: the locked entry points the engine uses

pub mod abi;
pub mod callconv;
pub mod codebuf;
pub mod compiler;
pub mod entry_table;
pub mod helpers;
pub mod linker;
pub mod memory;
pub mod page;
pub mod translator;
pub mod x86;

pub use abi::{AbiTable, Target};
pub use compiler::{CompilerStats, JitCompiler, NativeHandle};
pub use entry_table::EntryTable;
pub use page::{PageManager, PageStats};
