//! The compiler↔interpreter contract: bytecode, register file, metadata and
//! engine services.

pub mod bytecode;
pub mod engine;
pub mod function;
pub mod registers;
pub mod standalone;

pub use bytecode::{Bytecode, BytecodeBuilder, Instr, Layout, Opcode};
pub use engine::{Ctx, Engine, RuntimeHooks};
pub use function::{
    Behaviours, CallConvention, FunctionId, FunctionKind, JitSlot, NativeEntryFn, ObjectType,
    ParamShape, ReturnShape, ScriptFunction, SystemFunction, PTR_DWORDS,
};
pub use registers::VmRegisters;
pub use standalone::StandaloneEngine;
