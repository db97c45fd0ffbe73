//! Services the embedding engine provides to generated code.

use std::ffi::c_void;

use super::function::{FunctionId, JitSlot, ObjectType, ScriptFunction};

/// Registry lookups the translator needs at compile time.
pub trait Engine {
    /// Resolve a function by numeric id.
    fn function(&self, id: FunctionId) -> Option<&ScriptFunction>;

    /// Resolve an object type handle found in a pointer operand.
    fn object_type(&self, handle: usize) -> Option<&ObjectType>;

    /// Runtime entry points called from generated code.
    fn hooks(&self) -> &RuntimeHooks;
}

/// Context pointer passed as the first argument of every hook.
pub type Ctx = *mut c_void;

/// Table of `extern "C"` engine services.
///
/// Generated code calls these directly with the owning context taken from
/// [`crate::vm::VmRegisters::ctx`]. Hooks that touch interpreter state may
/// assume the program position and stack pointer have been published first.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RuntimeHooks {
    /// Push the caller's call state and set up the callee frame. Returns zero
    /// when the call could not be prepared (an exception is already pending).
    pub prepare_script_call: unsafe extern "C" fn(ctx: Ctx, func: FunctionId) -> u8,
    /// Pop the callee's call state and restore the caller frame.
    pub return_script_function: unsafe extern "C" fn(ctx: Ctx),
    /// Pick the override of an interface method for the object on top of the
    /// stack, prepare its frame and return its slot, or null.
    pub call_interface_method: unsafe extern "C" fn(ctx: Ctx, func: FunctionId) -> *const JitSlot,
    /// Resolve a bound import, prepare its frame and return its slot, or null.
    pub call_bound_function: unsafe extern "C" fn(ctx: Ctx, import: u32) -> *const JitSlot,
    /// Invoke a system function through the engine's own marshalling.
    /// Returns the number of bytes to pop from the value stack.
    pub call_system_function: unsafe extern "C" fn(ctx: Ctx, func: FunctionId, obj: *mut c_void) -> i32,
    /// Mark the context suspended. Returns nonzero if generated code must leave.
    pub do_suspend: unsafe extern "C" fn(ctx: Ctx) -> u8,
    /// Called when `do_process_suspend` is set after a call. Returns nonzero
    /// if execution must go back to the interpreter.
    pub check_status: unsafe extern "C" fn(ctx: Ctx) -> u8,
    pub alloc_object: unsafe extern "C" fn(ctx: Ctx, size: usize) -> *mut c_void,
    pub free_object: unsafe extern "C" fn(ctx: Ctx, obj: *mut c_void),
    /// Invoke an object behaviour (constructor, add-ref, release, destructor)
    /// identified by a system function id.
    pub call_object_method: unsafe extern "C" fn(ctx: Ctx, obj: *mut c_void, func: FunctionId),
}

impl std::fmt::Debug for RuntimeHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHooks").finish_non_exhaustive()
    }
}
