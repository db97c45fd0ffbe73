//! An engine without a runtime behind it.
//!
//! Useful for compiling and running functions that only compute: every
//! service that would need a real context declines, which generated code
//! treats as "hand control back" at that instruction.

use std::collections::HashMap;
use std::ffi::c_void;

use super::engine::{Ctx, Engine, RuntimeHooks};
use super::function::{FunctionId, JitSlot, ObjectType, ScriptFunction};

unsafe extern "C" fn decline_call(_: Ctx, _: FunctionId) -> u8 {
    0
}

unsafe extern "C" fn ignore(_: Ctx) {}

unsafe extern "C" fn no_slot(_: Ctx, _: u32) -> *const JitSlot {
    std::ptr::null()
}

unsafe extern "C" fn pop_nothing(_: Ctx, _: FunctionId, _: *mut c_void) -> i32 {
    0
}

unsafe extern "C" fn stay(_: Ctx) -> u8 {
    0
}

unsafe extern "C" fn leave(_: Ctx) -> u8 {
    1
}

unsafe extern "C" fn no_memory(_: Ctx, _: usize) -> *mut c_void {
    std::ptr::null_mut()
}

unsafe extern "C" fn ignore_object(_: Ctx, _: *mut c_void) {}

unsafe extern "C" fn ignore_method(_: Ctx, _: *mut c_void, _: FunctionId) {}

/// Hooks that decline every service.
pub const DECLINING_HOOKS: RuntimeHooks = RuntimeHooks {
    prepare_script_call: decline_call,
    return_script_function: ignore,
    call_interface_method: no_slot,
    call_bound_function: no_slot,
    call_system_function: pop_nothing,
    do_suspend: leave,
    check_status: stay,
    alloc_object: no_memory,
    free_object: ignore_object,
    call_object_method: ignore_method,
};

#[derive(Debug)]
pub struct StandaloneEngine {
    functions: HashMap<FunctionId, ScriptFunction>,
    types: HashMap<usize, ObjectType>,
    hooks: RuntimeHooks,
}

impl Default for StandaloneEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StandaloneEngine {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
            types: HashMap::new(),
            hooks: DECLINING_HOOKS,
        }
    }

    pub fn add_function(&mut self, func: ScriptFunction) -> &mut Self {
        self.functions.insert(func.id, func);
        self
    }

    /// Register `ty` under the handle bytecode refers to it by.
    pub fn add_type(&mut self, handle: usize, ty: ObjectType) -> &mut Self {
        self.types.insert(handle, ty);
        self
    }
}

impl Engine for StandaloneEngine {
    fn function(&self, id: FunctionId) -> Option<&ScriptFunction> {
        self.functions.get(&id)
    }

    fn object_type(&self, handle: usize) -> Option<&ObjectType> {
        self.types.get(&handle)
    }

    fn hooks(&self) -> &RuntimeHooks {
        &self.hooks
    }
}
