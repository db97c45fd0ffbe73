//! The VM register file shared between the interpreter and generated code.

use std::ffi::c_void;
use std::mem::offset_of;

/// Register file of one execution context.
///
/// Generated code reaches every field through a single base register, so the
/// layout is fixed with `#[repr(C)]` and the offsets below are the contract.
#[repr(C)]
#[derive(Debug)]
pub struct VmRegisters {
    /// Word offset of the next instruction in the current function.
    pub program_position: usize,
    pub stack_frame_pointer: *mut u32,
    pub stack_pointer: *mut u32,
    /// Return values and scratch results. Four byte writes zero the
    /// upper half.
    pub value_register: u64,
    /// Owning execution context, passed back to every runtime hook.
    pub ctx: *mut c_void,
    pub object_register: *mut c_void,
    pub object_type: *mut c_void,
    /// Nonzero when generated code must stop at the next checkpoint.
    pub do_process_suspend: u8,
}

impl Default for VmRegisters {
    fn default() -> Self {
        Self {
            program_position: 0,
            stack_frame_pointer: std::ptr::null_mut(),
            stack_pointer: std::ptr::null_mut(),
            value_register: 0,
            ctx: std::ptr::null_mut(),
            object_register: std::ptr::null_mut(),
            object_type: std::ptr::null_mut(),
            do_process_suspend: 0,
        }
    }
}

/// Byte offsets of [`VmRegisters`] fields.
pub mod offsets {
    use super::*;

    pub const PROGRAM_POSITION: i32 = offset_of!(VmRegisters, program_position) as i32;
    pub const STACK_FRAME_POINTER: i32 = offset_of!(VmRegisters, stack_frame_pointer) as i32;
    pub const STACK_POINTER: i32 = offset_of!(VmRegisters, stack_pointer) as i32;
    pub const VALUE_REGISTER: i32 = offset_of!(VmRegisters, value_register) as i32;
    pub const CTX: i32 = offset_of!(VmRegisters, ctx) as i32;
    pub const OBJECT_REGISTER: i32 = offset_of!(VmRegisters, object_register) as i32;
    pub const OBJECT_TYPE: i32 = offset_of!(VmRegisters, object_type) as i32;
    pub const DO_PROCESS_SUSPEND: i32 = offset_of!(VmRegisters, do_process_suspend) as i32;
}
