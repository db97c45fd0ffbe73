//! Function and type metadata the engine exposes to the compiler.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::registers::VmRegisters;

pub type FunctionId = u32;

/// Signature of every compiled function: the register file and the bytecode
/// offset of the entry point to start at.
pub type NativeEntryFn = unsafe extern "C" fn(regs: *mut VmRegisters, entry: usize);

/// Dwords occupied by a pointer on the value stack.
pub const PTR_DWORDS: usize = std::mem::size_of::<usize>() / 4;

/// Per-function link cell holding the published native code.
///
/// Generated code reads both fields when dispatching dynamically, so the
/// layout is fixed. `function` is written last and read first.
#[repr(C)]
#[derive(Debug, Default)]
pub struct JitSlot {
    function: AtomicUsize,
    entry: AtomicUsize,
}

impl JitSlot {
    pub const FUNCTION_OFFSET: i32 = 0;
    pub const ENTRY_OFFSET: i32 = std::mem::size_of::<usize>() as i32;

    pub const fn new() -> Self {
        Self {
            function: AtomicUsize::new(0),
            entry: AtomicUsize::new(0),
        }
    }

    pub fn install(&self, function: usize, entry: usize) {
        self.entry.store(entry, Ordering::Relaxed);
        self.function.store(function, Ordering::Release);
    }

    pub fn clear(&self) {
        self.function.store(0, Ordering::Release);
    }

    /// Clear only if the slot still points at `function`.
    pub fn clear_if(&self, function: usize) -> bool {
        self.function
            .compare_exchange(function, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn function_address(&self) -> usize {
        self.function.load(Ordering::Acquire)
    }

    pub fn entry_offset(&self) -> usize {
        self.entry.load(Ordering::Relaxed)
    }

    pub fn native(&self) -> Option<NativeEntryFn> {
        let addr = self.function_address();
        if addr == 0 {
            return None;
        }
        // SAFETY: only the compiler installs nonzero addresses, and those
        // point at a prologue with the `NativeEntryFn` signature.
        Some(unsafe { std::mem::transmute::<usize, NativeEntryFn>(addr) })
    }
}

/// Host calling convention of a system function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    Cdecl,
    Stdcall,
    Thiscall,
    CdeclObjFirst,
    CdeclObjLast,
    /// Engine-marshalled generic interface.
    Generic,
    /// Virtual method looked up through the object.
    Virtual,
}

/// Shape of one native parameter as laid out on the value stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    Int32,
    Int64,
    Float,
    Double,
    /// References, handles and `?&` arguments.
    Pointer,
}

impl ParamShape {
    pub fn dwords(self) -> usize {
        match self {
            ParamShape::Int32 | ParamShape::Float => 1,
            ParamShape::Int64 | ParamShape::Double => 2,
            ParamShape::Pointer => PTR_DWORDS,
        }
    }
}

/// How a native function hands back its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    Void,
    Bool,
    Int32,
    Int64,
    Float,
    Double,
    /// Object handle stored in the object register. `add_ref` names the
    /// behaviour to call on it when the host hands out an auto handle.
    Handle { add_ref: Option<FunctionId> },
    /// Object returned by value into caller-provided memory whose address
    /// is pushed on the value stack.
    Object {
        size: u32,
        /// Returned through a hidden pointer argument rather than registers.
        in_memory: bool,
        /// Register-returned aggregate of floating-point members.
        float_members: bool,
    },
}

impl ReturnShape {
    pub fn returns_on_stack(self) -> bool {
        matches!(self, ReturnShape::Object { .. })
    }
}

/// Metadata of a host function callable from script code.
#[derive(Debug, Clone)]
pub struct SystemFunction {
    pub address: usize,
    pub convention: CallConvention,
    pub params: Vec<ParamShape>,
    pub returns: ReturnShape,
    /// Object bound at registration; replaces the object on the stack.
    pub bound_object: Option<usize>,
    /// Added to the object pointer before the call.
    pub base_offset: i32,
    pub takes_object_by_value: bool,
    pub has_auto_handles: bool,
}

impl SystemFunction {
    pub fn param_dwords(&self) -> usize {
        self.params.iter().map(|p| p.dwords()).sum()
    }

    pub fn is_method(&self) -> bool {
        matches!(
            self.convention,
            CallConvention::Thiscall
                | CallConvention::CdeclObjFirst
                | CallConvention::CdeclObjLast
                | CallConvention::Virtual
        )
    }
}

#[derive(Debug, Clone)]
pub enum FunctionKind {
    Script,
    System(SystemFunction),
    /// Interface method, resolved per object at call time.
    Interface,
    /// Bound import, resolved at call time.
    Imported,
}

/// A function known to the engine.
#[derive(Debug)]
pub struct ScriptFunction {
    pub id: FunctionId,
    pub name: String,
    pub kind: FunctionKind,
    pub bytecode: Vec<u32>,
    /// Dwords of arguments the caller pushed, including any object pointer.
    pub arg_dwords: u32,
    /// Dwords reserved for locals below the frame base.
    pub variable_space: u32,
    pub jit: JitSlot,
}

impl ScriptFunction {
    pub fn script(id: FunctionId, name: &str, bytecode: Vec<u32>) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: FunctionKind::Script,
            bytecode,
            arg_dwords: 0,
            variable_space: 0,
            jit: JitSlot::new(),
        }
    }

    pub fn system(id: FunctionId, name: &str, sys: SystemFunction) -> Self {
        Self {
            id,
            name: name.to_string(),
            arg_dwords: (sys.param_dwords() + if sys.is_method() { PTR_DWORDS } else { 0 })
                as u32,
            kind: FunctionKind::System(sys),
            bytecode: Vec::new(),
            variable_space: 0,
            jit: JitSlot::new(),
        }
    }

    pub fn as_system(&self) -> Option<&SystemFunction> {
        match &self.kind {
            FunctionKind::System(sys) => Some(sys),
            _ => None,
        }
    }

    /// Whether native code may be entered at the start of this function.
    pub fn starts_with_entry(&self) -> bool {
        self.bytecode
            .first()
            .is_some_and(|w| *w as u8 == super::bytecode::Opcode::JitEntry as u8)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Behaviours {
    pub construct: Option<FunctionId>,
    pub destruct: Option<FunctionId>,
    pub add_ref: Option<FunctionId>,
    pub release: Option<FunctionId>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectType {
    pub name: String,
    pub size: usize,
    /// Reference type (lifetime through add-ref/release).
    pub is_ref: bool,
    /// Declared in script; allocation needs the script object factory.
    pub is_script_object: bool,
    pub behaviours: Behaviours,
}
