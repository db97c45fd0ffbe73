//! Per-target ABI tables.
//!
//! Everything the calling-convention emitter and the translator need to know
//! about a target is plain data here; there is no per-target code path
//! beyond looking up the right table.

use super::x86::{Mode, Reg, Width, Xmm};

/// Supported native targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// 32-bit x86 (cdecl / stdcall / thiscall).
    X86,
    /// x86-64 System V.
    X64SysV,
    /// x86-64 Microsoft.
    X64Win,
}

/// Class of a machine register or argument location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    Integer,
    Float,
    /// Passed on the machine stack.
    Memory,
}

/// How the native entry receives `(regs, entry)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryArgs {
    Registers(Reg, Reg),
    /// On the machine stack above the return address.
    Stack,
}

/// Registers the translator keeps pinned for the whole function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedRegs {
    /// Base of the VM register file.
    pub registers: Reg,
    pub frame: Reg,
    pub stack: Reg,
    /// Low (or only) half of the value register.
    pub value: Reg,
    /// Resume offset handed to the early-return epilogue.
    pub resume: Reg,
}

/// Pure-data description of a target ABI.
#[derive(Debug)]
pub struct AbiTable {
    pub name: &'static str,
    pub mode: Mode,
    pub ptr_size: usize,
    pub int_args: &'static [Reg],
    pub float_args: &'static [Xmm],
    /// Integer and float arguments share positional slots (Win64).
    pub positional_slots: bool,
    /// Home space the caller reserves below stack arguments.
    pub shadow_space: usize,
    pub stack_align: usize,
    pub int_return: [Reg; 2],
    pub float_return: [Xmm; 2],
    /// Float results come back on the x87 stack.
    pub x87_float_return: bool,
    /// Largest aggregate returned in registers.
    pub max_register_aggregate: usize,
    /// A member call's object comes before the hidden return pointer.
    pub this_before_return_pointer: bool,
    /// Callee-saved registers the generated prologue preserves, in push order.
    pub saved: &'static [Reg],
    /// Scratch bytes the prologue reserves so the body runs with the stack
    /// aligned to `stack_align`.
    pub reserve: usize,
    pub entry_args: EntryArgs,
    pub pinned: PinnedRegs,
}

static X86: AbiTable = AbiTable {
    name: "x86",
    mode: Mode::Bits32,
    ptr_size: 4,
    int_args: &[],
    float_args: &[],
    positional_slots: false,
    shadow_space: 0,
    stack_align: 16,
    int_return: [Reg::Rax, Reg::Rdx],
    float_return: [Xmm::XMM0, Xmm::XMM1],
    x87_float_return: true,
    max_register_aggregate: 8,
    this_before_return_pointer: true,
    saved: &[Reg::Rsi, Reg::Rdi, Reg::Rbx, Reg::Rbp],
    reserve: 12,
    entry_args: EntryArgs::Stack,
    pinned: PinnedRegs {
        registers: Reg::Rbp,
        frame: Reg::Rdi,
        stack: Reg::Rsi,
        value: Reg::Rbx,
        resume: Reg::Rdx,
    },
};

static X64_SYSV: AbiTable = AbiTable {
    name: "x86-64 System V",
    mode: Mode::Bits64,
    ptr_size: 8,
    int_args: &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9],
    float_args: &[
        Xmm::XMM0,
        Xmm::XMM1,
        Xmm::XMM2,
        Xmm::XMM3,
        Xmm::XMM4,
        Xmm::XMM5,
        Xmm::XMM6,
        Xmm::XMM7,
    ],
    positional_slots: false,
    shadow_space: 0,
    stack_align: 16,
    int_return: [Reg::Rax, Reg::Rdx],
    float_return: [Xmm::XMM0, Xmm::XMM1],
    x87_float_return: false,
    max_register_aggregate: 16,
    this_before_return_pointer: false,
    saved: &[Reg::R13, Reg::R12, Reg::Rbx, Reg::Rbp],
    reserve: 24,
    entry_args: EntryArgs::Registers(Reg::Rdi, Reg::Rsi),
    pinned: PinnedRegs {
        registers: Reg::Rbp,
        frame: Reg::R12,
        stack: Reg::R13,
        value: Reg::Rbx,
        resume: Reg::R10,
    },
};

static X64_WIN: AbiTable = AbiTable {
    name: "x86-64 Microsoft",
    mode: Mode::Bits64,
    ptr_size: 8,
    int_args: &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9],
    float_args: &[Xmm::XMM0, Xmm::XMM1, Xmm::XMM2, Xmm::XMM3],
    positional_slots: true,
    shadow_space: 32,
    stack_align: 16,
    int_return: [Reg::Rax, Reg::Rdx],
    float_return: [Xmm::XMM0, Xmm::XMM1],
    x87_float_return: false,
    max_register_aggregate: 8,
    this_before_return_pointer: true,
    saved: &[Reg::R13, Reg::R12, Reg::Rbx, Reg::Rbp],
    reserve: 24,
    entry_args: EntryArgs::Registers(Reg::Rcx, Reg::Rdx),
    pinned: PinnedRegs {
        registers: Reg::Rbp,
        frame: Reg::R12,
        stack: Reg::R13,
        value: Reg::Rbx,
        resume: Reg::R10,
    },
};

impl Target {
    /// The target generated code for this process must use.
    pub fn host() -> Option<Target> {
        if cfg!(all(target_arch = "x86_64", windows)) {
            Some(Target::X64Win)
        } else if cfg!(target_arch = "x86_64") {
            Some(Target::X64SysV)
        } else if cfg!(target_arch = "x86") {
            Some(Target::X86)
        } else {
            None
        }
    }

    pub fn abi(self) -> &'static AbiTable {
        match self {
            Target::X86 => &X86,
            Target::X64SysV => &X64_SYSV,
            Target::X64Win => &X64_WIN,
        }
    }

    pub fn mode(self) -> Mode {
        self.abi().mode
    }

    pub fn is_64bit(self) -> bool {
        self.mode() == Mode::Bits64
    }
}

impl AbiTable {
    pub fn ptr_width(&self) -> Width {
        match self.mode {
            Mode::Bits32 => Width::Dword,
            Mode::Bits64 => Width::Qword,
        }
    }

    /// Stack offset of the i-th entry argument right after the prologue,
    /// for targets that pass them on the stack.
    pub fn stack_entry_arg(&self, index: usize) -> i32 {
        let frame = self.saved.len() * self.ptr_size + self.reserve;
        // skip the return address
        (frame + self.ptr_size * (1 + index)) as i32
    }

    /// Bytes between the caller's aligned stack and the body's stack.
    pub fn frame_size(&self) -> usize {
        self.ptr_size + self.saved.len() * self.ptr_size + self.reserve
    }
}
