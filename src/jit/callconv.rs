//! Calling-convention emitter.
//!
//! [`plan_call`] is a pure function from an ABI table, a convention and an
//! argument list to a placement plan; [`emit_call`] turns that plan into
//! machine code. [`SystemCall`] builds on both to bridge from the VM value
//! stack to a host function and back.

use crate::config::JitConfig;
use crate::vm::engine::RuntimeHooks;
use crate::vm::function::{CallConvention, FunctionId, ParamShape, ReturnShape, SystemFunction};
use crate::vm::registers::offsets;

use super::abi::{AbiTable, RegClass};
use super::x86::{Alu, Assembler, Cond, Mem, Mode, Precision, Reg, Rm, Width, Xmm};

/// Where an argument value comes from.
///
/// Sources must not live in argument registers, `rax` or `r11`; the
/// translator only hands in pinned registers, immediates and memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Imm(i64),
    Reg(Reg),
    Mem(Mem),
}

/// One argument of a native call, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    /// Integer or pointer, passed in an integer register when one is free.
    Int(Operand, Width),
    /// Float or double read from memory, passed in a vector register when
    /// one is free.
    Float(Mem, Precision),
    /// Bytes copied from memory straight onto the machine stack.
    Stack(Mem, u32),
    /// Address of a memory operand.
    AddressOf(Mem),
}

impl Arg {
    pub fn class(&self) -> RegClass {
        match self {
            Arg::Int(..) | Arg::AddressOf(_) => RegClass::Integer,
            Arg::Float(..) => RegClass::Float,
            Arg::Stack(..) => RegClass::Memory,
        }
    }

    /// Bytes the argument occupies when passed on the machine stack.
    pub fn stack_size(&self, slot: usize) -> usize {
        let bytes = match self {
            Arg::Int(_, width) => width.bytes(),
            Arg::Float(_, prec) => prec.bytes(),
            Arg::Stack(_, bytes) => *bytes as usize,
            Arg::AddressOf(_) => slot,
        };
        bytes.div_ceil(slot) * slot
    }
}

/// Calling conventions the emitter can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// Arguments on the stack, the caller pops them.
    CallerCleans,
    /// Arguments on the stack, the callee pops them.
    CalleeCleans,
    /// Implicit first argument in a register, the callee pops the rest.
    Member,
    /// The single register-based convention of a 64-bit target.
    Wide,
}

impl Convention {
    /// Convention to use for a host function on `abi`.
    pub fn for_system(conv: CallConvention, abi: &AbiTable) -> Self {
        let conv = match conv {
            CallConvention::Stdcall => Convention::CalleeCleans,
            CallConvention::Thiscall | CallConvention::Virtual => Convention::Member,
            _ => Convention::CallerCleans,
        };
        conv.resolve(abi)
    }

    /// 64-bit targets only know one convention.
    fn resolve(self, abi: &AbiTable) -> Self {
        match (abi.mode, self) {
            (Mode::Bits64, _) => Convention::Wide,
            (Mode::Bits32, Convention::Wide) => Convention::CallerCleans,
            (Mode::Bits32, conv) => conv,
        }
    }
}

/// Location assigned to one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    IntReg(Reg),
    FloatReg(Xmm),
    /// Offset from the stack pointer at the call instruction.
    Stack { offset: usize },
}

/// Who restores the stack pointer after the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// The caller adds this many bytes.
    Caller(usize),
    /// The callee pops its arguments; the caller still drops the padding.
    Callee { caller_pops: usize },
}

/// Result of [`plan_call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPlan {
    pub placements: Vec<Placement>,
    /// Bytes of arguments passed on the stack.
    pub stack_bytes: usize,
    /// Alignment padding reserved before the stack arguments.
    pub pad: usize,
    /// Home space reserved below the stack arguments.
    pub shadow: usize,
    pub cleanup: Cleanup,
}

/// Assign every argument a register or stack slot.
pub fn plan_call(abi: &AbiTable, conv: Convention, args: &[Arg]) -> CallPlan {
    let conv = conv.resolve(abi);
    let shadow = if conv == Convention::Wide { abi.shadow_space } else { 0 };
    let mut placements = Vec::with_capacity(args.len());
    let mut ints = 0;
    let mut floats = 0;
    let mut stack_bytes = 0;

    for (index, arg) in args.iter().enumerate() {
        let register = match (conv, arg.class()) {
            (Convention::Wide, RegClass::Integer) => {
                let n = if abi.positional_slots { index } else { ints };
                ints += 1;
                abi.int_args.get(n).map(|r| Placement::IntReg(*r))
            }
            (Convention::Wide, RegClass::Float) => {
                let n = if abi.positional_slots { index } else { floats };
                floats += 1;
                abi.float_args.get(n).map(|x| Placement::FloatReg(*x))
            }
            (Convention::Member, RegClass::Integer) if index == 0 => Some(Placement::IntReg(Reg::Rcx)),
            _ => None,
        };
        let placement = register.unwrap_or_else(|| {
            let placement = Placement::Stack {
                offset: shadow + stack_bytes,
            };
            stack_bytes += arg.stack_size(abi.ptr_size);
            placement
        });
        placements.push(placement);
    }

    let used = stack_bytes + shadow;
    let pad = (abi.stack_align - used % abi.stack_align) % abi.stack_align;
    let cleanup = match conv {
        Convention::CalleeCleans | Convention::Member => Cleanup::Callee { caller_pops: pad },
        _ => Cleanup::Caller(pad + used),
    };
    CallPlan {
        placements,
        stack_bytes,
        pad,
        shadow,
        cleanup,
    }
}

/// Destination of a call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Abs(usize),
    /// Address held in a register that no argument is loaded into.
    Reg(Reg),
}

/// Temporary used while pushing arguments.
fn push_scratch(abi: &AbiTable) -> Reg {
    match abi.mode {
        Mode::Bits64 => Reg::R11,
        Mode::Bits32 => Reg::Rcx,
    }
}

/// Stack-relative operands move as arguments are pushed.
fn rebase(mem: Mem, pushed: usize) -> Mem {
    if mem.base == Reg::Rsp {
        mem.offset(pushed as i32)
    } else {
        mem
    }
}

/// Marshal `args`, call `target` and restore the stack.
pub fn emit_call(
    asm: &mut Assembler,
    abi: &AbiTable,
    conv: Convention,
    target: CallTarget,
    args: &[Arg],
) -> CallPlan {
    let plan = plan_call(abi, conv, args);
    let ptr = abi.ptr_width();
    let mut pushed = 0;

    if plan.pad > 0 {
        asm.alu_ri(Alu::Sub, ptr, Reg::Rsp, plan.pad as i32);
        pushed += plan.pad;
    }
    // right to left, so the first stack argument ends up lowest
    for (arg, placement) in args.iter().zip(&plan.placements).rev() {
        if let Placement::Stack { .. } = placement {
            pushed += push_arg(asm, abi, arg, pushed);
        }
    }
    if plan.shadow > 0 {
        asm.alu_ri(Alu::Sub, ptr, Reg::Rsp, plan.shadow as i32);
        pushed += plan.shadow;
    }
    for (arg, placement) in args.iter().zip(&plan.placements) {
        match *placement {
            Placement::IntReg(reg) => load_int(asm, abi, arg, reg, pushed),
            Placement::FloatReg(xmm) => {
                if let Arg::Float(mem, prec) = *arg {
                    asm.movs_load(prec, xmm, rebase(mem, pushed));
                }
            }
            Placement::Stack { .. } => {}
        }
    }

    match target {
        CallTarget::Abs(addr) => asm.call_abs(addr),
        CallTarget::Reg(reg) => asm.call_r(reg),
    }

    let restore = match plan.cleanup {
        Cleanup::Caller(bytes) => bytes,
        Cleanup::Callee { caller_pops } => caller_pops,
    };
    if restore > 0 {
        asm.alu_ri(Alu::Add, ptr, Reg::Rsp, restore as i32);
    }
    plan
}

fn load_int(asm: &mut Assembler, abi: &AbiTable, arg: &Arg, reg: Reg, pushed: usize) {
    match *arg {
        Arg::Int(Operand::Imm(value), width) => {
            let width = if width == Width::Qword { Width::Qword } else { Width::Dword };
            asm.mov_ri(width, reg, value);
        }
        Arg::Int(Operand::Reg(src), width) => {
            if src != reg {
                let width = if width == Width::Qword { Width::Qword } else { abi.ptr_width() };
                asm.mov_rr(width, reg, src);
            }
        }
        Arg::Int(Operand::Mem(mem), width) => {
            let mem = rebase(mem, pushed);
            match width {
                Width::Byte | Width::Word => asm.movzx(reg, width, mem.into()),
                _ => asm.mov_rm(width, reg, mem),
            }
        }
        Arg::AddressOf(mem) => asm.lea(reg, rebase(mem, pushed)),
        Arg::Float(..) | Arg::Stack(..) => {
            debug_assert!(false, "{arg:?} planned into an integer register");
        }
    }
}

/// Push one argument; returns the bytes pushed.
fn push_arg(asm: &mut Assembler, abi: &AbiTable, arg: &Arg, pushed: usize) -> usize {
    let slot = abi.ptr_size;
    let tmp = push_scratch(abi);
    match *arg {
        Arg::Int(Operand::Imm(value), width) => {
            if slot == 4 && width == Width::Qword {
                asm.push_i32((value >> 32) as i32);
                asm.push_i32(value as i32);
            } else if value == value as i32 as i64 {
                asm.push_i32(value as i32);
            } else {
                asm.mov_ri(Width::Qword, tmp, value);
                asm.push(tmp);
            }
        }
        Arg::Int(Operand::Reg(reg), _) => asm.push(reg),
        Arg::Int(Operand::Mem(mem), width) => push_mem(asm, abi, mem, width.bytes(), pushed),
        Arg::Float(mem, prec) => push_mem(asm, abi, mem, prec.bytes(), pushed),
        Arg::Stack(mem, bytes) => push_mem(asm, abi, mem, bytes as usize, pushed),
        Arg::AddressOf(mem) => {
            asm.lea(tmp, rebase(mem, pushed));
            asm.push(tmp);
        }
    }
    arg.stack_size(slot)
}

/// Push `bytes` of memory in slot-sized chunks, highest chunk first.
fn push_mem(asm: &mut Assembler, abi: &AbiTable, mem: Mem, bytes: usize, pushed: usize) {
    let slot = abi.ptr_size;
    let tmp = push_scratch(abi);
    if bytes < slot && bytes != 4 || slot == 8 && bytes == 4 {
        // partial slot: widen through the scratch register
        let mem = rebase(mem, pushed);
        match bytes {
            1 => asm.movzx(tmp, Width::Byte, mem.into()),
            2 => asm.movzx(tmp, Width::Word, mem.into()),
            _ => asm.mov_rm(Width::Dword, tmp, mem),
        }
        asm.push(tmp);
        return;
    }
    let chunks = bytes.div_ceil(slot);
    for (n, chunk) in (0..chunks).rev().enumerate() {
        let src = mem.offset((chunk * slot) as i32);
        asm.push_m(rebase(src, pushed + n * slot));
    }
}

/// Reserved machine-stack slots in every generated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameSlot {
    /// Return pointer of an object returned by value.
    RetPointer = 0,
    /// Adjusted object pointer of a member call.
    Object = 1,
    Spare = 2,
}

impl FrameSlot {
    pub fn mem(self, abi: &AbiTable) -> Mem {
        Mem::new(Reg::Rsp, (self as usize * abi.ptr_size) as i32)
    }
}

/// Everything call glue needs to know about the surrounding function and
/// the instruction being translated.
#[derive(Clone, Copy)]
pub struct CallSite<'a> {
    pub abi: &'static AbiTable,
    pub hooks: &'a RuntimeHooks,
    pub config: &'a JitConfig,
    /// Shared early-return epilogue.
    pub ret_pos: usize,
    /// Offset of the calling instruction.
    pub offset: usize,
    pub next_offset: usize,
}

impl CallSite<'_> {
    fn field(&self, offset: i32) -> Mem {
        Mem::new(self.abi.pinned.registers, offset)
    }

    /// The owning context, first argument of every hook.
    pub fn ctx(&self) -> Arg {
        Arg::Int(Operand::Mem(self.field(offsets::CTX)), self.abi.ptr_width())
    }

    /// Return to the interpreter at `resume` (if `cond` holds).
    pub fn leave(&self, asm: &mut Assembler, cond: Option<Cond>, resume: usize) {
        asm.mov_ri(Width::Dword, self.abi.pinned.resume, resume as i64);
        asm.jump_to(cond, self.ret_pos);
    }

    /// Make program position and stack pointer visible to reentrant code.
    pub fn publish(&self, asm: &mut Assembler, position: usize) {
        let ptr = self.abi.ptr_width();
        asm.mov_mi(ptr, self.field(offsets::PROGRAM_POSITION), position as i32);
        asm.mov_mr(ptr, self.field(offsets::STACK_POINTER), self.abi.pinned.stack);
    }

    /// Call an `extern "C"` helper.
    pub fn call_hook(&self, asm: &mut Assembler, hook: usize, args: &[Arg]) {
        emit_call(asm, self.abi, Convention::CallerCleans, CallTarget::Abs(hook), args);
    }

    /// 32-bit code keeps only the low half of the value register in a
    /// machine register; a four byte write still clears the high half.
    pub fn clear_value_high(&self, asm: &mut Assembler) {
        if self.abi.mode == Mode::Bits32 {
            asm.mov_mi(Width::Dword, self.field(offsets::VALUE_REGISTER + 4), 0);
        }
    }

    /// After a call that may have raised an exception or asked to suspend,
    /// hand control back when the engine says so.
    pub fn exit_check(&self, asm: &mut Assembler) {
        if self.config.syscall_no_errors && self.config.no_suspend {
            return;
        }
        asm.test_mi8(self.field(offsets::DO_PROCESS_SUSPEND), 0xFF);
        let skip = asm.jcc_rel8(Cond::E);
        self.call_hook(asm, self.hooks.check_status as usize, &[self.ctx()]);
        asm.test_rr(Width::Byte, Reg::Rax, Reg::Rax);
        self.leave(asm, Some(Cond::Ne), self.next_offset);
        asm.bind(skip);
    }
}

/// Where the object of a member call comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectSource {
    /// Popped from the top of the value stack.
    Stack,
    /// Known when the code is generated.
    Fixed(usize),
    /// Already stored in [`FrameSlot::Object`].
    Slot,
}

/// Positions of a system call's operands on the VM value stack, as byte
/// offsets from the stack pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmArgLayout {
    pub object: Option<i32>,
    pub return_pointer: Option<i32>,
    pub params: Vec<i32>,
    /// Bytes to pop once the call returns.
    pub pop_bytes: i32,
}

/// Stack layout: object pointer (when taken from the stack), return
/// pointer (when returning an object by value), then the parameters in
/// declaration order.
pub fn vm_arg_layout(sys: &SystemFunction, object_on_stack: bool, ptr_size: usize) -> VmArgLayout {
    let ptr = ptr_size as i32;
    let mut at = 0;
    let object = object_on_stack.then(|| {
        at += ptr;
        0
    });
    let return_pointer = sys.returns.returns_on_stack().then(|| {
        let pos = at;
        at += ptr;
        pos
    });
    let mut params = Vec::with_capacity(sys.params.len());
    for param in &sys.params {
        params.push(at);
        at += param.dwords() as i32 * 4;
    }
    VmArgLayout {
        object,
        return_pointer,
        params,
        pop_bytes: at,
    }
}

/// Whether the emitter marshals `sys` itself rather than asking the engine.
pub fn marshals_natively(sys: &SystemFunction, abi: &AbiTable) -> bool {
    if matches!(sys.convention, CallConvention::Generic | CallConvention::Virtual)
        || sys.takes_object_by_value
        || sys.has_auto_handles
    {
        return false;
    }
    match sys.returns {
        ReturnShape::Object {
            size,
            in_memory,
            float_members,
        } => {
            in_memory
                || (size as usize <= abi.max_register_aggregate
                    && matches!(size, 4 | 8 | 12 | 16)
                    && !(float_members && abi.x87_float_return))
        }
        _ => true,
    }
}

/// Emits calls from generated code into host functions.
///
/// The caller decides when to run [`CallSite::exit_check`]; some
/// instructions have more work to do before control may leave.
pub struct SystemCall<'a> {
    site: CallSite<'a>,
}

impl<'a> SystemCall<'a> {
    pub fn new(site: CallSite<'a>) -> Self {
        Self { site }
    }

    pub fn emit(&self, asm: &mut Assembler, id: FunctionId, sys: &SystemFunction, object: ObjectSource) {
        if marshals_natively(sys, self.site.abi) {
            self.emit_native(asm, sys, object);
        } else {
            self.emit_via_engine(asm, id, sys, object);
        }
    }

    fn emit_native(&self, asm: &mut Assembler, sys: &SystemFunction, object: ObjectSource) {
        let site = &self.site;
        let abi = site.abi;
        let ptr = abi.ptr_width();
        let stack = abi.pinned.stack;
        let object = match sys.bound_object {
            Some(addr) => ObjectSource::Fixed(addr),
            None => object,
        };
        let method = sys.is_method();
        let layout = vm_arg_layout(sys, method && object == ObjectSource::Stack, abi.ptr_size);

        site.publish(asm, site.offset);

        let this = if method {
            Some(self.object_arg(asm, sys, object, &layout))
        } else {
            None
        };

        let mut args = Vec::with_capacity(sys.params.len() + 2);
        let member = sys.convention == CallConvention::Thiscall;
        if member && abi.this_before_return_pointer {
            args.extend(this);
        }
        if let Some(pos) = layout.return_pointer {
            asm.mov_rm(ptr, Reg::Rax, Mem::new(stack, pos));
            asm.mov_mr(ptr, FrameSlot::RetPointer.mem(abi), Reg::Rax);
            if let ReturnShape::Object { in_memory: true, .. } = sys.returns {
                args.push(Arg::Int(Operand::Mem(FrameSlot::RetPointer.mem(abi)), ptr));
            }
        }
        if sys.convention != CallConvention::CdeclObjLast && !(member && abi.this_before_return_pointer) {
            args.extend(this);
        }
        for (param, pos) in sys.params.iter().zip(&layout.params) {
            let mem = Mem::new(stack, *pos);
            args.push(match param {
                ParamShape::Int32 => Arg::Int(Operand::Mem(mem), Width::Dword),
                ParamShape::Int64 => Arg::Int(Operand::Mem(mem), Width::Qword),
                ParamShape::Float => Arg::Float(mem, Precision::Single),
                ParamShape::Double => Arg::Float(mem, Precision::Double),
                ParamShape::Pointer => Arg::Int(Operand::Mem(mem), ptr),
            });
        }
        if sys.convention == CallConvention::CdeclObjLast {
            args.extend(this);
        }

        let conv = Convention::for_system(sys.convention, abi);
        emit_call(asm, abi, conv, CallTarget::Abs(sys.address), &args);

        self.store_return(asm, sys.returns);
        if layout.pop_bytes > 0 {
            asm.alu_ri(Alu::Add, ptr, stack, layout.pop_bytes);
        }
    }

    /// Null-check the object, apply the base offset and park it in
    /// [`FrameSlot::Object`].
    fn object_arg(
        &self,
        asm: &mut Assembler,
        sys: &SystemFunction,
        object: ObjectSource,
        layout: &VmArgLayout,
    ) -> Arg {
        let abi = self.site.abi;
        let ptr = abi.ptr_width();
        let slot = FrameSlot::Object.mem(abi);
        match object {
            ObjectSource::Fixed(addr) => {
                let addr = (addr as i64).wrapping_add(sys.base_offset as i64);
                return Arg::Int(Operand::Imm(addr), ptr);
            }
            ObjectSource::Stack => {
                let pos = layout.object.unwrap_or(0);
                asm.mov_rm(ptr, Reg::Rax, Mem::new(abi.pinned.stack, pos));
            }
            ObjectSource::Slot => asm.mov_rm(ptr, Reg::Rax, slot),
        }
        asm.test_rr(ptr, Reg::Rax, Reg::Rax);
        self.site.leave(asm, Some(Cond::E), self.site.offset);
        if sys.base_offset != 0 {
            asm.alu_ri(Alu::Add, ptr, Reg::Rax, sys.base_offset);
        }
        asm.mov_mr(ptr, slot, Reg::Rax);
        Arg::Int(Operand::Mem(slot), ptr)
    }

    /// Move the host return value to where the VM expects it.
    fn store_return(&self, asm: &mut Assembler, returns: ReturnShape) {
        let site = &self.site;
        let abi = site.abi;
        let value = abi.pinned.value;
        let regs = abi.pinned.registers;
        let bits64 = abi.mode == Mode::Bits64;
        match returns {
            ReturnShape::Void => {}
            ReturnShape::Bool => {
                asm.movzx(value, Width::Byte, Reg::Rax.into());
                site.clear_value_high(asm);
            }
            ReturnShape::Int32 => {
                asm.mov_rr(Width::Dword, value, Reg::Rax);
                site.clear_value_high(asm);
            }
            ReturnShape::Int64 if bits64 => asm.mov_rr(Width::Qword, value, Reg::Rax),
            ReturnShape::Int64 => {
                asm.mov_rr(Width::Dword, value, Reg::Rax);
                asm.mov_mr(Width::Dword, Mem::new(regs, offsets::VALUE_REGISTER + 4), Reg::Rdx);
            }
            ReturnShape::Float if bits64 => {
                asm.movd_from_xmm(Width::Dword, Rm::Reg(value), abi.float_return[0]);
            }
            ReturnShape::Float => {
                let spare = FrameSlot::Spare.mem(abi);
                asm.fstp(Precision::Single, spare);
                asm.mov_rm(Width::Dword, value, spare);
                site.clear_value_high(asm);
            }
            ReturnShape::Double if bits64 => {
                asm.movd_from_xmm(Width::Qword, Rm::Reg(value), abi.float_return[0]);
            }
            ReturnShape::Double => {
                let tmp = FrameSlot::Object.mem(abi);
                asm.fstp(Precision::Double, tmp);
                asm.mov_rm(Width::Dword, value, tmp);
                asm.mov_rm(Width::Dword, Reg::Rax, tmp.offset(4));
                asm.mov_mr(Width::Dword, Mem::new(regs, offsets::VALUE_REGISTER + 4), Reg::Rax);
            }
            ReturnShape::Handle { add_ref } => {
                let ptr = abi.ptr_width();
                asm.mov_mr(ptr, Mem::new(regs, offsets::OBJECT_REGISTER), Reg::Rax);
                if let Some(add_ref) = add_ref {
                    asm.test_rr(ptr, Reg::Rax, Reg::Rax);
                    let null = asm.jcc_rel8(Cond::E);
                    site.call_hook(
                        asm,
                        site.hooks.call_object_method as usize,
                        &[
                            site.ctx(),
                            Arg::Int(Operand::Reg(Reg::Rax), ptr),
                            Arg::Int(Operand::Imm(add_ref as i64), Width::Dword),
                        ],
                    );
                    asm.bind(null);
                }
            }
            ReturnShape::Object {
                size,
                in_memory: false,
                float_members,
            } => {
                let ptr = abi.ptr_width();
                let dst = Mem::new(Reg::Rcx, 0);
                asm.mov_rm(ptr, Reg::Rcx, FrameSlot::RetPointer.mem(abi));
                if float_members {
                    let [lo, hi] = abi.float_return;
                    match size {
                        4 => asm.movs_store(Precision::Single, dst, lo),
                        8 => asm.movs_store(Precision::Double, dst, lo),
                        12 => {
                            asm.movs_store(Precision::Double, dst, lo);
                            asm.movs_store(Precision::Single, dst.offset(8), hi);
                        }
                        _ => {
                            asm.movs_store(Precision::Double, dst, lo);
                            asm.movs_store(Precision::Double, dst.offset(8), hi);
                        }
                    }
                } else {
                    let [lo, hi] = abi.int_return;
                    match (size, bits64) {
                        (4, _) => asm.mov_mr(Width::Dword, dst, lo),
                        (8, true) => asm.mov_mr(Width::Qword, dst, lo),
                        (8, false) => {
                            asm.mov_mr(Width::Dword, dst, lo);
                            asm.mov_mr(Width::Dword, dst.offset(4), hi);
                        }
                        (12, _) => {
                            asm.mov_mr(Width::Qword, dst, lo);
                            asm.mov_mr(Width::Dword, dst.offset(8), hi);
                        }
                        _ => {
                            asm.mov_mr(Width::Qword, dst, lo);
                            asm.mov_mr(Width::Qword, dst.offset(8), hi);
                        }
                    }
                }
            }
            // the callee wrote through the hidden pointer
            ReturnShape::Object { in_memory: true, .. } => {}
        }
    }

    /// Let the engine marshal a call the emitter does not handle.
    fn emit_via_engine(&self, asm: &mut Assembler, id: FunctionId, sys: &SystemFunction, object: ObjectSource) {
        let site = &self.site;
        let abi = site.abi;
        let ptr = abi.ptr_width();
        let object = match (sys.bound_object, object) {
            (Some(addr), _) | (None, ObjectSource::Fixed(addr)) => Operand::Imm(addr as i64),
            (None, ObjectSource::Slot) => Operand::Mem(FrameSlot::Object.mem(abi)),
            // the engine pops it itself
            (None, ObjectSource::Stack) => Operand::Imm(0),
        };

        site.publish(asm, site.offset);
        // the engine leaves the value register alone for void functions
        asm.mov_mr(
            ptr,
            Mem::new(abi.pinned.registers, offsets::VALUE_REGISTER),
            abi.pinned.value,
        );
        site.call_hook(
            asm,
            site.hooks.call_system_function as usize,
            &[
                site.ctx(),
                Arg::Int(Operand::Imm(id as i64), Width::Dword),
                Arg::Int(object, ptr),
            ],
        );
        // eax holds the bytes to pop
        if abi.mode == Mode::Bits64 {
            asm.movsxd(Reg::Rax, Reg::Rax.into());
        }
        asm.alu_rr(Alu::Add, ptr, abi.pinned.stack, Reg::Rax);
        asm.mov_rm(
            ptr,
            abi.pinned.value,
            Mem::new(abi.pinned.registers, offsets::VALUE_REGISTER),
        );
    }
}
