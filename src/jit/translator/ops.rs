//! Native renditions of individual instructions.
//!
//! `rax`, `rcx` and `rdx` are free for every instruction, as are `xmm0`
//! and `xmm1`. Between two instructions `rax` may still hold the stack top
//! or a variable; see [`ScratchCache`](super::ScratchCache).

use crate::error::JitResult;
use crate::jit::callconv::{Arg, FrameSlot, Operand};
use crate::jit::helpers;
use crate::jit::x86::{Alu, Assembler, Cond, Mem, Precision, Reg, Shift, SseOp, Unary, Width, Xmm};
use crate::vm::bytecode::{Instr, Opcode};
use crate::vm::engine::Engine;
use crate::vm::registers::offsets;

use super::{Frame, Scratch, Translator, push_size};

/// Write -1, 0 or 1 to the value register from the flags of an integer
/// compare. The flags survive.
pub(super) fn materialize_int_compare(asm: &mut Assembler, f: Frame, signed: bool) {
    asm.mov_ri(Width::Dword, f.value, 0);
    let equal = asm.jcc_rel8(Cond::E);
    asm.mov_ri(Width::Dword, f.value, 1);
    let greater = asm.jcc_rel8(if signed { Cond::G } else { Cond::A });
    asm.mov_ri(Width::Dword, f.value, -1);
    asm.bind(equal);
    asm.bind(greater);
}

/// Same for a float compare; unordered operands compare as greater.
fn materialize_float_compare(asm: &mut Assembler, f: Frame) {
    asm.mov_ri(Width::Dword, f.value, 1);
    let unordered = asm.jcc_rel8(Cond::P);
    let greater = asm.jcc_rel8(Cond::A);
    asm.mov_ri(Width::Dword, f.value, 0);
    let equal = asm.jcc_rel8(Cond::E);
    asm.mov_ri(Width::Dword, f.value, -1);
    asm.bind(unordered);
    asm.bind(greater);
    asm.bind(equal);
}

/// Load a single precision constant into `xmm`. Clobbers `eax`.
fn const_f32(asm: &mut Assembler, xmm: Xmm, value: f32) {
    asm.mov_ri(Width::Dword, Reg::Rax, value.to_bits() as i64);
    asm.movd_to_xmm(Width::Dword, xmm, Reg::Rax.into());
}

/// Load a double precision constant into `xmm`. Clobbers `rax`, or the
/// scratch frame slots on 32-bit targets.
pub(super) fn const_f64(asm: &mut Assembler, f: Frame, xmm: Xmm, bits: u64) {
    if f.bits64() {
        asm.mov_ri(Width::Qword, Reg::Rax, bits as i64);
        asm.movd_to_xmm(Width::Qword, xmm, Reg::Rax.into());
    } else {
        let tmp = Mem::new(Reg::Rsp, FrameSlot::Object as i32 * f.ptr_size);
        asm.mov_mi(Width::Dword, tmp, bits as u32 as i32);
        asm.mov_mi(Width::Dword, tmp.offset(4), (bits >> 32) as u32 as i32);
        asm.movs_load(Precision::Double, xmm, tmp);
    }
}

fn sse_op(op: Opcode) -> SseOp {
    match op {
        Opcode::SubF | Opcode::SubD | Opcode::SubIf => SseOp::Sub,
        Opcode::MulF | Opcode::MulD | Opcode::MulIf => SseOp::Mul,
        Opcode::DivF | Opcode::DivD => SseOp::Div,
        _ => SseOp::Add,
    }
}

fn alu_op(op: Opcode) -> Alu {
    match op {
        Opcode::SubI | Opcode::SubIi | Opcode::SubI64 => Alu::Sub,
        Opcode::BAnd | Opcode::BAnd64 => Alu::And,
        Opcode::BOr | Opcode::BOr64 => Alu::Or,
        Opcode::BXor | Opcode::BXor64 => Alu::Xor,
        _ => Alu::Add,
    }
}

fn shift_op(op: Opcode) -> Shift {
    match op {
        Opcode::BSrl | Opcode::BSrl64 => Shift::Shr,
        Opcode::BSra | Opcode::BSra64 => Shift::Sar,
        _ => Shift::Shl,
    }
}

/// Condition a branch or test instruction checks the value register for.
pub(super) fn value_cond(op: Opcode) -> Cond {
    match op {
        Opcode::Jz | Opcode::JLowZ | Opcode::Tz => Cond::E,
        Opcode::Jnz | Opcode::JLowNZ | Opcode::Tnz => Cond::Ne,
        Opcode::Js | Opcode::Ts => Cond::L,
        Opcode::Jns | Opcode::Tns => Cond::Ge,
        Opcode::Jp | Opcode::Tp => Cond::G,
        _ => Cond::Le,
    }
}

impl<'a, E: Engine + ?Sized> Translator<'a, E> {
    pub(super) fn emit_op(&mut self, instr: &Instr<'a>) -> JitResult<()> {
        use Opcode::*;
        match instr.op {
            JitEntry => self.entry_point(instr),
            PshC4 | PshV4 | PshG4 | TypeId | PshC8 | PshV8 | Psf | PshVPtr | PshRPtr | PshNull
            | FuncPtr | ObjType | Pga | Var | PshGPtr => self.emit_push(instr),
            PopPtr | SwapPtr | RdsPtr | ChkRef | ChkRefS | ChkNullS | AddSi | PopRPtr | GetObj
            | GetObjRef | GetRef => self.emit_stack_op(instr),
            Jmp | Jz | Jnz | Js | Jns | Jp | Jnp | JLowZ | JLowNZ => self.emit_branch(instr),
            Tz | Tnz | Ts | Tns | Tp | Tnp => self.emit_test(instr),
            Not | NegI | IncVi | DecVi | BNot | BAnd | BOr | BXor | AddI | SubI | MulI | BSll
            | BSrl | BSra | AddIi | SubIi | MulIi | IncI | DecI | IncI16 | DecI16 | IncI8
            | DecI8 | SbToI | SwToI | UbToI | UwToI | I64ToI | IToB | IToW | ClrHi => {
                self.emit_int(instr)
            }
            DivI | ModI | DivU | ModU => self.emit_div32(instr),
            CmpI | CmpU | CmpIi | CmpIu | CmpPtr | CmpF | CmpD | CmpIf => self.emit_compare(instr),
            AddF | SubF | MulF | DivF | AddD | SubD | MulD | DivD | AddIf | SubIf | MulIf
            | NegF | NegD | IncF | DecF | IncD | DecD | ModF | ModD => self.emit_float(instr),
            IToF | FToI | UToF | FToU | DToI | DToU | DToF | IToD | UToD | FToD | FToI64
            | DToI64 | FToU64 | DToU64 | I64ToF | U64ToF | I64ToD | U64ToD => self.emit_convert(instr),
            UToI64 | IToI64 | NegI64 | IncI64 | DecI64 | BNot64 | AddI64 | SubI64 | MulI64
            | BAnd64 | BOr64 | BXor64 | BSll64 | BSrl64 | BSra64 | CmpI64 | CmpU64 | DivI64
            | ModI64 | DivU64 | ModU64 => self.emit_int64(instr),
            SetV1 | SetV2 | SetV4 | SetV8 | ClrVPtr | CpyVtoV4 | CpyVtoV8 | CpyVtoR4 | CpyVtoR8
            | CpyVtoG4 | CpyRtoV4 | CpyRtoV8 | CpyGtoV4 | WrtV1 | WrtV2 | WrtV4 | WrtV8 | Rdr1
            | Rdr2 | Rdr4 | Rdr8 | Ldg | Ldv | LdGRdR4 | SetG4 | ChkNullV | LoadObj | StoreObj
            | LoadThisR | LoadRObjR | LoadVObjR => self.emit_move(instr),
            Copy => self.emit_copy(instr)?,
            JmpP => self.emit_switch(instr),
            Call | Ret | CallSys | CallIntf | CallBnd | Suspend | Alloc | Free | RefCpy | RefCpyV => {
                self.emit_call_op(instr)?
            }
            Str | Cast | CallPtr | AllocMem | SetListSize | PshListElmnt | SetListType | PowI
            | PowU | PowF | PowD | PowDi | PowI64 | PowU64 | Thiscall1 => self.fallback(instr),
        }
        Ok(())
    }

    fn entry_point(&mut self, instr: &Instr<'_>) {
        let here = self.buf.address();
        self.entries.set(instr.offset, here);
        self.emitting = true;
        self.cache.reset();
    }

    /// `rax` = stack top.
    pub(super) fn load_top(&mut self) {
        if !self.cache.holds(Scratch::StackTop) {
            let f = self.frame;
            self.asm().mov_rm(f.ptr, Reg::Rax, f.stack(0));
        }
    }

    /// `eax` = variable `n`.
    pub(super) fn load_var(&mut self, n: i16) {
        if !self.cache.holds(Scratch::Slot(n)) {
            let f = self.frame;
            self.asm().mov_rm(Width::Dword, Reg::Rax, f.var(n));
        }
    }

    /// Leave through `ret_pos` at this instruction when `reg` is null.
    pub(super) fn null_check(&mut self, instr: &Instr<'_>, reg: Reg, resume: usize) {
        let f = self.frame;
        let site = self.site(instr);
        let mut asm = self.asm();
        asm.test_rr(f.ptr, reg, reg);
        site.leave(&mut asm, Some(Cond::E), resume);
    }

    fn call_helper(&mut self, instr: &Instr<'_>, helper: usize, args: &[Arg]) {
        let site = self.site(instr);
        site.call_hook(&mut self.asm(), helper, args);
    }

    fn emit_push(&mut self, instr: &Instr<'_>) {
        use Opcode::*;
        let f = self.frame;
        let a0 = instr.a0();
        let size = push_size(instr.op, f.ptr_size).unwrap_or(f.ptr_size);
        let cached = self.cache.holds(Scratch::Slot(a0));
        let slot = self.push_slot(instr, size);
        let last = self.reserved == 0;
        let mut left = Scratch::Unknown;
        let mut asm = self.asm();
        match instr.op {
            PshC4 | TypeId => asm.mov_mi(Width::Dword, slot, instr.int()),
            PshV4 => {
                if !cached {
                    asm.mov_rm(Width::Dword, Reg::Rax, f.var(a0));
                }
                asm.mov_mr(Width::Dword, slot, Reg::Rax);
                left = Scratch::Slot(a0);
            }
            PshG4 => {
                asm.mov_rptr(Reg::Rax, instr.ptr());
                asm.mov_rm(Width::Dword, Reg::Rax, Mem::new(Reg::Rax, 0));
                asm.mov_mr(Width::Dword, slot, Reg::Rax);
            }
            PshC8 if f.bits64() => {
                asm.mov_ri(Width::Qword, Reg::Rax, instr.qword() as i64);
                asm.mov_mr(Width::Qword, slot, Reg::Rax);
            }
            PshC8 => {
                let value = instr.qword();
                asm.mov_mi(Width::Dword, slot, value as u32 as i32);
                asm.mov_mi(Width::Dword, slot.offset(4), (value >> 32) as u32 as i32);
            }
            PshV8 if f.bits64() => {
                asm.mov_rm(Width::Qword, Reg::Rax, f.var(a0));
                asm.mov_mr(Width::Qword, slot, Reg::Rax);
            }
            PshV8 => {
                for half in [0, 4] {
                    asm.mov_rm(Width::Dword, Reg::Rax, f.var(a0).offset(half));
                    asm.mov_mr(Width::Dword, slot.offset(half), Reg::Rax);
                }
            }
            Psf => {
                asm.lea(Reg::Rax, f.var(a0));
                asm.mov_mr(f.ptr, slot, Reg::Rax);
                left = Scratch::StackTop;
            }
            PshVPtr => {
                asm.mov_rm(f.ptr, Reg::Rax, f.var(a0));
                asm.mov_mr(f.ptr, slot, Reg::Rax);
                left = Scratch::StackTop;
            }
            PshRPtr => asm.mov_mr(f.ptr, slot, f.value),
            PshNull => {
                asm.alu_rr(Alu::Xor, Width::Dword, Reg::Rax, Reg::Rax);
                asm.mov_mr(f.ptr, slot, Reg::Rax);
                left = Scratch::StackTop;
            }
            FuncPtr | ObjType | Pga => {
                asm.mov_rptr(Reg::Rax, instr.ptr());
                asm.mov_mr(f.ptr, slot, Reg::Rax);
                left = Scratch::StackTop;
            }
            PshGPtr => {
                asm.mov_rptr(Reg::Rax, instr.ptr());
                asm.mov_rm(f.ptr, Reg::Rax, Mem::new(Reg::Rax, 0));
                asm.mov_mr(f.ptr, slot, Reg::Rax);
                left = Scratch::StackTop;
            }
            Var => asm.mov_mi(f.ptr, slot, a0 as i32),
            _ => {}
        }
        // the top is only the top once the batch is complete
        if left != Scratch::StackTop || last {
            self.cache.leave(left);
        }
    }

    fn emit_stack_op(&mut self, instr: &Instr<'_>) {
        use Opcode::*;
        let f = self.frame;
        let a0 = instr.a0();
        let ptr_size = f.ptr_size;
        match instr.op {
            PopPtr => self.asm().alu_ri(Alu::Add, f.ptr, f.sp, ptr_size),
            SwapPtr => {
                self.load_top();
                let mut asm = self.asm();
                asm.mov_rm(f.ptr, Reg::Rcx, f.stack(ptr_size));
                asm.mov_mr(f.ptr, f.stack(ptr_size), Reg::Rax);
                asm.mov_mr(f.ptr, f.stack(0), Reg::Rcx);
                asm.mov_rr(f.ptr, Reg::Rax, Reg::Rcx);
                self.cache.leave(Scratch::StackTop);
            }
            RdsPtr => {
                self.load_top();
                self.null_check(instr, Reg::Rax, instr.offset);
                let mut asm = self.asm();
                asm.mov_rm(f.ptr, Reg::Rax, Mem::new(Reg::Rax, 0));
                asm.mov_mr(f.ptr, f.stack(0), Reg::Rax);
                self.cache.leave(Scratch::StackTop);
            }
            ChkRef => {
                self.load_top();
                self.null_check(instr, Reg::Rax, instr.offset);
                self.cache.leave(Scratch::StackTop);
            }
            ChkRefS => {
                self.load_top();
                self.asm().mov_rm(f.ptr, Reg::Rcx, Mem::new(Reg::Rax, 0));
                self.null_check(instr, Reg::Rcx, instr.offset);
                self.cache.leave(Scratch::StackTop);
            }
            ChkNullS if a0 == 0 => {
                self.load_top();
                self.null_check(instr, Reg::Rax, instr.offset);
                self.cache.leave(Scratch::StackTop);
            }
            ChkNullS => {
                let site = self.site(instr);
                let mut asm = self.asm();
                asm.alu_mi(Alu::Cmp, f.ptr, f.stack(a0 as i32 * 4), 0);
                site.leave(&mut asm, Some(Cond::E), instr.offset);
            }
            AddSi => {
                self.load_top();
                self.null_check(instr, Reg::Rax, instr.offset);
                let mut asm = self.asm();
                asm.alu_ri(Alu::Add, f.ptr, Reg::Rax, a0 as i32);
                asm.mov_mr(f.ptr, f.stack(0), Reg::Rax);
                self.cache.leave(Scratch::StackTop);
            }
            PopRPtr => {
                let site = self.site(instr);
                let mut asm = self.asm();
                asm.mov_rm(f.ptr, f.value, f.stack(0));
                asm.alu_ri(Alu::Add, f.ptr, f.sp, ptr_size);
                site.clear_value_high(&mut asm);
            }
            GetObj | GetObjRef | GetRef => {
                // the slot holds a variable index; replace it with the
                // variable's content or address
                let slot = f.stack(a0 as i32 * 4);
                let var = Mem::indexed(f.fp, Reg::Rax, 4, 0);
                let mut asm = self.asm();
                asm.mov_rm(f.ptr, Reg::Rax, slot);
                asm.unary(Unary::Neg, f.ptr, Reg::Rax.into());
                if instr.op == GetRef {
                    asm.lea(Reg::Rcx, var);
                } else {
                    asm.mov_rm(f.ptr, Reg::Rcx, var);
                }
                asm.mov_mr(f.ptr, slot, Reg::Rcx);
                if instr.op == GetObj {
                    asm.mov_mi(f.ptr, var, 0);
                }
            }
            _ => {}
        }
    }

    fn emit_branch(&mut self, instr: &Instr<'_>) {
        let f = self.frame;
        let target = instr.branch_target();
        let cond = match instr.op {
            Opcode::Jmp => None,
            Opcode::JLowZ | Opcode::JLowNZ => {
                self.asm().test_rr(Width::Byte, f.value, f.value);
                Some(value_cond(instr.op))
            }
            op => {
                self.asm().test_rr(Width::Dword, f.value, f.value);
                Some(value_cond(op))
            }
        };
        self.emit_jump(cond, target, instr);
    }

    fn emit_test(&mut self, instr: &Instr<'_>) {
        let f = self.frame;
        let site = self.site(instr);
        let mut asm = self.asm();
        asm.test_rr(Width::Dword, f.value, f.value);
        asm.setcc(value_cond(instr.op), f.value);
        asm.movzx(f.value, Width::Byte, f.value.into());
        site.clear_value_high(&mut asm);
    }

    fn emit_int(&mut self, instr: &Instr<'_>) {
        use Opcode::*;
        let f = self.frame;
        let (a0, a1, a2) = (instr.a0(), instr.a1(), instr.a2());
        let value = Mem::new(f.value, 0);
        match instr.op {
            Not => {
                if !self.cache.holds(Scratch::Slot(a0)) {
                    self.asm().mov_rm(Width::Byte, Reg::Rax, f.var(a0));
                }
                let mut asm = self.asm();
                asm.test_rr(Width::Byte, Reg::Rax, Reg::Rax);
                asm.setcc(Cond::E, Reg::Rax);
                asm.movzx(Reg::Rax, Width::Byte, Reg::Rax.into());
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            NegI => self.asm().unary(Unary::Neg, Width::Dword, f.var(a0).into()),
            BNot => self.asm().unary(Unary::Not, Width::Dword, f.var(a0).into()),
            IncVi => self.asm().inc(Width::Dword, f.var(a0).into()),
            DecVi => self.asm().dec(Width::Dword, f.var(a0).into()),
            IncI => self.asm().inc(Width::Dword, value.into()),
            DecI => self.asm().dec(Width::Dword, value.into()),
            IncI16 => self.asm().inc(Width::Word, value.into()),
            DecI16 => self.asm().dec(Width::Word, value.into()),
            IncI8 => self.asm().inc(Width::Byte, value.into()),
            DecI8 => self.asm().dec(Width::Byte, value.into()),
            BAnd | BOr | BXor | AddI | SubI => {
                self.load_var(a1);
                let mut asm = self.asm();
                asm.alu_rm(alu_op(instr.op), Width::Dword, Reg::Rax, f.var(a2));
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            MulI => {
                self.load_var(a1);
                let mut asm = self.asm();
                asm.imul_rr(Width::Dword, Reg::Rax, f.var(a2).into());
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            BSll | BSrl | BSra => {
                self.asm().mov_rm(Width::Dword, Reg::Rcx, f.var(a2));
                self.load_var(a1);
                let mut asm = self.asm();
                asm.shift_cl(shift_op(instr.op), Width::Dword, Reg::Rax.into());
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            AddIi | SubIi => {
                self.load_var(a1);
                let mut asm = self.asm();
                asm.alu_ri(alu_op(instr.op), Width::Dword, Reg::Rax, instr.int());
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            MulIi => {
                let mut asm = self.asm();
                asm.imul_rri(Width::Dword, Reg::Rax, f.var(a1).into(), instr.int());
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            SbToI | SwToI | UbToI | UwToI => {
                let mut asm = self.asm();
                match instr.op {
                    SbToI => asm.movsx(Reg::Rax, Width::Byte, f.var(a0).into()),
                    SwToI => asm.movsx(Reg::Rax, Width::Word, f.var(a0).into()),
                    UbToI => asm.movzx(Reg::Rax, Width::Byte, f.var(a0).into()),
                    _ => asm.movzx(Reg::Rax, Width::Word, f.var(a0).into()),
                }
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            I64ToI => {
                self.load_var(a1);
                self.asm().mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            // narrowing in place leaves the low bytes as they are
            IToB | IToW => {}
            ClrHi => {
                let site = self.site(instr);
                let mut asm = self.asm();
                asm.movzx(f.value, Width::Byte, f.value.into());
                site.clear_value_high(&mut asm);
            }
            _ => {}
        }
    }

    /// 32-bit division. A zero divisor or `MIN / -1` goes back to the
    /// interpreter, which raises the exception.
    fn emit_div32(&mut self, instr: &Instr<'_>) {
        let f = self.frame;
        let (a0, a1, a2) = (instr.a0(), instr.a1(), instr.a2());
        let signed = matches!(instr.op, Opcode::DivI | Opcode::ModI);
        let site = self.site(instr);
        let mut asm = self.asm();
        asm.mov_rm(Width::Dword, Reg::Rcx, f.var(a2));
        asm.test_rr(Width::Dword, Reg::Rcx, Reg::Rcx);
        site.leave(&mut asm, Some(Cond::E), instr.offset);
        asm.mov_rm(Width::Dword, Reg::Rax, f.var(a1));
        if signed {
            asm.alu_ri(Alu::Cmp, Width::Dword, Reg::Rcx, -1);
            let fine = asm.jcc_rel8(Cond::Ne);
            asm.alu_ri(Alu::Cmp, Width::Dword, Reg::Rax, i32::MIN);
            site.leave(&mut asm, Some(Cond::E), instr.offset);
            asm.bind(fine);
            asm.cdq();
            asm.unary(Unary::Idiv, Width::Dword, Reg::Rcx.into());
        } else {
            asm.alu_rr(Alu::Xor, Width::Dword, Reg::Rdx, Reg::Rdx);
            asm.unary(Unary::Div, Width::Dword, Reg::Rcx.into());
        }
        let result = match instr.op {
            Opcode::DivI | Opcode::DivU => Reg::Rax,
            _ => Reg::Rdx,
        };
        asm.mov_mr(Width::Dword, f.var(a0), result);
        if result == Reg::Rax {
            self.cache.leave(Scratch::Slot(a0));
        }
    }

    fn emit_compare(&mut self, instr: &Instr<'_>) {
        use Opcode::*;
        let f = self.frame;
        let (a0, a1) = (instr.a0(), instr.a1());
        let site = self.site(instr);
        match instr.op {
            CmpI | CmpU | CmpIi | CmpIu => {
                self.load_var(a0);
                let mut asm = self.asm();
                match instr.op {
                    CmpI | CmpU => asm.alu_rm(Alu::Cmp, Width::Dword, Reg::Rax, f.var(a1)),
                    _ => asm.alu_ri(Alu::Cmp, Width::Dword, Reg::Rax, instr.int()),
                }
                materialize_int_compare(&mut asm, f, matches!(instr.op, CmpI | CmpIi));
                site.clear_value_high(&mut asm);
                self.cache.leave(Scratch::Slot(a0));
            }
            CmpPtr => {
                let mut asm = self.asm();
                asm.mov_rm(f.ptr, Reg::Rax, f.var(a0));
                asm.alu_rm(Alu::Cmp, f.ptr, Reg::Rax, f.var(a1));
                materialize_int_compare(&mut asm, f, false);
                site.clear_value_high(&mut asm);
            }
            CmpF | CmpD => {
                let prec = if instr.op == CmpF { Precision::Single } else { Precision::Double };
                let mut asm = self.asm();
                asm.movs_load(prec, Xmm::XMM0, f.var(a0));
                asm.ucomis(prec, Xmm::XMM0, f.var(a1).into());
                materialize_float_compare(&mut asm, f);
                site.clear_value_high(&mut asm);
            }
            CmpIf => {
                let mut asm = self.asm();
                asm.movs_load(Precision::Single, Xmm::XMM0, f.var(a0));
                const_f32(&mut asm, Xmm::XMM1, instr.float());
                asm.ucomis(Precision::Single, Xmm::XMM0, Xmm::XMM1.into());
                materialize_float_compare(&mut asm, f);
                site.clear_value_high(&mut asm);
            }
            _ => {}
        }
    }

    fn emit_float(&mut self, instr: &Instr<'_>) {
        use Opcode::*;
        let f = self.frame;
        let (a0, a1, a2) = (instr.a0(), instr.a1(), instr.a2());
        let value = Mem::new(f.value, 0);
        match instr.op {
            AddF | SubF | MulF | DivF | AddD | SubD | MulD | DivD => {
                let prec = match instr.op {
                    AddF | SubF | MulF | DivF => Precision::Single,
                    _ => Precision::Double,
                };
                let mut asm = self.asm();
                asm.movs_load(prec, Xmm::XMM0, f.var(a1));
                asm.sse_arith(sse_op(instr.op), prec, Xmm::XMM0, f.var(a2).into());
                asm.movs_store(prec, f.var(a0), Xmm::XMM0);
            }
            AddIf | SubIf | MulIf => {
                let mut asm = self.asm();
                asm.movs_load(Precision::Single, Xmm::XMM0, f.var(a1));
                const_f32(&mut asm, Xmm::XMM1, instr.float());
                asm.sse_arith(sse_op(instr.op), Precision::Single, Xmm::XMM0, Xmm::XMM1.into());
                asm.movs_store(Precision::Single, f.var(a0), Xmm::XMM0);
            }
            NegF => self.asm().alu_mi(Alu::Xor, Width::Dword, f.var(a0), i32::MIN),
            NegD => self.asm().alu_mi(Alu::Xor, Width::Dword, f.var(a0).offset(4), i32::MIN),
            IncF | DecF => {
                let op = if instr.op == IncF { SseOp::Add } else { SseOp::Sub };
                let mut asm = self.asm();
                asm.movs_load(Precision::Single, Xmm::XMM0, value);
                const_f32(&mut asm, Xmm::XMM1, 1.0);
                asm.sse_arith(op, Precision::Single, Xmm::XMM0, Xmm::XMM1.into());
                asm.movs_store(Precision::Single, value, Xmm::XMM0);
            }
            IncD | DecD => {
                let op = if instr.op == IncD { SseOp::Add } else { SseOp::Sub };
                let mut asm = self.asm();
                asm.movs_load(Precision::Double, Xmm::XMM0, value);
                const_f64(&mut asm, f, Xmm::XMM1, 1.0f64.to_bits());
                asm.sse_arith(op, Precision::Double, Xmm::XMM0, Xmm::XMM1.into());
                asm.movs_store(Precision::Double, value, Xmm::XMM0);
            }
            ModF | ModD => {
                let helper = if instr.op == ModF {
                    helpers::rem_f32 as *const () as usize
                } else {
                    helpers::rem_f64 as *const () as usize
                };
                let args = [
                    Arg::AddressOf(f.var(a0)),
                    Arg::AddressOf(f.var(a1)),
                    Arg::AddressOf(f.var(a2)),
                ];
                self.call_helper(instr, helper, &args);
            }
            _ => {}
        }
    }

    fn emit_convert(&mut self, instr: &Instr<'_>) {
        use Opcode::*;
        let f = self.frame;
        let (a0, a1) = (instr.a0(), instr.a1());
        let by_sse = |asm: &mut Assembler| match instr.op {
            IToF => {
                asm.cvtsi2s(Precision::Single, Width::Dword, Xmm::XMM0, f.var(a0).into());
                asm.movs_store(Precision::Single, f.var(a0), Xmm::XMM0);
            }
            IToD => {
                asm.cvtsi2s(Precision::Double, Width::Dword, Xmm::XMM0, f.var(a1).into());
                asm.movs_store(Precision::Double, f.var(a0), Xmm::XMM0);
            }
            FToD => {
                asm.cvt_precision(Precision::Single, Xmm::XMM0, f.var(a1).into());
                asm.movs_store(Precision::Double, f.var(a0), Xmm::XMM0);
            }
            _ => {
                asm.cvt_precision(Precision::Double, Xmm::XMM0, f.var(a1).into());
                asm.movs_store(Precision::Single, f.var(a0), Xmm::XMM0);
            }
        };
        // (helper, destination, source)
        let (helper, dst, src) = match instr.op {
            IToF | IToD | FToD | DToF => {
                by_sse(&mut self.asm());
                return;
            }
            FToI => (helpers::f32_to_i32 as *const () as usize, a0, a0),
            FToU => (helpers::f32_to_u32 as *const () as usize, a0, a0),
            UToF => (helpers::u32_to_f32 as *const () as usize, a0, a0),
            DToI => (helpers::f64_to_i32 as *const () as usize, a0, a1),
            DToU => (helpers::f64_to_u32 as *const () as usize, a0, a1),
            UToD => (helpers::u32_to_f64 as *const () as usize, a0, a1),
            FToI64 => (helpers::f32_to_i64 as *const () as usize, a0, a1),
            FToU64 => (helpers::f32_to_u64 as *const () as usize, a0, a1),
            DToI64 => (helpers::f64_to_i64 as *const () as usize, a0, a0),
            DToU64 => (helpers::f64_to_u64 as *const () as usize, a0, a0),
            I64ToF => (helpers::i64_to_f32 as *const () as usize, a0, a1),
            U64ToF => (helpers::u64_to_f32 as *const () as usize, a0, a1),
            I64ToD => (helpers::i64_to_f64 as *const () as usize, a0, a0),
            _ => (helpers::u64_to_f64 as *const () as usize, a0, a0),
        };
        let args = [Arg::AddressOf(f.var(dst)), Arg::AddressOf(f.var(src))];
        self.call_helper(instr, helper, &args);
    }

    fn emit_int64(&mut self, instr: &Instr<'_>) {
        use Opcode::*;
        let f = self.frame;
        let (a0, a1, a2) = (instr.a0(), instr.a1(), instr.a2());
        if !f.bits64() {
            // 32-bit targets only widen
            let mut asm = self.asm();
            match instr.op {
                UToI64 => {
                    asm.mov_rm(Width::Dword, Reg::Rax, f.var(a1));
                    asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                    asm.mov_mi(Width::Dword, f.var(a0).offset(4), 0);
                }
                IToI64 => {
                    asm.mov_rm(Width::Dword, Reg::Rax, f.var(a1));
                    asm.cdq();
                    asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                    asm.mov_mr(Width::Dword, f.var(a0).offset(4), Reg::Rdx);
                }
                _ => {
                    drop(asm);
                    self.fallback(instr);
                }
            }
            return;
        }
        let value = Mem::new(f.value, 0);
        match instr.op {
            UToI64 => {
                let mut asm = self.asm();
                asm.mov_rm(Width::Dword, Reg::Rax, f.var(a1));
                asm.mov_mr(Width::Qword, f.var(a0), Reg::Rax);
            }
            IToI64 => {
                let mut asm = self.asm();
                asm.movsxd(Reg::Rax, f.var(a1).into());
                asm.mov_mr(Width::Qword, f.var(a0), Reg::Rax);
            }
            NegI64 => self.asm().unary(Unary::Neg, Width::Qword, f.var(a0).into()),
            BNot64 => self.asm().unary(Unary::Not, Width::Qword, f.var(a0).into()),
            IncI64 => self.asm().inc(Width::Qword, value.into()),
            DecI64 => self.asm().dec(Width::Qword, value.into()),
            AddI64 | SubI64 | BAnd64 | BOr64 | BXor64 | MulI64 => {
                let mut asm = self.asm();
                asm.mov_rm(Width::Qword, Reg::Rax, f.var(a1));
                if instr.op == MulI64 {
                    asm.imul_rr(Width::Qword, Reg::Rax, f.var(a2).into());
                } else {
                    asm.alu_rm(alu_op(instr.op), Width::Qword, Reg::Rax, f.var(a2));
                }
                asm.mov_mr(Width::Qword, f.var(a0), Reg::Rax);
            }
            BSll64 | BSrl64 | BSra64 => {
                let mut asm = self.asm();
                asm.mov_rm(Width::Dword, Reg::Rcx, f.var(a2));
                asm.mov_rm(Width::Qword, Reg::Rax, f.var(a1));
                asm.shift_cl(shift_op(instr.op), Width::Qword, Reg::Rax.into());
                asm.mov_mr(Width::Qword, f.var(a0), Reg::Rax);
            }
            CmpI64 | CmpU64 => {
                let mut asm = self.asm();
                asm.mov_rm(Width::Qword, Reg::Rax, f.var(a0));
                asm.alu_rm(Alu::Cmp, Width::Qword, Reg::Rax, f.var(a1));
                materialize_int_compare(&mut asm, f, instr.op == CmpI64);
            }
            DivI64 | ModI64 | DivU64 | ModU64 => {
                let signed = matches!(instr.op, DivI64 | ModI64);
                let site = self.site(instr);
                let mut asm = self.asm();
                asm.mov_rm(Width::Qword, Reg::Rcx, f.var(a2));
                asm.test_rr(Width::Qword, Reg::Rcx, Reg::Rcx);
                site.leave(&mut asm, Some(Cond::E), instr.offset);
                asm.mov_rm(Width::Qword, Reg::Rax, f.var(a1));
                if signed {
                    asm.alu_ri(Alu::Cmp, Width::Qword, Reg::Rcx, -1);
                    let fine = asm.jcc_rel8(Cond::Ne);
                    asm.mov_ri(Width::Qword, Reg::Rdx, i64::MIN);
                    asm.alu_rr(Alu::Cmp, Width::Qword, Reg::Rax, Reg::Rdx);
                    site.leave(&mut asm, Some(Cond::E), instr.offset);
                    asm.bind(fine);
                    asm.cqo();
                    asm.unary(Unary::Idiv, Width::Qword, Reg::Rcx.into());
                } else {
                    asm.alu_rr(Alu::Xor, Width::Dword, Reg::Rdx, Reg::Rdx);
                    asm.unary(Unary::Div, Width::Qword, Reg::Rcx.into());
                }
                let result = if matches!(instr.op, DivI64 | DivU64) { Reg::Rax } else { Reg::Rdx };
                asm.mov_mr(Width::Qword, f.var(a0), result);
            }
            _ => {}
        }
    }

    fn emit_move(&mut self, instr: &Instr<'_>) {
        use Opcode::*;
        let f = self.frame;
        let (a0, a1) = (instr.a0(), instr.a1());
        let site = self.site(instr);
        let value = Mem::new(f.value, 0);
        let high = f.field(offsets::VALUE_REGISTER + 4);
        match instr.op {
            SetV1 => self.asm().mov_mi(Width::Byte, f.var(a0), instr.int()),
            SetV2 => self.asm().mov_mi(Width::Word, f.var(a0), instr.int()),
            SetV4 => self.asm().mov_mi(Width::Dword, f.var(a0), instr.int()),
            SetV8 => {
                let bits = instr.qword();
                let mut asm = self.asm();
                asm.mov_mi(Width::Dword, f.var(a0), bits as u32 as i32);
                asm.mov_mi(Width::Dword, f.var(a0).offset(4), (bits >> 32) as u32 as i32);
            }
            ClrVPtr => self.asm().mov_mi(f.ptr, f.var(a0), 0),
            CpyVtoV4 => {
                self.load_var(a1);
                self.asm().mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            CpyVtoV8 if f.bits64() => {
                let mut asm = self.asm();
                asm.mov_rm(Width::Qword, Reg::Rax, f.var(a1));
                asm.mov_mr(Width::Qword, f.var(a0), Reg::Rax);
            }
            CpyVtoV8 => {
                let mut asm = self.asm();
                asm.mov_rm(Width::Dword, Reg::Rax, f.var(a1));
                asm.mov_rm(Width::Dword, Reg::Rcx, f.var(a1).offset(4));
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                asm.mov_mr(Width::Dword, f.var(a0).offset(4), Reg::Rcx);
            }
            CpyVtoR4 => {
                let cached = self.cache.holds(Scratch::Slot(a0));
                let mut asm = self.asm();
                if cached {
                    asm.mov_rr(Width::Dword, f.value, Reg::Rax);
                } else {
                    asm.mov_rm(Width::Dword, f.value, f.var(a0));
                }
                site.clear_value_high(&mut asm);
            }
            CpyVtoR8 if f.bits64() => self.asm().mov_rm(Width::Qword, f.value, f.var(a0)),
            CpyVtoR8 => {
                let mut asm = self.asm();
                asm.mov_rm(Width::Dword, f.value, f.var(a0));
                asm.mov_rm(Width::Dword, Reg::Rax, f.var(a0).offset(4));
                asm.mov_mr(Width::Dword, high, Reg::Rax);
            }
            CpyVtoG4 => {
                self.load_var(a0);
                let mut asm = self.asm();
                asm.mov_rptr(Reg::Rcx, instr.ptr());
                asm.mov_mr(Width::Dword, Mem::new(Reg::Rcx, 0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            CpyRtoV4 => self.asm().mov_mr(Width::Dword, f.var(a0), f.value),
            CpyRtoV8 if f.bits64() => self.asm().mov_mr(Width::Qword, f.var(a0), f.value),
            CpyRtoV8 => {
                let mut asm = self.asm();
                asm.mov_mr(Width::Dword, f.var(a0), f.value);
                asm.mov_rm(Width::Dword, Reg::Rax, high);
                asm.mov_mr(Width::Dword, f.var(a0).offset(4), Reg::Rax);
            }
            CpyGtoV4 => {
                let mut asm = self.asm();
                asm.mov_rptr(Reg::Rcx, instr.ptr());
                asm.mov_rm(Width::Dword, Reg::Rax, Mem::new(Reg::Rcx, 0));
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            WrtV1 | WrtV2 | WrtV4 => {
                let width = match instr.op {
                    WrtV1 => Width::Byte,
                    WrtV2 => Width::Word,
                    _ => Width::Dword,
                };
                self.load_var(a0);
                self.asm().mov_mr(width, value, Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            WrtV8 if f.bits64() => {
                let mut asm = self.asm();
                asm.mov_rm(Width::Qword, Reg::Rax, f.var(a0));
                asm.mov_mr(Width::Qword, value, Reg::Rax);
            }
            WrtV8 => {
                let mut asm = self.asm();
                for half in [0, 4] {
                    asm.mov_rm(Width::Dword, Reg::Rax, f.var(a0).offset(half));
                    asm.mov_mr(Width::Dword, value.offset(half), Reg::Rax);
                }
            }
            Rdr1 | Rdr2 | Rdr4 => {
                let mut asm = self.asm();
                match instr.op {
                    Rdr1 => asm.movzx(Reg::Rax, Width::Byte, value.into()),
                    Rdr2 => asm.movzx(Reg::Rax, Width::Word, value.into()),
                    _ => asm.mov_rm(Width::Dword, Reg::Rax, value),
                }
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
            }
            Rdr8 if f.bits64() => {
                let mut asm = self.asm();
                asm.mov_rm(Width::Qword, Reg::Rax, value);
                asm.mov_mr(Width::Qword, f.var(a0), Reg::Rax);
            }
            Rdr8 => {
                let mut asm = self.asm();
                for half in [0, 4] {
                    asm.mov_rm(Width::Dword, Reg::Rax, value.offset(half));
                    asm.mov_mr(Width::Dword, f.var(a0).offset(half), Reg::Rax);
                }
            }
            Ldg => {
                let mut asm = self.asm();
                asm.mov_rptr(f.value, instr.ptr());
                site.clear_value_high(&mut asm);
            }
            Ldv => {
                let mut asm = self.asm();
                asm.lea(f.value, f.var(a0));
                site.clear_value_high(&mut asm);
            }
            LdGRdR4 => {
                let mut asm = self.asm();
                asm.mov_rptr(f.value, instr.ptr());
                asm.mov_rm(Width::Dword, Reg::Rax, value);
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                site.clear_value_high(&mut asm);
                self.cache.leave(Scratch::Slot(a0));
            }
            SetG4 => {
                let mut asm = self.asm();
                asm.mov_rptr(Reg::Rax, instr.ptr());
                asm.mov_mi(Width::Dword, Mem::new(Reg::Rax, 0), instr.int());
            }
            ChkNullV => {
                let mut asm = self.asm();
                asm.alu_mi(Alu::Cmp, f.ptr, f.var(a0), 0);
                site.leave(&mut asm, Some(Cond::E), instr.offset);
            }
            LoadObj => {
                let mut asm = self.asm();
                asm.mov_rm(f.ptr, Reg::Rax, f.var(a0));
                asm.mov_mi(f.ptr, f.field(offsets::OBJECT_TYPE), 0);
                asm.mov_mr(f.ptr, f.field(offsets::OBJECT_REGISTER), Reg::Rax);
                asm.mov_mi(f.ptr, f.var(a0), 0);
            }
            StoreObj => {
                let mut asm = self.asm();
                asm.mov_rm(f.ptr, Reg::Rax, f.field(offsets::OBJECT_REGISTER));
                asm.mov_mr(f.ptr, f.var(a0), Reg::Rax);
                asm.mov_mi(f.ptr, f.field(offsets::OBJECT_REGISTER), 0);
            }
            LoadThisR | LoadRObjR => {
                let (var, field) = if instr.op == LoadThisR { (0, a0) } else { (a0, a1) };
                self.asm().mov_rm(f.ptr, Reg::Rax, f.var(var));
                self.null_check(instr, Reg::Rax, instr.offset);
                let mut asm = self.asm();
                asm.lea(f.value, Mem::new(Reg::Rax, field as i32));
                site.clear_value_high(&mut asm);
            }
            LoadVObjR => {
                let mut asm = self.asm();
                asm.lea(f.value, f.var(a0).offset(a1 as i32));
                site.clear_value_high(&mut asm);
            }
            _ => {}
        }
    }

    /// COPY: pop the destination, copy `a0` dwords from the object now on
    /// top into it and leave the destination on top.
    fn emit_copy(&mut self, instr: &Instr<'_>) -> JitResult<()> {
        self.check_space(super::CALL_SPACE)?;
        let f = self.frame;
        let abi = self.abi;
        self.load_top();
        let mut asm = self.asm();
        asm.mov_rm(f.ptr, Reg::Rcx, f.stack(f.ptr_size));
        drop(asm);
        self.null_check(instr, Reg::Rax, instr.offset);
        self.null_check(instr, Reg::Rcx, instr.offset);
        let dst = FrameSlot::Object.mem(abi);
        let src = FrameSlot::Spare.mem(abi);
        let mut asm = self.asm();
        asm.alu_ri(Alu::Add, f.ptr, f.sp, f.ptr_size);
        asm.mov_mr(f.ptr, f.stack(0), Reg::Rax);
        asm.mov_mr(f.ptr, dst, Reg::Rax);
        asm.mov_mr(f.ptr, src, Reg::Rcx);
        drop(asm);
        // the dword operand names the type; a0 is the size in dwords
        self.copy_call(instr, dst, src, instr.a0() as u16 as u32);
        Ok(())
    }

    /// Call the dword copy helper with operands parked in frame slots.
    pub(super) fn copy_call(&mut self, instr: &Instr<'_>, dst: Mem, src: Mem, dwords: u32) {
        let f = self.frame;
        let args = [
            Arg::Int(Operand::Mem(dst), f.ptr),
            Arg::Int(Operand::Mem(src), f.ptr),
            Arg::Int(Operand::Imm(dwords as i64), Width::Dword),
        ];
        self.call_helper(instr, helpers::copy_dwords as *const () as usize, &args);
    }

    /// JMPP: jump to `next + 2 * var(a0)` through the jump table. Cases
    /// without native code leave with their offset as resume position.
    fn emit_switch(&mut self, instr: &Instr<'_>) {
        if self.config.no_switches {
            self.fallback(instr);
            return;
        }
        self.jumps.mark_in_use();
        let f = self.frame;
        let table = self.jumps.base_ptr();
        let len = self.code.len() as i32;
        let site = self.site(instr);
        let mut asm = self.asm();
        if f.bits64() {
            asm.movsxd(Reg::Rax, f.var(instr.a0()).into());
        } else {
            asm.mov_rm(Width::Dword, Reg::Rax, f.var(instr.a0()));
        }
        asm.alu_rr(Alu::Add, f.ptr, Reg::Rax, Reg::Rax);
        asm.alu_ri(Alu::Add, f.ptr, Reg::Rax, instr.next_offset() as i32);
        asm.alu_ri(Alu::Cmp, f.ptr, Reg::Rax, len);
        site.leave(&mut asm, Some(Cond::Ae), instr.offset);
        asm.mov_rptr(Reg::Rcx, table);
        asm.mov_rm(f.ptr, Reg::Rcx, Mem::indexed(Reg::Rcx, Reg::Rax, f.ptr_size as u8, 0));
        asm.test_rr(f.ptr, Reg::Rcx, Reg::Rcx);
        let native = asm.jcc_rel8(Cond::Ne);
        asm.mov_rr(Width::Dword, f.resume, Reg::Rax);
        asm.jump_to(None, site.ret_pos);
        asm.bind(native);
        asm.jmp_r(Reg::Rcx);
    }
}
