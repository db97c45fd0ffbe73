//! Instruction groups translated as one.
//!
//! A group only forms when none of its later members can be reached other
//! than by falling through, so every way into the group still starts at its
//! first instruction.

use crate::error::JitResult;
use crate::jit::callconv::FrameSlot;
use crate::jit::x86::{Alu, Cond, Mem, Precision, Reg, SseOp, Width, Xmm};
use crate::vm::bytecode::{Instr, Opcode};
use crate::vm::engine::Engine;

use super::ops::{const_f64, materialize_int_compare};
use super::{Scratch, Translator};

/// Instructions that overwrite the value register without reading it
/// first and never leave before doing so.
fn overwrites_value(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        CpyVtoR4
            | CpyVtoR8
            | Ldg
            | Ldv
            | LdGRdR4
            | LoadVObjR
            | PopRPtr
            | CmpD
            | CmpU
            | CmpF
            | CmpI
            | CmpIi
            | CmpIf
            | CmpIu
            | CmpPtr
            | CmpI64
            | CmpU64
    )
}

impl<'a, E: Engine + ?Sized> Translator<'a, E> {
    /// The instruction after `instr`, if it may join a group.
    fn joinable(&self, instr: &Instr<'_>) -> Option<Instr<'a>> {
        let next = instr.next_offset();
        if self.is_target(next) {
            return None;
        }
        self.code.peek(next)
    }

    /// Translate a group starting at `instr`. Returns the offset after the
    /// group, or `None` when `instr` starts none.
    pub(super) fn try_fuse(&mut self, instr: &Instr<'a>) -> JitResult<Option<usize>> {
        use Opcode::*;
        let Some(second) = self.joinable(instr) else {
            return Ok(None);
        };
        let third = self.joinable(&second);
        let f = self.frame;
        let (a0, a1) = (instr.a0(), instr.a1());

        let next = match (instr.op, second.op) {
            (SetV8, AddD | SubD | MulD | DivD)
                if second.a0() == a0 && second.a2() == a0 && second.a1() != a0 =>
            {
                self.fuse_double_const(instr, &second, third)
            }
            (SetV4, SetV4) => self.fuse_set_words(instr, &second, third),
            (PshVPtr, AddSi) if third.is_some_and(|t| t.op == RdsPtr) => {
                self.fuse_field_read(instr, &second)
            }
            (Rdr4, PshV4) if second.a0() == a0 => {
                let mut asm = self.asm();
                asm.mov_rm(Width::Dword, Reg::Rax, Mem::new(f.value, 0));
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                let slot = self.push_slot(&second, 4);
                self.asm().mov_mr(Width::Dword, slot, Reg::Rax);
                self.cache.leave(Scratch::Slot(a0));
                second.next_offset()
            }
            (Psf | PshVPtr, Copy) if self.reserved == 0 => self.fuse_copy_to_var(instr, &second)?,
            (CpyRtoV4, CpyVtoV4) if second.a1() == a0 => {
                let mut asm = self.asm();
                asm.mov_mr(Width::Dword, f.var(a0), f.value);
                asm.mov_mr(Width::Dword, f.var(second.a0()), f.value);
                second.next_offset()
            }
            (CpyVtoV4, IToF) if second.a0() == a0 => {
                let mut asm = self.asm();
                asm.cvtsi2s(Precision::Single, Width::Dword, Xmm::XMM0, f.var(a1).into());
                asm.movs_store(Precision::Single, f.var(a0), Xmm::XMM0);
                second.next_offset()
            }
            (CpyVtoV4, FToD) if second.a1() == a0 => {
                self.load_var(a1);
                let mut asm = self.asm();
                asm.mov_mr(Width::Dword, f.var(a0), Reg::Rax);
                asm.movd_to_xmm(Width::Dword, Xmm::XMM0, Reg::Rax.into());
                asm.cvt_precision(Precision::Single, Xmm::XMM0, Xmm::XMM0.into());
                asm.movs_store(Precision::Double, f.var(second.a0()), Xmm::XMM0);
                second.next_offset()
            }
            (AddSi, RdsPtr) => {
                self.load_top();
                self.null_check(instr, Reg::Rax, instr.offset);
                let mut asm = self.asm();
                asm.mov_rm(f.ptr, Reg::Rax, Mem::new(Reg::Rax, a0 as i32));
                asm.mov_mr(f.ptr, f.stack(0), Reg::Rax);
                self.cache.leave(Scratch::StackTop);
                second.next_offset()
            }
            (CmpI | CmpIi | CmpU | CmpIu, Jz | Jnz | Js | Jns | Jp | Jnp | JLowZ | JLowNZ) => {
                self.fuse_compare_branch(instr, &second)
            }
            _ => return Ok(None),
        };
        Ok(Some(next))
    }

    /// `SetV8 c; OpD x, y, x [; CpyVtoV8 z, x]` computes `y op c` without
    /// storing the constant first.
    fn fuse_double_const(&mut self, set: &Instr<'_>, arith: &Instr<'_>, third: Option<Instr<'a>>) -> usize {
        let f = self.frame;
        let a0 = set.a0();
        let op = match arith.op {
            Opcode::SubD => SseOp::Sub,
            Opcode::MulD => SseOp::Mul,
            Opcode::DivD => SseOp::Div,
            _ => SseOp::Add,
        };
        let copy = third.filter(|t| t.op == Opcode::CpyVtoV8 && t.a1() == a0);
        let mut asm = self.asm();
        const_f64(&mut asm, f, Xmm::XMM1, set.qword());
        asm.movs_load(Precision::Double, Xmm::XMM0, f.var(arith.a1()));
        asm.sse_arith(op, Precision::Double, Xmm::XMM0, Xmm::XMM1.into());
        asm.movs_store(Precision::Double, f.var(a0), Xmm::XMM0);
        match copy {
            Some(copy) => {
                asm.movs_store(Precision::Double, f.var(copy.a0()), Xmm::XMM0);
                copy.next_offset()
            }
            None => arith.next_offset(),
        }
    }

    /// Two or three `SetV4` of the same constant.
    fn fuse_set_words(&mut self, first: &Instr<'_>, second: &Instr<'_>, third: Option<Instr<'a>>) -> usize {
        let f = self.frame;
        let value = first.int();
        if second.int() != value {
            let mut asm = self.asm();
            asm.mov_mi(Width::Dword, f.var(first.a0()), value);
            asm.mov_mi(Width::Dword, f.var(second.a0()), second.int());
            return second.next_offset();
        }
        let third = third.filter(|t| t.op == Opcode::SetV4 && t.int() == value);
        let mut asm = self.asm();
        asm.mov_ri(Width::Dword, Reg::Rax, value as i64);
        asm.mov_mr(Width::Dword, f.var(first.a0()), Reg::Rax);
        asm.mov_mr(Width::Dword, f.var(second.a0()), Reg::Rax);
        let (last, next) = match third {
            Some(third) => {
                asm.mov_mr(Width::Dword, f.var(third.a0()), Reg::Rax);
                (third.a0(), third.next_offset())
            }
            None => (second.a0(), second.next_offset()),
        };
        self.cache.leave(Scratch::Slot(last));
        next
    }

    /// `PshVPtr v; AddSi n; RdsPtr` pushes the field at offset `n` of the
    /// object `v` points to.
    fn fuse_field_read(&mut self, push: &Instr<'_>, add: &Instr<'a>) -> usize {
        let f = self.frame;
        let slot = self.push_slot(push, f.ptr_size);
        let mut asm = self.asm();
        asm.mov_rm(f.ptr, Reg::Rax, f.var(push.a0()));
        asm.mov_mr(f.ptr, slot, Reg::Rax);
        drop(asm);
        // the pointer is pushed; the interpreter raises the null exception
        // when it retries the add
        self.null_check(add, Reg::Rax, add.offset);
        let mut asm = self.asm();
        asm.mov_rm(f.ptr, Reg::Rax, Mem::new(Reg::Rax, add.a0() as i32));
        asm.mov_mr(f.ptr, slot, Reg::Rax);
        if self.reserved == 0 {
            self.cache.leave(Scratch::StackTop);
        }
        let read = add.next_offset();
        self.code.peek(read).map_or(read, |read| read.next_offset())
    }

    /// `Psf v | PshVPtr v; Copy n` copies the object on top into `v` (or
    /// the object `v` points to) and replaces the top with its address.
    fn fuse_copy_to_var(&mut self, push: &Instr<'_>, copy: &Instr<'_>) -> JitResult<usize> {
        self.check_space(super::CALL_SPACE)?;
        let f = self.frame;
        let abi = self.abi;
        self.load_top();
        let mut asm = self.asm();
        asm.mov_rr(f.ptr, Reg::Rcx, Reg::Rax);
        if push.op == Opcode::Psf {
            asm.lea(Reg::Rax, f.var(push.a0()));
        } else {
            asm.mov_rm(f.ptr, Reg::Rax, f.var(push.a0()));
        }
        drop(asm);
        self.null_check(push, Reg::Rax, push.offset);
        self.null_check(push, Reg::Rcx, push.offset);
        let dst = FrameSlot::Object.mem(abi);
        let src = FrameSlot::Spare.mem(abi);
        let mut asm = self.asm();
        asm.mov_mr(f.ptr, f.stack(0), Reg::Rax);
        asm.mov_mr(f.ptr, dst, Reg::Rax);
        asm.mov_mr(f.ptr, src, Reg::Rcx);
        drop(asm);
        self.copy_call(copy, dst, src, copy.a0() as u16 as u32);
        Ok(copy.next_offset())
    }

    /// Compare and branch on the result. The result still goes to the
    /// value register unless both successors overwrite it.
    fn fuse_compare_branch(&mut self, cmp: &Instr<'_>, jump: &Instr<'a>) -> usize {
        let f = self.frame;
        let signed = matches!(cmp.op, Opcode::CmpI | Opcode::CmpIi);
        let target = jump.branch_target();
        let dead = [jump.next_offset(), target]
            .iter()
            .all(|offset| self.code.peek(*offset).is_some_and(|i| overwrites_value(i.op)));
        let cond = match (jump.op, signed) {
            (Opcode::Jz | Opcode::JLowZ, _) => Cond::E,
            (Opcode::Jnz | Opcode::JLowNZ, _) => Cond::Ne,
            (Opcode::Js, true) => Cond::L,
            (Opcode::Js, false) => Cond::B,
            (Opcode::Jns, true) => Cond::Ge,
            (Opcode::Jns, false) => Cond::Ae,
            (Opcode::Jp, true) => Cond::G,
            (Opcode::Jp, false) => Cond::A,
            (_, true) => Cond::Le,
            (_, false) => Cond::Be,
        };
        self.load_var(cmp.a0());
        let site = self.site(cmp);
        let mut asm = self.asm();
        match cmp.op {
            Opcode::CmpI | Opcode::CmpU => asm.alu_rm(Alu::Cmp, Width::Dword, Reg::Rax, f.var(cmp.a1())),
            _ => asm.alu_ri(Alu::Cmp, Width::Dword, Reg::Rax, cmp.int()),
        }
        if !dead {
            materialize_int_compare(&mut asm, f, signed);
            site.clear_value_high(&mut asm);
        }
        drop(asm);
        self.emit_jump(Some(cond), target, jump);
        self.cache.leave(Scratch::Slot(cmp.a0()));
        jump.next_offset()
    }
}
