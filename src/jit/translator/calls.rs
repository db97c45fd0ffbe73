//! Instructions that call out of the function body: script calls and
//! returns, host functions, object lifetime and suspension.

use crate::error::JitResult;
use crate::jit::callconv::{
    Arg, CallSite, CallTarget, Convention, FrameSlot, ObjectSource, Operand, SystemCall, emit_call,
};
use crate::jit::x86::{Alu, Assembler, Cond, Mem, Reg, Width};
use crate::vm::bytecode::{Instr, Opcode};
use crate::vm::engine::Engine;
use crate::vm::function::{FunctionKind, JitSlot};
use crate::vm::registers::offsets;

use super::{CALL_SPACE, Frame, Translator};

/// Enter the compiled function whose [`JitSlot`] address is in `rax`, then
/// pick up the VM registers it left behind.
///
/// Control only continues here when the callee really returned to this
/// call: anything else (an early return inside the callee, or no native
/// code at all) goes straight back to the interpreter, which already has
/// the right registers.
fn call_through_slot(asm: &mut Assembler, f: Frame, site: CallSite<'_>, script_ret: usize) {
    let target = f.call_reg();
    asm.mov_rm(f.ptr, target, Mem::new(Reg::Rax, JitSlot::FUNCTION_OFFSET));
    asm.test_rr(f.ptr, target, target);
    asm.jump_to(Some(Cond::E), script_ret);
    let args = [
        Arg::Int(Operand::Reg(f.regs), f.ptr),
        Arg::Int(Operand::Mem(Mem::new(Reg::Rax, JitSlot::ENTRY_OFFSET)), f.ptr),
    ];
    emit_call(asm, site.abi, Convention::CallerCleans, CallTarget::Reg(target), &args);

    asm.alu_mi(Alu::Cmp, f.ptr, f.field(offsets::PROGRAM_POSITION), site.next_offset as i32);
    asm.jump_to(Some(Cond::Ne), script_ret);
    asm.alu_mr(Alu::Cmp, f.ptr, f.field(offsets::STACK_FRAME_POINTER), f.fp);
    asm.jump_to(Some(Cond::Ne), script_ret);
    asm.mov_rm(f.ptr, f.sp, f.field(offsets::STACK_POINTER));
    asm.mov_rm(f.ptr, f.value, f.field(offsets::VALUE_REGISTER));
    site.exit_check(asm);
}

/// Publish everything a call may look at: position, stack and value.
fn publish_all(asm: &mut Assembler, f: Frame, site: CallSite<'_>, position: usize) {
    site.publish(asm, position);
    asm.mov_mr(f.ptr, f.field(offsets::VALUE_REGISTER), f.value);
}

impl<'a, E: Engine + ?Sized> Translator<'a, E> {
    pub(super) fn emit_call_op(&mut self, instr: &Instr<'a>) -> JitResult<()> {
        self.check_space(CALL_SPACE)?;
        match instr.op {
            Opcode::Call => self.emit_script_call(instr),
            Opcode::Ret => self.emit_return(instr),
            Opcode::CallSys => self.emit_system_call(instr),
            Opcode::CallIntf | Opcode::CallBnd => self.emit_dynamic_call(instr),
            Opcode::Suspend => self.emit_suspend(instr),
            Opcode::Alloc => self.emit_alloc(instr),
            Opcode::Free => self.emit_free(instr),
            Opcode::RefCpy | Opcode::RefCpyV => self.emit_ref_copy(instr),
            _ => self.fallback(instr),
        }
        Ok(())
    }

    fn emit_script_call(&mut self, instr: &Instr<'_>) {
        let id = instr.dword();
        let engine = self.engine;
        if !engine.function(id).is_some_and(|func| matches!(func.kind, FunctionKind::Script)) {
            self.fallback(instr);
            return;
        }
        let owner = self.owner();
        let cell = if self.config.no_script_calls {
            None
        } else {
            Some(self.linker.link(owner, id).cell())
        };
        let f = self.frame;
        let site = self.site(instr);
        let script_ret = self.script_ret;
        let prepare = self.hooks.prepare_script_call as usize;

        let mut asm = self.asm();
        publish_all(&mut asm, f, site, site.next_offset);
        site.call_hook(
            &mut asm,
            prepare,
            &[site.ctx(), Arg::Int(Operand::Imm(id as i64), Width::Dword)],
        );
        asm.test_rr(Width::Byte, Reg::Rax, Reg::Rax);
        asm.jump_to(Some(Cond::E), script_ret);
        match cell {
            Some(cell) => {
                asm.mov_rptr(Reg::Rax, cell);
                call_through_slot(&mut asm, f, site, script_ret);
            }
            None => {
                // the interpreter runs the callee
                asm.jump_to(None, script_ret);
                drop(asm);
                self.end_region();
            }
        }
    }

    /// RET: hand the frame back and return to whoever called this body.
    fn emit_return(&mut self, instr: &Instr<'_>) {
        if self.config.no_script_calls {
            self.fallback(instr);
            return;
        }
        let f = self.frame;
        let site = self.site(instr);
        let script_ret = self.script_ret;
        let hook = self.hooks.return_script_function as usize;
        let args_bytes = instr.a0() as i32 * 4;

        let mut asm = self.asm();
        publish_all(&mut asm, f, site, instr.offset);
        site.call_hook(&mut asm, hook, &[site.ctx()]);
        // the hook restored the caller's registers; pop the arguments
        asm.mov_rm(f.ptr, f.sp, f.field(offsets::STACK_POINTER));
        if args_bytes != 0 {
            asm.alu_ri(Alu::Add, f.ptr, f.sp, args_bytes);
        }
        asm.mov_mr(f.ptr, f.field(offsets::STACK_POINTER), f.sp);
        asm.jump_to(None, script_ret);
        drop(asm);
        self.end_region();
    }

    fn emit_system_call(&mut self, instr: &Instr<'_>) {
        let id = instr.dword();
        let engine = self.engine;
        let Some(sys) = engine.function(id).and_then(|func| func.as_system()) else {
            self.fallback(instr);
            return;
        };
        let site = self.site(instr);
        let mut asm = self.asm();
        SystemCall::new(site).emit(&mut asm, id, sys, ObjectSource::Stack);
        site.exit_check(&mut asm);
    }

    /// CALLINTF and CALLBND resolve their callee at run time through a hook
    /// that also prepares its frame.
    fn emit_dynamic_call(&mut self, instr: &Instr<'_>) {
        let f = self.frame;
        let site = self.site(instr);
        let script_ret = self.script_ret;
        let hook = match instr.op {
            Opcode::CallIntf => self.hooks.call_interface_method as usize,
            _ => self.hooks.call_bound_function as usize,
        };
        let no_script_calls = self.config.no_script_calls;

        let mut asm = self.asm();
        publish_all(&mut asm, f, site, site.next_offset);
        site.call_hook(
            &mut asm,
            hook,
            &[site.ctx(), Arg::Int(Operand::Imm(instr.dword() as i64), Width::Dword)],
        );
        if no_script_calls {
            asm.jump_to(None, script_ret);
            drop(asm);
            self.end_region();
            return;
        }
        asm.test_rr(f.ptr, Reg::Rax, Reg::Rax);
        asm.jump_to(Some(Cond::E), script_ret);
        call_through_slot(&mut asm, f, site, script_ret);
    }

    fn emit_suspend(&mut self, instr: &Instr<'_>) {
        if self.config.no_suspend {
            return;
        }
        let f = self.frame;
        let site = self.site(instr);
        let hook = self.hooks.do_suspend as usize;
        let mut asm = self.asm();
        asm.test_mi8(f.field(offsets::DO_PROCESS_SUSPEND), 0xFF);
        let skip = asm.jcc_rel32(Cond::E);
        publish_all(&mut asm, f, site, site.next_offset);
        site.call_hook(&mut asm, hook, &[site.ctx()]);
        asm.test_rr(Width::Byte, Reg::Rax, Reg::Rax);
        site.leave(&mut asm, Some(Cond::Ne), site.next_offset);
        asm.bind(skip);
    }

    /// ALLOC: allocate a host object, run its constructor and store it
    /// through the pointer on top of the stack.
    fn emit_alloc(&mut self, instr: &Instr<'_>) {
        let engine = self.engine;
        let Some(ty) = engine.object_type(instr.ptr()) else {
            self.fallback(instr);
            return;
        };
        if ty.is_script_object {
            self.fallback(instr);
            return;
        }
        let ctor_id = instr.dword();
        let ctor = match ctor_id {
            0 => None,
            id => match engine.function(id).and_then(|func| func.as_system()) {
                Some(sys) => Some(sys),
                None => {
                    self.fallback(instr);
                    return;
                }
            },
        };
        let f = self.frame;
        let abi = self.abi;
        let site = self.site(instr);
        let alloc = self.hooks.alloc_object as usize;
        let object = FrameSlot::Object.mem(abi);
        let spare = FrameSlot::Spare.mem(abi);

        let mut asm = self.asm();
        site.publish(&mut asm, instr.offset);
        site.call_hook(
            &mut asm,
            alloc,
            &[site.ctx(), Arg::Int(Operand::Imm(ty.size as i64), f.ptr)],
        );
        asm.test_rr(f.ptr, Reg::Rax, Reg::Rax);
        site.leave(&mut asm, Some(Cond::E), instr.offset);
        if let Some(sys) = ctor {
            asm.mov_mr(f.ptr, object, Reg::Rax);
            asm.mov_mr(f.ptr, spare, Reg::Rax);
            SystemCall::new(site).emit(&mut asm, ctor_id, sys, ObjectSource::Slot);
            asm.mov_rm(f.ptr, Reg::Rax, spare);
        }
        asm.mov_rm(f.ptr, Reg::Rcx, f.stack(0));
        asm.alu_ri(Alu::Add, f.ptr, f.sp, f.ptr_size);
        asm.test_rr(f.ptr, Reg::Rcx, Reg::Rcx);
        let no_dest = asm.jcc_rel8(Cond::E);
        asm.mov_mr(f.ptr, Mem::new(Reg::Rcx, 0), Reg::Rax);
        asm.bind(no_dest);
        site.exit_check(&mut asm);
    }

    /// FREE: release or destroy the object in variable `a0` and clear it.
    fn emit_free(&mut self, instr: &Instr<'_>) {
        let engine = self.engine;
        let Some(ty) = engine.object_type(instr.ptr()) else {
            self.fallback(instr);
            return;
        };
        let behaviours = ty.behaviours;
        let f = self.frame;
        let site = self.site(instr);
        let object = FrameSlot::Object.mem(self.abi);
        let method = self.hooks.call_object_method as usize;
        let free = self.hooks.free_object as usize;
        let var = f.var(instr.a0());
        let obj = Arg::Int(Operand::Mem(object), f.ptr);
        let behaviour = |id: u32| Arg::Int(Operand::Imm(id as i64), Width::Dword);
        let publish = !self.config.alloc_simple;

        let mut asm = self.asm();
        asm.mov_rm(f.ptr, Reg::Rax, var);
        asm.test_rr(f.ptr, Reg::Rax, Reg::Rax);
        let null = asm.jcc_rel32(Cond::E);
        if publish {
            site.publish(&mut asm, instr.offset);
        }
        asm.mov_mr(f.ptr, object, Reg::Rax);
        match (behaviours.release, behaviours.destruct) {
            (Some(release), _) => site.call_hook(&mut asm, method, &[site.ctx(), obj, behaviour(release)]),
            (None, Some(destruct)) => {
                site.call_hook(&mut asm, method, &[site.ctx(), obj, behaviour(destruct)]);
                site.call_hook(&mut asm, free, &[site.ctx(), obj]);
            }
            (None, None) => site.call_hook(&mut asm, free, &[site.ctx(), obj]),
        }
        asm.mov_mi(f.ptr, var, 0);
        asm.bind(null);
    }

    /// REFCPY and REFCPYV: store the handle on top of the stack into the
    /// popped destination (or variable `a0`), adjusting reference counts.
    fn emit_ref_copy(&mut self, instr: &Instr<'_>) {
        let engine = self.engine;
        let Some(ty) = engine.object_type(instr.ptr()) else {
            self.fallback(instr);
            return;
        };
        let counted = ty.behaviours.add_ref.zip(ty.behaviours.release);
        let f = self.frame;
        let abi = self.abi;
        let site = self.site(instr);
        let pops = instr.op == Opcode::RefCpy;
        let var = f.var(instr.a0());

        let mut asm = self.asm();
        let Some((add_ref, release)) = counted else {
            // plain handle copy
            if pops {
                asm.mov_rm(f.ptr, Reg::Rax, f.stack(0));
                asm.alu_ri(Alu::Add, f.ptr, f.sp, f.ptr_size);
                asm.mov_rm(f.ptr, Reg::Rcx, f.stack(0));
                asm.mov_mr(f.ptr, Mem::new(Reg::Rax, 0), Reg::Rcx);
            } else {
                asm.mov_rm(f.ptr, Reg::Rcx, f.stack(0));
                asm.mov_mr(f.ptr, var, Reg::Rcx);
            }
            return;
        };

        let method = site.hooks.call_object_method as usize;
        let dest = FrameSlot::Object.mem(abi);
        let source = FrameSlot::Spare.mem(abi);
        site.publish(&mut asm, instr.offset);
        if pops {
            asm.mov_rm(f.ptr, Reg::Rax, f.stack(0));
            asm.alu_ri(Alu::Add, f.ptr, f.sp, f.ptr_size);
        } else {
            asm.lea(Reg::Rax, var);
        }
        asm.mov_mr(f.ptr, dest, Reg::Rax);
        asm.mov_rm(f.ptr, Reg::Rax, f.stack(0));
        asm.mov_mr(f.ptr, source, Reg::Rax);

        asm.test_rr(f.ptr, Reg::Rax, Reg::Rax);
        let no_source = asm.jcc_rel32(Cond::E);
        site.call_hook(
            &mut asm,
            method,
            &[
                site.ctx(),
                Arg::Int(Operand::Mem(source), f.ptr),
                Arg::Int(Operand::Imm(add_ref as i64), Width::Dword),
            ],
        );
        asm.bind(no_source);

        asm.mov_rm(f.ptr, Reg::Rax, dest);
        asm.mov_rm(f.ptr, Reg::Rax, Mem::new(Reg::Rax, 0));
        asm.test_rr(f.ptr, Reg::Rax, Reg::Rax);
        let no_old = asm.jcc_rel32(Cond::E);
        site.call_hook(
            &mut asm,
            method,
            &[
                site.ctx(),
                Arg::Int(Operand::Reg(Reg::Rax), f.ptr),
                Arg::Int(Operand::Imm(release as i64), Width::Dword),
            ],
        );
        asm.bind(no_old);

        asm.mov_rm(f.ptr, Reg::Rax, source);
        asm.mov_rm(f.ptr, Reg::Rcx, dest);
        asm.mov_mr(f.ptr, Mem::new(Reg::Rcx, 0), Reg::Rax);
    }
}
