//! Bytecode to native code translation.
//!
//! The translator walks a function's bytecode once. It starts out
//! *scanning*: instructions are skipped until a `JitEntry` marks a point
//! where the interpreter may hand over. From there it is *emitting* until an
//! instruction it cannot express or an unconditional exit such as a return,
//! after which it scans again. Every jump into a scanned region and every instruction without a
//! native rendition becomes an early return: the resume offset goes into a
//! register and control flows to a shared epilogue that publishes the VM
//! registers and goes back to the interpreter.
//!
//! Native code enters through a prologue that takes `(regs, entry)` and
//! dispatches through the function's [`EntryTable`].

mod cache;
mod calls;
mod fusion;
mod jumps;
mod ops;

use tracing::trace;

use crate::config::JitConfig;
use crate::error::{JitError, JitResult};
use crate::vm::bytecode::{Bytecode, Instr, Opcode};
use crate::vm::engine::{Engine, RuntimeHooks};
use crate::vm::function::{FunctionId, ScriptFunction};
use crate::vm::registers::offsets;

use super::abi::{AbiTable, EntryArgs};
use super::callconv::CallSite;
use super::codebuf::CodeBuffer;
use super::entry_table::EntryTable;
use super::linker::Linker;
use super::page::{PageId, PageManager};
use super::x86::{Alu, Assembler, Cond, Mem, Mode, Reg, Width};

pub use cache::{Scratch, ScratchCache};
pub use jumps::{JumpTable, PendingJump, PendingJumps};

/// Bytes every instruction may use before the page has to change.
const OP_SPACE: usize = 128;
/// Heavier instructions ask for more up front.
const CALL_SPACE: usize = 512;

/// A translated function body.
#[derive(Debug)]
pub struct Translation {
    /// Address of the prologue.
    pub address: usize,
    /// Pages the body occupies; it holds one reference on each.
    pub pages: Vec<PageId>,
    pub entries: EntryTable,
    /// Native addresses of instructions, kept when a switch reads them at
    /// run time.
    pub jump_table: Option<JumpTable>,
    /// Machine code bytes written, across all pages.
    pub bytes: usize,
    /// Instructions that unconditionally hand control back to the
    /// interpreter.
    pub fallbacks: usize,
}

/// Registers and widths generated code works with, copied out so emitters
/// can build operands while the code buffer is borrowed.
#[derive(Debug, Clone, Copy)]
struct Frame {
    regs: Reg,
    fp: Reg,
    sp: Reg,
    value: Reg,
    resume: Reg,
    ptr: Width,
    ptr_size: i32,
    mode: Mode,
}

impl Frame {
    fn new(abi: &AbiTable) -> Self {
        let pinned = abi.pinned;
        Self {
            regs: pinned.registers,
            fp: pinned.frame,
            sp: pinned.stack,
            value: pinned.value,
            resume: pinned.resume,
            ptr: abi.ptr_width(),
            ptr_size: abi.ptr_size as i32,
            mode: abi.mode,
        }
    }

    fn bits64(self) -> bool {
        self.mode == Mode::Bits64
    }

    /// Variable slot `n`.
    fn var(self, n: i16) -> Mem {
        Mem::new(self.fp, -4 * n as i32)
    }

    /// `bytes` above the value stack pointer.
    fn stack(self, bytes: i32) -> Mem {
        Mem::new(self.sp, bytes)
    }

    fn field(self, offset: i32) -> Mem {
        Mem::new(self.regs, offset)
    }

    /// Scratch register for a call target, clear of every argument register.
    fn call_reg(self) -> Reg {
        if self.bits64() { Reg::R11 } else { Reg::Rcx }
    }
}

/// Translate `func`, or return `None` when it has no entry point.
pub fn translate<E: Engine + ?Sized>(
    engine: &E,
    func: &ScriptFunction,
    config: &JitConfig,
    abi: &'static AbiTable,
    pages: &mut PageManager,
    linker: &mut Linker,
) -> JitResult<Option<Translation>> {
    let code = Bytecode::new(&func.bytecode);
    let Some(targets) = prescan(code)? else {
        return Ok(None);
    };
    let (page, buf) = pages.begin_function()?;
    let mut translator = Translator {
        engine,
        func,
        config,
        abi,
        hooks: engine.hooks(),
        frame: Frame::new(abi),
        code,
        pages,
        linker,
        buf,
        page,
        owned: vec![page],
        segment: 0,
        written: 0,
        start: 0,
        ret_pos: 0,
        script_ret: 0,
        targets,
        jumps: JumpTable::new(code.len()),
        pending: PendingJumps::default(),
        entries: EntryTable::new(code.len()),
        cache: ScratchCache::default(),
        reserved: 0,
        emitting: false,
        fallbacks: 0,
    };
    match translator.run() {
        Ok(()) => Ok(Some(translator.into_translation())),
        Err(e) => {
            translator.abandon();
            Err(e)
        }
    }
}

/// Mark every offset control may arrive at other than by falling through:
/// branch targets, entry points and the case jumps behind a switch.
/// Returns `None` when there is no entry point at all.
fn prescan(code: Bytecode<'_>) -> JitResult<Option<Vec<bool>>> {
    let mut targets = vec![false; code.len()];
    let mut has_entry = false;
    let mut after_switch = false;
    for instr in code.iter() {
        let instr = instr?;
        if after_switch && instr.op == Opcode::Jmp {
            targets[instr.offset] = true;
        } else {
            after_switch = false;
        }
        match instr.op {
            Opcode::JitEntry => {
                has_entry = true;
                targets[instr.offset] = true;
            }
            Opcode::JmpP => after_switch = true,
            op if op.is_branch() => {
                if let Some(target) = targets.get_mut(instr.branch_target()) {
                    *target = true;
                }
            }
            _ => {}
        }
    }
    Ok(has_entry.then_some(targets))
}

pub struct Translator<'a, E: Engine + ?Sized> {
    engine: &'a E,
    func: &'a ScriptFunction,
    config: &'a JitConfig,
    abi: &'static AbiTable,
    hooks: &'a RuntimeHooks,
    frame: Frame,
    code: Bytecode<'a>,
    pages: &'a mut PageManager,
    linker: &'a mut Linker,
    buf: CodeBuffer,
    page: PageId,
    owned: Vec<PageId>,
    /// Base address of the part of the body in the current page.
    segment: usize,
    /// Bytes committed to earlier pages.
    written: usize,
    start: usize,
    ret_pos: usize,
    script_ret: usize,
    targets: Vec<bool>,
    jumps: JumpTable,
    pending: PendingJumps,
    entries: EntryTable,
    cache: ScratchCache,
    /// Value stack bytes reserved by a push batch and not yet written.
    reserved: i32,
    emitting: bool,
    fallbacks: usize,
}

impl<'a, E: Engine + ?Sized> Translator<'a, E> {
    fn run(&mut self) -> JitResult<()> {
        self.segment = self.buf.base();
        self.emit_prologue()?;
        let mut offset = 0;
        while offset < self.code.len() {
            let instr = self.code.decode(offset)?;
            offset = self.step(&instr)?;
        }
        self.finish()
    }

    fn into_translation(self) -> Translation {
        let jump_table = self.jumps.in_use().then_some(self.jumps);
        Translation {
            address: self.start,
            pages: self.owned,
            entries: self.entries,
            jump_table,
            bytes: self.written,
            fallbacks: self.fallbacks,
        }
    }

    /// Give back the page references of a failed translation.
    fn abandon(&mut self) {
        for page in self.owned.drain(..) {
            self.pages.drop_ref(page);
        }
    }

    fn asm(&mut self) -> Assembler<'_> {
        Assembler::new(&mut self.buf, self.abi.mode)
    }

    fn site(&self, instr: &Instr<'_>) -> CallSite<'a> {
        CallSite {
            abi: self.abi,
            hooks: self.hooks,
            config: self.config,
            ret_pos: self.ret_pos,
            offset: instr.offset,
            next_offset: instr.next_offset(),
        }
    }

    fn is_target(&self, offset: usize) -> bool {
        self.targets.get(offset).copied().unwrap_or(false)
    }

    fn owner(&self) -> FunctionId {
        self.func.id
    }

    /// Entry dispatch, then the two shared exits: `ret_pos` publishes the
    /// VM registers with the resume offset, `script_ret` only restores the
    /// machine state.
    fn emit_prologue(&mut self) -> JitResult<()> {
        let abi = self.abi;
        let f = self.frame;
        let table = self.entries.base_ptr();
        let len = self.code.len() as i32;
        let index = if f.bits64() { Reg::R11 } else { Reg::Rcx };

        let mut asm = Assembler::new(&mut self.buf, abi.mode);
        self.start = asm.address();
        for reg in abi.saved {
            asm.push(*reg);
        }
        asm.alu_ri(Alu::Sub, f.ptr, Reg::Rsp, abi.reserve as i32);
        match abi.entry_args {
            EntryArgs::Registers(regs, entry) => {
                asm.mov_rr(f.ptr, f.regs, regs);
                asm.mov_rr(f.ptr, Reg::Rax, entry);
            }
            EntryArgs::Stack => {
                asm.mov_rm(f.ptr, f.regs, Mem::new(Reg::Rsp, abi.stack_entry_arg(0)));
                asm.mov_rm(f.ptr, Reg::Rax, Mem::new(Reg::Rsp, abi.stack_entry_arg(1)));
            }
        }
        asm.alu_ri(Alu::Cmp, f.ptr, Reg::Rax, len);
        let out_of_range = asm.jcc_rel8(Cond::Ae);
        asm.mov_rptr(index, table);
        asm.mov_rm(f.ptr, Reg::Rax, Mem::indexed(index, Reg::Rax, f.ptr_size as u8, 0));
        asm.test_rr(f.ptr, Reg::Rax, Reg::Rax);
        let missing = asm.jcc_rel8(Cond::E);
        asm.mov_rm(f.ptr, f.fp, f.field(offsets::STACK_FRAME_POINTER));
        asm.mov_rm(f.ptr, f.sp, f.field(offsets::STACK_POINTER));
        asm.mov_rm(f.ptr, f.value, f.field(offsets::VALUE_REGISTER));
        asm.jmp_r(Reg::Rax);

        self.ret_pos = asm.address();
        asm.mov_mr(f.ptr, f.field(offsets::PROGRAM_POSITION), f.resume);
        asm.mov_mr(f.ptr, f.field(offsets::STACK_POINTER), f.sp);
        asm.mov_mr(f.ptr, f.field(offsets::STACK_FRAME_POINTER), f.fp);
        asm.mov_mr(f.ptr, f.field(offsets::VALUE_REGISTER), f.value);

        self.script_ret = asm.address();
        asm.bind(out_of_range);
        asm.bind(missing);
        asm.alu_ri(Alu::Add, f.ptr, Reg::Rsp, abi.reserve as i32);
        for reg in abi.saved.iter().rev() {
            asm.pop(*reg);
        }
        asm.ret();
        self.buf.check_capacity()
    }

    /// Translate one instruction (or a fused group starting at it) and
    /// return the offset to continue at.
    fn step(&mut self, instr: &Instr<'a>) -> JitResult<usize> {
        self.cache.advance();
        let offset = instr.offset;

        if !self.emitting && instr.op != Opcode::JitEntry {
            // a jump into code we are not translating leaves right here
            if self.has_pending(offset) {
                self.check_space(OP_SPACE)?;
                self.bind_pending(offset)?;
                let site = self.site(instr);
                site.leave(&mut self.asm(), None, offset);
            }
            return Ok(instr.next_offset());
        }

        self.check_space(OP_SPACE)?;
        if self.reserved == 0 {
            let here = self.buf.address();
            self.jumps.record(offset, here);
        }
        self.bind_pending(offset)?;
        if self.is_target(offset) {
            self.cache.reset();
        }
        if let Some(next) = self.try_fuse(instr)? {
            return Ok(next);
        }
        self.emit_op(instr)?;
        Ok(instr.next_offset())
    }

    fn has_pending(&self, offset: usize) -> bool {
        self.pending.waits_on(offset)
    }

    /// Point every jump waiting on `offset` at the current position.
    fn bind_pending(&mut self, offset: usize) -> JitResult<()> {
        let here = self.buf.address();
        for jump in self.pending.take(offset) {
            if self.buf.contains(jump.site.address) {
                self.buf.patch(jump.site, here)?;
            } else {
                self.pages.patch(jump.site, here)?;
            }
        }
        Ok(())
    }

    /// Make sure `needed` bytes fit, continuing in a new page otherwise.
    fn check_space(&mut self, needed: usize) -> JitResult<()> {
        let mode = self.abi.mode;
        let reserve = PageManager::migration_reserve(mode, self.pending.len() + 2);
        if self.buf.remaining() >= needed + reserve {
            return Ok(());
        }
        let mut sites = self.pending.sites();
        let from = self.page;
        let to = self.pages.migrate(from, &mut self.buf, mode, &mut sites)?;
        self.pending.update_sites(&sites);
        if let Some(page) = self.pages.page(from) {
            self.written += page.cursor_address() - self.segment;
        }
        self.page = to;
        self.owned.push(to);
        self.segment = self.buf.base();
        if self.buf.remaining() < needed + reserve {
            return Err(JitError::PageOverflow {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Branch to the native code of bytecode `target`.
    ///
    /// Backward targets already have an address, or were skipped and can
    /// only be reached through the interpreter. Forward targets are
    /// resolved when translation gets there.
    fn emit_jump(&mut self, cond: Option<Cond>, target: usize, from: &Instr<'_>) {
        let site = self.site(from);
        if let Some(addr) = self.jumps.get(target) {
            self.asm().jump_to(cond, addr);
        } else if target > from.offset && target < self.code.len() {
            let mut asm = self.asm();
            let fixup = match cond {
                Some(cond) => asm.jcc_rel32(cond),
                None => asm.jmp_rel32(),
            };
            self.pending.add(target, fixup);
        } else {
            site.leave(&mut self.asm(), cond, target);
        }
    }

    /// Hand `instr` to the interpreter and stop translating until the next
    /// entry point.
    fn fallback(&mut self, instr: &Instr<'_>) {
        trace!(
            function = self.func.id,
            offset = instr.offset,
            op = instr.op.name(),
            "instruction left to the interpreter"
        );
        let site = self.site(instr);
        site.leave(&mut self.asm(), None, instr.offset);
        self.fallbacks += 1;
        self.emitting = false;
    }

    /// Unconditional transfer that ends the current emitting region.
    fn end_region(&mut self) {
        self.emitting = false;
        self.cache.reset();
    }

    /// Slot for a value of `size` bytes pushed by `instr`. The first push of
    /// a run of pushes moves the stack pointer once for the whole run.
    fn push_slot(&mut self, instr: &Instr<'_>, size: i32) -> Mem {
        if self.reserved == 0 {
            let total = self.batch_size(instr);
            let f = self.frame;
            self.asm().alu_ri(Alu::Sub, f.ptr, f.sp, total);
            self.reserved = total;
        }
        self.reserved -= size;
        self.frame.stack(self.reserved)
    }

    /// Bytes pushed by the run of push instructions starting at `first`.
    fn batch_size(&self, first: &Instr<'_>) -> i32 {
        let mut total = 0;
        let mut offset = first.offset;
        while let Some(instr) = self.code.peek(offset) {
            if offset != first.offset && self.is_target(offset) {
                break;
            }
            let Some(size) = push_size(instr.op, self.frame.ptr_size) else {
                break;
            };
            total += size;
            offset = instr.next_offset();
        }
        total
    }

    /// Close the function: leave at the end of the bytecode, turn jumps that
    /// never found native code into early returns and commit the last page.
    fn finish(&mut self) -> JitResult<()> {
        let len = self.code.len();
        if self.emitting {
            self.check_space(OP_SPACE)?;
            let site = self.tail_site(len);
            site.leave(&mut self.asm(), None, len);
            self.emitting = false;
        }
        while let Some(target) = self.pending.first_target() {
            self.check_space(OP_SPACE)?;
            self.bind_pending(target)?;
            let site = self.tail_site(target);
            site.leave(&mut self.asm(), None, target);
        }
        self.pages.commit(self.page, &self.buf)?;
        self.written += self.buf.len();
        Ok(())
    }

    fn tail_site(&self, offset: usize) -> CallSite<'a> {
        CallSite {
            abi: self.abi,
            hooks: self.hooks,
            config: self.config,
            ret_pos: self.ret_pos,
            offset,
            next_offset: offset,
        }
    }
}

/// Bytes a push instruction adds to the value stack.
fn push_size(op: Opcode, ptr_size: i32) -> Option<i32> {
    match op {
        Opcode::PshC4 | Opcode::PshV4 | Opcode::PshG4 | Opcode::TypeId => Some(4),
        Opcode::PshC8 | Opcode::PshV8 => Some(8),
        Opcode::Psf
        | Opcode::PshVPtr
        | Opcode::PshRPtr
        | Opcode::PshNull
        | Opcode::FuncPtr
        | Opcode::ObjType
        | Opcode::Pga
        | Opcode::Var
        | Opcode::PshGPtr => Some(ptr_size),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::BytecodeBuilder;

    #[test]
    fn test_prescan_marks_targets_and_entries() {
        let mut b = BytecodeBuilder::new();
        b.entry();
        let jump = b.branch_site(Opcode::Jz);
        b.w(Opcode::IncVi, 1);
        let target = b.offset();
        b.patch_branch(jump, target);
        b.w(Opcode::Ret, 0);
        let words = b.finish();

        let targets = prescan(Bytecode::new(&words)).unwrap().unwrap();
        assert!(targets[0]);
        assert!(targets[target]);
        assert_eq!(targets.iter().filter(|t| **t).count(), 2);
    }

    #[test]
    fn test_prescan_without_entry() {
        let mut b = BytecodeBuilder::new();
        b.w(Opcode::Ret, 0);
        let words = b.finish();
        assert!(prescan(Bytecode::new(&words)).unwrap().is_none());
    }

    #[test]
    fn test_prescan_marks_switch_cases() {
        let mut b = BytecodeBuilder::new();
        b.entry();
        b.w(Opcode::JmpP, 1);
        let first = b.offset();
        b.dw(Opcode::Jmp, 2);
        let second = b.offset();
        b.dw(Opcode::Jmp, 0);
        b.w(Opcode::Ret, 0);
        let words = b.finish();

        let targets = prescan(Bytecode::new(&words)).unwrap().unwrap();
        assert!(targets[first]);
        assert!(targets[second]);
    }

    #[test]
    fn test_push_sizes() {
        assert_eq!(push_size(Opcode::PshC4, 8), Some(4));
        assert_eq!(push_size(Opcode::PshV8, 4), Some(8));
        assert_eq!(push_size(Opcode::PshVPtr, 8), Some(8));
        assert_eq!(push_size(Opcode::PshVPtr, 4), Some(4));
        assert_eq!(push_size(Opcode::Copy, 8), None);
    }
}
