//! x86 / x86-64 instruction encoding.
//!
//! One assembler serves both the 32-bit and the 64-bit targets. Register
//! numbers above 7 and 64-bit operand sizes are only legal in 64-bit mode.

use super::codebuf::{CodeBuffer, Site, SiteKind};

/// General-purpose registers. In 32-bit mode the first eight name
/// eax..edi.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Needs REX.B / REX.R / REX.X.
    pub fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// SSE registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

impl Xmm {
    pub const XMM0: Xmm = Xmm(0);
    pub const XMM1: Xmm = Xmm(1);
    pub const XMM2: Xmm = Xmm(2);
    pub const XMM3: Xmm = Xmm(3);
    pub const XMM4: Xmm = Xmm(4);
    pub const XMM5: Xmm = Xmm(5);
    pub const XMM6: Xmm = Xmm(6);
    pub const XMM7: Xmm = Xmm(7);
}

/// Condition codes (for Jcc, SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,  // Overflow
    No = 0x1, // Not overflow
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    S = 0x8,  // Sign (negative)
    Ns = 0x9, // Not sign (non-negative)
    P = 0xA,  // Parity even
    Np = 0xB, // Parity odd
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

impl Cond {
    /// Invert the condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// Operand size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
            Width::Qword => 8,
        }
    }
}

/// Processor mode the code runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Bits32,
    Bits64,
}

/// Memory operand `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Reg,
    pub index: Option<(Reg, u8)>,
    pub disp: i32,
}

impl Mem {
    pub fn new(base: Reg, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp,
        }
    }

    pub fn indexed(base: Reg, index: Reg, scale: u8, disp: i32) -> Self {
        debug_assert!(index != Reg::Rsp, "rsp cannot be an index");
        debug_assert!(matches!(scale, 1 | 2 | 4 | 8));
        Self {
            base,
            index: Some((index, scale)),
            disp,
        }
    }

    /// Same operand displaced by `delta` more bytes.
    pub fn offset(self, delta: i32) -> Self {
        Self {
            disp: self.disp + delta,
            ..self
        }
    }
}

/// Register-or-memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rm {
    Reg(Reg),
    Xmm(Xmm),
    Mem(Mem),
}

impl From<Reg> for Rm {
    fn from(r: Reg) -> Self {
        Rm::Reg(r)
    }
}

impl From<Xmm> for Rm {
    fn from(x: Xmm) -> Self {
        Rm::Xmm(x)
    }
}

impl From<Mem> for Rm {
    fn from(m: Mem) -> Self {
        Rm::Mem(m)
    }
}

/// The eight classic ALU operations (`/digit` of opcodes 80/81/83).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alu {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Group-3 unary operations (opcode F7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Unary {
    Not = 2,
    Neg = 3,
    Mul = 4,
    Imul = 5,
    Div = 6,
    Idiv = 7,
}

/// Group-2 shifts (opcodes C1/D3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shift {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Scalar SSE arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SseOp {
    Add = 0x58,
    Mul = 0x59,
    Sub = 0x5C,
    Div = 0x5E,
}

/// Scalar floating-point precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    pub fn bytes(self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }

    fn prefix(self) -> u8 {
        match self {
            Precision::Single => 0xF3,
            Precision::Double => 0xF2,
        }
    }
}

fn fits_i8(v: i64) -> bool {
    (-128..=127).contains(&v)
}

fn fits_i32(v: i64) -> bool {
    (i32::MIN as i64..=i32::MAX as i64).contains(&v)
}

/// Instruction assembler writing into a [`CodeBuffer`].
pub struct Assembler<'a> {
    buf: &'a mut CodeBuffer,
    mode: Mode,
}

impl<'a> Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer, mode: Mode) -> Self {
        Self { buf, mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn buf(&mut self) -> &mut CodeBuffer {
        self.buf
    }

    /// Absolute address of the next emitted byte.
    pub fn address(&self) -> usize {
        self.buf.address()
    }

    /// Operand size of a machine pointer.
    pub fn ptr_width(&self) -> Width {
        match self.mode {
            Mode::Bits32 => Width::Dword,
            Mode::Bits64 => Width::Qword,
        }
    }

    // ==================== Encoding helpers ====================

    fn rm_code(rm: &Rm) -> (u8, u8, u8) {
        // (rm register number, index register number, base register number)
        match rm {
            Rm::Reg(r) => (*r as u8, 0, 0),
            Rm::Xmm(x) => (x.0, 0, 0),
            Rm::Mem(m) => (
                m.base as u8,
                m.index.map(|(i, _)| i as u8).unwrap_or(0),
                m.base as u8,
            ),
        }
    }

    /// Emit the optional operand-size / mandatory prefix, REX and opcode.
    fn prefix_rex(&mut self, mandatory: Option<u8>, width: Width, reg: u8, rm: &Rm, force_rex: bool) {
        if width == Width::Word {
            self.buf.emit_u8(0x66);
        }
        if let Some(p) = mandatory {
            self.buf.emit_u8(p);
        }
        let (rm_num, index_num, _) = Self::rm_code(rm);
        let w = width == Width::Qword;
        let r = reg >= 8;
        let x = index_num >= 8;
        let b = rm_num >= 8;
        if self.mode == Mode::Bits32 {
            debug_assert!(!(w || r || x || b), "64-bit operand in 32-bit mode");
            return;
        }
        let rex = 0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | b as u8;
        if rex != 0x40 || force_rex {
            self.buf.emit_u8(rex);
        }
    }

    fn modrm(&mut self, reg: u8, rm: &Rm) {
        let reg = (reg & 7) << 3;
        match rm {
            Rm::Reg(r) => self.buf.emit_u8(0xC0 | reg | r.code()),
            Rm::Xmm(x) => self.buf.emit_u8(0xC0 | reg | (x.0 & 7)),
            Rm::Mem(m) => {
                let base = m.base.code();
                let disp = m.disp as i64;
                let mode = if disp == 0 && base != 5 {
                    0
                } else if fits_i8(disp) {
                    1
                } else {
                    2
                };
                if m.index.is_some() || base == 4 {
                    self.buf.emit_u8(mode << 6 | reg | 0b100);
                    let (index, scale) = m.index.unwrap_or((Reg::Rsp, 1));
                    let ss = match scale {
                        1 => 0,
                        2 => 1,
                        4 => 2,
                        _ => 3,
                    };
                    self.buf.emit_u8(ss << 6 | index.code() << 3 | base);
                } else {
                    self.buf.emit_u8(mode << 6 | reg | base);
                }
                match mode {
                    1 => self.buf.emit_u8(m.disp as u8),
                    2 => self.buf.emit_u32(m.disp as u32),
                    _ => {}
                }
            }
        }
    }

    /// Generic `opcode /r` instruction.
    fn op_rm(&mut self, width: Width, opcode: &[u8], reg: u8, rm: Rm) {
        self.prefix_rex(None, width, reg, &rm, false);
        self.buf.emit_bytes(opcode);
        self.modrm(reg, &rm);
    }

    /// Byte-sized register operands 4..7 need an empty REX in 64-bit mode
    /// to select spl..dil instead of ah..bh.
    fn byte_op_rm(&mut self, opcode: &[u8], reg: u8, rm: Rm) {
        let low_byte_reg = |n: u8| (4..8).contains(&n);
        let force = self.mode == Mode::Bits64
            && (low_byte_reg(reg) || matches!(rm, Rm::Reg(r) if low_byte_reg(r as u8)));
        self.prefix_rex(None, Width::Byte, reg, &rm, force);
        self.buf.emit_bytes(opcode);
        self.modrm(reg, &rm);
    }

    fn sse(&mut self, prefix: Option<u8>, width: Width, opcode: u8, reg: u8, rm: Rm) {
        self.prefix_rex(prefix, width, reg, &rm, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.modrm(reg, &rm);
    }

    // ==================== Data Movement ====================

    /// MOV reg, reg
    pub fn mov_rr(&mut self, width: Width, dst: Reg, src: Reg) {
        if width == Width::Byte {
            self.byte_op_rm(&[0x88], src as u8, dst.into());
        } else {
            self.op_rm(width, &[0x89], src as u8, dst.into());
        }
    }

    /// MOV reg, [mem]
    pub fn mov_rm(&mut self, width: Width, dst: Reg, mem: Mem) {
        if width == Width::Byte {
            self.byte_op_rm(&[0x8A], dst as u8, mem.into());
        } else {
            self.op_rm(width, &[0x8B], dst as u8, mem.into());
        }
    }

    /// MOV [mem], reg
    pub fn mov_mr(&mut self, width: Width, mem: Mem, src: Reg) {
        if width == Width::Byte {
            self.byte_op_rm(&[0x88], src as u8, mem.into());
        } else {
            self.op_rm(width, &[0x89], src as u8, mem.into());
        }
    }

    /// MOV reg, imm. Picks the shortest form for 64-bit destinations.
    pub fn mov_ri(&mut self, width: Width, dst: Reg, imm: i64) {
        match width {
            Width::Qword if fits_i32(imm) => {
                self.op_rm(Width::Qword, &[0xC7], 0, dst.into());
                self.buf.emit_u32(imm as u32);
            }
            Width::Qword => {
                self.prefix_rex(None, Width::Qword, 0, &dst.into(), false);
                self.buf.emit_u8(0xB8 + dst.code());
                self.buf.emit_u64(imm as u64);
            }
            Width::Dword => {
                self.prefix_rex(None, Width::Dword, 0, &dst.into(), false);
                self.buf.emit_u8(0xB8 + dst.code());
                self.buf.emit_u32(imm as u32);
            }
            Width::Word => {
                self.prefix_rex(None, Width::Word, 0, &dst.into(), false);
                self.buf.emit_u8(0xB8 + dst.code());
                self.buf.emit_u16(imm as u16);
            }
            Width::Byte => {
                self.prefix_rex(None, Width::Byte, 0, &dst.into(), false);
                self.buf.emit_u8(0xB0 + dst.code());
                self.buf.emit_u8(imm as u8);
            }
        }
    }

    /// Load a pointer-sized immediate.
    pub fn mov_rptr(&mut self, dst: Reg, value: usize) {
        let width = self.ptr_width();
        self.mov_ri(width, dst, value as i64);
    }

    /// MOV [mem], imm. Qword stores sign-extend a 32-bit immediate.
    pub fn mov_mi(&mut self, width: Width, mem: Mem, imm: i32) {
        match width {
            Width::Byte => {
                self.op_rm(Width::Byte, &[0xC6], 0, mem.into());
                self.buf.emit_u8(imm as u8);
            }
            Width::Word => {
                self.op_rm(Width::Word, &[0xC7], 0, mem.into());
                self.buf.emit_u16(imm as u16);
            }
            _ => {
                self.op_rm(width, &[0xC7], 0, mem.into());
                self.buf.emit_u32(imm as u32);
            }
        }
    }

    /// LEA reg, [mem] at pointer width.
    pub fn lea(&mut self, dst: Reg, mem: Mem) {
        let width = self.ptr_width();
        self.op_rm(width, &[0x8D], dst as u8, mem.into());
    }

    /// MOVZX dst32, byte/word source.
    pub fn movzx(&mut self, dst: Reg, src_width: Width, src: Rm) {
        let op = if src_width == Width::Byte { 0xB6 } else { 0xB7 };
        if src_width == Width::Byte {
            self.byte_op_rm(&[0x0F, op], dst as u8, src);
        } else {
            self.op_rm(Width::Dword, &[0x0F, op], dst as u8, src);
        }
    }

    /// MOVSX dst32, byte/word source.
    pub fn movsx(&mut self, dst: Reg, src_width: Width, src: Rm) {
        let op = if src_width == Width::Byte { 0xBE } else { 0xBF };
        if src_width == Width::Byte {
            self.byte_op_rm(&[0x0F, op], dst as u8, src);
        } else {
            self.op_rm(Width::Dword, &[0x0F, op], dst as u8, src);
        }
    }

    /// MOVSXD r64, r/m32 (64-bit mode only)
    pub fn movsxd(&mut self, dst: Reg, src: Rm) {
        self.op_rm(Width::Qword, &[0x63], dst as u8, src);
    }

    // ==================== Arithmetic ====================

    /// ALU dst, src
    pub fn alu_rr(&mut self, op: Alu, width: Width, dst: Reg, src: Reg) {
        let opcode = (op as u8) << 3 | if width == Width::Byte { 0 } else { 1 };
        if width == Width::Byte {
            self.byte_op_rm(&[opcode], src as u8, dst.into());
        } else {
            self.op_rm(width, &[opcode], src as u8, dst.into());
        }
    }

    /// ALU dst, [mem]
    pub fn alu_rm(&mut self, op: Alu, width: Width, dst: Reg, mem: Mem) {
        let opcode = (op as u8) << 3 | if width == Width::Byte { 2 } else { 3 };
        if width == Width::Byte {
            self.byte_op_rm(&[opcode], dst as u8, mem.into());
        } else {
            self.op_rm(width, &[opcode], dst as u8, mem.into());
        }
    }

    /// ALU [mem], src
    pub fn alu_mr(&mut self, op: Alu, width: Width, mem: Mem, src: Reg) {
        let opcode = (op as u8) << 3 | if width == Width::Byte { 0 } else { 1 };
        if width == Width::Byte {
            self.byte_op_rm(&[opcode], src as u8, mem.into());
        } else {
            self.op_rm(width, &[opcode], src as u8, mem.into());
        }
    }

    fn alu_imm(&mut self, op: Alu, width: Width, dst: Rm, imm: i32) {
        if width == Width::Byte {
            self.op_rm(Width::Byte, &[0x80], op as u8, dst);
            self.buf.emit_u8(imm as u8);
        } else if fits_i8(imm as i64) {
            self.op_rm(width, &[0x83], op as u8, dst);
            self.buf.emit_u8(imm as u8);
        } else {
            self.op_rm(width, &[0x81], op as u8, dst);
            if width == Width::Word {
                self.buf.emit_u16(imm as u16);
            } else {
                self.buf.emit_u32(imm as u32);
            }
        }
    }

    /// ALU dst, imm (imm8 form when it fits)
    pub fn alu_ri(&mut self, op: Alu, width: Width, dst: Reg, imm: i32) {
        self.alu_imm(op, width, dst.into(), imm);
    }

    /// ALU [mem], imm
    pub fn alu_mi(&mut self, op: Alu, width: Width, mem: Mem, imm: i32) {
        self.alu_imm(op, width, mem.into(), imm);
    }

    /// TEST a, b
    pub fn test_rr(&mut self, width: Width, a: Reg, b: Reg) {
        if width == Width::Byte {
            self.byte_op_rm(&[0x84], b as u8, a.into());
        } else {
            self.op_rm(width, &[0x85], b as u8, a.into());
        }
    }

    /// TEST byte [mem], imm8
    pub fn test_mi8(&mut self, mem: Mem, imm: u8) {
        self.op_rm(Width::Byte, &[0xF6], 0, mem.into());
        self.buf.emit_u8(imm);
    }

    /// IMUL dst, src
    pub fn imul_rr(&mut self, width: Width, dst: Reg, src: Rm) {
        self.op_rm(width, &[0x0F, 0xAF], dst as u8, src);
    }

    /// IMUL dst, src, imm32
    pub fn imul_rri(&mut self, width: Width, dst: Reg, src: Rm, imm: i32) {
        if fits_i8(imm as i64) {
            self.op_rm(width, &[0x6B], dst as u8, src);
            self.buf.emit_u8(imm as u8);
        } else {
            self.op_rm(width, &[0x69], dst as u8, src);
            self.buf.emit_u32(imm as u32);
        }
    }

    /// NOT/NEG/MUL/IMUL/DIV/IDIV r/m
    pub fn unary(&mut self, op: Unary, width: Width, operand: Rm) {
        if width == Width::Byte {
            self.byte_op_rm(&[0xF6], op as u8, operand);
        } else {
            self.op_rm(width, &[0xF7], op as u8, operand);
        }
    }

    /// INC r/m
    pub fn inc(&mut self, width: Width, operand: Rm) {
        let opcode = if width == Width::Byte { 0xFE } else { 0xFF };
        self.op_rm(width, &[opcode], 0, operand);
    }

    /// DEC r/m
    pub fn dec(&mut self, width: Width, operand: Rm) {
        let opcode = if width == Width::Byte { 0xFE } else { 0xFF };
        self.op_rm(width, &[opcode], 1, operand);
    }

    /// SHL/SHR/SAR r/m, CL
    pub fn shift_cl(&mut self, op: Shift, width: Width, operand: Rm) {
        self.op_rm(width, &[0xD3], op as u8, operand);
    }

    /// SHL/SHR/SAR r/m, imm8
    pub fn shift_ri(&mut self, op: Shift, width: Width, operand: Rm, imm: u8) {
        self.op_rm(width, &[0xC1], op as u8, operand);
        self.buf.emit_u8(imm);
    }

    /// CDQ (sign-extend EAX into EDX:EAX)
    pub fn cdq(&mut self) {
        self.buf.emit_u8(0x99);
    }

    /// CQO (sign-extend RAX into RDX:RAX)
    pub fn cqo(&mut self) {
        self.buf.emit_u8(0x48);
        self.buf.emit_u8(0x99);
    }

    /// SETcc r8
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        self.byte_op_rm(&[0x0F, 0x90 + cond as u8], 0, dst.into());
    }

    // ==================== Stack ====================

    /// PUSH reg (pointer width)
    pub fn push(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP reg (pointer width)
    pub fn pop(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// PUSH [mem] (pointer width)
    pub fn push_m(&mut self, mem: Mem) {
        self.op_rm(Width::Dword, &[0xFF], 6, mem.into());
    }

    /// PUSH imm32 (sign-extended to pointer width)
    pub fn push_i32(&mut self, imm: i32) {
        self.buf.emit_u8(0x68);
        self.buf.emit_u32(imm as u32);
    }

    // ==================== Control Flow ====================

    /// CALL reg
    pub fn call_r(&mut self, reg: Reg) {
        self.op_rm(Width::Dword, &[0xFF], 2, reg.into());
    }

    /// CALL [mem]
    pub fn call_m(&mut self, mem: Mem) {
        self.op_rm(Width::Dword, &[0xFF], 2, mem.into());
    }

    /// JMP reg
    pub fn jmp_r(&mut self, reg: Reg) {
        self.op_rm(Width::Dword, &[0xFF], 4, reg.into());
    }

    /// JMP [mem]
    pub fn jmp_m(&mut self, mem: Mem) {
        self.op_rm(Width::Dword, &[0xFF], 4, mem.into());
    }

    /// Call an absolute address. Clobbers R11 in 64-bit mode.
    pub fn call_abs(&mut self, target: usize) {
        match self.mode {
            Mode::Bits32 => {
                self.buf.emit_u8(0xE8);
                let rel = target.wrapping_sub(self.buf.address() + 4);
                self.buf.emit_u32(rel as u32);
            }
            Mode::Bits64 => {
                self.mov_ri(Width::Qword, Reg::R11, target as i64);
                self.call_r(Reg::R11);
            }
        }
    }

    /// JMP rel32 with the displacement left for patching.
    pub fn jmp_rel32(&mut self) -> Site {
        self.buf.emit_u8(0xE9);
        self.placeholder(SiteKind::Rel32)
    }

    /// Jcc rel32 with the displacement left for patching.
    pub fn jcc_rel32(&mut self, cond: Cond) -> Site {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.placeholder(SiteKind::Rel32)
    }

    /// JMP rel8 for short forward skips.
    pub fn jmp_rel8(&mut self) -> Site {
        self.buf.emit_u8(0xEB);
        self.placeholder(SiteKind::Rel8)
    }

    /// Jcc rel8 for short forward skips.
    pub fn jcc_rel8(&mut self, cond: Cond) -> Site {
        self.buf.emit_u8(0x70 + cond as u8);
        self.placeholder(SiteKind::Rel8)
    }

    /// Unconditional jump whose absolute target is patched later. Reaches
    /// any address in either mode.
    pub fn jmp_far(&mut self) -> Site {
        match self.mode {
            Mode::Bits32 => self.jmp_rel32(),
            Mode::Bits64 => {
                // jmp [rip+0] followed by the 64-bit target
                self.buf.emit_bytes(&[0xFF, 0x25, 0, 0, 0, 0]);
                self.placeholder(SiteKind::Abs64)
            }
        }
    }

    /// Jump (conditionally, unless `cond` is `None`) to a known address,
    /// falling back to an indirect far jump when rel32 cannot reach.
    pub fn jump_to(&mut self, cond: Option<Cond>, target: usize) {
        let near_len = if cond.is_some() { 6 } else { 5 };
        let rel = target as i64 - (self.buf.address() + near_len) as i64;
        if self.mode == Mode::Bits32 || fits_i32(rel) {
            let site = match cond {
                Some(c) => self.jcc_rel32(c),
                None => self.jmp_rel32(),
            };
            self.buf.patch_local(site, target);
            return;
        }
        let skip = cond.map(|c| self.jcc_rel8(c.invert()));
        let site = self.jmp_far();
        self.buf.patch_local(site, target);
        if let Some(skip) = skip {
            self.bind(skip);
        }
    }

    /// Point a short or near site at the current position.
    pub fn bind(&mut self, site: Site) {
        let here = self.buf.address();
        self.buf.patch_local(site, here);
    }

    fn placeholder(&mut self, kind: SiteKind) -> Site {
        let offset = self.buf.offset();
        match kind {
            SiteKind::Rel8 => self.buf.emit_u8(0),
            SiteKind::Rel32 => self.buf.emit_u32(0),
            SiteKind::Abs64 => self.buf.emit_u64(0),
        }
        Site {
            address: self.buf.address_at(offset),
            kind,
        }
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// INT3, used to pad unreachable space.
    pub fn int3(&mut self) {
        self.buf.emit_u8(0xCC);
    }

    // ==================== SSE ====================

    /// MOVSS/MOVSD xmm, [mem]
    pub fn movs_load(&mut self, prec: Precision, dst: Xmm, src: Mem) {
        self.sse(Some(prec.prefix()), Width::Dword, 0x10, dst.0, src.into());
    }

    /// MOVSS/MOVSD [mem], xmm
    pub fn movs_store(&mut self, prec: Precision, dst: Mem, src: Xmm) {
        self.sse(Some(prec.prefix()), Width::Dword, 0x11, src.0, dst.into());
    }

    /// ADDSx/SUBSx/MULSx/DIVSx
    pub fn sse_arith(&mut self, op: SseOp, prec: Precision, dst: Xmm, src: Rm) {
        self.sse(Some(prec.prefix()), Width::Dword, op as u8, dst.0, src);
    }

    /// UCOMISS/UCOMISD
    pub fn ucomis(&mut self, prec: Precision, a: Xmm, b: Rm) {
        let prefix = match prec {
            Precision::Single => None,
            Precision::Double => Some(0x66),
        };
        self.sse(prefix, Width::Dword, 0x2E, a.0, b);
    }

    /// CVTSI2SS/CVTSI2SD from a 32- or 64-bit integer
    pub fn cvtsi2s(&mut self, prec: Precision, int_width: Width, dst: Xmm, src: Rm) {
        self.sse(Some(prec.prefix()), int_width, 0x2A, dst.0, src);
    }

    /// CVTTSS2SI/CVTTSD2SI into a 32- or 64-bit integer
    pub fn cvtts2si(&mut self, prec: Precision, int_width: Width, dst: Reg, src: Rm) {
        self.sse(Some(prec.prefix()), int_width, 0x2C, dst as u8, src);
    }

    /// CVTSS2SD (`from` single) or CVTSD2SS (`from` double)
    pub fn cvt_precision(&mut self, from: Precision, dst: Xmm, src: Rm) {
        self.sse(Some(from.prefix()), Width::Dword, 0x5A, dst.0, src);
    }

    /// MOVD/MOVQ xmm, r/m
    pub fn movd_to_xmm(&mut self, width: Width, dst: Xmm, src: Rm) {
        self.sse(Some(0x66), width, 0x6E, dst.0, src);
    }

    /// MOVD/MOVQ r/m, xmm
    pub fn movd_from_xmm(&mut self, width: Width, dst: Rm, src: Xmm) {
        self.sse(Some(0x66), width, 0x7E, src.0, dst);
    }

    // ==================== x87 (32-bit float returns) ====================

    /// FSTP dword/qword [mem]
    pub fn fstp(&mut self, prec: Precision, mem: Mem) {
        let opcode = match prec {
            Precision::Single => 0xD9,
            Precision::Double => 0xDD,
        };
        self.op_rm(Width::Dword, &[opcode], 3, mem.into());
    }
}
