//! Bytecode format shared by the interpreter and the JIT.
//!
//! An instruction is a run of 32-bit words. Byte 0 of the first word is the
//! opcode and the high half of the first word carries the first 16-bit
//! operand. The remaining operands follow in the words after it according to
//! the opcode's [`Layout`]. Pointer operands always occupy two words.
//!
//! Variable slot `n` lives at `frame_base - 4 * n`. The value stack grows
//! downward. Branch displacements are counted in words from the end of the
//! branch instruction.

use crate::error::{JitError, JitResult};

/// Operand layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// No operands.
    None,
    /// `a0`.
    W,
    /// `a0`, `a1` in the low half of word 1.
    WW,
    /// `a0`, `a1`, `a2` in the high half of word 1.
    WWW,
    /// 32-bit operand in word 1.
    Dw,
    /// `a0` plus a 32-bit operand in word 1.
    WDw,
    /// `a0`, `a1` plus a 32-bit operand in word 2.
    WWDw,
    /// 64-bit operand in words 1-2.
    Qw,
    /// `a0` plus a 64-bit operand in words 1-2.
    WQw,
    /// Pointer in words 1-2.
    Ptr,
    /// `a0` plus a pointer in words 1-2.
    WPtr,
    /// Pointer in words 1-2 plus a 32-bit operand in word 3.
    PtrDw,
}

impl Layout {
    /// Size in words.
    pub const fn size(self) -> usize {
        match self {
            Layout::None | Layout::W => 1,
            Layout::WW | Layout::WWW | Layout::Dw | Layout::WDw => 2,
            Layout::WWDw | Layout::Qw | Layout::WQw | Layout::Ptr | Layout::WPtr => 3,
            Layout::PtrDw => 4,
        }
    }
}

macro_rules! opcodes {
    ($($name:ident = $layout:ident,)*) => {
        /// Every opcode understood by the interpreter.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub const fn layout(self) -> Layout {
                match self {
                    $(Opcode::$name => Layout::$layout,)*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }
        }
    };
}

opcodes! {
    PopPtr = None,
    PshGPtr = Ptr,
    PshC4 = Dw,
    PshV4 = W,
    Psf = W,
    SwapPtr = None,
    Not = W,
    PshG4 = Ptr,
    LdGRdR4 = WPtr,
    Call = Dw,
    Ret = W,
    Jmp = Dw,
    Jz = Dw,
    Jnz = Dw,
    Js = Dw,
    Jns = Dw,
    Jp = Dw,
    Jnp = Dw,
    Tz = None,
    Tnz = None,
    Ts = None,
    Tns = None,
    Tp = None,
    Tnp = None,
    NegI = W,
    NegF = W,
    NegD = W,
    IncI16 = None,
    IncI8 = None,
    DecI16 = None,
    DecI8 = None,
    IncI = None,
    DecI = None,
    IncF = None,
    DecF = None,
    IncD = None,
    DecD = None,
    IncVi = W,
    DecVi = W,
    BNot = W,
    BAnd = WWW,
    BOr = WWW,
    BXor = WWW,
    BSll = WWW,
    BSrl = WWW,
    BSra = WWW,
    Copy = WDw,
    PshC8 = Qw,
    PshVPtr = W,
    RdsPtr = None,
    CmpD = WW,
    CmpU = WW,
    CmpF = WW,
    CmpI = WW,
    CmpIi = WDw,
    CmpIf = WDw,
    CmpIu = WDw,
    JmpP = W,
    PopRPtr = None,
    PshRPtr = None,
    Str = W,
    CallSys = Dw,
    CallBnd = Dw,
    Suspend = None,
    Alloc = PtrDw,
    Free = WPtr,
    LoadObj = W,
    StoreObj = W,
    GetObj = W,
    RefCpy = Ptr,
    ChkRef = None,
    GetObjRef = W,
    GetRef = W,
    PshNull = None,
    ClrVPtr = W,
    ObjType = Ptr,
    TypeId = Dw,
    SetV1 = WDw,
    SetV2 = WDw,
    SetV4 = WDw,
    SetV8 = WQw,
    AddSi = WDw,
    CpyVtoV4 = WW,
    CpyVtoV8 = WW,
    CpyVtoR4 = W,
    CpyVtoR8 = W,
    CpyVtoG4 = WPtr,
    CpyRtoV4 = W,
    CpyRtoV8 = W,
    CpyGtoV4 = WPtr,
    WrtV1 = W,
    WrtV2 = W,
    WrtV4 = W,
    WrtV8 = W,
    Rdr1 = W,
    Rdr2 = W,
    Rdr4 = W,
    Rdr8 = W,
    Ldg = Ptr,
    Ldv = W,
    Pga = Ptr,
    CmpPtr = WW,
    Var = W,
    IToF = W,
    FToI = W,
    UToF = W,
    FToU = W,
    SbToI = W,
    SwToI = W,
    UbToI = W,
    UwToI = W,
    DToI = WW,
    DToU = WW,
    DToF = WW,
    IToD = WW,
    UToD = WW,
    FToD = WW,
    AddI = WWW,
    SubI = WWW,
    MulI = WWW,
    DivI = WWW,
    ModI = WWW,
    AddF = WWW,
    SubF = WWW,
    MulF = WWW,
    DivF = WWW,
    ModF = WWW,
    AddD = WWW,
    SubD = WWW,
    MulD = WWW,
    DivD = WWW,
    ModD = WWW,
    AddIi = WWDw,
    SubIi = WWDw,
    MulIi = WWDw,
    AddIf = WWDw,
    SubIf = WWDw,
    MulIf = WWDw,
    SetG4 = PtrDw,
    ChkRefS = None,
    ChkNullV = W,
    CallIntf = Dw,
    IToB = W,
    IToW = W,
    Cast = Dw,
    I64ToI = WW,
    UToI64 = WW,
    IToI64 = WW,
    FToI64 = WW,
    DToI64 = W,
    FToU64 = WW,
    DToU64 = W,
    I64ToF = WW,
    U64ToF = WW,
    I64ToD = W,
    U64ToD = W,
    NegI64 = W,
    IncI64 = None,
    DecI64 = None,
    BNot64 = W,
    AddI64 = WWW,
    SubI64 = WWW,
    MulI64 = WWW,
    DivI64 = WWW,
    ModI64 = WWW,
    BAnd64 = WWW,
    BOr64 = WWW,
    BXor64 = WWW,
    BSll64 = WWW,
    BSrl64 = WWW,
    BSra64 = WWW,
    CmpI64 = WW,
    CmpU64 = WW,
    ChkNullS = W,
    ClrHi = None,
    JitEntry = Ptr,
    CallPtr = W,
    FuncPtr = Ptr,
    LoadThisR = WDw,
    PshV8 = W,
    DivU = WWW,
    ModU = WWW,
    DivU64 = WWW,
    ModU64 = WWW,
    LoadRObjR = WWDw,
    LoadVObjR = WWDw,
    RefCpyV = WPtr,
    JLowZ = Dw,
    JLowNZ = Dw,
    AllocMem = WDw,
    SetListSize = WWDw,
    PshListElmnt = WDw,
    SetListType = WWDw,
    PowI = WWW,
    PowU = WWW,
    PowF = WWW,
    PowD = WWW,
    PowDi = WWW,
    PowI64 = WWW,
    PowU64 = WWW,
    Thiscall1 = Dw,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    pub const fn size(self) -> usize {
        self.layout().size()
    }

    /// Branches whose 32-bit operand is a word displacement.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Jmp
                | Opcode::Jz
                | Opcode::Jnz
                | Opcode::Js
                | Opcode::Jns
                | Opcode::Jp
                | Opcode::Jnp
                | Opcode::JLowZ
                | Opcode::JLowNZ
        )
    }
}

/// A decoded instruction borrowing its words from the program.
#[derive(Debug, Clone, Copy)]
pub struct Instr<'a> {
    pub offset: usize,
    pub op: Opcode,
    words: &'a [u32],
}

impl<'a> Instr<'a> {
    pub fn size(&self) -> usize {
        self.words.len()
    }

    /// Offset of the instruction that follows this one.
    pub fn next_offset(&self) -> usize {
        self.offset + self.words.len()
    }

    pub fn a0(&self) -> i16 {
        (self.words[0] >> 16) as i16
    }

    /// Second 16-bit operand; zero for one-word layouts.
    pub fn a1(&self) -> i16 {
        self.words.get(1).map_or(0, |w| *w as i16)
    }

    /// Third 16-bit operand; zero for one-word layouts.
    pub fn a2(&self) -> i16 {
        self.words.get(1).map_or(0, |w| (*w >> 16) as i16)
    }

    /// The 32-bit operand, wherever the layout places it.
    pub fn dword(&self) -> u32 {
        match self.op.layout() {
            Layout::WWDw => self.words[2],
            Layout::PtrDw => self.words[3],
            _ => self.words[1],
        }
    }

    pub fn int(&self) -> i32 {
        self.dword() as i32
    }

    pub fn float(&self) -> f32 {
        f32::from_bits(self.dword())
    }

    pub fn qword(&self) -> u64 {
        self.words[1] as u64 | ((self.words[2] as u64) << 32)
    }

    pub fn ptr(&self) -> usize {
        self.qword() as usize
    }

    /// Target of a branch instruction.
    pub fn branch_target(&self) -> usize {
        (self.next_offset() as i64 + self.int() as i64) as usize
    }
}

/// Read-only view of a function's bytecode.
#[derive(Debug, Clone, Copy)]
pub struct Bytecode<'a> {
    words: &'a [u32],
}

impl<'a> Bytecode<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self { words }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &'a [u32] {
        self.words
    }

    pub fn decode(&self, offset: usize) -> JitResult<Instr<'a>> {
        let first = *self.words.get(offset).ok_or(JitError::MalformedBytecode {
            offset,
            reason: "offset past end",
        })?;
        let op = Opcode::from_u8(first as u8).ok_or(JitError::MalformedBytecode {
            offset,
            reason: "unknown opcode",
        })?;
        let words = self
            .words
            .get(offset..offset + op.size())
            .ok_or(JitError::MalformedBytecode {
                offset,
                reason: "truncated instruction",
            })?;
        Ok(Instr { offset, op, words })
    }

    /// Decode the instruction at `offset`, or `None` at or past the end.
    pub fn peek(&self, offset: usize) -> Option<Instr<'a>> {
        self.decode(offset).ok()
    }

    pub fn iter(&self) -> InstrIter<'a> {
        InstrIter {
            code: *self,
            offset: 0,
        }
    }
}

pub struct InstrIter<'a> {
    code: Bytecode<'a>,
    offset: usize,
}

impl<'a> Iterator for InstrIter<'a> {
    type Item = JitResult<Instr<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.code.len() {
            return None;
        }
        match self.code.decode(self.offset) {
            Ok(instr) => {
                self.offset = instr.next_offset();
                Some(Ok(instr))
            }
            Err(e) => {
                self.offset = self.code.len();
                Some(Err(e))
            }
        }
    }
}

/// Assembles bytecode, mostly for embedders' tests and tooling.
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    words: Vec<u32>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.words.len()
    }

    pub fn finish(self) -> Vec<u32> {
        self.words
    }

    fn head(&mut self, op: Opcode, expected: Layout, a0: i16) {
        debug_assert_eq!(op.layout(), expected, "{} has a different layout", op.name());
        self.words.push(op as u32 | ((a0 as u16 as u32) << 16));
    }

    fn pair(a1: i16, a2: i16) -> u32 {
        a1 as u16 as u32 | ((a2 as u16 as u32) << 16)
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.head(op, Layout::None, 0);
        self
    }

    pub fn w(&mut self, op: Opcode, a0: i16) -> &mut Self {
        self.head(op, Layout::W, a0);
        self
    }

    pub fn ww(&mut self, op: Opcode, a0: i16, a1: i16) -> &mut Self {
        self.head(op, Layout::WW, a0);
        self.words.push(Self::pair(a1, 0));
        self
    }

    pub fn www(&mut self, op: Opcode, a0: i16, a1: i16, a2: i16) -> &mut Self {
        self.head(op, Layout::WWW, a0);
        self.words.push(Self::pair(a1, a2));
        self
    }

    pub fn dw(&mut self, op: Opcode, value: u32) -> &mut Self {
        self.head(op, Layout::Dw, 0);
        self.words.push(value);
        self
    }

    pub fn w_dw(&mut self, op: Opcode, a0: i16, value: u32) -> &mut Self {
        self.head(op, Layout::WDw, a0);
        self.words.push(value);
        self
    }

    pub fn ww_dw(&mut self, op: Opcode, a0: i16, a1: i16, value: u32) -> &mut Self {
        self.head(op, Layout::WWDw, a0);
        self.words.push(Self::pair(a1, 0));
        self.words.push(value);
        self
    }

    pub fn qw(&mut self, op: Opcode, value: u64) -> &mut Self {
        self.head(op, Layout::Qw, 0);
        self.push_qword(value);
        self
    }

    pub fn w_qw(&mut self, op: Opcode, a0: i16, value: u64) -> &mut Self {
        self.head(op, Layout::WQw, a0);
        self.push_qword(value);
        self
    }

    pub fn ptr(&mut self, op: Opcode, value: usize) -> &mut Self {
        self.head(op, Layout::Ptr, 0);
        self.push_qword(value as u64);
        self
    }

    pub fn w_ptr(&mut self, op: Opcode, a0: i16, value: usize) -> &mut Self {
        self.head(op, Layout::WPtr, a0);
        self.push_qword(value as u64);
        self
    }

    pub fn ptr_dw(&mut self, op: Opcode, ptr: usize, value: u32) -> &mut Self {
        self.head(op, Layout::PtrDw, 0);
        self.push_qword(ptr as u64);
        self.words.push(value);
        self
    }

    pub fn entry(&mut self) -> &mut Self {
        self.ptr(Opcode::JitEntry, 0)
    }

    /// Branch to an offset that is already known.
    pub fn branch(&mut self, op: Opcode, target: usize) -> &mut Self {
        let site = self.branch_site(op);
        self.patch_branch(site, target);
        self
    }

    /// Emit a branch with an unknown target and return its site for
    /// [`Self::patch_branch`].
    pub fn branch_site(&mut self, op: Opcode) -> usize {
        debug_assert!(op.is_branch());
        let site = self.offset();
        self.dw(op, 0);
        site
    }

    pub fn patch_branch(&mut self, site: usize, target: usize) {
        let rel = target as i64 - (site as i64 + 2);
        self.words[site + 1] = rel as i32 as u32;
    }

    fn push_qword(&mut self, value: u64) {
        self.words.push(value as u32);
        self.words.push((value >> 32) as u32);
    }
}
