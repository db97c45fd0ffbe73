//! Shared harness for the integration suites: a mock engine, an execution
//! context whose hooks generated code calls, and a reference interpreter
//! that runs the same bytecode without native code (or hands over to it at
//! entry points).

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::c_void;

use scriptjit::vm::engine::Ctx;
use scriptjit::vm::{
    Bytecode, BytecodeBuilder, Engine, FunctionId, FunctionKind, Instr, JitSlot, ObjectType, Opcode,
    RuntimeHooks, ScriptFunction, SystemFunction, VmRegisters, PTR_DWORDS,
};
use scriptjit::{JitCompiler, JitConfig, NativeHandle};

/// Words of value stack every context gets.
pub const STACK_WORDS: usize = 4096;

/// Behaviour ids the mock engine understands.
pub const ADD_REF: FunctionId = 900;
pub const RELEASE: FunctionId = 901;
pub const DESTRUCT: FunctionId = 902;

/// Interpreter side of a host function: receives the object (or zero) and
/// the argument dwords, returns the new value register.
pub type Thunk = fn(&mut Context, usize, &[u32]) -> u64;

pub struct TestEngine {
    functions: HashMap<FunctionId, ScriptFunction>,
    types: HashMap<usize, ObjectType>,
    thunks: HashMap<FunctionId, Thunk>,
    overrides: HashMap<FunctionId, FunctionId>,
    imports: HashMap<u32, FunctionId>,
    hooks: RuntimeHooks,
}

impl TestEngine {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
            types: HashMap::new(),
            thunks: HashMap::new(),
            overrides: HashMap::new(),
            imports: HashMap::new(),
            hooks: RuntimeHooks {
                prepare_script_call,
                return_script_function,
                call_interface_method,
                call_bound_function,
                call_system_function,
                do_suspend,
                check_status,
                alloc_object,
                free_object,
                call_object_method,
            },
        }
    }

    pub fn add(&mut self, func: ScriptFunction) -> &mut Self {
        self.functions.insert(func.id, func);
        self
    }

    pub fn add_host(&mut self, id: FunctionId, sys: SystemFunction, thunk: Thunk) -> &mut Self {
        self.functions.insert(id, ScriptFunction::system(id, "host", sys));
        self.thunks.insert(id, thunk);
        self
    }

    pub fn add_type(&mut self, handle: usize, ty: ObjectType) -> &mut Self {
        self.types.insert(handle, ty);
        self
    }

    /// Calls to interface method `method` dispatch to `concrete`.
    pub fn add_override(&mut self, method: FunctionId, concrete: FunctionId) -> &mut Self {
        self.overrides.insert(method, concrete);
        self
    }

    pub fn add_import(&mut self, import: u32, concrete: FunctionId) -> &mut Self {
        self.imports.insert(import, concrete);
        self
    }

    pub fn func(&self, id: FunctionId) -> &ScriptFunction {
        &self.functions[&id]
    }
}

impl Engine for TestEngine {
    fn function(&self, id: FunctionId) -> Option<&ScriptFunction> {
        self.functions.get(&id)
    }

    fn object_type(&self, handle: usize) -> Option<&ObjectType> {
        self.types.get(&handle)
    }

    fn hooks(&self) -> &RuntimeHooks {
        &self.hooks
    }
}

/// A script function with `vars` local dwords.
pub fn script(id: FunctionId, vars: u32, build: impl FnOnce(&mut BytecodeBuilder)) -> ScriptFunction {
    let mut b = BytecodeBuilder::new();
    build(&mut b);
    let mut func = ScriptFunction::script(id, &format!("f{id}"), b.finish());
    func.variable_space = vars;
    func
}

/// Compile `ids` and seal, failing the test when any produces nothing.
pub fn compile_all(jit: &JitCompiler, engine: &TestEngine, ids: &[FunctionId]) -> Vec<NativeHandle> {
    let handles = ids
        .iter()
        .map(|id| {
            jit.compile(engine, engine.func(*id))
                .expect("compile")
                .expect("function has an entry point")
        })
        .collect();
    jit.seal_all().expect("seal");
    handles
}

pub fn small_pages() -> JitConfig {
    JitConfig {
        page_size: 4096,
        ..JitConfig::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Never enter native code.
    Interpreted,
    /// Enter native code at every entry point that has some.
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Suspended,
    Exception(String),
}

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    function: FunctionId,
    position: usize,
    frame: *mut u32,
    stack: *mut u32,
}

#[derive(Debug)]
pub struct Object {
    pub refs: i32,
    pub size: usize,
    storage: Box<[u64]>,
}

/// One execution context. Boxed, since generated code holds its address.
pub struct Context {
    pub regs: VmRegisters,
    stack: Box<[u32]>,
    engine: *const TestEngine,
    pub current: FunctionId,
    calls: Vec<CallFrame>,
    pub mode: Mode,
    pub finished: bool,
    pub suspended: bool,
    pub exception: Option<String>,
    /// Times native code was entered from the interpreter.
    pub native_entries: usize,
    /// Interpreted instructions, entry markers excluded.
    pub interpreted: usize,
    pub objects: HashMap<usize, Object>,
    pub frees: usize,
    pub destructs: usize,
    pub host_calls: usize,
}

impl Context {
    /// Context about to run `entry` with `args` as its first variables
    /// (`args[0]` is variable 0, `args[1]` variable -1 and so on).
    pub fn new(engine: &TestEngine, entry: FunctionId, args: &[u32], mode: Mode) -> Box<Self> {
        let mut ctx = Box::new(Self {
            regs: VmRegisters::default(),
            stack: vec![0u32; STACK_WORDS].into_boxed_slice(),
            engine,
            current: entry,
            calls: Vec::new(),
            mode,
            finished: false,
            suspended: false,
            exception: None,
            native_entries: 0,
            interpreted: 0,
            objects: HashMap::new(),
            frees: 0,
            destructs: 0,
            host_calls: 0,
        });
        let vars = engine.func(entry).variable_space as usize;
        let base = ctx.stack.as_mut_ptr();
        // SAFETY: every offset stays inside the stack allocation.
        unsafe {
            let args_at = base.add(STACK_WORDS - 64 - args.len());
            for (i, arg) in args.iter().enumerate() {
                args_at.add(i).write(*arg);
            }
            ctx.regs.stack_frame_pointer = args_at;
            ctx.regs.stack_pointer = args_at.sub(vars);
        }
        let this: *mut Context = &mut *ctx;
        ctx.regs.ctx = this as *mut c_void;
        ctx
    }

    fn engine(&self) -> &TestEngine {
        // SAFETY: tests keep the engine alive for as long as the context.
        unsafe { &*self.engine }
    }

    pub fn var_ptr(&self, n: i16) -> *mut u32 {
        self.regs.stack_frame_pointer.wrapping_offset(-(n as isize))
    }

    pub fn var(&self, n: i16) -> u32 {
        unsafe { self.var_ptr(n).read() }
    }

    pub fn set_var(&mut self, n: i16, value: u32) {
        unsafe { self.var_ptr(n).write(value) }
    }

    pub fn var64(&self, n: i16) -> u64 {
        unsafe { (self.var_ptr(n) as *const u64).read_unaligned() }
    }

    pub fn set_var64(&mut self, n: i16, value: u64) {
        unsafe { (self.var_ptr(n) as *mut u64).write_unaligned(value) }
    }

    pub fn var_ptr_value(&self, n: i16) -> usize {
        unsafe { (self.var_ptr(n) as *const usize).read_unaligned() }
    }

    pub fn set_var_ptr_value(&mut self, n: i16, value: usize) {
        unsafe { (self.var_ptr(n) as *mut usize).write_unaligned(value) }
    }

    pub fn var_f64(&self, n: i16) -> f64 {
        f64::from_bits(self.var64(n))
    }

    pub fn var_f32(&self, n: i16) -> f32 {
        f32::from_bits(self.var(n))
    }

    pub fn value(&self) -> u32 {
        self.regs.value_register as u32
    }

    /// Distance of the stack pointer below the frame base, in dwords.
    pub fn stack_depth(&self) -> isize {
        unsafe { self.regs.stack_frame_pointer.offset_from(self.regs.stack_pointer) }
    }

    fn push(&mut self, value: u32) {
        unsafe {
            self.regs.stack_pointer = self.regs.stack_pointer.sub(1);
            self.regs.stack_pointer.write(value);
        }
    }

    fn pop(&mut self) -> u32 {
        unsafe {
            let value = self.regs.stack_pointer.read();
            self.regs.stack_pointer = self.regs.stack_pointer.add(1);
            value
        }
    }

    fn push64(&mut self, value: u64) {
        unsafe {
            self.regs.stack_pointer = self.regs.stack_pointer.sub(2);
            (self.regs.stack_pointer as *mut u64).write_unaligned(value);
        }
    }

    pub fn push_ptr(&mut self, value: usize) {
        unsafe {
            self.regs.stack_pointer = self.regs.stack_pointer.sub(PTR_DWORDS);
            (self.regs.stack_pointer as *mut usize).write_unaligned(value);
        }
    }

    fn top_ptr(&self) -> usize {
        unsafe { (self.regs.stack_pointer as *const usize).read_unaligned() }
    }

    fn set_top_ptr(&mut self, value: usize) {
        unsafe { (self.regs.stack_pointer as *mut usize).write_unaligned(value) }
    }

    fn pop_ptr(&mut self) -> usize {
        let value = self.top_ptr();
        self.regs.stack_pointer = self.regs.stack_pointer.wrapping_add(PTR_DWORDS);
        value
    }

    /// Raise a script exception the way the engine would.
    pub fn raise(&mut self, message: &str) {
        self.exception = Some(message.to_string());
        self.regs.do_process_suspend = 1;
    }

    /// Push the caller's state and set up a frame for `id`.
    fn enter(&mut self, id: FunctionId) -> bool {
        let engine = self.engine();
        let Some(func) = engine.function(id) else {
            return false;
        };
        if !matches!(func.kind, FunctionKind::Script) {
            return false;
        }
        let vars = func.variable_space as usize;
        self.calls.push(CallFrame {
            function: self.current,
            position: self.regs.program_position,
            frame: self.regs.stack_frame_pointer,
            stack: self.regs.stack_pointer,
        });
        self.current = id;
        self.regs.stack_frame_pointer = self.regs.stack_pointer;
        self.regs.stack_pointer = self.regs.stack_pointer.wrapping_sub(vars);
        self.regs.program_position = 0;
        true
    }

    /// Restore the caller's state, or finish when there is no caller.
    fn leave_function(&mut self) {
        match self.calls.pop() {
            Some(frame) => {
                self.current = frame.function;
                self.regs.program_position = frame.position;
                self.regs.stack_frame_pointer = frame.frame;
                self.regs.stack_pointer = frame.stack;
            }
            None => self.finished = true,
        }
    }

    pub fn refs(&self, obj: usize) -> Option<i32> {
        self.objects.get(&obj).map(|o| o.refs)
    }

    fn allocate(&mut self, size: usize) -> usize {
        let mut storage = vec![0u64; size.div_ceil(8).max(1)].into_boxed_slice();
        let addr = storage.as_mut_ptr() as usize;
        self.objects.insert(addr, Object { refs: 1, size, storage });
        addr
    }

    fn free(&mut self, obj: usize) {
        if self.objects.remove(&obj).is_some() {
            self.frees += 1;
        }
    }

    fn behave(&mut self, obj: usize, behaviour: FunctionId) {
        match behaviour {
            ADD_REF => {
                if let Some(o) = self.objects.get_mut(&obj) {
                    o.refs += 1;
                }
            }
            RELEASE => {
                let dead = self.objects.get_mut(&obj).is_some_and(|o| {
                    o.refs -= 1;
                    o.refs == 0
                });
                if dead {
                    self.free(obj);
                }
            }
            DESTRUCT => self.destructs += 1,
            other => panic!("unknown behaviour {other}"),
        }
    }

    /// Run a host function the way the engine marshals it: object first if
    /// it is a method, then the parameters, all popped.
    fn call_host(&mut self, id: FunctionId, object: Option<usize>) -> Result<(), ()> {
        let engine = self.engine();
        let func = engine.func(id);
        let sys = func.as_system().expect("host function").clone();
        let thunk = engine.thunks[&id];
        let obj = match (sys.bound_object, object) {
            (Some(addr), _) => addr,
            (None, Some(obj)) => obj,
            (None, None) if sys.is_method() => self.pop_ptr(),
            (None, None) => 0,
        };
        if sys.is_method() && obj == 0 {
            self.raise("null pointer access");
            return Err(());
        }
        let obj = (obj as isize + sys.base_offset as isize) as usize;
        let n = sys.param_dwords();
        let args: Vec<u32> = (0..n).map(|i| unsafe { self.regs.stack_pointer.add(i).read() }).collect();
        self.regs.stack_pointer = self.regs.stack_pointer.wrapping_add(n);
        self.host_calls += 1;
        let result = thunk(self, obj, &args);
        use scriptjit::vm::ReturnShape;
        match sys.returns {
            ReturnShape::Void => {}
            ReturnShape::Bool => self.regs.value_register = result & 0xFF,
            ReturnShape::Int32 | ReturnShape::Float => self.regs.value_register = result as u32 as u64,
            _ => self.regs.value_register = result,
        }
        Ok(())
    }

    /// Run until the outermost function returns, suspends or raises.
    pub fn run(&mut self) -> Outcome {
        loop {
            if let Some(message) = &self.exception {
                return Outcome::Exception(message.clone());
            }
            if self.suspended {
                return Outcome::Suspended;
            }
            if self.finished {
                return Outcome::Finished;
            }
            let engine = self.engine;
            // SAFETY: tests keep the engine alive for as long as the context.
            let func = unsafe { (*engine).func(self.current) };
            let code = Bytecode::new(&func.bytecode);
            let pp = self.regs.program_position;
            if pp >= code.len() {
                self.leave_function();
                continue;
            }
            let instr = code.decode(pp).expect("valid bytecode");
            if instr.op == Opcode::JitEntry && self.mode == Mode::Mixed {
                if let Some(native) = func.jit.native() {
                    let before = (pp, self.current, self.regs.stack_frame_pointer);
                    self.native_entries += 1;
                    let regs: *mut VmRegisters = &mut self.regs;
                    // SAFETY: pages are sealed by the suites before running,
                    // and `regs` belongs to this live context.
                    unsafe { native(regs, pp) };
                    let after = (self.regs.program_position, self.current, self.regs.stack_frame_pointer);
                    if after != before {
                        continue;
                    }
                }
            }
            self.step(&instr);
        }
    }

    /// Resume after a suspension.
    pub fn resume(&mut self) -> Outcome {
        self.suspended = false;
        self.regs.do_process_suspend = 0;
        self.run()
    }

    fn step(&mut self, instr: &Instr<'_>) {
        use Opcode::*;
        let (a0, a1, a2) = (instr.a0(), instr.a1(), instr.a2());
        let mut next = Some(instr.next_offset());
        if instr.op != JitEntry {
            self.interpreted += 1;
        }
        match instr.op {
            JitEntry => {}
            Suspend => {
                if self.regs.do_process_suspend != 0 {
                    self.suspended = true;
                }
            }
            SetV4 => self.set_var(a0, instr.dword()),
            SetV8 => self.set_var64(a0, instr.qword()),
            CpyVtoV4 => self.set_var(a0, self.var(a1)),
            CpyVtoV8 => self.set_var64(a0, self.var64(a1)),
            CpyVtoR4 => self.regs.value_register = self.var(a0) as u64,
            CpyVtoR8 => self.regs.value_register = self.var64(a0),
            CpyRtoV4 => self.set_var(a0, self.regs.value_register as u32),
            CpyRtoV8 => self.set_var64(a0, self.regs.value_register),
            AddI | SubI | MulI | BAnd | BOr | BXor | BSll | BSrl | BSra => {
                let (x, y) = (self.var(a1) as i32, self.var(a2) as i32);
                let r = match instr.op {
                    AddI => x.wrapping_add(y),
                    SubI => x.wrapping_sub(y),
                    MulI => x.wrapping_mul(y),
                    BAnd => x & y,
                    BOr => x | y,
                    BXor => x ^ y,
                    BSll => x.wrapping_shl(y as u32),
                    BSrl => (x as u32).wrapping_shr(y as u32) as i32,
                    _ => x.wrapping_shr(y as u32),
                };
                self.set_var(a0, r as u32);
            }
            DivI | ModI => {
                let (x, y) = (self.var(a1) as i32, self.var(a2) as i32);
                if y == 0 {
                    return self.raise("divide by zero");
                }
                if x == i32::MIN && y == -1 {
                    return self.raise("overflow in integer division");
                }
                let r = if instr.op == DivI { x / y } else { x % y };
                self.set_var(a0, r as u32);
            }
            DivU | ModU => {
                let (x, y) = (self.var(a1), self.var(a2));
                if y == 0 {
                    return self.raise("divide by zero");
                }
                self.set_var(a0, if instr.op == DivU { x / y } else { x % y });
            }
            AddIi | SubIi | MulIi => {
                let (x, y) = (self.var(a1) as i32, instr.int());
                let r = match instr.op {
                    AddIi => x.wrapping_add(y),
                    SubIi => x.wrapping_sub(y),
                    _ => x.wrapping_mul(y),
                };
                self.set_var(a0, r as u32);
            }
            IncVi => self.set_var(a0, self.var(a0).wrapping_add(1)),
            DecVi => self.set_var(a0, self.var(a0).wrapping_sub(1)),
            NegI => self.set_var(a0, (self.var(a0) as i32).wrapping_neg() as u32),
            BNot => self.set_var(a0, !self.var(a0)),
            AddD | SubD | MulD | DivD => {
                let (x, y) = (self.var_f64(a1), self.var_f64(a2));
                let r = match instr.op {
                    AddD => x + y,
                    SubD => x - y,
                    MulD => x * y,
                    _ => x / y,
                };
                self.set_var64(a0, r.to_bits());
            }
            AddF | SubF | MulF | DivF => {
                let (x, y) = (self.var_f32(a1), self.var_f32(a2));
                let r = match instr.op {
                    AddF => x + y,
                    SubF => x - y,
                    MulF => x * y,
                    _ => x / y,
                };
                self.set_var(a0, r.to_bits());
            }
            CmpI => self.compare((self.var(a0) as i32).cmp(&(self.var(a1) as i32))),
            CmpU => self.compare(self.var(a0).cmp(&self.var(a1))),
            CmpIi => self.compare((self.var(a0) as i32).cmp(&instr.int())),
            CmpIu => self.compare(self.var(a0).cmp(&instr.dword())),
            CmpI64 => self.compare((self.var64(a0) as i64).cmp(&(self.var64(a1) as i64))),
            CmpU64 => self.compare(self.var64(a0).cmp(&self.var64(a1))),
            CmpD => {
                let ord = self.var_f64(a0).partial_cmp(&self.var_f64(a1));
                self.compare(ord.unwrap_or(std::cmp::Ordering::Greater));
            }
            CmpF => {
                let ord = self.var_f32(a0).partial_cmp(&self.var_f32(a1));
                self.compare(ord.unwrap_or(std::cmp::Ordering::Greater));
            }
            Jmp | Jz | Jnz | Js | Jns | Jp | Jnp | JLowZ | JLowNZ => {
                let v = self.regs.value_register as u32 as i32;
                let taken = match instr.op {
                    Jmp => true,
                    Jz => v == 0,
                    Jnz => v != 0,
                    Js => v < 0,
                    Jns => v >= 0,
                    Jp => v > 0,
                    Jnp => v <= 0,
                    JLowZ => v as u8 == 0,
                    _ => v as u8 != 0,
                };
                if taken {
                    next = Some(instr.branch_target());
                }
            }
            Tz | Tnz | Ts | Tns | Tp | Tnp => {
                let v = self.regs.value_register as u32 as i32;
                let r = match instr.op {
                    Tz => v == 0,
                    Tnz => v != 0,
                    Ts => v < 0,
                    Tns => v >= 0,
                    Tp => v > 0,
                    _ => v <= 0,
                };
                self.regs.value_register = r as u64;
            }
            PshC4 => self.push(instr.dword()),
            PshV4 => self.push(self.var(a0)),
            PshV8 => self.push64(self.var64(a0)),
            PshVPtr => self.push_ptr(self.var_ptr_value(a0)),
            Psf => self.push_ptr(self.var_ptr(a0) as usize),
            PshNull => self.push_ptr(0),
            PshRPtr => self.push_ptr(self.regs.value_register as usize),
            PopPtr => {
                self.pop_ptr();
            }
            PopRPtr => self.regs.value_register = self.pop_ptr() as u64,
            RdsPtr => {
                let p = self.top_ptr();
                if p == 0 {
                    return self.raise("null pointer access");
                }
                self.set_top_ptr(unsafe { (p as *const usize).read_unaligned() });
            }
            AddSi => {
                let p = self.top_ptr();
                if p == 0 {
                    return self.raise("null pointer access");
                }
                self.set_top_ptr((p as isize + a0 as isize) as usize);
            }
            Rdr4 => {
                let v = unsafe { (self.regs.value_register as usize as *const u32).read_unaligned() };
                self.set_var(a0, v);
            }
            WrtV4 => unsafe {
                (self.regs.value_register as usize as *mut u32).write_unaligned(self.var(a0))
            },
            Ldv => self.regs.value_register = self.var_ptr(a0) as u64,
            ChkNullV => {
                if self.var_ptr_value(a0) == 0 {
                    return self.raise("null pointer access");
                }
            }
            ChkRef => {
                if self.top_ptr() == 0 {
                    return self.raise("null pointer access");
                }
            }
            ChkNullS => {
                let at = self.regs.stack_pointer.wrapping_add(a0 as usize) as *const usize;
                if unsafe { at.read_unaligned() } == 0 {
                    return self.raise("null pointer access");
                }
            }
            GetRef | GetObjRef => {
                // the slot holds a variable index
                let at = self.regs.stack_pointer.wrapping_add(a0 as usize) as *mut usize;
                let var = unsafe { at.read_unaligned() } as i16;
                let value = if instr.op == GetRef {
                    self.var_ptr(var) as usize
                } else {
                    self.var_ptr_value(var)
                };
                unsafe { at.write_unaligned(value) };
            }
            LoadObj => {
                self.regs.object_register = self.var_ptr_value(a0) as *mut c_void;
                self.regs.object_type = std::ptr::null_mut();
                self.set_var_ptr_value(a0, 0);
            }
            StoreObj => {
                self.set_var_ptr_value(a0, self.regs.object_register as usize);
                self.regs.object_register = std::ptr::null_mut();
            }
            LoadThisR => {
                let p = self.var_ptr_value(0);
                if p == 0 {
                    return self.raise("null pointer access");
                }
                self.regs.value_register = (p as isize + a0 as isize) as u64;
            }
            IToF => self.set_var(a0, (self.var(a0) as i32 as f32).to_bits()),
            FToI => self.set_var(a0, self.var_f32(a0) as i32 as u32),
            IToD => self.set_var64(a0, (self.var(a1) as i32 as f64).to_bits()),
            DToI => self.set_var(a0, self.var_f64(a1) as i32 as u32),
            FToD => self.set_var64(a0, (self.var_f32(a1) as f64).to_bits()),
            DToF => self.set_var(a0, (self.var_f64(a1) as f32).to_bits()),
            UToI64 => self.set_var64(a0, self.var(a1) as u64),
            IToI64 => self.set_var64(a0, self.var(a1) as i32 as i64 as u64),
            AddI64 | SubI64 | MulI64 => {
                let (x, y) = (self.var64(a1), self.var64(a2));
                let r = match instr.op {
                    AddI64 => x.wrapping_add(y),
                    SubI64 => x.wrapping_sub(y),
                    _ => x.wrapping_mul(y),
                };
                self.set_var64(a0, r);
            }
            DivI64 | ModI64 => {
                let (x, y) = (self.var64(a1) as i64, self.var64(a2) as i64);
                if y == 0 {
                    return self.raise("divide by zero");
                }
                if x == i64::MIN && y == -1 {
                    return self.raise("overflow in integer division");
                }
                let r = if instr.op == DivI64 { x / y } else { x % y };
                self.set_var64(a0, r as u64);
            }
            PowI => {
                let (x, y) = (self.var(a1) as i32, self.var(a2) as i32);
                if y < 0 {
                    return self.raise("negative exponent");
                }
                self.set_var(a0, x.wrapping_pow(y as u32) as u32);
            }
            Copy => {
                let dst = self.pop_ptr();
                let src = self.top_ptr();
                if dst == 0 || src == 0 {
                    self.push_ptr(dst);
                    return self.raise("null pointer access");
                }
                unsafe { std::ptr::copy(src as *const u32, dst as *mut u32, a0 as u16 as usize) };
                self.set_top_ptr(dst);
            }
            JmpP => {
                let case = self.var(a0) as i32 as isize;
                let target = instr.next_offset() as isize + 2 * case;
                if target < 0 || target as usize >= Bytecode::new(&self.engine().func(self.current).bytecode).len() {
                    return self.raise("switch case out of range");
                }
                next = Some(target as usize);
            }
            Call => {
                self.regs.program_position = instr.next_offset();
                if !self.enter(instr.dword()) {
                    return self.raise("call failed");
                }
                next = None;
            }
            Ret => {
                self.leave_function();
                self.regs.stack_pointer = self.regs.stack_pointer.wrapping_add(a0 as u16 as usize);
                next = None;
            }
            CallIntf | CallBnd => {
                let target = if instr.op == CallIntf {
                    self.engine().overrides.get(&instr.dword()).copied()
                } else {
                    self.engine().imports.get(&instr.dword()).copied()
                };
                self.regs.program_position = instr.next_offset();
                if !target.is_some_and(|id| self.enter(id)) {
                    return self.raise("unresolved call");
                }
                next = None;
            }
            CallSys => {
                if self.call_host(instr.dword(), None).is_err() {
                    return;
                }
                // a host function may ask for a suspension
                if self.exception.is_none() && self.regs.do_process_suspend != 0 {
                    self.suspended = true;
                }
            }
            Alloc => {
                let ty = self.engine().object_type(instr.ptr()).expect("object type").clone();
                let obj = self.allocate(ty.size);
                let ctor = instr.dword();
                if ctor != 0 && self.call_host(ctor, Some(obj)).is_err() {
                    return;
                }
                let dest = self.pop_ptr();
                if dest != 0 {
                    unsafe { (dest as *mut usize).write_unaligned(obj) };
                }
            }
            Free => {
                let obj = self.var_ptr_value(a0);
                if obj != 0 {
                    let ty = self.engine().object_type(instr.ptr()).expect("object type").clone();
                    match (ty.behaviours.release, ty.behaviours.destruct) {
                        (Some(release), _) => self.behave(obj, release),
                        (None, Some(destruct)) => {
                            self.behave(obj, destruct);
                            self.free(obj);
                        }
                        (None, None) => self.free(obj),
                    }
                    self.set_var_ptr_value(a0, 0);
                }
            }
            RefCpy | RefCpyV => {
                let ty = self.engine().object_type(instr.ptr()).expect("object type").clone();
                let dest = if instr.op == RefCpy {
                    self.pop_ptr()
                } else {
                    self.var_ptr(a0) as usize
                };
                let src = self.top_ptr();
                if let (Some(add_ref), Some(release)) = (ty.behaviours.add_ref, ty.behaviours.release) {
                    if src != 0 {
                        self.behave(src, add_ref);
                    }
                    let old = unsafe { (dest as *const usize).read_unaligned() };
                    if old != 0 {
                        self.behave(old, release);
                    }
                }
                unsafe { (dest as *mut usize).write_unaligned(src) };
            }
            op => panic!("reference interpreter has no rendition of {}", op.name()),
        }
        if let Some(next) = next {
            self.regs.program_position = next;
        }
    }

    fn compare(&mut self, ord: std::cmp::Ordering) {
        self.regs.value_register = ord as i8 as i32 as u32 as u64;
    }
}

/// # Safety
/// `ctx` is the address of a live [`Context`].
unsafe fn context<'a>(ctx: Ctx) -> &'a mut Context {
    unsafe { &mut *(ctx as *mut Context) }
}

unsafe extern "C" fn prepare_script_call(ctx: Ctx, func: FunctionId) -> u8 {
    let ctx = unsafe { context(ctx) };
    if ctx.enter(func) {
        1
    } else {
        ctx.raise("call failed");
        0
    }
}

unsafe extern "C" fn return_script_function(ctx: Ctx) {
    unsafe { context(ctx) }.leave_function();
}

fn dispatch(ctx: &mut Context, target: Option<FunctionId>) -> *const JitSlot {
    match target {
        Some(id) if ctx.enter(id) => &ctx.engine().func(id).jit as *const JitSlot,
        _ => {
            ctx.raise("unresolved call");
            std::ptr::null()
        }
    }
}

unsafe extern "C" fn call_interface_method(ctx: Ctx, func: FunctionId) -> *const JitSlot {
    let ctx = unsafe { context(ctx) };
    let target = ctx.engine().overrides.get(&func).copied();
    dispatch(ctx, target)
}

unsafe extern "C" fn call_bound_function(ctx: Ctx, import: u32) -> *const JitSlot {
    let ctx = unsafe { context(ctx) };
    let target = ctx.engine().imports.get(&import).copied();
    dispatch(ctx, target)
}

unsafe extern "C" fn call_system_function(ctx: Ctx, func: FunctionId, obj: *mut c_void) -> i32 {
    let ctx = unsafe { context(ctx) };
    let before = ctx.regs.stack_pointer;
    let object = (!obj.is_null()).then_some(obj as usize);
    if ctx.call_host(func, object).is_err() {
        return 0;
    }
    let popped = unsafe { ctx.regs.stack_pointer.offset_from(before) };
    // generated code pops the arguments itself
    ctx.regs.stack_pointer = before;
    (popped * 4) as i32
}

unsafe extern "C" fn do_suspend(ctx: Ctx) -> u8 {
    let ctx = unsafe { context(ctx) };
    ctx.suspended = true;
    1
}

unsafe extern "C" fn check_status(ctx: Ctx) -> u8 {
    let ctx = unsafe { context(ctx) };
    if ctx.exception.is_none() && ctx.regs.do_process_suspend != 0 {
        ctx.suspended = true;
    }
    (ctx.exception.is_some() || ctx.suspended) as u8
}

unsafe extern "C" fn alloc_object(ctx: Ctx, size: usize) -> *mut c_void {
    unsafe { context(ctx) }.allocate(size) as *mut c_void
}

unsafe extern "C" fn free_object(ctx: Ctx, obj: *mut c_void) {
    unsafe { context(ctx) }.free(obj as usize);
}

unsafe extern "C" fn call_object_method(ctx: Ctx, obj: *mut c_void, func: FunctionId) {
    unsafe { context(ctx) }.behave(obj as usize, func);
}

/// A finished (or stopped) run and the context it left behind.
pub struct Run {
    pub outcome: Outcome,
    pub ctx: Box<Context>,
}

/// Run `entry` once fully interpreted and once entering native code
/// wherever possible. Functions must already be compiled and sealed.
pub fn run_both(
    engine: &TestEngine,
    entry: FunctionId,
    args: &[u32],
    setup: impl Fn(&mut Context),
) -> (Run, Run) {
    let run = |mode| {
        let mut ctx = Context::new(engine, entry, args, mode);
        setup(&mut ctx);
        let outcome = ctx.run();
        Run { outcome, ctx }
    };
    (run(Mode::Interpreted), run(Mode::Mixed))
}

/// Observable state of both runs must agree: outcome, value register,
/// the listed variables, stack depth, and the object heap.
pub fn assert_same_state(interpreted: &Run, mixed: &Run, vars: &[i16]) {
    let (a, b) = (&interpreted.ctx, &mixed.ctx);
    assert_eq!(interpreted.outcome, mixed.outcome, "outcome");
    assert_eq!(a.regs.value_register, b.regs.value_register, "value register");
    for &v in vars {
        assert_eq!(a.var(v), b.var(v), "variable {v}");
    }
    assert_eq!(a.stack_depth(), b.stack_depth(), "stack depth");
    if interpreted.outcome != Outcome::Finished {
        assert_eq!(a.regs.program_position, b.regs.program_position, "stop position");
    }
    assert_eq!(a.objects.len(), b.objects.len(), "live objects");
    let mut refs_a: Vec<i32> = a.objects.values().map(|o| o.refs).collect();
    let mut refs_b: Vec<i32> = b.objects.values().map(|o| o.refs).collect();
    refs_a.sort_unstable();
    refs_b.sort_unstable();
    assert_eq!(refs_a, refs_b, "reference counts");
    assert_eq!(a.frees, b.frees, "objects freed");
    assert_eq!(a.destructs, b.destructs, "destructor calls");
}

/// Check `entry` behaves the same both ways. The returned compiler owns
/// the code installed in `engine`; it must outlive any further runs.
pub fn assert_equivalent(
    engine: &TestEngine,
    ids: &[FunctionId],
    entry: FunctionId,
    args: &[u32],
    vars: &[i16],
) -> (Run, Run, JitCompiler) {
    let jit = JitCompiler::new(small_pages());
    compile_all(&jit, engine, ids);
    let (interpreted, mixed) = run_both(engine, entry, args, |_| {});
    assert_same_state(&interpreted, &mixed, vars);
    (interpreted, mixed, jit)
}
