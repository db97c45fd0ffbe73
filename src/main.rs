use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use scriptjit::jit::abi::AbiTable;
use scriptjit::vm::{BytecodeBuilder, Opcode, StandaloneEngine};
use scriptjit::{JitCompiler, JitConfig, ScriptFunction, Target, VmRegisters};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetArg {
    X86,
    X64Sysv,
    X64Win,
}

impl From<TargetArg> for Target {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::X86 => Target::X86,
            TargetArg::X64Sysv => Target::X64SysV,
            TargetArg::X64Win => Target::X64Win,
        }
    }
}

#[derive(Parser)]
#[command(name = "scriptjit")]
#[command(about = "Baseline JIT for a stack-based script VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the ABI table of a target (defaults to the host)
    Abi {
        #[arg(value_enum)]
        target: Option<TargetArg>,
    },
    /// Print the effective JIT configuration
    Config {
        /// TOML file to load; missing keys keep their defaults
        path: Option<PathBuf>,
    },
    /// Compile a small summing loop and run it natively
    Smoke {
        /// TOML file with JIT options
        #[arg(long)]
        config: Option<PathBuf>,

        /// Upper bound of the sum
        #[arg(long, default_value = "10")]
        n: u32,
    },
}

fn main() -> ExitCode {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Abi { target } => print_abi(target.map(Target::from).or_else(Target::host)),
        Commands::Config { path } => load_config(path).map(|config| print!("{}", config.to_toml_string())),
        Commands::Smoke { config, n } => load_config(config).and_then(|config| smoke(config, n)),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<JitConfig, String> {
    match path {
        Some(path) => JitConfig::load(&path).map_err(|e| e.to_string()),
        None => Ok(JitConfig::default()),
    }
}

fn print_abi(target: Option<Target>) -> Result<(), String> {
    let target = target.ok_or("no native backend for this host")?;
    let abi: &AbiTable = target.abi();
    println!("target:            {}", abi.name);
    println!("pointer size:      {}", abi.ptr_size);
    println!("integer args:      {:?}", abi.int_args);
    println!("float args:        {:?}", abi.float_args);
    println!("positional slots:  {}", abi.positional_slots);
    println!("shadow space:      {}", abi.shadow_space);
    println!("stack alignment:   {}", abi.stack_align);
    println!("x87 float return:  {}", abi.x87_float_return);
    println!("saved registers:   {:?}", abi.saved);
    println!("entry arguments:   {:?}", abi.entry_args);
    println!("pinned registers:  {:?}", abi.pinned);
    Ok(())
}

/// `sum = 0; i = n; do { sum += i; i -= 1 } while i != 0; value = sum`
fn summing_loop(n: u32) -> ScriptFunction {
    let mut b = BytecodeBuilder::new();
    b.entry().w_dw(Opcode::SetV4, 1, 0).w_dw(Opcode::SetV4, 2, n);
    let top = b.offset();
    b.www(Opcode::AddI, 1, 1, 2)
        .w(Opcode::DecVi, 2)
        .w_dw(Opcode::CmpIi, 2, 0)
        .branch(Opcode::Jnz, top)
        .w(Opcode::CpyVtoR4, 1);
    let mut func = ScriptFunction::script(1, "sum", b.finish());
    func.variable_space = 2;
    func
}

fn smoke(config: JitConfig, n: u32) -> Result<(), String> {
    if Target::host().is_none() {
        return Err("no native backend for this host".into());
    }
    let jit = JitCompiler::new(config);
    let func = summing_loop(n);
    let engine = StandaloneEngine::new();
    let handle = jit
        .compile(&engine, &func)
        .map_err(|e| e.to_string())?
        .ok_or("nothing was compiled (is the JIT off?)")?;
    jit.seal_all().map_err(|e| e.to_string())?;

    let mut stack = vec![0u32; 64];
    let base = stack.as_mut_ptr();
    let mut regs = VmRegisters::default();
    // SAFETY: both pointers stay inside `stack`, which outlives the call.
    unsafe {
        regs.stack_frame_pointer = base.add(32);
        regs.stack_pointer = base.add(32 - func.variable_space as usize);
        handle.call(&mut regs, handle.first_entry());
    }

    let stats = jit.stats();
    println!("result:            {}", regs.value_register as u32);
    println!("resumed at:        {} of {}", regs.program_position, func.bytecode.len());
    println!("fallbacks:         {}", jit.fallback_count(handle).unwrap_or(0));
    println!("pages allocated:   {}", stats.pages.pages_allocated);
    println!("bytes allocated:   {}", stats.pages.bytes_allocated);
    jit.release(handle);
    Ok(())
}
