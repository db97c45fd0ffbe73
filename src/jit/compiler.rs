//! Compiler facade.
//!
//! [`JitCompiler`] owns the code pages, the link cells and every compiled
//! body. One lock serializes compiling, releasing and sealing; generated
//! code never takes it, so functions compiled earlier keep running while
//! another one is being translated.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::abi::Target;
use super::linker::{BodyId, Linker};
use super::page::{PageManager, PageStats};
use super::translator::{Translation, translate};
use crate::config::JitConfig;
use crate::error::{JitError, JitResult};
use crate::vm::engine::Engine;
use crate::vm::function::{FunctionId, NativeEntryFn, ScriptFunction};
use crate::vm::registers::VmRegisters;

/// A compiled body, as returned by [`JitCompiler::compile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle {
    body: BodyId,
    function: FunctionId,
    address: usize,
    entry: usize,
}

impl NativeHandle {
    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Address of the native entry.
    pub fn address(&self) -> usize {
        self.address
    }

    /// First bytecode offset native code can start at.
    pub fn first_entry(&self) -> usize {
        self.entry
    }

    pub fn entry_fn(&self) -> NativeEntryFn {
        // SAFETY: `address` is the prologue of a body emitted with the
        // `NativeEntryFn` signature.
        unsafe { std::mem::transmute::<usize, NativeEntryFn>(self.address) }
    }

    /// Run the body from bytecode offset `entry`.
    ///
    /// # Safety
    /// The body must not have been released, its pages must be sealed, and
    /// `regs` must describe a live frame of this function whose context
    /// matches the engine the body was compiled against.
    pub unsafe fn call(&self, regs: &mut VmRegisters, entry: usize) {
        unsafe { (self.entry_fn())(regs, entry) }
    }
}

struct CompiledBody {
    function: FunctionId,
    translation: Translation,
}

/// Counters reported by [`JitCompiler::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompilerStats {
    pub pages: PageStats,
    pub live_bodies: usize,
    pub pending_links: usize,
}

struct CompilerState {
    pages: PageManager,
    linker: Linker,
    bodies: HashMap<BodyId, CompiledBody>,
    next_body: BodyId,
}

pub struct JitCompiler {
    config: JitConfig,
    target: Option<Target>,
    state: Mutex<CompilerState>,
}

impl JitCompiler {
    /// Compiler for the host target.
    pub fn new(config: JitConfig) -> Self {
        Self::build(config, Target::host())
    }

    /// Compiler emitting code for `target`. Code for a target other than
    /// the host can be inspected but must not be run.
    pub fn with_target(config: JitConfig, target: Target) -> Self {
        Self::build(config, Some(target))
    }

    fn build(config: JitConfig, target: Option<Target>) -> Self {
        let pages = PageManager::new(config.page_size, config.min_free_space);
        Self {
            config,
            target,
            state: Mutex::new(CompilerState {
                pages,
                linker: Linker::new(),
                bodies: HashMap::new(),
                next_body: 1,
            }),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn target(&self) -> Option<Target> {
        self.target
    }

    fn lock(&self) -> MutexGuard<'_, CompilerState> {
        // every operation leaves the state consistent before it can panic
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Translate `func` and publish the result: its [`ScriptFunction::jit`]
    /// slot and the link cell other compiled functions call it through.
    ///
    /// Returns `Ok(None)` when nothing was produced, either because the
    /// JIT is off or because the function has no entry point. The new code
    /// is not executable until [`Self::seal_all`].
    pub fn compile<E: Engine + ?Sized>(
        &self,
        engine: &E,
        func: &ScriptFunction,
    ) -> JitResult<Option<NativeHandle>> {
        if !self.config.enabled() {
            return Ok(None);
        }
        let target = self.target.ok_or(JitError::UnsupportedTarget)?;
        if func.bytecode.is_empty() {
            return Err(JitError::NoBytecode(func.id));
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        let translation = match translate(
            engine,
            func,
            &self.config,
            target.abi(),
            &mut state.pages,
            &mut state.linker,
        ) {
            Ok(Some(translation)) => translation,
            Ok(None) => {
                debug!(function = func.id, name = %func.name, "no entry point, nothing compiled");
                return Ok(None);
            }
            Err(e) => {
                warn!(function = func.id, name = %func.name, error = %e, "compilation failed");
                return Err(e);
            }
        };

        let body = state.next_body;
        state.next_body += 1;
        let address = translation.address;
        let entry = translation.entries.first().unwrap_or(0);
        func.jit.install(address, entry);
        let resolved = state.linker.publish(func.id, body, address, entry);

        if self.config.trace {
            info!(
                function = func.id,
                name = %func.name,
                bytes = translation.bytes,
                pages = translation.pages.len(),
                entries = translation.entries.count(),
                fallbacks = translation.fallbacks,
                resolved,
                "compiled function"
            );
        } else {
            debug!(
                function = func.id,
                bytes = translation.bytes,
                pages = translation.pages.len(),
                entries = translation.entries.count(),
                "compiled function"
            );
        }

        state.bodies.insert(
            body,
            CompiledBody {
                function: func.id,
                translation,
            },
        );
        Ok(Some(NativeHandle {
            body,
            function: func.id,
            address,
            entry,
        }))
    }

    /// Free a compiled body: drop its page references, its entry and jump
    /// tables, and point callers linked to it at another live body of the
    /// same function or back at the interpreter.
    ///
    /// Releasing a handle twice is a no-op. Returns whether anything was
    /// released.
    pub fn release(&self, handle: NativeHandle) -> bool {
        let mut state = self.lock();
        let Some(body) = state.bodies.remove(&handle.body) else {
            return false;
        };
        state.linker.unpublish(body.function, handle.body);
        for page in &body.translation.pages {
            state.pages.retire_active(*page);
            state.pages.drop_ref(*page);
        }
        debug!(function = body.function, body = handle.body, "released compiled function");
        true
    }

    /// [`Self::release`], clearing `func`'s slot first if it still points at
    /// this body.
    pub fn release_function(&self, func: &ScriptFunction, handle: NativeHandle) -> bool {
        func.jit.clear_if(handle.address);
        self.release(handle)
    }

    /// Make every page written so far executable. Later compiles start on
    /// fresh pages.
    pub fn seal_all(&self) -> JitResult<()> {
        self.lock().pages.seal_all()
    }

    pub fn stats(&self) -> CompilerStats {
        let state = self.lock();
        CompilerStats {
            pages: state.pages.stats(),
            live_bodies: state.bodies.len(),
            pending_links: state.linker.pending().len(),
        }
    }

    /// Native address a compiled call to `callee` currently reaches.
    pub fn linked_address(&self, callee: FunctionId) -> Option<usize> {
        self.lock().linker.resolved(callee)
    }

    /// Bytecode offsets `handle` can be entered at.
    pub fn entry_offsets(&self, handle: NativeHandle) -> Vec<usize> {
        self.lock()
            .bodies
            .get(&handle.body)
            .map(|body| body.translation.entries.offsets().collect())
            .unwrap_or_default()
    }

    /// Instructions of `handle` that always hand control to the interpreter.
    pub fn fallback_count(&self, handle: NativeHandle) -> Option<usize> {
        self.lock()
            .bodies
            .get(&handle.body)
            .map(|body| body.translation.fallbacks)
    }

    /// Machine code bytes of `handle`, across all its pages.
    pub fn code_size(&self, handle: NativeHandle) -> Option<usize> {
        self.lock()
            .bodies
            .get(&handle.body)
            .map(|body| body.translation.bytes)
    }
}

impl std::fmt::Debug for JitCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitCompiler")
            .field("config", &self.config)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}
