//! Error types for the JIT.
//!
//! None of these ever reach script code: a failed compile only means the
//! function keeps running in the interpreter.

use std::path::PathBuf;

/// Failures of the mmap-backed executable regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
}

/// Errors while loading a [`crate::config::JitConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse jit config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors returned by compilation entry points.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// Generated code ran past the space reserved for it. Space checks
    /// precede every emitted batch, so this is an internal invariant
    /// violation rather than a runtime condition.
    #[error("code page overflow: needed {needed} bytes, {available} available")]
    PageOverflow { needed: usize, available: usize },
    #[error("function {0} has no bytecode")]
    NoBytecode(u32),
    #[error("malformed bytecode at offset {offset}: {reason}")]
    MalformedBytecode { offset: usize, reason: &'static str },
    #[error("attempt to write into sealed page at {0:#x}")]
    SealedPage(usize),
    #[error("branch displacement out of range at {site:#x}")]
    BranchOutOfRange { site: usize },
    #[error("native code generation is not supported on this target")]
    UnsupportedTarget,
}

pub type JitResult<T> = Result<T, JitError>;
