//! JIT configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

/// Default code page size, matching the engine's allocation granularity.
pub const DEFAULT_PAGE_SIZE: usize = 65535 * 4;

/// Free space below which the active page is retired before a new compile.
pub const DEFAULT_MIN_FREE_SPACE: usize = 256;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// Never produce native code
    Off,
    /// Always compile; fails on hosts without a native backend
    On,
    /// Compile when the host has a native backend
    #[default]
    Auto,
}

/// Compiler options. Every flag defaults to the fully featured behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    pub mode: JitMode,
    /// Suspend checkpoints compile to nothing.
    pub no_suspend: bool,
    /// Script calls always hand the prepared callee frame to the interpreter.
    pub no_script_calls: bool,
    /// Switch tables return to the interpreter.
    pub no_switches: bool,
    /// Skip the exception/suspend test after native system calls.
    pub syscall_no_errors: bool,
    /// Allocate objects through the engine allocator without extra checks.
    pub alloc_simple: bool,
    /// Requested size of each code page (rounded up to the OS page size).
    pub page_size: usize,
    /// Retire the active page when fewer bytes than this remain.
    pub min_free_space: usize,
    /// Raise per-function compile summaries to `info` level.
    pub trace: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            mode: JitMode::Auto,
            no_suspend: false,
            no_script_calls: false,
            no_switches: false,
            syscall_no_errors: false,
            alloc_simple: false,
            page_size: DEFAULT_PAGE_SIZE,
            min_free_space: DEFAULT_MIN_FREE_SPACE,
            trace: false,
        }
    }
}

impl JitConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> String {
        // Plain structs of scalars always serialize.
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Whether compile requests should produce native code on this host.
    pub fn enabled(&self) -> bool {
        match self.mode {
            JitMode::Off => false,
            JitMode::On => true,
            JitMode::Auto => crate::jit::abi::Target::host().is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = JitConfig::default();
        assert_eq!(config.mode, JitMode::Auto);
        assert_eq!(config.page_size, 262140);
        assert_eq!(config.min_free_space, 256);
        assert!(!config.no_suspend);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = JitConfig::from_toml_str("no_switches = true\nmode = \"off\"\n").unwrap();
        assert!(config.no_switches);
        assert_eq!(config.mode, JitMode::Off);
        assert!(!config.enabled());
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_rejects_unknown_mode() {
        assert!(JitConfig::from_toml_str("mode = \"sometimes\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "page_size = 4096\ntrace = true").unwrap();
        let config = JitConfig::load(file.path()).unwrap();
        assert_eq!(config.page_size, 4096);
        assert!(config.trace);
    }

    #[test]
    fn test_load_missing_file() {
        let err = JitConfig::load(Path::new("/nonexistent/jit.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_toml_roundtrip_of_flags() {
        let config = JitConfig {
            no_script_calls: true,
            ..JitConfig::default()
        };
        let parsed = JitConfig::from_toml_str(&config.to_toml_string()).unwrap();
        assert_eq!(parsed, config);
    }
}
