//! Code buffer for building JIT code.
//!
//! Bytes are accumulated here and copied into a code page once the
//! function (or the part of it that fits in the current page) is complete.
//! The buffer knows the absolute address its first byte will land at, so
//! branch displacements and embedded addresses are final when emitted.

use crate::error::{JitError, JitResult};

/// Kind of a patchable reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    /// 8-bit displacement from the end of the reference.
    Rel8,
    /// 32-bit displacement from the end of the reference.
    Rel32,
    /// 64-bit absolute address.
    Abs64,
}

impl SiteKind {
    pub fn len(self) -> usize {
        match self {
            SiteKind::Rel8 => 1,
            SiteKind::Rel32 => 4,
            SiteKind::Abs64 => 8,
        }
    }
}

/// A reference waiting for its target, identified by absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Site {
    pub address: usize,
    pub kind: SiteKind,
}

impl Site {
    /// Bytes to write at the site so that it refers to `target`.
    pub fn encode(self, target: usize) -> JitResult<Vec<u8>> {
        let end = self.address.wrapping_add(self.kind.len());
        let rel = (target as i64).wrapping_sub(end as i64);
        let out_of_range = JitError::BranchOutOfRange { site: self.address };
        match self.kind {
            SiteKind::Rel8 => {
                let rel = i8::try_from(rel).map_err(|_| out_of_range)?;
                Ok(vec![rel as u8])
            }
            SiteKind::Rel32 => {
                let rel = if cfg!(target_pointer_width = "32") {
                    rel as i32
                } else {
                    i32::try_from(rel).map_err(|_| out_of_range)?
                };
                Ok(rel.to_le_bytes().to_vec())
            }
            SiteKind::Abs64 => Ok((target as u64).to_le_bytes().to_vec()),
        }
    }
}

/// A buffer for building machine code.
pub struct CodeBuffer {
    /// The code bytes
    code: Vec<u8>,
    /// Absolute address of `code[0]`
    base: usize,
    /// Bytes available at `base`
    capacity: usize,
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeBuffer {
    /// Create an unbounded buffer based at address 0.
    pub fn new() -> Self {
        Self::with_base(0, usize::MAX)
    }

    /// Create a buffer whose bytes will be placed at `base`.
    pub fn with_base(base: usize, capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity.min(4096)),
            base,
            capacity,
        }
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get the current offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Absolute address of the next byte.
    pub fn address(&self) -> usize {
        self.base.wrapping_add(self.code.len())
    }

    pub fn address_at(&self, offset: usize) -> usize {
        self.base.wrapping_add(offset)
    }

    /// Whether `addr` lies within the bytes emitted so far.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.address()
    }

    /// Bytes still available before the buffer outgrows its page.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.code.len())
    }

    /// Fail if more bytes were emitted than the page can hold.
    pub fn check_capacity(&self) -> JitResult<()> {
        if self.code.len() > self.capacity {
            return Err(JitError::PageOverflow {
                needed: self.code.len(),
                available: self.capacity,
            });
        }
        Ok(())
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit multiple bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Patch a site that lives in this buffer.
    pub fn patch(&mut self, site: Site, target: usize) -> JitResult<()> {
        let bytes = site.encode(target)?;
        let start = site.address.wrapping_sub(self.base);
        let slot = self
            .code
            .get_mut(start..start + bytes.len())
            .ok_or(JitError::BranchOutOfRange { site: site.address })?;
        slot.copy_from_slice(&bytes);
        Ok(())
    }

    /// Patch a site the assembler just produced. Short skips and near
    /// jumps to known addresses are in range by construction.
    pub(crate) fn patch_local(&mut self, site: Site, target: usize) {
        let patched = self.patch(site, target);
        debug_assert!(patched.is_ok(), "local site out of range: {patched:?}");
    }

    /// Pad with `fill` until the offset is a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize, fill: u8) {
        while self.address() % alignment != 0 {
            self.code.push(fill);
        }
    }

    /// Get the code bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume and return the code bytes.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}
