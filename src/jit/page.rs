//! Code page manager.
//!
//! Generated functions are packed into large reference-counted pages. The
//! manager keeps one active page that new compiles draw from; every
//! compiled function holds a reference on each page it occupies, and the
//! active page is additionally held by the manager itself. A page is
//! unmapped when its count drops to zero.

use std::collections::HashMap;

use tracing::debug;

use super::codebuf::{CodeBuffer, Site, SiteKind};
use super::memory::ExecutableMemory;
use super::x86::{Assembler, Mode};
use crate::error::{JitError, JitResult};

pub type PageId = u64;

/// Bytes of one 64-bit far jump (`jmp [rip+0]` plus target).
const FAR_JUMP_64: usize = 14;
/// Bytes of one 32-bit near jump.
const JUMP_32: usize = 5;

/// A block of executable memory holding one or more functions.
pub struct CodePage {
    id: PageId,
    memory: ExecutableMemory,
    cursor: usize,
    refs: usize,
}

impl CodePage {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn base(&self) -> usize {
        self.memory.base()
    }

    pub fn capacity(&self) -> usize {
        self.memory.size()
    }

    /// Address of the next free byte.
    pub fn cursor_address(&self) -> usize {
        self.memory.base() + self.cursor
    }

    pub fn free(&self) -> usize {
        self.memory.size() - self.cursor
    }

    pub fn ref_count(&self) -> usize {
        self.refs
    }

    pub fn is_sealed(&self) -> bool {
        self.memory.is_sealed()
    }

    pub fn read(&self, addr: usize, len: usize) -> Option<&[u8]> {
        self.memory.read(addr.checked_sub(self.base())?, len)
    }
}

/// Allocation counters, for accounting checks and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
    pub pages_allocated: usize,
    pub pages_freed: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
}

impl PageStats {
    pub fn live_pages(&self) -> usize {
        self.pages_allocated - self.pages_freed
    }

    pub fn live_bytes(&self) -> usize {
        self.bytes_allocated - self.bytes_freed
    }
}

pub struct PageManager {
    pages: HashMap<PageId, CodePage>,
    active: Option<PageId>,
    next_id: PageId,
    page_size: usize,
    min_free: usize,
    stats: PageStats,
}

impl PageManager {
    pub fn new(page_size: usize, min_free: usize) -> Self {
        Self {
            pages: HashMap::new(),
            active: None,
            next_id: 1,
            page_size,
            min_free,
            stats: PageStats::default(),
        }
    }

    pub fn stats(&self) -> PageStats {
        self.stats
    }

    pub fn page(&self, id: PageId) -> Option<&CodePage> {
        self.pages.get(&id)
    }

    pub fn active(&self) -> Option<PageId> {
        self.active
    }

    /// Map a fresh page with a reference count of zero.
    pub fn allocate(&mut self, min_capacity: usize) -> JitResult<PageId> {
        let memory = ExecutableMemory::allocate(self.page_size.max(min_capacity))?;
        let id = self.next_id;
        self.next_id += 1;
        self.stats.pages_allocated += 1;
        self.stats.bytes_allocated += memory.size();
        debug!(page = id, base = format_args!("{:#x}", memory.base()), size = memory.size(), "allocated code page");
        self.pages.insert(
            id,
            CodePage {
                id,
                memory,
                cursor: 0,
                refs: 0,
            },
        );
        Ok(id)
    }

    pub fn grab(&mut self, id: PageId) {
        if let Some(page) = self.pages.get_mut(&id) {
            page.refs += 1;
        }
    }

    /// Drop one reference, unmapping the page when none remain.
    pub fn drop_ref(&mut self, id: PageId) {
        let Some(page) = self.pages.get_mut(&id) else {
            debug_assert!(false, "dropping unknown page {id}");
            return;
        };
        debug_assert!(page.refs > 0, "page {id} over-released");
        page.refs = page.refs.saturating_sub(1);
        if page.refs == 0 {
            if self.active == Some(id) {
                self.active = None;
            }
            if let Some(page) = self.pages.remove(&id) {
                self.stats.pages_freed += 1;
                self.stats.bytes_freed += page.capacity();
                debug!(page = id, "freed code page");
            }
        }
    }

    fn set_active(&mut self, id: PageId) {
        self.grab(id);
        if let Some(old) = self.active.replace(id) {
            self.drop_ref(old);
        }
    }

    /// Stop drawing from the active page, e.g. when one of its functions
    /// is released.
    pub fn retire_active(&mut self, id: PageId) {
        if self.active == Some(id) {
            self.active = None;
            self.drop_ref(id);
        }
    }

    /// Pick the page a new function starts in and take the function's
    /// reference on it. Returns a buffer positioned at the page's cursor.
    pub fn begin_function(&mut self) -> JitResult<(PageId, CodeBuffer)> {
        let reuse = self
            .active
            .and_then(|id| self.pages.get(&id))
            .filter(|page| !page.is_sealed() && page.free() >= self.min_free)
            .map(|page| page.id);
        let id = match reuse {
            Some(id) => id,
            None => {
                let id = self.allocate(self.page_size)?;
                self.set_active(id);
                id
            }
        };
        self.grab(id);
        Ok((id, self.buffer_for(id)?))
    }

    fn buffer_for(&self, id: PageId) -> JitResult<CodeBuffer> {
        let page = self.pages.get(&id).ok_or(JitError::PageOverflow {
            needed: 0,
            available: 0,
        })?;
        Ok(CodeBuffer::with_base(page.cursor_address(), page.free()))
    }

    /// Copy a finished buffer to its page and advance the page cursor.
    pub fn commit(&mut self, id: PageId, buf: &CodeBuffer) -> JitResult<()> {
        buf.check_capacity()?;
        let page = self.pages.get_mut(&id).ok_or(JitError::PageOverflow {
            needed: buf.len(),
            available: 0,
        })?;
        if page.cursor_address() != buf.base() {
            return Err(JitError::PageOverflow {
                needed: buf.len(),
                available: page.free(),
            });
        }
        if page.is_sealed() {
            return Err(JitError::SealedPage(buf.base()));
        }
        page.memory.write(page.cursor, buf.code())?;
        page.cursor += buf.len();
        Ok(())
    }

    /// Bytes [`Self::migrate`] needs in the old page for `pending` open
    /// fix-ups plus the continuation jump.
    pub fn migration_reserve(mode: Mode, pending: usize) -> usize {
        match mode {
            Mode::Bits64 => (pending + 1) * FAR_JUMP_64,
            Mode::Bits32 => JUMP_32,
        }
    }

    /// Continue a function in a new page.
    ///
    /// The old page gets a jump to the new one, then every open rel32
    /// fix-up in `buf` is redirected through a far jump stub placed after
    /// it, so that it can still reach its eventual target. `buf` is replaced
    /// by a buffer positioned at the new page's start. The function's
    /// reference moves with it: the caller adds the returned page to the
    /// set it owns.
    pub fn migrate(
        &mut self,
        from: PageId,
        buf: &mut CodeBuffer,
        mode: Mode,
        pending: &mut [Site],
    ) -> JitResult<PageId> {
        let to = self.allocate(self.page_size)?;
        let to_base = self.pages.get(&to).map(|p| p.base()).unwrap_or_default();
        {
            let mut asm = Assembler::new(buf, mode);
            // straight-line code falls through into the continuation, so
            // the stubs go after it
            let cont = asm.jmp_far();
            asm.buf().patch(cont, to_base)?;
            if mode == Mode::Bits64 {
                for site in pending.iter_mut() {
                    if site.kind != SiteKind::Rel32 || !asm.buf().contains(site.address) {
                        continue;
                    }
                    let stub = asm.address();
                    asm.buf().patch(*site, stub)?;
                    *site = asm.jmp_far();
                }
            }
        }
        self.commit(from, buf)?;
        self.set_active(to);
        self.grab(to);
        *buf = self.buffer_for(to)?;
        debug!(from, to, "migrated function to new code page");
        Ok(to)
    }

    /// Patch a fix-up that was already committed to an unsealed page.
    pub fn patch(&mut self, site: Site, target: usize) -> JitResult<()> {
        let bytes = site.encode(target)?;
        let page = self
            .pages
            .values_mut()
            .find(|p| p.memory.contains(site.address))
            .ok_or(JitError::BranchOutOfRange { site: site.address })?;
        if page.is_sealed() {
            return Err(JitError::SealedPage(site.address));
        }
        let offset = site.address - page.base();
        page.memory.write(offset, &bytes)?;
        Ok(())
    }

    /// Seal every page that is still writable.
    pub fn seal_all(&mut self) -> JitResult<()> {
        for page in self.pages.values_mut() {
            if !page.is_sealed() {
                page.memory.seal()?;
            }
        }
        Ok(())
    }
}
