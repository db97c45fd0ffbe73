//! Executable memory regions using mmap.
//!
//! A region starts out read-write. [`ExecutableMemory::seal`] flips it to
//! read-execute exactly once; after that no byte of it can change.

use std::ptr::NonNull;

use crate::error::MemoryError;

/// A block of memory allocated via mmap for generated code.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    sealed: bool,
}

impl ExecutableMemory {
    /// Map at least `size` bytes, rounded up to whole OS pages.
    pub fn allocate(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let page = Self::os_page_size();
        let size = size
            .checked_add(page - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page - 1);
        let ptr = Self::map(size)?;
        Ok(Self {
            ptr,
            size,
            sealed: false,
        })
    }

    /// Get the page size for the current system.
    pub fn os_page_size() -> usize {
        #[cfg(unix)]
        {
            // SAFETY: sysconf has no preconditions.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Not executable on most systems; enough for code inspection.
        let layout = std::alloc::Layout::from_size_align(size, Self::os_page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        // SAFETY: layout has nonzero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Absolute address of the first byte.
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.size
    }

    /// Copy `data` to `offset`. Fails once sealed or out of bounds.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.sealed {
            return Err(MemoryError::ProtectionFailed);
        }
        let end = offset.checked_add(data.len()).ok_or(MemoryError::InvalidSize)?;
        if end > self.size {
            return Err(MemoryError::InvalidSize);
        }
        // SAFETY: bounds checked above and the mapping is still writable.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Read back bytes, for inspection and tests.
    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if offset.checked_add(len)? > self.size {
            return None;
        }
        // SAFETY: in bounds; the mapping is always readable.
        Some(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }

    /// Make the region executable and read-only. Idempotent.
    #[cfg(unix)]
    pub fn seal(&mut self) -> Result<(), MemoryError> {
        if self.sealed {
            return Ok(());
        }
        // SAFETY: the range is exactly the mapping created in `map`.
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.sealed = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn seal(&mut self) -> Result<(), MemoryError> {
        self.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: unmapping the region this value owns.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
        #[cfg(not(unix))]
        if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::os_page_size()) {
            // SAFETY: allocated in `map` with this layout.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

// The region is uniquely owned; mutation requires &mut and happens under
// the compiler lock.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}
