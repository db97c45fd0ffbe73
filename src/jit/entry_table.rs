//! Entry point side table.
//!
//! Maps bytecode offsets to the native address that resumes execution
//! there. The prologue of every compiled function indexes this table with
//! the offset it was called with, so the bytecode itself is never patched.
//!
//! Layout: one pointer-sized slot per bytecode word. A zero slot means the
//! offset is not an entry point of this compiled body.

use std::sync::atomic::{AtomicUsize, Ordering};

pub struct EntryTable {
    slots: Box<[AtomicUsize]>,
}

impl EntryTable {
    /// Create a table covering `len` bytecode words, all empty.
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Number of bytecode words covered.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Address of slot 0. Generated code reads `base + offset * ptr_size`.
    pub fn base_ptr(&self) -> usize {
        self.slots.as_ptr() as usize
    }

    pub fn set(&self, offset: usize, addr: usize) {
        if let Some(slot) = self.slots.get(offset) {
            slot.store(addr, Ordering::Release);
        }
    }

    pub fn get(&self, offset: usize) -> Option<usize> {
        let addr = self.slots.get(offset)?.load(Ordering::Acquire);
        (addr != 0).then_some(addr)
    }

    /// Offsets that have a native address, in ascending order.
    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.load(Ordering::Relaxed) != 0)
            .map(|(offset, _)| offset)
    }

    pub fn first(&self) -> Option<usize> {
        self.offsets().next()
    }

    pub fn count(&self) -> usize {
        self.offsets().count()
    }
}

impl std::fmt::Debug for EntryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryTable")
            .field("len", &self.len())
            .field("entries", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_table_is_empty() {
        let table = EntryTable::new(4);
        assert_eq!(table.len(), 4);
        assert_eq!(table.count(), 0);
        assert_eq!(table.first(), None);
    }

    #[test]
    fn test_set_and_read_through_base() {
        let table = EntryTable::new(8);
        table.set(0, 0x1000);
        table.set(5, 0x2000);
        table.set(99, 0x3000);

        assert_eq!(table.get(5), Some(0x2000));
        assert_eq!(table.get(1), None);
        assert_eq!(table.get(99), None);
        assert_eq!(table.offsets().collect::<Vec<_>>(), vec![0, 5]);

        let ptr = table.base_ptr() as *const usize;
        unsafe {
            assert_eq!(*ptr, 0x1000);
            assert_eq!(*ptr.add(1), 0);
            assert_eq!(*ptr.add(5), 0x2000);
        }
    }
}
