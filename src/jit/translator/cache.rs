//! Tracks what the scratch register holds between instructions.
//!
//! Each instruction starts from what the previous one left behind and
//! declares what it leaves for the next; anything it does not declare is
//! forgotten. Branch targets and entry points start from nothing, since
//! control may arrive there from elsewhere.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scratch {
    #[default]
    Unknown,
    /// The full register equals the pointer on top of the value stack.
    StackTop,
    /// The low 32 bits equal variable slot `n`.
    Slot(i16),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScratchCache {
    current: Scratch,
    next: Scratch,
}

impl ScratchCache {
    /// Move to the next instruction.
    pub fn advance(&mut self) {
        self.current = std::mem::take(&mut self.next);
    }

    /// Forget everything, e.g. where control can arrive from elsewhere.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn holds(&self, value: Scratch) -> bool {
        value != Scratch::Unknown && self.current == value
    }

    /// Declare what the scratch register holds after this instruction.
    pub fn leave(&mut self, value: Scratch) {
        self.next = value;
    }
}
