//! Jump bookkeeping for one function.

use crate::jit::codebuf::Site;

/// Native address of every bytecode offset emitted so far.
///
/// The table outlives compilation: switch tables index it at run time, so
/// its storage is a fixed heap block whose address is embedded in code.
#[derive(Debug)]
pub struct JumpTable {
    slots: Box<[usize]>,
    /// A switch table reads this table at run time.
    in_use: bool,
}

impl JumpTable {
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![0; len].into_boxed_slice(),
            in_use: false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn base_ptr(&self) -> usize {
        self.slots.as_ptr() as usize
    }

    pub fn record(&mut self, offset: usize, addr: usize) {
        if let Some(slot) = self.slots.get_mut(offset) {
            *slot = addr;
        }
    }

    pub fn get(&self, offset: usize) -> Option<usize> {
        self.slots.get(offset).copied().filter(|addr| *addr != 0)
    }

    pub fn mark_in_use(&mut self) {
        self.in_use = true;
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }
}

/// A forward branch waiting for its target to be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingJump {
    pub target: usize,
    pub site: Site,
}

#[derive(Debug, Default)]
pub struct PendingJumps {
    jumps: Vec<PendingJump>,
}

impl PendingJumps {
    pub fn add(&mut self, target: usize, site: Site) {
        self.jumps.push(PendingJump { target, site });
    }

    pub fn len(&self) -> usize {
        self.jumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jumps.is_empty()
    }

    /// Remove and return every jump that lands on `offset`.
    pub fn take(&mut self, offset: usize) -> Vec<PendingJump> {
        let (hit, keep) = self.jumps.drain(..).partition(|jump| jump.target == offset);
        self.jumps = keep;
        hit
    }

    pub fn take_all(&mut self) -> Vec<PendingJump> {
        std::mem::take(&mut self.jumps)
    }

    /// Whether any jump waits on `offset`.
    pub fn waits_on(&self, offset: usize) -> bool {
        self.jumps.iter().any(|jump| jump.target == offset)
    }

    /// Lowest target still waiting.
    pub fn first_target(&self) -> Option<usize> {
        self.jumps.iter().map(|jump| jump.target).min()
    }

    pub fn sites(&self) -> Vec<Site> {
        self.jumps.iter().map(|jump| jump.site).collect()
    }

    /// Replace the sites after they moved, in the order of [`Self::sites`].
    pub fn update_sites(&mut self, sites: &[Site]) {
        for (jump, site) in self.jumps.iter_mut().zip(sites) {
            jump.site = *site;
        }
    }
}
