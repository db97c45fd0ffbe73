//! Cross-function links.
//!
//! A direct script call reads the callee's native address and entry offset
//! from a link cell at run time. There is one cell per callee, shared by
//! every caller, and its address never changes, so a caller compiled before
//! its callee is fixed up by filling the cell rather than by writing into
//! caller code that may already be sealed.

use std::collections::HashMap;

use tracing::debug;

use crate::vm::function::{FunctionId, JitSlot};

/// Identifies one compiled body. Compiling a function twice yields two.
pub type BodyId = u64;

/// A call site waiting for its callee to be compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredLink {
    pub caller: FunctionId,
    pub callee: FunctionId,
}

/// Outcome of [`Linker::link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// The callee is compiled; the cell already holds its addresses.
    Direct { cell: usize },
    /// The cell is empty until the callee compiles.
    Deferred { cell: usize },
}

impl Link {
    pub fn cell(self) -> usize {
        match self {
            Link::Direct { cell } | Link::Deferred { cell } => cell,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveBody {
    body: BodyId,
    function: usize,
    entry: usize,
}

#[derive(Default)]
pub struct Linker {
    cells: HashMap<FunctionId, Box<JitSlot>>,
    live: HashMap<FunctionId, Vec<LiveBody>>,
    deferred: Vec<DeferredLink>,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell_for(&mut self, callee: FunctionId) -> &JitSlot {
        self.cells.entry(callee).or_default()
    }

    /// Cell address for a call from `caller` to `callee`, registering a
    /// deferred link when the callee has no native code yet.
    pub fn link(&mut self, caller: FunctionId, callee: FunctionId) -> Link {
        let cell = self.cell_for(callee) as *const JitSlot as usize;
        if self.live.get(&callee).is_some_and(|bodies| !bodies.is_empty()) {
            return Link::Direct { cell };
        }
        self.deferred.push(DeferredLink { caller, callee });
        Link::Deferred { cell }
    }

    /// Make `body` the native code of `callee`. Returns how many deferred
    /// links this resolved.
    pub fn publish(&mut self, callee: FunctionId, body: BodyId, function: usize, entry: usize) -> usize {
        self.cell_for(callee).install(function, entry);
        self.live.entry(callee).or_default().push(LiveBody {
            body,
            function,
            entry,
        });
        let before = self.deferred.len();
        self.deferred.retain(|link| link.callee != callee);
        let resolved = before - self.deferred.len();
        if resolved > 0 {
            debug!(callee, resolved, "resolved deferred links");
        }
        resolved
    }

    /// Forget `body`. Cells pointing at it fall back to another live body
    /// of the same function, or to the interpreter when there is none.
    pub fn unpublish(&mut self, callee: FunctionId, body: BodyId) {
        let Some(bodies) = self.live.get_mut(&callee) else {
            return;
        };
        bodies.retain(|live| live.body != body);
        let fallback = bodies.last().copied();
        if let Some(cell) = self.cells.get(&callee) {
            match fallback {
                Some(live) => cell.install(live.function, live.entry),
                None => cell.clear(),
            }
        }
    }

    /// Deferred links still waiting on `callee`.
    pub fn pending_for(&self, callee: FunctionId) -> usize {
        self.deferred.iter().filter(|link| link.callee == callee).count()
    }

    pub fn pending(&self) -> &[DeferredLink] {
        &self.deferred
    }

    /// Native address a call to `callee` would currently reach.
    pub fn resolved(&self, callee: FunctionId) -> Option<usize> {
        self.cells
            .get(&callee)
            .map(|cell| cell.function_address())
            .filter(|addr| *addr != 0)
    }
}
