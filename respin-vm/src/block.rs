//! Decoded and captured basic blocks.
//!
//! Blocks reference each other through arena indices rather than owning
//! pointers; the session's arenas own all block storage, which keeps the
//! (possibly cyclic) captured-block graph simple to reason about.

use respin_asm::{Cond, Instruction, InstrKind};

use core::ops::Range;

/// Index of a decoded block in the session arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbbId(pub(crate) usize);

/// Index of a captured block in the session arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CbbId(pub(crate) usize);

/// A decoded basic block: a straight-line instruction run ending at the
/// first control-flow change.
#[derive(Debug, Clone)]
pub struct Dbb {
    /// Entry address.
    pub addr: u64,
    /// Bytes covered by the block.
    pub size: u64,
    /// Range into the session's decoded-instruction arena.
    pub instrs: Range<usize>,
    /// Kind of the terminating instruction.
    pub exit: InstrKind,
}

/// How a captured block ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbbExit {
    /// Capture has not reached the block end yet.
    Pending,
    /// The trace returns to the caller.
    Ret,
    /// Residual conditional branch.
    Branch {
        /// Condition of the residual `jcc`.
        cond: Cond,
        /// Successor when the condition holds.
        taken: CbbId,
        /// Successor when it does not.
        fallthrough: CbbId,
    },
    /// Unconditional continuation into another captured block.
    Jump(CbbId),
    /// The block ends in a residual indirect jump (kept in `instrs`);
    /// the trace cannot follow it.
    Indirect,
}

/// A captured basic block: the residual counterpart of one or more
/// decoded blocks specialized against an entry state.
#[derive(Debug, Clone)]
pub struct Cbb {
    /// Address of the decoded code this block was captured from.
    pub dec_addr: u64,
    /// Hash of the abstract state at block entry; `(dec_addr, es_id)`
    /// identifies a specialization.
    pub es_id: u64,
    /// Residual instructions in program order, exits excluded.
    pub instrs: Vec<Instruction>,
    /// Block terminator.
    pub exit: CbbExit,
    /// Encoded entry address, filled in by the emitter.
    pub start: Option<u64>,
}

impl Cbb {
    /// A fresh block for `(dec_addr, es_id)`.
    pub fn new(dec_addr: u64, es_id: u64) -> Self {
        Self {
            dec_addr,
            es_id,
            instrs: Vec::new(),
            exit: CbbExit::Pending,
            start: None,
        }
    }

    /// Successor ids in branch-then-fallthrough order.
    pub fn successors(&self) -> impl Iterator<Item = CbbId> {
        let (a, b) = match self.exit {
            CbbExit::Branch {
                taken, fallthrough, ..
            } => (Some(taken), Some(fallthrough)),
            CbbExit::Jump(t) => (Some(t), None),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }
}
