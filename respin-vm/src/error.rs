//! Rewriter error implementation.

use respin_asm::decode::DecodeError;
use respin_asm::encode::EncodeError;
use respin_asm::InstrKind;

use std::io;
use thiserror::Error;

/// Everything that can go wrong during a rewrite.
///
/// Errors are collected on the session log; `Rewriter::rewrite` reports
/// them by returning the original function address so the caller only
/// loses the specialization, never correctness.
#[derive(Debug, Error)]
pub enum RewriteError {
    /// The decoder reached bytes it cannot frame.
    #[error("cannot decode instruction: {0}")]
    Decode(#[from] DecodeError),
    /// An unclassified instruction had to be emulated.
    #[error("unsupported instruction {kind} at {addr:#x}")]
    Unsupported {
        /// Address of the offending instruction.
        addr: u64,
        /// Its decoded kind.
        kind: InstrKind,
    },
    /// A residual consumer needed a flag value the engine cannot
    /// re-materialize at run time.
    #[error("cannot materialize static flags for {kind} at {addr:#x}")]
    FlagMaterialization {
        /// Address of the consumer.
        addr: u64,
        /// Its decoded kind.
        kind: InstrKind,
    },
    /// The decoded-instruction arena is full.
    #[error("decoded instruction capacity exceeded ({0})")]
    DecodedInstrCapacity(usize),
    /// The decoded-block arena is full.
    #[error("decoded block capacity exceeded ({0})")]
    DecodedBlockCapacity(usize),
    /// The captured-instruction arena is full.
    #[error("captured instruction capacity exceeded ({0})")]
    CapturedInstrCapacity(usize),
    /// The captured-block arena is full.
    #[error("captured block capacity exceeded ({0})")]
    CapturedBlockCapacity(usize),
    /// Generated code does not fit the storage region.
    #[error("generated code exceeds capacity ({needed} > {capacity} bytes)")]
    CodeCapacity {
        /// Bytes the layout needed.
        needed: usize,
        /// Bytes available.
        capacity: usize,
    },
    /// An access fell outside the emulated stack.
    #[error("emulated stack access out of bounds at offset {offset:#x}")]
    StackBounds {
        /// Offset relative to the stack base.
        offset: i64,
    },
    /// The emulation step budget ran out (a statically-infinite loop).
    #[error("emulation step budget exhausted ({0} steps)")]
    StepBudget(usize),
    /// Re-encoding a captured instruction failed.
    #[error("cannot encode captured instruction: {0}")]
    Encode(#[from] EncodeError),
    /// Mapping executable memory failed.
    #[error("executable mapping failed: {0}")]
    Map(#[from] io::Error),
    /// `rewrite`/`emulate` was called before a target function was set.
    #[error("no target function configured")]
    NoFunction,
}

/// Result alias used across the crate.
pub type Result<T, E = RewriteError> = core::result::Result<T, E>;
