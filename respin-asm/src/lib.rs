//! x86-64 instruction model for the respin rewriter.
//!
//! The crate defines the shared instruction representation (registers,
//! value types, operands and [`Instruction`]) together with a pure
//! single-instruction decoder ([`decode::decode_one`]) and encoder
//! ([`encode::encode_one`]). Everything stateful (block caching, taint
//! tracking, code storage) lives in `respin-vm`.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod decode;
pub mod encode;

mod instr;
mod operand;
pub mod reg;
mod val;

pub use instr::{Cond, Flags, Instruction, InstrKind, OpcodeMap, Passthrough, PtEncoding};
pub use operand::{MemRef, Operand, Segment};
pub use reg::{Reg, RegKind};
pub use val::ValType;

#[cfg(test)]
mod encoding_tests;
