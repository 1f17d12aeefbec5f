//! Taint-tracking partial evaluator and code generator for x86-64
//! functions.
//!
//! Given a function pointer and a description of which arguments are
//! statically known, a [`Rewriter`] session decodes the machine code,
//! emulates it while tracking per-byte static/dynamic taint, captures the
//! instructions that could not be reduced to constants, optimizes the
//! captured trace, and encodes a new function specialized to the static
//! inputs. The generated function follows the System-V AMD64 calling
//! convention and is semantically equivalent to the original for every
//! argument vector matching the configured static values.
//!
//! ```no_run
//! use respin_vm::Rewriter;
//!
//! extern "sysv64" fn f(x: i64, y: i64) -> i64 {
//!     x * 3 + y
//! }
//!
//! let mut rw = Rewriter::for_func(f as usize as u64);
//! rw.mark_static(0);
//! let specialized = rw.rewrite(&[7, 0]);
//! let g: extern "sysv64" fn(i64, i64) -> i64 =
//!     unsafe { std::mem::transmute(specialized as usize) };
//! assert_eq!(g(7, 5), 26);
//! ```

#![warn(missing_docs)]
#![deny(unused_must_use)]

mod block;
pub mod consts;
mod decoder;
mod emit;
mod engine;
mod error;
pub mod marker;
mod opt;
mod rewriter;
mod state;
mod storage;

pub use block::{Cbb, CbbExit, CbbId, Dbb, DbbId};
pub use error::{Result, RewriteError};
pub use rewriter::{Capacities, Rewriter};
pub use state::{EmuState, Taint};
pub use storage::CodeStorage;
