//! Marker intrinsics recognized by the capture engine.
//!
//! Both functions are identity at run time. When the engine sees a call
//! to one of them during capture it applies the taint transition instead
//! of emitting the call, so functions under rewrite can steer
//! specialization:
//!
//! ```no_run
//! use respin_vm::marker::make_dynamic;
//!
//! extern "sysv64" fn kernel(x: u64) -> u64 {
//!     // Prevent the rewriter from folding over `x`.
//!     let x = make_dynamic(x);
//!     x * 3
//! }
//! ```

/// Identity; during capture, the returned value is tagged Dynamic.
#[inline(never)]
pub extern "sysv64" fn make_dynamic(v: u64) -> u64 {
    // Defeat cross-crate inlining so the call site survives into the
    // machine code the engine decodes.
    std::hint::black_box(v)
}

/// Identity; during capture, the returned value is tagged Static.
#[inline(never)]
pub extern "sysv64" fn make_static(v: u64) -> u64 {
    std::hint::black_box(v)
}

pub(crate) fn make_dynamic_addr() -> u64 {
    make_dynamic as usize as u64
}

pub(crate) fn make_static_addr() -> u64 {
    make_static as usize as u64
}
