//! Stack frames: spills and reloads must carry taint byte-for-byte, and
//! captured frame setup must keep the runtime stack balanced.

#![cfg(target_arch = "x86_64")]

mod common;

use common::{call2, generated_bytes, Guest};

use respin_vm::Rewriter;

/// `long f(long x, long y)` that spills `x` through the frame:
///
/// ```text
/// push rbp
/// mov rbp, rsp
/// mov [rbp-8], rdi
/// mov rax, [rbp-8]
/// add rax, rsi
/// pop rbp
/// ret
/// ```
const SPILL: &[u8] = &[
    0x55, 0x48, 0x89, 0xe5, 0x48, 0x89, 0x7d, 0xf8, 0x48, 0x8b, 0x45, 0xf8, 0x48, 0x01, 0xf0,
    0x5d, 0xc3,
];

/// Identity through a `leave`-torn-down frame:
///
/// ```text
/// push rbp
/// mov rbp, rsp
/// sub rsp, 16
/// mov [rbp-16], rdi
/// mov rax, [rbp-16]
/// leave
/// ret
/// ```
const LEAVE_FRAME: &[u8] = &[
    0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x10, 0x48, 0x89, 0x7d, 0xf0, 0x48, 0x8b, 0x45,
    0xf0, 0xc9, 0xc3,
];

#[test]
fn static_spill_reload_stays_static() {
    let guest = Guest::load(SPILL);
    let mut rw = Rewriter::for_func(guest.addr);
    rw.mark_static(0);
    let addr = rw.rewrite(&[30, 0]);
    assert!(rw.last_error().is_none(), "{:?}", rw.last_error());

    for y in [0u64, 12, 999] {
        assert_eq!(call2(addr, 30, y), 30 + y);
    }

    // The spill and reload both folded; no frame-relative load of the
    // spilled slot survives (0x8b with an rbp-based disp8).
    let bytes = generated_bytes(&rw);
    assert!(
        !bytes.windows(3).any(|w| w[0] == 0x8b && w[1] == 0x45),
        "reload survived in {bytes:x?}"
    );
}

#[test]
fn dynamic_spill_reload_roundtrips_through_the_real_stack() {
    let guest = Guest::load(SPILL);
    let mut rw = Rewriter::for_func(guest.addr);
    let addr = rw.rewrite(&[0, 0]);
    assert!(rw.last_error().is_none(), "{:?}", rw.last_error());

    for (x, y) in [(1u64, 2u64), (u64::MAX, 1), (123456, 654321)] {
        assert_eq!(call2(addr, x, y), call2(guest.addr, x, y));
    }
}

#[test]
fn leave_restores_the_frame() {
    let guest = Guest::load(LEAVE_FRAME);

    // Dynamic argument: the value must survive the spill/reload across
    // the generated frame.
    let mut rw = Rewriter::for_func(guest.addr);
    let addr = rw.rewrite(&[0, 0]);
    assert!(rw.last_error().is_none(), "{:?}", rw.last_error());
    for x in [0u64, 7, u64::MAX / 3] {
        assert_eq!(call2(addr, x, 0), x);
    }

    // Static argument: the reload folds and only the frame plumbing
    // remains.
    let mut rw2 = Rewriter::for_func(guest.addr);
    rw2.mark_static(0);
    let addr2 = rw2.rewrite(&[41, 0]);
    assert!(rw2.last_error().is_none(), "{:?}", rw2.last_error());
    assert_eq!(call2(addr2, 41, 0), 41);
}

#[test]
fn partial_overwrite_of_a_spilled_slot_poisons_the_reload() {
    // Spill x, overwrite one byte of the slot with a dynamic value, then
    // reload the full slot. The reload must stay in the generated code.
    //
    //   push rbp
    //   mov rbp, rsp
    //   mov [rbp-8], rdi      ; spill x (static)
    //   mov [rbp-8], sil      ; clobber low byte with y's low byte
    //   mov rax, [rbp-8]      ; reload mixes static and dynamic bytes
    //   pop rbp
    //   ret
    const MIXED: &[u8] = &[
        0x55, 0x48, 0x89, 0xe5, 0x48, 0x89, 0x7d, 0xf8, 0x40, 0x88, 0x75, 0xf8, 0x48, 0x8b,
        0x45, 0xf8, 0x5d, 0xc3,
    ];
    let guest = Guest::load(MIXED);
    let mut rw = Rewriter::for_func(guest.addr);
    rw.mark_static(0);
    let addr = rw.rewrite(&[0x1122334455667788, 0]);
    assert!(rw.last_error().is_none(), "{:?}", rw.last_error());

    for y in [0u64, 0xaa, 0xff] {
        let expected = (0x1122334455667788u64 & !0xff) | (y & 0xff);
        assert_eq!(call2(addr, 0x1122334455667788, y), expected, "y = {y}");
    }
}
