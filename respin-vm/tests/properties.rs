//! Cross-cutting invariants of the rewrite pipeline.

#![cfg(target_arch = "x86_64")]

mod common;

use common::{call2, generated_bytes, Guest};

use respin_vm::Rewriter;

/// `((x << 2) + x) ^ y` with a shift, an add and an xor:
///
/// ```text
/// mov rax, rdi
/// shl rax, 2
/// add rax, rdi
/// xor rax, rsi
/// ret
/// ```
const MIXER: &[u8] = &[
    0x48, 0x89, 0xf8, 0x48, 0xc1, 0xe0, 0x02, 0x48, 0x01, 0xf8, 0x48, 0x31, 0xf0, 0xc3,
];

fn mixer_ref(x: u64, y: u64) -> u64 {
    ((x << 2).wrapping_add(x)) ^ y
}

#[test]
fn fully_static_input_leaves_no_computation() {
    // With every input known, nothing from the original computation may
    // survive: the generated function is a constant load plus return.
    let guest = Guest::load(MIXER);
    let mut rw = Rewriter::for_func(guest.addr);
    rw.mark_static(0);
    rw.mark_static(1);
    let addr = rw.rewrite(&[9, 0x1234]);
    assert!(rw.last_error().is_none(), "{:?}", rw.last_error());

    assert_eq!(call2(addr, 9, 0x1234), mixer_ref(9, 0x1234));
    assert_eq!(rw.captured_instr_count(), 1, "only the result move remains");
    // mov rax, imm32; ret
    assert_eq!(rw.generated_size(), 8);
}

#[test]
fn partially_static_input_folds_only_its_half() {
    let guest = Guest::load(MIXER);
    let mut rw = Rewriter::for_func(guest.addr);
    rw.mark_static(0);
    let addr = rw.rewrite(&[9, 0]);
    assert!(rw.last_error().is_none(), "{:?}", rw.last_error());

    for y in [0u64, 1, 0xffff_ffff, u64::MAX] {
        assert_eq!(call2(addr, 9, y), mixer_ref(9, y), "y = {y:#x}");
    }
    // The shift and add folded; only the xor against y (plus the
    // materialized constant) survives.
    let bytes = generated_bytes(&rw);
    assert!(!bytes.contains(&0xc1), "shift survived in {bytes:x?}");
}

#[test]
fn interpreter_and_generated_code_agree() {
    let guest = Guest::load(MIXER);

    for (x, y) in [(0u64, 0u64), (9, 0x1234), (u64::MAX, 1), (1 << 62, 77)] {
        let mut rw = Rewriter::for_func(guest.addr);
        let interpreted = rw.emulate(&[x, y]);
        assert!(rw.last_error().is_none(), "{:?}", rw.last_error());

        let mut rw2 = Rewriter::for_func(guest.addr);
        rw2.mark_static(0);
        rw2.mark_static(1);
        let addr = rw2.rewrite(&[x, y]);
        assert!(rw2.last_error().is_none(), "{:?}", rw2.last_error());

        assert_eq!(interpreted, call2(addr, x, y));
        assert_eq!(interpreted, mixer_ref(x, y));
    }
}

#[test]
fn rewriting_never_touches_the_original_bytes() {
    let guest = Guest::load(MIXER);
    let before =
        unsafe { std::slice::from_raw_parts(guest.addr as *const u8, MIXER.len()) }.to_vec();

    let mut rw = Rewriter::for_func(guest.addr);
    rw.mark_static(0);
    let _ = rw.rewrite(&[9, 0]);

    let after =
        unsafe { std::slice::from_raw_parts(guest.addr as *const u8, MIXER.len()) }.to_vec();
    assert_eq!(before, after);
}
