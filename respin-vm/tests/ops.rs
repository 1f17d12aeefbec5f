//! Instruction-family coverage: conditional data flow, widening
//! multiplies and divides, sub-word arithmetic.

#![cfg(target_arch = "x86_64")]

mod common;

use common::{call1, call2, Guest};

use respin_vm::Rewriter;
use rstest::rstest;

fn specialize(guest: &Guest, configure: impl FnOnce(&mut Rewriter), args: &[u64]) -> u64 {
    let mut rw = Rewriter::for_func(guest.addr);
    configure(&mut rw);
    let addr = rw.rewrite(args);
    assert!(
        rw.last_error().is_none(),
        "rewrite logged: {:?}",
        rw.last_error()
    );
    addr
}

#[test]
fn cmov_abs_matches_the_original() {
    // mov rax, rdi; neg rax; cmovl rax, rdi; ret
    // (rax = -x; if -x < 0, i.e. x > 0, take x back)
    let guest = Guest::load(&[
        0x48, 0x89, 0xf8, 0x48, 0xf7, 0xd8, 0x48, 0x0f, 0x4c, 0xc7, 0xc3,
    ]);
    let addr = specialize(&guest, |_| {}, &[0]);
    for x in [-9i64, -1, 0, 1, 42] {
        assert_eq!(call1(addr, x as u64), call1(guest.addr, x as u64), "x = {x}");
    }
}

#[test]
fn cmov_with_static_condition_reduces_to_a_move() {
    // Same shape, but with x static the whole thing folds to a constant.
    let guest = Guest::load(&[
        0x48, 0x89, 0xf8, 0x48, 0xf7, 0xd8, 0x48, 0x0f, 0x4c, 0xc7, 0xc3,
    ]);
    let mut rw = Rewriter::for_func(guest.addr);
    rw.mark_static(0);
    let addr = rw.rewrite(&[(-5i64) as u64]);
    assert!(rw.last_error().is_none(), "{:?}", rw.last_error());
    assert_eq!(call1(addr, (-5i64) as u64), 5);
    // mov rax, 5; ret. Nothing conditional left.
    assert_eq!(rw.captured_instr_count(), 1);
}

#[test]
fn setcc_and_movzx_build_a_boolean() {
    // cmp rdi, 0; setl al; movzx eax, al; ret
    let guest = Guest::load(&[
        0x48, 0x83, 0xff, 0x00, 0x0f, 0x9c, 0xc0, 0x0f, 0xb6, 0xc0, 0xc3,
    ]);
    let addr = specialize(&guest, |_| {}, &[0]);
    for x in [-7i64, -1, 0, 1, 7] {
        assert_eq!(call1(addr, x as u64), u64::from(x < 0), "x = {x}");
    }
}

#[test]
fn signed_division_folds_and_survives() {
    // mov rax, rdi; cqo; idiv rsi; ret
    let guest = Guest::load(&[0x48, 0x89, 0xf8, 0x48, 0x99, 0x48, 0xf7, 0xfe, 0xc3]);

    // Fully static: the quotient is a constant.
    let mut rw = Rewriter::for_func(guest.addr);
    rw.mark_static(0);
    rw.mark_static(1);
    let addr = rw.rewrite(&[100, 7]);
    assert!(rw.last_error().is_none(), "{:?}", rw.last_error());
    assert_eq!(call2(addr, 100, 7), 14);
    assert_eq!(rw.captured_instr_count(), 1);

    // Dynamic divisor: the division stays.
    let addr = specialize(&guest, |rw| rw.mark_static(0), &[100, 0]);
    for d in [1u64, 3, 7, 100] {
        assert_eq!(call2(addr, 100, d), 100 / d, "d = {d}");
    }
}

#[test]
fn unsigned_widening_multiply() {
    // mov rax, rdi; mul rsi; ret  (low half of rdi * rsi)
    let guest = Guest::load(&[0x48, 0x89, 0xf8, 0x48, 0xf7, 0xe6, 0xc3]);
    let addr = specialize(&guest, |_| {}, &[0, 0]);
    for (a, b) in [(3u64, 5u64), (u64::MAX, 2), (1 << 40, 1 << 30)] {
        assert_eq!(call2(addr, a, b), a.wrapping_mul(b));
    }
}

#[test]
fn sixteen_bit_addition_wraps_at_the_word() {
    // add di, si; movzx eax, di; ret
    let guest = Guest::load(&[0x66, 0x01, 0xf7, 0x0f, 0xb7, 0xc7, 0xc3]);
    let addr = specialize(&guest, |_| {}, &[0, 0]);
    for (a, b) in [(0x1234u64, 0x0101u64), (0xffff, 1), (0x8000, 0x8000)] {
        assert_eq!(call2(addr, a, b), (a + b) & 0xffff, "{a:#x} + {b:#x}");
    }
}

#[test]
fn shift_by_cl_folds_when_the_count_is_static() {
    // mov rax, rdi; mov rcx, rsi; shl rax, cl; ret
    let guest = Guest::load(&[
        0x48, 0x89, 0xf8, 0x48, 0x89, 0xf1, 0x48, 0xd3, 0xe0, 0xc3,
    ]);
    let mut rw = Rewriter::for_func(guest.addr);
    rw.mark_static(1);
    let addr = rw.rewrite(&[0, 4]);
    assert!(rw.last_error().is_none(), "{:?}", rw.last_error());
    for x in [1u64, 0xff, 1 << 59] {
        assert_eq!(call1(addr, x), x << 4);
    }
}

#[rstest]
#[case(0x80, -128i64 as u64)]
#[case(0x7f, 0x7f)]
#[case(0x1ff, -1i64 as u64)]
fn movsx_sign_extends_dynamic_bytes(#[case] x: u64, #[case] expected: u64) {
    // movsx rax, dil; ret
    let guest = Guest::load(&[0x48, 0x0f, 0xbe, 0xc7, 0xc3]);
    let addr = specialize(&guest, |_| {}, &[0]);
    assert_eq!(call1(addr, x), expected);
}
