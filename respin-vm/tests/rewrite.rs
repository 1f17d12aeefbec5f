//! End-to-end specialization scenarios.

#![cfg(target_arch = "x86_64")]

mod common;

use common::{call1, call2, call_fp, generated_bytes, Guest};

use respin_vm::Rewriter;

/// `long f(long x, long y) { return x*3 + y; }`
///
/// ```text
/// lea rax, [rdi+rdi*2]
/// add rax, rsi
/// ret
/// ```
const MUL3_ADD: &[u8] = &[0x48, 0x8d, 0x04, 0x7f, 0x48, 0x01, 0xf0, 0xc3];

/// `long sum(long n) { long s=0; for (long i=0; i<n; i++) s+=i; return s; }`
///
/// ```text
///  0: xor eax, eax
///  2: xor ecx, ecx
///  4: cmp rcx, rdi
///  7: jge 17
///  9: add rax, rcx
/// 12: inc rcx
/// 15: jmp 4
/// 17: ret
/// ```
const SUM: &[u8] = &[
    0x31, 0xc0, 0x31, 0xc9, 0x48, 0x39, 0xf9, 0x7d, 0x08, 0x48, 0x01, 0xc8, 0x48, 0xff, 0xc1,
    0xeb, 0xf3, 0xc3,
];

/// `long abs(long x) { return x < 0 ? -x : x; }`
///
/// ```text
/// mov rax, rdi
/// test rdi, rdi
/// jns ret
/// neg rax
/// ret
/// ```
const ABS: &[u8] = &[
    0x48, 0x89, 0xf8, 0x48, 0x85, 0xff, 0x79, 0x03, 0x48, 0xf7, 0xd8, 0xc3,
];

fn rewritten(guest: &Guest, configure: impl FnOnce(&mut Rewriter), args: &[u64]) -> (Rewriter, u64) {
    let mut rw = Rewriter::for_func(guest.addr);
    configure(&mut rw);
    let addr = rw.rewrite(args);
    assert!(
        rw.last_error().is_none(),
        "rewrite logged: {:?}",
        rw.last_error()
    );
    assert_ne!(addr, guest.addr, "a specialized copy was generated");
    (rw, addr)
}

#[test]
fn constant_folding_eliminates_the_multiply() {
    let guest = Guest::load(MUL3_ADD);
    let (rw, addr) = rewritten(&guest, |rw| rw.mark_static(0), &[7, 0]);

    for y in [0u64, 5, 100, u64::MAX] {
        assert_eq!(call2(addr, 7, y), call2(guest.addr, 7, y));
    }
    assert_eq!(call2(addr, 7, 5), 26);

    // The lea-based multiply folded away: no 0x8d opcode survives.
    let bytes = generated_bytes(&rw);
    assert!(!bytes.contains(&0x8d), "no lea in {bytes:x?}");
}

#[test]
fn static_loop_bound_unrolls_completely() {
    let guest = Guest::load(SUM);
    let (rw, addr) = rewritten(&guest, |rw| rw.mark_static(0), &[4]);

    assert_eq!(call1(addr, 4), 6);
    assert_eq!(call1(guest.addr, 4), 6);

    // Everything folded to a constant: one block, no compare, no branch.
    assert_eq!(rw.captured_block_count(), 1);
    let bytes = generated_bytes(&rw);
    assert!(!bytes.contains(&0x39), "no cmp in {bytes:x?}");
}

#[test]
fn force_unknown_preserves_the_loop() {
    let guest = Guest::load(SUM);
    let (rw, addr) = rewritten(
        &guest,
        |rw| {
            rw.mark_static(0);
            rw.force_unknown(0);
        },
        &[4],
    );

    // The specialized code must work for every runtime bound, not just
    // the one passed at rewrite time.
    for n in 0u64..20 {
        assert_eq!(call1(addr, n), n * n.saturating_sub(1) / 2, "n = {n}");
    }

    // A loop survived: several blocks, at least one backward branch.
    assert!(rw.captured_block_count() > 1);
}

#[test]
fn dynamic_condition_keeps_one_branch() {
    let guest = Guest::load(ABS);
    let (rw, addr) = rewritten(&guest, |_| {}, &[0]);

    for x in [-3i64, 0, 7, i64::MIN + 1] {
        assert_eq!(call1(addr, x as u64), call1(guest.addr, x as u64), "x = {x}");
    }
    assert_eq!(call1(addr, (-3i64) as u64), 3);

    // One residual conditional, both sides captured.
    assert!(rw.captured_block_count() >= 3);
}

extern "sysv64" fn double_it(x: u64) -> u64 {
    std::hint::black_box(x.wrapping_mul(2))
}

#[test]
fn unrecognized_call_is_preserved() {
    // movabs rax, double_it; call rax; inc rax; ret
    let guest = Guest::load_with(|_at| {
        let mut b = vec![0x48, 0xb8];
        b.extend_from_slice(&(double_it as usize as u64).to_le_bytes());
        b.extend_from_slice(&[0xff, 0xd0]); // call rax
        b.extend_from_slice(&[0x48, 0xff, 0xc0]); // inc rax
        b.push(0xc3);
        b
    });

    let (rw, addr) = rewritten(&guest, |_| {}, &[0]);
    for x in [0u64, 5, 1000] {
        assert_eq!(call1(addr, x), 2 * x + 1);
    }

    // A call instruction survived: either rel32 (e8) or the scratch
    // register form (ff /2).
    let bytes = generated_bytes(&rw);
    let has_call = bytes.contains(&0xe8)
        || bytes.windows(2).any(|w| w == [0xff, 0xd3]);
    assert!(has_call, "no call in {bytes:x?}");
}

/// Stencil interpreter driven by a table of `(factor, offset)` entries:
///
/// ```text
///  0: xorps xmm0, xmm0
///  3: xor ecx, ecx
///  5: mov r8, [rdx]            ; entry count
///  8: lea r9, [rdx+8]          ; first entry
/// 12: cmp rcx, r8
/// 15: jge 44
/// 17: movsd xmm1, [r9]         ; factor
/// 22: mov rax, [r9+8]          ; offset
/// 26: mulsd xmm1, [rdi+rax*8]
/// 31: addsd xmm0, xmm1
/// 35: add r9, 16
/// 39: inc rcx
/// 42: jmp 12
/// 44: ret
/// ```
const STENCIL_APPLY: &[u8] = &[
    0x0f, 0x57, 0xc0, 0x31, 0xc9, 0x4c, 0x8b, 0x02, 0x4c, 0x8d, 0x4a, 0x08, 0x4c, 0x39, 0xc1,
    0x7d, 0x1b, 0xf2, 0x41, 0x0f, 0x10, 0x09, 0x49, 0x8b, 0x41, 0x08, 0xf2, 0x0f, 0x59, 0x0c,
    0xc7, 0xf2, 0x0f, 0x58, 0xc1, 0x49, 0x83, 0xc1, 0x10, 0x48, 0xff, 0xc1, 0xeb, 0xe0, 0xc3,
];

#[repr(C)]
struct Stencil {
    count: i64,
    entries: [(f64, i64); 5],
}

#[test]
fn static_stencil_unrolls_to_straight_line_loads() {
    let guest = Guest::load(STENCIL_APPLY);

    let xsize = 8i64;
    let stencil = Stencil {
        count: 5,
        entries: [
            (-0.2, 0),
            (0.3, -1),
            (0.3, 1),
            (0.3, -xsize),
            (0.3, xsize),
        ],
    };
    let mut grid = [0.0f64; 64];
    for (i, cell) in grid.iter_mut().enumerate() {
        *cell = (i as f64) * 0.25 - 3.0;
    }
    let center = &grid[24] as *const f64;
    let s_ptr = &stencil as *const Stencil as *const u8;

    let mut rw = Rewriter::for_func(guest.addr);
    rw.mark_static(2);
    rw.returns_fp();
    let addr = rw.rewrite(&[center as u64, xsize as u64, s_ptr as u64]);
    assert!(rw.last_error().is_none(), "{:?}", rw.last_error());
    assert_ne!(addr, guest.addr);

    let expected = call_fp(guest.addr, center, xsize, s_ptr);
    let got = call_fp(addr, center, xsize, s_ptr);
    assert_eq!(got.to_bits(), expected.to_bits(), "bit-exact result");

    // The loop unrolled: a single block, no compare left.
    assert_eq!(rw.captured_block_count(), 1);
    let bytes = generated_bytes(&rw);
    assert!(!bytes.contains(&0x39), "no cmp in {bytes:x?}");
    // Five multiplies against the dynamic grid survive.
    let mulsd = bytes.windows(3).filter(|w| *w == [0xf2, 0x0f, 0x59]).count();
    assert_eq!(mulsd, 5);
}

#[test]
fn rewritten_code_is_deterministic() {
    let guest = Guest::load(MUL3_ADD);

    let (rw1, _) = rewritten(&guest, |rw| rw.mark_static(0), &[7, 0]);
    let (rw2, _) = rewritten(&guest, |rw| rw.mark_static(0), &[7, 0]);
    assert_eq!(generated_bytes(&rw1), generated_bytes(&rw2));
}

#[test]
fn failed_rewrite_returns_the_original_function() {
    let guest = Guest::load(MUL3_ADD);
    let mut rw = Rewriter::for_func(guest.addr);
    // Zero capture capacity cannot hold even one block.
    rw.set_capture_capacity(0, 0, 4096);
    let addr = rw.rewrite(&[7, 0]);
    assert_eq!(addr, guest.addr);
    assert!(rw.last_error().is_some());
    // The fallback still computes correctly, by construction.
    assert_eq!(call2(addr, 7, 5), 26);
}
