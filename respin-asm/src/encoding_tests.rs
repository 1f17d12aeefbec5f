use crate::decode::decode_one;
use crate::encode::encode_one;
use crate::*;

use proptest::prelude::*;

/// Instructions compare as "the same" when they agree on everything except
/// the encoding width chosen for immediates (`0x81` vs `0x83` forms decode
/// to different declared widths for the same value).
fn assert_equiv(a: &Instruction, b: &Instruction) {
    assert_eq!(a.kind, b.kind, "{a} vs {b}");
    assert_eq!(a.cond, b.cond, "{a} vs {b}");
    assert_eq!(a.vtype, b.vtype, "{a} vs {b}");
    for (x, y) in [(&a.dst, &b.dst), (&a.src, &b.src), (&a.src2, &b.src2)] {
        match (x, y) {
            (Operand::Imm { .. }, Operand::Imm { .. }) => {
                assert_eq!(x.as_imm(), y.as_imm(), "{a} vs {b}")
            }
            _ => assert_eq!(x, y, "{a} vs {b}"),
        }
    }
}

fn roundtrip(bytes: &[u8], addr: u64) {
    let decoded = decode_one(bytes, addr).expect("decodes");
    assert_eq!(decoded.len as usize, bytes.len(), "consumed all of {bytes:x?}");
    let mut out = Vec::new();
    encode_one(&decoded, addr, &mut out).expect("encodes");
    let redecoded = decode_one(&out, addr).expect("redecodes");
    assert_equiv(&decoded, &redecoded);
}

#[test]
fn alu_roundtrips_across_forms() {
    // MR, RM and immediate encodings of every ALU kind.
    for base in [0x00u8, 0x08, 0x10, 0x18, 0x20, 0x28, 0x30, 0x38] {
        roundtrip(&[0x48, base | 0x01, 0xd9], 0x4000); // op rcx, rbx
        roundtrip(&[0x48, base | 0x03, 0x0b], 0x4000); // op rcx, [rbx]
        roundtrip(&[base | 0x01, 0xf7], 0x4000); // op edi, esi
    }
    // Group-1 immediates, both widths.
    roundtrip(&[0x48, 0x83, 0xc0, 0x10], 0x4000); // add rax, 0x10
    roundtrip(&[0x48, 0x81, 0xc0, 0x00, 0x10, 0x00, 0x00], 0x4000); // add rax, 0x1000
    roundtrip(&[0x83, 0xe1, 0x0f], 0x4000); // and ecx, 0xf
}

#[test]
fn mov_and_lea_roundtrip() {
    roundtrip(&[0x48, 0x89, 0xf8], 0x4000); // mov rax, rdi
    roundtrip(&[0x8b, 0x45, 0xfc], 0x4000); // mov eax, [rbp-4]
    roundtrip(&[0x48, 0x89, 0x4c, 0x24, 0x08], 0x4000); // mov [rsp+8], rcx
    roundtrip(&[0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00], 0x4000); // mov rax, 42
    roundtrip(
        &[0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
        0x4000,
    ); // movabs
    roundtrip(&[0x48, 0x8d, 0x04, 0x7f], 0x4000); // lea rax, [rdi+rdi*2]
    roundtrip(&[0x4c, 0x8d, 0x24, 0xc8], 0x4000); // lea r12, [rax+rcx*8]
}

#[test]
fn extended_register_roundtrips_keep_rex() {
    roundtrip(&[0x4d, 0x89, 0xe6], 0x4000); // mov r14, r12
    roundtrip(&[0x41, 0x55], 0x4000); // push r13
    roundtrip(&[0x45, 0x31, 0xed], 0x4000); // xor r13d, r13d
    roundtrip(&[0x49, 0xf7, 0xdb], 0x4000); // neg r11
}

#[test]
fn passthrough_reencoding_is_byte_exact() {
    // SSE instructions carry a passthrough record; encoding must
    // reproduce the original bytes exactly.
    let cases: &[&[u8]] = &[
        &[0xf3, 0x0f, 0x10, 0x07],       // movss xmm0, [rdi]
        &[0xf2, 0x0f, 0x58, 0xc1],       // addsd xmm0, xmm1
        &[0x66, 0x0f, 0xef, 0xc9],       // pxor xmm1, xmm1
        &[0x0f, 0x28, 0x44, 0x24, 0x10], // movaps xmm0, [rsp+16]
        &[0x66, 0x0f, 0x6f, 0x01],       // movdqa xmm0, [rcx]
        &[0x66, 0x0f, 0xd7, 0xc1],       // pmovmskb eax, xmm1
        &[0x66, 0x48, 0x0f, 0x6e, 0xc7], // movq xmm0, rdi
        &[0x0f, 0x14, 0xc1],             // unpcklps xmm0, xmm1
    ];
    for bytes in cases {
        let decoded = decode_one(bytes, 0x4000).expect("decodes");
        assert!(decoded.passthrough.is_some(), "{bytes:x?}");
        let mut out = Vec::new();
        encode_one(&decoded, 0x4000, &mut out).expect("encodes");
        assert_eq!(&out[..], *bytes);
    }
}

#[test]
fn branch_targets_resolve_absolutely() {
    // je +5 at 0x4000: target is 0x4007.
    let i = decode_one(&[0x74, 0x05], 0x4000).unwrap();
    assert_eq!(i.kind, InstrKind::Jcc);
    assert_eq!(i.cond, Some(Cond::E));
    assert_eq!(i.dst.as_imm(), Some(0x4007));

    // Re-encoding at the same address gives the same bytes.
    let mut out = Vec::new();
    encode_one(&i, 0x4000, &mut out).unwrap();
    assert_eq!(out, vec![0x74, 0x05]);

    // Re-encoding far away promotes to rel32 and still hits the target.
    let mut far = Vec::new();
    encode_one(&i, 0x9000, &mut far).unwrap();
    let again = decode_one(&far, 0x9000).unwrap();
    assert_eq!(again.dst.as_imm(), Some(0x4007));
}

#[test]
fn rip_relative_operands_are_absolute_in_ir() {
    // mov rax, [rip+0x10] at 0x4000; instruction is 7 bytes.
    let i = decode_one(&[0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00], 0x4000).unwrap();
    let mem = i.src.as_mem().unwrap();
    assert!(mem.is_rip_relative());
    assert_eq!(mem.disp, 0x4017);

    // Moving the instruction re-derives the displacement.
    let mut out = Vec::new();
    encode_one(&i, 0x5000, &mut out).unwrap();
    let again = decode_one(&out, 0x5000).unwrap();
    assert_eq!(again.src.as_mem().unwrap().disp, 0x4017);
}

#[test]
fn shift_and_unary_groups_roundtrip() {
    roundtrip(&[0x48, 0xc1, 0xe0, 0x04], 0x4000); // shl rax, 4
    roundtrip(&[0x48, 0xd1, 0xf8], 0x4000); // sar rax, 1
    roundtrip(&[0x48, 0xd3, 0xe8], 0x4000); // shr rax, cl
    roundtrip(&[0x48, 0xf7, 0xd8], 0x4000); // neg rax
    roundtrip(&[0xf7, 0xd1], 0x4000); // not ecx
    roundtrip(&[0x48, 0xff, 0xc0], 0x4000); // inc rax
    roundtrip(&[0xff, 0xc9], 0x4000); // dec ecx
    roundtrip(&[0x48, 0x0f, 0xaf, 0xc7], 0x4000); // imul rax, rdi
    roundtrip(&[0x48, 0x6b, 0xc7, 0x03], 0x4000); // imul rax, rdi, 3
    roundtrip(&[0x48, 0x0f, 0xbc, 0xc7], 0x4000); // bsf rax, rdi
    roundtrip(&[0x0f, 0xb6, 0xc0], 0x4000); // movzx eax, al
    roundtrip(&[0x48, 0x63, 0xc7], 0x4000); // movsxd rax, edi
    roundtrip(&[0x48, 0x0f, 0x44, 0xc1], 0x4000); // cmove rax, rcx
    roundtrip(&[0x0f, 0x94, 0xc0], 0x4000); // sete al
}

proptest! {
    // Arbitrary bytes never panic the decoder, and any successful decode
    // reports a length that frames real input bytes.
    #[test]
    fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..24)) {
        match decode_one(&bytes, 0x7000_0000) {
            Ok(i) => {
                prop_assert!(i.len as usize <= bytes.len());
                prop_assert!(i.len as usize <= decode::MAX_INSTR_LEN);
                prop_assert!(i.len > 0);
            }
            Err(_) => {}
        }
    }

    // Valid single-instruction streams decode identically regardless of
    // trailing garbage.
    #[test]
    fn trailing_bytes_do_not_change_decode(tail in proptest::collection::vec(any::<u8>(), 0..8)) {
        let body: &[u8] = &[0x48, 0x01, 0xf0]; // add rax, rsi
        let mut padded = body.to_vec();
        padded.extend_from_slice(&tail);
        let a = decode_one(body, 0x4000).unwrap();
        let b = decode_one(&padded, 0x4000).unwrap();
        prop_assert_eq!(a, b);
    }
}
