//! Golden decode cases: raw bytes against the expected rendering.

use respin_asm::decode::{decode_one, DecodeError};
use respin_asm::{InstrKind, Operand, Reg, RegKind, Segment, ValType};

use rstest::rstest;

#[rstest]
#[case(&[0x48, 0x01, 0xf0], "add rax, rsi")]
#[case(&[0x01, 0xf0], "add eax, esi")]
#[case(&[0x48, 0x83, 0xc4, 0x10], "add rsp, 0x10")]
#[case(&[0x48, 0x29, 0xc8], "sub rax, rcx")]
#[case(&[0x48, 0x89, 0xf8], "mov rax, rdi")]
#[case(&[0x88, 0xc8], "mov al, cl")]
#[case(&[0x4d, 0x89, 0xe6], "mov r14, r12")]
#[case(&[0x48, 0x8d, 0x04, 0x7f], "lea rax, [rdi+rdi*2]")]
#[case(&[0x8b, 0x45, 0xfc], "mov eax, [rbp-0x4]")]
#[case(&[0x48, 0x89, 0x4c, 0x24, 0x08], "mov [rsp+0x8], rcx")]
#[case(&[0x55], "push rbp")]
#[case(&[0x41, 0x5d], "pop r13")]
#[case(&[0xc3], "ret")]
#[case(&[0xc9], "leave")]
#[case(&[0x48, 0x98], "cdqe")]
#[case(&[0x48, 0x99], "cqo")]
#[case(&[0x48, 0xf7, 0xf9], "idiv rcx")]
#[case(&[0x48, 0xf7, 0xe1], "mul rcx")]
#[case(&[0x0f, 0xaf, 0xc7], "imul eax, edi")]
#[case(&[0x48, 0x6b, 0xc7, 0x03], "imul rax, rdi, 0x3")]
#[case(&[0x0f, 0xb6, 0xc0], "movzx eax, al")]
#[case(&[0x48, 0x0f, 0xbe, 0xc3], "movsx rax, bl")]
#[case(&[0x48, 0x63, 0xc7], "movsx rax, edi")]
#[case(&[0x48, 0x0f, 0x44, 0xc1], "cmove rax, rcx")]
#[case(&[0x0f, 0x94, 0xc0], "sete al")]
#[case(&[0x48, 0xc1, 0xe0, 0x04], "shl rax, 0x4")]
#[case(&[0x48, 0x0f, 0xbc, 0xc7], "bsf rax, rdi")]
#[case(&[0xf3, 0x0f, 0x10, 0x07], "movss xmm0, [rdi]")]
#[case(&[0xf2, 0x0f, 0x58, 0xc1], "addsd xmm0, xmm1")]
#[case(&[0x66, 0x0f, 0xef, 0xc9], "pxor xmm1, xmm1")]
#[case(&[0x66, 0x0f, 0xd7, 0xc1], "pmovmskb eax, xmm1")]
#[case(&[0x0f, 0x14, 0xc1], "unpcklps xmm0, xmm1")]
fn golden(#[case] bytes: &[u8], #[case] rendered: &str) {
    let i = decode_one(bytes, 0).expect("decodes");
    assert_eq!(i.len as usize, bytes.len());
    let text = i.to_string();
    let (_, body) = text.split_once(": ").expect("address prefix");
    let normalized = body.split_whitespace().collect::<Vec<_>>().join(" ");
    assert_eq!(normalized, rendered);
}

#[test]
fn length_is_faithful_for_every_prefix_combination() {
    // The same add with more and more prefixes layered in front.
    let body = [0x01u8, 0xf0];
    let mut bytes = vec![0x64, 0x66, 0x48];
    bytes.extend_from_slice(&body);
    let i = decode_one(&bytes, 0).unwrap();
    assert_eq!(i.len as usize, bytes.len());
    // The REX byte directly precedes the opcode, so it survives; with
    // REX.W in effect the 0x66 prefix loses.
    assert_eq!(i.vtype, ValType::I64);
}

#[test]
fn segment_override_lands_on_the_memory_operand() {
    // mov rax, fs:[0x28]
    let i = decode_one(&[0x64, 0x48, 0x8b, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00], 0).unwrap();
    assert_eq!(i.kind, InstrKind::Mov);
    let mem = i.src.as_mem().unwrap();
    assert_eq!(mem.segment, Segment::Fs);
    assert_eq!(mem.base, None);
    assert_eq!(mem.disp, 0x28);
}

#[test]
fn unknown_opcode_is_invalid_not_error() {
    // int3 is outside the supported set.
    let i = decode_one(&[0xcc], 0).unwrap();
    assert_eq!(i.kind, InstrKind::Invalid);
    assert_eq!(i.len, 1);
}

#[test]
fn truncated_input_is_an_error() {
    assert_eq!(
        decode_one(&[0x48, 0x81], 0x100),
        Err(DecodeError::Truncated { addr: 0x100 })
    );
    assert_eq!(
        decode_one(&[], 0x100),
        Err(DecodeError::Truncated { addr: 0x100 })
    );
}

#[test]
fn decode_is_a_pure_function_of_bytes_and_address() {
    let bytes = [0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00];
    let a = decode_one(&bytes, 0x4000).unwrap();
    let b = decode_one(&bytes, 0x4000).unwrap();
    assert_eq!(a, b);
}

#[test]
fn byte_registers_distinguish_rex_and_legacy_names() {
    // With REX, encoding 4 is spl; without, it is ah.
    let with_rex = decode_one(&[0x40, 0x88, 0xe0], 0).unwrap();
    assert_eq!(with_rex.src, Operand::reg(Reg::new(RegKind::Gp8, 4)));

    let without = decode_one(&[0x88, 0xe0], 0).unwrap();
    assert_eq!(without.src, Operand::reg(Reg::new(RegKind::Gp8High, 0)));
}
