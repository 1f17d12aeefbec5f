//! Golden encode cases: IR built by hand against the expected bytes.

use respin_asm::encode::{encode_one, EncodeError};
use respin_asm::{
    reg, Cond, Instruction, InstrKind, MemRef, Operand, Reg, RegKind, ValType,
};

use rstest::rstest;

fn enc(i: &Instruction, at: u64) -> Vec<u8> {
    let mut out = Vec::new();
    encode_one(i, at, &mut out).expect("encodes");
    out
}

fn gp64(i: u8) -> Operand {
    Operand::reg(Reg::gp64(i))
}

#[rstest]
#[case(Instruction::nullary(0, InstrKind::Ret), &[0xc3])]
#[case(Instruction::nullary(0, InstrKind::Nop), &[0x90])]
#[case(Instruction::nullary(0, InstrKind::Leave), &[0xc9])]
#[case(
    Instruction::binary(0, InstrKind::Add, ValType::I64, gp64(reg::RAX), gp64(reg::RSI)),
    &[0x48, 0x01, 0xf0]
)]
#[case(
    Instruction::binary(0, InstrKind::Add, ValType::I64, gp64(reg::RSP), Operand::imm(ValType::I8, 0x10)),
    &[0x48, 0x83, 0xc4, 0x10]
)]
#[case(
    Instruction::binary(0, InstrKind::Mov, ValType::I64, gp64(reg::RAX), Operand::imm(ValType::I32, 42)),
    &[0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00]
)]
#[case(
    Instruction::binary(0, InstrKind::Mov, ValType::I64, gp64(reg::RAX), Operand::imm64(0x1122334455667788)),
    &[0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
)]
#[case(
    Instruction::unary(0, InstrKind::Push, ValType::I64, gp64(reg::RBP)),
    &[0x55]
)]
#[case(
    Instruction::unary(0, InstrKind::Pop, ValType::I64, gp64(13)),
    &[0x41, 0x5d]
)]
#[case(
    Instruction::unary(0, InstrKind::Neg, ValType::I64, gp64(reg::RAX)),
    &[0x48, 0xf7, 0xd8]
)]
#[case(
    Instruction::binary(
        0,
        InstrKind::Mov,
        ValType::I64,
        Operand::mem(MemRef::base_disp(ValType::I64, Reg::gp64(reg::RSP), 8)),
        gp64(reg::RCX),
    ),
    &[0x48, 0x89, 0x4c, 0x24, 0x08]
)]
#[case(
    Instruction::binary(
        0,
        InstrKind::Mov,
        ValType::I32,
        Operand::reg(Reg::new(RegKind::Gp32, reg::RAX)),
        Operand::mem(MemRef::base_disp(ValType::I32, Reg::gp64(reg::RBP), -4)),
    ),
    &[0x8b, 0x45, 0xfc]
)]
fn golden(#[case] instr: Instruction, #[case] expected: &[u8]) {
    assert_eq!(enc(&instr, 0x4000), expected);
}

#[test]
fn branch_width_selection_is_shortest_that_reaches() {
    // Backward jump to the block entry two bytes away: rel8.
    let near = Instruction::unary(0, InstrKind::Jmp, ValType::None, Operand::imm64(0x4000));
    assert_eq!(enc(&near, 0x4000), vec![0xeb, 0xfe]);

    // A target 0x1000 ahead cannot use rel8.
    let far = Instruction::unary(0, InstrKind::Jmp, ValType::None, Operand::imm64(0x5000));
    assert_eq!(enc(&far, 0x4000), vec![0xe9, 0xfb, 0x0f, 0x00, 0x00]);

    let mut jcc = Instruction::unary(0, InstrKind::Jcc, ValType::None, Operand::imm64(0x4010));
    jcc.cond = Some(Cond::Ne);
    assert_eq!(enc(&jcc, 0x4000), vec![0x75, 0x0e]);

    let call = Instruction::unary(0, InstrKind::Call, ValType::None, Operand::imm64(0x4105));
    assert_eq!(enc(&call, 0x4000), vec![0xe8, 0x00, 0x01, 0x00, 0x00]);
}

#[test]
fn sixteen_bit_operations_carry_the_operand_size_prefix() {
    let i = Instruction::binary(
        0,
        InstrKind::Add,
        ValType::I16,
        Operand::reg(Reg::new(RegKind::Gp16, reg::RAX)),
        Operand::imm(ValType::I8, 5),
    );
    assert_eq!(enc(&i, 0), vec![0x66, 0x83, 0xc0, 0x05]);
}

#[test]
fn spl_needs_rex_and_ah_refuses_it() {
    // mov spl, 1 must carry a bare 0x40.
    let spl = Instruction::binary(
        0,
        InstrKind::Mov,
        ValType::I8,
        Operand::reg(Reg::new(RegKind::Gp8, reg::RSP)),
        Operand::imm(ValType::I8, 1),
    );
    assert_eq!(enc(&spl, 0), vec![0x40, 0xb4, 0x01]);

    // mov ah, r8b would need REX.B for r8b, which ah forbids.
    let bad = Instruction::binary(
        0,
        InstrKind::Mov,
        ValType::I8,
        Operand::reg(Reg::new(RegKind::Gp8High, 0)),
        Operand::reg(Reg::new(RegKind::Gp8, 8)),
    );
    let mut out = Vec::new();
    assert_eq!(
        encode_one(&bad, 0, &mut out),
        Err(EncodeError::RexConflict)
    );
}

#[test]
fn rbp_base_forces_a_zero_displacement_byte() {
    let i = Instruction::binary(
        0,
        InstrKind::Mov,
        ValType::I64,
        gp64(reg::RAX),
        Operand::mem(MemRef::base_disp(ValType::I64, Reg::gp64(reg::RBP), 0)),
    );
    // mod=01 with disp8 0, not mod=00.
    assert_eq!(enc(&i, 0), vec![0x48, 0x8b, 0x45, 0x00]);
}

#[test]
fn no_base_memory_operand_uses_sib_disp32() {
    let i = Instruction::binary(
        0,
        InstrKind::Mov,
        ValType::I64,
        gp64(reg::RAX),
        Operand::mem(MemRef::absolute(ValType::I64, 0x28)),
    );
    assert_eq!(
        enc(&i, 0),
        vec![0x48, 0x8b, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00]
    );
}
