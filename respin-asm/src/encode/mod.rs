//! Single-instruction encoding back to x86-64 bytes.
//!
//! [`encode_one`] re-emits one [`Instruction`] at a chosen address. Direct
//! branches resolve their absolute target (held in the destination
//! operand) against that address, picking the shortest displacement that
//! reaches; block layout and successor patching are the rewriter's job.

mod rex;
mod sink;

pub use sink::CodeSink;

use crate::{
    Instruction, InstrKind, MemRef, OpcodeMap, Operand, Passthrough, PtEncoding, Reg, ValType,
};

use rex::{modrm_byte, sib_byte, Disp, Rex};

use core::fmt;

/// Worst-case encoded length of a conditional jump (`0f 8x rel32`).
pub const MAX_JCC_LEN: usize = 6;

/// Worst-case encoded length of an unconditional jump (`e9 rel32`).
pub const MAX_JMP_LEN: usize = 5;

/// Encoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// No encoding is known for this kind/operand combination.
    Unencodable {
        /// The offending operation.
        kind: InstrKind,
    },
    /// A legacy high-byte register was combined with operands that demand
    /// a REX prefix.
    RexConflict,
    /// A displacement does not fit its widest encodable form.
    DispRange {
        /// The displacement value.
        disp: i64,
    },
    /// An immediate does not fit the chosen encoding.
    ImmRange {
        /// The immediate value.
        value: i64,
    },
    /// A branch target is out of rel32 range.
    BranchRange {
        /// Displacement from the end of the instruction.
        disp: i64,
    },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unencodable { kind } => write!(f, "no encoding for {kind}"),
            Self::RexConflict => {
                f.write_str("high-byte register cannot be combined with a REX prefix")
            }
            Self::DispRange { disp } => write!(f, "displacement {disp:#x} out of range"),
            Self::ImmRange { value } => write!(f, "immediate {value:#x} out of range"),
            Self::BranchRange { disp } => write!(f, "branch displacement {disp:#x} out of range"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Encode `instr` as if placed at address `at`.
pub fn encode_one(
    instr: &Instruction,
    at: u64,
    sink: &mut impl CodeSink,
) -> Result<(), EncodeError> {
    let start = sink.pos();
    let rip_patch = if let Some(pt) = instr.passthrough {
        encode_passthrough(instr, &pt, sink)?
    } else {
        encode_plain(instr, at, sink)?
    };

    // RIP-relative displacements are relative to the end of the final
    // encoding; the operand carries the absolute target.
    if let Some(pos) = rip_patch {
        let mem = instr_mem(instr).expect("rip patch implies a memory operand");
        let end = at.wrapping_add((sink.pos() - start) as u64);
        let disp = (mem.disp as u64).wrapping_sub(end) as i64;
        let disp = i32::try_from(disp).map_err(|_| EncodeError::DispRange { disp })?;
        sink.patch4(pos, disp as u32);
    }
    Ok(())
}

fn instr_mem(instr: &Instruction) -> Option<&MemRef> {
    instr
        .dst
        .as_mem()
        .or_else(|| instr.src.as_mem())
        .or_else(|| instr.src2.as_mem())
}

fn seg_prefix(instr: &Instruction) -> Option<u8> {
    instr_mem(instr).and_then(|m| m.segment.prefix_byte())
}

fn emit_prefixes(
    sink: &mut impl CodeSink,
    seg: Option<u8>,
    vtype: ValType,
    mand: Option<u8>,
    rex: &Rex,
) -> Result<(), EncodeError> {
    if let Some(s) = seg {
        sink.put1(s);
    }
    if vtype == ValType::I16 {
        sink.put1(0x66);
    }
    if let Some(p) = mand {
        sink.put1(p);
    }
    if rex.is_conflicted() {
        return Err(EncodeError::RexConflict);
    }
    if let Some(b) = rex.byte() {
        sink.put1(b);
    }
    Ok(())
}

/// Emit ModR/M (+SIB, +disp) for a memory `r/m`. Returns the position of
/// a RIP-relative disp32 that the caller must patch once the instruction
/// length is final.
fn emit_modrm_mem(
    sink: &mut impl CodeSink,
    reg_enc: u8,
    mem: &MemRef,
) -> Result<Option<usize>, EncodeError> {
    mem.assert_well_formed();

    if mem.is_rip_relative() {
        sink.put1(modrm_byte(0, reg_enc, 5));
        let pos = sink.pos();
        sink.put4(0);
        return Ok(Some(pos));
    }

    let needs_sib = mem.index.is_some()
        || mem.base.is_none()
        || matches!(mem.base, Some(b) if b.index() & 7 == 4);

    if !needs_sib {
        let base = mem.base.expect("no-base operands take the SIB path");
        let disp = Disp::classify(mem.disp, Some(base))
            .ok_or(EncodeError::DispRange { disp: mem.disp })?;
        sink.put1(modrm_byte(disp.m0d(), reg_enc, base.hw_enc()));
        emit_disp(sink, disp);
        return Ok(None);
    }

    let scale_log2 = if mem.scale == 0 {
        0
    } else {
        mem.scale.trailing_zeros() as u8
    };
    let index_enc = mem.index.map_or(4, |i| i.hw_enc());

    match mem.base {
        None => {
            // No base: mod=0, base=5, always disp32.
            sink.put1(modrm_byte(0, reg_enc, 4));
            sink.put1(sib_byte(scale_log2, index_enc, 5));
            let disp = i32::try_from(mem.disp)
                .map_err(|_| EncodeError::DispRange { disp: mem.disp })?;
            sink.put4(disp as u32);
        }
        Some(base) => {
            let disp = Disp::classify(mem.disp, Some(base))
                .ok_or(EncodeError::DispRange { disp: mem.disp })?;
            sink.put1(modrm_byte(disp.m0d(), reg_enc, 4));
            sink.put1(sib_byte(scale_log2, index_enc, base.hw_enc()));
            emit_disp(sink, disp);
        }
    }
    Ok(None)
}

fn emit_disp(sink: &mut impl CodeSink, disp: Disp) {
    match disp {
        Disp::None => {}
        Disp::D8(d) => sink.put1(d as u8),
        Disp::D32(d) => sink.put4(d as u32),
    }
}

/// Emit opcode + ModR/M for a `reg`-and-`r/m` shaped instruction.
fn emit_op_modrm(
    sink: &mut impl CodeSink,
    instr: &Instruction,
    vtype: ValType,
    mand: Option<u8>,
    rex_w: bool,
    map: OpcodeMap,
    opcode: u8,
    reg_enc: u8,
    reg_for_rex: Option<Reg>,
    rm: &Operand,
) -> Result<Option<usize>, EncodeError> {
    let mut rex = Rex::for_width(vtype).w(rex_w || vtype == ValType::I64);
    if let Some(r) = reg_for_rex {
        rex.reg(r);
    }
    match rm {
        Operand::Reg(r) => rex.rm(*r),
        Operand::Mem(m) => rex.mem(m),
        _ => return Err(EncodeError::Unencodable { kind: instr.kind }),
    }
    emit_prefixes(sink, seg_prefix(instr), vtype, mand, &rex)?;
    if map == OpcodeMap::Two {
        sink.put1(0x0f);
    }
    sink.put1(opcode);
    match rm {
        Operand::Reg(r) => {
            sink.put1(modrm_byte(3, reg_enc, r.hw_enc()));
            Ok(None)
        }
        Operand::Mem(m) => emit_modrm_mem(sink, reg_enc, m),
        _ => unreachable!(),
    }
}

fn imm_width_for(vtype: ValType, value: i64) -> Result<ValType, EncodeError> {
    match vtype {
        ValType::I8 => Ok(ValType::I8),
        ValType::I16 => Ok(ValType::I16),
        _ => {
            if i32::try_from(value).is_ok() {
                Ok(ValType::I32)
            } else {
                Err(EncodeError::ImmRange { value })
            }
        }
    }
}

fn emit_imm(sink: &mut impl CodeSink, width: ValType, value: i64) {
    match width {
        ValType::I8 => sink.put1(value as u8),
        ValType::I16 => sink.put2(value as u16),
        ValType::I64 => sink.put8(value as u64),
        _ => sink.put4(value as u32),
    }
}

const fn alu_base(kind: InstrKind) -> Option<u8> {
    match kind {
        InstrKind::Add => Some(0x00),
        InstrKind::Or => Some(0x08),
        InstrKind::Adc => Some(0x10),
        InstrKind::Sbb => Some(0x18),
        InstrKind::And => Some(0x20),
        InstrKind::Sub => Some(0x28),
        InstrKind::Xor => Some(0x30),
        InstrKind::Cmp => Some(0x38),
        _ => None,
    }
}

const fn alu_digit(kind: InstrKind) -> u8 {
    match kind {
        InstrKind::Add => 0,
        InstrKind::Or => 1,
        InstrKind::Adc => 2,
        InstrKind::Sbb => 3,
        InstrKind::And => 4,
        InstrKind::Sub => 5,
        InstrKind::Xor => 6,
        _ => 7,
    }
}

const fn shift_digit(kind: InstrKind) -> u8 {
    match kind {
        InstrKind::Shl => 4,
        InstrKind::Shr => 5,
        _ => 7,
    }
}

fn encode_plain(
    instr: &Instruction,
    at: u64,
    sink: &mut impl CodeSink,
) -> Result<Option<usize>, EncodeError> {
    use InstrKind::*;

    let vt = instr.vtype;
    let byte_op = vt == ValType::I8;
    let unenc = EncodeError::Unencodable { kind: instr.kind };

    match instr.kind {
        Nop => {
            sink.put1(0x90);
            Ok(None)
        }
        Ret => {
            sink.put1(0xc3);
            Ok(None)
        }
        Leave => {
            sink.put1(0xc9);
            Ok(None)
        }
        Stc => {
            sink.put1(0xf9);
            Ok(None)
        }
        Clc => {
            sink.put1(0xf8);
            Ok(None)
        }
        Cdqe | Cqo => {
            let rex = Rex::for_width(vt);
            emit_prefixes(sink, None, vt, None, &rex)?;
            sink.put1(if instr.kind == Cdqe { 0x98 } else { 0x99 });
            Ok(None)
        }

        Jmp | Jcc | Call => {
            let target = instr.dst.as_imm().ok_or(unenc)? as u64;
            encode_branch(instr.kind, instr.cond, target, at, sink)
        }

        CallInd | JmpInd => {
            let digit = if instr.kind == CallInd { 2 } else { 4 };
            // Always 64-bit in long mode; REX.W is implied, not emitted.
            emit_op_modrm(
                sink,
                instr,
                ValType::I32,
                None,
                false,
                OpcodeMap::One,
                0xff,
                digit,
                None,
                &instr.dst,
            )
        }

        Push | Pop => encode_push_pop(instr, sink),

        Mov => encode_mov(instr, sink),

        Add | Or | Adc | Sbb | And | Sub | Xor | Cmp => {
            let base = alu_base(instr.kind).expect("alu kind");
            match (&instr.dst, &instr.src) {
                // MR: r/m, r
                (dst @ (Operand::Reg(_) | Operand::Mem(_)), Operand::Reg(s)) => {
                    let opcode = if byte_op { base } else { base + 1 };
                    emit_op_modrm(
                        sink,
                        instr,
                        vt,
                        None,
                        false,
                        OpcodeMap::One,
                        opcode,
                        s.hw_enc(),
                        Some(*s),
                        dst,
                    )
                }
                // RM: r, m
                (Operand::Reg(d), src @ Operand::Mem(_)) => {
                    let opcode = if byte_op { base + 2 } else { base + 3 };
                    emit_op_modrm(
                        sink,
                        instr,
                        vt,
                        None,
                        false,
                        OpcodeMap::One,
                        opcode,
                        d.hw_enc(),
                        Some(*d),
                        src,
                    )
                }
                // MI: r/m, imm
                (dst @ (Operand::Reg(_) | Operand::Mem(_)), Operand::Imm { .. }) => {
                    let value = instr.src.as_imm().expect("imm operand");
                    let digit = alu_digit(instr.kind);
                    if byte_op {
                        emit_op_modrm(
                            sink, instr, vt, None, false, OpcodeMap::One, 0x80, digit, None, dst,
                        )?;
                        emit_imm(sink, ValType::I8, value);
                    } else if i8::try_from(value).is_ok() {
                        emit_op_modrm(
                            sink, instr, vt, None, false, OpcodeMap::One, 0x83, digit, None, dst,
                        )?;
                        emit_imm(sink, ValType::I8, value);
                    } else {
                        let w = imm_width_for(vt, value)?;
                        emit_op_modrm(
                            sink, instr, vt, None, false, OpcodeMap::One, 0x81, digit, None, dst,
                        )?;
                        emit_imm(sink, w, value);
                    }
                    Ok(None)
                }
                _ => Err(unenc),
            }
        }

        Test => match (&instr.dst, &instr.src) {
            (dst @ (Operand::Reg(_) | Operand::Mem(_)), Operand::Reg(s)) => {
                let opcode = if byte_op { 0x84 } else { 0x85 };
                emit_op_modrm(
                    sink,
                    instr,
                    vt,
                    None,
                    false,
                    OpcodeMap::One,
                    opcode,
                    s.hw_enc(),
                    Some(*s),
                    dst,
                )
            }
            (dst @ (Operand::Reg(_) | Operand::Mem(_)), Operand::Imm { .. }) => {
                let value = instr.src.as_imm().expect("imm operand");
                let opcode = if byte_op { 0xf6 } else { 0xf7 };
                let w = imm_width_for(vt, value)?;
                emit_op_modrm(
                    sink, instr, vt, None, false, OpcodeMap::One, opcode, 0, None, dst,
                )?;
                emit_imm(sink, w, value);
                Ok(None)
            }
            _ => Err(unenc),
        },

        Lea => match (&instr.dst, &instr.src) {
            (Operand::Reg(d), src @ Operand::Mem(_)) => emit_op_modrm(
                sink,
                instr,
                vt,
                None,
                false,
                OpcodeMap::One,
                0x8d,
                d.hw_enc(),
                Some(*d),
                src,
            ),
            _ => Err(unenc),
        },

        Movzx | Movsx => {
            let d = instr.dst.as_reg().ok_or(unenc)?;
            let src_width = instr.src.width(ValType::I8);
            let (map, opcode) = match (instr.kind, src_width) {
                (Movzx, ValType::I8) => (OpcodeMap::Two, 0xb6),
                (Movzx, ValType::I16) => (OpcodeMap::Two, 0xb7),
                (Movsx, ValType::I8) => (OpcodeMap::Two, 0xbe),
                (Movsx, ValType::I16) => (OpcodeMap::Two, 0xbf),
                (Movsx, ValType::I32) => (OpcodeMap::One, 0x63),
                _ => return Err(unenc),
            };
            emit_op_modrm(
                sink,
                instr,
                vt,
                None,
                false,
                map,
                opcode,
                d.hw_enc(),
                Some(d),
                &instr.src,
            )
        }

        Shl | Shr | Sar => {
            let digit = shift_digit(instr.kind);
            match instr.src {
                Operand::Imm { .. } => {
                    let n = instr.src.as_imm().expect("imm operand");
                    if n == 1 {
                        emit_op_modrm(
                            sink,
                            instr,
                            vt,
                            None,
                            false,
                            OpcodeMap::One,
                            if byte_op { 0xd0 } else { 0xd1 },
                            digit,
                            None,
                            &instr.dst,
                        )
                    } else {
                        emit_op_modrm(
                            sink,
                            instr,
                            vt,
                            None,
                            false,
                            OpcodeMap::One,
                            if byte_op { 0xc0 } else { 0xc1 },
                            digit,
                            None,
                            &instr.dst,
                        )?;
                        emit_imm(sink, ValType::I8, n);
                        Ok(None)
                    }
                }
                Operand::Reg(r) if r.index() == 1 => emit_op_modrm(
                    sink,
                    instr,
                    vt,
                    None,
                    false,
                    OpcodeMap::One,
                    if byte_op { 0xd2 } else { 0xd3 },
                    digit,
                    None,
                    &instr.dst,
                ),
                _ => Err(unenc),
            }
        }

        Not | Neg | Mul | Div | Idiv => {
            let digit = match instr.kind {
                Not => 2,
                Neg => 3,
                Mul => 4,
                Div => 6,
                _ => 7,
            };
            emit_op_modrm(
                sink,
                instr,
                vt,
                None,
                false,
                OpcodeMap::One,
                if byte_op { 0xf6 } else { 0xf7 },
                digit,
                None,
                &instr.dst,
            )
        }

        Imul => match instr.operand_count() {
            1 => emit_op_modrm(
                sink,
                instr,
                vt,
                None,
                false,
                OpcodeMap::One,
                if byte_op { 0xf6 } else { 0xf7 },
                5,
                None,
                &instr.dst,
            ),
            2 => {
                let d = instr.dst.as_reg().ok_or(unenc)?;
                emit_op_modrm(
                    sink,
                    instr,
                    vt,
                    None,
                    false,
                    OpcodeMap::Two,
                    0xaf,
                    d.hw_enc(),
                    Some(d),
                    &instr.src,
                )
            }
            3 => {
                let d = instr.dst.as_reg().ok_or(unenc)?;
                let value = instr.src2.as_imm().ok_or(unenc)?;
                if i8::try_from(value).is_ok() {
                    let patch = emit_op_modrm(
                        sink,
                        instr,
                        vt,
                        None,
                        false,
                        OpcodeMap::One,
                        0x6b,
                        d.hw_enc(),
                        Some(d),
                        &instr.src,
                    )?;
                    emit_imm(sink, ValType::I8, value);
                    Ok(patch)
                } else {
                    let w = imm_width_for(vt, value)?;
                    let patch = emit_op_modrm(
                        sink,
                        instr,
                        vt,
                        None,
                        false,
                        OpcodeMap::One,
                        0x69,
                        d.hw_enc(),
                        Some(d),
                        &instr.src,
                    )?;
                    emit_imm(sink, w, value);
                    Ok(patch)
                }
            }
            _ => Err(unenc),
        },

        Inc | Dec => {
            let digit = u8::from(instr.kind == Dec);
            emit_op_modrm(
                sink,
                instr,
                vt,
                None,
                false,
                OpcodeMap::One,
                if byte_op { 0xfe } else { 0xff },
                digit,
                None,
                &instr.dst,
            )
        }

        Cmov => {
            let cond = instr.cond.ok_or(unenc)?;
            let d = instr.dst.as_reg().ok_or(unenc)?;
            emit_op_modrm(
                sink,
                instr,
                vt,
                None,
                false,
                OpcodeMap::Two,
                0x40 | cond.nibble(),
                d.hw_enc(),
                Some(d),
                &instr.src,
            )
        }

        Setcc => {
            let cond = instr.cond.ok_or(unenc)?;
            emit_op_modrm(
                sink,
                instr,
                ValType::I8,
                None,
                false,
                OpcodeMap::Two,
                0x90 | cond.nibble(),
                0,
                None,
                &instr.dst,
            )
        }

        Bsf => {
            let d = instr.dst.as_reg().ok_or(unenc)?;
            emit_op_modrm(
                sink,
                instr,
                vt,
                None,
                false,
                OpcodeMap::Two,
                0xbc,
                d.hw_enc(),
                Some(d),
                &instr.src,
            )
        }

        _ => Err(unenc),
    }
}

fn encode_push_pop(
    instr: &Instruction,
    sink: &mut impl CodeSink,
) -> Result<Option<usize>, EncodeError> {
    let push = instr.kind == InstrKind::Push;
    match instr.dst {
        Operand::Reg(r) if r.is_gp() => {
            let mut rex = Rex::for_width(ValType::I32);
            rex.rm(r);
            emit_prefixes(sink, None, ValType::I32, None, &rex)?;
            let base = if push { 0x50 } else { 0x58 };
            sink.put1(base + (r.hw_enc() & 7));
            Ok(None)
        }
        Operand::Mem(_) => emit_op_modrm(
            sink,
            instr,
            ValType::I32,
            None,
            false,
            OpcodeMap::One,
            if push { 0xff } else { 0x8f },
            if push { 6 } else { 0 },
            None,
            &instr.dst,
        ),
        Operand::Imm { .. } if push => {
            let value = instr.dst.as_imm().expect("imm operand");
            if let Ok(v) = i8::try_from(value) {
                sink.put1(0x6a);
                sink.put1(v as u8);
            } else {
                let v =
                    i32::try_from(value).map_err(|_| EncodeError::ImmRange { value })?;
                sink.put1(0x68);
                sink.put4(v as u32);
            }
            Ok(None)
        }
        _ => Err(EncodeError::Unencodable { kind: instr.kind }),
    }
}

fn encode_mov(
    instr: &Instruction,
    sink: &mut impl CodeSink,
) -> Result<Option<usize>, EncodeError> {
    let vt = instr.vtype;
    let byte_op = vt == ValType::I8;
    let unenc = EncodeError::Unencodable { kind: instr.kind };

    match (&instr.dst, &instr.src) {
        (dst @ (Operand::Reg(_) | Operand::Mem(_)), Operand::Reg(s)) => {
            let opcode = if byte_op { 0x88 } else { 0x89 };
            emit_op_modrm(
                sink,
                instr,
                vt,
                None,
                false,
                OpcodeMap::One,
                opcode,
                s.hw_enc(),
                Some(*s),
                dst,
            )
        }
        (Operand::Reg(d), src @ Operand::Mem(_)) => {
            let opcode = if byte_op { 0x8a } else { 0x8b };
            emit_op_modrm(
                sink,
                instr,
                vt,
                None,
                false,
                OpcodeMap::One,
                opcode,
                d.hw_enc(),
                Some(*d),
                src,
            )
        }
        (Operand::Reg(d), Operand::Imm { value, .. }) => {
            let value = *value;
            let signed = instr.src.as_imm().expect("imm operand");
            if vt == ValType::I64 && i32::try_from(signed).is_err() {
                // movabs r64, imm64
                let mut rex = Rex::for_width(vt);
                rex.rm(*d);
                emit_prefixes(sink, None, vt, None, &rex)?;
                sink.put1(0xb8 + (d.hw_enc() & 7));
                sink.put8(value);
            } else if vt == ValType::I64 {
                // Sign-extended imm32 form keeps the encoding short.
                let mut rex = Rex::for_width(vt);
                rex.rm(*d);
                emit_prefixes(sink, None, vt, None, &rex)?;
                sink.put1(0xc7);
                sink.put1(modrm_byte(3, 0, d.hw_enc()));
                sink.put4(signed as u32);
            } else {
                let mut rex = Rex::for_width(vt);
                rex.rm(*d);
                emit_prefixes(sink, None, vt, None, &rex)?;
                if byte_op {
                    sink.put1(0xb0 + (d.hw_enc() & 7));
                    sink.put1(value as u8);
                } else {
                    sink.put1(0xb8 + (d.hw_enc() & 7));
                    emit_imm(sink, if vt == ValType::I16 { ValType::I16 } else { ValType::I32 }, signed);
                }
            }
            Ok(None)
        }
        (dst @ Operand::Mem(_), Operand::Imm { .. }) => {
            let value = instr.src.as_imm().expect("imm operand");
            let w = imm_width_for(vt, value)?;
            let patch = emit_op_modrm(
                sink,
                instr,
                vt,
                None,
                false,
                OpcodeMap::One,
                if byte_op { 0xc6 } else { 0xc7 },
                0,
                None,
                dst,
            )?;
            emit_imm(sink, w, value);
            Ok(patch)
        }
        _ => Err(unenc),
    }
}

fn encode_branch(
    kind: InstrKind,
    cond: Option<crate::Cond>,
    target: u64,
    at: u64,
    sink: &mut impl CodeSink,
) -> Result<Option<usize>, EncodeError> {
    // Try the short form first; x86 displacements are relative to the end
    // of the instruction, so each form has its own baseline.
    let disp_for = |len: u64| target.wrapping_sub(at.wrapping_add(len)) as i64;

    match kind {
        InstrKind::Jmp => {
            let short = disp_for(2);
            if let Ok(d) = i8::try_from(short) {
                sink.put1(0xeb);
                sink.put1(d as u8);
            } else {
                let d = i32::try_from(disp_for(5))
                    .map_err(|_| EncodeError::BranchRange { disp: disp_for(5) })?;
                sink.put1(0xe9);
                sink.put4(d as u32);
            }
        }
        InstrKind::Jcc => {
            let cond = cond.ok_or(EncodeError::Unencodable { kind })?;
            let short = disp_for(2);
            if let Ok(d) = i8::try_from(short) {
                sink.put1(0x70 | cond.nibble());
                sink.put1(d as u8);
            } else {
                let d = i32::try_from(disp_for(6))
                    .map_err(|_| EncodeError::BranchRange { disp: disp_for(6) })?;
                sink.put1(0x0f);
                sink.put1(0x80 | cond.nibble());
                sink.put4(d as u32);
            }
        }
        InstrKind::Call => {
            let d = i32::try_from(disp_for(5))
                .map_err(|_| EncodeError::BranchRange { disp: disp_for(5) })?;
            sink.put1(0xe8);
            sink.put4(d as u32);
        }
        _ => return Err(EncodeError::Unencodable { kind }),
    }
    Ok(None)
}

fn encode_passthrough(
    instr: &Instruction,
    pt: &Passthrough,
    sink: &mut impl CodeSink,
) -> Result<Option<usize>, EncodeError> {
    let unenc = EncodeError::Unencodable { kind: instr.kind };

    let (reg_op, rm_op) = match pt.enc {
        PtEncoding::Rm => (&instr.dst, &instr.src),
        PtEncoding::Mr => (&instr.src, &instr.dst),
        PtEncoding::Mi | PtEncoding::Rvm => return Err(unenc),
    };
    let reg = reg_op.as_reg().ok_or(unenc)?;

    let mut rex = Rex::for_width(ValType::I32).w(pt.rex_w);
    rex.reg(reg);
    match rm_op {
        Operand::Reg(r) => rex.rm(*r),
        Operand::Mem(m) => rex.mem(m),
        _ => return Err(unenc),
    }

    if let Some(s) = seg_prefix(instr) {
        sink.put1(s);
    }
    if let Some(p) = pt.prefix {
        sink.put1(p);
    }
    if rex.is_conflicted() {
        return Err(EncodeError::RexConflict);
    }
    if let Some(b) = rex.byte() {
        sink.put1(b);
    }
    if pt.map == OpcodeMap::Two {
        sink.put1(0x0f);
    }
    sink.put1(pt.opcode);

    match rm_op {
        Operand::Reg(r) => {
            sink.put1(modrm_byte(3, reg.hw_enc(), r.hw_enc()));
            Ok(None)
        }
        Operand::Mem(m) => emit_modrm_mem(sink, reg.hw_enc(), m),
        _ => unreachable!(),
    }
}
