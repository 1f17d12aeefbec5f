//! Single-instruction decoding.
//!
//! [`decode_one`] consumes bytes from the start of a slice and produces one
//! [`Instruction`]. Block-level decoding, caching and trace following live
//! in the rewriter; this module is a pure function over bytes.

mod modrm;
mod prefix;

pub use prefix::{PrefixFlags, Prefixes};

use crate::{
    Cond, Instruction, InstrKind, OpcodeMap, Operand, Passthrough, PtEncoding, Reg, RegKind,
    ValType,
};

use core::fmt;

use modrm::ModRm;

/// Hard architectural limit on instruction length.
pub const MAX_INSTR_LEN: usize = 15;

/// Decoding failures. An *unknown* opcode is not an error (it decodes to
/// [`InstrKind::Invalid`]); these cover byte streams that cannot be framed
/// at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The input slice ended inside the instruction.
    Truncated {
        /// Address the instruction started at.
        addr: u64,
    },
    /// Prefixes and fields exceeded the 15-byte limit.
    TooLong {
        /// Address the instruction started at.
        addr: u64,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { addr } => {
                write!(f, "instruction at {addr:#x} is truncated")
            }
            Self::TooLong { addr } => {
                write!(f, "instruction at {addr:#x} exceeds 15 bytes")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Byte cursor over the instruction being decoded.
pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    addr: u64,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8], addr: u64) -> Self {
        Self {
            bytes,
            pos: 0,
            addr,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let s = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(s)
            }
            None => Err(DecodeError::Truncated { addr: self.addr }),
        }
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub(crate) fn i16(&mut self) -> Result<i16, DecodeError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }
}

/// Everything the per-opcode handlers need.
struct Ctx<'a, 'b> {
    cur: &'b mut Cursor<'a>,
    pfx: Prefixes,
    addr: u64,
    /// Operand size resolved from REX.W / `0x66` / default.
    opsize: ValType,
}

impl Ctx<'_, '_> {
    fn modrm(&mut self, rm_kind: RegKind, mem_width: ValType) -> Result<ModRm, DecodeError> {
        modrm::parse(self.cur, &self.pfx, rm_kind, mem_width)
    }

    fn gp_modrm(&mut self, vt: ValType) -> Result<ModRm, DecodeError> {
        self.modrm(RegKind::gp_for(vt), vt)
    }

    /// Immediate of the operand-size class: 16-bit operands take imm16,
    /// everything else imm32 (sign-extended to 64-bit width).
    fn imm_for(&mut self, vt: ValType) -> Result<Operand, DecodeError> {
        Ok(match vt {
            ValType::I8 => Operand::imm(ValType::I8, i64::from(self.cur.i8()?)),
            ValType::I16 => Operand::imm(ValType::I16, i64::from(self.cur.i16()?)),
            _ => Operand::imm(ValType::I32, i64::from(self.cur.i32()?)),
        })
    }

    /// Branch target from a relative displacement; resolved to an absolute
    /// address against the end of the instruction.
    fn rel_target(&self, rel: i64, instr_len_so_far: usize) -> Operand {
        let end = self.addr.wrapping_add(instr_len_so_far as u64);
        Operand::imm64(end.wrapping_add(rel as u64))
    }
}

/// Decode one instruction starting at `code[0]`, which lives at `addr`.
///
/// Returns [`InstrKind::Invalid`] (with the consumed length recorded) for
/// opcodes outside the supported set; errs only on truncation and on the
/// 15-byte limit.
pub fn decode_one(code: &[u8], addr: u64) -> Result<Instruction, DecodeError> {
    let mut cur = Cursor::new(code, addr);
    let mut pfx = Prefixes::default();

    loop {
        let Some(&byte) = code.get(cur.pos()) else {
            return Err(DecodeError::Truncated { addr });
        };
        if !pfx.accept(byte) {
            break;
        }
        cur.pos += 1;
        if cur.pos > MAX_INSTR_LEN {
            return Err(DecodeError::TooLong { addr });
        }
    }

    let opsize = if pfx.rex_w() {
        ValType::I64
    } else if pfx.flags.contains(PrefixFlags::OPSIZE) {
        ValType::I16
    } else {
        ValType::I32
    };

    let op = cur.u8()?;
    let mut ctx = Ctx {
        cur: &mut cur,
        pfx,
        addr,
        opsize,
    };

    let mut instr = if op == 0x0f {
        let op2 = ctx.cur.u8()?;
        decode_two_byte(&mut ctx, op2)?
    } else {
        decode_one_byte(&mut ctx, op)?
    };

    if cur.pos() > MAX_INSTR_LEN {
        return Err(DecodeError::TooLong { addr });
    }
    instr.addr = addr;
    instr.len = cur.pos() as u8;

    // Normalize RIP-relative displacements to the absolute target so the
    // operand survives re-encoding at a different address.
    let end = instr.end();
    for op in [&mut instr.dst, &mut instr.src, &mut instr.src2] {
        if let Operand::Mem(mem) = op {
            if mem.is_rip_relative() {
                mem.disp = end.wrapping_add(mem.disp as u64) as i64;
            }
        }
    }
    Ok(instr)
}

/// Kind selected by bits 3..=5 of the `0x00`–`0x3f` ALU block and of the
/// `0x80`-group `reg` field.
const fn alu_kind(sel: u8) -> InstrKind {
    match sel & 7 {
        0 => InstrKind::Add,
        1 => InstrKind::Or,
        2 => InstrKind::Adc,
        3 => InstrKind::Sbb,
        4 => InstrKind::And,
        5 => InstrKind::Sub,
        6 => InstrKind::Xor,
        _ => InstrKind::Cmp,
    }
}

fn decode_one_byte(ctx: &mut Ctx<'_, '_>, op: u8) -> Result<Instruction, DecodeError> {
    let opsize = ctx.opsize;
    let instr = match op {
        // ALU block: add/or/adc/sbb/and/sub/xor/cmp in MR, RM and
        // accumulator-immediate encodings.
        0x00..=0x3d if (op & 7) <= 5 => {
            let kind = alu_kind(op >> 3);
            match op & 7 {
                0 => {
                    let m = ctx.gp_modrm(ValType::I8)?;
                    Instruction::binary(
                        0,
                        kind,
                        ValType::I8,
                        m.rm,
                        Operand::reg(m.reg_as(RegKind::Gp8)),
                    )
                }
                1 => {
                    let m = ctx.gp_modrm(opsize)?;
                    Instruction::binary(
                        0,
                        kind,
                        opsize,
                        m.rm,
                        Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
                    )
                }
                2 => {
                    let m = ctx.gp_modrm(ValType::I8)?;
                    Instruction::binary(
                        0,
                        kind,
                        ValType::I8,
                        Operand::reg(m.reg_as(RegKind::Gp8)),
                        m.rm,
                    )
                }
                3 => {
                    let m = ctx.gp_modrm(opsize)?;
                    Instruction::binary(
                        0,
                        kind,
                        opsize,
                        Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
                        m.rm,
                    )
                }
                4 => {
                    let imm = Operand::imm(ValType::I8, i64::from(ctx.cur.i8()?));
                    Instruction::binary(
                        0,
                        kind,
                        ValType::I8,
                        Operand::reg(Reg::new(RegKind::Gp8, 0)),
                        imm,
                    )
                }
                _ => {
                    let imm = ctx.imm_for(opsize)?;
                    Instruction::binary(0, kind, opsize, Operand::reg(Reg::gp(opsize, 0)), imm)
                }
            }
        }

        // push/pop r64 (default to 64-bit operand size in long mode).
        0x50..=0x57 => {
            let r = Reg::gp64((op & 7) | (ctx.pfx.rex_b() << 3));
            Instruction::unary(0, InstrKind::Push, ValType::I64, Operand::reg(r))
        }
        0x58..=0x5f => {
            let r = Reg::gp64((op & 7) | (ctx.pfx.rex_b() << 3));
            Instruction::unary(0, InstrKind::Pop, ValType::I64, Operand::reg(r))
        }

        // movsxd r, r/m32 (only useful with REX.W)
        0x63 => {
            let m = ctx.modrm(RegKind::Gp32, ValType::I32)?;
            Instruction::binary(
                0,
                InstrKind::Movsx,
                opsize,
                Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
                m.rm,
            )
        }

        0x68 => {
            let imm = Operand::imm(ValType::I32, i64::from(ctx.cur.i32()?));
            Instruction::unary(0, InstrKind::Push, ValType::I64, imm)
        }
        0x6a => {
            let imm = Operand::imm(ValType::I8, i64::from(ctx.cur.i8()?));
            Instruction::unary(0, InstrKind::Push, ValType::I64, imm)
        }

        // imul r, r/m, imm
        0x69 | 0x6b => {
            let m = ctx.gp_modrm(opsize)?;
            let imm = if op == 0x69 {
                ctx.imm_for(opsize)?
            } else {
                Operand::imm(ValType::I8, i64::from(ctx.cur.i8()?))
            };
            Instruction::ternary(
                0,
                InstrKind::Imul,
                opsize,
                Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
                m.rm,
                imm,
            )
        }

        // Jcc rel8
        0x70..=0x7f => {
            let rel = i64::from(ctx.cur.i8()?);
            let dst = ctx.rel_target(rel, ctx.cur.pos());
            let mut i = Instruction::unary(0, InstrKind::Jcc, ValType::None, dst);
            i.cond = Some(Cond::from_nibble(op));
            i
        }

        // Group 1: ALU r/m, imm
        0x80 | 0x81 | 0x83 => {
            let width = if op == 0x80 { ValType::I8 } else { opsize };
            let m = ctx.gp_modrm(width)?;
            let kind = alu_kind(m.reg);
            let imm = if op == 0x81 {
                ctx.imm_for(width)?
            } else {
                Operand::imm(ValType::I8, i64::from(ctx.cur.i8()?))
            };
            Instruction::binary(0, kind, width, m.rm, imm)
        }

        // test r/m, r
        0x84 => {
            let m = ctx.gp_modrm(ValType::I8)?;
            Instruction::binary(
                0,
                InstrKind::Test,
                ValType::I8,
                m.rm,
                Operand::reg(m.reg_as(RegKind::Gp8)),
            )
        }
        0x85 => {
            let m = ctx.gp_modrm(opsize)?;
            Instruction::binary(
                0,
                InstrKind::Test,
                opsize,
                m.rm,
                Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
            )
        }

        // mov
        0x88 => {
            let m = ctx.gp_modrm(ValType::I8)?;
            Instruction::binary(
                0,
                InstrKind::Mov,
                ValType::I8,
                m.rm,
                Operand::reg(m.reg_as(RegKind::Gp8)),
            )
        }
        0x89 => {
            let m = ctx.gp_modrm(opsize)?;
            Instruction::binary(
                0,
                InstrKind::Mov,
                opsize,
                m.rm,
                Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
            )
        }
        0x8a => {
            let m = ctx.gp_modrm(ValType::I8)?;
            Instruction::binary(
                0,
                InstrKind::Mov,
                ValType::I8,
                Operand::reg(m.reg_as(RegKind::Gp8)),
                m.rm,
            )
        }
        0x8b => {
            let m = ctx.gp_modrm(opsize)?;
            Instruction::binary(
                0,
                InstrKind::Mov,
                opsize,
                Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
                m.rm,
            )
        }

        // lea r, m
        0x8d => {
            let m = ctx.gp_modrm(opsize)?;
            match m.rm {
                Operand::Mem(_) => Instruction::binary(
                    0,
                    InstrKind::Lea,
                    opsize,
                    Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
                    m.rm,
                ),
                _ => Instruction::nullary(0, InstrKind::Invalid),
            }
        }

        0x90 => Instruction::nullary(0, InstrKind::Nop),

        // cdqe / cwde, cqo / cdq
        0x98 => Instruction::nullary(0, InstrKind::Cdqe).with_vtype(opsize),
        0x99 => Instruction::nullary(0, InstrKind::Cqo).with_vtype(opsize),

        // test accumulator, imm
        0xa8 => {
            let imm = Operand::imm(ValType::I8, i64::from(ctx.cur.i8()?));
            Instruction::binary(
                0,
                InstrKind::Test,
                ValType::I8,
                Operand::reg(Reg::new(RegKind::Gp8, 0)),
                imm,
            )
        }
        0xa9 => {
            let imm = ctx.imm_for(opsize)?;
            Instruction::binary(0, InstrKind::Test, opsize, Operand::reg(Reg::gp(opsize, 0)), imm)
        }

        // mov r8, imm8
        0xb0..=0xb7 => {
            let enc = (op & 7) | (ctx.pfx.rex_b() << 3);
            let r = modrm::gp8_reg(enc, ctx.pfx.rex.is_some());
            let imm = Operand::imm(ValType::I8, i64::from(ctx.cur.i8()?));
            Instruction::binary(0, InstrKind::Mov, ValType::I8, Operand::reg(r), imm)
        }

        // mov r, imm: the only encoding carrying a true 64-bit immediate.
        0xb8..=0xbf => {
            let r = Reg::gp(opsize, (op & 7) | (ctx.pfx.rex_b() << 3));
            let imm = match opsize {
                ValType::I64 => Operand::imm64(ctx.cur.u64()?),
                ValType::I16 => Operand::imm(ValType::I16, i64::from(ctx.cur.i16()?)),
                _ => Operand::imm(ValType::I32, i64::from(ctx.cur.i32()?)),
            };
            Instruction::binary(0, InstrKind::Mov, opsize, Operand::reg(r), imm)
        }

        // Group 2: shifts by imm8
        0xc0 | 0xc1 => {
            let width = if op == 0xc0 { ValType::I8 } else { opsize };
            let m = ctx.gp_modrm(width)?;
            let imm = Operand::imm(ValType::I8, i64::from(ctx.cur.i8()?));
            match shift_kind(m.reg) {
                Some(kind) => Instruction::binary(0, kind, width, m.rm, imm),
                None => Instruction::nullary(0, InstrKind::Invalid),
            }
        }
        // shift by 1
        0xd0 | 0xd1 => {
            let width = if op == 0xd0 { ValType::I8 } else { opsize };
            let m = ctx.gp_modrm(width)?;
            match shift_kind(m.reg) {
                Some(kind) => {
                    Instruction::binary(0, kind, width, m.rm, Operand::imm(ValType::I8, 1))
                }
                None => Instruction::nullary(0, InstrKind::Invalid),
            }
        }
        // shift by cl
        0xd2 | 0xd3 => {
            let width = if op == 0xd2 { ValType::I8 } else { opsize };
            let m = ctx.gp_modrm(width)?;
            match shift_kind(m.reg) {
                Some(kind) => Instruction::binary(
                    0,
                    kind,
                    width,
                    m.rm,
                    Operand::reg(Reg::new(RegKind::Gp8, 1)),
                ),
                None => Instruction::nullary(0, InstrKind::Invalid),
            }
        }

        0xc3 => Instruction::nullary(0, InstrKind::Ret),

        // mov r/m, imm
        0xc6 | 0xc7 => {
            let width = if op == 0xc6 { ValType::I8 } else { opsize };
            let m = ctx.gp_modrm(width)?;
            if m.reg & 7 != 0 {
                Instruction::nullary(0, InstrKind::Invalid)
            } else {
                let imm = if op == 0xc6 {
                    Operand::imm(ValType::I8, i64::from(ctx.cur.i8()?))
                } else {
                    ctx.imm_for(width)?
                };
                Instruction::binary(0, InstrKind::Mov, width, m.rm, imm)
            }
        }

        0xc9 => Instruction::nullary(0, InstrKind::Leave),

        // call rel32
        0xe8 => {
            let rel = i64::from(ctx.cur.i32()?);
            let dst = ctx.rel_target(rel, ctx.cur.pos());
            Instruction::unary(0, InstrKind::Call, ValType::None, dst)
        }
        // jmp rel32 / rel8
        0xe9 => {
            let rel = i64::from(ctx.cur.i32()?);
            let dst = ctx.rel_target(rel, ctx.cur.pos());
            Instruction::unary(0, InstrKind::Jmp, ValType::None, dst)
        }
        0xeb => {
            let rel = i64::from(ctx.cur.i8()?);
            let dst = ctx.rel_target(rel, ctx.cur.pos());
            Instruction::unary(0, InstrKind::Jmp, ValType::None, dst)
        }

        // Group 3
        0xf6 | 0xf7 => {
            let width = if op == 0xf6 { ValType::I8 } else { opsize };
            let m = ctx.gp_modrm(width)?;
            match m.reg & 7 {
                0 | 1 => {
                    let imm = if op == 0xf6 {
                        Operand::imm(ValType::I8, i64::from(ctx.cur.i8()?))
                    } else {
                        ctx.imm_for(width)?
                    };
                    Instruction::binary(0, InstrKind::Test, width, m.rm, imm)
                }
                2 => Instruction::unary(0, InstrKind::Not, width, m.rm),
                3 => Instruction::unary(0, InstrKind::Neg, width, m.rm),
                4 => Instruction::unary(0, InstrKind::Mul, width, m.rm),
                5 => Instruction::unary(0, InstrKind::Imul, width, m.rm),
                6 => Instruction::unary(0, InstrKind::Div, width, m.rm),
                _ => Instruction::unary(0, InstrKind::Idiv, width, m.rm),
            }
        }

        // Group 4/5
        0xfe => {
            let m = ctx.gp_modrm(ValType::I8)?;
            match m.reg & 7 {
                0 => Instruction::unary(0, InstrKind::Inc, ValType::I8, m.rm),
                1 => Instruction::unary(0, InstrKind::Dec, ValType::I8, m.rm),
                _ => Instruction::nullary(0, InstrKind::Invalid),
            }
        }
        0xff => {
            let m = ctx.gp_modrm(opsize)?;
            match m.reg & 7 {
                0 => Instruction::unary(0, InstrKind::Inc, opsize, m.rm),
                1 => Instruction::unary(0, InstrKind::Dec, opsize, m.rm),
                2 => {
                    let m = widen_rm_to_64(m);
                    Instruction::unary(0, InstrKind::CallInd, ValType::I64, m.rm)
                }
                4 => {
                    let m = widen_rm_to_64(m);
                    Instruction::unary(0, InstrKind::JmpInd, ValType::I64, m.rm)
                }
                6 => {
                    let m = widen_rm_to_64(m);
                    Instruction::unary(0, InstrKind::Push, ValType::I64, m.rm)
                }
                _ => Instruction::nullary(0, InstrKind::Invalid),
            }
        }

        _ => Instruction::nullary(0, InstrKind::Invalid),
    };
    Ok(instr)
}

/// `call`/`jmp`/`push` through `r/m` always operate on 64 bits regardless
/// of the decoded operand-size class.
fn widen_rm_to_64(m: ModRm) -> ModRm {
    let rm = match m.rm {
        Operand::Reg(r) if r.is_gp() => Operand::reg(r.with_width(ValType::I64)),
        Operand::Mem(mut mem) => {
            mem.width = ValType::I64;
            Operand::mem(mem)
        }
        other => other,
    };
    ModRm {
        reg: m.reg,
        rm,
        has_rex: m.has_rex,
    }
}

const fn shift_kind(reg_field: u8) -> Option<InstrKind> {
    match reg_field & 7 {
        4 => Some(InstrKind::Shl),
        5 => Some(InstrKind::Shr),
        7 => Some(InstrKind::Sar),
        _ => None,
    }
}

fn decode_two_byte(ctx: &mut Ctx<'_, '_>, op: u8) -> Result<Instruction, DecodeError> {
    let opsize = ctx.opsize;
    let instr = match op {
        // Multi-byte nop: 0f 1f /0
        0x1f => {
            let _ = ctx.gp_modrm(opsize)?;
            Instruction::nullary(0, InstrKind::Nop)
        }

        // cmovcc r, r/m
        0x40..=0x4f => {
            let m = ctx.gp_modrm(opsize)?;
            let mut i = Instruction::binary(
                0,
                InstrKind::Cmov,
                opsize,
                Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
                m.rm,
            );
            i.cond = Some(Cond::from_nibble(op));
            i
        }

        // Jcc rel32
        0x80..=0x8f => {
            let rel = i64::from(ctx.cur.i32()?);
            let dst = ctx.rel_target(rel, ctx.cur.pos());
            let mut i = Instruction::unary(0, InstrKind::Jcc, ValType::None, dst);
            i.cond = Some(Cond::from_nibble(op));
            i
        }

        // setcc r/m8
        0x90..=0x9f => {
            let m = ctx.modrm(RegKind::Gp8, ValType::I8)?;
            let mut i = Instruction::unary(0, InstrKind::Setcc, ValType::I8, m.rm);
            i.cond = Some(Cond::from_nibble(op));
            i
        }

        // imul r, r/m
        0xaf => {
            let m = ctx.gp_modrm(opsize)?;
            Instruction::binary(
                0,
                InstrKind::Imul,
                opsize,
                Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
                m.rm,
            )
        }

        // movzx / movsx from 8- and 16-bit sources
        0xb6 | 0xb7 | 0xbe | 0xbf => {
            let src_width = if op & 1 == 0 { ValType::I8 } else { ValType::I16 };
            let kind = if op >= 0xbe {
                InstrKind::Movsx
            } else {
                InstrKind::Movzx
            };
            let m = ctx.modrm(RegKind::gp_for(src_width), src_width)?;
            Instruction::binary(
                0,
                kind,
                opsize,
                Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
                m.rm,
            )
        }

        // bsf r, r/m
        0xbc => {
            let m = ctx.gp_modrm(opsize)?;
            Instruction::binary(
                0,
                InstrKind::Bsf,
                opsize,
                Operand::reg(m.reg_as(RegKind::gp_for(opsize))),
                m.rm,
            )
        }

        _ => decode_sse(ctx, op)?,
    };
    Ok(instr)
}

/// Operand direction of an SSE opcode slot.
enum SseForm {
    /// xmm ← xmm/mem
    Rm,
    /// xmm/mem ← xmm
    Mr,
    /// gpr ← xmm (register-only source)
    GprFromXmm,
    /// xmm ← gpr/mem (movd/movq)
    XmmFromGpr,
    /// gpr/mem ← xmm (movd/movq store)
    GprStoreFromXmm,
}

fn decode_sse(ctx: &mut Ctx<'_, '_>, op: u8) -> Result<Instruction, DecodeError> {
    use InstrKind::*;

    let mand = ctx.pfx.mandatory();
    // (kind, direction, element vtype, memory width)
    let entry: Option<(InstrKind, SseForm, ValType, ValType)> = match (op, mand) {
        (0x10, None) => Some((Movups, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x10, Some(0x66)) => Some((Movupd, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x10, Some(0xf3)) => Some((Movss, SseForm::Rm, ValType::I32, ValType::I32)),
        (0x10, Some(0xf2)) => Some((Movsd, SseForm::Rm, ValType::I64, ValType::I64)),
        (0x11, None) => Some((Movups, SseForm::Mr, ValType::V128, ValType::V128)),
        (0x11, Some(0x66)) => Some((Movupd, SseForm::Mr, ValType::V128, ValType::V128)),
        (0x11, Some(0xf3)) => Some((Movss, SseForm::Mr, ValType::I32, ValType::I32)),
        (0x11, Some(0xf2)) => Some((Movsd, SseForm::Mr, ValType::I64, ValType::I64)),
        (0x12, None) => Some((Movlps, SseForm::Rm, ValType::V128, ValType::I64)),
        (0x13, None) => Some((Movlps, SseForm::Mr, ValType::V128, ValType::I64)),
        (0x14, None) => Some((Unpcklps, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x14, Some(0x66)) => Some((Unpcklpd, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x16, None) => Some((Movhps, SseForm::Rm, ValType::V128, ValType::I64)),
        (0x17, None) => Some((Movhps, SseForm::Mr, ValType::V128, ValType::I64)),
        (0x28, None) => Some((Movaps, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x28, Some(0x66)) => Some((Movapd, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x29, None) => Some((Movaps, SseForm::Mr, ValType::V128, ValType::V128)),
        (0x29, Some(0x66)) => Some((Movapd, SseForm::Mr, ValType::V128, ValType::V128)),
        (0x2e, Some(0x66)) => Some((Ucomisd, SseForm::Rm, ValType::I64, ValType::I64)),
        (0x57, None) => Some((Xorps, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x58, None) => Some((Addps, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x58, Some(0x66)) => Some((Addpd, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x58, Some(0xf3)) => Some((Addss, SseForm::Rm, ValType::I32, ValType::I32)),
        (0x58, Some(0xf2)) => Some((Addsd, SseForm::Rm, ValType::I64, ValType::I64)),
        (0x59, None) => Some((Mulps, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x59, Some(0x66)) => Some((Mulpd, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x59, Some(0xf3)) => Some((Mulss, SseForm::Rm, ValType::I32, ValType::I32)),
        (0x59, Some(0xf2)) => Some((Mulsd, SseForm::Rm, ValType::I64, ValType::I64)),
        (0x5c, None) => Some((Subps, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x5c, Some(0x66)) => Some((Subpd, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x5c, Some(0xf3)) => Some((Subss, SseForm::Rm, ValType::I32, ValType::I32)),
        (0x5c, Some(0xf2)) => Some((Subsd, SseForm::Rm, ValType::I64, ValType::I64)),
        (0x6e, Some(0x66)) => {
            let (kind, vt) = if ctx.pfx.rex_w() {
                (Movq, ValType::I64)
            } else {
                (Movd, ValType::I32)
            };
            Some((kind, SseForm::XmmFromGpr, vt, vt))
        }
        (0x6f, Some(0x66)) => Some((Movdqa, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x6f, Some(0xf3)) => Some((Movdqu, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x74, Some(0x66)) => Some((Pcmpeqb, SseForm::Rm, ValType::V128, ValType::V128)),
        (0x7e, Some(0x66)) => {
            let (kind, vt) = if ctx.pfx.rex_w() {
                (Movq, ValType::I64)
            } else {
                (Movd, ValType::I32)
            };
            Some((kind, SseForm::GprStoreFromXmm, vt, vt))
        }
        (0x7e, Some(0xf3)) => Some((Movq, SseForm::Rm, ValType::I64, ValType::I64)),
        (0x7f, Some(0x66)) => Some((Movdqa, SseForm::Mr, ValType::V128, ValType::V128)),
        (0x7f, Some(0xf3)) => Some((Movdqu, SseForm::Mr, ValType::V128, ValType::V128)),
        (0xd4, Some(0x66)) => Some((Paddq, SseForm::Rm, ValType::V128, ValType::V128)),
        (0xd6, Some(0x66)) => Some((Movq, SseForm::Mr, ValType::I64, ValType::I64)),
        (0xd7, Some(0x66)) => Some((Pmovmskb, SseForm::GprFromXmm, ValType::I32, ValType::V128)),
        (0xda, Some(0x66)) => Some((Pminub, SseForm::Rm, ValType::V128, ValType::V128)),
        (0xef, Some(0x66)) => Some((Pxor, SseForm::Rm, ValType::V128, ValType::V128)),
        _ => None,
    };

    let Some((kind, form, vtype, mem_width)) = entry else {
        return Ok(Instruction::nullary(0, InstrKind::Invalid));
    };

    let (instr, enc) = match form {
        SseForm::Rm => {
            let m = ctx.modrm(RegKind::Xmm, mem_width)?;
            (
                Instruction::binary(0, kind, vtype, Operand::reg(m.reg_as(RegKind::Xmm)), m.rm),
                PtEncoding::Rm,
            )
        }
        SseForm::Mr => {
            let m = ctx.modrm(RegKind::Xmm, mem_width)?;
            (
                Instruction::binary(0, kind, vtype, m.rm, Operand::reg(m.reg_as(RegKind::Xmm))),
                PtEncoding::Mr,
            )
        }
        SseForm::GprFromXmm => {
            let m = ctx.modrm(RegKind::Xmm, mem_width)?;
            (
                Instruction::binary(
                    0,
                    kind,
                    vtype,
                    Operand::reg(Reg::gp(vtype, m.reg)),
                    m.rm,
                ),
                PtEncoding::Rm,
            )
        }
        SseForm::XmmFromGpr => {
            let m = ctx.modrm(RegKind::gp_for(vtype), mem_width)?;
            (
                Instruction::binary(0, kind, vtype, Operand::reg(Reg::xmm(m.reg)), m.rm),
                PtEncoding::Rm,
            )
        }
        SseForm::GprStoreFromXmm => {
            let m = ctx.modrm(RegKind::gp_for(vtype), mem_width)?;
            (
                Instruction::binary(0, kind, vtype, m.rm, Operand::reg(Reg::xmm(m.reg))),
                PtEncoding::Mr,
            )
        }
    };

    let mut instr = instr;
    instr.passthrough = Some(Passthrough {
        prefix: mand,
        map: OpcodeMap::Two,
        opcode: op,
        enc,
        rex_w: ctx.pfx.rex_w(),
    });
    Ok(instr)
}

/// Convenience used by the `0x98`/`0x99` arms.
trait WithVtype {
    fn with_vtype(self, vt: ValType) -> Self;
}

impl WithVtype for Instruction {
    fn with_vtype(mut self, vt: ValType) -> Self {
        self.vtype = vt;
        self
    }
}
