//! ModR/M, SIB and displacement parsing.

use super::{Cursor, DecodeError, Prefixes};
use crate::{MemRef, Operand, Reg, RegKind, Segment, ValType};

/// An 8-bit register from its hardware encoding. Without a REX prefix,
/// encodings 4..=7 name the legacy high-byte registers.
pub(crate) fn gp8_reg(enc: u8, has_rex: bool) -> Reg {
    if !has_rex && (4..=7).contains(&enc) {
        Reg::new(RegKind::Gp8High, enc - 4)
    } else {
        Reg::new(RegKind::Gp8, enc)
    }
}

/// The `reg` field and the resolved `r/m` operand of a ModR/M byte.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ModRm {
    /// `reg` field extended by REX.R, 0..=15.
    pub reg: u8,
    /// The `r/m` side, either a register of class `rm_kind` or a memory
    /// operand.
    pub rm: Operand,
    /// Whether a REX prefix was in effect (changes byte-register naming).
    pub has_rex: bool,
}

impl ModRm {
    /// The `reg` field as a register of width class `kind`.
    pub fn reg_as(&self, kind: RegKind) -> Reg {
        if kind == RegKind::Gp8 {
            gp8_reg(self.reg, self.has_rex)
        } else {
            Reg::new(kind, self.reg)
        }
    }
}

/// Parse a ModR/M byte (plus SIB and displacement as required).
///
/// `rm_kind` is the register class selected when `mod == 3`; `mem_width`
/// the access width recorded on a memory operand.
pub(crate) fn parse(
    cur: &mut Cursor<'_>,
    pfx: &Prefixes,
    rm_kind: RegKind,
    mem_width: ValType,
) -> Result<ModRm, DecodeError> {
    let modrm = cur.u8()?;
    let m0d = modrm >> 6;
    let reg = ((modrm >> 3) & 7) | (pfx.rex_r() << 3);
    let rm_low = modrm & 7;

    if m0d == 3 {
        let enc = rm_low | (pfx.rex_b() << 3);
        let rm = if rm_kind == RegKind::Gp8 {
            gp8_reg(enc, pfx.rex.is_some())
        } else {
            Reg::new(rm_kind, enc)
        };
        return Ok(ModRm {
            reg,
            rm: Operand::reg(rm),
            has_rex: pfx.rex.is_some(),
        });
    }

    // Memory forms. `r/m == 4` escapes to a SIB byte; `mod == 0, r/m == 5`
    // is RIP-relative with a 32-bit displacement.
    let mut mem = if rm_low == 4 {
        parse_sib(cur, pfx, m0d, mem_width)?
    } else if m0d == 0 && rm_low == 5 {
        MemRef::rip_relative(mem_width, i64::from(cur.i32()?))
    } else {
        let base = Reg::gp64(rm_low | (pfx.rex_b() << 3));
        MemRef::base_disp(mem_width, base, 0)
    };

    match m0d {
        1 => mem.disp = i64::from(cur.i8()?),
        2 => mem.disp = i64::from(cur.i32()?),
        _ => {}
    }
    mem.segment = pfx.segment;
    mem.assert_well_formed();

    Ok(ModRm {
        reg,
        rm: Operand::mem(mem),
        has_rex: pfx.rex.is_some(),
    })
}

fn parse_sib(
    cur: &mut Cursor<'_>,
    pfx: &Prefixes,
    m0d: u8,
    mem_width: ValType,
) -> Result<MemRef, DecodeError> {
    let sib = cur.u8()?;
    let scale = 1u8 << (sib >> 6);
    let index_enc = ((sib >> 3) & 7) | (pfx.rex_x() << 3);
    let base_enc = (sib & 7) | (pfx.rex_b() << 3);

    // index == 4 (unextended) means "no index"; REX.X makes r12 usable.
    let index = if index_enc == 4 {
        None
    } else {
        Some(Reg::gp64(index_enc))
    };

    // base == 5 with mod == 0 means "no base, disp32 follows".
    let (base, disp) = if m0d == 0 && (base_enc & 7) == 5 {
        (None, i64::from(cur.i32()?))
    } else {
        (Some(Reg::gp64(base_enc)), 0)
    };

    Ok(MemRef {
        width: mem_width,
        base,
        index,
        scale: if index.is_some() { scale } else { 0 },
        disp,
        segment: Segment::None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg;

    fn cursor(bytes: &[u8]) -> Cursor<'_> {
        Cursor::new(bytes, 0x1000)
    }

    #[test]
    fn register_form() {
        // mod=3 reg=0 rm=1
        let mut cur = cursor(&[0xc1]);
        let m = parse(&mut cur, &Prefixes::default(), RegKind::Gp64, ValType::I64).unwrap();
        assert_eq!(m.reg, 0);
        assert_eq!(m.rm, Operand::reg(Reg::gp64(reg::RCX)));
    }

    #[test]
    fn rip_relative_form() {
        // mod=0 rm=5, disp32
        let mut cur = cursor(&[0x05, 0x10, 0x00, 0x00, 0x00]);
        let m = parse(&mut cur, &Prefixes::default(), RegKind::Gp64, ValType::I64).unwrap();
        let mem = *m.rm.as_mem().unwrap();
        assert!(mem.is_rip_relative());
        assert_eq!(mem.disp, 0x10);
    }

    #[test]
    fn sib_without_base() {
        // mod=0 rm=4; sib: scale=4 index=rcx base=101 -> disp32 only
        let mut cur = cursor(&[0x04, 0x8d, 0x78, 0x56, 0x34, 0x12]);
        let m = parse(&mut cur, &Prefixes::default(), RegKind::Gp64, ValType::I64).unwrap();
        let mem = *m.rm.as_mem().unwrap();
        assert_eq!(mem.base, None);
        assert_eq!(mem.index, Some(Reg::gp64(reg::RCX)));
        assert_eq!(mem.scale, 4);
        assert_eq!(mem.disp, 0x12345678);
    }

    #[test]
    fn rsp_base_requires_sib() {
        // mod=1 rm=4; sib index=100 (none) base=rsp; disp8
        let mut cur = cursor(&[0x44, 0x24, 0x08]);
        let m = parse(&mut cur, &Prefixes::default(), RegKind::Gp64, ValType::I64).unwrap();
        let mem = *m.rm.as_mem().unwrap();
        assert_eq!(mem.base, Some(Reg::gp64(reg::RSP)));
        assert_eq!(mem.index, None);
        assert_eq!(mem.disp, 8);
        assert_eq!(m.reg, 0);
    }
}
