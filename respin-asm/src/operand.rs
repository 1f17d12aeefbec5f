//! Instruction operands.

use crate::{Reg, ValType};

use core::fmt;

/// Segment override applied to a memory operand. Only `fs`/`gs` carry an
/// explicit prefix in 64-bit mode; the remaining segments are implicit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    /// No override.
    #[default]
    None,
    /// `fs` override (0x64).
    Fs,
    /// `gs` override (0x65).
    Gs,
}

impl Segment {
    /// The prefix byte selecting this segment, if any.
    pub const fn prefix_byte(&self) -> Option<u8> {
        match self {
            Self::None => None,
            Self::Fs => Some(0x64),
            Self::Gs => Some(0x65),
        }
    }
}

/// A memory operand: `segment:[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRef {
    /// Access width.
    pub width: ValType,
    /// Base register; [`Reg::RIP`] selects RIP-relative addressing.
    pub base: Option<Reg>,
    /// Index register, scaled by `scale`.
    pub index: Option<Reg>,
    /// Index scale: 0 when no index, otherwise 1, 2, 4 or 8.
    pub scale: u8,
    /// Signed displacement. For RIP-relative operands rewritten by the
    /// capture engine this holds the absolute target address instead; see
    /// [`MemRef::is_rip_relative`].
    pub disp: i64,
    /// Segment override.
    pub segment: Segment,
}

impl MemRef {
    /// A base-plus-displacement reference.
    pub const fn base_disp(width: ValType, base: Reg, disp: i64) -> Self {
        Self {
            width,
            base: Some(base),
            index: None,
            scale: 0,
            disp,
            segment: Segment::None,
        }
    }

    /// An absolute reference with no registers.
    pub const fn absolute(width: ValType, disp: i64) -> Self {
        Self {
            width,
            base: None,
            index: None,
            scale: 0,
            disp,
            segment: Segment::None,
        }
    }

    /// A RIP-relative reference; `disp` is relative to the end of the
    /// instruction as decoded.
    pub const fn rip_relative(width: ValType, disp: i64) -> Self {
        Self {
            width,
            base: Some(Reg::RIP),
            index: None,
            scale: 0,
            disp,
            segment: Segment::None,
        }
    }

    /// True when the operand addresses relative to the instruction pointer.
    pub fn is_rip_relative(&self) -> bool {
        self.base == Some(Reg::RIP)
    }

    /// Debug-checked structural invariants: scale/index pairing and
    /// RIP-relative shape.
    pub fn assert_well_formed(&self) {
        debug_assert!(
            (self.index.is_none() && self.scale == 0)
                || (self.index.is_some() && matches!(self.scale, 1 | 2 | 4 | 8))
        );
        debug_assert!(!self.is_rip_relative() || self.index.is_none());
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = self.segment.prefix_byte() {
            let name = if p == 0x64 { "fs" } else { "gs" };
            write!(f, "{name}:")?;
        }
        f.write_str("[")?;
        let mut wrote = false;
        if let Some(base) = self.base {
            write!(f, "{base}")?;
            wrote = true;
        }
        if let Some(index) = self.index {
            if wrote {
                f.write_str("+")?;
            }
            write!(f, "{index}*{}", self.scale)?;
            wrote = true;
        }
        if self.disp != 0 || !wrote {
            match (wrote, self.disp < 0) {
                (true, false) => write!(f, "+{:#x}", self.disp)?,
                (true, true) => write!(f, "-{:#x}", self.disp.unsigned_abs())?,
                (false, false) => write!(f, "{:#x}", self.disp)?,
                (false, true) => write!(f, "-{:#x}", self.disp.unsigned_abs())?,
            }
        }
        f.write_str("]")
    }
}

/// One instruction operand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Operand slot unused.
    #[default]
    None,
    /// A register.
    Reg(Reg),
    /// An immediate, stored extended to 64 bits as declared by `width`.
    Imm {
        /// Declared encoding width.
        width: ValType,
        /// The extended value.
        value: u64,
    },
    /// A memory reference.
    Mem(MemRef),
}

impl Operand {
    /// A register operand.
    pub const fn reg(r: Reg) -> Self {
        Self::Reg(r)
    }

    /// An immediate of declared width `vt`, sign-extended to 64 bits.
    pub const fn imm(vt: ValType, value: i64) -> Self {
        Self::Imm {
            width: vt,
            value: value as u64,
        }
    }

    /// A 64-bit immediate.
    pub const fn imm64(value: u64) -> Self {
        Self::Imm {
            width: ValType::I64,
            value,
        }
    }

    /// A memory operand.
    pub const fn mem(m: MemRef) -> Self {
        Self::Mem(m)
    }

    /// True when the slot is unused.
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// The register, if this is a register operand.
    pub const fn as_reg(&self) -> Option<Reg> {
        match self {
            Self::Reg(r) => Some(*r),
            _ => None,
        }
    }

    /// The memory reference, if this is a memory operand.
    pub const fn as_mem(&self) -> Option<&MemRef> {
        match self {
            Self::Mem(m) => Some(m),
            _ => None,
        }
    }

    /// The immediate value, sign-extended from its declared width.
    pub const fn as_imm(&self) -> Option<i64> {
        match self {
            Self::Imm { width, value } => Some(width.sign_extend(*value)),
            _ => None,
        }
    }

    /// Access width of the operand, falling back to `default` for
    /// immediates of implicit width and unused slots.
    pub fn width(&self, default: ValType) -> ValType {
        match self {
            Self::None => default,
            Self::Reg(r) => r.vtype(),
            Self::Imm { width, .. } => width.resolve(default),
            Self::Mem(m) => m.width.resolve(default),
        }
    }
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Self::Reg(r)
    }
}

impl From<MemRef> for Operand {
    fn from(m: MemRef) -> Self {
        Self::Mem(m)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Reg(r) => write!(f, "{r}"),
            Self::Imm { width, value } => {
                let v = width.sign_extend(*value);
                if v < 0 {
                    write!(f, "-{:#x}", v.unsigned_abs())
                } else {
                    write!(f, "{v:#x}")
                }
            }
            Self::Mem(m) => write!(f, "{m}"),
        }
    }
}
