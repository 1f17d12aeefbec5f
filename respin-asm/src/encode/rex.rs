//! REX, ModR/M and SIB byte assembly.

use crate::{MemRef, Reg, ValType};

/// Accumulates the REX prefix requirements of one instruction.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
    /// Emit `0x40` even when no bit is set (needed to reach
    /// `spl`/`bpl`/`sil`/`dil`).
    force: bool,
    /// A legacy high-byte register is involved; any REX byte would change
    /// its meaning.
    conflict: bool,
}

impl Rex {
    /// REX.W from the operation width.
    pub fn for_width(vt: ValType) -> Self {
        Self {
            w: vt == ValType::I64,
            ..Self::default()
        }
    }

    /// Explicitly set or clear REX.W.
    pub fn w(mut self, w: bool) -> Self {
        self.w = w;
        self
    }

    /// Account for the register going into the ModR/M `reg` field.
    pub fn reg(&mut self, r: Reg) {
        self.r = r.is_extended();
        self.note_byte_reg(r);
    }

    /// Account for a register encoded in the `r/m` field or in the low
    /// bits of the opcode.
    pub fn rm(&mut self, r: Reg) {
        self.b = r.is_extended();
        self.note_byte_reg(r);
    }

    /// Account for the base/index registers of a memory operand.
    pub fn mem(&mut self, m: &MemRef) {
        if let Some(base) = m.base {
            if base != Reg::RIP {
                self.b = base.is_extended();
            }
        }
        if let Some(index) = m.index {
            self.x = index.is_extended();
        }
    }

    fn note_byte_reg(&mut self, r: Reg) {
        if r.needs_rex_for_byte() {
            self.force = true;
        }
        if r.conflicts_with_rex() {
            self.conflict = true;
        }
    }

    /// True when the operands demand a REX byte that a high-byte register
    /// operand forbids.
    pub fn is_conflicted(&self) -> bool {
        self.conflict && (self.w || self.r || self.x || self.b || self.force)
    }

    /// The REX byte to emit, if one is needed.
    pub fn byte(&self) -> Option<u8> {
        let rex = 0x40
            | (u8::from(self.w) << 3)
            | (u8::from(self.r) << 2)
            | (u8::from(self.x) << 1)
            | u8::from(self.b);
        (rex != 0x40 || self.force).then_some(rex)
    }
}

/// Assemble a ModR/M byte from its three fields.
pub(crate) const fn modrm_byte(m0d: u8, reg: u8, rm: u8) -> u8 {
    ((m0d & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Assemble a SIB byte; `scale` is the hardware log2 encoding.
pub(crate) const fn sib_byte(scale: u8, index: u8, base: u8) -> u8 {
    ((scale & 3) << 6) | ((index & 7) << 3) | (base & 7)
}

/// Displacement encoding chosen for a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disp {
    None,
    D8(i8),
    D32(i32),
}

impl Disp {
    /// Classify `disp`, honoring the `rbp`/`r13` bases which have no
    /// disp-less encoding.
    pub fn classify(disp: i64, base: Option<Reg>) -> Option<Self> {
        let needs_byte = matches!(base, Some(b) if b.index() & 7 == 5);
        if disp == 0 && !needs_byte {
            Some(Self::None)
        } else if let Ok(d8) = i8::try_from(disp) {
            Some(Self::D8(d8))
        } else if let Ok(d32) = i32::try_from(disp) {
            Some(Self::D32(d32))
        } else {
            None
        }
    }

    /// The ModR/M `mod` field value selecting this displacement width.
    pub const fn m0d(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::D8(_) => 1,
            Self::D32(_) => 2,
        }
    }
}
