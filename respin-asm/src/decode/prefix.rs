//! Legacy and REX prefix collection.

use crate::Segment;

use bitflags::bitflags;

bitflags! {
    /// Legacy prefixes recognized ahead of the opcode.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PrefixFlags: u8 {
        /// Operand-size override (`0x66`).
        const OPSIZE = 1 << 0;
        /// `repne` / scalar-double mandatory prefix (`0xf2`).
        const REPNE = 1 << 1;
        /// `rep` / scalar-single mandatory prefix (`0xf3`).
        const REP = 1 << 2;
        /// Branch hint (`0x2e`), ignored semantically.
        const HINT = 1 << 3;
    }
}

/// Decoded prefix state for a single instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Prefixes {
    /// Legacy prefix set.
    pub flags: PrefixFlags,
    /// The raw REX byte, if present.
    pub rex: Option<u8>,
    /// Segment override; multiple overrides collapse to the last one seen.
    pub segment: Segment,
}

impl Prefixes {
    /// REX.W: 64-bit operand size.
    pub fn rex_w(&self) -> bool {
        self.rex.is_some_and(|r| r & 0x8 != 0)
    }

    /// REX.R: extension of the ModR/M `reg` field.
    pub fn rex_r(&self) -> u8 {
        self.rex.map_or(0, |r| (r >> 2) & 1)
    }

    /// REX.X: extension of the SIB `index` field.
    pub fn rex_x(&self) -> u8 {
        self.rex.map_or(0, |r| (r >> 1) & 1)
    }

    /// REX.B: extension of the ModR/M `r/m`, SIB `base`, or opcode
    /// register field.
    pub fn rex_b(&self) -> u8 {
        self.rex.map_or(0, |r| r & 1)
    }

    /// The mandatory prefix relevant for two-byte opcode dispatch, with
    /// `f2`/`f3` taking priority over `66`.
    pub fn mandatory(&self) -> Option<u8> {
        if self.flags.contains(PrefixFlags::REPNE) {
            Some(0xf2)
        } else if self.flags.contains(PrefixFlags::REP) {
            Some(0xf3)
        } else if self.flags.contains(PrefixFlags::OPSIZE) {
            Some(0x66)
        } else {
            None
        }
    }

    /// Consume one byte if it is a recognized prefix, updating `self`.
    /// Returns `false` once a non-prefix byte is seen.
    pub(crate) fn accept(&mut self, byte: u8) -> bool {
        match byte {
            0x66 => self.flags |= PrefixFlags::OPSIZE,
            0xf2 => self.flags |= PrefixFlags::REPNE,
            0xf3 => self.flags |= PrefixFlags::REP,
            0x64 => self.segment = Segment::Fs,
            0x65 => self.segment = Segment::Gs,
            0x2e => self.flags |= PrefixFlags::HINT,
            0x40..=0x4f => self.rex = Some(byte),
            _ => return false,
        }
        // A REX byte is only effective immediately before the opcode; a
        // legacy prefix after it cancels it.
        if !(0x40..=0x4f).contains(&byte) {
            self.rex = None;
        }
        true
    }
}
