//! The decoded instruction representation.

use crate::{Operand, ValType};

use bitflags::bitflags;

use core::fmt;

bitflags! {
    /// The six status flags tracked by the rewriter.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        /// Carry.
        const CF = 1 << 0;
        /// Parity of the low result byte.
        const PF = 1 << 1;
        /// Auxiliary carry (BCD).
        const AF = 1 << 2;
        /// Zero.
        const ZF = 1 << 3;
        /// Sign.
        const SF = 1 << 4;
        /// Signed overflow.
        const OF = 1 << 5;
    }
}

impl Flags {
    /// The individual flags in canonical order, for per-flag bookkeeping.
    pub const EACH: [Flags; 6] = [
        Flags::CF,
        Flags::PF,
        Flags::AF,
        Flags::ZF,
        Flags::SF,
        Flags::OF,
    ];
}

/// A condition code, as used by `Jcc`, `CMOVcc` and `SETcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Cond {
    /// Overflow.
    O = 0,
    /// Not overflow.
    No = 1,
    /// Below (unsigned).
    B = 2,
    /// Above or equal (unsigned).
    Ae = 3,
    /// Equal / zero.
    E = 4,
    /// Not equal / not zero.
    Ne = 5,
    /// Below or equal (unsigned).
    Be = 6,
    /// Above (unsigned).
    A = 7,
    /// Sign set.
    S = 8,
    /// Sign clear.
    Ns = 9,
    /// Parity even.
    P = 10,
    /// Parity odd.
    Np = 11,
    /// Less (signed).
    L = 12,
    /// Greater or equal (signed).
    Ge = 13,
    /// Less or equal (signed).
    Le = 14,
    /// Greater (signed).
    G = 15,
}

impl Cond {
    /// Condition from the low nibble of an opcode in the `Jcc`/`SETcc`
    /// families.
    pub const fn from_nibble(n: u8) -> Self {
        match n & 0xf {
            0 => Self::O,
            1 => Self::No,
            2 => Self::B,
            3 => Self::Ae,
            4 => Self::E,
            5 => Self::Ne,
            6 => Self::Be,
            7 => Self::A,
            8 => Self::S,
            9 => Self::Ns,
            10 => Self::P,
            11 => Self::Np,
            12 => Self::L,
            13 => Self::Ge,
            14 => Self::Le,
            _ => Self::G,
        }
    }

    /// The opcode nibble selecting this condition.
    pub const fn nibble(&self) -> u8 {
        *self as u8
    }

    /// The inverse condition.
    pub const fn negate(&self) -> Self {
        Self::from_nibble(*self as u8 ^ 1)
    }

    /// Flags this condition inspects.
    pub const fn flags_read(&self) -> Flags {
        match self {
            Self::O | Self::No => Flags::OF,
            Self::B | Self::Ae => Flags::CF,
            Self::E | Self::Ne => Flags::ZF,
            Self::Be | Self::A => Flags::CF.union(Flags::ZF),
            Self::S | Self::Ns => Flags::SF,
            Self::P | Self::Np => Flags::PF,
            Self::L | Self::Ge => Flags::SF.union(Flags::OF),
            Self::Le | Self::G => Flags::SF.union(Flags::OF).union(Flags::ZF),
        }
    }

    /// Evaluate the condition against concrete flag values.
    pub fn eval(&self, f: Flags) -> bool {
        let cf = f.contains(Flags::CF);
        let zf = f.contains(Flags::ZF);
        let sf = f.contains(Flags::SF);
        let of = f.contains(Flags::OF);
        let pf = f.contains(Flags::PF);
        match self {
            Self::O => of,
            Self::No => !of,
            Self::B => cf,
            Self::Ae => !cf,
            Self::E => zf,
            Self::Ne => !zf,
            Self::Be => cf || zf,
            Self::A => !cf && !zf,
            Self::S => sf,
            Self::Ns => !sf,
            Self::P => pf,
            Self::Np => !pf,
            Self::L => sf != of,
            Self::Ge => sf == of,
            Self::Le => zf || sf != of,
            Self::G => !zf && sf == of,
        }
    }
}

/// Semantic operation of an instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum InstrKind {
    /// Unclassified byte sequence; `len` is still meaningful.
    #[default]
    Invalid,
    /// `nop`, including the multi-byte `0f 1f` forms.
    Nop,
    /// Register/memory/immediate move.
    Mov,
    /// Sign-extending move (including `movsxd`).
    Movsx,
    /// Zero-extending move.
    Movzx,
    /// Address computation.
    Lea,
    /// Integer add.
    Add,
    /// Add with carry.
    Adc,
    /// Integer subtract.
    Sub,
    /// Subtract with borrow.
    Sbb,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Xor,
    /// Compare (subtract discarding the result).
    Cmp,
    /// Bit test (and discarding the result).
    Test,
    /// Shift left.
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
    /// Push a 64-bit value.
    Push,
    /// Pop a 64-bit value.
    Pop,
    /// Direct near call.
    Call,
    /// Indirect call through register or memory.
    CallInd,
    /// Near return.
    Ret,
    /// Direct jump.
    Jmp,
    /// Indirect jump through register or memory.
    JmpInd,
    /// Conditional jump; `cond` holds the condition.
    Jcc,
    /// Conditional move.
    Cmov,
    /// Conditional set of a byte.
    Setcc,
    /// Signed multiply (any of the three operand forms).
    Imul,
    /// Unsigned widening multiply into rdx:rax.
    Mul,
    /// Unsigned divide of rdx:rax.
    Div,
    /// Signed divide of rdx:rax.
    Idiv,
    /// Bitwise not.
    Not,
    /// Two's complement negate.
    Neg,
    /// Increment.
    Inc,
    /// Decrement.
    Dec,
    /// Tear down the frame: `mov rsp, rbp; pop rbp`.
    Leave,
    /// Sign-extend eax into rax (`cdqe`/`cltq`; operand size selects
    /// `cwde`).
    Cdqe,
    /// Sign-extend rax into rdx:rax (`cqo`/`cqto`; operand size selects
    /// `cdq`).
    Cqo,
    /// Bit scan forward.
    Bsf,
    /// Set the carry flag.
    Stc,
    /// Clear the carry flag.
    Clc,
    /// Scalar single move.
    Movss,
    /// Scalar double move.
    Movsd,
    /// Aligned packed-single move.
    Movaps,
    /// Aligned packed-double move.
    Movapd,
    /// Unaligned packed-single move.
    Movups,
    /// Unaligned packed-double move.
    Movupd,
    /// 32-bit GPR/XMM move.
    Movd,
    /// 64-bit GPR/XMM move.
    Movq,
    /// Aligned integer vector move.
    Movdqa,
    /// Unaligned integer vector move.
    Movdqu,
    /// Scalar single add.
    Addss,
    /// Scalar double add.
    Addsd,
    /// Packed single add.
    Addps,
    /// Packed double add.
    Addpd,
    /// Scalar single subtract.
    Subss,
    /// Scalar double subtract.
    Subsd,
    /// Packed single subtract.
    Subps,
    /// Packed double subtract.
    Subpd,
    /// Scalar single multiply.
    Mulss,
    /// Scalar double multiply.
    Mulsd,
    /// Packed single multiply.
    Mulps,
    /// Packed double multiply.
    Mulpd,
    /// Packed single xor.
    Xorps,
    /// Integer vector xor.
    Pxor,
    /// Unordered double compare into flags.
    Ucomisd,
    /// Packed byte equality compare.
    Pcmpeqb,
    /// Packed unsigned byte minimum.
    Pminub,
    /// Byte mask extraction into a GPR.
    Pmovmskb,
    /// Packed 64-bit add.
    Paddq,
    /// Move low packed singles.
    Movlps,
    /// Move high packed singles.
    Movhps,
    /// Interleave low packed singles.
    Unpcklps,
    /// Interleave low packed doubles.
    Unpcklpd,
}

impl InstrKind {
    /// True for instructions that terminate a decoded basic block.
    pub const fn is_exit(&self) -> bool {
        matches!(
            self,
            Self::Call
                | Self::CallInd
                | Self::Ret
                | Self::Jmp
                | Self::JmpInd
                | Self::Jcc
                | Self::Invalid
        )
    }

    /// Status flags this operation writes with defined values. Flags an
    /// operation leaves undefined are excluded so that liveness analysis
    /// never treats them as overwritten.
    pub const fn flags_written(&self) -> Flags {
        match self {
            Self::Add | Self::Adc | Self::Sub | Self::Sbb | Self::Cmp | Self::Neg => Flags::all(),
            Self::And | Self::Or | Self::Xor | Self::Test => Flags::all(),
            Self::Inc | Self::Dec => Flags::all().difference(Flags::CF),
            Self::Shl | Self::Shr | Self::Sar => Flags::CF
                .union(Flags::SF)
                .union(Flags::ZF)
                .union(Flags::PF),
            Self::Imul | Self::Mul => Flags::CF.union(Flags::OF),
            Self::Bsf => Flags::ZF,
            Self::Stc | Self::Clc => Flags::CF,
            Self::Ucomisd => Flags::all(),
            _ => Flags::empty(),
        }
    }

    /// True when the only architectural effect is a flag update.
    pub const fn writes_flags_only(&self) -> bool {
        matches!(self, Self::Cmp | Self::Test | Self::Ucomisd)
    }

    /// True for the SSE/SSE2 subset, which is re-emitted through the
    /// passthrough record.
    pub const fn is_sse(&self) -> bool {
        matches!(
            self,
            Self::Movss
                | Self::Movsd
                | Self::Movaps
                | Self::Movapd
                | Self::Movups
                | Self::Movupd
                | Self::Movd
                | Self::Movq
                | Self::Movdqa
                | Self::Movdqu
                | Self::Addss
                | Self::Addsd
                | Self::Addps
                | Self::Addpd
                | Self::Subss
                | Self::Subsd
                | Self::Subps
                | Self::Subpd
                | Self::Mulss
                | Self::Mulsd
                | Self::Mulps
                | Self::Mulpd
                | Self::Xorps
                | Self::Pxor
                | Self::Ucomisd
                | Self::Pcmpeqb
                | Self::Pminub
                | Self::Pmovmskb
                | Self::Paddq
                | Self::Movlps
                | Self::Movhps
                | Self::Unpcklps
                | Self::Unpcklpd
        )
    }
}

/// Opcode map an instruction was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeMap {
    /// Single-byte opcodes.
    One,
    /// The `0f` escape map.
    Two,
}

/// Operand-to-field assignment of a passthrough encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtEncoding {
    /// `reg` is the destination, `r/m` the source.
    Rm,
    /// `r/m` is the destination, `reg` the source.
    Mr,
    /// `r/m` is the destination, an immediate the source.
    Mi,
    /// VEX three-operand form.
    Rvm,
}

/// Raw encoding details kept for instructions the emitter re-emits
/// byte-equivalently, patching only the register fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Passthrough {
    /// Mandatory prefix (`0x66`, `0xf2`, `0xf3`), if one was present.
    pub prefix: Option<u8>,
    /// Opcode map.
    pub map: OpcodeMap,
    /// The opcode byte within the map.
    pub opcode: u8,
    /// Operand-to-field assignment.
    pub enc: PtEncoding,
    /// Whether REX.W was set when decoded.
    pub rex_w: bool,
}

/// One decoded x86-64 instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// Address the instruction was decoded from.
    pub addr: u64,
    /// Number of bytes consumed from the input stream.
    pub len: u8,
    /// Semantic operation.
    pub kind: InstrKind,
    /// Condition code for `Jcc`/`Cmov`/`Setcc`.
    pub cond: Option<Cond>,
    /// Operation width.
    pub vtype: ValType,
    /// Destination operand (also the first source for two-operand ALU
    /// forms).
    pub dst: Operand,
    /// First source operand.
    pub src: Operand,
    /// Second source operand (three-operand `imul` only).
    pub src2: Operand,
    /// Raw re-emission record for unmodeled encodings.
    pub passthrough: Option<Passthrough>,
}

impl Instruction {
    /// An operand-less instruction.
    pub fn nullary(addr: u64, kind: InstrKind) -> Self {
        Self {
            addr,
            kind,
            ..Self::default()
        }
    }

    /// A one-operand instruction.
    pub fn unary(addr: u64, kind: InstrKind, vtype: ValType, dst: Operand) -> Self {
        Self {
            addr,
            kind,
            vtype,
            dst,
            ..Self::default()
        }
    }

    /// A two-operand instruction.
    pub fn binary(addr: u64, kind: InstrKind, vtype: ValType, dst: Operand, src: Operand) -> Self {
        Self {
            addr,
            kind,
            vtype,
            dst,
            src,
            ..Self::default()
        }
    }

    /// A three-operand instruction.
    pub fn ternary(
        addr: u64,
        kind: InstrKind,
        vtype: ValType,
        dst: Operand,
        src: Operand,
        src2: Operand,
    ) -> Self {
        Self {
            addr,
            kind,
            vtype,
            dst,
            src,
            src2,
            ..Self::default()
        }
    }

    /// Number of used operand slots (the `form` of the instruction).
    pub fn operand_count(&self) -> u8 {
        if self.dst.is_none() {
            0
        } else if self.src.is_none() {
            1
        } else if self.src2.is_none() {
            2
        } else {
            3
        }
    }

    /// Address of the instruction following this one.
    pub const fn end(&self) -> u64 {
        self.addr.wrapping_add(self.len as u64)
    }

    /// True when this instruction terminates a decoded basic block.
    pub fn is_exit(&self) -> bool {
        self.kind.is_exit()
    }

    /// Flags this instruction reads.
    pub fn flags_read(&self) -> Flags {
        match self.kind {
            InstrKind::Adc | InstrKind::Sbb => Flags::CF,
            InstrKind::Jcc | InstrKind::Cmov | InstrKind::Setcc => {
                self.cond.map(|c| c.flags_read()).unwrap_or_default()
            }
            _ => Flags::empty(),
        }
    }

    /// Flags this instruction writes with defined values.
    pub fn flags_written(&self) -> Flags {
        self.kind.flags_written()
    }

    /// Mnemonic including the condition suffix where applicable.
    pub fn mnemonic(&self) -> String {
        match (self.kind, self.cond) {
            (InstrKind::Jcc, Some(c)) => format!("j{c}"),
            (InstrKind::Cmov, Some(c)) => format!("cmov{c}"),
            (InstrKind::Setcc, Some(c)) => format!("set{c}"),
            (kind, _) => kind.to_string(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}: {:<10}", self.addr, self.mnemonic())?;
        if !self.dst.is_none() {
            write!(f, " {}", self.dst)?;
        }
        if !self.src.is_none() {
            write!(f, ", {}", self.src)?;
        }
        if !self.src2.is_none() {
            write!(f, ", {}", self.src2)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn cond_negation_flips_the_low_bit() {
        for c in Cond::iter() {
            assert_eq!(c.negate().nibble(), c.nibble() ^ 1);
            assert_eq!(c.negate().negate(), c);
        }
    }

    #[test]
    fn cond_eval_matches_flag_semantics() {
        let below = Flags::CF;
        assert!(Cond::B.eval(below));
        assert!(!Cond::Ae.eval(below));
        // sf != of means "less".
        assert!(Cond::L.eval(Flags::SF));
        assert!(Cond::L.eval(Flags::OF));
        assert!(!Cond::L.eval(Flags::SF | Flags::OF));
        assert!(Cond::Le.eval(Flags::ZF));
    }

    #[test]
    fn undefined_flags_are_not_reported_as_written() {
        assert!(!InstrKind::Shl.flags_written().contains(Flags::OF));
        assert!(!InstrKind::Imul.flags_written().contains(Flags::ZF));
        assert_eq!(InstrKind::Div.flags_written(), Flags::empty());
    }
}
