//! Integer semantics and flag computation.

use crate::state::Taint;

use respin_asm::{Flags, InstrKind, ValType};

use super::Val;

/// Result of one integer operation: the value, the flag values, and the
/// flags that were actually computed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AluOut {
    pub value: u64,
    pub flags: Flags,
    pub written: Flags,
}

fn msb(w: ValType) -> u64 {
    1u64 << (w.bits() - 1)
}

fn szp(w: ValType, r: u64) -> Flags {
    let r = r & w.mask();
    let mut f = Flags::empty();
    if r == 0 {
        f |= Flags::ZF;
    }
    if r & msb(w) != 0 {
        f |= Flags::SF;
    }
    if (r as u8).count_ones() % 2 == 0 {
        f |= Flags::PF;
    }
    f
}

fn add_with_carry(w: ValType, a: u64, b: u64, carry: bool) -> AluOut {
    let mask = w.mask();
    let (a, b) = (a & mask, b & mask);
    let wide = a as u128 + b as u128 + carry as u128;
    let r = (wide as u64) & mask;
    let mut f = szp(w, r);
    if wide > mask as u128 {
        f |= Flags::CF;
    }
    if (!(a ^ b) & (a ^ r)) & msb(w) != 0 {
        f |= Flags::OF;
    }
    if ((a ^ b ^ r) & 0x10) != 0 {
        f |= Flags::AF;
    }
    AluOut {
        value: r,
        flags: f,
        written: Flags::all(),
    }
}

fn sub_with_borrow(w: ValType, a: u64, b: u64, borrow: bool) -> AluOut {
    let mask = w.mask();
    let (a, b) = (a & mask, b & mask);
    let rhs = b as u128 + borrow as u128;
    let r = (a as u128).wrapping_sub(rhs) as u64 & mask;
    let mut f = szp(w, r);
    if (a as u128) < rhs {
        f |= Flags::CF;
    }
    if ((a ^ b) & (a ^ r)) & msb(w) != 0 {
        f |= Flags::OF;
    }
    if ((a ^ b ^ r) & 0x10) != 0 {
        f |= Flags::AF;
    }
    AluOut {
        value: r,
        flags: f,
        written: Flags::all(),
    }
}

fn logic(w: ValType, kind: InstrKind, a: u64, b: u64) -> AluOut {
    let r = match kind {
        InstrKind::And | InstrKind::Test => a & b,
        InstrKind::Or => a | b,
        _ => a ^ b,
    } & w.mask();
    AluOut {
        value: r,
        // CF and OF cleared, AF left alone (architecturally undefined).
        flags: szp(w, r),
        written: Flags::all().difference(Flags::AF),
    }
}

fn shift(w: ValType, kind: InstrKind, a: u64, count: u64) -> AluOut {
    let bits = w.bits() as u64;
    let cmask = if w == ValType::I64 { 0x3f } else { 0x1f };
    let s = count & cmask;
    let a = a & w.mask();
    if s == 0 {
        // Flags untouched when the masked count is zero.
        return AluOut {
            value: a,
            flags: Flags::empty(),
            written: Flags::empty(),
        };
    }
    let (r, carry) = match kind {
        InstrKind::Shl => {
            let r = if s >= bits { 0 } else { a << s };
            let carry = if s <= bits { (a >> (bits - s)) & 1 != 0 } else { false };
            (r, carry)
        }
        InstrKind::Shr => {
            let r = if s >= bits { 0 } else { a >> s };
            let carry = if s <= bits { (a >> (s - 1)) & 1 != 0 } else { false };
            (r, carry)
        }
        _ => {
            // sar: shift in copies of the sign bit.
            let sign = (a & msb(w)) != 0;
            let sa = (w.sign_extend(a)) >> s.min(63);
            let carry = if s <= bits {
                ((w.sign_extend(a) >> (s - 1)) & 1) != 0
            } else {
                sign
            };
            (sa as u64, carry)
        }
    };
    let r = r & w.mask();
    let mut f = szp(w, r);
    if carry {
        f |= Flags::CF;
    }
    AluOut {
        value: r,
        flags: f,
        written: InstrKind::Shl.flags_written(),
    }
}

/// Evaluate a two-input integer operation.
pub(crate) fn eval2(kind: InstrKind, w: ValType, a: u64, b: u64, cf: bool) -> AluOut {
    match kind {
        InstrKind::Add => add_with_carry(w, a, b, false),
        InstrKind::Adc => add_with_carry(w, a, b, cf),
        InstrKind::Sub | InstrKind::Cmp => sub_with_borrow(w, a, b, false),
        InstrKind::Sbb => sub_with_borrow(w, a, b, cf),
        InstrKind::And | InstrKind::Or | InstrKind::Xor | InstrKind::Test => logic(w, kind, a, b),
        InstrKind::Shl | InstrKind::Shr | InstrKind::Sar => shift(w, kind, a, b),
        InstrKind::Imul => {
            let r = (w.sign_extend(a)).wrapping_mul(w.sign_extend(b)) as u64 & w.mask();
            let wide = (w.sign_extend(a) as i128) * (w.sign_extend(b) as i128);
            let overflow = wide != w.sign_extend(r) as i128;
            let mut f = Flags::empty();
            if overflow {
                f |= Flags::CF | Flags::OF;
            }
            AluOut {
                value: r,
                flags: f,
                written: Flags::CF | Flags::OF,
            }
        }
        _ => unreachable!("eval2 on {kind}"),
    }
}

/// Evaluate a one-input integer operation.
pub(crate) fn eval1(kind: InstrKind, w: ValType, a: u64) -> AluOut {
    match kind {
        InstrKind::Not => AluOut {
            value: !a & w.mask(),
            flags: Flags::empty(),
            written: Flags::empty(),
        },
        InstrKind::Neg => {
            let mut out = sub_with_borrow(w, 0, a, false);
            // neg sets CF iff the operand was non-zero.
            out.flags.set(Flags::CF, a & w.mask() != 0);
            out
        }
        InstrKind::Inc => {
            let mut out = add_with_carry(w, a, 1, false);
            out.written = Flags::all().difference(Flags::CF);
            out
        }
        InstrKind::Dec => {
            let mut out = sub_with_borrow(w, a, 1, false);
            out.written = Flags::all().difference(Flags::CF);
            out
        }
        InstrKind::Bsf => {
            let a = a & w.mask();
            let mut f = Flags::empty();
            if a == 0 {
                f |= Flags::ZF;
            }
            AluOut {
                value: a.trailing_zeros() as u64,
                flags: f,
                written: Flags::ZF,
            }
        }
        _ => unreachable!("eval1 on {kind}"),
    }
}

/// Taint of an integer result, refining the plain byte union with the
/// stack-relative arithmetic rules: adding a known delta to a
/// stack-relative value stays stack-relative, subtracting two
/// stack-relative values yields a known difference.
pub(crate) fn result_taint(kind: InstrKind, a: Val, b: Val) -> Taint {
    use Taint::*;
    if a.t == Dynamic || b.t == Dynamic {
        return Dynamic;
    }
    match (a.t, b.t) {
        (Static, Static) => Static,
        (StackRel, Static) => match kind {
            InstrKind::Add | InstrKind::Sub | InstrKind::Lea | InstrKind::Inc | InstrKind::Dec => {
                StackRel
            }
            // Comparing a stack pointer against a constant depends on
            // where the runtime stack lives.
            _ => Dynamic,
        },
        (Static, StackRel) => match kind {
            InstrKind::Add | InstrKind::Lea => StackRel,
            _ => Dynamic,
        },
        (StackRel, StackRel) => match kind {
            InstrKind::Sub | InstrKind::Cmp => Static,
            _ => Dynamic,
        },
        _ => Dynamic,
    }
}

/// Taint of the flags produced alongside `result_taint`.
pub(crate) fn flag_result_taint(kind: InstrKind, a: Val, b: Val) -> Taint {
    use Taint::*;
    if a.t == Dynamic || b.t == Dynamic {
        return Dynamic;
    }
    match (a.t, b.t) {
        (Static, Static) => Static,
        // Only the difference of two stack-relative values has known
        // flags.
        (StackRel, StackRel) if matches!(kind, InstrKind::Sub | InstrKind::Cmp) => Static,
        _ => Dynamic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_flags_match_x86() {
        let out = eval2(InstrKind::Add, ValType::I8, 0x7f, 1, false);
        assert_eq!(out.value, 0x80);
        assert!(out.flags.contains(Flags::OF));
        assert!(out.flags.contains(Flags::SF));
        assert!(!out.flags.contains(Flags::CF));

        let out = eval2(InstrKind::Add, ValType::I8, 0xff, 1, false);
        assert_eq!(out.value, 0);
        assert!(out.flags.contains(Flags::CF));
        assert!(out.flags.contains(Flags::ZF));
        assert!(!out.flags.contains(Flags::OF));
    }

    #[test]
    fn cmp_below_sets_carry() {
        let out = eval2(InstrKind::Cmp, ValType::I64, 3, 5, false);
        assert!(out.flags.contains(Flags::CF));
        assert!(out.flags.contains(Flags::SF));
        assert!(!out.flags.contains(Flags::ZF));
    }

    #[test]
    fn shift_by_zero_preserves_flags() {
        let out = eval2(InstrKind::Shl, ValType::I32, 0x1234, 0, false);
        assert_eq!(out.value, 0x1234);
        assert_eq!(out.written, Flags::empty());
    }

    #[test]
    fn sar_keeps_the_sign() {
        let out = eval2(InstrKind::Sar, ValType::I64, (-16i64) as u64, 2, false);
        assert_eq!(out.value as i64, -4);
    }

    #[test]
    fn neg_carry_reflects_nonzero_input() {
        assert!(eval1(InstrKind::Neg, ValType::I64, 5).flags.contains(Flags::CF));
        assert!(!eval1(InstrKind::Neg, ValType::I64, 0).flags.contains(Flags::CF));
    }

    #[test]
    fn stack_relative_difference_is_static() {
        let a = Val::new(0x1000, Taint::StackRel);
        let b = Val::new(0x0ff8, Taint::StackRel);
        assert_eq!(result_taint(InstrKind::Sub, a, b), Taint::Static);
        assert_eq!(result_taint(InstrKind::Add, a, b), Taint::Dynamic);
        assert_eq!(
            result_taint(InstrKind::Add, a, Val::fixed(8)),
            Taint::StackRel
        );
    }
}
