//! SSE/SSE2 subset semantics over the two-lane vector state.

use super::capture::Role;
use super::{Engine, StepFlow, Trace, Val};
use crate::error::{Result, RewriteError};
use crate::state::Taint;

use respin_asm::{Flags, Instruction, InstrKind, Operand, ValType};

type Lanes = [u64; 2];

fn f32x(v: u64) -> f32 {
    f32::from_bits(v as u32)
}

fn f64x(v: u64) -> f64 {
    f64::from_bits(v)
}

fn scalar_f32(op: InstrKind, a: u64, b: u64) -> u64 {
    let r = match op {
        InstrKind::Addss => f32x(a) + f32x(b),
        InstrKind::Subss => f32x(a) - f32x(b),
        _ => f32x(a) * f32x(b),
    };
    r.to_bits() as u64
}

fn scalar_f64(op: InstrKind, a: u64, b: u64) -> u64 {
    let r = match op {
        InstrKind::Addsd => f64x(a) + f64x(b),
        InstrKind::Subsd => f64x(a) - f64x(b),
        _ => f64x(a) * f64x(b),
    };
    r.to_bits()
}

fn packed_f32(op: InstrKind, a: Lanes, b: Lanes) -> Lanes {
    let mut out = [0u64; 2];
    for lane in 0..2 {
        for half in 0..2 {
            let sa = (a[lane] >> (32 * half)) as u32;
            let sb = (b[lane] >> (32 * half)) as u32;
            let r = match op {
                InstrKind::Addps => f32::from_bits(sa) + f32::from_bits(sb),
                InstrKind::Subps => f32::from_bits(sa) - f32::from_bits(sb),
                _ => f32::from_bits(sa) * f32::from_bits(sb),
            };
            out[lane] |= (r.to_bits() as u64) << (32 * half);
        }
    }
    out
}

fn packed_f64(op: InstrKind, a: Lanes, b: Lanes) -> Lanes {
    let mut out = [0u64; 2];
    for lane in 0..2 {
        let r = match op {
            InstrKind::Addpd => f64x(a[lane]) + f64x(b[lane]),
            InstrKind::Subpd => f64x(a[lane]) - f64x(b[lane]),
            _ => f64x(a[lane]) * f64x(b[lane]),
        };
        out[lane] = r.to_bits();
    }
    out
}

fn bytewise(a: Lanes, b: Lanes, f: impl Fn(u8, u8) -> u8) -> Lanes {
    let mut out = [0u64; 2];
    for lane in 0..2 {
        for byte in 0..8 {
            let ba = (a[lane] >> (8 * byte)) as u8;
            let bb = (b[lane] >> (8 * byte)) as u8;
            out[lane] |= (f(ba, bb) as u64) << (8 * byte);
        }
    }
    out
}

impl Engine<'_> {
    /// Read a vector-capable operand. Returns both lanes; narrower
    /// sources leave the upper bits zero.
    fn read_vec(&mut self, tr: &mut Trace, op: &Operand, width: ValType) -> Result<(Lanes, Taint)> {
        match op {
            Operand::Reg(r) if r.is_vec() => {
                let i = r.index() as usize;
                Ok((tr.state.xmm[i], tr.state.xmm_taint[i]))
            }
            Operand::Reg(_) | Operand::Imm { .. } => {
                let v = self.read_op(tr, op, width)?;
                Ok(([v.v, 0], v.t))
            }
            Operand::Mem(mem) => {
                if width == ValType::V128 {
                    let mut lo_mem = *mem;
                    lo_mem.width = ValType::I64;
                    let mut hi_mem = lo_mem;
                    hi_mem.disp = hi_mem.disp.wrapping_add(8);
                    let lo = self.read_mem(tr, &lo_mem, ValType::I64)?;
                    let hi = self.read_mem(tr, &hi_mem, ValType::I64)?;
                    Ok(([lo.v, hi.v], lo.t.union(hi.t)))
                } else {
                    let v = self.read_mem(tr, mem, width)?;
                    Ok(([v.v, 0], v.t))
                }
            }
            Operand::None => Ok(([0, 0], Taint::Static)),
        }
    }

    /// Store lanes through a vector-capable destination. Returns `false`
    /// when the store must stay residual.
    fn write_vec(
        &mut self,
        tr: &mut Trace,
        op: &Operand,
        width: ValType,
        lanes: Lanes,
        taint: Taint,
    ) -> Result<bool> {
        match op {
            Operand::Reg(r) if r.is_vec() => {
                let i = r.index() as usize;
                tr.state.xmm[i] = lanes;
                tr.state.xmm_taint[i] = taint;
                Ok(true)
            }
            Operand::Reg(r) => {
                super::Engine::write_reg(&mut tr.state, *r, Val::new(lanes[0], taint));
                Ok(true)
            }
            Operand::Mem(mem) => {
                if width == ValType::V128 {
                    let mut lo_mem = *mem;
                    lo_mem.width = ValType::I64;
                    let mut hi_mem = lo_mem;
                    hi_mem.disp = hi_mem.disp.wrapping_add(8);
                    let a = self.write_mem(tr, &lo_mem, ValType::I64, Val::new(lanes[0], taint))?;
                    let b = self.write_mem(tr, &hi_mem, ValType::I64, Val::new(lanes[1], taint))?;
                    Ok(a && b)
                } else {
                    self.write_mem(tr, mem, width, Val::new(lanes[0], taint))
                }
            }
            Operand::None | Operand::Imm { .. } => Ok(true),
        }
    }

    pub(crate) fn step_sse(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        use InstrKind::*;
        let kind = instr.kind;

        if kind == Ucomisd {
            return self.step_ucomisd(tr, instr);
        }

        let src_width = instr.src.width(instr.vtype);
        let (src, src_t) = self.read_vec(tr, &instr.src, src_width)?;

        // Merging moves and arithmetic read the destination too; full
        // moves and loads do not.
        let reads_dst = match kind {
            Movaps | Movapd | Movups | Movupd | Movdqa | Movdqu | Movd | Movq | Pmovmskb => false,
            Movss | Movsd => matches!(&instr.src, Operand::Reg(r) if r.is_vec()),
            Movlps | Movhps => matches!(&instr.dst, Operand::Reg(_)),
            _ => true,
        };
        let dst_width = instr.dst.width(instr.vtype);
        let (dst, dst_t) = if reads_dst && !matches!(instr.dst, Operand::Mem(_)) {
            self.read_vec(tr, &instr.dst, dst_width)?
        } else {
            ([0, 0], Taint::Static)
        };

        let mut in_t = src_t;
        if reads_dst && !matches!(instr.dst, Operand::Mem(_)) {
            in_t = in_t.union(dst_t);
        }
        // A stack-shaped value in vector lanes has no meaning.
        if in_t == Taint::StackRel {
            in_t = Taint::Dynamic;
        }
        // Vector zeroing idioms are static whatever the register held.
        if matches!(kind, Pxor | Xorps) && instr.dst == instr.src {
            in_t = Taint::Static;
        }

        let out: Lanes = match kind {
            Movaps | Movapd | Movups | Movupd | Movdqa | Movdqu => src,
            Movss => match (&instr.dst, &instr.src) {
                // Register merge keeps the upper bits; a load zeroes them.
                (Operand::Reg(_), Operand::Reg(r)) if r.is_vec() => {
                    [(dst[0] & !0xffff_ffff) | (src[0] & 0xffff_ffff), dst[1]]
                }
                (Operand::Reg(_), _) => [src[0] & 0xffff_ffff, 0],
                _ => [src[0] & 0xffff_ffff, 0],
            },
            Movsd => match (&instr.dst, &instr.src) {
                (Operand::Reg(_), Operand::Reg(r)) if r.is_vec() => [src[0], dst[1]],
                _ => [src[0], 0],
            },
            Movd => [src[0] & 0xffff_ffff, 0],
            Movq => [src[0], 0],
            Movlps => match &instr.dst {
                Operand::Reg(_) => [src[0], dst[1]],
                _ => [src[0], 0],
            },
            Movhps => match &instr.dst {
                Operand::Reg(_) => [dst[0], src[0]],
                // Store form writes the source's high lane.
                _ => [src[1], 0],
            },
            Unpcklps => [
                (dst[0] & 0xffff_ffff) | ((src[0] & 0xffff_ffff) << 32),
                (dst[0] >> 32) | ((src[0] >> 32) << 32),
            ],
            Unpcklpd => [dst[0], src[0]],
            Addss | Subss | Mulss => [
                (dst[0] & !0xffff_ffff) | scalar_f32(kind, dst[0] & 0xffff_ffff, src[0]),
                dst[1],
            ],
            Addsd | Subsd | Mulsd => [scalar_f64(kind, dst[0], src[0]), dst[1]],
            Addps | Subps | Mulps => packed_f32(kind, dst, src),
            Addpd | Subpd | Mulpd => packed_f64(kind, dst, src),
            Xorps | Pxor => [dst[0] ^ src[0], dst[1] ^ src[1]],
            Pcmpeqb => bytewise(dst, src, |a, b| if a == b { 0xff } else { 0 }),
            Pminub => bytewise(dst, src, |a, b| a.min(b)),
            Paddq => [
                dst[0].wrapping_add(src[0]),
                dst[1].wrapping_add(src[1]),
            ],
            Pmovmskb => {
                let mut mask = 0u64;
                for lane in 0..2 {
                    for byte in 0..8 {
                        if (src[lane] >> (8 * byte + 7)) & 1 != 0 {
                            mask |= 1 << (lane * 8 + byte);
                        }
                    }
                }
                [mask, 0]
            }
            other => {
                return Err(RewriteError::Unsupported {
                    addr: instr.addr,
                    kind: other,
                })
            }
        };

        if self.capturing() && in_t.is_dynamic() {
            let role = if reads_dst { Role::DstReadWrite } else { Role::DstWrite };
            self.emit_rewritten(tr, instr, role)?;
            self.write_vec(tr, &instr.dst, dst_width, out, Taint::Dynamic)?;
            return Ok(StepFlow::Continue);
        }

        let stored = self.write_vec(tr, &instr.dst, dst_width, out, in_t)?;
        if !stored {
            if self.capturing() {
                let role = if reads_dst { Role::DstReadWrite } else { Role::DstWrite };
                self.emit_rewritten(tr, instr, role)?;
            } else {
                return Err(RewriteError::Unsupported {
                    addr: instr.addr,
                    kind,
                });
            }
        }
        Ok(StepFlow::Continue)
    }

    fn step_ucomisd(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        let (a, at) = self.read_vec(tr, &instr.dst, ValType::I64)?;
        let (b, bt) = self.read_vec(tr, &instr.src, ValType::I64)?;
        let mut in_t = at.union(bt);
        if in_t == Taint::StackRel {
            in_t = Taint::Dynamic;
        }

        let (x, y) = (f64x(a[0]), f64x(b[0]));
        let mut flags = Flags::empty();
        if x.is_nan() || y.is_nan() {
            flags = Flags::ZF | Flags::PF | Flags::CF;
        } else if x < y {
            flags = Flags::CF;
        } else if x == y {
            flags = Flags::ZF;
        }

        if self.capturing() && in_t.is_dynamic() {
            self.emit_rewritten(tr, instr, Role::DstReadWrite)?;
            tr.state.set_flags(flags, Flags::all(), Taint::Dynamic);
            return Ok(StepFlow::Continue);
        }

        tr.state.set_flags(flags, Flags::all(), Taint::Static);
        Ok(StepFlow::Continue)
    }
}
