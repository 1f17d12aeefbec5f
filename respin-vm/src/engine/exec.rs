//! Per-instruction dispatch: fold when every input is known, capture
//! otherwise.

use super::alu::{self, AluOut};
use super::capture::Role;
use super::{Engine, StepFlow, Trace, Val};
use crate::error::{Result, RewriteError};
use crate::state::Taint;

use respin_asm::{reg, Flags, Instruction, InstrKind, Operand, ValType};

impl Engine<'_> {
    pub(crate) fn step(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        use InstrKind::*;
        match instr.kind {
            Invalid => Err(RewriteError::Unsupported {
                addr: instr.addr,
                kind: instr.kind,
            }),
            Nop => Ok(StepFlow::Continue),

            Jmp | JmpInd | Jcc | Call | CallInd | Ret => self.step_flow(tr, instr),
            Push | Pop | Leave => self.step_stack(tr, instr),

            Mov | Movsx | Movzx | Lea => self.step_mov(tr, instr),

            Add | Adc | Sub | Sbb | And | Or | Xor | Cmp | Test | Shl | Shr | Sar => {
                self.step_alu2(tr, instr)
            }
            Imul => match instr.operand_count() {
                1 => self.step_muldiv(tr, instr),
                _ => self.step_alu2(tr, instr),
            },
            Mul | Div | Idiv => self.step_muldiv(tr, instr),
            Not | Neg | Inc | Dec | Bsf => self.step_alu1(tr, instr),
            Cdqe | Cqo => self.step_extend(tr, instr),
            Cmov => self.step_cmov(tr, instr),
            Setcc => self.step_setcc(tr, instr),
            Stc | Clc => {
                tr.state
                    .set_flags(
                        if instr.kind == Stc { Flags::CF } else { Flags::empty() },
                        Flags::CF,
                        Taint::Static,
                    );
                Ok(StepFlow::Continue)
            }

            kind if kind.is_sse() => self.step_sse(tr, instr),
            kind => Err(RewriteError::Unsupported {
                addr: instr.addr,
                kind,
            }),
        }
    }

    /// True when `op` is a stack-frame register destination, which is
    /// always captured so the runtime stack stays synchronized with the
    /// emulated one.
    fn frame_dst(op: &Operand) -> bool {
        matches!(op, Operand::Reg(r) if r.is_gp() && matches!(r.index(), reg::RSP | reg::RBP))
    }

    /// Joined taint of a set of consumed flags, erroring on flags whose
    /// values were lost to a folded stack-relative computation.
    pub(super) fn consumed_flag_taint(&self, tr: &Trace, instr: &Instruction, set: Flags) -> Result<Taint> {
        let mut t = Taint::Static;
        for f in Flags::EACH {
            if !set.contains(f) {
                continue;
            }
            match tr.state.flag_taint_of(f) {
                Taint::StackRel => {
                    return Err(RewriteError::FlagMaterialization {
                        addr: instr.addr,
                        kind: instr.kind,
                    })
                }
                other => t = t.union(other),
            }
        }
        Ok(t)
    }

    fn step_alu2(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        let w = instr.vtype;

        // Zeroing idioms produce a known value whatever the register
        // held before.
        if matches!(instr.kind, InstrKind::Xor | InstrKind::Sub)
            && matches!(
                (&instr.dst, &instr.src),
                (Operand::Reg(a), Operand::Reg(b)) if a == b
            )
        {
            let out = alu::eval2(instr.kind, w, 0, 0, false);
            self.write_op(tr, &instr.dst, w, Val::fixed(0))?;
            tr.state.set_flags(out.flags, out.written, Taint::Static);
            return Ok(StepFlow::Continue);
        }

        let three_op = instr.operand_count() == 3;
        let (a_op, b_op) = if three_op {
            (&instr.src, &instr.src2)
        } else {
            (&instr.dst, &instr.src)
        };
        let a = self.read_op(tr, a_op, w)?;
        let b = self.read_op(tr, b_op, w)?;

        let uses_cf = matches!(instr.kind, InstrKind::Adc | InstrKind::Sbb);
        let cf_taint = if uses_cf && self.capturing() {
            self.consumed_flag_taint(tr, instr, Flags::CF)?
        } else {
            Taint::Static
        };
        let cf = tr.state.flags.contains(Flags::CF);

        let out = alu::eval2(instr.kind, w, a.v, b.v, cf);
        let mut res_taint = alu::result_taint(instr.kind, a, b);
        let mut flg_taint = alu::flag_result_taint(instr.kind, a, b);
        if cf_taint.is_dynamic() {
            res_taint = Taint::Dynamic;
            flg_taint = Taint::Dynamic;
        }

        let writes_dst = !instr.kind.writes_flags_only();
        let forced = self.capturing() && writes_dst && Self::frame_dst(&instr.dst);

        if self.capturing() && (res_taint.is_dynamic() || flg_taint.is_dynamic() || forced) {
            // adc/sbb with a statically-known carry need it rebuilt at
            // run time before the residual executes.
            if uses_cf && cf_taint.is_static() {
                let kind = if cf { InstrKind::Stc } else { InstrKind::Clc };
                self.emit(tr, Instruction::nullary(0, kind))?;
                tr.state.set_flags(tr.state.flags, Flags::CF, Taint::Dynamic);
            }
            // cmp/test read their first operand without writing it, but
            // the r/m slot still cannot become an immediate, so every
            // first operand is prepared as read-write.
            self.emit_rewritten(tr, instr, Role::DstReadWrite)?;
            if writes_dst {
                let taint = if forced && !res_taint.is_dynamic() {
                    // A captured stack-pointer adjustment stays tracked.
                    res_taint
                } else {
                    Taint::Dynamic
                };
                self.write_op(tr, &instr.dst, w, Val::new(out.value, taint))?;
            }
            tr.state.set_flags(out.flags, out.written, Taint::Dynamic);
            return Ok(StepFlow::Continue);
        }

        if writes_dst
            && !self.try_fold_store(tr, instr, w, Val::new(out.value, res_taint), &out)?
        {
            return Ok(StepFlow::Continue);
        }
        tr.state.set_flags(out.flags, out.written, flg_taint);
        Ok(StepFlow::Continue)
    }

    /// Fold-path destination write. Memory destinations outside the
    /// emulated stack cannot be written at specialization time; such
    /// stores are re-issued residually. Returns `false` when the store
    /// (and its flags) were handled by the residual path.
    fn try_fold_store(
        &mut self,
        tr: &mut Trace,
        instr: &Instruction,
        w: ValType,
        val: Val,
        out: &AluOut,
    ) -> Result<bool> {
        match &instr.dst {
            Operand::Mem(mem) => {
                let stored = self.write_mem(tr, mem, w, val)?;
                if !stored && self.capturing() {
                    self.emit_rewritten(tr, instr, Role::DstReadWrite)?;
                    tr.state.set_flags(out.flags, out.written, Taint::Dynamic);
                    return Ok(false);
                }
                if !stored && !self.capturing() {
                    return Err(RewriteError::Unsupported {
                        addr: instr.addr,
                        kind: instr.kind,
                    });
                }
                Ok(true)
            }
            dst => {
                self.write_op(tr, dst, w, val)?;
                Ok(true)
            }
        }
    }

    fn step_alu1(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        let w = instr.vtype;
        // bsf is reg, r/m; the unary group operates on its only operand.
        let a = if instr.kind == InstrKind::Bsf {
            self.read_op(tr, &instr.src, w)?
        } else {
            self.read_op(tr, &instr.dst, w)?
        };
        let out = alu::eval1(instr.kind, w, a.v);
        let res_taint = if a.t == Taint::StackRel
            && matches!(instr.kind, InstrKind::Inc | InstrKind::Dec)
        {
            Taint::StackRel
        } else if a.t == Taint::StackRel {
            Taint::Dynamic
        } else {
            a.t
        };
        let flg_taint = match a.t {
            Taint::Static => Taint::Static,
            Taint::StackRel => Taint::StackRel,
            Taint::Dynamic => Taint::Dynamic,
        };
        let forced = self.capturing() && Self::frame_dst(&instr.dst);

        if self.capturing() && (res_taint.is_dynamic() || forced) {
            self.emit_rewritten(tr, instr, Role::DstReadWrite)?;
            if instr.kind != InstrKind::Bsf {
                let taint = if forced && !res_taint.is_dynamic() {
                    res_taint
                } else {
                    Taint::Dynamic
                };
                self.write_op(tr, &instr.dst, w, Val::new(out.value, taint))?;
            } else {
                self.write_op(tr, &instr.dst, w, Val::new(out.value, Taint::Dynamic))?;
            }
            tr.state.set_flags(out.flags, out.written, Taint::Dynamic);
            return Ok(StepFlow::Continue);
        }

        if instr.kind == InstrKind::Bsf && a.v & w.mask() == 0 {
            // Destination is architecturally undefined; leave it alone.
        } else {
            self.write_op(tr, &instr.dst, w, Val::new(out.value, res_taint))?;
        }
        tr.state.set_flags(out.flags, out.written, flg_taint);
        Ok(StepFlow::Continue)
    }

    fn step_mov(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        let w = instr.vtype;
        let val = match instr.kind {
            InstrKind::Lea => {
                let mem = instr.src.as_mem().expect("lea takes a memory source");
                let a = self.addr_of(&tr.state, mem);
                Val::new(a.v & w.mask(), a.t)
            }
            InstrKind::Movsx | InstrKind::Movzx => {
                let src_w = instr.src.width(ValType::I8);
                let s = self.read_op(tr, &instr.src, src_w)?;
                let v = if instr.kind == InstrKind::Movsx {
                    (src_w.sign_extend(s.v) as u64) & w.mask()
                } else {
                    s.v & src_w.mask()
                };
                // Extension destroys the pointer shape.
                let t = if s.t == Taint::StackRel { Taint::Dynamic } else { s.t };
                Val::new(v, t)
            }
            _ => self.read_op(tr, &instr.src, w)?,
        };

        let forced = self.capturing() && Self::frame_dst(&instr.dst);
        if self.capturing() && (val.t.is_dynamic() || forced) {
            self.emit_rewritten(tr, instr, Role::DstWrite)?;
            let taint = if forced && !val.t.is_dynamic() {
                val.t
            } else {
                Taint::Dynamic
            };
            self.write_op(tr, &instr.dst, w, Val::new(val.v, taint))?;
            return Ok(StepFlow::Continue);
        }

        if let Operand::Mem(mem) = &instr.dst {
            let stored = self.write_mem(tr, mem, w, val)?;
            if !stored {
                if self.capturing() {
                    self.emit_rewritten(tr, instr, Role::DstWrite)?;
                } else {
                    return Err(RewriteError::Unsupported {
                        addr: instr.addr,
                        kind: instr.kind,
                    });
                }
            }
            return Ok(StepFlow::Continue);
        }
        self.write_op(tr, &instr.dst, w, val)?;
        Ok(StepFlow::Continue)
    }

    fn step_muldiv(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        let w = instr.vtype;
        let src = self.read_op(tr, &instr.dst, w)?;
        let rax = Self::read_reg(&tr.state, respin_asm::Reg::gp(w, reg::RAX));
        let rdx = Self::read_reg(&tr.state, respin_asm::Reg::gp(w, reg::RDX));

        let divides = matches!(instr.kind, InstrKind::Div | InstrKind::Idiv);
        let mut taint = src.t.union(rax.t);
        if divides {
            taint = taint.union(rdx.t);
        }
        if taint == Taint::StackRel {
            taint = Taint::Dynamic;
        }
        let fold = taint.is_static() && !(divides && src.v & w.mask() == 0);

        if !fold {
            if !self.capturing() {
                // Interpreting a division by zero cannot proceed.
                return Err(RewriteError::Unsupported {
                    addr: instr.addr,
                    kind: instr.kind,
                });
            }
            self.materialize_reg(tr, respin_asm::Reg::gp64(reg::RAX))?;
            if divides {
                self.materialize_reg(tr, respin_asm::Reg::gp64(reg::RDX))?;
            }
            self.emit_rewritten(tr, instr, Role::DstReadWrite)?;
            self.dirty[reg::RAX as usize] = true;
            self.dirty[reg::RDX as usize] = true;
            let dyn64 = Val::new(0, Taint::Dynamic);
            Self::write_reg(&mut tr.state, respin_asm::Reg::gp64(reg::RAX), dyn64);
            Self::write_reg(&mut tr.state, respin_asm::Reg::gp64(reg::RDX), dyn64);
            tr.state.set_flags(Flags::empty(), Flags::all(), Taint::Dynamic);
            return Ok(StepFlow::Continue);
        }

        let mask = w.mask();
        let (lo, hi, flags, written) = match instr.kind {
            InstrKind::Mul => {
                let wide = (rax.v & mask) as u128 * (src.v & mask) as u128;
                let hi = ((wide >> w.bits()) as u64) & mask;
                let mut f = Flags::empty();
                if hi != 0 {
                    f |= Flags::CF | Flags::OF;
                }
                ((wide as u64) & mask, hi, f, Flags::CF | Flags::OF)
            }
            InstrKind::Imul => {
                let wide = (w.sign_extend(rax.v) as i128) * (w.sign_extend(src.v) as i128);
                let lo = (wide as u64) & mask;
                let hi = ((wide >> w.bits()) as u64) & mask;
                let mut f = Flags::empty();
                if wide != w.sign_extend(lo) as i128 {
                    f |= Flags::CF | Flags::OF;
                }
                (lo, hi, f, Flags::CF | Flags::OF)
            }
            InstrKind::Div => {
                let dividend = ((rdx.v & mask) as u128) << w.bits() | (rax.v & mask) as u128;
                let d = (src.v & mask) as u128;
                let (q, r) = (dividend / d, dividend % d);
                if q > mask as u128 {
                    return Err(RewriteError::Unsupported {
                        addr: instr.addr,
                        kind: instr.kind,
                    });
                }
                (q as u64, r as u64, Flags::empty(), Flags::empty())
            }
            _ => {
                let dividend = ((w.sign_extend(rdx.v) as i128) << w.bits())
                    | (rax.v & mask) as i128;
                let d = w.sign_extend(src.v) as i128;
                // Quotient overflow would fault at run time; refuse to
                // fold it away.
                let (q, r) = match (dividend.checked_div(d), dividend.checked_rem(d)) {
                    (Some(q), Some(r)) if q == w.sign_extend((q as u64) & mask) as i128 => (q, r),
                    _ => {
                        return Err(RewriteError::Unsupported {
                            addr: instr.addr,
                            kind: instr.kind,
                        })
                    }
                };
                ((q as u64) & mask, (r as u64) & mask, Flags::empty(), Flags::empty())
            }
        };

        self.write_op(
            tr,
            &Operand::reg(respin_asm::Reg::gp(w, reg::RAX)),
            w,
            Val::new(lo, Taint::Static),
        )?;
        self.write_op(
            tr,
            &Operand::reg(respin_asm::Reg::gp(w, reg::RDX)),
            w,
            Val::new(hi, Taint::Static),
        )?;
        tr.state.set_flags(flags, written, Taint::Static);
        Ok(StepFlow::Continue)
    }

    fn step_extend(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        let w = instr.vtype;
        let rax = Self::read_reg(&tr.state, respin_asm::Reg::gp(w, reg::RAX));
        let taint = if rax.t == Taint::StackRel { Taint::Dynamic } else { rax.t };

        if self.capturing() && taint.is_dynamic() {
            self.emit(tr, *instr)?;
            self.dirty[reg::RAX as usize] = true;
            self.dirty[reg::RDX as usize] = true;
            if instr.kind == InstrKind::Cdqe {
                Self::write_reg(
                    &mut tr.state,
                    respin_asm::Reg::gp64(reg::RAX),
                    Val::new(0, Taint::Dynamic),
                );
            } else {
                Self::write_reg(
                    &mut tr.state,
                    respin_asm::Reg::gp64(reg::RDX),
                    Val::new(0, Taint::Dynamic),
                );
            }
            return Ok(StepFlow::Continue);
        }

        match instr.kind {
            InstrKind::Cdqe => {
                // Sign-extend the low half into the full register.
                let half = ValType::from_bytes(w.bytes() / 2);
                let v = (half.sign_extend(rax.v) as u64) & w.mask();
                self.write_op(
                    tr,
                    &Operand::reg(respin_asm::Reg::gp(w, reg::RAX)),
                    w,
                    Val::new(v, taint),
                )?;
            }
            _ => {
                let sign = if w.sign_extend(rax.v) < 0 { w.mask() } else { 0 };
                self.write_op(
                    tr,
                    &Operand::reg(respin_asm::Reg::gp(w, reg::RDX)),
                    w,
                    Val::new(sign, taint),
                )?;
            }
        }
        Ok(StepFlow::Continue)
    }

    fn step_cmov(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        let cond = instr.cond.expect("cmov carries a condition");
        let w = instr.vtype;
        let flag_taint = if self.capturing() {
            self.consumed_flag_taint(tr, instr, cond.flags_read())?
        } else {
            Taint::Static
        };

        if flag_taint.is_static() {
            if cond.eval(tr.state.flags) {
                // Reduced to a plain move of the source.
                let mov = Instruction::binary(instr.addr, InstrKind::Mov, w, instr.dst, instr.src);
                return self.step_mov(tr, &mov);
            }
            return Ok(StepFlow::Continue);
        }

        // The destination keeps its value when the condition fails, so it
        // is an input as well.
        self.emit_rewritten(tr, instr, Role::DstReadWrite)?;
        let val = if cond.eval(tr.state.flags) {
            self.read_op(tr, &instr.src, w)?
        } else {
            self.read_op(tr, &instr.dst, w)?
        };
        self.write_op(tr, &instr.dst, w, Val::new(val.v, Taint::Dynamic))?;
        Ok(StepFlow::Continue)
    }

    fn step_setcc(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        let cond = instr.cond.expect("setcc carries a condition");
        let flag_taint = if self.capturing() {
            self.consumed_flag_taint(tr, instr, cond.flags_read())?
        } else {
            Taint::Static
        };
        let v = u64::from(cond.eval(tr.state.flags));

        if flag_taint.is_static() {
            if let Operand::Mem(mem) = &instr.dst {
                let stored = self.write_mem(tr, mem, ValType::I8, Val::fixed(v))?;
                if !stored && self.capturing() {
                    let mov = Instruction::binary(
                        instr.addr,
                        InstrKind::Mov,
                        ValType::I8,
                        instr.dst,
                        Operand::imm(ValType::I8, v as i64),
                    );
                    self.emit_rewritten(tr, &mov, Role::DstWrite)?;
                }
                return Ok(StepFlow::Continue);
            }
            self.write_op(tr, &instr.dst, ValType::I8, Val::fixed(v))?;
            return Ok(StepFlow::Continue);
        }

        self.emit_rewritten(tr, instr, Role::DstWrite)?;
        self.write_op(tr, &instr.dst, ValType::I8, Val::new(v, Taint::Dynamic))?;
        Ok(StepFlow::Continue)
    }
}
