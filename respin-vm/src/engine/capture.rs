//! Residual emission: operand rewriting and value materialization.

use super::{Engine, Trace};
use crate::error::{Result, RewriteError};
use crate::state::{EmuState, Taint};

use respin_asm::{
    reg, Instruction, InstrKind, OpcodeMap, Operand, Passthrough, PtEncoding, Reg, RegKind,
    ValType,
};

use tracing::trace;

/// How an operand participates in a residual instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Pure source; a statically-known register may fold to an immediate.
    Src,
    /// Destination that is only written (mov-like).
    DstWrite,
    /// Destination that is read and written (ALU).
    DstReadWrite,
}

impl Engine<'_> {
    /// Append `instr` to the current captured block.
    pub(crate) fn emit(&mut self, tr: &mut Trace, instr: Instruction) -> Result<()> {
        let cbb = tr.cbb.expect("emission requires a captured block");
        if self.rw.captured_instrs >= self.rw.config.caps.capture_instrs {
            return Err(RewriteError::CapturedInstrCapacity(
                self.rw.config.caps.capture_instrs,
            ));
        }
        if self.rw.config.verbose_steps {
            trace!(residual = %instr, "capture");
        }
        if let Operand::Reg(r) = instr.dst {
            if r.is_gp() {
                self.dirty[r.index() as usize] = true;
            }
        }
        self.rw.captured_instrs += 1;
        self.rw.cbbs[cbb.0].instrs.push(instr);
        Ok(())
    }

    /// A caller-saved register that residual code does not depend on,
    /// usable for materializing constants. `r10`/`r11` are never argument
    /// registers; their pre-write contents are junk the original code
    /// cannot legitimately read.
    pub(crate) fn pick_scratch(&self) -> Option<u8> {
        [11u8, 10].into_iter().find(|c| !self.dirty[*c as usize])
    }

    /// True when `r`'s runtime value is guaranteed to match the abstract
    /// state, making it usable in residual code as-is. Dynamic registers
    /// are produced by residual code; the stack registers are kept in
    /// lock-step by force-capturing every write to them.
    fn reg_is_live(state: &EmuState, r: Reg) -> bool {
        if r.is_vec() {
            return state.xmm_taint[r.index() as usize].is_dynamic();
        }
        state.reg_taint[r.index() as usize].is_dynamic()
            || matches!(r.index(), reg::RSP | reg::RBP)
    }

    /// Emit code bringing register `r`'s runtime value in line with the
    /// abstract state, and mark it Dynamic (it is now live in code).
    pub(crate) fn materialize_reg(&mut self, tr: &mut Trace, r: Reg) -> Result<()> {
        if r.is_vec() {
            return self.materialize_xmm(tr, r);
        }
        let i = r.index() as usize;
        let v = tr.state.regs[i];
        match tr.state.reg_taint[i] {
            Taint::Dynamic => {}
            Taint::Static => {
                let imm = if i32::try_from(v as i64).is_ok() {
                    Operand::imm(ValType::I32, v as i64)
                } else {
                    Operand::imm64(v)
                };
                self.emit(
                    tr,
                    Instruction::binary(
                        0,
                        InstrKind::Mov,
                        ValType::I64,
                        Operand::reg(Reg::gp64(r.index())),
                        imm,
                    ),
                )?;
                tr.state.reg_taint[i] = Taint::Dynamic;
            }
            Taint::StackRel => {
                // The runtime stack lives elsewhere; rebuild the value
                // from the (synchronized) stack pointer.
                let delta = v.wrapping_sub(tr.state.regs[reg::RSP as usize]) as i64;
                let mem = respin_asm::MemRef::base_disp(ValType::I64, Reg::gp64(reg::RSP), delta);
                self.emit(
                    tr,
                    Instruction::binary(
                        0,
                        InstrKind::Lea,
                        ValType::I64,
                        Operand::reg(Reg::gp64(r.index())),
                        Operand::mem(mem),
                    ),
                )?;
                self.stack_escaped = true;
                tr.state.reg_taint[i] = Taint::Dynamic;
            }
        }
        Ok(())
    }

    /// Materialize a statically-known vector register through a scratch
    /// GPR (`movabs scratch, bits; movq xmm, scratch`).
    fn materialize_xmm(&mut self, tr: &mut Trace, r: Reg) -> Result<()> {
        let i = r.index() as usize;
        if tr.state.xmm_taint[i].is_dynamic() {
            return Ok(());
        }
        if tr.state.xmm[i][1] != 0 {
            // No cheap way to rebuild a full 128-bit constant.
            return Err(RewriteError::Unsupported {
                addr: 0,
                kind: InstrKind::Movdqa,
            });
        }
        let scratch = self.pick_scratch().ok_or(RewriteError::Unsupported {
            addr: 0,
            kind: InstrKind::Movq,
        })?;
        let bits = tr.state.xmm[i][0];
        self.emit(
            tr,
            Instruction::binary(
                0,
                InstrKind::Mov,
                ValType::I64,
                Operand::reg(Reg::gp64(scratch)),
                Operand::imm64(bits),
            ),
        )?;
        tr.state.regs[scratch as usize] = bits;
        tr.state.reg_taint[scratch as usize] = Taint::Dynamic;
        let mut movq = Instruction::binary(
            0,
            InstrKind::Movq,
            ValType::I64,
            Operand::reg(Reg::xmm(r.index())),
            Operand::reg(Reg::gp64(scratch)),
        );
        movq.passthrough = Some(Passthrough {
            prefix: Some(0x66),
            map: OpcodeMap::Two,
            opcode: 0x6e,
            enc: PtEncoding::Rm,
            rex_w: true,
        });
        self.emit(tr, movq)?;
        // The pair consumed the scratch; nothing later depends on it.
        self.dirty[scratch as usize] = false;
        tr.state.xmm_taint[i] = Taint::Dynamic;
        Ok(())
    }

    /// Before residual code reads a stack range whose bytes are partly
    /// known, store the known bytes so the runtime slot holds them.
    /// Folded spills leave the runtime slot untouched; a dynamic reload
    /// would otherwise observe garbage where the static bytes belong.
    pub(crate) fn materialize_stack_bytes(
        &mut self,
        tr: &mut Trace,
        addr: u64,
        len: usize,
    ) -> Result<()> {
        if !self.capturing() || tr.cbb.is_none() {
            return Ok(());
        }
        let Some(base_off) = EmuState::stack_offset(addr) else {
            return Ok(());
        };
        let mut o = 0usize;
        while o < len {
            match tr.state.stack_byte(base_off + o).1 {
                Taint::Dynamic => {
                    o += 1;
                    continue;
                }
                Taint::StackRel => {
                    // A pointer byte cannot be rebuilt piecemeal.
                    return Err(RewriteError::Unsupported {
                        addr,
                        kind: InstrKind::Mov,
                    });
                }
                Taint::Static => {}
            }
            let run_start = o;
            while o < len && tr.state.stack_byte(base_off + o).1 == Taint::Static {
                o += 1;
            }
            let mut p = run_start;
            while p < o {
                let chunk = if o - p >= 4 { 4 } else { 1 };
                let mut value = 0u64;
                for (bi, b) in (p..p + chunk).enumerate() {
                    value |= (tr.state.stack_byte(base_off + b).0 as u64) << (8 * bi);
                }
                let disp = (crate::state::EMU_STACK_BASE + (base_off + p) as u64)
                    .wrapping_sub(tr.state.regs[reg::RSP as usize])
                    as i64;
                let width = if chunk == 4 { ValType::I32 } else { ValType::I8 };
                let mem = respin_asm::MemRef::base_disp(width, Reg::gp64(reg::RSP), disp);
                self.emit(
                    tr,
                    Instruction::binary(
                        0,
                        InstrKind::Mov,
                        width,
                        Operand::mem(mem),
                        Operand::imm(width, width.sign_extend(value)),
                    ),
                )?;
                for b in p..p + chunk {
                    tr.state.set_stack_taint(base_off + b, Taint::Dynamic);
                }
                p += chunk;
            }
        }
        Ok(())
    }

    /// Rewrite one operand of a residual instruction in place.
    pub(super) fn prepare_operand(
        &mut self,
        tr: &mut Trace,
        op: &mut Operand,
        role: Role,
        instr: &Instruction,
    ) -> Result<()> {
        match *op {
            Operand::None | Operand::Imm { .. } => Ok(()),
            Operand::Reg(r) => {
                if role == Role::Src && !Self::reg_is_live(&tr.state, r) {
                    // Fold a known scalar source straight into the
                    // instruction when the encoding allows it.
                    if r.is_gp() && tr.state.reg_taint[r.index() as usize].is_static() {
                        let val = Self::read_reg(&tr.state, r);
                        if let Some(imm) = foldable_imm(instr, val.v, r.vtype()) {
                            *op = imm;
                            return Ok(());
                        }
                    }
                    self.materialize_reg(tr, r)?;
                } else if role == Role::DstReadWrite && !Self::reg_is_live(&tr.state, r) {
                    self.materialize_reg(tr, r)?;
                }
                Ok(())
            }
            Operand::Mem(ref mem) => {
                let mut mem = *mem;
                if mem.is_rip_relative() {
                    // The displacement already holds the absolute target;
                    // the generated code lives elsewhere, so drop the
                    // rip base and address absolutely.
                    mem.base = None;
                }
                // Collapse statically-known address registers into the
                // displacement; keep live registers; materialize the rest.
                if let Some(base) = mem.base {
                    let i = base.index() as usize;
                    if tr.state.reg_taint[i].is_static() {
                        let folded = mem.disp.wrapping_add(tr.state.regs[i] as i64);
                        if i32::try_from(folded).is_ok() {
                            mem.disp = folded;
                            mem.base = None;
                        } else {
                            self.materialize_reg(tr, base)?;
                        }
                    } else if !Self::reg_is_live(&tr.state, base) {
                        self.materialize_reg(tr, base)?;
                    } else if matches!(base.index(), reg::RSP | reg::RBP)
                        && tr.state.reg_taint[i] == Taint::StackRel
                    {
                        // Frame access through a synchronized register;
                        // the displacement is valid as-is.
                    }
                }
                if let Some(index) = mem.index {
                    let i = index.index() as usize;
                    if tr.state.reg_taint[i].is_static() {
                        let folded = mem
                            .disp
                            .wrapping_add((tr.state.regs[i] as i64).wrapping_mul(mem.scale as i64));
                        mem.disp = folded;
                        mem.index = None;
                        mem.scale = 0;
                    } else if !Self::reg_is_live(&tr.state, index) {
                        self.materialize_reg(tr, index)?;
                    }
                }
                // A folded-away base can leave an absolute address that
                // no longer fits disp32; rebuild through a register.
                if mem.base.is_none() && mem.index.is_none() && i32::try_from(mem.disp).is_err() {
                    let scratch = self.pick_scratch().ok_or(RewriteError::Unsupported {
                        addr: instr.addr,
                        kind: instr.kind,
                    })?;
                    self.emit(
                        tr,
                        Instruction::binary(
                            0,
                            InstrKind::Mov,
                            ValType::I64,
                            Operand::reg(Reg::gp64(scratch)),
                            Operand::imm64(mem.disp as u64),
                        ),
                    )?;
                    tr.state.regs[scratch as usize] = mem.disp as u64;
                    tr.state.reg_taint[scratch as usize] = Taint::Dynamic;
                    self.scratch_release.push(scratch);
                    mem.base = Some(Reg::gp64(scratch));
                    mem.disp = 0;
                }
                if mem
                    .base
                    .is_some_and(|b| tr.state.reg_taint[b.index() as usize] == Taint::StackRel)
                    && !matches!(mem.base.unwrap().index(), reg::RSP | reg::RBP)
                {
                    self.stack_escaped = true;
                }
                *op = Operand::mem(mem);
                Ok(())
            }
        }
    }

    /// Emit `instr` residually with its operands rewritten against the
    /// current state. Roles describe how each operand slot participates.
    pub(crate) fn emit_rewritten(
        &mut self,
        tr: &mut Trace,
        instr: &Instruction,
        dst_role: Role,
    ) -> Result<Instruction> {
        let mut res = *instr;
        self.prepare_operand(tr, &mut res.dst, dst_role, instr)?;
        self.prepare_operand(tr, &mut res.src, Role::Src, instr)?;
        self.prepare_operand(tr, &mut res.src2, Role::Src, instr)?;
        self.emit(tr, res)?;
        while let Some(r) = self.scratch_release.pop() {
            self.dirty[r as usize] = false;
        }
        Ok(res)
    }
}

impl Engine<'_> {
    /// Instructions that bring the runtime machine state in line with a
    /// widened successor's entry state: every value the successor treats
    /// as Dynamic but the current path still knows statically must be
    /// placed into its register, flag or stack slot on this edge.
    pub(crate) fn edge_fixups(
        &mut self,
        cur: &EmuState,
        target: crate::block::CbbId,
    ) -> Result<Vec<Instruction>> {
        let entry = self.entry_states[&target.0].clone();
        let mut out = Vec::new();

        let mov64 = |r: u8, v: u64| {
            let imm = if i32::try_from(v as i64).is_ok() {
                Operand::imm(ValType::I32, v as i64)
            } else {
                Operand::imm64(v)
            };
            Instruction::binary(0, InstrKind::Mov, ValType::I64, Operand::reg(Reg::gp64(r)), imm)
        };

        for i in 0..16u8 {
            let (et, ct) = (entry.reg_taint[i as usize], cur.reg_taint[i as usize]);
            if !et.is_dynamic() || ct.is_dynamic() {
                continue;
            }
            match ct {
                Taint::Static => out.push(mov64(i, cur.regs[i as usize])),
                Taint::StackRel => {
                    let delta = cur.regs[i as usize]
                        .wrapping_sub(cur.regs[reg::RSP as usize]) as i64;
                    let mem =
                        respin_asm::MemRef::base_disp(ValType::I64, Reg::gp64(reg::RSP), delta);
                    out.push(Instruction::binary(
                        0,
                        InstrKind::Lea,
                        ValType::I64,
                        Operand::reg(Reg::gp64(i)),
                        Operand::mem(mem),
                    ));
                    self.stack_escaped = true;
                }
                Taint::Dynamic => unreachable!(),
            }
        }

        for i in 0..16u8 {
            let (et, ct) = (entry.xmm_taint[i as usize], cur.xmm_taint[i as usize]);
            if !et.is_dynamic() || ct.is_dynamic() {
                continue;
            }
            if cur.xmm[i as usize][1] != 0 {
                return Err(RewriteError::Unsupported {
                    addr: 0,
                    kind: InstrKind::Movdqa,
                });
            }
            // Clobbering a scratch register is safe when the successor
            // does not rely on its runtime value.
            let scratch = [11u8, 10, 9, 8]
                .into_iter()
                .find(|c| !entry.reg_taint[*c as usize].is_dynamic())
                .ok_or(RewriteError::Unsupported {
                    addr: 0,
                    kind: InstrKind::Movq,
                })?;
            out.push(mov64(scratch, cur.xmm[i as usize][0]));
            let mut movq = Instruction::binary(
                0,
                InstrKind::Movq,
                ValType::I64,
                Operand::reg(Reg::xmm(i)),
                Operand::reg(Reg::gp64(scratch)),
            );
            movq.passthrough = Some(Passthrough {
                prefix: Some(0x66),
                map: OpcodeMap::Two,
                opcode: 0x6e,
                enc: PtEncoding::Rm,
                rex_w: true,
            });
            out.push(movq);
        }

        for (i, f) in respin_asm::Flags::EACH.iter().enumerate() {
            if !entry.flag_taint[i].is_dynamic() || cur.flag_taint[i].is_dynamic() {
                continue;
            }
            if *f == respin_asm::Flags::CF && cur.flag_taint[i].is_static() {
                let kind = if cur.flags.contains(*f) {
                    InstrKind::Stc
                } else {
                    InstrKind::Clc
                };
                out.push(Instruction::nullary(0, kind));
            } else {
                // Only a statically-known carry can be rebuilt.
                return Err(RewriteError::FlagMaterialization {
                    addr: 0,
                    kind: InstrKind::Jcc,
                });
            }
        }

        // Stack bytes the successor reloads dynamically must hold their
        // current values at run time.
        let low = entry.stack_low.min(cur.stack_low);
        let high = entry.stack_high.max(cur.stack_high);
        let mut off = low;
        while off < high {
            let needs = |o: usize| {
                o < high
                    && entry.stack_byte(o).1.is_dynamic()
                    && !cur.stack_byte(o).1.is_dynamic()
            };
            if !needs(off) {
                off += 1;
                continue;
            }
            let run_start = off;
            while needs(off) {
                off += 1;
            }
            let mut o = run_start;
            while o < off {
                let chunk = (off - o).min(4);
                let chunk = if chunk >= 4 { 4 } else { 1 };
                let mut value = 0u64;
                for (bi, b) in (o..o + chunk).enumerate() {
                    value |= (cur.stack_byte(b).0 as u64) << (bi * 8);
                }
                let disp = (crate::state::EMU_STACK_BASE + o as u64)
                    .wrapping_sub(cur.regs[reg::RSP as usize]) as i64;
                let width = if chunk == 4 { ValType::I32 } else { ValType::I8 };
                let mem = respin_asm::MemRef::base_disp(width, Reg::gp64(reg::RSP), disp);
                out.push(Instruction::binary(
                    0,
                    InstrKind::Mov,
                    width,
                    Operand::mem(mem),
                    Operand::imm(width, width.sign_extend(value)),
                ));
                o += chunk;
            }
        }

        Ok(out)
    }
}

/// The immediate operand `value` folds to in the `src` slot of `instr`,
/// if the target encoding can carry it.
fn foldable_imm(instr: &Instruction, value: u64, width: ValType) -> Option<Operand> {
    let signed = width.sign_extend(value);
    match instr.kind {
        // mov r64 accepts a full 64-bit immediate; every other form is
        // limited to a sign-extended imm32.
        InstrKind::Mov => {
            if matches!(instr.dst, Operand::Reg(r) if r.kind() == RegKind::Gp64) {
                Some(Operand::imm64(value))
            } else if i32::try_from(signed).is_ok() {
                Some(Operand::imm(ValType::I32, signed))
            } else {
                None
            }
        }
        InstrKind::Add
        | InstrKind::Adc
        | InstrKind::Sub
        | InstrKind::Sbb
        | InstrKind::And
        | InstrKind::Or
        | InstrKind::Xor
        | InstrKind::Cmp
        | InstrKind::Test
        | InstrKind::Imul => i32::try_from(signed)
            .ok()
            .map(|v| Operand::imm(ValType::I32, v as i64)),
        InstrKind::Shl | InstrKind::Shr | InstrKind::Sar => {
            Some(Operand::imm(ValType::I8, signed & 0x3f))
        }
        InstrKind::Push => i32::try_from(signed)
            .ok()
            .map(|v| Operand::imm(ValType::I32, v as i64)),
        _ => None,
    }
}
