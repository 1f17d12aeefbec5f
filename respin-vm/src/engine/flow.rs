//! Control flow: branches, calls, returns, and the stack group.

use super::capture::Role;
use super::{EndKind, Engine, StepFlow, Trace, Val};
use crate::error::{Result, RewriteError};
use crate::marker;
use crate::state::Taint;

use respin_asm::{reg, Instruction, InstrKind, Operand, Reg, ValType};

use tracing::trace;

impl Engine<'_> {
    pub(crate) fn step_flow(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        match instr.kind {
            InstrKind::Jmp => {
                let target = instr.dst.as_imm().expect("decoded jmp target") as u64;
                Ok(StepFlow::Goto(target))
            }

            InstrKind::Jcc => self.step_jcc(tr, instr),

            InstrKind::JmpInd => {
                let v = self.read_op(tr, &instr.dst, ValType::I64)?;
                match v.t {
                    Taint::Static => Ok(StepFlow::Goto(v.v)),
                    Taint::StackRel => Err(RewriteError::Unsupported {
                        addr: instr.addr,
                        kind: instr.kind,
                    }),
                    Taint::Dynamic => {
                        if !self.capturing() {
                            return Err(RewriteError::Unsupported {
                                addr: instr.addr,
                                kind: instr.kind,
                            });
                        }
                        self.emit_rewritten(tr, instr, Role::DstReadWrite)?;
                        Ok(StepFlow::End(EndKind::Indirect))
                    }
                }
            }

            InstrKind::Call => {
                let target = instr.dst.as_imm().expect("decoded call target") as u64;
                self.step_call(tr, instr, target)
            }

            InstrKind::CallInd => {
                let v = self.read_op(tr, &instr.dst, ValType::I64)?;
                match v.t {
                    // A known target turns the indirect call into a
                    // direct one.
                    Taint::Static => self.step_call(tr, instr, v.v),
                    Taint::StackRel => Err(RewriteError::Unsupported {
                        addr: instr.addr,
                        kind: instr.kind,
                    }),
                    Taint::Dynamic => {
                        if !self.capturing() {
                            return Err(RewriteError::Unsupported {
                                addr: instr.addr,
                                kind: instr.kind,
                            });
                        }
                        self.emit_rewritten(tr, instr, Role::DstReadWrite)?;
                        self.clobber_caller_saved(tr);
                        // A call terminates the decoded block; the trace
                        // resumes at the return address.
                        Ok(StepFlow::Goto(instr.end()))
                    }
                }
            }

            InstrKind::Ret => self.step_ret(tr),

            _ => unreachable!("step_flow on {}", instr.kind),
        }
    }

    fn step_jcc(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        let cond = instr.cond.expect("jcc carries a condition");
        let taken_addr = instr.dst.as_imm().expect("decoded jcc target") as u64;
        let taint = if self.capturing() {
            self.consumed_flag_taint(tr, instr, cond.flags_read())?
        } else {
            Taint::Static
        };

        if taint.is_static() {
            let taken = cond.eval(tr.state.flags);
            if self.rw.config.verbose_steps {
                trace!(cond = %cond, taken, "static branch");
            }
            return Ok(StepFlow::Goto(if taken { taken_addr } else { instr.end() }));
        }

        Ok(StepFlow::End(EndKind::Fork {
            cond,
            taken: taken_addr,
            fallthrough: instr.end(),
        }))
    }

    fn step_call(&mut self, tr: &mut Trace, instr: &Instruction, target: u64) -> Result<StepFlow> {
        // Marker intrinsics are identity at run time; during capture
        // they steer taint instead of surviving as calls.
        if target == marker::make_static_addr() {
            let v = Self::read_reg(&tr.state, Reg::gp64(reg::RDI));
            Self::write_reg(&mut tr.state, Reg::gp64(reg::RAX), Val::new(v.v, Taint::Static));
            return Ok(StepFlow::Goto(instr.end()));
        }
        if target == marker::make_dynamic_addr() {
            let v = Self::read_reg(&tr.state, Reg::gp64(reg::RDI));
            if !self.capturing() {
                Self::write_reg(&mut tr.state, Reg::gp64(reg::RAX), Val::new(v.v, Taint::Static));
                return Ok(StepFlow::Goto(instr.end()));
            }
            // The result must actually be in rax at run time before it
            // can be treated as dynamic; lower the call to a move.
            let mov = Instruction::binary(
                instr.addr,
                InstrKind::Mov,
                ValType::I64,
                Operand::reg(Reg::gp64(reg::RAX)),
                Operand::reg(Reg::gp64(reg::RDI)),
            );
            self.emit_rewritten(tr, &mov, Role::DstWrite)?;
            Self::write_reg(&mut tr.state, Reg::gp64(reg::RAX), Val::new(v.v, Taint::Dynamic));
            return Ok(StepFlow::Goto(instr.end()));
        }

        // A substituted helper is emulated inline in the caller's trace.
        if let Some(replacement) = self.rw.subst.get(&target).copied() {
            if self.rw.config.verbose_steps {
                trace!(
                    from = format_args!("{target:#x}"),
                    to = format_args!("{replacement:#x}"),
                    "call substituted"
                );
            }
            tr.call_stack.push(instr.end());
            return Ok(StepFlow::Goto(replacement));
        }

        if !self.capturing() {
            // The plain interpreter cannot execute foreign code.
            return Err(RewriteError::Unsupported {
                addr: instr.addr,
                kind: instr.kind,
            });
        }

        // Everything else survives as a real call to the resolved target
        // (an indirect call through a known register becomes direct);
        // whatever the callee clobbers is unknown afterwards.
        let call = Instruction::unary(
            instr.addr,
            InstrKind::Call,
            ValType::None,
            Operand::imm64(target),
        );
        self.emit(tr, call)?;
        self.clobber_caller_saved(tr);
        Ok(StepFlow::Goto(instr.end()))
    }

    fn step_ret(&mut self, tr: &mut Trace) -> Result<StepFlow> {
        if let Some(continuation) = tr.call_stack.pop() {
            // Returning from an inlined substituted call.
            return Ok(StepFlow::Goto(continuation));
        }
        if self.capturing() {
            // The caller reads the return register; its runtime value
            // must match the abstract one.
            let ret_reg = if self.rw.config.returns_fp {
                Reg::xmm(0)
            } else {
                Reg::gp64(reg::RAX)
            };
            self.materialize_reg(tr, ret_reg)?;
        }
        Ok(StepFlow::End(EndKind::Ret))
    }

    /// After an un-inlined call nothing caller-saved can be trusted, and
    /// nothing residual depends on the junk left in those registers.
    pub(crate) fn clobber_caller_saved(&mut self, tr: &mut Trace) {
        for r in reg::SYSV_CALLER_SAVED {
            tr.state.reg_taint[r as usize] = Taint::Dynamic;
            self.dirty[r as usize] = false;
        }
        for t in tr.state.xmm_taint.iter_mut() {
            *t = Taint::Dynamic;
        }
        tr.state
            .set_flags(respin_asm::Flags::empty(), respin_asm::Flags::all(), Taint::Dynamic);
    }

    pub(crate) fn step_stack(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<StepFlow> {
        match instr.kind {
            InstrKind::Push => {
                let val = self.read_op(tr, &instr.dst, ValType::I64)?;
                if self.capturing() {
                    self.emit_rewritten_push(tr, instr)?;
                }
                let sp = tr.state.regs[reg::RSP as usize].wrapping_sub(8);
                tr.state.regs[reg::RSP as usize] = sp;
                tr.state.write_stack(sp, 8, val.v, val.t)?;
            }
            InstrKind::Pop => {
                let sp = tr.state.regs[reg::RSP as usize];
                if self.capturing() {
                    // The runtime pop reads the slot; known bytes from a
                    // folded store must be there first.
                    let (_, t) = tr.state.read_stack(sp, 8)?;
                    if t.is_dynamic() {
                        self.materialize_stack_bytes(tr, sp, 8)?;
                    }
                    self.emit_rewritten(tr, instr, Role::DstWrite)?;
                }
                let (v, t) = tr.state.read_stack(sp, 8)?;
                tr.state.regs[reg::RSP as usize] = sp.wrapping_add(8);
                self.write_op(tr, &instr.dst, ValType::I64, Val::new(v, t))?;
            }
            InstrKind::Leave => {
                if self.capturing() {
                    self.emit(tr, *instr)?;
                }
                let rbp = tr.state.regs[reg::RBP as usize];
                let rbp_t = tr.state.reg_taint[reg::RBP as usize];
                if rbp_t != Taint::StackRel {
                    return Err(RewriteError::Unsupported {
                        addr: instr.addr,
                        kind: instr.kind,
                    });
                }
                let (v, t) = tr.state.read_stack(rbp, 8)?;
                tr.state.regs[reg::RSP as usize] = rbp.wrapping_add(8);
                tr.state.reg_taint[reg::RSP as usize] = Taint::StackRel;
                Self::write_reg(&mut tr.state, Reg::gp64(reg::RBP), Val::new(v, t));
            }
            _ => unreachable!(),
        }
        Ok(StepFlow::Continue)
    }

    /// `push` reads its only operand; fold or materialize it like any
    /// other source before emitting.
    fn emit_rewritten_push(&mut self, tr: &mut Trace, instr: &Instruction) -> Result<()> {
        let mut res = *instr;
        // The operand sits in the dst slot but is a pure source.
        let as_src = Instruction::binary(
            instr.addr,
            InstrKind::Push,
            ValType::I64,
            Operand::None,
            res.dst,
        );
        let mut src = as_src.src;
        self.prepare_operand(tr, &mut src, Role::Src, &as_src)?;
        res.dst = src;
        self.emit(tr, res)?;
        Ok(())
    }
}
