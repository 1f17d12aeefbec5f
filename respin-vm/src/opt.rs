//! Peephole passes over captured blocks.
//!
//! All passes are conservative: an instruction is removed only when its
//! every effect is provably dead within its own block.

use crate::block::CbbExit;
use crate::rewriter::Rewriter;

use itertools::Itertools;

use respin_asm::{Flags, Instruction, InstrKind, Operand};

use tracing::debug;

/// Flags that must be considered live when control leaves a block.
fn live_out(exit: &CbbExit) -> Flags {
    match exit {
        // The residual conditional consumes its flags; anything else may
        // flow into a successor that reads them.
        CbbExit::Branch { cond, .. } => cond.flags_read(),
        CbbExit::Jump(_) | CbbExit::Indirect | CbbExit::Pending => Flags::all(),
        // The System-V ABI lets a function clobber all flags.
        CbbExit::Ret => Flags::empty(),
    }
}

/// True for operations with no effect beyond flags when `src` is the
/// identity element.
fn is_identity(instr: &Instruction) -> bool {
    let Some(imm) = instr.src.as_imm() else {
        return false;
    };
    match instr.kind {
        InstrKind::Add | InstrKind::Sub | InstrKind::Or | InstrKind::Xor => imm == 0,
        InstrKind::Shl | InstrKind::Shr | InstrKind::Sar => imm == 0,
        _ => false,
    }
}

fn is_self_move(instr: &Instruction) -> bool {
    instr.kind == InstrKind::Mov
        && matches!(
            (&instr.dst, &instr.src),
            (Operand::Reg(a), Operand::Reg(b)) if a == b
        )
}

impl Rewriter {
    /// Run the enabled peephole passes over every captured block.
    pub(crate) fn optimize_blocks(&mut self) {
        let mut removed = 0usize;
        for cbb in &mut self.cbbs {
            let before = cbb.instrs.len();

            // Self-moves never have flag effects; drop them first.
            let dead: Vec<usize> = cbb.instrs.iter().positions(is_self_move).collect();
            for i in dead.into_iter().rev() {
                cbb.instrs.remove(i);
            }

            // Backward liveness over the six flags: flag-only writers and
            // identity operations whose results are overwritten before
            // any read can go.
            let mut needed = live_out(&cbb.exit);
            let mut keep = vec![true; cbb.instrs.len()];
            for (i, instr) in cbb.instrs.iter().enumerate().rev() {
                let written = instr.flags_written();
                let read = instr.flags_read();
                let observable = written.intersects(needed);
                if !observable && instr.kind.writes_flags_only() {
                    keep[i] = false;
                    continue;
                }
                if !observable && is_identity(instr) {
                    keep[i] = false;
                    continue;
                }
                needed = (needed - written) | read;
            }
            let mut it = keep.iter();
            cbb.instrs.retain(|_| *it.next().expect("keep mask matches"));

            removed += before - cbb.instrs.len();
        }
        if removed > 0 {
            self.captured_instrs = self.captured_instrs.saturating_sub(removed);
            if self.config.verbose_opt {
                debug!(removed, "peephole removed instructions");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Cbb, CbbExit, CbbId};

    use respin_asm::{reg, Cond, Reg, ValType};

    fn rw_with(instrs: Vec<Instruction>, exit: CbbExit) -> Rewriter {
        let mut rw = Rewriter::new();
        let mut cbb = Cbb::new(0x4000, 0);
        cbb.instrs = instrs;
        cbb.exit = exit;
        rw.cbbs.push(cbb);
        rw
    }

    fn cmp_regs() -> Instruction {
        Instruction::binary(
            0,
            InstrKind::Cmp,
            ValType::I64,
            Operand::reg(Reg::gp64(reg::RAX)),
            Operand::reg(Reg::gp64(reg::RCX)),
        )
    }

    #[test]
    fn flag_only_writer_before_ret_is_dead() {
        let mut rw = rw_with(vec![cmp_regs()], CbbExit::Ret);
        rw.optimize_blocks();
        assert!(rw.cbbs[0].instrs.is_empty());
    }

    #[test]
    fn flag_writer_feeding_a_branch_survives() {
        let exit = CbbExit::Branch {
            cond: Cond::E,
            taken: CbbId(0),
            fallthrough: CbbId(0),
        };
        let mut rw = rw_with(vec![cmp_regs()], exit);
        rw.optimize_blocks();
        assert_eq!(rw.cbbs[0].instrs.len(), 1);
    }

    #[test]
    fn self_move_is_removed() {
        let mov = Instruction::binary(
            0,
            InstrKind::Mov,
            ValType::I64,
            Operand::reg(Reg::gp64(reg::RAX)),
            Operand::reg(Reg::gp64(reg::RAX)),
        );
        let mut rw = rw_with(vec![mov], CbbExit::Ret);
        rw.optimize_blocks();
        assert!(rw.cbbs[0].instrs.is_empty());
    }

    #[test]
    fn add_zero_survives_when_its_flags_are_read() {
        // add rax, 0 followed by a branch on ZF is a live test.
        let add0 = Instruction::binary(
            0,
            InstrKind::Add,
            ValType::I64,
            Operand::reg(Reg::gp64(reg::RAX)),
            Operand::imm(ValType::I8, 0),
        );
        let exit = CbbExit::Branch {
            cond: Cond::E,
            taken: CbbId(0),
            fallthrough: CbbId(0),
        };
        let mut rw = rw_with(vec![add0], exit);
        rw.optimize_blocks();
        assert_eq!(rw.cbbs[0].instrs.len(), 1);

        let mut rw = rw_with(
            vec![Instruction::binary(
                0,
                InstrKind::Add,
                ValType::I64,
                Operand::reg(Reg::gp64(reg::RAX)),
                Operand::imm(ValType::I8, 0),
            )],
            CbbExit::Ret,
        );
        rw.optimize_blocks();
        assert!(rw.cbbs[0].instrs.is_empty());
    }
}
