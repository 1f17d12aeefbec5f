//! Abstract CPU state with per-byte taint.

use crate::consts::{EMU_STACK_HEADROOM, EMU_STACK_SIZE};
use crate::error::{Result, RewriteError};

use respin_asm::{reg, Flags};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Virtual base address of the emulated stack. The region is never
/// dereferenced as host memory; loads and stores inside it are redirected
/// to the session's stack buffer, so snapshots can be cloned freely.
pub const EMU_STACK_BASE: u64 = 0x7fff_e000_0000;

/// Classification of an abstract value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Taint {
    /// Known at specialization time; foldable into the generated code.
    #[default]
    Static,
    /// Known only as an offset from the runtime stack pointer; usable for
    /// address arithmetic but never foldable into an immediate.
    StackRel,
    /// Only known at run time.
    Dynamic,
}

impl Taint {
    /// Join of two byte taints (the most dynamic wins).
    pub fn union(self, other: Taint) -> Taint {
        self.max(other)
    }

    /// True for [`Taint::Static`].
    pub fn is_static(&self) -> bool {
        matches!(self, Taint::Static)
    }

    /// True for [`Taint::Dynamic`].
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Taint::Dynamic)
    }
}

/// Abstract CPU state: concrete values everywhere, plus taint describing
/// which of them the generated code may rely on.
#[derive(Debug, Clone)]
pub struct EmuState {
    /// General-purpose register values.
    pub regs: [u64; 16],
    /// Per-register taint.
    pub reg_taint: [Taint; 16],
    /// Vector register values, low/high lane.
    pub xmm: [[u64; 2]; 16],
    /// Per-register vector taint.
    pub xmm_taint: [Taint; 16],
    /// Concrete flag values.
    pub flags: Flags,
    /// Per-flag taint, indexed like [`Flags::EACH`].
    pub flag_taint: [Taint; 6],
    stack: Box<[u8]>,
    stack_taint: Box<[Taint]>,
    /// Lowest touched stack offset.
    pub stack_low: usize,
    /// Highest touched stack offset (exclusive).
    pub stack_high: usize,
}

impl EmuState {
    /// A fresh conservative state: every register, flag and stack byte
    /// Dynamic (the caller may have put anything there), except the stack
    /// pointer, which is parked near the top of the emulated stack.
    pub fn new() -> Self {
        let mut s = Self {
            regs: [0; 16],
            reg_taint: [Taint::Dynamic; 16],
            xmm: [[0; 2]; 16],
            xmm_taint: [Taint::Dynamic; 16],
            flags: Flags::empty(),
            flag_taint: [Taint::Dynamic; 6],
            stack: vec![0; EMU_STACK_SIZE].into_boxed_slice(),
            stack_taint: vec![Taint::Dynamic; EMU_STACK_SIZE].into_boxed_slice(),
            stack_low: usize::MAX,
            stack_high: 0,
        };
        s.regs[reg::RSP as usize] = Self::initial_sp();
        s.reg_taint[reg::RSP as usize] = Taint::StackRel;
        s
    }

    /// The initial stack pointer value.
    pub fn initial_sp() -> u64 {
        EMU_STACK_BASE + (EMU_STACK_SIZE - EMU_STACK_HEADROOM) as u64
    }

    /// Offset of `addr` within the emulated stack, if it lies inside.
    pub fn stack_offset(addr: u64) -> Option<usize> {
        addr.checked_sub(EMU_STACK_BASE)
            .filter(|off| *off < EMU_STACK_SIZE as u64)
            .map(|off| off as usize)
    }

    fn stack_range(&mut self, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let off = Self::stack_offset(addr).ok_or(RewriteError::StackBounds {
            offset: addr.wrapping_sub(EMU_STACK_BASE) as i64,
        })?;
        let end = off + len;
        if end > EMU_STACK_SIZE {
            return Err(RewriteError::StackBounds { offset: end as i64 });
        }
        self.stack_low = self.stack_low.min(off);
        self.stack_high = self.stack_high.max(end);
        Ok(off..end)
    }

    /// Read up to eight bytes from the emulated stack, joining the taint
    /// of every byte read.
    pub fn read_stack(&mut self, addr: u64, len: usize) -> Result<(u64, Taint)> {
        debug_assert!(len <= 8);
        let range = self.stack_range(addr, len)?;
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&self.stack[range.clone()]);
        let taint = self.stack_taint[range]
            .iter()
            .copied()
            .fold(Taint::Static, Taint::union);
        Ok((u64::from_le_bytes(buf), taint))
    }

    /// Write up to eight bytes to the emulated stack, tagging every byte
    /// with `taint`.
    pub fn write_stack(&mut self, addr: u64, len: usize, value: u64, taint: Taint) -> Result<()> {
        debug_assert!(len <= 8);
        let range = self.stack_range(addr, len)?;
        self.stack[range.clone()].copy_from_slice(&value.to_le_bytes()[..len]);
        self.stack_taint[range].fill(taint);
        Ok(())
    }

    /// Raw access to a stack byte's taint (used by state widening).
    pub fn stack_byte(&self, off: usize) -> (u8, Taint) {
        (self.stack[off], self.stack_taint[off])
    }

    /// Force a stack byte to a taint (used by state widening).
    pub fn set_stack_taint(&mut self, off: usize, taint: Taint) {
        self.stack_taint[off] = taint;
    }

    /// Taint of one flag.
    pub fn flag_taint_of(&self, flag: Flags) -> Taint {
        self.flag_taint[flag_index(flag)]
    }

    /// Joined taint over a set of flags.
    pub fn flags_taint(&self, set: Flags) -> Taint {
        Flags::EACH
            .iter()
            .filter(|f| set.contains(**f))
            .map(|f| self.flag_taint[flag_index(*f)])
            .fold(Taint::Static, Taint::union)
    }

    /// Update the flags in `written` to `values`, tagging each with
    /// `taint`.
    pub fn set_flags(&mut self, values: Flags, written: Flags, taint: Taint) {
        for (i, f) in Flags::EACH.iter().enumerate() {
            if written.contains(*f) {
                self.flags.set(*f, values.contains(*f));
                self.flag_taint[i] = taint;
            }
        }
    }

    /// Structural hash of the state: taints everywhere, values wherever
    /// the generated code may rely on them. Dynamic values are excluded;
    /// that exclusion is what lets loop states converge.
    pub fn es_id(&self) -> u64 {
        let mut h = DefaultHasher::new();
        for i in 0..16 {
            self.reg_taint[i].hash(&mut h);
            if !self.reg_taint[i].is_dynamic() {
                self.regs[i].hash(&mut h);
            }
        }
        for i in 0..16 {
            self.xmm_taint[i].hash(&mut h);
            if !self.xmm_taint[i].is_dynamic() {
                self.xmm[i].hash(&mut h);
            }
        }
        for (i, f) in Flags::EACH.iter().enumerate() {
            self.flag_taint[i].hash(&mut h);
            if !self.flag_taint[i].is_dynamic() {
                self.flags.contains(*f).hash(&mut h);
            }
        }
        if self.stack_low < self.stack_high {
            (self.stack_high - self.stack_low).hash(&mut h);
            for off in self.stack_low..self.stack_high {
                self.stack_taint[off].hash(&mut h);
                if !self.stack_taint[off].is_dynamic() {
                    self.stack[off].hash(&mut h);
                }
            }
        }
        h.finish()
    }

    /// Widen `self` so it subsumes `other`: any register, flag or touched
    /// stack byte whose value or taint differs becomes Dynamic. Returns
    /// whether anything changed.
    pub fn widen_from(&mut self, other: &EmuState) -> bool {
        let mut changed = false;
        for i in 0..16 {
            let same = self.reg_taint[i] == other.reg_taint[i]
                && (self.reg_taint[i].is_dynamic() || self.regs[i] == other.regs[i]);
            if !same && self.reg_taint[i] != Taint::Dynamic {
                self.reg_taint[i] = Taint::Dynamic;
                changed = true;
            }
        }
        for i in 0..16 {
            let same = self.xmm_taint[i] == other.xmm_taint[i]
                && (self.xmm_taint[i].is_dynamic() || self.xmm[i] == other.xmm[i]);
            if !same && self.xmm_taint[i] != Taint::Dynamic {
                self.xmm_taint[i] = Taint::Dynamic;
                changed = true;
            }
        }
        for (i, f) in Flags::EACH.iter().enumerate() {
            let same = self.flag_taint[i] == other.flag_taint[i]
                && (self.flag_taint[i].is_dynamic()
                    || self.flags.contains(*f) == other.flags.contains(*f));
            if !same && self.flag_taint[i] != Taint::Dynamic {
                self.flag_taint[i] = Taint::Dynamic;
                changed = true;
            }
        }
        let low = self.stack_low.min(other.stack_low);
        let high = self.stack_high.max(other.stack_high);
        if low < high {
            for off in low..high {
                let same = self.stack_taint[off] == other.stack_taint[off]
                    && (self.stack_taint[off].is_dynamic()
                        || self.stack[off] == other.stack[off]);
                if !same && self.stack_taint[off] != Taint::Dynamic {
                    self.stack_taint[off] = Taint::Dynamic;
                    changed = true;
                }
            }
            self.stack_low = low;
            self.stack_high = high;
        }
        changed
    }
}

impl Default for EmuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of `flag` within [`Flags::EACH`].
pub fn flag_index(flag: Flags) -> usize {
    Flags::EACH
        .iter()
        .position(|f| *f == flag)
        .expect("single flag")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taint_union_is_most_dynamic() {
        assert_eq!(Taint::Static.union(Taint::Static), Taint::Static);
        assert_eq!(Taint::Static.union(Taint::StackRel), Taint::StackRel);
        assert_eq!(Taint::StackRel.union(Taint::Dynamic), Taint::Dynamic);
    }

    #[test]
    fn stack_roundtrip_preserves_value_and_taint() {
        let mut s = EmuState::new();
        let sp = EmuState::initial_sp();
        s.write_stack(sp - 8, 8, 0xdead_beef, Taint::Static).unwrap();
        assert_eq!(s.read_stack(sp - 8, 8).unwrap(), (0xdead_beef, Taint::Static));

        // A dynamic store poisons reloads of any overlapping byte.
        s.write_stack(sp - 5, 1, 0xff, Taint::Dynamic).unwrap();
        assert_eq!(s.read_stack(sp - 8, 8).unwrap().1, Taint::Dynamic);
        assert_eq!(s.read_stack(sp - 8, 2).unwrap().1, Taint::Static);
    }

    #[test]
    fn out_of_bounds_stack_access_errors() {
        let mut s = EmuState::new();
        assert!(s.read_stack(EMU_STACK_BASE - 1, 1).is_err());
        assert!(s.read_stack(0x1000, 8).is_err());
    }

    #[test]
    fn es_id_ignores_dynamic_values() {
        let mut a = EmuState::new();
        let mut b = EmuState::new();
        a.regs[1] = 7;
        b.regs[1] = 9;
        a.reg_taint[1] = Taint::Dynamic;
        b.reg_taint[1] = Taint::Dynamic;
        assert_eq!(a.es_id(), b.es_id());

        // But static values are significant.
        a.reg_taint[1] = Taint::Static;
        b.reg_taint[1] = Taint::Static;
        assert_ne!(a.es_id(), b.es_id());
    }

    #[test]
    fn widening_marks_differing_registers_dynamic() {
        let mut a = EmuState::new();
        let mut b = EmuState::new();
        a.regs[2] = 1;
        b.regs[2] = 2;
        a.reg_taint[2] = Taint::Static;
        b.reg_taint[2] = Taint::Static;
        assert!(a.widen_from(&b));
        assert_eq!(a.reg_taint[2], Taint::Dynamic);
        // Widening again against the same state is a fixed point.
        assert!(!a.widen_from(&b));
    }
}
