//! Operand resolution against the abstract state.

use super::{Engine, Trace, Val};
use crate::error::Result;
use crate::state::{EmuState, Taint};

use respin_asm::{MemRef, Operand, Reg, RegKind, Segment, ValType};

impl Engine<'_> {
    /// Read a general-purpose register at its access width.
    pub(crate) fn read_reg(state: &EmuState, r: Reg) -> Val {
        let i = r.index() as usize;
        let raw = state.regs[i];
        let v = match r.kind() {
            RegKind::Gp8High => (raw >> 8) & 0xff,
            kind => raw & ValType::from_bytes((kind.bits() / 8) as u8).mask(),
        };
        Val::new(v, state.reg_taint[i])
    }

    /// Write a general-purpose register, honoring x86 partial-write
    /// rules: 32-bit writes zero the high half, narrower writes merge.
    pub(crate) fn write_reg(state: &mut EmuState, r: Reg, val: Val) {
        let i = r.index() as usize;
        match r.kind() {
            RegKind::Gp64 => {
                state.regs[i] = val.v;
                state.reg_taint[i] = val.t;
            }
            RegKind::Gp32 => {
                state.regs[i] = val.v & 0xffff_ffff;
                state.reg_taint[i] = val.t;
            }
            RegKind::Gp16 => {
                state.regs[i] = (state.regs[i] & !0xffff) | (val.v & 0xffff);
                state.reg_taint[i] = state.reg_taint[i].union(val.t);
            }
            RegKind::Gp8 => {
                state.regs[i] = (state.regs[i] & !0xff) | (val.v & 0xff);
                state.reg_taint[i] = state.reg_taint[i].union(val.t);
            }
            RegKind::Gp8High => {
                state.regs[i] = (state.regs[i] & !0xff00) | ((val.v & 0xff) << 8);
                state.reg_taint[i] = state.reg_taint[i].union(val.t);
            }
            RegKind::Xmm | RegKind::Ymm | RegKind::Rip => unreachable!("vector write_reg"),
        }
    }

    /// Effective address of a memory operand.
    pub(crate) fn addr_of(&self, state: &EmuState, mem: &MemRef) -> Val {
        if mem.segment != Segment::None {
            // fs/gs bases are run-time thread state; never foldable.
            return Val::new(0, Taint::Dynamic);
        }
        let mut v = mem.disp as u64;
        let mut t = Taint::Static;
        if let Some(base) = mem.base {
            if base == Reg::RIP {
                // Displacement already holds the absolute target.
                return Val::fixed(mem.disp as u64);
            }
            let b = Self::read_reg(state, base.with_width(ValType::I64));
            v = v.wrapping_add(b.v);
            t = t.union(b.t);
        }
        if let Some(index) = mem.index {
            let ix = Self::read_reg(state, index.with_width(ValType::I64));
            v = v.wrapping_add(ix.v.wrapping_mul(mem.scale as u64));
            // A stack-relative index scaled by anything loses its shape.
            let it = if ix.t == Taint::StackRel && mem.scale != 1 {
                Taint::Dynamic
            } else {
                ix.t
            };
            t = t.union(it);
        }
        Val::new(v, t)
    }

    /// Read an integer operand: register, immediate or memory.
    pub(crate) fn read_op(&mut self, tr: &mut Trace, op: &Operand, width: ValType) -> Result<Val> {
        match op {
            Operand::Reg(r) if r.is_gp() => Ok(Self::read_reg(&tr.state, *r)),
            Operand::Reg(r) => {
                // Low lane of a vector register viewed as an integer.
                let i = r.index() as usize;
                Ok(Val::new(
                    tr.state.xmm[i][0] & width.mask(),
                    tr.state.xmm_taint[i],
                ))
            }
            Operand::Imm { .. } => Ok(Val::fixed(
                op.as_imm().expect("imm operand") as u64 & width.mask(),
            )),
            Operand::Mem(mem) => self.read_mem(tr, mem, width),
            Operand::None => Ok(Val::fixed(0)),
        }
    }

    /// Read `width` bytes of memory at the operand's effective address.
    pub(crate) fn read_mem(&mut self, tr: &mut Trace, mem: &MemRef, width: ValType) -> Result<Val> {
        let addr = self.addr_of(&tr.state, mem);
        let len = width.bytes().max(1) as usize;
        match addr.t {
            Taint::Dynamic => Ok(Val::new(0, Taint::Dynamic)),
            Taint::StackRel => {
                let (v, t) = tr.state.read_stack(addr.v, len)?;
                if t.is_dynamic() {
                    // The consumer stays residual and reads the runtime
                    // slot; bring its known bytes up to date first.
                    self.materialize_stack_bytes(tr, addr.v, len)?;
                }
                Ok(Val::new(v & width.mask(), t))
            }
            Taint::Static => {
                if EmuState::stack_offset(addr.v).is_some() {
                    // A recomputed absolute stack address; treat like a
                    // stack access.
                    let (v, t) = tr.state.read_stack(addr.v, len)?;
                    if t.is_dynamic() {
                        self.materialize_stack_bytes(tr, addr.v, len)?;
                    }
                    return Ok(Val::new(v & width.mask(), t));
                }
                if self.external_dirty {
                    // A residual store may have changed this location.
                    return Ok(Val::new(0, Taint::Dynamic));
                }
                // Specialization-time read of process memory (e.g. a
                // statically-known pointer argument).
                let v = unsafe { read_host(addr.v, len) };
                Ok(Val::new(v & width.mask(), Taint::Static))
            }
        }
    }

    /// Update the abstract state for a store. Returns `false` when the
    /// store must not be performed at specialization time (unknown or
    /// external target) and therefore has to stay residual.
    pub(crate) fn write_mem(
        &mut self,
        tr: &mut Trace,
        mem: &MemRef,
        width: ValType,
        val: Val,
    ) -> Result<bool> {
        let addr = self.addr_of(&tr.state, mem);
        let len = width.bytes().max(1) as usize;
        match addr.t {
            Taint::StackRel => {
                tr.state.write_stack(addr.v, len, val.v, val.t)?;
                Ok(true)
            }
            Taint::Static if EmuState::stack_offset(addr.v).is_some() => {
                tr.state.write_stack(addr.v, len, val.v, val.t)?;
                Ok(true)
            }
            Taint::Static => {
                // Never mutate process memory while specializing; the
                // store stays residual and poisons later external reads.
                self.external_dirty = true;
                Ok(false)
            }
            Taint::Dynamic => {
                self.external_dirty = true;
                if self.stack_escaped {
                    // The frame may be aliased; poison the touched window.
                    let (low, high) = (tr.state.stack_low, tr.state.stack_high);
                    for off in low..high.min(low.saturating_add(1 << 20)) {
                        tr.state.set_stack_taint(off, Taint::Dynamic);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Write an integer operand destination. For memory destinations this
    /// only updates the abstract state; whether a residual store is also
    /// needed is the caller's concern.
    pub(crate) fn write_op(
        &mut self,
        tr: &mut Trace,
        op: &Operand,
        width: ValType,
        val: Val,
    ) -> Result<()> {
        match op {
            Operand::Reg(r) if r.is_gp() => {
                Self::write_reg(&mut tr.state, r.with_width(width), val);
                Ok(())
            }
            Operand::Reg(r) => {
                let i = r.index() as usize;
                tr.state.xmm[i][0] = val.v & width.mask();
                if width == ValType::I64 || width == ValType::I32 {
                    tr.state.xmm[i][1] = 0;
                }
                tr.state.xmm_taint[i] = val.t;
                Ok(())
            }
            Operand::Mem(mem) => {
                self.write_mem(tr, mem, width, val)?;
                Ok(())
            }
            Operand::None | Operand::Imm { .. } => Ok(()),
        }
    }
}

/// Read up to eight bytes of process memory.
///
/// # Safety
///
/// `addr` must reference `len` readable bytes; the engine only calls this
/// for addresses derived from statically-configured pointers, which the
/// caller of `rewrite` vouches for.
pub(crate) unsafe fn read_host(addr: u64, len: usize) -> u64 {
    let mut buf = [0u8; 8];
    core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), len.min(8));
    u64::from_le_bytes(buf)
}
