//! The emulate-and-capture engine.
//!
//! One [`Engine`] run interprets the target function over an abstract
//! state. Instructions whose inputs are fully known execute at
//! specialization time and vanish; everything else is re-emitted into
//! captured blocks with its operands rewritten against the known state.
//! The same machinery, with capture disabled, is the plain interpreter
//! behind `Rewriter::emulate`.

mod alu;
mod capture;
mod exec;
mod flow;
mod mem;
mod sse;

use crate::block::{Cbb, CbbExit, CbbId};
use crate::error::{Result, RewriteError};
use crate::rewriter::Rewriter;
use crate::state::{EmuState, Taint};

use respin_asm::{Cond, Instruction};

use std::collections::{HashMap, VecDeque};

use tracing::trace;

/// Engine operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Interpret only; every value is concrete, nothing is captured.
    Interpret,
    /// Partial evaluation with residual capture.
    Capture,
}

/// A value with its taint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Val {
    pub v: u64,
    pub t: Taint,
}

impl Val {
    pub fn new(v: u64, t: Taint) -> Self {
        Self { v, t }
    }

    pub fn fixed(v: u64) -> Self {
        Self::new(v, Taint::Static)
    }
}

/// Per-trace mutable context threaded through the step functions.
pub(crate) struct Trace {
    pub state: EmuState,
    /// Block residuals are appended to; `None` while interpreting.
    pub cbb: Option<CbbId>,
    /// Return addresses of inlined (substituted) calls.
    pub call_stack: Vec<u64>,
}

/// Where the trace goes after one step.
pub(crate) enum StepFlow {
    /// Fall through to the next instruction.
    Continue,
    /// Continue the same captured block at another address.
    Goto(u64),
    /// The block is finished.
    End(EndKind),
}

/// How a captured block finished.
pub(crate) enum EndKind {
    /// The function returned.
    Ret,
    /// A residual conditional branch; both sides continue.
    Fork {
        cond: Cond,
        taken: u64,
        fallthrough: u64,
    },
    /// A residual indirect jump the trace cannot follow.
    Indirect,
}

struct Job {
    cbb: CbbId,
    addr: u64,
    state: EmuState,
    call_stack: Vec<u64>,
}

/// Result of an engine run.
pub(crate) struct EngineOutcome {
    /// Entry captured block (capture mode).
    pub entry: Option<CbbId>,
    /// State at the final `ret` (interpret mode).
    pub final_state: EmuState,
    /// Soft trace error (interpret mode only).
    pub error: Option<RewriteError>,
}

pub(crate) struct Engine<'rw> {
    pub(crate) rw: &'rw mut Rewriter,
    mode: Mode,
    queue: VecDeque<Job>,
    /// `(dec_addr, es_id)` to captured block.
    index: HashMap<(u64, u64), CbbId>,
    /// Most recent non-glue specialization per decoded address, used to
    /// widen loop-carried state.
    latest: HashMap<u64, CbbId>,
    /// Entry state snapshot per captured block.
    entry_states: HashMap<usize, EmuState>,
    /// Set once a stack address escapes into residual code; after that,
    /// dynamic stores may alias the emulated stack.
    pub(crate) stack_escaped: bool,
    /// Set once a residual store targets unknown or external memory;
    /// later static loads from external memory are no longer foldable.
    pub(crate) external_dirty: bool,
    /// Registers written by residual code; their runtime values are live
    /// and must not be clobbered by scratch materializations.
    pub(crate) dirty: [bool; 16],
    /// Scratch registers whose pending synthetic use completes with the
    /// next emitted residual; released afterwards.
    pub(crate) scratch_release: Vec<u8>,
    steps: usize,
    step_budget: usize,
}

impl<'rw> Engine<'rw> {
    pub fn new(rw: &'rw mut Rewriter, mode: Mode) -> Self {
        // Bound total emulated steps so statically-infinite loops fail
        // cleanly instead of spinning.
        let step_budget = rw.config.caps.decode_instrs.saturating_mul(64).max(1 << 16);
        Self {
            rw,
            mode,
            queue: VecDeque::new(),
            index: HashMap::new(),
            latest: HashMap::new(),
            entry_states: HashMap::new(),
            stack_escaped: false,
            external_dirty: false,
            dirty: [false; 16],
            scratch_release: Vec::new(),
            steps: 0,
            step_budget,
        }
    }

    pub fn capturing(&self) -> bool {
        self.mode == Mode::Capture
    }

    pub fn run(self, entry: u64, state: EmuState) -> Result<EngineOutcome> {
        match self.mode {
            Mode::Interpret => self.run_interpret(entry, state),
            Mode::Capture => self.run_capture(entry, state),
        }
    }

    fn run_interpret(mut self, entry: u64, state: EmuState) -> Result<EngineOutcome> {
        let mut tr = Trace {
            state,
            cbb: None,
            call_stack: Vec::new(),
        };
        let mut addr = entry;
        loop {
            match self.trace_one_block(&mut tr, addr) {
                Ok(Some(next)) => addr = next,
                Ok(None) => {
                    return Ok(EngineOutcome {
                        entry: None,
                        final_state: tr.state,
                        error: None,
                    })
                }
                Err(e) => {
                    return Ok(EngineOutcome {
                        entry: None,
                        final_state: tr.state,
                        error: Some(e),
                    })
                }
            }
        }
    }

    fn run_capture(mut self, entry: u64, state: EmuState) -> Result<EngineOutcome> {
        let es = state.es_id();
        let entry_id = self.new_cbb(entry, state.clone(), es)?;
        self.queue.push_back(Job {
            cbb: entry_id,
            addr: entry,
            state,
            call_stack: Vec::new(),
        });

        while let Some(job) = self.queue.pop_front() {
            let mut tr = Trace {
                state: job.state,
                cbb: Some(job.cbb),
                call_stack: job.call_stack,
            };
            let mut addr = job.addr;
            while let Some(next) = self.trace_one_block(&mut tr, addr)? {
                addr = next;
            }
        }

        Ok(EngineOutcome {
            entry: Some(entry_id),
            final_state: EmuState::new(),
            error: None,
        })
    }

    /// Emulate decoded blocks starting at `addr` until the trace either
    /// continues elsewhere (`Some(next)`) or the current captured block
    /// is finished (`None`).
    fn trace_one_block(&mut self, tr: &mut Trace, addr: u64) -> Result<Option<u64>> {
        let dbb = self.rw.decode_block(addr)?;
        let range = self.rw.dbbs[dbb.0].instrs.clone();
        let instrs: Vec<Instruction> = self.rw.dec_instrs[range].to_vec();

        if self.rw.config.verbose_state {
            trace!(
                addr = format_args!("{addr:#x}"),
                es_id = format_args!("{:#x}", tr.state.es_id()),
                "block entry state"
            );
        }

        for instr in &instrs {
            self.steps += 1;
            if self.steps > self.step_budget {
                return Err(RewriteError::StepBudget(self.step_budget));
            }
            if self.rw.config.verbose_steps {
                trace!(step = %instr, "emulate");
            }
            match self.step(tr, instr)? {
                StepFlow::Continue => {}
                StepFlow::Goto(next) => return Ok(Some(next)),
                StepFlow::End(end) => {
                    self.finish_block(tr, end)?;
                    return Ok(None);
                }
            }
        }
        // A decoded block always ends in an exit instruction, and every
        // exit yields Goto or End.
        unreachable!("decoded block fell off its end")
    }

    fn finish_block(&mut self, tr: &mut Trace, end: EndKind) -> Result<()> {
        let Some(cbb) = tr.cbb else {
            // Interpret mode: only a return can end the trace.
            return match end {
                EndKind::Ret => Ok(()),
                _ => Err(RewriteError::Unsupported {
                    addr: 0,
                    kind: respin_asm::InstrKind::JmpInd,
                }),
            };
        };
        match end {
            EndKind::Ret => {
                self.rw.cbbs[cbb.0].exit = CbbExit::Ret;
            }
            EndKind::Indirect => {
                self.rw.cbbs[cbb.0].exit = CbbExit::Indirect;
            }
            EndKind::Fork {
                cond,
                taken,
                fallthrough,
            } => {
                let taken_id = self.successor(tr, taken)?;
                let fallthrough_id = self.successor(tr, fallthrough)?;
                self.rw.cbbs[cbb.0].exit = CbbExit::Branch {
                    cond,
                    taken: taken_id,
                    fallthrough: fallthrough_id,
                };
            }
        }
        Ok(())
    }

    /// Find or create the captured block a fork edge continues into,
    /// widening loop-carried state and inserting glue blocks for edge
    /// materializations as needed.
    fn successor(&mut self, tr: &Trace, target: u64) -> Result<CbbId> {
        let es = tr.state.es_id();
        if let Some(id) = self.index.get(&(target, es)) {
            return Ok(*id);
        }

        let id = if let Some(prev) = self.latest.get(&target).copied() {
            // The address was specialized before under a different state:
            // widen the previous entry state so both paths fit, then
            // capture (or reuse) the widened specialization.
            let mut widened = self.entry_states[&prev.0].clone();
            widened.widen_from(&tr.state);
            let wid_es = widened.es_id();
            if let Some(existing) = self.index.get(&(target, wid_es)) {
                *existing
            } else {
                let id = self.new_cbb(target, widened.clone(), wid_es)?;
                self.queue.push_back(Job {
                    cbb: id,
                    addr: target,
                    state: widened,
                    call_stack: tr.call_stack.clone(),
                });
                id
            }
        } else {
            let id = self.new_cbb(target, tr.state.clone(), es)?;
            self.queue.push_back(Job {
                cbb: id,
                addr: target,
                state: tr.state.clone(),
                call_stack: tr.call_stack.clone(),
            });
            return Ok(id);
        };

        // Entering a widened block: statically-known values the block no
        // longer assumes must be materialized on this edge.
        let fixups = self.edge_fixups(&tr.state, id)?;
        if fixups.is_empty() {
            return Ok(id);
        }
        let glue_id = self.new_glue(target, es, fixups, id)?;
        Ok(glue_id)
    }

    fn new_cbb(&mut self, addr: u64, state: EmuState, es: u64) -> Result<CbbId> {
        if self.rw.cbbs.len() >= self.rw.config.caps.capture_blocks {
            return Err(RewriteError::CapturedBlockCapacity(
                self.rw.config.caps.capture_blocks,
            ));
        }
        let id = CbbId(self.rw.cbbs.len());
        self.rw.cbbs.push(Cbb::new(addr, es));
        self.index.insert((addr, es), id);
        self.latest.insert(addr, id);
        self.entry_states.insert(id.0, state);
        Ok(id)
    }

    fn new_glue(
        &mut self,
        addr: u64,
        es: u64,
        fixups: Vec<Instruction>,
        target: CbbId,
    ) -> Result<CbbId> {
        if self.rw.cbbs.len() >= self.rw.config.caps.capture_blocks {
            return Err(RewriteError::CapturedBlockCapacity(
                self.rw.config.caps.capture_blocks,
            ));
        }
        let id = CbbId(self.rw.cbbs.len());
        let mut cbb = Cbb::new(addr, es);
        self.rw.captured_instrs += fixups.len();
        cbb.instrs = fixups;
        cbb.exit = CbbExit::Jump(target);
        self.rw.cbbs.push(cbb);
        // Glue is a valid entry point for this (addr, state) pair, but it
        // must not become the widening baseline.
        self.index.insert((addr, es), id);
        Ok(id)
    }
}
