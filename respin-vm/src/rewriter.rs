//! [`Rewriter`] session implementation.

use crate::block::{Cbb, Dbb, DbbId};
use crate::consts::*;
use crate::engine::{Engine, Mode};
use crate::error::{Result, RewriteError};
use crate::state::{EmuState, Taint};
use crate::storage::CodeStorage;

use respin_asm::{reg, Instruction};

use std::collections::HashMap;

use tracing::{debug, warn};

/// Arena capacity limits for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacities {
    /// Decoded instructions.
    pub decode_instrs: usize,
    /// Decoded basic blocks.
    pub decode_blocks: usize,
    /// Captured instructions.
    pub capture_instrs: usize,
    /// Captured basic blocks.
    pub capture_blocks: usize,
    /// Generated code bytes.
    pub code_bytes: usize,
}

impl Default for Capacities {
    fn default() -> Self {
        Self {
            decode_instrs: DEFAULT_DECODE_INSTRS,
            decode_blocks: DEFAULT_DECODE_BLOCKS,
            capture_instrs: DEFAULT_CAPTURE_INSTRS,
            capture_blocks: DEFAULT_CAPTURE_BLOCKS,
            code_bytes: DEFAULT_CODE_BYTES,
        }
    }
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub func: Option<u64>,
    pub arg_count: usize,
    pub static_args: [bool; MAX_INT_ARGS],
    pub force_unknown: [bool; MAX_INT_ARGS],
    pub returns_fp: bool,
    pub optimize: bool,
    pub verbose_decode: bool,
    pub verbose_state: bool,
    pub verbose_steps: bool,
    pub verbose_opt: bool,
    pub caps: Capacities,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            func: None,
            arg_count: MAX_INT_ARGS,
            static_args: [false; MAX_INT_ARGS],
            force_unknown: [false; MAX_INT_ARGS],
            returns_fp: false,
            optimize: true,
            verbose_decode: false,
            verbose_state: false,
            verbose_steps: false,
            verbose_opt: false,
            caps: Capacities::default(),
        }
    }
}

/// A rewriting session.
///
/// Owns every arena involved in specializing one function: decoded
/// instructions and blocks, captured blocks, and the executable region
/// generated code is written to. Sessions are single-threaded; a session
/// can be reused for many `rewrite` calls and reset in between.
pub struct Rewriter {
    pub(crate) config: Config,
    pub(crate) dec_instrs: Vec<Instruction>,
    pub(crate) dbbs: Vec<Dbb>,
    pub(crate) dbb_index: HashMap<u64, DbbId>,
    pub(crate) cbbs: Vec<Cbb>,
    pub(crate) captured_instrs: usize,
    pub(crate) storage: Option<CodeStorage>,
    pub(crate) subst: HashMap<u64, u64>,
    pub(crate) errors: Vec<RewriteError>,
    pub(crate) generated: Option<(u64, usize)>,
}

impl Rewriter {
    /// A fresh session with default capacities.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            dec_instrs: Vec::new(),
            dbbs: Vec::new(),
            dbb_index: HashMap::new(),
            cbbs: Vec::new(),
            captured_instrs: 0,
            storage: None,
            subst: HashMap::new(),
            errors: Vec::new(),
            generated: None,
        }
    }

    /// A session targeting `func` directly.
    pub fn for_func(func: u64) -> Self {
        let mut rw = Self::new();
        rw.set_func(func);
        rw
    }

    /// Set the function to rewrite.
    pub fn set_func(&mut self, func: u64) {
        self.config.func = func.into();
    }

    /// Set decoder arena capacities.
    pub fn set_decode_capacity(&mut self, instrs: usize, blocks: usize) {
        self.config.caps.decode_instrs = instrs;
        self.config.caps.decode_blocks = blocks;
    }

    /// Set capture arena capacities and the generated-code budget.
    pub fn set_capture_capacity(&mut self, instrs: usize, blocks: usize, code_bytes: usize) {
        self.config.caps.capture_instrs = instrs;
        self.config.caps.capture_blocks = blocks;
        if self.config.caps.code_bytes != code_bytes {
            self.config.caps.code_bytes = code_bytes;
            // Remap on next rewrite.
            self.storage = None;
            self.generated = None;
        }
    }

    /// Mark the `i`-th integer argument as statically known.
    pub fn mark_static(&mut self, i: usize) {
        if i < MAX_INT_ARGS {
            self.config.static_args[i] = true;
        }
    }

    /// Force the `i`-th argument Dynamic even though its value is passed
    /// at rewrite time (prevents unrolling over it).
    pub fn force_unknown(&mut self, i: usize) {
        if i < MAX_INT_ARGS {
            self.force_unknown_mut()[i] = true;
        }
    }

    fn force_unknown_mut(&mut self) -> &mut [bool; MAX_INT_ARGS] {
        &mut self.config.force_unknown
    }

    /// Number of argument registers treated as inputs.
    pub fn set_arg_count(&mut self, n: usize) {
        self.config.arg_count = n.min(MAX_INT_ARGS);
    }

    /// Declare that the function returns its value in `xmm0`.
    pub fn returns_fp(&mut self) {
        self.config.returns_fp = true;
    }

    /// Enable or disable the peephole optimizer.
    pub fn set_optimize(&mut self, on: bool) {
        self.config.optimize = on;
    }

    /// Verbosity switches for decoding, state dumps and per-step traces.
    pub fn set_verbose(&mut self, decode: bool, state: bool, steps: bool) {
        self.config.verbose_decode = decode;
        self.config.verbose_state = state;
        self.config.verbose_steps = steps;
    }

    /// Verbosity switch for the optimizer.
    pub fn set_opt_verbose(&mut self, on: bool) {
        self.config.verbose_opt = on;
    }

    /// Register a call-target substitution: emulation of a call to `from`
    /// continues into `to` instead.
    pub fn substitute(&mut self, from: u64, to: u64) {
        self.subst.insert(from, to);
    }

    /// Errors logged by previous operations, oldest first.
    pub fn errors(&self) -> &[RewriteError] {
        &self.errors
    }

    /// The most recent logged error.
    pub fn last_error(&self) -> Option<&RewriteError> {
        self.errors.last()
    }

    /// Entry address of the most recently generated function.
    pub fn generated_code(&self) -> Option<u64> {
        self.generated.map(|(addr, _)| addr)
    }

    /// Size in bytes of the most recently generated function.
    pub fn generated_size(&self) -> usize {
        self.generated.map(|(_, size)| size).unwrap_or(0)
    }

    /// Number of basic blocks decoded so far in this session.
    pub fn decoded_block_count(&self) -> usize {
        self.dbbs.len()
    }

    /// Number of instructions decoded so far in this session.
    pub fn decoded_instr_count(&self) -> usize {
        self.dec_instrs.len()
    }

    /// Number of captured blocks from the last rewrite.
    pub fn captured_block_count(&self) -> usize {
        self.cbbs.len()
    }

    /// Number of captured residual instructions from the last rewrite.
    pub fn captured_instr_count(&self) -> usize {
        self.captured_instrs
    }

    /// Drop all decoded and captured state, keeping configuration and the
    /// code mapping for reuse.
    pub fn reset(&mut self) -> Result<()> {
        self.dec_instrs.clear();
        self.dbbs.clear();
        self.dbb_index.clear();
        self.cbbs.clear();
        self.captured_instrs = 0;
        self.generated = None;
        if let Some(storage) = &mut self.storage {
            storage.clear()?;
        }
        Ok(())
    }

    /// Build the entry state for `args` according to the configuration.
    /// In capture mode only arguments marked static stay foldable; in
    /// interpret mode every argument is concrete anyway.
    pub(crate) fn initial_state(&self, args: &[u64], mode: Mode) -> EmuState {
        let mut state = EmuState::new();
        for (i, hw) in reg::SYSV_INT_ARGS.iter().enumerate() {
            if i >= self.config.arg_count {
                break;
            }
            let value = args.get(i).copied().unwrap_or(0);
            state.regs[*hw as usize] = value;
            let taint = match mode {
                Mode::Interpret => Taint::Static,
                Mode::Capture => {
                    if self.config.static_args[i] && !self.config.force_unknown[i] {
                        Taint::Static
                    } else {
                        Taint::Dynamic
                    }
                }
            };
            state.reg_taint[*hw as usize] = taint;
        }
        state
    }

    /// Run the full pipeline and return the generated function address.
    ///
    /// On any error the error is logged and the *original* function
    /// address is returned, so the caller transparently falls back to the
    /// unspecialized code.
    pub fn rewrite(&mut self, args: &[u64]) -> u64 {
        let func = self.config.func.unwrap_or(0);
        match self.rewrite_inner(args) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(func = format_args!("{func:#x}"), error = %e, "rewrite failed");
                self.errors.push(e);
                func
            }
        }
    }

    fn rewrite_inner(&mut self, args: &[u64]) -> Result<u64> {
        let func = self.config.func.ok_or(RewriteError::NoFunction)?;

        self.cbbs.clear();
        self.captured_instrs = 0;
        self.generated = None;
        if self.storage.is_none() {
            self.storage = Some(CodeStorage::new(self.config.caps.code_bytes)?);
        }
        if let Some(storage) = &mut self.storage {
            storage.clear()?;
        }

        let state = self.initial_state(args, Mode::Capture);
        let outcome = Engine::new(self, Mode::Capture).run(func, state)?;
        let entry = outcome.entry.expect("capture produces an entry block");
        debug!(
            blocks = self.cbbs.len(),
            instrs = self.captured_instrs,
            "capture finished"
        );

        if self.config.optimize {
            self.optimize_blocks();
        }

        let (addr, size) = self.emit_blocks(entry)?;
        if let Some(storage) = &mut self.storage {
            storage.make_executable()?;
        }
        self.generated = Some((addr, size));
        debug!(addr = format_args!("{addr:#x}"), size, "rewrite finished");
        Ok(addr)
    }

    /// Run as a plain interpreter over concrete values and return the
    /// integer return value (or the low `xmm0` lane bits when the session
    /// declares an FP return). Trace errors are logged and the return
    /// register's value at the point of failure is returned.
    pub fn emulate(&mut self, args: &[u64]) -> u64 {
        let Some(func) = self.config.func else {
            self.errors.push(RewriteError::NoFunction);
            return 0;
        };
        let state = self.initial_state(args, Mode::Interpret);
        let returns_fp = self.config.returns_fp;
        match Engine::new(self, Mode::Interpret).run(func, state) {
            Ok(outcome) => {
                if let Some(e) = outcome.error {
                    warn!(error = %e, "emulation failed");
                    self.errors.push(e);
                }
                if returns_fp {
                    outcome.final_state.xmm[0][0]
                } else {
                    outcome.final_state.regs[reg::RAX as usize]
                }
            }
            Err(e) => {
                warn!(error = %e, "emulation failed");
                self.errors.push(e);
                0
            }
        }
    }
}

impl Default for Rewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Rewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rewriter")
            .field("func", &self.config.func)
            .field("decoded_blocks", &self.dbbs.len())
            .field("captured_blocks", &self.cbbs.len())
            .field("generated", &self.generated)
            .finish()
    }
}

