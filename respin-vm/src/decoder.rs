//! Block-level decoding with per-session memoization.

use crate::block::{Dbb, DbbId};
use crate::error::{Result, RewriteError};
use crate::rewriter::Rewriter;

use respin_asm::decode::{decode_one, MAX_INSTR_LEN};

use std::fmt::Write as _;

use tracing::debug;

/// View the process memory one instruction lives in.
///
/// # Safety
///
/// `addr` must point at readable mapped code; the caller of
/// `rewrite`/`emulate` vouches for the function address it passes in.
unsafe fn instr_window(addr: u64) -> &'static [u8] {
    std::slice::from_raw_parts(addr as *const u8, MAX_INSTR_LEN)
}

impl Rewriter {
    /// Decode (or fetch the memoized) basic block starting at `addr`.
    ///
    /// Idempotent per session: a second call with the same address
    /// returns the same block.
    pub(crate) fn decode_block(&mut self, addr: u64) -> Result<DbbId> {
        if let Some(id) = self.dbb_index.get(&addr) {
            return Ok(*id);
        }
        if self.dbbs.len() >= self.config.caps.decode_blocks {
            return Err(RewriteError::DecodedBlockCapacity(
                self.config.caps.decode_blocks,
            ));
        }

        let start_index = self.dec_instrs.len();
        let mut cursor = addr;
        let exit = loop {
            if self.dec_instrs.len() >= self.config.caps.decode_instrs {
                return Err(RewriteError::DecodedInstrCapacity(
                    self.config.caps.decode_instrs,
                ));
            }
            let bytes = unsafe { instr_window(cursor) };
            let instr = decode_one(bytes, cursor)?;
            if self.config.verbose_decode {
                debug!(instr = %instr, "decoded");
            }
            cursor = instr.end();
            let exit = instr.is_exit().then_some(instr.kind);
            self.dec_instrs.push(instr);
            if let Some(kind) = exit {
                break kind;
            }
        };

        let id = DbbId(self.dbbs.len());
        self.dbbs.push(Dbb {
            addr,
            size: cursor - addr,
            instrs: start_index..self.dec_instrs.len(),
            exit,
        });
        self.dbb_index.insert(addr, id);
        debug!(
            addr = format_args!("{addr:#x}"),
            instrs = self.dbbs[id.0].instrs.len(),
            exit = %exit,
            "decoded block"
        );
        Ok(id)
    }

    /// Decode `count` instructions starting at `addr` and return the
    /// formatted listing, one instruction per line.
    pub fn decode_print(&mut self, addr: u64, count: usize) -> Result<String> {
        let mut out = String::new();
        let mut cursor = addr;
        for _ in 0..count {
            let bytes = unsafe { instr_window(cursor) };
            let instr = decode_one(bytes, cursor)?;
            writeln!(out, "{instr}").expect("writing to a string");
            cursor = instr.end();
        }
        Ok(out)
    }
}
