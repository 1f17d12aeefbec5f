//! Two-pass (fixed-point) layout and encoding of captured blocks.

use crate::block::{CbbExit, CbbId};
use crate::error::{Result, RewriteError};
use crate::rewriter::Rewriter;

use respin_asm::encode::{encode_one, EncodeError};
use respin_asm::InstrKind;

use tracing::debug;

/// `movabs r11, target; call r11`, used when a residual call target is
/// beyond rel32 range of the generated code.
const FAR_CALL_LEN: usize = 13;

struct BlockBytes {
    bytes: Vec<u8>,
}

impl Rewriter {
    /// Lay out every captured block (entry block first, then creation
    /// order), encode them, resolve branch displacements and commit the
    /// result to code storage. Returns the entry address and total size.
    pub(crate) fn emit_blocks(&mut self, entry: CbbId) -> Result<(u64, usize)> {
        let base = self
            .storage
            .as_ref()
            .expect("storage mapped before emission")
            .reserve(0)?;

        // The entry block leads; everything else follows in creation
        // order, which matches first-emulation order.
        let mut order: Vec<CbbId> = Vec::with_capacity(self.cbbs.len());
        order.push(entry);
        order.extend((0..self.cbbs.len()).map(CbbId).filter(|id| *id != entry));

        // Start from a pessimistic layout (every branch long, every call
        // far). Displacement distances only shrink from there, so
        // re-encoding until sizes stabilize terminates.
        let mut starts: Vec<u64> = vec![base; self.cbbs.len()];
        let mut sizes: Vec<usize> = vec![0; self.cbbs.len()];
        {
            let mut cursor = base;
            for id in &order {
                starts[id.0] = cursor;
                let b = self.encode_cbb(*id, cursor, &starts, None, true)?;
                sizes[id.0] = b.bytes.len();
                cursor += b.bytes.len() as u64;
            }
        }

        let mut encoded: Vec<BlockBytes> = Vec::new();
        for round in 0.. {
            if round > 64 {
                return Err(RewriteError::Encode(EncodeError::BranchRange { disp: 0 }));
            }
            let mut cursor = base;
            for id in &order {
                starts[id.0] = cursor;
                cursor += sizes[id.0] as u64;
            }
            encoded.clear();
            let mut changed = false;
            for (pos, id) in order.iter().enumerate() {
                let next = order.get(pos + 1).copied();
                let b = self.encode_cbb(*id, starts[id.0], &starts, next, false)?;
                if b.bytes.len() != sizes[id.0] {
                    sizes[id.0] = b.bytes.len();
                    changed = true;
                }
                encoded.push(b);
            }
            if !changed {
                break;
            }
        }

        let storage = self.storage.as_mut().expect("storage mapped");
        let mut total = 0usize;
        for (id, block) in order.iter().zip(&encoded) {
            let at = storage.push(&block.bytes)?;
            debug_assert_eq!(at, starts[id.0]);
            self.cbbs[id.0].start = Some(at);
            total += block.bytes.len();
        }

        debug!(
            blocks = order.len(),
            bytes = total,
            base = format_args!("{base:#x}"),
            "emitted captured blocks"
        );
        Ok((base, total))
    }

    /// Encode one block as placed at `at`. `pessimistic` forces maximal
    /// branch encodings for the initial layout estimate.
    fn encode_cbb(
        &self,
        id: CbbId,
        at: u64,
        starts: &[u64],
        next_in_layout: Option<CbbId>,
        pessimistic: bool,
    ) -> Result<BlockBytes> {
        let cbb = &self.cbbs[id.0];
        let mut bytes: Vec<u8> = Vec::new();

        for instr in &cbb.instrs {
            let iat = at + bytes.len() as u64;
            match instr.kind {
                InstrKind::Call => {
                    let target = instr.dst.as_imm().expect("residual call target") as u64;
                    encode_call(&mut bytes, iat, target, pessimistic)?;
                }
                _ => encode_one(instr, iat, &mut bytes)?,
            }
        }

        match cbb.exit {
            CbbExit::Ret => bytes.push(0xc3),
            CbbExit::Indirect | CbbExit::Pending => {}
            CbbExit::Jump(target) => {
                // A jump to the next block in layout is a fallthrough.
                if next_in_layout != Some(target) || pessimistic {
                    let iat = at + bytes.len() as u64;
                    emit_jmp(&mut bytes, iat, starts[target.0], pessimistic);
                }
            }
            CbbExit::Branch {
                cond,
                taken,
                fallthrough,
            } => {
                let iat = at + bytes.len() as u64;
                emit_jcc(&mut bytes, iat, starts[taken.0], cond, pessimistic);
                if next_in_layout != Some(fallthrough) || pessimistic {
                    let iat = at + bytes.len() as u64;
                    emit_jmp(&mut bytes, iat, starts[fallthrough.0], pessimistic);
                }
            }
        }

        Ok(BlockBytes { bytes })
    }
}

fn emit_jmp(bytes: &mut Vec<u8>, at: u64, target: u64, long: bool) {
    let short = target.wrapping_sub(at + 2) as i64;
    if !long && i8::try_from(short).is_ok() {
        bytes.push(0xeb);
        bytes.push(short as u8);
    } else {
        let disp = target.wrapping_sub(at + 5) as i64 as i32;
        bytes.push(0xe9);
        bytes.extend_from_slice(&disp.to_le_bytes());
    }
}

fn emit_jcc(bytes: &mut Vec<u8>, at: u64, target: u64, cond: respin_asm::Cond, long: bool) {
    let short = target.wrapping_sub(at + 2) as i64;
    if !long && i8::try_from(short).is_ok() {
        bytes.push(0x70 | cond.nibble());
        bytes.push(short as u8);
    } else {
        let disp = target.wrapping_sub(at + 6) as i64 as i32;
        bytes.push(0x0f);
        bytes.push(0x80 | cond.nibble());
        bytes.extend_from_slice(&disp.to_le_bytes());
    }
}

/// A residual call either reaches its original target with rel32 or goes
/// through a scratch register.
fn encode_call(bytes: &mut Vec<u8>, at: u64, target: u64, pessimistic: bool) -> Result<()> {
    let disp = target.wrapping_sub(at + 5) as i64;
    if !pessimistic && i32::try_from(disp).is_ok() {
        bytes.push(0xe8);
        bytes.extend_from_slice(&(disp as i32).to_le_bytes());
        return Ok(());
    }
    if pessimistic {
        bytes.resize(bytes.len() + FAR_CALL_LEN, 0x90);
        return Ok(());
    }
    // movabs r11, target
    bytes.extend_from_slice(&[0x49, 0xbb]);
    bytes.extend_from_slice(&target.to_le_bytes());
    // call r11
    bytes.extend_from_slice(&[0x41, 0xff, 0xd3]);
    Ok(())
}
