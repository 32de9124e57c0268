//! Per-subquery capture of the engine's stdout and stderr.
//!
//! Capture is a single engine-wide buffer pair, so attribution to the
//! right subquery depends on reading and resetting at every boundary
//! where control crosses the host/guest interface: after each host-call
//! reply and after each `pl_query`/`pl_redo` return. Each query owns
//! four pointer-size out-parameter cells in guest memory, allocated
//! once and reused for its whole lifetime.

use crate::error::Result;
use crate::machine::{subquery_state, Ctx, Raw, SubqueryKey};
use crate::memory::{self, PTR_SIZE};

/// Guest addresses of the four out-parameter cells `pl_capture_read`
/// fills: (stdout pointer, stdout length, stderr pointer, stderr
/// length).
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CaptureCells {
    pub out_ptr: u32,
    pub out_len: u32,
    pub err_ptr: u32,
    pub err_len: u32,
}

impl CaptureCells {
    pub fn alloc(raw: &Raw, ctx: &mut Ctx<'_>) -> Result<CaptureCells> {
        let cells = CaptureCells {
            out_ptr: memory::alloc(raw, ctx, PTR_SIZE)?,
            out_len: memory::alloc(raw, ctx, PTR_SIZE)?,
            err_ptr: memory::alloc(raw, ctx, PTR_SIZE)?,
            err_len: memory::alloc(raw, ctx, PTR_SIZE)?,
        };
        // Fresh allocations hold garbage; an empty capture read must
        // come back as (0, 0), not a wild pointer.
        for cell in [cells.out_ptr, cells.out_len, cells.err_ptr, cells.err_len] {
            memory::write_u32(raw, ctx, cell, 0)?;
        }
        Ok(cells)
    }

    pub fn release(self, raw: &Raw, ctx: &mut Ctx<'_>) -> Result<()> {
        memory::free(raw, ctx, self.out_ptr, PTR_SIZE)?;
        memory::free(raw, ctx, self.out_len, PTR_SIZE)?;
        memory::free(raw, ctx, self.err_ptr, PTR_SIZE)?;
        memory::free(raw, ctx, self.err_len, PTR_SIZE)?;
        Ok(())
    }
}

/// Read everything currently buffered engine-side and reset the
/// buffers, so successive reads never double-count.
fn read_and_reset(raw: &Raw, ctx: &mut Ctx<'_>, cells: CaptureCells) -> Result<(Vec<u8>, Vec<u8>)> {
    raw.pl_capture_read
        .call(
            &mut *ctx,
            (
                raw.interp,
                cells.out_ptr as i32,
                cells.out_len as i32,
                cells.err_ptr as i32,
                cells.err_len as i32,
            ),
        )
        .map_err(crate::error::Error::guest)?;

    let out_ptr = memory::read_u32(raw, ctx, cells.out_ptr)?;
    let out_len = memory::read_u32(raw, ctx, cells.out_len)?;
    let err_ptr = memory::read_u32(raw, ctx, cells.err_ptr)?;
    let err_len = memory::read_u32(raw, ctx, cells.err_len)?;

    let stdout = memory::read_range(raw, ctx, out_ptr, out_len)?;
    let stderr = memory::read_range(raw, ctx, err_ptr, err_len)?;

    raw.pl_capture_reset
        .call(&mut *ctx, raw.interp)
        .map_err(crate::error::Error::guest)?;

    Ok((stdout, stderr))
}

/// Drain the engine's capture buffers into the owning subquery's
/// accumulators.
pub(crate) fn drain_into(raw: &Raw, ctx: &mut Ctx<'_>, key: SubqueryKey) -> Result<()> {
    let Some(cells) = subquery_state(ctx.data_mut(), key).map(|state| state.cells) else {
        return Ok(());
    };
    let (stdout, stderr) = read_and_reset(raw, ctx, cells)?;
    if stdout.is_empty() && stderr.is_empty() {
        return Ok(());
    }

    let log_output = ctx.data().log_output;
    if log_output {
        if !stdout.is_empty() {
            tracing::debug!(target: "trealla::stdout", "{}", String::from_utf8_lossy(&stdout));
        }
        if !stderr.is_empty() {
            tracing::debug!(target: "trealla::stderr", "{}", String::from_utf8_lossy(&stderr));
        }
    }

    if let Some(state) = subquery_state(ctx.data_mut(), key) {
        state.stdout.extend_from_slice(&stdout);
        state.stderr.extend_from_slice(&stderr);
    }
    Ok(())
}
