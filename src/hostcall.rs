//! The guest-to-host imports: `trealla::host-call` and
//! `trealla::host-resume`.
//!
//! `host-call` is the single doorway through which the engine invokes
//! host predicates mid-proof. It decodes the goal, dispatches to the
//! registered predicate (handing it a [`Session`] backed by the
//! in-flight call), and writes the continuation term back into guest
//! memory. Host panics never escape this boundary; they become
//! `system_error(panic(Msg), PI)` throws.

use wasmtime::{AsContextMut, Caller, Linker};

use crate::capture;
use crate::error::{Error, Result};
use crate::machine::{find_subquery, HostState};
use crate::memory;
use crate::session::{Session, Subquery};
use crate::term::{
    existence_error, pi_term, term_from_json, throw_term, type_error, Atom, Term,
};

const WASM_TRUE: i32 = 1;
const WASM_FALSE: i32 = 0;

pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap("trealla", "host-call", host_call)
        .map_err(Error::guest)?;
    linker
        .func_wrap("trealla", "host-resume", host_resume)
        .map_err(Error::guest)?;
    Ok(())
}

/// `host-resume` is reserved: no resumption semantics in this design.
fn host_resume(
    _caller: Caller<'_, HostState>,
    _subquery: i32,
    _reply_pp: i32,
    _reply_lp: i32,
) -> i32 {
    WASM_FALSE
}

fn host_call(
    mut caller: Caller<'_, HostState>,
    subquery: i32,
    msg_ptr: i32,
    msg_size: i32,
    reply_pp: i32,
    reply_lp: i32,
) -> anyhow::Result<i32> {
    let raw = caller
        .data()
        .raw
        .clone()
        .ok_or_else(|| anyhow::anyhow!("host-call before engine binding"))?;
    let mut ctx = caller.as_context_mut();

    let Some(key) = find_subquery(&raw, &mut ctx, subquery)? else {
        anyhow::bail!("could not find subquery: {subquery}");
    };

    let message = memory::read_range(&raw, &ctx, msg_ptr as u32, msg_size as u32)?;
    let value: serde_json::Value = serde_json::from_slice(&message).map_err(|err| {
        anyhow::anyhow!(
            "bad host-call message: {err} (raw msg: {})",
            String::from_utf8_lossy(&message)
        )
    })?;
    let goal = term_from_json(&value)?;

    let host_call_pi: Term = pi_term(Atom::new("$host_call"), 2).into();

    // Only indicator-bearing terms (atoms and compounds) can name a
    // predicate.
    let Some(pi) = goal.pi() else {
        let ball = type_error("atomic", goal, host_call_pi);
        write_reply(&raw, &mut ctx, &ball.to_string(), reply_pp, reply_lp)?;
        return Ok(WASM_TRUE);
    };

    let indicator = pi.to_string();
    let Some(predicate) = ctx.data().procs.get(&indicator).cloned() else {
        tracing::debug!(predicate = %indicator, "host-call to unregistered predicate");
        let ball = existence_error("procedure", pi, host_call_pi);
        write_reply(&raw, &mut ctx, &ball.to_string(), reply_pp, reply_lp)?;
        return Ok(WASM_TRUE);
    };

    // Attribute output produced so far to this subquery before the
    // predicate runs (it may run nested queries of its own).
    capture::drain_into(&raw, &mut ctx, key)?;

    let continuation = {
        let mut session = Session::new(raw.clone(), ctx.as_context_mut());
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            predicate(&mut session, Subquery(subquery), &goal)
        }));
        match outcome {
            Ok(term) => term,
            Err(panic) => {
                let message = panic_message(&panic);
                tracing::warn!(predicate = %indicator, panic = %message, "host predicate panicked");
                throw_term(Atom::new("system_error").of([
                    Atom::new("panic").of([Term::string(message)]).into(),
                    pi.into(),
                ]))
            }
        }
    };

    write_reply(&raw, &mut ctx, &continuation.to_string(), reply_pp, reply_lp)?;
    capture::drain_into(&raw, &mut ctx, key)?;
    Ok(WASM_TRUE)
}

/// Allocate the continuation text in guest memory and write its
/// location through the out-parameters. The engine frees the reply; the
/// reported length excludes the NUL terminator.
fn write_reply(
    raw: &crate::machine::Raw,
    ctx: &mut crate::machine::Ctx<'_>,
    text: &str,
    reply_pp: i32,
    reply_lp: i32,
) -> Result<()> {
    let reply = memory::write_cstring(raw, ctx, text)?;
    memory::write_u32(raw, ctx, reply_pp as u32, reply.ptr)?;
    memory::write_u32(raw, ctx, reply_lp as u32, reply.size - 1)?;
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic".to_owned()
    }
}
