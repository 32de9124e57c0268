//! The query iterator: drives the engine's first-solution/redo protocol.
//!
//! A query moves through `pl_query` (prime), `pl_redo` (further
//! solutions), and `pl_done` (release). After every guest call the
//! engine's capture buffers are drained into the query's own, and each
//! drained segment is parsed as one answer envelope. Output produced
//! between two answers is attributed to the later one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::answer::{parse_answer, Answer, Substitution};
use crate::capture::{self, CaptureCells};
use crate::error::{Error, Result};
use crate::interp::{GateToken, Interpreter};
use crate::machine::{SubqueryKey, SubqueryState};
use crate::memory::{self, PTR_SIZE};
use crate::session::Session;
use crate::term::{escape_query, Term};

/// A token that cancels queries at their next host/guest boundary.
///
/// The engine runs synchronously, so a cancellation never interrupts an
/// in-flight `pl_query`/`pl_redo`; it is observed between them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Optional parameters for a query.
#[derive(Clone, Default)]
pub struct QueryOptions {
    binds: Vec<(String, Term)>,
    cancel: Option<CancelToken>,
}

impl QueryOptions {
    pub fn new() -> QueryOptions {
        QueryOptions::default()
    }

    /// Bind a variable to a term, as if `Var = Term,` were prepended to
    /// the goal. Binding the same variable again overwrites it.
    pub fn bind(mut self, variable: &str, value: impl Into<Term>) -> QueryOptions {
        let value = value.into();
        if let Some(entry) = self.binds.iter_mut().find(|(name, _)| name == variable) {
            entry.1 = value;
        } else {
            self.binds.push((variable.to_owned(), value));
        }
        self
    }

    /// Bind every variable of a substitution.
    pub fn binding(mut self, substitution: Substitution) -> QueryOptions {
        for (name, value) in substitution {
            self = self.bind(&name, value);
        }
        self
    }

    /// Attach a cancellation token.
    pub fn cancel(mut self, token: CancelToken) -> QueryOptions {
        self.cancel = Some(token);
        self
    }

    fn reify(&self, goal: &str) -> String {
        if self.binds.is_empty() {
            return goal.to_owned();
        }
        let mut text = String::new();
        for (name, value) in &self.binds {
            text.push_str(name);
            text.push_str(" = ");
            text.push_str(&value.to_string());
            text.push_str(", ");
        }
        text.push_str(goal);
        text
    }
}

/// Wrap a goal in the toplevel shim that emits the framed answer
/// envelope.
fn wrap_goal(goal: &str) -> String {
    format!("wasm:js_ask({}).", escape_query(goal))
}

/// The subquery state machine, shared by top-level and re-entrant
/// queries. All driving happens through a [`Session`].
struct Cursor {
    goal: String,
    /// Live engine handle; `None` once the engine invalidated it.
    handle: Option<i32>,
    /// Key of our entry in the running registry, while present.
    registered: Option<i32>,
    cells: Option<CaptureCells>,
    pending: Option<Answer>,
    err: Option<Error>,
    done: bool,
    finalized: bool,
}

impl Cursor {
    fn new(goal: String) -> Cursor {
        Cursor {
            goal,
            handle: None,
            registered: None,
            cells: None,
            pending: None,
            err: None,
            done: false,
            finalized: false,
        }
    }

    fn fail(&mut self, err: Error) {
        if self.err.is_none() {
            self.err = Some(err);
        }
        self.done = true;
    }

    /// Submit the goal and stage the first solution (or the failure or
    /// throw the engine reported for it).
    fn prime(&mut self, session: &mut Session<'_>) {
        let raw = session.raw.clone();
        let wrapped = wrap_goal(&self.goal);

        let goal_str = match memory::write_cstring(&raw, &mut session.ctx, &wrapped) {
            Ok(s) => s,
            Err(err) => return self.fail(err),
        };
        let handle_cell = match memory::alloc(&raw, &mut session.ctx, PTR_SIZE) {
            Ok(p) => p,
            Err(err) => {
                let _ = goal_str.free(&raw, &mut session.ctx);
                return self.fail(err);
            }
        };
        // The engine fills the cell before any host-call can observe
        // it; start from zero so a stale value can't alias a handle.
        if let Err(err) = memory::write_u32(&raw, &mut session.ctx, handle_cell, 0) {
            let _ = goal_str.free(&raw, &mut session.ctx);
            return self.fail(err);
        }
        let cells = match CaptureCells::alloc(&raw, &mut session.ctx) {
            Ok(c) => c,
            Err(err) => {
                let _ = goal_str.free(&raw, &mut session.ctx);
                return self.fail(err);
            }
        };
        self.cells = Some(cells);

        session
            .ctx
            .data_mut()
            .spawning
            .insert(handle_cell as i32, SubqueryState::new(cells));

        let ret = raw.pl_query.call(
            &mut session.ctx,
            (raw.interp, goal_str.ptr as i32, handle_cell as i32, 0),
        );

        let state = session
            .ctx
            .data_mut()
            .spawning
            .remove(&(handle_cell as i32))
            .unwrap_or_default();

        match ret {
            Err(trap) => {
                tracing::warn!(goal = %self.goal, error = %trap, "engine trapped during pl_query");
                self.adopt(session, 0, state);
                let _ = goal_str.free(&raw, &mut session.ctx);
                let _ = memory::free(&raw, &mut session.ctx, handle_cell, PTR_SIZE);
                self.fail(Error::guest(trap));
                self.release(session);
            }
            Ok(ret) => {
                let _ = goal_str.free(&raw, &mut session.ctx);
                let handle_read = memory::read_u32(&raw, &session.ctx, handle_cell);
                let _ = memory::free(&raw, &mut session.ctx, handle_cell, PTR_SIZE);
                let handle = match handle_read {
                    Ok(h) => h as i32,
                    Err(err) => {
                        self.adopt(session, 0, state);
                        self.fail(err);
                        self.release(session);
                        return;
                    }
                };

                self.done = ret == 0;
                if !self.done {
                    self.handle = Some(handle);
                }
                self.adopt(session, handle, state);

                if let Err(err) =
                    capture::drain_into(&raw, &mut session.ctx, SubqueryKey::Running(handle))
                {
                    self.fail(err);
                    self.release(session);
                    return;
                }

                self.consume(session, true);
                if self.done {
                    self.release(session);
                }
            }
        }
    }

    /// Move our subquery state into the running registry under `handle`.
    fn adopt(&mut self, session: &mut Session<'_>, handle: i32, state: SubqueryState) {
        session.ctx.data_mut().running.insert(handle, state);
        self.registered = Some(handle);
    }

    /// Ask the engine for another solution.
    fn redo(&mut self, session: &mut Session<'_>) {
        let raw = session.raw.clone();
        let Some(handle) = self.handle else {
            self.done = true;
            return;
        };

        match raw.pl_redo.call(&mut session.ctx, handle) {
            Err(trap) => {
                tracing::warn!(goal = %self.goal, error = %trap, "engine trapped during pl_redo");
                self.fail(Error::guest(trap));
                self.release(session);
            }
            Ok(ret) => {
                self.done = ret == 0;
                if self.done {
                    // The handle is invalid once the engine reports no
                    // more solutions; pl_done must not see it.
                    self.handle = None;
                }
                if let Err(err) =
                    capture::drain_into(&raw, &mut session.ctx, SubqueryKey::Running(handle))
                {
                    self.fail(err);
                    self.release(session);
                    return;
                }
                self.consume(session, false);
                if self.done {
                    self.release(session);
                }
            }
        }
    }

    /// Parse the drained capture buffers as one answer envelope.
    ///
    /// Failure on the first solve is reported to the caller; failure on
    /// a redo is ordinary exhaustion.
    fn consume(&mut self, session: &mut Session<'_>, first: bool) {
        let Some(registered) = self.registered else {
            return;
        };
        let Some((stdout, stderr)) = session
            .ctx
            .data_mut()
            .running
            .get_mut(&registered)
            .map(|state| {
                (
                    std::mem::take(&mut state.stdout),
                    std::mem::take(&mut state.stderr),
                )
            })
        else {
            return;
        };

        match parse_answer(&self.goal, &stdout, &stderr) {
            Ok(answer) => self.pending = Some(answer),
            Err(err @ Error::Failure { .. }) => {
                self.done = true;
                if first {
                    self.err = Some(err);
                }
            }
            Err(err) => self.fail(err),
        }
    }

    /// Release everything this cursor owns: the engine subquery, the
    /// registry entry, the coroutines it opened, and the capture cells.
    /// Idempotent.
    fn release(&mut self, session: &mut Session<'_>) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.done = true;
        let raw = session.raw.clone();

        if let Some(handle) = self.handle.take() {
            let _ = raw.pl_done.call(&mut session.ctx, handle);
        }

        if let Some(registered) = self.registered.take() {
            if let Some(state) = session.ctx.data_mut().running.remove(&registered) {
                for id in state.coros {
                    session.ctx.data_mut().coros.remove(&id);
                }
            }
        }

        if let Some(cells) = self.cells.take() {
            let _ = cells.release(&raw, &mut session.ctx);
        }
    }
}

/// A top-level query iterator. Locks its interpreter for each step.
///
/// Dropping a query releases its subquery and every resource it owns;
/// exhausting it does the same eagerly.
pub struct Query<'pl> {
    interp: &'pl Interpreter,
    cursor: Cursor,
    cancel: Option<CancelToken>,
    _token: Option<GateToken>,
    dead: bool,
}

impl<'pl> Query<'pl> {
    pub(crate) fn start(
        interp: &'pl Interpreter,
        goal: &str,
        options: QueryOptions,
        token: Option<GateToken>,
    ) -> Query<'pl> {
        let mut cursor = Cursor::new(options.reify(goal));
        if options.cancel.as_ref().is_some_and(CancelToken::is_canceled) {
            cursor.fail(Error::Canceled);
        } else if let Err(err) = interp.with_session(|session| cursor.prime(session)) {
            cursor.fail(err);
        }
        Query {
            interp,
            cursor,
            cancel: options.cancel,
            _token: token,
            dead: false,
        }
    }

    /// Compute the next solution.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<Answer>> {
        if self.dead {
            return None;
        }

        if self.cancel.as_ref().is_some_and(CancelToken::is_canceled) {
            let _ = self.close();
            self.dead = true;
            return Some(Err(Error::Canceled));
        }

        if let Some(err) = self.cursor.err.take() {
            self.dead = true;
            return Some(Err(err));
        }
        if let Some(answer) = self.cursor.pending.take() {
            return Some(Ok(answer));
        }
        if self.cursor.done {
            return None;
        }

        let cursor = &mut self.cursor;
        if let Err(err) = self.interp.with_session(|session| cursor.redo(session)) {
            self.dead = true;
            return Some(Err(err));
        }

        if let Some(err) = self.cursor.err.take() {
            self.dead = true;
            return Some(Err(err));
        }
        self.cursor.pending.take().map(Ok)
    }

    /// Release the query's resources. Unnecessary after exhaustion, but
    /// harmless.
    pub fn close(&mut self) -> Result<()> {
        if self.cursor.finalized {
            return Ok(());
        }
        let cursor = &mut self.cursor;
        self.interp.with_session(|session| cursor.release(session))
    }
}

impl Iterator for Query<'_> {
    type Item = Result<Answer>;

    fn next(&mut self) -> Option<Self::Item> {
        Query::next(self)
    }
}

impl Drop for Query<'_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A query iterated from inside a session (a pool transaction or a
/// host predicate re-entering the interpreter). Never takes the outer
/// lock and never touches the concurrency gate.
pub struct SessionQuery<'s, 'a> {
    session: &'s mut Session<'a>,
    cursor: Cursor,
    cancel: Option<CancelToken>,
    dead: bool,
}

impl<'s, 'a> SessionQuery<'s, 'a> {
    pub(crate) fn start(
        session: &'s mut Session<'a>,
        goal: &str,
        options: QueryOptions,
    ) -> SessionQuery<'s, 'a> {
        let mut cursor = Cursor::new(options.reify(goal));
        if options.cancel.as_ref().is_some_and(CancelToken::is_canceled) {
            cursor.fail(Error::Canceled);
        } else {
            cursor.prime(session);
        }
        SessionQuery {
            session,
            cursor,
            cancel: options.cancel,
            dead: false,
        }
    }

    /// Compute the next solution.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<Answer>> {
        if self.dead {
            return None;
        }
        if self.cancel.as_ref().is_some_and(CancelToken::is_canceled) {
            self.cursor.release(self.session);
            self.dead = true;
            return Some(Err(Error::Canceled));
        }
        if let Some(err) = self.cursor.err.take() {
            self.dead = true;
            return Some(Err(err));
        }
        if let Some(answer) = self.cursor.pending.take() {
            return Some(Ok(answer));
        }
        if self.cursor.done {
            return None;
        }

        self.cursor.redo(self.session);

        if let Some(err) = self.cursor.err.take() {
            self.dead = true;
            return Some(Err(err));
        }
        self.cursor.pending.take().map(Ok)
    }

    /// Release the query's resources.
    pub fn close(&mut self) {
        self.cursor.release(self.session);
    }
}

impl Iterator for SessionQuery<'_, '_> {
    type Item = Result<Answer>;

    fn next(&mut self) -> Option<Self::Item> {
        SessionQuery::next(self)
    }
}

impl Drop for SessionQuery<'_, '_> {
    fn drop(&mut self) {
        self.cursor.release(self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Atom;

    #[test]
    fn goal_wrapping_escapes_and_terminates() {
        assert_eq!(wrap_goal("true."), r#"wasm:js_ask("true.")."#);
        assert_eq!(
            wrap_goal(r#"greet("hi")."#),
            r#"wasm:js_ask("greet(\"hi\").")."#
        );
        assert_eq!(wrap_goal("a,\nb."), r#"wasm:js_ask("a, b.")."#);
    }

    #[test]
    fn bind_reifies_in_front_of_the_goal() {
        let options = QueryOptions::new()
            .bind("X", 123i64)
            .bind("Z", Term::Atom(Atom::new("abc")));
        assert_eq!(options.reify("Y = X."), "X = 123, Z = abc, Y = X.");
    }

    #[test]
    fn bind_overwrites_earlier_values() {
        let options = QueryOptions::new().bind("X", -1i64).bind("X", 123i64);
        assert_eq!(options.reify("Y = X."), "X = 123, Y = X.");
    }

    #[test]
    fn binding_applies_a_substitution() {
        let mut sub = Substitution::new();
        sub.insert("A", Term::Int(1));
        sub.insert("B", Term::string("two"));
        let options = QueryOptions::new().binding(sub);
        assert_eq!(options.reify("go."), r#"A = 1, B = "two", go."#);
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());
        let clone = token.clone();
        assert!(clone.is_canceled());
    }
}
