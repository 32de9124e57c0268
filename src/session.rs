//! The session view: operations against a live engine instance.
//!
//! A [`Session`] is how all engine work happens, whether the caller is
//! the interpreter's public API (which builds one under its lock), a
//! pool transaction, or a host predicate re-entering the interpreter
//! mid-proof (which gets one backed by the in-flight wasmtime call).
//! Because a session borrows the store context, a host predicate cannot
//! smuggle it into a longer-lived closure; the borrow ends when the
//! predicate returns.

use std::fmt;
use std::sync::Arc;

use crate::answer::Answer;
use crate::coroutine::Coroutine;
use crate::error::{Error, Result};
use crate::interp::Stats;
use crate::machine::{find_subquery, subquery_state, Ctx, Raw};
use crate::memory;
use crate::query::{QueryOptions, SessionQuery};
use crate::term::{numbervars, pi_term, Atom, Term};

/// An opaque handle naming an in-flight proof inside the engine.
///
/// Unique while the subquery is alive; values may be reused afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subquery(pub(crate) i32);

impl fmt::Display for Subquery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subquery:{}", self.0)
    }
}

/// A deterministic host predicate: receives the called goal, returns a
/// continuation term.
///
/// Continuation semantics:
/// - a compound matching the call's indicator unifies with the call
/// - the atom `true` succeeds without binding anything
/// - the atom `fail` fails the goal
/// - `throw(Ball)` raises `Ball`
/// - `call(Goal)` replaces the call with `Goal`
pub(crate) type HostFn =
    Arc<dyn Fn(&mut Session<'_>, Subquery, &Term) -> Term + Send + Sync>;

/// A non-deterministic host predicate: returns a lazy sequence of
/// continuation terms, pulled by the engine through backtracking.
pub(crate) type NondetFn = Arc<
    dyn Fn(&mut Session<'_>, Subquery, &Term) -> Box<dyn Iterator<Item = Term> + Send>
        + Send
        + Sync,
>;

/// A view of one interpreter, valid for the duration of a lock hold or
/// a single host call.
pub struct Session<'a> {
    pub(crate) raw: Raw,
    pub(crate) ctx: Ctx<'a>,
}

impl<'a> Session<'a> {
    pub(crate) fn new(raw: Raw, ctx: Ctx<'a>) -> Session<'a> {
        Session { raw, ctx }
    }

    /// Run a query, iterating answers through the returned cursor.
    pub fn query<'s>(&'s mut self, goal: &str) -> SessionQuery<'s, 'a> {
        self.query_with(goal, QueryOptions::default())
    }

    /// Run a query with options (variable bindings, cancellation).
    pub fn query_with<'s>(&'s mut self, goal: &str, options: QueryOptions) -> SessionQuery<'s, 'a> {
        SessionQuery::start(self, goal, options)
    }

    /// Run a query and take its first answer, discarding the rest.
    pub fn query_once(&mut self, goal: &str) -> Result<Answer> {
        let mut query = self.query(goal);
        match query.next() {
            Some(result) => result,
            None => Err(Error::Failure {
                query: goal.to_owned(),
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }

    /// Load Prolog text into a module. Use `user` for the global module.
    pub fn consult_text(&mut self, module: &str, text: &str) -> Result<()> {
        let goal: Term = Atom::new("load_text")
            .of([
                Term::string(text),
                Term::List(vec![Atom::new("module").of([Term::atom(module)]).into()]),
            ])
            .into();
        self.query_once(&goal.to_string()).map(|_| ())
    }

    /// Load a Prolog file by path (resolved inside the guest
    /// filesystem).
    pub fn consult(&mut self, filename: &str) -> Result<()> {
        let raw = self.raw.clone();
        let path = memory::write_cstring(&raw, &mut self.ctx, filename)?;
        let ret = raw
            .pl_consult
            .call(&mut self.ctx, (raw.interp, path.ptr as i32));
        path.free(&raw, &mut self.ctx)?;
        if ret.map_err(Error::guest)? == 0 {
            return Err(Error::ConsultFailed {
                filename: filename.to_owned(),
            });
        }
        Ok(())
    }

    /// Register a deterministic host predicate under `name/arity`.
    pub fn register(
        &mut self,
        name: &str,
        arity: usize,
        predicate: impl Fn(&mut Session<'_>, Subquery, &Term) -> Term + Send + Sync + 'static,
    ) -> Result<()> {
        self.register_arc(name, arity, Arc::new(predicate))
    }

    /// Register a non-deterministic host predicate under `name/arity`.
    ///
    /// Each invocation becomes a coroutine the engine drains through its
    /// own backtracking; the sequence is dropped when the choice point
    /// is cut or the query closes.
    pub fn register_nondet(
        &mut self,
        name: &str,
        arity: usize,
        predicate: impl Fn(&mut Session<'_>, Subquery, &Term) -> Box<dyn Iterator<Item = Term> + Send>
            + Send
            + Sync
            + 'static,
    ) -> Result<()> {
        let predicate: NondetFn = Arc::new(predicate);
        let shim: HostFn = Arc::new(move |session, subquery, goal| {
            let sequence = predicate(session, subquery, goal);
            let id = session.coro_start(subquery, sequence);
            Atom::new("call")
                .of([Atom::new("call_cleanup")
                    .of([
                        Atom::new("$coro_next")
                            .of([Term::Int(id), goal.clone()])
                            .into(),
                        Atom::new("$coro_stop").of([Term::Int(id)]).into(),
                    ])
                    .into()])
                .into()
        });
        self.register_arc(name, arity, shim)
    }

    pub(crate) fn register_arc(&mut self, name: &str, arity: usize, proc: HostFn) -> Result<()> {
        let functor = Atom::new(name);
        let pi = pi_term(functor.clone(), arity as i64);
        self.ctx.data_mut().procs.insert(pi.to_string(), proc);

        // Route calls through host_rpc/1, which forwards them over the
        // host-call import.
        let head: Term = functor.of(numbervars(arity)).into();
        let clause = format!("{head} :- host_rpc({head}).");
        self.consult_text("user", &clause)
    }

    /// Diagnostic counters for this interpreter.
    pub fn stats(&self) -> Stats {
        Stats {
            memory_size: self.raw.memory.data_size(&self.ctx),
        }
    }

    /// Start a coroutine for a non-deterministic predicate invocation,
    /// owned by `subquery`.
    pub(crate) fn coro_start(
        &mut self,
        subquery: Subquery,
        iter: Box<dyn Iterator<Item = Term> + Send>,
    ) -> i64 {
        let raw = self.raw.clone();
        let state = self.ctx.data_mut();
        state.next_coro += 1;
        let id = state.next_coro;
        state.coros.insert(id, Coroutine { iter });

        if let Ok(Some(key)) = find_subquery(&raw, &mut self.ctx, subquery.0) {
            if let Some(owner) = subquery_state(self.ctx.data_mut(), key) {
                owner.coros.insert(id);
            }
        }
        id
    }

    /// Pull the next term from a coroutine. Exhaustion (or an unknown
    /// id) removes it from the registry and yields `None`.
    pub(crate) fn coro_next(&mut self, subquery: Subquery, id: i64) -> Option<Term> {
        let Some(mut coro) = self.ctx.data_mut().coros.remove(&id) else {
            return None;
        };
        match coro.iter.next() {
            Some(term) => {
                self.ctx.data_mut().coros.insert(id, coro);
                Some(term)
            }
            None => {
                self.detach_coro(subquery, id);
                None
            }
        }
    }

    /// Drop a coroutine's state.
    pub(crate) fn coro_stop(&mut self, subquery: Subquery, id: i64) {
        self.ctx.data_mut().coros.remove(&id);
        self.detach_coro(subquery, id);
    }

    fn detach_coro(&mut self, subquery: Subquery, id: i64) {
        let raw = self.raw.clone();
        if let Ok(Some(key)) = find_subquery(&raw, &mut self.ctx, subquery.0) {
            if let Some(owner) = subquery_state(self.ctx.data_mut(), key) {
                owner.coros.remove(&id);
            }
        }
    }
}
