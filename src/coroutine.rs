//! The non-deterministic predicate bridge.
//!
//! The engine's host-call is one-shot: a goal in, one continuation term
//! out. Multiple solutions are synthesized by handing the engine a
//! disjunction that re-invokes `$coro_next/2`, so the engine's own
//! backtracking pulls the host-side sequence lazily. `$coro_stop/1`
//! runs from `call_cleanup/2` when the choice point dies.

use crate::session::{Session, Subquery};
use crate::term::{domain_error, pi_term, type_error, Atom, Term};

/// Host state backing one non-deterministic predicate invocation.
pub(crate) struct Coroutine {
    /// The lazy sequence of continuation terms. Dropping it stops the
    /// coroutine.
    pub iter: Box<dyn Iterator<Item = Term> + Send>,
}

/// `'$coro_next'(+Id, ?Goal)`: pull one term from the sequence.
///
/// Exhaustion fails; otherwise the reply unifies the pulled term and
/// leaves a choice point for the next pull:
/// `call((Goal = T ; '$coro_next'(Id, Goal)))`.
pub(crate) fn sys_coro_next(session: &mut Session<'_>, subquery: Subquery, goal: &Term) -> Term {
    let Term::Compound(call) = goal else {
        return type_error("compound", goal.clone(), pi_term(Atom::new("$coro_next"), 2));
    };
    let Term::Int(id) = call.args[0] else {
        return domain_error("integer", call.args[0].clone(), call.pi());
    };

    match session.coro_next(subquery, id) {
        None => Term::atom("fail"),
        Some(term) => {
            let slot = call.args[1].clone();
            Atom::new("call")
                .of([Atom::new(";")
                    .of([
                        Atom::new("=").of([slot.clone(), term]).into(),
                        Atom::new("$coro_next").of([Term::Int(id), slot]).into(),
                    ])
                    .into()])
                .into()
        }
    }
}

/// `'$coro_stop'(+Id)`: drop the coroutine's state.
pub(crate) fn sys_coro_stop(session: &mut Session<'_>, subquery: Subquery, goal: &Term) -> Term {
    let Term::Compound(call) = goal else {
        return type_error("compound", goal.clone(), pi_term(Atom::new("$coro_stop"), 1));
    };
    let Term::Int(id) = call.args[0] else {
        return domain_error("integer", call.args[0].clone(), call.pi());
    };
    session.coro_stop(subquery, id);
    goal.clone()
}
