//! Builders for the standard Prolog error balls host predicates throw.
//!
//! Each helper produces the conventional `error(Kind, Context)` shape
//! wrapped under `throw/1`, ready to return from a host predicate as a
//! continuation term.

use super::{Atom, Term};

/// Wrap a ball under `throw/1`.
pub fn throw_term(ball: impl Into<Term>) -> Term {
    Atom::new("throw").of([ball.into()]).into()
}

fn error_term(kind: Term, context: impl Into<Term>) -> Term {
    throw_term(Atom::new("error").of([kind, context.into()]))
}

/// `throw(error(type_error(Expected, Got), Context))`.
pub fn type_error(expected: &str, got: impl Into<Term>, context: impl Into<Term>) -> Term {
    error_term(
        Atom::new("type_error")
            .of([Term::atom(expected), got.into()])
            .into(),
        context,
    )
}

/// `throw(error(domain_error(Domain, Got), Context))`.
pub fn domain_error(domain: &str, got: impl Into<Term>, context: impl Into<Term>) -> Term {
    error_term(
        Atom::new("domain_error")
            .of([Term::atom(domain), got.into()])
            .into(),
        context,
    )
}

/// `throw(error(existence_error(Kind, Culprit), Context))`.
pub fn existence_error(kind: &str, culprit: impl Into<Term>, context: impl Into<Term>) -> Term {
    error_term(
        Atom::new("existence_error")
            .of([Term::atom(kind), culprit.into()])
            .into(),
        context,
    )
}

/// `throw(error(permission_error(Operation, Culprit), Context))`.
pub fn permission_error(operation: &str, culprit: impl Into<Term>, context: impl Into<Term>) -> Term {
    error_term(
        Atom::new("permission_error")
            .of([Term::atom(operation), culprit.into()])
            .into(),
        context,
    )
}

/// `throw(error(resource_error(Resource), Context))`.
pub fn resource_error(resource: impl Into<Term>, context: impl Into<Term>) -> Term {
    error_term(Atom::new("resource_error").of([resource.into()]).into(), context)
}

/// `throw(error(system_error, Context))`.
pub fn system_error(context: impl Into<Term>) -> Term {
    error_term(Term::atom("system_error"), context)
}
