//! Diagnostic error types for the trealla driver.
//!
//! Every failure a caller can observe is a variant of [`Error`], with
//! miette `#[diagnostic]` codes and help text so users know whether the
//! problem is their query, their host predicate, or the engine itself.

use miette::Diagnostic;
use thiserror::Error as ThisError;

use crate::term::Term;

/// Errors surfaced by interpreters, queries, and pools.
#[derive(Debug, ThisError, Diagnostic)]
pub enum Error {
    /// The query found no solutions.
    #[error("query failed: {query}")]
    #[diagnostic(
        code(trealla::query::failure),
        help(
            "The goal has no solutions. This is ordinary Prolog failure, \
             not a fault in the driver. Captured output (if any) is \
             attached to this error."
        )
    )]
    Failure {
        /// The original query goal text.
        query: String,
        /// Stdout captured while the goal was being proven.
        stdout: String,
        /// Stderr captured while the goal was being proven.
        stderr: String,
    },

    /// The engine raised an exception via `throw/1`.
    #[error("exception thrown: {ball}")]
    #[diagnostic(
        code(trealla::query::throw),
        help(
            "The query (or a predicate it called) threw this term as an \
             exception. Inspect the ball for the standard \
             error(Kind, Context) shape."
        )
    )]
    Throw {
        /// The thrown ball term.
        ball: Term,
        /// The original query goal text.
        query: String,
        /// Stdout captured up to the throw.
        stdout: String,
        /// Stderr captured up to the throw.
        stderr: String,
    },

    /// The engine produced a malformed answer envelope.
    #[error("protocol error: {message}")]
    #[diagnostic(
        code(trealla::wire::protocol),
        help(
            "The answer envelope from the engine could not be parsed \
             (missing framing or invalid JSON). This usually means the \
             engine binary and this driver disagree on the wire format."
        )
    )]
    Protocol { message: String },

    /// Allocation failed, a pointer went out of bounds, or the guest trapped.
    #[error("resource error: {message}")]
    #[diagnostic(
        code(trealla::guest::resource),
        help(
            "A low-level guest operation failed. If this was a trap, the \
             current query is dead; the interpreter usually remains usable, \
             but close it if subsequent queries misbehave."
        )
    )]
    Resource { message: String },

    /// A cancellation token fired.
    #[error("query canceled")]
    #[diagnostic(
        code(trealla::query::canceled),
        help(
            "The cancellation token associated with this query was \
             triggered. In-flight engine work is never preempted; the \
             query was stopped at the next host boundary."
        )
    )]
    Canceled,

    /// The interpreter has been closed.
    #[error("end of stream: interpreter is closed")]
    #[diagnostic(
        code(trealla::interp::closed),
        help("This interpreter was closed. Create a new one to keep querying.")
    )]
    Closed,

    /// `pl_consult` reported failure for a file.
    #[error("failed to consult file: {filename}")]
    #[diagnostic(
        code(trealla::interp::consult),
        help(
            "The engine could not load this file. Check that the path is \
             visible through the configured preopen directories and that \
             the file is valid Prolog."
        )
    )]
    ConsultFailed { filename: String },

    /// Invalid interpreter or pool configuration.
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(trealla::config::invalid),
        help("Check the Config/PoolConfig fields. {message}")
    )]
    Config { message: String },
}

impl Error {
    /// Wrap a wasmtime-level error (instantiation failure, trap, missing
    /// export) as a resource error.
    pub(crate) fn guest(err: impl std::fmt::Display) -> Self {
        Error::Resource {
            message: format!("{err}"),
        }
    }

    /// True when this error is ordinary Prolog failure (no solutions),
    /// as opposed to a defect in the query, the engine, or the driver.
    pub fn is_failure(&self) -> bool {
        matches!(self, Error::Failure { .. })
    }
}

/// Convenience alias for driver results.
pub type Result<T> = std::result::Result<T, Error>;
