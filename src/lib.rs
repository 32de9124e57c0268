//! # trealla
//!
//! Embedded Trealla Prolog: a driver hosting the Trealla engine
//! (compiled to WebAssembly) inside a Rust program.
//!
//! - Submit queries as text and iterate multiple answers through the
//!   engine's first-solution/redo protocol.
//! - Register host predicates — deterministic or non-deterministic —
//!   that Prolog can call mid-proof, including ones that issue nested
//!   queries on the same interpreter.
//! - Capture per-query stdout/stderr, correctly interleaved with host
//!   call-backs.
//! - Clone a loaded knowledgebase by memory snapshot and serve
//!   concurrent reads from a [`pool::Pool`] of replicas.
//!
//! The engine binary (`libtpl.wasm`) is not bundled; compile it once
//! into a [`Runtime`] and build interpreters from that.
//!
//! ## Example
//!
//! ```no_run
//! use trealla::{Config, Interpreter, Runtime, Term};
//!
//! # fn main() -> trealla::Result<()> {
//! let runtime = Runtime::from_file("libtpl.wasm")?;
//! let pl = Interpreter::new(&runtime, Config::default())?;
//!
//! pl.consult_text("user", "likes(prolog, wasm).")?;
//! for answer in pl.query("likes(prolog, X).") {
//!     let answer = answer?;
//!     println!("X = {}", answer.solution.get("X").unwrap());
//! }
//!
//! // A host predicate callable from Prolog:
//! pl.register("greet", 1, |_pl, _subquery, goal| {
//!     println!("goal: {goal}");
//!     Term::atom("true")
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod answer;
pub mod error;
pub mod interp;
pub mod pool;
pub mod query;
pub mod session;
pub mod term;

mod capture;
mod coroutine;
mod hostcall;
mod library;
mod machine;
mod memory;

pub use answer::{Answer, Substitution};
pub use error::{Error, Result};
pub use interp::{Config, Interpreter, Runtime, Stats, Stdio};
pub use pool::{Pool, PoolConfig};
pub use query::{CancelToken, Query, QueryOptions, SessionQuery};
pub use session::{Session, Subquery};
pub use term::{Atom, Compound, Term, Variable};
