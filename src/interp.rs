//! The public interpreter: one engine instance behind one lock.
//!
//! At most one operation runs against an interpreter at a time; every
//! entry point locks the machine and works through a [`Session`]. Host
//! predicates re-entering mid-proof get a session that bypasses the
//! lock (it is already held by the call that reached them).

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};

use wasmtime::{Engine, Module};

use crate::answer::Answer;
use crate::error::{Error, Result};
use crate::library;
use crate::machine::Machine;
use crate::query::{Query, QueryOptions};
use crate::session::{Session, Subquery};
use crate::term::Term;

/// What to do with the guest's WASI stdio (the streams the engine uses
/// outside of query capture, e.g. banners).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stdio {
    /// Discard it.
    #[default]
    Discard,
    /// Inherit the host process's stdout/stderr.
    Inherit,
}

/// Interpreter configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Mount this host path at `/` of the guest filesystem.
    pub preopen_dir: Option<PathBuf>,
    /// Mount additional guest directories: (alias, host path).
    pub map_dirs: Vec<(String, PathBuf)>,
    /// Guest library search root (the engine's `--library` flag).
    pub library_path: Option<String>,
    /// Enable tracing for all queries (the engine's `-t` flag). Traces
    /// write to the query's stderr stream.
    pub trace: bool,
    /// Suppress engine warning messages (the engine's `-q` flag).
    pub quiet: bool,
    /// Cap on simultaneously live queries per interpreter. Pending
    /// queries hold memory even though only one executes at a time.
    /// 0 disables the cap.
    pub max_concurrency: usize,
    /// Disposition of the guest's un-captured stdio.
    pub stdio: Stdio,
    /// Forward captured query output to `tracing` debug events
    /// (targets `trealla::stdout` and `trealla::stderr`).
    pub log_output: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            preopen_dir: None,
            map_dirs: Vec::new(),
            library_path: None,
            trace: false,
            quiet: false,
            max_concurrency: 256,
            stdio: Stdio::Discard,
            log_output: false,
        }
    }
}

/// Diagnostic information about an interpreter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Current guest memory size in bytes.
    pub memory_size: usize,
}

/// The compiled engine module, shared by every interpreter built from
/// it. Compile once, instantiate many times.
#[derive(Clone)]
pub struct Runtime {
    engine: Engine,
    module: Module,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    /// Compile an engine binary (`libtpl.wasm`) from bytes.
    pub fn new(wasm: impl AsRef<[u8]>) -> Result<Runtime> {
        let engine = Engine::default();
        let module = Module::new(&engine, wasm.as_ref()).map_err(|err| Error::Config {
            message: format!("invalid engine module: {err}"),
        })?;
        Ok(Runtime { engine, module })
    }

    /// Compile an engine binary from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Runtime> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| Error::Config {
            message: format!("failed to read {}: {err}", path.display()),
        })?;
        Runtime::new(bytes)
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }
}

/// A bounded token pool limiting simultaneously live queries.
pub(crate) struct Gate {
    tokens: mpsc::Sender<()>,
    idle: Mutex<mpsc::Receiver<()>>,
}

impl Gate {
    fn new(capacity: usize) -> Gate {
        let (tokens, idle) = mpsc::channel();
        for _ in 0..capacity {
            let _ = tokens.send(());
        }
        Gate {
            tokens,
            idle: Mutex::new(idle),
        }
    }

    /// Take a token, blocking until one is free.
    fn acquire(&self) -> GateToken {
        let idle = self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = idle.recv();
        GateToken {
            tokens: self.tokens.clone(),
        }
    }
}

/// A held concurrency token; returns itself to the gate on drop.
pub(crate) struct GateToken {
    tokens: mpsc::Sender<()>,
}

impl Drop for GateToken {
    fn drop(&mut self) {
        let _ = self.tokens.send(());
    }
}

/// A Prolog interpreter hosted in a WebAssembly guest.
pub struct Interpreter {
    machine: Mutex<Option<Machine>>,
    gate: Option<Gate>,
}

impl Interpreter {
    /// Boot a fresh interpreter and load the built-in host predicates.
    pub fn new(runtime: &Runtime, config: Config) -> Result<Interpreter> {
        let mut machine = Machine::boot(runtime, &config)?;
        {
            let mut session = machine.session();
            library::load_builtins(&mut session)?;
        }
        let gate = (config.max_concurrency > 0).then(|| Gate::new(config.max_concurrency));
        Ok(Interpreter {
            machine: Mutex::new(Some(machine)),
            gate,
        })
    }

    /// Execute a query, returning an iterator over its answers.
    pub fn query(&self, goal: &str) -> Query<'_> {
        self.query_with(goal, QueryOptions::default())
    }

    /// Execute a query with options.
    pub fn query_with(&self, goal: &str, options: QueryOptions) -> Query<'_> {
        let token = self.gate.as_ref().map(Gate::acquire);
        Query::start(self, goal, options, token)
    }

    /// Execute a query, returning its first answer and discarding any
    /// others.
    pub fn query_once(&self, goal: &str) -> Result<Answer> {
        let mut query = self.query(goal);
        let first = query.next();
        let _ = query.close();
        match first {
            Some(result) => result,
            None => Err(Error::Failure {
                query: goal.to_owned(),
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }

    /// Load a Prolog file by path (resolved in the guest filesystem).
    pub fn consult(&self, filename: &str) -> Result<()> {
        self.with_session(|session| session.consult(filename))?
    }

    /// Load Prolog text into a module. Use `user` for the global
    /// module.
    pub fn consult_text(&self, module: &str, text: &str) -> Result<()> {
        self.with_session(|session| session.consult_text(module, text))?
    }

    /// Register a deterministic host predicate under `name/arity`.
    pub fn register(
        &self,
        name: &str,
        arity: usize,
        predicate: impl Fn(&mut Session<'_>, Subquery, &Term) -> Term + Send + Sync + 'static,
    ) -> Result<()> {
        self.with_session(|session| session.register(name, arity, predicate))?
    }

    /// Register a non-deterministic host predicate under `name/arity`.
    pub fn register_nondet(
        &self,
        name: &str,
        arity: usize,
        predicate: impl Fn(&mut Session<'_>, Subquery, &Term) -> Box<dyn Iterator<Item = Term> + Send>
            + Send
            + Sync
            + 'static,
    ) -> Result<()> {
        self.with_session(|session| session.register_nondet(name, arity, predicate))?
    }

    /// Clone this interpreter by memory snapshot. The clone shares
    /// nothing mutable with the original; queries in flight here are
    /// not live in the clone.
    pub fn fork(&self) -> Result<Interpreter> {
        let mut guard = self.lock();
        let parent = guard.as_mut().ok_or(Error::Closed)?;
        let child = Machine::fork(parent)?;
        let gate = (parent.config().max_concurrency > 0)
            .then(|| Gate::new(parent.config().max_concurrency));
        Ok(Interpreter {
            machine: Mutex::new(Some(child)),
            gate,
        })
    }

    /// Diagnostic information.
    pub fn stats(&self) -> Result<Stats> {
        let guard = self.lock();
        let machine = guard.as_ref().ok_or(Error::Closed)?;
        Ok(machine.stats())
    }

    /// Destroy the guest instance. Subsequent operations fail with
    /// "end of stream".
    pub fn close(&self) {
        let mut guard = self.lock();
        if let Some(machine) = guard.as_mut() {
            let raw = machine.raw.clone();
            let _ = raw.pl_capture_free.call(&mut machine.store, raw.interp);
        }
        *guard = None;
    }

    /// Refresh this interpreter's state from `parent` by memory
    /// snapshot (the pool's replica-update path).
    pub(crate) fn refresh_from(&self, parent: &Interpreter) -> Result<()> {
        let mut parent_guard = parent.lock();
        let parent_machine = parent_guard.as_mut().ok_or(Error::Closed)?;
        let mut guard = self.lock();
        let machine = guard.as_mut().ok_or(Error::Closed)?;
        machine.refresh_from(parent_machine)
    }

    /// Lock the machine and run `f` against a session over it.
    pub(crate) fn with_session<R>(&self, f: impl FnOnce(&mut Session<'_>) -> R) -> Result<R> {
        let mut guard = self.lock();
        let machine = guard.as_mut().ok_or(Error::Closed)?;
        let mut session = machine.session();
        Ok(f(&mut session))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Machine>> {
        self.machine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.max_concurrency, 256);
        assert_eq!(config.stdio, Stdio::Discard);
        assert!(!config.trace);
        assert!(config.preopen_dir.is_none());
    }

    #[test]
    fn gate_caps_outstanding_tokens() {
        let gate = Gate::new(2);
        let first = gate.acquire();
        let _second = gate.acquire();

        // Both tokens are out; a third acquire would block until one is
        // returned.
        drop(first);
        let _third = gate.acquire();
    }

    #[test]
    fn invalid_module_bytes_are_a_config_error() {
        let err = Runtime::new(b"not wasm").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
