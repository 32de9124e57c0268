//! A read-replica pool of interpreters.
//!
//! One writer-exclusive canon interpreter plus N reader replicas.
//! Successful writes propagate eagerly by snapshot-copying the canon's
//! memory into every replica while the exclusive lock is still held, so
//! a reader either starts before a write began or sees all replicas
//! refreshed. A failed write leaves replicas untouched.

use std::sync::{mpsc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::interp::{Config, Interpreter, Runtime, Stats};
use crate::session::Session;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of reader replicas. Defaults to the number of available
    /// CPUs.
    pub replicas: usize,
    /// Interpreter configuration shared by the canon and every replica.
    pub config: Config,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            replicas: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            config: Config::default(),
        }
    }
}

/// A pool of interpreters distributing read transactions over replicas.
pub struct Pool {
    canon: Interpreter,
    replicas: Vec<Interpreter>,
    idle_tx: mpsc::Sender<usize>,
    idle_rx: Mutex<mpsc::Receiver<usize>>,
    lock: RwLock<()>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl Pool {
    /// Boot a canon interpreter and clone it into `replicas` readers.
    pub fn new(runtime: &Runtime, config: PoolConfig) -> Result<Pool> {
        if config.replicas < 1 {
            return Err(Error::Config {
                message: format!("pool size too low: {}", config.replicas),
            });
        }

        let canon = Interpreter::new(runtime, config.config)?;
        let replicas = (0..config.replicas)
            .map(|_| canon.fork())
            .collect::<Result<Vec<_>>>()?;

        let (idle_tx, idle_rx) = mpsc::channel();
        for index in 0..replicas.len() {
            let _ = idle_tx.send(index);
        }
        tracing::debug!(replicas = replicas.len(), "pool ready");

        Ok(Pool {
            canon,
            replicas,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            lock: RwLock::new(()),
        })
    }

    /// Execute a write transaction against the canon interpreter.
    ///
    /// Use this for anything that modifies the knowledgebase
    /// (assert/retract, consulting, registering predicates). On success
    /// every replica is refreshed from the canon before the exclusive
    /// lock is released.
    pub fn write_tx<R>(&self, tx: impl FnOnce(&mut Session<'_>) -> Result<R>) -> Result<R> {
        let _exclusive = self
            .lock
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let result = self.canon.with_session(tx)?;
        if result.is_ok() {
            for replica in &self.replicas {
                replica.refresh_from(&self.canon)?;
            }
        }
        result
    }

    /// Execute a read transaction against an idle replica.
    ///
    /// Blocks while a write is in progress or all replicas are checked
    /// out. Queries in a read transaction must not modify the
    /// knowledgebase; a replica's changes vanish at the next refresh.
    pub fn read_tx<R>(&self, tx: impl FnOnce(&mut Session<'_>) -> Result<R>) -> Result<R> {
        let _shared = self
            .lock
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let index = {
            let idle = self
                .idle_rx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            idle.recv().map_err(|_| Error::Closed)?
        };

        let result = self.replicas[index].with_session(tx);
        let _ = self.idle_tx.send(index);
        result?
    }

    /// Diagnostic information for the canon interpreter.
    pub fn stats(&self) -> Result<Stats> {
        let _shared = self
            .lock
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.canon.stats()
    }

    /// Close the canon and every replica.
    pub fn close(&self) {
        let _exclusive = self
            .lock
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.canon.close();
        for replica in &self.replicas {
            replica.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_replicas_is_rejected() {
        // Size validation fires before any engine work, so an empty
        // module is enough of a runtime here.
        let runtime = Runtime::new("(module)").unwrap();
        let config = PoolConfig {
            replicas: 0,
            ..Default::default()
        };
        let err = Pool::new(&runtime, config).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn default_sizes_to_available_cpus() {
        let config = PoolConfig::default();
        assert!(config.replicas >= 1);
    }
}
