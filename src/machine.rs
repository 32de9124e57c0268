//! The guest machine: one instantiation of the Prolog engine module.
//!
//! A [`Machine`] owns the wasmtime store, the instance, and the bundle
//! of export handles ([`Raw`]) everything else drives the engine
//! through. The store's data ([`HostState`]) carries the mutable state
//! host calls need mid-proof: the predicate registry, the coroutine
//! table, and the in-flight subquery registries.

use std::collections::{HashMap, HashSet};

use wasmtime::{AsContextMut, Instance, Linker, Memory, Store, StoreContextMut, TypedFunc};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::capture::CaptureCells;
use crate::coroutine::Coroutine;
use crate::error::{Error, Result};
use crate::hostcall;
use crate::interp::{Config, Runtime, Stats, Stdio};
use crate::memory;
use crate::session::{HostFn, Session};

/// Mutable store context over the driver's host state.
pub(crate) type Ctx<'a> = StoreContextMut<'a, HostState>;

/// Copyable handles to the engine's exports plus the global interpreter
/// pointer. Cheap to copy into host-call frames.
#[derive(Clone)]
pub(crate) struct Raw {
    pub memory: Memory,
    /// Address of the process-global interpreter structure (`pl_global`).
    pub interp: i32,
    pub realloc: TypedFunc<(i32, i32, i32, i32), i32>,
    pub free: TypedFunc<(i32, i32, i32), ()>,
    pub pl_consult: TypedFunc<(i32, i32), i32>,
    pub pl_query: TypedFunc<(i32, i32, i32, i32), i32>,
    pub pl_redo: TypedFunc<i32, i32>,
    pub pl_done: TypedFunc<i32, ()>,
    pub pl_capture: TypedFunc<i32, ()>,
    pub pl_capture_read: TypedFunc<(i32, i32, i32, i32, i32), ()>,
    pub pl_capture_reset: TypedFunc<i32, ()>,
    pub pl_capture_free: TypedFunc<i32, ()>,
}

/// Host-side bookkeeping for one live subquery.
#[derive(Default)]
pub(crate) struct SubqueryState {
    /// Captured stdout accumulated since the last parsed answer.
    pub stdout: Vec<u8>,
    /// Captured stderr accumulated since the last parsed answer.
    pub stderr: Vec<u8>,
    /// Guest addresses of the four capture out-parameter cells.
    pub cells: CaptureCells,
    /// Coroutines opened by this subquery.
    pub coros: HashSet<i64>,
}

impl SubqueryState {
    pub fn new(cells: CaptureCells) -> Self {
        SubqueryState {
            cells,
            ..Default::default()
        }
    }
}

/// Locates a subquery's state in the running or spawning registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubqueryKey {
    /// Keyed by subquery handle.
    Running(i32),
    /// Keyed by the guest address of the handle cell, while `pl_query`
    /// has reserved a handle but not yet returned.
    Spawning(i32),
}

/// State stored inside the wasmtime store, reachable from host calls.
pub(crate) struct HostState {
    pub wasi: WasiP1Ctx,
    /// Filled right after instantiation; host calls cannot arrive
    /// before then.
    pub raw: Option<Raw>,
    /// Registered host predicates, keyed by `Name/Arity`.
    pub procs: HashMap<String, HostFn>,
    /// Live coroutines backing non-deterministic predicates.
    pub coros: HashMap<i64, Coroutine>,
    pub next_coro: i64,
    /// Live subqueries by handle.
    pub running: HashMap<i32, SubqueryState>,
    /// Subqueries whose handle cell is reserved but not yet filled,
    /// keyed by the cell's guest address.
    pub spawning: HashMap<i32, SubqueryState>,
    /// Forward captured output to tracing debug events.
    pub log_output: bool,
}

impl HostState {
    fn new(wasi: WasiP1Ctx, log_output: bool) -> Self {
        HostState {
            wasi,
            raw: None,
            procs: HashMap::new(),
            coros: HashMap::new(),
            next_coro: 0,
            running: HashMap::new(),
            spawning: HashMap::new(),
            log_output,
        }
    }
}

/// Find the registry key for a subquery handle the engine passed to a
/// host call. Spawning entries are matched by reading the handle back
/// out of their reserved cell.
pub(crate) fn find_subquery(raw: &Raw, ctx: &mut Ctx<'_>, handle: i32) -> Result<Option<SubqueryKey>> {
    if ctx.data().running.contains_key(&handle) {
        return Ok(Some(SubqueryKey::Running(handle)));
    }
    let cells: Vec<i32> = ctx.data().spawning.keys().copied().collect();
    for cell in cells {
        let indirect = memory::read_u32(raw, ctx, cell as u32)? as i32;
        if indirect != 0 && indirect == handle {
            return Ok(Some(SubqueryKey::Spawning(cell)));
        }
    }
    Ok(None)
}

/// Fetch a mutable reference to a subquery's state by key.
pub(crate) fn subquery_state<'a>(
    state: &'a mut HostState,
    key: SubqueryKey,
) -> Option<&'a mut SubqueryState> {
    match key {
        SubqueryKey::Running(handle) => state.running.get_mut(&handle),
        SubqueryKey::Spawning(cell) => state.spawning.get_mut(&cell),
    }
}

/// One instantiation of the engine module.
pub(crate) struct Machine {
    pub store: Store<HostState>,
    pub raw: Raw,
    runtime: Runtime,
    config: Config,
}

impl Machine {
    /// Boot a fresh engine: instantiate, run `_start`, resolve the
    /// global interpreter pointer, and begin output capture.
    pub fn boot(runtime: &Runtime, config: &Config) -> Result<Machine> {
        let (mut store, instance) = instantiate(runtime, config)?;

        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(Error::guest)?;
        if let Err(err) = start.call(&mut store, ()) {
            // A WASI command exiting 0 is a clean boot.
            match err.downcast_ref::<wasmtime_wasi::I32Exit>() {
                Some(exit) if exit.0 == 0 => {}
                _ => {
                    return Err(Error::Resource {
                        message: format!("failed to initialize engine: {err}"),
                    })
                }
            }
        }

        let raw = bind_exports(&mut store, &instance, None)?;
        store.data_mut().raw = Some(raw.clone());

        raw.pl_capture
            .call(&mut store, raw.interp)
            .map_err(Error::guest)?;

        tracing::debug!(interp = raw.interp, "booted trealla engine instance");

        Ok(Machine {
            store,
            raw,
            runtime: runtime.clone(),
            config: config.clone(),
        })
    }

    /// Clone `parent` by memory snapshot: a fresh instance whose start
    /// function never runs, refreshed from the parent's linear memory.
    pub fn fork(parent: &mut Machine) -> Result<Machine> {
        let (mut store, instance) = instantiate(&parent.runtime, &parent.config)?;
        let raw = bind_exports(&mut store, &instance, Some(parent.raw.interp))?;
        store.data_mut().raw = Some(raw.clone());

        let mut child = Machine {
            store,
            raw,
            runtime: parent.runtime.clone(),
            config: parent.config.clone(),
        };
        child.refresh_from(parent)?;
        Ok(child)
    }

    /// Overwrite this machine's state with a snapshot of `parent`:
    /// grow to at least the parent's memory size, byte-copy it, adopt
    /// the parent's predicate table, and reset per-instance state.
    /// Subqueries that were in flight in the parent are released here,
    /// since they were copied over as orphans.
    pub fn refresh_from(&mut self, parent: &mut Machine) -> Result<()> {
        let src_pages = parent.raw.memory.size(&parent.store);
        let dst_pages = self.raw.memory.size(&self.store);
        if src_pages > dst_pages {
            self.raw
                .memory
                .grow(&mut self.store, src_pages - dst_pages)
                .map_err(Error::guest)?;
        }

        let src = parent.raw.memory.data(&parent.store);
        let dst = self.raw.memory.data_mut(&mut self.store);
        dst[..src.len()].copy_from_slice(src);
        tracing::debug!(bytes = src.len(), "copied interpreter memory snapshot");

        let spawn_cells: Vec<i32> = parent.store.data().spawning.keys().copied().collect();
        let run_handles: Vec<i32> = parent.store.data().running.keys().copied().collect();

        let state = self.store.data_mut();
        state.procs = parent.store.data().procs.clone();
        state.coros.clear();
        state.next_coro = 0;
        state.running.clear();
        state.spawning.clear();

        // The snapshot contains the parent's in-flight subqueries as
        // zombies; release them.
        for cell in spawn_cells {
            let mut ctx = self.store.as_context_mut();
            let handle = memory::read_u32(&self.raw, &ctx, cell as u32)? as i32;
            if handle != 0 {
                self.raw
                    .pl_done
                    .call(&mut ctx, handle)
                    .map_err(Error::guest)?;
            }
        }
        for handle in run_handles {
            self.raw
                .pl_done
                .call(&mut self.store, handle)
                .map_err(Error::guest)?;
        }

        Ok(())
    }

    pub fn stats(&self) -> Stats {
        Stats {
            memory_size: self.raw.memory.data_size(&self.store),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A session over this machine. The caller must already hold the
    /// interpreter lock.
    pub fn session(&mut self) -> Session<'_> {
        Session::new(self.raw.clone(), self.store.as_context_mut())
    }
}

/// Build the WASI context and instantiate the module with the engine's
/// command line and the configured preopens.
fn instantiate(runtime: &Runtime, config: &Config) -> Result<(Store<HostState>, Instance)> {
    let mut argv: Vec<String> = vec!["tpl".into(), "--ns".into()];
    if let Some(library) = &config.library_path {
        argv.push("--library".into());
        argv.push(library.clone());
    }
    if config.trace {
        argv.push("-t".into());
    }
    if config.quiet {
        argv.push("-q".into());
    }

    let mut wasi = WasiCtxBuilder::new();
    wasi.args(&argv);
    if matches!(config.stdio, Stdio::Inherit) {
        wasi.inherit_stdout();
        wasi.inherit_stderr();
    }
    if let Some(dir) = &config.preopen_dir {
        wasi.preopened_dir(dir, "/", DirPerms::all(), FilePerms::all())
            .map_err(|err| Error::Config {
                message: format!("failed to preopen {}: {err}", dir.display()),
            })?;
    }
    for (alias, dir) in &config.map_dirs {
        wasi.preopened_dir(dir, alias, DirPerms::all(), FilePerms::all())
            .map_err(|err| Error::Config {
                message: format!("failed to map {} to {alias}: {err}", dir.display()),
            })?;
    }

    let state = HostState::new(wasi.build_p1(), config.log_output);
    let mut store = Store::new(runtime.engine(), state);

    let mut linker: Linker<HostState> = Linker::new(runtime.engine());
    preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
        .map_err(Error::guest)?;
    hostcall::add_to_linker(&mut linker)?;

    let instance = linker
        .instantiate(&mut store, runtime.module())
        .map_err(|err| Error::Resource {
            message: format!("failed to instantiate engine module: {err}"),
        })?;

    Ok((store, instance))
}

/// Bind the engine ABI exports. `parent_interp` is supplied on the fork
/// path, where the interpreter pointer is an address into the copied
/// memory rather than a fresh `pl_global` result.
fn bind_exports(
    store: &mut Store<HostState>,
    instance: &Instance,
    parent_interp: Option<i32>,
) -> Result<Raw> {
    let memory = instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| Error::Resource {
            message: "engine module exports no memory".into(),
        })?;

    fn typed<P, R>(
        store: &mut Store<HostState>,
        instance: &Instance,
        name: &str,
    ) -> Result<TypedFunc<P, R>>
    where
        P: wasmtime::WasmParams,
        R: wasmtime::WasmResults,
    {
        instance
            .get_typed_func::<P, R>(&mut *store, name)
            .map_err(|err| Error::Resource {
                message: format!("engine export {name}: {err}"),
            })
    }

    let realloc = typed(store, instance, "canonical_abi_realloc")?;
    let free = typed(store, instance, "canonical_abi_free")?;
    let pl_consult = typed(store, instance, "pl_consult")?;
    let pl_query = typed(store, instance, "pl_query")?;
    let pl_redo = typed(store, instance, "pl_redo")?;
    let pl_done = typed(store, instance, "pl_done")?;
    let pl_capture = typed(store, instance, "pl_capture")?;
    let pl_capture_read = typed(store, instance, "pl_capture_read")?;
    let pl_capture_reset = typed(store, instance, "pl_capture_reset")?;
    let pl_capture_free = typed(store, instance, "pl_capture_free")?;

    let interp = match parent_interp {
        Some(ptr) => ptr,
        None => {
            let pl_global: TypedFunc<(), i32> = typed(store, instance, "pl_global")?;
            pl_global.call(&mut *store, ()).map_err(Error::guest)?
        }
    };

    Ok(Raw {
        memory,
        interp,
        realloc,
        free,
        pl_consult,
        pl_query,
        pl_redo,
        pl_done,
        pl_capture,
        pl_capture_read,
        pl_capture_reset,
        pl_capture_free,
    })
}
