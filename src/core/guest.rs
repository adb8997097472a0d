//! Guest app execution
//!
//! Compiles wasm32-wasi modules with wasmi, links the [`WasiBridge`] under
//! `wasi_snapshot_preview1` and runs `_start`.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};
use wasmi::{Caller, Engine, Extern, Linker, Module, Store, TypedFunc};

use super::cache::LoadError;
use super::wasi::WasiBridge;

pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

#[derive(Error, Debug)]
pub enum GuestError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Failed to compile guest module {source_id}: {message}")]
    Compile { source_id: String, message: String },

    #[error("Failed to link WASI imports: {0}")]
    Link(String),

    #[error("Failed to instantiate guest module: {0}")]
    Instantiate(String),

    #[error("WASM module has no memory export")]
    MissingMemory,

    #[error("WASM module has no _start export")]
    MissingStart,
}

#[derive(Debug)]
struct GuestCancelled;

impl fmt::Display for GuestCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("guest session cancelled")
    }
}

impl wasmi::core::HostError for GuestCancelled {}

#[derive(Debug)]
struct NoMemory;

impl fmt::Display for NoMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("guest has no memory export")
    }
}

impl wasmi::core::HostError for NoMemory {}

/// How a guest run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestOutcome {
    /// `proc_exit(code)`, or 0 when `_start` returned
    Exited(i32),
    /// Stopped by the session's cancel flag
    Cancelled,
    Trapped(String),
}

/// A compiled guest module, shareable across sessions
#[derive(Debug)]
pub struct GuestModule {
    module: Module,
    source: String,
}

impl GuestModule {
    pub fn compile(engine: &Engine, source: &str, bytes: &[u8]) -> Result<Self, GuestError> {
        let module = Module::new(engine, bytes).map_err(|e| GuestError::Compile {
            source_id: source.to_string(),
            message: e.to_string(),
        })?;
        info!("Compiled guest module {} ({} bytes)", source, bytes.len());
        Ok(Self {
            module,
            source: source.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// An instantiated guest, ready to run on any thread
pub struct GuestInstance {
    store: Store<WasiBridge>,
    start: TypedFunc<(), ()>,
}

impl GuestInstance {
    pub fn instantiate(
        engine: &Engine,
        module: &GuestModule,
        bridge: WasiBridge,
    ) -> Result<Self, GuestError> {
        let mut linker = Linker::<WasiBridge>::new(engine);
        link_wasi(&mut linker)?;

        let mut store = Store::new(engine, bridge);
        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| GuestError::Instantiate(e.to_string()))?
            .start(&mut store)
            .map_err(|e| GuestError::Instantiate(e.to_string()))?;

        if instance.get_memory(&store, "memory").is_none() {
            return Err(GuestError::MissingMemory);
        }
        let start = instance
            .get_typed_func::<(), ()>(&store, "_start")
            .map_err(|_| GuestError::MissingStart)?;

        debug!("Instantiated guest {}", module.source());
        Ok(Self { store, start })
    }

    pub fn bridge(&self) -> &WasiBridge {
        self.store.data()
    }

    /// Run `_start` to completion on the calling thread
    pub fn run(mut self) -> GuestOutcome {
        let result = self.start.call(&mut self.store, ());
        let bridge = self.store.data();
        let outcome = match result {
            Ok(()) => GuestOutcome::Exited(bridge.exit_code().unwrap_or(0)),
            Err(e) => match e.i32_exit_status() {
                Some(code) => GuestOutcome::Exited(code),
                None if bridge.is_cancelled() => GuestOutcome::Cancelled,
                None => GuestOutcome::Trapped(e.to_string()),
            },
        };
        match &outcome {
            GuestOutcome::Trapped(message) => warn!("Guest trapped: {}", message),
            other => info!("Guest finished: {:?}", other),
        }
        outcome
    }
}

fn link_err(e: impl fmt::Display) -> GuestError {
    GuestError::Link(e.to_string())
}

fn check_cancel(caller: &Caller<'_, WasiBridge>) -> Result<(), wasmi::Error> {
    if caller.data().is_cancelled() {
        return Err(wasmi::Error::host(GuestCancelled));
    }
    Ok(())
}

// Runs `f` against the guest's linear memory and the bridge
fn with_memory<R>(
    caller: &mut Caller<'_, WasiBridge>,
    f: impl FnOnce(&mut [u8], &mut WasiBridge) -> R,
) -> Result<R, wasmi::Error> {
    check_cancel(caller)?;
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(mem)) => mem,
        _ => return Err(wasmi::Error::host(NoMemory)),
    };
    let (data, bridge) = memory.data_and_store_mut(&mut *caller);
    Ok(f(data, bridge))
}

type Ret = Result<u32, wasmi::Error>;

/// Register every supported preview1 import
pub fn link_wasi(linker: &mut Linker<WasiBridge>) -> Result<(), GuestError> {
    linker
        .func_wrap(WASI_MODULE, "args_sizes_get", |mut caller: Caller<'_, WasiBridge>, argc: u32, size: u32| -> Ret {
            with_memory(&mut caller, |mem, wasi| wasi.args_sizes_get(mem, argc, size).raw())
        })
        .map_err(link_err)?;
    linker
        .func_wrap(WASI_MODULE, "args_get", |mut caller: Caller<'_, WasiBridge>, argv: u32, buf: u32| -> Ret {
            with_memory(&mut caller, |mem, wasi| wasi.args_get(mem, argv, buf).raw())
        })
        .map_err(link_err)?;
    linker
        .func_wrap(WASI_MODULE, "environ_sizes_get", |mut caller: Caller<'_, WasiBridge>, count: u32, size: u32| -> Ret {
            with_memory(&mut caller, |mem, wasi| wasi.environ_sizes_get(mem, count, size).raw())
        })
        .map_err(link_err)?;
    linker
        .func_wrap(WASI_MODULE, "environ_get", |mut caller: Caller<'_, WasiBridge>, environ: u32, buf: u32| -> Ret {
            with_memory(&mut caller, |mem, wasi| wasi.environ_get(mem, environ, buf).raw())
        })
        .map_err(link_err)?;
    linker
        .func_wrap(
            WASI_MODULE,
            "fd_write",
            |mut caller: Caller<'_, WasiBridge>, fd: u32, iovs: u32, iovs_len: u32, nwritten: u32| -> Ret {
                with_memory(&mut caller, |mem, wasi| {
                    wasi.fd_write(mem, fd, iovs, iovs_len, nwritten).raw()
                })
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(
            WASI_MODULE,
            "fd_read",
            |mut caller: Caller<'_, WasiBridge>, fd: u32, iovs: u32, iovs_len: u32, nread: u32| -> Ret {
                with_memory(&mut caller, |mem, wasi| {
                    wasi.fd_read(mem, fd, iovs, iovs_len, nread).raw()
                })
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(
            WASI_MODULE,
            "poll_oneoff",
            |mut caller: Caller<'_, WasiBridge>, subs: u32, events: u32, nsubs: u32, nevents: u32| -> Ret {
                with_memory(&mut caller, |mem, wasi| {
                    wasi.poll_oneoff(mem, subs, events, nsubs, nevents).raw()
                })
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(WASI_MODULE, "proc_exit", |mut caller: Caller<'_, WasiBridge>, code: i32| -> Result<(), wasmi::Error> {
            caller.data_mut().proc_exit(code);
            Err(wasmi::Error::i32_exit(code))
        })
        .map_err(link_err)?;
    linker
        .func_wrap(WASI_MODULE, "random_get", |mut caller: Caller<'_, WasiBridge>, buf: u32, len: u32| -> Ret {
            with_memory(&mut caller, |mem, wasi| wasi.random_get(mem, buf, len).raw())
        })
        .map_err(link_err)?;
    linker
        .func_wrap(
            WASI_MODULE,
            "clock_time_get",
            |mut caller: Caller<'_, WasiBridge>, id: u32, precision: u64, time: u32| -> Ret {
                with_memory(&mut caller, |mem, wasi| {
                    wasi.clock_time_get(mem, id, precision, time).raw()
                })
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(WASI_MODULE, "fd_fdstat_get", |mut caller: Caller<'_, WasiBridge>, fd: u32, stat: u32| -> Ret {
            with_memory(&mut caller, |mem, wasi| wasi.fd_fdstat_get(mem, fd, stat).raw())
        })
        .map_err(link_err)?;
    linker
        .func_wrap(WASI_MODULE, "fd_close", |caller: Caller<'_, WasiBridge>, fd: u32| -> Ret {
            check_cancel(&caller)?;
            Ok(caller.data().fd_close(fd).raw())
        })
        .map_err(link_err)?;
    linker
        .func_wrap(
            WASI_MODULE,
            "fd_seek",
            |caller: Caller<'_, WasiBridge>, _fd: u32, _offset: i64, _whence: u32, _newoffset: u32| -> Ret {
                check_cancel(&caller)?;
                Ok(caller.data().fd_seek().raw())
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(WASI_MODULE, "fd_prestat_get", |caller: Caller<'_, WasiBridge>, _fd: u32, _buf: u32| -> Ret {
            check_cancel(&caller)?;
            Ok(caller.data().fd_prestat_get().raw())
        })
        .map_err(link_err)?;
    linker
        .func_wrap(
            WASI_MODULE,
            "fd_prestat_dir_name",
            |caller: Caller<'_, WasiBridge>, _fd: u32, _path: u32, _len: u32| -> Ret {
                check_cancel(&caller)?;
                Ok(caller.data().fd_prestat_dir_name().raw())
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(
            WASI_MODULE,
            "path_open",
            |caller: Caller<'_, WasiBridge>,
             _fd: u32,
             _dirflags: u32,
             _path: u32,
             _path_len: u32,
             _oflags: u32,
             _rights_base: u64,
             _rights_inheriting: u64,
             _fdflags: u32,
             _opened: u32|
             -> Ret {
                check_cancel(&caller)?;
                Ok(caller.data().path_open().raw())
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(WASI_MODULE, "sched_yield", |caller: Caller<'_, WasiBridge>| -> Ret {
            check_cancel(&caller)?;
            Ok(caller.data().sched_yield().raw())
        })
        .map_err(link_err)?;
    Ok(())
}
