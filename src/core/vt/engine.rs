//! VT engine seam
//!
//! [`VtEngine`] mirrors the engine's exported functions one to one. The
//! adapter and prober are written against the trait; [`WasmEngine`] backs it
//! with a wasmi instance.

use thiserror::Error;
use tracing::{debug, info, warn};
use wasmi::{Caller, Engine, Extern, Func, Linker, Memory, Module, Store, Val};

use super::{probe, Result, VtError, VtTerminal};
use crate::config::Theme;

/// Raw engine operations. Pointers and handles are engine-side `u32`s;
/// a zero pointer or handle means failure.
pub trait VtEngine {
    fn alloc(&mut self, len: u32) -> Result<u32>;
    fn free(&mut self, ptr: u32, len: u32) -> Result<()>;
    fn read_memory(&self, ptr: u32, buf: &mut [u8]) -> Result<()>;
    fn write_memory(&mut self, ptr: u32, data: &[u8]) -> Result<()>;

    fn terminal_new(&mut self, cols: u32, rows: u32, config_ptr: u32) -> Result<u32>;
    fn terminal_free(&mut self, handle: u32) -> Result<()>;
    fn terminal_resize(&mut self, handle: u32, cols: u32, rows: u32) -> Result<()>;
    fn terminal_write(&mut self, handle: u32, ptr: u32, len: u32) -> Result<()>;

    /// Refresh render state; true when something changed since the last mark_clean
    fn render_update(&mut self, handle: u32) -> Result<bool>;
    fn render_cols(&mut self, handle: u32) -> Result<u32>;
    fn render_rows(&mut self, handle: u32) -> Result<u32>;
    fn render_mark_clean(&mut self, handle: u32) -> Result<()>;
    /// Copy cells into `ptr`, returning bytes written
    fn render_viewport(&mut self, handle: u32, ptr: u32, len: u32) -> Result<u32>;

    fn has_response(&mut self, handle: u32) -> Result<bool>;
    /// Bytes written, zero or negative when nothing was read
    fn read_response(&mut self, handle: u32, ptr: u32, len: u32) -> Result<i32>;
}

impl<E: VtEngine + ?Sized> VtEngine for &mut E {
    fn alloc(&mut self, len: u32) -> Result<u32> {
        (**self).alloc(len)
    }
    fn free(&mut self, ptr: u32, len: u32) -> Result<()> {
        (**self).free(ptr, len)
    }
    fn read_memory(&self, ptr: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_memory(ptr, buf)
    }
    fn write_memory(&mut self, ptr: u32, data: &[u8]) -> Result<()> {
        (**self).write_memory(ptr, data)
    }
    fn terminal_new(&mut self, cols: u32, rows: u32, config_ptr: u32) -> Result<u32> {
        (**self).terminal_new(cols, rows, config_ptr)
    }
    fn terminal_free(&mut self, handle: u32) -> Result<()> {
        (**self).terminal_free(handle)
    }
    fn terminal_resize(&mut self, handle: u32, cols: u32, rows: u32) -> Result<()> {
        (**self).terminal_resize(handle, cols, rows)
    }
    fn terminal_write(&mut self, handle: u32, ptr: u32, len: u32) -> Result<()> {
        (**self).terminal_write(handle, ptr, len)
    }
    fn render_update(&mut self, handle: u32) -> Result<bool> {
        (**self).render_update(handle)
    }
    fn render_cols(&mut self, handle: u32) -> Result<u32> {
        (**self).render_cols(handle)
    }
    fn render_rows(&mut self, handle: u32) -> Result<u32> {
        (**self).render_rows(handle)
    }
    fn render_mark_clean(&mut self, handle: u32) -> Result<()> {
        (**self).render_mark_clean(handle)
    }
    fn render_viewport(&mut self, handle: u32, ptr: u32, len: u32) -> Result<u32> {
        (**self).render_viewport(handle, ptr, len)
    }
    fn has_response(&mut self, handle: u32) -> Result<bool> {
        (**self).has_response(handle)
    }
    fn read_response(&mut self, handle: u32, ptr: u32, len: u32) -> Result<i32> {
        (**self).read_response(handle, ptr, len)
    }
}

/// Borrow an engine scratch buffer for the duration of `f`.
///
/// The buffer is released on every path, including when `f` fails.
pub fn with_scratch<E, T, F>(engine: &mut E, len: u32, what: &'static str, f: F) -> Result<T>
where
    E: VtEngine + ?Sized,
    F: FnOnce(&mut E, u32) -> Result<T>,
{
    let ptr = engine.alloc(len)?;
    if ptr == 0 {
        warn!("VT engine allocation of {} bytes for {} failed", len, what);
        return Err(VtError::Alloc { what, len });
    }
    let result = f(engine, ptr);
    let freed = engine.free(ptr, len);
    let value = result?;
    freed?;
    Ok(value)
}

const EXPORTS: [&str; 14] = [
    "ghostty_wasm_alloc_u8_array",
    "ghostty_wasm_free_u8_array",
    "ghostty_terminal_new_with_config",
    "ghostty_terminal_free",
    "ghostty_terminal_resize",
    "ghostty_terminal_write",
    "ghostty_render_state_update",
    "ghostty_render_state_get_cols",
    "ghostty_render_state_get_rows",
    "ghostty_render_state_mark_clean",
    "ghostty_render_state_get_viewport",
    "ghostty_terminal_has_response",
    "ghostty_terminal_read_response",
    // never called; its presence identifies the engine
    "ghostty_terminal_new",
];

#[derive(Clone, Copy)]
enum Export {
    Alloc = 0,
    Free,
    TerminalNew,
    TerminalFree,
    Resize,
    Write,
    Update,
    Cols,
    Rows,
    MarkClean,
    Viewport,
    HasResponse,
    ReadResponse,
}

impl Export {
    fn name(self) -> &'static str {
        EXPORTS[self as usize]
    }
}

#[derive(Error, Debug)]
#[error("VT engine log message out of bounds")]
struct LogOutOfBounds;

impl wasmi::core::HostError for LogOutOfBounds {}

/// Engine instance backed by wasmi
pub struct WasmEngine {
    store: Store<()>,
    memory: Memory,
    funcs: Vec<Func>,
}

impl WasmEngine {
    /// Instantiate and resolve every required export
    pub fn instantiate(engine: &Engine, module: &Module) -> Result<Self> {
        let mut linker = Linker::<()>::new(engine);
        linker
            .func_wrap("env", "log", |caller: Caller<'_, ()>, ptr: u32, len: u32| -> std::result::Result<(), wasmi::Error> {
                let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
                    return Ok(());
                };
                let data = memory.data(&caller);
                let start = ptr as usize;
                let bytes = start
                    .checked_add(len as usize)
                    .and_then(|end| data.get(start..end))
                    .ok_or_else(|| wasmi::Error::host(LogOutOfBounds))?;
                debug!(target: "vt_engine", "{}", String::from_utf8_lossy(bytes));
                Ok(())
            })
            .map_err(|e| VtError::Instantiate(e.to_string()))?;

        let mut store = Store::new(engine, ());
        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| VtError::Instantiate(e.to_string()))?
            .start(&mut store)
            .map_err(|e| VtError::Instantiate(e.to_string()))?;

        let memory = instance
            .get_memory(&store, "memory")
            .ok_or(VtError::MissingExport("memory"))?;
        let funcs = EXPORTS
            .iter()
            .map(|&name| {
                instance
                    .get_func(&store, name)
                    .ok_or(VtError::MissingExport(name))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            store,
            memory,
            funcs,
        })
    }

    // Exports take i32 arguments; the result, if any, is a single i32.
    fn call(&mut self, export: Export, args: &[u32]) -> Result<i32> {
        let func = self.funcs[export as usize];
        let params: Vec<Val> = args.iter().map(|&a| Val::I32(a as i32)).collect();
        let result_count = func.ty(&self.store).results().len();
        let mut results = vec![Val::I32(0); result_count];
        func.call(&mut self.store, &params, &mut results)
            .map_err(|e| VtError::Trap {
                func: export.name(),
                message: e.to_string(),
            })?;
        Ok(match results.first() {
            Some(Val::I32(v)) => *v,
            Some(Val::I64(v)) => *v as i32,
            _ => 0,
        })
    }
}

impl VtEngine for WasmEngine {
    fn alloc(&mut self, len: u32) -> Result<u32> {
        self.call(Export::Alloc, &[len]).map(|p| p as u32)
    }

    fn free(&mut self, ptr: u32, len: u32) -> Result<()> {
        self.call(Export::Free, &[ptr, len]).map(drop)
    }

    fn read_memory(&self, ptr: u32, buf: &mut [u8]) -> Result<()> {
        self.memory
            .read(&self.store, ptr as usize, buf)
            .map_err(|_| VtError::Memory { ptr, len: buf.len() })
    }

    fn write_memory(&mut self, ptr: u32, data: &[u8]) -> Result<()> {
        self.memory
            .write(&mut self.store, ptr as usize, data)
            .map_err(|_| VtError::Memory { ptr, len: data.len() })
    }

    fn terminal_new(&mut self, cols: u32, rows: u32, config_ptr: u32) -> Result<u32> {
        self.call(Export::TerminalNew, &[cols, rows, config_ptr])
            .map(|h| h as u32)
    }

    fn terminal_free(&mut self, handle: u32) -> Result<()> {
        self.call(Export::TerminalFree, &[handle]).map(drop)
    }

    fn terminal_resize(&mut self, handle: u32, cols: u32, rows: u32) -> Result<()> {
        self.call(Export::Resize, &[handle, cols, rows]).map(drop)
    }

    fn terminal_write(&mut self, handle: u32, ptr: u32, len: u32) -> Result<()> {
        self.call(Export::Write, &[handle, ptr, len]).map(drop)
    }

    fn render_update(&mut self, handle: u32) -> Result<bool> {
        self.call(Export::Update, &[handle]).map(|v| v != 0)
    }

    fn render_cols(&mut self, handle: u32) -> Result<u32> {
        self.call(Export::Cols, &[handle]).map(|v| v as u32)
    }

    fn render_rows(&mut self, handle: u32) -> Result<u32> {
        self.call(Export::Rows, &[handle]).map(|v| v as u32)
    }

    fn render_mark_clean(&mut self, handle: u32) -> Result<()> {
        self.call(Export::MarkClean, &[handle]).map(drop)
    }

    fn render_viewport(&mut self, handle: u32, ptr: u32, len: u32) -> Result<u32> {
        self.call(Export::Viewport, &[handle, ptr, len])
            .map(|v| v.max(0) as u32)
    }

    fn has_response(&mut self, handle: u32) -> Result<bool> {
        self.call(Export::HasResponse, &[handle]).map(|v| v != 0)
    }

    fn read_response(&mut self, handle: u32, ptr: u32, len: u32) -> Result<i32> {
        self.call(Export::ReadResponse, &[handle, ptr, len])
    }
}

/// A compiled engine module and its cached probe verdict
pub struct VtArtifact {
    source: String,
    engine: Engine,
    module: Module,
    verdict: std::result::Result<(), String>,
}

impl VtArtifact {
    /// Compile, instantiate once and run the prober
    pub fn load(engine: &Engine, source: &str, bytes: &[u8]) -> Result<Self> {
        let module = Module::new(engine, bytes).map_err(|e| VtError::Compile {
            source_id: source.to_string(),
            message: e.to_string(),
        })?;
        let mut probe_engine = WasmEngine::instantiate(engine, &module)?;
        let verdict = probe::probe(&mut probe_engine).map_err(|e| match e {
            VtError::Incompatible(reason) => reason,
            other => other.to_string(),
        });
        match &verdict {
            Ok(()) => info!("VT engine {} passed the ABI probe", source),
            Err(reason) => warn!("VT engine {} rejected: {}", source, reason),
        }
        Ok(Self {
            source: source.to_string(),
            engine: engine.clone(),
            module,
            verdict,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_compatible(&self) -> bool {
        self.verdict.is_ok()
    }

    pub fn verdict(&self) -> Result<()> {
        self.verdict
            .clone()
            .map_err(VtError::Incompatible)
    }

    /// Fresh engine instance with its own linear memory
    pub fn instantiate(&self) -> Result<WasmEngine> {
        self.verdict()?;
        WasmEngine::instantiate(&self.engine, &self.module)
    }

    pub fn create_terminal(&self, cols: u32, rows: u32, theme: &Theme) -> Result<VtTerminal<WasmEngine>> {
        VtTerminal::create(self.instantiate()?, cols, rows, theme)
    }
}

impl std::fmt::Debug for VtArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VtArtifact")
            .field("source", &self.source)
            .field("verdict", &self.verdict)
            .finish()
    }
}
