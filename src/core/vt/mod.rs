//! VT engine integration.
//!
//! The terminal emulator itself is a WebAssembly module exporting a
//! handle-based C ABI. This module talks to it:
//!
//! - **abi**: byte layouts of the terminal config and viewport cells
//! - **engine**: the [`VtEngine`] seam and its wasmi implementation
//! - **probe**: one-time layout compatibility check per engine artifact
//! - **terminal**: a terminal handle with scratch-buffer round trips
//!
//! # Architecture
//!
//! ```text
//! VtArtifact (compiled module + probe verdict, cached)
//! └── WasmEngine (one instance per surface, owns linear memory)
//!     └── VtTerminal
//!         ├── handle (engine-side terminal)
//!         └── viewport buffer (reused across frames)
//! ```

pub mod abi;
pub mod engine;
pub mod probe;
pub mod terminal;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

use super::cache::LoadError;

pub use abi::{CellFlags, CellRecord, TerminalConfig, ViewportSnapshot};
pub use engine::{VtArtifact, VtEngine, WasmEngine};
pub use terminal::VtTerminal;

#[derive(Error, Debug)]
pub enum VtError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Failed to compile VT engine {source_id}: {message}")]
    Compile { source_id: String, message: String },

    #[error("Failed to instantiate VT engine: {0}")]
    Instantiate(String),

    #[error("VT engine has no `{0}` export")]
    MissingExport(&'static str),

    #[error("Incompatible VT engine ABI: {0}")]
    Incompatible(String),

    #[error("VT engine failed to allocate {len} bytes for {what}")]
    Alloc { what: &'static str, len: u32 },

    #[error("VT engine memory access out of bounds: {len} bytes at {ptr:#x}")]
    Memory { ptr: u32, len: usize },

    #[error("VT engine trapped in {func}: {message}")]
    Trap { func: &'static str, message: String },

    #[error("VT engine failed to create a {cols}x{rows} terminal")]
    TerminalCreate { cols: u32, rows: u32 },

    #[error("VT terminal already disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, VtError>;
