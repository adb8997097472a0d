//! Guest hosting and terminal emulation components.
//!
//! - **cache / runtime**: compiled-artifact caches behind a shared wasm engine
//! - **wasi**: the preview1 syscall bridge and guest input queue
//! - **guest**: guest compile, link and run
//! - **vt**: the external VT engine, its ABI and the terminal adapter
//! - **session**: one guest wired to one terminal surface
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── worker thread
//! │   └── GuestInstance
//! │       └── WasiBridge (args, env, input queue, output sinks)
//! └── TerminalSurface
//!     ├── VtTerminal (engine handle)
//!     ├── Renderer (pixel surface)
//!     └── FrameScheduler
//! ```

pub mod cache;
pub mod guest;
pub mod runtime;
pub mod session;
pub mod vt;
pub mod wasi;

#[cfg(test)]
pub(crate) mod testing;
