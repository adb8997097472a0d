//! tui-preview: run WASI guests against a wasm VT engine and paint the result
//!
//! - [`config`]: file config, themes and preview options
//! - [`core`]: syscall bridge, VT engine adapter, module cache, sessions
//! - [`ui`]: canvas, renderer, frame scheduling, host-terminal presenter

pub mod config;
pub mod core;
pub mod ui;

pub use crate::config::{Config, ModernSpec, PreviewSpec, ResolvedOptions, Size, Theme};
pub use crate::core::runtime::Runtime;
pub use crate::core::session::{HostArea, Session, SessionError, SessionStatus};
pub use crate::ui::{Framebuffer, TerminalSurface};
