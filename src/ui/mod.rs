//! Rendering.
//!
//! - **canvas**: pixel-surface trait and font metrics
//! - **framebuffer**: in-memory RGBA canvas with PPM export
//! - **keys**: host key events to guest input bytes
//! - **renderer**: two-pass cell-buffer painter
//! - **scheduler**: edge-triggered frame pacing
//! - **surface**: terminal + renderer + scheduler behind one handle
//! - **presenter**: shows snapshots in the host terminal (CLI)

pub mod canvas;
pub mod framebuffer;
pub mod keys;
pub mod presenter;
pub mod renderer;
pub mod scheduler;
pub mod surface;

pub use canvas::{Canvas, FontMetrics, FontSpec, GlyphStyle, MetricsCache};
pub use framebuffer::Framebuffer;
pub use presenter::Presenter;
pub use renderer::Renderer;
pub use scheduler::FrameScheduler;
pub use surface::{Frame, SurfaceOptions, TerminalSurface};
