//! Terminal surface: one VT terminal, its renderer and frame scheduler
//!
//! Output bytes go in through [`TerminalSurface::write`]; frames come out of
//! [`TerminalSurface::tick`]. Engine replies are collected with
//! [`TerminalSurface::drain_responses`] for the caller to route back to the
//! guest.

use std::time::{Duration, Instant};

use tracing::debug;

use super::canvas::Canvas;
use super::renderer::Renderer;
use super::scheduler::{FrameScheduler, DEFAULT_FRAME_INTERVAL};
use crate::config::Size;
use crate::core::vt::{Result, ViewportSnapshot, VtEngine, VtTerminal};

const HIDE_CURSOR: &[u8] = b"\x1b[?25l";

#[derive(Debug, Clone, Copy)]
pub struct SurfaceOptions {
    /// Write LF not preceded by CR as CR LF
    pub convert_eol: bool,
    pub show_cursor: bool,
    pub frame_interval: Duration,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self {
            convert_eol: true,
            show_cursor: true,
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }
}

/// Result of one scheduler tick
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Nothing pending, not due yet, or the engine reported clean
    Skipped,
    Painted(ViewportSnapshot),
}

impl Frame {
    pub fn painted(&self) -> Option<&ViewportSnapshot> {
        match self {
            Frame::Painted(snapshot) => Some(snapshot),
            Frame::Skipped => None,
        }
    }
}

/// LF -> CR LF, with the trailing-CR state carried between calls
fn convert_eol(data: &[u8], last_was_cr: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    for &b in data {
        if b == b'\n' && !*last_was_cr {
            out.push(b'\r');
        }
        out.push(b);
        *last_was_cr = b == b'\r';
    }
    out
}

pub struct TerminalSurface<E: VtEngine, C: Canvas> {
    terminal: VtTerminal<E>,
    renderer: Renderer<C>,
    scheduler: FrameScheduler,
    convert_eol: bool,
    last_was_cr: bool,
    disposed: bool,
}

impl<E: VtEngine, C: Canvas> TerminalSurface<E, C> {
    /// Wrap a terminal and paint the first frame
    pub fn new(terminal: VtTerminal<E>, renderer: Renderer<C>, options: SurfaceOptions) -> Result<Self> {
        let mut surface = Self {
            terminal,
            renderer,
            scheduler: FrameScheduler::new(options.frame_interval),
            convert_eol: options.convert_eol,
            last_was_cr: false,
            disposed: false,
        };
        if !options.show_cursor {
            surface.terminal.write(HIDE_CURSOR)?;
        }
        let snapshot = surface.terminal.viewport()?;
        surface.renderer.render(&snapshot);
        Ok(surface)
    }

    pub fn size(&self) -> Size {
        Size::new(self.terminal.cols(), self.terminal.rows())
    }

    pub fn terminal(&self) -> &VtTerminal<E> {
        &self.terminal
    }

    pub fn renderer(&self) -> &Renderer<C> {
        &self.renderer
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Feed guest output to the terminal and schedule a frame
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.disposed || data.is_empty() {
            return Ok(());
        }
        if self.convert_eol {
            let converted = convert_eol(data, &mut self.last_was_cr);
            self.terminal.write(&converted)?;
        } else {
            self.terminal.write(data)?;
        }
        self.scheduler.request();
        Ok(())
    }

    /// Pending engine replies, in order
    pub fn drain_responses(&mut self) -> Result<Vec<Vec<u8>>> {
        if self.disposed {
            return Ok(Vec::new());
        }
        self.terminal.drain_responses()
    }

    pub fn request_frame(&mut self) {
        if !self.disposed {
            self.scheduler.request();
        }
    }

    pub fn has_pending_frame(&self) -> bool {
        self.scheduler.is_pending()
    }

    pub fn time_until_frame(&self, now: Instant) -> Option<Duration> {
        self.scheduler.time_until_due(now)
    }

    pub fn tick(&mut self) -> Result<Frame> {
        self.tick_at(Instant::now())
    }

    /// Paint if a frame is due and the engine has changes
    pub fn tick_at(&mut self, now: Instant) -> Result<Frame> {
        if self.disposed || !self.scheduler.take_due(now) {
            return Ok(Frame::Skipped);
        }
        if !self.terminal.is_dirty()? {
            return Ok(Frame::Skipped);
        }
        let snapshot = self.terminal.viewport()?;
        self.renderer.render(&snapshot);
        Ok(Frame::Painted(snapshot))
    }

    pub fn resize(&mut self, size: Size) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.terminal.resize(size.cols, size.rows)?;
        self.scheduler.request();
        Ok(())
    }

    /// Resize to whatever grid fits a host area, returning it
    pub fn fit(&mut self, width_px: u32, height_px: u32) -> Result<Size> {
        let size = self.renderer.grid_for(width_px, height_px);
        self.resize(size)?;
        Ok(size)
    }

    /// Cancel the pending frame, then release the terminal and the surface.
    /// Idempotent.
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.scheduler.cancel();
        let released = self.terminal.dispose();
        self.renderer.dispose();
        debug!("Disposed terminal surface");
        released
    }
}

impl<E: VtEngine, C: Canvas> Drop for TerminalSurface<E, C> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!("Failed to dispose terminal surface: {}", e);
        }
    }
}
