//! VT terminal adapter
//!
//! Wraps one engine-side terminal handle. Every call that moves bytes in or
//! out of the engine goes through a scratch buffer that is released before
//! the call returns; only the viewport buffer outlives a call, and it is
//! reused across frames until the grid grows or the terminal is resized.

use tracing::{debug, info, warn};

use super::abi::{TerminalConfig, ViewportSnapshot, CELL_SIZE, MAX_RESPONSE_LEN, TERMINAL_CONFIG_SIZE};
use super::engine::{with_scratch, VtEngine};
use super::{Result, VtError};
use crate::config::Theme;

pub struct VtTerminal<E: VtEngine> {
    engine: E,
    /// Zero once disposed
    handle: u32,
    cols: u32,
    rows: u32,
    viewport_ptr: u32,
    viewport_len: u32,
}

impl<E: VtEngine> VtTerminal<E> {
    /// Create a terminal with the theme's colors and the default scrollback
    pub fn create(mut engine: E, cols: u32, rows: u32, theme: &Theme) -> Result<Self> {
        let config = TerminalConfig::from_theme(theme).encode();
        let handle = with_scratch(
            &mut engine,
            TERMINAL_CONFIG_SIZE as u32,
            "terminal config",
            |engine, ptr| {
                engine.write_memory(ptr, &config)?;
                engine.terminal_new(cols, rows, ptr)
            },
        )?;
        if handle == 0 {
            return Err(VtError::TerminalCreate { cols, rows });
        }
        info!("Created {}x{} VT terminal (handle {})", cols, rows, handle);
        Ok(Self {
            engine,
            handle,
            cols,
            rows,
            viewport_ptr: 0,
            viewport_len: 0,
        })
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn is_disposed(&self) -> bool {
        self.handle == 0
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Feed bytes to the emulator
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() || self.is_disposed() {
            return Ok(());
        }
        let handle = self.handle;
        with_scratch(&mut self.engine, data.len() as u32, "write", |engine, ptr| {
            engine.write_memory(ptr, data)?;
            engine.terminal_write(handle, ptr, data.len() as u32)
        })
    }

    /// Resize the grid; a no-op when unchanged
    pub fn resize(&mut self, cols: u32, rows: u32) -> Result<()> {
        if self.is_disposed() || (cols == self.cols && rows == self.rows) {
            return Ok(());
        }
        debug!("Resizing VT terminal {}x{} -> {}x{}", self.cols, self.rows, cols, rows);
        self.cols = cols;
        self.rows = rows;
        self.engine.terminal_resize(self.handle, cols, rows)?;
        self.release_viewport()
    }

    /// Refresh render state and report whether a repaint is needed
    pub fn is_dirty(&mut self) -> Result<bool> {
        if self.is_disposed() {
            return Ok(false);
        }
        self.engine.render_update(self.handle)
    }

    pub fn has_response(&mut self) -> Result<bool> {
        if self.is_disposed() {
            return Ok(false);
        }
        self.engine.has_response(self.handle)
    }

    /// Read one pending reply, up to 4096 bytes
    pub fn read_response(&mut self) -> Result<Option<Vec<u8>>> {
        if self.is_disposed() {
            return Ok(None);
        }
        let handle = self.handle;
        with_scratch(&mut self.engine, MAX_RESPONSE_LEN, "response", |engine, ptr| {
            let written = engine.read_response(handle, ptr, MAX_RESPONSE_LEN)?;
            if written <= 0 {
                return Ok(None);
            }
            let mut bytes = vec![0u8; (written as u32).min(MAX_RESPONSE_LEN) as usize];
            engine.read_memory(ptr, &mut bytes)?;
            Ok(Some(bytes))
        })
    }

    /// Read replies until the engine reports none pending
    pub fn drain_responses(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut responses = Vec::new();
        while self.has_response()? {
            match self.read_response()? {
                Some(bytes) => responses.push(bytes),
                None => break,
            }
        }
        Ok(responses)
    }

    /// Copy the current viewport out of the engine and mark it clean
    pub fn viewport(&mut self) -> Result<ViewportSnapshot> {
        if self.is_disposed() {
            return Err(VtError::Disposed);
        }
        let cols = self.engine.render_cols(self.handle)?;
        let rows = self.engine.render_rows(self.handle)?;
        self.cols = cols;
        self.rows = rows;

        let required = cols
            .saturating_mul(rows)
            .saturating_mul(CELL_SIZE as u32)
            .max(1);
        if required > self.viewport_len || self.viewport_ptr == 0 {
            self.release_viewport()?;
            let ptr = self.engine.alloc(required)?;
            if ptr == 0 {
                warn!("VT engine could not allocate a {} byte viewport", required);
                return Err(VtError::Alloc {
                    what: "viewport",
                    len: required,
                });
            }
            self.viewport_ptr = ptr;
            self.viewport_len = required;
        }

        let written = self
            .engine
            .render_viewport(self.handle, self.viewport_ptr, self.viewport_len)?
            .min(self.viewport_len);
        let mut bytes = vec![0u8; written as usize];
        if written > 0 {
            self.engine.read_memory(self.viewport_ptr, &mut bytes)?;
        }
        self.engine.render_mark_clean(self.handle)?;
        Ok(ViewportSnapshot::new(cols, rows, bytes))
    }

    fn release_viewport(&mut self) -> Result<()> {
        if self.viewport_ptr == 0 {
            return Ok(());
        }
        let (ptr, len) = (self.viewport_ptr, self.viewport_len);
        self.viewport_ptr = 0;
        self.viewport_len = 0;
        self.engine.free(ptr, len)
    }

    /// Release the viewport buffer and the engine terminal. Idempotent.
    pub fn dispose(&mut self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let released = self.release_viewport();
        let handle = std::mem::replace(&mut self.handle, 0);
        let freed = self.engine.terminal_free(handle);
        debug!("Disposed VT terminal (handle {})", handle);
        released?;
        freed
    }
}

impl<E: VtEngine> Drop for VtTerminal<E> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("Failed to release VT terminal: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vt::abi::CellFlags;
    use crate::core::vt::testing::FakeEngine;

    fn terminal(cols: u32, rows: u32) -> VtTerminal<FakeEngine> {
        VtTerminal::create(FakeEngine::new(), cols, rows, &Theme::tokyo_night()).unwrap()
    }

    #[test]
    fn test_inverse_cell_after_write() {
        let mut term = terminal(2, 1);
        term.write(b"\x1b[7mX").unwrap();
        let snapshot = term.viewport().unwrap();
        let cell = snapshot.cell(0, 0).unwrap();
        assert_eq!(cell.ch(), 'X');
        assert!(cell.flags.contains(CellFlags::INVERSE));
        // scratch buffers are gone, only the viewport remains
        assert_eq!(term.engine().outstanding_allocations(), 1);
    }

    #[test]
    fn test_create_failure_releases_config() {
        let mut engine = FakeEngine::new();
        engine.refuse_terminals(true);
        let err = VtTerminal::create(&mut engine, 4, 2, &Theme::default()).err().unwrap();
        assert!(matches!(err, VtError::TerminalCreate { cols: 4, rows: 2 }));
        assert_eq!(engine.alloc_count(), 1);
        assert_eq!(engine.outstanding_allocations(), 0);
        assert_eq!(engine.live_terminals(), 0);
    }

    #[test]
    fn test_viewport_buffer_reused_until_resize() {
        let mut term = terminal(4, 2);
        term.viewport().unwrap();
        let allocs = term.engine().alloc_count();
        term.viewport().unwrap();
        assert_eq!(term.engine().alloc_count(), allocs);

        term.resize(8, 3).unwrap();
        let snapshot = term.viewport().unwrap();
        assert_eq!((snapshot.cols, snapshot.rows), (8, 3));
        assert_eq!(snapshot.as_bytes().len(), 8 * 3 * CELL_SIZE);
        assert_eq!(term.engine().alloc_count(), allocs + 1);
        assert_eq!(term.engine().outstanding_allocations(), 1);
    }

    #[test]
    fn test_resize_to_same_size_is_noop() {
        let mut term = terminal(4, 2);
        term.resize(4, 2).unwrap();
        assert_eq!(term.engine().resize_calls(), 0);
        term.resize(5, 2).unwrap();
        assert_eq!(term.engine().resize_calls(), 1);
        assert_eq!(term.cols(), 5);
    }

    #[test]
    fn test_dirty_until_viewport_read() {
        let mut term = terminal(4, 2);
        assert!(term.is_dirty().unwrap());
        term.viewport().unwrap();
        assert!(!term.is_dirty().unwrap());
        term.write(b"a").unwrap();
        assert!(term.is_dirty().unwrap());
    }

    #[test]
    fn test_drain_cursor_position_report() {
        let mut term = terminal(10, 3);
        term.write(b"ab\x1b[6n").unwrap();
        let responses = term.drain_responses().unwrap();
        assert_eq!(responses, vec![b"\x1b[1;3R".to_vec()]);
        assert!(!term.has_response().unwrap());
        assert!(term.drain_responses().unwrap().is_empty());
    }

    #[test]
    fn test_write_alloc_failure_is_reported() {
        let mut engine = FakeEngine::new();
        engine.fail_allocations_after(1);
        let mut term = VtTerminal::create(engine, 4, 2, &Theme::default()).unwrap();
        let err = term.write(b"hello").unwrap_err();
        assert!(matches!(err, VtError::Alloc { what: "write", len: 5 }));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mut term = terminal(4, 2);
        term.viewport().unwrap();
        term.dispose().unwrap();
        assert_eq!(term.engine().outstanding_allocations(), 0);
        assert_eq!(term.engine().live_terminals(), 0);

        term.dispose().unwrap();
        term.write(b"ignored").unwrap();
        assert!(!term.is_dirty().unwrap());
        assert!(matches!(term.viewport(), Err(VtError::Disposed)));
    }
}
