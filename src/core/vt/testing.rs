//! In-process stand-in for the VT engine
//!
//! Understands just enough of the VT protocol for tests: printable text,
//! CR/LF, SGR 0/1/7/27, cursor visibility (`ESC [ ? 25 h/l`) and the cursor
//! position report (`ESC [ 6 n`).

use std::collections::{HashMap, VecDeque};

use super::abi::{CellFlags, CellRecord, TerminalConfig, CELL_SIZE, TERMINAL_CONFIG_SIZE};
use super::engine::VtEngine;
use super::{Result, VtError};
use crate::config::Color;

const MEMORY_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeLayout {
    Expected,
    /// Reads background before foreground from the config
    SwappedColors,
    /// Emits cells of a different size
    CellSize(usize),
}

enum ParseState {
    Ground,
    Escape,
    Csi(String),
}

struct FakeTerminal {
    cols: u32,
    rows: u32,
    cells: Vec<CellRecord>,
    col: u32,
    row: u32,
    fg: Color,
    bg: Color,
    inverse: bool,
    bold: bool,
    cursor_visible: bool,
    dirty: bool,
    responses: VecDeque<u8>,
    state: ParseState,
}

impl FakeTerminal {
    fn new(cols: u32, rows: u32, fg: Color, bg: Color) -> Self {
        let mut term = Self {
            cols,
            rows,
            cells: Vec::new(),
            col: 0,
            row: 0,
            fg,
            bg,
            inverse: false,
            bold: false,
            cursor_visible: true,
            dirty: true,
            responses: VecDeque::new(),
            state: ParseState::Ground,
        };
        term.cells = vec![term.blank(); (cols * rows) as usize];
        term
    }

    fn blank(&self) -> CellRecord {
        CellRecord {
            codepoint: 0,
            fg: self.fg,
            bg: self.bg,
            flags: CellFlags::empty(),
            width: 1,
        }
    }

    fn resize(&mut self, cols: u32, rows: u32) {
        let mut cells = vec![self.blank(); (cols * rows) as usize];
        for row in 0..rows.min(self.rows) {
            for col in 0..cols.min(self.cols) {
                cells[(row * cols + col) as usize] = self.cells[(row * self.cols + col) as usize];
            }
        }
        self.cells = cells;
        self.cols = cols;
        self.rows = rows;
        self.col = self.col.min(cols - 1);
        self.row = self.row.min(rows - 1);
        self.dirty = true;
    }

    fn line_feed(&mut self) {
        if self.row + 1 < self.rows {
            self.row += 1;
        } else {
            let cols = self.cols as usize;
            self.cells.drain(..cols);
            let blank = self.blank();
            self.cells.extend(std::iter::repeat(blank).take(cols));
        }
    }

    fn print(&mut self, ch: char) {
        if self.col >= self.cols {
            self.col = 0;
            self.line_feed();
        }
        let mut flags = CellFlags::empty();
        if self.inverse {
            flags |= CellFlags::INVERSE | CellFlags::FG_EXPLICIT | CellFlags::BG_EXPLICIT;
        }
        if self.bold {
            flags |= CellFlags::BOLD;
        }
        let index = (self.row * self.cols + self.col) as usize;
        self.cells[index] = CellRecord {
            codepoint: ch as u32,
            fg: self.fg,
            bg: self.bg,
            flags,
            width: 1,
        };
        self.col += 1;
    }

    fn csi(&mut self, params: &str, final_byte: char) {
        match final_byte {
            'm' => {
                for param in params.split(';') {
                    match param.parse::<u32>().unwrap_or(0) {
                        0 => {
                            self.inverse = false;
                            self.bold = false;
                        }
                        1 => self.bold = true,
                        7 => self.inverse = true,
                        27 => self.inverse = false,
                        _ => {}
                    }
                }
            }
            'h' if params == "?25" => self.cursor_visible = true,
            'l' if params == "?25" => self.cursor_visible = false,
            'n' if params == "6" => {
                let report = format!("\x1b[{};{}R", self.row + 1, self.col + 1);
                self.responses.extend(report.bytes());
            }
            _ => {}
        }
    }

    fn feed(&mut self, data: &[u8]) {
        for ch in String::from_utf8_lossy(data).chars() {
            let state = std::mem::replace(&mut self.state, ParseState::Ground);
            self.state = match state {
                ParseState::Ground => match ch {
                    '\x1b' => ParseState::Escape,
                    '\r' => {
                        self.col = 0;
                        ParseState::Ground
                    }
                    '\n' => {
                        self.line_feed();
                        ParseState::Ground
                    }
                    c if (c as u32) < 0x20 => ParseState::Ground,
                    c => {
                        self.print(c);
                        ParseState::Ground
                    }
                },
                ParseState::Escape if ch == '[' => ParseState::Csi(String::new()),
                ParseState::Escape => ParseState::Ground,
                ParseState::Csi(mut params) => {
                    if ch.is_ascii_digit() || ch == ';' || ch == '?' {
                        params.push(ch);
                        ParseState::Csi(params)
                    } else {
                        self.csi(&params, ch);
                        ParseState::Ground
                    }
                }
            };
        }
        self.dirty = true;
    }
}

pub struct FakeEngine {
    memory: Vec<u8>,
    next_free: u32,
    freed: Vec<(u32, u32)>,
    allocations: HashMap<u32, u32>,
    alloc_count: usize,
    fail_after: Option<usize>,
    terminals: HashMap<u32, FakeTerminal>,
    next_handle: u32,
    refuse_terminals: bool,
    resize_calls: usize,
    layout: FakeLayout,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_layout(FakeLayout::Expected)
    }

    pub fn with_layout(layout: FakeLayout) -> Self {
        Self {
            memory: vec![0; MEMORY_SIZE],
            next_free: 8,
            freed: Vec::new(),
            allocations: HashMap::new(),
            alloc_count: 0,
            fail_after: None,
            terminals: HashMap::new(),
            next_handle: 1,
            refuse_terminals: false,
            resize_calls: 0,
            layout,
        }
    }

    pub fn fail_allocations(&mut self, fail: bool) {
        self.fail_after = if fail { Some(0) } else { None };
    }

    /// Let `n` more allocations succeed, then fail
    pub fn fail_allocations_after(&mut self, n: usize) {
        self.fail_after = Some(n);
    }

    pub fn refuse_terminals(&mut self, refuse: bool) {
        self.refuse_terminals = refuse;
    }

    pub fn outstanding_allocations(&self) -> usize {
        self.allocations.len()
    }

    pub fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    pub fn live_terminals(&self) -> usize {
        self.terminals.len()
    }

    /// Live terminals whose cursor was hidden with `ESC [ ? 25 l`
    pub fn hidden_cursors(&self) -> usize {
        self.terminals.values().filter(|t| !t.cursor_visible).count()
    }

    pub fn resize_calls(&self) -> usize {
        self.resize_calls
    }

    fn terminal(&mut self, handle: u32) -> Result<&mut FakeTerminal> {
        self.terminals.get_mut(&handle).ok_or(VtError::Trap {
            func: "fake",
            message: format!("unknown terminal handle {}", handle),
        })
    }

    fn range(&self, ptr: u32, len: usize) -> Result<std::ops::Range<usize>> {
        let start = ptr as usize;
        let end = start + len;
        if ptr == 0 || end > self.memory.len() {
            return Err(VtError::Memory { ptr, len });
        }
        Ok(start..end)
    }
}

impl VtEngine for FakeEngine {
    fn alloc(&mut self, len: u32) -> Result<u32> {
        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                return Ok(0);
            }
            *remaining -= 1;
        }
        let len = len.max(1);
        self.alloc_count += 1;
        let ptr = match self.freed.iter().position(|&(_, l)| l == len) {
            Some(i) => self.freed.swap_remove(i).0,
            None => {
                let ptr = self.next_free;
                if (ptr + len) as usize > MEMORY_SIZE {
                    return Ok(0);
                }
                self.next_free += len;
                ptr
            }
        };
        self.allocations.insert(ptr, len);
        Ok(ptr)
    }

    fn free(&mut self, ptr: u32, len: u32) -> Result<()> {
        match self.allocations.remove(&ptr) {
            Some(l) if l == len.max(1) => {
                self.freed.push((ptr, l));
                Ok(())
            }
            _ => Err(VtError::Trap {
                func: "free",
                message: format!("bad free of {} bytes at {:#x}", len, ptr),
            }),
        }
    }

    fn read_memory(&self, ptr: u32, buf: &mut [u8]) -> Result<()> {
        let range = self.range(ptr, buf.len())?;
        buf.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn write_memory(&mut self, ptr: u32, data: &[u8]) -> Result<()> {
        let range = self.range(ptr, data.len())?;
        self.memory[range].copy_from_slice(data);
        Ok(())
    }

    fn terminal_new(&mut self, cols: u32, rows: u32, config_ptr: u32) -> Result<u32> {
        if self.refuse_terminals {
            return Ok(0);
        }
        let mut raw = [0u8; TERMINAL_CONFIG_SIZE];
        self.read_memory(config_ptr, &mut raw)?;
        let config = TerminalConfig::decode(&raw);
        let (fg, bg) = match self.layout {
            FakeLayout::SwappedColors => (config.background, config.foreground),
            _ => (config.foreground, config.background),
        };
        let handle = self.next_handle;
        self.next_handle += 1;
        self.terminals
            .insert(handle, FakeTerminal::new(cols.max(1), rows.max(1), fg, bg));
        Ok(handle)
    }

    fn terminal_free(&mut self, handle: u32) -> Result<()> {
        self.terminals.remove(&handle);
        Ok(())
    }

    fn terminal_resize(&mut self, handle: u32, cols: u32, rows: u32) -> Result<()> {
        self.resize_calls += 1;
        self.terminal(handle)?.resize(cols.max(1), rows.max(1));
        Ok(())
    }

    fn terminal_write(&mut self, handle: u32, ptr: u32, len: u32) -> Result<()> {
        let mut data = vec![0u8; len as usize];
        self.read_memory(ptr, &mut data)?;
        self.terminal(handle)?.feed(&data);
        Ok(())
    }

    fn render_update(&mut self, handle: u32) -> Result<bool> {
        Ok(self.terminal(handle)?.dirty)
    }

    fn render_cols(&mut self, handle: u32) -> Result<u32> {
        Ok(self.terminal(handle)?.cols)
    }

    fn render_rows(&mut self, handle: u32) -> Result<u32> {
        Ok(self.terminal(handle)?.rows)
    }

    fn render_mark_clean(&mut self, handle: u32) -> Result<()> {
        self.terminal(handle)?.dirty = false;
        Ok(())
    }

    fn render_viewport(&mut self, handle: u32, ptr: u32, len: u32) -> Result<u32> {
        let cell_size = match self.layout {
            FakeLayout::CellSize(n) => n,
            _ => CELL_SIZE,
        };
        let cells: Vec<CellRecord> = self.terminal(handle)?.cells.clone();
        let count = (len as usize / cell_size).min(cells.len());
        let mut out = Vec::with_capacity(count * cell_size);
        for cell in &cells[..count] {
            let mut record = cell.encode().to_vec();
            record.resize(cell_size, 0);
            out.extend(record);
        }
        self.write_memory(ptr, &out)?;
        Ok(out.len() as u32)
    }

    fn has_response(&mut self, handle: u32) -> Result<bool> {
        Ok(!self.terminal(handle)?.responses.is_empty())
    }

    fn read_response(&mut self, handle: u32, ptr: u32, len: u32) -> Result<i32> {
        let term = self.terminal(handle)?;
        let n = term.responses.len().min(len as usize);
        let bytes: Vec<u8> = term.responses.drain(..n).collect();
        self.write_memory(ptr, &bytes)?;
        Ok(n as i32)
    }
}
