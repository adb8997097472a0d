//! Host-terminal presenter using crossterm
//!
//! Shows painted snapshots in the terminal the CLI runs in, using the same
//! color resolution as the pixel renderer.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{DisableBracketedPaste, EnableBracketedPaste},
    execute, queue,
    style::{Attribute, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};

use crate::config::{Color, Theme};
use crate::core::vt::{CellFlags, CellRecord, ViewportSnapshot};

const BEGIN_SYNC: &str = "\x1b[?2026h";
const END_SYNC: &str = "\x1b[?2026l";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Style {
    fg: Color,
    bg: Color,
    flags: CellFlags,
}

impl Style {
    fn of(cell: &CellRecord, theme: &Theme) -> Self {
        let (fg, bg) = cell.resolve_colors(theme);
        let flags = cell.flags & (CellFlags::BOLD | CellFlags::ITALIC | CellFlags::UNDERLINE | CellFlags::FAINT);
        Self { fg, bg, flags }
    }
}

fn apply_style<W: Write>(out: &mut W, style: &Style) -> io::Result<()> {
    queue!(out, SetAttribute(Attribute::Reset))?;
    if style.flags.contains(CellFlags::BOLD) {
        queue!(out, SetAttribute(Attribute::Bold))?;
    }
    if style.flags.contains(CellFlags::FAINT) {
        queue!(out, SetAttribute(Attribute::Dim))?;
    }
    if style.flags.contains(CellFlags::ITALIC) {
        queue!(out, SetAttribute(Attribute::Italic))?;
    }
    if style.flags.contains(CellFlags::UNDERLINE) {
        queue!(out, SetAttribute(Attribute::Underlined))?;
    }
    queue!(
        out,
        SetForegroundColor(style.fg.to_crossterm()),
        SetBackgroundColor(style.bg.to_crossterm())
    )
}

/// Write one snapshot as styled text, one line per row
pub fn write_frame<W: Write>(out: &mut W, snapshot: &ViewportSnapshot, theme: &Theme) -> io::Result<()> {
    let mut line = String::with_capacity(snapshot.cols as usize);
    for row in 0..snapshot.rows {
        queue!(out, MoveTo(0, row as u16))?;
        let mut current: Option<Style> = None;
        for (_, cell) in snapshot.row(row) {
            if cell.is_continuation() {
                continue;
            }
            let style = Style::of(&cell, theme);
            if current != Some(style) {
                if let Some(prev) = current {
                    apply_style(out, &prev)?;
                    queue!(out, Print(&line))?;
                    line.clear();
                }
                current = Some(style);
            }
            let visible = cell.codepoint != 0 && !cell.flags.contains(CellFlags::INVISIBLE);
            line.push(if visible { cell.ch() } else { ' ' });
        }
        if let Some(style) = current {
            apply_style(out, &style)?;
            queue!(out, Print(&line))?;
            line.clear();
        }
    }
    queue!(out, ResetColor, SetAttribute(Attribute::Reset))
}

/// Owns the host terminal while a preview is shown
pub struct Presenter {
    initialized: bool,
}

impl Default for Presenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Presenter {
    pub fn new() -> Self {
        Self { initialized: false }
    }

    /// Raw mode, alternate screen, cursor hidden, bracketed paste
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(
            stdout,
            EnterAlternateScreen,
            EnableBracketedPaste,
            DisableLineWrap,
            Clear(ClearType::All),
            MoveTo(0, 0),
            Hide
        )?;
        self.initialized = true;
        Ok(())
    }

    /// Restore the host terminal
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = execute!(stdout, ResetColor, SetAttribute(Attribute::Reset));
        let _ = execute!(stdout, Show, EnableLineWrap, DisableBracketedPaste, LeaveAlternateScreen);
        let _ = stdout.flush();
        terminal::disable_raw_mode()
    }

    pub fn present(&mut self, snapshot: &ViewportSnapshot, theme: &Theme) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = io::BufWriter::with_capacity(65536, stdout.lock());
        // Synchronized update reduces flicker
        write!(out, "{}", BEGIN_SYNC)?;
        write_frame(&mut out, snapshot, theme)?;
        write!(out, "{}", END_SYNC)?;
        out.flush()
    }

    pub fn clear(&mut self) -> io::Result<()> {
        execute!(io::stdout(), ResetColor, Clear(ClearType::All))
    }

    /// Host terminal size in cells
    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
