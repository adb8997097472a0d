//! Binary layouts shared with the VT engine
//!
//! Both records are little-endian. A cell is 16 bytes:
//!
//! ```text
//! 0..4   codepoint (u32)
//! 4..7   foreground r, g, b
//! 7..10  background r, g, b
//! 10     flags
//! 11     width in columns (0 = continuation of a wide glyph)
//! 12..16 reserved
//! ```
//!
//! The terminal config is 80 bytes: scrollback (u32), then foreground,
//! background, cursor and the 16 ANSI colors, each a u32 `0x00RRGGBB`.

use bitflags::bitflags;

use crate::config::{Color, Theme};

pub const CELL_SIZE: usize = 16;
pub const TERMINAL_CONFIG_SIZE: usize = 80;
pub const DEFAULT_SCROLLBACK: u32 = 10_000;
/// Upper bound for a single response read
pub const MAX_RESPONSE_LEN: u32 = 4096;

bitflags! {
    /// Cell attribute flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CellFlags: u8 {
        const BOLD        = 0b0000_0001;
        const ITALIC      = 0b0000_0010;
        const UNDERLINE   = 0b0000_0100;
        const FG_EXPLICIT = 0b0000_1000;
        const INVERSE     = 0b0001_0000;
        const INVISIBLE   = 0b0010_0000;
        const BG_EXPLICIT = 0b0100_0000;
        const FAINT       = 0b1000_0000;
    }
}

/// One decoded viewport cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellRecord {
    pub codepoint: u32,
    pub fg: Color,
    pub bg: Color,
    pub flags: CellFlags,
    pub width: u8,
}

impl CellRecord {
    /// Decode from the first [`CELL_SIZE`] bytes of `bytes`
    pub fn decode(bytes: &[u8; CELL_SIZE]) -> Self {
        Self {
            codepoint: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            fg: Color::new(bytes[4], bytes[5], bytes[6]),
            bg: Color::new(bytes[7], bytes[8], bytes[9]),
            flags: CellFlags::from_bits_retain(bytes[10]),
            width: bytes[11],
        }
    }

    pub fn encode(&self) -> [u8; CELL_SIZE] {
        let mut out = [0u8; CELL_SIZE];
        out[0..4].copy_from_slice(&self.codepoint.to_le_bytes());
        out[4..7].copy_from_slice(&[self.fg.r, self.fg.g, self.fg.b]);
        out[7..10].copy_from_slice(&[self.bg.r, self.bg.g, self.bg.b]);
        out[10] = self.flags.bits();
        out[11] = self.width;
        out
    }

    /// Trailing half of a wide glyph; painted by the leading cell
    pub fn is_continuation(&self) -> bool {
        self.width == 0
    }

    /// Printable character; invalid codepoints render as a space
    pub fn ch(&self) -> char {
        char::from_u32(self.codepoint).unwrap_or(' ')
    }

    /// Foreground and background as the cell is declared, before inversion
    pub fn declared_colors(&self, theme: &Theme) -> (Color, Color) {
        let fg = if self.flags.contains(CellFlags::FG_EXPLICIT) {
            self.fg
        } else {
            theme.foreground
        };
        let bg = if self.flags.contains(CellFlags::BG_EXPLICIT) {
            self.bg
        } else {
            theme.background
        };
        (fg, bg)
    }

    /// Glyph and background colors after applying inverse video
    pub fn resolve_colors(&self, theme: &Theme) -> (Color, Color) {
        let (fg, bg) = self.declared_colors(theme);
        if self.flags.contains(CellFlags::INVERSE) {
            (bg, fg)
        } else {
            (fg, bg)
        }
    }

    /// Whether the background pass paints this cell
    pub fn has_background(&self) -> bool {
        self.flags
            .intersects(CellFlags::INVERSE | CellFlags::BG_EXPLICIT)
    }
}

/// Creation-time terminal configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalConfig {
    pub scrollback: u32,
    pub foreground: Color,
    pub background: Color,
    pub cursor: Color,
    pub ansi: [Color; 16],
}

impl TerminalConfig {
    pub fn from_theme(theme: &Theme) -> Self {
        Self {
            scrollback: DEFAULT_SCROLLBACK,
            foreground: theme.foreground,
            background: theme.background,
            cursor: theme.cursor,
            ansi: theme.ansi,
        }
    }

    pub fn encode(&self) -> [u8; TERMINAL_CONFIG_SIZE] {
        let mut out = [0u8; TERMINAL_CONFIG_SIZE];
        let words = [self.scrollback, self.foreground.to_hex(), self.background.to_hex(), self.cursor.to_hex()]
            .into_iter()
            .chain(self.ansi.iter().map(|c| c.to_hex()));
        for (slot, word) in out.chunks_exact_mut(4).zip(words) {
            slot.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8; TERMINAL_CONFIG_SIZE]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };
        let mut ansi = [Color::default(); 16];
        for (i, slot) in ansi.iter_mut().enumerate() {
            *slot = Color::from_hex(word(4 + i));
        }
        Self {
            scrollback: word(0),
            foreground: Color::from_hex(word(1)),
            background: Color::from_hex(word(2)),
            cursor: Color::from_hex(word(3)),
            ansi,
        }
    }
}

/// A private copy of the engine's viewport, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewportSnapshot {
    pub cols: u32,
    pub rows: u32,
    bytes: Vec<u8>,
}

impl ViewportSnapshot {
    pub fn new(cols: u32, rows: u32, bytes: Vec<u8>) -> Self {
        Self { cols, rows, bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cell at (col, row); `None` outside the grid or past the copied bytes
    pub fn cell(&self, col: u32, row: u32) -> Option<CellRecord> {
        if col >= self.cols || row >= self.rows {
            return None;
        }
        let base = (row as usize * self.cols as usize + col as usize) * CELL_SIZE;
        let bytes: &[u8; CELL_SIZE] = self.bytes.get(base..base + CELL_SIZE)?.try_into().ok()?;
        Some(CellRecord::decode(bytes))
    }

    /// Cells of one row with their column index
    pub fn row(&self, row: u32) -> impl Iterator<Item = (u32, CellRecord)> + '_ {
        (0..self.cols).filter_map(move |col| self.cell(col, row).map(|cell| (col, cell)))
    }

    /// Visible text of one row, trailing blanks trimmed
    pub fn row_text(&self, row: u32) -> String {
        let text: String = self
            .row(row)
            .filter(|(_, cell)| !cell.is_continuation())
            .map(|(_, cell)| if cell.codepoint == 0 { ' ' } else { cell.ch() })
            .collect();
        text.trim_end().to_string()
    }
}
