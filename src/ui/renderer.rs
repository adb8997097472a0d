//! Cell-buffer renderer
//!
//! Paints a [`ViewportSnapshot`] onto a [`Canvas`] in two passes: cell
//! backgrounds first, then glyphs and underlines.

use tracing::debug;

use super::canvas::{Canvas, FontMetrics, FontSpec, GlyphStyle, MetricsCache};
use crate::config::{Size, Theme};
use crate::core::vt::{CellFlags, ViewportSnapshot};

const FAINT_ALPHA: f32 = 0.5;

pub struct Renderer<C: Canvas> {
    canvas: C,
    font: FontSpec,
    metrics: FontMetrics,
    theme: Theme,
    scale: f32,
    /// Grid the surface is currently sized for
    grid: Option<(u32, u32)>,
}

impl<C: Canvas> Renderer<C> {
    pub fn new(mut canvas: C, font: FontSpec, theme: Theme, scale: f32, cache: &MetricsCache) -> Self {
        let metrics = cache.get_or_measure(&font, &mut canvas);
        Self {
            canvas,
            font,
            metrics,
            theme,
            scale,
            grid: None,
        }
    }

    pub fn metrics(&self) -> FontMetrics {
        self.metrics
    }

    pub fn theme(&self) -> &Theme {
        &self.theme
    }

    pub fn canvas(&self) -> &C {
        &self.canvas
    }

    /// Grid that fits a host area of `width_px` x `height_px`
    pub fn grid_for(&self, width_px: u32, height_px: u32) -> Size {
        self.metrics.grid_for(width_px, height_px)
    }

    fn ensure_size(&mut self, cols: u32, rows: u32) {
        if self.grid == Some((cols, rows)) {
            return;
        }
        let width = cols * self.metrics.width;
        let height = rows * self.metrics.height;
        debug!("Resizing surface to {}x{} cells ({}x{} px)", cols, rows, width, height);
        self.canvas.resize(width, height, self.scale);
        self.grid = Some((cols, rows));
    }

    pub fn render(&mut self, snapshot: &ViewportSnapshot) {
        self.ensure_size(snapshot.cols, snapshot.rows);
        let FontMetrics {
            width: cw,
            height: ch,
            baseline,
        } = self.metrics;

        let (surface_w, surface_h) = self.canvas.size();
        self.canvas
            .fill_rect(0, 0, surface_w, surface_h, self.theme.background, 1.0);

        for row in 0..snapshot.rows {
            for (col, cell) in snapshot.row(row) {
                if cell.is_continuation() || !cell.has_background() {
                    continue;
                }
                let (_, bg) = cell.resolve_colors(&self.theme);
                self.canvas
                    .fill_rect(col * cw, row * ch, cell.width as u32 * cw, ch, bg, 1.0);
            }
        }

        for row in 0..snapshot.rows {
            for (col, cell) in snapshot.row(row) {
                if cell.is_continuation()
                    || cell.codepoint == 0
                    || cell.flags.contains(CellFlags::INVISIBLE)
                {
                    continue;
                }
                let (fg, _) = cell.resolve_colors(&self.theme);
                let alpha = if cell.flags.contains(CellFlags::FAINT) {
                    FAINT_ALPHA
                } else {
                    1.0
                };
                let style = GlyphStyle {
                    bold: cell.flags.contains(CellFlags::BOLD),
                    italic: cell.flags.contains(CellFlags::ITALIC),
                };
                let x = col * cw;
                let y = row * ch + baseline;
                self.canvas
                    .fill_glyph(cell.ch(), x, y, &self.font, style, fg, alpha);
                if cell.flags.contains(CellFlags::UNDERLINE) {
                    self.canvas
                        .fill_rect(x, y + 2, cell.width as u32 * cw, 1, fg, alpha);
                }
            }
        }
    }

    /// Release the surface contents
    pub fn dispose(&mut self) {
        self.canvas.clear();
        self.grid = None;
    }
}
