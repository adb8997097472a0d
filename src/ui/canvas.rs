//! Pixel surface abstraction and font metrics
//!
//! Coordinates passed to a [`Canvas`] are logical pixels; the canvas applies
//! its own device scale.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::config::{Color, Size};

/// Font used for every cell of a surface
#[derive(Debug, Clone, PartialEq)]
pub struct FontSpec {
    pub size: f32,
    pub family: String,
}

impl FontSpec {
    pub fn new(size: f32, family: impl Into<String>) -> Self {
        Self {
            size,
            family: family.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlyphStyle {
    pub bold: bool,
    pub italic: bool,
}

/// Raw measurement of the reference glyph
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextMeasurement {
    pub width: f32,
    pub ascent: Option<f32>,
    pub descent: Option<f32>,
}

/// Cell geometry in logical pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FontMetrics {
    pub width: u32,
    pub height: u32,
    /// Offset of the glyph baseline from the top of the cell
    pub baseline: u32,
}

impl FontMetrics {
    /// Derive cell geometry from a measurement of `M`.
    ///
    /// Missing ascent/descent fall back to 80%/20% of the font size.
    pub fn from_measurement(font_size: f32, m: TextMeasurement) -> Self {
        let ascent = m.ascent.unwrap_or(font_size * 0.8);
        let descent = m.descent.unwrap_or(font_size * 0.2);
        Self {
            width: (m.width.ceil() as u32).max(1),
            height: (ascent + descent).ceil() as u32 + 2,
            baseline: ascent.ceil() as u32 + 1,
        }
    }

    /// Grid that fits in a pixel area, at least 1x1
    pub fn grid_for(&self, width_px: u32, height_px: u32) -> Size {
        Size::new(width_px / self.width.max(1), height_px / self.height.max(1))
    }
}

pub trait Canvas {
    /// Measure the reference glyph `M` in the given font
    fn measure(&mut self, font: &FontSpec) -> TextMeasurement;

    /// Reallocate the backing store to `width` x `height` logical pixels
    fn resize(&mut self, width: u32, height: u32, scale: f32);

    /// Logical size of the backing store
    fn size(&self) -> (u32, u32);

    /// Reset every pixel to transparent
    fn clear(&mut self);

    fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: Color, alpha: f32);

    /// Draw `ch` with its left edge at `x` and baseline at `baseline`
    #[allow(clippy::too_many_arguments)]
    fn fill_glyph(
        &mut self,
        ch: char,
        x: u32,
        baseline: u32,
        font: &FontSpec,
        style: GlyphStyle,
        color: Color,
        alpha: f32,
    );
}

/// Font metrics measured once per (size, family)
#[derive(Default)]
pub struct MetricsCache {
    entries: Mutex<HashMap<(u32, String), FontMetrics>>,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_measure<C: Canvas + ?Sized>(&self, font: &FontSpec, canvas: &mut C) -> FontMetrics {
        let key = (font.size.to_bits(), font.family.clone());
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        *entries.entry(key).or_insert_with(|| {
            let metrics = FontMetrics::from_measurement(font.size, canvas.measure(font));
            debug!(
                "Measured {}px {}: cell {}x{}, baseline {}",
                font.size, font.family, metrics.width, metrics.height, metrics.baseline
            );
            metrics
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
