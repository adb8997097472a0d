//! In-memory RGBA pixel surface
//!
//! A headless [`Canvas`]: there is no font rasterizer, so glyphs are drawn
//! as solid shapes. Block elements and the light box-drawing lines are
//! exact; every other visible glyph becomes an ink box between the x-height
//! and the baseline, with a full-height stem for bold.

use std::io::{self, Write};

use super::canvas::{Canvas, FontSpec, GlyphStyle, TextMeasurement};
use crate::config::Color;

// Advance, ascent and descent of the synthetic monospace face
fn face_metrics(size: f32) -> (f32, f32, f32) {
    let ascent = (size * 0.8).round();
    ((size * 0.6).ceil(), ascent, size - ascent)
}

#[derive(Debug, Clone, Default)]
pub struct Framebuffer {
    width: u32,
    height: u32,
    scale: f32,
    /// Device pixels, RGBA
    pixels: Vec<u8>,
    measure_calls: usize,
}

impl Framebuffer {
    pub fn new() -> Self {
        Self {
            scale: 1.0,
            ..Default::default()
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Device pixel dimensions
    pub fn device_size(&self) -> (u32, u32) {
        (self.device(self.width), self.device(self.height))
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn measure_calls(&self) -> usize {
        self.measure_calls
    }

    /// RGBA at a device pixel
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let (w, h) = self.device_size();
        if x >= w || y >= h {
            return None;
        }
        let i = ((y * w + x) * 4) as usize;
        self.pixels.get(i..i + 4)?.try_into().ok()
    }

    /// Logical-pixel color, ignoring alpha
    pub fn color_at(&self, x: u32, y: u32) -> Option<Color> {
        let scaled = |v: u32| (v as f32 * self.scale) as u32;
        self.pixel(scaled(x), scaled(y))
            .map(|[r, g, b, _]| Color::new(r, g, b))
    }

    fn device(&self, v: u32) -> u32 {
        (v as f32 * self.scale).ceil() as u32
    }

    // Blend `color` over the device-space rectangle
    fn blend(&mut self, x0: u32, y0: u32, x1: u32, y1: u32, color: Color, alpha: f32) {
        let (w, h) = self.device_size();
        let alpha = alpha.clamp(0.0, 1.0);
        for y in y0.min(h)..y1.min(h) {
            for x in x0.min(w)..x1.min(w) {
                let i = ((y * w + x) * 4) as usize;
                let px = &mut self.pixels[i..i + 4];
                for (dst, src) in px.iter_mut().zip([color.r, color.g, color.b]) {
                    *dst = (src as f32 * alpha + *dst as f32 * (1.0 - alpha)).round() as u8;
                }
                px[3] = (255.0 * alpha + px[3] as f32 * (1.0 - alpha)).round() as u8;
            }
        }
    }

    fn fill_logical(&mut self, x: f32, y: f32, width: f32, height: f32, color: Color, alpha: f32) {
        let s = self.scale;
        let x0 = (x * s).round() as u32;
        let y0 = (y * s).round() as u32;
        let x1 = ((x + width) * s).round() as u32;
        let y1 = ((y + height) * s).round() as u32;
        self.blend(x0, y0, x1, y1, color, alpha);
    }

    /// Binary PPM (P6) of the device pixels, alpha dropped
    pub fn write_ppm<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let (w, h) = self.device_size();
        write!(out, "P6\n{} {}\n255\n", w, h)?;
        let rgb: Vec<u8> = self
            .pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();
        out.write_all(&rgb)
    }

    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.write_ppm(&mut out);
        out
    }
}

impl Canvas for Framebuffer {
    fn measure(&mut self, font: &FontSpec) -> TextMeasurement {
        self.measure_calls += 1;
        let (width, ascent, descent) = face_metrics(font.size);
        TextMeasurement {
            width,
            ascent: Some(ascent),
            descent: Some(descent),
        }
    }

    fn resize(&mut self, width: u32, height: u32, scale: f32) {
        self.scale = if scale > 0.0 { scale } else { 1.0 };
        self.width = width;
        self.height = height;
        let (w, h) = self.device_size();
        self.pixels = vec![0; (w * h * 4) as usize];
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn clear(&mut self) {
        self.pixels.iter_mut().for_each(|b| *b = 0);
    }

    fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: Color, alpha: f32) {
        self.fill_logical(x as f32, y as f32, width as f32, height as f32, color, alpha);
    }

    fn fill_glyph(
        &mut self,
        ch: char,
        x: u32,
        baseline: u32,
        font: &FontSpec,
        style: GlyphStyle,
        color: Color,
        alpha: f32,
    ) {
        if ch.is_whitespace() {
            return;
        }
        let (advance, ascent, descent) = face_metrics(font.size);
        let (x, baseline) = (x as f32, baseline as f32);
        let top = baseline - ascent;
        let full = ascent + descent;
        let mid_y = top + full / 2.0;
        let mid_x = x + advance / 2.0;

        match ch {
            '█' => self.fill_logical(x, top, advance, full, color, alpha),
            '▀' => self.fill_logical(x, top, advance, full / 2.0, color, alpha),
            '▄' => self.fill_logical(x, mid_y, advance, full / 2.0, color, alpha),
            '▌' => self.fill_logical(x, top, advance / 2.0, full, color, alpha),
            '▐' => self.fill_logical(mid_x, top, advance / 2.0, full, color, alpha),
            '░' => self.fill_logical(x, top, advance, full, color, alpha * 0.25),
            '▒' => self.fill_logical(x, top, advance, full, color, alpha * 0.5),
            '▓' => self.fill_logical(x, top, advance, full, color, alpha * 0.75),
            '─' | '━' => self.fill_logical(x, mid_y, advance, 1.0, color, alpha),
            '│' | '┃' => self.fill_logical(mid_x, top, 1.0, full, color, alpha),
            _ => {
                let inset = if style.bold { 0.0 } else { 1.0 };
                let x_height = (ascent * 0.6).round();
                let lean = if style.italic { 1.0 } else { 0.0 };
                self.fill_logical(
                    x + inset + lean,
                    baseline - x_height,
                    (advance - 2.0 * inset - lean).max(1.0),
                    x_height,
                    color,
                    alpha,
                );
                if style.bold {
                    self.fill_logical(x, top, 1.0, ascent, color, alpha);
                }
            }
        }
    }
}
