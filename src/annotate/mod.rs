//! Detection overlay rendering.
//!
//! `Annotator::render` never touches the input frame: it copies the pixel
//! buffer, draws boxes and labels on the copy and returns a new `Frame`.

mod font;

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::cache::CacheState;
use crate::detect::Detection;
use crate::frame::Frame;

pub const DEFAULT_LINE_WIDTH: u32 = 2;
pub const DEFAULT_FONT_SIZE: f32 = 2.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnnotatorStyle {
    /// Box stroke width in pixels, drawn inward from the box edge.
    pub line_width: u32,
    /// Glyph scale; 1.0 renders the 5x7 font at native size.
    pub font_size: f32,
}

impl Default for AnnotatorStyle {
    fn default() -> Self {
        Self {
            line_width: DEFAULT_LINE_WIDTH,
            font_size: DEFAULT_FONT_SIZE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Annotator {
    style: AnnotatorStyle,
}

impl Annotator {
    pub fn new(style: AnnotatorStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> AnnotatorStyle {
        self.style
    }

    /// Render the cached detections onto a copy of `frame`.
    pub fn render(&self, frame: &Frame, state: &CacheState) -> Frame {
        let detections = state.detections();
        if detections.is_empty() {
            return frame.clone();
        }
        let mut canvas = frame.pixels().clone();
        for det in detections {
            self.draw_detection(&mut canvas, det);
        }
        frame.with_pixels(canvas)
    }

    fn draw_detection(&self, canvas: &mut RgbImage, det: &Detection) {
        let color = class_color(&det.class_name);
        let (w, h) = (det.box_width(), det.box_height());
        for t in 0..self.style.line_width.max(1) {
            if 2 * t >= w || 2 * t >= h {
                break;
            }
            let rect = Rect::at((det.x_min + t) as i32, (det.y_min + t) as i32)
                .of_size(w - 2 * t, h - 2 * t);
            draw_hollow_rect_mut(canvas, rect, color);
        }
        let label = format!("{} {:.2}", det.class_name, det.confidence);
        self.draw_label(canvas, det, &label, color);
    }

    /// Label is centred on the box; above it when there is room, else inside.
    fn draw_label(&self, canvas: &mut RgbImage, det: &Detection, label: &str, color: Rgb<u8>) {
        let scale = self.glyph_scale(canvas.height());
        let (text_w, text_h) = font::text_size(label, scale);
        if text_w == 0 {
            return;
        }
        let pad = scale;
        let bg_w = text_w.saturating_add(pad.saturating_mul(2));
        let bg_h = text_h.saturating_add(pad.saturating_mul(2));
        let centre_x = (det.x_min as i64 + det.x_max as i64) / 2;
        let left = centre_x - bg_w as i64 / 2;
        let above = det.y_min as i64 - bg_h as i64;
        let top = if above >= 0 {
            above
        } else {
            det.y_min as i64 + self.style.line_width as i64
        };
        let clamp = |v: i64| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        let (left, top) = (clamp(left), clamp(top));

        draw_filled_rect_mut(canvas, Rect::at(left, top).of_size(bg_w, bg_h), color);
        let ink = contrast_ink(color);
        let mut pen_x = left as i64 + pad as i64;
        let pen_y = top as i64 + pad as i64;
        for ch in label.chars() {
            let rows = font::glyph(ch);
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..font::GLYPH_WIDTH {
                    if (bits >> (font::GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                        let x = clamp(pen_x + col as i64 * scale as i64);
                        let y = clamp(pen_y + row as i64 * scale as i64);
                        draw_filled_rect_mut(canvas, Rect::at(x, y).of_size(scale, scale), ink);
                    }
                }
            }
            pen_x += font::GLYPH_ADVANCE as i64 * scale as i64;
        }
    }

    /// Integer glyph scale, capped so a single glyph is never taller than
    /// the canvas.
    fn glyph_scale(&self, canvas_height: u32) -> u32 {
        let max_scale = (canvas_height / font::GLYPH_HEIGHT).max(1);
        if !self.style.font_size.is_finite() {
            return 1;
        }
        let requested = self.style.font_size.round().max(1.0);
        if requested >= max_scale as f32 {
            max_scale
        } else {
            requested as u32
        }
    }
}

/// Deterministic, never-black colour per class name.
pub fn class_color(class_name: &str) -> Rgb<u8> {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in class_name.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let r = (hash & 0xFF) as u8 | 0x40;
    let g = ((hash >> 8) & 0xFF) as u8 | 0x40;
    let b = ((hash >> 16) & 0xFF) as u8 | 0x40;
    Rgb([r, g, b])
}

fn contrast_ink(bg: Rgb<u8>) -> Rgb<u8> {
    let [r, g, b] = bg.0;
    let luma = 299 * r as u32 + 587 * g as u32 + 114 * b as u32;
    if luma > 128_000 {
        Rgb([0, 0, 0])
    } else {
        Rgb([255, 255, 255])
    }
}
