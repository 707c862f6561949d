use crate::detect::backend::DetectorBackend;
use crate::detect::result::Candidate;
use crate::error::DetectorError;
use crate::frame::Frame;

const DEFAULT_CELL_PX: u32 = 16;
const DEFAULT_DIFF_THRESHOLD: u8 = 24;
const DEFAULT_MIN_CELLS: usize = 2;

/// CPU backend for motion detection.
///
/// Compares a coarse luma grid of the current frame against the frame from
/// the previous call and reports one `motion` box around the changed cells.
/// Confidence is the density of changed cells inside that box.
pub struct CpuBackend {
    cell_px: u32,
    diff_threshold: u8,
    min_cells: usize,
    previous: Option<LumaGrid>,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self {
            cell_px: DEFAULT_CELL_PX,
            diff_threshold: DEFAULT_DIFF_THRESHOLD,
            min_cells: DEFAULT_MIN_CELLS,
            previous: None,
        }
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cell_size(mut self, cell_px: u32) -> Self {
        self.cell_px = cell_px.max(1);
        self
    }

    pub fn with_diff_threshold(mut self, threshold: u8) -> Self {
        self.diff_threshold = threshold;
        self
    }
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>, DetectorError> {
        let grid = LumaGrid::from_frame(frame, self.cell_px);
        let candidates = match &self.previous {
            Some(prev) if prev.same_shape(&grid) => {
                motion_box(prev, &grid, self.diff_threshold, self.min_cells)
                    .into_iter()
                    .collect()
            }
            _ => Vec::new(),
        };
        self.previous = Some(grid);
        Ok(candidates)
    }
}

struct LumaGrid {
    cols: u32,
    rows: u32,
    cell_px: u32,
    width: u32,
    height: u32,
    values: Vec<u8>,
}

impl LumaGrid {
    fn from_frame(frame: &Frame, cell_px: u32) -> Self {
        let width = frame.width();
        let height = frame.height();
        let cols = width.div_ceil(cell_px);
        let rows = height.div_ceil(cell_px);
        let mut sums = vec![0u64; (cols * rows) as usize];
        let mut counts = vec![0u64; (cols * rows) as usize];
        for (x, y, px) in frame.pixels().enumerate_pixels() {
            let [r, g, b] = px.0;
            let luma = (299 * r as u64 + 587 * g as u64 + 114 * b as u64) / 1000;
            let idx = ((y / cell_px) * cols + x / cell_px) as usize;
            sums[idx] += luma;
            counts[idx] += 1;
        }
        let values = sums
            .iter()
            .zip(&counts)
            .map(|(s, c)| if *c == 0 { 0 } else { (s / c) as u8 })
            .collect();
        Self {
            cols,
            rows,
            cell_px,
            width,
            height,
            values,
        }
    }

    fn same_shape(&self, other: &LumaGrid) -> bool {
        self.width == other.width && self.height == other.height && self.cell_px == other.cell_px
    }
}

fn motion_box(
    prev: &LumaGrid,
    cur: &LumaGrid,
    threshold: u8,
    min_cells: usize,
) -> Option<Candidate> {
    let mut changed = 0usize;
    let (mut c0, mut r0, mut c1, mut r1) = (u32::MAX, u32::MAX, 0u32, 0u32);
    for row in 0..cur.rows {
        for col in 0..cur.cols {
            let idx = (row * cur.cols + col) as usize;
            if prev.values[idx].abs_diff(cur.values[idx]) > threshold {
                changed += 1;
                c0 = c0.min(col);
                r0 = r0.min(row);
                c1 = c1.max(col);
                r1 = r1.max(row);
            }
        }
    }
    if changed < min_cells.max(1) {
        return None;
    }
    let area = ((c1 - c0 + 1) * (r1 - r0 + 1)) as f32;
    let cell = cur.cell_px as f32;
    Some(Candidate::new(
        "motion",
        changed as f32 / area,
        [
            c0 as f32 * cell,
            r0 as f32 * cell,
            (c1 + 1) as f32 * cell - 1.0,
            (r1 + 1) as f32 * cell - 1.0,
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn frame_with_square(index: u64, at: Option<(u32, u32)>) -> Frame {
        let mut img = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
        if let Some((x0, y0)) = at {
            for y in y0..y0 + 32 {
                for x in x0..x0 + 32 {
                    img.put_pixel(x, y, Rgb([255, 255, 255]));
                }
            }
        }
        Frame::new(index, 0.0, img)
    }

    #[test]
    fn cpu_backend_detects_motion() {
        let mut backend = CpuBackend::default();

        let first = backend.detect(&frame_with_square(1, None)).unwrap();
        assert!(first.is_empty());

        let second = backend.detect(&frame_with_square(2, Some((32, 32)))).unwrap();
        assert_eq!(second.len(), 1);
        let c = &second[0];
        assert_eq!(c.class_name, "motion");
        assert_eq!((c.x_min, c.y_min), (32.0, 32.0));
        assert_eq!((c.x_max, c.y_max), (63.0, 63.0));
        assert!((c.confidence - 1.0).abs() < 1e-6);

        let third = backend.detect(&frame_with_square(3, Some((32, 32)))).unwrap();
        assert!(third.is_empty());
    }

    #[test]
    fn repeated_frames_are_quiet_until_the_scene_moves() {
        let mut backend = CpuBackend::default();
        for index in 1..=3 {
            assert!(backend.detect(&frame_with_square(index, Some((0, 0)))).unwrap().is_empty());
        }
        let moved = backend.detect(&frame_with_square(4, Some((32, 0)))).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!((moved[0].x_min, moved[0].x_max), (0.0, 63.0));
    }
}
