#![cfg(feature = "backend-tract")]

use std::path::Path;

use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Candidate;
use crate::error::DetectorError;
use crate::frame::Frame;

const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_MIN_SCORE: f32 = 0.05;

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// Expects a single `[1, 3, H, W]` float input and a `[1, 4 + classes, N]`
/// output (centre x, centre y, width, height, then one score per class).
/// Frames are resized to the model input; boxes are scaled back to frame
/// pixels. Model loading happens once; inference does no I/O.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_width: u32,
    input_height: u32,
    class_names: Vec<String>,
    iou_threshold: f32,
    min_score: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_width: u32,
        input_height: u32,
        class_names: Vec<String>,
    ) -> Result<Self, DetectorError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(DetectorError::model_unavailable(format!(
                "model file {} not found",
                model_path.display()
            )));
        }
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .and_then(|m| {
                m.with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        f32::datum_type(),
                        tvec!(1, 3, input_height as usize, input_width as usize),
                    ),
                )
            })
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| {
                DetectorError::model_unavailable(format!(
                    "failed to load ONNX model from {}: {}",
                    model_path.display(),
                    e
                ))
            })?;

        Ok(Self {
            model,
            input_width,
            input_height,
            class_names,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            min_score: DEFAULT_MIN_SCORE,
        })
    }

    pub fn with_iou_threshold(mut self, iou: f32) -> Self {
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = imageops::resize(
            frame.pixels(),
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, self.input_width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Candidate>, DetectorError> {
        let output = outputs
            .first()
            .ok_or_else(|| DetectorError::inference("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| DetectorError::inference(format!("model output was not f32: {}", e)))?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(DetectorError::inference(format!(
                "unexpected output shape {:?}",
                shape
            )));
        }
        let attrs = shape[1];
        let anchors = shape[2];
        let sx = frame.width() as f32 / self.input_width as f32;
        let sy = frame.height() as f32 / self.input_height as f32;

        let mut candidates = Vec::new();
        for a in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for c in 4..attrs {
                let score = view[[0, c, a]];
                if score > best.1 {
                    best = (c - 4, score);
                }
            }
            if best.1.is_nan() || best.1 < self.min_score {
                continue;
            }
            let (cx, cy, w, h) = (
                view[[0, 0, a]],
                view[[0, 1, a]],
                view[[0, 2, a]],
                view[[0, 3, a]],
            );
            candidates.push((
                best.0,
                Candidate::new(
                    self.class_name(best.0),
                    best.1,
                    [
                        (cx - w / 2.0) * sx,
                        (cy - h / 2.0) * sy,
                        (cx + w / 2.0) * sx,
                        (cy + h / 2.0) * sy,
                    ],
                ),
            ));
        }
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>, DetectorError> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectorError::inference(format!("ONNX inference failed: {}", e)))?;
        self.decode(outputs, frame)
    }
}

/// Per-class greedy NMS, highest score first.
fn non_max_suppression(mut boxes: Vec<(usize, Candidate)>, iou_threshold: f32) -> Vec<Candidate> {
    boxes.sort_by(|a, b| b.1.confidence.total_cmp(&a.1.confidence));
    let mut kept: Vec<(usize, Candidate)> = Vec::new();
    for (class_id, cand) in boxes {
        let suppressed = kept
            .iter()
            .any(|(k_class, k)| *k_class == class_id && iou(k, &cand) > iou_threshold);
        if !suppressed {
            kept.push((class_id, cand));
        }
    }
    kept.into_iter().map(|(_, c)| c).collect()
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let ix = (a.x_max.min(b.x_max) - a.x_min.max(b.x_min)).max(0.0);
    let iy = (a.y_max.min(b.y_max) - a.y_min.max(b.y_min)).max(0.0);
    let inter = ix * iy;
    let area = |c: &Candidate| (c.x_max - c.x_min).max(0.0) * (c.y_max - c.y_min).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}
