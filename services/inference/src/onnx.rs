//! ONNX Runtime detector for YOLO-family exports.
//!
//! Expects a single `[1, 3, S, S]` float input and a `[1, 4 + C, N]` output
//! of centre-format boxes followed by per-class scores.

use crate::config::DetectorParams;
use crate::detector::{class_filter, non_max_suppression, Detector};
use argus_pipeline::{Detection, PipelineError};
use image::imageops::FilterType;
use ndarray::{s, Array4, ArrayView2, Axis, Ix3};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use tracing::{debug, info};

pub struct OnnxDetector {
    session: Session,
    input_name: String,
    output_name: String,
    labels: Vec<String>,
    params: DetectorParams,
}

impl OnnxDetector {
    /// Build a session from a model file. The file only needs to exist for
    /// the duration of this call.
    pub fn open(
        path: &Path,
        labels: Vec<String>,
        params: DetectorParams,
    ) -> Result<Self, PipelineError> {
        let session = Session::builder()
            .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|builder| builder.commit_from_file(path))
            .map_err(|e| PipelineError::ModelLoad(format!("failed to build session: {}", e)))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| PipelineError::ModelLoad("model declares no inputs".to_string()))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| PipelineError::ModelLoad("model declares no outputs".to_string()))?;

        info!(
            input = %input_name,
            output = %output_name,
            input_size = params.input_size,
            labels = labels.len(),
            "Detector session ready"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            labels,
            params,
        })
    }

    /// Decode, resize and lay out the frame as normalized NCHW.
    /// Returns the tensor and the original image dimensions.
    fn preprocess(&self, frame: &[u8]) -> Result<(Array4<f32>, u32, u32), PipelineError> {
        let image = image::load_from_memory(frame)
            .map_err(|e| PipelineError::Inference(format!("undecodable frame: {}", e)))?
            .to_rgb8();
        let (width, height) = image.dimensions();

        let size = self.params.input_size;
        let resized = image::imageops::resize(&image, size, size, FilterType::Triangle);

        let mut input = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for channel in 0..3 {
                input[[0, channel, y, x]] = pixel.0[channel] as f32 / 255.0;
            }
        }

        Ok((input, width, height))
    }
}

impl Detector for OnnxDetector {
    fn infer(&self, frame: &[u8], prompt: &str) -> Result<Vec<Detection>, PipelineError> {
        let to_inference_error = |e: ort::Error| PipelineError::Inference(e.to_string());

        let (input, width, height) = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(
                ort::inputs! {
                    self.input_name.as_str() => input,
                }
                .map_err(to_inference_error)?,
            )
            .map_err(to_inference_error)?;

        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| {
                PipelineError::Inference(format!("model produced no '{}' output", self.output_name))
            })?
            .try_extract_tensor::<f32>()
            .map_err(to_inference_error)?
            .into_dimensionality::<Ix3>()
            .map_err(|e| PipelineError::Inference(format!("unexpected output rank: {}", e)))?;

        let predictions: ArrayView2<f32> = output.slice(s![0, .., ..]);
        if predictions.shape()[0] <= 4 {
            return Err(PipelineError::Inference(format!(
                "output has {} rows, expected box coordinates plus class scores",
                predictions.shape()[0]
            )));
        }

        let allowed = class_filter(&self.labels, prompt);
        let scale_x = width as f32 / self.params.input_size as f32;
        let scale_y = height as f32 / self.params.input_size as f32;

        let mut candidates = Vec::new();
        for column in predictions.axis_iter(Axis(1)) {
            let (class_id, score) = column
                .iter()
                .skip(4)
                .enumerate()
                .fold((0, f32::MIN), |best, (idx, &score)| {
                    if score > best.1 {
                        (idx, score)
                    } else {
                        best
                    }
                });

            if score < self.params.confidence_threshold {
                continue;
            }
            if let Some(allowed) = &allowed {
                if !allowed.contains(&class_id) {
                    continue;
                }
            }

            let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
            candidates.push(Detection {
                bbox: [
                    ((cx - w / 2.0) * scale_x).clamp(0.0, width as f32),
                    ((cy - h / 2.0) * scale_y).clamp(0.0, height as f32),
                    ((cx + w / 2.0) * scale_x).clamp(0.0, width as f32),
                    ((cy + h / 2.0) * scale_y).clamp(0.0, height as f32),
                ],
                label: class_id as f32,
                confidence: score,
            });
        }

        let candidate_count = candidates.len();
        let detections = non_max_suppression(
            candidates,
            self.params.iou_threshold,
            self.params.max_detections,
        );

        debug!(
            candidates = candidate_count,
            detections = detections.len(),
            filtered = allowed.is_some(),
            "Post-processed model output"
        );

        Ok(detections)
    }
}
