#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::detect::yolo::{decode_yolov5, letterbox_chw, DecodeSettings, Letterbox};
use crate::labels::LabelMap;

/// Tract-based backend for YOLOv5 models exported to ONNX.
///
/// Frames of any size are letterboxed to the model input; boxes are mapped
/// back to frame pixels before they are returned.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_width: u32,
    input_height: u32,
    labels: LabelMap,
    settings: DecodeSettings,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_width: u32,
        input_height: u32,
        labels: LabelMap,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width,
            input_height,
            labels,
            settings: DecodeSettings::default(),
        })
    }

    /// Override the candidate floor and NMS settings.
    pub fn with_settings(mut self, settings: DecodeSettings) -> Self {
        self.settings = settings;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<(Tensor, Letterbox)> {
        let (chw, geometry) =
            letterbox_chw(pixels, width, height, self.input_width, self.input_height)?;
        let input = tract_ndarray::Array4::from_shape_vec(
            (1, 3, self.input_height as usize, self.input_width as usize),
            chw,
        )
        .context("letterboxed tensor has the wrong shape")?;
        Ok((input.into_tensor(), geometry))
    }

    fn head_classes(&self, output: &Tensor) -> Result<usize> {
        let shape = output.shape();
        let row = *shape
            .last()
            .ok_or_else(|| anyhow!("model output has no dimensions"))?;
        if row <= 5 {
            return Err(anyhow!("model output rows have {} values, expected > 5", row));
        }
        Ok(row - 5)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let (input, geometry) = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let num_classes = self.head_classes(output)?;
        if num_classes < self.labels.num_classes() {
            log::debug!(
                "model head has {} classes, label map names {}",
                num_classes,
                self.labels.num_classes()
            );
        }
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let rows: Vec<f32> = view.iter().copied().collect();

        decode_yolov5(
            &rows,
            num_classes,
            geometry,
            width,
            height,
            &self.labels,
            self.settings,
        )
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = vec![0u8; (self.input_width as usize) * (self.input_height as usize) * 3];
        let (w, h) = (self.input_width, self.input_height);
        self.detect(&blank, w, h).map(|_| ())
    }
}
