//! YOLOv5 pre- and post-processing shared by the inference backends.
//!
//! The exported YOLOv5 head produces `[1, N, 5 + C]` rows of
//! `cx, cy, w, h, objectness, class scores...` in letterboxed input pixels.

use anyhow::{anyhow, Result};
use image::{imageops, ImageBuffer, Rgb, RgbImage};

use crate::detect::result::{BoundingBox, Detection};
use crate::labels::LabelMap;

const LETTERBOX_FILL: u8 = 114;

/// Candidate filter and NMS settings. Defaults match the YOLOv5 hub model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecodeSettings {
    pub confidence_floor: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            confidence_floor: 0.25,
            iou_threshold: 0.45,
            max_detections: 1000,
        }
    }
}

/// Geometry of a letterbox resize, used to map boxes back to the frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn compute(width: u32, height: u32, input_w: u32, input_h: u32) -> Self {
        let scale = (input_w as f32 / width as f32).min(input_h as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((input_w as f32 - new_w) / 2.0).floor(),
            pad_y: ((input_h as f32 - new_h) / 2.0).floor(),
        }
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Letterboxes an RGB8 frame into a normalized `1x3xHxW` CHW tensor buffer.
pub fn letterbox_chw(
    pixels: &[u8],
    width: u32,
    height: u32,
    input_w: u32,
    input_h: u32,
) -> Result<(Vec<f32>, Letterbox)> {
    if width == 0 || height == 0 {
        return Err(anyhow!("frame has zero size"));
    }
    let frame: RgbImage = ImageBuffer::from_raw(width, height, pixels.to_vec()).ok_or_else(|| {
        anyhow!(
            "expected {} RGB bytes for {}x{}, received {}",
            (width as usize) * (height as usize) * 3,
            width,
            height,
            pixels.len()
        )
    })?;

    let geometry = Letterbox::compute(width, height, input_w, input_h);
    let new_w = ((width as f32 * geometry.scale).round() as u32).clamp(1, input_w);
    let new_h = ((height as f32 * geometry.scale).round() as u32).clamp(1, input_h);
    let resized = imageops::resize(&frame, new_w, new_h, imageops::FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(input_w, input_h, Rgb([LETTERBOX_FILL; 3]));
    imageops::replace(
        &mut canvas,
        &resized,
        geometry.pad_x as i64,
        geometry.pad_y as i64,
    );

    let plane = (input_w as usize) * (input_h as usize);
    let mut tensor = vec![0f32; plane * 3];
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let idx = (y as usize) * (input_w as usize) + x as usize;
        for channel in 0..3 {
            tensor[channel * plane + idx] = pixel[channel] as f32 / 255.0;
        }
    }
    Ok((tensor, geometry))
}

/// Decodes raw YOLOv5 rows into frame-space detections after class-wise NMS.
pub fn decode_yolov5(
    output: &[f32],
    num_classes: usize,
    geometry: Letterbox,
    frame_w: u32,
    frame_h: u32,
    labels: &LabelMap,
    settings: DecodeSettings,
) -> Result<Vec<Detection>> {
    if num_classes == 0 {
        return Err(anyhow!("detector head has no classes"));
    }
    let stride = 5 + num_classes;
    if output.len() % stride != 0 {
        return Err(anyhow!(
            "output length {} is not a multiple of row size {}",
            output.len(),
            stride
        ));
    }

    let mut candidates = Vec::new();
    for row in output.chunks_exact(stride) {
        let objectness = row[4];
        if objectness < settings.confidence_floor {
            continue;
        }
        let Some((class_idx, class_score)) = row[5..]
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            continue;
        };
        let confidence = objectness * class_score;
        if confidence < settings.confidence_floor {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let (x1, y1) = geometry.unmap(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = geometry.unmap(cx + w / 2.0, cy + h / 2.0);
        let bbox = BoundingBox::new(
            x1.clamp(0.0, frame_w as f32),
            y1.clamp(0.0, frame_h as f32),
            x2.clamp(0.0, frame_w as f32),
            y2.clamp(0.0, frame_h as f32),
        );
        if bbox.area() <= 0.0 {
            continue;
        }
        let class_id = class_idx as u32;
        candidates.push(Detection::new(
            class_id,
            labels.label(class_id),
            confidence.clamp(0.0, 1.0),
            bbox,
        ));
    }

    Ok(classwise_nms(
        candidates,
        settings.iou_threshold,
        settings.max_detections,
    ))
}

/// Greedy per-class non-maximum suppression. Output is sorted by confidence.
pub fn classwise_nms(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_total: usize,
) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len().min(max_total));
    for candidate in candidates {
        if kept.len() >= max_total {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cx: f32, cy: f32, w: f32, h: f32, obj: f32, classes: &[f32]) -> Vec<f32> {
        let mut out = vec![cx, cy, w, h, obj];
        out.extend_from_slice(classes);
        out
    }

    #[test]
    fn letterbox_geometry_for_wide_frame() {
        let g = Letterbox::compute(1280, 720, 640, 640);
        assert!((g.scale - 0.5).abs() < 1e-6);
        assert_eq!(g.pad_x, 0.0);
        assert_eq!(g.pad_y, 140.0);
    }

    #[test]
    fn letterbox_tensor_is_padded_and_normalized() {
        let pixels = vec![255u8; 4 * 2 * 3];
        let (tensor, g) = letterbox_chw(&pixels, 4, 2, 8, 8).unwrap();
        assert_eq!(tensor.len(), 3 * 8 * 8);
        assert_eq!(g.pad_y, 2.0);
        // top-left corner is letterbox fill, centre row is image content
        assert!((tensor[0] - 114.0 / 255.0).abs() < 1e-6);
        assert!((tensor[3 * 8 + 4] - 1.0).abs() < 1e-6);

        assert!(letterbox_chw(&pixels[..5], 4, 2, 8, 8).is_err());
    }

    #[test]
    fn decodes_rows_into_frame_space_and_suppresses_overlaps() {
        let labels = LabelMap::default();
        let geometry = Letterbox::compute(1280, 720, 640, 640);
        let mut output = Vec::new();
        // class 7 "conector suelto", box centred at (320, 320) in input space
        output.extend(row(320.0, 320.0, 100.0, 50.0, 0.9, &one_hot(12, 7, 0.9)));
        // overlapping duplicate with lower score, same class
        output.extend(row(322.0, 321.0, 100.0, 50.0, 0.8, &one_hot(12, 7, 0.9)));
        // same place, different class survives
        output.extend(row(320.0, 320.0, 100.0, 50.0, 0.7, &one_hot(12, 6, 0.9)));
        // below the floor
        output.extend(row(100.0, 100.0, 10.0, 10.0, 0.1, &one_hot(12, 1, 0.9)));

        let detections = decode_yolov5(
            &output,
            12,
            geometry,
            1280,
            720,
            &labels,
            DecodeSettings::default(),
        )
        .unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].label, "conector suelto");
        assert!((detections[0].confidence - 0.81).abs() < 1e-4);
        assert_eq!(detections[1].label, "conector");
        let bbox = detections[0].bbox;
        assert!((bbox.x1 - 540.0).abs() < 1e-3);
        assert!((bbox.x2 - 740.0).abs() < 1e-3);
        assert!((bbox.y1 - 310.0).abs() < 1e-3);
        assert!((bbox.y2 - 410.0).abs() < 1e-3);
    }

    #[test]
    fn rejects_misaligned_output() {
        let labels = LabelMap::default();
        let geometry = Letterbox::compute(640, 640, 640, 640);
        let err = decode_yolov5(
            &[0.0; 18],
            12,
            geometry,
            640,
            640,
            &labels,
            DecodeSettings::default(),
        );
        assert!(err.is_err());
    }

    fn one_hot(n: usize, idx: usize, score: f32) -> Vec<f32> {
        let mut v = vec![0.0; n];
        v[idx] = score;
        v
    }
}
