//! Frame annotation: alert classification and box drawing.
//!
//! Two independent passes run over one frame's detections:
//!
//! 1. Classification. Only detections strictly above the confidence threshold
//!    count. Those whose label is in the alert set become `AlertEvent`s.
//! 2. Drawing. Every detection gets a box regardless of confidence, green for
//!    labels in the nominal set and red for anything else.

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::collections::BTreeSet;
use std::path::Path;

use crate::detect::Detection;
use crate::frame::Frame;
use crate::stats::AlertEvent;

pub const NOMINAL_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const FAULT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_TAB_HEIGHT: u32 = 18;
const BOX_THICKNESS: u32 = 2;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.70;

pub const DEFAULT_ALERT_LABELS: &[&str] =
    &["conector suelto", "torque desalineado", "amortiguador suelto"];

pub const DEFAULT_NOMINAL_LABELS: &[&str] = &[
    "torque alineado",
    "conector",
    "panel solar",
    "cojinete",
    "chicote",
    "reductor",
    "amortiguador bueno",
];

/// Label sets and threshold deciding what counts and what alerts.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertPolicy {
    pub confidence_threshold: f32,
    pub alert_labels: BTreeSet<String>,
    pub nominal_labels: BTreeSet<String>,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            alert_labels: DEFAULT_ALERT_LABELS.iter().map(|l| l.to_string()).collect(),
            nominal_labels: DEFAULT_NOMINAL_LABELS
                .iter()
                .map(|l| l.to_string())
                .collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// At or below the threshold: drawn, never counted.
    BelowThreshold,
    /// Confident detection of a non-fault label.
    Nominal,
    /// Confident detection of a fault label.
    Alert,
}

impl AlertPolicy {
    pub fn classify(&self, detection: &Detection) -> Classification {
        if detection.confidence <= self.confidence_threshold {
            Classification::BelowThreshold
        } else if self.alert_labels.contains(&detection.label) {
            Classification::Alert
        } else {
            Classification::Nominal
        }
    }

    pub fn box_color(&self, label: &str) -> Rgb<u8> {
        if self.nominal_labels.contains(label) {
            NOMINAL_COLOR
        } else {
            FAULT_COLOR
        }
    }
}

/// Structured output of annotating one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameAnnotations {
    /// Detections above the threshold, in detector order.
    pub confident: Vec<Detection>,
    pub alerts: Vec<AlertEvent>,
    /// Human-readable alert lines, one per alert.
    pub messages: Vec<String>,
}

pub struct Annotator {
    policy: AlertPolicy,
    font: Option<FontVec>,
    font_scale: PxScale,
}

impl Annotator {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            policy,
            font: None,
            font_scale: PxScale::from(16.0),
        }
    }

    /// Render label text with a TrueType font. Without one only the label tab is drawn.
    pub fn with_font_file(mut self, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|_| anyhow::anyhow!("{} is not a usable TrueType font", path.display()))?;
        self.font = Some(font);
        Ok(self)
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    pub fn annotate(
        &self,
        frame: &mut Frame,
        detections: &[Detection],
        timestamp_s: f64,
    ) -> FrameAnnotations {
        let mut out = FrameAnnotations::default();

        for detection in detections {
            match self.policy.classify(detection) {
                Classification::BelowThreshold => {}
                Classification::Nominal => out.confident.push(detection.clone()),
                Classification::Alert => {
                    out.messages.push(format!(
                        "ALERT: {} detected with {:.2} confidence",
                        detection.label, detection.confidence
                    ));
                    out.alerts.push(AlertEvent::new(
                        detection.label.clone(),
                        detection.confidence,
                        timestamp_s,
                    ));
                    out.confident.push(detection.clone());
                }
            }
        }

        for detection in detections {
            self.draw_detection(&mut frame.image, detection);
        }

        out
    }

    fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
        let Some((x1, y1, x2, y2)) = detection
            .bbox
            .clamped_pixels(image.width(), image.height())
        else {
            return;
        };
        let color = self.policy.box_color(&detection.label);

        for inset in 0..BOX_THICKNESS as i32 {
            let w = x2 - x1 - 2 * inset;
            let h = y2 - y1 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(w as u32 + 1, h as u32 + 1);
            draw_hollow_rect_mut(image, rect, color);
        }

        let text = format!("{} {:.2}", detection.label, detection.confidence);
        let tab_width = match &self.font {
            Some(font) => text_size(self.font_scale, font, &text).0 + 6,
            None => ((x2 - x1) as u32 + 1).min(48),
        };
        // Tab sits above the box, or just inside it at the top edge of the frame.
        let tab_y = if y1 >= LABEL_TAB_HEIGHT as i32 {
            y1 - LABEL_TAB_HEIGHT as i32
        } else {
            y1
        };
        let tab = Rect::at(x1, tab_y).of_size(tab_width.max(1), LABEL_TAB_HEIGHT);
        draw_filled_rect_mut(image, tab, color);

        if let Some(font) = &self.font {
            draw_text_mut(
                image,
                LABEL_TEXT_COLOR,
                x1 + 3,
                tab_y + 1,
                self.font_scale,
                font,
                &text,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn det(label: &str, confidence: f32) -> Detection {
        Detection::new(0, label, confidence, BoundingBox::new(20.0, 30.0, 60.0, 70.0))
    }

    fn blank_frame() -> Frame {
        Frame::new(RgbImage::new(100, 100), 0)
    }

    #[test]
    fn classification_respects_threshold_and_alert_set() {
        let policy = AlertPolicy::default();
        assert_eq!(
            policy.classify(&det("conector suelto", 0.70)),
            Classification::BelowThreshold
        );
        assert_eq!(
            policy.classify(&det("conector suelto", 0.71)),
            Classification::Alert
        );
        assert_eq!(policy.classify(&det("conector", 0.95)), Classification::Nominal);
        assert_eq!(
            policy.classify(&det("something else", 0.95)),
            Classification::Nominal
        );
    }

    #[test]
    fn low_confidence_never_alerts() {
        let annotator = Annotator::new(AlertPolicy::default());
        let mut frame = blank_frame();
        let detections: Vec<Detection> = [0.1, 0.5, 0.69, 0.7]
            .iter()
            .map(|c| det("torque desalineado", *c))
            .collect();

        let out = annotator.annotate(&mut frame, &detections, 1.0);
        assert!(out.alerts.is_empty());
        assert!(out.confident.is_empty());
        assert!(out.messages.is_empty());
    }

    #[test]
    fn alerts_carry_label_confidence_and_time() {
        let annotator = Annotator::new(AlertPolicy::default());
        let mut frame = blank_frame();
        let detections = vec![det("amortiguador suelto", 0.9), det("panel solar", 0.8)];

        let out = annotator.annotate(&mut frame, &detections, 2.5);
        assert_eq!(out.confident.len(), 2);
        assert_eq!(out.alerts, vec![AlertEvent::new("amortiguador suelto", 0.9, 2.5)]);
        assert_eq!(
            out.messages,
            vec!["ALERT: amortiguador suelto detected with 0.90 confidence".to_string()]
        );
    }

    #[test]
    fn draws_every_detection_with_label_colour() {
        let annotator = Annotator::new(AlertPolicy::default());
        let mut frame = blank_frame();
        let nominal = Detection::new(0, "conector", 0.2, BoundingBox::new(10.0, 40.0, 30.0, 60.0));
        let fault = Detection::new(0, "conector suelto", 0.2, BoundingBox::new(60.0, 40.0, 90.0, 60.0));

        annotator.annotate(&mut frame, &[nominal, fault], 0.0);

        assert_eq!(*frame.image.get_pixel(10, 50), NOMINAL_COLOR);
        assert_eq!(*frame.image.get_pixel(11, 50), NOMINAL_COLOR);
        assert_eq!(*frame.image.get_pixel(60, 50), FAULT_COLOR);
        assert_eq!(*frame.image.get_pixel(20, 50), Rgb([0, 0, 0]));
    }

    #[test]
    fn boxes_outside_the_frame_are_skipped() {
        let annotator = Annotator::new(AlertPolicy::default());
        let mut frame = blank_frame();
        let outside =
            Detection::new(0, "conector suelto", 0.9, BoundingBox::new(150.0, 150.0, 200.0, 200.0));

        let out = annotator.annotate(&mut frame, &[outside], 0.0);
        assert_eq!(out.alerts.len(), 1);
        assert!(frame.image.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }
}
