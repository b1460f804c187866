//! Alert events, stats documents and the per-session accumulator.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::annotate::FrameAnnotations;

/// A fault detection above the confidence threshold, stamped with the
/// playback position in seconds. Serialized as `[label, confidence, seconds]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent(pub String, pub f32, pub f64);

impl AlertEvent {
    pub fn new(label: impl Into<String>, confidence: f32, timestamp_s: f64) -> Self {
        Self(label.into(), confidence, timestamp_s)
    }

    pub fn label(&self) -> &str {
        &self.0
    }

    pub fn confidence(&self) -> f32 {
        self.1
    }

    pub fn timestamp_s(&self) -> f64 {
        self.2
    }
}

/// Per-class counters for one video. `detections_by_class` counts each
/// class once per session, on first confident sighting; `errors` counts
/// every alert.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassStats {
    pub detections_by_class: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
}

impl ClassStats {
    pub fn total_detections(&self) -> u64 {
        self.detections_by_class.values().sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.values().sum()
    }
}

/// Persisted stats for one uploaded video.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsDocument {
    pub file_id: String,
    pub stats: ClassStats,
    pub error_times: Vec<AlertEvent>,
    #[serde(default)]
    pub frames_processed: u64,
    #[serde(default)]
    pub updated_at: u64,
}

/// Running counters owned by one playback session.
///
/// Counts only ever grow; a snapshot taken later always dominates an earlier
/// one class by class.
#[derive(Clone, Debug, Default)]
pub struct StatsAccumulator {
    stats: ClassStats,
    detected_objects: BTreeSet<String>,
    error_times: Vec<AlertEvent>,
    frames_processed: u64,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame's annotations into the counters.
    pub fn record(&mut self, annotations: &FrameAnnotations) {
        for detection in &annotations.confident {
            if self.detected_objects.insert(detection.label.clone()) {
                *self
                    .stats
                    .detections_by_class
                    .entry(detection.label.clone())
                    .or_insert(0) += 1;
            }
        }
        for alert in &annotations.alerts {
            *self.stats.errors.entry(alert.0.clone()).or_insert(0) += 1;
        }
        self.error_times.extend(annotations.alerts.iter().cloned());
        self.frames_processed += 1;
    }

    /// Count a frame that produced no annotations (e.g. a skipped detector failure).
    pub fn record_empty_frame(&mut self) {
        self.frames_processed += 1;
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn stats(&self) -> &ClassStats {
        &self.stats
    }

    /// Classes seen with confidence so far in this session.
    pub fn detected_objects(&self) -> &BTreeSet<String> {
        &self.detected_objects
    }

    pub fn error_times(&self) -> &[AlertEvent] {
        &self.error_times
    }

    pub fn snapshot(&self, file_id: &str, updated_at: u64) -> StatsDocument {
        StatsDocument {
            file_id: file_id.to_string(),
            stats: self.stats.clone(),
            error_times: self.error_times.clone(),
            frames_processed: self.frames_processed,
            updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};

    fn annotations(labels: &[&str], alerts: &[(&str, f64)]) -> FrameAnnotations {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        FrameAnnotations {
            confident: labels
                .iter()
                .map(|l| Detection::new(0, *l, 0.9, bbox))
                .collect(),
            alerts: alerts
                .iter()
                .map(|(l, t)| AlertEvent::new(*l, 0.9, *t))
                .collect(),
            messages: Vec::new(),
        }
    }

    #[test]
    fn accumulates_counts_and_alert_times() {
        let mut acc = StatsAccumulator::new();
        acc.record(&annotations(&["conector", "conector suelto"], &[("conector suelto", 0.0)]));
        acc.record_empty_frame();
        acc.record(&annotations(&["conector suelto"], &[("conector suelto", 0.1)]));

        let doc = acc.snapshot("abc", 7);
        assert_eq!(doc.frames_processed, 3);
        assert_eq!(doc.stats.detections_by_class["conector"], 1);
        assert_eq!(doc.stats.detections_by_class["conector suelto"], 1);
        assert_eq!(doc.stats.errors["conector suelto"], 2);
        assert_eq!(doc.error_times.len(), 2);
        assert_eq!(doc.error_times[1].timestamp_s(), 0.1);
        assert_eq!(doc.updated_at, 7);
    }

    #[test]
    fn successive_snapshots_never_decrease() {
        let mut acc = StatsAccumulator::new();
        let frames = [
            annotations(&["a"], &[]),
            annotations(&["b", "a"], &[("b", 0.2)]),
            annotations(&[], &[]),
            annotations(&["c"], &[("c", 0.4)]),
        ];
        let mut previous = acc.snapshot("x", 0);
        for frame in &frames {
            acc.record(frame);
            let next = acc.snapshot("x", 0);
            for (label, count) in &previous.stats.detections_by_class {
                assert!(next.stats.detections_by_class[label] >= *count);
            }
            assert!(next.stats.total_detections() >= previous.stats.total_detections());
            assert!(next.error_times.starts_with(&previous.error_times));
            previous = next;
        }
    }

    #[test]
    fn counts_each_class_once_per_session() {
        let mut acc = StatsAccumulator::new();
        for _ in 0..300 {
            acc.record(&annotations(&["panel solar", "panel solar"], &[]));
        }
        acc.record(&annotations(&["cojinete"], &[]));

        let doc = acc.snapshot("abc", 0);
        assert_eq!(doc.frames_processed, 301);
        assert_eq!(doc.stats.detections_by_class["panel solar"], 1);
        assert_eq!(doc.stats.detections_by_class["cojinete"], 1);
        assert_eq!(doc.stats.total_detections(), 2);
        let seen: Vec<&str> = acc.detected_objects().iter().map(String::as_str).collect();
        assert_eq!(seen, vec!["cojinete", "panel solar"]);

        let fresh = StatsAccumulator::new();
        assert!(fresh.detected_objects().is_empty());
    }

    #[test]
    fn alert_events_serialize_as_tuples() {
        let json = serde_json::to_string(&AlertEvent::new("torque desalineado", 0.5, 1.25)).unwrap();
        assert_eq!(json, r#"["torque desalineado",0.5,1.25]"#);
        let back: AlertEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.label(), "torque desalineado");
    }
}
