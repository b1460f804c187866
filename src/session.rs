//! The video analysis loop.
//!
//! A `VideoLoop` owns one decoded source and one `StatsAccumulator` for the
//! lifetime of a playback session:
//!
//! - OPEN: the source has been opened; nothing has been read yet.
//! - STREAMING: frames are read, detected, annotated, counted and encoded one
//!   at a time. Every `flush_interval_frames` frames the accumulator is
//!   flushed to the stats sink.
//! - CLOSED: end-of-stream, decode failure, aborting detector failure, or the
//!   loop being dropped. The decoder is released and a final flush runs.
//!
//! Flush failures are logged and never end the loop.

use anyhow::{anyhow, Result};
use std::str::FromStr;
use std::sync::Arc;

use crate::annotate::{Annotator, FrameAnnotations};
use crate::detect::{Detection, SharedBackend};
use crate::frame::{Frame, DEFAULT_JPEG_QUALITY};
use crate::ingest::VideoSource;
use crate::stats::{StatsAccumulator, StatsDocument};

pub const DEFAULT_FLUSH_INTERVAL_FRAMES: u64 = 50;
pub const DEFAULT_FALLBACK_FPS: f64 = 30.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Streaming,
    Closed,
}

/// What to do when the detector fails on a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DetectorErrorPolicy {
    /// Log and pass the frame through without annotations.
    #[default]
    Skip,
    /// End the session with the error.
    Abort,
}

impl FromStr for DetectorErrorPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            other => Err(anyhow!(
                "unknown detector error policy '{}' (expected skip or abort)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoopSettings {
    pub flush_interval_frames: u64,
    /// Frame rate used for timestamps when the source reports none.
    pub fallback_fps: f64,
    pub on_detector_error: DetectorErrorPolicy,
    /// JPEG quality for encoded frames; `None` skips encoding entirely.
    pub jpeg_quality: Option<u8>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            flush_interval_frames: DEFAULT_FLUSH_INTERVAL_FRAMES,
            fallback_fps: DEFAULT_FALLBACK_FPS,
            on_detector_error: DetectorErrorPolicy::Skip,
            jpeg_quality: Some(DEFAULT_JPEG_QUALITY),
        }
    }
}

/// Destination of periodic stats flushes.
pub trait StatsSink {
    fn flush(&mut self, doc: &StatsDocument) -> Result<()>;
}

impl<F> StatsSink for F
where
    F: FnMut(&StatsDocument) -> Result<()>,
{
    fn flush(&mut self, doc: &StatsDocument) -> Result<()> {
        self(doc)
    }
}

/// One processed frame.
#[derive(Debug)]
pub struct AnnotatedFrame {
    pub index: u64,
    pub timestamp_s: f64,
    /// Everything the detector returned, confident or not.
    pub detections: Vec<Detection>,
    pub annotations: FrameAnnotations,
    /// JPEG bytes of the annotated frame, when encoding is enabled.
    pub jpeg: Option<Vec<u8>>,
}

pub struct VideoLoop<S: VideoSource, K: StatsSink> {
    file_id: String,
    source: Option<S>,
    detector: SharedBackend,
    annotator: Arc<Annotator>,
    accumulator: StatsAccumulator,
    settings: LoopSettings,
    sink: K,
    state: SessionState,
    fps: f64,
    flushes: u64,
    failed_flushes: u64,
}

impl<S: VideoSource, K: StatsSink> VideoLoop<S, K> {
    pub fn open(
        file_id: impl Into<String>,
        source: S,
        detector: SharedBackend,
        annotator: Arc<Annotator>,
        settings: LoopSettings,
        sink: K,
    ) -> Self {
        let fps = source
            .fps()
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(settings.fallback_fps);
        Self {
            file_id: file_id.into(),
            source: Some(source),
            detector,
            annotator,
            accumulator: StatsAccumulator::new(),
            settings,
            sink,
            state: SessionState::Open,
            fps,
            flushes: 0,
            failed_flushes: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn accumulator(&self) -> &StatsAccumulator {
        &self.accumulator
    }

    /// Successful and failed flushes so far.
    pub fn flush_counts(&self) -> (u64, u64) {
        (self.flushes, self.failed_flushes)
    }

    /// Process the next frame. `Ok(None)` once the session is closed.
    pub fn step(&mut self) -> Result<Option<AnnotatedFrame>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        self.state = SessionState::Streaming;

        let mut frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!(
                    "video {}: end of stream after {} frames",
                    self.file_id,
                    self.accumulator.frames_processed()
                );
                self.close();
                return Ok(None);
            }
            Err(err) => {
                log::error!("video {}: decode failed: {:#}", self.file_id, err);
                self.close();
                return Err(err);
            }
        };

        let timestamp_s = frame.timestamp_s(self.fps);
        let (detections, annotations) = match self.detect(&frame) {
            Ok(detections) => {
                let annotations = self.annotator.annotate(&mut frame, &detections, timestamp_s);
                self.accumulator.record(&annotations);
                (detections, annotations)
            }
            Err(err) => match self.settings.on_detector_error {
                DetectorErrorPolicy::Skip => {
                    log::warn!(
                        "video {}: detection failed on frame {}, skipping: {:#}",
                        self.file_id,
                        frame.index,
                        err
                    );
                    self.accumulator.record_empty_frame();
                    (Vec::new(), FrameAnnotations::default())
                }
                DetectorErrorPolicy::Abort => {
                    log::error!(
                        "video {}: detection failed on frame {}: {:#}",
                        self.file_id,
                        frame.index,
                        err
                    );
                    self.close();
                    return Err(err);
                }
            },
        };

        let interval = self.settings.flush_interval_frames;
        if interval > 0 && self.accumulator.frames_processed() % interval == 0 {
            self.flush();
        }

        let jpeg = match self.settings.jpeg_quality {
            Some(quality) => Some(frame.encode_jpeg(quality)?),
            None => None,
        };

        Ok(Some(AnnotatedFrame {
            index: frame.index,
            timestamp_s,
            detections,
            annotations,
            jpeg,
        }))
    }

    /// Drive the loop to CLOSED and return the final stats.
    pub fn run_to_end(&mut self) -> Result<StatsDocument> {
        while self.step()?.is_some() {}
        Ok(self.snapshot())
    }

    /// Release the decoder and run the final flush. Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.source = None;
        self.state = SessionState::Closed;
        self.flush();
    }

    pub fn snapshot(&self) -> StatsDocument {
        self.accumulator
            .snapshot(&self.file_id, crate::now_s().unwrap_or_default())
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| anyhow!("detector lock poisoned"))?;
        detector.detect(frame.pixels(), frame.width(), frame.height())
    }

    fn flush(&mut self) {
        let doc = self.snapshot();
        match self.sink.flush(&doc) {
            Ok(()) => {
                self.flushes += 1;
                log::info!(
                    "video {}: stats flushed ({} frames, {} alerts)",
                    self.file_id,
                    doc.frames_processed,
                    doc.error_times.len()
                );
            }
            Err(err) => {
                self.failed_flushes += 1;
                log::warn!("video {}: stats flush failed: {:#}", self.file_id, err);
            }
        }
    }
}

impl<S: VideoSource, K: StatsSink> Iterator for VideoLoop<S, K> {
    type Item = Result<AnnotatedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

impl<S: VideoSource, K: StatsSink> Drop for VideoLoop<S, K> {
    fn drop(&mut self) {
        self.close();
    }
}
