//! Video analytics service
//!
//! Runs an object detector over uploaded videos, overlays the detections,
//! streams the annotated frames to a browser and aggregates per-class counts
//! and alert events into a persisted stats document and a PDF report.
//!
//! # Module Structure
//!
//! - `labels`: class id to display label map
//! - `detect`: detector backends (YOLOv5 ONNX, scripted) and the backend registry
//! - `ingest`: local video file decoding (MJPEG, FFmpeg)
//! - `annotate`: alert classification and box drawing for one frame
//! - `stats`: alert events, stats documents and the per-session accumulator
//! - `session`: the OPEN -> STREAMING -> CLOSED video loop with periodic flush
//! - `storage`: upload blobs and stats documents (SQLite, in-memory)
//! - `report`: stats document to PDF
//! - `api`: HTTP surface (upload, MJPEG playback, stats, SSE stats feed, reports)
//! - `config`: service configuration (file + environment)
//! - `ui`: stderr progress for the command-line tools

use anyhow::Result;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod labels;
pub mod report;
pub mod session;
pub mod stats;
pub mod storage;
pub mod ui;

pub use annotate::{AlertPolicy, Annotator, Classification, FrameAnnotations};
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectorBackend, ScriptedBackend};
pub use frame::Frame;
pub use ingest::{open_video, VideoSource};
pub use labels::LabelMap;
pub use session::{DetectorErrorPolicy, LoopSettings, SessionState, StatsSink, VideoLoop};
pub use stats::{AlertEvent, ClassStats, StatsAccumulator, StatsDocument};
pub use storage::{BlobStore, InMemoryVideoStore, SqliteVideoStore, StatsStore, StoredVideo};

// -------------------- File Ids --------------------

/// Length in hex characters of an upload identifier (12 random bytes).
pub const FILE_ID_LEN: usize = 24;

/// Generates a fresh upload identifier.
pub fn new_file_id() -> String {
    let mut bytes = [0u8; FILE_ID_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Returns true when `id` has the shape of an upload identifier.
pub fn is_valid_file_id(id: &str) -> bool {
    id.len() == FILE_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_file_ids_are_valid_and_distinct() {
        let a = new_file_id();
        let b = new_file_id();
        assert!(is_valid_file_id(&a));
        assert!(is_valid_file_id(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_malformed_file_ids() {
        assert!(!is_valid_file_id(""));
        assert!(!is_valid_file_id("../../etc/passwd"));
        assert!(!is_valid_file_id("0123456789ABCDEF01234567"));
        assert!(!is_valid_file_id("0123456789abcdef0123456"));
        assert!(is_valid_file_id("0123456789abcdef01234567"));
    }
}
