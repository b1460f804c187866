//! Video ingestion sources.
//!
//! Sources decode a local video file sequentially into RGB `Frame`s:
//! - MJPEG files (concatenated JPEG frames), always available
//! - Any container FFmpeg can read (feature: ingest-file-ffmpeg)
//!
//! `next_frame` returns `Ok(None)` at end-of-stream. A decode error is
//! reported once and the source should be considered exhausted.

use anyhow::Result;
use std::path::Path;

use crate::frame::Frame;

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub(crate) mod mjpeg;

pub use file::{FileConfig, FileSource, FileStats};

/// Sequential frame source.
pub trait VideoSource {
    /// Native frame rate of the stream, when the container reports one.
    fn fps(&self) -> Option<f64>;

    /// Decode the next frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Opens a local video file with the decoder matching its content.
pub fn open_video(path: &Path) -> Result<FileSource> {
    let mut source = FileSource::new(FileConfig {
        path: path.to_path_buf(),
    })?;
    source.connect()?;
    Ok(source)
}
