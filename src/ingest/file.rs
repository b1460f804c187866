//! Local file frame source.
//!
//! `FileSource` picks a decoder by sniffing the file: content starting with a
//! JPEG SOI marker is treated as MJPEG, everything else goes to FFmpeg when
//! the `ingest-file-ffmpeg` feature is enabled.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::PathBuf;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::mjpeg::MjpegFileSource;
use super::VideoSource;
use crate::frame::Frame;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Configuration for a local file source.
#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    /// Local file path (e.g., "uploads/inspection.mp4").
    pub path: PathBuf,
}

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Mjpeg(MjpegFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !config.path.is_file() {
            return Err(anyhow!("video file {} not found", config.path.display()));
        }
        if starts_with_jpeg(&config)? {
            return Ok(Self {
                backend: FileBackend::Mjpeg(MjpegFileSource::new(config)?),
            });
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            Ok(Self {
                backend: FileBackend::Ffmpeg(FfmpegFileSource::new(config)?),
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "{} is not MJPEG; other containers require the ingest-file-ffmpeg feature",
                config.path.display()
            ))
        }
    }

    /// Connect to the file source.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Mjpeg(source) => source.connect(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.connect(),
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> FileStats {
        match &self.backend {
            FileBackend::Mjpeg(source) => source.stats(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.stats(),
        }
    }

    /// Decoder in use, for logs.
    pub fn decoder_name(&self) -> &'static str {
        match &self.backend {
            FileBackend::Mjpeg(_) => "mjpeg",
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(_) => "ffmpeg",
        }
    }
}

impl VideoSource for FileSource {
    fn fps(&self) -> Option<f64> {
        match &self.backend {
            FileBackend::Mjpeg(source) => source.fps(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.fps(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Mjpeg(source) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        }
    }
}

/// Statistics for a file source.
#[derive(Clone, Debug)]
pub struct FileStats {
    pub frames_decoded: u64,
    pub path: PathBuf,
}

fn starts_with_jpeg(config: &FileConfig) -> Result<bool> {
    let mut file = std::fs::File::open(&config.path)
        .with_context(|| format!("failed to open {}", config.path.display()))?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == JPEG_SOI),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}
