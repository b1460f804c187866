//! MJPEG file decoder.
//!
//! An MJPEG file is a plain concatenation of JPEG images. Marker segments
//! are skipped by their length field since their payloads (comments, EXIF
//! thumbnails) may contain any byte pair. Only entropy-coded data after SOS
//! is scanned, where every `0xFF` is stuffed with `0x00` or starts a restart
//! marker, so the first other marker there is real.

use anyhow::{anyhow, Context, Result};

use super::file::{FileConfig, FileStats};
use crate::frame::Frame;

pub(crate) struct MjpegFileSource {
    config: FileConfig,
    data: Vec<u8>,
    offset: usize,
    frame_count: u64,
    exhausted: bool,
}

impl MjpegFileSource {
    pub(crate) fn new(config: FileConfig) -> Result<Self> {
        let data = std::fs::read(&config.path)
            .with_context(|| format!("failed to read {}", config.path.display()))?;
        Ok(Self {
            config,
            data,
            offset: 0,
            frame_count: 0,
            exhausted: false,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        log::info!(
            "FileSource: opened {} (mjpeg, {} bytes)",
            self.config.path.display(),
            self.data.len()
        );
        Ok(())
    }

    /// MJPEG carries no timing information.
    pub(crate) fn fps(&self) -> Option<f64> {
        None
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.exhausted {
            return Ok(None);
        }
        let Some((start, end)) = next_jpeg_span(&self.data, self.offset) else {
            self.exhausted = true;
            return Ok(None);
        };
        self.offset = end;

        let decoded = match image::load_from_memory_with_format(
            &self.data[start..end],
            image::ImageFormat::Jpeg,
        ) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.exhausted = true;
                return Err(anyhow!(
                    "frame {} is not a decodable JPEG: {}",
                    self.frame_count,
                    e
                ));
            }
        };

        let frame = Frame::new(decoded.to_rgb8(), self.frame_count);
        self.frame_count += 1;
        Ok(Some(frame))
    }

    pub(crate) fn stats(&self) -> FileStats {
        FileStats {
            frames_decoded: self.frame_count,
            path: self.config.path.clone(),
        }
    }
}

/// Byte range `[start, end)` of the next complete JPEG at or after `from`.
fn next_jpeg_span(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let tail = data.get(from..)?;
    let start = from + tail.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let mut pos = start + 2;
    loop {
        if *data.get(pos)? != 0xFF {
            pos = next_marker(data, pos)?;
            continue;
        }
        let marker = *data.get(pos + 1)?;
        match marker {
            0xD9 => return Some((start, pos + 2)),
            // fill byte before a marker
            0xFF => pos += 1,
            0x00 => pos = next_marker(data, pos + 2)?,
            0x01 | 0xD0..=0xD7 => pos += 2,
            _ => {
                let len = u16::from_be_bytes([*data.get(pos + 2)?, *data.get(pos + 3)?]);
                pos += 2 + usize::from(len);
                if marker == 0xDA {
                    pos = next_marker(data, pos)?;
                }
            }
        }
    }
}

/// Offset of the next marker in entropy-coded data, skipping stuffed
/// `FF 00` pairs and restart markers.
fn next_marker(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < data.len() {
        if data[i] != 0xFF {
            i += 1;
            continue;
        }
        match data[i + 1] {
            0x00 | 0xD0..=0xD7 => i += 2,
            0xFF => i += 1,
            _ => return Some(i),
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::path::Path;

    pub(crate) fn write_mjpeg(path: &Path, frames: u32, width: u32, height: u32) {
        let mut out = Vec::new();
        for i in 0..frames {
            let shade = (i * 40 % 256) as u8;
            let img = RgbImage::from_pixel(width, height, Rgb([shade, 64, 200]));
            let frame = Frame::new(img, i as u64);
            out.extend(frame.encode_jpeg(90).unwrap());
        }
        std::fs::write(path, out).unwrap();
    }

    #[test]
    fn finds_consecutive_jpeg_spans() {
        let data = [0x00, 0xFF, 0xD8, 0x01, 0xFF, 0xD9, 0xFF, 0xD8, 0xFF, 0xD9, 0x07];
        assert_eq!(next_jpeg_span(&data, 0), Some((1, 6)));
        assert_eq!(next_jpeg_span(&data, 6), Some((6, 10)));
        assert_eq!(next_jpeg_span(&data, 10), None);
        assert_eq!(next_jpeg_span(&data, 50), None);
    }

    fn jpeg_with_eoi_in_comment() -> Vec<u8> {
        let img = RgbImage::from_pixel(16, 12, Rgb([10, 120, 30]));
        let jpeg = Frame::new(img, 0).encode_jpeg(90).unwrap();
        let mut out = jpeg[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xFE, 0x00, 0x04, 0xFF, 0xD9]);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    #[test]
    fn skips_marker_segment_payloads() {
        // COM segment whose payload is FF D9, then SOS with stuffed and restart bytes
        let data = [
            0xFF, 0xD8, 0xFF, 0xFE, 0x00, 0x04, 0xFF, 0xD9, 0xFF, 0xDA, 0x00, 0x02, 0x11, 0xFF,
            0x00, 0xFF, 0xD0, 0x22, 0xFF, 0xD9, 0x33,
        ];
        assert_eq!(next_jpeg_span(&data, 0), Some((0, 20)));
        assert_eq!(next_jpeg_span(&data[..19], 0), None);
    }

    #[test]
    fn decodes_frames_with_eoi_bytes_in_comment() {
        let jpeg = jpeg_with_eoi_in_comment();
        assert!(image::load_from_memory(&jpeg).is_ok());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commented.mjpeg");
        std::fs::write(&path, [jpeg.clone(), jpeg].concat()).unwrap();

        let mut source = MjpegFileSource::new(FileConfig { path }).unwrap();
        for expected in 0..2 {
            let frame = source.next_frame().unwrap().expect("frame");
            assert_eq!(frame.index, expected);
            assert_eq!((frame.width(), frame.height()), (16, 12));
        }
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn decodes_every_frame_then_reports_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mjpeg");
        write_mjpeg(&path, 4, 16, 12);

        let mut source = MjpegFileSource::new(FileConfig { path }).unwrap();
        source.connect().unwrap();
        for expected in 0..4 {
            let frame = source.next_frame().unwrap().expect("frame");
            assert_eq!(frame.index, expected);
            assert_eq!((frame.width(), frame.height()), (16, 12));
        }
        assert!(source.next_frame().unwrap().is_none());
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(source.fps(), None);
    }

    #[test]
    fn truncated_frame_ends_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mjpeg");
        std::fs::write(&path, [0xFF, 0xD8, 0x00, 0x01, 0xFF, 0xD9]).unwrap();

        let mut source = MjpegFileSource::new(FileConfig { path }).unwrap();
        assert!(source.next_frame().is_err());
        assert!(source.next_frame().unwrap().is_none());
    }
}
