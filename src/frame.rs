//! Decoded video frames.
//!
//! A `Frame` owns one RGB8 image decoded from a video source together with
//! its zero-based position in the stream. The annotator draws into the image
//! in place before it is JPEG-encoded for streaming.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, RgbImage};

/// Default JPEG quality for streamed frames (OpenCV's `imencode` default).
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

pub struct Frame {
    pub image: RgbImage,
    /// Zero-based index of the frame in its source.
    pub index: u64,
}

impl Frame {
    pub fn new(image: RgbImage, index: u64) -> Self {
        Self { image, index }
    }

    /// Build a frame from tightly packed RGB8 bytes.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        let len = pixels.len();
        let image: RgbImage = ImageBuffer::from_raw(width, height, pixels).ok_or_else(|| {
            anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                len
            )
        })?;
        Ok(Self { image, index })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Packed RGB8 bytes, the layout detector backends expect.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Seconds into the stream at `fps`.
    pub fn timestamp_s(&self, fps: f64) -> f64 {
        if fps > 0.0 {
            self.index as f64 / fps
        } else {
            0.0
        }
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode_image(&self.image)
            .context("encode frame as JPEG")?;
        Ok(out)
    }
}
