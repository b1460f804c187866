use anyhow::Result;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// Backends receive a tightly packed RGB8 frame (`width * height * 3` bytes)
/// and return detections in pixel coordinates of that frame, with labels
/// already resolved through the label map.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
