use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Backend that replays a fixed script of per-frame detections.
///
/// Frame `n` receives `script[n % script.len()]`. Frames listed in
/// `fail_on` return an error instead, which exercises the detector error
/// policy of the video loop.
pub struct ScriptedBackend {
    script: Vec<Vec<Detection>>,
    fail_on: Vec<u64>,
    calls: u64,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Vec<Detection>>) -> Self {
        Self {
            script,
            fail_on: Vec::new(),
            calls: 0,
        }
    }

    /// Backend that never detects anything.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Load a script from a JSON array of per-frame detection arrays.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detection script {}", path.display()))?;
        let script: Vec<Vec<Detection>> = serde_json::from_str(&data)
            .with_context(|| format!("invalid detection script {}", path.display()))?;
        log::info!(
            "scripted detector: {} frames from {}",
            script.len(),
            path.display()
        );
        Ok(Self::new(script))
    }

    /// Make the given zero-based call indices fail.
    pub fn failing_on(mut self, calls: impl IntoIterator<Item = u64>) -> Self {
        self.fail_on = calls.into_iter().collect();
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::empty()
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let call = self.calls;
        self.calls += 1;

        let expected = (width as usize) * (height as usize) * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected,
                pixels.len()
            ));
        }
        if self.fail_on.contains(&call) {
            return Err(anyhow!("scripted detector failure on call {}", call));
        }
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let idx = (call % self.script.len() as u64) as usize;
        Ok(self.script[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn replays_script_and_injects_failures() {
        let det = Detection::new(1, "x", 0.8, BoundingBox::new(0.0, 0.0, 2.0, 2.0));
        let mut backend =
            ScriptedBackend::new(vec![vec![det.clone()], Vec::new()]).failing_on([2]);
        let pixels = vec![0u8; 4 * 4 * 3];

        assert_eq!(backend.detect(&pixels, 4, 4).unwrap(), vec![det.clone()]);
        assert!(backend.detect(&pixels, 4, 4).unwrap().is_empty());
        assert!(backend.detect(&pixels, 4, 4).is_err());
        assert!(backend.detect(&pixels, 4, 4).unwrap().is_empty());
        assert_eq!(backend.calls(), 4);

        assert!(backend.detect(&pixels[..10], 4, 4).is_err());
    }
}
