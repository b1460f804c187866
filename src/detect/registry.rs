use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::config::ModelSettings;
use crate::detect::result::Detection;
use crate::labels::LabelMap;

use super::backend::DetectorBackend;

pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Thread-safe registry of detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
/// Concurrent video sessions sharing a backend serialize on that lock per frame.
pub struct BackendRegistry {
    backends: HashMap<String, SharedBackend>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<SharedBackend> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Default backend, or an error when nothing is registered.
    pub fn require_default(&self) -> Result<SharedBackend> {
        self.default_backend()
            .ok_or_else(|| anyhow!("no detector backend registered"))
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Warm up every registered backend once.
    pub fn warm_up_all(&self) -> Result<()> {
        for (name, backend) in &self.backends {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow!("backend '{}' lock poisoned", name))?;
            guard.warm_up()?;
        }
        Ok(())
    }

    /// Run detection on the default backend.
    pub fn detect(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let backend = self.require_default()?;
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?;
        guard.detect(pixels, width, height)
    }
}

impl BackendRegistry {
    /// Registry holding the one backend named in the model settings.
    ///
    /// Missing weights for the `tract` backend are an error here so the
    /// service fails at startup rather than on the first frame.
    pub fn from_model_settings(model: &ModelSettings, labels: &LabelMap) -> Result<Self> {
        let mut registry = Self::new();
        match model.backend.as_str() {
            "scripted" => registry.register(match &model.script_path {
                Some(path) => super::ScriptedBackend::from_json_file(path)?,
                None => super::ScriptedBackend::empty(),
            }),
            "tract" => {
                if !model.path.is_file() {
                    return Err(anyhow!(
                        "model weights not found at {}",
                        model.path.display()
                    ));
                }
                registry.register(tract_backend(model, labels)?);
            }
            other => return Err(anyhow!("unknown detector backend '{}'", other)),
        }
        Ok(registry)
    }
}

#[cfg(feature = "backend-tract")]
fn tract_backend(model: &ModelSettings, labels: &LabelMap) -> Result<super::TractBackend> {
    use super::yolo::DecodeSettings;

    let backend = super::TractBackend::new(
        &model.path,
        model.input_width,
        model.input_height,
        labels.clone(),
    )?;
    Ok(backend.with_settings(DecodeSettings {
        confidence_floor: model.candidate_floor,
        iou_threshold: model.iou_threshold,
        ..DecodeSettings::default()
    }))
}

#[cfg(not(feature = "backend-tract"))]
fn tract_backend(_model: &ModelSettings, _labels: &LabelMap) -> Result<super::ScriptedBackend> {
    Err(anyhow!(
        "the tract backend requires building with the backend-tract feature"
    ))
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
