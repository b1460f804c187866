//! Class id to display label map.
//!
//! The detector emits integer class ids; everything downstream (alert sets,
//! box colors, stats keys, reports) works on the display label. The map is
//! loaded once at startup and shared read-only.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

const DEFAULT_LABELS: &[&str] = &[
    "amortiguador bueno",
    "amortiguador suelto",
    "chicote",
    "chicote suelto",
    "cojinete",
    "cojinete corrido",
    "conector",
    "conector suelto",
    "panel solar",
    "reductor",
    "torque alineado",
    "torque desalineado",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelMap {
    labels: BTreeMap<u32, String>,
}

impl LabelMap {
    pub fn new(labels: BTreeMap<u32, String>) -> Self {
        Self { labels }
    }

    /// Parses the `{"0": "label", "1": "label"}` layout written by `dataset_labels`.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let parsed: BTreeMap<String, String> =
            serde_json::from_str(raw).context("label map must be a JSON object of id -> label")?;
        let mut labels = BTreeMap::new();
        for (key, label) in parsed {
            let id: u32 = key
                .trim()
                .parse()
                .map_err(|_| anyhow!("label map key '{}' is not a class id", key))?;
            let label = label.trim();
            if label.is_empty() {
                return Err(anyhow!("label map entry {} is empty", id));
            }
            labels.insert(id, label.to_string());
        }
        if labels.is_empty() {
            return Err(anyhow!("label map is empty"));
        }
        Ok(Self { labels })
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read label map {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("invalid label map {}", path.display()))
    }

    /// Builds a map from a `<dir>/<class>/...` dataset layout: one class per
    /// subdirectory, ids assigned in sorted name order.
    pub fn from_class_dirs(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read dataset directory {}", dir.display()))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        if names.is_empty() {
            return Err(anyhow!("no class directories under {}", dir.display()));
        }
        names.sort();
        let labels = names
            .into_iter()
            .enumerate()
            .map(|(id, name)| (id as u32, name))
            .collect();
        Ok(Self { labels })
    }

    pub fn to_json_string(&self) -> Result<String> {
        let keyed: BTreeMap<String, &str> = self
            .labels
            .iter()
            .map(|(id, label)| (id.to_string(), label.as_str()))
            .collect();
        Ok(serde_json::to_string_pretty(&keyed)?)
    }

    /// Display label for a class id. Unknown ids get a stable placeholder.
    pub fn label(&self, class_id: u32) -> String {
        self.labels
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of class scores a detector head must produce for this map.
    pub fn num_classes(&self) -> usize {
        self.labels
            .keys()
            .next_back()
            .map(|max| *max as usize + 1)
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.labels.iter().map(|(id, label)| (*id, label.as_str()))
    }
}

impl Default for LabelMap {
    fn default() -> Self {
        let labels = DEFAULT_LABELS
            .iter()
            .enumerate()
            .map(|(id, label)| (id as u32, (*label).to_string()))
            .collect();
        Self { labels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_covers_twelve_classes() {
        let map = LabelMap::default();
        assert_eq!(map.len(), 12);
        assert_eq!(map.num_classes(), 12);
        assert_eq!(map.label(7), "conector suelto");
        assert_eq!(map.label(11), "torque desalineado");
        assert_eq!(map.label(42), "class_42");
    }

    #[test]
    fn parses_dataset_label_json() {
        let map = LabelMap::from_json_str(r#"{"0": "bueno", "2": " roto "}"#).unwrap();
        assert_eq!(map.label(0), "bueno");
        assert_eq!(map.label(2), "roto");
        assert_eq!(map.num_classes(), 3);

        let round = LabelMap::from_json_str(&map.to_json_string().unwrap()).unwrap();
        assert_eq!(round, map);
    }

    #[test]
    fn rejects_bad_label_json() {
        assert!(LabelMap::from_json_str("{}").is_err());
        assert!(LabelMap::from_json_str(r#"{"zero": "x"}"#).is_err());
        assert!(LabelMap::from_json_str(r#"{"0": "  "}"#).is_err());
        assert!(LabelMap::from_json_str("[1, 2]").is_err());
    }

    #[test]
    fn assigns_ids_from_sorted_class_directories() {
        let dir = tempfile::tempdir().unwrap();
        for class in ["torque desalineado", "conector", "panel solar", ".cache"] {
            std::fs::create_dir(dir.path().join(class)).unwrap();
        }
        std::fs::write(dir.path().join("README.txt"), "not a class").unwrap();

        let map = LabelMap::from_class_dirs(dir.path()).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.label(0), "conector");
        assert_eq!(map.label(1), "panel solar");
        assert_eq!(map.label(2), "torque desalineado");

        let empty = tempfile::tempdir().unwrap();
        assert!(LabelMap::from_class_dirs(empty.path()).is_err());
    }
}
