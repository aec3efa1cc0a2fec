// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Results-file ingestion and per-image prediction lookup

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::{Result, WildsortError};

/// One detection box in the producing tool's units
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionBox {
    pub category: String,
    pub confidence: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Everything the tools reported for a single image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub image_path: PathBuf,
    pub top_prediction: Option<String>,
    pub top_score: Option<f64>,
    pub boxes: Vec<DetectionBox>,
}

impl PredictionRecord {
    /// Human-readable label from a `guid;class;order;family;genus;species;common name` string
    pub fn common_name(&self) -> Option<&str> {
        let prediction = self.top_prediction.as_deref()?;
        prediction
            .rsplit(';')
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(alias = "predictions", alias = "images")]
    media: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(alias = "file")]
    filepath: String,
    #[serde(default)]
    prediction: Option<String>,
    #[serde(default)]
    prediction_score: Option<f64>,
    #[serde(default)]
    detections: Option<Vec<RawDetection>>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    category: String,
    conf: f64,
    bbox: Vec<f64>,
}

/// An immutable, fully-loaded results file
#[derive(Debug, Clone, Default)]
pub struct PredictionSet {
    source: Option<PathBuf>,
    records: HashMap<PathBuf, PredictionRecord>,
    warnings: Vec<String>,
}

impl PredictionSet {
    /// Load and index a results file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| WildsortError::from_io(path, e))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut set = Self::from_slice(&data, base).map_err(|message| WildsortError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        set.source = Some(path.to_path_buf());

        info!(
            "Loaded {} predictions from {:?} ({} warnings)",
            set.records.len(), path, set.warnings.len()
        );
        Ok(set)
    }

    /// Parse a results document; relative file paths resolve against `base`.
    ///
    /// Only a document that is not an object with a media array fails; bad
    /// entries are skipped and reported through [`PredictionSet::warnings`].
    pub fn from_slice(data: &[u8], base: &Path) -> std::result::Result<Self, String> {
        let document: RawDocument = serde_json::from_slice(data).map_err(|e| e.to_string())?;

        let mut set = Self::default();
        for (index, value) in document.media.into_iter().enumerate() {
            match parse_record(value, base) {
                Ok(record) => {
                    if set.records.contains_key(&record.image_path) {
                        debug!("Duplicate entry for {:?}, keeping the later one", record.image_path);
                    }
                    set.records.insert(record.image_path.clone(), record);
                }
                Err(reason) => {
                    let warning = format!("entry {}: {}", index, reason);
                    warn!("Skipping malformed prediction {}", warning);
                    set.warnings.push(warning);
                }
            }
        }
        Ok(set)
    }

    pub fn lookup(&self, image: &Path) -> Option<&PredictionRecord> {
        self.records.get(image)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Results file this set was read from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn records(&self) -> impl Iterator<Item = &PredictionRecord> {
        self.records.values()
    }
}

fn parse_record(value: serde_json::Value, base: &Path) -> std::result::Result<PredictionRecord, String> {
    let raw: RawRecord = serde_json::from_value(value).map_err(|e| e.to_string())?;

    if raw.filepath.trim().is_empty() {
        return Err("empty filepath".to_string());
    }
    if let Some(score) = raw.prediction_score {
        check_unit("prediction_score", score)?;
    }

    let mut boxes = Vec::new();
    for detection in raw.detections.unwrap_or_default() {
        check_unit("conf", detection.conf)?;
        let [x, y, width, height] = <[f64; 4]>::try_from(detection.bbox.as_slice())
            .map_err(|_| format!("bbox must have 4 values, got {}", detection.bbox.len()))?;
        boxes.push(DetectionBox {
            category: detection.category,
            confidence: detection.conf,
            x,
            y,
            width,
            height,
        });
    }

    let path = PathBuf::from(&raw.filepath);
    let image_path = if path.is_absolute() { path } else { base.join(path) };

    Ok(PredictionRecord {
        image_path,
        top_prediction: raw.prediction,
        top_score: raw.prediction_score,
        boxes,
    })
}

fn check_unit(field: &str, value: f64) -> std::result::Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{} {} outside [0, 1]", field, value))
    }
}

/// Shared, wholesale-reloadable view of the current folder's predictions
#[derive(Debug, Clone, Default)]
pub struct PredictionStore {
    current: Arc<RwLock<Arc<PredictionSet>>>,
}

impl PredictionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current set with the contents of `path`.
    ///
    /// On failure the previous set stays in place.
    pub fn reload(&self, path: &Path) -> Result<Arc<PredictionSet>> {
        let set = Arc::new(PredictionSet::load(path)?);
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = set.clone();
        Ok(set)
    }

    /// Drop all predictions (for example after switching folders)
    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(PredictionSet::default());
    }

    pub fn snapshot(&self) -> Arc<PredictionSet> {
        self.current.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn lookup(&self, image: &Path) -> Option<PredictionRecord> {
        self.snapshot().lookup(image).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str) -> serde_json::Value {
        serde_json::json!({
            "filepath": name,
            "prediction": "f2d233e3;mammalia;carnivora;canidae;vulpes;vulpes;red fox",
            "prediction_score": 0.91,
            "detections": [
                { "category": "1", "conf": 0.88, "bbox": [0.1, 0.2, 0.3, 0.4], "label": "animal" }
            ],
            "model_version": "4.0.1a"
        })
    }

    #[test]
    fn test_one_malformed_among_ten() {
        let mut media: Vec<serde_json::Value> = (0..9).map(|i| entry(&format!("img_{}.jpg", i))).collect();
        media.insert(4, serde_json::json!({ "filepath": "bad.jpg", "prediction_score": "high" }));
        let doc = serde_json::json!({ "media": media, "info": { "tool": "speciesnet" } });

        let set = PredictionSet::from_slice(doc.to_string().as_bytes(), Path::new("/cams")).unwrap();
        assert_eq!(set.len(), 9);
        assert_eq!(set.warnings().len(), 1);
        assert!(set.warnings()[0].starts_with("entry 4"));
    }

    #[test]
    fn test_lookup_resolves_relative_paths() {
        let doc = serde_json::json!({ "media": [entry("a.jpg"), entry("/elsewhere/b.jpg")] });
        let set = PredictionSet::from_slice(doc.to_string().as_bytes(), Path::new("/cams")).unwrap();

        let record = set.lookup(Path::new("/cams/a.jpg")).unwrap();
        assert_eq!(record.top_score, Some(0.91));
        assert_eq!(record.boxes.len(), 1);
        assert_eq!(record.boxes[0].width, 0.3);
        assert_eq!(record.common_name(), Some("red fox"));

        assert!(set.lookup(Path::new("/elsewhere/b.jpg")).is_some());
        assert!(set.lookup(Path::new("/cams/c.jpg")).is_none());
    }

    #[test]
    fn test_alternate_top_level_key() {
        let doc = serde_json::json!({ "predictions": [entry("a.jpg")] });
        let set = PredictionSet::from_slice(doc.to_string().as_bytes(), Path::new("/cams")).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_rejects_out_of_range_and_short_bbox() {
        let doc = serde_json::json!({ "media": [
            { "filepath": "a.jpg", "prediction_score": 1.5 },
            { "filepath": "b.jpg", "detections": [{ "category": "1", "conf": 0.5, "bbox": [0.1, 0.2] }] },
            { "filepath": "c.jpg" }
        ]});
        let set = PredictionSet::from_slice(doc.to_string().as_bytes(), Path::new("/cams")).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.warnings().len(), 2);
        let record = set.lookup(Path::new("/cams/c.jpg")).unwrap();
        assert!(record.top_prediction.is_none());
        assert!(record.boxes.is_empty());
    }

    #[test]
    fn test_unparseable_structure_is_hard_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("predictions.json");
        std::fs::write(&path, r#"{ "media": 3 }"#).unwrap();
        assert!(matches!(PredictionSet::load(&path), Err(WildsortError::Parse { .. })));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(PredictionSet::load(&path), Err(WildsortError::Parse { .. })));
    }

    #[test]
    fn test_store_reload_keeps_previous_on_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("predictions.json");
        let doc = serde_json::json!({ "media": [entry("a.jpg")] });
        std::fs::write(&path, doc.to_string()).unwrap();

        let store = PredictionStore::new();
        assert!(store.lookup(&dir.path().join("a.jpg")).is_none());
        store.reload(&path).unwrap();
        assert!(store.lookup(&dir.path().join("a.jpg")).is_some());

        std::fs::write(&path, "{").unwrap();
        assert!(store.reload(&path).is_err());
        assert!(store.lookup(&dir.path().join("a.jpg")).is_some());

        store.clear();
        assert!(store.snapshot().is_empty());
    }
}
