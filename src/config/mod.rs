// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for wildsort

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keys that can carry a destination folder
pub const BINDING_KEYS: [u8; 3] = [1, 2, 3];

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    /// Folder scanning
    #[serde(default)]
    pub scan: ScanConfig,

    /// Thumbnail cache settings
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    /// External inference tools
    #[serde(default)]
    pub tools: ToolConfig,

    /// Background task supervision
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Destination folders for keys 1, 2 and 3
    #[serde(default)]
    pub bindings: Vec<FolderBinding>,

    /// Sort journal settings
    #[serde(default)]
    pub history: HistoryConfig,
}

/// A destination folder bound to a sort key
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct FolderBinding {
    pub key: u8,
    pub destination: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanConfig {
    #[serde(default)]
    pub recursive: bool,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ThumbnailConfig {
    /// Longest edge of the bounding box, in pixels
    #[serde(default = "default_max_edge")]
    pub max_edge: u32,
    /// Entries kept in memory before LRU eviction
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Write thumbnails under `<folder>/.wildsort/thumbs`
    #[serde(default = "default_true")]
    pub persist: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ToolConfig {
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_speciesnet_module")]
    pub speciesnet_module: String,
    #[serde(default = "default_megadetector_module")]
    pub megadetector_module: String,
    /// ISO country code passed to SpeciesNet's geofence
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_results_file")]
    pub results_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TaskConfig {
    /// Seconds between the termination request and a forced kill
    #[serde(default = "default_grace_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_stderr_tail")]
    pub stderr_tail_lines: usize,
    /// Log lines retained by an interactive session
    #[serde(default = "default_log_tail")]
    pub log_tail_lines: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

// Default value functions
fn default_true() -> bool { true }
fn default_max_edge() -> u32 { 256 }
fn default_max_entries() -> usize { 256 }
fn default_jpeg_quality() -> u8 { 80 }
fn default_python() -> String { "python".to_string() }
fn default_speciesnet_module() -> String { "speciesnet.scripts.run_model".to_string() }
fn default_megadetector_module() -> String {
    "megadetector.visualization.visualize_detector_output".to_string()
}
fn default_country() -> String { "NL".to_string() }
fn default_results_file() -> String { "predictions.json".to_string() }
fn default_grace_secs() -> u64 { 5 }
fn default_stderr_tail() -> usize { 20 }
fn default_log_tail() -> usize { 100 }
fn default_history_path() -> PathBuf { PathBuf::from("wildsort_history.jsonl") }

fn default_extensions() -> Vec<String> {
    vec!["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "webp"]
        .into_iter().map(String::from).collect()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            recursive: false,
            extensions: default_extensions(),
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_edge: default_max_edge(),
            max_entries: default_max_entries(),
            jpeg_quality: default_jpeg_quality(),
            persist: true,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            speciesnet_module: default_speciesnet_module(),
            megadetector_module: default_megadetector_module(),
            country: default_country(),
            results_file: default_results_file(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_secs(),
            stderr_tail_lines: default_stderr_tail(),
            log_tail_lines: default_log_tail(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { path: default_history_path() }
    }
}

impl TaskConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| crate::WildsortError::Config(format!("Failed to parse config: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check binding keys and numeric bounds
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = Vec::new();
        for binding in &self.bindings {
            if !BINDING_KEYS.contains(&binding.key) {
                return Err(crate::WildsortError::Config(format!(
                    "Binding key must be 1, 2 or 3, got {}", binding.key
                )));
            }
            if seen.contains(&binding.key) {
                return Err(crate::WildsortError::Config(format!(
                    "Key {} is bound more than once", binding.key
                )));
            }
            seen.push(binding.key);
        }
        if self.thumbnails.max_edge == 0 || self.thumbnails.max_entries == 0 {
            return Err(crate::WildsortError::Config(
                "Thumbnail size and cache capacity must be positive".to_string()
            ));
        }
        if !(1..=100).contains(&self.thumbnails.jpeg_quality) {
            return Err(crate::WildsortError::Config(
                "JPEG quality must be between 1 and 100".to_string()
            ));
        }
        Ok(())
    }

    /// Destination bound to `key`, if any
    pub fn binding(&self, key: u8) -> Option<&Path> {
        self.bindings.iter()
            .find(|b| b.key == key)
            .map(|b| b.destination.as_path())
    }

    /// Bind `key` to `destination`, replacing any previous binding
    pub fn set_binding(&mut self, key: u8, destination: PathBuf) -> crate::Result<()> {
        if !BINDING_KEYS.contains(&key) {
            return Err(crate::WildsortError::Config(format!(
                "Binding key must be 1, 2 or 3, got {}", key
            )));
        }
        self.bindings.retain(|b| b.key != key);
        self.bindings.push(FolderBinding { key, destination });
        self.bindings.sort_by_key(|b| b.key);
        Ok(())
    }
}
