// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Command presets for the inference tools and handling of their output files

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::ToolConfig;
use crate::copier;
use crate::runner::CommandSpec;
use crate::scanner::ImageEntry;
use crate::{Result, WildsortError};

/// Marker MegaDetector puts in front of the original file name
const OUTPUT_MARKER: char = '~';

/// Suffix appended to renamed MegaDetector outputs
pub const PRED_SUFFIX: &str = "_pred";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    /// Species classification, writes the results file
    SpeciesNet,
    /// Draws detection boxes from an existing results file
    MegaDetector,
}

impl Tool {
    pub fn label(self) -> &'static str {
        match self {
            Self::SpeciesNet => "SpeciesNet",
            Self::MegaDetector => "MegaDetector",
        }
    }

    /// Build the invocation for `folder`, whose scanned images are `entries`
    pub fn command(self, config: &ToolConfig, folder: &Path, entries: &[ImageEntry]) -> Result<CommandSpec> {
        match self {
            Self::SpeciesNet => speciesnet_command(config, folder, entries),
            Self::MegaDetector => megadetector_command(config, folder),
        }
    }
}

impl std::str::FromStr for Tool {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "speciesnet" | "species" => Ok(Self::SpeciesNet),
            "megadetector" | "detector" | "md" => Ok(Self::MegaDetector),
            other => Err(format!("unknown tool '{}'", other)),
        }
    }
}

/// Where the tools read and write predictions for `folder`
pub fn results_path(config: &ToolConfig, folder: &Path) -> PathBuf {
    folder.join(&config.results_file)
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

fn speciesnet_command(config: &ToolConfig, folder: &Path, entries: &[ImageEntry]) -> Result<CommandSpec> {
    let files: Vec<String> = entries.iter()
        .filter(|e| is_jpeg(&e.path) && !is_prediction_artifact(&e.path))
        .map(|e| e.path.to_string_lossy().into_owned())
        .collect();
    if files.is_empty() {
        return Err(WildsortError::NoImages);
    }

    let results = results_path(config, folder);
    let args = vec![
        "-m".to_string(),
        config.speciesnet_module.clone(),
        "--filepaths".to_string(),
        files.join(","),
        "--predictions_json".to_string(),
        results.to_string_lossy().into_owned(),
        "--country".to_string(),
        config.country.clone(),
    ];

    let mut spec = CommandSpec::new(config.python.clone(), args);
    spec.label = Tool::SpeciesNet.label().to_string();
    spec.working_dir = Some(folder.to_path_buf());
    spec.results_path = Some(results);
    Ok(spec)
}

fn megadetector_command(config: &ToolConfig, folder: &Path) -> Result<CommandSpec> {
    let results = results_path(config, folder);
    if !results.is_file() {
        return Err(WildsortError::NotFound { path: results });
    }

    let args = vec![
        "-m".to_string(),
        config.megadetector_module.clone(),
        results.to_string_lossy().into_owned(),
        folder.to_string_lossy().into_owned(),
    ];

    let mut spec = CommandSpec::new(config.python.clone(), args);
    spec.label = Tool::MegaDetector.label().to_string();
    spec.working_dir = Some(folder.to_path_buf());
    Ok(spec)
}

/// Names this crate gave to MegaDetector outputs, per folder
const OUTPUT_MANIFEST: &str = ".wildsort/pred_outputs.json";

/// Whether `path` is a renamed MegaDetector output (`_pred` or `_pred_<n>`)
pub fn is_prediction_artifact(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.ends_with(PRED_SUFFIX) || pred_counter(s).is_some())
        .unwrap_or(false)
}

fn pred_counter(stem: &str) -> Option<u32> {
    let (head, n) = stem.rsplit_once('_')?;
    if !head.ends_with(PRED_SUFFIX) || n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    n.parse().ok()
}

/// Target name for a MegaDetector output file, if it is one
fn renamed_output(file_name: &str) -> Option<String> {
    numbered_output(file_name, 0)
}

/// `<stem>_pred<ext>` for `n == 0`, `<stem>_pred_<n><ext>` otherwise
fn numbered_output(file_name: &str, n: u32) -> Option<String> {
    if !file_name.contains(OUTPUT_MARKER) {
        return None;
    }
    let raw = file_name.rsplit(OUTPUT_MARKER).next()?.trim();
    if raw.is_empty() {
        return None;
    }
    let raw = Path::new(raw);
    let stem = raw.file_stem()?.to_string_lossy();
    let suffix = match n {
        0 => PRED_SUFFIX.to_string(),
        n => format!("{}_{}", PRED_SUFFIX, n),
    };
    Some(match raw.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    })
}

fn load_manifest(path: &Path) -> BTreeSet<String> {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
            warn!("Ignoring unreadable output manifest {:?}: {}", path, e);
            BTreeSet::new()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
        Err(e) => {
            warn!("Failed to read output manifest {:?}: {}", path, e);
            BTreeSet::new()
        }
    }
}

/// Rename `~`-marked MegaDetector outputs in `folder` to `<stem>_pred<ext>`.
///
/// A target is only replaced when an earlier rename produced it, which keeps
/// regeneration idempotent. Any other existing file, or a name already taken in
/// this pass, moves the output to `<stem>_pred_<n><ext>`. Returns the new paths;
/// failures on single files are logged and skipped.
pub fn rename_annotated_outputs(folder: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(folder).map_err(|e| WildsortError::from_io(folder, e))?;

    let mut sources = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable entry in {:?}: {}", folder, e);
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str().filter(|n| renamed_output(n).is_some()) {
            sources.push(name.to_string());
        }
    }
    sources.sort();

    let manifest_path = folder.join(OUTPUT_MANIFEST);
    let mut produced = load_manifest(&manifest_path);
    let mut claimed = BTreeSet::new();
    let mut renamed = Vec::new();

    for file_name in sources {
        let target_name = (0..)
            .filter_map(|n| numbered_output(&file_name, n))
            .find(|name| {
                !claimed.contains(name) && (produced.contains(name) || !folder.join(name).exists())
            });
        let Some(target_name) = target_name else { continue };

        let source = folder.join(&file_name);
        let target = folder.join(&target_name);
        if target.exists() {
            debug!("Replacing earlier output {:?}", target);
        }
        match fs::rename(&source, &target) {
            Ok(()) => {
                info!("Renamed {} -> {}", file_name, target_name);
                claimed.insert(target_name.clone());
                produced.insert(target_name);
                renamed.push(target);
            }
            Err(e) => warn!("Failed to rename {:?} -> {:?}: {}", source, target, e),
        }
    }

    if !claimed.is_empty() {
        let data = serde_json::to_vec_pretty(&produced)?;
        copier::write_atomic(&manifest_path, &data)?;
    }

    renamed.sort();
    Ok(renamed)
}
