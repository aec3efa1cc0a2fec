// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Folder scanning into a stable, ordered image list

use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::{Result, WildsortError};

/// Snapshot of one image taken at scan time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageEntry {
    pub path: PathBuf,
    pub sequence_index: usize,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl ImageEntry {
    /// File name for display
    pub fn file_name(&self) -> String {
        self.path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// An entry the scan could not read
#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of a folder scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub entries: Vec<ImageEntry>,
    pub skipped: Vec<SkippedFile>,
}

/// Enumerates image files in a folder
#[derive(Debug, Clone)]
pub struct FolderScanner {
    extensions: Vec<String>,
    recursive: bool,
}

impl FolderScanner {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            extensions: config.extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            recursive: config.recursive,
        }
    }

    /// Whether `path` has one of the recognized image extensions
    pub fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Scan `folder` and return its images in navigation order
    pub fn scan(&self, folder: &Path) -> Result<ScanReport> {
        let meta = std::fs::metadata(folder).map_err(|e| WildsortError::from_io(folder, e))?;
        if !meta.is_dir() {
            return Err(WildsortError::NotFound { path: folder.to_path_buf() });
        }
        // Surface an unreadable root as a structural failure
        std::fs::read_dir(folder).map_err(|e| WildsortError::from_io(folder, e))?;

        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let walker = WalkDir::new(folder)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

        let mut report = ScanReport::default();
        let mut found = Vec::new();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| folder.to_path_buf());
                    warn!("Skipping unreadable entry {:?}: {}", path, e);
                    report.skipped.push(SkippedFile { path, reason: e.to_string() });
                    continue;
                }
            };

            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_str().is_none() {
                warn!("Skipping {:?}: file name is not valid UTF-8", path);
                report.skipped.push(SkippedFile {
                    path: path.to_path_buf(),
                    reason: "file name is not valid UTF-8".to_string(),
                });
                continue;
            }
            if !should_process(path) || !self.is_image(path) {
                continue;
            }

            match entry.metadata() {
                Ok(m) => found.push((path.to_path_buf(), m.len(), m.modified().unwrap_or(SystemTime::UNIX_EPOCH))),
                Err(e) => {
                    warn!("Skipping {:?}: {}", path, e);
                    report.skipped.push(SkippedFile { path: path.to_path_buf(), reason: e.to_string() });
                }
            }
        }

        found.sort_by(|a, b| compare_paths(folder, &a.0, &b.0));

        report.entries = found
            .into_iter()
            .enumerate()
            .map(|(sequence_index, (path, size_bytes, modified))| ImageEntry {
                path,
                sequence_index,
                size_bytes,
                modified,
            })
            .collect();

        info!("Scanned {:?}: {} images, {} skipped", folder, report.entries.len(), report.skipped.len());
        Ok(report)
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}

/// Check if a file should be listed
pub fn should_process(path: &Path) -> bool {
    let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    // Skip hidden files
    if filename.starts_with('.') {
        return false;
    }

    // Skip partial downloads and temp files
    let temp_extensions = [".tmp", ".part", ".crdownload", ".partial", ".download"];
    if temp_extensions.iter().any(|ext| filename.ends_with(ext)) {
        return false;
    }

    // Skip system files
    let skip_names = ["desktop.ini", "thumbs.db", ".ds_store"];
    !skip_names.iter().any(|n| filename.eq_ignore_ascii_case(n))
}

fn compare_paths(root: &Path, a: &Path, b: &Path) -> Ordering {
    let ra = a.strip_prefix(root).unwrap_or(a).to_string_lossy();
    let rb = b.strip_prefix(root).unwrap_or(b).to_string_lossy();
    natural_cmp(&ra, &rb).then_with(|| a.as_os_str().cmp(b.as_os_str()))
}

/// Case-insensitive natural ordering: digit runs compare by value
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();

    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) if ca.is_ascii_digit() && cb.is_ascii_digit() => {
                let na = take_digits(&mut ai);
                let nb = take_digits(&mut bi);
                let ta = na.trim_start_matches('0');
                let tb = nb.trim_start_matches('0');
                let ord = ta.len().cmp(&tb.len())
                    .then_with(|| ta.cmp(tb))
                    .then_with(|| na.len().cmp(&nb.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(ca), Some(cb)) => {
                let ord = ca.to_lowercase().cmp(cb.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                ai.next();
                bi.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    fn names(report: &ScanReport) -> Vec<String> {
        report.entries.iter().map(ImageEntry::file_name).collect()
    }

    #[test]
    fn test_natural_cmp() {
        assert_eq!(natural_cmp("img2.jpg", "img10.jpg"), Ordering::Less);
        assert_eq!(natural_cmp("IMG_0001.JPG", "img_0002.jpg"), Ordering::Less);
        assert_eq!(natural_cmp("b.jpg", "A.jpg"), Ordering::Greater);
        assert_eq!(natural_cmp("a.jpg", "a.jpg"), Ordering::Equal);
        assert_eq!(natural_cmp("a01", "a1"), Ordering::Greater);
    }

    #[test]
    fn test_scan_orders_and_filters() {
        let dir = TempDir::new().unwrap();
        for name in ["c.jpg", "a.jpg", "B.JPG", "notes.txt", ".hidden.jpg", "d.jpg.part", "img10.png", "img2.png"] {
            touch(dir.path(), name);
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        touch(&dir.path().join("nested"), "e.jpg");

        let scanner = FolderScanner::new(&ScanConfig::default());
        let report = scanner.scan(dir.path()).unwrap();

        assert_eq!(names(&report), vec!["a.jpg", "B.JPG", "c.jpg", "img2.png", "img10.png"]);
        let indices: Vec<usize> = report.entries.iter().map(|e| e.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_scan_recursive_includes_nested() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.jpg");
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        touch(&dir.path().join("nested"), "b.jpg");
        std::fs::create_dir(dir.path().join(".wildsort")).unwrap();
        touch(&dir.path().join(".wildsort"), "cached.jpg");

        let config = ScanConfig { recursive: true, ..ScanConfig::default() };
        let report = FolderScanner::new(&config).scan(dir.path()).unwrap();
        assert_eq!(names(&report), vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_scan_is_deterministic() {
        let dir = TempDir::new().unwrap();
        for i in 0..30 {
            touch(dir.path(), &format!("photo_{}.jpg", i));
        }
        let scanner = FolderScanner::new(&ScanConfig::default());
        let first = scanner.scan(dir.path()).unwrap();
        let second = scanner.scan(dir.path()).unwrap();
        assert_eq!(first.entries, second.entries);
    }

    #[test]
    fn test_scan_missing_folder() {
        let dir = TempDir::new().unwrap();
        let scanner = FolderScanner::new(&ScanConfig::default());
        let err = scanner.scan(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, WildsortError::NotFound { .. }));
    }

    #[test]
    fn test_should_process() {
        assert!(should_process(Path::new("/a/fox.jpg")));
        assert!(!should_process(Path::new("/a/.fox.jpg")));
        assert!(!should_process(Path::new("/a/fox.jpg.crdownload")));
        assert!(!should_process(Path::new("/a/Thumbs.db")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_scan_reports_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.jpg");
        let bad = dir.path().join(OsStr::from_bytes(b"bad\xff.jpg"));
        File::create(&bad).unwrap();

        let report = FolderScanner::new(&ScanConfig::default()).scan(dir.path()).unwrap();
        assert_eq!(names(&report), vec!["a.jpg"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].path, bad);
        assert!(report.skipped[0].reason.contains("UTF-8"));
    }
}
