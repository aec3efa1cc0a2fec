// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Collision-safe, atomic copying of images into destination folders

use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::scanner::ImageEntry;
use crate::{Result, WildsortError};

/// Where a copy landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyResult {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// True when the original file name was taken and a suffix was added
    pub renamed: bool,
    pub bytes: u64,
}

/// Copies images without ever clobbering an existing file.
///
/// Data goes to a hidden temp file inside the destination folder first and is
/// published under its final name in one step, so a crash never leaves a
/// truncated file under that name. Naming decisions for one folder are
/// serialized; copies into different folders proceed in parallel.
#[derive(Clone, Default)]
pub struct FileCopier {
    folder_locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl FileCopier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a scanned image into `destination`
    pub fn copy(&self, entry: &ImageEntry, destination: &Path) -> Result<CopyResult> {
        self.copy_path(&entry.path, destination)
    }

    /// Copy the file at `source` into `destination`
    pub fn copy_path(&self, source: &Path, destination: &Path) -> Result<CopyResult> {
        let file_name = source.file_name()
            .ok_or_else(|| WildsortError::NotFound { path: source.to_path_buf() })?;
        if !source.is_file() {
            return Err(WildsortError::NotFound { path: source.to_path_buf() });
        }

        fs::create_dir_all(destination).map_err(|e| WildsortError::io(destination, e))?;

        let temp_path = destination.join(format!(
            ".{}.{}.part",
            file_name.to_string_lossy(),
            uuid::Uuid::new_v4().simple()
        ));
        let bytes = match write_temp(source, &temp_path) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        let lock = self.folder_lock(destination);
        let published = {
            let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
            publish_unique(&temp_path, destination, Path::new(file_name))
        };
        let _ = fs::remove_file(&temp_path);
        let final_path = published?;

        let renamed = final_path.file_name() != Some(file_name);
        if renamed {
            info!("Copied {:?} to {:?} (name taken, used suffix)", source, final_path);
        } else {
            info!("Copied {:?} to {:?}", source, final_path);
        }

        Ok(CopyResult {
            source: source.to_path_buf(),
            destination: final_path,
            renamed,
            bytes,
        })
    }

    fn folder_lock(&self, folder: &Path) -> Arc<Mutex<()>> {
        let key = folder.canonicalize().unwrap_or_else(|_| folder.to_path_buf());
        let mut locks = self.folder_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(key).or_default().clone()
    }
}

fn write_temp(source: &Path, temp_path: &Path) -> Result<u64> {
    let bytes = fs::copy(source, temp_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound && !source.exists() {
            WildsortError::NotFound { path: source.to_path_buf() }
        } else {
            WildsortError::io(temp_path, e)
        }
    })?;
    File::open(temp_path)
        .and_then(|f| f.sync_all())
        .map_err(|e| WildsortError::io(temp_path, e))?;
    Ok(bytes)
}

/// Candidate file name for the `n`th collision: `stem_n.ext`
pub fn candidate_name(file_name: &Path, n: u32) -> PathBuf {
    if n == 0 {
        return file_name.to_path_buf();
    }
    let stem = file_name.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    match file_name.extension() {
        Some(ext) => PathBuf::from(format!("{}_{}.{}", stem, n, ext.to_string_lossy())),
        None => PathBuf::from(format!("{}_{}", stem, n)),
    }
}

/// Publish `temp_path` under the first free candidate name in `folder`
fn publish_unique(temp_path: &Path, folder: &Path, file_name: &Path) -> Result<PathBuf> {
    for n in 0..u32::MAX {
        let target = folder.join(candidate_name(file_name, n));
        if target.exists() {
            continue;
        }
        match fs::hard_link(temp_path, &target) {
            Ok(()) => return Ok(target),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("{:?} appeared concurrently, trying next name", target);
                continue;
            }
            Err(e) => {
                // File systems without hard links: the folder lock makes
                // check-then-rename safe against our own writers.
                warn!("Hard link into {:?} failed ({}), falling back to rename", folder, e);
                if target.exists() {
                    continue;
                }
                fs::rename(temp_path, &target).map_err(|e| WildsortError::io(&target, e))?;
                return Ok(target);
            }
        }
    }
    Err(WildsortError::Io {
        path: folder.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "no free file name"),
    })
}

/// Write `data` to `path` through a temp file and rename
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| WildsortError::io(parent, e))?;

    let temp_path = parent.join(format!(".{}.part", uuid::Uuid::new_v4().simple()));
    let result = File::create(&temp_path)
        .and_then(|mut f| {
            f.write_all(data)?;
            f.sync_all()
        })
        .and_then(|()| fs::rename(&temp_path, path));

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(WildsortError::io(path, e));
    }
    Ok(())
}
