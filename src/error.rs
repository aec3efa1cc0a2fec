// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for wildsort

use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for wildsort operations
pub type Result<T> = std::result::Result<T, WildsortError>;

/// Wildsort error types
#[derive(Error, Debug)]
pub enum WildsortError {
    #[error("Not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("Permission denied: {}", .path.display())]
    PermissionDenied { path: PathBuf },

    #[error("Failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process exited with code {code:?}")]
    ProcessFailure {
        code: Option<i32>,
        stderr_tail: Vec<String>,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Task {0} is still running")]
    TaskBusy(Uuid),

    #[error("No task is running")]
    NoActiveTask,

    #[error("No destination folder bound to key {0}")]
    UnboundKey(u8),

    #[error("No images loaded")]
    NoImages,
}

impl WildsortError {
    /// Classify an I/O failure on `path` into the error taxonomy
    pub fn from_io(path: &Path, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path: path.to_path_buf() },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path: path.to_path_buf() },
            _ => Self::Io { path: path.to_path_buf(), source },
        }
    }

    /// Wrap an I/O failure on `path` without reclassifying it
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}
