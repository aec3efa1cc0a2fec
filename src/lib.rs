// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Wildsort: camera-trap image triage
//!
//! Browse a folder of trap images, sort them into up to three bound
//! destination folders, and run the SpeciesNet / MegaDetector tools in the
//! background while their predictions are shown next to each image.

pub mod config;
pub mod copier;
pub mod error;
pub mod history;
pub mod predictions;
pub mod runner;
pub mod scanner;
pub mod session;
pub mod tasks;
pub mod thumbnail;
pub mod tools;

pub use config::AppConfig;
pub use error::{Result, WildsortError};
pub use error::WildsortError as Error;
