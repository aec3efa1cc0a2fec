// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Thumbnail generation with a bounded, single-flight cache

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::ThumbnailConfig;
use crate::copier::write_atomic;
use crate::{Result, WildsortError};

/// Folder, relative to an image's folder, where thumbnails are persisted
pub const THUMB_DIR: &str = ".wildsort/thumbs";

/// Turns a source image into encoded thumbnail bytes
pub trait ThumbnailRenderer: Send + Sync {
    fn render(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Decodes with the `image` crate and encodes a JPEG
#[derive(Debug, Clone)]
pub struct JpegThumbnailer {
    max_edge: u32,
    quality: u8,
}

impl JpegThumbnailer {
    pub fn new(max_edge: u32, quality: u8) -> Self {
        Self { max_edge, quality }
    }

    fn encode(&self, img: &DynamicImage) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buffer, self.quality);
        // JPEG has no alpha channel
        DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
        Ok(buffer.into_inner())
    }

    /// Flat grey image shown when a source cannot be decoded
    pub fn placeholder(&self) -> Vec<u8> {
        let img = RgbImage::from_pixel(self.max_edge, self.max_edge, Rgb([96, 96, 96]));
        self.encode(&DynamicImage::ImageRgb8(img)).unwrap_or_default()
    }
}

impl ThumbnailRenderer for JpegThumbnailer {
    fn render(&self, path: &Path) -> Result<Vec<u8>> {
        let img = image::open(path)?;

        // Large photos: cheap downscale first, then a smoother pass
        let intermediate = self.max_edge * 4;
        let img = if img.width() > intermediate * 2 || img.height() > intermediate * 2 {
            img.resize(intermediate, intermediate, FilterType::Nearest)
        } else {
            img
        };
        let img = img.resize(self.max_edge, self.max_edge, FilterType::Triangle);

        self.encode(&img)
    }
}

/// A thumbnail as handed to the viewer
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub bytes: Arc<Vec<u8>>,
    /// True when decoding failed and `bytes` is the placeholder
    pub placeholder: bool,
}

/// A cached thumbnail for one source version
#[derive(Debug)]
pub struct ThumbnailRecord {
    pub source_path: PathBuf,
    pub source_modified: SystemTime,
    pub thumbnail_bytes: Arc<Vec<u8>>,
    last_used: u64,
}

type Key = (PathBuf, SystemTime);
type Flight = Arc<OnceCell<Thumbnail>>;

#[derive(Default)]
struct CacheState {
    entries: HashMap<PathBuf, ThumbnailRecord>,
    in_flight: HashMap<Key, Flight>,
    failures: HashMap<Key, String>,
    tick: u64,
}

/// Bounded LRU thumbnail cache.
///
/// Entries are keyed by path and source modification time; a newer mtime on
/// disk makes the cached entry stale. Concurrent requests for the same key
/// share a single render.
#[derive(Clone)]
pub struct ThumbnailCache {
    state: Arc<Mutex<CacheState>>,
    renderer: Arc<dyn ThumbnailRenderer>,
    placeholder: Arc<Vec<u8>>,
    max_entries: usize,
    persist: bool,
}

impl ThumbnailCache {
    pub fn new(config: &ThumbnailConfig) -> Self {
        let renderer = JpegThumbnailer::new(config.max_edge, config.jpeg_quality);
        let placeholder = renderer.placeholder();
        Self::with_renderer(Arc::new(renderer), placeholder, config.max_entries, config.persist)
    }

    pub fn with_renderer(
        renderer: Arc<dyn ThumbnailRenderer>,
        placeholder: Vec<u8>,
        max_entries: usize,
        persist: bool,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            renderer,
            placeholder: Arc::new(placeholder),
            max_entries: max_entries.max(1),
            persist,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Return the thumbnail for `path`, rendering it at most once per version
    pub async fn get_or_create(&self, path: &Path) -> Result<Thumbnail> {
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| WildsortError::from_io(path, e))?;
        let key: Key = (path.to_path_buf(), modified);

        let flight = {
            let mut state = self.lock();
            state.tick += 1;
            let tick = state.tick;

            if let Some(record) = state.entries.get_mut(path) {
                if record.source_modified == modified {
                    record.last_used = tick;
                    return Ok(Thumbnail { bytes: record.thumbnail_bytes.clone(), placeholder: false });
                }
            }
            if state.failures.contains_key(&key) {
                return Ok(self.placeholder_thumbnail());
            }
            state.in_flight.entry(key.clone()).or_default().clone()
        };

        let thumbnail = flight
            .get_or_init(|| self.generate(key.clone()))
            .await
            .clone();

        let mut state = self.lock();
        let ours = state.in_flight.get(&key).map(|f| Arc::ptr_eq(f, &flight)).unwrap_or(false);
        if ours {
            state.in_flight.remove(&key);
            if !thumbnail.placeholder {
                forget_older_failures(&mut state, &key);
                state.tick += 1;
                let tick = state.tick;
                state.entries.insert(key.0.clone(), ThumbnailRecord {
                    source_path: key.0.clone(),
                    source_modified: key.1,
                    thumbnail_bytes: thumbnail.bytes.clone(),
                    last_used: tick,
                });
                self.evict(&mut state);
            }
        }
        Ok(thumbnail)
    }

    async fn generate(&self, key: Key) -> Thumbnail {
        let renderer = self.renderer.clone();
        let persist = self.persist;
        let (path, modified) = key.clone();

        let rendered = tokio::task::spawn_blocking(move || load_or_render(renderer.as_ref(), &path, modified, persist))
            .await
            .unwrap_or_else(|e| Err(WildsortError::Config(format!("thumbnail worker failed: {}", e))));

        match rendered {
            Ok(bytes) => Thumbnail { bytes: Arc::new(bytes), placeholder: false },
            Err(e) => {
                warn!("Thumbnail failed for {:?}: {}", key.0, e);
                let mut state = self.lock();
                forget_older_failures(&mut state, &key);
                state.failures.insert(key, e.to_string());
                self.placeholder_thumbnail()
            }
        }
    }

    fn placeholder_thumbnail(&self) -> Thumbnail {
        Thumbnail { bytes: self.placeholder.clone(), placeholder: true }
    }

    fn evict(&self, state: &mut CacheState) {
        while state.entries.len() > self.max_entries {
            let oldest = state.entries.iter()
                .min_by_key(|(_, r)| r.last_used)
                .map(|(p, _)| p.clone());
            match oldest {
                Some(path) => {
                    debug!("Evicting thumbnail for {:?}", path);
                    state.entries.remove(&path);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sources that could not be decoded, with the reason
    pub fn failures(&self) -> Vec<(PathBuf, String)> {
        let mut failures: Vec<_> = self.lock().failures.iter()
            .map(|((p, _), reason)| (p.clone(), reason.clone()))
            .collect();
        failures.sort();
        failures
    }
}

/// Failures are only meaningful for the latest version of a file
fn forget_older_failures(state: &mut CacheState, key: &Key) {
    state.failures.retain(|(path, modified), _| path != &key.0 || modified == &key.1);
}

/// Disk location for the thumbnail of one source version
pub fn persisted_path(source: &Path, modified: SystemTime) -> PathBuf {
    let folder = source.parent().unwrap_or_else(|| Path::new("."));
    let hash = blake3::hash(source.as_os_str().to_string_lossy().as_bytes());
    let stamp = modified.duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    folder.join(THUMB_DIR).join(format!("{}-{}.jpg", &hash.to_hex()[..16], stamp))
}

fn load_or_render(renderer: &dyn ThumbnailRenderer, path: &Path, modified: SystemTime, persist: bool) -> Result<Vec<u8>> {
    if !persist {
        return renderer.render(path);
    }

    let stored = persisted_path(path, modified);
    if let Ok(bytes) = std::fs::read(&stored) {
        debug!("Thumbnail for {:?} read from {:?}", path, stored);
        return Ok(bytes);
    }

    let bytes = renderer.render(path)?;
    if let Err(e) = write_atomic(&stored, &bytes) {
        // Disk tier is best effort; the in-memory result still stands
        warn!("Could not persist thumbnail {:?}: {}", stored, e);
    }
    Ok(bytes)
}
