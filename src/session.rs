// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Interactive browsing state: the open folder, its images and the cursor
//!
//! A [`Session`] is the single writer of the image list. It ties together
//! scanning, sorting into bound folders, prediction lookup and the reaction to
//! finished inference tasks.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::copier::{CopyResult, FileCopier};
use crate::history::{JournalEntry, SortJournal};
use crate::predictions::{PredictionRecord, PredictionStore};
use crate::runner::{CommandSpec, LogStream};
use crate::scanner::{FolderScanner, ImageEntry, ScanReport};
use crate::tasks::{TaskEvent, TaskState};
use crate::thumbnail::{Thumbnail, ThumbnailCache};
use crate::tools::{self, Tool};
use crate::{Result, WildsortError};

/// Last N log lines shown to the operator
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self { lines: VecDeque::with_capacity(capacity.min(1024)), capacity }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// What a finished task changed in the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    Nothing,
    /// The results file was re-read
    PredictionsReloaded { records: usize },
    /// Annotated outputs were renamed and the folder rescanned
    OutputsRenamed { renamed: usize, images: usize },
}

pub struct Session {
    config: AppConfig,
    scanner: FolderScanner,
    copier: FileCopier,
    journal: SortJournal,
    predictions: PredictionStore,
    thumbnails: ThumbnailCache,
    folder: Option<PathBuf>,
    images: Vec<ImageEntry>,
    cursor: usize,
    log: LogTail,
    launched: HashMap<Uuid, Tool>,
}

impl Session {
    pub fn new(config: AppConfig) -> Self {
        Self {
            scanner: FolderScanner::new(&config.scan),
            copier: FileCopier::new(),
            journal: SortJournal::new(config.history.path.clone()),
            predictions: PredictionStore::new(),
            thumbnails: ThumbnailCache::new(&config.thumbnails),
            log: LogTail::new(config.tasks.log_tail_lines),
            folder: None,
            images: Vec::new(),
            cursor: 0,
            launched: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Open `folder`: scan it and load its results file if one exists
    pub fn open_folder(&mut self, folder: &Path) -> Result<ScanReport> {
        let report = self.scanner.scan(folder)?;
        self.folder = Some(folder.to_path_buf());
        self.images = report.entries.clone();
        self.cursor = 0;
        self.predictions.clear();
        self.load_predictions();
        self.log.push(format!("Opened {} ({} images)", folder.display(), self.images.len()));
        Ok(report)
    }

    /// Rescan the open folder, keeping the cursor on the same image if it survived
    pub fn rescan(&mut self) -> Result<ScanReport> {
        let folder = self.folder.clone().ok_or(WildsortError::NoImages)?;
        let current = self.current().map(|e| e.path.clone());

        let report = self.scanner.scan(&folder)?;
        self.images = report.entries.clone();
        self.cursor = current
            .and_then(|p| self.images.iter().position(|e| e.path == p))
            .unwrap_or(0);
        debug!("Rescanned {:?}, cursor at {}", folder, self.cursor);
        Ok(report)
    }

    fn load_predictions(&mut self) -> Option<usize> {
        let folder = self.folder.as_deref()?;
        let path = tools::results_path(&self.config.tools, folder);
        if !path.is_file() {
            return None;
        }
        match self.predictions.reload(&path) {
            Ok(set) => {
                for warning in set.warnings() {
                    self.log.push(format!("predictions: {}", warning));
                }
                Some(set.len())
            }
            Err(e) => {
                warn!("Could not load predictions: {}", e);
                self.log.push(format!("Could not load predictions: {}", e));
                None
            }
        }
    }

    pub fn folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }

    pub fn images(&self) -> &[ImageEntry] {
        &self.images
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> Option<&ImageEntry> {
        self.images.get(self.cursor)
    }

    /// Advance one image, wrapping from the last to the first
    pub fn next(&mut self) -> Option<&ImageEntry> {
        if !self.images.is_empty() {
            self.cursor = (self.cursor + 1) % self.images.len();
        }
        self.current()
    }

    /// Go back one image, wrapping from the first to the last
    pub fn previous(&mut self) -> Option<&ImageEntry> {
        if !self.images.is_empty() {
            self.cursor = (self.cursor + self.images.len() - 1) % self.images.len();
        }
        self.current()
    }

    pub fn select(&mut self, index: usize) -> Result<&ImageEntry> {
        if index >= self.images.len() {
            return Err(WildsortError::NoImages);
        }
        self.cursor = index;
        Ok(&self.images[index])
    }

    pub fn binding(&self, key: u8) -> Option<&Path> {
        self.config.binding(key)
    }

    pub fn bind(&mut self, key: u8, destination: PathBuf) -> Result<()> {
        self.config.set_binding(key, destination)?;
        self.log.push(format!("Key {} bound to {}", key, self.config.binding(key).map(|p| p.display().to_string()).unwrap_or_default()));
        Ok(())
    }

    /// Copy the current image into the folder bound to `key` and journal it
    pub async fn sort_current(&mut self, key: u8) -> Result<CopyResult> {
        let destination = self.binding(key)
            .ok_or(WildsortError::UnboundKey(key))?
            .to_path_buf();
        let entry = self.current().cloned().ok_or(WildsortError::NoImages)?;

        let copier = self.copier.clone();
        let result = tokio::task::spawn_blocking(move || copier.copy(&entry, &destination))
            .await
            .map_err(|e| WildsortError::Config(format!("copy worker failed: {}", e)))??;

        if let Err(e) = self.journal.append(&JournalEntry::from_copy(Some(key), &result)) {
            warn!("Copy succeeded but journaling failed: {}", e);
        }
        self.log.push(format!("Copied {} -> {}", result.source.display(), result.destination.display()));
        Ok(result)
    }

    pub fn journal(&self) -> &SortJournal {
        &self.journal
    }

    pub fn current_prediction(&self) -> Option<PredictionRecord> {
        self.current().and_then(|e| self.predictions.lookup(&e.path))
    }

    pub fn predictions(&self) -> &PredictionStore {
        &self.predictions
    }

    pub async fn current_thumbnail(&self) -> Result<Thumbnail> {
        let entry = self.current().ok_or(WildsortError::NoImages)?;
        self.thumbnails.get_or_create(&entry.path).await
    }

    /// Command line for running `tool` over the open folder
    pub fn command_for(&self, tool: Tool) -> Result<CommandSpec> {
        let folder = self.folder.as_deref().ok_or(WildsortError::NoImages)?;
        tool.command(&self.config.tools, folder, &self.images)
    }

    /// Remember that `task_id` runs `tool`, so its completion can be acted on
    pub fn track(&mut self, task_id: Uuid, tool: Tool) {
        self.launched.insert(task_id, tool);
    }

    pub fn log(&self) -> &LogTail {
        &self.log
    }

    /// Feed one task event into the session
    pub fn handle_event(&mut self, event: &TaskEvent) -> Result<Reaction> {
        match event {
            TaskEvent::Log(log) => {
                let line = match log.stream {
                    LogStream::Stdout => log.text.clone(),
                    LogStream::Stderr => format!("[stderr] {}", log.text),
                    LogStream::System => format!("[wildsort] {}", log.text),
                };
                self.log.push(line);
                Ok(Reaction::Nothing)
            }
            TaskEvent::State { task_id, state, exit_code } => {
                if !state.is_terminal() {
                    return Ok(Reaction::Nothing);
                }
                let Some(tool) = self.launched.remove(task_id) else {
                    return Ok(Reaction::Nothing);
                };
                if *state != TaskState::Succeeded {
                    self.log.push(format!("{} ended as {:?} (exit code {:?})", tool.label(), state, exit_code));
                    return Ok(Reaction::Nothing);
                }
                self.after_success(tool)
            }
        }
    }

    fn after_success(&mut self, tool: Tool) -> Result<Reaction> {
        match tool {
            Tool::SpeciesNet => {
                let records = self.load_predictions().unwrap_or(0);
                info!("SpeciesNet finished, {} predictions loaded", records);
                Ok(Reaction::PredictionsReloaded { records })
            }
            Tool::MegaDetector => {
                let folder = self.folder.clone().ok_or(WildsortError::NoImages)?;
                let renamed = tools::rename_annotated_outputs(&folder)?.len();
                let images = self.rescan()?.entries.len();
                self.log.push(format!("MegaDetector finished, {} outputs renamed", renamed));
                Ok(Reaction::OutputsRenamed { renamed, images })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::LogEvent;
    use std::fs;
    use tempfile::TempDir;

    fn session_with(dir: &TempDir, names: &[&str]) -> Session {
        let folder = dir.path().join("cams");
        fs::create_dir_all(&folder).unwrap();
        for name in names {
            fs::write(folder.join(name), name.as_bytes()).unwrap();
        }
        let mut config = AppConfig::default();
        config.history.path = dir.path().join("journal.jsonl");
        config.thumbnails.persist = false;
        let mut session = Session::new(config);
        session.open_folder(&folder).unwrap();
        session
    }

    fn names(session: &Session) -> Vec<String> {
        session.images().iter().map(|e| e.file_name()).collect()
    }

    #[test]
    fn test_navigation_wraps_around() {
        let dir = TempDir::new().unwrap();
        let mut session = session_with(&dir, &["c.jpg", "a.jpg", "b.jpg"]);
        assert_eq!(names(&session), vec!["a.jpg", "b.jpg", "c.jpg"]);

        assert_eq!(session.current().unwrap().file_name(), "a.jpg");
        assert_eq!(session.previous().unwrap().file_name(), "c.jpg");
        assert_eq!(session.next().unwrap().file_name(), "a.jpg");
        session.next();
        assert_eq!(session.next().unwrap().file_name(), "c.jpg");
        assert_eq!(session.next().unwrap().file_name(), "a.jpg");
    }

    #[test]
    fn test_empty_folder_navigation() {
        let dir = TempDir::new().unwrap();
        let mut session = session_with(&dir, &[]);
        assert!(session.next().is_none());
        assert!(session.previous().is_none());
        assert!(matches!(session.select(0), Err(WildsortError::NoImages)));
    }

    #[tokio::test]
    async fn test_sort_current_copies_and_journals() {
        let dir = TempDir::new().unwrap();
        let mut session = session_with(&dir, &["a.jpg", "b.jpg"]);
        let fox = dir.path().join("fox");

        assert!(matches!(session.sort_current(1).await, Err(WildsortError::UnboundKey(1))));

        session.bind(1, fox.clone()).unwrap();
        session.next();
        let first = session.sort_current(1).await.unwrap();
        let second = session.sort_current(1).await.unwrap();
        assert_eq!(first.destination, fox.join("b.jpg"));
        assert_eq!(second.destination, fox.join("b_1.jpg"));

        let journal = session.journal().read_all().unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].key, Some(1));
    }

    #[test]
    fn test_predictions_load_with_folder() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("cams");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("a.jpg"), b"a").unwrap();
        let doc = serde_json::json!({ "media": [
            { "filepath": folder.join("a.jpg"), "prediction": "x;y;z;;;;roe deer", "prediction_score": 0.7 }
        ]});
        fs::write(folder.join("predictions.json"), doc.to_string()).unwrap();

        let mut session = Session::new(AppConfig::default());
        session.open_folder(&folder).unwrap();
        let record = session.current_prediction().unwrap();
        assert_eq!(record.common_name(), Some("roe deer"));
    }

    #[test]
    fn test_log_tail_is_bounded() {
        let mut tail = LogTail::new(3);
        for i in 0..5 {
            tail.push(format!("line {}", i));
        }
        assert_eq!(tail.lines().collect::<Vec<_>>(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_megadetector_completion_renames_and_rescans() {
        let dir = TempDir::new().unwrap();
        let mut session = session_with(&dir, &["a.jpg", "b.jpg"]);
        session.next();

        let folder = session.folder().unwrap().to_path_buf();
        fs::write(folder.join("cams~a.jpg"), b"boxes").unwrap();

        let task_id = Uuid::new_v4();
        session.track(task_id, Tool::MegaDetector);
        let log = TaskEvent::Log(LogEvent::new(task_id, LogStream::Stderr, "100%"));
        assert_eq!(session.handle_event(&log).unwrap(), Reaction::Nothing);

        let done = TaskEvent::State { task_id, state: TaskState::Succeeded, exit_code: Some(0) };
        let reaction = session.handle_event(&done).unwrap();
        assert_eq!(reaction, Reaction::OutputsRenamed { renamed: 1, images: 3 });
        assert_eq!(names(&session), vec!["a.jpg", "a_pred.jpg", "b.jpg"]);
        assert_eq!(session.current().unwrap().file_name(), "b.jpg");
        assert!(session.log().lines().any(|l| l == "[stderr] 100%"));

        // A second terminal event for the same task is ignored
        assert_eq!(session.handle_event(&done).unwrap(), Reaction::Nothing);
    }

    #[test]
    fn test_failed_task_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut session = session_with(&dir, &["a.jpg"]);
        let task_id = Uuid::new_v4();
        session.track(task_id, Tool::SpeciesNet);

        let failed = TaskEvent::State { task_id, state: TaskState::Failed, exit_code: Some(1) };
        assert_eq!(session.handle_event(&failed).unwrap(), Reaction::Nothing);
        assert!(session.predictions().snapshot().is_empty());
    }
}
