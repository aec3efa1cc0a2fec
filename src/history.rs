// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Sort journal with undo support

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::copier::{write_atomic, CopyResult};
use crate::{Result, WildsortError};

/// A single sort copy in the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Binding key the operator pressed, if any
    pub key: Option<u8>,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub undone: bool,
}

impl JournalEntry {
    pub fn from_copy(key: Option<u8>, result: &CopyResult) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            key,
            source: result.source.clone(),
            destination: result.destination.clone(),
            undone: false,
        }
    }
}

/// Append-only JSONL journal of sort copies
#[derive(Debug, Clone)]
pub struct SortJournal {
    path: PathBuf,
}

impl SortJournal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append an entry to the journal
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| WildsortError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| WildsortError::io(&self.path, e))?;

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json).map_err(|e| WildsortError::io(&self.path, e))?;

        Ok(())
    }

    /// Read all journal entries, oldest first
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).map_err(|e| WildsortError::from_io(&self.path, e))?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| WildsortError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Failed to parse journal entry: {}", e),
            }
        }

        Ok(entries)
    }

    /// Get the most recent N entries (newest first)
    pub fn get_recent(&self, count: usize) -> Result<Vec<JournalEntry>> {
        let mut entries = self.read_all()?;
        entries.reverse();
        entries.truncate(count);
        Ok(entries)
    }

    /// Mark an entry as undone.
    ///
    /// Lines that do not parse are written back unchanged.
    pub fn mark_undone(&self, id: &str) -> Result<()> {
        let content = fs::read_to_string(&self.path).map_err(|e| WildsortError::from_io(&self.path, e))?;

        let mut out = Vec::with_capacity(content.len());
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(mut entry) if entry.id == id => {
                    entry.undone = true;
                    out.extend(serde_json::to_vec(&entry)?);
                }
                _ => out.extend(line.as_bytes()),
            }
            out.push(b'\n');
        }
        write_atomic(&self.path, &out)
    }

    /// Entries that haven't been undone, oldest first
    pub fn get_undoable(&self) -> Result<Vec<JournalEntry>> {
        Ok(self.read_all()?.into_iter().filter(|e| !e.undone).collect())
    }

    /// Undo the newest entry that has not been undone yet.
    ///
    /// Only the copy at the destination is removed; the source is never
    /// touched. A destination that is already gone still counts as undone.
    pub fn undo_last(&self) -> Result<Option<JournalEntry>> {
        let Some(mut entry) = self.read_all()?.into_iter().rev().find(|e| !e.undone) else {
            return Ok(None);
        };

        match fs::remove_file(&entry.destination) {
            Ok(()) => info!("Undo: removed {:?}", entry.destination),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Undo: {:?} was already removed", entry.destination);
            }
            Err(e) => return Err(WildsortError::from_io(&entry.destination, e)),
        }

        self.mark_undone(&entry.id)?;
        entry.undone = true;
        Ok(Some(entry))
    }

    /// Clear the whole journal
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| WildsortError::io(&self.path, e))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn copy_result(dir: &Path, name: &str) -> CopyResult {
        let source = dir.join("src").join(name);
        let destination = dir.join("dst").join(name);
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        fs::write(&source, name).unwrap();
        fs::write(&destination, name).unwrap();
        CopyResult { source, destination, renamed: false, bytes: name.len() as u64 }
    }

    #[test]
    fn test_append_and_recent() {
        let dir = TempDir::new().unwrap();
        let journal = SortJournal::new(dir.path().join("journal.jsonl"));
        assert!(journal.read_all().unwrap().is_empty());

        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            journal.append(&JournalEntry::from_copy(Some(1), &copy_result(dir.path(), name))).unwrap();
        }

        let recent = journal.get_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].destination.ends_with("c.jpg"));
        assert!(recent[1].destination.ends_with("b.jpg"));
    }

    #[test]
    fn test_undo_removes_only_destination() {
        let dir = TempDir::new().unwrap();
        let journal = SortJournal::new(dir.path().join("journal.jsonl"));
        let first = copy_result(dir.path(), "a.jpg");
        let second = copy_result(dir.path(), "b.jpg");
        journal.append(&JournalEntry::from_copy(Some(2), &first)).unwrap();
        journal.append(&JournalEntry::from_copy(Some(3), &second)).unwrap();

        let undone = journal.undo_last().unwrap().unwrap();
        assert_eq!(undone.destination, second.destination);
        assert!(!second.destination.exists());
        assert!(second.source.exists());
        assert!(first.destination.exists());

        let undone = journal.undo_last().unwrap().unwrap();
        assert_eq!(undone.key, Some(2));
        assert!(!first.destination.exists());
        assert!(first.source.exists());

        assert!(journal.undo_last().unwrap().is_none());
        assert!(journal.read_all().unwrap().iter().all(|e| e.undone));
    }

    #[test]
    fn test_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = SortJournal::new(path.clone());
        journal.append(&JournalEntry::from_copy(None, &copy_result(dir.path(), "a.jpg"))).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{ not json").unwrap();

        assert_eq!(journal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_undo_keeps_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = SortJournal::new(path.clone());
        journal.append(&JournalEntry::from_copy(None, &copy_result(dir.path(), "a.jpg"))).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{\"id\": \"half written").unwrap();
        }
        journal.append(&JournalEntry::from_copy(None, &copy_result(dir.path(), "b.jpg"))).unwrap();

        let undone = journal.undo_last().unwrap().unwrap();
        assert!(undone.destination.ends_with("b.jpg"));

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "{\"id\": \"half written");

        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].undone);
        assert!(entries[1].undone);
    }
}
