// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent download queue.
//!
//! Requests are ordered by `(sequence, id)`: the single jump request first,
//! then the rest in insertion order. The queue is saved to disk so pending
//! sections survive a restart.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::{DownloadRequest, JUMP_SEQUENCE, NORMAL_SEQUENCE};
use crate::types::{BookId, Section, SectionKey};

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const QUEUE_FORMAT_VERSION: u32 = 1;

/// Queue shared between the worker and the priority coordinator.
pub type SharedQueue = Arc<RwLock<DownloadQueue>>;

/// Ordered, persisted list of download requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadQueue {
    entries: Vec<DownloadRequest>,
    /// Next insertion id
    next_id: u64,
    /// When the queue was last saved
    pub last_saved: Option<DateTime<Utc>>,
    /// Version for future migrations
    pub version: u32,
    /// Backing file; `None` for a purely in-memory queue.
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for DownloadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadQueue {
    /// Create an empty in-memory queue.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            last_saved: None,
            version: QUEUE_FORMAT_VERSION,
            path: None,
        }
    }

    /// Open the queue stored at `path`, or an empty queue bound to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_timeout(path, LOCK_TIMEOUT)
    }

    pub fn open_with_timeout(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            let mut queue = Self::new();
            queue.path = Some(path);
            return Ok(queue);
        }

        // Shared lock allows concurrent readers while blocking during writes
        let lock_path = Self::lock_path(&path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;
        acquire_shared_lock_with_timeout(&lock_file, timeout)?;

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read queue file: {:?}", path))?;
        let mut queue: DownloadQueue = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse queue file: {:?}", path))?;

        // Repair a next_id that fell behind (hand-edited file)
        let max_id = queue.entries.iter().map(|e| e.id).max().unwrap_or(0);
        queue.next_id = queue.next_id.max(max_id + 1);
        queue.path = Some(path);
        Ok(queue)
    }

    pub fn into_shared(self) -> SharedQueue {
        Arc::new(RwLock::new(self))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock_path(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    /// Save to disk. A no-op for in-memory queues.
    pub fn save(&mut self) -> Result<()> {
        self.save_with_timeout(LOCK_TIMEOUT)
    }

    /// Save with atomic writes under an exclusive lock file.
    ///
    /// The lock is held for the whole write including the rename, so a
    /// concurrent `lectern` process never observes a half-written file.
    pub fn save_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard = acquire_exclusive_lock_with_timeout(&Self::lock_path(&path), timeout)?;

        let temp_path = path.with_extension("tmp");
        self.last_saved = Some(Utc::now());
        let content = serde_json::to_string_pretty(self)
            .with_context(|| "Failed to serialize queue to JSON")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, &path).with_context(|| {
            format!(
                "Failed to rename temp file to queue file: {:?} -> {:?}",
                temp_path, path
            )
        })?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: SectionKey) -> Option<&DownloadRequest> {
        self.entries.iter().find(|e| e.key() == key)
    }

    pub fn get_mut(&mut self, key: SectionKey) -> Option<&mut DownloadRequest> {
        self.entries.iter_mut().find(|e| e.key() == key)
    }

    pub fn contains(&self, key: SectionKey) -> bool {
        self.get(key).is_some()
    }

    /// Queue a section at normal priority. An existing request keeps its place.
    ///
    /// Returns true when a new request was added.
    pub fn enqueue(&mut self, section: &Section) -> bool {
        if self.contains(section.key()) {
            return false;
        }
        self.push(section, NORMAL_SEQUENCE);
        true
    }

    /// Insert a request for `section` or update the existing one's sequence,
    /// URL and expected size.
    pub fn upsert(&mut self, section: &Section, sequence: i32) {
        if let Some(entry) = self.get_mut(section.key()) {
            entry.url = section.url.clone();
            entry.total_bytes = section.size_bytes;
            entry.set_sequence(sequence);
            return;
        }
        self.push(section, sequence);
    }

    fn push(&mut self, section: &Section, sequence: i32) {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(DownloadRequest::new(id, section, sequence));
    }

    /// Demote every jump request to normal priority. Returns how many changed.
    pub fn reset_jump(&mut self) -> usize {
        let mut changed = 0;
        for entry in self.entries.iter_mut().filter(|e| e.is_jump()) {
            entry.set_sequence(NORMAL_SEQUENCE);
            changed += 1;
        }
        changed
    }

    /// Set the sequence of an existing request. Returns false if absent.
    pub fn set_sequence(&mut self, key: SectionKey, sequence: i32) -> bool {
        match self.get_mut(key) {
            Some(entry) => {
                entry.set_sequence(sequence);
                true
            }
            None => false,
        }
    }

    pub fn jump_entry(&self) -> Option<&DownloadRequest> {
        self.entries.iter().find(|e| e.sequence == JUMP_SEQUENCE)
    }

    pub fn remove(&mut self, key: SectionKey) -> Option<DownloadRequest> {
        let idx = self.entries.iter().position(|e| e.key() == key)?;
        Some(self.entries.remove(idx))
    }

    /// Remove every request of a book. Returns how many were removed.
    pub fn remove_book(&mut self, book_id: BookId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.book_id != book_id);
        before - self.entries.len()
    }

    /// Record progress (and a possibly repaired size) for a request.
    pub fn update_progress(&mut self, key: SectionKey, downloaded_bytes: u64, total_bytes: u64) {
        if let Some(entry) = self.get_mut(key) {
            entry.downloaded_bytes = downloaded_bytes;
            entry.total_bytes = total_bytes;
            entry.updated_at = Utc::now();
        }
    }

    /// All requests in processing order.
    pub fn ordered(&self) -> Vec<&DownloadRequest> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|e| (e.sequence, e.id));
        entries
    }

    /// First request in processing order that is not in `skip`.
    pub fn next_pending(&self, skip: &HashSet<SectionKey>) -> Option<DownloadRequest> {
        self.entries
            .iter()
            .filter(|e| !skip.contains(&e.key()))
            .min_by_key(|e| (e.sequence, e.id))
            .cloned()
    }
}

/// Acquire an exclusive lock with timeout.
///
/// Returns the locked file handle on success, or an error if the timeout expires.
fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))?;

    let start = Instant::now();
    loop {
        match FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another lectern process may be writing the queue.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

/// Acquire a shared lock with timeout.
fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        match FileExt::try_lock_shared(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for shared lock after {:?}. \
                         Another lectern process may be writing the queue.",
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| "Failed to acquire shared lock on queue file");
            }
        }
    }
}
