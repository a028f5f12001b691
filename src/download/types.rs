// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types for progressive section fetching.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BookId, Section, SectionKey};

/// Sequence of the single prioritized ("jump") request.
pub const JUMP_SEQUENCE: i32 = -1;

/// Sequence of ordinary FIFO requests.
pub const NORMAL_SEQUENCE: i32 = 0;

/// A queued request to download one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Insertion number, used as the FIFO tie-break.
    pub id: u64,
    pub book_id: BookId,
    pub section_number: u32,
    pub url: String,
    /// Expected size of the finished file.
    pub total_bytes: u64,
    /// Last persisted progress.
    #[serde(default)]
    pub downloaded_bytes: u64,
    /// Lower runs first. [`JUMP_SEQUENCE`] marks the prioritized request.
    pub sequence: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRequest {
    pub fn new(id: u64, section: &Section, sequence: i32) -> Self {
        let now = Utc::now();
        Self {
            id,
            book_id: section.book_id,
            section_number: section.section_number,
            url: section.url.clone(),
            total_bytes: section.size_bytes,
            downloaded_bytes: 0,
            sequence,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> SectionKey {
        SectionKey::new(self.book_id, self.section_number)
    }

    pub fn is_jump(&self) -> bool {
        self.sequence == JUMP_SEQUENCE
    }

    /// Set the sequence and timestamp.
    pub fn set_sequence(&mut self, sequence: i32) {
        self.sequence = sequence;
        self.updated_at = Utc::now();
    }

    /// Persisted progress percentage (0-100).
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.downloaded_bytes.min(self.total_bytes) as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// In-memory progress of the section currently being fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub key: SectionKey,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// Average speed of the current connection.
    pub speed_bps: Option<u64>,
}

impl DownloadProgress {
    pub fn new(key: SectionKey, downloaded_bytes: u64, total_bytes: u64) -> Self {
        Self {
            key,
            downloaded_bytes,
            total_bytes,
            speed_bps: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.downloaded_bytes >= self.total_bytes
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.downloaded_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Get formatted speed string.
    pub fn speed_string(&self) -> Option<String> {
        self.speed_bps.map(|bps| {
            if bps >= 1_048_576 {
                format!("{:.1} MB/s", bps as f64 / 1_048_576.0)
            } else if bps >= 1024 {
                format!("{:.1} KB/s", bps as f64 / 1024.0)
            } else {
                format!("{} B/s", bps)
            }
        })
    }

    /// Get formatted ETA string.
    pub fn eta_string(&self) -> Option<String> {
        let bps = self.speed_bps.filter(|bps| *bps > 0)?;
        let secs = self.total_bytes.saturating_sub(self.downloaded_bytes) / bps;
        Some(if secs >= 3600 {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        } else if secs >= 60 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            format!("{}s", secs)
        })
    }
}

/// Outcome of one drain run of the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: Vec<SectionKey>,
    pub failed: Vec<SectionKey>,
    pub cancelled: bool,
}

impl fmt::Display for DrainSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Downloaded {} section(s)", self.completed.len())?;
        if !self.failed.is_empty() {
            let failed: Vec<String> = self.failed.iter().map(ToString::to_string).collect();
            write!(f, ", {} failed: {}", self.failed.len(), failed.join(", "))?;
        }
        Ok(())
    }
}
