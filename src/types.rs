// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Canonical types used across lectern.
//!
//! Books and sections are read from the catalog collaborator; the download
//! queue and the player refer to sections through [`SectionKey`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Catalog identifier of a book.
pub type BookId = i64;

/// Identifies one section of one book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectionKey {
    pub book_id: BookId,
    pub section_number: u32,
}

impl SectionKey {
    pub fn new(book_id: BookId, section_number: u32) -> Self {
        Self {
            book_id,
            section_number,
        }
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.book_id, self.section_number)
    }
}

/// A book as recorded in the catalog.
///
/// `current_section` and `current_position_ms` are the persisted resume point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    /// Identifier of the book at its source (used in directory names).
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub author: String,
    pub num_sections: u32,
    #[serde(default = "default_current_section")]
    pub current_section: u32,
    #[serde(default)]
    pub current_position_ms: u64,
}

fn default_current_section() -> u32 {
    1
}

impl Book {
    /// Key of one of this book's sections.
    pub fn section_key(&self, section_number: u32) -> SectionKey {
        SectionKey::new(self.id, section_number)
    }

    /// Key of the section playback resumes from.
    pub fn current_key(&self) -> SectionKey {
        self.section_key(self.current_section)
    }

    pub fn has_section(&self, section_number: u32) -> bool {
        section_number >= 1 && section_number <= self.num_sections
    }
}

/// One individually downloadable and playable chapter of a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub book_id: BookId,
    pub section_number: u32,
    pub url: String,
    /// Expected file size. Repaired from live content lengths when wrong.
    pub size_bytes: u64,
    pub duration_secs: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
}

impl Section {
    pub fn key(&self) -> SectionKey {
        SectionKey::new(self.book_id, self.section_number)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_secs * 1000
    }

    /// Last path segment of the download URL.
    pub fn url_file_name(&self) -> &str {
        match self.url.rfind('/') {
            Some(idx) => &self.url[idx + 1..],
            None => &self.url,
        }
    }

    /// Fraction of the section's duration that `position_ms` represents, in [0, 1].
    pub fn position_fraction(&self, position_ms: u64) -> f64 {
        let duration = self.duration_ms();
        if duration == 0 {
            return 0.0;
        }
        (position_ms as f64 / duration as f64).clamp(0.0, 1.0)
    }

    /// Approximate playable duration covered by `bytes_on_disk`.
    pub fn buffered_ms(&self, bytes_on_disk: u64) -> u64 {
        if self.size_bytes == 0 {
            return 0;
        }
        let fraction = (bytes_on_disk as f64 / self.size_bytes as f64).min(1.0);
        (fraction * self.duration_ms() as f64) as u64
    }
}
