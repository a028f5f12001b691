// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Catalog collaborator.
//!
//! The catalog owns book and section metadata plus each book's resume point.
//! Its storage format is the host application's business; lectern only needs
//! the four synchronous operations of [`Catalog`]. [`MemoryCatalog`] is a
//! complete implementation backed by a map and an optional JSON snapshot,
//! used by the CLI and by tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::locks::{resilient_read, resilient_write};
use crate::types::{Book, BookId, Section, SectionKey};

/// Read and update book/section metadata.
pub trait Catalog: Send + Sync {
    fn book(&self, id: BookId) -> Result<Book, CatalogError>;

    fn section(&self, key: SectionKey) -> Result<Section, CatalogError>;

    /// Persist the resume point of a book.
    fn update_position(
        &self,
        book_id: BookId,
        section_number: u32,
        position_ms: u64,
    ) -> Result<(), CatalogError>;

    /// Record a corrected file size for a section.
    fn update_section_size(&self, key: SectionKey, size_bytes: u64) -> Result<(), CatalogError>;
}

/// On-disk form of a [`MemoryCatalog`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogSnapshot {
    #[serde(default)]
    books: Vec<Book>,
    #[serde(default)]
    sections: Vec<Section>,
}

#[derive(Debug, Default)]
struct CatalogData {
    books: BTreeMap<BookId, Book>,
    sections: BTreeMap<SectionKey, Section>,
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    data: RwLock<CatalogData>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a book together with its sections.
    pub fn insert_book(&self, book: Book, sections: Vec<Section>) {
        let mut data = resilient_write(&self.data);
        data.sections.retain(|key, _| key.book_id != book.id);
        for section in sections {
            data.sections.insert(section.key(), section);
        }
        data.books.insert(book.id, book);
    }

    pub fn books(&self) -> Vec<Book> {
        resilient_read(&self.data).books.values().cloned().collect()
    }

    /// Sections of a book in section order.
    pub fn sections(&self, book_id: BookId) -> Vec<Section> {
        resilient_read(&self.data)
            .sections
            .values()
            .filter(|s| s.book_id == book_id)
            .cloned()
            .collect()
    }

    /// Load a catalog snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog: {}", path.display()))?;
        let snapshot: CatalogSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog: {}", path.display()))?;

        let catalog = Self::new();
        {
            let mut data = resilient_write(&catalog.data);
            for book in snapshot.books {
                data.books.insert(book.id, book);
            }
            for section in snapshot.sections {
                data.sections.insert(section.key(), section);
            }
        }
        Ok(catalog)
    }

    /// Write the catalog to a JSON file (sizes and resume points included).
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let data = resilient_read(&self.data);
            CatalogSnapshot {
                books: data.books.values().cloned().collect(),
                sections: data.sections.values().cloned().collect(),
            }
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write catalog: {}", path.display()))
    }
}

impl Catalog for MemoryCatalog {
    fn book(&self, id: BookId) -> Result<Book, CatalogError> {
        resilient_read(&self.data)
            .books
            .get(&id)
            .cloned()
            .ok_or(CatalogError::BookNotFound(id))
    }

    fn section(&self, key: SectionKey) -> Result<Section, CatalogError> {
        resilient_read(&self.data)
            .sections
            .get(&key)
            .cloned()
            .ok_or(CatalogError::SectionNotFound(key))
    }

    fn update_position(
        &self,
        book_id: BookId,
        section_number: u32,
        position_ms: u64,
    ) -> Result<(), CatalogError> {
        let mut data = resilient_write(&self.data);
        let book = data
            .books
            .get_mut(&book_id)
            .ok_or(CatalogError::BookNotFound(book_id))?;
        book.current_section = section_number;
        book.current_position_ms = position_ms;
        Ok(())
    }

    fn update_section_size(&self, key: SectionKey, size_bytes: u64) -> Result<(), CatalogError> {
        let mut data = resilient_write(&self.data);
        let section = data
            .sections
            .get_mut(&key)
            .ok_or(CatalogError::SectionNotFound(key))?;
        section.size_bytes = size_bytes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        let book = Book {
            id: 1,
            external_id: "77".into(),
            title: "Walden".into(),
            author: "Thoreau".into(),
            num_sections: 2,
            current_section: 1,
            current_position_ms: 0,
        };
        let sections = (1..=2)
            .map(|n| Section {
                book_id: 1,
                section_number: n,
                url: format!("http://host/walden_{:02}.mp3", n),
                size_bytes: 1000 * n as u64,
                duration_secs: 60,
                title: format!("Chapter {}", n),
                author: String::new(),
            })
            .collect();
        catalog.insert_book(book, sections);
        catalog
    }

    #[test]
    fn test_lookup_and_missing() {
        let catalog = sample();
        assert_eq!(catalog.book(1).unwrap().title, "Walden");
        assert_eq!(catalog.section(SectionKey::new(1, 2)).unwrap().size_bytes, 2000);
        assert!(matches!(catalog.book(5), Err(CatalogError::BookNotFound(5))));
        assert!(matches!(
            catalog.section(SectionKey::new(1, 3)),
            Err(CatalogError::SectionNotFound(_))
        ));
    }

    #[test]
    fn test_updates() {
        let catalog = sample();
        catalog.update_position(1, 2, 4500).unwrap();
        catalog
            .update_section_size(SectionKey::new(1, 1), 1234)
            .unwrap();

        let book = catalog.book(1).unwrap();
        assert_eq!((book.current_section, book.current_position_ms), (2, 4500));
        assert_eq!(catalog.section(SectionKey::new(1, 1)).unwrap().size_bytes, 1234);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = sample();
        catalog.update_position(1, 2, 99).unwrap();
        catalog.save(&path).unwrap();

        let loaded = MemoryCatalog::load(&path).unwrap();
        assert_eq!(loaded.book(1).unwrap().current_position_ms, 99);
        assert_eq!(loaded.sections(1).len(), 2);
    }
}
