// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File Store
//!
//! Maps a (book, section) pair to a file in the library directory:
//!
//! ```text
//! <library>/
//! └── <external_id>_<escaped book title>/
//!     ├── 1_<escaped url file name>
//!     └── 2_<escaped url file name>
//! ```
//!
//! The length of a section file is the single source of truth for how much of
//! it has been downloaded.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog::Catalog;
use crate::error::CatalogError;
use crate::types::{Book, BookId, Section, SectionKey};

static UNSAFE_FILENAME_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[*\[\]{}:?\^|"&%;'<>=+!\t`/]"#).expect("valid filename escape regex")
});

/// Replace characters that are unsafe in file names with `_`.
pub fn escape_filename(name: &str) -> String {
    UNSAFE_FILENAME_CHARS.replace_all(name, "_").into_owned()
}

/// Resolves section files under a library root.
#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
    catalog: Arc<dyn Catalog>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            root: root.into(),
            catalog,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn book_dir(&self, book: &Book) -> PathBuf {
        self.root
            .join(format!("{}_{}", book.external_id, escape_filename(&book.title)))
    }

    pub fn section_path(&self, book: &Book, section: &Section) -> PathBuf {
        self.book_dir(book).join(format!(
            "{}_{}",
            section.section_number,
            escape_filename(section.url_file_name())
        ))
    }

    /// Path of a section's file, looked up through the catalog.
    pub fn path(&self, key: SectionKey) -> Result<PathBuf, CatalogError> {
        let book = self.catalog.book(key.book_id)?;
        let section = self.catalog.section(key)?;
        Ok(self.section_path(&book, &section))
    }

    /// Bytes currently on disk, 0 when the file does not exist.
    pub fn length(&self, path: &Path) -> u64 {
        fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    /// Create the book's directory if needed.
    pub fn ensure_directory(&self, book: &Book) -> io::Result<PathBuf> {
        let dir = self.book_dir(book);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Total bytes used by the whole library.
    pub fn library_usage(&self) -> u64 {
        disk_usage(&self.root)
    }

    /// Remove every downloaded file of a book. Returns the bytes freed.
    pub fn delete_book_files(&self, book_id: BookId) -> Result<u64, CatalogError> {
        let book = self.catalog.book(book_id)?;
        let dir = self.book_dir(&book);
        let freed = disk_usage(&dir);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(book = book_id, freed, "Deleted book files");
                Ok(freed)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(CatalogError::Storage(format!(
                "Failed to delete {}: {}",
                dir.display(),
                e
            ))),
        }
    }
}

/// Recursive size of a directory (or a single file). Missing paths count as 0.
pub fn disk_usage(path: &Path) -> u64 {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| disk_usage(&entry.path()))
        .sum()
}
