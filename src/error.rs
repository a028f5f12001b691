// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for each subsystem.
//!
//! Library operations return these typed errors so callers can react to
//! specific conditions (a missing section versus a dead connection). File
//! persistence and the CLI use `anyhow` with context instead.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{BookId, SectionKey};

/// Errors from the catalog collaborator.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Book not found: {0}")]
    BookNotFound(BookId),

    #[error("Section not found: {0}")]
    SectionNotFound(SectionKey),

    #[error("Catalog storage failure: {0}")]
    Storage(String),
}

/// Errors opening or reading a network connection.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Server returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Connection dropped while reading body: {0}")]
    Stream(String),
}

/// Errors from the download worker and priority coordinator.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Server did not report a content length for {0}")]
    MissingContentLength(SectionKey),

    #[error("Body for {key} ended after {received} of {expected} bytes")]
    Truncated {
        key: SectionKey,
        received: u64,
        expected: u64,
    },

    #[error("Download queue is empty but work was expected")]
    EmptyQueue,

    #[error("Download run ended abnormally: {0}")]
    RunAborted(String),

    #[error("Queue entry for {0} missing after insert")]
    MissingQueueEntry(SectionKey),

    #[error("Failed to persist download queue: {0:#}")]
    Persist(anyhow::Error),
}

impl DownloadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors reported by a decoder implementation.
#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("Cannot open {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Seek failed: {0}")]
    Seek(String),

    #[error("Playback failed: {0}")]
    Playback(String),
}

/// Errors from the playback coordinator.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Book {book_id} has no section {section_number}")]
    NoSuchSection { book_id: BookId, section_number: u32 },

    #[error("Timed out buffering {0}")]
    BufferingTimeout(SectionKey),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Decoder(#[from] DecoderError),

    #[error("Audio focus was denied")]
    AudioUnavailable,
}
