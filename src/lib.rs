// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! lectern - Progressive audiobook download and playback
//!
//! Listen while sections download.
//!
//! Audiobook sections are fetched in the background by a single worker that
//! resumes partial files. When the listener picks a section that is not on
//! disk yet, it jumps to the front of the queue and playback starts as soon
//! as a minimum buffer has arrived, following the file as it grows.
//!
//! **Queue** -> **Worker** -> **Disk** -> **Player**
//!
//! # Core Modules
//!
//! - [`download`] - Persistent queue, download worker and jump priority
//! - [`player`] - Playback coordinator, buffer tracking and audio focus
//! - [`store`] - Section file layout on disk
//! - [`catalog`] - Book and section metadata
//! - [`platform`] - Host capabilities (focus, indicators, network lock)
//! - [`config`] - User configuration and tunables
//! - [`error`] - Typed errors for each layer

pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod locks;
pub mod platform;
pub mod player;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{Book, BookId, Section, SectionKey};

pub use catalog::{Catalog, MemoryCatalog};
pub use config::Config;
pub use download::{DownloadQueue, DownloadWorker, HttpFetcher, PriorityDownloads};
pub use error::{CatalogError, DecoderError, DownloadError, FetchError, PlayerError};
pub use player::{PauseOptions, Player, PlayerState, PlayerStatus};
pub use store::FileStore;
