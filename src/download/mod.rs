// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progressive Section Downloads
//!
//! This module keeps book sections flowing onto disk while they are played:
//! - A persistent queue of section requests, ordered by priority then age
//! - A single background worker that resumes partial files with range requests
//! - Jump priority for the section the player needs right now
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐  promote/demote  ┌─────────────────┐
//! │ PriorityDownloads │─────────────────▶│ DownloadQueue   │
//! │                   │                  │ (persistent)    │
//! └────────┬──────────┘                  └────────┬────────┘
//!          │ restart                              │ next_pending
//!          ▼                                      ▼
//! ┌───────────────────┐     open/stream  ┌─────────────────┐
//! │ DownloadWorker    │─────────────────▶│ Fetcher         │
//! │ (tokio task)      │                  │ (reqwest)       │
//! └────────┬──────────┘                  └─────────────────┘
//!          │ append
//!          ▼
//! ┌───────────────────┐
//! │ FileStore         │
//! └───────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lectern::catalog::{Catalog, MemoryCatalog};
//! use lectern::config::Config;
//! use lectern::download::{DownloadQueue, DownloadWorker, HttpFetcher, PriorityDownloads};
//! use lectern::store::FileStore;
//! use lectern::types::SectionKey;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());
//! let store = FileStore::new(&config.library_dir, catalog.clone());
//! let queue = DownloadQueue::open(&config.queue_file)?.into_shared();
//!
//! let worker = DownloadWorker::builder(queue, store, Arc::new(HttpFetcher::new()?))
//!     .tunables(config.download.clone())
//!     .build();
//! let priority = PriorityDownloads::new(worker, &config.download);
//!
//! let section = catalog.section(SectionKey::new(1, 3))?;
//! priority.promote(&section).await?;
//! # Ok(())
//! # }
//! ```

pub mod fetch;
pub mod priority;
pub mod queue;
pub mod types;
pub mod worker;

// Re-export commonly used items
pub use fetch::{Connection, Fetcher, HttpFetcher};
pub use priority::{has_enough_buffered, PriorityDownloads};
pub use queue::{DownloadQueue, SharedQueue};
pub use types::{DownloadProgress, DownloadRequest, DrainSummary, JUMP_SEQUENCE, NORMAL_SEQUENCE};
pub use worker::{DownloadWorker, DownloadWorkerBuilder};
