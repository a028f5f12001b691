// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Priority Download Coordinator.
//!
//! Moves the section the listener needs right now to the front of the queue
//! ("jump" priority), releases it again once it is no longer needed, and
//! answers whether enough of a section is on disk to start playing.

use std::time::Duration;

use tokio::time::Instant;

use super::queue::SharedQueue;
use super::types::{JUMP_SEQUENCE, NORMAL_SEQUENCE};
use super::worker::DownloadWorker;
use crate::config::DownloadTunables;
use crate::error::DownloadError;
use crate::locks::{resilient_read, resilient_write};
use crate::types::{Section, SectionKey};

const DEFAULT_POLL: Duration = Duration::from_millis(30);

/// Whether `on_disk` bytes are enough to start playback at `fraction`.
///
/// A complete file always is. Otherwise at least `min_bytes` must be present
/// and at least `fraction` (clamped to `[0, 1]`) of the total.
pub fn has_enough_buffered(on_disk: u64, total: u64, min_bytes: u64, fraction: f64) -> bool {
    if total > 0 && on_disk >= total {
        return true;
    }
    let fraction = if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    };
    on_disk >= min_bytes && on_disk as f64 >= fraction * total as f64
}

/// Jump-priority management on top of a [`DownloadWorker`].
#[derive(Clone)]
pub struct PriorityDownloads {
    worker: DownloadWorker,
    min_buffer_bytes: u64,
    poll: Duration,
}

impl PriorityDownloads {
    pub fn new(worker: DownloadWorker, tunables: &DownloadTunables) -> Self {
        Self {
            worker,
            min_buffer_bytes: tunables.min_buffer_bytes,
            poll: DEFAULT_POLL,
        }
    }

    /// Fallback poll interval while waiting for bytes written by other means.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll.max(Duration::from_millis(1));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll
    }

    pub fn worker(&self) -> &DownloadWorker {
        &self.worker
    }

    /// Give `section` jump priority and restart the worker on it.
    ///
    /// Any previous jump request drops back to normal priority. Returns once
    /// the queue has been saved.
    pub async fn promote(&self, section: &Section) -> Result<(), DownloadError> {
        let key = section.key();
        self.worker.cancel();

        let section = section.clone();
        let demoted = self
            .with_queue(move |queue| {
                let mut queue = resilient_write(&queue);
                let demoted = queue.reset_jump();
                queue.upsert(&section, JUMP_SEQUENCE);
                if !queue.get(key).is_some_and(|entry| entry.is_jump()) {
                    tracing::error!(%key, "Promoted section missing from queue after insert");
                    return Err(DownloadError::MissingQueueEntry(key));
                }
                queue.save().map_err(DownloadError::Persist)?;
                Ok(demoted)
            })
            .await?;

        tracing::info!(%key, demoted, "Section promoted");
        self.worker.start_expecting_work();
        Ok(())
    }

    /// Return a section to normal priority. The request is never deleted.
    ///
    /// The worker is left alone when the section has no request, e.g. because
    /// it already finished downloading.
    pub async fn demote(&self, key: SectionKey) -> Result<(), DownloadError> {
        let queued = resilient_read(self.worker.queue()).contains(key);
        if !queued {
            tracing::debug!(%key, "No request to demote");
            return Ok(());
        }

        self.worker.cancel();
        let found = self
            .with_queue(move |queue| {
                let mut queue = resilient_write(&queue);
                let found = queue.set_sequence(key, NORMAL_SEQUENCE);
                if found {
                    queue.save().map_err(DownloadError::Persist)?;
                }
                Ok(found)
            })
            .await?;

        if found {
            tracing::debug!(%key, "Section demoted");
        }
        self.worker.start();
        Ok(())
    }

    /// Drop a section's request entirely. Returns whether one existed.
    pub async fn cancel_request(&self, key: SectionKey) -> Result<bool, DownloadError> {
        self.worker.cancel();

        let removed = self
            .with_queue(move |queue| {
                let mut queue = resilient_write(&queue);
                let removed = queue.remove(key).is_some();
                if removed {
                    queue.save().map_err(DownloadError::Persist)?;
                }
                Ok(removed)
            })
            .await?;

        tracing::info!(%key, removed, "Download request cancelled");
        self.worker.start();
        Ok(removed)
    }

    /// True iff the section is complete on disk, or at least the minimum
    /// buffer and `fraction` of it are.
    pub fn can_buffer_enough_to_start(
        &self,
        key: SectionKey,
        fraction: f64,
    ) -> Result<bool, DownloadError> {
        let store = self.worker.store();
        let section = store.catalog().section(key)?;
        let on_disk = store.length(&store.path(key)?);
        Ok(has_enough_buffered(
            on_disk,
            section.size_bytes,
            self.min_buffer_bytes,
            fraction,
        ))
    }

    pub fn is_actively_downloading(&self, key: SectionKey) -> bool {
        self.worker.current() == Some(key)
    }

    /// Wait until [`can_buffer_enough_to_start`](Self::can_buffer_enough_to_start)
    /// holds. Returns false when `timeout` elapses first.
    pub async fn wait_until_buffered(
        &self,
        key: SectionKey,
        fraction: f64,
        timeout: Duration,
    ) -> Result<bool, DownloadError> {
        let mut progress = self.worker.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            if self.can_buffer_enough_to_start(key, fraction)? {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let wake = self.poll.min(remaining);
            tokio::select! {
                changed = progress.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(wake).await;
                    }
                }
                _ = tokio::time::sleep(wake) => {}
            }
        }
    }

    async fn with_queue<T, F>(&self, f: F) -> Result<T, DownloadError>
    where
        T: Send + 'static,
        F: FnOnce(SharedQueue) -> Result<T, DownloadError> + Send + 'static,
    {
        let queue = self.worker.queue().clone();
        tokio::task::spawn_blocking(move || f(queue))
            .await
            .map_err(|e| DownloadError::RunAborted(e.to_string()))?
    }
}
