// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download worker: a single background loop draining the queue.
//!
//! Each drain run takes requests in `(sequence, id)` order and fetches them
//! one at a time, resuming from whatever is already on disk. Starting a new
//! run cancels the previous one and waits for it to stop, so at most one
//! fetch is ever in flight.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::fetch::{Connection, Fetcher};
use super::queue::SharedQueue;
use super::types::{DownloadProgress, DownloadRequest, DrainSummary};
use crate::config::DownloadTunables;
use crate::error::DownloadError;
use crate::locks::{resilient_lock, resilient_read, resilient_write};
use crate::platform::{Indicator, IndicatorKind, LogIndicator, NetworkLock, NetworkLockGuard, NoNetworkLock};
use crate::store::FileStore;
use crate::types::SectionKey;

/// Cooperative cancellation signal for one drain run.
#[derive(Debug, Default)]
struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// State shared between a drain task and whoever joins it.
struct RunShared {
    cancel: CancelFlag,
    done: watch::Sender<bool>,
    outcome: Mutex<Option<Result<DrainSummary, DownloadError>>>,
}

/// Marks the run finished even if its task is aborted.
struct DoneOnDrop(Arc<RunShared>);

impl Drop for DoneOnDrop {
    fn drop(&mut self) {
        self.0.done.send_replace(true);
    }
}

struct RunHandle {
    shared: Arc<RunShared>,
    task: JoinHandle<()>,
}

enum FetchOutcome {
    Completed,
    Cancelled,
}

struct WorkerInner {
    queue: SharedQueue,
    store: FileStore,
    fetcher: Arc<dyn Fetcher>,
    indicator: Arc<dyn Indicator>,
    network_lock: Arc<dyn NetworkLock>,
    tunables: DownloadTunables,
    runtime: Handle,
    run: Mutex<Option<RunHandle>>,
    current: RwLock<Option<SectionKey>>,
    progress_tx: watch::Sender<Option<DownloadProgress>>,
}

/// Builder for [`DownloadWorker`].
pub struct DownloadWorkerBuilder {
    queue: SharedQueue,
    store: FileStore,
    fetcher: Arc<dyn Fetcher>,
    indicator: Arc<dyn Indicator>,
    network_lock: Arc<dyn NetworkLock>,
    tunables: DownloadTunables,
}

impl DownloadWorkerBuilder {
    pub fn indicator(mut self, indicator: Arc<dyn Indicator>) -> Self {
        self.indicator = indicator;
        self
    }

    pub fn network_lock(mut self, network_lock: Arc<dyn NetworkLock>) -> Self {
        self.network_lock = network_lock;
        self
    }

    pub fn tunables(mut self, tunables: DownloadTunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Build the worker. Must be called from within a tokio runtime; drain
    /// runs are spawned on that runtime.
    pub fn build(self) -> DownloadWorker {
        let (progress_tx, _) = watch::channel(None);
        DownloadWorker {
            inner: Arc::new(WorkerInner {
                queue: self.queue,
                store: self.store,
                fetcher: self.fetcher,
                indicator: self.indicator,
                network_lock: self.network_lock,
                tunables: self.tunables,
                runtime: Handle::current(),
                run: Mutex::new(None),
                current: RwLock::new(None),
                progress_tx,
            }),
        }
    }
}

/// Background downloader for queued sections.
#[derive(Clone)]
pub struct DownloadWorker {
    inner: Arc<WorkerInner>,
}

impl DownloadWorker {
    pub fn builder(
        queue: SharedQueue,
        store: FileStore,
        fetcher: Arc<dyn Fetcher>,
    ) -> DownloadWorkerBuilder {
        DownloadWorkerBuilder {
            queue,
            store,
            fetcher,
            indicator: Arc::new(LogIndicator),
            network_lock: Arc::new(NoNetworkLock),
            tunables: DownloadTunables::default(),
        }
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.inner.queue
    }

    pub fn store(&self) -> &FileStore {
        &self.inner.store
    }

    /// Start (or restart) draining the queue.
    pub fn start(&self) {
        self.spawn_run(false);
    }

    /// Like [`start`](Self::start), for callers that just queued something.
    /// An empty queue is reported as [`DownloadError::EmptyQueue`].
    pub fn start_expecting_work(&self) {
        self.spawn_run(true);
    }

    /// Ask the current run to stop after the piece being written.
    pub fn cancel(&self) {
        if let Some(run) = resilient_lock(&self.inner.run).as_ref() {
            run.shared.cancel.cancel();
        }
    }

    /// Whether a section fetch is in flight.
    pub fn is_active(&self) -> bool {
        resilient_read(&self.inner.current).is_some()
    }

    /// Section currently being fetched.
    pub fn current(&self) -> Option<SectionKey> {
        *resilient_read(&self.inner.current)
    }

    /// Progress of the in-flight fetch; `None` between sections.
    pub fn subscribe(&self) -> watch::Receiver<Option<DownloadProgress>> {
        self.inner.progress_tx.subscribe()
    }

    /// Wait for the current drain run to finish.
    ///
    /// Returns `None` when no run was started, its result was already taken,
    /// or the run was aborted.
    pub async fn join(&self) -> Option<Result<DrainSummary, DownloadError>> {
        let shared = resilient_lock(&self.inner.run)
            .as_ref()
            .map(|run| run.shared.clone())?;
        let mut done = shared.done.subscribe();
        if done.wait_for(|finished| *finished).await.is_err() {
            return None;
        }
        let outcome = resilient_lock(&shared.outcome).take();
        outcome
    }

    fn spawn_run(&self, expect_work: bool) {
        let mut run = resilient_lock(&self.inner.run);
        let previous = run.take();
        if let Some(prev) = &previous {
            prev.shared.cancel.cancel();
        }

        let (done, _) = watch::channel(false);
        let shared = Arc::new(RunShared {
            cancel: CancelFlag::default(),
            done,
            outcome: Mutex::new(None),
        });

        let inner = self.inner.clone();
        let run_shared = shared.clone();
        let task = self.inner.runtime.spawn(async move {
            let _done = DoneOnDrop(run_shared.clone());
            if let Some(prev) = previous {
                inner.wait_for_previous(prev).await;
            }
            let result = inner.drain(&run_shared.cancel, expect_work).await;
            *resilient_lock(&run_shared.outcome) = Some(result);
        });

        *run = Some(RunHandle { shared, task });
    }
}

impl WorkerInner {
    async fn wait_for_previous(&self, prev: RunHandle) {
        let RunHandle { mut task, .. } = prev;
        let wait = self.tunables.previous_run_wait();
        if tokio::time::timeout(wait, &mut task).await.is_err() {
            tracing::warn!(
                wait_ms = wait.as_millis() as u64,
                "Previous download run did not stop in time; aborting it"
            );
            task.abort();
            let _ = task.await;
            self.set_current(None);
        }
    }

    async fn drain(
        &self,
        cancel: &CancelFlag,
        expect_work: bool,
    ) -> Result<DrainSummary, DownloadError> {
        if expect_work && resilient_read(&self.queue).is_empty() {
            tracing::error!("Download worker started expecting work but the queue is empty");
            return Err(DownloadError::EmptyQueue);
        }

        let _network = NetworkLockGuard::acquire(self.network_lock.clone());
        let mut summary = DrainSummary::default();
        let mut skip = HashSet::new();
        let mut indicator_shown = false;

        tracing::info!(pending = resilient_read(&self.queue).len(), "Download run started");

        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let Some(request) = resilient_read(&self.queue).next_pending(&skip) else {
                break;
            };
            let key = request.key();
            self.set_current(Some(key));
            indicator_shown = true;

            match self.fetch_section(&request, cancel).await {
                Ok(FetchOutcome::Completed) => {
                    tracing::info!(%key, "Section download complete");
                    self.remove_entry(key);
                    summary.completed.push(key);
                }
                Ok(FetchOutcome::Cancelled) => {
                    tracing::debug!(%key, "Section download cancelled");
                    summary.cancelled = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "Section download failed; keeping partial file");
                    skip.insert(key);
                    summary.failed.push(key);
                }
            }
            self.progress_tx.send_replace(None);
        }

        self.set_current(None);
        self.progress_tx.send_replace(None);
        if indicator_shown {
            self.indicator.clear(IndicatorKind::Download);
        }

        tracing::info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            cancelled = summary.cancelled,
            "Download run finished"
        );
        Ok(summary)
    }

    async fn fetch_section(
        &self,
        request: &DownloadRequest,
        cancel: &CancelFlag,
    ) -> Result<FetchOutcome, DownloadError> {
        let key = request.key();
        let catalog = self.store.catalog();
        let book = catalog.book(key.book_id)?;
        let section = catalog.section(key)?;
        let path = self.store.section_path(&book, &section);
        let dir = self.store.book_dir(&book);
        self.store
            .ensure_directory(&book)
            .map_err(|e| DownloadError::io(&dir, e))?;

        self.indicator.show(
            IndicatorKind::Download,
            &book.title,
            &format!("Downloading section {}", key.section_number),
        );

        let mut total = section.size_bytes;
        let mut on_disk = self.store.length(&path);
        if total > 0 && on_disk == total {
            tracing::debug!(%key, "Section already on disk");
            return Ok(FetchOutcome::Completed);
        }

        let mut conn = if on_disk > 0 && on_disk < total {
            let conn = self.fetcher.open(&section.url, Some(on_disk)).await?;
            let remaining = conn
                .reported_length
                .ok_or(DownloadError::MissingContentLength(key))?;
            if conn.partial && remaining == total - on_disk {
                conn
            } else {
                tracing::warn!(
                    %key,
                    on_disk,
                    expected = total - on_disk,
                    reported = remaining,
                    partial = conn.partial,
                    "Resume not honored; restarting from zero"
                );
                drop(conn);
                on_disk = 0;
                self.truncate(&path).await?;
                self.fetcher.open(&section.url, None).await?
            }
        } else {
            if on_disk > 0 {
                tracing::warn!(%key, on_disk, total, "Partial file larger than expected; restarting");
                on_disk = 0;
                self.truncate(&path).await?;
            }
            self.fetcher.open(&section.url, None).await?
        };

        if on_disk == 0 {
            let reported = conn
                .reported_length
                .ok_or(DownloadError::MissingContentLength(key))?;
            if reported != total {
                tracing::warn!(%key, catalog = total, reported, "Repairing section size");
                catalog.update_section_size(key, reported)?;
                total = reported;
            }
        }

        self.stream_to_disk(key, &path, &mut conn, on_disk, total, cancel)
            .await
    }

    async fn stream_to_disk(
        &self,
        key: SectionKey,
        path: &std::path::Path,
        conn: &mut Connection,
        mut on_disk: u64,
        total: u64,
        cancel: &CancelFlag,
    ) -> Result<FetchOutcome, DownloadError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?;

        let chunk_size = self.tunables.chunk_size.max(1);
        let persist_interval = self.tunables.progress_persist_interval();
        let started = Instant::now();
        let mut last_persist = Instant::now();
        let mut received = 0u64;

        self.progress_tx
            .send_replace(Some(DownloadProgress::new(key, on_disk, total)));

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = conn.body.next() => Some(next),
            };
            let chunk = match next {
                None => {
                    self.persist_progress(key, on_disk, total);
                    return Ok(FetchOutcome::Cancelled);
                }
                Some(None) => break,
                Some(Some(Ok(chunk))) => chunk,
                Some(Some(Err(e))) => {
                    self.persist_progress(key, on_disk, total);
                    return Err(e.into());
                }
            };

            for piece in chunk.chunks(chunk_size) {
                file.write_all(piece)
                    .await
                    .map_err(|e| DownloadError::io(path, e))?;
                file.flush().await.map_err(|e| DownloadError::io(path, e))?;
                on_disk += piece.len() as u64;
                received += piece.len() as u64;

                let mut progress = DownloadProgress::new(key, on_disk, total);
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    progress.speed_bps = Some((received as f64 / elapsed) as u64);
                }
                self.progress_tx.send_replace(Some(progress));

                if last_persist.elapsed() >= persist_interval {
                    self.persist_progress(key, on_disk, total);
                    last_persist = Instant::now();
                }
                if cancel.is_cancelled() {
                    self.persist_progress(key, on_disk, total);
                    return Ok(FetchOutcome::Cancelled);
                }
            }
        }

        self.persist_progress(key, on_disk, total);
        if on_disk < total {
            return Err(DownloadError::Truncated {
                key,
                received: on_disk,
                expected: total,
            });
        }
        Ok(FetchOutcome::Completed)
    }

    async fn truncate(&self, path: &std::path::Path) -> Result<(), DownloadError> {
        tokio::fs::File::create(path)
            .await
            .map(|_| ())
            .map_err(|e| DownloadError::io(path, e))
    }

    fn persist_progress(&self, key: SectionKey, downloaded: u64, total: u64) {
        let mut queue = resilient_write(&self.queue);
        queue.update_progress(key, downloaded, total);
        if let Err(e) = queue.save() {
            tracing::warn!(%key, "Failed to persist download progress: {:#}", e);
        }
    }

    fn remove_entry(&self, key: SectionKey) {
        let mut queue = resilient_write(&self.queue);
        queue.remove(key);
        if let Err(e) = queue.save() {
            tracing::warn!(%key, "Failed to persist queue after completion: {:#}", e);
        }
    }

    fn set_current(&self, key: Option<SectionKey>) {
        *resilient_write(&self.current) = key;
    }
}
