// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures: a scripted fetcher, a fake decoder and a temp library.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tempfile::TempDir;

use lectern::catalog::{Catalog, MemoryCatalog};
use lectern::config::{Config, DownloadTunables, PlaybackTunables};
use lectern::download::{Connection, DownloadQueue, DownloadWorker, Fetcher, PriorityDownloads, SharedQueue};
use lectern::error::{DecoderError, FetchError};
use lectern::platform::AudioFocus;
use lectern::player::{CompletionCallback, Decoder, DecoderFactory, ErrorCallback};
use lectern::store::FileStore;
use lectern::types::{Book, BookId, Section, SectionKey};

pub const BOOK: BookId = 1;

// =============================================================================
// SCRIPTED FETCHER
// =============================================================================

/// How the fake server behaves for one URL.
#[derive(Debug, Clone)]
pub struct Script {
    /// Bytes per body chunk.
    pub chunk: usize,
    /// Delay before each chunk.
    pub delay: Duration,
    /// Stop sending (without closing) at this absolute offset.
    pub stall_after: Option<u64>,
    /// Fail the stream at this absolute offset.
    pub fail_after: Option<u64>,
    /// Reply with the whole body even when a range was asked for.
    pub ignore_range: bool,
    /// Do not report a body length.
    pub omit_length: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            chunk: 1024,
            delay: Duration::ZERO,
            stall_after: None,
            fail_after: None,
            ignore_range: false,
            omit_length: false,
        }
    }
}

#[derive(Default)]
pub struct MockFetcher {
    content: Mutex<HashMap<String, (Arc<Vec<u8>>, Script)>>,
    requests: Mutex<Vec<(String, Option<u64>)>>,
}

impl MockFetcher {
    pub fn serve(&self, url: &str, data: Vec<u8>, script: Script) {
        self.content
            .lock()
            .unwrap()
            .insert(url.to_string(), (Arc::new(data), script));
    }

    /// Every `(url, range_start)` opened so far.
    pub fn requests(&self) -> Vec<(String, Option<u64>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn open(&self, url: &str, range_start: Option<u64>) -> Result<Connection, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), range_start));

        let Some((data, script)) = self.content.lock().unwrap().get(url).cloned() else {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            });
        };

        let start = if script.ignore_range {
            0
        } else {
            range_start.unwrap_or(0).min(data.len() as u64)
        };
        let reported_length = if script.omit_length {
            None
        } else {
            Some(data.len() as u64 - start)
        };

        let partial = range_start.is_some() && !script.ignore_range;
        let body = stream::unfold((start, false), move |(offset, done)| {
            let data = data.clone();
            let script = script.clone();
            async move {
                if done || offset >= data.len() as u64 {
                    return None;
                }
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                if script.stall_after.is_some_and(|n| offset >= n) {
                    std::future::pending::<()>().await;
                }
                if script.fail_after.is_some_and(|n| offset >= n) {
                    return Some((
                        Err(FetchError::Stream("connection reset".to_string())),
                        (offset, true),
                    ));
                }
                let mut end = (offset as usize + script.chunk).min(data.len());
                for boundary in [script.stall_after, script.fail_after].into_iter().flatten() {
                    if boundary > offset {
                        end = end.min(boundary as usize);
                    }
                }
                let bytes = Bytes::copy_from_slice(&data[offset as usize..end]);
                Some((Ok(bytes), (end as u64, false)))
            }
        })
        .boxed();

        Ok(Connection {
            reported_length,
            partial,
            body,
        })
    }
}

// =============================================================================
// FAKE DECODER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderEvent {
    /// Decoder id, bytes on disk when opened.
    Opened(usize, u64),
    Seek(usize, u64),
    Started(usize),
    Paused(usize),
    Released(usize),
}

#[derive(Default)]
struct FakeState {
    position_ms: u64,
    playing: bool,
    released: bool,
    on_complete: Option<CompletionCallback>,
    on_error: Option<ErrorCallback>,
}

/// Test-side handle on one fake decoder.
#[derive(Clone)]
pub struct FakeHandle {
    pub id: usize,
    pub path: PathBuf,
    state: Arc<Mutex<FakeState>>,
}

impl FakeHandle {
    pub fn set_position(&self, position_ms: u64) {
        self.state.lock().unwrap().position_ms = position_ms;
    }

    pub fn position(&self) -> u64 {
        self.state.lock().unwrap().position_ms
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().unwrap().released
    }

    /// Stop at `position_ms` and fire the completion callback.
    pub fn complete_at(&self, position_ms: u64) {
        let mut state = self.state.lock().unwrap();
        state.position_ms = position_ms;
        state.playing = false;
        if let Some(callback) = state.on_complete.as_ref() {
            callback(position_ms);
        }
    }

    pub fn fail(&self) {
        let mut state = self.state.lock().unwrap();
        state.playing = false;
        if let Some(callback) = state.on_error.as_ref() {
            callback(DecoderError::Playback("corrupt frame".to_string()));
        }
    }
}

struct FakeDecoder {
    handle: FakeHandle,
    log: Arc<Mutex<Vec<DecoderEvent>>>,
}

impl FakeDecoder {
    fn record(&self, event: DecoderEvent) {
        self.log.lock().unwrap().push(event);
    }
}

impl Decoder for FakeDecoder {
    fn seek(&mut self, position_ms: u64) -> Result<(), DecoderError> {
        self.handle.state.lock().unwrap().position_ms = position_ms;
        self.record(DecoderEvent::Seek(self.handle.id, position_ms));
        Ok(())
    }

    fn start(&mut self) -> Result<(), DecoderError> {
        self.handle.state.lock().unwrap().playing = true;
        self.record(DecoderEvent::Started(self.handle.id));
        Ok(())
    }

    fn pause(&mut self) {
        self.handle.state.lock().unwrap().playing = false;
        self.record(DecoderEvent::Paused(self.handle.id));
    }

    fn release(&mut self) {
        {
            let mut state = self.handle.state.lock().unwrap();
            state.playing = false;
            state.released = true;
            state.on_complete = None;
            state.on_error = None;
        }
        self.record(DecoderEvent::Released(self.handle.id));
    }

    fn position_ms(&self) -> u64 {
        self.handle.position()
    }

    fn duration_ms(&self) -> u64 {
        0
    }

    fn is_playing(&self) -> bool {
        self.handle.is_playing()
    }

    fn on_complete(&mut self, callback: CompletionCallback) {
        self.handle.state.lock().unwrap().on_complete = Some(callback);
    }

    fn on_error(&mut self, callback: ErrorCallback) {
        self.handle.state.lock().unwrap().on_error = Some(callback);
    }
}

#[derive(Default)]
pub struct FakeDecoderFactory {
    log: Arc<Mutex<Vec<DecoderEvent>>>,
    handles: Mutex<Vec<FakeHandle>>,
    next_id: AtomicUsize,
    pub fail_open: AtomicBool,
}

impl FakeDecoderFactory {
    pub fn events(&self) -> Vec<DecoderEvent> {
        self.log.lock().unwrap().clone()
    }

    pub fn handles(&self) -> Vec<FakeHandle> {
        self.handles.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Most recently opened decoder.
    pub fn latest(&self) -> FakeHandle {
        self.handles
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no decoder opened")
    }
}

impl DecoderFactory for FakeDecoderFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn Decoder>, DecoderError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DecoderError::Open {
                path: path.to_path_buf(),
                message: "unsupported format".to_string(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let on_disk = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let handle = FakeHandle {
            id,
            path: path.to_path_buf(),
            state: Arc::new(Mutex::new(FakeState::default())),
        };
        self.handles.lock().unwrap().push(handle.clone());
        self.log.lock().unwrap().push(DecoderEvent::Opened(id, on_disk));
        Ok(Box::new(FakeDecoder {
            handle,
            log: self.log.clone(),
        }))
    }
}

/// Focus arbiter that always refuses.
pub struct DenyFocus;

impl AudioFocus for DenyFocus {
    fn request_focus(&self) -> bool {
        false
    }

    fn abandon_focus(&self) {}
}

// =============================================================================
// LIBRARY FIXTURE
// =============================================================================

/// Deterministic section content.
pub fn content(section_number: u32, len: u64) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(31).wrapping_add(section_number) % 251) as u8)
        .collect()
}

pub fn url(section_number: u32) -> String {
    format!("http://archive.test/walden/walden_{:02}.mp3", section_number)
}

pub fn download_tunables() -> DownloadTunables {
    DownloadTunables {
        chunk_size: 1024,
        progress_persist_ms: 10,
        min_buffer_bytes: 8192,
        previous_run_wait_ms: 500,
    }
}

pub fn test_config(library: &Path) -> Config {
    Config {
        library_dir: library.to_path_buf(),
        queue_file: library.join("queue.json"),
        skip_back_secs: 10,
        skip_forward_secs: 10,
        focus_loss_rewind_secs: 10,
        download: download_tunables(),
        playback: PlaybackTunables {
            buffering_timeout_ms: 2000,
            buffer_poll_ms: 10,
            tick_ms: 50,
            rebuffer_ms: 1000,
            eof_looseness_ms: 1000,
            duck_retry_ms: 50,
        },
    }
}

pub struct Library {
    pub dir: TempDir,
    pub catalog: Arc<MemoryCatalog>,
    pub store: FileStore,
    pub queue: SharedQueue,
    pub fetcher: Arc<MockFetcher>,
    pub size: u64,
}

impl Library {
    /// A book with `sections` sections of `size` bytes, one byte per
    /// millisecond of audio.
    pub fn new(sections: u32, size: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        let book = Book {
            id: BOOK,
            external_id: "77".to_string(),
            title: "Walden".to_string(),
            author: "Henry David Thoreau".to_string(),
            num_sections: sections,
            current_section: 1,
            current_position_ms: 0,
        };
        let sections: Vec<Section> = (1..=sections)
            .map(|n| Section {
                book_id: BOOK,
                section_number: n,
                url: url(n),
                size_bytes: size,
                duration_secs: size / 1000,
                title: format!("Chapter {}", n),
                author: book.author.clone(),
            })
            .collect();
        catalog.insert_book(book, sections);

        let store = FileStore::new(dir.path().join("library"), catalog.clone());
        let queue = DownloadQueue::open(dir.path().join("queue.json"))
            .unwrap()
            .into_shared();
        Self {
            dir,
            catalog,
            store,
            queue,
            fetcher: Arc::new(MockFetcher::default()),
            size,
        }
    }

    pub fn key(&self, section_number: u32) -> SectionKey {
        SectionKey::new(BOOK, section_number)
    }

    pub fn section(&self, section_number: u32) -> Section {
        self.catalog.section(self.key(section_number)).unwrap()
    }

    pub fn path(&self, section_number: u32) -> PathBuf {
        self.store.path(self.key(section_number)).unwrap()
    }

    pub fn on_disk(&self, section_number: u32) -> u64 {
        self.store.length(&self.path(section_number))
    }

    /// Serve a section with the given script.
    pub fn serve(&self, section_number: u32, script: Script) {
        self.fetcher
            .serve(&url(section_number), content(section_number, self.size), script);
    }

    /// Put the first `len` bytes of a section on disk.
    pub fn write_partial(&self, section_number: u32, len: u64) {
        let path = self.path(section_number);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let data = content(section_number, self.size);
        std::fs::write(&path, &data[..len as usize]).unwrap();
    }

    pub fn write_complete(&self, section_number: u32) {
        self.write_partial(section_number, self.size);
    }

    pub fn enqueue(&self, section_number: u32) {
        let section = self.section(section_number);
        self.queue.write().unwrap().enqueue(&section);
    }

    pub fn is_queued(&self, section_number: u32) -> bool {
        self.queue.read().unwrap().contains(self.key(section_number))
    }

    pub fn worker(&self) -> DownloadWorker {
        DownloadWorker::builder(self.queue.clone(), self.store.clone(), self.fetcher.clone())
            .tunables(download_tunables())
            .build()
    }

    pub fn priority(&self) -> PriorityDownloads {
        PriorityDownloads::new(self.worker(), &download_tunables())
            .with_poll_interval(Duration::from_millis(10))
    }

    pub fn config(&self) -> Config {
        test_config(self.dir.path())
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
