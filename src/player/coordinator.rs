// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Playback Coordinator.
//!
//! Owns the decoder and the [`PlaybackState`]. Everything that mutates the
//! state does so under one mutex, which is never held across an `.await`,
//! while opening a decoder, or while calling the catalog or focus arbiter.
//! Long-running steps (waiting for bytes, re-pointing, advancing sections)
//! run as tokio tasks that carry the `generation` they were started for and
//! turn into no-ops once a newer play, pause or seek has superseded them.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::decoder::{Decoder, DecoderFactory};
use super::state::{
    PauseOptions, PlaybackErrorKind, PlaybackState, PlayerState, PlayerStatus, StatusMessage,
    WaitReason,
};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::download::PriorityDownloads;
use crate::error::{DecoderError, PlayerError};
use crate::locks::resilient_lock;
use crate::platform::{AlwaysGranted, AudioFocus, FocusChange, Indicator, IndicatorKind, LogIndicator};
use crate::store::FileStore;
use crate::types::{Book, BookId, Section, SectionKey};

/// A book position to write back to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ResumePoint {
    pub book_id: BookId,
    pub section_number: u32,
    pub position_ms: u64,
}

/// Work left to do once the state lock is released.
#[derive(Debug, Default)]
pub(super) struct PauseEffects {
    pub resume_point: Option<ResumePoint>,
    pub released_resources: bool,
}

pub(super) fn is_complete(section: &Section, on_disk: u64) -> bool {
    section.size_bytes > 0 && on_disk >= section.size_bytes
}

fn seek_and_start(
    decoder: &mut dyn Decoder,
    position_ms: u64,
    start: bool,
) -> Result<(), DecoderError> {
    decoder.seek(position_ms)?;
    if start {
        decoder.start()?;
    }
    Ok(())
}

pub(super) struct PlayerInner {
    pub(super) catalog: Arc<dyn Catalog>,
    pub(super) store: FileStore,
    pub(super) priority: PriorityDownloads,
    pub(super) decoders: Arc<dyn DecoderFactory>,
    pub(super) focus: Arc<dyn AudioFocus>,
    pub(super) indicator: Arc<dyn Indicator>,
    pub(super) config: Config,
    pub(super) runtime: Handle,
    state: Mutex<PlaybackState>,
    status_tx: watch::Sender<PlayerStatus>,
}

/// Builder for [`Player`].
pub struct PlayerBuilder {
    priority: PriorityDownloads,
    decoders: Arc<dyn DecoderFactory>,
    focus: Arc<dyn AudioFocus>,
    indicator: Arc<dyn Indicator>,
    config: Config,
}

impl PlayerBuilder {
    pub fn focus(mut self, focus: Arc<dyn AudioFocus>) -> Self {
        self.focus = focus;
        self
    }

    pub fn indicator(mut self, indicator: Arc<dyn Indicator>) -> Self {
        self.indicator = indicator;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the player. Must be called from within a tokio runtime.
    pub fn build(self) -> Player {
        let store = self.priority.worker().store().clone();
        let priority = self
            .priority
            .with_poll_interval(self.config.playback.buffer_poll());
        let (status_tx, _) = watch::channel(PlayerStatus::default());
        Player {
            inner: Arc::new(PlayerInner {
                catalog: store.catalog().clone(),
                store,
                priority,
                decoders: self.decoders,
                focus: self.focus,
                indicator: self.indicator,
                config: self.config,
                runtime: Handle::current(),
                state: Mutex::new(PlaybackState::default()),
                status_tx,
            }),
        }
    }
}

/// Progressive audiobook player.
///
/// Operations that may wait (play, seek, resume, section changes) return the
/// [`JoinHandle`] of the task doing the work; dropping it does not cancel.
#[derive(Clone)]
pub struct Player {
    inner: Arc<PlayerInner>,
}

impl Player {
    pub fn builder(priority: PriorityDownloads, decoders: Arc<dyn DecoderFactory>) -> PlayerBuilder {
        PlayerBuilder {
            priority,
            decoders,
            focus: Arc::new(AlwaysGranted),
            indicator: Arc::new(LogIndicator),
            config: Config::default(),
        }
    }

    pub fn priority(&self) -> &PriorityDownloads {
        &self.inner.priority
    }

    /// Play a section. A no-op if it is already buffering or playing.
    pub fn play_section(
        &self,
        book_id: BookId,
        section_number: u32,
    ) -> JoinHandle<Result<(), PlayerError>> {
        self.spawn(move |inner| inner.play(book_id, section_number, false))
    }

    /// Play a section, restarting it even if it is already active.
    pub fn play_section_forced(
        &self,
        book_id: BookId,
        section_number: u32,
    ) -> JoinHandle<Result<(), PlayerError>> {
        self.spawn(move |inner| inner.play(book_id, section_number, true))
    }

    /// Play a book from its saved resume point.
    pub fn play_book(&self, book_id: BookId) -> JoinHandle<Result<(), PlayerError>> {
        self.spawn(move |inner| async move {
            let book = inner.catalog.book(book_id)?;
            inner.play(book_id, book.current_section, false).await
        })
    }

    pub fn pause(&self, options: PauseOptions) {
        let inner = &self.inner;
        let effects = {
            let mut st = inner.lock();
            st.generation += 1;
            let effects = inner.pause_locked(&mut st, options);
            inner.publish(&st);
            effects
        };
        inner.finish_pause(effects);
    }

    /// Continue playback, or start the current section if no decoder is held.
    pub fn resume(&self) -> JoinHandle<Result<(), PlayerError>> {
        self.spawn(|inner| inner.resume())
    }

    /// Move to `position_ms` in the current section, waiting for the bytes if
    /// they are not on disk yet.
    pub fn seek_to(&self, position_ms: u64) -> JoinHandle<Result<(), PlayerError>> {
        let prepared = {
            let mut st = self.inner.lock();
            let duration = st.duration_ms();
            match st.current_key() {
                Some(key) if st.decoder.is_some() => {
                    let target = if duration > 0 {
                        position_ms.min(duration)
                    } else {
                        position_ms
                    };
                    let was_playing = st.is_playing();
                    if let Some(decoder) = st.decoder.as_mut() {
                        if was_playing {
                            decoder.pause();
                        }
                    }
                    st.generation += 1;
                    Some((st.generation, key, target, was_playing))
                }
                _ => None,
            }
        };
        self.spawn(move |inner| async move {
            match prepared {
                Some((generation, key, target, was_playing)) => {
                    inner.finish_seek(generation, key, target, was_playing).await
                }
                None => Ok(()),
            }
        })
    }

    pub fn skip_forward(&self) -> JoinHandle<Result<(), PlayerError>> {
        let target = {
            let st = self.inner.lock();
            st.position_ms()
                .saturating_add(self.inner.config.skip_forward_ms())
        };
        self.seek_to(target)
    }

    pub fn skip_backward(&self) -> JoinHandle<Result<(), PlayerError>> {
        let target = {
            let st = self.inner.lock();
            st.position_ms()
                .saturating_sub(self.inner.config.skip_back_ms())
        };
        self.seek_to(target)
    }

    /// Next section, wrapping from the last back to the first.
    pub fn next_section(&self) -> JoinHandle<Result<(), PlayerError>> {
        self.spawn(|inner| async move {
            let generation = inner.lock().generation;
            inner.advance(generation, true).await
        })
    }

    /// Previous section, wrapping from the first to the last.
    pub fn previous_section(&self) -> JoinHandle<Result<(), PlayerError>> {
        self.spawn(|inner| async move {
            let target = {
                let st = inner.lock();
                match (&st.book, &st.section) {
                    (Some(book), Some(section)) => {
                        let previous = if section.section_number <= 1 {
                            book.num_sections
                        } else {
                            section.section_number - 1
                        };
                        Some((book.id, previous))
                    }
                    _ => None,
                }
            };
            match target {
                Some((book_id, previous)) => inner.play(book_id, previous, true).await,
                None => Ok(()),
            }
        })
    }

    /// React to an audio focus change reported by the host.
    pub fn on_focus_change(&self, change: FocusChange) {
        self.inner.on_focus_change(change);
    }

    /// Current state, with a fresh position.
    pub fn status(&self) -> PlayerStatus {
        self.inner.lock().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Stop downloads and playback and release everything.
    pub fn shutdown(&self) {
        self.inner.priority.worker().cancel();
        self.pause(PauseOptions::FULL);
        let mut st = self.inner.lock();
        st.is_downloading = false;
        st.ticker_epoch += 1;
        st.ticker_running = false;
        st.state = PlayerState::Idle;
        self.inner.publish(&st);
        tracing::info!("Player shut down");
    }

    fn spawn<F, Fut>(&self, task: F) -> JoinHandle<Result<(), PlayerError>>
    where
        F: FnOnce(Arc<PlayerInner>) -> Fut,
        Fut: Future<Output = Result<(), PlayerError>> + Send + 'static,
    {
        let future = task(self.inner.clone());
        self.inner.runtime.spawn(async move {
            let result = future.await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Player task failed");
            }
            result
        })
    }
}

impl PlayerInner {
    pub(super) fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        resilient_lock(&self.state)
    }

    /// Publish a snapshot; identical snapshots do not notify subscribers.
    pub(super) fn publish(&self, st: &PlaybackState) {
        let snapshot = st.snapshot();
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    pub(super) fn persist(&self, point: Option<ResumePoint>) {
        let Some(point) = point else {
            return;
        };
        if let Err(e) =
            self.catalog
                .update_position(point.book_id, point.section_number, point.position_ms)
        {
            tracing::warn!(book = point.book_id, error = %e, "Failed to save resume point");
        }
    }

    pub(super) fn pause_locked(&self, st: &mut PlaybackState, options: PauseOptions) -> PauseEffects {
        let mut effects = PauseEffects::default();
        let position_ms = st.position_ms();
        if let Some(decoder) = st.decoder.as_mut() {
            if decoder.is_playing() {
                decoder.pause();
            }
            if options.persist_position {
                if let (Some(book), Some(section)) = (&st.book, &st.section) {
                    effects.resume_point = Some(ResumePoint {
                        book_id: book.id,
                        section_number: section.section_number,
                        position_ms,
                    });
                }
            }
        }

        if options.release_resources && st.resources_held {
            st.resources_held = false;
            st.focus_gained = false;
            effects.released_resources = true;
            if !st.is_downloading {
                st.ticker_epoch += 1;
                st.ticker_running = false;
            }
        }
        if options.release_decoder {
            st.release_decoder();
        }
        if matches!(st.state, PlayerState::Playing | PlayerState::Buffering) {
            st.state = PlayerState::Paused;
        }
        if matches!(st.message, Some(StatusMessage::Waiting(_))) {
            st.message = None;
        }
        effects
    }

    pub(super) fn finish_pause(&self, effects: PauseEffects) {
        if effects.released_resources {
            self.focus.abandon_focus();
            self.indicator.clear(IndicatorKind::Playback);
        }
        self.persist(effects.resume_point);
    }

    /// Stop with an error message, unless superseded.
    pub(super) fn fail(&self, generation: u64, kind: PlaybackErrorKind) {
        let effects = {
            let mut st = self.lock();
            if st.generation != generation {
                return;
            }
            let effects = self.pause_locked(&mut st, PauseOptions::FULL);
            st.state = PlayerState::Error;
            st.message = Some(StatusMessage::Error(kind));
            self.publish(&st);
            effects
        };
        self.finish_pause(effects);
    }

    pub(super) async fn play(
        self: Arc<Self>,
        book_id: BookId,
        section_number: u32,
        forced: bool,
    ) -> Result<(), PlayerError> {
        let book = self.catalog.book(book_id)?;
        if !book.has_section(section_number) {
            return Err(PlayerError::NoSuchSection {
                book_id,
                section_number,
            });
        }
        let key = book.section_key(section_number);
        let section = self.catalog.section(key)?;
        let file = self.store.section_path(&book, &section);

        let (generation, previous_priority, switched_from) = {
            let mut st = self.lock();
            let active = matches!(st.state, PlayerState::Buffering | PlayerState::Playing);
            if !forced && active && st.current_key() == Some(key) {
                tracing::debug!(%key, "Section already active");
                return Ok(());
            }
            let switched_from = match (&st.book, &st.section) {
                (Some(old_book), Some(old_section))
                    if old_book.id != book_id && st.decoder.is_some() =>
                {
                    Some(ResumePoint {
                        book_id: old_book.id,
                        section_number: old_section.section_number,
                        position_ms: st.position_ms(),
                    })
                }
                _ => None,
            };
            st.release_decoder();
            st.generation += 1;
            st.state = PlayerState::Buffering;
            st.book = Some(book.clone());
            st.section = Some(section.clone());
            st.file = Some(file.clone());
            st.is_downloading = false;
            st.last_buffered_ms = 0;
            st.message = Some(StatusMessage::Waiting(WaitReason::PleaseWait));
            let previous_priority = st.priority.take().filter(|previous| *previous != key);
            self.publish(&st);
            (st.generation, previous_priority, switched_from)
        };

        tracing::info!(%key, generation, "Playing section");
        self.persist(switched_from);
        let resume_ms = if book.current_section == section_number {
            book.current_position_ms
        } else {
            self.persist(Some(ResumePoint {
                book_id,
                section_number,
                position_ms: 0,
            }));
            0
        };

        if let Some(previous) = previous_priority {
            if let Err(e) = self.priority.demote(previous).await {
                tracing::warn!(%previous, error = %e, "Failed to release download priority");
            }
        }

        if !self.acquire_resources(generation, &book, &section) {
            return Err(PlayerError::AudioUnavailable);
        }

        let on_disk = self.store.length(&file);
        if !is_complete(&section, on_disk) {
            {
                let mut st = self.lock();
                if st.generation != generation {
                    return Ok(());
                }
                st.is_downloading = true;
                st.priority = Some(key);
                st.last_buffered_ms = section.buffered_ms(on_disk);
                st.message = Some(StatusMessage::Waiting(WaitReason::Buffering));
                self.publish(&st);
            }
            self.ensure_ticker();

            if let Err(e) = self.priority.promote(&section).await {
                tracing::error!(%key, error = %e, "Failed to queue section for download");
                self.fail(generation, PlaybackErrorKind::Connectivity);
                return Err(e.into());
            }
            let fraction = section.position_fraction(resume_ms);
            if !self.wait_for_buffer(generation, key, fraction).await? {
                return Ok(());
            }
        }

        self.attach_decoder(generation, &file, resume_ms)
    }

    /// Wait until enough of `key` is on disk to play at `fraction`.
    ///
    /// Returns false if superseded. On timeout the player pauses, enters
    /// [`PlayerState::Error`] and the queue entry is left in place.
    pub(super) async fn wait_for_buffer(
        &self,
        generation: u64,
        key: SectionKey,
        fraction: f64,
    ) -> Result<bool, PlayerError> {
        let timeout = self.config.playback.buffering_timeout();
        let buffered = self
            .priority
            .wait_until_buffered(key, fraction, timeout)
            .await?;

        let effects = {
            let mut st = self.lock();
            if st.generation != generation {
                return Ok(false);
            }
            if buffered {
                if matches!(st.message, Some(StatusMessage::Waiting(_))) {
                    st.message = None;
                    self.publish(&st);
                }
                return Ok(true);
            }
            tracing::warn!(%key, timeout_ms = timeout.as_millis() as u64, "Timed out buffering section");
            let effects = self.pause_locked(&mut st, PauseOptions::USER);
            st.state = PlayerState::Error;
            st.message = Some(StatusMessage::Error(PlaybackErrorKind::Connectivity));
            self.publish(&st);
            effects
        };
        self.finish_pause(effects);
        Err(PlayerError::BufferingTimeout(key))
    }

    fn attach_decoder(
        self: &Arc<Self>,
        generation: u64,
        file: &Path,
        position_ms: u64,
    ) -> Result<(), PlayerError> {
        let mut decoder = match self.decoders.open(file) {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::error!(file = %file.display(), error = %e, "Failed to open decoder");
                self.fail(generation, PlaybackErrorKind::PlayerSetup);
                return Err(e.into());
            }
        };

        let failure = {
            let mut st = self.lock();
            if st.generation != generation {
                decoder.release();
                return Ok(());
            }
            st.decoder_serial += 1;
            self.install_callbacks(decoder.as_mut(), st.decoder_serial);
            match seek_and_start(decoder.as_mut(), position_ms, true) {
                Ok(()) => {
                    st.decoder = Some(decoder);
                    st.state = PlayerState::Playing;
                    st.message = None;
                    self.publish(&st);
                    None
                }
                Err(e) => {
                    decoder.release();
                    Some(e)
                }
            }
        };

        if let Some(e) = failure {
            tracing::error!(file = %file.display(), error = %e, "Failed to start decoder");
            self.fail(generation, PlaybackErrorKind::PlayerSetup);
            return Err(e.into());
        }
        tracing::debug!(file = %file.display(), position_ms, "Decoder attached");
        self.ensure_ticker();
        Ok(())
    }

    fn install_callbacks(self: &Arc<Self>, decoder: &mut dyn Decoder, serial: u64) {
        let weak = Arc::downgrade(self);
        let runtime = self.runtime.clone();
        decoder.on_complete(Box::new(move |position_ms| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            runtime.spawn(async move {
                if let Err(e) = inner.handle_completion(serial, position_ms).await {
                    tracing::warn!(error = %e, "Failed to continue after decoder completion");
                }
            });
        }));

        let weak = Arc::downgrade(self);
        let runtime = self.runtime.clone();
        decoder.on_error(Box::new(move |error| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            runtime.spawn(async move {
                inner.handle_decoder_error(serial, error);
            });
        }));
    }

    /// Swap in a decoder opened on the (grown) file, keeping the position.
    ///
    /// Returns false when nothing was swapped.
    pub(super) fn repoint(self: &Arc<Self>) -> bool {
        let (file, serial) = {
            let st = self.lock();
            match (&st.file, &st.decoder) {
                (Some(file), Some(_)) if st.is_downloading => (file.clone(), st.decoder_serial),
                _ => return false,
            }
        };
        if !file.exists() {
            return false;
        }

        let mut fresh = match self.decoders.open(&file) {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "Could not reopen growing file");
                return false;
            }
        };

        let mut st = self.lock();
        let (position_ms, was_playing) = match st.decoder.as_ref() {
            Some(old) if st.decoder_serial == serial => (old.position_ms(), old.is_playing()),
            _ => {
                tracing::debug!("Decoder changed while re-pointing; abandoning swap");
                fresh.release();
                return false;
            }
        };

        st.decoder_serial += 1;
        self.install_callbacks(fresh.as_mut(), st.decoder_serial);
        if let Err(e) = seek_and_start(fresh.as_mut(), position_ms, was_playing) {
            tracing::warn!(error = %e, "Re-pointed decoder failed to start; keeping the old one");
            fresh.release();
            st.decoder_serial = serial;
            return false;
        }

        if let Some(mut old) = st.decoder.replace(fresh) {
            if old.is_playing() {
                old.pause();
            }
            old.release();
        }
        self.publish(&st);
        tracing::debug!(position_ms, was_playing, "Re-pointed decoder to growing file");
        true
    }

    async fn handle_completion(
        self: Arc<Self>,
        serial: u64,
        position_ms: u64,
    ) -> Result<(), PlayerError> {
        let (generation, section, file, downloading) = {
            let st = self.lock();
            if st.decoder_serial != serial || st.decoder.is_none() {
                return Ok(());
            }
            match (&st.section, &st.file) {
                (Some(section), Some(file)) => (
                    st.generation,
                    section.clone(),
                    file.clone(),
                    st.is_downloading,
                ),
                _ => return Ok(()),
            }
        };

        let key = section.key();
        let remaining = section.duration_ms().saturating_sub(position_ms);
        let complete = is_complete(&section, self.store.length(&file));
        if remaining < self.config.playback.eof_looseness_ms || (complete && !downloading) {
            tracing::info!(%key, position_ms, "Section finished");
            return self.advance(generation, false).await;
        }

        tracing::info!(%key, position_ms, remaining, "Decoder ran out of data before the end of the section");
        {
            let mut st = self.lock();
            if st.generation != generation || st.decoder_serial != serial {
                return Ok(());
            }
            st.state = PlayerState::Buffering;
            st.message = Some(StatusMessage::Waiting(WaitReason::Buffering));
            if !complete {
                st.is_downloading = true;
                st.priority = Some(key);
            }
            self.publish(&st);
        }

        if !complete && !self.priority.is_actively_downloading(key) {
            self.ensure_ticker();
            if let Err(e) = self.priority.promote(&section).await {
                self.fail(generation, PlaybackErrorKind::Connectivity);
                return Err(e.into());
            }
        }

        self.repoint();
        if !self
            .wait_for_buffer(generation, key, section.position_fraction(position_ms))
            .await?
        {
            return Ok(());
        }

        let failure = {
            let mut st = self.lock();
            if st.generation != generation {
                return Ok(());
            }
            let Some(decoder) = st.decoder.as_mut() else {
                return Ok(());
            };
            match seek_and_start(decoder.as_mut(), position_ms, true) {
                Ok(()) => {
                    st.state = PlayerState::Playing;
                    st.message = None;
                    self.publish(&st);
                    None
                }
                Err(e) => Some(e),
            }
        };
        if let Some(e) = failure {
            self.fail(generation, PlaybackErrorKind::Decoder);
            return Err(e.into());
        }
        self.ensure_ticker();
        Ok(())
    }

    fn handle_decoder_error(&self, serial: u64, error: DecoderError) {
        let generation = {
            let st = self.lock();
            if st.decoder_serial != serial || st.decoder.is_none() {
                return;
            }
            st.generation
        };
        tracing::error!(error = %error, "Decoder failed during playback");
        self.fail(generation, PlaybackErrorKind::Decoder);
    }

    /// Move to the following section. Past the last one, wrap to the first
    /// when `wrap` is set, else pause at the end of the book.
    pub(super) async fn advance(self: Arc<Self>, generation: u64, wrap: bool) -> Result<(), PlayerError> {
        let (book_id, current, num_sections) = {
            let st = self.lock();
            if st.generation != generation {
                return Ok(());
            }
            match (&st.book, &st.section) {
                (Some(book), Some(section)) => (book.id, section.section_number, book.num_sections),
                _ => return Ok(()),
            }
        };

        let next = current + 1;
        if next <= num_sections {
            return self.play(book_id, next, true).await;
        }
        if wrap {
            return self.play(book_id, 1, true).await;
        }

        tracing::info!(book = book_id, "Reached the end of the book");
        let effects = {
            let mut st = self.lock();
            if st.generation != generation {
                return Ok(());
            }
            st.generation += 1;
            let effects = self.pause_locked(&mut st, PauseOptions::USER);
            st.state = PlayerState::Paused;
            self.publish(&st);
            effects
        };
        self.finish_pause(effects);
        Ok(())
    }

    pub(super) async fn resume(self: Arc<Self>) -> Result<(), PlayerError> {
        let (book_id, has_decoder, state) = {
            let st = self.lock();
            (st.book.as_ref().map(|b| b.id), st.decoder.is_some(), st.state)
        };
        let Some(book_id) = book_id else {
            tracing::debug!("Nothing to resume");
            return Ok(());
        };
        match state {
            PlayerState::Playing | PlayerState::Buffering => return Ok(()),
            PlayerState::Error | PlayerState::Idle => {
                let book = self.catalog.book(book_id)?;
                return self.play(book_id, book.current_section, true).await;
            }
            PlayerState::Paused if !has_decoder => {
                let book = self.catalog.book(book_id)?;
                return self.play(book_id, book.current_section, true).await;
            }
            PlayerState::Paused => {}
        }

        let (generation, book, section) = {
            let mut st = self.lock();
            st.generation += 1;
            match (&st.book, &st.section) {
                (Some(book), Some(section)) => (st.generation, book.clone(), section.clone()),
                _ => return Ok(()),
            }
        };
        if !self.acquire_resources(generation, &book, &section) {
            return Err(PlayerError::AudioUnavailable);
        }
        self.repoint();
        self.start_current(generation)?;
        Ok(())
    }

    /// Start the held decoder. Returns false if superseded or none is held.
    pub(super) fn start_current(self: &Arc<Self>, generation: u64) -> Result<bool, PlayerError> {
        let failure = {
            let mut st = self.lock();
            if st.generation != generation {
                return Ok(false);
            }
            let Some(decoder) = st.decoder.as_mut() else {
                return Ok(false);
            };
            match decoder.start() {
                Ok(()) => {
                    st.state = PlayerState::Playing;
                    st.message = None;
                    self.publish(&st);
                    None
                }
                Err(e) => Some(e),
            }
        };
        if let Some(e) = failure {
            self.fail(generation, PlaybackErrorKind::Decoder);
            return Err(e.into());
        }
        self.ensure_ticker();
        Ok(true)
    }

    async fn finish_seek(
        self: Arc<Self>,
        generation: u64,
        key: SectionKey,
        target_ms: u64,
        was_playing: bool,
    ) -> Result<(), PlayerError> {
        let (downloading, fraction) = {
            let st = self.lock();
            if st.generation != generation {
                return Ok(());
            }
            let fraction = st
                .section
                .as_ref()
                .map(|s| s.position_fraction(target_ms))
                .unwrap_or(0.0);
            (st.is_downloading, fraction)
        };

        if downloading {
            self.repoint();
            if !self.priority.can_buffer_enough_to_start(key, fraction)? {
                let mut st = self.lock();
                if st.generation != generation {
                    return Ok(());
                }
                if was_playing {
                    st.state = PlayerState::Buffering;
                }
                st.message = Some(StatusMessage::Waiting(WaitReason::Buffering));
                self.publish(&st);
            }
            if !self.wait_for_buffer(generation, key, fraction).await? {
                return Ok(());
            }
        }

        let failure = {
            let mut st = self.lock();
            if st.generation != generation {
                return Ok(());
            }
            let Some(decoder) = st.decoder.as_mut() else {
                return Ok(());
            };
            match seek_and_start(decoder.as_mut(), target_ms, was_playing) {
                Ok(()) => {
                    if was_playing {
                        st.state = PlayerState::Playing;
                    }
                    st.message = None;
                    self.publish(&st);
                    None
                }
                Err(e) => Some(e),
            }
        };
        if let Some(e) = failure {
            self.fail(generation, PlaybackErrorKind::Decoder);
            return Err(e.into());
        }
        tracing::debug!(%key, target_ms, "Seek complete");
        Ok(())
    }

    /// Take audio focus and show the playback indicator.
    ///
    /// On refusal the listener is told and the attempt is abandoned.
    pub(super) fn acquire_resources(&self, generation: u64, book: &Book, section: &Section) -> bool {
        let held = self.lock().resources_held;
        if !held && !self.focus.request_focus() {
            tracing::warn!(book = book.id, "Audio focus denied");
            let mut st = self.lock();
            if st.generation == generation {
                if matches!(st.state, PlayerState::Buffering | PlayerState::Playing) {
                    st.state = if st.decoder.is_some() {
                        PlayerState::Paused
                    } else {
                        PlayerState::Idle
                    };
                }
                st.message = Some(StatusMessage::Error(PlaybackErrorKind::AudioUnavailable));
                self.publish(&st);
            }
            return false;
        }

        self.indicator.show(
            IndicatorKind::Playback,
            &format!("Playing {}", book.title),
            &format!("{}: {}", section.section_number, section.title),
        );
        let mut st = self.lock();
        st.resources_held = true;
        st.focus_gained = true;
        true
    }
}
