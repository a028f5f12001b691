// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Player state, status snapshots and user-facing messages.

use std::fmt;
use std::path::PathBuf;

use super::decoder::Decoder;
use crate::types::{Book, BookId, Section, SectionKey};

/// High-level playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Idle,
    /// Waiting for enough of the section to be on disk.
    Buffering,
    Playing,
    Paused,
    /// Stopped by a failure. Only a new play request leaves this state.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    PleaseWait,
    Buffering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackErrorKind {
    /// Buffering timed out or the download could not be started.
    Connectivity,
    /// The decoder could not be created for the section file.
    PlayerSetup,
    /// Audio focus was refused.
    AudioUnavailable,
    /// The decoder failed during playback.
    Decoder,
}

/// Message shown to the listener alongside the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMessage {
    Waiting(WaitReason),
    Error(PlaybackErrorKind),
}

impl StatusMessage {
    pub fn is_error(&self) -> bool {
        matches!(self, StatusMessage::Error(_))
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusMessage::Waiting(WaitReason::PleaseWait) => "Please wait...",
            StatusMessage::Waiting(WaitReason::Buffering) => "Buffering audio file...",
            StatusMessage::Error(PlaybackErrorKind::Connectivity) => {
                "Connection problem. Check your network connection and try again."
            }
            StatusMessage::Error(PlaybackErrorKind::PlayerSetup) => "Error setting up the audio player",
            StatusMessage::Error(PlaybackErrorKind::AudioUnavailable) => {
                "Cannot acquire audio resources"
            }
            StatusMessage::Error(PlaybackErrorKind::Decoder) => "Error playing the audio file",
        };
        f.write_str(text)
    }
}

/// Which parts of the player a pause lets go of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PauseOptions {
    /// Abandon audio focus, clear the playback indicator and stop the ticker
    /// unless a download is still running.
    pub release_resources: bool,
    /// Release the decoder.
    pub release_decoder: bool,
    /// Save the current position as the book's resume point.
    pub persist_position: bool,
}

impl PauseOptions {
    /// Pause from the user: resources released, decoder kept, position saved.
    pub const USER: PauseOptions = PauseOptions {
        release_resources: true,
        release_decoder: false,
        persist_position: true,
    };

    /// Stop everything.
    pub const FULL: PauseOptions = PauseOptions {
        release_resources: true,
        release_decoder: true,
        persist_position: true,
    };

    /// Short interruption: keep focus and decoder.
    pub const TRANSIENT: PauseOptions = PauseOptions {
        release_resources: false,
        release_decoder: false,
        persist_position: true,
    };
}

/// Immutable snapshot published to subscribers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub book_id: Option<BookId>,
    pub section_number: Option<u32>,
    pub position_ms: u64,
    /// Approximate playable duration on disk.
    pub buffered_ms: u64,
    pub duration_ms: u64,
    pub message: Option<StatusMessage>,
}

/// State owned by the coordinator, mutated only under its mutex.
#[derive(Default)]
pub(crate) struct PlaybackState {
    /// Bumped by every play, pause and seek; stale tasks compare it.
    pub generation: u64,
    pub state: PlayerState,
    pub book: Option<Book>,
    pub section: Option<Section>,
    pub file: Option<PathBuf>,
    pub decoder: Option<Box<dyn Decoder>>,
    /// Bumped whenever a decoder is attached; callbacks carry their serial.
    pub decoder_serial: u64,
    pub is_downloading: bool,
    pub last_buffered_ms: u64,
    pub message: Option<StatusMessage>,
    /// Section currently holding jump priority on behalf of the player.
    pub priority: Option<SectionKey>,
    pub resources_held: bool,
    pub ticker_epoch: u64,
    pub ticker_running: bool,
    pub focus_gained: bool,
}

impl PlaybackState {
    pub fn current_key(&self) -> Option<SectionKey> {
        self.section.as_ref().map(Section::key)
    }

    pub fn position_ms(&self) -> u64 {
        self.decoder.as_ref().map(|d| d.position_ms()).unwrap_or(0)
    }

    pub fn is_playing(&self) -> bool {
        self.decoder.as_ref().is_some_and(|d| d.is_playing())
    }

    /// Catalog duration of the section, falling back to the decoder's.
    pub fn duration_ms(&self) -> u64 {
        match &self.section {
            Some(section) if section.duration_secs > 0 => section.duration_ms(),
            _ => self.decoder.as_ref().map(|d| d.duration_ms()).unwrap_or(0),
        }
    }

    /// Stop and drop the decoder, if any.
    pub fn release_decoder(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            if decoder.is_playing() {
                decoder.pause();
            }
            decoder.release();
        }
    }

    pub fn snapshot(&self) -> PlayerStatus {
        let buffered_ms = if self.is_downloading {
            self.last_buffered_ms
        } else if self.section.is_some() && self.state != PlayerState::Buffering {
            self.duration_ms()
        } else {
            0
        };
        PlayerStatus {
            state: self.state,
            book_id: self.book.as_ref().map(|b| b.id),
            section_number: self.section.as_ref().map(|s| s.section_number),
            position_ms: self.position_ms(),
            buffered_ms,
            duration_ms: self.duration_ms(),
            message: self.message,
        }
    }
}
