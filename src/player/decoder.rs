// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Audio decoder capability.
//!
//! Decoding is done by the host (a platform media player, a symphonia/rodio
//! pipeline, ...). A decoder instance is bound to one file; to follow a file
//! that keeps growing the player opens a fresh decoder and swaps it in.

use std::path::Path;

use crate::error::DecoderError;

/// Called with the position (ms) at which the decoder stopped.
pub type CompletionCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Called when the decoder fails during playback.
pub type ErrorCallback = Box<dyn Fn(DecoderError) + Send + Sync>;

/// A decoder bound to one file.
///
/// Callbacks may be invoked from any thread.
pub trait Decoder: Send {
    fn seek(&mut self, position_ms: u64) -> Result<(), DecoderError>;

    fn start(&mut self) -> Result<(), DecoderError>;

    fn pause(&mut self);

    /// Free the decoder's resources. No callbacks fire afterwards.
    fn release(&mut self);

    fn position_ms(&self) -> u64;

    /// Duration of the decodable part of the file.
    fn duration_ms(&self) -> u64;

    fn is_playing(&self) -> bool;

    /// Register the end-of-data callback. It fires when the decoder runs out
    /// of data, which for a partial file may be well before the real end.
    fn on_complete(&mut self, callback: CompletionCallback);

    fn on_error(&mut self, callback: ErrorCallback);
}

/// Opens decoders.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Decoder>, DecoderError>;
}
