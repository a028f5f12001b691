// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progressive Playback
//!
//! Plays a section while it is still downloading:
//! - Promotes the section to jump priority and waits for a minimum buffer
//! - Re-opens the decoder on the growing file as playback nears its end
//! - Tells a real end of section apart from running out of data
//! - Reacts to audio focus changes from the host
//!
//! # State machine
//!
//! ```text
//!            play            buffered
//!   Idle ──────────▶ Buffering ─────────▶ Playing ◀──┐
//!    ▲                  │   ▲                │       │ resume
//!    │                  │   │ starved        │ pause │
//!    │          timeout │   └────────────────┤       │
//!    │                  ▼                    ▼       │
//!    └── shutdown ─── Error               Paused ────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lectern::download::PriorityDownloads;
//! use lectern::player::{DecoderFactory, PauseOptions, Player};
//!
//! # async fn example(priority: PriorityDownloads, decoders: Arc<dyn DecoderFactory>) -> anyhow::Result<()> {
//! let player = Player::builder(priority, decoders).build();
//! player.play_book(7).await??;
//!
//! let mut status = player.subscribe();
//! status.changed().await?;
//! println!("{:?}", *status.borrow());
//!
//! player.pause(PauseOptions::USER);
//! # Ok(())
//! # }
//! ```

mod coordinator;
pub mod decoder;
mod focus;
pub mod state;
mod ticker;

// Re-export commonly used items
pub use coordinator::{Player, PlayerBuilder};
pub use decoder::{CompletionCallback, Decoder, DecoderFactory, ErrorCallback};
pub use state::{
    PauseOptions, PlaybackErrorKind, PlayerState, PlayerStatus, StatusMessage, WaitReason,
};
