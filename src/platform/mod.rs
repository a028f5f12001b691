// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Platform integration points.
//!
//! Audio focus arbitration, the foreground "ongoing activity" indicator and
//! the network keep-alive lock belong to the host platform. Each is a small
//! trait; the implementations here are enough for a terminal host and tests.

use std::sync::Arc;

/// Change in the host's audio focus, delivered to `Player::on_focus_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusChange {
    Gained,
    /// Another application took the output for good.
    PermanentLoss,
    /// Short interruption, e.g. a notification sound.
    TransientLoss,
    /// Short interruption during which quieter playback would be allowed.
    TransientLossDuckable,
}

/// Audio focus arbitration.
pub trait AudioFocus: Send + Sync {
    /// Ask for the audio output. Returns false when denied.
    fn request_focus(&self) -> bool;

    fn abandon_focus(&self);
}

/// Which background activity an indicator entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    Download,
    Playback,
}

/// Foreground/ongoing activity indicator.
pub trait Indicator: Send + Sync {
    fn show(&self, kind: IndicatorKind, title: &str, text: &str);

    fn clear(&self, kind: IndicatorKind);
}

/// Keeps the network up while downloads run.
pub trait NetworkLock: Send + Sync {
    fn acquire(&self);

    fn release(&self);
}

/// Holds a [`NetworkLock`] until dropped.
pub struct NetworkLockGuard {
    lock: Arc<dyn NetworkLock>,
}

impl NetworkLockGuard {
    pub fn acquire(lock: Arc<dyn NetworkLock>) -> Self {
        lock.acquire();
        Self { lock }
    }
}

impl Drop for NetworkLockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Focus arbiter that never refuses.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysGranted;

impl AudioFocus for AlwaysGranted {
    fn request_focus(&self) -> bool {
        true
    }

    fn abandon_focus(&self) {}
}

/// Indicator that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn show(&self, kind: IndicatorKind, title: &str, text: &str) {
        tracing::info!(?kind, title, text, "Indicator");
    }

    fn clear(&self, kind: IndicatorKind) {
        tracing::debug!(?kind, "Indicator cleared");
    }
}

/// Network lock for hosts that need none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNetworkLock;

impl NetworkLock for NoNetworkLock {
    fn acquire(&self) {}

    fn release(&self) {}
}
