// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-Recovering Lock Helpers
//!
//! The player, the download queue and the catalog are all shared between
//! tokio tasks and decoder callback threads. A panic in any of those while a
//! lock is held would poison it; these helpers log the event and hand back the
//! guard instead of propagating the panic into unrelated playback code.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::{Mutex, RwLock};
//! use lectern::locks::{resilient_lock, resilient_read, resilient_write};
//!
//! let queue = RwLock::new(vec![1, 2, 3]);
//! println!("Entries: {}", resilient_read(&queue).len());
//! resilient_write(&queue).push(4);
//!
//! let state = Mutex::new(0u64);
//! *resilient_lock(&state) += 1;
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "lectern::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition. Recovering data. \
                 A task previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "lectern::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition. Recovering data. \
                 A task previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning if necessary.
///
/// Used for the player state, which decoder callbacks touch from threads the
/// crate does not control.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "lectern::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned during acquisition. Recovering data. \
                 A task previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}
