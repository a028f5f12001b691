// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Periodic buffer tracking.
//!
//! While a section is playing or downloading, a tick refreshes the buffered
//! estimate, re-points the decoder when playback nears the end of what is on
//! disk, and notices when the download has finished.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;

use super::coordinator::{is_complete, PlayerInner};

impl PlayerInner {
    /// Start the ticker unless one is already running.
    pub(super) fn ensure_ticker(self: &Arc<Self>) {
        let epoch = {
            let mut st = self.lock();
            if st.ticker_running {
                return;
            }
            st.ticker_running = true;
            st.ticker_epoch += 1;
            st.ticker_epoch
        };

        let weak = Arc::downgrade(self);
        let period = self.config.playback.tick();
        self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.tick(epoch).await {
                    break;
                }
            }
            tracing::debug!(epoch, "Player ticker stopped");
        });
    }

    /// One tick. Returns false when the ticker should stop.
    async fn tick(self: &Arc<Self>, epoch: u64) -> bool {
        let (key, file) = {
            let mut st = self.lock();
            if st.ticker_epoch != epoch {
                return false;
            }
            if !st.is_playing() && !st.is_downloading {
                st.ticker_running = false;
                return false;
            }
            if !st.is_downloading {
                self.publish(&st);
                return true;
            }
            match (st.current_key(), &st.file) {
                (Some(key), Some(file)) => (key, file.clone()),
                _ => return true,
            }
        };

        // size may have been repaired by the worker
        let section = match self.catalog.section(key) {
            Ok(section) => section,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Section vanished from catalog");
                return true;
            }
        };
        let on_disk = self.store.length(&file);
        let complete = is_complete(&section, on_disk);
        let buffered_ms = section.buffered_ms(on_disk);

        let needs_repoint = {
            let mut st = self.lock();
            if st.ticker_epoch != epoch {
                return false;
            }
            if st.current_key() != Some(key) || !st.is_downloading {
                return true;
            }
            st.last_buffered_ms = buffered_ms;
            st.section = Some(section);
            let near_end = st.is_playing()
                && st.position_ms() + self.config.playback.rebuffer_ms >= buffered_ms;
            self.publish(&st);
            st.decoder.is_some() && (complete || near_end)
        };

        if needs_repoint {
            self.repoint();
        }

        if complete {
            let released = {
                let mut st = self.lock();
                if st.current_key() != Some(key) {
                    return true;
                }
                st.is_downloading = false;
                let released = st.priority == Some(key);
                if released {
                    st.priority = None;
                }
                self.publish(&st);
                released
            };
            tracing::info!(%key, bytes = on_disk, "Section fully downloaded");
            if released {
                if let Err(e) = self.priority.demote(key).await {
                    tracing::warn!(%key, error = %e, "Failed to release download priority");
                }
            }
        }
        true
    }
}
