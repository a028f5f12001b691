// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Audio focus handling.
//!
//! | Change                  | Reaction                                        |
//! |-------------------------|-------------------------------------------------|
//! | Gained                  | resume if paused with a decoder                 |
//! | PermanentLoss           | full pause, resume point rewound                |
//! | TransientLoss           | pause keeping focus and decoder, rewind         |
//! | TransientLossDuckable   | as transient, then retry playing periodically   |

use std::sync::Arc;

use super::coordinator::PlayerInner;
use super::state::{PauseOptions, PlayerState};
use crate::platform::FocusChange;

impl PlayerInner {
    pub(super) fn on_focus_change(self: &Arc<Self>, change: FocusChange) {
        tracing::info!(?change, "Audio focus changed");
        match change {
            FocusChange::Gained => {
                let resume = {
                    let mut st = self.lock();
                    st.focus_gained = true;
                    st.decoder.is_some() && st.state == PlayerState::Paused
                };
                if resume {
                    let inner = self.clone();
                    self.runtime.spawn(async move {
                        if let Err(e) = inner.resume().await {
                            tracing::warn!(error = %e, "Failed to resume after regaining focus");
                        }
                    });
                }
            }
            FocusChange::PermanentLoss => self.interrupt(PauseOptions::FULL),
            FocusChange::TransientLoss => self.interrupt(PauseOptions::TRANSIENT),
            FocusChange::TransientLossDuckable => {
                if !self.lock().is_playing() {
                    return;
                }
                self.interrupt(PauseOptions::TRANSIENT);
                self.lock().focus_gained = false;
                self.spawn_duck_retry();
            }
        }
    }

    /// Pause and rewind by the focus-loss amount so the listener hears the
    /// interrupted words again.
    fn interrupt(&self, options: PauseOptions) {
        let effects = {
            let mut st = self.lock();
            st.generation += 1;
            let rewound = st
                .position_ms()
                .saturating_sub(self.config.focus_loss_rewind_ms());
            if let Some(decoder) = st.decoder.as_mut() {
                if decoder.is_playing() {
                    decoder.pause();
                }
                if !options.release_decoder {
                    if let Err(e) = decoder.seek(rewound) {
                        tracing::warn!(error = %e, "Failed to rewind after focus loss");
                    }
                }
            }
            let mut effects = self.pause_locked(&mut st, options);
            if let Some(point) = effects.resume_point.as_mut() {
                point.position_ms = rewound;
            }
            self.publish(&st);
            effects
        };
        self.finish_pause(effects);
    }

    fn spawn_duck_retry(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.playback.duck_retry();
        self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let (gained, stopped, playing) = {
                    let st = inner.lock();
                    (
                        st.focus_gained,
                        matches!(st.state, PlayerState::Idle | PlayerState::Error)
                            || st.decoder.is_none(),
                        st.is_playing(),
                    )
                };
                if gained || stopped || playing {
                    break;
                }
                match inner.clone().resume().await {
                    Ok(()) => {
                        let mut st = inner.lock();
                        if st.is_playing() {
                            st.focus_gained = true;
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "Still waiting for audio focus"),
                }
            }
        });
    }
}
