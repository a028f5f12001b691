// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for lectern.
//!
//! Stored as JSON at `<config dir>/lectern/config.json`. Every field has a
//! serde default, so an empty object (or a missing file) yields a working
//! configuration.
//!
//! ```json
//! {
//!   "library_dir": "/home/me/Audiobooks",
//!   "skip_back_secs": 15,
//!   "download": { "chunk_size": 16384 },
//!   "playback": { "buffering_timeout_ms": 20000 }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_DIR_NAME: &str = "lectern";
const CONFIG_FILE_NAME: &str = "config.json";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root directory that holds one subdirectory per book.
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,
    /// Location of the persisted download queue.
    #[serde(default = "default_queue_file")]
    pub queue_file: PathBuf,
    #[serde(default = "default_skip_secs")]
    pub skip_back_secs: u64,
    #[serde(default = "default_skip_secs")]
    pub skip_forward_secs: u64,
    /// Rewind applied when audio focus is lost.
    #[serde(default = "default_skip_secs")]
    pub focus_loss_rewind_secs: u64,
    #[serde(default)]
    pub download: DownloadTunables,
    #[serde(default)]
    pub playback: PlaybackTunables,
}

/// Download worker and buffering tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTunables {
    /// Largest piece written to disk between cancellation checks.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Minimum interval between queue progress writes.
    #[serde(default = "default_progress_persist_ms")]
    pub progress_persist_ms: u64,
    /// Bytes required on disk before an incomplete file is playable.
    #[serde(default = "default_min_buffer_bytes")]
    pub min_buffer_bytes: u64,
    /// How long a new drain run waits for the previous one to stop.
    #[serde(default = "default_previous_run_wait_ms")]
    pub previous_run_wait_ms: u64,
}

/// Player timing tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackTunables {
    #[serde(default = "default_buffering_timeout_ms")]
    pub buffering_timeout_ms: u64,
    /// Fallback poll interval while waiting for bytes.
    #[serde(default = "default_buffer_poll_ms")]
    pub buffer_poll_ms: u64,
    /// Interval of the position/re-point ticker.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Re-point when playback is this close to the buffered end.
    #[serde(default = "default_rebuffer_ms")]
    pub rebuffer_ms: u64,
    /// A completion this close to the real duration counts as the true end.
    #[serde(default = "default_eof_looseness_ms")]
    pub eof_looseness_ms: u64,
    #[serde(default = "default_duck_retry_ms")]
    pub duck_retry_ms: u64,
}

fn default_library_dir() -> PathBuf {
    dirs::audio_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Lectern")
}

fn default_queue_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
        .join("download_queue.json")
}

fn default_skip_secs() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    12 * 1024
}

fn default_progress_persist_ms() -> u64 {
    500
}

fn default_min_buffer_bytes() -> u64 {
    8192
}

fn default_previous_run_wait_ms() -> u64 {
    3000
}

fn default_buffering_timeout_ms() -> u64 {
    10_000
}

fn default_buffer_poll_ms() -> u64 {
    30
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_rebuffer_ms() -> u64 {
    1000
}

fn default_eof_looseness_ms() -> u64 {
    1000
}

fn default_duck_retry_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library_dir: default_library_dir(),
            queue_file: default_queue_file(),
            skip_back_secs: default_skip_secs(),
            skip_forward_secs: default_skip_secs(),
            focus_loss_rewind_secs: default_skip_secs(),
            download: DownloadTunables::default(),
            playback: PlaybackTunables::default(),
        }
    }
}

impl Default for DownloadTunables {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            progress_persist_ms: default_progress_persist_ms(),
            min_buffer_bytes: default_min_buffer_bytes(),
            previous_run_wait_ms: default_previous_run_wait_ms(),
        }
    }
}

impl Default for PlaybackTunables {
    fn default() -> Self {
        Self {
            buffering_timeout_ms: default_buffering_timeout_ms(),
            buffer_poll_ms: default_buffer_poll_ms(),
            tick_ms: default_tick_ms(),
            rebuffer_ms: default_rebuffer_ms(),
            eof_looseness_ms: default_eof_looseness_ms(),
            duck_retry_ms: default_duck_retry_ms(),
        }
    }
}

impl DownloadTunables {
    pub fn progress_persist_interval(&self) -> Duration {
        Duration::from_millis(self.progress_persist_ms)
    }

    pub fn previous_run_wait(&self) -> Duration {
        Duration::from_millis(self.previous_run_wait_ms)
    }
}

impl PlaybackTunables {
    pub fn buffering_timeout(&self) -> Duration {
        Duration::from_millis(self.buffering_timeout_ms)
    }

    pub fn buffer_poll(&self) -> Duration {
        Duration::from_millis(self.buffer_poll_ms.max(1))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn duck_retry(&self) -> Duration {
        Duration::from_millis(self.duck_retry_ms.max(1))
    }
}

impl Config {
    /// Default configuration file location.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Could not find config directory")?;
        Ok(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn skip_back_ms(&self) -> u64 {
        self.skip_back_secs * 1000
    }

    pub fn skip_forward_ms(&self) -> u64 {
        self.skip_forward_secs * 1000
    }

    pub fn focus_loss_rewind_ms(&self) -> u64 {
        self.focus_loss_rewind_secs * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.skip_back_secs, 10);
        assert_eq!(config.download.chunk_size, 12 * 1024);
        assert_eq!(config.download.min_buffer_bytes, 8192);
        assert_eq!(config.playback.buffering_timeout_ms, 10_000);
        assert_eq!(config.playback.buffer_poll_ms, 30);
    }

    #[test]
    fn test_partial_nested_override() {
        let config: Config =
            serde_json::from_str(r#"{"download": {"chunk_size": 100}, "skip_forward_secs": 30}"#)
                .unwrap();
        assert_eq!(config.download.chunk_size, 100);
        assert_eq!(config.download.progress_persist_ms, 500);
        assert_eq!(config.skip_forward_ms(), 30_000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.library_dir = dir.path().join("books");
        config.playback.tick_ms = 250;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let loaded = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded.skip_back_secs, 10);
    }
}
