// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Utility functions for lectern.
//!
//! This module provides common utility functions used across the codebase.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

const BYTES_SCALING_FACTOR: f64 = 1024.0;

static DURATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:(?:(\d+):)?(\d+):)?(\d+)$").expect("valid duration regex"));

/// Format a byte count for display.
///
/// # Examples
///
/// ```
/// use lectern::utils::format_bytes;
///
/// assert_eq!(format_bytes(1000), "1000 bytes");
/// assert_eq!(format_bytes(1536), "1.50 Kb");
/// ```
pub fn format_bytes(num_bytes: u64) -> String {
    if (num_bytes as f64) < BYTES_SCALING_FACTOR {
        return format!("{} bytes", num_bytes);
    }
    let mut size = num_bytes as f64 / BYTES_SCALING_FACTOR;
    let label = if size < BYTES_SCALING_FACTOR {
        "Kb"
    } else {
        size /= BYTES_SCALING_FACTOR;
        if size < BYTES_SCALING_FACTOR {
            "Mb"
        } else {
            size /= BYTES_SCALING_FACTOR;
            "Gb"
        }
    };
    format!("{:.2} {}", size, label)
}

/// Parse a catalog duration such as `"1:02:03"`, `"12:30"` or `"45"` into seconds.
pub fn parse_duration_secs(input: &str) -> Result<u64> {
    let Some(caps) = DURATION_PATTERN.captures(input.trim()) else {
        bail!("Invalid duration format '{}'", input);
    };
    let part = |idx: usize| -> Result<u64> {
        match caps.get(idx) {
            Some(m) => m
                .as_str()
                .parse::<u64>()
                .with_context(|| format!("Duration component '{}' is too large", m.as_str())),
            None => Ok(0),
        }
    };
    let (hours, minutes, seconds) = (part(1)?, part(2)?, part(3)?);
    hours
        .checked_mul(3600)
        .zip(minutes.checked_mul(60))
        .and_then(|(h, m)| h.checked_add(m))
        .and_then(|hm| hm.checked_add(seconds))
        .with_context(|| format!("Duration '{}' is too large", input))
}

/// Format milliseconds as `1h:02m:03s` / `02m:03s`.
pub fn format_duration_ms(ms: u64) -> String {
    let total = ms / 1000;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours != 0 {
        format!("{}h:{:02}m:{:02}s", hours, minutes, seconds)
    } else {
        format!("{:02}m:{:02}s", minutes, seconds)
    }
}
