//! Utility functions for stowage
//!
//! This module provides the small parsing and formatting helpers shared by
//! the snapshot codec, the filter loaders and the CLI.
//!
//! ## Overview
//!
//! - **Size values**: [`parse_bytes`] and [`format_bytes`] use binary
//!   (1024-based) units
//! - **Durations**: [`parse_duration_ms`] accepts plain milliseconds or
//!   humantime strings
//! - **Timestamps**: [`format_mlst_time`] / [`parse_mlst_time`] convert
//!   between epoch milliseconds and the `yyyyMMddHHmmss.SSS` MLST form
//! - **File operations**: [`atomic_write`] for crash-safe snapshot files
//!
//! ## Examples
//!
//! ```rust
//! use stowage::{parse_bytes, parse_duration_ms, format_bytes};
//!
//! assert_eq!(parse_bytes("10KB").unwrap(), 10 * 1024);
//! assert_eq!(parse_duration_ms("30s").unwrap(), 30_000);
//! assert_eq!(format_bytes(1536), "1.50 KB");
//! ```

use crate::error::{Result, StowageError};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::path::Path;

const MLST_TIME_FORMAT: &str = "%Y%m%d%H%M%S%.3f";

/// Parse a byte count with an optional binary unit suffix
///
/// Accepts `1024`, `10K`, `10KB`, `5M`, `1.5GB`, `2TiB` (case-insensitive).
/// Every unit is a power of 1024.
///
/// # Errors
///
/// - [`StowageError::FatalConfig`] if the number or the unit is malformed
pub fn parse_bytes(value: &str) -> Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| StowageError::config(format!("invalid byte value {:?}", value)))?;

    let exponent = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 1,
        "M" | "MB" | "MIB" => 2,
        "G" | "GB" | "GIB" => 3,
        "T" | "TB" | "TIB" => 4,
        "P" | "PB" | "PIB" => 5,
        other => {
            return Err(StowageError::config(format!(
                "unknown byte unit {:?} in {:?}",
                other, value
            )))
        }
    };
    Ok((number * 1024f64.powi(exponent)) as u64)
}

/// Format bytes as a human-readable string
///
/// Values below 1024 print as whole bytes; larger values use two decimals.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Parse a duration into milliseconds
///
/// A plain integer is taken as milliseconds; anything else goes through
/// humantime (`30s`, `10m`, `1h 30m`).
pub fn parse_duration_ms(value: &str) -> Result<i64> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<i64>() {
        return Ok(ms);
    }
    humantime::parse_duration(value)
        .map(|d| d.as_millis() as i64)
        .map_err(|e| StowageError::config(format!("invalid duration {:?}: {}", value, e)))
}

/// Format epoch milliseconds as an MLST `modify` fact (UTC)
pub fn format_mlst_time(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .format(MLST_TIME_FORMAT)
        .to_string()
}

/// Parse an MLST `modify` fact back into epoch milliseconds
pub fn parse_mlst_time(value: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(value, MLST_TIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Atomic file write (write to temp file then rename)
///
/// The target is never observed half-written: content goes to a sibling
/// `.tmp` file first, which is then renamed over the target.
///
/// # Errors
///
/// - [`StowageError::Io`] if writing the temporary file or the rename fails
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, content)?;

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    Ok(())
}
