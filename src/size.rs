use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{CompressError, Result};

lazy_static! {
    static ref SIZE_RE: Regex =
        Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*(b|k|kb|kib|m|mb|mib|g|gb|gib)?\s*$").unwrap();
}

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Parses `500KB`, `1.5MB`, `2048` (bytes). Units are binary.
pub fn parse_size(input: &str) -> Result<u64> {
    let caps = SIZE_RE
        .captures(input)
        .ok_or_else(|| CompressError::invalid(format!("invalid size: {:?}", input)))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| CompressError::invalid(format!("invalid number in size: {:?}", input)))?;
    let unit = caps
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    let multiplier = match unit.as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        _ => 1024 * MIB,
    };
    let bytes = (value * multiplier as f64) as u64;
    if bytes == 0 {
        return Err(CompressError::invalid("size must be positive"));
    }
    Ok(bytes)
}

pub fn format_size(bytes: u64) -> String {
    if bytes >= MIB {
        format!("{:.2} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}
