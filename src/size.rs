//! Human size expressions
//!
//! LUN sizes are given as `100`, `512M`, `1GiB` or `2.5T`; every unit is a
//! power of 1024.

use crate::error::{Error, Result};

/// Convert a size expression to a byte count
pub fn size_human_2_size_bytes(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::SizeParse("empty size string".into()));
    }

    // Find where the number ends and unit begins
    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::SizeParse(format!("invalid number: {}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1024,
        "M" | "MB" | "MI" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GI" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TI" | "TIB" => 1024 * 1024 * 1024 * 1024,
        "P" | "PB" | "PI" | "PIB" => 1024 * 1024 * 1024 * 1024 * 1024,
        _ => return Err(Error::SizeParse(format!("unknown unit: {}", unit_str))),
    };

    let bytes = num * multiplier as f64;
    if bytes < 1.0 {
        return Err(Error::SizeParse(format!("size must be at least one byte: {}", s)));
    }
    Ok(bytes as u64)
}

/// Render a byte count with the largest unit that keeps it integral
pub fn size_bytes_2_size_human(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes;
    let mut unit = 0;
    while unit < UNITS.len() - 1 && value >= 1024 && value % 1024 == 0 {
        value /= 1024;
        unit += 1;
    }
    format!("{}{}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_human_2_size_bytes() {
        assert_eq!(size_human_2_size_bytes("100").unwrap(), 100);
        assert_eq!(size_human_2_size_bytes("100B").unwrap(), 100);
        assert_eq!(size_human_2_size_bytes("1K").unwrap(), 1024);
        assert_eq!(size_human_2_size_bytes("1M").unwrap(), 1024 * 1024);
        assert_eq!(size_human_2_size_bytes("1GiB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(size_human_2_size_bytes("2 g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(size_human_2_size_bytes("1.5K").unwrap(), 1536);

        assert!(size_human_2_size_bytes("").is_err());
        assert!(size_human_2_size_bytes("abc").is_err());
        assert!(size_human_2_size_bytes("100X").is_err());
        assert!(size_human_2_size_bytes("0").is_err());
    }

    #[test]
    fn test_size_bytes_2_size_human() {
        assert_eq!(size_bytes_2_size_human(100), "100B");
        assert_eq!(size_bytes_2_size_human(1024 * 1024), "1MiB");
        assert_eq!(size_bytes_2_size_human(1536), "1536B");
        assert_eq!(size_bytes_2_size_human(3 * 1024 * 1024 * 1024), "3GiB");
    }
}
