use crate::error::{Error, Result};

const UNITS: [(&str, u64); 9] = [
    ("B", 1),
    ("K", 1 << 10),
    ("KB", 1 << 10),
    ("M", 1 << 20),
    ("MB", 1 << 20),
    ("G", 1 << 30),
    ("GB", 1 << 30),
    ("T", 1 << 40),
    ("TB", 1 << 40),
];

/// Parses a human size such as `100m`, `1.5G` or `512` into bytes.
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::MalformedType("size can't be empty".to_string()));
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let unit = if unit.is_empty() {
        "B".to_string()
    } else {
        unit.trim().to_ascii_uppercase()
    };

    let amount: f64 = number
        .parse()
        .map_err(|_| Error::MalformedType(format!("invalid size {input:?}")))?;
    if amount < 0.0 || !amount.is_finite() {
        return Err(Error::MalformedType(format!(
            "size can't be negative: {input:?}"
        )));
    }

    let multiplier = UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, m)| *m)
        .ok_or_else(|| {
            Error::MalformedType(format!(
                "unsupported unit {unit:?}, expected one of B/KB/MB/GB/TB"
            ))
        })?;

    Ok((amount * multiplier as f64) as u64)
}
