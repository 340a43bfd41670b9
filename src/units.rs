//! Byte-size parsing and formatting

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Format bytes with binary units and one decimal, e.g. `7.2GiB`
pub fn format_size(num_bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = num_bytes as f64;
    let mut idx = 0;
    while size >= 1024.0 && idx < UNITS.len() - 1 {
        size /= 1024.0;
        idx += 1;
    }
    format!("{:.1}{}", size, UNITS[idx])
}

/// Parse a byte count with an optional unit suffix
///
/// Accepts `8589934592`, `8GiB`, `7.5G`, `512mib`, `8GB`. Single-letter units and
/// `*iB` units are binary; `kB`/`MB`/`GB`/`TB` are decimal.
pub fn parse_size(input: &str) -> Option<u64> {
    let input = input.trim();
    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    if number.is_empty() {
        return None;
    }

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => KIB,
        "m" | "mib" => MIB,
        "g" | "gib" => GIB,
        "t" | "tib" => TIB,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "tb" => 1_000_000_000_000,
        _ => return None,
    };

    if number.contains('.') {
        let value: f64 = number.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some((value * multiplier as f64).round() as u64)
    } else {
        number.parse::<u64>().ok()?.checked_mul(multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0.0B");
        assert_eq!(format_size(1023), "1023.0B");
        assert_eq!(format_size(1536), "1.5KiB");
        assert_eq!(format_size(4 * GIB + 200 * MIB), "4.2GiB");
    }

    #[test]
    fn test_parse_plain_and_binary() {
        assert_eq!(parse_size("8589934592"), Some(8 * GIB));
        assert_eq!(parse_size("8GiB"), Some(8 * GIB));
        assert_eq!(parse_size("8g"), Some(8 * GIB));
        assert_eq!(parse_size("512 MiB"), Some(512 * MIB));
        assert_eq!(parse_size("1.5G"), Some(GIB + 512 * MIB));
    }

    #[test]
    fn test_parse_decimal_units() {
        assert_eq!(parse_size("8GB"), Some(8_000_000_000));
        assert_eq!(parse_size("100kB"), Some(100_000));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("GiB"), None);
        assert_eq!(parse_size("8 parsecs"), None);
        assert_eq!(parse_size("1.2.3G"), None);
    }
}
