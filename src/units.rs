//! Human-readable renderings of sizes, rates and remaining time.

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Renders a byte count with 1024-based units, e.g. `512 B` or `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Renders seconds as `H:MM:SS`, or `M:SS` below one hour.
pub fn format_eta(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let seconds = seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_use_binary_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(50 * 1024 * 1024), "50.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn bytes_stop_at_terabytes() {
        assert_eq!(format_bytes(2048 * 1024_u64.pow(4)), "2048.0 TB");
    }

    #[test]
    fn speed_appends_per_second() {
        assert_eq!(format_speed(500), "500 B/s");
        assert_eq!(format_speed(2 * 1024 * 1024), "2.0 MB/s");
    }

    #[test]
    fn eta_switches_to_hours() {
        assert_eq!(format_eta(0), "0:00");
        assert_eq!(format_eta(59), "0:59");
        assert_eq!(format_eta(61), "1:01");
        assert_eq!(format_eta(3600), "1:00:00");
        assert_eq!(format_eta(3 * 3600 + 4 * 60 + 5), "3:04:05");
    }
}
