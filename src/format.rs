//! Human-readable sizes, durations and entry ages for status output.

use std::time::Duration;

use chrono::{DateTime, Utc};

const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

/// Formats a byte count with binary units ("512 B", "1.50 KB", "3.00 MB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Formats an elapsed time ("0.3s", "2m 05s", "1h 00m 09s").
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..60 => format!("{secs}.{}s", d.subsec_millis() / 100),
        60..3600 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!(
            "{}h {:02}m {:02}s",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        ),
    }
}

/// How long ago an entry was stored, coarsest unit only ("just now", "5m ago", "3d ago").
#[must_use]
pub fn format_age(stored_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - stored_at).num_seconds();
    match secs {
        i64::MIN..60 => "just now".to_string(),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86_400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn bytes_pick_largest_unit() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(format_bytes(1 << 30), "1.00 GB");
        assert_eq!(format_bytes(1 << 40), "1.00 TB");
        assert_eq!(format_bytes(1 << 50), "1024.00 TB");
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::ZERO), "0.0s");
        assert_eq!(format_duration(Duration::from_millis(340)), "0.3s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(3609)), "1h 00m 09s");
    }

    #[test]
    fn ages() {
        let now = Utc::now();
        assert_eq!(format_age(now, now), "just now");
        assert_eq!(format_age(now + TimeDelta::seconds(5), now), "just now");
        assert_eq!(format_age(now - TimeDelta::minutes(5), now), "5m ago");
        assert_eq!(format_age(now - TimeDelta::hours(2), now), "2h ago");
        assert_eq!(format_age(now - TimeDelta::days(3), now), "3d ago");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn bytes_never_panic(bytes in any::<u64>()) {
                let formatted = format_bytes(bytes);
                prop_assert!(formatted.ends_with('B'));
            }

            #[test]
            fn small_sizes_are_exact(bytes in 0u64..1024) {
                prop_assert_eq!(format_bytes(bytes), format!("{bytes} B"));
            }

            #[test]
            fn durations_never_panic(millis in 0u64..10_000_000_000) {
                let _ = format_duration(Duration::from_millis(millis));
            }

            #[test]
            fn age_ends_in_ago_after_a_minute(secs in 60i64..100_000_000) {
                let now = Utc::now();
                let age = format_age(now - TimeDelta::seconds(secs), now);
                prop_assert!(age.ends_with(" ago"));
            }
        }
    }
}
