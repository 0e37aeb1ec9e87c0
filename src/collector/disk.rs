use std::path::Path;

use crate::types::{DiskUsage, Reading};
use super::MetricsSource;

/// Filesystem usage for the configured mount point
pub async fn collect(source: &dyn MetricsSource, mount: &Path) -> Reading<DiskUsage> {
    match source.disk_usage(mount).await {
        Ok(usage) => Reading::Primary(usage),
        Err(e) => {
            tracing::warn!(mount = %mount.display(), error = %e, "Disk usage query failed");
            Reading::Unavailable
        }
    }
}

/// Extract usage from `df -hP` output: header on row one, data on row two.
pub fn parse_df(output: &str) -> Option<DiskUsage> {
    let row = output.lines().nth(1)?;
    let cols: Vec<&str> = row.split_whitespace().collect();
    // Filesystem Size Used Avail Use% Mounted-on
    if cols.len() < 6 || !cols[4].ends_with('%') {
        return None;
    }
    Some(DiskUsage {
        percent: cols[4].to_string(),
        used: cols[2].to_string(),
        total: cols[1].to_string(),
    })
}

/// Build a `df -h` style reading from block counts.
///
/// Use% is `used / (used + avail)` rounded up, which is how df reports it
/// when root-reserved blocks exist.
pub fn usage_from_blocks(total: u64, free: u64, avail: u64) -> DiskUsage {
    let used = total.saturating_sub(free);
    let usable = used + avail;
    let percent = if usable == 0 {
        0
    } else {
        (used * 100).div_ceil(usable)
    };
    DiskUsage {
        percent: format!("{}%", percent),
        used: human_size(used),
        total: human_size(total),
    }
}

/// Powers-of-1024 size with df's rounding: one decimal below 10, rounded up.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["K", "M", "G", "T", "P", "E"];

    if bytes < 1024 {
        return bytes.to_string();
    }

    let mut value = bytes as f64;
    let mut unit = "";
    for u in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = u;
    }

    let tenths = (value * 10.0).ceil() / 10.0;
    if tenths < 10.0 {
        format!("{:.1}{}", tenths, unit)
    } else {
        format!("{}{}", value.ceil() as u64, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn df_second_row_is_used() {
        let out = "Filesystem      Size  Used Avail Use% Mounted on\n/dev/sda1        50G   20G   28G  42% /\n";
        let usage = parse_df(out).unwrap();
        assert_eq!(usage.to_string(), "42% (20G/50G)");
    }

    #[test]
    fn df_without_data_row_is_rejected() {
        assert!(parse_df("Filesystem Size Used Avail Use% Mounted on\n").is_none());
        assert!(parse_df("").is_none());
    }

    #[test]
    fn human_sizes_follow_df() {
        assert_eq!(human_size(0), "0");
        assert_eq!(human_size(1023), "1023");
        assert_eq!(human_size(1024), "1.0K");
        assert_eq!(human_size(1536), "1.5K");
        assert_eq!(human_size(20 * 1024 * 1024 * 1024), "20G");
        assert_eq!(human_size(50 * 1024 * 1024 * 1024 + 1), "51G");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024 * 1024), "3.0T");
    }

    #[test]
    fn percent_rounds_up_against_usable_space() {
        let gib = 1024 * 1024 * 1024u64;
        // 100G total, 60G free of which 55G available to users
        let usage = usage_from_blocks(100 * gib, 60 * gib, 55 * gib);
        assert_eq!(usage.percent, "43%"); // 40 / 95 = 42.1
        assert_eq!(usage.used, "40G");
        assert_eq!(usage.total, "100G");
    }

    #[test]
    fn empty_filesystem_reports_zero() {
        assert_eq!(usage_from_blocks(0, 0, 0).percent, "0%");
    }
}
