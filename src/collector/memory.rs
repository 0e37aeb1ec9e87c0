use crate::types::{MemoryUsage, Reading};
use super::MetricsSource;

const KIB_PER_GIB: f64 = 1024.0 * 1024.0;

/// Memory usage from /proc/meminfo
pub async fn collect(source: &dyn MetricsSource) -> Reading<MemoryUsage> {
    let content = match source.meminfo().await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read /proc/meminfo");
            return Reading::Unavailable;
        }
    };

    match parse_meminfo(&content) {
        Some((usage, true)) => Reading::Primary(usage),
        Some((usage, false)) => Reading::Fallback(usage),
        None => {
            tracing::warn!("Unusable /proc/meminfo contents");
            Reading::Unavailable
        }
    }
}

/// Returns the usage and whether the kernel reported `MemAvailable` itself.
///
/// Older kernels lack `MemAvailable`; there it is estimated as
/// `MemFree + Cached`.
pub fn parse_meminfo(content: &str) -> Option<(MemoryUsage, bool)> {
    let mut total_kb = None;
    let mut available_kb = None;
    let mut free_kb = 0u64;
    let mut cached_kb = 0u64;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 { continue; }
        let Ok(val) = parts[1].parse::<u64>() else { continue };
        match parts[0] {
            "MemTotal:" => total_kb = Some(val),
            "MemAvailable:" => available_kb = Some(val),
            "MemFree:" => free_kb = val,
            "Cached:" => cached_kb = val,
            _ => {}
        }
    }

    let total_kb = total_kb.filter(|t| *t > 0)?;
    let has_available = available_kb.is_some();
    let available_kb = available_kb.unwrap_or(free_kb + cached_kb).min(total_kb);

    Some((usage_from_kib(total_kb, available_kb), has_available))
}

/// `used = total - available`, percent and GiB figures rounded to one decimal.
pub fn usage_from_kib(total_kb: u64, available_kb: u64) -> MemoryUsage {
    let used_kb = total_kb.saturating_sub(available_kb);
    MemoryUsage {
        percent: round1(100.0 * used_kb as f64 / total_kb as f64),
        used_gb: round1(used_kb as f64 / KIB_PER_GIB),
        total_gb: round1(total_kb as f64 / KIB_PER_GIB),
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::fixture::FixtureSource;

    #[test]
    fn used_is_total_minus_available() {
        let info = "MemTotal:        8192000 kB\nMemFree:         1024000 kB\nMemAvailable:    2048000 kB\n";
        let (usage, reported) = parse_meminfo(info).unwrap();
        assert!(reported);
        assert_eq!(usage.percent, 75.0);
        assert_eq!(usage.used_gb, 5.9); // 6144000 kB
        assert_eq!(usage.total_gb, 7.8);
    }

    #[test]
    fn percent_rounds_to_one_decimal() {
        for (total, avail) in [(3u64, 1u64), (1_000_003, 17), (7, 7), (16_384_000, 0)] {
            let usage = usage_from_kib(total, avail);
            let expected = ((100.0 * (total - avail) as f64 / total as f64) * 10.0).round() / 10.0;
            assert_eq!(usage.percent, expected, "total={} avail={}", total, avail);
        }
    }

    #[test]
    fn missing_available_uses_free_plus_cached() {
        let info = "MemTotal: 1000 kB\nMemFree: 200 kB\nBuffers: 100 kB\nCached: 300 kB\n";
        let (usage, reported) = parse_meminfo(info).unwrap();
        assert!(!reported);
        assert_eq!(usage.percent, 50.0);
    }

    #[test]
    fn zero_total_is_unusable() {
        assert!(parse_meminfo("MemTotal: 0 kB\nMemAvailable: 0 kB\n").is_none());
        assert!(parse_meminfo("").is_none());
    }

    #[test]
    fn display_matches_report_layout() {
        let usage = usage_from_kib(8_388_608, 4_194_304);
        assert_eq!(usage.to_string(), "50.0% (4.0GB/8.0GB)");
    }

    #[tokio::test]
    async fn derived_available_is_flagged_as_fallback() {
        let mut source = FixtureSource::healthy();
        source.meminfo = Some("MemTotal: 1000 kB\nMemFree: 500 kB\nCached: 0 kB\n".into());
        assert!(matches!(collect(&source).await, Reading::Fallback(_)));
    }
}
