use crate::types::{Percent, Reading};
use super::MetricsSource;

/// CPU utilization: the source's snapshot first, `/proc/stat` since boot second.
///
/// A snapshot of exactly `0.0` is how the snapshot tools report "no data", so
/// it is treated like a missing value rather than an idle machine.
pub async fn collect(source: &dyn MetricsSource) -> Reading<Percent> {
    match source.cpu_snapshot().await {
        Ok(Some(v)) if v > 0.0 && v.is_finite() => return Reading::Primary(Percent(v.min(100.0))),
        Ok(_) => tracing::debug!("CPU snapshot empty, using /proc/stat"),
        Err(e) => tracing::debug!(error = %e, "CPU snapshot failed, using /proc/stat"),
    }

    match source.proc_stat().await {
        Ok(content) => match usage_since_boot(&content) {
            Some(v) => Reading::Fallback(Percent(v)),
            None => {
                tracing::warn!("No aggregate cpu line in /proc/stat");
                Reading::Unavailable
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read /proc/stat");
            Reading::Unavailable
        }
    }
}

/// Cumulative utilization from the aggregate `cpu` line.
///
/// Sums user, nice, system, idle, iowait, irq and softirq; integer percent.
/// A zero total reports 0 instead of dividing.
pub fn usage_since_boot(content: &str) -> Option<f64> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(7)
        .map(|f| f.parse().ok())
        .collect::<Option<Vec<u64>>>()?;

    if fields.len() < 7 {
        return None;
    }

    let total: u64 = fields.iter().sum();
    let idle = fields[3];

    if total == 0 {
        return Some(0.0);
    }

    let usage = 100 * total.saturating_sub(idle) / total;
    Some(usage as f64)
}

/// Parse the `(user, ..., softirq)` tuple used by the native snapshot.
/// Returns `(total, idle + iowait)`.
pub fn busy_counters(content: &str) -> Option<(u64, u64)> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();

    if fields.len() < 7 {
        return None;
    }

    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields[4];
    Some((total, idle))
}

/// Load average from /proc/loadavg
pub async fn collect_load(source: &dyn MetricsSource) -> Reading<String> {
    match source.loadavg().await {
        Ok(content) => match parse_loadavg(&content) {
            Some(s) => Reading::Primary(s),
            None => Reading::Unavailable,
        },
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read /proc/loadavg");
            Reading::Unavailable
        }
    }
}

pub fn parse_loadavg(content: &str) -> Option<String> {
    let parts: Vec<&str> = content.split_whitespace().take(3).collect();
    if parts.len() < 3 || parts.iter().any(|p| p.parse::<f64>().is_err()) {
        return None;
    }
    Some(parts.join(", "))
}
