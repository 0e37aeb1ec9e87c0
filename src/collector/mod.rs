pub mod command;
pub mod cpu;
pub mod disk;
pub mod memory;
pub mod procfs;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, SubsecRound};
use std::path::Path;

use crate::config::{CollectorConfig, SourceKind};
use crate::types::{DiskUsage, MetricSample};

/// Raw OS counters the collectors are computed from.
///
/// Implementations only fetch data; parsing and fallback policy live in the
/// per-metric modules so every source gets the same normalization.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Human-readable name for this source (e.g., "native", "command")
    fn name(&self) -> &str;

    /// Instantaneous aggregate CPU utilization in percent, `None` if the
    /// source cannot produce one right now.
    async fn cpu_snapshot(&self) -> Result<Option<f64>>;

    /// Contents of the kernel's CPU-time pseudo-file.
    async fn proc_stat(&self) -> Result<String>;

    /// Contents of the kernel's memory-info pseudo-file.
    async fn meminfo(&self) -> Result<String>;

    /// Contents of the load-average pseudo-file.
    async fn loadavg(&self) -> Result<String>;

    /// Usage of the filesystem mounted at `mount`.
    async fn disk_usage(&self, mount: &Path) -> Result<DiskUsage>;

    fn hostname(&self) -> Result<String>;
}

/// Create the configured metrics source
pub fn create_source(config: &CollectorConfig) -> Result<Box<dyn MetricsSource>> {
    let source: Box<dyn MetricsSource> = match config.source {
        SourceKind::Native => Box::new(procfs::ProcfsSource::new(config)),
        SourceKind::Command => Box::new(command::CommandSource::new(config)?),
    };
    tracing::debug!(source = source.name(), "Initialized metrics source");
    Ok(source)
}

/// Run every collector once and assemble the cycle's sample.
///
/// Never fails: a collector with nothing to report contributes
/// `Reading::Unavailable`.
pub async fn collect_sample(source: &dyn MetricsSource, disk_mount: &Path) -> MetricSample {
    let timestamp = Local::now().trunc_subsecs(0);

    let cpu = cpu::collect(source).await;
    let memory = memory::collect(source).await;
    let disk = disk::collect(source, disk_mount).await;
    let load_average = cpu::collect_load(source).await;

    let hostname = source.hostname().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Hostname lookup failed");
        "unknown".to_string()
    });

    let sample = MetricSample {
        timestamp,
        cpu,
        memory,
        disk,
        hostname,
        load_average,
    };

    let degraded = sample.degraded();
    if !degraded.is_empty() {
        tracing::warn!(collectors = ?degraded, source = source.name(), "Collection degraded");
    }

    sample
}

/// Read one pseudo-file under the configured proc root.
pub(crate) async fn read_proc(proc_root: &Path, name: &str) -> Result<String> {
    let path = proc_root.join(name);
    tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

pub(crate) fn system_hostname() -> Result<String> {
    let name = hostname::get().context("gethostname failed")?;
    Ok(name.to_string_lossy().to_string())
}


#[cfg(test)]
mod tests {
    use super::fixture::FixtureSource;
    use super::*;
    use crate::types::{Percent, Reading};

    #[tokio::test]
    async fn healthy_source_yields_primary_readings() {
        let source = FixtureSource::healthy();
        let sample = collect_sample(&source, Path::new("/")).await;

        assert_eq!(sample.cpu, Reading::Primary(Percent(12.5)));
        assert!(matches!(sample.memory, Reading::Primary(_)));
        assert_eq!(sample.hostname, "fixture-host");
        assert_eq!(sample.load_average, Reading::Primary("0.52, 0.58, 0.59".to_string()));
        assert!(sample.degraded().is_empty());
    }

    #[tokio::test]
    async fn dead_source_still_produces_a_full_sample() {
        let source = FixtureSource::default();
        let sample = collect_sample(&source, Path::new("/")).await;

        assert_eq!(sample.cpu, Reading::Unavailable);
        assert_eq!(sample.memory, Reading::Unavailable);
        assert_eq!(sample.disk, Reading::Unavailable);
        assert_eq!(sample.load_average, Reading::Unavailable);
        assert_eq!(sample.hostname, "unknown");
        assert_eq!(sample.degraded(), vec!["cpu", "memory", "disk", "load_average"]);
    }

    #[tokio::test]
    async fn missing_pseudo_file_names_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_proc(dir.path(), "loadavg").await.unwrap_err();
        assert!(err.to_string().contains("loadavg"), "{}", err);
    }
}
