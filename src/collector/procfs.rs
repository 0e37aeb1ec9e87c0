use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::CollectorConfig;
use crate::types::DiskUsage;
use super::{cpu, disk, read_proc, system_hostname, MetricsSource};

/// Reads procfs directly and queries filesystems with statvfs(2).
pub struct ProcfsSource {
    proc_root: PathBuf,
    sample_gap: Duration,
}

impl ProcfsSource {
    pub fn new(config: &CollectorConfig) -> Self {
        Self {
            proc_root: config.proc_root.clone(),
            sample_gap: Duration::from_millis(config.cpu_sample_ms),
        }
    }

    async fn read(&self, name: &str) -> Result<String> {
        read_proc(&self.proc_root, name).await
    }
}

#[async_trait]
impl MetricsSource for ProcfsSource {
    fn name(&self) -> &str {
        "native"
    }

    /// Two reads of the aggregate counters `sample_gap` apart.
    async fn cpu_snapshot(&self) -> Result<Option<f64>> {
        let Some((total_a, idle_a)) = cpu::busy_counters(&self.read("stat").await?) else {
            return Ok(None);
        };
        tokio::time::sleep(self.sample_gap).await;
        let Some((total_b, idle_b)) = cpu::busy_counters(&self.read("stat").await?) else {
            return Ok(None);
        };

        let d_total = total_b.saturating_sub(total_a);
        let d_idle = idle_b.saturating_sub(idle_a);
        if d_total == 0 {
            return Ok(None);
        }
        Ok(Some(100.0 * (1.0 - d_idle as f64 / d_total as f64)))
    }

    async fn proc_stat(&self) -> Result<String> {
        self.read("stat").await
    }

    async fn meminfo(&self) -> Result<String> {
        self.read("meminfo").await
    }

    async fn loadavg(&self) -> Result<String> {
        self.read("loadavg").await
    }

    async fn disk_usage(&self, mount: &Path) -> Result<DiskUsage> {
        let stat = nix::sys::statvfs::statvfs(mount)
            .with_context(|| format!("statvfs failed for {}", mount.display()))?;

        let frsize = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * frsize;
        let free = stat.blocks_free() as u64 * frsize;
        let avail = stat.blocks_available() as u64 * frsize;

        Ok(disk::usage_from_blocks(total, free, avail))
    }

    fn hostname(&self) -> Result<String> {
        system_hostname()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::collect_sample;
    use crate::types::Reading;

    fn fake_proc(dir: &Path) -> CollectorConfig {
        std::fs::write(dir.join("stat"), "cpu  100 0 50 800 50 0 0 0 0 0\n").unwrap();
        std::fs::write(
            dir.join("meminfo"),
            "MemTotal: 2097152 kB\nMemFree: 524288 kB\nMemAvailable: 1048576 kB\n",
        )
        .unwrap();
        std::fs::write(dir.join("loadavg"), "1.00 0.50 0.25 2/100 999\n").unwrap();
        CollectorConfig {
            proc_root: dir.to_path_buf(),
            cpu_sample_ms: 1,
            ..CollectorConfig::default()
        }
    }

    #[tokio::test]
    async fn static_counters_fall_back_to_since_boot() {
        let dir = tempfile::tempdir().unwrap();
        let source = ProcfsSource::new(&fake_proc(dir.path()));

        // Counters never move between the two reads, so no snapshot exists.
        assert_eq!(source.cpu_snapshot().await.unwrap(), None);

        let sample = collect_sample(&source, Path::new("/")).await;
        assert_eq!(sample.cpu.to_string(), "20.0% (fallback)");
        assert_eq!(sample.memory.to_string(), "50.0% (1.0GB/2.0GB)");
        assert_eq!(sample.load_average, Reading::Primary("1.00, 0.50, 0.25".to_string()));
        assert!(matches!(sample.disk, Reading::Primary(_)));
    }

    #[tokio::test]
    async fn missing_proc_root_is_reported_not_panicked() {
        let source = ProcfsSource::new(&CollectorConfig {
            proc_root: PathBuf::from("/nonexistent/proc"),
            ..CollectorConfig::default()
        });
        assert!(source.meminfo().await.is_err());
    }
}
