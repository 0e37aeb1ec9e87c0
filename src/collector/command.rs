use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::config::CollectorConfig;
use crate::types::DiskUsage;
use super::{disk, read_proc, system_hostname, MetricsSource};

/// Shells out to `top` and `df` the way an operator would; counters that
/// have no tool equivalent are still read from procfs.
pub struct CommandSource {
    proc_root: PathBuf,
    idle_re: Regex,
}

impl CommandSource {
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        Ok(Self {
            proc_root: config.proc_root.clone(),
            idle_re: idle_regex()?,
        })
    }

    async fn read(&self, name: &str) -> Result<String> {
        read_proc(&self.proc_root, name).await
    }
}

fn idle_regex() -> Result<Regex> {
    // Matches both "97.5 id" (procps-ng) and "97.5%id" (older procps).
    Ok(Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*%?\s*id\b")?)
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .env("LC_ALL", "C")
        .output()
        .await
        .with_context(|| format!("Failed to spawn {}", program))?;

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Aggregate utilization from the `Cpu(s)` summary line of `top -bn1`.
pub fn parse_top(output: &str, idle_re: &Regex) -> Option<f64> {
    let line = output.lines().find(|l| l.contains("Cpu(s)"))?;
    let idle: f64 = idle_re.captures(line)?.get(1)?.as_str().parse().ok()?;
    Some((100.0 - idle).clamp(0.0, 100.0))
}

#[async_trait]
impl MetricsSource for CommandSource {
    fn name(&self) -> &str {
        "command"
    }

    async fn cpu_snapshot(&self) -> Result<Option<f64>> {
        let output = run("top", &["-bn1"]).await?;
        Ok(parse_top(&output, &self.idle_re))
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
        let mount_str = mount
            .to_str()
            .ok_or_else(|| anyhow!("mount point is not valid UTF-8: {}", mount.display()))?;
        let output = run("df", &["-hP", mount_str]).await?;
        disk::parse_df(&output).ok_or_else(|| anyhow!("unexpected df output: {}", output.trim()))
    }

    fn hostname(&self) -> Result<String> {
        system_hostname()
    }
}
