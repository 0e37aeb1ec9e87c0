use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location probed when no `--config` flag or env override is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sys-health/config.toml";

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "SYS_HEALTH_CONFIG";

/// Top-level configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { log_level: default_log_level() }
    }
}

/// Which backend feeds the metric collectors.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// procfs + statvfs, no subprocesses
    #[default]
    Native,
    /// `top -bn1` and `df -h`
    Command,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CollectorConfig {
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    #[serde(default = "default_disk_mount")]
    pub disk_mount: PathBuf,
    /// Gap between the two /proc/stat reads of the native CPU snapshot.
    #[serde(default = "default_cpu_sample_ms")]
    pub cpu_sample_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            proc_root: default_proc_root(),
            disk_mount: default_disk_mount(),
            cpu_sample_ms: default_cpu_sample_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,
    #[serde(default = "default_true")]
    pub lock: bool,
    #[serde(default = "default_status_tail")]
    pub status_tail_lines: usize,
    #[serde(default = "default_logs_tail")]
    pub logs_tail_lines: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            rotate_bytes: default_rotate_bytes(),
            lock: true,
            status_tail_lines: default_status_tail(),
            logs_tail_lines: default_logs_tail(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InstallConfig {
    #[serde(default = "default_binary_path")]
    pub binary_path: PathBuf,
    #[serde(default = "default_logrotate_path")]
    pub logrotate_path: PathBuf,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            logrotate_path: default_logrotate_path(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
    /// `"user"` for the invoking account's crontab, anything else is a table file path.
    #[serde(default = "default_table")]
    pub table: String,
    /// The table file is a system table (`/etc/crontab`, `/etc/cron.d/*`)
    /// whose entries carry a user column.
    #[serde(default)]
    pub system_table: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            table: default_table(),
            system_table: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        // Expand environment variables
        let expanded = expand_env_vars(&content);

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file: explicit flag, then env override, then the
    /// default path if it exists, then built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let default = Path::new(DEFAULT_CONFIG_PATH);
        if default.exists() {
            return Self::load(default);
        }
        Ok(Self::default())
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.interval_minutes == 0 || self.scheduler.interval_minutes > 59 {
            bail!(
                "scheduler.interval_minutes must be within 1..=59, got {}",
                self.scheduler.interval_minutes
            );
        }
        if self.log.rotate_bytes == 0 {
            bail!("log.rotate_bytes must be greater than zero");
        }
        Ok(())
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> String {
    // Literal pattern, compile cannot fail.
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .to_string()
}

// Default value functions
fn default_log_level() -> String { "warn".to_string() }
fn default_proc_root() -> PathBuf { PathBuf::from("/proc") }
fn default_disk_mount() -> PathBuf { PathBuf::from("/") }
fn default_cpu_sample_ms() -> u64 { 250 }
fn default_log_path() -> PathBuf { PathBuf::from("/var/log/sys_health.log") }
fn default_rotate_bytes() -> u64 { 10 * 1024 * 1024 }
fn default_true() -> bool { true }
fn default_status_tail() -> usize { 10 }
fn default_logs_tail() -> usize { 50 }
fn default_binary_path() -> PathBuf { PathBuf::from("/usr/local/bin/sys-health") }
fn default_logrotate_path() -> PathBuf { PathBuf::from("/etc/logrotate.d/sys-health") }
fn default_interval_minutes() -> u32 { 5 }
fn default_table() -> String { "user".to_string() }
