use async_trait::async_trait;
use std::fmt;
use std::fs::Permissions;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::install::Owner;

/// The one scheduler line this tool manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronEntry {
    pub interval_minutes: u32,
    /// Account column, present only in system tables.
    pub user: Option<String>,
    pub command: PathBuf,
}

impl fmt::Display for CronEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*/{} * * * * ", self.interval_minutes)?;
        if let Some(user) = &self.user {
            write!(f, "{} ", user)?;
        }
        write!(f, "{} monitor >/dev/null 2>&1", self.command.display())
    }
}

/// Backing store for a crontab-format table.
#[async_trait]
pub trait CrontabStore: Send + Sync {
    fn describe(&self) -> String;

    /// Current table; an absent table reads as empty.
    async fn read(&self) -> Result<String, SchedulerError>;

    /// Replace the whole table in one update.
    async fn write(&self, table: &str) -> Result<(), SchedulerError>;
}

/// The invoking account's crontab, through the `crontab` binary.
pub struct UserCrontab;

#[async_trait]
impl CrontabStore for UserCrontab {
    fn describe(&self) -> String {
        "user crontab".to_string()
    }

    async fn read(&self) -> Result<String, SchedulerError> {
        let output = Command::new("crontab")
            .arg("-l")
            .output()
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("cannot run crontab: {}", e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("no crontab for") {
            return Ok(String::new());
        }
        Err(SchedulerError::Unavailable(format!(
            "crontab -l exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }

    async fn write(&self, table: &str) -> Result<(), SchedulerError> {
        let mut child = Command::new("crontab")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SchedulerError::Unavailable(format!("cannot run crontab: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(table.as_bytes())
                .await
                .map_err(|e| SchedulerError::Unavailable(format!("crontab stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("crontab did not finish: {}", e)))?;
        if !output.status.success() {
            return Err(SchedulerError::Unavailable(format!(
                "crontab - exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// A crontab-format table kept in a plain file. Whether lines carry a user
/// column is decided by the `Scheduler`. Updates go through a sibling temp
/// file and a rename.
pub struct FileCrontab {
    path: PathBuf,
}

impl FileCrontab {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn table_error(&self, cause: std::io::Error) -> SchedulerError {
        SchedulerError::Table { path: self.path.clone(), cause }
    }
}

#[async_trait]
impl CrontabStore for FileCrontab {
    fn describe(&self) -> String {
        format!("crontab file {}", self.path.display())
    }

    async fn read(&self) -> Result<String, SchedulerError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(self.table_error(e)),
        }
    }

    async fn write(&self, table: &str) -> Result<(), SchedulerError> {
        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp, table).await.map_err(|e| self.table_error(e))?;
        tokio::fs::set_permissions(&tmp, Permissions::from_mode(0o644))
            .await
            .map_err(|e| self.table_error(e))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.table_error(e))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The table already mentioned the binary; nothing was written.
    AlreadyScheduled,
    Added,
}

/// Keeps exactly one recurring `monitor` invocation registered.
pub struct Scheduler {
    store: Box<dyn CrontabStore>,
    run_as: Option<String>,
}

impl Scheduler {
    pub fn new(store: Box<dyn CrontabStore>) -> Self {
        Self { store, run_as: None }
    }

    /// Write entries in system-table layout, running as `user`.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        if config.table == "user" {
            return Self::new(Box::new(UserCrontab));
        }
        let scheduler = Self::new(Box::new(FileCrontab::new(&config.table)));
        if config.system_table {
            scheduler.with_user(Owner::current().user)
        } else {
            scheduler
        }
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    /// Register `path monitor` every `interval_minutes`, unless the table
    /// already references `path` anywhere.
    pub async fn ensure_scheduled(
        &self,
        path: &Path,
        interval_minutes: u32,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        let table = self.store.read().await?;
        let needle = path.to_string_lossy();

        if table.contains(needle.as_ref()) {
            warn!(path = %needle, table = %self.store.describe(), "Already scheduled, skipping");
            return Ok(ScheduleOutcome::AlreadyScheduled);
        }

        let entry = CronEntry {
            interval_minutes,
            user: self.run_as.clone(),
            command: path.to_path_buf(),
        };
        let mut updated = table;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&entry.to_string());
        updated.push('\n');

        self.store.write(&updated).await?;
        info!(entry = %entry, table = %self.store.describe(), "Scheduled monitor cycle");
        Ok(ScheduleOutcome::Added)
    }

    pub async fn is_scheduled(&self, path: &Path) -> Result<bool, SchedulerError> {
        let table = self.store.read().await?;
        Ok(table.contains(path.to_string_lossy().as_ref()))
    }
}
