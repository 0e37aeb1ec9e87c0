use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use crate::collector::{self, MetricsSource};
use crate::config::Config;
use crate::error::HealthError;
use crate::install::{self, Owner};
use crate::mode::{usage, Mode};
use crate::schedule::{ScheduleOutcome, Scheduler};
use crate::telemetry_log::{render_report, AppendReport, TelemetryLog};
use crate::types::MetricSample;

/// Everything one invocation needs, built once from `Config`.
pub struct App {
    config: Config,
    source: Box<dyn MetricsSource>,
    scheduler: Scheduler,
    log: TelemetryLog,
    privileged: bool,
    /// Binary copied into place by `setup`.
    self_path: Option<PathBuf>,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let source = collector::create_source(&config.collector)?;
        let scheduler = Scheduler::from_config(&config.scheduler);
        let self_path = std::env::current_exe()
            .map_err(|e| warn!(error = %e, "Cannot locate running executable"))
            .ok();
        Ok(Self::with_parts(config, source, scheduler, install::is_privileged(), self_path))
    }

    pub fn with_parts(
        config: Config,
        source: Box<dyn MetricsSource>,
        scheduler: Scheduler,
        privileged: bool,
        self_path: Option<PathBuf>,
    ) -> Self {
        let log = TelemetryLog::new(&config.log);
        Self {
            config,
            source,
            scheduler,
            log,
            privileged,
            self_path,
        }
    }

    /// Execute `mode`. Operator output goes to `out`; `input` is only read by
    /// the interactive confirmation.
    pub async fn run(
        &self,
        mode: Mode,
        out: &mut dyn Write,
        input: &mut dyn BufRead,
    ) -> Result<(), HealthError> {
        if mode.requires_root() {
            self.require_root(mode)?;
        }

        match mode {
            Mode::Setup => self.setup(out).await,
            Mode::Monitor => self.monitor().await.map(|_| ()),
            Mode::Status => self.status(out).await,
            Mode::Logs => self.logs(out),
            Mode::Test => self.test(out).await,
            Mode::Help => {
                write!(out, "{}", usage())?;
                Ok(())
            }
            Mode::Interactive => self.interactive(out, input).await,
        }
    }

    fn require_root(&self, mode: Mode) -> Result<(), HealthError> {
        if self.privileged {
            Ok(())
        } else {
            Err(HealthError::Privilege { mode: mode.as_str() })
        }
    }

    /// One collection-and-append cycle.
    async fn cycle(&self) -> Result<(MetricSample, AppendReport), HealthError> {
        let sample = collector::collect_sample(self.source.as_ref(), &self.config.collector.disk_mount).await;
        let report = self.log.append(&sample)?;
        Ok((sample, report))
    }

    async fn monitor(&self) -> Result<AppendReport, HealthError> {
        let (sample, report) = self.cycle().await?;
        info!(
            path = %self.log.path().display(),
            hostname = %sample.hostname,
            cpu = %sample.cpu,
            rotated = report.rotated,
            "Cycle complete"
        );
        Ok(report)
    }

    async fn test(&self, out: &mut dyn Write) -> Result<(), HealthError> {
        writeln!(out, "Running one collection cycle...")?;
        let (sample, _) = self.cycle().await?;
        self.verify(out)?;
        write!(out, "{}", render_report(&sample))?;
        Ok(())
    }

    fn verify(&self, out: &mut dyn Write) -> Result<(), HealthError> {
        if self.log.is_non_empty() {
            writeln!(out, "[PASS] report written to {}", self.log.path().display())?;
            Ok(())
        } else {
            writeln!(out, "[FAIL] {} is missing or empty", self.log.path().display())?;
            Err(HealthError::Verification { path: self.log.path().to_path_buf() })
        }
    }

    async fn setup(&self, out: &mut dyn Write) -> Result<(), HealthError> {
        let binary = &self.config.install.binary_path;

        match &self.self_path {
            Some(current) => {
                if install::install_binary(current, binary)? {
                    writeln!(out, "[OK] installed {}", binary.display())?;
                } else {
                    writeln!(out, "[OK] {} already in place", binary.display())?;
                }
            }
            None => writeln!(out, "[WARN] cannot locate running executable, skipped install")?,
        }

        if self.log.init()? {
            writeln!(out, "[OK] created {}", self.log.path().display())?;
        } else {
            writeln!(out, "[OK] {} exists", self.log.path().display())?;
        }

        match self
            .scheduler
            .ensure_scheduled(binary, self.config.scheduler.interval_minutes)
            .await
        {
            Ok(ScheduleOutcome::Added) => writeln!(
                out,
                "[OK] scheduled every {} minutes in {}",
                self.config.scheduler.interval_minutes,
                self.scheduler.describe()
            )?,
            Ok(ScheduleOutcome::AlreadyScheduled) => {
                writeln!(out, "[WARN] already scheduled in {}, skipped", self.scheduler.describe())?
            }
            Err(e) => {
                warn!(error = %e, "Scheduler unavailable, continuing without schedule");
                writeln!(out, "[WARN] {}; no recurring cycle installed", e)?
            }
        }

        let policy = &self.config.install.logrotate_path;
        match install::install_logrotate(policy, self.log.path(), &Owner::current()) {
            Ok(()) => writeln!(out, "[OK] wrote rotation policy {}", policy.display())?,
            Err(e) => {
                warn!(error = %e, "Log-rotation policy not installed");
                writeln!(out, "[WARN] {}", e)?
            }
        }

        writeln!(out, "Running test cycle...")?;
        self.cycle().await?;
        self.verify(out)?;
        writeln!(out, "Setup complete.")?;
        Ok(())
    }

    async fn status(&self, out: &mut dyn Write) -> Result<(), HealthError> {
        let binary = &self.config.install.binary_path;
        writeln!(out, "sys-health status")?;

        if binary.exists() {
            writeln!(out, "  Binary:   installed ({})", binary.display())?;
        } else {
            writeln!(out, "  Binary:   not installed ({})", binary.display())?;
        }

        match self.log.size() {
            Some(size) => writeln!(out, "  Log file: present ({}, {} bytes)", self.log.path().display(), size)?,
            None => writeln!(out, "  Log file: absent ({})", self.log.path().display())?,
        }

        let backup = self.log.backup_path();
        if let Ok(meta) = std::fs::metadata(&backup) {
            writeln!(out, "  Rotated:  {} ({} bytes)", backup.display(), meta.len())?;
        }

        match self.scheduler.is_scheduled(binary).await {
            Ok(true) => writeln!(out, "  Schedule: present ({})", self.scheduler.describe())?,
            Ok(false) => writeln!(out, "  Schedule: absent ({})", self.scheduler.describe())?,
            Err(e) => writeln!(out, "  Schedule: unavailable ({})", e)?,
        }

        if self.log.size().is_some() {
            writeln!(out)?;
            writeln!(out, "Recent log entries:")?;
            for line in self.log.tail(self.config.log.status_tail_lines)? {
                writeln!(out, "{}", line)?;
            }
        }
        Ok(())
    }

    fn logs(&self, out: &mut dyn Write) -> Result<(), HealthError> {
        if self.log.size().is_none() {
            writeln!(out, "No log file at {}", self.log.path().display())?;
            return Ok(());
        }
        for line in self.log.tail(self.config.log.logs_tail_lines)? {
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }

    async fn interactive(&self, out: &mut dyn Write, input: &mut dyn BufRead) -> Result<(), HealthError> {
        write!(out, "{}", usage())?;
        write!(out, "\nInstall sys-health on this host now? [y/N] ")?;
        out.flush()?;

        let mut answer = String::new();
        input.read_line(&mut answer)?;

        if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            self.require_root(Mode::Setup)?;
            self.setup(out).await
        } else {
            writeln!(out, "Aborted, nothing changed.")?;
            Ok(())
        }
    }
}
