use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use nix::fcntl::{Flock, FlockArg};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::error::HealthError;
use crate::types::MetricSample;

pub const DELIMITER: &str = "========================================";
pub const HEADER: &str = "SYSTEM HEALTH REPORT";
pub const BACKUP_SUFFIX: &str = ".old";
pub const LOG_MODE: u32 = 0o644;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Reopen attempts before giving up on pinning the live inode under the lock.
const PIN_ATTEMPTS: usize = 32;

/// The append-only report log and its single-generation rotation.
pub struct TelemetryLog {
    path: PathBuf,
    rotate_bytes: u64,
    lock: bool,
}

/// What a successful append did besides writing the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReport {
    /// The log did not exist and was initialized first.
    pub created: bool,
    /// The log crossed the threshold and was moved to the `.old` sibling.
    pub rotated: bool,
}

enum ActiveLog {
    Locked(Flock<File>),
    Plain(File),
}

impl ActiveLog {
    fn file(&mut self) -> &mut File {
        match self {
            ActiveLog::Locked(f) => &mut **f,
            ActiveLog::Plain(f) => f,
        }
    }
}

impl TelemetryLog {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            path: config.path.clone(),
            rotate_bytes: config.rotate_bytes,
            lock: config.lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }

    /// Size in bytes, `None` when the log does not exist.
    pub fn size(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|m| m.len())
    }

    pub fn is_non_empty(&self) -> bool {
        self.size().is_some_and(|s| s > 0)
    }

    /// Create the log with mode 0644 and an initialization line.
    /// Returns `false` if it already existed.
    pub fn init(&self) -> Result<bool, HealthError> {
        if self.path.exists() {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|cause| HealthError::WriteAccess { path: self.path.clone(), cause })?;
            }
        }

        let mut file = match OpenOptions::new()
            .append(true)
            .create_new(true)
            .mode(LOG_MODE)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(cause) => {
                return Err(HealthError::WriteAccess { path: self.path.clone(), cause })
            }
        };
        set_log_mode(&file, &self.path)?;

        // One write, so a concurrent appender cannot split the line.
        let marker = format!(
            "[{}] Log initialized by sys-health {}\n",
            Local::now().format(TIMESTAMP_FORMAT),
            env!("CARGO_PKG_VERSION")
        );
        file.write_all(marker.as_bytes())
            .map_err(|e| HealthError::io(&self.path, e))?;

        info!(path = %self.path.display(), "Initialized telemetry log");
        Ok(true)
    }

    /// Append one report block, then apply the rotation policy.
    ///
    /// The log is opened for append before anything is written, so an
    /// unwritable path fails with `WriteAccess` and leaves the file untouched.
    /// Append and rotation run under one exclusive `flock` when locking is on.
    pub fn append(&self, sample: &MetricSample) -> Result<AppendReport, HealthError> {
        let created = self.init()?;
        let block = render_report(sample);

        let mut active = self.open_active()?;
        active
            .file()
            .write_all(block.as_bytes())
            .map_err(|e| HealthError::io(&self.path, e))?;

        let rotated = self.rotate_if_needed()?;
        drop(active);

        debug!(path = %self.path.display(), bytes = block.len(), rotated, "Appended report");
        Ok(AppendReport { created, rotated })
    }

    /// Open for append, recreating the file if a concurrent rotation has
    /// just moved it away.
    fn open_append(&self) -> Result<File, HealthError> {
        OpenOptions::new()
            .append(true)
            .create(true)
            .mode(LOG_MODE)
            .open(&self.path)
            .map_err(|cause| HealthError::WriteAccess { path: self.path.clone(), cause })
    }

    fn open_active(&self) -> Result<ActiveLog, HealthError> {
        if !self.lock {
            return Ok(ActiveLog::Plain(self.open_append()?));
        }

        // A writer that waited on the lock may hold the inode another writer
        // just rotated away; reopen until the lock covers the live file.
        for _ in 0..PIN_ATTEMPTS {
            let file = self.open_append()?;
            let locked = match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(l) => l,
                Err((file, errno)) => {
                    warn!(path = %self.path.display(), error = %errno, "flock failed, writing unlocked");
                    return Ok(ActiveLog::Plain(file));
                }
            };

            let held = locked.metadata().map_err(|e| HealthError::io(&self.path, e))?;
            match fs::metadata(&self.path) {
                Ok(live) if live.ino() == held.ino() && live.dev() == held.dev() => {
                    if live.permissions().mode() & 0o777 != LOG_MODE {
                        set_log_mode(&locked, &self.path)?;
                    }
                    return Ok(ActiveLog::Locked(locked));
                }
                Ok(_) => debug!(path = %self.path.display(), "Log rotated while waiting for lock"),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %self.path.display(), "Log moved away while waiting for lock")
                }
                Err(e) => return Err(HealthError::io(&self.path, e)),
            }
        }

        warn!(path = %self.path.display(), "Could not pin the live log under lock, writing unlocked");
        Ok(ActiveLog::Plain(self.open_append()?))
    }

    /// Move the log to `<path>.old` and start an empty one when it is
    /// strictly larger than the threshold. Returns whether it rotated.
    pub fn rotate_if_needed(&self) -> Result<bool, HealthError> {
        let size = match fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(HealthError::io(&self.path, e)),
        };
        if size <= self.rotate_bytes {
            return Ok(false);
        }

        let backup = self.backup_path();
        match fs::rename(&self.path, &backup) {
            Ok(()) => {}
            // An unlocked writer got there first.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(HealthError::io(&self.path, e)),
        }
        let fresh = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(LOG_MODE)
            .open(&self.path)
            .map_err(|e| HealthError::io(&self.path, e))?;
        set_log_mode(&fresh, &self.path)?;

        info!(
            path = %self.path.display(),
            backup = %backup.display(),
            size,
            threshold = self.rotate_bytes,
            "Rotated telemetry log"
        );
        Ok(true)
    }

    /// Last `n` lines of the active log; empty when the log is missing.
    pub fn tail(&self, n: usize) -> Result<Vec<String>, HealthError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HealthError::io(&self.path, e)),
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut lines: Vec<String> = text.lines().rev().take(n).map(str::to_string).collect();
        lines.reverse();
        Ok(lines)
    }
}

fn set_log_mode(file: &File, path: &Path) -> Result<(), HealthError> {
    // The umask may have stripped bits from the create mode.
    file.set_permissions(Permissions::from_mode(LOG_MODE))
        .map_err(|e| HealthError::io(path, e))
}

/// Render one report block, trailing blank line included.
pub fn render_report(sample: &MetricSample) -> String {
    format!(
        "{d}\n[{ts}] {h}\nCPU Usage: {cpu}\nMemory Usage: {mem}\nDisk Usage: {disk}\nHostname: {host}\nLoad Average: {load}\n{d}\n\n",
        d = DELIMITER,
        ts = sample.timestamp.format(TIMESTAMP_FORMAT),
        h = HEADER,
        cpu = sample.cpu,
        mem = sample.memory,
        disk = sample.disk,
        host = sample.hostname,
        load = sample.load_average,
    )
}

/// A report block read back from the log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReport {
    pub timestamp: Option<NaiveDateTime>,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
    pub hostname: String,
    pub load_average: String,
}

impl ParsedReport {
    /// Numeric CPU percent; `None` for the unavailable marker.
    pub fn cpu_percent(&self) -> Option<f64> {
        self.cpu.split('%').next()?.trim().parse().ok()
    }
}

/// Parse every complete report block in `text`. Blocks cut short by a killed
/// writer are skipped.
pub fn parse_reports(text: &str) -> Vec<ParsedReport> {
    let header = match Regex::new(&format!(r"^\[([^\]]+)\] {}$", HEADER)) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };

    let mut reports = Vec::new();
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        if line != DELIMITER {
            continue;
        }
        let Some(caps) = lines.peek().and_then(|next| header.captures(*next)) else {
            continue;
        };
        let timestamp = NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT).ok();
        lines.next();

        let mut report = ParsedReport { timestamp, ..ParsedReport::default() };
        let mut closed = false;
        while let Some(field) = lines.peek() {
            if *field == DELIMITER {
                lines.next();
                closed = true;
                break;
            }
            let Some((key, value)) = field.split_once(": ") else {
                break;
            };
            let value = value.to_string();
            match key {
                "CPU Usage" => report.cpu = value,
                "Memory Usage" => report.memory = value,
                "Disk Usage" => report.disk = value,
                "Hostname" => report.hostname = value,
                "Load Average" => report.load_average = value,
                _ => {}
            }
            lines.next();
        }

        if closed {
            reports.push(report);
        }
    }

    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiskUsage, MemoryUsage, Percent, Reading};
    use chrono::TimeZone;

    fn sample(host: &str) -> MetricSample {
        MetricSample {
            timestamp: Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap(),
            cpu: Reading::Primary(Percent(12.5)),
            memory: Reading::Primary(MemoryUsage { percent: 45.6, used_gb: 3.2, total_gb: 7.8 }),
            disk: Reading::Primary(DiskUsage {
                percent: "42%".into(),
                used: "20G".into(),
                total: "50G".into(),
            }),
            hostname: host.to_string(),
            load_average: Reading::Primary("0.52, 0.58, 0.59".into()),
        }
    }

    fn log_in(dir: &Path, rotate_bytes: u64) -> TelemetryLog {
        TelemetryLog::new(&LogConfig {
            path: dir.join("sys_health.log"),
            rotate_bytes,
            ..LogConfig::default()
        })
    }

    #[test]
    fn block_layout_is_fixed() {
        let block = render_report(&sample("web-01"));
        let lines: Vec<&str> = block.split('\n').collect();
        assert_eq!(
            lines,
            vec![
                DELIMITER,
                "[2024-03-01 12:30:05] SYSTEM HEALTH REPORT",
                "CPU Usage: 12.5%",
                "Memory Usage: 45.6% (3.2GB/7.8GB)",
                "Disk Usage: 42% (20G/50G)",
                "Hostname: web-01",
                "Load Average: 0.52, 0.58, 0.59",
                DELIMITER,
                "",
                "",
            ]
        );
    }

    #[test]
    fn written_block_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path(), 10 * 1024 * 1024);
        let mut s = sample("db-7");
        s.cpu = Reading::Fallback(Percent(33.0));
        log.append(&s).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let reports = parse_reports(&text);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].hostname, "db-7");
        assert_eq!(reports[0].cpu_percent(), Some(33.0));
        assert_eq!(reports[0].load_average, "0.52, 0.58, 0.59");
        assert_eq!(
            reports[0].timestamp,
            NaiveDateTime::parse_from_str("2024-03-01 12:30:05", TIMESTAMP_FORMAT).ok()
        );
    }

    #[test]
    fn first_append_creates_log_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path(), 10 * 1024 * 1024);

        let report = log.append(&sample("a")).unwrap();
        assert!(report.created);
        assert!(!report.rotated);

        let text = fs::read_to_string(log.path()).unwrap();
        let first = text.lines().next().unwrap();
        assert!(first.contains("Log initialized"), "{}", first);
        assert_eq!(parse_reports(&text).len(), 1);

        let mode = fs::metadata(log.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);

        let second = log.append(&sample("a")).unwrap();
        assert!(!second.created);
        assert_eq!(parse_reports(&fs::read_to_string(log.path()).unwrap()).len(), 2);
    }

    #[test]
    fn oversized_log_moves_to_old_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path(), 512);
        fs::write(log.path(), format!("{}\n", "x".repeat(599))).unwrap();
        fs::write(log.backup_path(), "stale generation").unwrap();

        let report = log.append(&sample("big")).unwrap();
        assert!(report.rotated);

        let old = fs::read_to_string(log.backup_path()).unwrap();
        assert!(old.starts_with(&"x".repeat(599)));
        assert_eq!(parse_reports(&old).len(), 1);

        let meta = fs::metadata(log.path()).unwrap();
        assert_eq!(meta.len(), 0);
        assert_eq!(meta.permissions().mode() & 0o777, 0o644);

        // Next cycle writes into the fresh file without re-initializing it.
        let next = log.append(&sample("big")).unwrap();
        assert!(!next.created && !next.rotated);
        let text = fs::read_to_string(log.path()).unwrap();
        assert!(text.starts_with(DELIMITER));
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path(), 100);
        fs::write(log.path(), vec![b'x'; 100]).unwrap();
        assert!(!log.rotate_if_needed().unwrap());
        fs::write(log.path(), vec![b'x'; 101]).unwrap();
        assert!(log.rotate_if_needed().unwrap());
    }

    #[test]
    fn unwritable_log_is_write_access_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the log path cannot be opened for append.
        let path = dir.path().join("sys_health.log");
        fs::create_dir(&path).unwrap();
        let log = TelemetryLog::new(&LogConfig { path, ..LogConfig::default() });

        let err = log.append(&sample("x")).unwrap_err();
        assert!(matches!(err, HealthError::WriteAccess { .. }), "{:?}", err);
    }

    #[test]
    fn overlapping_writers_rotate_without_losing_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path(), 2000);

        std::thread::scope(|scope| {
            for t in 0..8 {
                let log = &log;
                scope.spawn(move || {
                    for _ in 0..50 {
                        log.append(&sample(&format!("writer-{}", t))).unwrap();
                    }
                });
            }
        });

        for path in [log.path().to_path_buf(), log.backup_path()] {
            let text = fs::read_to_string(&path).unwrap();
            // Every header belongs to a complete, uninterleaved block.
            assert_eq!(text.matches(HEADER).count(), parse_reports(&text).len(), "{}", path.display());
            assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o644);
        }
        assert!(log.size().unwrap() <= 2000);
    }

    #[test]
    fn writer_blocked_on_rotated_inode_reopens_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path(), 1 << 20);
        log.append(&sample("first")).unwrap();

        let held = OpenOptions::new().append(true).open(log.path()).unwrap();
        let guard = Flock::lock(held, FlockArg::LockExclusive).unwrap();

        std::thread::scope(|scope| {
            let writer = scope.spawn(|| log.append(&sample("second")));
            // Let the writer open the current inode and queue on the lock.
            std::thread::sleep(std::time::Duration::from_millis(200));
            fs::rename(log.path(), log.backup_path()).unwrap();
            drop(guard);
            writer.join().unwrap().unwrap();
        });

        let live = parse_reports(&fs::read_to_string(log.path()).unwrap());
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].hostname, "second");
        let old = parse_reports(&fs::read_to_string(log.backup_path()).unwrap());
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].hostname, "first");
    }

    #[test]
    fn missing_parent_is_write_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let log = TelemetryLog::new(&LogConfig { path: blocker.join("sys_health.log"), ..LogConfig::default() });

        let err = log.append(&sample("x")).unwrap_err();
        assert!(matches!(err, HealthError::WriteAccess { .. }), "{:?}", err);
    }

    #[test]
    fn unlocked_mode_still_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = TelemetryLog::new(&LogConfig {
            path: dir.path().join("plain.log"),
            lock: false,
            ..LogConfig::default()
        });
        log.append(&sample("p")).unwrap();
        assert!(log.is_non_empty());
    }

    #[test]
    fn tail_returns_last_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path(), 1 << 20);
        assert!(log.tail(5).unwrap().is_empty());

        fs::write(log.path(), "one\ntwo\nthree\nfour\n").unwrap();
        assert_eq!(log.tail(2).unwrap(), vec!["three", "four"]);
        assert_eq!(log.tail(10).unwrap().len(), 4);
    }

    #[test]
    fn truncated_block_is_skipped() {
        let text = format!(
            "{d}\n[2024-03-01 12:30:05] {h}\nCPU Usage: 1.0%\nHostname: a\nLoad Average: 1, 2, 3\n{d}\n\n{d}\n[2024-03-01 12:35:05] {h}\nCPU Usage: 2.0%\n",
            d = DELIMITER,
            h = HEADER
        );
        let reports = parse_reports(&text);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].cpu_percent(), Some(1.0));
    }

    #[test]
    fn unavailable_cpu_has_no_percent() {
        let report = ParsedReport { cpu: "unavailable".into(), ..ParsedReport::default() };
        assert_eq!(report.cpu_percent(), None);
    }
}
