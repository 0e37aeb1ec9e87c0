pub mod app;
pub mod collector;
pub mod config;
pub mod error;
pub mod install;
pub mod mode;
pub mod schedule;
pub mod telemetry_log;

/// Common types used across modules
pub mod types {
    use chrono::{DateTime, Local};
    use std::fmt;

    /// Outcome of one collector: which method produced the value, or an
    /// explicit marker that none did.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Reading<T> {
        Primary(T),
        /// Produced by the documented fallback path; semantics may differ
        /// from the primary (CPU fallback is cumulative since boot).
        Fallback(T),
        Unavailable,
    }

    impl<T> Reading<T> {
        pub fn is_degraded(&self) -> bool {
            !matches!(self, Reading::Primary(_))
        }
    }

    impl<T: fmt::Display> fmt::Display for Reading<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Reading::Primary(v) => write!(f, "{}", v),
                Reading::Fallback(v) => write!(f, "{} (fallback)", v),
                Reading::Unavailable => write!(f, "unavailable"),
            }
        }
    }

    /// A percentage rendered with one decimal.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Percent(pub f64);

    impl fmt::Display for Percent {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:.1}%", self.0)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct MemoryUsage {
        pub percent: f64,
        pub used_gb: f64,
        pub total_gb: f64,
    }

    impl fmt::Display for MemoryUsage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:.1}% ({:.1}GB/{:.1}GB)", self.percent, self.used_gb, self.total_gb)
        }
    }

    /// Filesystem usage in `df -h` notation.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DiskUsage {
        pub percent: String,
        pub used: String,
        pub total: String,
    }

    impl fmt::Display for DiskUsage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} ({}/{})", self.percent, self.used, self.total)
        }
    }

    /// One collection cycle's snapshot. Every field is populated; failures
    /// show up as `Reading::Unavailable`, never as a missing field.
    #[derive(Debug, Clone)]
    pub struct MetricSample {
        pub timestamp: DateTime<Local>,
        pub cpu: Reading<Percent>,
        pub memory: Reading<MemoryUsage>,
        pub disk: Reading<DiskUsage>,
        pub hostname: String,
        pub load_average: Reading<String>,
    }

    impl MetricSample {
        /// Names of the collectors that did not deliver a primary reading.
        pub fn degraded(&self) -> Vec<&'static str> {
            let mut out = Vec::new();
            if self.cpu.is_degraded() {
                out.push("cpu");
            }
            if self.memory.is_degraded() {
                out.push("memory");
            }
            if self.disk.is_degraded() {
                out.push("disk");
            }
            if self.load_average.is_degraded() {
                out.push("load_average");
            }
            out
        }
    }
}
