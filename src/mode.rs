use std::fmt;
use std::str::FromStr;

/// What a single invocation does. Exactly one per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Install binary, log, schedule and rotation policy, then self-test.
    Setup,
    /// One collection cycle; what the scheduler runs.
    Monitor,
    Status,
    Logs,
    /// One cycle with explicit verification.
    Test,
    Help,
    /// No token given: ask before running setup.
    Interactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMode(pub String);

impl fmt::Display for UnknownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command '{}'", self.0)
    }
}

impl std::error::Error for UnknownMode {}

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(Mode::Setup),
            "monitor" => Ok(Mode::Monitor),
            "status" => Ok(Mode::Status),
            "logs" => Ok(Mode::Logs),
            "test" => Ok(Mode::Test),
            "help" => Ok(Mode::Help),
            "" => Ok(Mode::Interactive),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

impl Mode {
    pub fn parse(token: Option<&str>) -> Result<Self, UnknownMode> {
        token.map_or(Ok(Mode::Interactive), str::parse)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Setup => "setup",
            Mode::Monitor => "monitor",
            Mode::Status => "status",
            Mode::Logs => "logs",
            Mode::Test => "test",
            Mode::Help => "help",
            Mode::Interactive => "",
        }
    }

    pub fn requires_root(&self) -> bool {
        matches!(self, Mode::Setup | Mode::Test)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn usage() -> String {
    format!(
        "\
sys-health {version}: host telemetry collector

Usage: sys-health [--config <path>] [COMMAND]

Commands:
  setup     Install binary, log file, cron entry and logrotate policy (root)
  monitor   Collect one sample and append it to the log
  status    Show installation, log and schedule state
  logs      Show the most recent log lines
  test      Run one cycle and verify the log was written (root)
  help      Show this message

Without a command, asks for confirmation and then runs setup.
",
        version = env!("CARGO_PKG_VERSION")
    )
}
